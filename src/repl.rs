// Interactive REPL: reads one line at a time, compiles and runs it
// against a `Vm` that persists across lines, so `var`/`fun`/`class`
// declarations from one line are visible to the next (spec §2.3).

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self { vm: Vm::new(), editor: DefaultEditor::new()? })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", "loxide — a bytecode compiler and stack VM".bright_cyan());
        loop {
            match self.editor.readline("> ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.editor.add_history_entry(line.as_str()).ok();
                    // Errors are already reported to stderr by the VM; the
                    // REPL just keeps going on the next line (spec §2.3:
                    // "a failed line does not end the session").
                    let _ = self.vm.interpret(&line);
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{}", format!("Readline error: {err}").red());
                    break;
                }
            }
        }
        Ok(())
    }
}
