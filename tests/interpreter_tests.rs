// End-to-end source -> stdout/exit-code scenarios, run against the
// compiled binary so the full pipeline (lexer -> compiler -> VM -> host
// exit code) is exercised exactly as a user would invoke it.

use std::io::Write;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

fn run(source: &str) -> (String, String, i32) {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("loxide-test-{}-{id}.lox", std::process::id()));
    std::fs::File::create(&path).unwrap().write_all(source.as_bytes()).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_loxide"))
        .arg(&path)
        .output()
        .expect("failed to run loxide binary");
    std::fs::remove_file(&path).ok();

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

#[test]
fn arithmetic_precedence() {
    let (stdout, _, code) = run("print 1 + 2 * 3;");
    assert_eq!(stdout, "7\n");
    assert_eq!(code, 0);
}

#[test]
fn string_concatenation() {
    let (stdout, _, code) = run(r#"var a = "hi"; var b = "!"; print a + b;"#);
    assert_eq!(stdout, "hi!\n");
    assert_eq!(code, 0);
}

#[test]
fn for_loop_accumulation() {
    let (stdout, _, code) =
        run("var sum = 0; for (var i = 1; i <= 5; i = i + 1) sum = sum + i; print sum;");
    assert_eq!(stdout, "15\n");
    assert_eq!(code, 0);
}

#[test]
fn closures_capture_by_reference_to_the_enclosing_local() {
    let (stdout, _, code) = run(
        "fun make(x) { fun inner() { return x; } return inner; } var f = make(42); print f();",
    );
    assert_eq!(stdout, "42\n");
    assert_eq!(code, 0);
}

#[test]
fn inherited_method_resolves_through_superclass() {
    let (stdout, _, code) =
        run("class A { greet() { print \"hi\"; } } class B < A {} B().greet();");
    assert_eq!(stdout, "hi\n");
    assert_eq!(code, 0);
}

#[test]
fn runtime_error_reports_operand_type_and_line_and_exits_70() {
    let (_, stderr, code) = run("var x; print x + 1;");
    assert!(stderr.contains("Operands must be numbers."));
    assert!(stderr.contains("[line 1] in script"));
    assert_eq!(code, 70);
}

#[test]
fn undefined_variable_is_a_compile_time_unrelated_runtime_error() {
    let (_, stderr, code) = run("print notDefined;");
    assert!(stderr.contains("Undefined variable 'notDefined'."));
    assert_eq!(code, 70);
}

#[test]
fn parse_error_exits_65() {
    let (_, _, code) = run("var = ;");
    assert_eq!(code, 65);
}

#[test]
fn missing_file_exits_74() {
    let output = Command::new(env!("CARGO_BIN_EXE_loxide"))
        .arg("/nonexistent/path/does/not/exist.lox")
        .output()
        .expect("failed to run loxide binary");
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn extra_positional_arguments_are_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_loxide"))
        .arg("one.lox")
        .arg("two.lox")
        .output()
        .expect("failed to run loxide binary");
    assert_eq!(output.status.code(), Some(64));
}
