// Single-pass Pratt-parsing compiler: parses source directly into bytecode
// with no intermediate AST (spec §4.2). `Compiler::compile` scans+parses
// declarations until EOF, emits the trailing `OP_RETURN`, and returns the
// top-level script function or a `CompileError` accumulated via
// panic-mode recovery.

use crate::chunk::{Chunk, OpCode};
use crate::errors::{CompileDiagnostic, CompileError};
use crate::gc::Heap;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::value::{GcRef, ObjFunction, ObjKind, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

fn rule_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    /// `None` while the initializer is still being compiled — reading the
    /// name in that window is the `var x = x;` compile error.
    depth: Option<usize>,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionState<'src> {
    kind: FunctionKind,
    name: String,
    arity: usize,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: String) -> Self {
        // Slot 0 is reserved: for methods/initializers it names `this`,
        // otherwise it's anonymous (the callee value itself).
        let slot_zero_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: Token {
                    kind: TokenKind::Identifier,
                    lexeme: slot_zero_name,
                    line: 0,
                },
                depth: Some(0),
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

enum LocalResolution {
    Found(u8),
    Uninitialized,
    NotFound,
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: CompileError,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
    /// Upvalue descriptors for the function `end_function` most recently
    /// popped, held just long enough for `function()` to read them back
    /// when emitting `OP_CLOSURE`'s variable-length operand tail.
    finished_upvalues: Vec<(bool, u8)>,
    heap: &'heap mut Heap,
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    pub fn compile(source: &'src str, heap: &'heap mut Heap) -> Result<GcRef, CompileError> {
        let dummy = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        let mut compiler = Compiler {
            scanner: Scanner::new(source),
            previous: dummy,
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: CompileError::default(),
            functions: vec![FunctionState::new(FunctionKind::Script, String::new())],
            classes: Vec::new(),
            finished_upvalues: Vec::new(),
            heap,
        };
        compiler.advance();
        while !compiler.check(TokenKind::Eof) {
            compiler.declaration();
        }
        compiler.consume(TokenKind::Eof, "Expect end of expression.");
        let function = compiler.end_function();
        if compiler.had_error {
            Err(compiler.errors)
        } else {
            Ok(function)
        }
    }

    // ---- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &'static str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token.lexeme.to_string())
        };
        self.errors.push(CompileDiagnostic {
            line: token.line,
            lexeme,
            message: message.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- chunk emission ---------------------------------------------------

    fn current_fn(&mut self) -> &mut FunctionState<'src> {
        self.functions.last_mut().expect("function stack never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_two(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.current_fn().kind == FunctionKind::Initializer {
            self.emit_two(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_two(OpCode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let gc_ref = self.heap.intern(name);
        self.make_constant(Value::Obj(gc_ref))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let chunk = self.chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ---- scopes & locals ---------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_fn().scope_depth -= 1;
        let depth = self.current_fn().scope_depth;
        while let Some(local) = self.current_fn().locals.last() {
            if local.depth.map_or(false, |d| d > depth) {
                if self.current_fn().locals.last().unwrap().is_captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
                self.current_fn().locals.pop();
            } else {
                break;
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.current_fn().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self, name: Token<'src>) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth;
        let duplicate = self.current_fn().locals.iter().rev().any(|local| {
            local.depth.map_or(false, |d| d >= depth) && local.name.lexeme == name.lexeme
        });
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let depth = self.current_fn().scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.current_fn().locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn parse_variable(&mut self, message: &'static str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous;
        self.declare_variable(name);
        if self.current_fn().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_two(OpCode::DefineGlobal, global);
    }

    fn resolve_local(func: &FunctionState<'src>, name: &str) -> LocalResolution {
        for (i, local) in func.locals.iter().enumerate().rev() {
            if local.name.lexeme == name {
                return match local.depth {
                    Some(_) => LocalResolution::Found(i as u8),
                    None => LocalResolution::Uninitialized,
                };
            }
        }
        LocalResolution::NotFound
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.functions[func_idx]
            .upvalues
            .iter()
            .position(|uv| uv.index == index && uv.is_local == is_local);
        if let Some(i) = existing {
            return i as u8;
        }
        if self.functions[func_idx].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[func_idx].upvalues.push(UpvalueDesc { index, is_local });
        (self.functions[func_idx].upvalues.len() - 1) as u8
    }

    /// Resolves `name` as an upvalue of `self.functions[func_idx]`, walking
    /// outer compilers and creating upvalue chains along the way (spec:
    /// "local in current compiler -> upvalue (walking outer compilers) ->
    /// global").
    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        match Self::resolve_local(&self.functions[func_idx - 1], name) {
            LocalResolution::Found(local_idx) => {
                self.functions[func_idx - 1].locals[local_idx as usize].is_captured = true;
                Some(self.add_upvalue(func_idx, local_idx, true))
            }
            LocalResolution::Uninitialized => {
                self.error("Can't read local variable in its own initializer.");
                None
            }
            LocalResolution::NotFound => {
                let upvalue_idx = self.resolve_upvalue(func_idx - 1, name)?;
                Some(self.add_upvalue(func_idx, upvalue_idx, false))
            }
        }
    }

    // ---- declarations & statements -----------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable(name_token);
        self.emit_two(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_token = self.previous;
            if super_token.lexeme == name_token.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.variable(false, super_token);

            self.begin_scope();
            self.add_local(Token {
                kind: TokenKind::Super,
                lexeme: "super",
                line: super_token.line,
            });
            self.define_variable(0);

            self.named_variable(name_token, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name_token, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let class_state = self.classes.pop().unwrap();
        if class_state.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        let kind = if name_token.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, name_token.lexeme.to_string());
        self.emit_two(OpCode::Method, name_constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.previous.lexeme.to_string();
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: String) {
        self.functions.push(FunctionState::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_fn().arity >= MAX_PARAMS {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_fn().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let function_ref = self.end_function();
        let constant = self.make_constant(Value::Obj(function_ref));
        self.emit_two(OpCode::Closure, constant);
        for i in 0..self.finished_upvalues.len() {
            let (is_local, index) = self.finished_upvalues[i];
            self.emit_byte(is_local as u8);
            self.emit_byte(index);
        }
    }

    fn end_function(&mut self) -> GcRef {
        self.emit_return();
        let finished = self.functions.pop().expect("function stack never empty");
        self.finished_upvalues = finished
            .upvalues
            .iter()
            .map(|u| (u.is_local, u.index))
            .collect();
        let name_ref = if finished.name.is_empty() {
            None
        } else {
            Some(self.heap.intern(&finished.name))
        };
        let obj = ObjFunction {
            arity: finished.arity,
            upvalue_count: self.finished_upvalues.len(),
            name: name_ref,
            chunk: finished.chunk,
        };
        self.heap.allocate(ObjKind::Function(obj))
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.current_fn().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // ---- expressions (Pratt parser) ----------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= rule_precedence(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix_rule(&mut self, token: Token<'src>, can_assign: bool) -> bool {
        match token.kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(token.kind),
            TokenKind::Number => self.number(token.lexeme),
            TokenKind::String => self.string(token.lexeme),
            TokenKind::Identifier => self.variable(can_assign, token),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, token: Token<'src>, can_assign: bool) {
        match token.kind {
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Slash
            | TokenKind::Star
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(token.kind),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::Dot => self.dot_expr(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, operator: TokenKind) {
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        let precedence = rule_precedence(operator);
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call_expr(&mut self) {
        let argc = self.argument_list();
        self.emit_two(OpCode::Call, argc);
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_constant = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_two(OpCode::SetProperty, name_constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.finish_argument_list();
            self.emit_two(OpCode::Invoke, name_constant);
            self.emit_byte(argc);
        } else {
            self.emit_two(OpCode::GetProperty, name_constant);
        }
    }

    fn argument_list(&mut self) -> u8 {
        self.finish_argument_list()
    }

    fn finish_argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc >= MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn number(&mut self, lexeme: &str) {
        let value: f64 = lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, lexeme: &str) {
        let content = &lexeme[1..lexeme.len() - 1];
        let gc_ref = self.heap.intern(content);
        self.emit_constant(Value::Obj(gc_ref));
    }

    fn variable(&mut self, can_assign: bool, name: Token<'src>) {
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let func_idx = self.functions.len() - 1;
        let (get_op, set_op, slot) = match Self::resolve_local(&self.functions[func_idx], name.lexeme) {
            LocalResolution::Found(slot) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            LocalResolution::Uninitialized => {
                self.error("Can't read local variable in its own initializer.");
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
            LocalResolution::NotFound => {
                if let Some(slot) = self.resolve_upvalue(func_idx, name.lexeme) {
                    (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
                } else {
                    let slot = self.identifier_constant(name.lexeme);
                    (OpCode::GetGlobal, OpCode::SetGlobal, slot)
                }
            }
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_two(set_op, slot);
        } else {
            self.emit_two(get_op, slot);
        }
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let token = self.previous;
        self.named_variable(token, false);
    }

    fn super_expr(&mut self) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_constant = self.identifier_constant(self.previous.lexeme);

        let this_token = Token {
            kind: TokenKind::Identifier,
            lexeme: "this",
            line: self.previous.line,
        };
        let super_token = Token {
            kind: TokenKind::Identifier,
            lexeme: "super",
            line: self.previous.line,
        };

        self.named_variable(this_token, false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.finish_argument_list();
            self.named_variable(super_token, false);
            self.emit_two(OpCode::SuperInvoke, name_constant);
            self.emit_byte(argc);
        } else {
            self.named_variable(super_token, false);
            self.emit_two(OpCode::GetSuper, name_constant);
        }
    }
}
