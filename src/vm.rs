// The stack-based bytecode interpreter: call frames, closures/upvalues,
// classes/methods, and the dispatch loop (spec §4.3).
//
// Grounded on `other_examples`' `rlox` reference for the frame/call/invoke
// shape and the canonical Lox runtime error wording, adapted to this
// crate's `Heap`-owned object model instead of `rlox`'s `ObjectRef`/`Trace`
// graph.

use std::cell::RefCell;

use crate::chunk::OpCode;
use crate::compiler::Compiler;
use crate::errors::{InterpretError, RuntimeError, TraceFrame};
use crate::gc::Heap;
use crate::value::{
    GcRef, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjKind, ObjMap, ObjNative,
    ObjUpvalue, Value,
};

const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: GcRef,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0.
    base: usize,
}

impl CallFrame {
    fn function(&self) -> &crate::value::ObjFunction {
        self.closure.get().as_closure().function.get().as_function()
    }
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    heap: Heap,
    globals: ObjMap<Value>,
    /// Upvalues still pointing at a live stack slot, kept sorted by
    /// descending slot index so `capture_upvalue`/`close_upvalues` can
    /// walk them front-to-back the way spec §4.3 describes.
    open_upvalues: Vec<GcRef>,
    init_string: GcRef,
}

type Run<T> = Result<T, RuntimeError>;

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap,
            globals: ObjMap::default(),
            open_upvalues: Vec::new(),
            init_string,
        };
        vm.define_native("clock", crate::builtins::clock);
        vm
    }

    pub fn set_stress_gc(&mut self, enabled: bool) {
        self.heap.stress = enabled;
    }

    pub fn set_log_gc(&mut self, enabled: bool) {
        self.heap.log_gc = enabled;
    }

    pub fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let name_ref = self.heap.intern(name);
        let native_ref = self.heap.allocate(ObjKind::Native(ObjNative { name, arity: 0, function }));
        self.globals.insert(name_ref, Value::Obj(native_ref));
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = match Compiler::compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(err) => {
                eprint!("{}", err);
                return Err(InterpretError::Compile(err));
            }
        };
        let closure_ref = self
            .heap
            .allocate(ObjKind::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.stack.push(Value::Obj(closure_ref));
        self.call(closure_ref, 0).map_err(InterpretError::Runtime)?;

        let result = self.run();
        if let Err(err) = &result {
            eprintln!("{}", err);
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        result.map_err(InterpretError::Runtime)
    }

    // ---- stack helpers -------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler never emits an unbalanced pop")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = frame.function();
            let line = Some(function.chunk.line_at(frame.ip.saturating_sub(1)));
            let name = function.name.map(|r| r.get().as_string().bytes.to_string());
            trace.push(TraceFrame { line, name });
        }
        RuntimeError { message: message.into(), trace }
    }

    // ---- upvalues --------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &uv_ref) in self.open_upvalues.iter().enumerate().rev() {
            let uv = uv_ref.get().kind_as_upvalue();
            match *uv.borrow() {
                ObjUpvalue::Open(index) => {
                    if index == slot {
                        return uv_ref;
                    }
                    if index < slot {
                        break;
                    }
                    insert_at = i;
                }
                ObjUpvalue::Closed(_) => unreachable!("open_upvalues only holds open upvalues"),
            }
        }
        let new_ref = self.heap.allocate(ObjKind::Upvalue(RefCell::new(ObjUpvalue::Open(slot))));
        self.open_upvalues.insert(insert_at, new_ref);
        new_ref
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&last) = self.open_upvalues.last() {
            let uv = last.get().kind_as_upvalue();
            let slot = match *uv.borrow() {
                ObjUpvalue::Open(index) => index,
                ObjUpvalue::Closed(_) => unreachable!(),
            };
            if slot < from_slot {
                break;
            }
            *uv.borrow_mut() = ObjUpvalue::Closed(self.stack[slot]);
            self.open_upvalues.pop();
        }
    }

    // ---- calling ------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Run<()> {
        match callee {
            Value::Obj(r) => match &r.get().kind {
                ObjKind::Closure(_) => self.call(r, arg_count as usize),
                ObjKind::Native(native) => {
                    let start = self.stack.len() - arg_count as usize;
                    let args = self.stack[start..].to_vec();
                    let result = (native.function)(&args).map_err(|msg| self.runtime_error(msg))?;
                    self.stack.truncate(start - 1);
                    self.push(result);
                    Ok(())
                }
                ObjKind::Class(class_cell) => {
                    let instance = self.heap.allocate(ObjKind::Instance(RefCell::new(ObjInstance {
                        class: r,
                        fields: ObjMap::default(),
                    })));
                    let start = self.stack.len() - arg_count as usize - 1;
                    self.stack[start] = Value::Obj(instance);
                    let initializer = class_cell.borrow().methods.get(&self.init_string).copied();
                    match initializer {
                        Some(Value::Obj(method)) => self.call(method, arg_count as usize),
                        Some(_) => unreachable!("methods table only holds closures"),
                        None => {
                            if arg_count != 0 {
                                Err(self
                                    .runtime_error(format!("Expected 0 arguments but got {}.", arg_count)))
                            } else {
                                Ok(())
                            }
                        }
                    }
                }
                ObjKind::BoundMethod(bound) => {
                    let start = self.stack.len() - arg_count as usize - 1;
                    self.stack[start] = bound.receiver;
                    self.call(bound.method, arg_count as usize)
                }
                _ => Err(self.runtime_error("Can only call functions and classes.")),
            },
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call(&mut self, closure_ref: GcRef, arg_count: usize) -> Run<()> {
        let arity = closure_ref.get().as_closure().function.get().as_function().arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!("Expected {} arguments but got {}.", arity, arg_count)));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, base: self.stack.len() - arg_count - 1 });
        Ok(())
    }

    fn invoke_from_class(&mut self, class: GcRef, name: GcRef, arg_count: u8) -> Run<()> {
        let method = class.get().kind_as_class().borrow().methods.get(&name).copied();
        match method {
            Some(Value::Obj(closure)) => self.call(closure, arg_count as usize),
            _ => Err(self.runtime_error(format!("Undefined property '{}'.", name.get().as_string().bytes))),
        }
    }

    fn invoke(&mut self, name: GcRef, arg_count: u8) -> Run<()> {
        let receiver = self.peek(arg_count as usize);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(r.get().kind, ObjKind::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let instance = instance_ref.get().kind_as_instance();
        if let Some(&field) = instance.borrow().fields.get(&name) {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }
        let class = instance.borrow().class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn bind_method(&mut self, class: GcRef, name: GcRef) -> Run<()> {
        let method = class.get().kind_as_class().borrow().methods.get(&name).copied();
        let closure = match method {
            Some(Value::Obj(closure)) => closure,
            _ => {
                return Err(self.runtime_error(format!("Undefined property '{}'.", name.get().as_string().bytes)))
            }
        };
        let receiver = self.pop();
        let bound = self.heap.allocate(ObjKind::BoundMethod(ObjBoundMethod { receiver, method: closure }));
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn define_method(&mut self, name: GcRef) {
        let method = self.pop();
        let class_value = self.peek(0);
        if let Value::Obj(r) = class_value {
            r.get().kind_as_class().borrow_mut().methods.insert(name, method);
        }
    }

    // ---- GC integration -------------------------------------------------

    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        let init_string = self.init_string;
        self.heap.collect_garbage(|gray| {
            for value in stack {
                if let Value::Obj(r) = value {
                    Heap::mark_object(*r, gray);
                }
            }
            for frame in frames {
                Heap::mark_object(frame.closure, gray);
            }
            for &uv in open_upvalues {
                Heap::mark_object(uv, gray);
            }
            for (&key, value) in globals.iter() {
                Heap::mark_object(key, gray);
                if let Value::Obj(r) = value {
                    Heap::mark_object(*r, gray);
                }
            }
            Heap::mark_object(init_string, gray);
        });
    }

    // ---- dispatch loop -----------------------------------------------------

    fn run(&mut self) -> Run<()> {
        loop {
            #[cfg(feature = "trace")]
            self.trace_instruction();

            let op = OpCode::from_byte(self.read_byte());
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name).copied() {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self
                                .runtime_error(format!("Undefined variable '{}'.", name.get().as_string().bytes)))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        return Err(self
                            .runtime_error(format!("Undefined variable '{}'.", name.get().as_string().bytes)));
                    }
                    self.globals.insert(name, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let uv_ref = closure.get().as_closure().upvalues[slot];
                    let value = match &*uv_ref.get().kind_as_upvalue().borrow() {
                        ObjUpvalue::Open(index) => self.stack[*index],
                        ObjUpvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.current_frame().closure;
                    let uv_ref = closure.get().as_closure().upvalues[slot];
                    let value = self.peek(0);
                    let mut uv = uv_ref.get().kind_as_upvalue().borrow_mut();
                    match &mut *uv {
                        ObjUpvalue::Open(index) => self.stack[*index] = value,
                        ObjUpvalue::Closed(slot) => *slot = value,
                    }
                }
                OpCode::GetProperty => {
                    let receiver = self.peek(0);
                    let instance_ref = match receiver {
                        Value::Obj(r) if matches!(r.get().kind, ObjKind::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let name = self.read_string();
                    let instance = instance_ref.get().kind_as_instance();
                    let field = instance.borrow().fields.get(&name).copied();
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => {
                            let class = instance.borrow().class;
                            self.bind_method(class, name)?;
                        }
                    }
                }
                OpCode::SetProperty => {
                    let instance_ref = match self.peek(1) {
                        Value::Obj(r) if matches!(r.get().kind, ObjKind::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let name = self.read_string();
                    let value = self.peek(0);
                    instance_ref.get().kind_as_instance().borrow_mut().fields.insert(name, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(r) if matches!(r.get().kind, ObjKind::Class(_)) => r,
                        _ => unreachable!("compiler only emits GetSuper after a class value"),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.number_binary_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.number_binary_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.number_binary_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.number_binary_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.number_binary_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.peek(0);
                    match value.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", value);
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Obj(r) if matches!(r.get().kind, ObjKind::Class(_)) => r,
                        _ => unreachable!("compiler only emits SuperInvoke after a class value"),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function_value = self.read_constant();
                    let function_ref = match function_value {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler only emits Closure for function constants"),
                    };
                    let upvalue_count = function_ref.get().as_function().upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let closure = self.current_frame().closure;
                            upvalues.push(closure.get().as_closure().upvalues[index]);
                        }
                    }
                    let closure_ref =
                        self.heap.allocate(ObjKind::Closure(ObjClosure { function: function_ref, upvalues }));
                    self.push(Value::Obj(closure_ref));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.current_frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class_ref = self
                        .heap
                        .allocate(ObjKind::Class(RefCell::new(ObjClass { name, methods: ObjMap::default() })));
                    self.push(Value::Obj(class_ref));
                }
                OpCode::Inherit => {
                    let superclass_ref = match self.peek(1) {
                        Value::Obj(r) if matches!(r.get().kind, ObjKind::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass_ref = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("compiler only emits Inherit after a class value"),
                    };
                    let methods = superclass_ref.get().kind_as_class().borrow().methods.clone();
                    subclass_ref.get().kind_as_class().borrow_mut().methods.extend(methods);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
            }

            self.collect_if_needed();
        }
    }

    fn number_binary_op(&mut self, op: impl Fn(f64, f64) -> Value) -> Run<()> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Run<()> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(a), Value::Obj(b))
                if matches!(a.get().kind, ObjKind::String(_)) && matches!(b.get().kind, ObjKind::String(_)) =>
            {
                let mut joined =
                    String::with_capacity(a.get().as_string().bytes.len() + b.get().as_string().bytes.len());
                joined.push_str(&a.get().as_string().bytes);
                joined.push_str(&b.get().as_string().bytes);
                let interned = self.heap.intern(&joined);
                self.pop();
                self.pop();
                self.push(Value::Obj(interned));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    // ---- bytecode reading --------------------------------------------------

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("run() never executes with an empty frame stack")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("run() never executes with an empty frame stack")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.current_frame_mut();
        let byte = frame.function().chunk.read_byte(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let frame = self.current_frame_mut();
        let short = frame.function().chunk.read_short(frame.ip);
        frame.ip += 2;
        short
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        self.current_frame().function().chunk.constants[index as usize]
    }

    fn read_string(&mut self) -> GcRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("compiler only emits name operands as string constants"),
        }
    }

    #[cfg(feature = "trace")]
    fn trace_instruction(&self) {
        print!("          ");
        if self.stack.is_empty() {
            print!("<empty>");
        } else {
            for value in &self.stack {
                print!("[ {} ]", value);
            }
        }
        println!(" (heap bytes: {})", self.heap.bytes_allocated());
        let frame = self.current_frame();
        crate::disasm::disassemble_instruction(&frame.function().chunk, frame.ip);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new();
        vm.interpret(source).expect("expected program to succeed");
        vm
    }

    #[test]
    fn arithmetic_and_print_do_not_error() {
        run_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn string_concatenation_interns_result() {
        run_ok(r#"print "foo" + "bar";"#);
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        run_ok(
            r#"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var counter = makeCounter();
            print counter();
            print counter();
            "#,
        );
    }

    #[test]
    fn classes_support_inheritance_and_super_calls() {
        run_ok(
            r#"
            class Animal {
                speak() {
                    return "...";
                }
            }
            class Dog < Animal {
                speak() {
                    return super.speak();
                }
            }
            var d = Dog();
            print d.speak();
            "#,
        );
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let mut vm = Vm::new();
        let result = vm.interpret("print undefined_name;");
        assert!(matches!(result, Err(InterpretError::Runtime(_))));
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let mut vm = Vm::new();
        let result = vm.interpret("var x = 1; x();");
        assert!(matches!(result, Err(InterpretError::Runtime(_))));
    }
}
