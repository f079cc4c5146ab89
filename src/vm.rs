//! §4.3 "Bytecode and VM" — the stack machine that executes a `Chunk`.
//!
//! One `Vm` owns the heap and drives every allocation through it, so this
//! is also where the GC-safety discipline `gc.rs` documents actually lives:
//! operands that feed a multi-object allocation (string concatenation,
//! `OP_CLOSURE`) stay reachable from the stack or from an already-linked
//! object until the new object is linked in too.

use super::chunk::OpCode;
use super::compiler;
use super::debug;
use super::error::{InterpretError, RuntimeError, TraceFrame};
use super::gc::{self, Heap, Roots};
use super::native;
use super::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeObj, ObjKind, ObjRef,
    UpvalueLocation, UpvalueObj,
};
use super::reporter::Reporter;
use super::table::Table;
use super::value::Value;

/// §5 resource limits: the 65th nested call overflows, matching §8's
/// boundary scenario.
pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// One activation record: which closure is running, where its instruction
/// pointer is, and where its stack window begins (slot 0 is the callee
/// itself — the receiver for a method, the closure for a plain call).
#[derive(Clone, Copy)]
pub struct CallFrame {
    pub closure: ObjRef,
    ip: usize,
    slots_base: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Option<ObjRef>,
    compiler_roots: Vec<ObjRef>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            compiler_roots: Vec::new(),
        };
        vm.define_native("clock", native::clock());
        vm
    }

    fn define_native(&mut self, name: &str, native: NativeObj) {
        let name_obj = self.intern_string(name.as_bytes());
        self.push(Value::Obj(name_obj));
        let native_obj = self.heap.alloc_native(native);
        self.push(Value::Obj(native_obj));
        self.globals.set(name_obj, Value::Obj(native_obj));
        self.pop();
        self.pop();
    }

    /// Compiles and runs `source` in this VM's global scope — §6's
    /// top-level entry point, shared by the REPL (one line per call) and
    /// file mode (one whole program per call).
    pub fn interpret(&mut self, source: &str, reporter: &mut dyn Reporter) -> Result<(), InterpretError> {
        let function = compiler::compile(source, self, reporter)?;
        self.push(Value::Obj(function));
        let closure = self.alloc_closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        });
        self.pop();
        self.push(Value::Obj(closure));
        if let Err(message) = self.call(closure, 0) {
            let err = self.runtime_error(&message);
            return Err(InterpretError::Runtime(err));
        }
        self.run().map_err(InterpretError::Runtime)
    }

    // --- compiler-facing API (§4.2's single-pass compiler allocates
    // through the same VM it will later run on, so `FunctionObj`s and
    // interned strings it builds mid-compile are already on the real heap
    // when compilation finishes) ---

    /// Roots the `FunctionObj` a `CompilerState` is still building, for
    /// the whole time it is the live target of compilation — see
    /// `gc::Roots::compiler_roots`. The object is already on the heap
    /// (allocated by `alloc_function` at `CompilerState::new`), so this
    /// just adds it to the root set; nothing it references can be swept
    /// while it stays here, including constants added to its chunk mid-
    /// compile.
    pub fn push_compiler_root(&mut self, function: ObjRef) {
        self.compiler_roots.push(function);
    }

    pub fn pop_compiler_root(&mut self) {
        self.compiler_roots.pop();
    }

    /// Allocates a fresh, empty `FunctionObj` (the compiler fills in
    /// `arity`/`upvalue_count`/`chunk` in place afterward via
    /// `ObjRef::as_function_mut`). `function.name`, if present, is an
    /// already-interned string that is not yet reachable from any root —
    /// it is pushed onto the value stack around the allocation so the
    /// collection check above can't sweep it out from under a function
    /// that doesn't exist to root it yet.
    pub fn alloc_function(&mut self, function: FunctionObj) -> ObjRef {
        if let Some(name) = function.name {
            self.push(Value::Obj(name));
        }
        self.collect_garbage_if_needed();
        let has_name = function.name.is_some();
        let obj = self.heap.alloc_function(function);
        if has_name {
            self.pop();
        }
        obj
    }

    /// Disassembles a fully-compiled function's chunk (§4.4's
    /// `debug-bytecode`). Called once the chunk is complete — at
    /// `end_compiler` time — rather than at allocation, since the
    /// function is allocated empty and filled in over the course of
    /// compiling it.
    pub fn debug_disassemble(&self, function: ObjRef) {
        let f = function.as_function();
        debug::disassemble_chunk(&f.chunk, function_label(f));
    }

    /// Canonical interned string: a hit in the intern table returns the
    /// existing object, a miss allocates and interns a new one.
    pub fn intern_string(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = gc::hash_bytes(bytes);
        if let Some(existing) = self.heap.strings.find_string(bytes, hash) {
            return existing;
        }
        self.collect_garbage_if_needed();
        let obj = self.heap.alloc_string_raw(bytes.to_vec().into_boxed_slice(), hash);
        self.heap.strings.set(obj, Value::Nil);
        obj
    }

    fn alloc_closure(&mut self, closure: ClosureObj) -> ObjRef {
        self.collect_garbage_if_needed();
        self.heap.alloc_closure(closure)
    }

    fn alloc_class(&mut self, class: ClassObj) -> ObjRef {
        self.collect_garbage_if_needed();
        self.heap.alloc_class(class)
    }

    fn alloc_instance(&mut self, instance: InstanceObj) -> ObjRef {
        self.collect_garbage_if_needed();
        self.heap.alloc_instance(instance)
    }

    fn alloc_bound_method(&mut self, bound: BoundMethodObj) -> ObjRef {
        self.collect_garbage_if_needed();
        self.heap.alloc_bound_method(bound)
    }

    fn alloc_upvalue(&mut self, upvalue: UpvalueObj) -> ObjRef {
        self.collect_garbage_if_needed();
        self.heap.alloc_upvalue(upvalue)
    }

    fn collect_garbage_if_needed(&mut self) {
        let roots = Roots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
            globals: &self.globals,
            compiler_roots: &self.compiler_roots,
        };
        gc::maybe_collect(&mut self.heap, roots);
    }

    // --- stack plumbing ---

    /// `pub(crate)` rather than private: the compiler also pushes/pops
    /// constants around `Chunk::add_constant` (§4.4 "push intermediates
    /// onto the value stack before calling allocator"), mirroring the
    /// original `push`/`pop` calls in `addConstant`.
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // --- the dispatch loop ---

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let chunk = &frame.closure.as_closure().function.as_function().chunk;
        let byte = chunk.code()[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let frame = *self.frames.last().unwrap();
        frame.closure.as_closure().function.as_function().chunk.constant(idx)
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj().expect("constant is not a string")
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if cfg!(feature = "debug-execution") {
                let frame = *self.frames.last().unwrap();
                let chunk = &frame.closure.as_closure().function.as_function().chunk;
                debug::trace_execution(&self.stack, chunk, frame.ip);
            }

            let byte = self.read_byte();
            let op = match OpCode::from_u8(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error("Unknown opcode.")),
            };

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
                    let base = self.frames.last().unwrap().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(&undefined_variable(name)));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(self.runtime_error(&undefined_variable(name)));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let up = self.frames.last().unwrap().closure.as_closure().upvalues[slot].unwrap();
                    self.push(self.read_upvalue(up));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let up = self.frames.last().unwrap().closure.as_closure().upvalues[slot].unwrap();
                    let value = self.peek(0);
                    self.write_upvalue(up, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance = match receiver.as_obj().filter(|o| o.is_instance()) {
                        Some(o) => o,
                        None => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    if let Some(value) = instance.as_instance().fields.get(name) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = instance.as_instance().class;
                        if let Err(message) = self.bind_method(class, name) {
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(1);
                    let instance = match receiver.as_obj().filter(|o| o.is_instance()) {
                        Some(o) => o,
                        None => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let value = self.peek(0);
                    instance.as_instance_mut().fields.set(name, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().expect("superclass is not an object");
                    if let Err(message) = self.bind_method(superclass, name) {
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(_), Value::Number(_)) => {
                        let b = self.pop().as_number().unwrap();
                        let a = self.pop().as_number().unwrap();
                        self.push(Value::Number(a + b));
                    }
                    (a, b) if a.is_string() && b.is_string() => self.concatenate(),
                    _ => {
                        return Err(self.runtime_error("Operands must be two numbers or two strings."));
                    }
                },
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Print => {
                    let value = self.pop();
                    println!("{value}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    if let Err(message) = self.call_value(callee, argc) {
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::Invoke => {
                    let method = self.read_string();
                    let argc = self.read_byte();
                    if let Err(message) = self.invoke(method, argc) {
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::SuperInvoke => {
                    let method = self.read_string();
                    let argc = self.read_byte();
                    let superclass = self.pop().as_obj().expect("superclass is not an object");
                    if let Err(message) = self.invoke_from_class(superclass, method, argc) {
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_obj().expect("constant is not a function");
                    let upvalue_count = function.as_function().upvalue_count as usize;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let up = if is_local {
                            let base = self.frames.last().unwrap().slots_base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.frames.last().unwrap().closure.as_closure().upvalues[index].unwrap()
                        };
                        upvalues.push(Some(up));
                    }
                    let closure = self.alloc_closure(ClosureObj { function, upvalues });
                    self.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots_base);
                    self.stack.truncate(frame.slots_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc_class(ClassObj {
                        name,
                        methods: Table::new(),
                    });
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let subclass = self.peek(0).as_obj().expect("subclass is not an object");
                    match superclass.as_obj().filter(|o| matches!(o.kind(), ObjKind::Class(_))) {
                        Some(super_ref) => {
                            let super_methods: Vec<_> = super_ref.as_class().methods.iter().collect();
                            for (key, value) in super_methods {
                                subclass.as_class_mut().methods.set(key, value);
                            }
                        }
                        None => return Err(self.runtime_error("Superclass must be a class.")),
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj().expect("class is not an object");
                    class.as_class_mut().methods.set(name, method);
                    self.pop();
                }
            }
        }
    }

    fn binary_number_op(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(_), Value::Number(_)) => {
                let b = self.pop().as_number().unwrap();
                let a = self.pop().as_number().unwrap();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    /// Both operands are interned strings still referenced from the stack
    /// (peeked, not popped), so the intern lookup/allocation below never
    /// has to treat them as unreachable.
    fn concatenate(&mut self) {
        let b = self.peek(0).as_obj().unwrap().as_string();
        let a = self.peek(1).as_obj().unwrap().as_string();
        let mut bytes = Vec::with_capacity(a.bytes.len() + b.bytes.len());
        bytes.extend_from_slice(&a.bytes);
        bytes.extend_from_slice(&b.bytes);
        let result = self.intern_string(&bytes);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    // --- calls ---

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), String> {
        let obj = match callee.as_obj() {
            Some(o) => o,
            None => return Err("Can only call functions and classes.".to_string()),
        };
        match obj.kind() {
            ObjKind::Closure(_) => self.call(obj, argc),
            ObjKind::Native(_) => self.call_native(obj, argc),
            ObjKind::Class(_) => self.instantiate(obj, argc),
            ObjKind::BoundMethod(_) => {
                let bound = obj.as_bound_method();
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = bound.receiver;
                self.call(bound.method, argc)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn call(&mut self, closure_ref: ObjRef, argc: u8) -> Result<(), String> {
        let function = closure_ref.as_closure().function.as_function();
        if argc != function.arity {
            return Err(format!("Expected {} arguments but got {}.", function.arity, argc));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            slots_base,
        });
        Ok(())
    }

    fn call_native(&mut self, obj: ObjRef, argc: u8) -> Result<(), String> {
        let native = obj.as_native();
        if argc != native.arity {
            return Err(format!("Expected {} arguments but got {}.", native.arity, argc));
        }
        let base = self.stack.len() - argc as usize;
        let args = self.stack[base..].to_vec();
        let result = (native.function)(&args)?;
        self.stack.truncate(base - 1);
        self.push(result);
        Ok(())
    }

    fn instantiate(&mut self, class: ObjRef, argc: u8) -> Result<(), String> {
        let instance = self.alloc_instance(InstanceObj {
            class,
            fields: Table::new(),
        });
        let base = self.stack.len() - argc as usize - 1;
        self.stack[base] = Value::Obj(instance);
        let init_name = self.intern_string(b"init");
        match class.as_class().methods.get(init_name) {
            Some(Value::Obj(init)) => self.call(init, argc),
            _ if argc != 0 => Err(format!("Expected 0 arguments but got {argc}.")),
            _ => Ok(()),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), String> {
        let receiver = self.peek(argc as usize);
        let instance = match receiver.as_obj().filter(|o| o.is_instance()) {
            Some(o) => o,
            None => return Err("Only instances have methods.".to_string()),
        };
        if let Some(value) = instance.as_instance().fields.get(name) {
            let base = self.stack.len() - argc as usize - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        let class = instance.as_instance().class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: u8) -> Result<(), String> {
        match class.as_class().methods.get(name) {
            Some(Value::Obj(method)) => self.call(method, argc),
            _ => Err(undefined_property(name)),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), String> {
        let method = match class.as_class().methods.get(name) {
            Some(Value::Obj(m)) => m,
            _ => return Err(undefined_property(name)),
        };
        let receiver = self.peek(0);
        let bound = self.alloc_bound_method(BoundMethodObj { receiver, method });
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // --- upvalues ---

    /// Finds or creates the open upvalue for `stack_index`. The intrusive
    /// list is ordered by descending index, so a matching entry can only
    /// appear before the first one with a lower index.
    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(up) = current {
            match up.as_upvalue().location {
                UpvalueLocation::Stack(idx) if idx == stack_index => return up,
                UpvalueLocation::Stack(idx) if idx < stack_index => break,
                _ => {}
            }
            prev = current;
            current = up.as_upvalue().next;
        }

        let created = self.alloc_upvalue(UpvalueObj {
            location: UpvalueLocation::Stack(stack_index),
            closed: Value::Nil,
            next: current,
        });
        match prev {
            Some(p) => p.as_upvalue_mut().next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue pointing at or above `from`, copying the
    /// stack slot's current value into the upvalue itself.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(up) = self.open_upvalues {
            let idx = match up.as_upvalue().location {
                UpvalueLocation::Stack(idx) => idx,
                UpvalueLocation::Closed => break,
            };
            if idx < from {
                break;
            }
            let value = self.stack[idx];
            let up_mut = up.as_upvalue_mut();
            up_mut.closed = value;
            up_mut.location = UpvalueLocation::Closed;
            self.open_upvalues = up_mut.next;
        }
    }

    fn read_upvalue(&self, up: ObjRef) -> Value {
        match up.as_upvalue().location {
            UpvalueLocation::Stack(idx) => self.stack[idx],
            UpvalueLocation::Closed => up.as_upvalue().closed,
        }
    }

    fn write_upvalue(&mut self, up: ObjRef, value: Value) {
        match up.as_upvalue().location {
            UpvalueLocation::Stack(idx) => self.stack[idx] = value,
            UpvalueLocation::Closed => up.as_upvalue_mut().closed = value,
        }
    }

    // --- errors ---

    /// Builds the stack trace (§6: "innermost outward") and resets the VM
    /// to a clean, empty-stack state — the only way a running program
    /// leaves the stack/frames non-empty on error.
    fn runtime_error(&mut self, message: &str) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = frame.closure.as_closure().function.as_function();
            let last_executed = frame.ip.saturating_sub(1).min(function.chunk.len().saturating_sub(1));
            let line = function.chunk.line_at(last_executed);
            let name = function
                .name
                .map(|n| n.as_string().as_str().to_string())
                .unwrap_or_default();
            trace.push(TraceFrame { line, name });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        RuntimeError::new(message.to_string(), trace)
    }
}

fn function_label(function: &FunctionObj) -> &str {
    match function.name {
        Some(name) => name.as_string().as_str(),
        None => "<script>",
    }
}

fn undefined_variable(name: ObjRef) -> String {
    format!("Undefined variable '{}'.", name.as_string().as_str())
}

fn undefined_property(name: ObjRef) -> String {
    format!("Undefined property '{}'.", name.as_string().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;
    use proptest::prelude::*;
    use rstest::rstest;

    fn run(source: &str) -> Result<(), InterpretError> {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter::default();
        vm.interpret(source, &mut reporter)
    }

    #[rstest]
    #[case("print 1 + 2 * 3;")]
    #[case("print (1 + 2) * 3;")]
    #[case("print \"a\" + \"b\";")]
    fn arithmetic_and_precedence_run_cleanly(#[case] source: &str) {
        assert!(run(source).is_ok());
    }

    #[test]
    fn closures_capture_and_persist_state() {
        let source = r#"
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
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn class_inheritance_resolves_super_calls() {
        let source = r#"
            class Animal {
                speak() { return "..."; }
            }
            class Dog < Animal {
                speak() { return "Woof, " + super.speak(); }
            }
            print Dog().speak();
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn string_literals_with_equal_contents_are_interned() {
        let mut vm = Vm::new();
        let a = vm.intern_string(b"hello");
        let b = vm.intern_string(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn initializer_implicitly_returns_this() {
        let source = r#"
            class Point {
                init(x) { this.x = x; }
            }
            var p = Point(3);
            print p.x;
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn runtime_error_produces_a_trace() {
        let source = r#"
            fun a() { return 1 + nil; }
            fun b() { return a(); }
            b();
        "#;
        match run(source) {
            Err(InterpretError::Runtime(err)) => {
                assert_eq!(err.trace.len(), 3);
                assert_eq!(err.trace[0].name, "a");
                assert_eq!(err.trace[1].name, "b");
                assert!(err.trace[2].name.is_empty());
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn deeply_recursive_calls_overflow_the_frame_stack() {
        let source = r#"
            fun recurse() { return recurse(); }
            recurse();
        "#;
        match run(source) {
            Err(InterpretError::Runtime(err)) => assert_eq!(err.message, "Stack overflow."),
            other => panic!("expected a stack overflow, got {other:?}"),
        }
    }

    #[test]
    fn undefined_global_reports_its_name() {
        match run("print missing;") {
            Err(InterpretError::Runtime(err)) => {
                assert_eq!(err.message, "Undefined variable 'missing'.");
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn each_statement_leaves_the_stack_the_size_it_found_it() {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter::default();
        let source = r#"
            var a = 1;
            var b = 2;
            if (a < b) { print a; } else { print b; }
            while (a < 5) { a = a + 1; }
            for (var i = 0; i < 3; i = i + 1) { print i; }
            print a + b;
        "#;
        vm.interpret(source, &mut reporter).unwrap();
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    proptest! {
        /// §8: `copy_string(a)` and `copy_string(b)` return the same object
        /// iff `a == b` byte-for-byte.
        #[test]
        fn equal_string_literals_intern_to_the_same_object(s in "[a-zA-Z0-9 ]{0,16}") {
            let mut vm = Vm::new();
            let a = vm.intern_string(s.as_bytes());
            let b = vm.intern_string(s.as_bytes());
            prop_assert_eq!(a, b);
        }

        /// Distinct byte sequences never collide into the same canonical object.
        #[test]
        fn distinct_strings_never_share_an_object(a in "[a-z]{1,8}", b in "[A-Z]{1,8}") {
            let mut vm = Vm::new();
            let a_obj = vm.intern_string(a.as_bytes());
            let b_obj = vm.intern_string(b.as_bytes());
            prop_assert_ne!(a_obj, b_obj);
        }
    }
}
