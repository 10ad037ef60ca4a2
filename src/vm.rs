//! The interpreter: dispatch loop, call frames, method dispatch, exception
//! unwinding, and GC orchestration.
//!
//! One VM owns one heap, one intern table, one module registry, and one
//! value stack shared by every frame. Reentrancy (host code calling back
//! into scripts from natives) is handled with a frame-floor watermark: the
//! dispatch loop returns when the frame stack pops back to the level at
//! which it was entered, and unwinding never crosses the floor.

use std::path::PathBuf;

use crate::call_frame::{CallFrame, Handler};
use crate::chunk::OpCode;
use crate::constants::{
    CTOR_NAME, EXC_ERR_FIELD, EXC_TRACE_FIELD, INTERN_THRESHOLD, MAIN_MODULE, MIN_NATIVE_STACK,
    RECURSION_LIMIT,
};
use crate::gc::GarbageCollector;
use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_list::ObjectList;
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_native::ObjectNative;
use crate::objects::object_string::{hash_string, ObjectString};
use crate::objects::object_tuple::ObjectTuple;
use crate::objects::object_upvalue::{ObjectUpvalue, UpvalueState};
use crate::table::Table;
use crate::value::*;

/// Result of a top-level evaluation or a host-initiated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalResult {
    Success,
    SyntaxErr,
    CompileErr,
    RuntimeErr,
}

/// Where `print` and diagnostics go; capture mode backs the test suite and
/// embedders that redirect output.
enum OutputSink {
    Stdout,
    Stderr,
    Capture(Vec<u8>),
}

impl OutputSink {
    fn write(&mut self, text: &str) {
        match self {
            OutputSink::Stdout => print!("{}", text),
            OutputSink::Stderr => eprint!("{}", text),
            OutputSink::Capture(buffer) => buffer.extend_from_slice(text.as_bytes()),
        }
    }
}

pub struct VM {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub open_upvalues: Vec<*mut ObjectUpvalue>,
    pub object_manager: ObjectManager,
    pub gc: GarbageCollector,
    pub intern_strings: Table,
    pub modules: Table,
    /// Values pinned against collection during multi-step host operations.
    pub temp_roots: Vec<Value>,
    pub import_paths: Vec<PathBuf>,
    pub(crate) core_module: *mut ObjectModule,
    pub(crate) list_class: *mut ObjectClass,
    pub(crate) tuple_class: *mut ObjectClass,
    pub(crate) range_class: *mut ObjectClass,
    pub(crate) string_class: *mut ObjectClass,
    pub(crate) number_class: *mut ObjectClass,
    /// Base slot of the running native's window (receiver at 0).
    pub(crate) api_base: usize,
    pub(crate) api_argc: usize,
    /// Reentrancy watermark: run() returns and unwinding stops here.
    frame_floor: usize,
    out: OutputSink,
    diag: OutputSink,
}

impl VM {
    pub fn new() -> Box<VM> {
        let mut vm = Box::new(VM {
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            object_manager: ObjectManager::new(),
            gc: GarbageCollector::new(),
            intern_strings: Table::new(),
            modules: Table::new(),
            temp_roots: Vec::new(),
            import_paths: vec![PathBuf::from(".")],
            core_module: std::ptr::null_mut(),
            list_class: std::ptr::null_mut(),
            tuple_class: std::ptr::null_mut(),
            range_class: std::ptr::null_mut(),
            string_class: std::ptr::null_mut(),
            number_class: std::ptr::null_mut(),
            api_base: 0,
            api_argc: 0,
            frame_floor: 0,
            out: OutputSink::Stdout,
            diag: OutputSink::Stderr,
        });
        vm.init_core_module();
        vm
    }

    /// Redirect `print` and diagnostics into an in-memory buffer.
    pub fn capture_output(&mut self) {
        self.out = OutputSink::Capture(Vec::new());
        self.diag = OutputSink::Capture(Vec::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutputSink::Capture(buffer) => {
                String::from_utf8_lossy(&std::mem::take(buffer)).into_owned()
            }
            _ => String::new(),
        }
    }

    pub fn take_diagnostics(&mut self) -> String {
        match &mut self.diag {
            OutputSink::Capture(buffer) => {
                String::from_utf8_lossy(&std::mem::take(buffer)).into_owned()
            }
            _ => String::new(),
        }
    }

    pub(crate) fn write_out(&mut self, text: &str) {
        self.out.write(text);
    }

    pub(crate) fn write_diag(&mut self, text: &str) {
        self.diag.write(text);
    }

    // ---- evaluation entry points ----

    /// Parse, compile, and run `src` as top-level code in `__main__`.
    pub fn evaluate(&mut self, src: &str, path: &str) -> EvalResult {
        self.evaluate_module(src, path, MAIN_MODULE)
    }

    /// Same as `evaluate`, in a named module.
    pub fn evaluate_module(&mut self, src: &str, path: &str, name: &str) -> EvalResult {
        let ast = match crate::parser::parse(src, path) {
            Ok(ast) => ast,
            Err(errors) => {
                for error in errors {
                    let line = format!("{}\n", error);
                    self.write_diag(&line);
                }
                return EvalResult::SyntaxErr;
            }
        };
        let saved = self.object_manager.gc_disabled();
        self.object_manager.gc_disable(true);
        let module = self.get_or_create_module(name);
        let function = match crate::compiler::compile(self, module, &ast, path) {
            Ok(function) => function,
            Err(errors) => {
                self.object_manager.gc_disable(saved);
                for error in errors {
                    let line = format!("{}\n", error);
                    self.write_diag(&line);
                }
                return EvalResult::CompileErr;
            }
        };
        let closure = self.object_manager.alloc_closure(function);
        self.push(make_object_value(closure));
        self.object_manager.gc_disable(saved);

        let result = self.call(0);
        if result == EvalResult::RuntimeErr {
            self.print_stack_trace();
        }
        // Pop the result (or the unhandled exception).
        self.pop();
        result
    }

    /// Invoke the callee sitting below `argc` arguments on the stack. On
    /// success the result replaces callee and arguments; on a runtime error
    /// the unhandled exception does.
    pub fn call(&mut self, argc: u8) -> EvalResult {
        let argc = argc as usize;
        debug_assert!(self.stack.len() > argc);
        let callee_index = self.stack.len() - argc - 1;
        let floor = self.frames.len();
        let saved_floor = self.frame_floor;
        self.frame_floor = floor;
        let callee = self.peek(argc);
        let result = if !self.call_value(callee, argc) {
            EvalResult::RuntimeErr
        } else if self.frames.len() > floor {
            match self.run() {
                Ok(()) => EvalResult::Success,
                Err(()) => EvalResult::RuntimeErr,
            }
        } else {
            EvalResult::Success
        };
        self.frame_floor = saved_floor;
        if result == EvalResult::RuntimeErr {
            // The exception replaces callee and arguments, like a result.
            let exc = self.pop();
            self.stack.truncate(callee_index);
            self.push(exc);
        }
        result
    }

    /// Invoke method `name` on the receiver sitting below `argc` arguments.
    pub fn call_method(&mut self, name: &str, argc: u8) -> EvalResult {
        let argc = argc as usize;
        debug_assert!(self.stack.len() > argc);
        let receiver_index = self.stack.len() - argc - 1;
        let floor = self.frames.len();
        let saved_floor = self.frame_floor;
        self.frame_floor = floor;
        let name_string = self.intern_string(name);
        self.temp_roots.push(make_object_value(name_string));
        let ok = self.invoke(name_string, argc);
        self.temp_roots.pop();
        let result = if !ok {
            EvalResult::RuntimeErr
        } else if self.frames.len() > floor {
            match self.run() {
                Ok(()) => EvalResult::Success,
                Err(()) => EvalResult::RuntimeErr,
            }
        } else {
            EvalResult::Success
        };
        self.frame_floor = saved_floor;
        if result == EvalResult::RuntimeErr {
            let exc = self.pop();
            self.stack.truncate(receiver_index);
            self.push(exc);
        }
        result
    }

    /// Print the stack trace of the exception on top of the stack.
    pub fn print_stack_trace(&mut self) {
        let exc = self.peek(0);
        let mut report = String::from("Traceback (most recent call last):\n");
        if is_instance(&exc) {
            let instance = unsafe { &*as_instance(&exc) };
            let trace_name = self.intern_string(EXC_TRACE_FIELD);
            if let Some(trace) = instance.fields.get(trace_name) {
                if is_list(&trace) {
                    let list = unsafe { &*as_list(&trace) };
                    for entry in list.elements.iter().rev() {
                        if is_tuple(entry) {
                            let tuple = unsafe { &*as_tuple(entry) };
                            if tuple.elements.len() == 2 {
                                report.push_str(&format!(
                                    "    [line {}] in {}\n",
                                    value_to_string(&tuple.elements[1]),
                                    value_to_string(&tuple.elements[0])
                                ));
                            }
                        }
                    }
                }
            }
            let class_name = unsafe { (*instance.class).name_str().to_string() };
            let err_name = self.intern_string(EXC_ERR_FIELD);
            let message = instance
                .fields
                .get(err_name)
                .map(|err| value_to_string(&err))
                .unwrap_or_default();
            report.push_str(&format!("{}: {}\n", class_name, message));
        } else {
            report.push_str(&format!("{}\n", value_to_string(&exc)));
        }
        self.write_diag(&report);
    }

    // ---- stack primitives ----

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Reserve value-stack capacity. Slots are index-addressed, so the
    /// backing array may move; hosts must not cache raw pointers between
    /// API calls.
    pub fn ensure_stack(&mut self, needed: usize) {
        if needed > self.stack.capacity() {
            self.stack.reserve(needed - self.stack.len());
        }
    }

    // ---- allocation (GC-aware) ----

    pub(crate) fn maybe_collect(&mut self) {
        if self.object_manager.should_collect() {
            self.collect_garbage();
        }
    }

    /// Run one full mark-sweep cycle.
    pub fn collect_garbage(&mut self) {
        let before = self.object_manager.allocated_bytes;
        {
            let gc = &mut self.gc;
            gc.mark_roots(
                &self.stack,
                &self.frames,
                &self.open_upvalues,
                &self.modules,
                &self.temp_roots,
            );
            gc.mark_object(self.core_module as *mut Object);
            gc.trace_references();
        }
        // The intern table is weak: prune dead strings before freeing them.
        self.intern_strings.remove_unmarked_keys();
        let freed = self.object_manager.sweep();
        let after = self.object_manager.allocated_bytes;
        self.gc
            .record_cycle(before, freed, after, self.object_manager.next_gc);
    }

    /// Canonicalize `content`: strings at or under the intern threshold
    /// yield one shared object per byte sequence.
    pub fn intern_string(&mut self, content: &str) -> *mut ObjectString {
        let hash = hash_string(content.as_bytes());
        let interned = content.len() <= INTERN_THRESHOLD;
        if interned {
            if let Some(existing) = self.intern_strings.find_string(content, hash) {
                return existing;
            }
        }
        self.maybe_collect();
        let string = self.object_manager.alloc_string(content);
        if interned {
            self.intern_strings.insert(string, make_null_value());
        }
        string
    }

    pub(crate) fn alloc_list(&mut self, elements: Vec<Value>) -> *mut ObjectList {
        self.maybe_collect();
        self.object_manager.alloc_list(elements)
    }

    pub(crate) fn alloc_tuple(&mut self, elements: Vec<Value>) -> *mut ObjectTuple {
        self.maybe_collect();
        self.object_manager.alloc_tuple(elements)
    }

    pub(crate) fn alloc_instance(&mut self, class: *mut ObjectClass) -> *mut ObjectInstance {
        self.maybe_collect();
        self.object_manager.alloc_instance(class)
    }

    // ---- frame helpers ----

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let function = unsafe { (*frame.closure).function };
        let byte = unsafe { (&(*function).chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let frame = self.frame();
        let function = unsafe { (*frame.closure).function };
        unsafe { *(*function).chunk.get_constant(index) }
    }

    fn read_string_constant(&mut self) -> *mut ObjectString {
        let value = self.read_constant();
        debug_assert!(is_string(&value), "corrupted bytecode: expected string constant");
        as_string(&value)
    }

    pub(crate) fn current_module(&self) -> *mut ObjectModule {
        if let Some(frame) = self.frames.last() {
            unsafe { (*(*frame.closure).function).module }
        } else {
            self.core_module
        }
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjectUpvalue {
        // Closures capturing the same slot share one upvalue, so writes
        // through any of them are seen by all.
        for &upvalue in &self.open_upvalues {
            if unsafe { (*upvalue).open_slot() } == Some(slot) {
                return upvalue;
            }
        }
        self.maybe_collect();
        let upvalue = self.object_manager.alloc_upvalue(slot);
        self.open_upvalues.push(upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from_slot` (stack→heap
    /// promotion at scope exit and frame teardown).
    fn close_upvalues(&mut self, from_slot: usize) {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let upvalue = self.open_upvalues[index];
            let slot = unsafe { (*upvalue).open_slot() }.expect("closed upvalue in open list");
            if slot >= from_slot {
                let value = self.stack[slot];
                unsafe { (*upvalue).close(value) };
                self.open_upvalues.swap_remove(index);
            } else {
                index += 1;
            }
        }
    }

    // ---- calls ----

    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> bool {
        if is_object(&callee) {
            match unsafe { (*as_object(&callee)).kind } {
                ObjectKind::Closure => return self.call_closure(as_closure(&callee), argc),
                ObjectKind::Native => return self.call_native(as_native(&callee), argc, false),
                ObjectKind::Class => return self.call_class(as_class(&callee), argc),
                ObjectKind::BoundMethod => {
                    let bound = as_bound_method(&callee);
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = unsafe { (*bound).receiver };
                    let method = unsafe { (*bound).method };
                    return self.call_method_value(method, argc);
                }
                _ => {}
            }
        }
        self.rt_raise(
            "TypeException",
            format!("{} is not callable.", value_to_string(&callee)),
        )
    }

    /// Call a resolved method with the receiver already in the callee slot.
    fn call_method_value(&mut self, method: Value, argc: usize) -> bool {
        if is_closure(&method) {
            self.call_closure(as_closure(&method), argc)
        } else if is_native(&method) {
            self.call_native(as_native(&method), argc, true)
        } else {
            self.rt_raise(
                "TypeException",
                format!("{} is not callable.", value_to_string(&method)),
            )
        }
    }

    fn call_closure(&mut self, closure: *mut ObjectClosure, argc: usize) -> bool {
        let function = unsafe { (*closure).function };
        let arity = unsafe { (*function).arity } as usize;
        let vararg = unsafe { (*function).vararg };
        if self.frames.len() >= RECURSION_LIMIT {
            return self.rt_raise("StackOverflowError", "Max recursion depth exceeded.".to_string());
        }
        if vararg {
            if argc < arity {
                let name = unsafe { (*function).name_str().to_string() };
                return self.rt_raise(
                    "TypeException",
                    format!("{}() takes at least {} arguments, {} given.", name, arity, argc),
                );
            }
            // Pack surplus arguments into a tuple filling the vararg slot.
            let surplus_start = self.stack.len() - (argc - arity);
            let surplus: Vec<Value> = self.stack[surplus_start..].to_vec();
            let tuple = self.alloc_tuple(surplus);
            self.stack.truncate(surplus_start);
            self.push(make_object_value(tuple));
        } else if argc != arity {
            let name = unsafe { (*function).name_str().to_string() };
            return self.rt_raise(
                "TypeException",
                format!("{}() takes {} arguments, {} given.", name, arity, argc),
            );
        }
        let slots = arity + if vararg { 1 } else { 0 };
        let base = self.stack.len() - slots - 1;
        let max_stack = unsafe { (*function).max_stack };
        self.ensure_stack(base + max_stack + MIN_NATIVE_STACK);
        self.frames.push(CallFrame::new(closure, base));
        true
    }

    fn call_native(&mut self, native: *mut ObjectNative, argc: usize, bound: bool) -> bool {
        let arity = unsafe { (*native).arity } as usize;
        let vararg = unsafe { (*native).vararg };
        if (vararg && argc < arity) || (!vararg && argc != arity) {
            let name = unsafe { (*native).name_str().to_string() };
            return self.rt_raise(
                "TypeException",
                format!("{}() takes {} arguments, {} given.", name, arity, argc),
            );
        }
        let base = self.stack.len() - argc - 1;
        if !bound {
            // The callee slot doubles as the receiver; plain calls get null.
            self.stack[base] = make_null_value();
        }
        let saved_base = self.api_base;
        let saved_argc = self.api_argc;
        self.api_base = base;
        self.api_argc = argc;
        let function = unsafe { (*native).function };
        let ok = function(self);
        self.api_base = saved_base;
        self.api_argc = saved_argc;
        if ok {
            let result = self.pop();
            self.stack.truncate(base);
            self.push(result);
            true
        } else {
            let exc = self.pop();
            self.stack.truncate(base);
            self.throw(exc)
        }
    }

    fn call_class(&mut self, class: *mut ObjectClass, argc: usize) -> bool {
        let base = self.stack.len() - argc - 1;
        let instance = self.alloc_instance(class);
        self.stack[base] = make_object_value(instance);
        let ctor_name = self.intern_string(CTOR_NAME);
        let ctor = unsafe { (*class).methods.get(ctor_name) };
        match ctor {
            Some(method) => self.call_method_value(method, argc),
            None => {
                if argc != 0 {
                    let name = unsafe { (*class).name_str().to_string() };
                    self.rt_raise(
                        "TypeException",
                        format!("{}() takes 0 arguments, {} given.", name, argc),
                    )
                } else {
                    true
                }
            }
        }
    }

    /// INVOKE: attribute lookup on the receiver, then call. Instance fields
    /// shadow methods; a callable field is invoked without binding.
    pub(crate) fn invoke(&mut self, name: *mut ObjectString, argc: usize) -> bool {
        let receiver = self.peek(argc);
        let base = self.stack.len() - argc - 1;
        if is_instance(&receiver) {
            let instance = unsafe { &*as_instance(&receiver) };
            if let Some(field) = instance.fields.get(name) {
                self.stack[base] = field;
                return self.call_value(field, argc);
            }
            let method = unsafe { (*instance.class).methods.get(name) };
            if let Some(method) = method {
                return self.call_method_value(method, argc);
            }
            let class_name = unsafe { (*instance.class).name_str().to_string() };
            return self.rt_raise(
                "NameException",
                format!(
                    "Instance of {} has no attribute '{}'.",
                    class_name,
                    unsafe { (*name).as_str() }
                ),
            );
        }
        if is_module(&receiver) {
            let module = unsafe { &*as_module(&receiver) };
            if let Some(value) = module.globals.get(name) {
                self.stack[base] = value;
                return self.call_value(value, argc);
            }
            return self.rt_raise(
                "NameException",
                format!(
                    "Name '{}' is not defined in module {}.",
                    unsafe { (*name).as_str() },
                    module.name_str()
                ),
            );
        }
        if let Some(class) = self.class_of(&receiver) {
            let method = unsafe { (*class).methods.get(name) };
            if let Some(method) = method {
                return self.call_method_value(method, argc);
            }
        }
        self.rt_raise(
            "TypeException",
            format!(
                "{} has no method '{}'.",
                value_to_string(&receiver),
                unsafe { (*name).as_str() }
            ),
        )
    }

    /// The built-in class backing method dispatch on a primitive value.
    pub(crate) fn class_of(&self, value: &Value) -> Option<*mut ObjectClass> {
        if is_number(value) && !self.number_class.is_null() {
            return Some(self.number_class);
        }
        match object_kind(value) {
            Some(ObjectKind::List) => Some(self.list_class),
            Some(ObjectKind::Tuple) => Some(self.tuple_class),
            Some(ObjectKind::Range) => Some(self.range_class),
            Some(ObjectKind::String) => Some(self.string_class),
            Some(ObjectKind::Instance) => Some(unsafe { (*as_instance(value)).class }),
            _ => None,
        }
        .filter(|class| !class.is_null())
    }

    // ---- exceptions ----

    /// Build an exception instance of `cls` (looked up in the current
    /// module, then `__core__`; unknown names degrade to NameException)
    /// without running its constructor.
    pub(crate) fn make_exception(&mut self, cls: &str, message: &str) -> Value {
        let paused = self.object_manager.gc_disabled();
        self.object_manager.gc_disable(true);
        let (class, final_message) = match self.find_class(cls) {
            Some(class) => (class, message.to_string()),
            None => {
                let fallback = self
                    .find_class("NameException")
                    .expect("core exception classes missing");
                (fallback, format!("Name '{}' is not defined.", cls))
            }
        };
        let instance = self.object_manager.alloc_instance(class);
        let err_name = self.intern_string(EXC_ERR_FIELD);
        let err_value = self.intern_string(&final_message);
        unsafe { (*instance).fields.insert(err_name, make_object_value(err_value)) };
        let trace_name = self.intern_string(EXC_TRACE_FIELD);
        let trace = self.object_manager.alloc_list(Vec::new());
        unsafe { (*instance).fields.insert(trace_name, make_object_value(trace)) };
        self.object_manager.gc_disable(paused);
        make_object_value(instance)
    }

    fn find_class(&mut self, name: &str) -> Option<*mut ObjectClass> {
        let name_string = self.intern_string(name);
        let module = self.current_module();
        let value = unsafe { (*module).globals.get(name_string) }.or_else(|| {
            if module == self.core_module {
                None
            } else {
                unsafe { (*self.core_module).globals.get(name_string) }
            }
        });
        match value {
            Some(value) if is_class(&value) => Some(as_class(&value)),
            _ => None,
        }
    }

    /// Raise a runtime exception from inside the interpreter. Returns true
    /// when a handler was found and execution can resume.
    pub(crate) fn rt_raise(&mut self, cls: &str, message: String) -> bool {
        let exc = self.make_exception(cls, &message);
        self.throw(exc)
    }

    /// Unwind with `exc`: scan handler stacks frame by frame, running
    /// except and ensure code as encountered. Frames with no handler are
    /// popped after appending a (function, line) entry to the exception's
    /// stack trace. Returns false when the exception escapes the frame
    /// floor, in which case it is left on the stack.
    pub(crate) fn throw(&mut self, exc: Value) -> bool {
        self.temp_roots.push(exc);
        let resumed = self.unwind(exc);
        self.temp_roots.pop();
        resumed
    }

    fn unwind(&mut self, exc: Value) -> bool {
        loop {
            if self.frames.len() <= self.frame_floor {
                self.push(exc);
                return false;
            }
            let frame_index = self.frames.len() - 1;
            match self.frames[frame_index].handlers.pop() {
                Some(handler) => {
                    self.stack.truncate(handler.saved_sp);
                    if let Some(except_ip) = handler.except_ip {
                        if handler.ensure_ip.is_some() {
                            // Keep the ensure armed while the except runs.
                            self.frames[frame_index].handlers.push(Handler {
                                except_ip: None,
                                ensure_ip: handler.ensure_ip,
                                saved_sp: handler.saved_sp,
                            });
                        }
                        self.frames[frame_index].ip = except_ip;
                    } else {
                        let ensure_ip =
                            handler.ensure_ip.expect("handler with no except and no ensure");
                        self.frames[frame_index].ip = ensure_ip;
                    }
                    self.push(exc);
                    return true;
                }
                None => {
                    self.record_stack_trace(&exc, frame_index);
                    let base = self.frames[frame_index].stack_base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    self.stack.truncate(base);
                }
            }
        }
    }

    fn record_stack_trace(&mut self, exc: &Value, frame_index: usize) {
        if !is_instance(exc) {
            return;
        }
        let function = self.frames[frame_index].function();
        let line = self.frames[frame_index].current_line();
        let trace_name = self.intern_string(EXC_TRACE_FIELD);
        let trace = unsafe { (*as_instance(exc)).fields.get(trace_name) };
        if let Some(trace) = trace {
            if is_list(&trace) {
                let name_value = unsafe {
                    if (*function).name.is_null() {
                        let script = self.intern_string("<script>");
                        make_object_value(script)
                    } else {
                        make_object_value((*function).name)
                    }
                };
                self.temp_roots.push(name_value);
                let entry = self.alloc_tuple(vec![name_value, make_number_value(line as f64)]);
                self.temp_roots.pop();
                unsafe { (*as_list(&trace)).elements.push(make_object_value(entry)) };
            }
        }
    }

    // ---- the dispatch loop ----

    /// Execute until the frame stack pops back to the entry watermark.
    fn run(&mut self) -> Result<(), ()> {
        loop {
            debug_feature::trace_instruction(self);
            let byte = self.read_byte();
            let op = OpCode::from_byte(byte).expect("corrupted bytecode: bad opcode");
            let ok = match op {
                OpCode::Null => {
                    self.push(make_null_value());
                    true
                }
                OpCode::True => {
                    self.push(make_bool_value(true));
                    true
                }
                OpCode::False => {
                    self.push(make_bool_value(false));
                    true
                }
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                    true
                }
                OpCode::Pop => {
                    self.pop();
                    true
                }
                OpCode::Dup => {
                    self.push(self.peek(0));
                    true
                }
                OpCode::Dup2 => {
                    let second = self.peek(1);
                    let top = self.peek(0);
                    self.push(second);
                    self.push(top);
                    true
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().stack_base;
                    self.push(self.stack[base + slot]);
                    true
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().stack_base;
                    self.stack[base + slot] = self.peek(0);
                    true
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let module = self.current_module();
                    match unsafe { (*module).globals.get(name) } {
                        Some(value) => {
                            self.push(value);
                            true
                        }
                        None => self.rt_raise(
                            "NameException",
                            format!("Name '{}' is not defined.", unsafe { (*name).as_str() }),
                        ),
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let module = self.current_module();
                    if unsafe { (*module).globals.contains_key(name) } {
                        let value = self.peek(0);
                        unsafe { (*module).globals.insert(name, value) };
                        true
                    } else {
                        self.rt_raise(
                            "NameException",
                            format!("Name '{}' is not defined.", unsafe { (*name).as_str() }),
                        )
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let module = self.current_module();
                    let value = self.peek(0);
                    unsafe { (*module).globals.insert(name, value) };
                    self.pop();
                    true
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = unsafe { (&(*closure).upvalues)[index] };
                    let value = match unsafe { &(*upvalue).state } {
                        UpvalueState::Open(slot) => self.stack[*slot],
                        UpvalueState::Closed(value) => *value,
                    };
                    self.push(value);
                    true
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.frame().closure;
                    let upvalue = unsafe { (&(*closure).upvalues)[index] };
                    match unsafe { &mut (*upvalue).state } {
                        UpvalueState::Open(slot) => self.stack[*slot] = value,
                        UpvalueState::Closed(cell) => *cell = value,
                    }
                    true
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                    true
                }
                OpCode::GetField => {
                    let name = self.read_string_constant();
                    self.op_get_field(name)
                }
                OpCode::SetField => {
                    let name = self.read_string_constant();
                    self.op_set_field(name)
                }
                OpCode::GetIndex => self.get_index(),
                OpCode::SetIndex => self.set_index(),
                OpCode::Equal => self.op_equal(),
                OpCode::Greater => self.numeric_compare(op),
                OpCode::GreaterEqual => self.numeric_compare(op),
                OpCode::Less => self.numeric_compare(op),
                OpCode::LessEqual => self.numeric_compare(op),
                OpCode::Is => self.op_is(),
                OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Modulo
                | OpCode::Power => self.arithmetic(op),
                OpCode::Negate => self.op_negate(),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(make_bool_value(is_falsey(&value)));
                    true
                }
                OpCode::Length => self.op_length(),
                OpCode::Jump => {
                    let distance = self.read_u16() as usize;
                    self.frame_mut().ip += distance;
                    true
                }
                OpCode::JumpIfFalse => {
                    let distance = self.read_u16() as usize;
                    if is_falsey(&self.peek(0)) {
                        self.frame_mut().ip += distance;
                    }
                    true
                }
                OpCode::JumpIfTrue => {
                    let distance = self.read_u16() as usize;
                    if !is_falsey(&self.peek(0)) {
                        self.frame_mut().ip += distance;
                    }
                    true
                }
                OpCode::Loop => {
                    let distance = self.read_u16() as usize;
                    self.frame_mut().ip -= distance;
                    true
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop();
                    debug_assert!(is_class(&superclass));
                    let method = unsafe { (*as_class(&superclass)).methods.get(name) };
                    match method {
                        Some(method) => self.call_method_value(method, argc),
                        None => self.rt_raise(
                            "NameException",
                            format!("Superclass has no method '{}'.", unsafe {
                                (*name).as_str()
                            }),
                        ),
                    }
                }
                OpCode::MakeClosure => self.make_closure(),
                OpCode::NewClass => {
                    let name = self.read_string_constant();
                    self.maybe_collect();
                    let class = self.object_manager.alloc_class(name);
                    self.push(make_object_value(class));
                    true
                }
                OpCode::Inherit => {
                    let class_value = self.peek(0);
                    let super_value = self.peek(1);
                    if !is_class(&super_value) {
                        self.rt_raise(
                            "TypeException",
                            "Superclass must be a class.".to_string(),
                        )
                    } else {
                        let class = as_class(&class_value);
                        let superclass = as_class(&super_value);
                        unsafe {
                            // Copy now so later dispatch is one table probe.
                            (*class).methods.merge_from(&(*superclass).methods);
                            (*class).superclass = superclass;
                        }
                        self.pop();
                        true
                    }
                }
                OpCode::DefMethod => {
                    let name = self.read_string_constant();
                    let method = self.peek(0);
                    let class_value = self.peek(1);
                    debug_assert!(is_class(&class_value));
                    unsafe { (*as_class(&class_value)).methods.insert(name, method) };
                    self.pop();
                    true
                }
                OpCode::BuildList => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let elements = self.stack[start..].to_vec();
                    let list = self.alloc_list(elements);
                    self.stack.truncate(start);
                    self.push(make_object_value(list));
                    true
                }
                OpCode::BuildTuple => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let elements = self.stack[start..].to_vec();
                    let tuple = self.alloc_tuple(elements);
                    self.stack.truncate(start);
                    self.push(make_object_value(tuple));
                    true
                }
                OpCode::SetupTry => {
                    let except_off = self.read_u16() as usize;
                    let ensure_off = self.read_u16() as usize;
                    let sp = self.stack.len();
                    let frame = self.frame_mut();
                    let ip = frame.ip;
                    frame.handlers.push(Handler {
                        except_ip: if except_off > 0 { Some(ip + except_off) } else { None },
                        ensure_ip: if ensure_off > 0 { Some(ip + ensure_off) } else { None },
                        saved_sp: sp,
                    });
                    true
                }
                OpCode::PopHandler => {
                    self.frame_mut().handlers.pop();
                    true
                }
                OpCode::EndHandler => {
                    let pending = self.pop();
                    if is_null(&pending) {
                        true
                    } else {
                        self.throw(pending)
                    }
                }
                OpCode::Raise => {
                    let exc = self.pop();
                    if !is_instance(&exc) {
                        self.rt_raise(
                            "TypeException",
                            "Can only raise exception instances.".to_string(),
                        )
                    } else {
                        self.throw(exc)
                    }
                }
                OpCode::Import => {
                    let module_name = self.read_string_constant();
                    let bind_name = self.read_string_constant();
                    self.op_import(module_name, bind_name)
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = format!("{}\n", value_to_string(&value));
                    self.write_out(&text);
                    true
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame stack underflow");
                    self.close_upvalues(frame.stack_base);
                    self.stack.truncate(frame.stack_base);
                    self.push(result);
                    if self.frames.len() == self.frame_floor {
                        return Ok(());
                    }
                    true
                }
            };
            if !ok {
                return Err(());
            }
        }
    }

    // ---- individual operations ----

    fn make_closure(&mut self) -> bool {
        let function_value = self.read_constant();
        debug_assert!(is_function(&function_value));
        let function = as_function(&function_value);
        self.maybe_collect();
        let closure = self.object_manager.alloc_closure(function);
        // Rooted before the capture loop: wiring may allocate upvalues.
        self.push(make_object_value(closure));
        let upvalue_count = unsafe { (*function).upvalue_count };
        for i in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let base = self.frame().stack_base;
                self.capture_upvalue(base + index)
            } else {
                let enclosing = self.frame().closure;
                unsafe { (&(*enclosing).upvalues)[index] }
            };
            unsafe { (&mut (*closure).upvalues)[i] = upvalue };
        }
        true
    }

    fn op_get_field(&mut self, name: *mut ObjectString) -> bool {
        let object = self.peek(0);
        let result = if is_instance(&object) {
            let instance = unsafe { &*as_instance(&object) };
            if let Some(field) = instance.fields.get(name) {
                Some(field)
            } else if let Some(method) = unsafe { (*instance.class).methods.get(name) } {
                self.maybe_collect();
                let bound = self.object_manager.alloc_bound_method(object, method);
                Some(make_object_value(bound))
            } else {
                None
            }
        } else if is_module(&object) {
            unsafe { (*as_module(&object)).globals.get(name) }
        } else if let Some(class) = self.class_of(&object) {
            match unsafe { (*class).methods.get(name) } {
                Some(method) => {
                    self.maybe_collect();
                    let bound = self.object_manager.alloc_bound_method(object, method);
                    Some(make_object_value(bound))
                }
                None => None,
            }
        } else {
            None
        };
        match result {
            Some(value) => {
                self.pop();
                self.push(value);
                true
            }
            None => self.rt_raise(
                "NameException",
                format!(
                    "{} has no attribute '{}'.",
                    value_to_string(&object),
                    unsafe { (*name).as_str() }
                ),
            ),
        }
    }

    fn op_set_field(&mut self, name: *mut ObjectString) -> bool {
        let value = self.peek(0);
        let object = self.peek(1);
        if is_instance(&object) {
            unsafe { (*as_instance(&object)).fields.insert(name, value) };
        } else if is_module(&object) {
            unsafe { (*as_module(&object)).globals.insert(name, value) };
        } else {
            return self.rt_raise(
                "TypeException",
                format!("Can't set attribute on {}.", value_to_string(&object)),
            );
        }
        self.pop();
        self.pop();
        self.push(value);
        true
    }

    fn index_of(&mut self, container_len: usize, index: &Value) -> Result<usize, ()> {
        if !is_integer(index) {
            return Err(());
        }
        let raw = as_number(index);
        if raw < 0.0 || raw >= container_len as f64 {
            return Err(());
        }
        Ok(raw as usize)
    }

    fn get_index(&mut self) -> bool {
        let index = self.peek(0);
        let object = self.peek(1);
        if is_list(&object) {
            let len = unsafe { (*as_list(&object)).len() };
            return match self.index_of(len, &index) {
                Ok(i) => {
                    let element = unsafe { (&(*as_list(&object)).elements)[i] };
                    self.pop();
                    self.pop();
                    self.push(element);
                    true
                }
                Err(()) => self.index_error(&index, len),
            };
        }
        if is_tuple(&object) {
            let len = unsafe { (*as_tuple(&object)).len() };
            return match self.index_of(len, &index) {
                Ok(i) => {
                    let element = unsafe { (*as_tuple(&object)).elements[i] };
                    self.pop();
                    self.pop();
                    self.push(element);
                    true
                }
                Err(()) => self.index_error(&index, len),
            };
        }
        if is_string(&object) {
            let content = unsafe { (*as_string(&object)).content.clone() };
            let len = content.chars().count();
            return match self.index_of(len, &index) {
                Ok(i) => {
                    let ch: String = content.chars().skip(i).take(1).collect();
                    let string = self.intern_string(&ch);
                    self.pop();
                    self.pop();
                    self.push(make_object_value(string));
                    true
                }
                Err(()) => self.index_error(&index, len),
            };
        }
        if is_instance(&object) {
            // Subscript dispatch: receiver and index are already laid out
            // as a method call with one argument.
            let name = self.intern_string("__get__");
            return self.invoke(name, 1);
        }
        self.rt_raise(
            "TypeException",
            format!("{} is not subscriptable.", value_to_string(&object)),
        )
    }

    fn index_error(&mut self, index: &Value, len: usize) -> bool {
        if !is_integer(index) {
            return self.rt_raise(
                "TypeException",
                format!("Index must be an integer, got {}.", value_to_string(index)),
            );
        }
        self.rt_raise(
            "IndexOutOfBoundException",
            format!("Index {} out of bounds for length {}.", value_to_string(index), len),
        )
    }

    fn set_index(&mut self) -> bool {
        let value = self.peek(0);
        let index = self.peek(1);
        let object = self.peek(2);
        if is_list(&object) {
            let len = unsafe { (*as_list(&object)).len() };
            return match self.index_of(len, &index) {
                Ok(i) => {
                    unsafe { (&mut (*as_list(&object)).elements)[i] = value };
                    self.pop();
                    self.pop();
                    self.pop();
                    self.push(value);
                    true
                }
                Err(()) => self.index_error(&index, len),
            };
        }
        if is_instance(&object) {
            let name = self.intern_string("__set__");
            return self.invoke(name, 2);
        }
        self.rt_raise(
            "TypeException",
            format!("{} does not support item assignment.", value_to_string(&object)),
        )
    }

    fn op_equal(&mut self) -> bool {
        let b = self.peek(0);
        let a = self.peek(1);
        if is_instance(&a) {
            let eq_name = self.intern_string("__eq__");
            let method = unsafe { (*(*as_instance(&a)).class).methods.get(eq_name) };
            if let Some(method) = method {
                // [a, b] is already receiver + one argument.
                return self.call_method_value(method, 1);
            }
        }
        self.pop();
        self.pop();
        self.push(make_bool_value(values_equal(&a, &b)));
        true
    }

    fn numeric_compare(&mut self, op: OpCode) -> bool {
        let b = self.peek(0);
        let a = self.peek(1);
        if !is_number(&a) || !is_number(&b) {
            return self.rt_raise(
                "TypeException",
                "Comparison operands must be numbers.".to_string(),
            );
        }
        let (x, y) = (as_number(&a), as_number(&b));
        let result = match op {
            OpCode::Greater => x > y,
            OpCode::GreaterEqual => x >= y,
            OpCode::Less => x < y,
            OpCode::LessEqual => x <= y,
            _ => unreachable!("not a comparison opcode"),
        };
        self.pop();
        self.pop();
        self.push(make_bool_value(result));
        true
    }

    fn arithmetic(&mut self, op: OpCode) -> bool {
        let b = self.peek(0);
        let a = self.peek(1);
        if is_number(&a) && is_number(&b) {
            let (x, y) = (as_number(&a), as_number(&b));
            let result = match op {
                OpCode::Add => x + y,
                OpCode::Subtract => x - y,
                OpCode::Multiply => x * y,
                OpCode::Divide => {
                    if y == 0.0 {
                        return self.rt_raise(
                            "ArithmeticException",
                            "Division by zero.".to_string(),
                        );
                    }
                    x / y
                }
                OpCode::Modulo => {
                    if y == 0.0 {
                        return self.rt_raise(
                            "ArithmeticException",
                            "Modulo by zero.".to_string(),
                        );
                    }
                    x % y
                }
                OpCode::Power => x.powf(y),
                _ => unreachable!("not an arithmetic opcode"),
            };
            self.pop();
            self.pop();
            self.push(make_number_value(result));
            return true;
        }
        if op == OpCode::Add && is_string(&a) && is_string(&b) {
            let combined = unsafe {
                let left = &(*as_string(&a)).content;
                let right = &(*as_string(&b)).content;
                let mut combined = String::with_capacity(left.len() + right.len());
                combined.push_str(left);
                combined.push_str(right);
                combined
            };
            let string = self.intern_string(&combined);
            self.pop();
            self.pop();
            self.push(make_object_value(string));
            return true;
        }
        // Non-number operands route to the overloadable operator method on
        // the left operand's class.
        if is_instance(&a) {
            let method_name = match op {
                OpCode::Add => "__add__",
                OpCode::Subtract => "__sub__",
                OpCode::Multiply => "__mul__",
                OpCode::Divide => "__div__",
                OpCode::Modulo => "__mod__",
                OpCode::Power => "__pow__",
                _ => unreachable!("not an arithmetic opcode"),
            };
            let name = self.intern_string(method_name);
            let method = unsafe { (*(*as_instance(&a)).class).methods.get(name) };
            if let Some(method) = method {
                return self.call_method_value(method, 1);
            }
        }
        self.rt_raise(
            "TypeException",
            format!(
                "Unsupported operand types: {} and {}.",
                value_to_string(&a),
                value_to_string(&b)
            ),
        )
    }

    fn op_negate(&mut self) -> bool {
        let value = self.peek(0);
        if is_number(&value) {
            self.pop();
            self.push(make_number_value(-as_number(&value)));
            return true;
        }
        if is_instance(&value) {
            let name = self.intern_string("__neg__");
            let method = unsafe { (*(*as_instance(&value)).class).methods.get(name) };
            if let Some(method) = method {
                return self.call_method_value(method, 0);
            }
        }
        self.rt_raise(
            "TypeException",
            format!("Can't negate {}.", value_to_string(&value)),
        )
    }

    fn op_length(&mut self) -> bool {
        let value = self.peek(0);
        let length = if is_string(&value) {
            Some(unsafe { (*as_string(&value)).content.chars().count() } as f64)
        } else if is_list(&value) {
            Some(unsafe { (*as_list(&value)).len() } as f64)
        } else if is_tuple(&value) {
            Some(unsafe { (*as_tuple(&value)).len() } as f64)
        } else if is_range(&value) {
            let range = unsafe { &*as_range(&value) };
            let count = ((range.stop - range.start) / range.step).ceil();
            Some(count.max(0.0))
        } else {
            None
        };
        if let Some(length) = length {
            self.pop();
            self.push(make_number_value(length));
            return true;
        }
        if is_instance(&value) {
            let name = self.intern_string("__len__");
            let method = unsafe { (*(*as_instance(&value)).class).methods.get(name) };
            if let Some(method) = method {
                return self.call_method_value(method, 0);
            }
        }
        self.rt_raise(
            "TypeException",
            format!("{} has no length.", value_to_string(&value)),
        )
    }

    fn op_is(&mut self) -> bool {
        let class_value = self.peek(0);
        if !is_class(&class_value) {
            return self.rt_raise(
                "TypeException",
                "Right operand of 'is' must be a class.".to_string(),
            );
        }
        let value = self.peek(1);
        let class = as_class(&class_value);
        let result = match self.class_of(&value) {
            Some(value_class) => unsafe { (*value_class).is_subclass_of(class) },
            None => false,
        };
        self.pop();
        self.pop();
        self.push(make_bool_value(result));
        true
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn trace_instruction(vm: &VM) {
        if vm.frames.is_empty() {
            return;
        }
        eprint!("{: >10}", "");
        for slot in &vm.stack {
            eprint!(" [ {} ]", value_to_string(slot));
        }
        eprintln!();
        let frame = vm.frames.last().unwrap();
        let function = frame.function();
        let chunk = unsafe { &(*function).chunk };
        let (text, _) = debug::disassemble_instruction(chunk, frame.ip);
        eprintln!("{}", text);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::VM;

    pub fn trace_instruction(_vm: &VM) {}
}
