//! Stop-the-world mark-sweep collection.
//!
//! Mark pushes roots onto a grey worklist, then drains it setting mark bits
//! and enqueueing children. The intern table is weak: it is pruned of
//! unmarked keys before the sweep frees them. Sweep itself lives on the
//! object manager, which owns the intrusive object list.

use crate::call_frame::CallFrame;
use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_list::ObjectList;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_native::ObjectNative;
use crate::objects::object_tuple::ObjectTuple;
use crate::objects::object_upvalue::{ObjectUpvalue, UpvalueState};
use crate::table::Table;
use crate::value::{as_object, is_object, Value};

// Lightweight tracing macro (only active with the gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => {}; }
pub(crate) use gc_trace;

/// Aggregated GC statistics; live byte totals stay with the object manager.
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

pub struct GarbageCollector {
    gray_worklist: Vec<*mut Object>,
    stats: GCStats,
}

impl GarbageCollector {
    pub fn new() -> GarbageCollector {
        GarbageCollector {
            gray_worklist: Vec::new(),
            stats: GCStats::default(),
        }
    }

    pub fn mark_object(&mut self, object: *mut Object) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).marked {
                return;
            }
            (*object).marked = true;
        }
        gc_trace!("mark enqueue gray ptr={:p}", object);
        self.gray_worklist.push(object);
    }

    pub fn mark_value(&mut self, value: &Value) {
        if is_object(value) {
            self.mark_object(as_object(value));
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key as *mut Object);
            self.mark_value(&value);
        }
    }

    /// Mark everything reachable from the VM's roots: the live stack
    /// prefix, every frame's closure, open upvalues, the module registry,
    /// and values pinned by the embedding API.
    pub fn mark_roots(
        &mut self,
        stack: &[Value],
        frames: &[CallFrame],
        open_upvalues: &[*mut ObjectUpvalue],
        modules: &Table,
        temp_roots: &[Value],
    ) {
        for value in stack {
            self.mark_value(value);
        }
        // A bound-method call replaces the callee slot with the receiver,
        // so frame closures are not always visible through the stack.
        for frame in frames {
            self.mark_object(frame.closure as *mut Object);
        }
        for &upvalue in open_upvalues {
            self.mark_object(upvalue as *mut Object);
        }
        self.mark_table(modules);
        for value in temp_roots {
            self.mark_value(value);
        }
    }

    /// Drain the grey worklist, marking children of each popped object.
    pub fn trace_references(&mut self) {
        while let Some(object) = self.gray_worklist.pop() {
            gc_trace!("trace gray -> black ptr={:p}", object);
            unsafe { self.blacken_object(object) };
        }
    }

    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).kind {
            // Strings and ranges have no children.
            ObjectKind::String | ObjectKind::Range => {}
            ObjectKind::Function => {
                let function = &*(object as *mut ObjectFunction);
                self.mark_object(function.name as *mut Object);
                self.mark_object(function.module as *mut Object);
                for constant in function.chunk.iter_constants() {
                    self.mark_value(constant);
                }
            }
            ObjectKind::Closure => {
                let closure = &*(object as *mut ObjectClosure);
                self.mark_object(closure.function as *mut Object);
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue as *mut Object);
                }
            }
            ObjectKind::Upvalue => {
                let upvalue = &*(object as *mut ObjectUpvalue);
                // An open upvalue's slot lives on the stack, which is a root.
                if let UpvalueState::Closed(value) = &upvalue.state {
                    self.mark_value(value);
                }
            }
            ObjectKind::Native => {
                let native = &*(object as *mut ObjectNative);
                self.mark_object(native.name as *mut Object);
                self.mark_object(native.module as *mut Object);
            }
            ObjectKind::Class => {
                let class = &*(object as *mut ObjectClass);
                self.mark_object(class.name as *mut Object);
                self.mark_object(class.superclass as *mut Object);
                self.mark_table(&class.methods);
            }
            ObjectKind::Instance => {
                let instance = &*(object as *mut ObjectInstance);
                self.mark_object(instance.class as *mut Object);
                self.mark_table(&instance.fields);
            }
            ObjectKind::Module => {
                let module = &*(object as *mut ObjectModule);
                self.mark_object(module.name as *mut Object);
                self.mark_table(&module.globals);
            }
            ObjectKind::List => {
                let list = &*(object as *mut ObjectList);
                for element in &list.elements {
                    self.mark_value(element);
                }
            }
            ObjectKind::Tuple => {
                let tuple = &*(object as *mut ObjectTuple);
                for element in tuple.elements.iter() {
                    self.mark_value(element);
                }
            }
            ObjectKind::BoundMethod => {
                let bound = &*(object as *mut ObjectBoundMethod);
                self.mark_value(&bound.receiver);
                self.mark_value(&bound.method);
            }
        }
    }

    /// Record a completed cycle (the VM knows bytes before/after and the
    /// next trigger).
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_manager::ObjectManager;
    use crate::value::{make_null_value, make_object_value, Value};

    #[test]
    fn collects_unreachable_objects() {
        let mut manager = ObjectManager::new();
        let keep = manager.alloc_string("keep");
        manager.alloc_string("drop1");
        manager.alloc_string("drop2");

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(keep)];
        let modules = Table::new();
        gc.mark_roots(&stack, &[], &[], &modules, &[]);
        gc.trace_references();
        let freed = manager.sweep();
        assert!(freed > 0, "expected bytes to be freed");
        assert_eq!(manager.object_count(), 1);
    }

    #[test]
    fn preserves_closure_function_and_upvalues() {
        let mut manager = ObjectManager::new();
        let name = manager.alloc_string("f");
        let mut function = crate::objects::object_function::ObjectFunction::new(0);
        function.name = name;
        function.upvalue_count = 1;
        let function = manager.adopt(function);
        let upvalue = manager.alloc_upvalue(0);
        let closure = manager.alloc_closure(function);
        unsafe { (&mut (*closure).upvalues)[0] = upvalue };
        manager.alloc_string("garbage");

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(closure)];
        let modules = Table::new();
        gc.mark_roots(&stack, &[], &[], &modules, &[]);
        gc.trace_references();
        manager.sweep();
        // closure + function + name + upvalue survive; "garbage" does not
        assert_eq!(manager.object_count(), 4);
    }

    #[test]
    fn closed_upvalue_keeps_captured_value_alive() {
        let mut manager = ObjectManager::new();
        let captured = manager.alloc_string("captured");
        let upvalue = manager.alloc_upvalue(0);
        unsafe { (*upvalue).close(make_object_value(captured)) };

        let mut gc = GarbageCollector::new();
        let stack: [Value; 0] = [];
        let modules = Table::new();
        gc.mark_roots(&stack, &[], &[upvalue], &modules, &[]);
        gc.trace_references();
        manager.sweep();
        assert_eq!(manager.object_count(), 2);
    }

    #[test]
    fn weak_intern_table_is_pruned_before_sweep() {
        let mut manager = ObjectManager::new();
        let reachable = manager.alloc_string("reachable");
        let unreachable = manager.alloc_string("unreachable");
        let mut interned = Table::new();
        interned.insert(reachable, make_null_value());
        interned.insert(unreachable, make_null_value());

        let mut gc = GarbageCollector::new();
        let stack = [make_object_value(reachable)];
        let modules = Table::new();
        gc.mark_roots(&stack, &[], &[], &modules, &[]);
        gc.trace_references();
        interned.remove_unmarked_keys();
        manager.sweep();
        assert_eq!(interned.len(), 1);
        assert_eq!(manager.object_count(), 1);
    }

    #[test]
    fn stats_record_cycles() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().total_freed_bytes, 400);
        assert_eq!(gc.stats().last_next_trigger_bytes, 1200);
    }
}
