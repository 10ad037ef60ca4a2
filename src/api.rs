//! The host-facing stack-slot API.
//!
//! Slots index the value stack: non-negative slots are relative to the
//! running native's window (receiver at 0, arguments from 1), negative
//! slots count back from the top. Checked accessors leave a TypeException
//! on the stack and return None, so natives can propagate failure by
//! returning false.

use crate::objects::object_module::ObjectModule;
use crate::objects::object_native::NativeFn;
use crate::value::*;
use crate::vm::{EvalResult, VM};

/// One entry of a native registry: hosts hand the VM a slice of these to
/// expose functions and methods to scripts.
pub enum NativeReg {
    Function {
        name: &'static str,
        arity: u8,
        vararg: bool,
        fun: NativeFn,
    },
    Method {
        class: &'static str,
        name: &'static str,
        arity: u8,
        vararg: bool,
        fun: NativeFn,
    },
}

impl VM {
    fn slot_index(&self, slot: i32) -> usize {
        if slot < 0 {
            (self.stack.len() as i64 + slot as i64) as usize
        } else {
            self.api_base + slot as usize
        }
    }

    /// Read a slot without popping.
    pub fn get_slot(&self, slot: i32) -> Value {
        self.stack[self.slot_index(slot)]
    }

    pub fn set_slot(&mut self, slot: i32, value: Value) {
        let index = self.slot_index(slot);
        self.stack[index] = value;
    }

    /// Number of arguments the running native was called with.
    pub fn arg_count(&self) -> usize {
        self.api_argc
    }

    // ---- pushing host values ----

    pub fn push_number(&mut self, number: f64) {
        self.push(make_number_value(number));
    }

    pub fn push_boolean(&mut self, boolean: bool) {
        self.push(make_bool_value(boolean));
    }

    pub fn push_null(&mut self) {
        self.push(make_null_value());
    }

    pub fn push_handle(&mut self, handle: *mut std::ffi::c_void) {
        self.push(make_handle_value(handle));
    }

    /// Interns under the threshold, like every other string in the VM.
    pub fn push_string(&mut self, content: &str) {
        let string = self.intern_string(content);
        self.push(make_object_value(string));
    }

    pub fn push_list(&mut self) {
        let list = self.alloc_list(Vec::new());
        self.push(make_object_value(list));
    }

    /// Pop `size` values and push a tuple of them (in stack order).
    pub fn push_tuple(&mut self, size: usize) {
        debug_assert!(self.stack.len() >= size);
        let start = self.stack.len() - size;
        let elements = self.stack[start..].to_vec();
        let tuple = self.alloc_tuple(elements);
        self.stack.truncate(start);
        self.push(make_object_value(tuple));
    }

    pub fn push_range(&mut self, start: f64, stop: f64, step: f64) {
        self.maybe_collect();
        let range = self.object_manager.alloc_range(start, stop, step);
        self.push(make_object_value(range));
    }

    /// Push a copy of another slot.
    pub fn push_value(&mut self, slot: i32) {
        self.push(self.get_slot(slot));
    }

    // ---- type predicates ----

    pub fn is_number_at(&self, slot: i32) -> bool {
        is_number(&self.get_slot(slot))
    }

    pub fn is_integer_at(&self, slot: i32) -> bool {
        is_integer(&self.get_slot(slot))
    }

    pub fn is_boolean_at(&self, slot: i32) -> bool {
        is_bool(&self.get_slot(slot))
    }

    pub fn is_null_at(&self, slot: i32) -> bool {
        is_null(&self.get_slot(slot))
    }

    pub fn is_handle_at(&self, slot: i32) -> bool {
        is_handle(&self.get_slot(slot))
    }

    pub fn is_string_at(&self, slot: i32) -> bool {
        is_string(&self.get_slot(slot))
    }

    pub fn is_list_at(&self, slot: i32) -> bool {
        is_list(&self.get_slot(slot))
    }

    pub fn is_tuple_at(&self, slot: i32) -> bool {
        is_tuple(&self.get_slot(slot))
    }

    pub fn is_instance_at(&self, slot: i32) -> bool {
        is_instance(&self.get_slot(slot))
    }

    // ---- accessors ----

    pub fn get_number(&self, slot: i32) -> f64 {
        as_number(&self.get_slot(slot))
    }

    pub fn get_boolean(&self, slot: i32) -> bool {
        as_bool(&self.get_slot(slot))
    }

    pub fn get_handle(&self, slot: i32) -> *mut std::ffi::c_void {
        as_handle(&self.get_slot(slot))
    }

    /// Borrowed string bytes. The borrow ties to `&self`, but the owning
    /// slot must also stay on the stack for as long as the contents are
    /// used: the string is garbage collected once unreachable.
    pub fn get_string(&self, slot: i32) -> Option<&str> {
        let value = self.get_slot(slot);
        if is_string(&value) {
            Some(unsafe { (*as_string(&value)).as_str() })
        } else {
            None
        }
    }

    // ---- checked accessors (TypeException + sentinel on failure) ----

    pub fn check_number(&mut self, slot: i32, name: &str) -> Option<f64> {
        if self.is_number_at(slot) {
            Some(self.get_number(slot))
        } else {
            self.raise("TypeException", &format!("{} must be a number.", name));
            None
        }
    }

    pub fn check_integer(&mut self, slot: i32, name: &str) -> Option<f64> {
        if self.is_integer_at(slot) {
            Some(self.get_number(slot))
        } else {
            self.raise("TypeException", &format!("{} must be an integer.", name));
            None
        }
    }

    pub fn check_boolean(&mut self, slot: i32, name: &str) -> Option<bool> {
        if self.is_boolean_at(slot) {
            Some(self.get_boolean(slot))
        } else {
            self.raise("TypeException", &format!("{} must be a boolean.", name));
            None
        }
    }

    pub fn check_string(&mut self, slot: i32, name: &str) -> Option<String> {
        if self.is_string_at(slot) {
            Some(self.get_string(slot).unwrap_or_default().to_string())
        } else {
            self.raise("TypeException", &format!("{} must be a string.", name));
            None
        }
    }

    pub fn check_list(&mut self, slot: i32, name: &str) -> Option<*mut crate::objects::object_list::ObjectList> {
        let value = self.get_slot(slot);
        if is_list(&value) {
            Some(as_list(&value))
        } else {
            self.raise("TypeException", &format!("{} must be a list.", name));
            None
        }
    }

    /// Check that `slot` holds an integer in `[0, max)`, returning it as an
    /// index.
    pub fn check_index(&mut self, slot: i32, max: usize, name: &str) -> Option<usize> {
        let number = self.check_integer(slot, name)?;
        if number < 0.0 || number >= max as f64 {
            self.raise(
                "IndexOutOfBoundException",
                &format!("{} out of bounds: {}.", name, number_to_string(number)),
            );
            return None;
        }
        Some(number as usize)
    }

    // ---- exceptions ----

    /// Instantiate an exception of `cls` (NameException when the class
    /// cannot be found) and leave it on top of the stack. Natives signal
    /// the raise by returning false.
    pub fn raise(&mut self, cls: &str, message: &str) {
        let exc = self.make_exception(cls, message);
        self.push(exc);
    }

    // ---- re-entrant helpers ----

    /// Structural equality with `__eq__` dispatch: pops the two top values
    /// and pushes the result (or leaves the exception). False on raise.
    pub fn equals(&mut self) -> bool {
        let b = self.peek(0);
        let a = self.peek(1);
        if is_instance(&a) {
            let has_eq = unsafe {
                let class = (*as_instance(&a)).class;
                let name = self.intern_string("__eq__");
                (*class).methods.get(name).is_some()
            };
            if has_eq {
                return self.call_method("__eq__", 1) == EvalResult::Success;
            }
        }
        self.pop();
        self.pop();
        self.push_boolean(values_equal(&a, &b));
        true
    }

    /// Is the value at `slot` an instance of the class at `class_slot`?
    pub fn is_value(&mut self, slot: i32, class_slot: i32) -> bool {
        let class_value = self.get_slot(class_slot);
        if !is_class(&class_value) {
            return false;
        }
        let value = self.get_slot(slot);
        match self.class_of(&value) {
            Some(class) => unsafe { (*class).is_subclass_of(as_class(&class_value)) },
            None => false,
        }
    }

    /// Drive one step of the iterator protocol: calls
    /// `iterable.__iter__(res)` and stores the new iteration state back
    /// into `res_slot`. Ok(false) means the iteration is over; Err means an
    /// exception is on top of the stack.
    pub fn iter(&mut self, iterable_slot: i32, res_slot: i32) -> Result<bool, ()> {
        let iterable = self.get_slot(iterable_slot);
        let res = self.get_slot(res_slot);
        self.push(iterable);
        self.push(res);
        match self.call_method("__iter__", 1) {
            EvalResult::Success => {
                let state = self.pop();
                self.set_slot(res_slot, state);
                Ok(!is_falsey(&state))
            }
            _ => Err(()),
        }
    }

    /// Fetch the element for the current iteration state; leaves it on top
    /// of the stack. False means an exception is on top instead.
    pub fn inext(&mut self, iterable_slot: i32, res_slot: i32) -> bool {
        let iterable = self.get_slot(iterable_slot);
        let res = self.get_slot(res_slot);
        self.push(iterable);
        self.push(res);
        self.call_method("__next__", 1) == EvalResult::Success
    }

    // ---- fields and globals ----

    /// Push the field `name` of the value at `slot`; false leaves an
    /// exception instead.
    pub fn get_field(&mut self, slot: i32, name: &str) -> bool {
        let object = self.get_slot(slot);
        let name_string = self.intern_string(name);
        if is_instance(&object) {
            let instance = unsafe { &*as_instance(&object) };
            if let Some(field) = instance.fields.get(name_string) {
                self.push(field);
                return true;
            }
        } else if is_module(&object) {
            if let Some(value) = unsafe { (*as_module(&object)).globals.get(name_string) } {
                self.push(value);
                return true;
            }
        }
        self.raise(
            "NameException",
            &format!("{} has no attribute '{}'.", value_to_string(&object), name),
        );
        false
    }

    /// Set field `name` of the value at `slot` to the top of the stack (not
    /// popped).
    pub fn set_field(&mut self, slot: i32, name: &str) -> bool {
        let object = self.get_slot(slot);
        let value = self.peek(0);
        let name_string = self.intern_string(name);
        if is_instance(&object) {
            unsafe { (*as_instance(&object)).fields.insert(name_string, value) };
            true
        } else if is_module(&object) {
            unsafe { (*as_module(&object)).globals.insert(name_string, value) };
            true
        } else {
            self.raise(
                "TypeException",
                &format!("Can't set attribute on {}.", value_to_string(&object)),
            );
            false
        }
    }

    /// Push the global `name` of `module` (None = the current module).
    pub fn get_global(&mut self, module: Option<&str>, name: &str) -> bool {
        let module_ptr = match self.resolve_module(module) {
            Some(module_ptr) => module_ptr,
            None => {
                self.raise(
                    "ImportException",
                    &format!("Module '{}' is not loaded.", module.unwrap_or("?")),
                );
                return false;
            }
        };
        let name_string = self.intern_string(name);
        match unsafe { (*module_ptr).globals.get(name_string) } {
            Some(value) => {
                self.push(value);
                true
            }
            None => {
                self.raise(
                    "NameException",
                    &format!("Name '{}' is not defined.", name),
                );
                false
            }
        }
    }

    /// Set the global `name` of `module` to the top of the stack (not
    /// popped).
    pub fn set_global(&mut self, module: Option<&str>, name: &str) -> bool {
        let module_ptr = match self.resolve_module(module) {
            Some(module_ptr) => module_ptr,
            None => {
                self.raise(
                    "ImportException",
                    &format!("Module '{}' is not loaded.", module.unwrap_or("?")),
                );
                return false;
            }
        };
        let value = self.peek(0);
        let name_string = self.intern_string(name);
        unsafe { (*module_ptr).globals.insert(name_string, value) };
        true
    }

    fn resolve_module(&mut self, module: Option<&str>) -> Option<*mut ObjectModule> {
        match module {
            None => Some(self.current_module()),
            Some(name) => {
                let name_string = self.intern_string(name);
                self.modules.get(name_string).map(|value| as_module(&value))
            }
        }
    }

    // ---- list and tuple accessors ----

    /// Append the top of the stack to the list at `slot` (value popped).
    pub fn list_append(&mut self, slot: i32) {
        let list = self.get_slot(slot);
        debug_assert!(is_list(&list));
        let value = self.pop();
        unsafe { (*as_list(&list)).elements.push(value) };
    }

    pub fn list_insert(&mut self, index: usize, slot: i32) {
        let list = self.get_slot(slot);
        debug_assert!(is_list(&list));
        let value = self.pop();
        unsafe { (*as_list(&list)).elements.insert(index, value) };
    }

    pub fn list_remove(&mut self, index: usize, slot: i32) {
        let list = self.get_slot(slot);
        debug_assert!(is_list(&list));
        unsafe { (*as_list(&list)).elements.remove(index) };
    }

    pub fn list_len(&self, slot: i32) -> usize {
        let list = self.get_slot(slot);
        debug_assert!(is_list(&list));
        unsafe { (*as_list(&list)).len() }
    }

    /// Push element `index` of the list at `slot` (no bounds check; use
    /// `check_index` first).
    pub fn list_get(&mut self, index: usize, slot: i32) {
        let list = self.get_slot(slot);
        debug_assert!(is_list(&list));
        let element = unsafe { (&(*as_list(&list)).elements)[index] };
        self.push(element);
    }

    pub fn tuple_len(&self, slot: i32) -> usize {
        let tuple = self.get_slot(slot);
        debug_assert!(is_tuple(&tuple));
        unsafe { (*as_tuple(&tuple)).len() }
    }

    pub fn tuple_get(&mut self, index: usize, slot: i32) {
        let tuple = self.get_slot(slot);
        debug_assert!(is_tuple(&tuple));
        let element = unsafe { (*as_tuple(&tuple)).elements[index] };
        self.push(element);
    }

    // ---- native registration ----

    /// Register a slice of native records into `module_name` (created and
    /// core-seeded if needed). Method records attach to classes already
    /// defined in that module.
    pub fn register_natives(&mut self, module_name: &str, regs: &[NativeReg]) {
        let saved = self.object_manager.gc_disabled();
        self.object_manager.gc_disable(true);
        let module = self.get_or_create_module(module_name);
        for reg in regs {
            match reg {
                NativeReg::Function {
                    name,
                    arity,
                    vararg,
                    fun,
                } => {
                    self.define_native(module, name, *arity, *vararg, *fun);
                }
                NativeReg::Method {
                    class,
                    name,
                    arity,
                    vararg,
                    fun,
                } => {
                    let class_string = self.intern_string(class);
                    let class_value = unsafe { (*module).globals.get(class_string) };
                    let class_value = match class_value {
                        Some(value) if is_class(&value) => value,
                        _ => panic!("native method target class {} not defined", class),
                    };
                    let name_string = self.intern_string(name);
                    let native =
                        self.object_manager
                            .alloc_native(name_string, *arity, *vararg, *fun);
                    unsafe {
                        (*native).module = module;
                        (*as_class(&class_value))
                            .methods
                            .insert(name_string, make_object_value(native));
                    }
                }
            }
        }
        self.object_manager.gc_disable(saved);
    }

    pub(crate) fn define_native(
        &mut self,
        module: *mut ObjectModule,
        name: &str,
        arity: u8,
        vararg: bool,
        fun: NativeFn,
    ) {
        let saved = self.object_manager.gc_disabled();
        self.object_manager.gc_disable(true);
        let name_string = self.intern_string(name);
        let native = self.object_manager.alloc_native(name_string, arity, vararg, fun);
        unsafe {
            (*native).module = module;
            (*module).globals.insert(name_string, make_object_value(native));
        }
        self.object_manager.gc_disable(saved);
    }
}
