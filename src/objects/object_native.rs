use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_module::ObjectModule;
use crate::objects::object_string::ObjectString;
use crate::vm::VM;

/// A host function exposed to scripts. The native sees its receiver at
/// relative slot 0 (null for plain functions) and arguments from slot 1.
/// It returns true with one result on top of the stack, or false with an
/// exception instance on top.
pub type NativeFn = fn(&mut VM) -> bool;

#[repr(C)]
pub struct ObjectNative {
    pub object: Object,
    pub name: *mut ObjectString,
    pub arity: u8,
    pub vararg: bool,
    pub function: NativeFn,
    pub module: *mut ObjectModule,
}

impl ObjectNative {
    pub fn new(name: *mut ObjectString, arity: u8, vararg: bool, function: NativeFn) -> Box<ObjectNative> {
        Box::new(ObjectNative {
            object: Object::new(ObjectKind::Native),
            name,
            arity,
            vararg,
            function,
            module: std::ptr::null_mut(),
        })
    }

    pub fn name_str(&self) -> &str {
        if self.name.is_null() {
            "<native>"
        } else {
            unsafe { (*self.name).as_str() }
        }
    }
}
