use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_upvalue::ObjectUpvalue;

/// A callable: function prototype plus its captured upvalues. The upvalue
/// vector has fixed length `function.upvalue_count`, wired by MAKE_CLOSURE.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction) -> Box<ObjectClosure> {
        let upvalue_count = unsafe { (*function).upvalue_count };
        Box::new(ObjectClosure {
            object: Object::new(ObjectKind::Closure),
            function,
            upvalues: vec![std::ptr::null_mut(); upvalue_count],
        })
    }
}
