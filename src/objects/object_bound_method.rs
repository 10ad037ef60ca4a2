use crate::objects::object::{Object, ObjectKind};
use crate::value::{is_closure, is_native, as_closure, as_native, Value};

/// A receiver paired with a method (closure or native), produced by
/// attribute lookup on an instance when the resolved name is a method.
#[repr(C)]
pub struct ObjectBoundMethod {
    pub object: Object,
    pub receiver: Value,
    pub method: Value,
}

impl ObjectBoundMethod {
    pub fn new(receiver: Value, method: Value) -> Box<ObjectBoundMethod> {
        debug_assert!(is_closure(&method) || is_native(&method));
        Box::new(ObjectBoundMethod {
            object: Object::new(ObjectKind::BoundMethod),
            receiver,
            method,
        })
    }

    pub fn method_name(&self) -> &str {
        unsafe {
            if is_closure(&self.method) {
                (*(*as_closure(&self.method)).function).name_str()
            } else {
                (*as_native(&self.method)).name_str()
            }
        }
    }
}
