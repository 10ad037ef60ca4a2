use crate::objects::object::{Object, ObjectKind};
use crate::value::Value;

/// Dynamically sized value array.
#[repr(C)]
pub struct ObjectList {
    pub object: Object,
    pub elements: Vec<Value>,
}

impl ObjectList {
    pub fn new() -> Box<ObjectList> {
        Box::new(ObjectList {
            object: Object::new(ObjectKind::List),
            elements: Vec::new(),
        })
    }

    pub fn with_elements(elements: Vec<Value>) -> Box<ObjectList> {
        Box::new(ObjectList {
            object: Object::new(ObjectKind::List),
            elements,
        })
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
