use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_class::ObjectClass;
use crate::table::Table;

/// An object instance: its class plus a field table. Fields shadow methods
/// during attribute lookup.
#[repr(C)]
pub struct ObjectInstance {
    pub object: Object,
    pub class: *mut ObjectClass,
    pub fields: Table,
}

impl ObjectInstance {
    pub fn new(class: *mut ObjectClass) -> Box<ObjectInstance> {
        Box::new(ObjectInstance {
            object: Object::new(ObjectKind::Instance),
            class,
            fields: Table::new(),
        })
    }
}
