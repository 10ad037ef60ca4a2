use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_string::ObjectString;
use crate::table::Table;

/// A named global namespace produced by evaluating a source file. Modules
/// are values: they live in the VM's module registry and scripts can read
/// and write their globals through attribute syntax.
#[repr(C)]
pub struct ObjectModule {
    pub object: Object,
    pub name: *mut ObjectString,
    pub globals: Table,
}

impl ObjectModule {
    pub fn new(name: *mut ObjectString) -> Box<ObjectModule> {
        Box::new(ObjectModule {
            object: Object::new(ObjectKind::Module),
            name,
            globals: Table::new(),
        })
    }

    pub fn name_str(&self) -> &str {
        unsafe { (*self.name).as_str() }
    }
}
