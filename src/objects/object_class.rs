use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_string::ObjectString;
use crate::table::Table;
use crate::value::Value;

/// A class: name, optional superclass, and its method table. Inheritance
/// copies the superclass methods into the subclass table when the subclass
/// is defined, so method lookup is always a single hash probe.
#[repr(C)]
pub struct ObjectClass {
    pub object: Object,
    pub name: *mut ObjectString,
    pub superclass: *mut ObjectClass,
    pub methods: Table,
}

impl ObjectClass {
    pub fn new(name: *mut ObjectString) -> Box<ObjectClass> {
        Box::new(ObjectClass {
            object: Object::new(ObjectKind::Class),
            name,
            superclass: std::ptr::null_mut(),
            methods: Table::new(),
        })
    }

    pub fn name_str(&self) -> &str {
        unsafe { (*self.name).as_str() }
    }

    pub fn method(&self, name: *mut ObjectString) -> Option<Value> {
        self.methods.get(name)
    }

    /// Is `self` the same class as `other` or one of its subclasses?
    pub fn is_subclass_of(&self, other: *const ObjectClass) -> bool {
        let mut current = self as *const ObjectClass;
        while !current.is_null() {
            if current == other {
                return true;
            }
            current = unsafe { (*current).superclass };
        }
        false
    }
}
