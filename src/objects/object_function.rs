use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectKind};
use crate::objects::object_module::ObjectModule;
use crate::objects::object_string::ObjectString;

/// A compiled function prototype. The chunk is immutable once the compiler
/// hands the function over to the object manager.
#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub arity: u8,
    pub vararg: bool,
    pub upvalue_count: usize,
    /// Heap string, null while the compiler is still wiring the function.
    pub name: *mut ObjectString,
    /// Owning module, null only for the short window before registration.
    pub module: *mut ObjectModule,
    pub chunk: Chunk,
    /// Statically computed operand-stack high-water mark, used to reserve
    /// value-stack capacity once on frame entry.
    pub max_stack: usize,
}

impl ObjectFunction {
    pub fn new(arity: u8) -> Box<ObjectFunction> {
        Box::new(ObjectFunction {
            object: Object::new(ObjectKind::Function),
            arity,
            vararg: false,
            upvalue_count: 0,
            name: std::ptr::null_mut(),
            module: std::ptr::null_mut(),
            chunk: Chunk::new(),
            max_stack: 0,
        })
    }

    pub fn name_str(&self) -> &str {
        if self.name.is_null() {
            "<script>"
        } else {
            unsafe { (*self.name).as_str() }
        }
    }
}
