//! Shared heap-object header.
//!
//! Every heap object embeds an `Object` as its first field (`#[repr(C)]`),
//! so any `*mut ObjectXxx` can be viewed as a `*mut Object` and back. The
//! header carries the kind tag, the GC mark bit, and the intrusive link of
//! the allocator's object list.

use strum_macros::Display;

use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_list::ObjectList;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_native::ObjectNative;
use crate::objects::object_range::ObjectRange;
use crate::objects::object_string::ObjectString;
use crate::objects::object_tuple::ObjectTuple;
use crate::objects::object_upvalue::ObjectUpvalue;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ObjectKind {
    String,
    Function,
    Closure,
    Upvalue,
    Native,
    Class,
    Instance,
    Module,
    List,
    Tuple,
    Range,
    BoundMethod,
}

#[repr(C)]
pub struct Object {
    pub kind: ObjectKind,
    pub marked: bool,
    pub next: *mut Object,
}

impl Object {
    pub fn new(kind: ObjectKind) -> Object {
        Object {
            kind,
            marked: false,
            next: std::ptr::null_mut(),
        }
    }
}

/// Bytes owned by this object: the struct itself plus any backing storage.
/// Recomputed during sweep, so growth of lists and tables is accounted.
///
/// # Safety
/// `object` must point to a live heap object allocated by the manager.
pub unsafe fn deep_size(object: *mut Object) -> usize {
    match (*object).kind {
        ObjectKind::String => {
            let string = object as *mut ObjectString;
            std::mem::size_of::<ObjectString>() + (*string).content.capacity()
        }
        ObjectKind::Function => {
            let function = object as *mut ObjectFunction;
            std::mem::size_of::<ObjectFunction>() + (*function).chunk.heap_size()
        }
        ObjectKind::Closure => {
            let closure = object as *mut ObjectClosure;
            std::mem::size_of::<ObjectClosure>()
                + (*closure).upvalues.capacity() * std::mem::size_of::<*mut ObjectUpvalue>()
        }
        ObjectKind::Upvalue => std::mem::size_of::<ObjectUpvalue>(),
        ObjectKind::Native => std::mem::size_of::<ObjectNative>(),
        ObjectKind::Class => {
            let class = object as *mut ObjectClass;
            std::mem::size_of::<ObjectClass>() + (*class).methods.heap_size()
        }
        ObjectKind::Instance => {
            let instance = object as *mut ObjectInstance;
            std::mem::size_of::<ObjectInstance>() + (*instance).fields.heap_size()
        }
        ObjectKind::Module => {
            let module = object as *mut ObjectModule;
            std::mem::size_of::<ObjectModule>() + (*module).globals.heap_size()
        }
        ObjectKind::List => {
            let list = object as *mut ObjectList;
            std::mem::size_of::<ObjectList>()
                + (*list).elements.capacity() * std::mem::size_of::<crate::value::Value>()
        }
        ObjectKind::Tuple => {
            let tuple = object as *mut ObjectTuple;
            std::mem::size_of::<ObjectTuple>()
                + (&(*tuple).elements).len() * std::mem::size_of::<crate::value::Value>()
        }
        ObjectKind::Range => std::mem::size_of::<ObjectRange>(),
        ObjectKind::BoundMethod => std::mem::size_of::<ObjectBoundMethod>(),
    }
}

/// Reconstruct the concrete Box for `object` and drop it.
///
/// # Safety
/// `object` must have been produced by `Box::into_raw` of the matching
/// concrete type and must not be referenced afterwards.
pub unsafe fn free_object(object: *mut Object) {
    debug_feature::trace_drop(object);
    match (*object).kind {
        ObjectKind::String => drop(Box::from_raw(object as *mut ObjectString)),
        ObjectKind::Function => drop(Box::from_raw(object as *mut ObjectFunction)),
        ObjectKind::Closure => drop(Box::from_raw(object as *mut ObjectClosure)),
        ObjectKind::Upvalue => drop(Box::from_raw(object as *mut ObjectUpvalue)),
        ObjectKind::Native => drop(Box::from_raw(object as *mut ObjectNative)),
        ObjectKind::Class => drop(Box::from_raw(object as *mut ObjectClass)),
        ObjectKind::Instance => drop(Box::from_raw(object as *mut ObjectInstance)),
        ObjectKind::Module => drop(Box::from_raw(object as *mut ObjectModule)),
        ObjectKind::List => drop(Box::from_raw(object as *mut ObjectList)),
        ObjectKind::Tuple => drop(Box::from_raw(object as *mut ObjectTuple)),
        ObjectKind::Range => drop(Box::from_raw(object as *mut ObjectRange)),
        ObjectKind::BoundMethod => drop(Box::from_raw(object as *mut ObjectBoundMethod)),
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::*;

    pub unsafe fn trace_drop(object: *mut Object) {
        eprintln!("free object ptr={:p} kind={}", object, (*object).kind);
    }
}

#[cfg(not(feature = "debug_trace_object"))]
mod debug_feature {
    use super::Object;

    pub unsafe fn trace_drop(_object: *mut Object) {}
}
