//! The uniform tagged value cell.
//!
//! A `Value` is a 16-byte (tag + payload) copyable cell. Tag tests and
//! payload reads are O(1); objects are compared by pointer identity except
//! for strings, which fall back to byte equality when not interned.

use crate::objects::object::{Object, ObjectKind};
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Number,
    Handle,
    Object,
}

#[derive(Clone, Copy)]
pub union ValueUnion {
    pub boolean: bool,
    pub number: f64,
    pub handle: *mut std::ffi::c_void,
    pub object: *mut Object,
}

#[derive(Clone, Copy)]
pub struct Value {
    pub value_type: ValueType,
    pub value_as: ValueUnion,
}

pub type ValueArray = Vec<Value>;

pub const NULL_VALUE: Value = Value {
    value_type: ValueType::Null,
    value_as: ValueUnion { number: 0.0 },
};

pub fn make_null_value() -> Value {
    NULL_VALUE
}

pub fn make_bool_value(boolean: bool) -> Value {
    Value {
        value_type: ValueType::Bool,
        value_as: ValueUnion { boolean },
    }
}

pub fn make_number_value(number: f64) -> Value {
    Value {
        value_type: ValueType::Number,
        value_as: ValueUnion { number },
    }
}

pub fn make_handle_value(handle: *mut std::ffi::c_void) -> Value {
    Value {
        value_type: ValueType::Handle,
        value_as: ValueUnion { handle },
    }
}

pub fn make_object_value<T>(object: *mut T) -> Value {
    Value {
        value_type: ValueType::Object,
        value_as: ValueUnion {
            object: object as *mut Object,
        },
    }
}

pub fn is_null(value: &Value) -> bool {
    value.value_type == ValueType::Null
}

pub fn is_bool(value: &Value) -> bool {
    value.value_type == ValueType::Bool
}

pub fn is_number(value: &Value) -> bool {
    value.value_type == ValueType::Number
}

/// A number with integral value (what scripts treat as an int).
pub fn is_integer(value: &Value) -> bool {
    is_number(value) && as_number(value).fract() == 0.0
}

pub fn is_handle(value: &Value) -> bool {
    value.value_type == ValueType::Handle
}

pub fn is_object(value: &Value) -> bool {
    value.value_type == ValueType::Object
}

pub fn as_bool(value: &Value) -> bool {
    unsafe { value.value_as.boolean }
}

pub fn as_number(value: &Value) -> f64 {
    unsafe { value.value_as.number }
}

pub fn as_handle(value: &Value) -> *mut std::ffi::c_void {
    unsafe { value.value_as.handle }
}

pub fn as_object(value: &Value) -> *mut Object {
    unsafe { value.value_as.object }
}

pub fn object_kind(value: &Value) -> Option<ObjectKind> {
    if is_object(value) {
        Some(unsafe { (*as_object(value)).kind })
    } else {
        None
    }
}

fn is_object_kind(value: &Value, kind: ObjectKind) -> bool {
    object_kind(value) == Some(kind)
}

pub fn is_string(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::String)
}

pub fn is_function(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Function)
}

pub fn is_closure(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Closure)
}

pub fn is_native(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Native)
}

pub fn is_class(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Class)
}

pub fn is_instance(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Instance)
}

pub fn is_module(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Module)
}

pub fn is_list(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::List)
}

pub fn is_tuple(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Tuple)
}

pub fn is_range(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::Range)
}

pub fn is_bound_method(value: &Value) -> bool {
    is_object_kind(value, ObjectKind::BoundMethod)
}

pub fn as_string(value: &Value) -> *mut ObjectString {
    as_object(value) as *mut ObjectString
}

pub fn as_function(value: &Value) -> *mut ObjectFunction {
    as_object(value) as *mut ObjectFunction
}

pub fn as_closure(value: &Value) -> *mut ObjectClosure {
    as_object(value) as *mut ObjectClosure
}

pub fn as_native(value: &Value) -> *mut ObjectNative {
    as_object(value) as *mut ObjectNative
}

pub fn as_class(value: &Value) -> *mut ObjectClass {
    as_object(value) as *mut ObjectClass
}

pub fn as_instance(value: &Value) -> *mut ObjectInstance {
    as_object(value) as *mut ObjectInstance
}

pub fn as_module(value: &Value) -> *mut ObjectModule {
    as_object(value) as *mut ObjectModule
}

pub fn as_list(value: &Value) -> *mut ObjectList {
    as_object(value) as *mut ObjectList
}

pub fn as_tuple(value: &Value) -> *mut ObjectTuple {
    as_object(value) as *mut ObjectTuple
}

pub fn as_range(value: &Value) -> *mut ObjectRange {
    as_object(value) as *mut ObjectRange
}

pub fn as_bound_method(value: &Value) -> *mut ObjectBoundMethod {
    as_object(value) as *mut ObjectBoundMethod
}

/// Only null and false are falsy.
pub fn is_falsey(value: &Value) -> bool {
    is_null(value) || (is_bool(value) && !as_bool(value))
}

/// Non-dispatching structural equality: null == null, same bool, same number
/// (NaN compares non-equal), strings by identity or bytes, everything else
/// by pointer identity. `__eq__` dispatch is layered on top by the VM.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.value_type != b.value_type {
        return false;
    }
    match a.value_type {
        ValueType::Null => true,
        ValueType::Bool => as_bool(a) == as_bool(b),
        ValueType::Number => as_number(a) == as_number(b),
        ValueType::Handle => as_handle(a) == as_handle(b),
        ValueType::Object => {
            if as_object(a) == as_object(b) {
                return true;
            }
            // Interned strings hit the pointer check above; strings over the
            // intern threshold still compare by content.
            if is_string(a) && is_string(b) {
                let sa = unsafe { &*as_string(a) };
                let sb = unsafe { &*as_string(b) };
                return sa.hash == sb.hash && sa.content == sb.content;
            }
            false
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        values_equal(self, other)
    }
}

pub fn number_to_string(number: f64) -> String {
    // f64 Display already renders integral values without a fraction.
    format!("{}", number)
}

/// Render a value the way `print` does. Never dispatches script methods.
pub fn value_to_string(value: &Value) -> String {
    match value.value_type {
        ValueType::Null => "null".to_string(),
        ValueType::Bool => {
            if as_bool(value) {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        ValueType::Number => number_to_string(as_number(value)),
        ValueType::Handle => format!("<handle {:p}>", as_handle(value)),
        ValueType::Object => object_to_string(value),
    }
}

fn object_to_string(value: &Value) -> String {
    unsafe {
        match (*as_object(value)).kind {
            ObjectKind::String => (*as_string(value)).content.clone(),
            ObjectKind::Function => {
                format!("<fun {}>", (*as_function(value)).name_str())
            }
            ObjectKind::Closure => {
                format!("<fun {}>", (*(*as_closure(value)).function).name_str())
            }
            ObjectKind::Native => {
                format!("<native {}>", (*as_native(value)).name_str())
            }
            ObjectKind::Class => {
                format!("<class {}>", (*as_class(value)).name_str())
            }
            ObjectKind::Instance => {
                let instance = &*as_instance(value);
                format!("<instance of {}>", (*instance.class).name_str())
            }
            ObjectKind::Module => {
                format!("<module {}>", (*as_module(value)).name_str())
            }
            ObjectKind::List => {
                let list = &*as_list(value);
                let items: Vec<String> = list.elements.iter().map(value_to_string).collect();
                format!("[{}]", items.join(", "))
            }
            ObjectKind::Tuple => {
                let tuple = &*as_tuple(value);
                let items: Vec<String> = tuple.elements.iter().map(value_to_string).collect();
                format!("({})", items.join(", "))
            }
            ObjectKind::Range => {
                let range = &*as_range(value);
                format!(
                    "range({}, {}, {})",
                    number_to_string(range.start),
                    number_to_string(range.stop),
                    number_to_string(range.step)
                )
            }
            ObjectKind::BoundMethod => {
                let bound = &*as_bound_method(value);
                format!("<bound method {}>", bound.method_name())
            }
            ObjectKind::Upvalue => "<upvalue>".to_string(),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", value_to_string(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_predicates() {
        assert!(is_null(&make_null_value()));
        assert!(is_bool(&make_bool_value(true)));
        assert!(is_number(&make_number_value(1.5)));
        assert!(is_integer(&make_number_value(3.0)));
        assert!(!is_integer(&make_number_value(3.5)));
        assert!(!is_object(&make_number_value(0.0)));
    }

    #[test]
    fn number_equality_follows_ieee() {
        let nan = make_number_value(f64::NAN);
        assert!(!values_equal(&nan, &nan));
        assert!(values_equal(&make_number_value(2.0), &make_number_value(2.0)));
        assert!(!values_equal(&make_number_value(2.0), &make_bool_value(true)));
    }

    #[test]
    fn falsiness() {
        assert!(is_falsey(&make_null_value()));
        assert!(is_falsey(&make_bool_value(false)));
        assert!(!is_falsey(&make_bool_value(true)));
        assert!(!is_falsey(&make_number_value(0.0)));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(42.0), "42");
        assert_eq!(number_to_string(10.5), "10.5");
        assert_eq!(number_to_string(-3.0), "-3");
    }
}
