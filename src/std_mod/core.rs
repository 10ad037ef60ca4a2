//! Native half of the core module: free functions plus the methods of the
//! built-in dispatch classes (List, Tuple, Range, String).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::api::NativeReg;
use crate::objects::object::ObjectKind;
use crate::value::*;
use crate::vm::VM;

pub const NATIVES: &[NativeReg] = &[
    NativeReg::Function {
        name: "clock",
        arity: 0,
        vararg: false,
        fun: native_clock,
    },
    NativeReg::Function {
        name: "type",
        arity: 1,
        vararg: false,
        fun: native_type,
    },
    NativeReg::Function {
        name: "str",
        arity: 1,
        vararg: false,
        fun: native_str,
    },
    NativeReg::Function {
        name: "num",
        arity: 1,
        vararg: false,
        fun: native_num,
    },
    NativeReg::Function {
        name: "int",
        arity: 1,
        vararg: false,
        fun: native_int,
    },
    NativeReg::Function {
        name: "range",
        arity: 1,
        vararg: true,
        fun: native_range,
    },
    NativeReg::Method {
        class: "List",
        name: "add",
        arity: 1,
        vararg: false,
        fun: native_list_add,
    },
    NativeReg::Method {
        class: "List",
        name: "insert",
        arity: 2,
        vararg: false,
        fun: native_list_insert,
    },
    NativeReg::Method {
        class: "List",
        name: "removeAt",
        arity: 1,
        vararg: false,
        fun: native_list_remove_at,
    },
    NativeReg::Method {
        class: "List",
        name: "pop",
        arity: 0,
        vararg: false,
        fun: native_list_pop,
    },
    NativeReg::Method {
        class: "List",
        name: "clear",
        arity: 0,
        vararg: false,
        fun: native_list_clear,
    },
    NativeReg::Method {
        class: "List",
        name: "__iter__",
        arity: 1,
        vararg: false,
        fun: native_sequence_iter,
    },
    NativeReg::Method {
        class: "List",
        name: "__next__",
        arity: 1,
        vararg: false,
        fun: native_list_next,
    },
    NativeReg::Method {
        class: "Tuple",
        name: "__iter__",
        arity: 1,
        vararg: false,
        fun: native_sequence_iter,
    },
    NativeReg::Method {
        class: "Tuple",
        name: "__next__",
        arity: 1,
        vararg: false,
        fun: native_tuple_next,
    },
    NativeReg::Method {
        class: "String",
        name: "__iter__",
        arity: 1,
        vararg: false,
        fun: native_sequence_iter,
    },
    NativeReg::Method {
        class: "String",
        name: "__next__",
        arity: 1,
        vararg: false,
        fun: native_string_next,
    },
    NativeReg::Method {
        class: "Range",
        name: "__iter__",
        arity: 1,
        vararg: false,
        fun: native_range_iter,
    },
    NativeReg::Method {
        class: "Range",
        name: "__next__",
        arity: 1,
        vararg: false,
        fun: native_range_next,
    },
];

fn native_clock(vm: &mut VM) -> bool {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    vm.push_number(elapsed.as_secs_f64());
    true
}

fn native_type(vm: &mut VM) -> bool {
    let value = vm.get_slot(1);
    let name = match value.value_type {
        ValueType::Null => "null".to_string(),
        ValueType::Bool => "bool".to_string(),
        ValueType::Number => "number".to_string(),
        ValueType::Handle => "handle".to_string(),
        ValueType::Object => match object_kind(&value).expect("object value") {
            ObjectKind::String => "string".to_string(),
            ObjectKind::List => "list".to_string(),
            ObjectKind::Tuple => "tuple".to_string(),
            ObjectKind::Range => "range".to_string(),
            ObjectKind::Module => "module".to_string(),
            ObjectKind::Class => "class".to_string(),
            ObjectKind::Instance => unsafe {
                (*(*as_instance(&value)).class).name_str().to_string()
            },
            ObjectKind::Function
            | ObjectKind::Closure
            | ObjectKind::Native
            | ObjectKind::BoundMethod => "function".to_string(),
            ObjectKind::Upvalue => "upvalue".to_string(),
        },
    };
    vm.push_string(&name);
    true
}

fn native_str(vm: &mut VM) -> bool {
    let value = vm.get_slot(1);
    let text = value_to_string(&value);
    vm.push_string(&text);
    true
}

fn native_num(vm: &mut VM) -> bool {
    let text = match vm.check_string(1, "argument") {
        Some(text) => text,
        None => return false,
    };
    match text.trim().parse::<f64>() {
        Ok(number) => {
            vm.push_number(number);
            true
        }
        Err(_) => {
            vm.raise(
                "TypeException",
                &format!("Can't parse '{}' as a number.", text),
            );
            false
        }
    }
}

fn native_int(vm: &mut VM) -> bool {
    let number = match vm.check_number(1, "argument") {
        Some(number) => number,
        None => return false,
    };
    vm.push_number(number.trunc());
    true
}

/// range(stop), range(start, stop) or range(start, stop, step).
fn native_range(vm: &mut VM) -> bool {
    let argc = vm.arg_count();
    if argc > 3 {
        vm.raise("TypeException", "range() takes at most 3 arguments.");
        return false;
    }
    let mut bounds = [0.0f64; 3];
    for (i, bound) in bounds.iter_mut().enumerate().take(argc) {
        *bound = match vm.check_number(i as i32 + 1, "range bound") {
            Some(number) => number,
            None => return false,
        };
    }
    let (start, stop, step) = match argc {
        1 => (0.0, bounds[0], 1.0),
        2 => (bounds[0], bounds[1], 1.0),
        _ => (bounds[0], bounds[1], bounds[2]),
    };
    if step == 0.0 {
        vm.raise("TypeException", "range() step can't be 0.");
        return false;
    }
    vm.push_range(start, stop, step);
    true
}

// ---- list methods ----

fn receiver_list(vm: &mut VM) -> Option<*mut crate::objects::object_list::ObjectList> {
    let receiver = vm.get_slot(0);
    if is_list(&receiver) {
        Some(as_list(&receiver))
    } else {
        vm.raise("TypeException", "Receiver must be a list.");
        None
    }
}

fn native_list_add(vm: &mut VM) -> bool {
    let list = match receiver_list(vm) {
        Some(list) => list,
        None => return false,
    };
    let value = vm.get_slot(1);
    unsafe { (*list).elements.push(value) };
    vm.push_null();
    true
}

fn native_list_insert(vm: &mut VM) -> bool {
    let list = match receiver_list(vm) {
        Some(list) => list,
        None => return false,
    };
    let len = unsafe { (*list).len() };
    // Inserting at the end is allowed.
    let index = match vm.check_index(1, len + 1, "index") {
        Some(index) => index,
        None => return false,
    };
    let value = vm.get_slot(2);
    unsafe { (*list).elements.insert(index, value) };
    vm.push_null();
    true
}

fn native_list_remove_at(vm: &mut VM) -> bool {
    let list = match receiver_list(vm) {
        Some(list) => list,
        None => return false,
    };
    let len = unsafe { (*list).len() };
    let index = match vm.check_index(1, len, "index") {
        Some(index) => index,
        None => return false,
    };
    let removed = unsafe { (*list).elements.remove(index) };
    vm.push(removed);
    true
}

fn native_list_pop(vm: &mut VM) -> bool {
    let list = match receiver_list(vm) {
        Some(list) => list,
        None => return false,
    };
    match unsafe { (*list).elements.pop() } {
        Some(value) => {
            vm.push(value);
            true
        }
        None => {
            vm.raise("IndexOutOfBoundException", "pop() from an empty list.");
            false
        }
    }
}

fn native_list_clear(vm: &mut VM) -> bool {
    let list = match receiver_list(vm) {
        Some(list) => list,
        None => return false,
    };
    unsafe { (*list).elements.clear() };
    vm.push_null();
    true
}

// ---- iteration protocol ----

/// Shared `__iter__` for index-based sequences (List, Tuple, String): the
/// iteration state is the element index.
fn native_sequence_iter(vm: &mut VM) -> bool {
    let receiver = vm.get_slot(0);
    let len = if is_list(&receiver) {
        unsafe { (*as_list(&receiver)).len() }
    } else if is_tuple(&receiver) {
        unsafe { (*as_tuple(&receiver)).len() }
    } else if is_string(&receiver) {
        unsafe { (*as_string(&receiver)).content.chars().count() }
    } else {
        vm.raise("TypeException", "Receiver is not an indexable sequence.");
        return false;
    };
    let state = vm.get_slot(1);
    let next = if is_null(&state) {
        0.0
    } else if is_integer(&state) {
        as_number(&state) + 1.0
    } else {
        vm.raise("TypeException", "Iteration state must be an integer.");
        return false;
    };
    if next < len as f64 {
        vm.push_number(next);
    } else {
        vm.push_boolean(false);
    }
    true
}

fn native_list_next(vm: &mut VM) -> bool {
    let receiver = vm.get_slot(0);
    if !is_list(&receiver) {
        vm.raise("TypeException", "Receiver must be a list.");
        return false;
    }
    let len = unsafe { (*as_list(&receiver)).len() };
    let index = match vm.check_index(1, len, "iteration state") {
        Some(index) => index,
        None => return false,
    };
    let element = unsafe { (&(*as_list(&receiver)).elements)[index] };
    vm.push(element);
    true
}

fn native_tuple_next(vm: &mut VM) -> bool {
    let receiver = vm.get_slot(0);
    if !is_tuple(&receiver) {
        vm.raise("TypeException", "Receiver must be a tuple.");
        return false;
    }
    let len = unsafe { (*as_tuple(&receiver)).len() };
    let index = match vm.check_index(1, len, "iteration state") {
        Some(index) => index,
        None => return false,
    };
    let element = unsafe { (*as_tuple(&receiver)).elements[index] };
    vm.push(element);
    true
}

fn native_string_next(vm: &mut VM) -> bool {
    let receiver = vm.get_slot(0);
    if !is_string(&receiver) {
        vm.raise("TypeException", "Receiver must be a string.");
        return false;
    }
    let content = unsafe { (*as_string(&receiver)).content.clone() };
    let len = content.chars().count();
    let index = match vm.check_index(1, len, "iteration state") {
        Some(index) => index,
        None => return false,
    };
    let ch: String = content.chars().skip(index).take(1).collect();
    vm.push_string(&ch);
    true
}

/// The Range iteration state is the current value itself.
fn native_range_iter(vm: &mut VM) -> bool {
    let receiver = vm.get_slot(0);
    if !is_range(&receiver) {
        vm.raise("TypeException", "Receiver must be a range.");
        return false;
    }
    let range = unsafe { &*as_range(&receiver) };
    let state = vm.get_slot(1);
    let next = if is_null(&state) {
        range.start
    } else if is_number(&state) {
        as_number(&state) + range.step
    } else {
        vm.raise("TypeException", "Iteration state must be a number.");
        return false;
    };
    if range.in_bounds(next) {
        vm.push_number(next);
    } else {
        vm.push_boolean(false);
    }
    true
}

fn native_range_next(vm: &mut VM) -> bool {
    let state = vm.get_slot(1);
    if !is_number(&state) {
        vm.raise("TypeException", "Iteration state must be a number.");
        return false;
    }
    vm.push(state);
    true
}
