//! Embedding API tests: the host-facing stack-slot surface.

use jasper::{Buffer, EvalResult, NativeReg, VM};

#[test]
fn push_and_read_slots() {
    let mut vm = VM::new();
    vm.push_number(1.5);
    vm.push_boolean(true);
    vm.push_string("hello");
    vm.push_null();
    assert!(vm.is_null_at(-1));
    assert!(vm.is_string_at(-2));
    assert!(vm.is_boolean_at(-3));
    assert!(vm.is_number_at(-4));
    assert_eq!(vm.get_string(-2), Some("hello"));
    assert_eq!(vm.get_number(-4), 1.5);
    vm.pop();
    vm.pop();
    vm.pop();
    vm.pop();
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn interned_strings_share_identity() {
    let mut vm = VM::new();
    vm.push_string("shared");
    vm.push_string("shared");
    let a = vm.get_slot(-1);
    let b = vm.get_slot(-2);
    assert_eq!(jasper::value::as_object(&a), jasper::value::as_object(&b));

    // Over the intern threshold: distinct objects, still equal by value.
    let long = "x".repeat(300);
    vm.push_string(&long);
    vm.push_string(&long);
    let c = vm.get_slot(-1);
    let d = vm.get_slot(-2);
    assert_ne!(jasper::value::as_object(&c), jasper::value::as_object(&d));
    assert!(jasper::value::values_equal(&c, &d));
}

#[test]
fn host_calls_a_script_function() {
    let mut vm = VM::new();
    vm.capture_output();
    assert_eq!(
        vm.evaluate("fun add(a, b) return a + b end", "<test>"),
        EvalResult::Success
    );
    assert!(vm.get_global(Some("__main__"), "add"));
    vm.push_number(1.0);
    vm.push_number(2.0);
    assert_eq!(vm.call(2), EvalResult::Success);
    assert_eq!(vm.get_number(-1), 3.0);
    vm.pop();
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn host_call_surfaces_exceptions() {
    let mut vm = VM::new();
    vm.capture_output();
    vm.evaluate("fun fail() raise Exception(\"from script\") end", "<test>");
    assert!(vm.get_global(Some("__main__"), "fail"));
    assert_eq!(vm.call(0), EvalResult::RuntimeErr);
    assert!(vm.is_instance_at(-1));
    assert!(vm.get_field(-1, "_err"));
    assert_eq!(vm.get_string(-1), Some("from script"));
    vm.pop();
    vm.pop();
}

#[test]
fn host_calls_a_method_by_name() {
    let mut vm = VM::new();
    vm.capture_output();
    vm.evaluate(
        "class Greeter fun hello(name) return \"hi \" + name end end\nvar g = Greeter()",
        "<test>",
    );
    assert!(vm.get_global(Some("__main__"), "g"));
    vm.push_string("world");
    assert_eq!(vm.call_method("hello", 1), EvalResult::Success);
    assert_eq!(vm.get_string(-1), Some("hi world"));
    vm.pop();
}

#[test]
fn raise_leaves_an_exception_on_the_stack() {
    let mut vm = VM::new();
    vm.raise("TypeException", "host complaint");
    assert!(vm.is_instance_at(-1));
    assert!(vm.get_field(-1, "_err"));
    assert_eq!(vm.get_string(-1), Some("host complaint"));
    vm.pop();
    vm.pop();

    // Unknown classes degrade to NameException.
    vm.raise("NoSuchException", "whatever");
    assert!(vm.is_instance_at(-1));
    vm.pop();
}

#[test]
fn checked_accessors_raise_type_exceptions() {
    let mut vm = VM::new();
    vm.push_string("not a number");
    assert_eq!(vm.check_number(-1, "argument"), None);
    // The accessor left a TypeException behind.
    assert!(vm.is_instance_at(-1));
    vm.pop();
    vm.pop();
}

#[test]
fn equals_dispatches_eq() {
    let mut vm = VM::new();
    vm.capture_output();
    vm.push_number(2.0);
    vm.push_number(2.0);
    assert!(vm.equals());
    assert!(vm.get_boolean(-1));
    vm.pop();

    vm.evaluate(
        "class P fun new(x) this.x = x end fun __eq__(o) return this.x == o.x end end",
        "<test>",
    );
    vm.evaluate("var p1 = P(1)\nvar p2 = P(1)", "<test>");
    assert!(vm.get_global(Some("__main__"), "p1"));
    assert!(vm.get_global(Some("__main__"), "p2"));
    assert!(vm.equals());
    assert!(vm.get_boolean(-1));
    vm.pop();
}

#[test]
fn list_manipulation() {
    let mut vm = VM::new();
    vm.push_list();
    vm.push_number(1.0);
    vm.list_append(-2);
    vm.push_number(2.0);
    vm.list_append(-2);
    assert_eq!(vm.list_len(-1), 2);
    vm.list_get(0, -1);
    assert_eq!(vm.get_number(-1), 1.0);
    vm.pop();
    vm.push_number(0.0);
    vm.list_insert(0, -2);
    assert_eq!(vm.list_len(-1), 3);
    vm.list_remove(2, -1);
    assert_eq!(vm.list_len(-1), 2);
    vm.pop();
}

#[test]
fn tuple_accessors() {
    let mut vm = VM::new();
    vm.push_number(1.0);
    vm.push_string("two");
    vm.push_tuple(2);
    assert!(vm.is_tuple_at(-1));
    assert_eq!(vm.tuple_len(-1), 2);
    vm.tuple_get(1, -1);
    assert_eq!(vm.get_string(-1), Some("two"));
    vm.pop();
    vm.pop();
}

#[test]
fn iterator_helpers_drive_the_protocol() {
    let mut vm = VM::new();
    vm.push_list();
    vm.push_number(10.0);
    vm.list_append(-2);
    vm.push_number(20.0);
    vm.list_append(-2);
    vm.push_null(); // iteration state

    let mut seen = Vec::new();
    loop {
        match vm.iter(0, 1) {
            Ok(true) => {}
            Ok(false) => break,
            Err(()) => panic!("iteration raised"),
        }
        assert!(vm.inext(0, 1));
        seen.push(vm.get_number(-1));
        vm.pop();
    }
    assert_eq!(seen, vec![10.0, 20.0]);
    vm.pop();
    vm.pop();
}

#[test]
fn is_value_checks_classes() {
    let mut vm = VM::new();
    vm.capture_output();
    vm.evaluate("var e = Exception(\"x\")", "<test>");
    assert!(vm.get_global(Some("__main__"), "e"));
    assert!(vm.get_global(Some("__core__"), "Exception"));
    assert!(vm.is_value(-2, -1));
    vm.pop();
    vm.pop();
}

#[test]
fn globals_roundtrip_through_the_api() {
    let mut vm = VM::new();
    vm.capture_output();
    vm.evaluate("var x = 1", "<test>");
    vm.push_number(99.0);
    assert!(vm.set_global(Some("__main__"), "x"));
    vm.pop();
    assert_eq!(vm.evaluate("print x", "<test>"), EvalResult::Success);
    assert_eq!(vm.take_output(), "99\n");
}

#[test]
fn fields_roundtrip_through_the_api() {
    let mut vm = VM::new();
    vm.capture_output();
    vm.evaluate("class Bag end\nvar bag = Bag()", "<test>");
    assert!(vm.get_global(Some("__main__"), "bag"));
    vm.push_number(7.0);
    assert!(vm.set_field(-2, "n"));
    vm.pop();
    assert!(vm.get_field(-1, "n"));
    assert_eq!(vm.get_number(-1), 7.0);
    vm.pop();
    vm.pop();
}

#[test]
fn registered_natives_are_callable_from_scripts() {
    fn native_double(vm: &mut VM) -> bool {
        let n = match vm.check_number(1, "n") {
            Some(n) => n,
            None => return false,
        };
        vm.push_number(n * 2.0);
        true
    }

    const REGS: &[NativeReg] = &[NativeReg::Function {
        name: "double",
        arity: 1,
        vararg: false,
        fun: native_double,
    }];

    let mut vm = VM::new();
    vm.capture_output();
    vm.register_natives("__main__", REGS);
    assert_eq!(vm.evaluate("print double(21)", "<test>"), EvalResult::Success);
    assert_eq!(vm.take_output(), "42\n");
}

#[test]
fn native_failure_propagates_as_exception() {
    fn native_always_fails(vm: &mut VM) -> bool {
        vm.raise("TypeException", "native says no");
        false
    }

    const REGS: &[NativeReg] = &[NativeReg::Function {
        name: "nope",
        arity: 0,
        vararg: false,
        fun: native_always_fails,
    }];

    let mut vm = VM::new();
    vm.capture_output();
    vm.register_natives("__main__", REGS);
    let result = vm.evaluate(
        "try nope() except TypeException e print e._err end",
        "<test>",
    );
    assert_eq!(result, EvalResult::Success);
    assert_eq!(vm.take_output(), "native says no\n");
}

#[test]
fn buffer_builds_strings() {
    let mut vm = VM::new();
    let mut buffer = Buffer::with_capacity(16);
    buffer.append_str("a");
    buffer.append_str("b");
    buffer.push(&mut vm);
    assert_eq!(vm.get_string(-1), Some("ab"));
    vm.pop();
    // Reusable after push.
    buffer.append_str("c");
    buffer.push(&mut vm);
    assert_eq!(vm.get_string(-1), Some("c"));
    vm.pop();
}

#[test]
fn ensure_stack_keeps_slots_valid() {
    let mut vm = VM::new();
    vm.push_number(1.0);
    vm.ensure_stack(10_000);
    // Slot indexing still works after any reallocation.
    assert_eq!(vm.get_number(-1), 1.0);
    vm.pop();
}

#[test]
fn heap_objects_survive_collection_only_when_rooted() {
    let mut vm = VM::new();
    // Settle the heap first: bootstrap leaves some unreachable garbage
    // (the core module's finished top-level function, for one).
    vm.collect_garbage();
    // Unique (uninterned-length) strings so the intern table can't keep
    // them alive: anything off-stack must die.
    let long_a = "a".repeat(300);
    let long_b = "b".repeat(300);
    vm.push_string(&long_a);
    let before = vm.object_manager.object_count();
    vm.push_string(&long_b);
    vm.pop();
    vm.collect_garbage();
    let after = vm.object_manager.object_count();
    assert_eq!(after, before);
    assert_eq!(vm.get_string(-1), Some(long_a.as_str()));
    vm.pop();
}
