//! End-to-end script execution tests: each evaluates Jasper source in a
//! fresh VM with output captured.

use jasper::{EvalResult, VM};

fn run(source: &str) -> (EvalResult, String) {
    let mut vm = VM::new();
    vm.capture_output();
    let result = vm.evaluate(source, "<test>");
    (result, vm.take_output())
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert_eq!(result, EvalResult::Success, "output was: {}", output);
    output
}

#[test]
fn arithmetic_and_printing() {
    assert_eq!(run_ok("print 1 + 2 * 3"), "7\n");
    assert_eq!(run_ok("print (1 + 2) * 3"), "9\n");
    assert_eq!(run_ok("print 7 % 3"), "1\n");
    assert_eq!(run_ok("print 2 ^ 10"), "1024\n");
    assert_eq!(run_ok("print -5 + 1"), "-4\n");
    assert_eq!(run_ok("print 10 / 4"), "2.5\n");
}

#[test]
fn comparison_and_logic() {
    assert_eq!(run_ok("print 1 < 2 and 2 <= 2"), "true\n");
    assert_eq!(run_ok("print 3 > 4 or false"), "false\n");
    assert_eq!(run_ok("print !(1 == 2)"), "true\n");
    assert_eq!(run_ok("print 1 != 2"), "true\n");
    assert_eq!(run_ok("print null == null"), "true\n");
    // Short-circuit: the right side must not run.
    assert_eq!(run_ok("fun boom() raise Exception(\"no\") end\nprint false and boom()"), "false\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_ok("print \"st\" + \"ri\" + \"ng\""), "string\n");
    assert_eq!(run_ok("var s = \"a\"\ns += \"b\"\nprint s"), "ab\n");
}

#[test]
fn sum_loop_prints_55() {
    // for (init; cond; incr) with a single-statement body
    let output = run_ok("var x = 0; for (var i = 1; i <= 10; i = i + 1) x = x + i; print x");
    assert_eq!(output, "55\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let output = run_ok(
        "var total = 0
         var i = 0
         while true do
           i += 1
           if i > 10 then break end
           if i % 2 == 0 then continue end
           total += i
         end
         print total",
    );
    assert_eq!(output, "25\n");
}

#[test]
fn inherited_method_prints_hi() {
    let output = run_ok(
        "class A fun greet() return \"hi\" end end; class B is A end; print B().greet()",
    );
    assert_eq!(output, "hi\n");
}

#[test]
fn method_override_and_super() {
    let output = run_ok(
        "class A
           fun new(x) this.x = x end
           fun describe() return \"A:\" + str(this.x) end
         end
         class B is A
           fun new() super(7) end
           fun describe() return \"B/\" + super.describe() end
         end
         print B().describe()",
    );
    assert_eq!(output, "B/A:7\n");
}

#[test]
fn try_except_prints_boom() {
    let output =
        run_ok("try raise Exception(\"boom\") except Exception e print e._err end");
    assert_eq!(output, "boom\n");
}

#[test]
fn except_clause_matching_follows_class_hierarchy() {
    let output = run_ok(
        "try
           raise TypeException(\"t\")
         except NameException e
           print \"name\"
         except Exception e
           print \"exc:\" + e._err
         end",
    );
    assert_eq!(output, "exc:t\n");
}

#[test]
fn ensure_runs_on_every_exit_path() {
    // Normal completion.
    assert_eq!(run_ok("try print 1 ensure print 2 end"), "1\n2\n");
    // After a matched except.
    assert_eq!(
        run_ok(
            "try raise Exception(\"x\") except Exception e print \"c\" ensure print \"e\" end"
        ),
        "c\ne\n"
    );
    // On the way out of an unwinding exception.
    assert_eq!(
        run_ok(
            "try
               try raise Exception(\"x\") ensure print \"inner\" end
             except Exception e
               print \"outer\"
             end"
        ),
        "inner\nouter\n"
    );
    // Before a return.
    assert_eq!(
        run_ok("fun f() try return 1 ensure print \"e\" end end; print f()"),
        "e\n1\n"
    );
    // Before a break.
    assert_eq!(
        run_ok("while true do try break ensure print \"e\" end end; print \"done\""),
        "e\ndone\n"
    );
}

#[test]
fn closure_counter_counts() {
    let output = run_ok(
        "fun make() var c = 0; fun inc() c = c + 1; return c end; return inc end; var f = make(); print f(); print f(); print f()",
    );
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn closures_capturing_one_local_share_it() {
    let output = run_ok(
        "fun make()
           var c = 0
           fun get() return c end
           fun inc() c = c + 1; return null end
           return (get, inc)
         end
         var fns = make()
         fns[1]()
         fns[1]()
         print fns[0]()",
    );
    assert_eq!(output, "2\n");
}

#[test]
fn deep_recursion_raises_stack_overflow() {
    let (result, _) = run(
        "fun r(n) if n == 0 then return 0 end; return r(n - 1) end; r(10000)",
    );
    assert_eq!(result, EvalResult::RuntimeErr);
    // And the overflow is catchable.
    let output = run_ok(
        "fun r(n) return r(n + 1) end
         try r(0) except StackOverflowError e print \"caught\" end",
    );
    assert_eq!(output, "caught\n");
}

#[test]
fn stack_is_balanced_after_evaluation() {
    let mut vm = VM::new();
    vm.capture_output();
    assert_eq!(vm.stack_size(), 0);
    vm.evaluate("var x = 1; print x", "<test>");
    assert_eq!(vm.stack_size(), 0);
    vm.evaluate("raise Exception(\"unhandled\")", "<test>");
    assert_eq!(vm.stack_size(), 0);
    vm.evaluate("var broken = ", "<test>");
    assert_eq!(vm.stack_size(), 0);
}

#[test]
fn stacktrace_length_matches_frames_unwound() {
    let output = run_ok(
        "fun a() raise Exception(\"x\") end
         fun b() a() end
         fun c() b() end
         try c() except Exception e print #e._stacktrace end",
    );
    assert_eq!(output, "3\n");
}

#[test]
fn unhandled_exception_reports_a_traceback() {
    let mut vm = VM::new();
    vm.capture_output();
    let result = vm.evaluate(
        "fun inner() raise TypeException(\"bad things\") end\ninner()",
        "<test>",
    );
    assert_eq!(result, EvalResult::RuntimeErr);
    let diagnostics = vm.take_diagnostics();
    assert!(diagnostics.contains("Traceback"));
    assert!(diagnostics.contains("inner"));
    assert!(diagnostics.contains("TypeException: bad things"));
}

#[test]
fn lists_tuples_and_subscripts() {
    assert_eq!(run_ok("var l = [1, 2, 3]; print l[1]"), "2\n");
    assert_eq!(run_ok("var l = [1, 2, 3]; l[0] = 9; print l"), "[9, 2, 3]\n");
    assert_eq!(run_ok("var t = (1, \"two\", 3); print t[1]"), "two\n");
    assert_eq!(run_ok("print #[1, 2, 3]"), "3\n");
    assert_eq!(run_ok("print #(1, 2)"), "2\n");
    assert_eq!(run_ok("print #\"hello\""), "5\n");
    assert_eq!(run_ok("var l = []; l.add(1); l.add(2); print l.pop(); print l"), "2\n[1]\n");
}

#[test]
fn out_of_bounds_subscript_raises() {
    let output = run_ok(
        "try [1, 2][5] except IndexOutOfBoundException e print \"oob\" end",
    );
    assert_eq!(output, "oob\n");
}

#[test]
fn for_in_iterates_builtin_sequences() {
    assert_eq!(run_ok("for x in [10, 20, 30] do print x end"), "10\n20\n30\n");
    assert_eq!(run_ok("for x in (4, 5) do print x end"), "4\n5\n");
    assert_eq!(run_ok("for x in range(3) do print x end"), "0\n1\n2\n");
    assert_eq!(run_ok("for x in range(6, 0, -2) do print x end"), "6\n4\n2\n");
    assert_eq!(run_ok("for c in \"ab\" do print c end"), "a\nb\n");
}

#[test]
fn for_in_supports_break_and_continue() {
    let output = run_ok(
        "for x in range(10) do
           if x == 1 then continue end
           if x == 4 then break end
           print x
         end",
    );
    assert_eq!(output, "0\n2\n3\n");
}

#[test]
fn custom_iterator_protocol() {
    let output = run_ok(
        "class Twice
           fun new(limit) this.limit = limit end
           fun __iter__(state)
             if state == null then return 1 end
             if state + 1 > this.limit then return false end
             return state + 1
           end
           fun __next__(state) return state * 2 end
         end
         for x in Twice(3) do print x end",
    );
    assert_eq!(output, "2\n4\n6\n");
}

#[test]
fn fields_shadow_methods_and_unbound_fields_do_not_bind() {
    let output = run_ok(
        "class A fun m() return \"method\" end end
         var a = A()
         print a.m()
         a.m = fun() return \"field\" end
         print a.m()",
    );
    assert_eq!(output, "method\nfield\n");
}

#[test]
fn bound_methods_carry_their_receiver() {
    let output = run_ok(
        "class Counter
           fun new() this.n = 0 end
           fun bump() this.n += 1; return this.n end
         end
         var c = Counter()
         var bump = c.bump
         bump()
         print bump()",
    );
    assert_eq!(output, "2\n");
}

#[test]
fn operator_overloads_dispatch_to_methods() {
    let output = run_ok(
        "class V
           fun new(x) this.x = x end
           fun __add__(o) return V(this.x + o.x) end
           fun __eq__(o) return this.x == o.x end
         end
         print (V(1) + V(2)).x
         print V(3) == V(3)
         print V(3) != V(4)",
    );
    assert_eq!(output, "3\ntrue\ntrue\n");
}

#[test]
fn subscript_overloads_dispatch_to_methods() {
    let output = run_ok(
        "class Box
           fun new() this.data = [0, 0] end
           fun __get__(i) return this.data[i] end
           fun __set__(i, v) this.data[i] = v end
         end
         var b = Box()
         b[0] = 5
         print b[0]",
    );
    assert_eq!(output, "5\n");
}

#[test]
fn is_operator_checks_class_chains() {
    assert_eq!(run_ok("print 1 is Number"), "true\n");
    assert_eq!(run_ok("print [] is List"), "true\n");
    assert_eq!(run_ok("print \"s\" is Number"), "false\n");
    assert_eq!(
        run_ok("print TypeException(\"m\") is Exception"),
        "true\n"
    );
    assert_eq!(
        run_ok("class A end; class B is A end; print B() is A and A() is B == false"),
        "true\n"
    );
}

#[test]
fn varargs_pack_into_a_tuple() {
    assert_eq!(run_ok("fun f(a, ...) return #args end; print f(1, 2, 3)"), "2\n");
    assert_eq!(run_ok("fun f(a, ...) return #args end; print f(1)"), "0\n");
    assert_eq!(
        run_ok("fun sum(...) var t = 0; for x in args do t += x end; return t end; print sum(1, 2, 3, 4)"),
        "10\n"
    );
}

#[test]
fn arity_mismatch_raises_type_exception() {
    let output = run_ok(
        "fun f(a, b) return a + b end
         try f(1) except TypeException e print \"arity\" end",
    );
    assert_eq!(output, "arity\n");
}

#[test]
fn undefined_name_raises_name_exception_at_use() {
    let output = run_ok(
        "try print missing except NameException e print \"undefined\" end",
    );
    assert_eq!(output, "undefined\n");
    // Referencing a global defined later in the program is fine.
    assert_eq!(
        run_ok("fun f() return later() end; fun later() return 1 end; print f()"),
        "1\n"
    );
}

#[test]
fn division_by_zero_raises() {
    let output = run_ok(
        "try 1 / 0 except ArithmeticException e print \"div\" end",
    );
    assert_eq!(output, "div\n");
}

#[test]
fn anonymous_functions_are_values() {
    assert_eq!(
        run_ok("var twice = fun(f, x) return f(f(x)) end; print twice(fun(n) return n + 1 end, 5)"),
        "7\n"
    );
}

#[test]
fn nested_control_flow_with_locals() {
    let output = run_ok(
        "fun classify(n)
           if n < 0 then
             return \"neg\"
           elif n == 0 then
             return \"zero\"
           else
             return \"pos\"
           end
         end
         print classify(-1)
         print classify(0)
         print classify(3)",
    );
    assert_eq!(output, "neg\nzero\npos\n");
}

#[test]
fn syntax_error_reports_line() {
    let mut vm = VM::new();
    vm.capture_output();
    let result = vm.evaluate("var x = 1\nvar = 2", "main.jsr");
    assert_eq!(result, EvalResult::SyntaxErr);
    let diagnostics = vm.take_diagnostics();
    assert!(diagnostics.contains("main.jsr"));
    assert!(diagnostics.contains("line:2"));
}

#[test]
fn compile_error_is_distinct_from_syntax_error() {
    let mut vm = VM::new();
    vm.capture_output();
    assert_eq!(vm.evaluate("break", "<test>"), EvalResult::CompileErr);
}

#[test]
fn later_evaluations_share_main_module_globals() {
    let mut vm = VM::new();
    vm.capture_output();
    assert_eq!(vm.evaluate("var shared = 5", "<test>"), EvalResult::Success);
    assert_eq!(vm.evaluate("print shared", "<test>"), EvalResult::Success);
    assert_eq!(vm.take_output(), "5\n");
}

#[test]
fn named_module_evaluation_is_isolated() {
    let mut vm = VM::new();
    vm.capture_output();
    assert_eq!(
        vm.evaluate_module("var only_here = 1", "<m>", "other"),
        EvalResult::Success
    );
    assert_eq!(
        vm.evaluate("try print only_here except NameException e print \"isolated\" end", "<test>"),
        EvalResult::Success
    );
    assert_eq!(vm.take_output(), "isolated\n");
}

#[test]
fn import_runs_top_level_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("foo.jsr"), "print \"loaded\"\nvar x = 42\n").unwrap();
    let mut vm = VM::new();
    vm.capture_output();
    vm.add_import_path(&dir.path().to_string_lossy());
    assert_eq!(
        vm.evaluate("import foo; print foo.x", "<test>"),
        EvalResult::Success
    );
    assert_eq!(vm.take_output(), "loaded\n42\n");
    // Importing again must not re-execute the module's top level.
    assert_eq!(vm.evaluate("import foo; print foo.x", "<test>"), EvalResult::Success);
    assert_eq!(vm.take_output(), "42\n");
}

#[test]
fn import_alias_and_module_assignment() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("config.jsr"), "var value = 1\n").unwrap();
    let mut vm = VM::new();
    vm.capture_output();
    vm.add_import_path(&dir.path().to_string_lossy());
    let output = {
        vm.evaluate(
            "import config as cfg\ncfg.value = 10\nprint cfg.value",
            "<test>",
        );
        vm.take_output()
    };
    assert_eq!(output, "10\n");
}

#[test]
fn package_directories_expose_package_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("pkg")).unwrap();
    std::fs::write(dir.path().join("pkg").join("__package__.jsr"), "var marker = \"pkg\"\n")
        .unwrap();
    let mut vm = VM::new();
    vm.capture_output();
    vm.add_import_path(&dir.path().to_string_lossy());
    assert_eq!(
        vm.evaluate("import pkg; print pkg.marker", "<test>"),
        EvalResult::Success
    );
    assert_eq!(vm.take_output(), "pkg\n");
}

#[test]
fn missing_module_raises_import_exception() {
    let output = run_ok(
        "try import nope except ImportException e print \"missing\" end",
    );
    assert_eq!(output, "missing\n");
}

#[test]
fn sys_module_exposes_args() {
    jasper::init_argv(&["one".to_string(), "two".to_string()]);
    let output = run_ok("import sys; print #sys.args; print sys.args[0]");
    assert_eq!(output, "2\none\n");
}

#[test]
fn gc_survives_heavy_allocation() {
    let mut vm = VM::new();
    vm.capture_output();
    let result = vm.evaluate(
        "var keep = []
         for (var i = 0; i < 1000; i = i + 1)
           begin
             var garbage = [i, i, i, str(i)]
             if i % 100 == 0 then keep.add(garbage) end
           end
         print #keep",
        "<test>",
    );
    assert_eq!(result, EvalResult::Success);
    assert_eq!(vm.take_output(), "10\n");
    let live_before = vm.object_manager.object_count();
    vm.collect_garbage();
    let live_after = vm.object_manager.object_count();
    assert!(live_after <= live_before);
    // The kept data is still intact after collection.
    assert_eq!(vm.evaluate("print keep[9][3]", "<test>"), EvalResult::Success);
    assert_eq!(vm.take_output(), "900\n");
}

#[test]
fn compiled_output_is_deterministic() {
    let source = "fun f(a) if a then return a + 1 end; return 0 end; print f(1)";
    let listing = |src: &str| {
        let mut vm = VM::new();
        vm.capture_output();
        let ast = jasper::parser::parse(src, "<d>").unwrap();
        let module = vm.main_module();
        vm.object_manager.gc_disable(true);
        let function = jasper::compiler::compile(&mut vm, module, &ast, "<d>").unwrap();
        vm.object_manager.gc_disable(false);
        unsafe { jasper::debug::disassemble_chunk(&(*function).chunk, "main") }
    };
    assert_eq!(listing(source), listing(source));
}
