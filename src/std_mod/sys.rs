//! The `sys` built-in module: command-line arguments and process facts.
//!
//! Argument registration is process-wide (a host typically calls
//! `init_argv` once in main, possibly before any VM exists); each VM picks
//! the values up when its script imports `sys`.

use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::api::NativeReg;
use crate::objects::object_module::ObjectModule;
use crate::value::make_object_value;
use crate::vm::VM;

static COMMAND_LINE_ARGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Record the arguments that `sys.args` will expose.
pub fn init_argv(args: &[String]) {
    *COMMAND_LINE_ARGS.lock().expect("argv lock poisoned") = args.to_vec();
}

fn argv() -> Vec<String> {
    COMMAND_LINE_ARGS.lock().expect("argv lock poisoned").clone()
}

const SYS_NATIVES: &[NativeReg] = &[NativeReg::Function {
    name: "exit",
    arity: 1,
    vararg: false,
    fun: native_exit,
}];

/// Build the module contents. Called by the importer with the GC paused.
pub fn init_module(vm: &mut VM, module: *mut ObjectModule) {
    debug_assert!(vm.object_manager.gc_disabled());
    let args = argv();
    let elements = args
        .iter()
        .map(|arg| make_object_value(vm.intern_string(arg)))
        .collect();
    let list = vm.object_manager.alloc_list(elements);
    let args_name = vm.intern_string("args");
    unsafe { (*module).globals.insert(args_name, make_object_value(list)) };

    let platform = vm.intern_string(std::env::consts::OS);
    let platform_name = vm.intern_string("platform");
    unsafe {
        (*module)
            .globals
            .insert(platform_name, make_object_value(platform))
    };

    for reg in SYS_NATIVES {
        if let NativeReg::Function {
            name,
            arity,
            vararg,
            fun,
        } = reg
        {
            vm.define_native(module, name, *arity, *vararg, *fun);
        }
    }
}

fn native_exit(vm: &mut VM) -> bool {
    let code = match vm.check_integer(1, "exit code") {
        Some(code) => code,
        None => return false,
    };
    std::process::exit(code as i32);
}
