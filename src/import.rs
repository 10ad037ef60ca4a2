//! Module registry and import machinery.
//!
//! Importing is idempotent: a registered module is never re-executed. A
//! fresh import leaves the module's compiled top-level function on the
//! stack (the importer calls it with zero arguments); an already-loaded one
//! leaves null, so both paths balance with a single pop. The module value
//! itself is bound into the importing module's globals either way.

use std::path::PathBuf;

use crate::constants::{CORE_MODULE, MODULE_NAME_GLOBAL, PACKAGE_FILE, SOURCE_EXT};
use crate::objects::object_module::ObjectModule;
use crate::objects::object_string::ObjectString;
use crate::value::{as_class, as_module, is_class, make_null_value, make_object_value};
use crate::vm::{EvalResult, VM};

/// What `import_module` did; `Fresh` means the compiled top-level function
/// was pushed and still has to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    AlreadyLoaded,
    Fresh,
    Failed,
}

/// Native modules built directly by the runtime rather than from source.
fn builtin_module_init(name: &str) -> Option<fn(&mut VM, *mut ObjectModule)> {
    match name {
        "sys" => Some(crate::std_mod::sys::init_module),
        _ => None,
    }
}

const CORE_SOURCE: &str = include_str!("std_mod/core.jsr");

impl VM {
    pub(crate) fn init_core_module(&mut self) {
        let saved = self.object_manager.gc_disabled();
        self.object_manager.gc_disable(true);
        let name = self.intern_string(CORE_MODULE);
        let module = self.object_manager.alloc_module(name);
        let name_global = self.intern_string(MODULE_NAME_GLOBAL);
        unsafe { (*module).globals.insert(name_global, make_object_value(name)) };
        self.modules.insert(name, make_object_value(module));
        self.core_module = module;
        self.object_manager.gc_disable(saved);

        let result = self.evaluate_module(CORE_SOURCE, "core.jsr", CORE_MODULE);
        assert!(
            result == EvalResult::Success,
            "core module failed to initialize"
        );
        self.register_natives(CORE_MODULE, crate::std_mod::core::NATIVES);

        self.list_class = self.core_class("List");
        self.tuple_class = self.core_class("Tuple");
        self.range_class = self.core_class("Range");
        self.string_class = self.core_class("String");
        self.number_class = self.core_class("Number");
    }

    fn core_class(&mut self, name: &str) -> *mut crate::objects::object_class::ObjectClass {
        let name_string = self.intern_string(name);
        let value = unsafe { (*self.core_module).globals.get(name_string) }
            .unwrap_or_else(|| panic!("core class {} missing", name));
        assert!(is_class(&value), "core global {} is not a class", name);
        as_class(&value)
    }

    /// Fetch a registered module or create it: new modules are seeded with
    /// a copy of `__core__`'s globals and get `__name__` set. The caller
    /// holds the GC paused across creation.
    pub(crate) fn get_or_create_module(&mut self, name: &str) -> *mut ObjectModule {
        let name_string = self.intern_string(name);
        if let Some(value) = self.modules.get(name_string) {
            return as_module(&value);
        }
        debug_assert!(self.object_manager.gc_disabled());
        let module = self.object_manager.alloc_module(name_string);
        if !self.core_module.is_null() {
            unsafe { (*module).globals.merge_from(&(*self.core_module).globals) };
        }
        let name_global = self.intern_string(MODULE_NAME_GLOBAL);
        unsafe { (*module).globals.insert(name_global, make_object_value(name_string)) };
        self.modules.insert(name_string, make_object_value(module));
        module
    }

    /// The `__main__` module (created on first use).
    pub fn main_module(&mut self) -> *mut ObjectModule {
        let saved = self.object_manager.gc_disabled();
        self.object_manager.gc_disable(true);
        let module = self.get_or_create_module(crate::constants::MAIN_MODULE);
        self.object_manager.gc_disable(saved);
        module
    }

    /// Extend the module search path.
    pub fn add_import_path(&mut self, path: &str) {
        self.import_paths.push(PathBuf::from(path));
    }

    /// Load and register `name` if necessary. Pushes the compiled top-level
    /// function (fresh) or null (already loaded); pushes nothing on failure.
    pub fn import_module(&mut self, name: *mut ObjectString) -> ImportOutcome {
        if self.modules.contains_key(name) {
            self.push(make_null_value());
            return ImportOutcome::AlreadyLoaded;
        }
        let name_str = unsafe { (*name).as_str().to_string() };

        if let Some(init) = builtin_module_init(&name_str) {
            let saved = self.object_manager.gc_disabled();
            self.object_manager.gc_disable(true);
            let module = self.get_or_create_module(&name_str);
            init(self, module);
            self.object_manager.gc_disable(saved);
            self.push(make_null_value());
            return ImportOutcome::AlreadyLoaded;
        }

        let source = match self.load_source(&name_str) {
            Some(source) => source,
            None => return ImportOutcome::Failed,
        };
        let path = format!("{}{}", name_str, SOURCE_EXT);
        let ast = match crate::parser::parse(&source, &path) {
            Ok(ast) => ast,
            Err(errors) => {
                for error in errors {
                    let line = format!("{}\n", error);
                    self.write_diag(&line);
                }
                return ImportOutcome::Failed;
            }
        };
        let saved = self.object_manager.gc_disabled();
        self.object_manager.gc_disable(true);
        let module = self.get_or_create_module(&name_str);
        let function = match crate::compiler::compile(self, module, &ast, &path) {
            Ok(function) => function,
            Err(errors) => {
                self.object_manager.gc_disable(saved);
                for error in errors {
                    let line = format!("{}\n", error);
                    self.write_diag(&line);
                }
                return ImportOutcome::Failed;
            }
        };
        let closure = self.object_manager.alloc_closure(function);
        self.push(make_object_value(closure));
        self.object_manager.gc_disable(saved);
        ImportOutcome::Fresh
    }

    /// The IMPORT opcode: load if needed, bind the module value under
    /// `bind_name` in the importing module, and start executing a fresh
    /// module's top level.
    pub(crate) fn op_import(
        &mut self,
        module_name: *mut ObjectString,
        bind_name: *mut ObjectString,
    ) -> bool {
        let importing = self.current_module();
        match self.import_module(module_name) {
            ImportOutcome::Failed => self.rt_raise(
                "ImportException",
                format!("Cannot load module '{}'.", unsafe { (*module_name).as_str() }),
            ),
            outcome => {
                let module_value = self
                    .modules
                    .get(module_name)
                    .expect("imported module not registered");
                unsafe { (*importing).globals.insert(bind_name, module_value) };
                if outcome == ImportOutcome::Fresh {
                    let closure = self.peek(0);
                    self.call_value(closure, 0)
                } else {
                    true
                }
            }
        }
    }

    /// Search the import paths for `<name>.jsr`, then for a package
    /// directory exposing `<name>/__package__.jsr`. Dots in the module name
    /// map onto directory separators.
    fn load_source(&self, name: &str) -> Option<String> {
        let relative = name.replace('.', "/");
        for dir in &self.import_paths {
            let file = dir.join(format!("{}{}", relative, SOURCE_EXT));
            if let Ok(source) = std::fs::read_to_string(&file) {
                return Some(source);
            }
            let package = dir.join(&relative).join(PACKAGE_FILE);
            if let Ok(source) = std::fs::read_to_string(&package) {
                return Some(source);
            }
        }
        None
    }
}
