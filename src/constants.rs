//! Runtime and compiler limits shared across the VM.

/// Max call-frame depth; exceeding it raises a recoverable StackOverflowError.
pub const RECURSION_LIMIT: usize = 5000;

/// Value-stack slots reserved beyond a frame's statically computed need,
/// so natives always have working room without calling ensure_stack.
pub const MIN_NATIVE_STACK: usize = 20;

/// First GC collection point: 10 MiB of live allocation.
pub const INIT_GC: usize = 1024 * 1024 * 10;

/// The heap-grow threshold multiplier applied after each collection.
pub const HEAP_GROW_RATE: usize = 2;

/// Max number of try handlers active in a single frame.
pub const MAX_HANDLERS: usize = 10;

/// Max nesting of try blocks inside one function (compile-time check).
pub const MAX_TRY_DEPTH: usize = MAX_HANDLERS;

/// At most 256 local slots per function (slot 0 is reserved).
pub const MAX_LOCALS: usize = 256;

/// Per-function constant pool limit (2-byte operand).
pub const MAX_CONSTANTS: usize = u16::MAX as usize;

/// Strings at or under this size are always interned.
pub const INTERN_THRESHOLD: usize = 256;

pub const MAIN_MODULE: &str = "__main__";
pub const CORE_MODULE: &str = "__core__";
pub const MODULE_NAME_GLOBAL: &str = "__name__";

pub const CTOR_NAME: &str = "new";
pub const THIS_NAME: &str = "this";
pub const SUPER_NAME: &str = "super";
pub const ANON_PREFIX: &str = "anon@";
pub const VARARG_NAME: &str = "args";

pub const EXC_ERR_FIELD: &str = "_err";
pub const EXC_TRACE_FIELD: &str = "_stacktrace";

pub const SOURCE_EXT: &str = ".jsr";
pub const PACKAGE_FILE: &str = "__package__.jsr";
