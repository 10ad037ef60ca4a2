//! The compiler: a single pass over the AST producing bytecode.
//!
//! Per-function state tracks locals (slot 0 is the receiver or the function
//! itself), upvalue captures, scope depth, active loops, and active try
//! blocks. `ensure` bodies are emitted once at their handler location for
//! the normal and exception paths, and inlined before any `return`, `break`
//! or `continue` that jumps out of the protected region.
//!
//! Compilation runs with the GC paused: partially built functions are
//! reachable only from compiler state until the top-level function is
//! handed to the object manager.

use crate::ast::{Ast, BinaryOp, Expr, FunDecl, LogicalOp, Stmt, UnaryOp};
use crate::chunk::OpCode;
use crate::constants::{
    CTOR_NAME, MAX_LOCALS, MAX_TRY_DEPTH, SUPER_NAME, THIS_NAME, VARARG_NAME,
};
use crate::errors::CompileError;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_module::ObjectModule;
use crate::value::{make_number_value, make_object_value, Value};
use crate::vm::VM;

pub fn compile(
    vm: &mut VM,
    module: *mut ObjectModule,
    ast: &Ast,
    file: &str,
) -> Result<*mut ObjectFunction, Vec<CompileError>> {
    debug_assert!(vm.object_manager.gc_disabled());
    let mut compiler = Compiler {
        vm,
        module,
        file: file.to_string(),
        funcs: Vec::new(),
        classes: Vec::new(),
        errors: Vec::new(),
        line: 1,
    };
    compiler.begin_function(FuncKind::Script, 0, false);
    for stmt in &ast.stmts {
        compiler.compile_stmt(stmt);
    }
    let function = compiler.end_function("<script>");
    if compiler.errors.is_empty() {
        Ok(function)
    } else {
        Err(compiler.errors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    Script,
    Function,
    Method,
    Ctor,
}

struct Local {
    name: String,
    // -1 marks a declared-but-uninitialized local.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopContext {
    continue_target: usize,
    scope_depth: i32,
    try_depth: usize,
    break_jumps: Vec<usize>,
}

#[derive(Clone, Copy)]
struct TryContext<'ast> {
    ensure: Option<&'ast [Stmt]>,
}

struct FuncState<'ast> {
    function: Box<ObjectFunction>,
    kind: FuncKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopContext>,
    trys: Vec<TryContext<'ast>>,
    cur_stack: i32,
    max_stack: i32,
}

struct Compiler<'a, 'ast> {
    vm: &'a mut VM,
    module: *mut ObjectModule,
    file: String,
    funcs: Vec<FuncState<'ast>>,
    classes: Vec<bool>, // has_superclass per enclosing class statement
    errors: Vec<CompileError>,
    line: u32,
}

impl<'a, 'ast> Compiler<'a, 'ast> {
    // ---- function state ----

    fn begin_function(&mut self, kind: FuncKind, arity: usize, vararg: bool) {
        let mut function = ObjectFunction::new(arity as u8);
        function.vararg = vararg;
        function.module = self.module;
        let slot_zero = Local {
            name: if kind == FuncKind::Method || kind == FuncKind::Ctor {
                THIS_NAME.to_string()
            } else {
                String::new()
            },
            depth: 0,
            captured: false,
        };
        self.funcs.push(FuncState {
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            trys: Vec::new(),
            // Slot 0 plus the parameter slots are occupied on entry.
            cur_stack: 1 + arity as i32 + if vararg { 1 } else { 0 },
            max_stack: 1 + arity as i32 + if vararg { 1 } else { 0 },
        });
    }

    /// Seal the current function and hand it to the heap. Returns the
    /// now-managed function pointer.
    fn end_function(&mut self, name: &str) -> *mut ObjectFunction {
        self.emit_return();
        let state = self.funcs.pop().expect("no function state");
        let mut function = state.function;
        function.upvalue_count = state.upvalues.len();
        function.max_stack = state.max_stack.max(0) as usize;
        if function.name.is_null() && state.kind != FuncKind::Script {
            function.name = self.vm.intern_string(name);
        }
        debug_feature::disassemble(&function, name, &self.errors);
        self.vm.object_manager.adopt(function)
    }

    fn cur(&self) -> &FuncState<'ast> {
        self.funcs.last().expect("no function state")
    }

    fn cur_mut(&mut self) -> &mut FuncState<'ast> {
        self.funcs.last_mut().expect("no function state")
    }

    fn error(&mut self, message: &str) {
        self.errors.push(CompileError {
            file: self.file.clone(),
            line: self.line,
            message: message.to_string(),
        });
    }

    // ---- emission ----

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line;
        self.cur_mut().function.chunk.write(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line;
        self.cur_mut().function.chunk.write_u16(value, line);
    }

    fn adjust_stack(&mut self, effect: i32) {
        let state = self.cur_mut();
        state.cur_stack += effect;
        if state.cur_stack < 0 {
            state.cur_stack = 0;
        }
        if state.cur_stack > state.max_stack {
            state.max_stack = state.cur_stack;
        }
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
        self.adjust_stack(fixed_stack_effect(op));
    }

    /// Ops whose stack effect depends on an operand (calls, literals).
    fn emit_op_with_effect(&mut self, op: OpCode, effect: i32) {
        self.emit_byte(op.to_byte());
        self.adjust_stack(effect);
    }

    fn current_len(&self) -> usize {
        self.cur().function.chunk.len()
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        match self.cur_mut().function.chunk.add_constant(value) {
            Some(index) => index as u16,
            None => {
                self.error("Too many constants in one function.");
                0
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let string = self.vm.intern_string(name);
        self.make_constant(make_object_value(string))
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_u16(index);
    }

    /// Emit a forward jump with a placeholder offset; returns the operand
    /// position for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_len() - 2
    }

    fn patch_jump(&mut self, operand_pos: usize) {
        let distance = self.current_len() - operand_pos - 2;
        if distance > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = &mut self.cur_mut().function.chunk;
        chunk.patch(operand_pos, ((distance >> 8) & 0xff) as u8);
        chunk.patch(operand_pos + 1, (distance & 0xff) as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        // +2 skips the operand of the Loop instruction itself.
        let distance = self.current_len() - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_u16(distance as u16);
    }

    fn emit_return(&mut self) {
        if self.cur().kind == FuncKind::Ctor {
            // Constructors always return the receiver.
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
    }

    // ---- scopes and locals ----

    fn begin_scope(&mut self) {
        self.cur_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.cur_mut().scope_depth -= 1;
        let depth = self.cur().scope_depth;
        loop {
            let top = match self.cur().locals.last() {
                Some(local) if local.depth > depth => Some(local.captured),
                _ => None,
            };
            match top {
                Some(true) => self.emit_op(OpCode::CloseUpvalue),
                Some(false) => self.emit_op(OpCode::Pop),
                None => break,
            }
            self.cur_mut().locals.pop();
        }
    }

    /// Emit pops for locals deeper than `depth` without forgetting them,
    /// for paths (break/continue) that jump out of nested scopes.
    fn discard_locals_to(&mut self, depth: i32) {
        let captured: Vec<bool> = self
            .cur()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Declare a local in the current scope (no code emitted: the value the
    /// initializer leaves on the stack becomes the slot). Returns the slot.
    fn declare_local(&mut self, name: &str) -> usize {
        let depth = self.cur().scope_depth;
        let mut collision = false;
        for local in self.cur().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                collision = true;
                break;
            }
        }
        if collision {
            self.error("Already a variable with this name in this scope.");
        }
        if self.cur().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return 0;
        }
        self.cur_mut().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
        });
        self.cur().locals.len() - 1
    }

    fn mark_initialized(&mut self) {
        let depth = self.cur().scope_depth;
        if let Some(local) = self.cur_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&mut self, func: usize, name: &str) -> Option<usize> {
        let mut uninitialized = false;
        let mut found = None;
        for (index, local) in self.funcs[func].locals.iter().enumerate().rev() {
            if local.name == name && !local.name.is_empty() {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(index);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn resolve_upvalue(&mut self, func: usize, name: &str) -> Option<usize> {
        if func == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(func - 1, name) {
            self.funcs[func - 1].locals[local].captured = true;
            return Some(self.add_upvalue(func, local as u8, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(func - 1, name) {
            return Some(self.add_upvalue(func, upvalue as u8, false));
        }
        None
    }

    /// Capture indices are stable: the same (is_local, index) pair always
    /// resolves to the same upvalue slot.
    fn add_upvalue(&mut self, func: usize, index: u8, is_local: bool) -> usize {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.funcs[func].upvalues.iter().position(|u| *u == desc) {
            return existing;
        }
        if self.funcs[func].upvalues.len() >= MAX_LOCALS {
            self.error("Too many captured variables in function.");
            return 0;
        }
        self.funcs[func].upvalues.push(desc);
        self.funcs[func].upvalues.len() - 1
    }

    // ---- statements ----

    fn compile_stmts(&mut self, stmts: &'ast [Stmt]) {
        for stmt in stmts {
            self.compile_stmt(stmt);
        }
    }

    fn compile_block(&mut self, stmts: &'ast [Stmt]) {
        self.begin_scope();
        self.compile_stmts(stmts);
        self.end_scope();
    }

    fn compile_stmt(&mut self, stmt: &'ast Stmt) {
        match stmt {
            Stmt::Var { name, init, line } => {
                self.line = *line;
                self.compile_var_decl(name, init.as_ref());
            }
            Stmt::Fun(decl) => {
                self.line = decl.line;
                self.compile_fun_decl(decl);
            }
            Stmt::Class {
                name,
                superclass,
                methods,
                line,
            } => {
                self.line = *line;
                self.compile_class(name, superclass.as_ref(), methods);
            }
            Stmt::If {
                branches,
                else_body,
                line,
            } => {
                self.line = *line;
                self.compile_if(branches, else_body.as_deref());
            }
            Stmt::While { cond, body, line } => {
                self.line = *line;
                self.compile_while(cond, body);
            }
            Stmt::For {
                init,
                cond,
                incr,
                body,
                line,
            } => {
                self.line = *line;
                self.compile_for(init.as_deref(), cond.as_ref(), incr.as_ref(), body);
            }
            Stmt::ForIn {
                var,
                iterable,
                body,
                line,
            } => {
                self.line = *line;
                self.compile_for_in(var, iterable, body);
            }
            Stmt::Try {
                body,
                excepts,
                ensure,
                line,
            } => {
                self.line = *line;
                self.compile_try(body, excepts, ensure.as_deref());
            }
            Stmt::Raise { value, line } => {
                self.line = *line;
                self.compile_expr(value);
                self.emit_op(OpCode::Raise);
            }
            Stmt::Return { value, line } => {
                self.line = *line;
                self.compile_return(value.as_ref());
            }
            Stmt::Print { value, line } => {
                self.line = *line;
                self.compile_expr(value);
                self.emit_op(OpCode::Print);
            }
            Stmt::Import {
                module,
                alias,
                line,
            } => {
                self.line = *line;
                let module_const = self.identifier_constant(module);
                let bind_const = self.identifier_constant(alias.as_deref().unwrap_or(module));
                self.emit_op(OpCode::Import);
                self.emit_u16(module_const);
                self.emit_u16(bind_const);
                // Both the fresh and the already-loaded path leave exactly
                // one value behind (the top-level result or null).
                self.emit_op(OpCode::Pop);
            }
            Stmt::Break { line } => {
                self.line = *line;
                self.compile_break();
            }
            Stmt::Continue { line } => {
                self.line = *line;
                self.compile_continue();
            }
            Stmt::Block { body, line } => {
                self.line = *line;
                self.compile_block(body);
            }
            Stmt::Expr { expr, line } => {
                self.line = *line;
                self.compile_expr(expr);
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn compile_var_decl(&mut self, name: &str, init: Option<&'ast Expr>) {
        if self.cur().scope_depth > 0 {
            self.declare_local(name);
            match init {
                Some(expr) => self.compile_expr(expr),
                None => self.emit_op(OpCode::Null),
            }
            self.mark_initialized();
        } else {
            let name_const = self.identifier_constant(name);
            match init {
                Some(expr) => self.compile_expr(expr),
                None => self.emit_op(OpCode::Null),
            }
            self.emit_op(OpCode::DefineGlobal);
            self.emit_u16(name_const);
        }
    }

    fn compile_fun_decl(&mut self, decl: &'ast FunDecl) {
        if self.cur().scope_depth > 0 {
            // Initialized before the body compiles so it can recurse.
            self.declare_local(&decl.name);
            self.mark_initialized();
            self.compile_function(decl, FuncKind::Function);
        } else {
            let name_const = self.identifier_constant(&decl.name);
            self.compile_function(decl, FuncKind::Function);
            self.emit_op(OpCode::DefineGlobal);
            self.emit_u16(name_const);
        }
    }

    /// Compile a function body in a fresh state and emit MAKE_CLOSURE with
    /// its capture descriptors.
    fn compile_function(&mut self, decl: &'ast FunDecl, kind: FuncKind) {
        if decl.params.len() > 255 {
            self.error("Can't have more than 255 parameters.");
        }
        self.begin_function(kind, decl.params.len(), decl.vararg);
        let name = self.vm.intern_string(&decl.name);
        self.cur_mut().function.name = name;
        self.begin_scope();
        for param in &decl.params {
            self.declare_local(param);
            self.mark_initialized();
        }
        if decl.vararg {
            // Surplus arguments arrive packed in a tuple in this slot.
            self.declare_local(VARARG_NAME);
            self.mark_initialized();
        }
        self.compile_stmts(&decl.body);
        let upvalues: Vec<UpvalueDesc> = self.cur().upvalues.clone();
        self.cur_mut().function.upvalue_count = upvalues.len();
        let function = self.end_function(&decl.name);
        let const_index = self.make_constant(make_object_value(function));
        self.emit_op(OpCode::MakeClosure);
        self.emit_u16(const_index);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn compile_class(
        &mut self,
        name: &str,
        superclass: Option<&'ast Expr>,
        methods: &'ast [FunDecl],
    ) {
        let name_const = self.identifier_constant(name);
        let is_local_binding = self.cur().scope_depth > 0;
        if is_local_binding {
            self.declare_local(name);
        }
        self.emit_op(OpCode::NewClass);
        self.emit_u16(name_const);
        if is_local_binding {
            self.mark_initialized();
        } else {
            self.emit_op(OpCode::DefineGlobal);
            self.emit_u16(name_const);
        }

        self.classes.push(superclass.is_some());
        if let Some(super_expr) = superclass {
            // The superclass becomes a hidden local so methods can capture
            // it for super dispatch.
            self.begin_scope();
            self.declare_local(SUPER_NAME);
            self.compile_expr(super_expr);
            self.mark_initialized();
            self.compile_name_get(name);
            self.emit_op(OpCode::Inherit);
        }

        // Reload the class to install methods on it.
        self.compile_name_get(name);
        for method in methods {
            self.line = method.line;
            let method_const = self.identifier_constant(&method.name);
            let kind = if method.name == CTOR_NAME {
                FuncKind::Ctor
            } else {
                FuncKind::Method
            };
            self.compile_function(method, kind);
            self.emit_op(OpCode::DefMethod);
            self.emit_u16(method_const);
        }
        self.emit_op(OpCode::Pop);

        if superclass.is_some() {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn compile_if(&mut self, branches: &'ast [(Expr, Vec<Stmt>)], else_body: Option<&'ast [Stmt]>) {
        let mut end_jumps = Vec::new();
        for (cond, body) in branches {
            self.compile_expr(cond);
            let false_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            self.compile_block(body);
            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(false_jump);
            self.emit_op(OpCode::Pop);
        }
        if let Some(body) = else_body {
            self.compile_block(body);
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn compile_while(&mut self, cond: &'ast Expr, body: &'ast [Stmt]) {
        let loop_start = self.current_len();
        self.push_loop(loop_start);
        self.compile_expr(cond);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.compile_block(body);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.pop_loop();
    }

    fn compile_for(
        &mut self,
        init: Option<&'ast Stmt>,
        cond: Option<&'ast Expr>,
        incr: Option<&'ast Expr>,
        body: &'ast [Stmt],
    ) {
        self.begin_scope();
        if let Some(init) = init {
            self.compile_stmt(init);
        }
        let loop_start = self.current_len();
        let exit_jump = cond.map(|cond| {
            self.compile_expr(cond);
            let jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            jump
        });
        // The increment runs between iterations but is emitted first, so
        // the body jumps over it and loops back into it.
        let continue_target = if let Some(incr) = incr {
            let body_jump = self.emit_jump(OpCode::Jump);
            let incr_start = self.current_len();
            self.compile_expr(incr);
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);
            self.patch_jump(body_jump);
            incr_start
        } else {
            loop_start
        };
        self.push_loop(continue_target);
        self.compile_block(body);
        self.emit_loop(continue_target);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.pop_loop();
        self.end_scope();
    }

    /// `for x in it` drives the `__iter__`/`__next__` protocol: `__iter__`
    /// advances the iteration state (falsy-null ends it) and `__next__`
    /// produces the value for that state.
    fn compile_for_in(&mut self, var: &str, iterable: &'ast Expr, body: &'ast [Stmt]) {
        self.begin_scope();
        self.declare_local("@iter");
        self.compile_expr(iterable);
        self.mark_initialized();
        let iter_slot = self.cur().locals.len() - 1;
        self.declare_local("@res");
        self.emit_op(OpCode::Null);
        self.mark_initialized();
        let res_slot = self.cur().locals.len() - 1;

        let iter_const = self.identifier_constant("__iter__");
        let next_const = self.identifier_constant("__next__");

        let loop_start = self.current_len();
        self.push_loop(loop_start);
        self.emit_op(OpCode::GetLocal);
        self.emit_byte(iter_slot as u8);
        self.emit_op(OpCode::GetLocal);
        self.emit_byte(res_slot as u8);
        self.emit_op_with_effect(OpCode::Invoke, -1);
        self.emit_u16(iter_const);
        self.emit_byte(1);
        self.emit_op(OpCode::SetLocal);
        self.emit_byte(res_slot as u8);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.emit_op(OpCode::GetLocal);
        self.emit_byte(iter_slot as u8);
        self.emit_op(OpCode::GetLocal);
        self.emit_byte(res_slot as u8);
        self.emit_op_with_effect(OpCode::Invoke, -1);
        self.emit_u16(next_const);
        self.emit_byte(1);

        // The produced value becomes the loop variable's slot.
        self.begin_scope();
        self.declare_local(var);
        self.mark_initialized();
        self.compile_stmts(body);
        self.end_scope();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.pop_loop();
        self.end_scope();
    }

    fn push_loop(&mut self, continue_target: usize) {
        let scope_depth = self.cur().scope_depth;
        let try_depth = self.cur().trys.len();
        self.cur_mut().loops.push(LoopContext {
            continue_target,
            scope_depth,
            try_depth,
            break_jumps: Vec::new(),
        });
    }

    /// Patch pending breaks to land here, after the loop's own cleanup.
    fn pop_loop(&mut self) {
        let jumps = self
            .cur_mut()
            .loops
            .pop()
            .expect("loop context underflow")
            .break_jumps;
        for jump in jumps {
            self.patch_jump(jump);
        }
    }

    fn compile_break(&mut self) {
        if self.cur().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let target_try = self.cur().loops.last().unwrap().try_depth;
        let target_depth = self.cur().loops.last().unwrap().scope_depth;
        self.emit_try_exits(target_try);
        self.discard_locals_to(target_depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.cur_mut()
            .loops
            .last_mut()
            .unwrap()
            .break_jumps
            .push(jump);
    }

    fn compile_continue(&mut self) {
        if self.cur().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        let target_try = self.cur().loops.last().unwrap().try_depth;
        let target_depth = self.cur().loops.last().unwrap().scope_depth;
        let target = self.cur().loops.last().unwrap().continue_target;
        self.emit_try_exits(target_try);
        self.discard_locals_to(target_depth);
        self.emit_loop(target);
    }

    fn compile_return(&mut self, value: Option<&'ast Expr>) {
        if self.cur().kind == FuncKind::Script {
            self.error("Can't return from top-level code.");
            return;
        }
        match value {
            Some(expr) => {
                if self.cur().kind == FuncKind::Ctor {
                    self.error("Can't return a value from a constructor.");
                }
                self.compile_expr(expr);
                self.emit_try_exits(0);
                self.emit_op(OpCode::Return);
            }
            None => {
                self.emit_try_exits(0);
                self.emit_return();
            }
        }
    }

    /// Pop the runtime handlers of — and inline the ensure bodies of —
    /// every try block deeper than `down_to`, for a path that jumps out of
    /// them. The try contexts themselves stay put: compilation of the
    /// protected bodies continues after this exit path.
    fn emit_try_exits(&mut self, down_to: usize) {
        let contexts: Vec<TryContext<'ast>> = self.cur().trys.clone();
        for level in (down_to..contexts.len()).rev() {
            self.emit_op(OpCode::PopHandler);
            if let Some(stmts) = contexts[level].ensure {
                // Deeper contexts are gone from the exit path's view, so an
                // exit inside the inlined ensure unwinds only outer trys.
                self.cur_mut().trys.truncate(level);
                self.begin_scope();
                self.compile_stmts(stmts);
                self.end_scope();
            }
        }
        self.cur_mut().trys = contexts;
    }

    fn compile_try(
        &mut self,
        body: &'ast [Stmt],
        excepts: &'ast [crate::ast::ExceptClause],
        ensure: Option<&'ast [Stmt]>,
    ) {
        if self.cur().trys.len() >= MAX_TRY_DEPTH {
            self.error("Exceeded max number of nested try blocks.");
        }
        let has_ensure = ensure.is_some();
        self.emit_op(OpCode::SetupTry);
        let except_operand = self.current_len();
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        let ensure_operand = self.current_len();
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        let operands_end = self.current_len();

        self.cur_mut().trys.push(TryContext { ensure });
        self.compile_block(body);
        self.cur_mut().trys.pop();
        self.emit_op(OpCode::PopHandler);

        let mut ensure_jumps = Vec::new();
        let mut end_jumps = Vec::new();
        if has_ensure {
            // Normal completion: no pending exception.
            self.emit_op(OpCode::Null);
            ensure_jumps.push(self.emit_jump(OpCode::Jump));
        } else {
            end_jumps.push(self.emit_jump(OpCode::Jump));
        }

        if !excepts.is_empty() {
            self.patch_try_offset(except_operand, operands_end);
            // While an except body runs, the unwinder has re-armed an
            // ensure-only handler for this try (when one exists); exits
            // must pop it and run the ensure, so keep a context active.
            if has_ensure {
                self.cur_mut().trys.push(TryContext { ensure });
            }
            // Stack on entry: [exc]
            for clause in excepts {
                self.line = clause.line;
                self.emit_op(OpCode::Dup);
                self.compile_expr(&clause.class);
                self.emit_op(OpCode::Is);
                let next_clause = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);
                // The exception value on the stack becomes the clause local.
                self.begin_scope();
                self.declare_local(&clause.var);
                self.mark_initialized();
                self.compile_stmts(&clause.body);
                self.end_scope();
                if has_ensure {
                    self.emit_op(OpCode::PopHandler);
                    self.emit_op(OpCode::Null);
                    ensure_jumps.push(self.emit_jump(OpCode::Jump));
                } else {
                    end_jumps.push(self.emit_jump(OpCode::Jump));
                }
                self.patch_jump(next_clause);
                self.emit_op(OpCode::Pop);
            }
            if has_ensure {
                self.cur_mut().trys.pop();
            }
            // No clause matched: rethrow (the ensure handler, if armed,
            // catches it on the way out).
            self.emit_op(OpCode::Raise);
        }

        if let Some(ensure_body) = ensure {
            self.patch_try_offset(ensure_operand, operands_end);
            for jump in ensure_jumps {
                self.patch_jump(jump);
            }
            // Stack on entry: [pending] — null or the in-flight exception.
            // It occupies a slot for the whole ensure body, so reserve it
            // as a hidden local; END_HANDLER consumes it.
            self.begin_scope();
            self.declare_local("@pending");
            self.mark_initialized();
            self.compile_block(ensure_body);
            self.cur_mut().locals.pop();
            self.cur_mut().scope_depth -= 1;
            self.emit_op(OpCode::EndHandler);
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    /// Patch a SETUP_TRY offset operand to point at the current position,
    /// relative to the end of the instruction's operands.
    fn patch_try_offset(&mut self, operand_pos: usize, operands_end: usize) {
        let distance = self.current_len() - operands_end;
        if distance > u16::MAX as usize {
            self.error("Try block too large.");
        }
        let chunk = &mut self.cur_mut().function.chunk;
        chunk.patch(operand_pos, ((distance >> 8) & 0xff) as u8);
        chunk.patch(operand_pos + 1, (distance & 0xff) as u8);
    }

    // ---- expressions ----

    fn compile_expr(&mut self, expr: &'ast Expr) {
        self.line = expr.line();
        match expr {
            Expr::Number { value, .. } => self.emit_constant(make_number_value(*value)),
            Expr::Str { value, .. } => {
                let string = self.vm.intern_string(value);
                self.emit_constant(make_object_value(string));
            }
            Expr::True { .. } => self.emit_op(OpCode::True),
            Expr::False { .. } => self.emit_op(OpCode::False),
            Expr::Null { .. } => self.emit_op(OpCode::Null),
            Expr::ListLit { elements, .. } => {
                if elements.len() > 255 {
                    self.error("Too many elements in list literal.");
                }
                for element in elements {
                    self.compile_expr(element);
                }
                self.emit_op_with_effect(OpCode::BuildList, 1 - elements.len() as i32);
                self.emit_byte(elements.len() as u8);
            }
            Expr::TupleLit { elements, .. } => {
                if elements.len() > 255 {
                    self.error("Too many elements in tuple literal.");
                }
                for element in elements {
                    self.compile_expr(element);
                }
                self.emit_op_with_effect(OpCode::BuildTuple, 1 - elements.len() as i32);
                self.emit_byte(elements.len() as u8);
            }
            Expr::Name { name, .. } => self.compile_name_get(name),
            Expr::This { .. } => {
                if self.classes.is_empty() {
                    self.error("Can't use 'this' outside of a class.");
                }
                self.compile_name_get(THIS_NAME);
            }
            Expr::Assign { target, value, .. } => self.compile_assign(target, value),
            Expr::CompoundAssign {
                target, op, value, ..
            } => self.compile_compound_assign(target, *op, value),
            Expr::Binary {
                op, left, right, ..
            } => {
                self.compile_expr(left);
                self.compile_expr(right);
                self.line = expr.line();
                self.emit_binary_op(*op);
            }
            Expr::Logical {
                op, left, right, ..
            } => {
                self.compile_expr(left);
                let jump = match op {
                    LogicalOp::And => self.emit_jump(OpCode::JumpIfFalse),
                    LogicalOp::Or => self.emit_jump(OpCode::JumpIfTrue),
                };
                self.emit_op(OpCode::Pop);
                self.compile_expr(right);
                self.patch_jump(jump);
            }
            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand);
                self.line = expr.line();
                match op {
                    UnaryOp::Negate => self.emit_op(OpCode::Negate),
                    UnaryOp::Not => self.emit_op(OpCode::Not),
                    UnaryOp::Length => self.emit_op(OpCode::Length),
                }
            }
            Expr::Is { value, class, .. } => {
                self.compile_expr(value);
                self.compile_expr(class);
                self.emit_op(OpCode::Is);
            }
            Expr::Call { callee, args, .. } => self.compile_call(callee, args),
            Expr::Field { object, name, .. } => {
                self.compile_expr(object);
                let name_const = self.identifier_constant(name);
                self.emit_op(OpCode::GetField);
                self.emit_u16(name_const);
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object);
                self.compile_expr(index);
                self.emit_op(OpCode::GetIndex);
            }
            Expr::SuperCall { name, args, .. } => self.compile_super_call(name.as_deref(), args),
            Expr::Lambda(decl) => self.compile_function(decl, FuncKind::Function),
        }
    }

    fn emit_binary_op(&mut self, op: BinaryOp) {
        match op {
            BinaryOp::Add => self.emit_op(OpCode::Add),
            BinaryOp::Subtract => self.emit_op(OpCode::Subtract),
            BinaryOp::Multiply => self.emit_op(OpCode::Multiply),
            BinaryOp::Divide => self.emit_op(OpCode::Divide),
            BinaryOp::Modulo => self.emit_op(OpCode::Modulo),
            BinaryOp::Power => self.emit_op(OpCode::Power),
            BinaryOp::Equal => self.emit_op(OpCode::Equal),
            BinaryOp::NotEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            BinaryOp::Less => self.emit_op(OpCode::Less),
            BinaryOp::LessEqual => self.emit_op(OpCode::LessEqual),
            BinaryOp::Greater => self.emit_op(OpCode::Greater),
            BinaryOp::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
        }
    }

    fn compile_name_get(&mut self, name: &str) {
        let func = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(func, name) {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(slot as u8);
        } else if let Some(index) = self.resolve_upvalue(func, name) {
            self.emit_op(OpCode::GetUpvalue);
            self.emit_byte(index as u8);
        } else {
            // No static binding check: unresolved names are looked up in
            // the module globals at run time.
            let name_const = self.identifier_constant(name);
            self.emit_op(OpCode::GetGlobal);
            self.emit_u16(name_const);
        }
    }

    fn compile_name_set(&mut self, name: &str) {
        let func = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(func, name) {
            self.emit_op(OpCode::SetLocal);
            self.emit_byte(slot as u8);
        } else if let Some(index) = self.resolve_upvalue(func, name) {
            self.emit_op(OpCode::SetUpvalue);
            self.emit_byte(index as u8);
        } else {
            let name_const = self.identifier_constant(name);
            self.emit_op(OpCode::SetGlobal);
            self.emit_u16(name_const);
        }
    }

    fn compile_assign(&mut self, target: &'ast Expr, value: &'ast Expr) {
        match target {
            Expr::Name { name, .. } => {
                self.compile_expr(value);
                self.compile_name_set(name);
            }
            Expr::Field { object, name, .. } => {
                self.compile_expr(object);
                self.compile_expr(value);
                let name_const = self.identifier_constant(name);
                self.emit_op(OpCode::SetField);
                self.emit_u16(name_const);
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object);
                self.compile_expr(index);
                self.compile_expr(value);
                self.emit_op(OpCode::SetIndex);
            }
            _ => self.error("Invalid assignment target."),
        }
    }

    fn compile_compound_assign(&mut self, target: &'ast Expr, op: BinaryOp, value: &'ast Expr) {
        match target {
            Expr::Name { name, .. } => {
                self.compile_name_get(name);
                self.compile_expr(value);
                self.emit_binary_op(op);
                self.compile_name_set(name);
            }
            Expr::Field { object, name, .. } => {
                let name_const = self.identifier_constant(name);
                self.compile_expr(object);
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::GetField);
                self.emit_u16(name_const);
                self.compile_expr(value);
                self.emit_binary_op(op);
                self.emit_op(OpCode::SetField);
                self.emit_u16(name_const);
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object);
                self.compile_expr(index);
                self.emit_op(OpCode::Dup2);
                self.emit_op(OpCode::GetIndex);
                self.compile_expr(value);
                self.emit_binary_op(op);
                self.emit_op(OpCode::SetIndex);
            }
            _ => self.error("Invalid assignment target."),
        }
    }

    fn compile_call(&mut self, callee: &'ast Expr, args: &'ast [Expr]) {
        // Method-call syntax compiles to a single INVOKE dispatch.
        if let Expr::Field { object, name, .. } = callee {
            self.compile_expr(object);
            for arg in args {
                self.compile_expr(arg);
            }
            let name_const = self.identifier_constant(name);
            self.emit_op_with_effect(OpCode::Invoke, -(args.len() as i32));
            self.emit_u16(name_const);
            self.emit_byte(args.len() as u8);
            return;
        }
        self.compile_expr(callee);
        for arg in args {
            self.compile_expr(arg);
        }
        self.emit_op_with_effect(OpCode::Call, -(args.len() as i32));
        self.emit_byte(args.len() as u8);
    }

    fn compile_super_call(&mut self, name: Option<&str>, args: &'ast [Expr]) {
        match self.classes.last() {
            None => {
                self.error("Can't use 'super' outside of a class.");
                self.emit_op(OpCode::Null);
                return;
            }
            Some(false) => {
                self.error("Can't use 'super' in a class with no superclass.");
                self.emit_op(OpCode::Null);
                return;
            }
            Some(true) => {}
        }
        let method_const = self.identifier_constant(name.unwrap_or(CTOR_NAME));
        self.compile_name_get(THIS_NAME);
        for arg in args {
            self.compile_expr(arg);
        }
        self.compile_name_get(SUPER_NAME);
        self.emit_op_with_effect(OpCode::SuperInvoke, -(args.len() as i32) - 1);
        self.emit_u16(method_const);
        self.emit_byte(args.len() as u8);
    }
}

/// Worst-case stack deltas for operand-independent opcodes.
fn fixed_stack_effect(op: OpCode) -> i32 {
    match op {
        OpCode::Null
        | OpCode::True
        | OpCode::False
        | OpCode::Constant
        | OpCode::Dup
        | OpCode::GetLocal
        | OpCode::GetGlobal
        | OpCode::GetUpvalue
        | OpCode::MakeClosure
        | OpCode::NewClass
        | OpCode::Import
        | OpCode::SetupTry => 1,
        OpCode::Dup2 => 2,
        OpCode::Pop
        | OpCode::Print
        | OpCode::Raise
        | OpCode::DefineGlobal
        | OpCode::DefMethod
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::EndHandler
        | OpCode::Inherit
        | OpCode::GetIndex
        | OpCode::SetField
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::GreaterEqual
        | OpCode::Less
        | OpCode::LessEqual
        | OpCode::Is
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Modulo
        | OpCode::Power => -1,
        OpCode::SetIndex => -2,
        OpCode::SetLocal
        | OpCode::SetGlobal
        | OpCode::SetUpvalue
        | OpCode::GetField
        | OpCode::Negate
        | OpCode::Not
        | OpCode::Length
        | OpCode::Jump
        | OpCode::JumpIfFalse
        | OpCode::JumpIfTrue
        | OpCode::Loop
        | OpCode::PopHandler => 0,
        // Calls and literal builders pass their effect explicitly.
        OpCode::Call | OpCode::Invoke | OpCode::SuperInvoke | OpCode::BuildList | OpCode::BuildTuple => 0,
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn disassemble(function: &ObjectFunction, name: &str, errors: &[CompileError]) {
        if errors.is_empty() {
            eprint!("{}", debug::disassemble_chunk(&function.chunk, name));
        }
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble(_function: &ObjectFunction, _name: &str, _errors: &[CompileError]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::value::as_number;

    fn compile_source(vm: &mut VM, source: &str) -> Result<*mut ObjectFunction, Vec<CompileError>> {
        let ast = parse(source, "<test>").expect("source should parse");
        let module = vm.main_module();
        vm.object_manager.gc_disable(true);
        let result = compile(vm, module, &ast, "<test>");
        vm.object_manager.gc_disable(false);
        result
    }

    fn expect_error(source: &str, fragment: &str) {
        let mut vm = VM::new();
        let errors = compile_source(&mut vm, source).expect_err("expected a compile error");
        assert!(
            errors.iter().any(|e| e.message.contains(fragment)),
            "no error containing {:?} in {:?}",
            fragment,
            errors
        );
    }

    #[test]
    fn compiles_arithmetic_expression() {
        let mut vm = VM::new();
        let function = compile_source(&mut vm, "1 + 2 * 3").unwrap();
        let chunk = unsafe { &(*function).chunk };
        // Constants deduplicate per function and appear in source order.
        let constants: Vec<f64> = chunk.iter_constants().map(as_number).collect();
        assert_eq!(constants, vec![1.0, 2.0, 3.0]);
        assert_eq!(chunk.read(0), OpCode::Constant.to_byte());
        // expr stmt pops; script epilogue returns null.
        let tail = &chunk.code[chunk.len() - 3..];
        assert_eq!(tail[0], OpCode::Pop.to_byte());
        assert_eq!(tail[1], OpCode::Null.to_byte());
        assert_eq!(tail[2], OpCode::Return.to_byte());
    }

    #[test]
    fn duplicate_literals_share_constant_slots() {
        let mut vm = VM::new();
        let function = compile_source(&mut vm, "var a = 7; var b = 7; var c = \"s\"; var d = \"s\"").unwrap();
        let chunk = unsafe { &(*function).chunk };
        // 7 and "s" once each, plus the four global names.
        assert_eq!(chunk.iter_constants().count(), 6);
    }

    #[test]
    fn locals_emit_no_definition_instruction() {
        let mut vm = VM::new();
        let function =
            compile_source(&mut vm, "begin var a = 1; print a end").unwrap();
        let chunk = unsafe { &(*function).chunk };
        let code = &chunk.code;
        // No DefineGlobal anywhere: `a` lives on the stack.
        assert!(!code.contains(&OpCode::DefineGlobal.to_byte()));
        assert!(code.contains(&OpCode::GetLocal.to_byte()));
    }

    #[test]
    fn too_many_locals_is_a_compile_error() {
        let decls: String = (0..=256)
            .map(|i| format!("var v{} = 0\n", i))
            .collect();
        expect_error(&format!("begin {} end", decls), "Too many local variables");
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        expect_error("break", "outside of a loop");
        expect_error("continue", "outside of a loop");
    }

    #[test]
    fn super_outside_class_is_a_compile_error() {
        expect_error("fun f() super.m() end", "outside of a class");
        expect_error(
            "class A fun m() super.m() end end",
            "no superclass",
        );
    }

    #[test]
    fn return_at_top_level_is_a_compile_error() {
        expect_error("return 1", "top-level");
    }

    #[test]
    fn value_return_from_ctor_is_a_compile_error() {
        expect_error(
            "class A fun new() return 1 end end",
            "constructor",
        );
    }

    #[test]
    fn self_read_in_initializer_is_a_compile_error() {
        expect_error("begin var a = a end", "its own initializer");
    }

    #[test]
    fn shadowing_in_same_scope_is_a_compile_error() {
        expect_error("begin var a = 1; var a = 2 end", "Already a variable");
    }

    #[test]
    fn too_many_nested_trys_is_a_compile_error() {
        let mut nested = String::from("print 0");
        for _ in 0..11 {
            nested = format!("try {} except Exception e print 1 end", nested);
        }
        expect_error(&nested, "nested try");
    }

    #[test]
    fn closure_captures_enclosing_local() {
        let mut vm = VM::new();
        let function = compile_source(
            &mut vm,
            "fun make() var c = 0; fun inc() c = c + 1; return c end; return inc end",
        )
        .unwrap();
        let chunk = unsafe { &(*function).chunk };
        // The outer function is a constant of the script chunk; the inner
        // one is a constant of the outer chunk with one upvalue.
        let outer = chunk
            .iter_constants()
            .find(|v| crate::value::is_function(v))
            .expect("outer function constant");
        let outer_fn = crate::value::as_function(outer);
        let inner = unsafe {
            (*outer_fn)
                .chunk
                .iter_constants()
                .find(|v| crate::value::is_function(v))
                .expect("inner function constant")
        };
        let inner_fn = crate::value::as_function(inner);
        unsafe {
            assert_eq!((*inner_fn).upvalue_count, 1);
            assert_eq!((*outer_fn).upvalue_count, 0);
        }
    }

    #[test]
    fn jump_targets_resolve_forward() {
        let mut vm = VM::new();
        let function =
            compile_source(&mut vm, "if true then print 1 else print 2 end").unwrap();
        let chunk = unsafe { &(*function).chunk };
        // Find the JumpIfFalse and verify its target lands inside the chunk
        // past the then-branch.
        let mut offset = 0;
        let mut found = false;
        while offset < chunk.len() {
            if chunk.read(offset) == OpCode::JumpIfFalse.to_byte() {
                let distance = chunk.read_u16(offset + 1) as usize;
                let target = offset + 3 + distance;
                assert!(target < chunk.len());
                found = true;
                break;
            }
            offset += 1;
        }
        assert!(found, "no JumpIfFalse emitted");
    }

    #[test]
    fn max_stack_is_positive_and_bounded() {
        let mut vm = VM::new();
        let function = compile_source(&mut vm, "print 1 + (2 + (3 + 4))").unwrap();
        unsafe {
            // Slot 0 plus three pending operands.
            assert!((*function).max_stack >= 4);
            assert!((*function).max_stack < 64);
        }
    }
}
