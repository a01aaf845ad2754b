//! Code generation
//!
//! Two backends consume the same AST: `go` emits one self-contained Go
//! program whose preamble synthesizes the runtime it needs, and `rust`
//! emits one Rust program against the fixed-name `ual_runtime` API.
//! Divergences are isolated here; the parser knows nothing about targets.
//!
//! The generators also own the semantic rules the parser does not check:
//! type boundaries at container crossings, per-stack lifecycle (declared →
//! live → frozen), perspective validity, and the compute-block
//! restrictions. Violations become [`Diagnostic`]s; generation continues
//! so one run reports everything it can find.
//!
//! # Module structure
//!
//! - `mod.rs`: shared state (stack registry, boundary rules, walkers)
//! - `go.rs`: the Go backend
//! - `rust.rs`: the Rust backend

mod go;
mod rust;

use crate::ast::{ElemType, Expr, Perspective, Program, Stmt};
use crate::config::{Backend, CompileOptions};
use crate::diagnostics::Diagnostic;
use std::collections::{HashMap, HashSet};

/// Error type for code generation operations.
///
/// Lets the emitters use `?` both for logical failures and for `write!`
/// into the output buffer.
#[derive(Debug)]
pub enum CodeGenError {
    /// A logical error (invalid program state mid-generation)
    Logic(String),
    /// A formatting error while writing emitted source
    Format(std::fmt::Error),
}

impl std::fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeGenError::Logic(s) => write!(f, "{}", s),
            CodeGenError::Format(e) => write!(f, "code generation error: {}", e),
        }
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError::Logic(s)
    }
}

impl From<std::fmt::Error> for CodeGenError {
    fn from(e: std::fmt::Error) -> Self {
        CodeGenError::Format(e)
    }
}

/// Everything emitted for one compilation.
#[derive(Debug)]
pub struct GeneratedCode {
    pub code: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Generate target source for `program`. Diagnostics are collected, not
/// fatal: callers treat a nonempty list as failure but still get the
/// code produced so far.
pub fn generate(program: &Program, options: &CompileOptions) -> Result<GeneratedCode, CodeGenError> {
    match options.backend {
        Backend::Go => go::GoBackend::new(options.clone()).generate(program),
        Backend::Rust => rust::RustBackend::new(options.clone()).generate(program),
    }
}

// ----------------------------------------------------------------------
// Per-stack generator state
// ----------------------------------------------------------------------

/// Lifecycle of a declared stack as far as it is statically knowable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackState {
    Live,
    /// `freeze` was executed in straight-line code at this scope; further
    /// statically visible writes are compile diagnostics.
    Frozen,
}

/// What the generator tracks for each declared stack.
#[derive(Debug, Clone)]
pub(crate) struct StackInfo {
    /// Identifier in the emitted program (aliases share it).
    pub rt_name: String,
    pub elem: ElemType,
    pub perspective: Perspective,
    pub capacity: Option<u64>,
    /// Program-level (hoisted to a global) vs. function-local.
    pub global: bool,
    pub state: StackState,
    /// Flows into a spawn body or select case; must be synchronized and
    /// outlive every task that borrowed it.
    pub shared: bool,
}

/// A declared view: a stack handle with a perspective override.
#[derive(Debug, Clone)]
pub(crate) struct ViewInfo {
    pub stack: String,
    pub perspective: Perspective,
}

/// A hoisted function signature.
#[derive(Debug, Clone)]
pub(crate) struct FuncSig {
    pub params: Vec<(String, ElemType)>,
    pub ret: Option<ElemType>,
    pub can_fail: bool,
}

/// A stack of scope maps, shared by the stack and view registries.
#[derive(Debug)]
pub(crate) struct ScopedMap<T> {
    frames: Vec<HashMap<String, T>>,
}

impl<T> ScopedMap<T> {
    pub fn new() -> Self {
        ScopedMap {
            frames: vec![HashMap::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        debug_assert!(self.frames.len() > 1);
        self.frames.pop();
    }

    /// Insert into the current frame; error if the name is taken there.
    pub fn declare(&mut self, name: &str, value: T) -> Result<(), String> {
        let frame = self.frames.last_mut().expect("scope stack is never empty");
        if frame.contains_key(name) {
            return Err(format!("'{}' is already declared in this scope", name));
        }
        frame.insert(name.to_string(), value);
        Ok(())
    }

    /// Insert or replace in the current frame (aliases, internals).
    pub fn insert(&mut self, name: &str, value: T) {
        self.frames
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<&T> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut T> {
        self.frames.iter_mut().rev().find_map(|f| f.get_mut(name))
    }
}

// ----------------------------------------------------------------------
// Type boundary rules
// ----------------------------------------------------------------------

/// Whether `bring` may convert `src` elements into `dst` elements.
/// Conversions happen only at container crossings; these are all of them.
pub(crate) fn legal_conversion(src: ElemType, dst: ElemType) -> bool {
    use ElemType::*;
    if src == dst {
        return true;
    }
    matches!(
        (src, dst),
        (I64, F64)
            | (F64, I64)
            | (I64, Str)
            | (F64, Str)
            | (Bool, I64)
            | (I64, Bool)
            | (Bytes, Str)
            | (Str, Bytes)
    )
}

/// Whether the perspective is one the generators implement. Priority
/// perspectives lex and parse but are rejected at declaration.
pub(crate) fn supported_perspective(p: Perspective) -> bool {
    !matches!(p, Perspective::Maxfo | Perspective::Minfo)
}

/// Math intrinsics lowered to the host standard library, with their
/// arity. `abs`, `min` and `max` also work on integer kernels; the rest
/// require floats.
pub(crate) fn math_intrinsic(name: &str) -> Option<(usize, bool)> {
    Some(match name {
        "sqrt" | "sin" | "cos" | "exp" | "log" | "floor" | "ceil" | "round" => (1, true),
        "pow" => (2, true),
        "abs" => (1, false),
        "min" | "max" => (2, false),
        _ => return None,
    })
}

// ----------------------------------------------------------------------
// AST walkers shared by the backends
// ----------------------------------------------------------------------

/// Stack names referenced anywhere under `stmts` (closures capture these).
pub(crate) fn collect_stack_refs(stmts: &[Stmt], out: &mut HashSet<String>) {
    for stmt in stmts {
        collect_stack_refs_stmt(stmt, out);
    }
}

fn collect_stack_refs_stmt(stmt: &Stmt, out: &mut HashSet<String>) {
    match stmt {
        Stmt::StackOpStmt { host, ops, .. } => {
            if let crate::ast::OpHost::Stack(name) = host {
                out.insert(name.clone());
            }
            for op in ops {
                for arg in &op.args {
                    collect_stack_refs_expr(arg, out);
                }
            }
        }
        Stmt::StackBlock { stack, body, .. } => {
            out.insert(stack.clone());
            collect_stack_refs(body, out);
        }
        Stmt::Consider {
            stack,
            setup,
            cases,
            ..
        } => {
            out.insert(stack.clone());
            collect_stack_refs(setup, out);
            for case in cases {
                collect_stack_refs(&case.body, out);
            }
        }
        Stmt::Select {
            stack,
            setup,
            cases,
            default,
            ..
        } => {
            out.insert(stack.clone());
            collect_stack_refs(setup, out);
            for case in cases {
                out.insert(case.stack.clone());
                collect_stack_refs(&case.body, out);
                if let Some(t) = &case.timeout {
                    collect_stack_refs(&t.body, out);
                }
            }
            if let Some(d) = default {
                collect_stack_refs(d, out);
            }
        }
        Stmt::Compute {
            stack, setup, body, ..
        } => {
            out.insert(stack.clone());
            collect_stack_refs(setup, out);
            collect_stack_refs(body, out);
        }
        Stmt::ForStack { stack, body, .. } => {
            out.insert(stack.clone());
            collect_stack_refs(body, out);
        }
        Stmt::If {
            arms, else_body, ..
        } => {
            for (cond, body) in arms {
                if let Some(c) = cond {
                    collect_stack_refs_expr(c, out);
                }
                collect_stack_refs(body, out);
            }
            if let Some(e) = else_body {
                collect_stack_refs(e, out);
            }
        }
        Stmt::While { cond, body, .. } => {
            if let Some(c) = cond {
                collect_stack_refs_expr(c, out);
            }
            collect_stack_refs(body, out);
        }
        Stmt::Try {
            body,
            catch,
            finally,
            ..
        } => {
            collect_stack_refs(body, out);
            collect_stack_refs(catch, out);
            if let Some(f) = finally {
                collect_stack_refs(f, out);
            }
        }
        Stmt::DeferBlock { body, .. } | Stmt::SpawnPush { body, .. } => {
            collect_stack_refs(body, out);
        }
        Stmt::VarDecl { inits, .. } => {
            for e in inits {
                collect_stack_refs_expr(e, out);
            }
        }
        Stmt::Assign { value, .. } => collect_stack_refs_expr(value, out),
        Stmt::Return { values, .. } => {
            for v in values {
                collect_stack_refs_expr(v, out);
            }
        }
        Stmt::Panic { value: Some(v), .. } => collect_stack_refs_expr(v, out),
        Stmt::StatusSet { value: Some(v), .. } => collect_stack_refs_expr(v, out),
        Stmt::ErrorPush { value, .. } => collect_stack_refs_expr(value, out),
        Stmt::ExprStmt { expr, .. } => collect_stack_refs_expr(expr, out),
        _ => {}
    }
}

fn collect_stack_refs_expr(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::StackRef(name) => {
            out.insert(name.clone());
        }
        Expr::StackExpr { stack, args, .. } => {
            out.insert(stack.clone());
            for a in args {
                collect_stack_refs_expr(a, out);
            }
        }
        Expr::Binary { lhs, rhs, .. } => {
            collect_stack_refs_expr(lhs, out);
            collect_stack_refs_expr(rhs, out);
        }
        Expr::Unary { operand, .. } => collect_stack_refs_expr(operand, out),
        Expr::Call { args, .. } => {
            for a in args {
                collect_stack_refs_expr(a, out);
            }
        }
        Expr::Index { index, .. }
        | Expr::SelfIndex { index }
        | Expr::SelfMemberIndex { index, .. } => collect_stack_refs_expr(index, out),
        Expr::Codeblock { body, .. } => collect_stack_refs(body, out),
        _ => {}
    }
}

/// Properties read or written as `self.prop[i]` under `stmts`; the
/// kernel materializes one typed view per property up front.
pub(crate) fn collect_kernel_slice_props(stmts: &[Stmt], out: &mut Vec<String>) {
    fn add(out: &mut Vec<String>, prop: &str) {
        if !out.iter().any(|p| p == prop) {
            out.push(prop.to_string());
        }
    }
    fn walk_expr(e: &Expr, out: &mut Vec<String>) {
        match e {
            Expr::SelfMemberIndex { prop, index } => {
                add(out, prop);
                walk_expr(index, out);
            }
            Expr::Binary { lhs, rhs, .. } => {
                walk_expr(lhs, out);
                walk_expr(rhs, out);
            }
            Expr::Unary { operand, .. } => walk_expr(operand, out),
            Expr::Call { args, .. } => {
                for a in args {
                    walk_expr(a, out);
                }
            }
            Expr::Index { index, .. } | Expr::SelfIndex { index } => walk_expr(index, out),
            _ => {}
        }
    }
    fn walk(stmts: &[Stmt], out: &mut Vec<String>) {
        for stmt in stmts {
            match stmt {
                Stmt::Assign { target, value, .. } => {
                    if let crate::ast::AssignTarget::SelfMemberIndex { prop, index } = target {
                        add(out, prop);
                        walk_expr(index, out);
                    }
                    walk_expr(value, out);
                }
                Stmt::VarDecl { inits, .. } => {
                    for e in inits {
                        walk_expr(e, out);
                    }
                }
                Stmt::If {
                    arms, else_body, ..
                } => {
                    for (cond, body) in arms {
                        if let Some(c) = cond {
                            walk_expr(c, out);
                        }
                        walk(body, out);
                    }
                    if let Some(e) = else_body {
                        walk(e, out);
                    }
                }
                Stmt::While { cond, body, .. } => {
                    if let Some(c) = cond {
                        walk_expr(c, out);
                    }
                    walk(body, out);
                }
                Stmt::Return { values, .. } => {
                    for v in values {
                        walk_expr(v, out);
                    }
                }
                Stmt::ExprStmt { expr, .. } => walk_expr(expr, out),
                _ => {}
            }
        }
    }
    walk(stmts, out);
}

/// A flat list of the function declarations with their signatures, for
/// hoisting: bodies may call functions declared later in the file.
pub(crate) fn hoist_functions(program: &Program) -> HashMap<String, FuncSig> {
    let mut funcs = HashMap::new();
    for f in program.functions() {
        let params = f
            .params
            .iter()
            .map(|p| (p.name.clone(), p.ty.unwrap_or(ElemType::I64)))
            .collect();
        funcs.insert(
            f.name.clone(),
            FuncSig {
                params,
                ret: f.ret,
                can_fail: f.can_fail,
            },
        );
    }
    funcs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_conversions() {
        use ElemType::*;
        assert!(legal_conversion(I64, F64));
        assert!(legal_conversion(F64, I64));
        assert!(legal_conversion(F64, Str));
        assert!(legal_conversion(Bool, I64));
        assert!(legal_conversion(Bytes, Str));
        assert!(legal_conversion(Str, Bytes));
        assert!(!legal_conversion(Str, I64));
        assert!(!legal_conversion(Bytes, F64));
        assert!(!legal_conversion(F64, Bool));
    }

    #[test]
    fn test_priority_perspectives_unsupported() {
        assert!(supported_perspective(Perspective::Lifo));
        assert!(supported_perspective(Perspective::Hash));
        assert!(!supported_perspective(Perspective::Maxfo));
        assert!(!supported_perspective(Perspective::Minfo));
    }

    #[test]
    fn test_scoped_map_shadowing() {
        let mut map: ScopedMap<u32> = ScopedMap::new();
        map.declare("s", 1).unwrap();
        assert!(map.declare("s", 2).is_err());
        map.push_scope();
        map.declare("s", 3).unwrap();
        assert_eq!(map.lookup("s"), Some(&3));
        map.pop_scope();
        assert_eq!(map.lookup("s"), Some(&1));
    }

    #[test]
    fn test_collect_stack_refs_sees_nested_uses() {
        let mut parser = crate::parser::Parser::new(
            "@spawn < { @c < 1 }\n@s {\n push(1)\n}.select( @t { |v| @u < v } )",
        );
        let program = parser.parse().unwrap();
        let mut refs = HashSet::new();
        collect_stack_refs(&program.statements, &mut refs);
        for name in ["c", "s", "t", "u"] {
            assert!(refs.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_collect_kernel_slice_props() {
        let mut parser = crate::parser::Parser::new(
            "@s {}.compute({ || var t = self.xs[0] + self.ys[1]\nself.xs[1] = t })",
        );
        let program = parser.parse().unwrap();
        if let Stmt::Compute { body, .. } = &program.statements[0] {
            let mut props = Vec::new();
            collect_kernel_slice_props(body, &mut props);
            assert_eq!(props, vec!["xs".to_string(), "ys".to_string()]);
        } else {
            panic!("expected compute");
        }
    }

    #[test]
    fn test_math_intrinsics_table() {
        assert_eq!(math_intrinsic("sqrt"), Some((1, true)));
        assert_eq!(math_intrinsic("pow"), Some((2, true)));
        assert_eq!(math_intrinsic("abs"), Some((1, false)));
        assert_eq!(math_intrinsic("min"), Some((2, false)));
        assert_eq!(math_intrinsic("hypot"), None);
    }
}
