//! Rust backend
//!
//! Emits one Rust program against the fixed-name `ual_runtime` API.
//! Hoisted stacks become `LazyLock` statics; function-local stacks are
//! `Arc`-wrapped so select workers and spawn closures can hold them past
//! the declaring frame. Generated functions take `env: &mut Env` first.
//!
//! Divergences from the Go backend, all imposed by ownership:
//! - `defer` and `finally` bodies run from a [`DeferScope`] drop guard
//!   with a private environment (Go gets the enclosing one for free)
//! - `try` bodies run under `catch_unwind`; a caught value re-raises
//!   with `resume_unwind`
//! - string-typed reads clone; stacks hand out owned values only

use super::{
    CodeGenError, FuncSig, GeneratedCode, ScopedMap, StackInfo, StackState, ViewInfo,
    collect_kernel_slice_props, collect_stack_refs, hoist_functions, legal_conversion,
    math_intrinsic, supported_perspective,
};
use crate::ast::{
    AssignTarget, BinOp, CaseLabel, ConsiderCase, ElemType, Expr, FuncDecl, OpHost, Perspective,
    Program, SelectCase, SpawnOpKind, StackExprOp, StackOp, StackOpKind, Stmt, UnOp,
};
use crate::config::CompileOptions;
use crate::diagnostics::Diagnostic;
use crate::symbols::SymbolTable;
use std::collections::HashSet;
use std::fmt::Write as _;

struct KernelCtx {
    rt: String,
    elem: ElemType,
    hash: bool,
}

pub(crate) struct RustBackend {
    options: CompileOptions,
    symbols: SymbolTable,
    stacks: ScopedMap<StackInfo>,
    views: ScopedMap<ViewInfo>,
    funcs: std::collections::HashMap<String, FuncSig>,
    diagnostics: Vec<Diagnostic>,
    global_decls: Vec<String>,
    funcs_out: String,
    out: String,
    indent: usize,
    tmp: usize,
    cond_depth: usize,
    loop_depth: usize,
    try_depth: usize,
    timeout_act: Option<String>,
    catch_tmp: Vec<String>,
    block_hosts: Vec<String>,
    current_fn: Option<String>,
    kernel: Option<KernelCtx>,
    used_aux: HashSet<ElemType>,
}

impl RustBackend {
    pub fn new(options: CompileOptions) -> Self {
        RustBackend {
            options,
            symbols: SymbolTable::new(),
            stacks: ScopedMap::new(),
            views: ScopedMap::new(),
            funcs: std::collections::HashMap::new(),
            diagnostics: Vec::new(),
            global_decls: Vec::new(),
            funcs_out: String::new(),
            out: String::new(),
            indent: 0,
            tmp: 0,
            cond_depth: 0,
            loop_depth: 0,
            try_depth: 0,
            timeout_act: None,
            catch_tmp: Vec::new(),
            block_hosts: Vec::new(),
            current_fn: None,
            kernel: None,
            used_aux: HashSet::new(),
        }
    }

    pub fn generate(mut self, program: &Program) -> Result<GeneratedCode, CodeGenError> {
        self.funcs = hoist_functions(program);
        self.register_implicit_stacks();

        for stmt in &program.statements {
            if let Stmt::StackDecl { .. } = stmt {
                self.declare_stack(stmt, true);
            }
        }

        self.indent = 1;
        for stmt in &program.statements {
            match stmt {
                Stmt::FuncDecl(_) | Stmt::StackDecl { .. } => {}
                _ => self.stmt(stmt)?,
            }
        }
        let main_body = std::mem::take(&mut self.out);

        for f in program.functions() {
            self.gen_func(f)?;
        }

        self.assemble(&main_body)
    }

    fn assemble(&mut self, main_body: &str) -> Result<GeneratedCode, CodeGenError> {
        let mut code = String::new();
        writeln!(code, "// Code generated by ualc. DO NOT EDIT.")?;
        writeln!(
            code,
            "#![allow(non_upper_case_globals, unused_variables, unused_mut, dead_code)]"
        )?;
        writeln!(
            code,
            "#![allow(unused_imports, unreachable_code, unused_parens, clippy::all)]"
        )?;
        writeln!(code)?;
        writeln!(code, "use std::sync::{{Arc, LazyLock}};")?;
        writeln!(
            code,
            "use ual_runtime::{{arith, workqueue, Context, DeferScope, Env, Perspective, Stack, TakeResult, Value}};"
        )?;
        writeln!(code)?;

        if !self.options.no_forth {
            writeln!(
                code,
                "static UAL_BOOL: LazyLock<Stack<bool>> = LazyLock::new(|| Stack::new(Perspective::Lifo));"
            )?;
            writeln!(
                code,
                "static UAL_ERROR: LazyLock<Stack<String>> = LazyLock::new(|| Stack::new(Perspective::Lifo));"
            )?;
        }
        for ty in [
            ElemType::I64,
            ElemType::F64,
            ElemType::Str,
            ElemType::Bool,
            ElemType::Bytes,
        ] {
            if self.used_aux.contains(&ty) {
                writeln!(
                    code,
                    "static {}: LazyLock<Stack<{}>> = LazyLock::new(|| Stack::new(Perspective::Indexed));",
                    aux_stack_name(ty),
                    rust_type(ty)
                )?;
            }
        }
        for decl in &self.global_decls {
            code.push_str(decl);
            code.push('\n');
        }
        writeln!(code)?;

        code.push_str(&self.funcs_out);

        writeln!(code, "fn ual_main(env: &mut Env) {{")?;
        writeln!(code, "\tlet mut _defers = DeferScope::new();")?;
        code.push_str(main_body);
        writeln!(code, "}}")?;
        writeln!(code)?;
        writeln!(code, "fn main() {{")?;
        writeln!(code, "\tual_runtime::install_quiet_panic_hook();")?;
        writeln!(code, "\tlet mut env = Env::new();")?;
        writeln!(
            code,
            "\tlet result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ual_main(&mut env)));"
        )?;
        writeln!(code, "\tif let Err(cause) = result {{")?;
        writeln!(
            code,
            "\t\teprintln!(\"panic: {{}}\", ual_runtime::panic_message(&cause));"
        )?;
        writeln!(code, "\t\tstd::process::exit(2);")?;
        writeln!(code, "\t}}")?;
        writeln!(code, "}}")?;

        Ok(GeneratedCode {
            code,
            diagnostics: std::mem::take(&mut self.diagnostics),
        })
    }

    // ------------------------------------------------------------------
    // Infrastructure
    // ------------------------------------------------------------------

    fn diag(&mut self, line: usize, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(line, message));
    }

    fn w(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.out.push('\t');
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn fresh(&mut self, prefix: &str) -> String {
        self.tmp += 1;
        format!("u{}_{}", prefix, self.tmp)
    }

    fn register_implicit_stacks(&mut self) {
        if self.options.no_forth {
            return;
        }
        let implicit = [
            ("dstack", "env.dstack", ElemType::I64),
            ("rstack", "env.rstack", ElemType::I64),
            ("bool", "UAL_BOOL", ElemType::Bool),
            ("error", "UAL_ERROR", ElemType::Str),
        ];
        for (name, rt, elem) in implicit {
            self.stacks.insert(
                name,
                StackInfo {
                    rt_name: rt.to_string(),
                    elem,
                    perspective: Perspective::Lifo,
                    capacity: None,
                    global: true,
                    state: StackState::Live,
                    shared: false,
                },
            );
        }
    }

    fn declare_stack(&mut self, stmt: &Stmt, global: bool) {
        let Stmt::StackDecl {
            name,
            elem,
            perspective,
            capacity,
            compare,
            line,
        } = stmt
        else {
            return;
        };
        if !supported_perspective(*perspective) {
            self.diag(
                *line,
                format!(
                    "priority perspective {} is not supported; declare Indexed and order explicitly",
                    perspective
                ),
            );
        }
        if compare.is_some() && supported_perspective(*perspective) {
            self.diag(
                *line,
                "a comparison function is only meaningful for priority perspectives",
            );
        }
        let rt_name = if global {
            format!("US_{}", name)
        } else {
            format!("us_{}", name)
        };
        let info = StackInfo {
            rt_name: rt_name.clone(),
            elem: *elem,
            perspective: *perspective,
            capacity: *capacity,
            global,
            state: StackState::Live,
            shared: false,
        };
        if let Err(e) = self.stacks.declare(name, info) {
            self.diag(*line, e);
            return;
        }
        let cap = match capacity {
            Some(n) => format!("Some({})", n),
            None => "None".to_string(),
        };
        if global {
            self.global_decls.push(format!(
                "static {}: LazyLock<Stack<{}>> = LazyLock::new(|| Stack::with_capacity({}, {}));",
                rt_name,
                rust_type(*elem),
                rust_perspective(*perspective),
                cap
            ));
        } else {
            self.w(format!(
                "let {} = Arc::new(Stack::<{}>::with_capacity({}, {}));",
                rt_name,
                rust_type(*elem),
                rust_perspective(*perspective),
                cap
            ));
        }
    }

    fn stack(&mut self, name: &str, line: usize) -> Option<StackInfo> {
        if let Some(info) = self.stacks.lookup(name) {
            return Some(info.clone());
        }
        if self.options.no_forth && matches!(name, "dstack" | "rstack" | "bool" | "error") {
            self.diag(
                line,
                format!("implicit stack '@{}' is unavailable with no_forth", name),
            );
        } else {
            self.diag(line, format!("unknown stack '@{}'", name));
        }
        None
    }

    fn implicit_host(&mut self, line: usize) -> Option<StackInfo> {
        match self.block_hosts.last() {
            Some(name) => {
                let name = name.clone();
                self.stack(&name, line)
            }
            None => self.stack("dstack", line),
        }
    }

    fn check_writable(&mut self, info: &StackInfo, op: &str, line: usize) {
        if info.state == StackState::Frozen {
            self.diag(
                line,
                format!("{}: stack '{}' is frozen at this point", op, info.rt_name),
            );
        }
    }

    fn mark_frozen(&mut self, name: &str) {
        if self.cond_depth == 0 {
            if let Some(info) = self.stacks.lookup_mut(name) {
                info.state = StackState::Frozen;
            }
        }
    }

    fn mark_shared(&mut self, names: &HashSet<String>) {
        for name in names {
            if let Some(info) = self.stacks.lookup_mut(name) {
                info.shared = true;
            }
        }
    }

    /// Source-name → local Arc handles that a `'static` closure must
    /// clone before moving in.
    fn local_captures(&mut self, names: &HashSet<String>) -> Vec<String> {
        let mut handles = Vec::new();
        for name in names {
            if let Some(info) = self.stacks.lookup(name) {
                if !info.global {
                    handles.push(info.rt_name.clone());
                }
            }
        }
        handles.sort();
        handles
    }

    // ------------------------------------------------------------------
    // Expression typing (mirrors the Go backend)
    // ------------------------------------------------------------------

    fn expr_type(&self, e: &Expr) -> Option<ElemType> {
        match e {
            Expr::Int(_) => Some(ElemType::I64),
            Expr::Float(_) => Some(ElemType::F64),
            Expr::Str(_) => Some(ElemType::Str),
            Expr::Bool(_) => Some(ElemType::Bool),
            Expr::Ident(name) => self.symbols.lookup(name).map(|s| s.ty),
            Expr::Unary { op: UnOp::Not, .. } => Some(ElemType::Bool),
            Expr::Unary { operand, .. } => self.expr_type(operand),
            Expr::Binary { op, lhs, rhs } => match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                    let l = self.expr_type(lhs)?;
                    let r = self.expr_type(rhs)?;
                    if l == ElemType::F64 || r == ElemType::F64 {
                        Some(ElemType::F64)
                    } else {
                        Some(l)
                    }
                }
                _ => Some(ElemType::Bool),
            },
            Expr::Call { name, args } => {
                if let Some((_, float_only)) = math_intrinsic(name) {
                    if float_only {
                        return Some(ElemType::F64);
                    }
                    return args.first().and_then(|a| self.expr_type(a));
                }
                match name.as_str() {
                    "print" | "sleep" => None,
                    _ => self.funcs.get(name).and_then(|f| f.ret),
                }
            }
            Expr::StackExpr { stack, op, .. } => match op {
                StackExprOp::Len => Some(ElemType::I64),
                _ => self.stacks.lookup(stack).map(|s| s.elem),
            },
            Expr::ViewExpr { view, op, .. } => match op {
                StackExprOp::Len => Some(ElemType::I64),
                _ => {
                    let v = self.views.lookup(view)?;
                    self.stacks.lookup(&v.stack).map(|s| s.elem)
                }
            },
            Expr::SelfMember { .. } | Expr::SelfIndex { .. } | Expr::SelfMemberIndex { .. } => {
                self.kernel.as_ref().map(|k| k.elem)
            }
            Expr::Index { .. } => self.kernel.as_ref().map(|k| k.elem),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Expression emission
    // ------------------------------------------------------------------

    fn expr(&mut self, e: &Expr, line: usize) -> Result<String, CodeGenError> {
        Ok(match e {
            Expr::Int(v) => v.to_string(),
            Expr::Float(v) => rust_float(*v),
            Expr::Str(s) => format!("String::from({})", rust_quote(s)),
            Expr::Bool(b) => b.to_string(),
            Expr::Ident(name) => self.read_var(name, line),
            Expr::StackRef(name) => {
                self.diag(line, format!("'@{}' is not a value in this position", name));
                "0".to_string()
            }
            Expr::PerspectiveLit(p) => rust_perspective(*p).to_string(),
            Expr::TypeLit(t) => format!("String::from({})", rust_quote(&t.to_string())),
            Expr::Unary { op, operand } => {
                let inner = self.expr(operand, line)?;
                match op {
                    UnOp::Neg => format!("(-{})", inner),
                    UnOp::Not => format!("(!{})", inner),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let numeric = self.expr_type(e).unwrap_or(ElemType::I64);
                let l = self.expr(lhs, line)?;
                let r = self.expr(rhs, line)?;
                let (l, r) = self.promote_pair(l, r, lhs, rhs);
                match (op, numeric) {
                    (BinOp::Div, ElemType::I64) => format!("arith::div_i64({}, {})", l, r),
                    (BinOp::Div, ElemType::F64) => format!("arith::div_f64({}, {})", l, r),
                    (BinOp::Mod, _) => format!("arith::mod_i64({}, {})", l, r),
                    _ => format!("({} {} {})", l, rust_binop(*op), r),
                }
            }
            Expr::Call { name, args } => self.call_expr(name, args, line)?,
            Expr::StackExpr { stack, op, args } => {
                let Some(info) = self.stack(stack, line) else {
                    return Ok("0".to_string());
                };
                self.value_op(&info, *op, args, line)?
            }
            Expr::ViewExpr { view, op, args } => {
                let Some(vinfo) = self.views.lookup(view).cloned() else {
                    self.diag(line, format!("unknown view '{}'", view));
                    return Ok("0".to_string());
                };
                let Some(info) = self.stack(&vinfo.stack, line) else {
                    return Ok("0".to_string());
                };
                match op {
                    StackExprOp::Pop => format!(
                        "{}.pop_with({})",
                        info.rt_name,
                        rust_perspective(vinfo.perspective)
                    ),
                    StackExprOp::Peek => format!(
                        "{}.peek_with({})",
                        info.rt_name,
                        rust_perspective(vinfo.perspective)
                    ),
                    StackExprOp::Len => format!("({}.len() as i64)", info.rt_name),
                    _ => {
                        self.diag(line, "only pop, peek and len work through a view");
                        let _ = args;
                        "0".to_string()
                    }
                }
            }
            Expr::SelfMember { prop } => {
                let Some(k) = self.kernel_ctx(line) else {
                    return Ok("0".to_string());
                };
                if !k.2 {
                    self.diag(line, "self.property requires a Hash perspective stack");
                }
                format!("{}.get_raw({})", kernel_guard(), rust_quote(prop))
            }
            Expr::SelfIndex { index } => {
                let Some(_) = self.kernel_ctx(line) else {
                    return Ok("0".to_string());
                };
                let idx = self.expr(index, line)?;
                format!("{}.get_at_raw(({}) as usize)", kernel_guard(), idx)
            }
            Expr::SelfMemberIndex { prop, index } => {
                let Some(_) = self.kernel_ctx(line) else {
                    return Ok("0".to_string());
                };
                let idx = self.expr(index, line)?;
                format!("view_{}.get(({}) as usize)", prop, idx)
            }
            Expr::Index { name, index } => {
                let idx = self.expr(index, line)?;
                let base = self.read_var_name(name, line);
                format!("{}[({}) as usize]", base, idx)
            }
            Expr::Codeblock { .. } => {
                self.diag(line, "a code block is not a value in this position");
                "0".to_string()
            }
        })
    }

    fn kernel_ctx(&mut self, line: usize) -> Option<(String, ElemType, bool)> {
        match &self.kernel {
            Some(k) => Some((k.rt.clone(), k.elem, k.hash)),
            None => {
                self.diag(line, "'self' is only available inside a compute block");
                None
            }
        }
    }

    fn promote_pair(&self, l: String, r: String, lhs: &Expr, rhs: &Expr) -> (String, String) {
        let lt = self.expr_type(lhs);
        let rt = self.expr_type(rhs);
        match (lt, rt) {
            (Some(ElemType::I64), Some(ElemType::F64)) => (format!("(({}) as f64)", l), r),
            (Some(ElemType::F64), Some(ElemType::I64)) => (l, format!("(({}) as f64)", r)),
            _ => (l, r),
        }
    }

    fn call_expr(
        &mut self,
        name: &str,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        if let Some((arity, float_only)) = math_intrinsic(name) {
            if args.len() != arity {
                self.diag(
                    line,
                    format!("{} takes {} argument(s), got {}", name, arity, args.len()),
                );
                return Ok("0".to_string());
            }
            let arg_ty = args
                .first()
                .and_then(|a| self.expr_type(a))
                .unwrap_or(ElemType::F64);
            let mut parts = Vec::new();
            for a in args {
                let mut code = self.expr(a, line)?;
                if float_only && self.expr_type(a) == Some(ElemType::I64) {
                    code = format!("(({}) as f64)", code);
                }
                parts.push(code);
            }
            return Ok(match name {
                "sqrt" => format!("f64::sqrt({})", parts[0]),
                "sin" => format!("f64::sin({})", parts[0]),
                "cos" => format!("f64::cos({})", parts[0]),
                "exp" => format!("f64::exp({})", parts[0]),
                "log" => format!("f64::ln({})", parts[0]),
                "floor" => format!("f64::floor({})", parts[0]),
                "ceil" => format!("f64::ceil({})", parts[0]),
                "round" => format!("f64::round({})", parts[0]),
                "pow" => format!("f64::powf({}, {})", parts[0], parts[1]),
                "abs" => {
                    if arg_ty == ElemType::F64 {
                        format!("f64::abs({})", parts[0])
                    } else {
                        format!("i64::abs({})", parts[0])
                    }
                }
                "min" => {
                    if arg_ty == ElemType::F64 {
                        format!("f64::min({}, {})", parts[0], parts[1])
                    } else {
                        format!("i64::min({}, {})", parts[0], parts[1])
                    }
                }
                "max" => {
                    if arg_ty == ElemType::F64 {
                        format!("f64::max({}, {})", parts[0], parts[1])
                    } else {
                        format!("i64::max({}, {})", parts[0], parts[1])
                    }
                }
                _ => unreachable!("intrinsic table covered above"),
            });
        }

        match name {
            "print" => {
                if args.len() != 1 {
                    self.diag(line, "print takes one argument");
                    return Ok("println!()".to_string());
                }
                let arg = self.expr(&args[0], line)?;
                Ok(format!("println!(\"{{}}\", {})", arg))
            }
            "sleep" => {
                if args.len() != 1 {
                    self.diag(line, "sleep takes one argument (milliseconds)");
                    return Ok("ual_runtime::sleep_ms(0)".to_string());
                }
                let arg = self.expr(&args[0], line)?;
                Ok(format!("ual_runtime::sleep_ms(({}) as u64)", arg))
            }
            _ => {
                let Some(sig) = self.funcs.get(name).cloned() else {
                    self.diag(line, format!("call to undefined function '{}'", name));
                    return Ok("0".to_string());
                };
                if args.len() != sig.params.len() {
                    self.diag(
                        line,
                        format!(
                            "'{}' takes {} argument(s), got {}",
                            name,
                            sig.params.len(),
                            args.len()
                        ),
                    );
                }
                let mut parts = vec!["env".to_string()];
                for (i, a) in args.iter().enumerate() {
                    let code = self.expr(a, line)?;
                    let want = sig.params.get(i).map(|p| p.1);
                    parts.push(self.coerce_push(code, self.expr_type(a), want, line));
                }
                Ok(format!("uf_{}({})", name, parts.join(", ")))
            }
        }
    }

    fn value_op(
        &mut self,
        info: &StackInfo,
        op: StackExprOp,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        Ok(match op {
            StackExprOp::Pop => format!("{}.pop()", info.rt_name),
            StackExprOp::Peek => format!("{}.peek()", info.rt_name),
            StackExprOp::Len => format!("({}.len() as i64)", info.rt_name),
            StackExprOp::Take => {
                let ms = match args.first() {
                    Some(a) => self.expr(a, line)?,
                    None => "0".to_string(),
                };
                format!("{}.take_value(({}) as u64)", info.rt_name, ms)
            }
            StackExprOp::Reduce(fold) => {
                let helper = match info.elem {
                    ElemType::I64 => "arith::reduce_i64",
                    ElemType::F64 => "arith::reduce_f64",
                    _ => {
                        self.diag(line, "reduce requires a numeric stack");
                        return Ok("0".to_string());
                    }
                };
                format!("{}(&{}, b'{}')", helper, info.rt_name, rust_fold(fold))
            }
        })
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    fn native_name(index: usize, name: &str) -> String {
        format!("uv_{}_{}", index, name)
    }

    fn read_var(&mut self, name: &str, line: usize) -> String {
        let Some(sym) = self.symbols.lookup(name).cloned() else {
            self.diag(line, format!("use of undeclared variable '{}'", name));
            return "0".to_string();
        };
        if sym.is_native {
            let base = Self::native_name(sym.index, name);
            // Owned types clone on read so the cell stays usable.
            match sym.ty {
                ElemType::Str | ElemType::Bytes => format!("{}.clone()", base),
                _ => base,
            }
        } else {
            self.used_aux.insert(sym.ty);
            format!("{}.peek_at({})", aux_stack_name(sym.ty), sym.index)
        }
    }

    fn read_var_name(&mut self, name: &str, line: usize) -> String {
        let Some(sym) = self.symbols.lookup(name).cloned() else {
            self.diag(line, format!("use of undeclared variable '{}'", name));
            return "uv_unknown".to_string();
        };
        Self::native_name(sym.index, name)
    }

    fn write_var(&mut self, name: &str, value: &str, line: usize) {
        let Some(sym) = self.symbols.lookup(name).cloned() else {
            self.diag(line, format!("assignment to undeclared variable '{}'", name));
            return;
        };
        if sym.is_native {
            self.w(format!("{} = {};", Self::native_name(sym.index, name), value));
        } else {
            self.used_aux.insert(sym.ty);
            self.w(format!(
                "{}.push_at({}, {});",
                aux_stack_name(sym.ty),
                sym.index,
                value
            ));
        }
    }

    fn declare_var(&mut self, name: &str, ty: ElemType, init: Option<String>, line: usize) {
        let native = self.options.optimize || self.kernel.is_some();
        let declared = if native {
            self.symbols.declare_native(name, ty)
        } else {
            self.symbols.declare(name, ty)
        };
        let sym = match declared {
            Ok(s) => s,
            Err(e) => {
                self.diag(line, e);
                return;
            }
        };
        let value = init.unwrap_or_else(|| rust_zero(ty).to_string());
        if sym.is_native {
            self.w(format!(
                "let mut {}: {} = {};",
                Self::native_name(sym.index, name),
                rust_type(ty),
                value
            ));
        } else {
            self.used_aux.insert(ty);
            self.w(format!(
                "{}.push_at({}, {});",
                aux_stack_name(ty),
                sym.index,
                value
            ));
        }
    }

    fn coerce_push(
        &mut self,
        code: String,
        from: Option<ElemType>,
        to: Option<ElemType>,
        line: usize,
    ) -> String {
        let (Some(from), Some(to)) = (from, to) else {
            return code;
        };
        if from == to {
            return code;
        }
        match (from, to) {
            (ElemType::I64, ElemType::F64) => format!("(({}) as f64)", code),
            (ElemType::F64, ElemType::I64) => {
                self.diag(
                    line,
                    "a float value cannot cross onto an integer stack; use bring for an explicit conversion",
                );
                code
            }
            _ => {
                self.diag(
                    line,
                    format!("type boundary violation: {} value on a {} container", from, to),
                );
                code
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn stmt_block(&mut self, stmts: &[Stmt]) -> Result<(), CodeGenError> {
        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        for s in stmts {
            self.stmt(s)?;
        }
        self.views.pop_scope();
        self.stacks.pop_scope();
        self.symbols.pop_scope();
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        match stmt {
            Stmt::StackDecl { .. } => self.declare_stack(stmt, false),
            Stmt::ViewDecl {
                name,
                stack,
                perspective,
                line,
            } => {
                if self.stack(stack, *line).is_none() {
                    return Ok(());
                }
                if let Err(e) = self.views.declare(
                    name,
                    ViewInfo {
                        stack: stack.clone(),
                        perspective: *perspective,
                    },
                ) {
                    self.diag(*line, e);
                }
            }
            Stmt::VarDecl {
                names,
                ty,
                inits,
                line,
            } => {
                for (i, name) in names.iter().enumerate() {
                    let init = inits.get(i);
                    let declared_ty = ty
                        .or_else(|| init.and_then(|e| self.expr_type(e)))
                        .unwrap_or(ElemType::I64);
                    let init_code = match init {
                        Some(e) => {
                            let code = self.expr(e, *line)?;
                            Some(self.coerce_push(
                                code,
                                self.expr_type(e),
                                Some(declared_ty),
                                *line,
                            ))
                        }
                        None => None,
                    };
                    self.declare_var(name, declared_ty, init_code, *line);
                }
            }
            Stmt::VarArrayDecl { name, size, line } => {
                if self.kernel.is_none() {
                    self.diag(*line, "local arrays are only available in compute blocks");
                    return Ok(());
                }
                let elem = self.kernel.as_ref().map(|k| k.elem).unwrap_or(ElemType::F64);
                if !matches!(elem, ElemType::I64 | ElemType::F64) {
                    self.diag(*line, "local arrays hold numeric elements only");
                    return Ok(());
                }
                match self.symbols.declare_native(name, elem) {
                    Ok(sym) => {
                        self.w(format!(
                            "let mut {} = [{}; {}];",
                            Self::native_name(sym.index, name),
                            rust_zero(elem),
                            size
                        ));
                    }
                    Err(e) => self.diag(*line, e),
                }
            }
            Stmt::FuncDecl(_) => {}
            Stmt::Assign {
                target,
                value,
                line,
            } => self.assign(target, value, *line)?,
            Stmt::LetPop { name, line } => {
                let Some(d) = self.stack("dstack", *line) else {
                    return Ok(());
                };
                if self.symbols.lookup(name).is_none() {
                    self.declare_var(name, ElemType::I64, None, *line);
                }
                let value = format!("{}.pop()", d.rt_name);
                self.write_var(name, &value, *line);
            }
            Stmt::StackOpStmt { host, ops, line } => {
                let (info, view) = match host {
                    OpHost::Stack(name) => (self.stack(name, *line), None),
                    OpHost::Implicit => (self.implicit_host(*line), None),
                    OpHost::View(name) => match self.views.lookup(name).cloned() {
                        Some(v) => (self.stack(&v.stack, *line), Some(v.perspective)),
                        None => {
                            self.diag(*line, format!("unknown view '{}'", name));
                            (None, None)
                        }
                    },
                };
                let Some(info) = info else {
                    return Ok(());
                };
                if let Some(p) = view {
                    let saved = self.fresh("p");
                    self.w(format!("let {} = {}.perspective();", saved, info.rt_name));
                    self.w(format!(
                        "{}.set_perspective({});",
                        info.rt_name,
                        rust_perspective(p)
                    ));
                    for op in ops {
                        self.stack_op(&info, op)?;
                    }
                    self.w(format!("{}.set_perspective({});", info.rt_name, saved));
                } else {
                    for op in ops {
                        self.stack_op(&info, op)?;
                    }
                }
                if ops.iter().any(|o| o.kind == StackOpKind::Freeze) {
                    if let OpHost::Stack(name) = host {
                        self.mark_frozen(name);
                    }
                }
            }
            Stmt::StackBlock { stack, body, line } => {
                if self.stack(stack, *line).is_none() {
                    return Ok(());
                }
                self.block_hosts.push(stack.clone());
                self.w("{");
                self.indent += 1;
                self.stmt_block(body)?;
                self.indent -= 1;
                self.w("}");
                self.block_hosts.pop();
            }
            Stmt::Consider {
                stack,
                setup,
                cases,
                line,
            } => self.consider(stack, setup, cases, *line)?,
            Stmt::Select {
                stack,
                setup,
                cases,
                default,
                line,
            } => self.select(stack, setup, cases, default.as_deref(), *line)?,
            Stmt::Compute {
                stack,
                setup,
                bindings,
                body,
                line,
            } => self.compute(stack, setup, bindings, body, *line)?,
            Stmt::If {
                arms,
                else_body,
                line,
            } => {
                for (i, (cond, body)) in arms.iter().enumerate() {
                    let cond_code = self.cond_code(cond.as_ref(), *line)?;
                    let kw = if i == 0 { "if" } else { "} else if" };
                    self.w(format!("{} {} {{", kw, cond_code));
                    self.indent += 1;
                    self.cond_depth += 1;
                    self.stmt_block(body)?;
                    self.cond_depth -= 1;
                    self.indent -= 1;
                }
                if let Some(eb) = else_body {
                    self.w("} else {");
                    self.indent += 1;
                    self.cond_depth += 1;
                    self.stmt_block(eb)?;
                    self.cond_depth -= 1;
                    self.indent -= 1;
                }
                self.w("}");
            }
            Stmt::While { cond, body, line } => {
                let cond_code = self.cond_code(cond.as_ref(), *line)?;
                self.w(format!("while {} {{", cond_code));
                self.indent += 1;
                self.cond_depth += 1;
                self.loop_depth += 1;
                self.stmt_block(body)?;
                self.loop_depth -= 1;
                self.cond_depth -= 1;
                self.indent -= 1;
                self.w("}");
            }
            Stmt::ForStack {
                stack,
                perspective,
                bindings,
                body,
                line,
            } => self.for_stack(stack, *perspective, bindings, body, *line)?,
            Stmt::Break { line } => {
                if self.loop_depth == 0 {
                    self.diag(*line, "'break' outside of a loop");
                }
                self.w("break;");
            }
            Stmt::Continue { line } => {
                if self.loop_depth == 0 {
                    self.diag(*line, "'continue' outside of a loop");
                }
                self.w("continue;");
            }
            Stmt::Return { values, line } => {
                if self.try_depth > 0 && self.kernel.is_none() {
                    self.diag(
                        *line,
                        "'return' inside a try block is not supported; set a status instead",
                    );
                    return Ok(());
                }
                self.ret(values, *line)?;
            }
            Stmt::DeferBlock { body, line } => self.defer_block(body, *line)?,
            Stmt::Panic { value, line } => match value {
                Some(e) => {
                    let ty = self.expr_type(e);
                    let code = self.expr(e, *line)?;
                    if ty.is_some() {
                        self.w(format!(
                            "ual_runtime::ual_panic(Value::from({}));",
                            code
                        ));
                    } else {
                        self.w(format!("ual_runtime::ual_panic(Value::from(format!(\"{{}}\", {})));", code));
                    }
                }
                None => match self.catch_tmp.last() {
                    Some(tmp) => {
                        let tmp = tmp.clone();
                        self.w(format!("std::panic::resume_unwind({});", tmp));
                    }
                    None => self.diag(
                        *line,
                        "'panic' without a value re-raises and is only legal inside catch",
                    ),
                },
            },
            Stmt::Try {
                body,
                binding,
                catch,
                finally,
                line,
            } => self.try_catch(body, binding.as_deref(), catch, finally.as_deref(), *line)?,
            Stmt::StatusSet { label, value, line } => {
                let label_str = case_label_str(label);
                if label_str == "_" {
                    self.diag(*line, "'_' is not a settable status label");
                    return Ok(());
                }
                self.w(format!(
                    "env.status = String::from({});",
                    rust_quote(&label_str)
                ));
                match value {
                    Some(e) => {
                        let code = self.expr(e, *line)?;
                        self.w(format!("env.status_value = Some(Value::from({}));", code));
                    }
                    None => self.w("env.status_value = None;"),
                }
            }
            Stmt::Retry { line } => match self.timeout_act.clone() {
                Some(act) => self.w(format!("{} = 1;", act)),
                None => self.diag(*line, "'retry' is only legal inside a timeout handler"),
            },
            Stmt::Restart { line } => match self.timeout_act.clone() {
                Some(act) => self.w(format!("{} = 2;", act)),
                None => self.diag(*line, "'restart' is only legal inside a timeout handler"),
            },
            Stmt::ErrorPush { value, line } => {
                let Some(err) = self.stack("error", *line) else {
                    return Ok(());
                };
                if let Some(f) = &self.current_fn {
                    let f = f.clone();
                    if !self.funcs.get(&f).map(|s| s.can_fail).unwrap_or(false) {
                        self.diag(
                            *line,
                            format!(
                                "'{}' pushes to @error but was not declared with '@error < func'",
                                f
                            ),
                        );
                    }
                }
                let ty = self.expr_type(value);
                let code = self.expr(value, *line)?;
                let code = match ty {
                    Some(ElemType::Str) => code,
                    Some(ElemType::Bytes) => {
                        self.diag(*line, "a bytes value is not an error message");
                        return Ok(());
                    }
                    _ => format!("format!(\"{{}}\", {})", code),
                };
                self.w(format!("{}.push({});", err.rt_name, code));
            }
            Stmt::SpawnPush { params, body, line } => self.spawn_push(params, body, *line)?,
            Stmt::SpawnOp { op, play, line } => match (op, play) {
                (SpawnOpKind::Pop, true) => {
                    self.w("if let Some(task) = workqueue::global().pop() {");
                    self.w("\tworkqueue::run_task(task);");
                    self.w("}");
                }
                (SpawnOpKind::Peek, true) => {
                    self.w("if let Some(task) = workqueue::global().peek() {");
                    self.w("\tworkqueue::run_task(task);");
                    self.w("}");
                }
                (SpawnOpKind::Pop, false) => self.w("let _ = workqueue::global().pop();"),
                (SpawnOpKind::Peek, false) => self.w("let _ = workqueue::global().peek();"),
                (SpawnOpKind::Len, _) => {
                    if let Some(d) = self.stack("dstack", *line) {
                        self.w(format!(
                            "{}.push(workqueue::global().len() as i64);",
                            d.rt_name
                        ));
                    }
                }
                (SpawnOpKind::Clear, _) => self.w("workqueue::global().clear();"),
            },
            Stmt::ExprStmt { expr, line } => {
                let code = self.expr(expr, *line)?;
                match expr {
                    Expr::Call { .. } => self.w(format!("{};", code)),
                    _ => self.w(format!("let _ = {};", code)),
                }
            }
        }
        Ok(())
    }

    fn cond_code(&mut self, cond: Option<&Expr>, line: usize) -> Result<String, CodeGenError> {
        match cond {
            Some(e) => {
                let code = self.expr(e, line)?;
                match self.expr_type(e) {
                    Some(ElemType::Bool) | None => Ok(code),
                    Some(ElemType::I64) => Ok(format!("({} != 0)", code)),
                    Some(t) => {
                        self.diag(line, format!("a {} value is not a condition", t));
                        Ok("false".to_string())
                    }
                }
            }
            None => {
                let Some(b) = self.stack("bool", line) else {
                    return Ok("false".to_string());
                };
                Ok(format!("{}.pop()", b.rt_name))
            }
        }
    }

    fn assign(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
        line: usize,
    ) -> Result<(), CodeGenError> {
        match target {
            AssignTarget::Name(name) => {
                let code = self.expr(value, line)?;
                let to = self.symbols.lookup(name).map(|s| s.ty);
                let code = self.coerce_push(code, self.expr_type(value), to, line);
                self.write_var(name, &code, line);
            }
            AssignTarget::Index { name, index } => {
                let idx = self.expr(index, line)?;
                let code = self.expr(value, line)?;
                let base = self.read_var_name(name, line);
                self.w(format!("{}[({}) as usize] = {};", base, idx, code));
            }
            AssignTarget::SelfMemberIndex { prop, index } => {
                if self.kernel.is_none() {
                    self.diag(line, "container writes are only legal inside compute blocks");
                    return Ok(());
                }
                let idx = self.expr(index, line)?;
                let code = self.expr(value, line)?;
                self.w(format!("view_{}.set(({}) as usize, {});", prop, idx, code));
            }
        }
        Ok(())
    }

    fn ret(&mut self, values: &[Expr], line: usize) -> Result<(), CodeGenError> {
        if let Some(k) = &self.kernel {
            let (rt, hash, elem) = (k.rt.clone(), k.hash, k.elem);
            let _ = rt;
            for (i, v) in values.iter().enumerate() {
                let code = self.expr(v, line)?;
                let code = self.coerce_push(code, self.expr_type(v), Some(elem), line);
                if hash {
                    self.w(format!(
                        "{}.set_raw(\"__result_{}__\", {});",
                        kernel_guard(),
                        i,
                        code
                    ));
                } else {
                    self.w(format!("{}.push_raw({});", kernel_guard(), code));
                }
            }
            self.w("return;");
            return Ok(());
        }

        match &self.current_fn {
            Some(fname) => {
                let sig = self.funcs.get(fname).cloned();
                let ret_ty = sig.as_ref().and_then(|s| s.ret);
                match (values.len(), ret_ty) {
                    (0, None) => self.w("return;"),
                    (0, Some(t)) => {
                        self.diag(line, "missing return value");
                        self.w(format!("return {};", rust_zero(t)));
                    }
                    (1, Some(t)) => {
                        let code = self.expr(&values[0], line)?;
                        let code =
                            self.coerce_push(code, self.expr_type(&values[0]), Some(t), line);
                        self.w(format!("return {};", code));
                    }
                    (1, None) => {
                        self.diag(line, "function has no declared return type");
                        self.w("return;");
                    }
                    (n, _) => {
                        self.diag(
                            line,
                            format!("a function returns at most one value, got {}", n),
                        );
                        self.w("return;");
                    }
                }
            }
            None => {
                if !values.is_empty() {
                    self.diag(line, "top-level return takes no values");
                }
                self.w("return;");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stack operations
    // ------------------------------------------------------------------

    fn stack_op(&mut self, info: &StackInfo, op: &StackOp) -> Result<(), CodeGenError> {
        let line = op.line;
        let rt = info.rt_name.clone();
        let elem = info.elem;
        match op.kind {
            StackOpKind::Push => {
                self.check_writable(info, "push", line);
                let Some(arg) = op.args.first() else {
                    self.diag(line, "push needs a value");
                    return Ok(());
                };
                let code = self.expr(arg, line)?;
                let code = self.coerce_push(code, self.expr_type(arg), Some(elem), line);
                self.w(format!("{}.push({});", rt, code));
            }
            StackOpKind::Pop | StackOpKind::Take => {
                self.check_writable(info, "pop", line);
                let source = if op.kind == StackOpKind::Take {
                    let ms = match op.args.first() {
                        Some(a) => self.expr(a, line)?,
                        None => "0".to_string(),
                    };
                    format!("{}.take_value(({}) as u64)", rt, ms)
                } else {
                    format!("{}.pop()", rt)
                };
                match &op.target {
                    Some(name) => {
                        let target_ty = self.symbols.lookup(name).map(|s| s.ty);
                        match target_ty {
                            Some(t) if t == elem => self.write_var(name, &source, line),
                            Some(t) => self.diag(
                                line,
                                format!(
                                    "pop target '{}' has type {} but the stack holds {}",
                                    name, t, elem
                                ),
                            ),
                            None => self
                                .diag(line, format!("pop target '{}' is not declared", name)),
                        }
                    }
                    None => {
                        if elem != ElemType::I64 {
                            self.diag(
                                line,
                                format!(
                                    "bare {} is only legal on i64 stacks; use {}:v for a {} stack",
                                    if op.kind == StackOpKind::Take { "take" } else { "pop" },
                                    if op.kind == StackOpKind::Take { "take" } else { "pop" },
                                    elem
                                ),
                            );
                            return Ok(());
                        }
                        let Some(d) = self.stack("dstack", line) else {
                            return Ok(());
                        };
                        self.w(format!("{}.push({});", d.rt_name, source));
                    }
                }
            }
            StackOpKind::Peek => {
                if elem != ElemType::I64 {
                    self.diag(line, "bare peek is only legal on i64 stacks");
                    return Ok(());
                }
                let Some(d) = self.stack("dstack", line) else {
                    return Ok(());
                };
                self.w(format!("{}.push({}.peek());", d.rt_name, rt));
            }
            StackOpKind::Dup => self.w(format!("{}.dup();", rt)),
            StackOpKind::Drop => self.w(format!("{}.drop_top();", rt)),
            StackOpKind::Swap => self.w(format!("{}.swap();", rt)),
            StackOpKind::Over => self.w(format!("{}.over();", rt)),
            StackOpKind::Rot => self.w(format!("{}.rot();", rt)),
            StackOpKind::Tor | StackOpKind::Fromr => {
                if elem != ElemType::I64 {
                    self.diag(line, "tor/fromr move i64 values only");
                    return Ok(());
                }
                let Some(r) = self.stack("rstack", line) else {
                    return Ok(());
                };
                if op.kind == StackOpKind::Tor {
                    self.w(format!("{}.push({}.pop());", r.rt_name, rt));
                } else {
                    self.w(format!("{}.push({}.pop());", rt, r.rt_name));
                }
            }
            StackOpKind::Add
            | StackOpKind::Sub
            | StackOpKind::Mul
            | StackOpKind::Div
            | StackOpKind::Mod => {
                if !matches!(elem, ElemType::I64 | ElemType::F64) {
                    self.diag(line, format!("arithmetic needs a numeric stack, not {}", elem));
                    return Ok(());
                }
                if op.kind == StackOpKind::Mod && elem != ElemType::I64 {
                    self.diag(line, "mod is defined on i64 stacks only");
                    return Ok(());
                }
                self.check_writable(info, "arithmetic", line);
                let b = self.fresh("b");
                let a = self.fresh("a");
                self.w("{");
                self.w(format!("\tlet {} = {}.pop();", b, rt));
                self.w(format!("\tlet {} = {}.pop();", a, rt));
                let result = match (op.kind, elem) {
                    (StackOpKind::Add, _) => format!("{} + {}", a, b),
                    (StackOpKind::Sub, _) => format!("{} - {}", a, b),
                    (StackOpKind::Mul, _) => format!("{} * {}", a, b),
                    (StackOpKind::Div, ElemType::I64) => format!("arith::div_i64({}, {})", a, b),
                    (StackOpKind::Div, _) => format!("arith::div_f64({}, {})", a, b),
                    (StackOpKind::Mod, _) => format!("arith::mod_i64({}, {})", a, b),
                    _ => unreachable!(),
                };
                self.w(format!("\t{}.push({});", rt, result));
                self.w("}");
            }
            StackOpKind::Eq
            | StackOpKind::Ne
            | StackOpKind::Lt
            | StackOpKind::Gt
            | StackOpKind::Le
            | StackOpKind::Ge => {
                if elem == ElemType::Bytes {
                    self.diag(line, "comparisons are not defined on bytes stacks");
                    return Ok(());
                }
                let ordered = matches!(
                    op.kind,
                    StackOpKind::Lt | StackOpKind::Gt | StackOpKind::Le | StackOpKind::Ge
                );
                if ordered && elem == ElemType::Bool {
                    self.diag(line, "ordering comparisons need a numeric or string stack");
                    return Ok(());
                }
                let Some(bs) = self.stack("bool", line) else {
                    return Ok(());
                };
                let b = self.fresh("b");
                let a = self.fresh("a");
                let rust_op = match op.kind {
                    StackOpKind::Eq => "==",
                    StackOpKind::Ne => "!=",
                    StackOpKind::Lt => "<",
                    StackOpKind::Gt => ">",
                    StackOpKind::Le => "<=",
                    StackOpKind::Ge => ">=",
                    _ => unreachable!(),
                };
                self.w("{");
                self.w(format!("\tlet {} = {}.pop();", b, rt));
                self.w(format!("\tlet {} = {}.pop();", a, rt));
                self.w(format!(
                    "\t{}.push({} {} {});",
                    bs.rt_name, a, rust_op, b
                ));
                self.w("}");
            }
            StackOpKind::Bring => {
                self.check_writable(info, "bring", line);
                let Some(Expr::StackRef(src_name)) = op.args.first() else {
                    self.diag(line, "bring takes a source stack reference: bring(@src)");
                    return Ok(());
                };
                let src_name = src_name.clone();
                let Some(src) = self.stack(&src_name, line) else {
                    return Ok(());
                };
                if !legal_conversion(src.elem, elem) {
                    self.diag(
                        line,
                        format!(
                            "no boundary conversion from {} to {} (stack '@{}')",
                            src.elem, elem, src_name
                        ),
                    );
                    return Ok(());
                }
                let v = self.fresh("v");
                self.w("{");
                self.w(format!("\tlet {} = {}.pop();", v, src.rt_name));
                self.w(format!(
                    "\t{}.push({});",
                    rt,
                    rust_convert(&v, src.elem, elem)
                ));
                self.w("}");
            }
            StackOpKind::Freeze => self.w(format!("{}.freeze();", rt)),
            StackOpKind::Perspective => {
                let Some(Expr::PerspectiveLit(p)) = op.args.first() else {
                    self.diag(line, "perspective takes a perspective literal");
                    return Ok(());
                };
                if !supported_perspective(*p) {
                    self.diag(line, format!("priority perspective {} is not supported", p));
                    return Ok(());
                }
                self.w(format!(
                    "{}.set_perspective({});",
                    rt,
                    rust_perspective(*p)
                ));
            }
            StackOpKind::Has => {
                let Some(bs) = self.stack("bool", line) else {
                    return Ok(());
                };
                self.w(format!("{}.push({}.len() > 0);", bs.rt_name, rt));
            }
            StackOpKind::Clear => {
                self.check_writable(info, "clear", line);
                self.w(format!("{}.clear();", rt));
            }
            StackOpKind::Set => {
                self.check_writable(info, "set", line);
                if op.args.len() != 2 {
                    self.diag(line, "set takes a key and a value: set(\"k\", v)");
                    return Ok(());
                }
                let key = self.expr(&op.args[0], line)?;
                let val = self.expr(&op.args[1], line)?;
                // A bytes value on a non-bytes Hash stack stores a byte
                // buffer: the contiguous backing a compute kernel views
                // as a typed slice.
                if self.expr_type(&op.args[1]) == Some(ElemType::Bytes) && elem != ElemType::Bytes
                {
                    self.w(format!("{}.set_buffer(&({}), {});", rt, key, val));
                } else {
                    let val =
                        self.coerce_push(val, self.expr_type(&op.args[1]), Some(elem), line);
                    self.w(format!("{}.set(&({}), {});", rt, key, val));
                }
            }
            StackOpKind::Get => {
                if op.args.len() != 1 {
                    self.diag(line, "get takes a key: get(\"k\")");
                    return Ok(());
                }
                if elem != ElemType::I64 {
                    self.diag(line, "get pushes onto the data stack and needs an i64 stack");
                    return Ok(());
                }
                let Some(d) = self.stack("dstack", line) else {
                    return Ok(());
                };
                let key = self.expr(&op.args[0], line)?;
                self.w(format!("{}.push({}.get(&({})));", d.rt_name, rt, key));
            }
            StackOpKind::Len => {
                let Some(d) = self.stack("dstack", line) else {
                    return Ok(());
                };
                self.w(format!("{}.push({}.len() as i64);", d.rt_name, rt));
            }
            StackOpKind::Dot => {
                if elem == ElemType::Bytes {
                    self.diag(line, "dot cannot print a bytes value");
                    return Ok(());
                }
                self.w(format!("println!(\"{{}}\", {}.pop());", rt));
            }
            StackOpKind::Alias => {
                let Some(Expr::Str(alias)) = op.args.first() else {
                    self.diag(line, "alias takes a string name");
                    return Ok(());
                };
                self.stacks.insert(alias, info.clone());
            }
            StackOpKind::Let => {
                let Some(name) = op.target.clone() else {
                    self.diag(line, "let needs a target: let:name");
                    return Ok(());
                };
                if self.symbols.lookup(&name).is_none() {
                    self.declare_var(&name, elem, None, line);
                } else if self.symbols.lookup(&name).map(|s| s.ty) != Some(elem) {
                    self.diag(
                        line,
                        format!("let target '{}' does not match element type {}", name, elem),
                    );
                    return Ok(());
                }
                let source = format!("{}.pop()", rt);
                self.write_var(&name, &source, line);
            }
            StackOpKind::Reduce => {
                let fold = match op.args.first() {
                    Some(Expr::Binary { op: fold, .. }) => *fold,
                    _ => BinOp::Add,
                };
                let helper = match elem {
                    ElemType::I64 => "arith::reduce_i64",
                    ElemType::F64 => "arith::reduce_f64",
                    _ => {
                        self.diag(line, "reduce requires a numeric stack");
                        return Ok(());
                    }
                };
                let acc = self.fresh("acc");
                self.w("{");
                self.w(format!(
                    "\tlet {} = {}(&{}, b'{}');",
                    acc,
                    helper,
                    rt,
                    rust_fold(fold)
                ));
                self.w(format!("\t{}.clear();", rt));
                self.w(format!("\t{}.push({});", rt, acc));
                self.w("}");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control constructs
    // ------------------------------------------------------------------

    fn for_stack(
        &mut self,
        stack: &str,
        perspective: Option<Perspective>,
        bindings: &[String],
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CodeGenError> {
        let Some(info) = self.stack(stack, line) else {
            return Ok(());
        };
        let persp = perspective.unwrap_or(info.perspective);
        if !supported_perspective(persp) {
            self.diag(line, format!("priority perspective {} is not supported", persp));
            return Ok(());
        }
        let reverse = matches!(persp, Perspective::Lifo);
        let snap = self.fresh("snap");
        let idx = self.fresh("i");
        self.w("{");
        self.indent += 1;
        self.w(format!("let {} = {}.snapshot();", snap, info.rt_name));
        if reverse {
            self.w(format!("for {} in (0..{}.len()).rev() {{", idx, snap));
        } else {
            self.w(format!("for {} in 0..{}.len() {{", idx, snap));
        }
        self.indent += 1;
        self.cond_depth += 1;
        self.loop_depth += 1;
        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        match bindings.len() {
            0 => {
                if info.elem != ElemType::I64 {
                    self.diag(line, "a bindingless for-loop pushes onto the data stack and needs an i64 stack");
                } else if let Some(d) = self.stack("dstack", line) {
                    self.w(format!("{}.push({}[{}].clone());", d.rt_name, snap, idx));
                }
            }
            1 => {
                self.bind_native(&bindings[0], info.elem, line, |_| {
                    format!("{}[{}].clone()", snap, idx)
                });
            }
            _ => {
                self.bind_native(&bindings[0], ElemType::I64, line, |_| {
                    format!("{} as i64", idx)
                });
                self.bind_native(&bindings[1], info.elem, line, |_| {
                    format!("{}[{}].clone()", snap, idx)
                });
            }
        }
        for s in body {
            self.stmt(s)?;
        }
        self.views.pop_scope();
        self.stacks.pop_scope();
        self.symbols.pop_scope();
        self.loop_depth -= 1;
        self.cond_depth -= 1;
        self.indent -= 1;
        self.w("}");
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    fn bind_native(
        &mut self,
        name: &str,
        ty: ElemType,
        line: usize,
        value_of: impl Fn(&str) -> String,
    ) {
        match self.symbols.declare_native(name, ty) {
            Ok(sym) => {
                let rname = Self::native_name(sym.index, name);
                self.w(format!(
                    "let mut {}: {} = {};",
                    rname,
                    rust_type(ty),
                    value_of(&rname)
                ));
            }
            Err(e) => self.diag(line, e),
        }
    }

    fn consider(
        &mut self,
        stack: &str,
        setup: &[Stmt],
        cases: &[ConsiderCase],
        line: usize,
    ) -> Result<(), CodeGenError> {
        if self.stack(stack, line).is_none() {
            return Ok(());
        }
        let saved = self.fresh("saved");
        self.w("{");
        self.indent += 1;
        self.w(format!("let {} = env.save_status();", saved));

        self.block_hosts.push(stack.to_string());
        self.w("{");
        self.indent += 1;
        self.stmt_block(setup)?;
        self.indent -= 1;
        self.w("}");
        self.block_hosts.pop();

        if !self.options.no_forth {
            if let Some(err) = self.stack("error", line) {
                self.w(format!(
                    "if env.status == \"ok\" && {}.len() > 0 {{",
                    err.rt_name
                ));
                self.w("\tenv.status = String::from(\"error\");");
                self.w(format!(
                    "\tenv.status_value = Some(Value::Str({}.peek()));",
                    err.rt_name
                ));
                self.w("}");
            }
        }

        let mut first = true;
        for case in cases {
            let cond = match &case.label {
                CaseLabel::Default => "true".to_string(),
                label => format!("env.status == {}", rust_quote(&case_label_str(label))),
            };
            if first {
                self.w(format!("if {} {{", cond));
                first = false;
            } else {
                self.w(format!("}} else if {} {{", cond));
            }
            self.indent += 1;
            self.cond_depth += 1;
            self.symbols.push_scope();
            self.stacks.push_scope();
            self.views.push_scope();
            self.bind_consider_case(case, line);
            for s in &case.body {
                self.stmt(s)?;
            }
            self.views.pop_scope();
            self.stacks.pop_scope();
            self.symbols.pop_scope();
            self.cond_depth -= 1;
            self.indent -= 1;
        }
        let has_default = cases.iter().any(|c| c.label == CaseLabel::Default);
        if !has_default {
            self.w("} else {");
            self.w("\tpanic!(\"unhandled consider status '{}'\", env.status);");
        }
        self.w("}");
        self.w(format!("env.restore_status({});", saved));
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    fn bind_consider_case(&mut self, case: &ConsiderCase, line: usize) {
        let is_error = matches!(&case.label, CaseLabel::Name(n) if n == "error")
            && !self.options.no_forth;
        if let Some(first) = case.bindings.first() {
            match self.symbols.declare_native(first, ElemType::Str) {
                Ok(sym) => {
                    let rname = Self::native_name(sym.index, first);
                    self.w(format!(
                        "let mut {}: String = env.status_value.clone().map(|v| v.to_string()).unwrap_or_default();",
                        rname
                    ));
                    if is_error {
                        if let Some(err) = self.stack("error", line) {
                            self.w(format!(
                                "if env.status_value.is_none() && {}.len() > 0 {{",
                                err.rt_name
                            ));
                            self.w(format!("\t{} = {}.pop();", rname, err.rt_name));
                            self.w("}");
                        }
                    }
                }
                Err(e) => self.diag(line, e),
            }
        }
        if let Some(second) = case.bindings.get(1) {
            match self.symbols.declare_native(second, ElemType::Str) {
                Ok(sym) => {
                    let rname = Self::native_name(sym.index, second);
                    self.w(format!("let mut {}: String = env.status.clone();", rname));
                }
                Err(e) => self.diag(line, e),
            }
        }
    }

    fn select(
        &mut self,
        stack: &str,
        setup: &[Stmt],
        cases: &[SelectCase],
        default: Option<&[Stmt]>,
        line: usize,
    ) -> Result<(), CodeGenError> {
        if self.stack(stack, line).is_none() {
            return Ok(());
        }
        if !setup.is_empty() {
            self.block_hosts.push(stack.to_string());
            self.w("{");
            self.indent += 1;
            self.stmt_block(setup)?;
            self.indent -= 1;
            self.w("}");
            self.block_hosts.pop();
        }

        let mut shared = HashSet::new();
        for case in cases {
            if matches!(case.stack.as_str(), "dstack" | "rstack") {
                self.diag(case.line, "task-local stacks cannot be select targets");
            }
            shared.insert(case.stack.clone());
        }
        self.mark_shared(&shared);

        if let Some(default_body) = default {
            for (i, case) in cases.iter().enumerate() {
                let Some(info) = self.stack(&case.stack, case.line) else {
                    continue;
                };
                let kw = if i == 0 { "if" } else { "} else if" };
                self.w(format!("{} {}.len() > 0 {{", kw, info.rt_name));
                self.indent += 1;
                self.cond_depth += 1;
                self.symbols.push_scope();
                self.stacks.push_scope();
                self.views.push_scope();
                if let Some(b) = &case.binding {
                    let rt = info.rt_name.clone();
                    self.bind_native(b, info.elem, case.line, |_| format!("{}.pop()", rt));
                }
                for s in &case.body {
                    self.stmt(s)?;
                }
                self.views.pop_scope();
                self.stacks.pop_scope();
                self.symbols.pop_scope();
                self.cond_depth -= 1;
                self.indent -= 1;
            }
            if cases.is_empty() {
                self.w("{");
            } else {
                self.w("} else {");
            }
            self.indent += 1;
            self.cond_depth += 1;
            self.stmt_block(default_body)?;
            self.cond_depth -= 1;
            self.indent -= 1;
            self.w("}");
            return Ok(());
        }

        // Blocking form.
        let label = self.fresh("sel");
        let tx = self.fresh("tx");
        let rx = self.fresh("rx");
        let ctx = self.fresh("ctx");
        self.w(format!("'{}: loop {{", label));
        self.indent += 1;
        self.w(format!("let {} = Context::with_cancel();", ctx));
        self.w(format!(
            "let ({}, {}) = std::sync::mpsc::channel::<(i64, Value)>();",
            tx, rx
        ));
        for (i, case) in cases.iter().enumerate() {
            let Some(info) = self.stack(&case.stack, case.line) else {
                continue;
            };
            let timeout_ms = case.timeout.as_ref().map(|t| t.ms).unwrap_or(0);
            // Clone what the worker thread moves in: the sender, the
            // context, and any function-local stacks the case touches.
            let mut refs = HashSet::new();
            refs.insert(case.stack.clone());
            if let Some(t) = &case.timeout {
                collect_stack_refs(&t.body, &mut refs);
            }
            let captures = self.local_captures(&refs);
            self.w("{");
            self.indent += 1;
            self.w(format!("let tx = {}.clone();", tx));
            self.w(format!("let ctx = {}.clone();", ctx));
            for handle in &captures {
                self.w(format!("let {} = {}.clone();", handle, handle));
            }
            self.w("std::thread::spawn(move || {");
            self.indent += 1;
            self.w("loop {");
            self.indent += 1;
            self.w(format!(
                "match {}.take_with_context(&ctx, {}) {{",
                info.rt_name, timeout_ms
            ));
            self.indent += 1;
            self.w("TakeResult::Value(v) => {");
            self.w(format!(
                "\tlet _ = tx.send(({}, Value::from(v)));",
                i
            ));
            self.w("\treturn;");
            self.w("}");
            self.w("TakeResult::Cancelled => {");
            self.w("\tlet _ = tx.send((ual_runtime::SELECT_DONE, Value::I64(0)));");
            self.w("\treturn;");
            self.w("}");
            self.w("TakeResult::Timeout => {");
            self.indent += 1;
            if let Some(timeout) = &case.timeout {
                let act = self.fresh("act");
                self.w(format!("let mut {}: i64 = 0;", act));
                self.w("{");
                self.indent += 1;
                // The handler runs on the worker with its own environment.
                self.w("let mut _defers = DeferScope::new();");
                self.w("let mut env = Env::new();");
                self.w("let env = &mut env;");
                self.w("let _ = &env;");
                let saved_act = self.timeout_act.replace(act.clone());
                let saved_loop = std::mem::take(&mut self.loop_depth);
                self.cond_depth += 1;
                self.stmt_block(&timeout.body)?;
                self.cond_depth -= 1;
                self.loop_depth = saved_loop;
                self.timeout_act = saved_act;
                self.indent -= 1;
                self.w("}");
                self.w(format!("if {} == 1 {{", act));
                self.w("\tcontinue;");
                self.w("}");
                self.w(format!("if {} == 2 {{", act));
                self.w("\tlet _ = tx.send((ual_runtime::SELECT_RESTART, Value::I64(0)));");
                self.w("\treturn;");
                self.w("}");
            }
            self.w("let _ = tx.send((ual_runtime::SELECT_DONE, Value::I64(0)));");
            self.w("return;");
            self.indent -= 1;
            self.w("}");
            self.indent -= 1;
            self.w("}");
            self.indent -= 1;
            self.w("}");
            self.indent -= 1;
            self.w("});");
            self.indent -= 1;
            self.w("}");
        }
        self.w(format!("drop({});", tx));
        let res = self.fresh("res");
        self.w(format!(
            "let {} = ual_runtime::select_wait(&{}, {});",
            res,
            rx,
            cases.len()
        ));
        self.w(format!("{}.cancel();", ctx));
        self.w(format!("if {}.0 == ual_runtime::SELECT_RESTART {{", res));
        self.w(format!("\tcontinue '{};", label));
        self.w("}");
        for (i, case) in cases.iter().enumerate() {
            let Some(info) = self.stack(&case.stack, case.line) else {
                continue;
            };
            let kw = if i == 0 { "if" } else { "} else if" };
            self.w(format!("{} {}.0 == {} {{", kw, res, i));
            self.indent += 1;
            self.cond_depth += 1;
            self.symbols.push_scope();
            self.stacks.push_scope();
            self.views.push_scope();
            if let Some(b) = &case.binding {
                let res = res.clone();
                let accessor = value_accessor(info.elem);
                self.bind_native(b, info.elem, case.line, |_| {
                    format!("{}.1.{}()", res, accessor)
                });
            }
            for s in &case.body {
                self.stmt(s)?;
            }
            self.views.pop_scope();
            self.stacks.pop_scope();
            self.symbols.pop_scope();
            self.cond_depth -= 1;
            self.indent -= 1;
        }
        if !cases.is_empty() {
            self.w("}");
        }
        self.w(format!("break '{};", label));
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    fn compute(
        &mut self,
        stack: &str,
        setup: &[Stmt],
        bindings: &[String],
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CodeGenError> {
        let Some(info) = self.stack(stack, line) else {
            return Ok(());
        };
        let hash = info.perspective == Perspective::Hash;
        if hash && !bindings.is_empty() {
            self.diag(
                line,
                "bindings are forbidden on Hash perspective stacks; read self.property instead",
            );
        }

        if !setup.is_empty() {
            self.block_hosts.push(stack.to_string());
            self.w("{");
            self.indent += 1;
            self.stmt_block(setup)?;
            self.indent -= 1;
            self.w("}");
            self.block_hosts.pop();
        }

        let mut props = Vec::new();
        collect_kernel_slice_props(body, &mut props);
        if !props.is_empty() {
            if !hash {
                self.diag(line, "self.property views require a Hash perspective stack");
            }
            if !matches!(info.elem, ElemType::I64 | ElemType::F64) {
                self.diag(
                    line,
                    "self.property views are defined for numeric element types only",
                );
            }
        }

        self.w("{");
        self.indent += 1;
        self.w(format!("let mut {} = {}.lock();", kernel_guard(), info.rt_name));

        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        let saved_loop = std::mem::take(&mut self.loop_depth);
        self.kernel = Some(KernelCtx {
            rt: info.rt_name.clone(),
            elem: info.elem,
            hash,
        });

        for b in bindings {
            self.bind_native(b, info.elem, line, |_| {
                format!("{}.pop_raw()", kernel_guard())
            });
        }
        for prop in &props {
            self.w(format!(
                "let view_{} = {}.slice_raw({});",
                prop,
                kernel_guard(),
                rust_quote(prop)
            ));
        }

        self.w("(|| {");
        self.indent += 1;
        for s in body {
            self.stmt(s)?;
        }
        self.indent -= 1;
        self.w("})();");

        self.kernel = None;
        self.loop_depth = saved_loop;
        self.views.pop_scope();
        self.stacks.pop_scope();
        self.symbols.pop_scope();
        self.w(format!("drop({});", kernel_guard()));
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    fn try_catch(
        &mut self,
        body: &[Stmt],
        binding: Option<&str>,
        catch: &[Stmt],
        finally: Option<&[Stmt]>,
        line: usize,
    ) -> Result<(), CodeGenError> {
        let caught = self.fresh("caught");
        let cause = self.fresh("cause");
        self.w("{");
        self.indent += 1;
        if let Some(f) = finally {
            // Registered as a drop guard so it runs on every exit path,
            // including a panic raised from the catch body. The guard
            // runs with a private environment.
            self.w("let mut _try_finally = DeferScope::new();");
            self.defer_into(f, "_try_finally", line)?;
        }
        self.w(format!(
            "let {} = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {{",
            caught
        ));
        self.indent += 1;
        let saved_loop = std::mem::take(&mut self.loop_depth);
        self.try_depth += 1;
        self.cond_depth += 1;
        self.stmt_block(body)?;
        self.cond_depth -= 1;
        self.try_depth -= 1;
        self.loop_depth = saved_loop;
        self.indent -= 1;
        self.w("}));");
        self.w(format!("if let Err({}) = {} {{", cause, caught));
        self.indent += 1;
        self.cond_depth += 1;
        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        if let Some(b) = binding {
            match self.symbols.declare_native(b, ElemType::Str) {
                Ok(sym) => {
                    self.w(format!(
                        "let mut {}: String = ual_runtime::panic_message(&{});",
                        Self::native_name(sym.index, b),
                        cause
                    ));
                }
                Err(e) => self.diag(line, e),
            }
        }
        self.catch_tmp.push(cause.clone());
        for s in catch {
            self.stmt(s)?;
        }
        self.catch_tmp.pop();
        self.views.pop_scope();
        self.stacks.pop_scope();
        self.symbols.pop_scope();
        self.cond_depth -= 1;
        self.indent -= 1;
        self.w("}");
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    fn defer_block(&mut self, body: &[Stmt], line: usize) -> Result<(), CodeGenError> {
        self.defer_into(body, "_defers", line)
    }

    /// Register `body` on a defer scope. The closure is `'static`, so it
    /// clones local stack handles and runs with a private environment.
    fn defer_into(
        &mut self,
        body: &[Stmt],
        scope_var: &str,
        _line: usize,
    ) -> Result<(), CodeGenError> {
        let mut refs = HashSet::new();
        collect_stack_refs(body, &mut refs);
        let captures = self.local_captures(&refs);
        self.w("{");
        self.indent += 1;
        for handle in &captures {
            self.w(format!("let {} = {}.clone();", handle, handle));
        }
        self.w(format!("{}.push(Box::new(move || {{", scope_var));
        self.indent += 1;
        self.w("let mut _defers = DeferScope::new();");
        self.w("let mut env = Env::new();");
        self.w("let env = &mut env;");
        self.w("let _ = &env;");
        let saved_loop = std::mem::take(&mut self.loop_depth);
        let saved_try = std::mem::take(&mut self.try_depth);
        let saved_fn = self.current_fn.take();
        self.stmt_block(body)?;
        self.current_fn = saved_fn;
        self.try_depth = saved_try;
        self.loop_depth = saved_loop;
        self.indent -= 1;
        self.w("}));");
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    fn spawn_push(
        &mut self,
        params: &[String],
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CodeGenError> {
        let mut refs = HashSet::new();
        collect_stack_refs(body, &mut refs);
        self.mark_shared(&refs);
        let captures = self.local_captures(&refs);

        self.w("{");
        self.indent += 1;
        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        // Parameters pop from the data stack at push time (first takes
        // the top) and ride into the closure by value.
        for p in params {
            let Some(d) = self.stack("dstack", line) else {
                continue;
            };
            let rt = d.rt_name.clone();
            self.bind_native(p, ElemType::I64, line, |_| format!("{}.pop()", rt));
        }
        for handle in &captures {
            self.w(format!("let {} = {}.clone();", handle, handle));
        }
        self.w("workqueue::global().push(Arc::new(move || {");
        self.indent += 1;
        self.w("let mut _defers = DeferScope::new();");
        self.w("let mut env = Env::new();");
        self.w("let env = &mut env;");
        self.w("let _ = &env;");
        let saved_hosts = std::mem::take(&mut self.block_hosts);
        let saved_loop = std::mem::take(&mut self.loop_depth);
        let saved_fn = self.current_fn.take();
        let saved_try = std::mem::take(&mut self.try_depth);
        self.stmt_block(body)?;
        self.try_depth = saved_try;
        self.current_fn = saved_fn;
        self.loop_depth = saved_loop;
        self.block_hosts = saved_hosts;
        self.indent -= 1;
        self.w("}));");
        self.views.pop_scope();
        self.stacks.pop_scope();
        self.symbols.pop_scope();
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn gen_func(&mut self, f: &FuncDecl) -> Result<(), CodeGenError> {
        let sig = self
            .funcs
            .get(&f.name)
            .cloned()
            .ok_or_else(|| format!("function '{}' missing from hoisted table", f.name))?;

        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        self.current_fn = Some(f.name.clone());

        let mut params = vec!["env: &mut Env".to_string()];
        for (pname, pty) in &sig.params {
            match self.symbols.declare_native(pname, *pty) {
                Ok(sym) => params.push(format!(
                    "mut {}: {}",
                    Self::native_name(sym.index, pname),
                    rust_type(*pty)
                )),
                Err(e) => self.diag(f.line, e),
            }
        }
        let ret = match sig.ret {
            Some(t) => format!(" -> {}", rust_type(t)),
            None => String::new(),
        };

        self.indent = 1;
        for s in &f.body {
            self.stmt(s)?;
        }
        if let Some(t) = sig.ret {
            self.w(format!("return {};", rust_zero(t)));
        }
        let body = std::mem::take(&mut self.out);

        writeln!(
            self.funcs_out,
            "fn uf_{}({}){} {{",
            f.name,
            params.join(", "),
            ret
        )?;
        self.funcs_out
            .push_str("\tlet mut _defers = DeferScope::new();\n");
        self.funcs_out.push_str(&body);
        self.funcs_out.push_str("}\n\n");

        self.current_fn = None;
        self.views.pop_scope();
        self.stacks.pop_scope();
        self.symbols.pop_scope();
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Target syntax helpers
// ----------------------------------------------------------------------

/// The guard variable every kernel body works through.
fn kernel_guard() -> &'static str {
    "ual_guard"
}

fn rust_type(ty: ElemType) -> &'static str {
    match ty {
        ElemType::I64 => "i64",
        ElemType::F64 => "f64",
        ElemType::Str => "String",
        ElemType::Bool => "bool",
        ElemType::Bytes => "Vec<u8>",
    }
}

fn rust_zero(ty: ElemType) -> &'static str {
    match ty {
        ElemType::I64 => "0",
        ElemType::F64 => "0.0",
        ElemType::Str => "String::new()",
        ElemType::Bool => "false",
        ElemType::Bytes => "Vec::new()",
    }
}

fn rust_perspective(p: Perspective) -> &'static str {
    match p {
        Perspective::Lifo => "Perspective::Lifo",
        Perspective::Fifo => "Perspective::Fifo",
        Perspective::Indexed | Perspective::Maxfo | Perspective::Minfo => "Perspective::Indexed",
        Perspective::Hash => "Perspective::Hash",
    }
}

fn rust_binop(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Gt => ">",
        BinOp::Le => "<=",
        BinOp::Ge => ">=",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

fn rust_fold(op: BinOp) -> char {
    match op {
        BinOp::Add => '+',
        BinOp::Sub => '-',
        BinOp::Mul => '*',
        _ => '/',
    }
}

fn value_accessor(ty: ElemType) -> &'static str {
    match ty {
        ElemType::I64 => "as_i64",
        ElemType::F64 => "as_f64",
        ElemType::Str => "as_str",
        ElemType::Bool => "as_bool",
        ElemType::Bytes => "as_bytes",
    }
}

fn rust_convert(var: &str, from: ElemType, to: ElemType) -> String {
    use ElemType::*;
    match (from, to) {
        _ if from == to => var.to_string(),
        (I64, F64) => format!("({} as f64)", var),
        (F64, I64) => format!("({} as i64)", var),
        (I64, Str) | (F64, Str) => format!("format!(\"{{}}\", {})", var),
        (Bool, I64) => format!("({} as i64)", var),
        (I64, Bool) => format!("({} != 0)", var),
        (Bytes, Str) => format!("String::from_utf8_lossy(&{}).into_owned()", var),
        (Str, Bytes) => format!("{}.into_bytes()", var),
        _ => var.to_string(),
    }
}

fn rust_float(v: f64) -> String {
    let s = format!("{}", v);
    if s.contains('.') || s.contains('e') {
        s
    } else {
        format!("{}.0", s)
    }
}

fn rust_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn case_label_str(label: &CaseLabel) -> String {
    match label {
        CaseLabel::Name(n) => n.clone(),
        CaseLabel::Int(v) => v.to_string(),
        CaseLabel::Default => "_".to_string(),
    }
}

fn aux_stack_name(ty: ElemType) -> &'static str {
    match ty {
        ElemType::I64 => "UAL_VARS_I64",
        ElemType::F64 => "UAL_VARS_F64",
        ElemType::Str => "UAL_VARS_STR",
        ElemType::Bool => "UAL_VARS_BOOL",
        ElemType::Bytes => "UAL_VARS_BYTES",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::parser::Parser;

    fn gen(source: &str) -> GeneratedCode {
        let program = Parser::new(source).parse().expect("parse");
        RustBackend::new(CompileOptions {
            backend: Backend::Rust,
            ..Default::default()
        })
        .generate(&program)
        .expect("generate")
    }

    fn gen_ok(source: &str) -> String {
        let out = gen(source);
        assert!(
            out.diagnostics.is_empty(),
            "unexpected diagnostics: {:?}",
            out.diagnostics
        );
        out.code
    }

    #[test]
    fn test_hello_arithmetic() {
        let code = gen_ok("@Stack.new(i64): alias:\"i\"\n@i: push(3) push(4) add\n@i: dot");
        assert!(code.contains(
            "static US_i: LazyLock<Stack<i64>> = LazyLock::new(|| Stack::with_capacity(Perspective::Lifo, None));"
        ));
        assert!(code.contains("US_i.push(3);"));
        assert!(code.contains("arith::div_i64") || code.contains("US_i.push(ua_"));
        assert!(code.contains("println!(\"{}\", US_i.pop());"));
        assert!(code.contains("fn ual_main(env: &mut Env)"));
        assert!(code.contains("ual_runtime::install_quiet_panic_hook();"));
    }

    #[test]
    fn test_local_stack_is_arc() {
        let code = gen_ok("func f() {\n @t = Stack.new(i64)\n @t: push(1)\n}");
        assert!(code.contains("let us_t = Arc::new(Stack::<i64>::with_capacity(Perspective::Lifo, None));"));
    }

    #[test]
    fn test_float_push_onto_int_stack_rejected() {
        let out = gen("@i = Stack.new(i64)\n@i: push(1.5)");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.line == 2 && d.message.contains("float")),
            "got: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_bring_conversion() {
        let code = gen_ok("@i = Stack.new(i64)\n@s = Stack.new(str)\n@i: push(1)\n@s < @i");
        assert!(code.contains("format!(\"{}\", uv_"));
    }

    #[test]
    fn test_consider_lowering() {
        let code = gen_ok(
            "@s = Stack.new(i64)\n@s {\n push(1)\n}.consider( ok: print:\"ok\" error |e|: print:e )",
        );
        assert!(code.contains("env.save_status();"));
        assert!(code.contains("if env.status == \"ok\" && UAL_ERROR.len() > 0 {"));
        assert!(code.contains("env.restore_status("));
        assert!(code.contains("unhandled consider status"));
    }

    #[test]
    fn test_defer_scope_guard() {
        let code = gen_ok("func f() {\n @defer < { print:\"a\" }\n print:\"c\"\n}\nf()");
        assert!(code.contains("let mut _defers = DeferScope::new();"));
        assert!(code.contains("_defers.push(Box::new(move || {"));
        assert!(code.contains("uf_f(env);"));
    }

    #[test]
    fn test_select_blocking_form() {
        let code = gen_ok(
            "@c = Stack.new(i64)\n@c {}.select( @c { |v| print:v } timeout(200, {|| print:\"timeout\"}) )",
        );
        assert!(code.contains("Context::with_cancel();"));
        assert!(code.contains("std::thread::spawn(move || {"));
        assert!(code.contains("take_with_context(&ctx, 200)"));
        assert!(code.contains("ual_runtime::select_wait(&"));
        assert!(code.contains("SELECT_RESTART"));
        assert!(code.contains(".as_i64()"));
    }

    #[test]
    fn test_select_nonblocking_form() {
        let code = gen_ok(
            "@c = Stack.new(i64)\n@c {}.select( @c { |v| print:v } _ : { print:\"empty\" } )",
        );
        assert!(code.contains("if US_c.len() > 0 {"));
        assert!(!code.contains("select_wait"));
    }

    #[test]
    fn test_spawn_lowering() {
        let code = gen_ok("@c = Stack.new(i64)\n@spawn < { @c < 42 }\n@spawn pop play");
        assert!(code.contains("workqueue::global().push(Arc::new(move || {"));
        assert!(code.contains("let mut env = Env::new();"));
        assert!(code.contains("workqueue::run_task(task);"));
    }

    #[test]
    fn test_spawn_params_pop_at_push_time() {
        let code = gen_ok("@c = Stack.new(i64)\n@dstack: push(9)\n@spawn < { |n| @c < n }");
        let pop_pos = code.find("env.dstack.pop()").expect("param pop");
        let push_pos = code.find("workqueue::global().push").expect("queue push");
        assert!(pop_pos < push_pos, "parameters are popped before the push");
    }

    #[test]
    fn test_compute_kernel_hash() {
        let code = gen_ok(
            "@s = Stack.new(f64, Hash)\n@s: set(\"mass\", 2.0) set(\"accel\", 9.8)\n@s {}.compute({ || var force = self.mass * self.accel\nreturn force })",
        );
        assert!(code.contains("let mut ual_guard = US_s.lock();"));
        assert!(code.contains("ual_guard.get_raw(\"mass\")"));
        assert!(code.contains("ual_guard.set_raw(\"__result_0__\""));
        assert!(code.contains("drop(ual_guard);"));
    }

    #[test]
    fn test_compute_slice_views() {
        let code =
            gen_ok("@s = Stack.new(f64, Hash)\n@s {}.compute({ || self.xs[0] = self.xs[1] })");
        assert!(code.contains("let view_xs = ual_guard.slice_raw(\"xs\");"));
        assert!(code.contains("view_xs.set((0) as usize, view_xs.get((1) as usize));"));
    }

    #[test]
    fn test_kernel_local_array() {
        let code = gen_ok(
            "@s = Stack.new(f64)\n@s {}.compute({ || var buf[4]\nbuf[0] = 1.5\nreturn buf[0] })",
        );
        assert!(code.contains("= [0.0; 4];"));
        assert!(code.contains("[(0) as usize] = 1.5;"));
    }

    #[test]
    fn test_try_catch_resume_unwind() {
        let code = gen_ok(
            "try {\n panic \"boom\"\n} catch |e| {\n print:e\n panic\n} finally {\n print:\"done\"\n}",
        );
        assert!(code.contains("std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {"));
        assert!(code.contains("ual_runtime::panic_message(&"));
        assert!(code.contains("std::panic::resume_unwind("));
        assert!(code.contains("let mut _try_finally = DeferScope::new();"));
    }

    #[test]
    fn test_status_set_and_value() {
        let code = gen_ok("status:fail(\"why\")");
        assert!(code.contains("env.status = String::from(\"fail\");"));
        assert!(code.contains("env.status_value = Some(Value::from(String::from(\"why\")));"));
    }

    #[test]
    fn test_stack_resident_variables_default() {
        let code = gen_ok("var x = 7\nprint(x)");
        assert!(code.contains("UAL_VARS_I64.push_at(0, 7);"));
        assert!(code.contains("UAL_VARS_I64.peek_at(0)"));
        assert!(code.contains("static UAL_VARS_I64"));
    }

    #[test]
    fn test_optimize_native_variables() {
        let program = Parser::new("var x = 7\nprint(x)").parse().unwrap();
        let out = RustBackend::new(CompileOptions {
            backend: Backend::Rust,
            optimize: true,
            ..Default::default()
        })
        .generate(&program)
        .unwrap();
        assert!(out.code.contains("let mut uv_0_x: i64 = 7;"));
        assert!(!out.code.contains("UAL_VARS_I64"));
    }

    #[test]
    fn test_string_reads_clone() {
        let program = Parser::new("var s: str = \"hi\"\nprint(s)").parse().unwrap();
        let out = RustBackend::new(CompileOptions {
            backend: Backend::Rust,
            optimize: true,
            ..Default::default()
        })
        .generate(&program)
        .unwrap();
        assert!(out.code.contains("uv_0_s.clone()"));
    }

    #[test]
    fn test_take_rvalue() {
        let code = gen_ok("@c = Stack.new(i64)\n@c: push(1)\nlet x\nx = @c: take(500)");
        assert!(code.contains(".take_value((500) as u64)"));
    }

    #[test]
    fn test_reduce_rvalue_and_statement() {
        let code = gen_ok("@c = Stack.new(i64)\n@c: push(1) push(2)\nvar t = @c: reduce(add)\n@c: reduce(mul)");
        assert!(code.contains("arith::reduce_i64(&US_c, b'+')"));
        assert!(code.contains("arith::reduce_i64(&US_c, b'*')"));
    }

    #[test]
    fn test_for_loop_directions() {
        let lifo = gen_ok("@s = Stack.new(i64)\n@s for { |v| print(v) }");
        assert!(lifo.contains(".rev()"));
        let fifo = gen_ok("@q = Stack.new(i64, FIFO)\n@q for { |v| print(v) }");
        assert!(!fifo.contains(".rev()"));
    }

    #[test]
    fn test_hash_compute_binding_rejected() {
        let out = gen("@s = Stack.new(f64, Hash)\n@s {}.compute({ |a| return a })");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("forbidden on Hash")),
            "got: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_no_forth_mode() {
        let program = Parser::new("let x").parse().unwrap();
        let out = RustBackend::new(CompileOptions {
            backend: Backend::Rust,
            no_forth: true,
            ..Default::default()
        })
        .generate(&program)
        .unwrap();
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("no_forth")),
            "got: {:?}",
            out.diagnostics
        );
        assert!(!out.code.contains("static UAL_BOOL"));
    }

    #[test]
    fn test_view_op_swaps_perspective() {
        let code = gen_ok("@s = Stack.new(i64)\nview q = @s . fifo\nq: push(1)");
        assert!(code.contains(".perspective();"));
        assert!(code.contains(".set_perspective(Perspective::Fifo);"));
    }

    #[test]
    fn test_math_intrinsics() {
        let code = gen_ok("@s = Stack.new(f64)\n@s {}.compute({ || var r = sqrt(self[0])\nreturn r })");
        assert!(code.contains("f64::sqrt("));
    }

    #[test]
    fn test_return_inside_try_rejected() {
        let out = gen("func f(): i64 {\n try {\n  return 1\n } catch { drop }\n return 2\n}");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("inside a try block")),
            "got: {:?}",
            out.diagnostics
        );
    }
}
