//! Go backend
//!
//! Emits one self-contained Go source file. A fixed preamble synthesizes
//! the runtime surface the lowered code depends on: the perspective
//! stack with its mutex and arrival channel, blocking takes under a
//! `context.Context`, the spawn queue, and the per-goroutine environment
//! carrying `dstack`/`rstack` and the consider pair, so the emitted
//! program needs nothing beyond the Go standard library.
//!
//! Lowering conventions:
//! - stacks become `uS_<name>` (`*ualStack`); functions become
//!   `uF_<name>` and take `env *ualEnv` first
//! - native variable cells become `uV_<n>_<name>`; stack-resident
//!   variables read/write `ualVars<T>` slots
//! - `defer` maps to Go's own defer, `try/catch` to recover, `select`
//!   to one worker goroutine per case racing into a buffered channel

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

/// The always-emitted runtime preamble.
const PRELUDE: &str = r#"
type ualPerspective int

const (
	ualLIFO ualPerspective = iota
	ualFIFO
	ualIndexed
	ualHash
)

type ualStack struct {
	mu       sync.Mutex
	items    []interface{}
	hash     map[string]interface{}
	persp    ualPerspective
	frozen   bool
	capacity int
	name     string
	arrivals chan struct{}
}

func ualNewStack(name string, persp ualPerspective, capacity int) *ualStack {
	return &ualStack{
		name:     name,
		persp:    persp,
		capacity: capacity,
		hash:     map[string]interface{}{},
		arrivals: make(chan struct{}, 1),
	}
}

func (s *ualStack) notify() {
	select {
	case s.arrivals <- struct{}{}:
	default:
	}
}

func (s *ualStack) Push(v interface{}) {
	s.mu.Lock()
	if s.frozen {
		s.mu.Unlock()
		panic("push: stack '" + s.name + "' is frozen")
	}
	if s.capacity > 0 && len(s.items) >= s.capacity {
		s.mu.Unlock()
		panic("push: stack '" + s.name + "' capacity exceeded")
	}
	s.items = append(s.items, v)
	s.mu.Unlock()
	s.notify()
}

func (s *ualStack) popLocked() (interface{}, bool) {
	if len(s.items) == 0 {
		return nil, false
	}
	if s.persp == ualFIFO {
		v := s.items[0]
		s.items = s.items[1:]
		return v, true
	}
	v := s.items[len(s.items)-1]
	s.items = s.items[:len(s.items)-1]
	return v, true
}

func (s *ualStack) Pop() interface{} {
	s.mu.Lock()
	defer s.mu.Unlock()
	if s.frozen {
		panic("pop: stack '" + s.name + "' is frozen")
	}
	v, ok := s.popLocked()
	if !ok {
		panic("pop: stack '" + s.name + "' underflow")
	}
	return v
}

func (s *ualStack) Peek() interface{} {
	s.mu.Lock()
	defer s.mu.Unlock()
	if len(s.items) == 0 {
		panic("peek: stack '" + s.name + "' underflow")
	}
	if s.persp == ualFIFO {
		return s.items[0]
	}
	return s.items[len(s.items)-1]
}

func (s *ualStack) PeekAt(i int64) interface{} {
	s.mu.Lock()
	defer s.mu.Unlock()
	if i < 0 || i >= int64(len(s.items)) {
		panic("peek_at: stack '" + s.name + "' index out of range")
	}
	return s.items[i]
}

func (s *ualStack) PushAt(i int64, v interface{}) {
	s.mu.Lock()
	defer s.mu.Unlock()
	if s.frozen {
		panic("push_at: stack '" + s.name + "' is frozen")
	}
	for int64(len(s.items)) <= i {
		s.items = append(s.items, nil)
	}
	s.items[i] = v
}

func (s *ualStack) Len() int64 {
	s.mu.Lock()
	defer s.mu.Unlock()
	return int64(len(s.items))
}

func (s *ualStack) Clear() {
	s.mu.Lock()
	defer s.mu.Unlock()
	if s.frozen {
		panic("clear: stack '" + s.name + "' is frozen")
	}
	s.items = nil
	s.hash = map[string]interface{}{}
}

func (s *ualStack) Freeze() {
	s.mu.Lock()
	defer s.mu.Unlock()
	s.frozen = true
}

func (s *ualStack) Persp() ualPerspective {
	s.mu.Lock()
	defer s.mu.Unlock()
	return s.persp
}

func (s *ualStack) SetPerspective(p ualPerspective) {
	s.mu.Lock()
	defer s.mu.Unlock()
	s.persp = p
}

func (s *ualStack) Snapshot() []interface{} {
	s.mu.Lock()
	defer s.mu.Unlock()
	out := make([]interface{}, len(s.items))
	copy(out, s.items)
	return out
}

func (s *ualStack) Set(key string, v interface{}) {
	s.mu.Lock()
	defer s.mu.Unlock()
	if s.frozen {
		panic("set: stack '" + s.name + "' is frozen")
	}
	s.hash[key] = v
}

func (s *ualStack) Get(key string) interface{} {
	s.mu.Lock()
	defer s.mu.Unlock()
	v, ok := s.hash[key]
	if !ok {
		panic("get: no value for key '" + key + "' on stack '" + s.name + "'")
	}
	return v
}

func (s *ualStack) Dup() {
	s.mu.Lock()
	defer s.mu.Unlock()
	n := len(s.items)
	if n == 0 {
		panic("dup: stack '" + s.name + "' underflow")
	}
	s.items = append(s.items, s.items[n-1])
}

func (s *ualStack) Drop() {
	s.mu.Lock()
	defer s.mu.Unlock()
	n := len(s.items)
	if n == 0 {
		panic("drop: stack '" + s.name + "' underflow")
	}
	s.items = s.items[:n-1]
}

func (s *ualStack) Swap() {
	s.mu.Lock()
	defer s.mu.Unlock()
	n := len(s.items)
	if n < 2 {
		panic("swap: stack '" + s.name + "' underflow")
	}
	s.items[n-1], s.items[n-2] = s.items[n-2], s.items[n-1]
}

func (s *ualStack) Over() {
	s.mu.Lock()
	defer s.mu.Unlock()
	n := len(s.items)
	if n < 2 {
		panic("over: stack '" + s.name + "' underflow")
	}
	s.items = append(s.items, s.items[n-2])
}

func (s *ualStack) Rot() {
	s.mu.Lock()
	defer s.mu.Unlock()
	n := len(s.items)
	if n < 3 {
		panic("rot: stack '" + s.name + "' underflow")
	}
	third := s.items[n-3]
	copy(s.items[n-3:], s.items[n-2:])
	s.items[n-1] = third
}

// TakeCtx blocks until a value arrives, the timeout elapses, or ctx is
// cancelled. Returns (value, ok, timedOut); a cancelled take is
// observable (ok == false, timedOut == false) but not an error.
func (s *ualStack) TakeCtx(ctx context.Context, timeoutMs int64) (interface{}, bool, bool) {
	var timeout <-chan time.Time
	if timeoutMs > 0 {
		t := time.NewTimer(time.Duration(timeoutMs) * time.Millisecond)
		defer t.Stop()
		timeout = t.C
	}
	for {
		s.mu.Lock()
		v, ok := s.popLocked()
		rem := len(s.items)
		s.mu.Unlock()
		if ok {
			if rem > 0 {
				s.notify()
			}
			return v, true, false
		}
		var done <-chan struct{}
		if ctx != nil {
			done = ctx.Done()
		}
		select {
		case <-s.arrivals:
		case <-done:
			return nil, false, false
		case <-timeout:
			return nil, false, true
		}
	}
}

// TakeV is the expression form of take: timeout or cancellation unwinds.
func (s *ualStack) TakeV(timeoutMs int64) interface{} {
	v, ok, timedOut := s.TakeCtx(nil, timeoutMs)
	if timedOut {
		panic("take: timeout on stack '" + s.name + "'")
	}
	if !ok {
		panic("take: cancelled on stack '" + s.name + "'")
	}
	return v
}

func (s *ualStack) PopWith(p ualPerspective) interface{} {
	s.mu.Lock()
	old := s.persp
	s.persp = p
	v, ok := s.popLocked()
	s.persp = old
	s.mu.Unlock()
	if !ok {
		panic("pop: stack '" + s.name + "' underflow")
	}
	return v
}

func (s *ualStack) PeekWith(p ualPerspective) interface{} {
	s.mu.Lock()
	defer s.mu.Unlock()
	if len(s.items) == 0 {
		panic("peek: stack '" + s.name + "' underflow")
	}
	if p == ualFIFO {
		return s.items[0]
	}
	return s.items[len(s.items)-1]
}

// Raw operations: the caller holds s.mu for the whole compute kernel.
func (s *ualStack) Lock()   { s.mu.Lock() }
func (s *ualStack) Unlock() { s.mu.Unlock() }

func (s *ualStack) popRaw() interface{} {
	v, ok := s.popLocked()
	if !ok {
		panic("pop: stack '" + s.name + "' underflow")
	}
	return v
}

func (s *ualStack) pushRaw(v interface{}) {
	s.items = append(s.items, v)
}

func (s *ualStack) getRaw(key string) interface{} {
	v, ok := s.hash[key]
	if !ok {
		panic("get: no value for key '" + key + "' on stack '" + s.name + "'")
	}
	return v
}

func (s *ualStack) setRaw(key string, v interface{}) {
	s.hash[key] = v
}

func (s *ualStack) getAtRaw(i int64) interface{} {
	if i < 0 || i >= int64(len(s.items)) {
		panic("index: stack '" + s.name + "' index out of range")
	}
	return s.items[i]
}

func (s *ualStack) getBufRaw(key string) []byte {
	v, ok := s.hash[key]
	if !ok {
		panic("no buffer for key '" + key + "' on stack '" + s.name + "'")
	}
	return v.([]byte)
}

func ualDivI(a, b int64) int64 {
	if b == 0 {
		return 0
	}
	return a / b
}

func ualModI(a, b int64) int64 {
	if b == 0 {
		return 0
	}
	return a % b
}

func ualDivF(a, b float64) float64 {
	if b == 0 {
		return 0
	}
	return a / b
}

func ualAbsI(v int64) int64 {
	if v < 0 {
		return -v
	}
	return v
}

func ualB2I(b bool) int64 {
	if b {
		return 1
	}
	return 0
}

func ualDot(v interface{})   { fmt.Println(v) }
func ualPrint(v interface{}) { fmt.Println(v) }

func ualSleep(ms int64) { time.Sleep(time.Duration(ms) * time.Millisecond) }

func ualPanicMsg(r interface{}) string { return fmt.Sprint(r) }

func ualToStr(v interface{}) string {
	if v == nil {
		return ""
	}
	return fmt.Sprint(v)
}

func ualUnhandledStatus(status string) {
	panic("unhandled consider status '" + status + "'")
}

func ualReduceI(s *ualStack, op byte) int64 {
	snap := s.Snapshot()
	if len(snap) == 0 {
		return 0
	}
	acc := snap[0].(int64)
	for _, raw := range snap[1:] {
		b := raw.(int64)
		switch op {
		case '+':
			acc += b
		case '-':
			acc -= b
		case '*':
			acc *= b
		case '/':
			acc = ualDivI(acc, b)
		}
	}
	return acc
}

func ualReduceF(s *ualStack, op byte) float64 {
	snap := s.Snapshot()
	if len(snap) == 0 {
		return 0
	}
	acc := snap[0].(float64)
	for _, raw := range snap[1:] {
		b := raw.(float64)
		switch op {
		case '+':
			acc += b
		case '-':
			acc -= b
		case '*':
			acc *= b
		case '/':
			acc = ualDivF(acc, b)
		}
	}
	return acc
}

// Per-goroutine environment: private data/return stacks plus the
// consider pair, threaded explicitly through every generated frame.
type ualEnv struct {
	dstack    *ualStack
	rstack    *ualStack
	status    string
	statusVal interface{}
}

func ualNewEnv() *ualEnv {
	return &ualEnv{
		dstack: ualNewStack("dstack", ualLIFO, 0),
		rstack: ualNewStack("rstack", ualLIFO, 0),
		status: "ok",
	}
}

// The global spawn queue: a lock-guarded vector of pending closures.
type ualQueue struct {
	mu    sync.Mutex
	items []func()
}

func (q *ualQueue) Push(f func()) {
	q.mu.Lock()
	defer q.mu.Unlock()
	q.items = append(q.items, f)
}

func (q *ualQueue) Pop() func() {
	q.mu.Lock()
	defer q.mu.Unlock()
	if len(q.items) == 0 {
		return nil
	}
	f := q.items[len(q.items)-1]
	q.items = q.items[:len(q.items)-1]
	return f
}

func (q *ualQueue) Peek() func() {
	q.mu.Lock()
	defer q.mu.Unlock()
	if len(q.items) == 0 {
		return nil
	}
	return q.items[len(q.items)-1]
}

func (q *ualQueue) Len() int64 {
	q.mu.Lock()
	defer q.mu.Unlock()
	return int64(len(q.items))
}

func (q *ualQueue) Clear() {
	q.mu.Lock()
	defer q.mu.Unlock()
	q.items = nil
}

var ualSpawnQueue = &ualQueue{}

// Popped closures run on fresh goroutines, never inline.
func ualRunTask(f func()) { go f() }

// One message per select worker: idx >= 0 wins, -1 restarts the whole
// select, -2 marks a case as finished without a value.
type ualSelWin struct {
	idx int
	val interface{}
}

func ualSelWait(win chan ualSelWin, n int) ualSelWin {
	done := 0
	for {
		r := <-win
		if r.idx == -2 {
			done++
			if done == n {
				return r
			}
			continue
		}
		return r
	}
}
"#;

/// Zero-copy typed views over Hash byte buffers; emitted only when a
/// compute kernel uses `self.prop[i]`.
const PRELUDE_SLICES: &str = r#"
func ualFloatSlice(b []byte) []float64 {
	if len(b) == 0 {
		return nil
	}
	return unsafe.Slice((*float64)(unsafe.Pointer(&b[0])), len(b)/8)
}

func ualIntSlice(b []byte) []int64 {
	if len(b) == 0 {
		return nil
	}
	return unsafe.Slice((*int64)(unsafe.Pointer(&b[0])), len(b)/8)
}
"#;

/// Context for the compute kernel currently being lowered.
struct KernelCtx {
    rt: String,
    elem: ElemType,
    hash: bool,
}

pub(crate) struct GoBackend {
    options: CompileOptions,
    symbols: SymbolTable,
    stacks: ScopedMap<StackInfo>,
    views: ScopedMap<ViewInfo>,
    funcs: std::collections::HashMap<String, FuncSig>,
    diagnostics: Vec<Diagnostic>,
    /// Rendered global declarations (hoisted stacks, auxiliary stacks).
    global_decls: Vec<String>,
    funcs_out: String,
    out: String,
    indent: usize,
    tmp: usize,
    /// Non-zero inside a conditional or loop body: freeze transitions
    /// observed there are not statically certain.
    cond_depth: usize,
    loop_depth: usize,
    /// The action variable of the enclosing select timeout handler.
    timeout_act: Option<String>,
    /// Non-zero inside a try body: `return` would exit the recover
    /// closure instead of the function, so it is rejected there.
    try_depth: usize,
    /// Recover temp of the enclosing catch block (bare `panic` re-raise).
    catch_tmp: Vec<String>,
    /// Stack of enclosing stack-block hosts for implicit ops.
    block_hosts: Vec<String>,
    current_fn: Option<String>,
    kernel: Option<KernelCtx>,
    needs_math: bool,
    needs_unsafe: bool,
    used_aux: HashSet<ElemType>,
}

impl GoBackend {
    pub fn new(options: CompileOptions) -> Self {
        GoBackend {
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
            timeout_act: None,
            try_depth: 0,
            catch_tmp: Vec::new(),
            block_hosts: Vec::new(),
            current_fn: None,
            kernel: None,
            needs_math: false,
            needs_unsafe: false,
            used_aux: HashSet::new(),
        }
    }

    pub fn generate(mut self, program: &Program) -> Result<GeneratedCode, CodeGenError> {
        self.funcs = hoist_functions(program);
        self.register_implicit_stacks();

        // Hoist program-level stack declarations so execution-order code
        // and functions can reference them.
        for stmt in &program.statements {
            if let Stmt::StackDecl { .. } = stmt {
                self.declare_stack(stmt, true);
            }
        }

        // Main body (top-level statements in source order).
        self.indent = 1;
        for stmt in &program.statements {
            match stmt {
                Stmt::FuncDecl(_) | Stmt::StackDecl { .. } => {}
                _ => self.stmt(stmt)?,
            }
        }
        let main_body = std::mem::take(&mut self.out);

        // Functions.
        for f in program.functions() {
            self.gen_func(f)?;
        }

        self.assemble(&main_body)
    }

    fn assemble(&mut self, main_body: &str) -> Result<GeneratedCode, CodeGenError> {
        let mut code = String::new();
        writeln!(code, "// Code generated by ualc. DO NOT EDIT.")?;
        writeln!(code, "package main")?;
        writeln!(code)?;
        writeln!(code, "import (")?;
        writeln!(code, "\t\"context\"")?;
        writeln!(code, "\t\"fmt\"")?;
        if self.needs_math {
            writeln!(code, "\t\"math\"")?;
        }
        writeln!(code, "\t\"os\"")?;
        writeln!(code, "\t\"sync\"")?;
        writeln!(code, "\t\"time\"")?;
        if self.needs_unsafe {
            writeln!(code, "\t\"unsafe\"")?;
        }
        writeln!(code, ")")?;
        code.push_str(PRELUDE);
        if self.needs_unsafe {
            code.push_str(PRELUDE_SLICES);
        }
        writeln!(code)?;

        // Keep the always-present pieces referenced so Go never sees an
        // unused declaration.
        writeln!(
            code,
            "var _ = []interface{{}}{{ualRunTask, ualSelWait, ualReduceI, ualReduceF, ualSleep,\n\tualDot, ualModI, ualAbsI, ualB2I, ualToStr, ualUnhandledStatus, ualDivF}}"
        )?;
        writeln!(code)?;

        if !self.options.no_forth {
            writeln!(code, "var ualBool = ualNewStack(\"bool\", ualLIFO, 0)")?;
            writeln!(code, "var ualError = ualNewStack(\"error\", ualLIFO, 0)")?;
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
                    "var {} = ualNewStack(\"__vars_{}\", ualIndexed, 0)",
                    aux_stack_name(ty),
                    ty
                )?;
            }
        }
        for decl in &self.global_decls {
            code.push_str(decl);
            code.push('\n');
        }
        writeln!(code)?;

        code.push_str(&self.funcs_out);

        writeln!(code, "func uMain(env *ualEnv) {{")?;
        writeln!(code, "\t_ = env")?;
        code.push_str(main_body);
        writeln!(code, "}}")?;
        writeln!(code)?;
        writeln!(code, "func main() {{")?;
        writeln!(code, "\tdefer func() {{")?;
        writeln!(code, "\t\tif r := recover(); r != nil {{")?;
        writeln!(
            code,
            "\t\t\tfmt.Fprintln(os.Stderr, \"panic:\", ualPanicMsg(r))"
        )?;
        writeln!(code, "\t\t\tos.Exit(2)")?;
        writeln!(code, "\t\t}}")?;
        writeln!(code, "\t}}()")?;
        writeln!(code, "\tuMain(ualNewEnv())")?;
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
            ("bool", "ualBool", ElemType::Bool),
            ("error", "ualError", ElemType::Str),
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

    /// Register (and for locals, emit) a stack declaration.
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
        let rt_name = format!("uS_{}", name);
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
        let ctor = format!(
            "ualNewStack({}, {}, {})",
            go_quote(name),
            go_perspective(*perspective),
            capacity.unwrap_or(0)
        );
        if global {
            self.global_decls.push(format!("var {} = {}", rt_name, ctor));
        } else {
            self.w(format!("{} := {}", rt_name, ctor));
            self.w(format!("_ = {}", rt_name));
        }
    }

    /// Resolve a stack by source name, with a diagnostic on failure.
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

    /// The stack bare ops apply to: the innermost stack block, else the
    /// data stack.
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

    // ------------------------------------------------------------------
    // Expression typing
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
            Expr::Float(v) => go_float(*v),
            Expr::Str(s) => go_quote(s),
            Expr::Bool(b) => b.to_string(),
            Expr::Ident(name) => self.read_var(name, line),
            Expr::StackRef(name) => {
                self.diag(line, format!("'@{}' is not a value in this position", name));
                "0".to_string()
            }
            Expr::PerspectiveLit(p) => go_perspective(*p).to_string(),
            Expr::TypeLit(t) => go_quote(&t.to_string()),
            Expr::Unary { op, operand } => {
                let inner = self.expr(operand, line)?;
                match op {
                    UnOp::Neg => format!("(-{})", inner),
                    UnOp::Not => format!("(!{})", inner),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let numeric = self
                    .expr_type(e)
                    .unwrap_or(ElemType::I64);
                let l = self.expr(lhs, line)?;
                let r = self.expr(rhs, line)?;
                let (l, r) = self.promote_pair(l, r, lhs, rhs, line);
                match (op, numeric) {
                    (BinOp::Div, ElemType::I64) => format!("ualDivI({}, {})", l, r),
                    (BinOp::Div, ElemType::F64) => format!("ualDivF({}, {})", l, r),
                    (BinOp::Mod, _) => format!("ualModI({}, {})", l, r),
                    _ => format!("({} {} {})", l, go_binop(*op), r),
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
                        "{}.PopWith({}).({})",
                        info.rt_name,
                        go_perspective(vinfo.perspective),
                        go_type(info.elem)
                    ),
                    StackExprOp::Peek => format!(
                        "{}.PeekWith({}).({})",
                        info.rt_name,
                        go_perspective(vinfo.perspective),
                        go_type(info.elem)
                    ),
                    StackExprOp::Len => format!("{}.Len()", info.rt_name),
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
                format!("{}.getRaw({}).({})", k.0, go_quote(prop), go_type(k.1))
            }
            Expr::SelfIndex { index } => {
                let Some(k) = self.kernel_ctx(line) else {
                    return Ok("0".to_string());
                };
                let idx = self.expr(index, line)?;
                format!("{}.getAtRaw({}).({})", k.0, idx, go_type(k.1))
            }
            Expr::SelfMemberIndex { prop, index } => {
                let Some(_) = self.kernel_ctx(line) else {
                    return Ok("0".to_string());
                };
                let idx = self.expr(index, line)?;
                format!("uView_{}[{}]", prop, idx)
            }
            Expr::Index { name, index } => {
                let idx = self.expr(index, line)?;
                let base = self.read_var_name(name, line);
                format!("{}[{}]", base, idx)
            }
            Expr::Codeblock { .. } => {
                self.diag(line, "a code block is not a value in this position");
                "0".to_string()
            }
        })
    }

    /// (rt_name, elem, is_hash) of the current kernel, or a diagnostic.
    fn kernel_ctx(&mut self, line: usize) -> Option<(String, ElemType, bool)> {
        match &self.kernel {
            Some(k) => Some((k.rt.clone(), k.elem, k.hash)),
            None => {
                self.diag(line, "'self' is only available inside a compute block");
                None
            }
        }
    }

    /// Insert int→float promotions so mixed infix arithmetic type-checks
    /// in Go.
    fn promote_pair(
        &self,
        l: String,
        r: String,
        lhs: &Expr,
        rhs: &Expr,
        _line: usize,
    ) -> (String, String) {
        let lt = self.expr_type(lhs);
        let rt = self.expr_type(rhs);
        match (lt, rt) {
            (Some(ElemType::I64), Some(ElemType::F64)) => (format!("float64({})", l), r),
            (Some(ElemType::F64), Some(ElemType::I64)) => (l, format!("float64({})", r)),
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
                    code = format!("float64({})", code);
                }
                parts.push(code);
            }
            if float_only {
                self.needs_math = true;
            }
            return Ok(match name {
                "sqrt" => format!("math.Sqrt({})", parts[0]),
                "sin" => format!("math.Sin({})", parts[0]),
                "cos" => format!("math.Cos({})", parts[0]),
                "exp" => format!("math.Exp({})", parts[0]),
                "log" => format!("math.Log({})", parts[0]),
                "floor" => format!("math.Floor({})", parts[0]),
                "ceil" => format!("math.Ceil({})", parts[0]),
                "round" => format!("math.Round({})", parts[0]),
                "pow" => format!("math.Pow({}, {})", parts[0], parts[1]),
                "abs" => {
                    if arg_ty == ElemType::F64 {
                        self.needs_math = true;
                        format!("math.Abs({})", parts[0])
                    } else {
                        format!("ualAbsI({})", parts[0])
                    }
                }
                "min" => format!("min({}, {})", parts[0], parts[1]),
                "max" => format!("max({}, {})", parts[0], parts[1]),
                _ => unreachable!("intrinsic table covered above"),
            });
        }

        match name {
            "print" => {
                if args.len() != 1 {
                    self.diag(line, "print takes one argument");
                    return Ok("ualPrint(\"\")".to_string());
                }
                let arg = self.expr(&args[0], line)?;
                Ok(format!("ualPrint({})", arg))
            }
            "sleep" => {
                if args.len() != 1 {
                    self.diag(line, "sleep takes one argument (milliseconds)");
                    return Ok("ualSleep(0)".to_string());
                }
                let arg = self.expr(&args[0], line)?;
                Ok(format!("ualSleep({})", arg))
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
                Ok(format!("uF_{}({})", name, parts.join(", ")))
            }
        }
    }

    /// The pop/peek/take/len/reduce rvalue forms.
    fn value_op(
        &mut self,
        info: &StackInfo,
        op: StackExprOp,
        args: &[Expr],
        line: usize,
    ) -> Result<String, CodeGenError> {
        Ok(match op {
            StackExprOp::Pop => format!("{}.Pop().({})", info.rt_name, go_type(info.elem)),
            StackExprOp::Peek => format!("{}.Peek().({})", info.rt_name, go_type(info.elem)),
            StackExprOp::Len => format!("{}.Len()", info.rt_name),
            StackExprOp::Take => {
                let ms = match args.first() {
                    Some(a) => self.expr(a, line)?,
                    None => "0".to_string(),
                };
                format!("{}.TakeV({}).({})", info.rt_name, ms, go_type(info.elem))
            }
            StackExprOp::Reduce(fold) => {
                let helper = match info.elem {
                    ElemType::I64 => "ualReduceI",
                    ElemType::F64 => "ualReduceF",
                    _ => {
                        self.diag(line, "reduce requires a numeric stack");
                        return Ok("0".to_string());
                    }
                };
                format!("{}({}, '{}')", helper, info.rt_name, go_fold(fold))
            }
        })
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    fn native_name(index: usize, name: &str) -> String {
        format!("uV_{}_{}", index, name)
    }

    /// Emitted rvalue for reading a variable.
    fn read_var(&mut self, name: &str, line: usize) -> String {
        let Some(sym) = self.symbols.lookup(name).cloned() else {
            self.diag(line, format!("use of undeclared variable '{}'", name));
            return "0".to_string();
        };
        if sym.is_native {
            Self::native_name(sym.index, name)
        } else {
            self.used_aux.insert(sym.ty);
            format!(
                "{}.PeekAt({}).({})",
                aux_stack_name(sym.ty),
                sym.index,
                go_type(sym.ty)
            )
        }
    }

    /// Bare emitted name (kernel arrays are always native).
    fn read_var_name(&mut self, name: &str, line: usize) -> String {
        let Some(sym) = self.symbols.lookup(name).cloned() else {
            self.diag(line, format!("use of undeclared variable '{}'", name));
            return "uV_unknown".to_string();
        };
        Self::native_name(sym.index, name)
    }

    /// Emit a write of `value` (already Go source) into variable `name`.
    fn write_var(&mut self, name: &str, value: &str, line: usize) {
        let Some(sym) = self.symbols.lookup(name).cloned() else {
            self.diag(line, format!("assignment to undeclared variable '{}'", name));
            return;
        };
        if sym.is_native {
            self.w(format!("{} = {}", Self::native_name(sym.index, name), value));
        } else {
            self.used_aux.insert(sym.ty);
            self.w(format!(
                "{}.PushAt({}, {})",
                aux_stack_name(sym.ty),
                sym.index,
                value
            ));
        }
    }

    /// Declare a variable in the active storage scheme and emit its
    /// initialization.
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
        let value = init.unwrap_or_else(|| go_zero(ty).to_string());
        if sym.is_native {
            let goname = Self::native_name(sym.index, name);
            self.w(format!("var {} {} = {}", goname, go_type(ty), value));
            self.w(format!("_ = {}", goname));
        } else {
            self.used_aux.insert(ty);
            self.w(format!(
                "{}.PushAt({}, {})",
                aux_stack_name(ty),
                sym.index,
                value
            ));
        }
    }

    /// Coerce an expression toward an expected element type at a push or
    /// argument boundary. Int widens to float; float never narrows to
    /// int implicitly.
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
            (ElemType::I64, ElemType::F64) => format!("float64({})", code),
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
                            let code = self.coerce_push(
                                code,
                                self.expr_type(e),
                                Some(declared_ty),
                                *line,
                            );
                            Some(code)
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
                        let goname = Self::native_name(sym.index, name);
                        self.w(format!(
                            "{} := make([]{}, {})",
                            goname,
                            go_type(elem),
                            size
                        ));
                        self.w(format!("_ = {}", goname));
                    }
                    Err(e) => self.diag(*line, e),
                }
            }
            Stmt::FuncDecl(_) => {
                // Hoisted; nested function declarations are not supported.
            }
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
                let value = format!("{}.Pop().(int64)", d.rt_name);
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
                    let saved = self.fresh("P");
                    self.w(format!("{} := {}.Persp()", saved, info.rt_name));
                    self.w(format!(
                        "{}.SetPerspective({})",
                        info.rt_name,
                        go_perspective(p)
                    ));
                    for op in ops {
                        self.stack_op(&info, op)?;
                    }
                    self.w(format!("{}.SetPerspective({})", info.rt_name, saved));
                } else {
                    for op in ops {
                        self.stack_op(&info, op)?;
                    }
                }
                // Ops may have frozen the stack for later statements.
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
                self.w(format!("for {} {{", cond_code));
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
                self.w("break");
            }
            Stmt::Continue { line } => {
                if self.loop_depth == 0 {
                    self.diag(*line, "'continue' outside of a loop");
                }
                self.w("continue");
            }
            Stmt::Return { values, line } => {
                if self.try_depth > 0 {
                    self.diag(
                        *line,
                        "'return' inside a try block is not supported; set a status instead",
                    );
                    return Ok(());
                }
                self.ret(values, *line)?;
            }
            Stmt::DeferBlock { body, line } => {
                let _ = line;
                self.w("defer func() {");
                self.indent += 1;
                // The deferred body is its own closure: loop control from
                // the registration site does not reach into it.
                let saved_loop = std::mem::take(&mut self.loop_depth);
                self.stmt_block(body)?;
                self.loop_depth = saved_loop;
                self.indent -= 1;
                self.w("}()");
            }
            Stmt::Panic { value, line } => match value {
                Some(e) => {
                    let code = self.expr(e, *line)?;
                    self.w(format!("panic({})", code));
                }
                None => match self.catch_tmp.last() {
                    Some(tmp) => {
                        let tmp = tmp.clone();
                        self.w(format!("panic({})", tmp));
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
                self.w(format!("env.status = {}", go_quote(&label_str)));
                match value {
                    Some(e) => {
                        let code = self.expr(e, *line)?;
                        self.w(format!("env.statusVal = {}", code));
                    }
                    None => self.w("env.statusVal = nil"),
                }
            }
            Stmt::Retry { line } => match self.timeout_act.clone() {
                Some(act) => self.w(format!("{} = 1", act)),
                None => self.diag(*line, "'retry' is only legal inside a timeout handler"),
            },
            Stmt::Restart { line } => match self.timeout_act.clone() {
                Some(act) => self.w(format!("{} = 2", act)),
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
                let code = self.expr(value, *line)?;
                let code = if self.expr_type(value) == Some(ElemType::Str) {
                    code
                } else {
                    format!("ualToStr({})", code)
                };
                self.w(format!("{}.Push({})", err.rt_name, code));
            }
            Stmt::SpawnPush { params, body, line } => self.spawn_push(params, body, *line)?,
            Stmt::SpawnOp { op, play, line } => {
                let _ = line;
                match (op, play) {
                    (SpawnOpKind::Pop, true) => {
                        let f = self.fresh("f");
                        self.w(format!("if {} := ualSpawnQueue.Pop(); {} != nil {{", f, f));
                        self.w(format!("\tualRunTask({})", f));
                        self.w("}");
                    }
                    (SpawnOpKind::Peek, true) => {
                        let f = self.fresh("f");
                        self.w(format!("if {} := ualSpawnQueue.Peek(); {} != nil {{", f, f));
                        self.w(format!("\tualRunTask({})", f));
                        self.w("}");
                    }
                    (SpawnOpKind::Pop, false) => self.w("ualSpawnQueue.Pop()"),
                    (SpawnOpKind::Peek, false) => self.w("ualSpawnQueue.Peek()"),
                    (SpawnOpKind::Len, _) => {
                        if let Some(d) = self.stack("dstack", *line) {
                            self.w(format!("{}.Push(ualSpawnQueue.Len())", d.rt_name));
                        }
                    }
                    (SpawnOpKind::Clear, _) => self.w("ualSpawnQueue.Clear()"),
                }
            }
            Stmt::ExprStmt { expr, line } => {
                match expr {
                    Expr::Call { .. } => {
                        let code = self.expr(expr, *line)?;
                        self.w(code);
                    }
                    _ => {
                        // Evaluate for effect, discard the value.
                        let code = self.expr(expr, *line)?;
                        self.w(format!("_ = {}", code));
                    }
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
                Ok(format!("{}.Pop().(bool)", b.rt_name))
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
                self.w(format!("{}[{}] = {}", base, idx, code));
            }
            AssignTarget::SelfMemberIndex { prop, index } => {
                if self.kernel.is_none() {
                    self.diag(line, "container writes are only legal inside compute blocks");
                    return Ok(());
                }
                let idx = self.expr(index, line)?;
                let code = self.expr(value, line)?;
                self.w(format!("uView_{}[{}] = {}", prop, idx, code));
            }
        }
        Ok(())
    }

    fn ret(&mut self, values: &[Expr], line: usize) -> Result<(), CodeGenError> {
        if let Some(k) = &self.kernel {
            let (rt, hash, elem) = (k.rt.clone(), k.hash, k.elem);
            // Kernel return: results go back to the stack, then exit.
            for (i, v) in values.iter().enumerate() {
                let code = self.expr(v, line)?;
                let code = self.coerce_push(code, self.expr_type(v), Some(elem), line);
                if hash {
                    self.w(format!(
                        "{}.setRaw(\"__result_{}__\", {})",
                        rt, i, code
                    ));
                } else {
                    self.w(format!("{}.pushRaw({})", rt, code));
                }
            }
            self.w("return");
            return Ok(());
        }

        match &self.current_fn {
            Some(fname) => {
                let sig = self.funcs.get(fname).cloned();
                let ret_ty = sig.as_ref().and_then(|s| s.ret);
                match (values.len(), ret_ty) {
                    (0, None) => self.w("return"),
                    (0, Some(t)) => {
                        self.diag(line, "missing return value");
                        self.w(format!("return {}", go_zero(t)));
                    }
                    (1, Some(t)) => {
                        let code = self.expr(&values[0], line)?;
                        let code =
                            self.coerce_push(code, self.expr_type(&values[0]), Some(t), line);
                        self.w(format!("return {}", code));
                    }
                    (1, None) => {
                        self.diag(line, "function has no declared return type");
                        self.w("return");
                    }
                    (n, _) => {
                        self.diag(
                            line,
                            format!("a function returns at most one value, got {}", n),
                        );
                        self.w("return");
                    }
                }
            }
            None => {
                if !values.is_empty() {
                    self.diag(line, "top-level return takes no values");
                }
                self.w("return");
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
        let ty = go_type(elem);
        match op.kind {
            StackOpKind::Push => {
                self.check_writable(info, "push", line);
                let Some(arg) = op.args.first() else {
                    self.diag(line, "push needs a value");
                    return Ok(());
                };
                let code = self.expr(arg, line)?;
                let code = self.coerce_push(code, self.expr_type(arg), Some(elem), line);
                self.w(format!("{}.Push({})", rt, code));
            }
            StackOpKind::Pop | StackOpKind::Take => {
                self.check_writable(info, "pop", line);
                let source = if op.kind == StackOpKind::Take {
                    let ms = match op.args.first() {
                        Some(a) => self.expr(a, line)?,
                        None => "0".to_string(),
                    };
                    format!("{}.TakeV({}).({})", rt, ms, ty)
                } else {
                    format!("{}.Pop().({})", rt, ty)
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
                            None => self.diag(
                                line,
                                format!("pop target '{}' is not declared", name),
                            ),
                        }
                    }
                    None => {
                        // Bare pop/take routes through the data stack.
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
                        self.w(format!("{}.Push({})", d.rt_name, source));
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
                self.w(format!("{}.Push({}.Peek().({}))", d.rt_name, rt, ty));
            }
            StackOpKind::Dup => self.w(format!("{}.Dup()", rt)),
            StackOpKind::Drop => self.w(format!("{}.Drop()", rt)),
            StackOpKind::Swap => self.w(format!("{}.Swap()", rt)),
            StackOpKind::Over => self.w(format!("{}.Over()", rt)),
            StackOpKind::Rot => self.w(format!("{}.Rot()", rt)),
            StackOpKind::Tor | StackOpKind::Fromr => {
                if elem != ElemType::I64 {
                    self.diag(line, "tor/fromr move i64 values only");
                    return Ok(());
                }
                let Some(r) = self.stack("rstack", line) else {
                    return Ok(());
                };
                if op.kind == StackOpKind::Tor {
                    self.w(format!("{}.Push({}.Pop().(int64))", r.rt_name, rt));
                } else {
                    self.w(format!("{}.Push({}.Pop().(int64))", rt, r.rt_name));
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
                self.w(format!("\t{} := {}.Pop().({})", b, rt, ty));
                self.w(format!("\t{} := {}.Pop().({})", a, rt, ty));
                let result = match (op.kind, elem) {
                    (StackOpKind::Add, _) => format!("{} + {}", a, b),
                    (StackOpKind::Sub, _) => format!("{} - {}", a, b),
                    (StackOpKind::Mul, _) => format!("{} * {}", a, b),
                    (StackOpKind::Div, ElemType::I64) => format!("ualDivI({}, {})", a, b),
                    (StackOpKind::Div, _) => format!("ualDivF({}, {})", a, b),
                    (StackOpKind::Mod, _) => format!("ualModI({}, {})", a, b),
                    _ => unreachable!(),
                };
                self.w(format!("\t{}.Push({})", rt, result));
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
                let go_op = match op.kind {
                    StackOpKind::Eq => "==",
                    StackOpKind::Ne => "!=",
                    StackOpKind::Lt => "<",
                    StackOpKind::Gt => ">",
                    StackOpKind::Le => "<=",
                    StackOpKind::Ge => ">=",
                    _ => unreachable!(),
                };
                self.w("{");
                self.w(format!("\t{} := {}.Pop().({})", b, rt, ty));
                self.w(format!("\t{} := {}.Pop().({})", a, rt, ty));
                self.w(format!("\t{}.Push({} {} {})", bs.rt_name, a, go_op, b));
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
                self.w(format!(
                    "\t{} := {}.Pop().({})",
                    v,
                    src.rt_name,
                    go_type(src.elem)
                ));
                self.w(format!(
                    "\t{}.Push({})",
                    rt,
                    go_convert(&v, src.elem, elem)
                ));
                self.w("}");
            }
            StackOpKind::Freeze => self.w(format!("{}.Freeze()", rt)),
            StackOpKind::Perspective => {
                let Some(Expr::PerspectiveLit(p)) = op.args.first() else {
                    self.diag(line, "perspective takes a perspective literal");
                    return Ok(());
                };
                if !supported_perspective(*p) {
                    self.diag(
                        line,
                        format!("priority perspective {} is not supported", p),
                    );
                    return Ok(());
                }
                self.w(format!("{}.SetPerspective({})", rt, go_perspective(*p)));
            }
            StackOpKind::Has => {
                let Some(bs) = self.stack("bool", line) else {
                    return Ok(());
                };
                self.w(format!("{}.Push({}.Len() > 0)", bs.rt_name, rt));
            }
            StackOpKind::Clear => {
                self.check_writable(info, "clear", line);
                self.w(format!("{}.Clear()", rt));
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
                    self.w(format!("{}.Set({}, {})", rt, key, val));
                } else {
                    let val =
                        self.coerce_push(val, self.expr_type(&op.args[1]), Some(elem), line);
                    self.w(format!("{}.Set({}, {})", rt, key, val));
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
                self.w(format!(
                    "{}.Push({}.Get({}).(int64))",
                    d.rt_name, rt, key
                ));
            }
            StackOpKind::Len => {
                let Some(d) = self.stack("dstack", line) else {
                    return Ok(());
                };
                self.w(format!("{}.Push({}.Len())", d.rt_name, rt));
            }
            StackOpKind::Dot => self.w(format!("ualDot({}.Pop())", rt)),
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
                let source = format!("{}.Pop().({})", rt, ty);
                self.write_var(&name, &source, line);
            }
            StackOpKind::Reduce => {
                let fold = match op.args.first() {
                    Some(Expr::Binary { op: fold, .. }) => *fold,
                    _ => BinOp::Add,
                };
                let helper = match elem {
                    ElemType::I64 => "ualReduceI",
                    ElemType::F64 => "ualReduceF",
                    _ => {
                        self.diag(line, "reduce requires a numeric stack");
                        return Ok(());
                    }
                };
                let acc = self.fresh("acc");
                self.w("{");
                self.w(format!(
                    "\t{} := {}({}, '{}')",
                    acc,
                    helper,
                    rt,
                    go_fold(fold)
                ));
                self.w(format!("\t{}.Clear()", rt));
                self.w(format!("\t{}.Push({})", rt, acc));
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
        // LIFO iterates top to bottom; FIFO and Indexed bottom to top.
        let reverse = matches!(persp, Perspective::Lifo);
        let snap = self.fresh("snap");
        let idx = self.fresh("i");
        self.w("{");
        self.indent += 1;
        self.w(format!("{} := {}.Snapshot()", snap, info.rt_name));
        if reverse {
            self.w(format!(
                "for {i} := len({s}) - 1; {i} >= 0; {i}-- {{",
                i = idx,
                s = snap
            ));
        } else {
            self.w(format!(
                "for {i} := 0; {i} < len({s}); {i}++ {{",
                i = idx,
                s = snap
            ));
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
                    self.w(format!(
                        "{}.Push({}[{}].(int64))",
                        d.rt_name, snap, idx
                    ));
                }
            }
            1 => {
                self.bind_native(&bindings[0], info.elem, line, |_| {
                    format!("{}[{}].({})", snap, idx, go_type(info.elem))
                });
            }
            _ => {
                self.bind_native(&bindings[0], ElemType::I64, line, |_| {
                    format!("int64({})", idx)
                });
                self.bind_native(&bindings[1], info.elem, line, |_| {
                    format!("{}[{}].({})", snap, idx, go_type(info.elem))
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

    /// Declare `name` as a native binding initialized from `value_of`.
    fn bind_native(
        &mut self,
        name: &str,
        ty: ElemType,
        line: usize,
        value_of: impl Fn(&str) -> String,
    ) {
        match self.symbols.declare_native(name, ty) {
            Ok(sym) => {
                let goname = Self::native_name(sym.index, name);
                self.w(format!("{} := {}", goname, value_of(&goname)));
                self.w(format!("_ = {}", goname));
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
        let saved_s = self.fresh("ss");
        let saved_v = self.fresh("sv");
        self.w("{");
        self.indent += 1;
        self.w(format!(
            "{}, {} := env.status, env.statusVal",
            saved_s, saved_v
        ));
        self.w("env.status, env.statusVal = \"ok\", nil");

        // The attached stack block.
        self.block_hosts.push(stack.to_string());
        self.w("{");
        self.indent += 1;
        self.stmt_block(setup)?;
        self.indent -= 1;
        self.w("}");
        self.block_hosts.pop();

        // Implicit upgrade: a nonempty error stack turns "ok" into
        // "error". Without the Forth configuration there is no error
        // stack and no upgrade.
        if !self.options.no_forth {
            if let Some(err) = self.stack("error", line) {
                self.w(format!(
                    "if env.status == \"ok\" && {}.Len() > 0 {{",
                    err.rt_name
                ));
                self.w("\tenv.status = \"error\"");
                self.w(format!("\tenv.statusVal = {}.Peek()", err.rt_name));
                self.w("}");
            }
        }

        // Dispatch as an if/else chain rather than a switch so a `break`
        // in a case body still reaches an enclosing ual loop.
        let mut first = true;
        for case in cases {
            let cond = match &case.label {
                CaseLabel::Default => "true".to_string(),
                label => format!("env.status == {}", go_quote(&case_label_str(label))),
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
            self.w("\tualUnhandledStatus(env.status)");
        }
        self.w("}");
        self.w(format!(
            "env.status, env.statusVal = {}, {}",
            saved_s, saved_v
        ));
        self.indent -= 1;
        self.w("}");
        Ok(())
    }

    /// Case bindings: first the status value (for `error`, the top of the
    /// error stack when no value was attached), second the label itself.
    fn bind_consider_case(&mut self, case: &ConsiderCase, line: usize) {
        let is_error = matches!(&case.label, CaseLabel::Name(n) if n == "error")
            && !self.options.no_forth;
        if let Some(first) = case.bindings.first() {
            match self.symbols.declare_native(first, ElemType::Str) {
                Ok(sym) => {
                    let goname = Self::native_name(sym.index, first);
                    self.w(format!("{} := ualToStr(env.statusVal)", goname));
                    if is_error {
                        if let Some(err) = self.stack("error", line) {
                            self.w(format!(
                                "if env.statusVal == nil && {}.Len() > 0 {{",
                                err.rt_name
                            ));
                            self.w(format!(
                                "\t{} = {}.Pop().(string)",
                                goname, err.rt_name
                            ));
                            self.w("}");
                        }
                    }
                    self.w(format!("_ = {}", goname));
                }
                Err(e) => self.diag(line, e),
            }
        }
        if let Some(second) = case.bindings.get(1) {
            match self.symbols.declare_native(second, ElemType::Str) {
                Ok(sym) => {
                    let goname = Self::native_name(sym.index, second);
                    self.w(format!("{} := env.status", goname));
                    self.w(format!("_ = {}", goname));
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
        // The setup block runs first, as an ordinary stack block.
        if !setup.is_empty() {
            self.block_hosts.push(stack.to_string());
            self.w("{");
            self.indent += 1;
            self.stmt_block(setup)?;
            self.indent -= 1;
            self.w("}");
            self.block_hosts.pop();
        }

        // Stacks used as select targets must be shared.
        let mut shared = HashSet::new();
        for case in cases {
            if matches!(case.stack.as_str(), "dstack" | "rstack") {
                self.diag(case.line, "task-local stacks cannot be select targets");
            }
            shared.insert(case.stack.clone());
        }
        self.mark_shared(&shared);

        if let Some(default_body) = default {
            // Non-blocking form: scan in source order, else run default.
            for (i, case) in cases.iter().enumerate() {
                let Some(info) = self.stack(&case.stack, case.line) else {
                    continue;
                };
                let kw = if i == 0 { "if" } else { "} else if" };
                self.w(format!("{} {}.Len() > 0 {{", kw, info.rt_name));
                self.indent += 1;
                self.cond_depth += 1;
                self.symbols.push_scope();
                self.stacks.push_scope();
                self.views.push_scope();
                if let Some(b) = &case.binding {
                    let elem = info.elem;
                    let rt = info.rt_name.clone();
                    self.bind_native(b, elem, case.line, |_| {
                        format!("{}.Pop().({})", rt, go_type(elem))
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

        // Blocking form: one worker per case races into a buffered
        // channel; the first value wins and cancels the rest.
        let label = self.fresh("sel");
        let win = self.fresh("win");
        let ctx = self.fresh("ctx");
        let cancel = self.fresh("cancel");
        self.w(format!("{}:", label));
        self.w("for {");
        self.indent += 1;
        self.w(format!(
            "{}, {} := context.WithCancel(context.Background())",
            ctx, cancel
        ));
        self.w(format!(
            "{} := make(chan ualSelWin, {})",
            win,
            cases.len()
        ));
        for (i, case) in cases.iter().enumerate() {
            let Some(info) = self.stack(&case.stack, case.line) else {
                continue;
            };
            let timeout_ms = case.timeout.as_ref().map(|t| t.ms).unwrap_or(0);
            self.w("go func() {");
            self.indent += 1;
            self.w("for {");
            self.indent += 1;
            let v = self.fresh("v");
            let ok = self.fresh("ok");
            let to = self.fresh("to");
            self.w(format!(
                "{}, {}, {} := {}.TakeCtx({}, {})",
                v, ok, to, info.rt_name, ctx, timeout_ms
            ));
            self.w(format!("if {} {{", to));
            self.indent += 1;
            if let Some(timeout) = &case.timeout {
                // The timeout handler runs on this worker with a private
                // environment; retry and restart steer the loop.
                let act = self.fresh("act");
                self.w(format!("{} := 0", act));
                self.w("{");
                self.indent += 1;
                self.w("env := ualNewEnv()");
                self.w("_ = env");
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
                self.w("\tcontinue");
                self.w("}");
                self.w(format!("if {} == 2 {{", act));
                self.w(format!("\t{} <- ualSelWin{{idx: -1}}", win));
                self.w("\treturn");
                self.w("}");
            }
            self.w(format!("{} <- ualSelWin{{idx: -2}}", win));
            self.w("return");
            self.indent -= 1;
            self.w("}");
            self.w(format!("if !{} {{", ok));
            self.w(format!("\t{} <- ualSelWin{{idx: -2}}", win));
            self.w("\treturn");
            self.w("}");
            self.w(format!("{} <- ualSelWin{{idx: {}, val: {}}}", win, i, v));
            self.w("return");
            self.indent -= 1;
            self.w("}");
            self.indent -= 1;
            self.w("}()");
        }
        let res = self.fresh("res");
        self.w(format!(
            "{} := ualSelWait({}, {})",
            res,
            win,
            cases.len()
        ));
        self.w(format!("{}()", cancel));
        self.w(format!("if {}.idx == -1 {{", res));
        self.w(format!("\tcontinue {}", label));
        self.w("}");
        for (i, case) in cases.iter().enumerate() {
            let Some(info) = self.stack(&case.stack, case.line) else {
                continue;
            };
            let kw = if i == 0 { "if" } else { "} else if" };
            self.w(format!("{} {}.idx == {} {{", kw, res, i));
            self.indent += 1;
            self.cond_depth += 1;
            self.symbols.push_scope();
            self.stacks.push_scope();
            self.views.push_scope();
            if let Some(b) = &case.binding {
                let elem = info.elem;
                let res = res.clone();
                self.bind_native(b, elem, case.line, |_| {
                    format!("{}.val.({})", res, go_type(elem))
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
        self.w("}");
        self.w(format!("break {}", label));
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

        // Run the setup block normally, then hold the lock for the body.
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
            self.needs_unsafe = true;
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

        self.w(format!("{}.Lock()", info.rt_name));
        self.w("func() {");
        self.indent += 1;
        self.w(format!("defer {}.Unlock()", info.rt_name));

        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        let saved_loop = std::mem::take(&mut self.loop_depth);
        self.kernel = Some(KernelCtx {
            rt: info.rt_name.clone(),
            elem: info.elem,
            hash,
        });

        // Bindings pop in LIFO order: the first named binding takes the
        // top of the stack.
        for b in bindings {
            let elem = info.elem;
            let rt = info.rt_name.clone();
            self.bind_native(b, elem, line, |_| {
                format!("{}.popRaw().({})", rt, go_type(elem))
            });
        }
        let slice_helper = match info.elem {
            ElemType::F64 => "ualFloatSlice",
            _ => "ualIntSlice",
        };
        for prop in &props {
            self.w(format!(
                "uView_{} := {}({}.getBufRaw({}))",
                prop,
                slice_helper,
                info.rt_name,
                go_quote(prop)
            ));
            self.w(format!("_ = uView_{}", prop));
        }

        for s in body {
            self.stmt(s)?;
        }

        self.kernel = None;
        self.loop_depth = saved_loop;
        self.views.pop_scope();
        self.stacks.pop_scope();
        self.symbols.pop_scope();
        self.indent -= 1;
        self.w("}()");
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
        self.w("func() {");
        self.indent += 1;
        if let Some(f) = finally {
            // Deferred so it runs on every exit path, including a panic
            // raised from the catch body.
            self.w("defer func() {");
            self.indent += 1;
            self.stmt_block(f)?;
            self.indent -= 1;
            self.w("}()");
        }
        self.w(format!(
            "{} := func() (uR interface{{}}) {{",
            caught
        ));
        self.indent += 1;
        self.w("defer func() { uR = recover() }()");
        let saved_loop = std::mem::take(&mut self.loop_depth);
        self.try_depth += 1;
        self.cond_depth += 1;
        self.stmt_block(body)?;
        self.cond_depth -= 1;
        self.try_depth -= 1;
        self.loop_depth = saved_loop;
        self.w("return nil");
        self.indent -= 1;
        self.w("}()");
        self.w(format!("if {} != nil {{", caught));
        self.indent += 1;
        self.cond_depth += 1;
        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        if let Some(b) = binding {
            // The caught value binds as a string.
            match self.symbols.declare_native(b, ElemType::Str) {
                Ok(sym) => {
                    let goname = Self::native_name(sym.index, b);
                    self.w(format!("{} := ualPanicMsg({})", goname, caught));
                    self.w(format!("_ = {}", goname));
                }
                Err(e) => self.diag(line, e),
            }
        }
        self.catch_tmp.push(caught.clone());
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
        self.w("}()");
        Ok(())
    }

    fn spawn_push(
        &mut self,
        params: &[String],
        body: &[Stmt],
        line: usize,
    ) -> Result<(), CodeGenError> {
        // Parameters are popped from the data stack at push time (first
        // parameter takes the top) and baked into the closure by value.
        let mut shared = HashSet::new();
        collect_stack_refs(body, &mut shared);
        self.mark_shared(&shared);

        self.w("{");
        self.indent += 1;
        self.symbols.push_scope();
        self.stacks.push_scope();
        self.views.push_scope();
        for p in params {
            let Some(d) = self.stack("dstack", line) else {
                continue;
            };
            let rt = d.rt_name.clone();
            self.bind_native(p, ElemType::I64, line, |_| {
                format!("{}.Pop().(int64)", rt)
            });
        }
        self.w("ualSpawnQueue.Push(func() {");
        self.indent += 1;
        // The spawned task gets its own environment: task-local dstack,
        // rstack, and consider state. Loop control and the fallibility
        // of the registering function do not reach into the body.
        self.w("env := ualNewEnv()");
        self.w("_ = env");
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
        self.w("})");
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

        let mut params = vec!["env *ualEnv".to_string()];
        for (pname, pty) in &sig.params {
            match self.symbols.declare_native(pname, *pty) {
                Ok(sym) => params.push(format!(
                    "{} {}",
                    Self::native_name(sym.index, pname),
                    go_type(*pty)
                )),
                Err(e) => self.diag(f.line, e),
            }
        }
        let ret = match sig.ret {
            Some(t) => format!(" {}", go_type(t)),
            None => String::new(),
        };

        self.indent = 1;
        for s in &f.body {
            self.stmt(s)?;
        }
        // Go needs a terminating return when a value is declared.
        if let Some(t) = sig.ret {
            self.w(format!("return {}", go_zero(t)));
        }
        let body = std::mem::take(&mut self.out);

        writeln!(
            self.funcs_out,
            "func uF_{}({}){} {{",
            f.name,
            params.join(", "),
            ret
        )?;
        self.funcs_out.push_str("\t_ = env\n");
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

fn go_type(ty: ElemType) -> &'static str {
    match ty {
        ElemType::I64 => "int64",
        ElemType::F64 => "float64",
        ElemType::Str => "string",
        ElemType::Bool => "bool",
        ElemType::Bytes => "[]byte",
    }
}

fn go_zero(ty: ElemType) -> &'static str {
    match ty {
        ElemType::I64 => "0",
        ElemType::F64 => "0.0",
        ElemType::Str => "\"\"",
        ElemType::Bool => "false",
        // Typed empty slice: a nil interface would fail the read-side
        // type assertion.
        ElemType::Bytes => "[]byte{}",
    }
}

fn go_perspective(p: Perspective) -> &'static str {
    match p {
        Perspective::Lifo => "ualLIFO",
        Perspective::Fifo => "ualFIFO",
        Perspective::Indexed | Perspective::Maxfo | Perspective::Minfo => "ualIndexed",
        Perspective::Hash => "ualHash",
    }
}

fn go_binop(op: BinOp) -> &'static str {
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

fn go_fold(op: BinOp) -> char {
    match op {
        BinOp::Add => '+',
        BinOp::Sub => '-',
        BinOp::Mul => '*',
        _ => '/',
    }
}

fn go_convert(var: &str, from: ElemType, to: ElemType) -> String {
    use ElemType::*;
    match (from, to) {
        _ if from == to => var.to_string(),
        (I64, F64) => format!("float64({})", var),
        (F64, I64) => format!("int64({})", var),
        (I64, Str) => format!("fmt.Sprintf(\"%d\", {})", var),
        (F64, Str) => format!("fmt.Sprintf(\"%g\", {})", var),
        (Bool, I64) => format!("ualB2I({})", var),
        (I64, Bool) => format!("({} != 0)", var),
        (Bytes, Str) => format!("string({})", var),
        (Str, Bytes) => format!("[]byte({})", var),
        _ => var.to_string(),
    }
}

fn go_float(v: f64) -> String {
    let s = format!("{}", v);
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{}.0", s)
    }
}

fn go_quote(s: &str) -> String {
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

/// The auxiliary stack holding stack-resident variables of one type.
fn aux_stack_name(ty: ElemType) -> &'static str {
    match ty {
        ElemType::I64 => "ualVarsI64",
        ElemType::F64 => "ualVarsF64",
        ElemType::Str => "ualVarsStr",
        ElemType::Bool => "ualVarsBool",
        ElemType::Bytes => "ualVarsBytes",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::parser::Parser;

    fn gen(source: &str) -> GeneratedCode {
        let program = Parser::new(source).parse().expect("parse");
        GoBackend::new(CompileOptions {
            backend: Backend::Go,
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
        assert!(code.contains("var uS_i = ualNewStack(\"i\", ualLIFO, 0)"));
        assert!(code.contains("uS_i.Push(3)"));
        assert!(code.contains("ualDot(uS_i.Pop())"));
        assert!(code.contains("func uMain(env *ualEnv)"));
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
    fn test_pop_to_wrong_type_rejected() {
        let out = gen("@f = Stack.new(f64)\nvar v\n@f: push(1.0) pop:v");
        assert!(
            out.diagnostics.iter().any(|d| d.message.contains("pop target")),
            "got: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_bare_pop_on_non_i64_rejected() {
        let out = gen("@f = Stack.new(f64)\n@f: push(1.0) pop");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("only legal on i64")),
            "got: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_bring_conversion_table() {
        let code =
            gen_ok("@i = Stack.new(i64)\n@f = Stack.new(f64)\n@i: push(1)\n@f < @i");
        assert!(code.contains("float64("));
        let out = gen("@s = Stack.new(str)\n@i = Stack.new(i64)\n@s: push(\"x\")\n@i < @s");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("no boundary conversion")),
            "got: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_division_by_zero_yields_zero_helper() {
        let code = gen_ok("@i = Stack.new(i64)\n@i: push(4) push(0) div");
        assert!(code.contains("ualDivI("));
    }

    #[test]
    fn test_comparison_pushes_bool_stack() {
        let code = gen_ok("@i = Stack.new(i64)\n@i: push(1) push(2) lt\nif { dup }");
        assert!(code.contains("ualBool.Push("));
        assert!(code.contains("if ualBool.Pop().(bool) {"));
    }

    #[test]
    fn test_consider_lowering_saves_and_upgrades() {
        let code = gen_ok(
            "@s = Stack.new(i64)\n@s {\n push(1)\n}.consider( ok: print:\"ok\" error |e|: print:e )",
        );
        assert!(code.contains("env.status, env.statusVal = \"ok\", nil"));
        assert!(code.contains("if env.status == \"ok\" && ualError.Len() > 0 {"));
        assert!(code.contains("if env.status == \"ok\" {"));
        assert!(code.contains("ualUnhandledStatus(env.status)"));
        assert!(code.contains("ualError.Pop().(string)"));
    }

    #[test]
    fn test_defer_uses_go_defer() {
        let code = gen_ok("func f() {\n @defer < { print:\"a\" }\n print:\"c\"\n}\nf()");
        assert!(code.contains("defer func() {"));
        assert!(code.contains("func uF_f(env *ualEnv)"));
        assert!(code.contains("uF_f(env)"));
    }

    #[test]
    fn test_select_blocking_workers() {
        let code = gen_ok(
            "@c = Stack.new(i64)\n@c {}.select( @c { |v| print:v } timeout(200, {|| print:\"timeout\"}) )",
        );
        assert!(code.contains("context.WithCancel(context.Background())"));
        assert!(code.contains(".TakeCtx("));
        assert!(code.contains("ualSelWait("));
        assert!(code.contains("make(chan ualSelWin, 1)"));
    }

    #[test]
    fn test_select_nonblocking_with_default() {
        let code = gen_ok(
            "@c = Stack.new(i64)\n@c {}.select( @c { |v| print:v } _ : { print:\"empty\" } )",
        );
        assert!(code.contains("if uS_c.Len() > 0 {"));
        assert!(!code.contains("ualSelWait("));
    }

    #[test]
    fn test_spawn_lowering() {
        let code = gen_ok("@c = Stack.new(i64)\n@spawn < { @c < 42 }\n@spawn pop play\n@spawn len");
        assert!(code.contains("ualSpawnQueue.Push(func() {"));
        assert!(code.contains("env := ualNewEnv()"));
        assert!(code.contains("ualRunTask("));
        assert!(code.contains("env.dstack.Push(ualSpawnQueue.Len())"));
    }

    #[test]
    fn test_compute_kernel_hash_results() {
        let code = gen_ok(
            "@s = Stack.new(f64, Hash)\n@s: set(\"mass\", 2.0) set(\"accel\", 9.8)\n@s {}.compute({ || var force = self.mass * self.accel\nreturn force })",
        );
        assert!(code.contains("uS_s.Lock()"));
        assert!(code.contains("defer uS_s.Unlock()"));
        assert!(code.contains("uS_s.getRaw(\"mass\").(float64)"));
        assert!(code.contains("uS_s.setRaw(\"__result_0__\""));
    }

    #[test]
    fn test_compute_kernel_bindings_pop_lifo() {
        let code = gen_ok(
            "@s = Stack.new(f64)\n@s { push(1.0) push(2.0) }.compute({ |a, b| return a - b })",
        );
        let a_pos = code.find("uS_s.popRaw().(float64)").expect("first binding pop");
        let rest = &code[a_pos + 1..];
        assert!(rest.contains("uS_s.popRaw().(float64)"), "both bindings pop");
        assert!(code.contains("pushRaw("));
    }

    #[test]
    fn test_compute_slice_views() {
        let code = gen_ok(
            "@s = Stack.new(f64, Hash)\n@s {}.compute({ || self.xs[0] = self.xs[1] })",
        );
        assert!(code.contains("uView_xs := ualFloatSlice(uS_s.getBufRaw(\"xs\"))"));
        assert!(code.contains("uView_xs[0] = uView_xs[1]"));
        assert!(code.contains("\"unsafe\""));
    }

    #[test]
    fn test_hash_binding_rejected() {
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
    fn test_maxfo_rejected_at_declaration() {
        let out = gen("@p = Stack.new(i64, MAXFO, compare: weigh)");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("priority perspective")),
            "got: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_write_after_freeze_detected() {
        let out = gen("@s = Stack.new(i64)\n@s: freeze\n@s: push(1)");
        assert!(
            out.diagnostics.iter().any(|d| d.message.contains("frozen")),
            "got: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_freeze_in_branch_not_marked() {
        let out = gen("@s = Stack.new(i64)\nif true { @s: freeze }\n@s: push(1)");
        assert!(
            out.diagnostics.is_empty(),
            "freeze under a condition is not statically certain: {:?}",
            out.diagnostics
        );
    }

    #[test]
    fn test_error_push_requires_fallible_func() {
        let out = gen("func quiet() { @error < \"oops\" }");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("@error < func")),
            "got: {:?}",
            out.diagnostics
        );
        let ok = gen("@error < func loud() { @error < \"oops\" }");
        assert!(ok.diagnostics.is_empty(), "got: {:?}", ok.diagnostics);
    }

    #[test]
    fn test_no_forth_disables_implicit_stacks() {
        let program = Parser::new("@dstack: push(1)").parse().unwrap();
        let out = GoBackend::new(CompileOptions {
            backend: Backend::Go,
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
    }

    #[test]
    fn test_for_direction_by_perspective() {
        let lifo = gen_ok("@s = Stack.new(i64)\n@s for { |v| print(v) }");
        assert!(lifo.contains("- 1; "), "LIFO iterates top down");
        let fifo = gen_ok("@q = Stack.new(i64, FIFO)\n@q for { |v| print(v) }");
        assert!(fifo.contains(":= 0; "), "FIFO iterates bottom up");
    }

    #[test]
    fn test_optimize_uses_native_cells() {
        let program = Parser::new("var x = 7\nprint(x)").parse().unwrap();
        let out = GoBackend::new(CompileOptions {
            backend: Backend::Go,
            optimize: true,
            ..Default::default()
        })
        .generate(&program)
        .unwrap();
        assert!(out.code.contains("var uV_0_x int64 = 7"));
        assert!(!out.code.contains("ualVarsI64"));
    }

    #[test]
    fn test_default_uses_stack_resident_slots() {
        let code = gen_ok("var x = 7\nprint(x)");
        assert!(code.contains("ualVarsI64.PushAt(0, 7)"));
        assert!(code.contains("ualVarsI64.PeekAt(0).(int64)"));
    }

    #[test]
    fn test_try_catch_finally_shape() {
        let code = gen_ok(
            "try {\n panic \"boom\"\n} catch |e| {\n print:e\n} finally {\n print:\"done\"\n}",
        );
        assert!(code.contains("recover()"));
        assert!(code.contains("ualPanicMsg("));
        // finally is deferred so it runs on all exit paths
        let defer_pos = code.find("defer func() {").unwrap();
        let recover_pos = code.find("uR = recover()").unwrap();
        assert!(defer_pos < recover_pos);
    }

    #[test]
    fn test_view_ops_swap_perspective() {
        let code = gen_ok("@s = Stack.new(i64)\nview q = @s . fifo\nq: push(1)");
        assert!(code.contains(".Persp()"));
        assert!(code.contains("SetPerspective(ualFIFO)"));
    }

    #[test]
    fn test_retry_outside_timeout_rejected() {
        let out = gen("retry()");
        assert!(
            out.diagnostics
                .iter()
                .any(|d| d.message.contains("timeout handler")),
            "got: {:?}",
            out.diagnostics
        );
    }
}
