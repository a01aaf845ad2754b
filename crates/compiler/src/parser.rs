//! Recursive-descent parser for ual
//!
//! One token of lookahead, plus a saved-position probe for the one
//! genuinely ambiguous form: `ident : ...` is a view operation when a
//! stack-op keyword follows the colon and a one-argument call shorthand
//! otherwise.
//!
//! The grammar is context-sensitive in a shallow way: a `@name` statement
//! has six continuations keyed on the next token, and statements inside a
//! stack block apply their bare operations to the block's stack. Compute
//! kernels share this statement grammar; the infix expression ladder is
//! the same one used for conditions and call arguments.
//!
//! The first syntactic violation terminates parsing with an error carrying
//! the offending token's line, what was expected, and what was found.

use crate::ast::{
    AssignTarget, BinOp, CaseLabel, ConsiderCase, ElemType, Expr, FuncDecl, OpHost, Param,
    Perspective, Program, SelectCase, SelectTimeout, SpawnOpKind, StackExprOp, StackOp,
    StackOpKind, Stmt, UnOp,
};
use crate::lexer::{self, Keyword, Punct, Token, TokenKind};
use std::collections::VecDeque;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Statements synthesized while parsing one source statement (the
    /// anonymous-declaration sugar produces a declaration plus its
    /// trailing op chain).
    pending: VecDeque<Stmt>,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            tokens: lexer::tokenize(source),
            pos: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn parse(&mut self) -> Result<Program, String> {
        // A lexer error token halts everything up front.
        if let Some(bad) = self.tokens.iter().find(|t| t.kind == TokenKind::Error) {
            return Err(format!(
                "line {}: unexpected input '{}'",
                bad.line, bad.lexeme
            ));
        }

        let mut program = Program::new();
        self.skip_newlines();
        while !self.at_end() {
            let stmt = self.parse_statement()?;
            program.statements.push(stmt);
            while let Some(p) = self.pending.pop_front() {
                program.statements.push(p);
            }
            self.expect_terminator()?;
        }
        Ok(program)
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn line(&self) -> usize {
        self.current().line
    }

    fn check_punct(&self, p: Punct) -> bool {
        self.current().is_punct(p)
    }

    fn check_kw(&self, kw: Keyword) -> bool {
        self.current().is_keyword(kw)
    }

    fn check_ident(&self, name: &str) -> bool {
        self.current().kind == TokenKind::Ident && self.current().lexeme == name
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.check_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: Punct, expected: &str) -> Result<(), String> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(expected))
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<String, String> {
        if self.current().kind == TokenKind::Ident {
            Ok(self.advance().lexeme)
        } else {
            Err(self.error(expected))
        }
    }

    fn error(&self, expected: &str) -> String {
        let tok = self.current();
        let found = match tok.kind {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::StackRef => format!("'@{}'", tok.lexeme),
            _ => format!("'{}'", tok.lexeme),
        };
        format!("line {}: expected {}, found {}", tok.line, expected, found)
    }

    fn skip_newlines(&mut self) {
        while self.current().kind == TokenKind::Newline {
            self.advance();
        }
    }

    /// Require a statement boundary: newline(s), end of input, a closing
    /// delimiter the caller owns, or a token that can only begin a new
    /// statement (single-line blocks separate statements with spaces).
    fn expect_terminator(&mut self) -> Result<(), String> {
        match self.current().kind {
            TokenKind::Newline => {
                self.skip_newlines();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            TokenKind::Punct(Punct::RBrace) | TokenKind::Punct(Punct::RParen) => Ok(()),
            TokenKind::StackRef | TokenKind::Ident => Ok(()),
            TokenKind::Keyword(kw) if starts_statement(kw) => Ok(()),
            _ => Err(self.error("end of statement")),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Stmt, String> {
        let tok = self.current().clone();
        match tok.kind {
            TokenKind::StackRef => {
                self.advance();
                self.parse_stack_statement(&tok.lexeme, tok.line)
            }
            TokenKind::Ident => self.parse_ident_statement(),
            TokenKind::Keyword(kw) => self.parse_keyword_statement(kw),
            _ => Err(self.error("a statement")),
        }
    }

    fn parse_keyword_statement(&mut self, kw: Keyword) -> Result<Stmt, String> {
        let line = self.line();
        match kw {
            Keyword::Var => self.parse_var_decl(),
            Keyword::Let => {
                self.advance();
                let name = self.expect_ident("a variable name after 'let'")?;
                Ok(Stmt::LetPop { name, line })
            }
            Keyword::View => self.parse_view_decl(),
            Keyword::Func => self.parse_func_decl(false),
            Keyword::If => self.parse_if(),
            Keyword::While => self.parse_while(),
            Keyword::For => {
                // `for @s { ... }`: alternate spelling of the stack-for.
                self.advance();
                if self.current().kind != TokenKind::StackRef {
                    return Err(self.error("a stack reference after 'for'"));
                }
                let stack = self.advance().lexeme;
                self.parse_for_body(stack, None, line)
            }
            Keyword::Break => {
                self.advance();
                Ok(Stmt::Break { line })
            }
            Keyword::Continue => {
                self.advance();
                Ok(Stmt::Continue { line })
            }
            Keyword::Return => self.parse_return(),
            Keyword::Defer => {
                // `defer { body }`: same meaning as `@defer < { body }`.
                self.advance();
                let body = self.parse_block()?;
                Ok(Stmt::DeferBlock { body, line })
            }
            Keyword::Try => self.parse_try(),
            Keyword::Panic => {
                self.advance();
                let value = if self.statement_ended() {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Ok(Stmt::Panic { value, line })
            }
            Keyword::Status => self.parse_status_set(),
            Keyword::Retry => {
                self.advance();
                self.eat_empty_parens();
                Ok(Stmt::Retry { line })
            }
            Keyword::Restart => {
                self.advance();
                self.eat_empty_parens();
                Ok(Stmt::Restart { line })
            }
            kw if kw.is_stack_op() => {
                // Bare stack op: applies to the enclosing block's stack,
                // or the data stack at top level.
                let ops = self.parse_op_chain()?;
                Ok(Stmt::StackOpStmt {
                    host: OpHost::Implicit,
                    ops,
                    line,
                })
            }
            _ => Err(self.error("a statement")),
        }
    }

    fn statement_ended(&self) -> bool {
        matches!(
            self.current().kind,
            TokenKind::Newline | TokenKind::Eof | TokenKind::Punct(Punct::RBrace)
        )
    }

    fn eat_empty_parens(&mut self) {
        if self.check_punct(Punct::LParen) && self.peek_at(1).is_punct(Punct::RParen) {
            self.advance();
            self.advance();
        }
    }

    /// `var a, b : T = e1, e2` or the kernel-local `var buf[SIZE]`.
    fn parse_var_decl(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // var
        let first = self.expect_ident("a variable name after 'var'")?;

        if self.eat_punct(Punct::LBracket) {
            let size_tok = self.advance();
            if size_tok.kind != TokenKind::Int {
                return Err(format!(
                    "line {}: expected an integer array size, found '{}'",
                    size_tok.line, size_tok.lexeme
                ));
            }
            let size: u64 = size_tok
                .lexeme
                .parse()
                .map_err(|_| format!("line {}: array size out of range", size_tok.line))?;
            self.expect_punct(Punct::RBracket, "']' after array size")?;
            return Ok(Stmt::VarArrayDecl {
                name: first,
                size,
                line,
            });
        }

        let mut names = vec![first];
        while self.eat_punct(Punct::Comma) {
            names.push(self.expect_ident("a variable name")?);
        }
        let ty = if self.eat_punct(Punct::Colon) {
            Some(self.parse_elem_type()?)
        } else {
            None
        };
        let mut inits = Vec::new();
        if self.eat_punct(Punct::Assign) {
            inits.push(self.parse_expr()?);
            while self.eat_punct(Punct::Comma) {
                inits.push(self.parse_expr()?);
            }
        }
        if !inits.is_empty() && inits.len() != names.len() {
            return Err(format!(
                "line {}: {} names declared but {} initializers given",
                line,
                names.len(),
                inits.len()
            ));
        }
        Ok(Stmt::VarDecl {
            names,
            ty,
            inits,
            line,
        })
    }

    fn parse_elem_type(&mut self) -> Result<ElemType, String> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Keyword(Keyword::I64) => Ok(ElemType::I64),
            TokenKind::Keyword(Keyword::F64) => Ok(ElemType::F64),
            TokenKind::Keyword(Keyword::Str) => Ok(ElemType::Str),
            TokenKind::Keyword(Keyword::Bool) => Ok(ElemType::Bool),
            TokenKind::Keyword(Keyword::Bytes) => Ok(ElemType::Bytes),
            _ => Err(format!(
                "line {}: expected an element type, found '{}'",
                tok.line, tok.lexeme
            )),
        }
    }

    fn parse_perspective_kw(&mut self) -> Result<Perspective, String> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Keyword(Keyword::Lifo) => Ok(Perspective::Lifo),
            TokenKind::Keyword(Keyword::Fifo) => Ok(Perspective::Fifo),
            TokenKind::Keyword(Keyword::Indexed) => Ok(Perspective::Indexed),
            TokenKind::Keyword(Keyword::Hash) => Ok(Perspective::Hash),
            TokenKind::Keyword(Keyword::Maxfo) => Ok(Perspective::Maxfo),
            TokenKind::Keyword(Keyword::Minfo) => Ok(Perspective::Minfo),
            // Lowercase spellings appear in the `@s . fifo` override form.
            TokenKind::Ident => match tok.lexeme.as_str() {
                "lifo" => Ok(Perspective::Lifo),
                "fifo" => Ok(Perspective::Fifo),
                "indexed" => Ok(Perspective::Indexed),
                "hash" => Ok(Perspective::Hash),
                _ => Err(format!(
                    "line {}: expected a perspective, found '{}'",
                    tok.line, tok.lexeme
                )),
            },
            _ => Err(format!(
                "line {}: expected a perspective, found '{}'",
                tok.line, tok.lexeme
            )),
        }
    }

    /// `view v = @s . fifo`
    fn parse_view_decl(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // view
        let name = self.expect_ident("a view name after 'view'")?;
        self.expect_punct(Punct::Assign, "'=' in view declaration")?;
        if self.current().kind != TokenKind::StackRef {
            return Err(self.error("a stack reference"));
        }
        let stack = self.advance().lexeme;
        self.expect_punct(Punct::Dot, "'.' before the view's perspective")?;
        let perspective = self.parse_perspective_kw()?;
        Ok(Stmt::ViewDecl {
            name,
            stack,
            perspective,
            line,
        })
    }

    fn parse_func_decl(&mut self, can_fail: bool) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // func
        let name = self.expect_ident("a function name after 'func'")?;
        self.expect_punct(Punct::LParen, "'(' after function name")?;
        let mut params = Vec::new();
        if !self.check_punct(Punct::RParen) {
            loop {
                let pname = self.expect_ident("a parameter name")?;
                let ty = if self.eat_punct(Punct::Colon) {
                    Some(self.parse_elem_type()?)
                } else {
                    None
                };
                params.push(Param { name: pname, ty });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen, "')' after parameters")?;
        let ret = if self.eat_punct(Punct::Colon) {
            Some(self.parse_elem_type()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(Stmt::FuncDecl(FuncDecl {
            name,
            params,
            ret,
            can_fail,
            body,
            line,
        }))
    }

    fn parse_return(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // return
        let mut values = Vec::new();
        if !self.statement_ended() {
            values.push(self.parse_expr()?);
            while self.eat_punct(Punct::Comma) {
                values.push(self.parse_expr()?);
            }
        }
        Ok(Stmt::Return { values, line })
    }

    fn parse_if(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // if
        let mut arms = Vec::new();
        let cond = if self.check_punct(Punct::LBrace) {
            None // condition comes from the bool stack
        } else {
            Some(self.parse_expr()?)
        };
        arms.push((cond, self.parse_block()?));

        let mut else_body = None;
        while self.eat_kw(Keyword::Else) {
            if self.eat_kw(Keyword::If) {
                let cond = if self.check_punct(Punct::LBrace) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                arms.push((cond, self.parse_block()?));
            } else {
                else_body = Some(self.parse_block()?);
                break;
            }
        }
        Ok(Stmt::If {
            arms,
            else_body,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // while
        let cond = if self.check_punct(Punct::LBrace) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body, line })
    }

    fn parse_try(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // try
        let body = self.parse_block()?;
        self.skip_newlines();
        if !self.eat_kw(Keyword::Catch) {
            return Err(self.error("'catch' after try block"));
        }
        let binding = if self.eat_punct(Punct::Pipe) {
            let name = self.expect_ident("an error binding name")?;
            self.expect_punct(Punct::Pipe, "'|' after error binding")?;
            Some(name)
        } else {
            None
        };
        let catch = self.parse_block()?;
        self.skip_newlines();
        let finally = if self.eat_kw(Keyword::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(Stmt::Try {
            body,
            binding,
            catch,
            finally,
            line,
        })
    }

    /// `status:label` / `status:label(value)`
    fn parse_status_set(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        self.advance(); // status
        self.expect_punct(Punct::Colon, "':' after 'status'")?;
        let label = self.parse_case_label()?;
        let value = if self.eat_punct(Punct::LParen) {
            let v = self.parse_expr()?;
            self.expect_punct(Punct::RParen, "')' after status value")?;
            Some(v)
        } else {
            None
        };
        Ok(Stmt::StatusSet { label, value, line })
    }

    fn parse_case_label(&mut self) -> Result<CaseLabel, String> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Ident if tok.lexeme == "_" => Ok(CaseLabel::Default),
            TokenKind::Ident => Ok(CaseLabel::Name(tok.lexeme)),
            TokenKind::Int => tok
                .lexeme
                .parse::<i64>()
                .map(CaseLabel::Int)
                .map_err(|_| format!("line {}: integer label out of range", tok.line)),
            _ => Err(format!(
                "line {}: expected a status label, found '{}'",
                tok.line, tok.lexeme
            )),
        }
    }

    // ------------------------------------------------------------------
    // Identifier-led statements (assignment, call, view op)
    // ------------------------------------------------------------------

    fn parse_ident_statement(&mut self) -> Result<Stmt, String> {
        let line = self.line();
        let name = self.advance().lexeme;

        // `self.prop[i] = e`: the container write inside kernels.
        if name == "self" && self.check_punct(Punct::Dot) {
            self.advance();
            let prop = self.expect_ident("a property name after 'self.'")?;
            if !self.eat_punct(Punct::LBracket) {
                return Err(format!(
                    "line {}: container writes must index an element: self.{}[i] = ...",
                    line, prop
                ));
            }
            let index = self.parse_expr()?;
            self.expect_punct(Punct::RBracket, "']' after index")?;
            self.expect_punct(Punct::Assign, "'=' in container write")?;
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign {
                target: AssignTarget::SelfMemberIndex { prop, index },
                value,
                line,
            });
        }

        if self.eat_punct(Punct::Assign) {
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign {
                target: AssignTarget::Name(name),
                value,
                line,
            });
        }

        if self.eat_punct(Punct::LBracket) {
            let index = self.parse_expr()?;
            self.expect_punct(Punct::RBracket, "']' after index")?;
            self.expect_punct(Punct::Assign, "'=' after indexed target")?;
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign {
                target: AssignTarget::Index { name, index },
                value,
                line,
            });
        }

        if self.check_punct(Punct::Colon) {
            // Ambiguous: view op (`v: push(1)`) vs call shorthand
            // (`print:"ok"`). Probe past the colon and back off if what
            // follows is not an operation keyword.
            let saved = self.pos;
            self.advance(); // ':'
            if matches!(self.current().kind, TokenKind::Keyword(kw) if kw.is_stack_op()) {
                let ops = self.parse_ops_until_terminator()?;
                return Ok(Stmt::StackOpStmt {
                    host: OpHost::View(name),
                    ops,
                    line,
                });
            }
            self.pos = saved;
            self.advance(); // ':'
            let arg = self.parse_expr()?;
            return Ok(Stmt::ExprStmt {
                expr: Expr::Call {
                    name,
                    args: vec![arg],
                },
                line,
            });
        }

        if self.check_punct(Punct::LParen) {
            let args = self.parse_call_args()?;
            return Ok(Stmt::ExprStmt {
                expr: Expr::Call { name, args },
                line,
            });
        }

        Err(format!(
            "line {}: expected '=', ':' or '(' after '{}'",
            line, name
        ))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, String> {
        self.expect_punct(Punct::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.check_punct(Punct::RParen) {
            args.push(self.parse_expr()?);
            while self.eat_punct(Punct::Comma) {
                args.push(self.parse_expr()?);
            }
        }
        self.expect_punct(Punct::RParen, "')' after arguments")?;
        Ok(args)
    }

    // ------------------------------------------------------------------
    // Stack statements: the six @name continuations
    // ------------------------------------------------------------------

    fn parse_stack_statement(&mut self, name: &str, line: usize) -> Result<Stmt, String> {
        // @Stack.new(...): anonymous declaration named via alias.
        if name == "Stack" && self.check_punct(Punct::Dot) {
            return self.parse_anonymous_stack_decl(line);
        }

        // @error < ... and @defer < ... and @spawn < ... specials.
        if self.check_punct(Punct::Lt) {
            return self.parse_stack_push(name, line);
        }

        // @spawn pop play / peek play / len / clear
        if name == "spawn" {
            return self.parse_spawn_op(line);
        }

        // @name = Stack.new(...)
        if self.check_punct(Punct::Assign) {
            self.advance();
            if !self.check_kw(Keyword::Stack) {
                return Err(self.error("'Stack.new(...)' after '='"));
            }
            self.advance();
            self.expect_punct(Punct::Dot, "'.' in 'Stack.new'")?;
            let ctor = self.expect_ident("'new'")?;
            if ctor != "new" {
                return Err(format!(
                    "line {}: expected 'Stack.new', found 'Stack.{}'",
                    line, ctor
                ));
            }
            return self.parse_stack_decl_args(name.to_string(), line);
        }

        // @name { ... } possibly followed by .consider/.select/.compute
        if self.check_punct(Punct::LBrace) {
            return self.parse_stack_block(name, line);
        }

        // @name.persp for { ... }: perspective override, or the
        // lowercase `@s . fifo` prefix form.
        if self.check_punct(Punct::Dot) {
            self.advance();
            let perspective = self.parse_perspective_kw()?;
            self.skip_newlines();
            if !self.eat_kw(Keyword::For) {
                return Err(self.error("'for' after perspective override"));
            }
            return self.parse_for_body(name.to_string(), Some(perspective), line);
        }

        // @name for { ... }
        if self.eat_kw(Keyword::For) {
            return self.parse_for_body(name.to_string(), None, line);
        }

        // @name [:] op op op
        let ops = self.parse_op_chain()?;
        if ops.is_empty() {
            return Err(self.error("a stack operation"));
        }
        Ok(Stmt::StackOpStmt {
            host: OpHost::Stack(name.to_string()),
            ops,
            line,
        })
    }

    /// `@Stack.new(T, ...): alias:"name" [more ops]`
    fn parse_anonymous_stack_decl(&mut self, line: usize) -> Result<Stmt, String> {
        self.advance(); // '.'
        let ctor = self.expect_ident("'new' after 'Stack.'")?;
        if ctor != "new" {
            return Err(format!(
                "line {}: expected 'Stack.new', found 'Stack.{}'",
                line, ctor
            ));
        }
        // Parse declaration with a placeholder name, then require alias.
        let decl = self.parse_stack_decl_args(String::new(), line)?;
        self.expect_punct(Punct::Colon, "':' before 'alias'")?;
        if !self.eat_kw(Keyword::Alias) {
            return Err(self.error("'alias' naming the anonymous stack"));
        }
        self.expect_punct(Punct::Colon, "':' after 'alias'")?;
        let alias_tok = self.advance();
        if alias_tok.kind != TokenKind::Str {
            return Err(format!(
                "line {}: expected a string stack name after 'alias:', found '{}'",
                alias_tok.line, alias_tok.lexeme
            ));
        }
        let stack_name = lexer::string_value(&alias_tok.lexeme);

        // Remaining ops on the line apply to the newly named stack.
        if matches!(self.current().kind, TokenKind::Keyword(kw) if kw.is_stack_op()) {
            let ops = self.parse_ops_until_terminator()?;
            self.pending.push_back(Stmt::StackOpStmt {
                host: OpHost::Stack(stack_name.clone()),
                ops,
                line,
            });
        }

        match decl {
            Stmt::StackDecl {
                elem,
                perspective,
                capacity,
                compare,
                ..
            } => Ok(Stmt::StackDecl {
                name: stack_name,
                elem,
                perspective,
                capacity,
                compare,
                line,
            }),
            _ => unreachable!("parse_stack_decl_args returns a StackDecl"),
        }
    }

    /// The argument list of `Stack.new(T [, cap:N] [, P] [, compare:fn])`.
    fn parse_stack_decl_args(&mut self, name: String, line: usize) -> Result<Stmt, String> {
        self.expect_punct(Punct::LParen, "'(' after 'Stack.new'")?;
        let elem = self.parse_elem_type()?;
        let mut perspective = Perspective::Lifo;
        let mut capacity = None;
        let mut compare = None;
        while self.eat_punct(Punct::Comma) {
            if self.check_ident("cap") {
                self.advance();
                self.expect_punct(Punct::Colon, "':' after 'cap'")?;
                let tok = self.advance();
                if tok.kind != TokenKind::Int {
                    return Err(format!(
                        "line {}: expected an integer capacity, found '{}'",
                        tok.line, tok.lexeme
                    ));
                }
                capacity = Some(
                    tok.lexeme
                        .parse::<u64>()
                        .map_err(|_| format!("line {}: capacity out of range", tok.line))?,
                );
            } else if self.check_ident("compare") {
                self.advance();
                self.expect_punct(Punct::Colon, "':' after 'compare'")?;
                compare = Some(self.expect_ident("a comparison function name")?);
            } else {
                perspective = self.parse_perspective_kw()?;
            }
        }
        self.expect_punct(Punct::RParen, "')' after stack declaration")?;
        Ok(Stmt::StackDecl {
            name,
            elem,
            perspective,
            capacity,
            compare,
            line,
        })
    }

    /// `@name < ...`: push sugar plus the `@error` / `@defer` / `@spawn`
    /// special forms.
    fn parse_stack_push(&mut self, name: &str, line: usize) -> Result<Stmt, String> {
        self.advance(); // '<'
        match name {
            "defer" => {
                let body = self.parse_block()?;
                Ok(Stmt::DeferBlock { body, line })
            }
            "spawn" => {
                let (params, body) = self.parse_codeblock()?;
                Ok(Stmt::SpawnPush { params, body, line })
            }
            "error" if self.check_kw(Keyword::Func) => {
                // `@error < func name(...) { ... }`: fallible function.
                self.parse_func_decl(true)
            }
            "error" => {
                let value = self.parse_expr()?;
                Ok(Stmt::ErrorPush { value, line })
            }
            _ => {
                if self.current().kind == TokenKind::StackRef {
                    // `@dst < @src`: boundary transfer sugar for bring.
                    let src = self.advance().lexeme;
                    return Ok(Stmt::StackOpStmt {
                        host: OpHost::Stack(name.to_string()),
                        ops: vec![StackOp {
                            kind: StackOpKind::Bring,
                            args: vec![Expr::StackRef(src)],
                            target: None,
                            line,
                        }],
                        line,
                    });
                }
                let value = self.parse_expr()?;
                Ok(Stmt::StackOpStmt {
                    host: OpHost::Stack(name.to_string()),
                    ops: vec![StackOp {
                        kind: StackOpKind::Push,
                        args: vec![value],
                        target: None,
                        line,
                    }],
                    line,
                })
            }
        }
    }

    fn parse_spawn_op(&mut self, line: usize) -> Result<Stmt, String> {
        let tok = self.advance();
        let op = match tok.kind {
            TokenKind::Keyword(Keyword::Pop) => SpawnOpKind::Pop,
            TokenKind::Keyword(Keyword::Peek) => SpawnOpKind::Peek,
            TokenKind::Keyword(Keyword::Len) => SpawnOpKind::Len,
            TokenKind::Keyword(Keyword::Clear) => SpawnOpKind::Clear,
            _ => {
                return Err(format!(
                    "line {}: expected 'pop', 'peek', 'len' or 'clear' on @spawn, found '{}'",
                    tok.line, tok.lexeme
                ));
            }
        };
        let play = self.eat_kw(Keyword::Play);
        if play && !matches!(op, SpawnOpKind::Pop | SpawnOpKind::Peek) {
            return Err(format!(
                "line {}: 'play' only follows '@spawn pop' or '@spawn peek'",
                line
            ));
        }
        Ok(Stmt::SpawnOp { op, play, line })
    }

    fn parse_for_body(
        &mut self,
        stack: String,
        perspective: Option<Perspective>,
        line: usize,
    ) -> Result<Stmt, String> {
        let (bindings, body) = self.parse_codeblock()?;
        if bindings.len() > 2 {
            return Err(format!(
                "line {}: a for-loop takes at most two bindings (index, value)",
                line
            ));
        }
        Ok(Stmt::ForStack {
            stack,
            perspective,
            bindings,
            body,
            line,
        })
    }

    /// `@name { ... }` and its attached `.consider` / `.select` /
    /// `.compute` continuations.
    fn parse_stack_block(&mut self, name: &str, line: usize) -> Result<Stmt, String> {
        let body = self.parse_block()?;
        if !self.check_punct(Punct::Dot) {
            return Ok(Stmt::StackBlock {
                stack: name.to_string(),
                body,
                line,
            });
        }
        self.advance(); // '.'
        if self.eat_kw(Keyword::Consider) {
            let cases = self.parse_consider_cases()?;
            return Ok(Stmt::Consider {
                stack: name.to_string(),
                setup: body,
                cases,
                line,
            });
        }
        if self.eat_kw(Keyword::Select) {
            return self.parse_select(name, body, line);
        }
        if self.eat_kw(Keyword::Compute) {
            self.expect_punct(Punct::LParen, "'(' after 'compute'")?;
            let (bindings, kernel) = self.parse_codeblock()?;
            self.expect_punct(Punct::RParen, "')' after compute block")?;
            return Ok(Stmt::Compute {
                stack: name.to_string(),
                setup: body,
                bindings,
                body: kernel,
                line,
            });
        }
        Err(self.error("'consider', 'select' or 'compute' after stack block"))
    }

    fn parse_consider_cases(&mut self) -> Result<Vec<ConsiderCase>, String> {
        self.expect_punct(Punct::LParen, "'(' after 'consider'")?;
        let mut cases = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat_punct(Punct::RParen) {
                break;
            }
            if self.at_end() {
                return Err(self.error("')' closing the consider cases"));
            }
            let line = self.line();
            let label = self.parse_case_label()?;
            let bindings = self.parse_optional_bindings()?;
            self.expect_punct(Punct::Colon, "':' after case label")?;
            let body = if self.check_punct(Punct::LBrace) {
                self.parse_block()?
            } else {
                vec![self.parse_statement()?]
            };
            cases.push(ConsiderCase {
                label,
                bindings,
                body,
                line,
            });
        }
        if cases.is_empty() {
            return Err(format!(
                "line {}: a consider block needs at least one case",
                self.line()
            ));
        }
        Ok(cases)
    }

    /// `|a, b|`: at most two names. Absent bindings yield an empty list.
    fn parse_optional_bindings(&mut self) -> Result<Vec<String>, String> {
        if !self.eat_punct(Punct::Pipe) {
            return Ok(Vec::new());
        }
        let mut bindings = vec![self.expect_ident("a binding name")?];
        while self.eat_punct(Punct::Comma) {
            bindings.push(self.expect_ident("a binding name")?);
        }
        self.expect_punct(Punct::Pipe, "'|' closing the bindings")?;
        if bindings.len() > 2 {
            return Err(format!(
                "line {}: at most two bindings are allowed",
                self.line()
            ));
        }
        Ok(bindings)
    }

    fn parse_select(
        &mut self,
        stack: &str,
        setup: Vec<Stmt>,
        line: usize,
    ) -> Result<Stmt, String> {
        self.expect_punct(Punct::LParen, "'(' after 'select'")?;
        let mut cases = Vec::new();
        let mut default = None;
        loop {
            self.skip_newlines();
            if self.eat_punct(Punct::RParen) {
                break;
            }
            if self.at_end() {
                return Err(self.error("')' closing the select cases"));
            }
            if self.check_ident("_") {
                self.advance();
                self.expect_punct(Punct::Colon, "':' after the default case")?;
                if default.is_some() {
                    return Err(format!("line {}: duplicate default case", self.line()));
                }
                default = Some(self.parse_block()?);
                continue;
            }
            if self.current().kind != TokenKind::StackRef {
                return Err(self.error("a stack reference or '_' select case"));
            }
            let case_line = self.line();
            let case_stack = self.advance().lexeme;
            self.expect_punct(Punct::LBrace, "'{' opening the case handler")?;
            let binding = {
                let bindings = self.parse_optional_bindings()?;
                if bindings.len() > 1 {
                    return Err(format!(
                        "line {}: a select case binds at most one value",
                        case_line
                    ));
                }
                bindings.into_iter().next()
            };
            let body = self.parse_stmts_until_rbrace()?;
            let timeout = if self.eat_kw(Keyword::Timeout) {
                self.expect_punct(Punct::LParen, "'(' after 'timeout'")?;
                let ms_tok = self.advance();
                if ms_tok.kind != TokenKind::Int {
                    return Err(format!(
                        "line {}: expected a timeout in milliseconds, found '{}'",
                        ms_tok.line, ms_tok.lexeme
                    ));
                }
                let ms: u64 = ms_tok
                    .lexeme
                    .parse()
                    .map_err(|_| format!("line {}: timeout out of range", ms_tok.line))?;
                self.expect_punct(Punct::Comma, "',' after timeout interval")?;
                let (params, handler) = self.parse_codeblock()?;
                if !params.is_empty() {
                    return Err(format!(
                        "line {}: a timeout handler takes no bindings",
                        ms_tok.line
                    ));
                }
                self.expect_punct(Punct::RParen, "')' after timeout handler")?;
                Some(SelectTimeout { ms, body: handler })
            } else {
                None
            };
            cases.push(SelectCase {
                stack: case_stack,
                binding,
                body,
                timeout,
                line: case_line,
            });
        }
        if cases.is_empty() && default.is_none() {
            return Err(format!(
                "line {}: a select needs at least one case",
                self.line()
            ));
        }
        Ok(Stmt::Select {
            stack: stack.to_string(),
            setup,
            cases,
            default,
            line,
        })
    }

    // ------------------------------------------------------------------
    // Blocks and codeblocks
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Vec<Stmt>, String> {
        self.expect_punct(Punct::LBrace, "'{'")?;
        self.parse_stmts_until_rbrace()
    }

    fn parse_stmts_until_rbrace(&mut self) -> Result<Vec<Stmt>, String> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat_punct(Punct::RBrace) {
                return Ok(stmts);
            }
            if self.at_end() {
                return Err(self.error("'}'"));
            }
            stmts.push(self.parse_statement()?);
            while let Some(p) = self.pending.pop_front() {
                stmts.push(p);
            }
            self.expect_terminator()?;
        }
    }

    /// `{ [|p1, p2| | ||] statements }`: parameters then body.
    fn parse_codeblock(&mut self) -> Result<(Vec<String>, Vec<Stmt>), String> {
        self.expect_punct(Punct::LBrace, "'{' opening a code block")?;
        self.skip_newlines();
        let params = if self.eat_punct(Punct::OrOr) {
            Vec::new() // explicit empty-parameter marker
        } else if self.check_punct(Punct::Pipe) {
            self.advance();
            let mut names = vec![self.expect_ident("a parameter name")?];
            while self.eat_punct(Punct::Comma) {
                names.push(self.expect_ident("a parameter name")?);
            }
            self.expect_punct(Punct::Pipe, "'|' closing the parameters")?;
            names
        } else {
            Vec::new()
        };
        let body = self.parse_stmts_until_rbrace()?;
        Ok((params, body))
    }

    // ------------------------------------------------------------------
    // Operation chains
    // ------------------------------------------------------------------

    /// Ops for `@name [:] op op ...` (the optional leading colon).
    fn parse_op_chain(&mut self) -> Result<Vec<StackOp>, String> {
        self.eat_punct(Punct::Colon);
        self.parse_ops_until_terminator()
    }

    fn parse_ops_until_terminator(&mut self) -> Result<Vec<StackOp>, String> {
        let mut ops = Vec::new();
        loop {
            match self.current().kind {
                TokenKind::Keyword(kw) if kw.is_stack_op() => {
                    ops.push(self.parse_one_op(kw)?);
                }
                _ => break,
            }
        }
        if ops.is_empty() {
            return Err(self.error("a stack operation"));
        }
        Ok(ops)
    }

    fn parse_one_op(&mut self, kw: Keyword) -> Result<StackOp, String> {
        let line = self.line();
        self.advance(); // the op keyword
        let kind = op_kind(kw);
        let mut args = Vec::new();
        let mut target = None;

        if self.check_punct(Punct::LParen) {
            if kind == StackOpKind::Reduce {
                // reduce(add): a named fold operation.
                self.advance();
                let tok = self.advance();
                let fold = match tok.kind {
                    TokenKind::Keyword(Keyword::Add) => BinOp::Add,
                    TokenKind::Keyword(Keyword::Sub) => BinOp::Sub,
                    TokenKind::Keyword(Keyword::Mul) => BinOp::Mul,
                    TokenKind::Keyword(Keyword::Div) => BinOp::Div,
                    _ => {
                        return Err(format!(
                            "line {}: reduce takes an arithmetic op (add/sub/mul/div), found '{}'",
                            tok.line, tok.lexeme
                        ));
                    }
                };
                self.expect_punct(Punct::RParen, "')' after reduce op")?;
                // Encode the fold op as a perspective-free marker arg.
                args.push(Expr::Binary {
                    op: fold,
                    lhs: Box::new(Expr::Int(0)),
                    rhs: Box::new(Expr::Int(0)),
                });
            } else {
                args = self.parse_call_args()?;
            }
        }

        if self.check_punct(Punct::Colon) {
            match kind {
                StackOpKind::Pop | StackOpKind::Take | StackOpKind::Let => {
                    self.advance();
                    target = Some(self.expect_ident("a target variable name")?);
                }
                StackOpKind::Alias => {
                    self.advance();
                    let tok = self.advance();
                    if tok.kind != TokenKind::Str {
                        return Err(format!(
                            "line {}: expected a string after 'alias:', found '{}'",
                            tok.line, tok.lexeme
                        ));
                    }
                    args.push(Expr::Str(lexer::string_value(&tok.lexeme)));
                }
                _ if args.is_empty() => {
                    // `push:3` style single-argument shorthand.
                    self.advance();
                    args.push(self.parse_unary()?);
                }
                _ => {}
            }
        }

        Ok(StackOp {
            kind,
            args,
            target,
            line,
        })
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.eat_punct(Punct::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        while self.eat_punct(Punct::AndAnd) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Punct(Punct::EqEq) => BinOp::Eq,
                TokenKind::Punct(Punct::NotEq) => BinOp::Ne,
                TokenKind::Punct(Punct::Lt) => BinOp::Lt,
                TokenKind::Punct(Punct::Gt) => BinOp::Gt,
                TokenKind::Punct(Punct::LtEq) => BinOp::Le,
                TokenKind::Punct(Punct::GtEq) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Punct(Punct::Plus) => BinOp::Add,
                TokenKind::Punct(Punct::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Punct(Punct::Star) => BinOp::Mul,
                TokenKind::Punct(Punct::Slash) => BinOp::Div,
                TokenKind::Punct(Punct::Percent) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat_punct(Punct::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat_punct(Punct::Bang) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let tok = self.current().clone();
        match tok.kind {
            TokenKind::Int => {
                self.advance();
                tok.lexeme
                    .parse::<i64>()
                    .map(Expr::Int)
                    .map_err(|_| format!("line {}: integer literal out of range", tok.line))
            }
            TokenKind::Float => {
                self.advance();
                tok.lexeme
                    .parse::<f64>()
                    .map(Expr::Float)
                    .map_err(|_| format!("line {}: float literal out of range", tok.line))
            }
            TokenKind::Str => {
                self.advance();
                Ok(Expr::Str(lexer::string_value(&tok.lexeme)))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Keyword(Keyword::Lifo) => {
                self.advance();
                Ok(Expr::PerspectiveLit(Perspective::Lifo))
            }
            TokenKind::Keyword(Keyword::Fifo) => {
                self.advance();
                Ok(Expr::PerspectiveLit(Perspective::Fifo))
            }
            TokenKind::Keyword(Keyword::Indexed) => {
                self.advance();
                Ok(Expr::PerspectiveLit(Perspective::Indexed))
            }
            TokenKind::Keyword(Keyword::Hash) => {
                self.advance();
                Ok(Expr::PerspectiveLit(Perspective::Hash))
            }
            TokenKind::Keyword(Keyword::Maxfo) => {
                self.advance();
                Ok(Expr::PerspectiveLit(Perspective::Maxfo))
            }
            TokenKind::Keyword(Keyword::Minfo) => {
                self.advance();
                Ok(Expr::PerspectiveLit(Perspective::Minfo))
            }
            TokenKind::Keyword(Keyword::I64) => {
                self.advance();
                Ok(Expr::TypeLit(ElemType::I64))
            }
            TokenKind::Keyword(Keyword::F64) => {
                self.advance();
                Ok(Expr::TypeLit(ElemType::F64))
            }
            TokenKind::Keyword(Keyword::Str) => {
                self.advance();
                Ok(Expr::TypeLit(ElemType::Str))
            }
            TokenKind::Keyword(Keyword::Bool) => {
                self.advance();
                Ok(Expr::TypeLit(ElemType::Bool))
            }
            TokenKind::Keyword(Keyword::Bytes) => {
                self.advance();
                Ok(Expr::TypeLit(ElemType::Bytes))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_punct(Punct::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Punct(Punct::LBrace) => {
                let (params, body) = self.parse_codeblock()?;
                Ok(Expr::Codeblock { params, body })
            }
            TokenKind::StackRef => {
                self.advance();
                self.parse_stack_rvalue(tok.lexeme)
            }
            TokenKind::Ident => {
                self.advance();
                self.parse_ident_expr(tok.lexeme, tok.line)
            }
            _ => Err(self.error("an expression")),
        }
    }

    /// `@s` alone, or `@s: pop/peek/take/len/reduce(...)` as rvalue.
    fn parse_stack_rvalue(&mut self, stack: String) -> Result<Expr, String> {
        if !self.check_punct(Punct::Colon) {
            return Ok(Expr::StackRef(stack));
        }
        // Only claim the colon when a value-producing op follows.
        if !matches!(
            self.peek_at(1).kind,
            TokenKind::Keyword(
                Keyword::Pop | Keyword::Peek | Keyword::Take | Keyword::Len | Keyword::Reduce
            )
        ) {
            return Ok(Expr::StackRef(stack));
        }
        self.advance(); // ':'
        let (op, args) = self.parse_value_op()?;
        Ok(Expr::StackExpr { stack, op, args })
    }

    fn parse_value_op(&mut self) -> Result<(StackExprOp, Vec<Expr>), String> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Keyword(Keyword::Pop) => Ok((StackExprOp::Pop, Vec::new())),
            TokenKind::Keyword(Keyword::Peek) => Ok((StackExprOp::Peek, Vec::new())),
            TokenKind::Keyword(Keyword::Len) => Ok((StackExprOp::Len, Vec::new())),
            TokenKind::Keyword(Keyword::Take) => {
                let args = if self.check_punct(Punct::LParen) {
                    self.parse_call_args()?
                } else {
                    Vec::new()
                };
                Ok((StackExprOp::Take, args))
            }
            TokenKind::Keyword(Keyword::Reduce) => {
                self.expect_punct(Punct::LParen, "'(' after 'reduce'")?;
                let fold_tok = self.advance();
                let fold = match fold_tok.kind {
                    TokenKind::Keyword(Keyword::Add) => BinOp::Add,
                    TokenKind::Keyword(Keyword::Sub) => BinOp::Sub,
                    TokenKind::Keyword(Keyword::Mul) => BinOp::Mul,
                    TokenKind::Keyword(Keyword::Div) => BinOp::Div,
                    _ => {
                        return Err(format!(
                            "line {}: reduce takes an arithmetic op (add/sub/mul/div), found '{}'",
                            fold_tok.line, fold_tok.lexeme
                        ));
                    }
                };
                self.expect_punct(Punct::RParen, "')' after reduce op")?;
                Ok((StackExprOp::Reduce(fold), Vec::new()))
            }
            _ => Err(format!(
                "line {}: expected a value-producing stack op, found '{}'",
                tok.line, tok.lexeme
            )),
        }
    }

    fn parse_ident_expr(&mut self, name: String, line: usize) -> Result<Expr, String> {
        // self.prop / self[i] / self.prop[i]
        if name == "self" {
            if self.eat_punct(Punct::Dot) {
                let prop = self.expect_ident("a property name after 'self.'")?;
                if self.eat_punct(Punct::LBracket) {
                    let index = self.parse_expr()?;
                    self.expect_punct(Punct::RBracket, "']' after index")?;
                    return Ok(Expr::SelfMemberIndex {
                        prop,
                        index: Box::new(index),
                    });
                }
                return Ok(Expr::SelfMember { prop });
            }
            if self.eat_punct(Punct::LBracket) {
                let index = self.parse_expr()?;
                self.expect_punct(Punct::RBracket, "']' after index")?;
                return Ok(Expr::SelfIndex {
                    index: Box::new(index),
                });
            }
            return Err(format!(
                "line {}: 'self' must be followed by '.' or '[' in a kernel",
                line
            ));
        }

        if self.check_punct(Punct::LParen) {
            let args = self.parse_call_args()?;
            return Ok(Expr::Call { name, args });
        }

        if self.eat_punct(Punct::LBracket) {
            let index = self.parse_expr()?;
            self.expect_punct(Punct::RBracket, "']' after index")?;
            return Ok(Expr::Index {
                name,
                index: Box::new(index),
            });
        }

        // `v: pop`: value op through a view.
        if self.check_punct(Punct::Colon)
            && matches!(
                self.peek_at(1).kind,
                TokenKind::Keyword(
                    Keyword::Pop | Keyword::Peek | Keyword::Take | Keyword::Len | Keyword::Reduce
                )
            )
        {
            self.advance(); // ':'
            let (op, args) = self.parse_value_op()?;
            return Ok(Expr::ViewExpr {
                view: name,
                op,
                args,
            });
        }

        Ok(Expr::Ident(name))
    }
}

fn starts_statement(kw: Keyword) -> bool {
    kw.is_stack_op()
        || matches!(
            kw,
            Keyword::Var
                | Keyword::Let
                | Keyword::View
                | Keyword::Func
                | Keyword::If
                | Keyword::While
                | Keyword::For
                | Keyword::Break
                | Keyword::Continue
                | Keyword::Return
                | Keyword::Defer
                | Keyword::Try
                | Keyword::Panic
                | Keyword::Status
                | Keyword::Retry
                | Keyword::Restart
        )
}

fn op_kind(kw: Keyword) -> StackOpKind {
    match kw {
        Keyword::Push => StackOpKind::Push,
        Keyword::Pop => StackOpKind::Pop,
        Keyword::Peek => StackOpKind::Peek,
        Keyword::Take => StackOpKind::Take,
        Keyword::Dup => StackOpKind::Dup,
        Keyword::Drop => StackOpKind::Drop,
        Keyword::Swap => StackOpKind::Swap,
        Keyword::Over => StackOpKind::Over,
        Keyword::Rot => StackOpKind::Rot,
        Keyword::Tor => StackOpKind::Tor,
        Keyword::Fromr => StackOpKind::Fromr,
        Keyword::Add => StackOpKind::Add,
        Keyword::Sub => StackOpKind::Sub,
        Keyword::Mul => StackOpKind::Mul,
        Keyword::Div => StackOpKind::Div,
        Keyword::Mod => StackOpKind::Mod,
        Keyword::Eq => StackOpKind::Eq,
        Keyword::Ne => StackOpKind::Ne,
        Keyword::Lt => StackOpKind::Lt,
        Keyword::Gt => StackOpKind::Gt,
        Keyword::Le => StackOpKind::Le,
        Keyword::Ge => StackOpKind::Ge,
        Keyword::Bring => StackOpKind::Bring,
        Keyword::Freeze => StackOpKind::Freeze,
        Keyword::Perspective => StackOpKind::Perspective,
        Keyword::Has => StackOpKind::Has,
        Keyword::Clear => StackOpKind::Clear,
        Keyword::Set => StackOpKind::Set,
        Keyword::Get => StackOpKind::Get,
        Keyword::Len => StackOpKind::Len,
        Keyword::Dot => StackOpKind::Dot,
        Keyword::Alias => StackOpKind::Alias,
        Keyword::Reduce => StackOpKind::Reduce,
        _ => unreachable!("op_kind called for a non-op keyword"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        Parser::new(source)
            .parse()
            .unwrap_or_else(|e| panic!("parse failed: {}", e))
    }

    fn parse_err(source: &str) -> String {
        Parser::new(source)
            .parse()
            .expect_err("expected a parse error")
    }

    #[test]
    fn test_named_stack_declaration() {
        let program = parse("@acc = Stack.new(f64, cap: 8, FIFO)");
        assert_eq!(
            program.statements[0],
            Stmt::StackDecl {
                name: "acc".to_string(),
                elem: ElemType::F64,
                perspective: Perspective::Fifo,
                capacity: Some(8),
                compare: None,
                line: 1,
            }
        );
    }

    #[test]
    fn test_anonymous_declaration_with_alias_and_ops() {
        let program = parse("@Stack.new(i64): alias:\"i\" push(3) push(4) add\n@i: dot");
        match &program.statements[0] {
            Stmt::StackDecl { name, elem, .. } => {
                assert_eq!(name, "i");
                assert_eq!(*elem, ElemType::I64);
            }
            other => panic!("expected a stack declaration, got {:?}", other),
        }
        match &program.statements[1] {
            Stmt::StackOpStmt { host, ops, .. } => {
                assert_eq!(*host, OpHost::Stack("i".to_string()));
                let kinds: Vec<_> = ops.iter().map(|o| o.kind).collect();
                assert_eq!(
                    kinds,
                    vec![StackOpKind::Push, StackOpKind::Push, StackOpKind::Add]
                );
            }
            other => panic!("expected an op chain, got {:?}", other),
        }
        match &program.statements[2] {
            Stmt::StackOpStmt { ops, .. } => assert_eq!(ops[0].kind, StackOpKind::Dot),
            other => panic!("expected dot, got {:?}", other),
        }
    }

    #[test]
    fn test_op_chain_with_targets() {
        let program = parse("@s: pop:v take:w let:x");
        match &program.statements[0] {
            Stmt::StackOpStmt { ops, .. } => {
                assert_eq!(ops[0].target.as_deref(), Some("v"));
                assert_eq!(ops[1].target.as_deref(), Some("w"));
                assert_eq!(ops[2].kind, StackOpKind::Let);
                assert_eq!(ops[2].target.as_deref(), Some("x"));
            }
            other => panic!("expected an op chain, got {:?}", other),
        }
    }

    #[test]
    fn test_push_sugar_and_bring_sugar() {
        let program = parse("@out < 42\n@f < @i");
        match &program.statements[0] {
            Stmt::StackOpStmt { ops, .. } => {
                assert_eq!(ops[0].kind, StackOpKind::Push);
                assert_eq!(ops[0].args, vec![Expr::Int(42)]);
            }
            other => panic!("expected push, got {:?}", other),
        }
        match &program.statements[1] {
            Stmt::StackOpStmt { host, ops, .. } => {
                assert_eq!(*host, OpHost::Stack("f".to_string()));
                assert_eq!(ops[0].kind, StackOpKind::Bring);
                assert_eq!(ops[0].args, vec![Expr::StackRef("i".to_string())]);
            }
            other => panic!("expected bring, got {:?}", other),
        }
    }

    #[test]
    fn test_error_push_and_fallible_func() {
        let program = parse("@error < \"bad\"\n@error < func risky() { @error < \"oops\" }");
        assert!(matches!(&program.statements[0], Stmt::ErrorPush { .. }));
        match &program.statements[1] {
            Stmt::FuncDecl(f) => {
                assert_eq!(f.name, "risky");
                assert!(f.can_fail);
            }
            other => panic!("expected a fallible function, got {:?}", other),
        }
    }

    #[test]
    fn test_defer_forms() {
        let program = parse("@defer < { print:\"a\" }\ndefer { print:\"b\" }");
        assert!(matches!(&program.statements[0], Stmt::DeferBlock { .. }));
        assert!(matches!(&program.statements[1], Stmt::DeferBlock { .. }));
    }

    #[test]
    fn test_spawn_push_and_ops() {
        let program = parse("@spawn < { |n| @c < n }\n@spawn pop play\n@spawn len\n@spawn clear");
        match &program.statements[0] {
            Stmt::SpawnPush { params, .. } => assert_eq!(params, &vec!["n".to_string()]),
            other => panic!("expected spawn push, got {:?}", other),
        }
        assert_eq!(
            program.statements[1],
            Stmt::SpawnOp {
                op: SpawnOpKind::Pop,
                play: true,
                line: 2
            }
        );
        assert!(matches!(
            program.statements[2],
            Stmt::SpawnOp {
                op: SpawnOpKind::Len,
                play: false,
                ..
            }
        ));
    }

    #[test]
    fn test_stack_block_plain() {
        let program = parse("@s {\n  push(1)\n  dup\n}");
        match &program.statements[0] {
            Stmt::StackBlock { stack, body, .. } => {
                assert_eq!(stack, "s");
                assert_eq!(body.len(), 2);
                assert!(matches!(
                    &body[0],
                    Stmt::StackOpStmt {
                        host: OpHost::Implicit,
                        ..
                    }
                ));
            }
            other => panic!("expected a stack block, got {:?}", other),
        }
    }

    #[test]
    fn test_consider_cases() {
        let program =
            parse("@s {\n  push(1)\n}.consider( ok: print:\"ok\" error |e|: print:e _: drop )");
        match &program.statements[0] {
            Stmt::Consider { cases, setup, .. } => {
                assert_eq!(setup.len(), 1);
                assert_eq!(cases.len(), 3);
                assert_eq!(cases[0].label, CaseLabel::Name("ok".to_string()));
                assert_eq!(cases[1].label, CaseLabel::Name("error".to_string()));
                assert_eq!(cases[1].bindings, vec!["e".to_string()]);
                assert_eq!(cases[2].label, CaseLabel::Default);
            }
            other => panic!("expected consider, got {:?}", other),
        }
    }

    #[test]
    fn test_select_with_timeout_and_default() {
        let program = parse(
            "@c {}.select( @c { |v| print:v } timeout(200, {|| print:\"timeout\"}) _ : { drop } )",
        );
        match &program.statements[0] {
            Stmt::Select { cases, default, .. } => {
                assert_eq!(cases.len(), 1);
                assert_eq!(cases[0].stack, "c");
                assert_eq!(cases[0].binding.as_deref(), Some("v"));
                let timeout = cases[0].timeout.as_ref().expect("timeout clause");
                assert_eq!(timeout.ms, 200);
                assert!(default.is_some());
            }
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn test_compute_kernel() {
        let program = parse(
            "@s {}.compute({ || var force = self.mass * self.accel\nreturn force })",
        );
        match &program.statements[0] {
            Stmt::Compute {
                bindings, body, ..
            } => {
                assert!(bindings.is_empty());
                assert_eq!(body.len(), 2);
                match &body[0] {
                    Stmt::VarDecl { names, inits, .. } => {
                        assert_eq!(names, &vec!["force".to_string()]);
                        assert!(matches!(
                            &inits[0],
                            Expr::Binary {
                                op: BinOp::Mul,
                                ..
                            }
                        ));
                    }
                    other => panic!("expected var decl, got {:?}", other),
                }
            }
            other => panic!("expected compute, got {:?}", other),
        }
    }

    #[test]
    fn test_kernel_array_and_container_write() {
        let program = parse("@s {}.compute({ || var buf[4]\nbuf[0] = 1\nself.xs[2] = buf[0] })");
        match &program.statements[0] {
            Stmt::Compute { body, .. } => {
                assert!(matches!(&body[0], Stmt::VarArrayDecl { size: 4, .. }));
                assert!(matches!(
                    &body[1],
                    Stmt::Assign {
                        target: AssignTarget::Index { .. },
                        ..
                    }
                ));
                assert!(matches!(
                    &body[2],
                    Stmt::Assign {
                        target: AssignTarget::SelfMemberIndex { .. },
                        ..
                    }
                ));
            }
            other => panic!("expected compute, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_self_write_rejected() {
        let err = parse_err("@s {}.compute({ || self.mass = 1.0 })");
        assert!(err.contains("self.mass[i]"), "got: {}", err);
    }

    #[test]
    fn test_if_chain_and_stack_condition() {
        let program = parse("if x > 1 { dup } else if { drop } else { swap }");
        match &program.statements[0] {
            Stmt::If {
                arms, else_body, ..
            } => {
                assert_eq!(arms.len(), 2);
                assert!(arms[0].0.is_some());
                assert!(arms[1].0.is_none(), "bare else-if pops the bool stack");
                assert!(else_body.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_for_with_perspective_override() {
        let program = parse("@s.fifo for { |i, v| print(v) }");
        match &program.statements[0] {
            Stmt::ForStack {
                stack,
                perspective,
                bindings,
                ..
            } => {
                assert_eq!(stack, "s");
                assert_eq!(*perspective, Some(Perspective::Fifo));
                assert_eq!(bindings.len(), 2);
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_view_decl_and_view_op() {
        let program = parse("view q = @s . fifo\nq: push(1) pop:v");
        assert!(matches!(&program.statements[0], Stmt::ViewDecl { .. }));
        match &program.statements[1] {
            Stmt::StackOpStmt { host, .. } => {
                assert_eq!(*host, OpHost::View("q".to_string()));
            }
            other => panic!("expected a view op, got {:?}", other),
        }
    }

    #[test]
    fn test_call_shorthand_vs_view_op() {
        let program = parse("print:\"ok\"");
        match &program.statements[0] {
            Stmt::ExprStmt {
                expr: Expr::Call { name, args },
                ..
            } => {
                assert_eq!(name, "print");
                assert_eq!(args, &vec![Expr::Str("ok".to_string())]);
            }
            other => panic!("expected call shorthand, got {:?}", other),
        }
    }

    #[test]
    fn test_stack_rvalue_expressions() {
        let program = parse("x = @s: pop\ny = @s: take(500)\nz = @s: reduce(add)");
        match &program.statements[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(
                    value,
                    Expr::StackExpr {
                        op: StackExprOp::Pop,
                        ..
                    }
                ));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
        match &program.statements[1] {
            Stmt::Assign { value, .. } => match value {
                Expr::StackExpr { op, args, .. } => {
                    assert_eq!(*op, StackExprOp::Take);
                    assert_eq!(args, &vec![Expr::Int(500)]);
                }
                other => panic!("expected take rvalue, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
        match &program.statements[2] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(
                    value,
                    Expr::StackExpr {
                        op: StackExprOp::Reduce(BinOp::Add),
                        ..
                    }
                ));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_infix_precedence() {
        let program = parse("x = 1 + 2 * 3");
        match &program.statements[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::Binary { op, rhs, .. } => {
                    assert_eq!(*op, BinOp::Add);
                    assert!(matches!(
                        rhs.as_ref(),
                        Expr::Binary {
                            op: BinOp::Mul,
                            ..
                        }
                    ));
                }
                other => panic!("expected binary, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_try_catch_finally() {
        let program =
            parse("try {\n  panic \"boom\"\n} catch |e| {\n  print:e\n} finally {\n  drop\n}");
        match &program.statements[0] {
            Stmt::Try {
                binding, finally, ..
            } => {
                assert_eq!(binding.as_deref(), Some("e"));
                assert!(finally.is_some());
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_status_set_forms() {
        let program = parse("status:ok\nstatus:fail(\"why\")\nstatus:2");
        assert!(matches!(
            &program.statements[0],
            Stmt::StatusSet {
                label: CaseLabel::Name(n),
                value: None,
                ..
            } if n == "ok"
        ));
        assert!(matches!(
            &program.statements[1],
            Stmt::StatusSet { value: Some(_), .. }
        ));
        assert!(matches!(
            &program.statements[2],
            Stmt::StatusSet {
                label: CaseLabel::Int(2),
                ..
            }
        ));
    }

    #[test]
    fn test_var_decl_forms() {
        let program = parse("var a\nvar b, c: f64 = 1.0, 2.0");
        assert!(matches!(
            &program.statements[0],
            Stmt::VarDecl { names, ty: None, .. } if names.len() == 1
        ));
        match &program.statements[1] {
            Stmt::VarDecl {
                names, ty, inits, ..
            } => {
                assert_eq!(names.len(), 2);
                assert_eq!(*ty, Some(ElemType::F64));
                assert_eq!(inits.len(), 2);
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_func_decl_with_types() {
        let program = parse("func area(w: f64, h: f64): f64 {\n  return w * h\n}");
        match &program.statements[0] {
            Stmt::FuncDecl(f) => {
                assert_eq!(f.name, "area");
                assert_eq!(f.params.len(), 2);
                assert_eq!(f.ret, Some(ElemType::F64));
                assert!(!f.can_fail);
            }
            other => panic!("expected func, got {:?}", other),
        }
    }

    #[test]
    fn test_first_error_is_fatal_with_line() {
        let err = parse_err("@s: push(1)\n@s: push(");
        assert!(err.starts_with("line 2:"), "got: {}", err);
    }

    #[test]
    fn test_missing_brace_reports_expected() {
        let err = parse_err("func f() {\n  dup\n");
        assert!(err.contains("'}'"), "got: {}", err);
    }

    #[test]
    fn test_ast_stability() {
        let source = "@q = Stack.new(i64, FIFO)\n@q: push(1) push(2)\n@q for { |v| print(v) }\n\
                      func twice(n: i64): i64 { return n * 2 }\n";
        let a = parse(source);
        let b = parse(source);
        assert_eq!(a, b);
    }

    #[test]
    fn test_maxfo_accepted_by_parser() {
        // Priority perspectives lex and parse; the generator rejects them.
        let program = parse("@p = Stack.new(i64, MAXFO, compare: by_weight)");
        match &program.statements[0] {
            Stmt::StackDecl {
                perspective,
                compare,
                ..
            } => {
                assert_eq!(*perspective, Perspective::Maxfo);
                assert_eq!(compare.as_deref(), Some("by_weight"));
            }
            other => panic!("expected stack decl, got {:?}", other),
        }
    }
}
