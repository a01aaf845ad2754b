//! Tokenizer for ual source text
//!
//! Scans a UTF-8 buffer left to right into a flat token vector the parser
//! indexes into. Newlines are significant, terminating statements, so
//! they are emitted as tokens rather than skipped, except inside open
//! parentheses or brackets where a statement may wrap freely.
//!
//! Three comment dialects are recognized: `// ...`, `-- ...` (both to end
//! of line) and `/* ... */` (an unterminated block comment runs to end of
//! input and is tolerated). Two-character operators are lexed greedily.
//!
//! The lexer never fails: malformed input produces a single `Error` token
//! carrying the offending text, and tokenization halts there.

/// A lexed token: kind, raw source text, and 1-indexed origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// The raw source slice (string literals keep their quotes/escapes;
    /// stack references carry the name without the `@` sigil).
    pub lexeme: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    fn new(kind: TokenKind, lexeme: impl Into<String>, line: usize, column: usize) -> Self {
        Token {
            kind,
            lexeme: lexeme.into(),
            line,
            column,
        }
    }

    pub fn is_keyword(&self, kw: Keyword) -> bool {
        self.kind == TokenKind::Keyword(kw)
    }

    pub fn is_punct(&self, p: Punct) -> bool {
        self.kind == TokenKind::Punct(p)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// `[A-Za-z_][A-Za-z0-9_]*`, not in the keyword table
    Ident,
    /// `@name`; the lexeme is the bare name
    StackRef,
    /// Decimal integer literal
    Int,
    /// Decimal literal with a single `.`
    Float,
    /// Double-quoted string literal (lexeme is the raw slice)
    Str,
    Keyword(Keyword),
    Punct(Punct),
    /// Statement terminator (also emitted for `;`)
    Newline,
    Eof,
    /// Malformed input; tokenization halted here
    Error,
}

/// The fixed keyword table. Identifiers matching an entry are promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    // Declarations and bindings
    Var,
    Let,
    Func,
    View,
    // Control flow
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    Return,
    // Error handling
    Defer,
    Try,
    Catch,
    Finally,
    Panic,
    // Outcome matching / concurrency constructs
    Consider,
    Select,
    Compute,
    Status,
    Retry,
    Restart,
    Timeout,
    Spawn,
    // Stack operations
    Push,
    Pop,
    Peek,
    Take,
    Dup,
    Drop,
    Swap,
    Over,
    Rot,
    Tor,
    Fromr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Bring,
    Freeze,
    Perspective,
    Has,
    Clear,
    Set,
    Get,
    Len,
    Dot,
    Alias,
    Reduce,
    Play,
    // Element types
    I64,
    F64,
    Str,
    Bool,
    Bytes,
    // Perspectives
    Lifo,
    Fifo,
    Indexed,
    Hash,
    Maxfo,
    Minfo,
    // Stack constructor
    Stack,
    // Boolean literals
    True,
    False,
}

impl Keyword {
    pub fn from_ident(text: &str) -> Option<Keyword> {
        use Keyword::*;
        Some(match text {
            "var" => Var,
            "let" => Let,
            "func" => Func,
            "view" => View,
            "if" => If,
            "else" => Else,
            "while" => While,
            "for" => For,
            "break" => Break,
            "continue" => Continue,
            "return" => Return,
            "defer" => Defer,
            "try" => Try,
            "catch" => Catch,
            "finally" => Finally,
            "panic" => Panic,
            "consider" => Consider,
            "select" => Select,
            "compute" => Compute,
            "status" => Status,
            "retry" => Retry,
            "restart" => Restart,
            "timeout" => Timeout,
            "spawn" => Spawn,
            "push" => Push,
            "pop" => Pop,
            "peek" => Peek,
            "take" => Take,
            "dup" => Dup,
            "drop" => Drop,
            "swap" => Swap,
            "over" => Over,
            "rot" => Rot,
            "tor" => Tor,
            "fromr" => Fromr,
            "add" => Add,
            "sub" => Sub,
            "mul" => Mul,
            "div" => Div,
            "mod" => Mod,
            "eq" => Eq,
            "ne" => Ne,
            "lt" => Lt,
            "gt" => Gt,
            "le" => Le,
            "ge" => Ge,
            "bring" => Bring,
            "freeze" => Freeze,
            "perspective" => Perspective,
            "has" => Has,
            "clear" => Clear,
            "set" => Set,
            "get" => Get,
            "len" => Len,
            "dot" => Dot,
            "alias" => Alias,
            "reduce" => Reduce,
            "play" => Play,
            "i64" => I64,
            "f64" => F64,
            "str" => Str,
            "bool" => Bool,
            "bytes" => Bytes,
            "LIFO" => Lifo,
            "FIFO" => Fifo,
            "Indexed" => Indexed,
            "Hash" => Hash,
            "MAXFO" => Maxfo,
            "MINFO" => Minfo,
            "Stack" => Stack,
            "true" => True,
            "false" => False,
            _ => return None,
        })
    }

    /// Whether this keyword names a stack operation usable in an op chain
    /// (`@s: push(1) dup add`) or bare inside a stack block.
    pub fn is_stack_op(&self) -> bool {
        use Keyword::*;
        matches!(
            self,
            Push | Pop
                | Peek
                | Take
                | Dup
                | Drop
                | Swap
                | Over
                | Rot
                | Tor
                | Fromr
                | Add
                | Sub
                | Mul
                | Div
                | Mod
                | Eq
                | Ne
                | Lt
                | Gt
                | Le
                | Ge
                | Bring
                | Freeze
                | Perspective
                | Has
                | Clear
                | Set
                | Get
                | Len
                | Dot
                | Alias
                | Reduce
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Assign,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Pipe,
    EqEq,
    NotEq,
    LtEq,
    GtEq,
    AndAnd,
    /// `||`: logical-or in infix position, empty-parameter marker at the
    /// head of a codeblock
    OrOr,
}

/// Tokenize a source buffer. The result always ends with `Eof` unless an
/// `Error` token halted the scan.
pub fn tokenize(source: &str) -> Vec<Token> {
    Lexer::new(source).run()
}

/// Decode a raw string-literal lexeme (with quotes) into its value.
/// Unknown escapes yield the escaped character literally.
pub fn string_value(raw: &str) -> String {
    let body = raw
        .strip_prefix('"')
        .unwrap_or(raw)
        .strip_suffix('"')
        .unwrap_or(raw);
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    /// Open delimiters. Newlines are insignificant only when the innermost
    /// open delimiter is a paren or bracket; braces restore significance.
    delims: Vec<char>,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            delims: Vec::new(),
            tokens: Vec::new(),
        }
    }

    fn in_group(&self) -> bool {
        matches!(self.delims.last(), Some('(') | Some('['))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn run(mut self) -> Vec<Token> {
        loop {
            match self.next_token() {
                Some(tok) => {
                    let halt = tok.kind == TokenKind::Error;
                    self.tokens.push(tok);
                    if halt {
                        return self.tokens;
                    }
                }
                None => {
                    self.tokens
                        .push(Token::new(TokenKind::Eof, "", self.line, self.column));
                    return self.tokens;
                }
            }
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        self.skip_insignificant();
        let line = self.line;
        let column = self.column;
        let c = self.peek()?;

        if c == '\n' {
            self.bump();
            if self.in_group() {
                return self.next_token();
            }
            return Some(Token::new(TokenKind::Newline, "\n", line, column));
        }
        if c == ';' {
            self.bump();
            return Some(Token::new(TokenKind::Newline, ";", line, column));
        }

        if c == '@' {
            return Some(self.stack_ref(line, column));
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return Some(self.ident_or_keyword(line, column));
        }
        if c.is_ascii_digit() {
            return Some(self.number(line, column));
        }
        if c == '"' {
            return Some(self.string(line, column));
        }

        Some(self.punct(line, column))
    }

    /// Skip spaces, tabs, carriage returns, and all three comment forms.
    fn skip_insignificant(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.bump();
                }
                Some('/') if self.peek_next() == Some('/') => self.skip_line_comment(),
                Some('-') if self.peek_next() == Some('-') => self.skip_line_comment(),
                Some('/') if self.peek_next() == Some('*') => {
                    self.bump();
                    self.bump();
                    // Unterminated block comment runs to end of input.
                    while let Some(c) = self.peek() {
                        if c == '*' && self.peek_next() == Some('/') {
                            self.bump();
                            self.bump();
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                return; // the newline itself is significant
            }
            self.bump();
        }
    }

    fn stack_ref(&mut self, line: usize, column: usize) -> Token {
        self.bump(); // '@'
        let mut name = String::new();
        if !matches!(self.peek(), Some(c) if c.is_ascii_alphabetic() || c == '_') {
            return Token::new(TokenKind::Error, "@", line, column);
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Token::new(TokenKind::StackRef, name, line, column)
    }

    fn ident_or_keyword(&mut self, line: usize, column: usize) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match Keyword::from_ident(&text) {
            Some(kw) => Token::new(TokenKind::Keyword(kw), text, line, column),
            None => Token::new(TokenKind::Ident, text, line, column),
        }
    }

    fn number(&mut self, line: usize, column: usize) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // A single '.' followed by a digit makes it a float; a bare '.'
        // is left for member access / op chaining.
        if self.peek() == Some('.') && matches!(self.peek_next(), Some(c) if c.is_ascii_digit()) {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            return Token::new(TokenKind::Float, text, line, column);
        }
        Token::new(TokenKind::Int, text, line, column)
    }

    fn string(&mut self, line: usize, column: usize) -> Token {
        let mut raw = String::from('"');
        self.bump(); // opening quote
        loop {
            match self.peek() {
                None | Some('\n') => {
                    // Unterminated string: error token with what we saw.
                    return Token::new(TokenKind::Error, raw, line, column);
                }
                Some('\\') => {
                    raw.push('\\');
                    self.bump();
                    if let Some(c) = self.peek() {
                        raw.push(c);
                        self.bump();
                    }
                }
                Some('"') => {
                    raw.push('"');
                    self.bump();
                    return Token::new(TokenKind::Str, raw, line, column);
                }
                Some(c) => {
                    raw.push(c);
                    self.bump();
                }
            }
        }
    }

    fn punct(&mut self, line: usize, column: usize) -> Token {
        let c = self.bump().expect("punct called at end of input");
        let two = |lexer: &mut Lexer, p, text: &str| {
            lexer.bump();
            Token::new(TokenKind::Punct(p), text, line, column)
        };
        let tok = match c {
            '(' => {
                self.delims.push('(');
                Token::new(TokenKind::Punct(Punct::LParen), "(", line, column)
            }
            ')' => {
                self.delims.pop();
                Token::new(TokenKind::Punct(Punct::RParen), ")", line, column)
            }
            '[' => {
                self.delims.push('[');
                Token::new(TokenKind::Punct(Punct::LBracket), "[", line, column)
            }
            ']' => {
                self.delims.pop();
                Token::new(TokenKind::Punct(Punct::RBracket), "]", line, column)
            }
            '{' => {
                self.delims.push('{');
                Token::new(TokenKind::Punct(Punct::LBrace), "{", line, column)
            }
            '}' => {
                self.delims.pop();
                Token::new(TokenKind::Punct(Punct::RBrace), "}", line, column)
            }
            ',' => Token::new(TokenKind::Punct(Punct::Comma), ",", line, column),
            ':' => Token::new(TokenKind::Punct(Punct::Colon), ":", line, column),
            '.' => Token::new(TokenKind::Punct(Punct::Dot), ".", line, column),
            '+' => Token::new(TokenKind::Punct(Punct::Plus), "+", line, column),
            '-' => Token::new(TokenKind::Punct(Punct::Minus), "-", line, column),
            '*' => Token::new(TokenKind::Punct(Punct::Star), "*", line, column),
            '/' => Token::new(TokenKind::Punct(Punct::Slash), "/", line, column),
            '%' => Token::new(TokenKind::Punct(Punct::Percent), "%", line, column),
            '=' if self.peek() == Some('=') => two(self, Punct::EqEq, "=="),
            '=' => Token::new(TokenKind::Punct(Punct::Assign), "=", line, column),
            '!' if self.peek() == Some('=') => two(self, Punct::NotEq, "!="),
            '!' => Token::new(TokenKind::Punct(Punct::Bang), "!", line, column),
            '<' if self.peek() == Some('=') => two(self, Punct::LtEq, "<="),
            '<' => Token::new(TokenKind::Punct(Punct::Lt), "<", line, column),
            '>' if self.peek() == Some('=') => two(self, Punct::GtEq, ">="),
            '>' => Token::new(TokenKind::Punct(Punct::Gt), ">", line, column),
            '&' if self.peek() == Some('&') => two(self, Punct::AndAnd, "&&"),
            '|' if self.peek() == Some('|') => two(self, Punct::OrOr, "||"),
            '|' => Token::new(TokenKind::Punct(Punct::Pipe), "|", line, column),
            other => Token::new(TokenKind::Error, other.to_string(), line, column),
        };
        tok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        let toks = tokenize("var counter push");
        assert_eq!(toks[0].kind, TokenKind::Keyword(Keyword::Var));
        assert_eq!(toks[1].kind, TokenKind::Ident);
        assert_eq!(toks[1].lexeme, "counter");
        assert_eq!(toks[2].kind, TokenKind::Keyword(Keyword::Push));
        assert_eq!(toks[3].kind, TokenKind::Eof);
    }

    #[test]
    fn test_stack_ref_strips_sigil() {
        let toks = tokenize("@inventory");
        assert_eq!(toks[0].kind, TokenKind::StackRef);
        assert_eq!(toks[0].lexeme, "inventory");
    }

    #[test]
    fn test_bare_sigil_is_error() {
        let toks = tokenize("@ 1");
        assert_eq!(toks[0].kind, TokenKind::Error);
        assert_eq!(toks.len(), 1, "tokenization halts at the error token");
    }

    #[test]
    fn test_numbers() {
        let toks = tokenize("42 3.25");
        assert_eq!(toks[0].kind, TokenKind::Int);
        assert_eq!(toks[1].kind, TokenKind::Float);
        assert_eq!(toks[1].lexeme, "3.25");
    }

    #[test]
    fn test_dot_after_int_left_for_chaining() {
        // `@s.fifo` style: the dot must not be folded into a number.
        let toks = tokenize("1.dup");
        assert_eq!(toks[0].kind, TokenKind::Int);
        assert_eq!(toks[1].kind, TokenKind::Punct(Punct::Dot));
        assert_eq!(toks[2].kind, TokenKind::Keyword(Keyword::Dup));
    }

    #[test]
    fn test_string_escapes_kept_raw() {
        let toks = tokenize(r#""a\nb""#);
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].lexeme, r#""a\nb""#);
        assert_eq!(string_value(&toks[0].lexeme), "a\nb");
    }

    #[test]
    fn test_unknown_escape_is_literal() {
        assert_eq!(string_value(r#""a\qb""#), "aqb");
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let toks = tokenize("\"oops\n");
        assert_eq!(toks[0].kind, TokenKind::Error);
    }

    #[test]
    fn test_two_char_operators_greedy() {
        assert_eq!(
            kinds("== != <= >= && ||"),
            vec![
                TokenKind::Punct(Punct::EqEq),
                TokenKind::Punct(Punct::NotEq),
                TokenKind::Punct(Punct::LtEq),
                TokenKind::Punct(Punct::GtEq),
                TokenKind::Punct(Punct::AndAnd),
                TokenKind::Punct(Punct::OrOr),
                TokenKind::Eof,
            ]
        );
        let toks = tokenize("|x|");
        assert_eq!(toks[0].kind, TokenKind::Punct(Punct::Pipe));
    }

    #[test]
    fn test_comment_dialects() {
        let source = "1 // c++ style\n2 -- lua style\n3 /* block\nspanning */ 4";
        let toks: Vec<_> = tokenize(source)
            .into_iter()
            .filter(|t| t.kind == TokenKind::Int)
            .map(|t| t.lexeme)
            .collect();
        assert_eq!(toks, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_unterminated_block_comment_tolerated() {
        let toks = tokenize("1 /* never closed");
        assert_eq!(toks[0].kind, TokenKind::Int);
        assert_eq!(toks[1].kind, TokenKind::Eof);
    }

    #[test]
    fn test_newlines_significant_outside_groups() {
        assert!(kinds("1\n2").contains(&TokenKind::Newline));
        assert!(!kinds("f(1,\n2)").contains(&TokenKind::Newline));
        assert_eq!(
            kinds("a { \n }").iter().filter(|k| **k == TokenKind::Newline).count(),
            1,
            "newlines inside braces stay significant"
        );
        // A brace inside parens restores newline significance (select and
        // consider case handlers span lines inside their parens).
        assert!(kinds("s( c {\n1\n2\n} )").contains(&TokenKind::Newline));
    }

    #[test]
    fn test_semicolon_terminates_like_newline() {
        let toks = tokenize("dup ; drop");
        assert_eq!(toks[1].kind, TokenKind::Newline);
        assert_eq!(toks[1].lexeme, ";");
    }

    #[test]
    fn test_positions_are_one_indexed() {
        let toks = tokenize("a\n  b");
        assert_eq!((toks[0].line, toks[0].column), (1, 1));
        let b = toks.iter().find(|t| t.lexeme == "b").unwrap();
        assert_eq!((b.line, b.column), (2, 3));
    }

    #[test]
    fn test_round_trip_lexemes() {
        // Concatenated raw lexemes reconstruct the source modulo
        // insignificant whitespace and comments.
        let source = "@s = Stack.new(i64, cap: 4)\n@s: push(3) push(4) add\nx = \"hi\\n\" // tail\n";
        let stripped: String = source
            .lines()
            .map(|l| l.split("//").next().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let rebuilt: String = tokenize(source)
            .iter()
            .filter(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Eof))
            .map(|t| {
                if t.kind == TokenKind::StackRef {
                    format!("@{}", t.lexeme)
                } else {
                    t.lexeme.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        assert_eq!(rebuilt, stripped);
    }
}
