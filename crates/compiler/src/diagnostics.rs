//! Compile diagnostics
//!
//! A diagnostic is a source line plus a message. Lex and parse failures
//! are fatal and produce exactly one; the generators collect as many
//! semantic diagnostics as they can before giving up, so a single run
//! reports every boundary violation.

/// One reported problem, rendered as `file:line: message`.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// 1-indexed source line (0 when no position applies).
    pub line: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            line,
            message: message.into(),
        }
    }

    /// Render with the source file name the driver knows about.
    pub fn render(&self, file: &str) -> String {
        if self.line == 0 {
            format!("{}: {}", file, self.message)
        } else {
            format!("{}:{}: {}", file, self.line, self.message)
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "line {}: {}", self.line, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_file() {
        let d = Diagnostic::new(7, "float literal pushed onto i64 stack 'acc'");
        assert_eq!(
            d.render("physics.ual"),
            "physics.ual:7: float literal pushed onto i64 stack 'acc'"
        );
    }

    #[test]
    fn test_render_without_line() {
        let d = Diagnostic::new(0, "no statements");
        assert_eq!(d.render("empty.ual"), "empty.ual: no statements");
    }
}
