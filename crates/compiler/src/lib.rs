//! ual compiler library
//!
//! The core translation pipeline: ual source text in, idiomatic source
//! for one of the target hosts out. The pipeline is three stages with no
//! back-edges: lexer ([`lexer`]), parser ([`parser`]), code generator
//! ([`codegen`]), plus the symbol layer the generators consult.
//!
//! The single entry point is [`compile`]:
//!
//! ```
//! use ualc::{compile, CompileOptions};
//!
//! let out = compile("@Stack.new(i64): alias:\"i\"\n@i: push(3) push(4) add\n@i: dot\n",
//!                   &CompileOptions::default());
//! assert!(out.diagnostics.is_empty());
//! assert!(out.code.contains("package main"));
//! ```
//!
//! Lex and parse failures are fatal and yield exactly one diagnostic;
//! semantic violations are collected during generation so one run
//! reports everything. The driver maps a nonempty diagnostic list to a
//! nonzero exit.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod symbols;

pub use config::{Backend, CompileOptions, ProjectConfig};
pub use diagnostics::Diagnostic;
pub use parser::Parser;
pub use symbols::SymbolTable;

/// Everything one compilation produces.
#[derive(Debug)]
pub struct CompileOutput {
    /// Source text for the chosen backend (possibly partial when
    /// diagnostics are present).
    pub code: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn is_success(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Compile ual source text for the configured backend.
pub fn compile(source: &str, options: &CompileOptions) -> CompileOutput {
    let mut parser = Parser::new(source);
    let program = match parser.parse() {
        Ok(p) => p,
        Err(message) => {
            return CompileOutput {
                code: String::new(),
                diagnostics: vec![diagnostic_from_message(&message)],
            };
        }
    };

    match codegen::generate(&program, options) {
        Ok(generated) => CompileOutput {
            code: generated.code,
            diagnostics: generated.diagnostics,
        },
        Err(e) => CompileOutput {
            code: String::new(),
            diagnostics: vec![Diagnostic::new(0, e.to_string())],
        },
    }
}

/// Parser errors arrive as `line N: message` strings; split the line
/// back out so the driver renders them like any other diagnostic.
fn diagnostic_from_message(message: &str) -> Diagnostic {
    if let Some(rest) = message.strip_prefix("line ") {
        if let Some((line_str, text)) = rest.split_once(": ") {
            if let Ok(line) = line_str.parse::<usize>() {
                return Diagnostic::new(line, text.to_string());
            }
        }
    }
    Diagnostic::new(0, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "@Stack.new(i64): alias:\"i\"\n@i: push(3) push(4) add\n@i: dot\n";

    #[test]
    fn test_compile_go_hello() {
        let out = compile(
            HELLO,
            &CompileOptions {
                backend: Backend::Go,
                ..Default::default()
            },
        );
        assert!(out.is_success(), "diagnostics: {:?}", out.diagnostics);
        assert!(out.code.contains("package main"));
        assert!(out.code.contains("uS_i.Push(3)"));
    }

    #[test]
    fn test_compile_rust_hello() {
        let out = compile(
            HELLO,
            &CompileOptions {
                backend: Backend::Rust,
                ..Default::default()
            },
        );
        assert!(out.is_success(), "diagnostics: {:?}", out.diagnostics);
        assert!(out.code.contains("use ual_runtime::"));
        assert!(out.code.contains("US_i.push(3);"));
    }

    #[test]
    fn test_both_backends_accept_the_same_program() {
        let source = "@q = Stack.new(i64, FIFO)\n@q: push(1) push(2) push(3)\n\
                      @q for { |v| @dstack: push(v) @dstack: dot }\n";
        for backend in [Backend::Go, Backend::Rust] {
            let out = compile(
                source,
                &CompileOptions {
                    backend,
                    ..Default::default()
                },
            );
            assert!(
                out.is_success(),
                "{} diagnostics: {:?}",
                backend.tag(),
                out.diagnostics
            );
        }
    }

    #[test]
    fn test_parse_error_is_single_diagnostic_with_line() {
        let out = compile("@i: push(\n", &CompileOptions::default());
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].line, 1);
        assert!(out.code.is_empty());
    }

    #[test]
    fn test_lex_error_is_fatal() {
        let out = compile("@i: push(1) $\n", &CompileOptions::default());
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].message.contains("unexpected input"));
    }

    #[test]
    fn test_semantic_errors_are_collected_not_fatal() {
        // Two independent boundary violations: both reported in one run.
        let source = "@i = Stack.new(i64)\n@i: push(1.5)\n@i: push(2.5)\n";
        let out = compile(source, &CompileOptions::default());
        assert_eq!(out.diagnostics.len(), 2);
        assert_eq!(out.diagnostics[0].line, 2);
        assert_eq!(out.diagnostics[1].line, 3);
    }

    #[test]
    fn test_spawn_select_program_compiles_on_both_backends() {
        let source = "@c = Stack.new(i64)\n\
                      @spawn < { sleep(50)\n@c < 42 }\n\
                      @spawn pop play\n\
                      @c {}.select( @c { |v| print:v } timeout(200, {|| print:\"timeout\"}) )\n";
        for backend in [Backend::Go, Backend::Rust] {
            let out = compile(
                source,
                &CompileOptions {
                    backend,
                    ..Default::default()
                },
            );
            assert!(
                out.is_success(),
                "{} diagnostics: {:?}",
                backend.tag(),
                out.diagnostics
            );
        }
    }

    #[test]
    fn test_defer_program_compiles_on_both_backends() {
        let source = "func f() { @defer < { print:\"a\" } ; @defer < { print:\"b\" } ; print:\"c\" } ; f()\n";
        for backend in [Backend::Go, Backend::Rust] {
            let out = compile(
                source,
                &CompileOptions {
                    backend,
                    ..Default::default()
                },
            );
            assert!(
                out.is_success(),
                "{} diagnostics: {:?}",
                backend.tag(),
                out.diagnostics
            );
        }
    }

    #[test]
    fn test_consider_program_compiles_on_both_backends() {
        let source = "@s = Stack.new(i64)\n\
                      @s {\n @error < \"bad\"\n}.consider( ok: print:\"ok\" error |e|: print:e )\n";
        for backend in [Backend::Go, Backend::Rust] {
            let out = compile(
                source,
                &CompileOptions {
                    backend,
                    ..Default::default()
                },
            );
            assert!(
                out.is_success(),
                "{} diagnostics: {:?}",
                backend.tag(),
                out.diagnostics
            );
        }
    }

    #[test]
    fn test_compute_program_compiles_on_both_backends() {
        let source = "@s = Stack.new(f64, Hash)\n\
                      @s: set(\"mass\", 2.0) set(\"accel\", 9.8)\n\
                      @s {}.compute({ || var force = self.mass * self.accel\nreturn force })\n";
        for backend in [Backend::Go, Backend::Rust] {
            let out = compile(
                source,
                &CompileOptions {
                    backend,
                    ..Default::default()
                },
            );
            assert!(
                out.is_success(),
                "{} diagnostics: {:?}",
                backend.tag(),
                out.diagnostics
            );
        }
    }
}
