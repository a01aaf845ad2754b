//! ual compiler CLI
//!
//! A thin driver over the library `compile()` entry point: argument
//! parsing, file I/O, and diagnostic rendering live here and nowhere
//! else. Any nonempty diagnostic list exits nonzero.

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use ualc::{Backend, CompileOptions, ProjectConfig};

#[derive(ClapParser)]
#[command(name = "ualc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "ual compiler - translate .ual programs to Go or Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Go,
    Rust,
}

impl BackendArg {
    fn to_backend(self) -> Backend {
        match self {
            BackendArg::Go => Backend::Go,
            BackendArg::Rust => Backend::Rust,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a .ual file and write the generated source next to it
    Build {
        /// Input .ual source file
        input: PathBuf,

        /// Output path (defaults to the input with the target extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Code generation target
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Disable the implicit Forth stacks
        #[arg(long = "no-forth")]
        no_forth: bool,

        /// Store scalar locals in native cells
        #[arg(long)]
        optimize: bool,
    },

    /// Parse and analyze without writing any output
    Check {
        /// Input .ual source file
        input: PathBuf,

        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        #[arg(long = "no-forth")]
        no_forth: bool,

        #[arg(long)]
        optimize: bool,
    },

    /// Compile and print the generated source to stdout
    Emit {
        /// Input .ual source file
        input: PathBuf,

        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        #[arg(long = "no-forth")]
        no_forth: bool,

        #[arg(long)]
        optimize: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            backend,
            no_forth,
            optimize,
        } => {
            let options = resolve_options(&input, backend, no_forth, optimize);
            let code = run_compile(&input, &options);
            let output = output.unwrap_or_else(|| default_output(&input, options.backend));
            if let Err(e) = std::fs::write(&output, code) {
                eprintln!("ualc: failed to write {}: {}", output.display(), e);
                process::exit(1);
            }
        }
        Commands::Check {
            input,
            backend,
            no_forth,
            optimize,
        } => {
            let options = resolve_options(&input, backend, no_forth, optimize);
            run_compile(&input, &options);
        }
        Commands::Emit {
            input,
            backend,
            no_forth,
            optimize,
        } => {
            let options = resolve_options(&input, backend, no_forth, optimize);
            let code = run_compile(&input, &options);
            print!("{}", code);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ualc", &mut io::stdout());
        }
    }
}

/// CLI flags win; an `ual.toml` next to the input provides defaults.
fn resolve_options(
    input: &Path,
    backend: Option<BackendArg>,
    no_forth: bool,
    optimize: bool,
) -> CompileOptions {
    let mut options = CompileOptions {
        backend: backend.map(BackendArg::to_backend).unwrap_or_default(),
        no_forth,
        optimize,
    };
    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    match ProjectConfig::load_from(dir) {
        Ok(Some(config)) => {
            if let Err(e) = config.apply_defaults(&mut options, backend.is_some()) {
                eprintln!("ualc: {}", e);
                process::exit(1);
            }
        }
        Ok(None) => {}
        Err(e) => {
            eprintln!("ualc: {}", e);
            process::exit(1);
        }
    }
    options
}

fn default_output(input: &Path, backend: Backend) -> PathBuf {
    let ext = match backend {
        Backend::Go => "go",
        Backend::Rust => "rs",
    };
    input.with_extension(ext)
}

/// Compile one file, printing diagnostics as `file:line: message`.
/// Exits nonzero when the diagnostic list is nonempty.
fn run_compile(input: &Path, options: &CompileOptions) -> String {
    let source = match std::fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ualc: failed to read {}: {}", input.display(), e);
            process::exit(1);
        }
    };
    let out = ualc::compile(&source, options);
    if !out.diagnostics.is_empty() {
        let file = input.display().to_string();
        for d in &out.diagnostics {
            eprintln!("{}", d.render(&file));
        }
        process::exit(1);
    }
    out.code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_default_output_extension_per_backend() {
        assert_eq!(
            default_output(Path::new("demo.ual"), Backend::Go),
            PathBuf::from("demo.go")
        );
        assert_eq!(
            default_output(Path::new("demo.ual"), Backend::Rust),
            PathBuf::from("demo.rs")
        );
    }

    #[test]
    fn test_resolve_options_reads_project_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = std::fs::File::create(dir.path().join("ual.toml")).unwrap();
        writeln!(config, "[build]\nbackend = \"rust\"\noptimize = true").unwrap();
        let input = dir.path().join("demo.ual");
        std::fs::write(&input, "@i = Stack.new(i64)\n").unwrap();

        let options = resolve_options(&input, None, false, false);
        assert_eq!(options.backend, Backend::Rust);
        assert!(options.optimize);

        // An explicit flag beats the file default.
        let options = resolve_options(&input, Some(BackendArg::Go), false, false);
        assert_eq!(options.backend, Backend::Go);
    }
}
