//! Compiler configuration
//!
//! Options come from two places: CLI flags and an optional `ual.toml`
//! project file. Explicit flags win; the file provides defaults.
//!
//! ```toml
//! [build]
//! backend = "rust"
//! optimize = true
//! no-forth = false
//! ```

use serde::Deserialize;
use std::path::Path;

/// Code generation targets, identified by a string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Emit a self-contained Go program
    #[default]
    Go,
    /// Emit a Rust program linking against `ual-runtime`
    Rust,
}

impl Backend {
    pub fn from_tag(tag: &str) -> Result<Backend, String> {
        match tag {
            "go" => Ok(Backend::Go),
            "rust" => Ok(Backend::Rust),
            other => Err(format!(
                "unknown backend '{}' (expected 'go' or 'rust')",
                other
            )),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Backend::Go => "go",
            Backend::Rust => "rust",
        }
    }
}

/// Options for one `compile()` invocation.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub backend: Backend,
    /// Disable the implicit Forth stacks (`dstack`, `rstack`, `bool`,
    /// `error`); bare stack operations become errors.
    pub no_forth: bool,
    /// Store scalar locals in native cells instead of the stack-resident
    /// slot scheme.
    pub optimize: bool,
}

/// On-disk shape of `ual.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub build: BuildSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSection {
    pub backend: Option<String>,
    #[serde(rename = "no-forth")]
    pub no_forth: Option<bool>,
    pub optimize: Option<bool>,
}

impl ProjectConfig {
    pub fn parse(content: &str) -> Result<ProjectConfig, String> {
        toml::from_str(content).map_err(|e| format!("invalid ual.toml: {}", e))
    }

    /// Load `ual.toml` from `dir` if present.
    pub fn load_from(dir: &Path) -> Result<Option<ProjectConfig>, String> {
        let path = dir.join("ual.toml");
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&content).map(Some)
    }

    /// Fold the file's defaults into `options`, keeping anything the CLI
    /// set explicitly (`explicit_*` flags say which ones it did).
    pub fn apply_defaults(
        &self,
        options: &mut CompileOptions,
        explicit_backend: bool,
    ) -> Result<(), String> {
        if !explicit_backend {
            if let Some(tag) = &self.build.backend {
                options.backend = Backend::from_tag(tag)?;
            }
        }
        if let Some(v) = self.build.no_forth {
            options.no_forth = options.no_forth || v;
        }
        if let Some(v) = self.build.optimize {
            options.optimize = options.optimize || v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_tags() {
        assert_eq!(Backend::from_tag("go").unwrap(), Backend::Go);
        assert_eq!(Backend::from_tag("rust").unwrap(), Backend::Rust);
        assert!(Backend::from_tag("zig").is_err());
        assert_eq!(Backend::Rust.tag(), "rust");
    }

    #[test]
    fn test_parse_project_config() {
        let config = ProjectConfig::parse(
            "[build]\nbackend = \"rust\"\nno-forth = true\noptimize = true\n",
        )
        .unwrap();
        assert_eq!(config.build.backend.as_deref(), Some("rust"));
        assert_eq!(config.build.no_forth, Some(true));
        assert_eq!(config.build.optimize, Some(true));
    }

    #[test]
    fn test_defaults_do_not_override_explicit_backend() {
        let config =
            ProjectConfig::parse("[build]\nbackend = \"rust\"\n").unwrap();
        let mut options = CompileOptions {
            backend: Backend::Go,
            ..Default::default()
        };
        config.apply_defaults(&mut options, true).unwrap();
        assert_eq!(options.backend, Backend::Go);
        config.apply_defaults(&mut options, false).unwrap();
        assert_eq!(options.backend, Backend::Rust);
    }

    #[test]
    fn test_empty_config_tolerated() {
        let config = ProjectConfig::parse("").unwrap();
        assert!(config.build.backend.is_none());
    }
}
