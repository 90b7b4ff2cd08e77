//! Harness configuration: workspace layout, engine limits and timeouts.
//!
//! Defaults can be overridden from the environment with
//! [`HarnessConfig::from_env`]:
//!
//! | variable | field |
//! |----------|-------|
//! | `SHLIB_AWAIT_TIMEOUT_MS` | `await_timeout_ms` |
//! | `SHLIB_MAX_CONCURRENT_RUNS` | `engine.max_concurrent_runs` |
//! | `SHLIB_KEEP_WORKSPACE` | `keep_workspace` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShlibError};
use crate::script::eval::MAX_CALL_DEPTH;

/// Directory names inside a workspace root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceLayout {
    /// Global variable definitions, one file per symbol.
    pub vars_dir: String,
    /// Supporting class definitions.
    pub classes_dir: String,
    /// Static resources readable with `libraryResource`.
    pub resources_dir: String,
    /// Extension of variable and class source files (without the dot).
    pub extension: String,
}

impl Default for WorkspaceLayout {
    fn default() -> Self {
        Self {
            vars_dir: "vars".to_string(),
            classes_dir: "src".to_string(),
            resources_dir: "resources".to_string(),
            extension: "lib".to_string(),
        }
    }
}

/// A known failure signature. When a run fails and its error matches
/// `pattern`, the run log gets a `NOTICE:` line carrying `message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPattern {
    /// Regular expression, or a plain substring if it does not compile.
    pub pattern: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Limits for the pipeline engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of runs allowed to execute at the same time.
    pub max_concurrent_runs: usize,
    /// Maximum nesting of method calls before a run fails. At most
    /// [`MAX_CALL_DEPTH`].
    pub max_call_depth: usize,
    /// Mirror `echo` output into `tracing` at debug level.
    pub echo_to_tracing: bool,
    /// Checked in order; the first match wins.
    pub error_patterns: Vec<ErrorPattern>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_call_depth: 32,
            echo_to_tracing: true,
            error_patterns: Vec::new(),
        }
    }
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    pub layout: WorkspaceLayout,
    pub engine: EngineConfig,
    /// Default deadline for awaiting a run (milliseconds).
    pub await_timeout_ms: u64,
    /// Keep the scenario workspace on disk after the scenario finishes.
    pub keep_workspace: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            layout: WorkspaceLayout::default(),
            engine: EngineConfig::default(),
            await_timeout_ms: 30_000,
            keep_workspace: false,
        }
    }
}

impl HarnessConfig {
    /// Defaults overlaid with `SHLIB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through
    /// `lookup`, so tests do not have to touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SHLIB_AWAIT_TIMEOUT_MS") {
            config.await_timeout_ms = parse_var("SHLIB_AWAIT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("SHLIB_MAX_CONCURRENT_RUNS") {
            config.engine.max_concurrent_runs = parse_var("SHLIB_MAX_CONCURRENT_RUNS", &raw)?;
        }
        if let Some(raw) = lookup("SHLIB_KEEP_WORKSPACE") {
            config.keep_workspace = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(ShlibError::Config(format!(
                        "SHLIB_KEEP_WORKSPACE must be a boolean, got {other:?}"
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the default await deadline.
    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    /// Reject configurations the engine or workspace store cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_runs == 0 {
            return Err(ShlibError::Config(
                "engine.max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if self.engine.max_call_depth == 0 || self.engine.max_call_depth > MAX_CALL_DEPTH {
            return Err(ShlibError::Config(format!(
                "engine.max_call_depth must be between 1 and {MAX_CALL_DEPTH}, got {}",
                self.engine.max_call_depth
            )));
        }

        let layout = &self.layout;
        let dirs = [&layout.vars_dir, &layout.classes_dir, &layout.resources_dir];
        for dir in dirs {
            if dir.is_empty() || dir.contains(['/', '\\']) || dir == ".." || dir == "." {
                return Err(ShlibError::Config(format!(
                    "layout directory {dir:?} must be a single path component"
                )));
            }
        }
        if dirs[0] == dirs[1] || dirs[0] == dirs[2] || dirs[1] == dirs[2] {
            return Err(ShlibError::Config(
                "layout directories must be distinct".to_string(),
            ));
        }
        if layout.extension.is_empty() || layout.extension.contains(['.', '/']) {
            return Err(ShlibError::Config(format!(
                "layout extension {:?} must be non-empty and dot-free",
                layout.extension
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ShlibError::Config(format!("{key} has invalid value {raw:?}")))
}
