//! shlib core library
//!
//! Building blocks for reload-and-run tests of pipeline shared libraries:
//!
//! - [`workspace`]: per-scenario directory tree of variable, class and
//!   resource sources
//! - [`registry`]: rebuild-then-swap catalog of compiled library symbols
//! - [`engine`]: defines scripts against a pinned snapshot and runs them
//! - [`script`]: the scripting language both libraries and pipelines use

pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod script;
pub mod telemetry;
pub mod workspace;

pub use config::{EngineConfig, ErrorPattern, HarnessConfig, WorkspaceLayout};
pub use digest::{Digest, InvalidDigest};
pub use engine::{
    CompiledScript, PipelineEngine, PipelineRun, RunStatus, ScriptEngine, SECRET_MASK,
};
pub use error::{ErrorKind, Result, ShlibError};
pub use metrics::METRICS;
pub use registry::{
    CompiledHandle, LibraryCompiler, LibraryDefinition, LibraryRegistry, Snapshot, SymbolKind,
};
pub use workspace::{SourceFile, SourceSet, WorkspaceRoot};

/// Crate version, for reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
