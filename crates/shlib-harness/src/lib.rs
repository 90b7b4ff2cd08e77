//! shlib harness
//!
//! Drives reload-and-run scenarios for pipeline shared libraries: stage
//! library sources into a scratch workspace, rebuild the registry, schedule a
//! pipeline script against the freshly pinned snapshot and check its outcome.
//!
//! ```ignore
//! let engine = Arc::new(ScriptEngine::default());
//! let mut scenario = Scenario::new(engine, HarnessConfig::from_env()?)?;
//! scenario.stage_variable("acme", ACME_SOURCE)?;
//! scenario.rebuild()?;
//! scenario.schedule("acme.name = 'acmeName'\necho acme.name")?;
//! let outcome = scenario.await_outcome().await?.into_result()?;
//! assert!(outcome.log_contains("acmeName"));
//! ```

pub mod outcome;
pub mod scenario;

pub use outcome::{Expectation, ExpectationReport, RunOutcome};
pub use scenario::{Scenario, ScenarioState, Verdict};

pub use shlib_core::{
    ErrorKind, HarnessConfig, PipelineEngine, PipelineRun, RunStatus, ScriptEngine, ShlibError,
    SourceSet,
};
