//! Scenario controller: stage sources, rebuild, schedule, await.
//!
//! A [`Scenario`] walks `Fresh -> Staged -> Rebuilt -> Scheduled -> Terminal`.
//! Each step is a method that checks the current state first and returns
//! [`ShlibError::InvalidTransition`] when called out of order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use shlib_core::obs;
use shlib_core::{
    HarnessConfig, LibraryRegistry, PipelineEngine, PipelineRun, Result, RunStatus, ShlibError,
    Snapshot, SourceSet, WorkspaceRoot, METRICS,
};

use crate::outcome::RunOutcome;

/// How a scenario ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    /// The run did not finish before the await deadline.
    TimedOut,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Fresh,
    Staged,
    Rebuilt,
    Scheduled,
    Terminal(Verdict),
}

impl ScenarioState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioState::Fresh => "fresh",
            ScenarioState::Staged => "staged",
            ScenarioState::Rebuilt => "rebuilt",
            ScenarioState::Scheduled => "scheduled",
            ScenarioState::Terminal(Verdict::Passed) => "terminal(passed)",
            ScenarioState::Terminal(Verdict::Failed) => "terminal(failed)",
            ScenarioState::Terminal(Verdict::TimedOut) => "terminal(timed_out)",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioState::Terminal(_))
    }

    fn accepts_sources(&self) -> bool {
        matches!(
            self,
            ScenarioState::Fresh | ScenarioState::Staged | ScenarioState::Rebuilt
        )
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reload-and-run scenario against an engine `E`.
pub struct Scenario<E: PipelineEngine> {
    root: WorkspaceRoot,
    registry: Arc<LibraryRegistry>,
    engine: Arc<E>,
    config: HarnessConfig,
    state: ScenarioState,
    pinned: Option<Arc<Snapshot>>,
    run: Option<PipelineRun>,
}

impl<E: PipelineEngine> fmt::Debug for Scenario<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("root", &self.root)
            .field("state", &self.state)
            .field("generation", &self.registry.generation())
            .field("run", &self.run)
            .finish_non_exhaustive()
    }
}

impl<E: PipelineEngine> Scenario<E> {
    /// New scenario with a fresh temporary workspace and its own registry.
    pub fn new(engine: Arc<E>, config: HarnessConfig) -> Result<Self> {
        Self::with_registry(engine, Arc::new(LibraryRegistry::new()), config)
    }

    /// New scenario publishing into an existing registry.
    pub fn with_registry(
        engine: Arc<E>,
        registry: Arc<LibraryRegistry>,
        config: HarnessConfig,
    ) -> Result<Self> {
        config.validate()?;
        let root = WorkspaceRoot::create(&config.layout)?;
        debug!(root = %root.path().display(), "scenario workspace created");
        Ok(Self {
            root,
            registry,
            engine,
            config,
            state: ScenarioState::Fresh,
            pinned: None,
            run: None,
        })
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn root(&self) -> &WorkspaceRoot {
        &self.root
    }

    pub fn registry(&self) -> &Arc<LibraryRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The scheduled run, if any. Still available after a timeout.
    pub fn run(&self) -> Option<&PipelineRun> {
        self.run.as_ref()
    }

    /// Stage one source file. Allowed until a run is scheduled; an I/O
    /// failure leaves the state unchanged so the caller may retry.
    pub fn stage(&mut self, set: SourceSet, relative: impl AsRef<Path>, content: &str) -> Result<()> {
        self.require(ScenarioState::accepts_sources, "stage")?;
        self.root.stage(set, relative, content)?;
        self.transition(ScenarioState::Staged, "stage");
        Ok(())
    }

    pub fn stage_variable(&mut self, name: &str, source: &str) -> Result<()> {
        let path = self.root.symbol_path(name);
        self.stage(SourceSet::Variables, path, source)
    }

    pub fn stage_class(&mut self, name: &str, source: &str) -> Result<()> {
        let path = self.root.symbol_path(name);
        self.stage(SourceSet::Classes, path, source)
    }

    pub fn stage_resource(&mut self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        self.stage(SourceSet::Resources, path, content)
    }

    /// Mask `secret` in the log of every run the engine schedules from now
    /// on, including runs of other scenarios sharing the engine.
    pub fn register_secret(&self, secret: &str) {
        self.engine.register_secret(secret);
    }

    /// Rebuild the registry from the workspace and pin the new snapshot for
    /// the next [`schedule`](Self::schedule). A compile or scan error ends
    /// the scenario as failed; the registry keeps its previous snapshot.
    pub fn rebuild(&mut self) -> Result<Arc<Snapshot>> {
        self.require(ScenarioState::accepts_sources, "rebuild")?;
        match self.registry.rebuild(&self.root, self.engine.as_ref()) {
            Ok(snapshot) => {
                self.pinned = Some(snapshot.clone());
                self.transition(ScenarioState::Rebuilt, "rebuild");
                Ok(snapshot)
            }
            Err(err) => {
                self.transition(ScenarioState::Terminal(Verdict::Failed), "rebuild");
                Err(err)
            }
        }
    }

    /// Define `script` against the snapshot pinned by the last rebuild and
    /// schedule it. Only allowed straight after a rebuild.
    pub fn schedule(&mut self, script: &str) -> Result<PipelineRun> {
        self.require(|s| *s == ScenarioState::Rebuilt, "schedule")?;
        let Some(snapshot) = self.pinned.clone() else {
            return Err(self.invalid("schedule"));
        };

        let scheduled = self
            .engine
            .define(snapshot, script)
            .and_then(|compiled| self.engine.schedule(&compiled));
        match scheduled {
            Ok(run) => {
                self.run = Some(run.clone());
                self.transition(ScenarioState::Scheduled, "schedule");
                Ok(run)
            }
            Err(err) => {
                self.transition(ScenarioState::Terminal(Verdict::Failed), "schedule");
                Err(err)
            }
        }
    }

    /// [`await_outcome_within`](Self::await_outcome_within) using the
    /// configured `await_timeout_ms`.
    pub async fn await_outcome(&mut self) -> Result<RunOutcome> {
        let timeout = self.config.await_timeout();
        self.await_outcome_within(timeout).await
    }

    /// Wait for the scheduled run and capture its log.
    ///
    /// A run that finishes with `Failure` is still an `Ok` outcome so its log
    /// can be inspected; use [`RunOutcome::into_result`] to turn it into
    /// [`ShlibError::RunFailed`]. On timeout the run is left running and the
    /// scenario ends as [`Verdict::TimedOut`].
    pub async fn await_outcome_within(&mut self, timeout: Duration) -> Result<RunOutcome> {
        self.require(|s| *s == ScenarioState::Scheduled, "await")?;
        let Some(run) = self.run.clone() else {
            return Err(self.invalid("await"));
        };

        match self.engine.await_completion(&run, timeout).await {
            Ok(status) => {
                let verdict = if status == RunStatus::Success {
                    Verdict::Passed
                } else {
                    Verdict::Failed
                };
                let outcome = RunOutcome::capture(&run, status);
                self.transition(ScenarioState::Terminal(verdict), "await");
                Ok(outcome)
            }
            Err(err) => {
                let verdict = match err {
                    ShlibError::Timeout { .. } => Verdict::TimedOut,
                    _ => Verdict::Failed,
                };
                self.transition(ScenarioState::Terminal(verdict), "await");
                Err(err)
            }
        }
    }

    /// Clear the workspace and return to `Fresh`. The registry keeps its
    /// last published snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.root.clear()?;
        self.pinned = None;
        self.run = None;
        self.transition(ScenarioState::Fresh, "reset");
        Ok(())
    }

    /// End the scenario: delete the workspace, or keep it when
    /// `keep_workspace` is set and return where it lives.
    pub fn finish(self) -> Result<Option<PathBuf>> {
        METRICS.flush();
        if self.config.keep_workspace {
            let path = self.root.persist();
            debug!(root = %path.display(), "scenario workspace kept");
            Ok(Some(path))
        } else {
            self.root.destroy()?;
            Ok(None)
        }
    }

    fn require(&self, allowed: impl Fn(&ScenarioState) -> bool, operation: &'static str) -> Result<()> {
        if allowed(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> ShlibError {
        ShlibError::InvalidTransition {
            state: self.state.as_str(),
            operation,
        }
    }

    fn transition(&mut self, to: ScenarioState, operation: &str) {
        if self.state != to {
            obs::emit_scenario_transition(self.state.as_str(), to.as_str(), operation);
        }
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shlib_core::{ErrorKind, ScriptEngine, WorkspaceLayout};

    fn scenario() -> Scenario<ScriptEngine> {
        Scenario::new(Arc::new(ScriptEngine::default()), HarnessConfig::default()).unwrap()
    }

    #[test]
    fn test_starts_fresh() {
        let s = scenario();
        assert_eq!(s.state(), ScenarioState::Fresh);
        assert!(s.run().is_none());
        assert!(s.root().exists());
    }

    #[test]
    fn test_staging_is_reentrant() {
        let mut s = scenario();
        s.stage_variable("a", "field x").unwrap();
        s.stage_variable("b", "field y").unwrap();
        assert_eq!(s.state(), ScenarioState::Staged);
        s.rebuild().unwrap();
        s.stage_resource("notes.txt", "text").unwrap();
        assert_eq!(s.state(), ScenarioState::Staged);
    }

    #[test]
    fn test_schedule_requires_rebuild_after_staging() {
        let mut s = scenario();
        s.stage_variable("a", "field x").unwrap();
        let err = s.schedule("echo 'x'").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(s.state(), ScenarioState::Staged);
    }

    #[test]
    fn test_rejected_path_leaves_state_unchanged() {
        let mut s = scenario();
        let err = s
            .stage(SourceSet::Variables, "../escape.lib", "field x")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(s.state(), ScenarioState::Fresh);
    }

    #[test]
    fn test_compile_error_is_terminal() {
        let mut s = scenario();
        s.stage_variable("bad", "def (").unwrap();
        let err = s.rebuild().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert_eq!(s.state(), ScenarioState::Terminal(Verdict::Failed));

        let err = s.stage_variable("ok", "field x").unwrap_err();
        assert!(matches!(
            err,
            ShlibError::InvalidTransition {
                operation: "stage",
                ..
            }
        ));
    }

    #[test]
    fn test_reset_returns_to_fresh_and_keeps_registry() {
        let mut s = scenario();
        s.stage_variable("keep", "field x").unwrap();
        s.rebuild().unwrap();
        s.stage_variable("bad", "def (").unwrap();
        s.rebuild().unwrap_err();

        s.reset().unwrap();
        assert_eq!(s.state(), ScenarioState::Fresh);
        assert!(s.root().files(SourceSet::Variables).unwrap().is_empty());
        assert!(s.registry().resolve("keep").is_some());
    }

    #[tokio::test]
    async fn test_await_before_schedule_is_invalid() {
        let mut s = scenario();
        let err = s
            .await_outcome_within(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(s.state(), ScenarioState::Fresh);
    }

    #[test]
    fn test_schedule_never_falls_back_to_latest_snapshot() {
        let mut s = scenario();
        s.stage_variable("acme", "field x").unwrap();
        s.rebuild().unwrap();
        s.pinned = None;

        let err = s.schedule("echo acme.x").unwrap_err();
        assert!(matches!(
            err,
            ShlibError::InvalidTransition {
                operation: "schedule",
                ..
            }
        ));
        assert_eq!(s.state(), ScenarioState::Rebuilt);
        assert!(s.run().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = HarnessConfig::default();
        config.layout = WorkspaceLayout {
            classes_dir: "vars".to_string(),
            ..WorkspaceLayout::default()
        };
        let err = Scenario::new(Arc::new(ScriptEngine::default()), config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_finish_removes_workspace_unless_kept() {
        let s = scenario();
        let path = s.root().path().to_path_buf();
        assert_eq!(s.finish().unwrap(), None);
        assert!(!path.exists());

        let config = HarnessConfig {
            keep_workspace: true,
            ..HarnessConfig::default()
        };
        let s = Scenario::new(Arc::new(ScriptEngine::default()), config).unwrap();
        let kept = s.finish().unwrap().unwrap();
        assert!(kept.is_dir());
        std::fs::remove_dir_all(kept).unwrap();
    }
}
