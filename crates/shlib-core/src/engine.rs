//! Pipeline engine: define scripts against a pinned snapshot and run them.
//!
//! [`ScriptEngine`] is both the compiler the registry delegates to during a
//! rebuild and the executor of pipeline runs. Runs execute on tokio tasks
//! gated by a semaphore sized by [`EngineConfig::max_concurrent_runs`], and
//! publish their status on a `watch` channel.
//!
//! Secrets registered with [`PipelineEngine::register_secret`] are replaced
//! with [`SECRET_MASK`] in every log line of runs scheduled afterwards.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::config::{EngineConfig, ErrorPattern};
use crate::digest::Digest;
use crate::error::{Result, ShlibError};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::{CompiledHandle, LibraryCompiler, Snapshot, SymbolKind};
use crate::script::{self, free_symbols, Console, Interpreter, Script, SymbolUse};

/// Symbol reported in compile errors for the pipeline script itself.
pub const SCRIPT_SYMBOL: &str = "<script>";

/// Replacement for registered secrets in run logs.
pub const SECRET_MASK: &str = "****";

/// Status of a pipeline run. Moves `Pending -> Running -> Success|Failure`
/// and never leaves a terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline script whose free symbols resolved against `snapshot`.
/// Runs scheduled from it use that snapshot and no other.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    source: Arc<str>,
    program: Arc<Script>,
    snapshot: Arc<Snapshot>,
    digest: Digest,
    symbols: Vec<String>,
}

impl CompiledScript {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.generation()
    }

    /// Digest of the script text.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Library symbols the script references directly, in order of first use.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}

/// Append-only log of one run. Lines are masked before they are stored.
struct RunLog {
    lines: Mutex<Vec<String>>,
    secrets: Vec<String>,
    echo_to_tracing: bool,
}

impl RunLog {
    /// `secrets` must be ordered longest first.
    fn new(secrets: Vec<String>, echo_to_tracing: bool) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            secrets,
            echo_to_tracing,
        }
    }

    fn mask(&self, line: String) -> String {
        self.secrets.iter().fold(line, |line, secret| {
            if line.contains(secret.as_str()) {
                line.replace(secret.as_str(), SECRET_MASK)
            } else {
                line
            }
        })
    }

    fn push(&self, line: String) {
        self.store(self.mask(line));
    }

    fn store(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Console for RunLog {
    fn echo(&self, line: String) {
        let line = self.mask(line);
        if self.echo_to_tracing {
            debug!(event = "run.echo", line = %line);
        }
        self.store(line);
    }
}

/// Handle to a scheduled run. Cheap to clone; every clone observes the same
/// status and log.
#[derive(Clone)]
pub struct PipelineRun {
    id: Uuid,
    scheduled_at: DateTime<Utc>,
    generation: u64,
    script: Arc<str>,
    log: Arc<RunLog>,
    status: watch::Receiver<RunStatus>,
}

impl fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRun")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl PipelineRun {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    /// Generation of the snapshot this run is pinned to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Log lines captured so far. Fixed once the status is terminal.
    pub fn log(&self) -> Vec<String> {
        self.log.lines()
    }

    /// JSON summary of the run.
    pub fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.id.to_string(),
            "status": self.status(),
            "generation": self.generation,
            "scheduled_at": self.scheduled_at.to_rfc3339(),
            "log": self.log(),
        })
    }
}

/// Contract the harness needs from a pipeline engine.
#[async_trait]
pub trait PipelineEngine: LibraryCompiler {
    /// Parse `source` and resolve its free symbols against `snapshot`.
    ///
    /// # Errors
    /// - [`ShlibError::Compile`] with symbol [`SCRIPT_SYMBOL`] for syntax errors.
    /// - [`ShlibError::UnresolvedSymbol`] for the first symbol `snapshot`
    ///   does not define.
    fn define(&self, snapshot: Arc<Snapshot>, source: &str) -> Result<CompiledScript>;

    /// Start a run of `script` and return without waiting for it.
    fn schedule(&self, script: &CompiledScript) -> Result<PipelineRun>;

    /// Wait until `run` is terminal. On timeout the run keeps going and
    /// [`ShlibError::Timeout`] is returned.
    async fn await_completion(&self, run: &PipelineRun, timeout: Duration) -> Result<RunStatus>;

    fn log(&self, run: &PipelineRun) -> Vec<String> {
        run.log()
    }

    /// Mask `secret` in the logs of runs scheduled from now on.
    fn register_secret(&self, secret: &str);
}

/// [`ErrorPattern`] with its expression compiled once.
struct ErrorMatcher {
    regex: Option<Regex>,
    pattern: ErrorPattern,
}

impl ErrorMatcher {
    fn new(pattern: &ErrorPattern) -> Self {
        Self {
            regex: Regex::new(&pattern.pattern).ok(),
            pattern: pattern.clone(),
        }
    }

    fn matches(&self, message: &str) -> bool {
        let message = message.trim();
        match &self.regex {
            Some(regex) => regex.is_match(message),
            None => message.contains(self.pattern.pattern.trim()),
        }
    }

    fn notice(&self) -> String {
        match &self.pattern.category {
            Some(category) => format!("NOTICE: {} [{category}]", self.pattern.message),
            None => format!("NOTICE: {}", self.pattern.message),
        }
    }
}

/// Engine for the built-in script language.
pub struct ScriptEngine {
    config: EngineConfig,
    workers: Arc<Semaphore>,
    matchers: Arc<Vec<ErrorMatcher>>,
    secrets: RwLock<Vec<String>>,
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ScriptEngine")
            .field("max_concurrent_runs", &self.config.max_concurrent_runs)
            .field("max_call_depth", &self.config.max_call_depth)
            .field("error_patterns", &self.matchers.len())
            .field("secrets", &secrets)
            .finish_non_exhaustive()
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ScriptEngine {
    pub fn new(config: EngineConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        let matchers: Arc<Vec<ErrorMatcher>> =
            Arc::new(config.error_patterns.iter().map(ErrorMatcher::new).collect());
        Self {
            config,
            workers,
            matchers,
            secrets: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl LibraryCompiler for ScriptEngine {
    fn compile(
        &self,
        _name: &str,
        _kind: SymbolKind,
        source: &str,
    ) -> std::result::Result<CompiledHandle, String> {
        let unit = script::parse_unit(source).map_err(|e| e.to_string())?;
        Ok(Arc::new(unit))
    }
}

#[async_trait]
impl PipelineEngine for ScriptEngine {
    fn define(&self, snapshot: Arc<Snapshot>, source: &str) -> Result<CompiledScript> {
        let program = script::parse_script(source).map_err(|e| ShlibError::Compile {
            symbol: SCRIPT_SYMBOL.to_string(),
            cause: e.to_string(),
        })?;

        let mut symbols = Vec::new();
        for free in free_symbols(&program) {
            let resolved = match free.usage {
                SymbolUse::Variable => snapshot
                    .resolve_kind(&free.name, SymbolKind::Variable)
                    .is_some(),
                SymbolUse::Class => snapshot
                    .resolve_kind(&free.name, SymbolKind::Class)
                    .is_some(),
                SymbolUse::Callable => {
                    if snapshot
                        .resolve_kind(&free.name, SymbolKind::Variable)
                        .is_some()
                    {
                        true
                    } else if script::is_builtin_step(&free.name) {
                        continue;
                    } else {
                        false
                    }
                }
            };
            if !resolved {
                return Err(ShlibError::UnresolvedSymbol { name: free.name });
            }
            if !symbols.contains(&free.name) {
                symbols.push(free.name);
            }
        }

        Ok(CompiledScript {
            digest: Digest::compute(source.as_bytes()),
            source: Arc::from(source),
            program: Arc::new(program),
            snapshot,
            symbols,
        })
    }

    fn schedule(&self, script: &CompiledScript) -> Result<PipelineRun> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ShlibError::Config(format!("scheduling needs a tokio runtime: {e}")))?;

        let id = Uuid::new_v4();
        let generation = script.generation();
        let (status_tx, status_rx) = watch::channel(RunStatus::Pending);
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let log = Arc::new(RunLog::new(secrets, self.config.echo_to_tracing));
        let run = PipelineRun {
            id,
            scheduled_at: Utc::now(),
            generation,
            script: script.source.clone(),
            log: log.clone(),
            status: status_rx,
        };

        let interpreter = Interpreter::new(
            script.snapshot.clone(),
            log.clone(),
            self.config.max_call_depth,
        );
        let program = script.program.clone();
        let workers = self.workers.clone();
        let matchers = self.matchers.clone();
        let run_id = id.to_string();
        let span = obs::run_span(&run_id, generation);

        METRICS.inc_runs_scheduled();
        obs::emit_run_scheduled(&run_id, generation);

        handle.spawn(
            async move {
                let outcome = match workers.acquire_owned().await {
                    Ok(_permit) => {
                        status_tx.send_replace(RunStatus::Running);
                        let started = Instant::now();
                        let outcome = interpreter.run(&program).await;
                        (outcome, started.elapsed())
                    }
                    Err(_) => (
                        Err(script::RuntimeError::Abort(
                            "engine worker pool closed".to_string(),
                        )),
                        Duration::ZERO,
                    ),
                };

                let (result, elapsed) = outcome;
                let success = match result {
                    Ok(()) => true,
                    Err(err) => {
                        let message = err.to_string();
                        log.push(format!("ERROR: {message}"));
                        if let Some(matcher) = matchers.iter().find(|m| m.matches(&message)) {
                            log.push(matcher.notice());
                        }
                        false
                    }
                };
                log.push(format!(
                    "Finished: {}",
                    if success { "SUCCESS" } else { "FAILURE" }
                ));

                METRICS.inc_runs_finished(success);
                obs::emit_run_finished(&run_id, elapsed.as_millis() as u64, log.len(), success);
                status_tx.send_replace(if success {
                    RunStatus::Success
                } else {
                    RunStatus::Failure
                });
            }
            .instrument(span),
        );

        Ok(run)
    }

    async fn await_completion(&self, run: &PipelineRun, timeout: Duration) -> Result<RunStatus> {
        let mut status = run.status.clone();
        let waited = tokio::time::timeout(timeout, async move {
            status.wait_for(RunStatus::is_terminal).await.map(|s| *s)
        })
        .await;

        match waited {
            Ok(Ok(status)) => Ok(status),
            // The task went away without publishing a terminal status.
            Ok(Err(_)) => Err(ShlibError::RunFailed { log: run.log() }),
            Err(_) => {
                let limit_ms = timeout.as_millis() as u64;
                METRICS.inc_await_timeouts();
                obs::emit_await_timed_out(&run.id.to_string(), limit_ms, run.status().as_str());
                Err(ShlibError::Timeout {
                    run_id: run.id.to_string(),
                    limit_ms,
                })
            }
        }
    }

    fn register_secret(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        let mut secrets = self.secrets.write().unwrap_or_else(PoisonError::into_inner);
        if !secrets.iter().any(|s| s == secret) {
            secrets.push(secret.to_string());
            // Longest first, so a secret containing another is masked whole.
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }
}
