//! Structured observability hooks for workspace, registry and run events.
//!
//! Every emitter logs one `tracing` event with an `event = "<area>.<what>"`
//! field so log pipelines can filter on it. Verbosity follows `RUST_LOG`
//! (see [`crate::telemetry::init_tracing`]).

use tracing::{info, warn};

use crate::error::ShlibError;

/// Span tagging everything a pipeline run logs with its id and pinned
/// snapshot generation.
pub fn run_span(run_id: &str, generation: u64) -> tracing::Span {
    tracing::info_span!("shlib.run", run_id = %run_id, generation = generation)
}

/// Emit event: a source file was written into a workspace.
pub fn emit_source_staged(set: &str, path: &str, bytes: usize) {
    tracing::debug!(event = "workspace.staged", set = %set, path = %path, bytes = bytes);
}

/// Emit event: a rebuild published a new snapshot.
pub fn emit_rebuild_published(generation: u64, symbols: usize, digest: &str) {
    info!(
        event = "registry.rebuilt",
        generation = generation,
        symbols = symbols,
        digest = %digest,
    );
}

/// Emit event: a rebuild failed and the previous snapshot stays active
/// (warning level).
pub fn emit_rebuild_rejected(error: &ShlibError) {
    warn!(event = "registry.rebuild_rejected", kind = %error.kind(), error = %error);
}

/// Emit event: a run was handed to the worker pool.
pub fn emit_run_scheduled(run_id: &str, generation: u64) {
    info!(event = "run.scheduled", run_id = %run_id, generation = generation);
}

/// Emit event: a run reached a terminal status.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, log_lines: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        log_lines = log_lines,
        success = success,
    );
}

/// Emit event: a caller stopped waiting for a run (warning level).
pub fn emit_await_timed_out(run_id: &str, limit_ms: u64, status: &str) {
    warn!(event = "run.await_timed_out", run_id = %run_id, limit_ms = limit_ms, status = %status);
}

/// Emit event: a scenario moved between controller states.
pub fn emit_scenario_transition(from: &str, to: &str, operation: &str) {
    info!(event = "scenario.transition", from = %from, to = %to, operation = %operation);
}
