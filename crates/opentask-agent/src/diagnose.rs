//! Diagnostics seam.
//!
//! Telemetry and update-check flows live outside the core; the task loop
//! only needs somewhere to hand the run history of a finished task so
//! execution errors can be reported.  The default implementation drops
//! everything.

use opentask_exec::RunRecord;

/// Collaborator that receives execution-error reports when a task finishes.
pub trait Diagnostics: Send + Sync {
    /// Called from `done()` with the task's full run history.
    fn report_code_error(&self, history: &[RunRecord]);
}

/// Diagnostics sink that discards all reports.
#[derive(Debug, Default)]
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {
    fn report_code_error(&self, _history: &[RunRecord]) {}
}
