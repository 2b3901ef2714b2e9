//! State shared between the driver and script threads for one activation.
//!
//! Everything here is written under the handshake's alternation: the staged
//! log variables are written only by the driver thread and read only by the
//! script thread between a release and the following acquire, so the mutexes
//! are rendezvous formality rather than contention points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::sim::Mote;

// ── Verdicts and outcomes ─────────────────────────────────────────────────────

/// The success/failure outcome a script reports for the run under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Failed,
}

/// Why a session ended, as recorded by the script thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `test_ok()` / `test_failed()` was called (including from the timeout
    /// routine).
    Verdict(Verdict),
    /// The script raised an error other than the stop sentinel; the rendered
    /// cause chain is kept for the operator.
    Error(String),
}

// ── Staged log variables ──────────────────────────────────────────────────────

/// The variables published into script scope before each resume.
#[derive(Debug, Clone, Default)]
pub struct LogVars {
    /// Emitting mote, or `None` for an injected message.
    pub mote: Option<Mote>,
    /// Simulated time of the event, microseconds.
    pub time_us: u64,
    /// The log line text.
    pub msg: String,
}

// ── Script-to-driver commands ─────────────────────────────────────────────────

/// Requests the script makes of the coordinator.  Drained by the driver after
/// each handshake step, so the scheduling itself happens on the driver thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCommand {
    GenerateMessage { delay_ms: u64, text: String },
}

// ── Shared ────────────────────────────────────────────────────────────────────

/// Shared per-session state.
#[derive(Debug, Default)]
pub struct Shared {
    /// Set by `deactivate`; observed by the script at its next suspend point.
    pub shutdown: AtomicBool,
    /// Set when the Timeout Timer fires; readable by the script as `TIMEOUT`.
    pub timed_out: AtomicBool,
    /// Ensures the timeout routine is dispatched exactly once.
    timeout_delivered: AtomicBool,
    /// Variables staged by the driver for the next resume.
    pub vars: Mutex<LogVars>,
    /// First recorded outcome wins; later ones are dropped.
    outcome: Mutex<Option<Outcome>>,
}

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the session outcome.  Only the first record sticks.
    pub fn record_outcome(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    /// Take the recorded outcome, if any.
    pub fn take_outcome(&self) -> Option<Outcome> {
        self.outcome.lock().unwrap().take()
    }

    /// True exactly once after the timed-out flag is set: the wake that sees
    /// it runs the timeout routine, later wakes do not re-run it.
    pub fn take_timeout(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
            && !self.timeout_delivered.swap(true, Ordering::SeqCst)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
