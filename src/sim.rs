//! Collaborator interfaces to the surrounding simulator.
//!
//! The simulation engine itself — event queue, mote models, radio — lives
//! outside this crate.  The script engine needs exactly four things from it:
//! a monotonic simulated clock, a way to schedule a wake-up at an absolute
//! future simulated time, control over whether mote log lines are fed to the
//! engine, and a way to stop the run.  [`Simulation`] bundles those.
//!
//! Timer wake-ups scheduled through [`Simulation::schedule`] must be delivered
//! back on the driver thread via
//! [`ScriptEngine::on_timer`](crate::engine::ScriptEngine::on_timer), so they
//! participate in the same driver/script alternation as log lines instead of
//! racing it.

use crate::time::SimTime;

// ── Mode ──────────────────────────────────────────────────────────────────────

/// How the host is being run.
///
/// In [`Mode::Unattended`] (batch/CI) runs, a test verdict or a fatal script
/// error terminates the host process through [`Simulation::exit`]; in
/// [`Mode::Attended`] runs the outcome is only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Attended,
    Unattended,
}

// ── Motes and log lines ───────────────────────────────────────────────────────

/// A simulated network node, as seen by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mote {
    pub id: i64,
    pub name: String,
}

/// One line of textual output, either emitted by a mote or injected through
/// `generate_message` (in which case `mote` is `None`).
#[derive(Debug, Clone)]
pub struct LogLine {
    pub mote: Option<Mote>,
    pub time: SimTime,
    pub msg: String,
}

// ── Timers ────────────────────────────────────────────────────────────────────

/// Handle to a scheduled wake-up, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// A wake-up the engine asked the simulator to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The session's one-shot timeout deadline.
    Timeout,
    /// The repeating progress/ETA report tick.
    Progress,
    /// A synthetic log line requested by `generate_message`.
    Message(String),
}

// ── Simulation ────────────────────────────────────────────────────────────────

/// What the script engine requires of the surrounding simulator.
///
/// All methods are called from the driver thread only.
pub trait Simulation: Send + Sync {
    /// Current simulated time.  Must be monotonic.
    fn now(&self) -> SimTime;

    /// Schedule `event` for delivery at absolute simulated time `at`.
    ///
    /// The host must route the event back through
    /// [`ScriptEngine::on_timer`](crate::engine::ScriptEngine::on_timer) on
    /// the driver thread when the clock reaches `at`.
    fn schedule(&self, at: SimTime, event: TimerEvent) -> TimerId;

    /// Cancel a previously scheduled wake-up.  Unknown or already-fired ids
    /// are ignored.
    fn cancel(&self, timer: TimerId);

    /// Start or stop feeding mote log lines to
    /// [`ScriptEngine::on_log_line`](crate::engine::ScriptEngine::on_log_line).
    fn set_log_feed(&self, enabled: bool);

    /// Stop the simulation run (a verdict was reached or the script failed).
    fn stop(&self);

    /// Terminate the host process with `status`.  Only invoked in
    /// [`Mode::Unattended`]; a real host calls `std::process::exit`.
    fn exit(&self, status: i32);
}

// ── Script output ─────────────────────────────────────────────────────────────

/// Sink for the script's `log(...)` output and the final verdict lines.
///
/// Called from the script thread, but only while the driver thread is blocked
/// in the handshake, so implementations see strictly serialized calls.
pub trait ScriptObserver: Send + Sync {
    fn script_log(&self, line: &str);
}

impl<F> ScriptObserver for F
where
    F: Fn(&str) + Send + Sync,
{
    fn script_log(&self, line: &str) {
        self(line)
    }
}
