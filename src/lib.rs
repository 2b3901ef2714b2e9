//! logscript — scripted test automation for discrete-event mote simulators.
//!
//! Simulated nodes ("motes") emit textual log lines over simulated time;
//! operators script assertions and reactive behavior against that stream in
//! Lua, using blocking-style macros:
//!
//! ```lua
//! TIMEOUT(1000)
//! log("waiting for hello")
//! WAIT_UNTIL(msg == "hello")
//! test_ok()
//! ```
//!
//! The [`mod@preprocess`] module rewrites the macros into suspendable form and
//! wraps the result in a fixed harness; the [`engine`] module runs the
//! compiled script on a dedicated thread, stepping it exactly once per mote
//! log line or timer through a strict two-gate handshake ([`handshake`]) so
//! the simulator's single-threaded event loop never blocks indefinitely and
//! simulated time never advances mid-slice.
//!
//! The simulation engine itself is external; hosts implement
//! [`Simulation`] and feed events to [`ScriptEngine::on_log_line`] and
//! [`ScriptEngine::on_timer`] from their driver thread.

pub mod engine;
pub mod handshake;
pub mod preprocess;
pub mod sim;
pub mod time;

mod script_thread;
mod session;

// Re-export the main surface.
pub use engine::{CompileError, EngineState, ScriptEngine};
pub use preprocess::{
    preprocess, Preprocessed, SyntaxError, DEFAULT_TIMEOUT_MS, HARNESS_PROLOGUE_LINES,
};
pub use sim::{LogLine, Mode, Mote, ScriptObserver, Simulation, TimerEvent, TimerId};
pub use time::SimTime;
