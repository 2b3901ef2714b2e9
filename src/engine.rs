//! The execution coordinator.
//!
//! [`ScriptEngine`] owns the lifecycle of one active test script: it compiles
//! preprocessed source, starts the script on its own thread, steps it exactly
//! once per relevant event or timer, and tears it down on completion, timeout,
//! shutdown, or fatal error.
//!
//! All methods run on the simulator's driver thread.  Each external event —
//! a mote log line, the timeout deadline, an injected message — costs exactly
//! one suspend/resume round trip through the handshake, so the script can
//! never observe simulated time advancing mid-slice.
//!
//! Per-session state machine:
//!
//! ```text
//! Idle -> Starting -> Running -> {Completed | TimedOut | Killed | Errored} -> Idle
//! ```

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mlua::Lua;

use crate::handshake::{self, DriverGates, GateStatus};
use crate::preprocess::{preprocess, SyntaxError, DEFAULT_TIMEOUT_MS};
use crate::script_thread;
use crate::session::{Outcome, ScriptCommand, Shared, Verdict};
use crate::sim::{LogLine, Mode, ScriptObserver, Simulation, TimerEvent, TimerId};
use crate::time::SimTime;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why [`ScriptEngine::compile`] rejected a script.
#[derive(Debug)]
pub enum CompileError {
    /// Malformed or duplicated macro directive, caught by the preprocessor
    /// before any thread or Lua state exists.
    Syntax(SyntaxError),
    /// The preprocessed chunk is not valid Lua.
    Script(mlua::Error),
    /// A session is active; the program it runs cannot be swapped out.
    SessionActive,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Syntax(e) => write!(f, "script syntax error: {e}"),
            CompileError::Script(e) => write!(f, "script failed to compile: {e}"),
            CompileError::SessionActive => {
                write!(f, "cannot compile while a script session is active")
            }
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Syntax(e) => Some(e),
            CompileError::Script(e) => Some(e),
            CompileError::SessionActive => None,
        }
    }
}

impl From<SyntaxError> for CompileError {
    fn from(e: SyntaxError) -> Self {
        CompileError::Syntax(e)
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Coordinator state, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No session.
    Idle,
    /// Script thread created, first handshake not yet complete.
    Starting,
    /// One suspend/resume round trip per external event.
    Running,
    /// A verdict was reported from the script body.
    Completed,
    /// The Timeout Timer fired; the on-timeout block ran.
    TimedOut,
    /// Deactivated by the coordinator or operator.
    Killed,
    /// The script raised an error other than the stop sentinel.
    Errored,
}

// ── Session ───────────────────────────────────────────────────────────────────

struct CompiledScript {
    chunk: String,
    timeout_ms: Option<u64>,
}

/// Live state of one activation.
struct Session {
    thread: Option<JoinHandle<()>>,
    gates: DriverGates,
    shared: Arc<Shared>,
    commands: Receiver<ScriptCommand>,
    timeout_timer: TimerId,
    progress_timer: TimerId,
    progress_interval: Duration,
    deadline: Duration,
    started_sim: SimTime,
    started_wall: Instant,
}

// ── ScriptEngine ──────────────────────────────────────────────────────────────

/// Coordinator for one active test script.
pub struct ScriptEngine {
    sim: Arc<dyn Simulation>,
    observer: Arc<dyn ScriptObserver>,
    mode: Mode,
    compiled: Option<CompiledScript>,
    session: Option<Session>,
    state: EngineState,
}

impl ScriptEngine {
    pub fn new(sim: Arc<dyn Simulation>, observer: Arc<dyn ScriptObserver>, mode: Mode) -> Self {
        Self {
            sim,
            observer,
            mode,
            compiled: None,
            session: None,
            state: EngineState::Idle,
        }
    }

    /// Current coordinator state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether a session is live.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    // ── compile ───────────────────────────────────────────────────────────────

    /// Preprocess and compile script source, replacing any previously
    /// compiled program.
    pub fn compile(&mut self, source: &str) -> Result<(), CompileError> {
        if self.session.is_some() {
            return Err(CompileError::SessionActive);
        }
        let pre = preprocess(source)?;

        // Load-only syntax check on a throwaway state; the chunk executes
        // only on the script thread's own Lua.
        let lua = Lua::new();
        lua.load(pre.program.as_str())
            .set_name("script")
            .into_function()
            .map_err(CompileError::Script)?;

        tracing::debug!(timeout_ms = pre.timeout_ms, "script compiled");
        self.compiled = Some(CompiledScript {
            chunk: pre.program,
            timeout_ms: pre.timeout_ms,
        });
        Ok(())
    }

    // ── activate ──────────────────────────────────────────────────────────────

    /// Start the compiled program.  Returns `false` if a session is already
    /// active or nothing is compiled.
    ///
    /// On success the call returns only once the script has run from the top
    /// of its body to its first suspend point, with both timers armed and the
    /// log feed enabled.
    pub fn activate(&mut self) -> bool {
        if self.session.is_some() {
            tracing::warn!("activate ignored: a session is already active");
            return false;
        }
        let Some(compiled) = self.compiled.as_ref() else {
            tracing::warn!("activate ignored: no compiled script");
            return false;
        };

        let deadline = Duration::from_millis(compiled.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let (gates, script_gates) = handshake::pair();
        let shared = Arc::new(Shared::new());
        shared.vars.lock().unwrap().time_us = self.sim.now().as_micros();
        let (cmd_tx, cmd_rx) = mpsc::channel();

        let chunk = compiled.chunk.clone();
        let observer = Arc::clone(&self.observer);
        let thread_shared = Arc::clone(&shared);

        self.state = EngineState::Starting;
        let handle = match thread::Builder::new().name("script".to_string()).spawn(move || {
            script_thread::run(chunk, script_gates, thread_shared, observer, cmd_tx)
        }) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn script thread");
                self.state = EngineState::Idle;
                return false;
            }
        };

        // First handshake round: the script runs from the top of its body to
        // its first suspend point before this returns.
        let status = gates.step();

        let started_sim = self.sim.now();
        let progress_interval = (deadline / 20).max(Duration::from_secs(1));
        let timeout_timer = self.sim.schedule(started_sim + deadline, TimerEvent::Timeout);
        let progress_timer = self
            .sim
            .schedule(started_sim + progress_interval, TimerEvent::Progress);
        self.sim.set_log_feed(true);

        self.session = Some(Session {
            thread: Some(handle),
            gates,
            shared,
            commands: cmd_rx,
            timeout_timer,
            progress_timer,
            progress_interval,
            deadline,
            started_sim,
            started_wall: Instant::now(),
        });
        self.state = EngineState::Running;
        tracing::info!(
            deadline_ms = deadline.as_millis() as u64,
            "script session activated"
        );

        // The script may already have reported a verdict or errored during
        // its first slice.
        self.after_step(status);
        true
    }

    // ── deactivate ────────────────────────────────────────────────────────────

    /// Tear down the active session.  Idempotent; safe to call with no
    /// session.
    pub fn deactivate(&mut self) {
        if self.session.is_none() {
            return;
        }
        tracing::debug!("deactivating script session");
        self.state = EngineState::Killed;
        self.teardown();
        self.state = EngineState::Idle;
    }

    /// Session teardown mechanics, shared by every exit path: set shutdown,
    /// over-release the script gate past any suspend point, cancel both
    /// timers, disable the log feed, and join the script thread (unless this
    /// *is* the script thread).
    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.shared.shutdown.store(true, Ordering::SeqCst);
        session.gates.release_script();
        session.gates.release_script();
        self.sim.cancel(session.timeout_timer);
        self.sim.cancel(session.progress_timer);
        self.sim.set_log_feed(false);
        if let Some(handle) = session.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    // ── event delivery ────────────────────────────────────────────────────────

    /// Deliver one mote log line (or injected message) to the script:
    /// publish the event's fields, then perform exactly one handshake step.
    pub fn on_log_line(&mut self, line: &LogLine) {
        let status = {
            let Some(session) = &self.session else { return };
            {
                let mut vars = session.shared.vars.lock().unwrap();
                vars.mote = line.mote.clone();
                vars.time_us = line.time.as_micros();
                vars.msg = line.msg.clone();
            }
            session.gates.step()
        };
        self.after_step(status);
    }

    /// Deliver one of the engine's own scheduled wake-ups.  Must be called on
    /// the driver thread, so timers join the same alternation as log lines.
    pub fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Timeout => self.on_timeout(),
            TimerEvent::Progress => self.on_progress(),
            TimerEvent::Message(text) => {
                let line = LogLine {
                    mote: None,
                    time: self.sim.now(),
                    msg: text,
                };
                self.on_log_line(&line);
            }
        }
    }

    /// Schedule a synthetic log line at `now + delay`, delivered through the
    /// ordinary [`ScriptEngine::on_log_line`] path.
    pub fn generate_message(&self, delay: Duration, text: &str) {
        if self.session.is_none() {
            tracing::warn!("generate_message ignored: no active session");
            return;
        }
        let at = self.sim.now() + delay;
        let _ = self.sim.schedule(at, TimerEvent::Message(text.to_string()));
    }

    // ── timers ────────────────────────────────────────────────────────────────

    fn on_timeout(&mut self) {
        if self.session.is_none() {
            return;
        }
        tracing::info!(at = %self.sim.now(), "script timeout deadline reached");
        self.state = EngineState::TimedOut;
        let status = {
            let Some(session) = &self.session else { return };
            session.shared.timed_out.store(true, Ordering::SeqCst);
            session.shared.vars.lock().unwrap().time_us = self.sim.now().as_micros();
            // The wake runs the on-timeout block exactly once; the harness
            // then reports the failure verdict.
            session.gates.step()
        };
        self.after_step(status);
    }

    fn on_progress(&mut self) {
        let now = self.sim.now();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let sim_elapsed = now.since(session.started_sim);
        let percent =
            ((sim_elapsed.as_micros() * 100) / session.deadline.as_micros().max(1)).min(100);
        let eta = if sim_elapsed.is_zero() {
            None
        } else {
            let remaining = session.deadline.saturating_sub(sim_elapsed);
            Some(
                session
                    .started_wall
                    .elapsed()
                    .mul_f64(remaining.as_secs_f64() / sim_elapsed.as_secs_f64()),
            )
        };
        tracing::info!(
            percent = percent as u64,
            eta_secs = eta.map(|d| d.as_secs()),
            "test progress"
        );
        let next = now + session.progress_interval;
        session.progress_timer = self.sim.schedule(next, TimerEvent::Progress);
    }

    // ── step outcome ──────────────────────────────────────────────────────────

    /// After every handshake step: execute the script's queued requests, then
    /// act on any recorded outcome.
    fn after_step(&mut self, status: GateStatus) {
        self.drain_commands();
        let outcome = match &self.session {
            Some(session) => session.shared.take_outcome(),
            None => return,
        };
        match (status, outcome) {
            (_, Some(Outcome::Verdict(verdict))) => self.finish_with_verdict(verdict),
            (_, Some(Outcome::Error(chain))) => self.finish_with_error(&chain),
            (GateStatus::Disconnected, None) => {
                self.finish_with_error("script thread exited unexpectedly")
            }
            (GateStatus::Ready, None) => {}
        }
    }

    fn drain_commands(&self) {
        let Some(session) = &self.session else { return };
        while let Ok(cmd) = session.commands.try_recv() {
            match cmd {
                ScriptCommand::GenerateMessage { delay_ms, text } => {
                    let at = self.sim.now() + Duration::from_millis(delay_ms);
                    tracing::debug!(at = %at, "scheduling injected message");
                    let _ = self.sim.schedule(at, TimerEvent::Message(text));
                }
            }
        }
    }

    /// The script ended the run with a verdict: report it, tear down, stop
    /// the simulation, and in unattended mode exit the host with 0/1.
    fn finish_with_verdict(&mut self, verdict: Verdict) {
        let (line, status) = match verdict {
            Verdict::Ok => ("TEST OK", 0),
            Verdict::Failed => ("TEST FAILED", 1),
        };
        self.observer.script_log(line);
        tracing::info!(verdict = line, at = %self.sim.now(), "script session finished");
        if self.state != EngineState::TimedOut {
            self.state = EngineState::Completed;
        }
        self.teardown();
        self.sim.stop();
        if self.mode == Mode::Unattended {
            self.sim.exit(status);
        }
        self.state = EngineState::Idle;
    }

    /// Fatal script error: log the full cause chain, tear down, stop the
    /// simulation, and in unattended mode exit the host non-zero.
    fn finish_with_error(&mut self, chain: &str) {
        self.state = EngineState::Errored;
        tracing::error!(error = %chain, "fatal script error");
        self.teardown();
        self.sim.stop();
        if self.mode == Mode::Unattended {
            self.sim.exit(1);
        }
        self.state = EngineState::Idle;
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.deactivate();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Minimal stand-in: compile-path tests never reach the simulator.
    struct NullSim;

    impl Simulation for NullSim {
        fn now(&self) -> SimTime {
            SimTime::ZERO
        }
        fn schedule(&self, _at: SimTime, _event: TimerEvent) -> TimerId {
            TimerId(0)
        }
        fn cancel(&self, _timer: TimerId) {}
        fn set_log_feed(&self, _enabled: bool) {}
        fn stop(&self) {}
        fn exit(&self, _status: i32) {}
    }

    struct Collector(Mutex<Vec<String>>);

    impl ScriptObserver for Collector {
        fn script_log(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn engine() -> ScriptEngine {
        ScriptEngine::new(
            Arc::new(NullSim),
            Arc::new(Collector(Mutex::new(Vec::new()))),
            Mode::Attended,
        )
    }

    #[test]
    fn compile_accepts_plain_script() {
        let mut eng = engine();
        assert!(eng.compile("log(\"hi\")\ntest_ok()").is_ok());
    }

    #[test]
    fn compile_rejects_bad_lua() {
        let mut eng = engine();
        match eng.compile("this is not lua") {
            Err(CompileError::Script(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn compile_rejects_duplicate_timeout() {
        let mut eng = engine();
        match eng.compile("TIMEOUT(1)\nTIMEOUT(2)") {
            Err(CompileError::Syntax(SyntaxError::DuplicateTimeout)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn activate_without_compile_is_false() {
        let mut eng = engine();
        assert!(!eng.activate());
        assert_eq!(eng.state(), EngineState::Idle);
    }

    #[test]
    fn deactivate_without_session_is_noop() {
        let mut eng = engine();
        eng.deactivate();
        eng.deactivate();
        assert_eq!(eng.state(), EngineState::Idle);
    }
}
