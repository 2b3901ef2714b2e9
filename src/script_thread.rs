//! The script thread: owns the Lua state for one activation.
//!
//! The coordinator spawns this thread with the harnessed chunk and the script
//! half of the handshake.  The Lua state never crosses threads; everything the
//! driver needs to exchange with the script travels through [`Shared`], the
//! gates, or the command channel.
//!
//! # Script API
//!
//! | Lua function                        | Effect                                  |
//! |-------------------------------------|-----------------------------------------|
//! | `log(value)`                        | Forward a line to the observer          |
//! | `test_ok()`                         | Record a success verdict, end the run   |
//! | `test_failed()`                     | Record a failure verdict, end the run   |
//! | `generate_message(delay_ms, text)`  | Inject a synthetic log line             |
//! | `__engine_begin()` / `__engine_step()` | Harness suspend points (generated code only) |
//!
//! Globals published before every resume: `mote`, `id`, `time` (simulated
//! microseconds), `msg`, `SHUTDOWN`, `TIMEOUT`.
//!
//! Shutdown and verdict termination unwind the Lua stack with a typed
//! [`StopSignal`] carried as an external error; [`run`] filters it by downcast
//! at the thread boundary, so it is control transfer, never a reported error.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use mlua::prelude::*;

use crate::handshake::{GateStatus, ScriptGates};
use crate::session::{Outcome, ScriptCommand, Shared, Verdict};
use crate::sim::ScriptObserver;

// ── Stop sentinel ─────────────────────────────────────────────────────────────

/// Why the script is being unwound.  Not an error: filtered at the thread
/// boundary and never recorded in the session outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    /// The coordinator set the shutdown flag.
    Shutdown,
    /// `test_ok` / `test_failed` ended the run; the verdict is already
    /// recorded.
    Finished,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Shutdown => write!(f, "script shutdown"),
            StopSignal::Finished => write!(f, "script finished"),
        }
    }
}

impl std::error::Error for StopSignal {}

/// Whether `err` is (or wraps) the stop sentinel.
fn is_stop(err: &LuaError) -> bool {
    match err {
        LuaError::CallbackError { cause, .. } => is_stop(cause),
        LuaError::WithContext { cause, .. } => is_stop(cause),
        LuaError::ExternalError(e) => e.downcast_ref::<StopSignal>().is_some(),
        _ => false,
    }
}

/// Render an error with its full cause chain, one `: `-joined line.
fn render_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

// ── Thread entry ──────────────────────────────────────────────────────────────

/// Run one activation's script to completion.
///
/// Always releases the driver gate once before returning, so a driver blocked
/// mid-step wakes promptly whatever the exit path.
pub(crate) fn run(
    chunk: String,
    gates: ScriptGates,
    shared: Arc<Shared>,
    observer: Arc<dyn ScriptObserver>,
    commands: Sender<ScriptCommand>,
) {
    let gates = Rc::new(gates);
    let lua = Lua::new();

    if let Err(e) = register_api(&lua, &gates, &shared, &observer, &commands) {
        shared.record_outcome(Outcome::Error(render_chain(&e)));
        gates.release_driver();
        return;
    }

    match lua.load(chunk.as_str()).set_name("script").exec() {
        // The harness tail loops on suspend forever; a plain return means the
        // generated program is broken.
        Ok(()) => shared.record_outcome(Outcome::Error(
            "script returned instead of suspending".to_string(),
        )),
        Err(e) if is_stop(&e) => {}
        Err(e) => shared.record_outcome(Outcome::Error(render_chain(&e))),
    }

    gates.release_driver();
}

// ── API registration ──────────────────────────────────────────────────────────

fn register_api(
    lua: &Lua,
    gates: &Rc<ScriptGates>,
    shared: &Arc<Shared>,
    observer: &Arc<dyn ScriptObserver>,
    commands: &Sender<ScriptCommand>,
) -> LuaResult<()> {
    let globals = lua.globals();

    // __engine_begin() — the harness's initial suspend (acquire-only).
    {
        let gates = Rc::clone(gates);
        let shared = Arc::clone(shared);
        globals.set(
            "__engine_begin",
            lua.create_function(move |lua, ()| wake(lua, &gates, &shared, true))?,
        )?;
    }

    // __engine_step() — every later suspend point (release, then acquire).
    {
        let gates = Rc::clone(gates);
        let shared = Arc::clone(shared);
        globals.set(
            "__engine_step",
            lua.create_function(move |lua, ()| wake(lua, &gates, &shared, false))?,
        )?;
    }

    // log(value) — forward one line to the observer.
    {
        let observer = Arc::clone(observer);
        globals.set(
            "log",
            lua.create_function(move |_, value: LuaValue| {
                observer.script_log(&text_of(&value)?);
                Ok(())
            })?,
        )?;
    }

    // test_ok() / test_failed() — record the verdict and end the run.
    {
        let shared = Arc::clone(shared);
        globals.set(
            "test_ok",
            lua.create_function(move |_, ()| -> LuaResult<()> {
                shared.record_outcome(Outcome::Verdict(Verdict::Ok));
                Err(LuaError::external(StopSignal::Finished))
            })?,
        )?;
    }
    {
        let shared = Arc::clone(shared);
        globals.set(
            "test_failed",
            lua.create_function(move |_, ()| -> LuaResult<()> {
                shared.record_outcome(Outcome::Verdict(Verdict::Failed));
                Err(LuaError::external(StopSignal::Finished))
            })?,
        )?;
    }

    // generate_message(delay_ms, text) — the driver schedules it after this
    // slice's handshake step.
    {
        let commands = commands.clone();
        globals.set(
            "generate_message",
            lua.create_function(move |_, (delay_ms, text): (u64, String)| {
                let _ = commands.send(ScriptCommand::GenerateMessage { delay_ms, text });
                Ok(())
            })?,
        )?;
    }

    Ok(())
}

// ── Suspend points ────────────────────────────────────────────────────────────

/// Hand control to the driver (unless this is the initial suspend), block
/// until reawakened, then recheck shutdown, publish the staged variables, and
/// report whether the timeout routine must run.
fn wake(lua: &Lua, gates: &ScriptGates, shared: &Shared, initial: bool) -> LuaResult<String> {
    if shared.shutdown.load(Ordering::SeqCst) {
        return Err(LuaError::external(StopSignal::Shutdown));
    }

    let status = if initial {
        gates.wait_initial()
    } else {
        gates.suspend()
    };

    if status == GateStatus::Disconnected || shared.shutdown.load(Ordering::SeqCst) {
        return Err(LuaError::external(StopSignal::Shutdown));
    }

    publish(lua, shared)?;

    if shared.take_timeout() {
        Ok("timeout".to_string())
    } else {
        Ok("run".to_string())
    }
}

/// Copy the staged log variables into Lua globals.  Valid to read only until
/// the next suspend: the driver rewrites them before every resume.
fn publish(lua: &Lua, shared: &Shared) -> LuaResult<()> {
    let vars = shared.vars.lock().unwrap().clone();
    let globals = lua.globals();

    match &vars.mote {
        Some(mote) => {
            let table = lua.create_table()?;
            table.set("id", mote.id)?;
            table.set("name", mote.name.as_str())?;
            globals.set("mote", table)?;
            globals.set("id", mote.id)?;
        }
        None => {
            globals.set("mote", LuaValue::Nil)?;
            globals.set("id", -1)?;
        }
    }
    globals.set("time", vars.time_us)?;
    globals.set("msg", vars.msg.as_str())?;
    globals.set("SHUTDOWN", shared.shutdown.load(Ordering::SeqCst))?;
    globals.set("TIMEOUT", shared.timed_out.load(Ordering::SeqCst))?;
    Ok(())
}

/// Best-effort stringification for `log(...)` arguments.
fn text_of(value: &LuaValue) -> LuaResult<String> {
    Ok(match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_str()?.to_owned(),
        other => format!("<{}>", other.type_name()),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::thread;

    struct Collector(Mutex<Vec<String>>);

    impl ScriptObserver for Collector {
        fn script_log(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn spawn_script(
        chunk: &str,
    ) -> (
        crate::handshake::DriverGates,
        Arc<Shared>,
        Arc<Collector>,
        thread::JoinHandle<()>,
    ) {
        let (driver, script) = handshake::pair();
        let shared = Arc::new(Shared::new());
        let observer = Arc::new(Collector(Mutex::new(Vec::new())));
        let (cmd_tx, _cmd_rx) = mpsc::channel();
        let chunk = chunk.to_string();
        let sh = Arc::clone(&shared);
        let obs: Arc<dyn ScriptObserver> = observer.clone();
        let handle = thread::spawn(move || run(chunk, script, sh, obs, cmd_tx));
        (driver, shared, observer, handle)
    }

    #[test]
    fn verdict_unwind_is_not_an_error() {
        let (driver, shared, _obs, handle) = spawn_script("__engine_begin()\ntest_ok()");
        assert_eq!(driver.step(), GateStatus::Ready);
        handle.join().unwrap();
        assert_eq!(shared.take_outcome(), Some(Outcome::Verdict(Verdict::Ok)));
    }

    #[test]
    fn runtime_error_is_recorded_with_chain() {
        let (driver, shared, _obs, handle) = spawn_script("__engine_begin()\nerror('boom')");
        assert_eq!(driver.step(), GateStatus::Ready);
        handle.join().unwrap();
        match shared.take_outcome() {
            Some(Outcome::Error(chain)) => assert!(chain.contains("boom"), "chain: {chain}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn shutdown_unwind_records_nothing() {
        let (driver, shared, _obs, handle) =
            spawn_script("__engine_begin()\nwhile true do __engine_step() end");
        assert_eq!(driver.step(), GateStatus::Ready);
        shared.shutdown.store(true, Ordering::SeqCst);
        driver.release_script();
        handle.join().unwrap();
        assert_eq!(shared.take_outcome(), None);
    }

    #[test]
    fn log_stringifies_values() {
        let (driver, _shared, obs, handle) =
            spawn_script("__engine_begin()\nlog('a')\nlog(42)\nlog(true)\nlog(nil)\ntest_ok()");
        assert_eq!(driver.step(), GateStatus::Ready);
        handle.join().unwrap();
        assert_eq!(
            *obs.0.lock().unwrap(),
            vec!["a", "42", "true", "nil"]
        );
    }

    #[test]
    fn published_vars_visible_after_resume() {
        let (driver, shared, obs, handle) = spawn_script(
            "__engine_begin()\nlog(msg)\n__engine_step()\nlog(msg)\nlog(id)\ntest_ok()",
        );
        assert_eq!(driver.step(), GateStatus::Ready); // script logs initial "" and parks
        {
            let mut vars = shared.vars.lock().unwrap();
            vars.msg = "hello".to_string();
            vars.mote = Some(crate::sim::Mote {
                id: 3,
                name: "sky1".to_string(),
            });
        }
        assert_eq!(driver.step(), GateStatus::Ready);
        handle.join().unwrap();
        assert_eq!(*obs.0.lock().unwrap(), vec!["", "hello", "3"]);
    }
}
