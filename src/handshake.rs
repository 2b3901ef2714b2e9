//! The driver/script rendezvous.
//!
//! Two counting gates, one per direction, each starting with one unit owed:
//! the driver releases the script gate and then blocks on the sim gate; the
//! script, when it reaches a suspend point, releases the sim gate and blocks
//! on the script gate.  The result is strict alternation — at any moment at
//! most one of the two threads is executing application logic, and the script
//! can never run ahead of simulated time.
//!
//! The gates are `std::sync::mpsc` channels of `()` used as rendezvous
//! counters: release = `send`, acquire = `recv`.  A disconnected channel means
//! the other side is gone and reads as a wake-up, which makes teardown free of
//! lost-wakeup hazards: dropping one half unblocks the other.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

/// What an acquire observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// A unit arrived; the other side ran its half of the step.
    Ready,
    /// The other side's gate handles were dropped.
    Disconnected,
}

/// The driver thread's half of the handshake.
pub struct DriverGates {
    script_tx: Sender<()>,
    sim_rx: Receiver<()>,
}

/// The script thread's half of the handshake.
pub struct ScriptGates {
    script_rx: Receiver<()>,
    sim_tx: Sender<()>,
}

/// Create a connected gate pair.  Both gates start empty: every acquire waits
/// for a matching release.
pub fn pair() -> (DriverGates, ScriptGates) {
    let (script_tx, script_rx) = channel();
    let (sim_tx, sim_rx) = channel();
    (
        DriverGates { script_tx, sim_rx },
        ScriptGates { script_rx, sim_tx },
    )
}

impl DriverGates {
    /// One driver step: wake the script, then block until it suspends again
    /// (or its thread exits).
    pub fn step(&self) -> GateStatus {
        if self.script_tx.send(()).is_err() {
            // Script side already gone; collect its final release if any.
            return match self.sim_rx.try_recv() {
                Ok(()) => GateStatus::Ready,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => GateStatus::Disconnected,
            };
        }
        match self.sim_rx.recv() {
            Ok(()) => GateStatus::Ready,
            Err(_) => GateStatus::Disconnected,
        }
    }

    /// Release the script gate without waiting.  Used during teardown to
    /// over-release past any suspend point the script may be parked at.
    pub fn release_script(&self) {
        let _ = self.script_tx.send(());
    }
}

impl ScriptGates {
    /// The initial suspend: wait to be woken without releasing the driver.
    /// The unit the driver's first step owes us completes `activate`'s
    /// handshake once we later release through [`ScriptGates::suspend`].
    pub fn wait_initial(&self) -> GateStatus {
        match self.script_rx.recv() {
            Ok(()) => GateStatus::Ready,
            Err(_) => GateStatus::Disconnected,
        }
    }

    /// An ordinary suspend point: hand control to the driver, then block
    /// until the next step wakes us.
    pub fn suspend(&self) -> GateStatus {
        let _ = self.sim_tx.send(());
        match self.script_rx.recv() {
            Ok(()) => GateStatus::Ready,
            Err(_) => GateStatus::Disconnected,
        }
    }

    /// Final release on thread exit, so a driver blocked mid-step wakes
    /// promptly instead of waiting for the channel drop.
    pub fn release_driver(&self) {
        let _ = self.sim_tx.send(());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn strict_alternation() {
        let (driver, script) = pair();
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        let worker = thread::spawn(move || {
            let mut observed = Vec::new();
            assert_eq!(script.wait_initial(), GateStatus::Ready);
            for _ in 0..3 {
                observed.push(seen.load(Ordering::SeqCst));
                if script.suspend() != GateStatus::Ready {
                    break;
                }
            }
            script.release_driver();
            observed
        });

        // Each step publishes a value, then lets the script observe it.
        for i in 1..=3 {
            counter.store(i, Ordering::SeqCst);
            assert_eq!(driver.step(), GateStatus::Ready);
        }
        driver.release_script(); // final wake so the loop exits

        let observed = worker.join().unwrap();
        assert_eq!(observed, vec![1, 2, 3]);
    }

    #[test]
    fn driver_step_after_script_exit_does_not_hang() {
        let (driver, script) = pair();
        let worker = thread::spawn(move || {
            assert_eq!(script.wait_initial(), GateStatus::Ready);
            script.release_driver();
            // gates dropped here
        });
        assert_eq!(driver.step(), GateStatus::Ready);
        worker.join().unwrap();
        // Script side is gone now; further steps must return immediately.
        assert_eq!(driver.step(), GateStatus::Disconnected);
    }

    #[test]
    fn over_release_unblocks_waiter() {
        let (driver, script) = pair();
        driver.release_script();
        driver.release_script();
        assert_eq!(script.wait_initial(), GateStatus::Ready);
        assert_eq!(script.suspend(), GateStatus::Ready);
    }

    #[test]
    fn dropping_driver_wakes_script() {
        let (driver, script) = pair();
        let worker = thread::spawn(move || script.wait_initial());
        drop(driver);
        assert_eq!(worker.join().unwrap(), GateStatus::Disconnected);
    }
}
