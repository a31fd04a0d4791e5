//! Cooperative run control.
//!
//! All backends share one [`RunGate`]. Control is cooperative: workers poll
//! the gate at chunk boundaries, so the in-flight chunk or pass batch always
//! completes before a pause or stop takes effect.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    paused: bool,
    stopped: bool,
}

pub struct RunGate {
    state: Mutex<GateState>,
    resumed: Condvar,
}

impl RunGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            resumed: Condvar::new(),
        }
    }

    /// Clear both flags before a new run.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = false;
        state.stopped = false;
    }

    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.resumed.notify_all();
    }

    /// Request a stop. Also wakes paused workers so the stop is observable.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.resumed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    /// Worker checkpoint: blocks while paused, returns `false` once stopped.
    pub fn checkpoint(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.paused && !state.stopped {
            state = self.resumed.wait(state).unwrap();
        }
        !state.stopped
    }
}

impl Default for RunGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_checkpoint_passes_when_idle() {
        let gate = RunGate::new();
        assert!(gate.checkpoint());
    }

    #[test]
    fn test_stop_fails_checkpoint() {
        let gate = RunGate::new();
        gate.stop();
        assert!(!gate.checkpoint());
        assert!(gate.is_stopped());
    }

    #[test]
    fn test_pause_blocks_until_resume() {
        let gate = Arc::new(RunGate::new());
        gate.pause();

        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.checkpoint())
        };

        // Worker should be parked on the condvar, not finished.
        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());

        gate.resume();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_stop_wakes_paused_worker() {
        let gate = Arc::new(RunGate::new());
        gate.pause();

        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.checkpoint())
        };

        thread::sleep(Duration::from_millis(50));
        gate.stop();
        // Checkpoint must return false, not hang waiting for a resume.
        assert!(!worker.join().unwrap());
    }

    #[test]
    fn test_reset_clears_previous_run() {
        let gate = RunGate::new();
        gate.stop();
        gate.reset();
        assert!(gate.checkpoint());
    }
}
