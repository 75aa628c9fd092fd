//! Virtual clock of the simulated world.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    frame: u64,
    elapsed_ns: u64,
}

/// Frame counter plus simulated elapsed time.
///
/// Time only moves when the world is stepped; it never reads the wall clock.
#[derive(Debug)]
pub struct SimClock {
    state: Arc<Mutex<ClockState>>,
}

impl SimClock {
    /// Creates a clock positioned at `start_frame` with zero elapsed time.
    pub fn new(start_frame: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                frame: start_frame,
                elapsed_ns: 0,
            })),
        }
    }

    /// Advances one frame of `dt` simulated seconds.
    ///
    /// Returns the new frame and its timestamp in seconds.
    pub fn tick(&self, dt: f64) -> (u64, f64) {
        let mut state = lock(&self.state);
        state.frame += 1;
        state.elapsed_ns += Duration::from_secs_f64(dt.max(0.0)).as_nanos() as u64;
        (state.frame, state.elapsed_ns as f64 / 1e9)
    }

    pub fn frame(&self) -> u64 {
        lock(&self.state).frame
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(lock(&self.state).elapsed_ns)
    }
}

impl Clone for SimClock {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}
