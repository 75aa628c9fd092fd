//! Clock Controller - the single authority over simulated time.
//!
//! Every call to [`ClockController::advance`] moves the world forward by
//! exactly one fixed-size step and returns the new [`StepId`]. Step ids are
//! checked against the simulator's frame counter so they are strictly
//! increasing with no gaps or repeats; any deviation is treated as a desync.
//!
//! # Roles
//!
//! - **Master**: the world was asynchronous when we connected. We switch it to
//!   synchronous mode and issue every step ourselves.
//! - **Follower**: another client already drives the world synchronously. We
//!   wait for its steps instead of issuing our own.

use crate::config::ClockConfig;
use crate::error::SyncError;

use framesync_env::{WorldService, WorldSettings};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, info, warn};

/// Identifier of one simulated clock advance (the simulator frame number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u64);

impl StepId {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> StepId {
        StepId(self.0 + 1)
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step {:06}", self.0)
    }
}

/// Latest issued step, shared lock-free with sensor producer threads.
///
/// A step is issued as soon as the clock requests it, before the simulator
/// confirms it.
#[derive(Debug, Clone)]
pub struct StepWatermark(Arc<AtomicU64>);

impl StepWatermark {
    pub fn new(initial: StepId) -> Self {
        Self(Arc::new(AtomicU64::new(initial.0)))
    }

    /// The most recent step issued by the clock.
    pub fn latest(&self) -> StepId {
        StepId(self.0.load(Ordering::Acquire))
    }

    /// True if `step` has already been issued.
    pub fn admits(&self, step: StepId) -> bool {
        step.0 <= self.0.load(Ordering::Acquire)
    }

    fn publish(&self, step: StepId) {
        self.0.store(step.0, Ordering::Release);
    }
}

/// Whether we drive the world clock or follow another client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClockRole {
    Master,
    Follower,
}

/// Clears the in-flight flag on every exit path of `advance`.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns simulation time advancement.
pub struct ClockController<W: WorldService> {
    world: Arc<W>,

    /// Settings found on connect, restored on shutdown
    original: WorldSettings,

    role: ClockRole,

    /// Fixed simulated seconds per step
    step_seconds: f64,

    /// Last frame confirmed by the simulator
    last: AtomicU64,

    watermark: StepWatermark,

    /// Set while an advance is blocked inside the simulator
    in_flight: AtomicBool,

    /// The designated coordination thread
    owner: ThreadId,

    restored: AtomicBool,
}

impl<W: WorldService> ClockController<W> {
    /// Takes over the world clock.
    ///
    /// Snapshots the current settings, applies the requested ones and reads
    /// the baseline frame. The calling thread becomes the coordination thread.
    pub fn new(world: Arc<W>, config: &ClockConfig) -> Result<Self, SyncError> {
        let original = world.settings()?;

        let role = if config.synchronous_mode && original.synchronous_mode {
            info!("World already synchronous; following the existing clock master");
            ClockRole::Follower
        } else {
            let requested = WorldSettings {
                synchronous_mode: config.synchronous_mode,
                fixed_delta_seconds: Some(config.fixed_delta_seconds),
            };
            world.apply_settings(&requested)?;
            if config.synchronous_mode {
                ClockRole::Master
            } else {
                ClockRole::Follower
            }
        };

        let baseline = world.current_frame()?;

        info!(
            "Clock ready: role={:?}, dt={}s, baseline frame {}",
            role, config.fixed_delta_seconds, baseline
        );

        Ok(Self {
            world,
            original,
            role,
            step_seconds: config.fixed_delta_seconds,
            last: AtomicU64::new(baseline),
            watermark: StepWatermark::new(StepId(baseline)),
            in_flight: AtomicBool::new(false),
            owner: std::thread::current().id(),
            restored: AtomicBool::new(false),
        })
    }

    /// Makes the calling thread the coordination thread.
    pub fn bind_to_current_thread(&mut self) {
        self.owner = std::thread::current().id();
    }

    /// Advances the world by exactly one step.
    ///
    /// # Errors
    /// * `ConcurrencyViolation` - called off the coordination thread or while
    ///   another advance is in flight
    /// * `ClockAdvanceFailed` - the simulator failed, or returned a frame other
    ///   than `previous + 1`. Never retried.
    pub fn advance(&self) -> Result<StepId, SyncError> {
        let caller = std::thread::current().id();
        if caller != self.owner {
            return Err(SyncError::ConcurrencyViolation(format!(
                "advance called from {:?}, coordination thread is {:?}",
                caller, self.owner
            )));
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::ConcurrencyViolation(
                "advance re-entered while a step is in flight".to_string(),
            ));
        }
        let _in_flight = InFlight(&self.in_flight);

        // Sensors may deliver before the simulator acknowledges the step, so
        // the step counts as issued once it is requested.
        let previous = self.last.load(Ordering::Acquire);
        self.watermark.publish(StepId(previous + 1));

        let frame = match self.role {
            ClockRole::Master => self.world.advance_step(),
            ClockRole::Follower => self.world.wait_for_step(),
        }
        .map_err(|e| SyncError::clock(e.to_string()))?;

        if frame != previous + 1 {
            return Err(SyncError::clock(format!(
                "simulator desynchronized: expected frame {}, got {}",
                previous + 1,
                frame
            )));
        }

        self.last.store(frame, Ordering::Release);
        let step = StepId(frame);
        debug!("Advanced to {}", step);

        Ok(step)
    }

    /// Re-applies the settings found on connect. Runs at most once.
    pub fn restore(&self) -> Result<(), SyncError> {
        if self.restored.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.world.apply_settings(&self.original) {
            Ok(_) => {
                info!("Restored original world settings");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to restore world settings: {}", e);
                Err(SyncError::teardown(format!("restore settings: {}", e)))
            }
        }
    }

    /// The most recent step issued.
    pub fn last_step(&self) -> StepId {
        StepId(self.last.load(Ordering::Acquire))
    }

    /// Shared handle producers use to reject records for unissued steps.
    pub fn watermark(&self) -> StepWatermark {
        self.watermark.clone()
    }

    pub fn role(&self) -> ClockRole {
        self.role
    }

    pub fn step_seconds(&self) -> f64 {
        self.step_seconds
    }

    pub fn original_settings(&self) -> WorldSettings {
        self.original
    }

    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::Acquire)
    }
}
