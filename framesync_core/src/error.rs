//! Error taxonomy for the coordination engine.
//!
//! Fatal failures are [`SyncError`] values and always end the run through the
//! shutdown path. Recoverable conditions are [`SyncWarning`] values: they are
//! logged and surfaced in reports, never returned as `Err`.

use crate::clock::StepId;
use framesync_env::{ActorId, EnvError};
use serde::Serialize;
use thiserror::Error;

/// Errors that stop the coordinator or reject a call.
#[derive(Debug, Error)]
pub enum SyncError {
    /// `Advance()` called concurrently or from a non-coordination thread
    #[error("Concurrency violation: {0}")]
    ConcurrencyViolation(String),

    /// The simulator could not advance, or returned an unexpected frame
    #[error("Clock advance failed: {0}")]
    ClockAdvanceFailed(String),

    /// An actor was used before its spawn was confirmed
    #[error("{0} is not a confirmed spawned actor")]
    NotConfirmed(ActorId),

    #[error("{0} is already registered")]
    DuplicateActor(ActorId),

    #[error("Sensor '{0}' is already registered")]
    DuplicateSensor(String),

    /// Cleanup (settings restore, sensor or actor destruction) failed
    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl SyncError {
    /// Creates a clock failure.
    pub fn clock(msg: impl Into<String>) -> Self {
        Self::ClockAdvanceFailed(msg.into())
    }

    /// Creates a teardown failure.
    pub fn teardown(msg: impl std::fmt::Display) -> Self {
        Self::Teardown(msg.to_string())
    }

    /// True for errors that must end the run.
    ///
    /// `NotConfirmed`, `DuplicateActor` and `DuplicateSensor` reject a single
    /// call and leave the coordinator usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::NotConfirmed(_) | Self::DuplicateActor(_) | Self::DuplicateSensor(_)
        )
    }

    /// Process exit status for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Recoverable conditions reported alongside normal results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncWarning {
    /// A registered sensor did not deliver within the drain timeout
    SensorDeliveryTimeout { step: StepId, sensor: String },

    /// A full lane evicted its oldest record to make room
    QueueOverflowDrop { sensor: String, dropped: StepId },

    /// One spawn request of a batch failed; siblings are unaffected
    SpawnFailed { index: usize, blueprint_id: String, reason: String },

    /// Fewer spawn points than requested vehicles
    ClampedFleetSize {
        requested: usize,
        clamped_to: usize,
        spawn_points: usize,
    },
}

impl std::fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncWarning::SensorDeliveryTimeout { step, sensor } => {
                write!(f, "sensor '{}' missed {}", sensor, step)
            }
            SyncWarning::QueueOverflowDrop { sensor, dropped } => {
                write!(f, "lane '{}' full, dropped record for {}", sensor, dropped)
            }
            SyncWarning::SpawnFailed { index, blueprint_id, reason } => {
                write!(f, "spawn #{} ({}) failed: {}", index, blueprint_id, reason)
            }
            SyncWarning::ClampedFleetSize { requested, clamped_to, spawn_points } => write!(
                f,
                "requested {} vehicles, but could only find {} spawn points; using {}",
                requested, spawn_points, clamped_to
            ),
        }
    }
}
