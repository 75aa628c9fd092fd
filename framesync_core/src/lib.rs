//! FrameSync Core - frame synchronization and fleet-policy coordination
//!
//! This library pairs an externally clocked simulator with asynchronous sensor
//! producers:
//! 1. **Rendezvous**: every clock advance is matched with one delivery per
//!    sensor, each waited for under its own timeout
//! 2. **Provisioning**: fleets are spawned in one batch and only used after an
//!    explicit synchronization point
//! 3. **Policy**: global traffic settings plus per-actor adversarial overrides
//!
//! Cleanup (sensor detach, settings restore, actor destruction) runs on every
//! exit path of the [`Coordinator`].

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fleet;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod rendezvous;
pub mod sensor_bridge;
pub mod startup;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export key types for convenience
pub use clock::{ClockController, ClockRole, StepId, StepWatermark};
pub use config::{ClockConfig, FleetConfig, QueueConfig, SyncConfig};
pub use coordinator::{CancelToken, Coordinator, CoordinatorState, RunSummary, StepCompleteness, StepReport};
pub use error::{SyncError, SyncWarning};
pub use fleet::{ActorSpawnRequest, FleetPlan, FleetProvisioner, PendingBatch, ProvisionedBatch, SpawnOutcome};
pub use metrics::{QueueMetrics, QueueStats};
pub use policy::{BehaviorOverride, GlobalTrafficPolicy, PolicyOverrider};
pub use registry::{ActorHandle, ActorRegistry, ActorRole};
pub use rendezvous::{LaneSender, PushOutcome, RecvTimeout, RendezvousQueue, SensorRecord};
pub use sensor_bridge::{DeliveryHandler, Registration, SensorBridge, SensorSpec};
pub use startup::{FleetReport, SetupReport};
