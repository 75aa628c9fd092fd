//! Collaborator traits for the externally clocked simulator.

use crate::error::EnvError;
use crate::types::{
    ActorId, ActorSnapshot, BehaviorParams, Blueprint, SensorId, SensorPayload, SpawnCommand,
    Transform, WeatherParameters, WorldSettings,
};
use std::path::Path;

/// World and clock service.
///
/// All calls are blocking. In synchronous mode the world only moves when
/// [`WorldService::advance_step`] is called, and that call returns once the
/// simulator has confirmed the new frame.
///
/// ```text
/// Coordinator                 Simulator
///   |-- advance_step() -------->|
///   |                           |-- [physics + sensors for frame N]
///   |<------------- frame N ----|
///   |                           |-- callbacks(frame N) on sensor threads
/// ```
pub trait WorldService: Send + Sync {
    /// Current stepping configuration.
    fn settings(&self) -> Result<WorldSettings, EnvError>;

    /// Applies a stepping configuration and returns the current frame.
    fn apply_settings(&self, settings: &WorldSettings) -> Result<u64, EnvError>;

    /// Issues one fixed-size step and blocks until it is confirmed.
    fn advance_step(&self) -> Result<u64, EnvError>;

    /// Blocks until another client advances the world by one step.
    fn wait_for_step(&self) -> Result<u64, EnvError>;

    /// The latest confirmed frame.
    fn current_frame(&self) -> Result<u64, EnvError>;

    /// Live actors whose type id matches a glob pattern (e.g. `vehicle.*`).
    fn actors_matching(&self, pattern: &str) -> Result<Vec<ActorSnapshot>, EnvError>;

    /// Recommended spawn points of the loaded map.
    fn spawn_points(&self) -> Result<Vec<Transform>, EnvError>;

    fn set_weather(&self, weather: &WeatherParameters) -> Result<(), EnvError>;

    fn set_spectator_transform(&self, transform: &Transform) -> Result<(), EnvError>;
}

/// Actor and blueprint catalog.
pub trait ActorCatalog: Send + Sync {
    /// Looks up a blueprint by exact id.
    fn find_blueprint(&self, id: &str) -> Result<Blueprint, EnvError>;

    /// Blueprints whose id matches a glob pattern.
    fn filter_blueprints(&self, pattern: &str) -> Result<Vec<Blueprint>, EnvError>;

    /// Spawns a single actor, optionally attached to a parent.
    fn spawn_actor(
        &self,
        blueprint: &Blueprint,
        transform: &Transform,
        attach_to: Option<ActorId>,
    ) -> Result<ActorId, EnvError>;

    /// Submits a batch of spawn commands as one unit.
    ///
    /// # Returns
    /// * `Ok(responses)` - one response per command, in command order. Each
    ///   response succeeds or fails independently.
    /// * `Err(EnvError)` - the batch could not be transported at all
    ///
    /// When `advance` is true the simulator also advances one step after
    /// applying the batch.
    fn apply_batch_sync(
        &self,
        commands: Vec<SpawnCommand>,
        advance: bool,
    ) -> Result<Vec<Result<ActorId, String>>, EnvError>;

    /// Destroys actors in one batch. Unknown ids are ignored.
    fn destroy_actors(&self, ids: &[ActorId]) -> Result<(), EnvError>;

    fn set_autopilot(&self, id: ActorId, enabled: bool, tm_port: u16) -> Result<(), EnvError>;

    /// Latest known transform of an actor.
    fn actor_transform(&self, id: ActorId) -> Result<Transform, EnvError>;
}

/// Delivery callback registered with a sensor.
///
/// The simulator may invoke it from any thread at any time after a step.
pub type DeliveryCallback = Box<dyn Fn(SensorPayload) + Send + Sync + 'static>;

/// Attach point for sensors.
pub trait SensorAttachPoint: Send + Sync {
    /// Spawns a sensor rigidly attached to `parent` at a relative transform.
    fn attach_sensor(
        &self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: ActorId,
    ) -> Result<SensorId, EnvError>;

    /// Starts streaming payloads into `callback`.
    fn listen(&self, sensor: SensorId, callback: DeliveryCallback) -> Result<(), EnvError>;

    /// Stops streaming. The callback is dropped.
    fn stop(&self, sensor: SensorId) -> Result<(), EnvError>;

    fn destroy_sensor(&self, sensor: SensorId) -> Result<(), EnvError>;
}

/// Persists sensor payloads.
pub trait StorageSink: Send + Sync {
    fn save(&self, payload: &SensorPayload, path: &Path) -> Result<(), EnvError>;
}

/// Traffic-policy (autopilot) service.
pub trait TrafficPolicy: Send + Sync {
    /// Port actors use to register with this service.
    fn port(&self) -> u16;

    fn set_synchronous_mode(&self, enabled: bool) -> Result<(), EnvError>;

    fn set_global_follow_distance(&self, meters: f64) -> Result<(), EnvError>;

    /// Only simulate full physics near the hero vehicle.
    fn set_hybrid_physics(&self, enabled: bool) -> Result<(), EnvError>;

    /// Global percentage below the speed limit.
    fn set_global_speed_bias(&self, pct: f64) -> Result<(), EnvError>;

    fn set_actor_override(&self, id: ActorId, params: &BehaviorParams) -> Result<(), EnvError>;
}

/// A full simulator connection: world, catalog and sensors.
pub trait Simulator: WorldService + ActorCatalog + SensorAttachPoint {}

impl<T> Simulator for T where T: WorldService + ActorCatalog + SensorAttachPoint {}
