//! FrameSync Environment Abstraction Layer
//!
//! This crate describes the simulator as a set of collaborator interfaces so
//! the coordination engine in `framesync_core` never talks to a concrete
//! simulator API.
//!
//! # Collaborators
//!
//! - **World/Clock**: settings, step advancement, actor queries
//! - **Actor catalog**: blueprints, spawning, batched commands, destruction
//! - **Sensor attach point**: sensors and their delivery callbacks
//! - **Storage sink**: persisting sensor payloads
//! - **Traffic policy**: global and per-actor driving behavior
//!
//! # Example
//!
//! ```ignore
//! use framesync_env::{Simulator, WorldService};
//!
//! fn tick_once<S: Simulator>(sim: &S) -> Result<u64, framesync_env::EnvError> {
//!     sim.advance_step()
//! }
//! ```

mod error;
mod types;
mod world;

pub use error::EnvError;
pub use types::{
    glob_match, ActorId, ActorSnapshot, BehaviorParams, Blueprint, PayloadKind, Rotation,
    SensorId, SensorPayload, SpawnCommand, Transform, WeatherParameters, WorldSettings,
};
pub use world::{
    ActorCatalog, DeliveryCallback, SensorAttachPoint, Simulator, StorageSink, TrafficPolicy,
    WorldService,
};
