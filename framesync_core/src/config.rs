//! Configuration for a coordination run.
//!
//! Every section has defaults matching the reference rig (20 Hz synchronous
//! stepping, 1 s sensor wait, camera + lidar on the ego vehicle, 20 vehicles
//! with one adversarial driver). A JSON file may override any subset.

use crate::policy::GlobalTrafficPolicy;
use crate::sensor_bridge::SensorSpec;
use crate::error::SyncError;

use framesync_env::WeatherParameters;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub clock: ClockConfig,
    pub queue: QueueConfig,
    pub fleet: FleetConfig,
    pub policy: GlobalTrafficPolicy,

    /// Sensors attached to the ego vehicle
    pub sensors: Vec<SensorSpec>,

    pub weather: Option<WeatherParameters>,

    /// Directory sensor payloads are written to
    pub output_dir: PathBuf,

    /// Seed for spawn-point shuffling and blueprint choice
    pub seed: u64,

    /// Keep the spectator camera above the ego vehicle
    pub follow_ego: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            queue: QueueConfig::default(),
            fleet: FleetConfig::default(),
            policy: GlobalTrafficPolicy::default(),
            sensors: SensorSpec::default_rig(),
            weather: Some(WeatherParameters::default()),
            output_dir: PathBuf::from("outputs/output_synchronized"),
            seed: 42,
            follow_ego: true,
        }
    }
}

impl SyncConfig {
    /// Loads a JSON config file. Missing sections keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, SyncError> {
        let config: SyncConfig =
            serde_json::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if !(self.clock.fixed_delta_seconds > 0.0) {
            return Err(SyncError::Config(
                "clock.fixed_delta_seconds must be positive".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(SyncError::Config("queue.capacity must be at least 1".to_string()));
        }
        if self.queue.timeout_ms == 0 {
            return Err(SyncError::Config("queue.timeout_ms must be at least 1".to_string()));
        }

        let mut names = HashSet::new();
        for sensor in &self.sensors {
            if !names.insert(sensor.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate sensor name '{}'",
                    sensor.name
                )));
            }
        }
        Ok(())
    }
}

/// World stepping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Simulated seconds per step (0.05 = 20 Hz)
    pub fixed_delta_seconds: f64,
    pub synchronous_mode: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            fixed_delta_seconds: 0.05,
            synchronous_mode: true,
        }
    }
}

/// Rendezvous queue sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Records buffered per sensor lane
    pub capacity: usize,

    /// Wait per drain attempt in milliseconds
    pub timeout_ms: u64,
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            timeout_ms: 1000,
        }
    }
}

/// Fleet population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Autopilot vehicles to spawn besides the ego vehicle
    pub vehicles: usize,

    /// How many of them get the adversarial override
    pub adversarial: usize,

    /// Traffic-manager port
    pub tm_port: u16,

    pub blueprint_filter: String,
    pub ego_blueprint: String,
    pub ego_color: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            vehicles: 20,
            adversarial: 1,
            tm_port: 8000,
            blueprint_filter: "vehicle.*".to_string(),
            ego_blueprint: "vehicle.mercedes-benz.coupe".to_string(),
            ego_color: "0, 255, 0".to_string(),
        }
    }
}
