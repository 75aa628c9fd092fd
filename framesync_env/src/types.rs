//! Common value types shared by the simulator and the coordination engine.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Simulator-assigned identifier of a spawned actor (vehicle or sensor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u32);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// Simulator-assigned identifier of an attached sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorId(pub u32);

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sensor#{}", self.0)
    }
}

/// Orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl Rotation {
    pub fn new(pitch: f64, yaw: f64, roll: f64) -> Self {
        Self { pitch, yaw, roll }
    }
}

/// Location + orientation, in world coordinates or relative to a parent actor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// [x, y, z] in meters
    pub location: Vector3<f64>,
    pub rotation: Rotation,
}

impl Transform {
    pub fn new(location: Vector3<f64>, rotation: Rotation) -> Self {
        Self { location, rotation }
    }

    /// Transform at `[x, y, z]` with no rotation.
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            location: Vector3::new(x, y, z),
            rotation: Rotation::default(),
        }
    }

    /// Top-down view `height` meters above this transform.
    pub fn overhead(&self, height: f64) -> Self {
        Self {
            location: self.location + Vector3::new(0.0, 0.0, height),
            rotation: Rotation::new(-90.0, 0.0, 0.0),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::at(0.0, 0.0, 0.0)
    }
}

/// World stepping configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldSettings {
    /// When true the world only advances on explicit step requests
    pub synchronous_mode: bool,

    /// Fixed simulated seconds per step (None = variable, wall-clock driven)
    pub fixed_delta_seconds: Option<f64>,
}

/// Weather preset applied at startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherParameters {
    pub cloudiness: f64,
    pub precipitation: f64,
    pub fog_density: f64,
}

impl Default for WeatherParameters {
    fn default() -> Self {
        Self {
            cloudiness: 10.0,
            precipitation: 10.0,
            fog_density: 10.0,
        }
    }
}

/// An actor template with settable attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Blueprint {
    /// e.g. "vehicle.tesla.model3", "sensor.camera.rgb"
    pub id: String,

    /// Current attribute values
    pub attributes: BTreeMap<String, String>,

    /// Values the simulator suggests for randomizable attributes
    pub recommended: BTreeMap<String, Vec<String>>,
}

impl Blueprint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Adds a randomizable attribute with its recommended values.
    pub fn with_recommended(mut self, key: &str, values: &[&str]) -> Self {
        self.recommended
            .insert(key.to_string(), values.iter().map(|v| v.to_string()).collect());
        if let Some(first) = values.first() {
            self.attributes.insert(key.to_string(), first.to_string());
        }
        self
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key) || self.recommended.contains_key(key)
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn recommended_values(&self, key: &str) -> &[String] {
        self.recommended.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// One "spawn actor, then hand it to the autopilot" instruction of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnCommand {
    pub blueprint: Blueprint,
    pub transform: Transform,

    /// Traffic-manager port to register the future actor with
    pub autopilot: Option<u16>,
}

/// Shape of a sensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PayloadKind {
    /// RGBA image
    Image { width: u32, height: u32 },

    /// 3D point cloud
    PointCloud { points: u32 },
}

impl PayloadKind {
    /// File extension used when the payload is persisted.
    pub fn extension(&self) -> &'static str {
        match self {
            PayloadKind::Image { .. } => "png",
            PayloadKind::PointCloud { .. } => "ply",
        }
    }
}

/// A raw measurement delivered by a sensor callback.
#[derive(Debug, Clone)]
pub struct SensorPayload {
    /// Simulator frame the measurement was taken in
    pub frame: u64,

    /// Simulation time in seconds
    pub timestamp: f64,

    pub kind: PayloadKind,
    pub data: Vec<u8>,
}

/// Driving-behavior parameters for the traffic-policy service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BehaviorParams {
    /// Percentage of traffic lights/signs ignored (0-100)
    pub ignore_signals_pct: f64,

    /// Minimum distance to the leading vehicle in meters
    pub min_follow_distance: f64,

    /// Percentage below the speed limit; negative values drive faster
    pub speed_bias_pct: f64,
}

/// Read-only view of a live actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorSnapshot {
    pub id: ActorId,
    pub type_id: String,
    pub role_name: Option<String>,
    pub transform: Transform,
}

/// Glob match where `*` matches any run of characters.
///
/// Used for actor and blueprint filters such as `vehicle.*`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}
