//! Fault scenarios for the frame-sync harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// FS-001: every sensor delivers on time
    Nominal,

    /// FS-002: the lidar never delivers
    DroppedSensor,

    /// FS-003: the lidar is slower than the drain timeout
    SlowSensor,

    /// FS-004: one request of the spawn batch names an unknown blueprint
    BlueprintFault,

    /// FS-005: more vehicles requested than spawn points
    CrowdedMap,

    /// FS-006: termination requested while a step is draining
    Interrupt,

    /// FS-007: the simulator stops answering step requests
    ClockLoss,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Nominal,
            ScenarioId::DroppedSensor,
            ScenarioId::SlowSensor,
            ScenarioId::BlueprintFault,
            ScenarioId::CrowdedMap,
            ScenarioId::Interrupt,
            ScenarioId::ClockLoss,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Nominal => "nominal",
            ScenarioId::DroppedSensor => "dropped_sensor",
            ScenarioId::SlowSensor => "slow_sensor",
            ScenarioId::BlueprintFault => "blueprint_fault",
            ScenarioId::CrowdedMap => "crowded_map",
            ScenarioId::Interrupt => "interrupt",
            ScenarioId::ClockLoss => "clock_loss",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Nominal => "Camera and lidar deliver every step, all steps full",
            ScenarioId::DroppedSensor => "Lidar withheld, every step partial with lidar missing",
            ScenarioId::SlowSensor => "Lidar latency above the drain timeout, late records reported",
            ScenarioId::BlueprintFault => "One bogus blueprint in the batch fails alone",
            ScenarioId::CrowdedMap => "Fleet clamped to spawn points - 1, ego still spawned",
            ScenarioId::Interrupt => "Cancel mid-drain, cleanup leaves no actors behind",
            ScenarioId::ClockLoss => "Step requests time out, run ends fatally after cleanup",
        }
    }

    /// True when the scenario is expected to end with a fatal error.
    pub fn expects_fatal(&self) -> bool {
        matches!(self, ScenarioId::ClockLoss)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nominal" | "fs-001" => Ok(ScenarioId::Nominal),
            "dropped_sensor" | "droppedsensor" | "fs-002" => Ok(ScenarioId::DroppedSensor),
            "slow_sensor" | "slowsensor" | "fs-003" => Ok(ScenarioId::SlowSensor),
            "blueprint_fault" | "blueprintfault" | "fs-004" => Ok(ScenarioId::BlueprintFault),
            "crowded_map" | "crowdedmap" | "fs-005" => Ok(ScenarioId::CrowdedMap),
            "interrupt" | "fs-006" => Ok(ScenarioId::Interrupt),
            "clock_loss" | "clockloss" | "fs-007" => Ok(ScenarioId::ClockLoss),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
