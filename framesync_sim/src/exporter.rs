//! JSON exporter for run reports.
//!
//! Exports one frame per coordinator step plus the run summary, for offline
//! inspection of which sensors missed which steps.

use framesync_core::{RunSummary, StepCompleteness, StepReport};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// A single step of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFrame {
    pub step: u64,

    /// "full" or "partial"
    pub completeness: String,

    /// Sensors that delivered for this step
    pub received: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub missing: Vec<String>,

    pub late: usize,
    pub dropped: u64,
    pub elapsed_ms: f64,
}

impl StepFrame {
    pub fn from_report(report: &StepReport) -> Self {
        Self {
            step: report.step.value(),
            completeness: match report.completeness {
                StepCompleteness::Full => "full",
                StepCompleteness::Partial => "partial",
            }
            .to_string(),
            received: report.received.iter().map(|r| r.sensor.clone()).collect(),
            missing: report.missing.clone(),
            late: report.late.len(),
            dropped: report.dropped,
            elapsed_ms: report.elapsed.as_secs_f64() * 1000.0,
        }
    }
}

/// Totals copied from the coordinator's run summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportSummary {
    pub steps: u64,
    pub full_steps: u64,
    pub partial_steps: u64,
    pub missing_deliveries: u64,
    pub late_deliveries: u64,
    pub overflow_drops: u64,
    pub cancelled: bool,
}

impl From<&RunSummary> for ExportSummary {
    fn from(summary: &RunSummary) -> Self {
        Self {
            steps: summary.steps,
            full_steps: summary.full_steps,
            partial_steps: summary.partial_steps,
            missing_deliveries: summary.missing_deliveries,
            late_deliveries: summary.late_deliveries,
            overflow_drops: summary.queue.overflow_drops,
            cancelled: summary.cancelled,
        }
    }
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub run_id: Uuid,
    pub scenario: String,
    pub seed: u64,
    pub steps: Vec<StepFrame>,
    pub summary: ExportSummary,
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            scenario: scenario.to_string(),
            seed,
            steps: Vec::new(),
            summary: ExportSummary::default(),
            passed: false,
            failure_reason: None,
        }
    }

    pub fn add_step(&mut self, report: &StepReport) {
        self.steps.push(StepFrame::from_report(report));
    }

    pub fn finalize(&mut self, summary: &RunSummary, passed: bool, failure_reason: Option<String>) {
        self.summary = ExportSummary::from(summary);
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framesync_core::{SensorRecord, StepId};
    use std::time::Duration;

    fn report() -> StepReport {
        StepReport {
            step: StepId(12),
            completeness: StepCompleteness::Partial,
            received: vec![SensorRecord::new(StepId(12), "camera", "000012_camera.png")],
            missing: vec!["lidar".to_string()],
            late: vec![SensorRecord::new(StepId(11), "lidar", "000011_lidar.ply")],
            dropped: 0,
            warnings: Vec::new(),
            elapsed: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_frame_from_report() {
        let frame = StepFrame::from_report(&report());

        assert_eq!(frame.step, 12);
        assert_eq!(frame.completeness, "partial");
        assert_eq!(frame.received, vec!["camera"]);
        assert_eq!(frame.missing, vec!["lidar"]);
        assert_eq!(frame.late, 1);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let mut export = SimExport::new("dropped_sensor", 7);
        export.add_step(&report());
        let summary = RunSummary {
            steps: 1,
            partial_steps: 1,
            missing_deliveries: 1,
            ..RunSummary::default()
        };
        export.finalize(&summary, true, None);
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: SimExport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.run_id, export.run_id);
        assert_eq!(back.summary.partial_steps, 1);
        assert_eq!(back.steps.len(), 1);
        assert!(!text.contains("failure_reason"));
    }
}
