//! FrameSync Simulation Harness
//!
//! This crate provides a deterministic in-memory simulator that implements
//! every collaborator interface of `framesync_env`, so the coordination
//! engine can be exercised end to end without a real simulator.
//!
//! # Fault injection
//!
//! All sources of trouble the engine must survive are controllable:
//! - **Sensors**: withhold, delay or drop any sensor's deliveries
//! - **Clock**: stall the world at a given frame
//! - **Connection**: fail every world call
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      SimWorld                        │
//! │  SimClock ──► step() ──► tokio runtime (sensor I/O)  │
//! │                              │  latency + jitter     │
//! │                              ▼                       │
//! │                    DeliveryController                │
//! └──────────────────────────────┬───────────────────────┘
//!                                │ callbacks
//!                                ▼
//!                 framesync_core::Coordinator
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use framesync_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_steps(10).run(ScenarioId::DroppedSensor);
//! assert!(result.passed);
//! ```

mod context;
mod delivery;
mod exporter;
mod runner;
pub mod scenarios;
mod storage;
mod world;

pub use context::SimClock;
pub use delivery::DeliveryController;
pub use exporter::{ExportSummary, SimExport, StepFrame};
pub use runner::{ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use storage::{AnySink, DiskSink, MemorySink};
pub use world::{SimConfig, SimWorld, TrafficState};
