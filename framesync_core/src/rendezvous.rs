//! Rendezvous Queue - correlates step ids with sensor deliveries.
//!
//! The queue is the only mutable state shared between sensor producer threads
//! and the coordination thread. It is made of one bounded crossbeam lane per
//! registered sensor:
//!
//! ```text
//! camera thread --push--> [lane "camera" | cap N] --\
//!                                                    +--> Select --> try_receive(timeout)
//! lidar thread  --push--> [lane "lidar"  | cap N] --/
//! ```
//!
//! - FIFO order is preserved per sensor; there is no ordering across sensors.
//! - `push` never blocks: a full lane evicts its own oldest record.
//! - Records for steps the clock has not issued yet are rejected.

use crate::clock::{StepId, StepWatermark};
use crate::error::SyncError;
use crate::metrics::{QueueMetrics, QueueStats};

use crossbeam_channel::{bounded, Receiver, Select, Sender, TrySendError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Correlation record pushed by a sensor bridge for one delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRecord {
    pub step: StepId,
    pub sensor: String,

    /// Where the payload was persisted
    pub payload_ref: PathBuf,
}

impl SensorRecord {
    pub fn new(step: StepId, sensor: impl Into<String>, payload_ref: impl Into<PathBuf>) -> Self {
        Self {
            step,
            sensor: sensor.into(),
            payload_ref: payload_ref.into(),
        }
    }
}

/// What happened to a pushed record.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Accepted,

    /// Accepted after evicting the lane's oldest record
    DroppedOldest { dropped: StepId },

    /// The lane stayed full under contention and the incoming record was lost
    DroppedIncoming,

    /// The record references a step the clock has not issued
    RejectedFuture { latest: StepId },

    /// The lane was closed by a detach
    Closed,
}

/// No record arrived before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no sensor record arrived within the wait window")]
pub struct RecvTimeout;

/// Producer half of one sensor lane. Cheap to clone, safe to use from any thread.
#[derive(Clone)]
pub struct LaneSender {
    sensor: String,
    tx: Sender<SensorRecord>,

    /// Receiver clone used only to evict the oldest record when full
    evict: Receiver<SensorRecord>,

    open: Arc<AtomicBool>,
    watermark: StepWatermark,
    metrics: Arc<QueueMetrics>,
}

impl LaneSender {
    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    /// Pushes a record without blocking.
    pub fn push(&self, record: SensorRecord) -> PushOutcome {
        if !self.open.load(Ordering::Acquire) {
            self.metrics.record_closed_push();
            return PushOutcome::Closed;
        }

        if !self.watermark.admits(record.step) {
            let latest = self.watermark.latest();
            self.metrics.record_future_reject();
            warn!(
                "Rejected '{}' record for {}: latest issued is {}",
                self.sensor, record.step, latest
            );
            return PushOutcome::RejectedFuture { latest };
        }

        let attempts = self.tx.capacity().unwrap_or(0) + 1;
        let mut record = record;
        let mut dropped = None;

        for _ in 0..attempts {
            match self.tx.try_send(record) {
                Ok(()) => {
                    self.metrics.record_accepted();
                    return match dropped {
                        Some(step) => PushOutcome::DroppedOldest { dropped: step },
                        None => PushOutcome::Accepted,
                    };
                }
                Err(TrySendError::Full(r)) => {
                    record = r;
                    if let Ok(old) = self.evict.try_recv() {
                        self.metrics.record_overflow_drop();
                        warn!(
                            "Lane '{}' full, dropped oldest record ({})",
                            self.sensor, old.step
                        );
                        dropped = Some(old.step);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.metrics.record_closed_push();
                    return PushOutcome::Closed;
                }
            }
        }

        self.metrics.record_overflow_drop();
        warn!("Lane '{}' stayed full, dropped incoming {}", self.sensor, record.step);
        PushOutcome::DroppedIncoming
    }
}

/// Consumer half of one sensor lane.
struct Lane {
    sensor: String,
    rx: Receiver<SensorRecord>,
    open: Arc<AtomicBool>,

    /// False once every producer handle has been dropped
    live: bool,
}

/// Bounded multi-lane channel drained by the coordination thread.
pub struct RendezvousQueue {
    capacity: usize,
    lanes: Vec<Lane>,
    watermark: StepWatermark,
    metrics: Arc<QueueMetrics>,
}

impl RendezvousQueue {
    /// Creates an empty queue. `capacity` is the bound of each lane.
    pub fn new(capacity: usize, watermark: StepWatermark) -> Self {
        Self {
            capacity: capacity.max(1),
            lanes: Vec::new(),
            watermark,
            metrics: Arc::new(QueueMetrics::new()),
        }
    }

    /// Opens the lane for a sensor and returns its producer handle.
    pub fn open_lane(&mut self, sensor: &str) -> Result<LaneSender, SyncError> {
        if self.lanes.iter().any(|lane| lane.sensor == sensor) {
            return Err(SyncError::DuplicateSensor(sensor.to_string()));
        }

        let (tx, rx) = bounded(self.capacity);
        let open = Arc::new(AtomicBool::new(true));

        self.lanes.push(Lane {
            sensor: sensor.to_string(),
            rx: rx.clone(),
            open: open.clone(),
            live: true,
        });

        Ok(LaneSender {
            sensor: sensor.to_string(),
            tx,
            evict: rx,
            open,
            watermark: self.watermark.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Closes a sensor's lane. Buffered records are discarded and later
    /// pushes report [`PushOutcome::Closed`].
    pub fn close_lane(&mut self, sensor: &str) -> bool {
        match self.lanes.iter().position(|lane| lane.sensor == sensor) {
            Some(idx) => {
                let lane = self.lanes.remove(idx);
                lane.open.store(false, Ordering::Release);
                debug!("Closed lane '{}' ({} records discarded)", sensor, lane.rx.len());
                true
            }
            None => false,
        }
    }

    /// Waits up to `timeout` for the next record from any lane.
    pub fn try_receive(&mut self, timeout: Duration) -> Result<SensorRecord, RecvTimeout> {
        self.try_receive_until(Instant::now() + timeout)
    }

    /// Waits until `deadline` for the next record from any lane.
    pub fn try_receive_until(&mut self, deadline: Instant) -> Result<SensorRecord, RecvTimeout> {
        loop {
            let live: Vec<usize> = (0..self.lanes.len())
                .filter(|&i| self.lanes[i].live)
                .collect();

            // Nothing can arrive without a live producer
            if live.is_empty() {
                return Err(RecvTimeout);
            }

            let (lane_idx, result) = {
                let mut sel = Select::new();
                for &i in &live {
                    sel.recv(&self.lanes[i].rx);
                }

                let oper = match sel.select_deadline(deadline) {
                    Ok(oper) => oper,
                    Err(_) => return Err(RecvTimeout),
                };
                let lane_idx = live[oper.index()];
                let result = oper.recv(&self.lanes[lane_idx].rx);
                (lane_idx, result)
            };

            match result {
                Ok(record) => return Ok(record),
                Err(_) => {
                    let lane = &mut self.lanes[lane_idx];
                    lane.live = false;
                    debug!("Lane '{}' has no producers left", lane.sensor);
                }
            }
        }
    }

    /// Sensors with an open lane, in registration order.
    pub fn sensors(&self) -> impl Iterator<Item = &str> {
        self.lanes.iter().map(|lane| lane.sensor.as_str())
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently buffered across all lanes.
    pub fn pending(&self) -> usize {
        self.lanes.iter().map(|lane| lane.rx.len()).sum()
    }

    pub fn stats(&self) -> QueueStats {
        self.metrics.snapshot()
    }

    pub fn watermark(&self) -> &StepWatermark {
        &self.watermark
    }
}
