//! Fault injection for sensor delivery and the simulator connection.

use crate::context::lock;

use framesync_env::{EnvError, SensorId};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Controls how (and whether) sensor payloads reach their callbacks.
pub struct DeliveryController {
    /// Sensors whose payloads are held back until released
    withheld: Mutex<HashSet<SensorId>>,

    /// Per-sensor latency override in milliseconds
    latency_ms: Mutex<HashMap<SensorId, u64>>,

    /// Per-sensor loss rate (0.0 - 1.0)
    loss: Mutex<HashMap<SensorId, f64>>,

    /// First frame the world fails to advance to
    stall_at: Mutex<Option<u64>>,

    connected: AtomicBool,
}

impl DeliveryController {
    pub fn new() -> Self {
        Self {
            withheld: Mutex::new(HashSet::new()),
            latency_ms: Mutex::new(HashMap::new()),
            loss: Mutex::new(HashMap::new()),
            stall_at: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// Holds back every payload of `sensor`.
    pub fn withhold(&self, sensor: SensorId) {
        lock(&self.withheld).insert(sensor);
    }

    /// Held payloads go out with the next step.
    pub fn release(&self, sensor: SensorId) {
        lock(&self.withheld).remove(&sensor);
    }

    pub fn is_withheld(&self, sensor: SensorId) -> bool {
        lock(&self.withheld).contains(&sensor)
    }

    pub fn set_latency(&self, sensor: SensorId, latency_ms: u64) {
        lock(&self.latency_ms).insert(sensor, latency_ms);
    }

    /// Latency override for a sensor, if any.
    pub fn latency(&self, sensor: SensorId) -> Option<u64> {
        lock(&self.latency_ms).get(&sensor).copied()
    }

    pub fn set_loss(&self, sensor: SensorId, loss_rate: f64) {
        lock(&self.loss).insert(sensor, loss_rate.clamp(0.0, 1.0));
    }

    pub fn loss(&self, sensor: SensorId) -> f64 {
        *lock(&self.loss).get(&sensor).unwrap_or(&0.0)
    }

    /// Rolls the loss dice for one payload.
    pub fn should_drop<R: Rng + ?Sized>(&self, sensor: SensorId, rng: &mut R) -> bool {
        let rate = self.loss(sensor);
        rate > 0.0 && rng.gen::<f64>() < rate
    }

    /// Every advance to `frame` or later times out.
    pub fn stall_clock_at(&self, frame: u64) {
        *lock(&self.stall_at) = Some(frame);
    }

    pub fn clock_stalls(&self, frame: u64) -> bool {
        lock(&self.stall_at).is_some_and(|at| frame >= at)
    }

    /// Makes every world call fail with a connection error.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn check_connected(&self) -> Result<(), EnvError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EnvError::connection("simulator connection lost"))
        }
    }

    /// Clears every injected fault.
    pub fn heal_all(&self) {
        lock(&self.withheld).clear();
        lock(&self.latency_ms).clear();
        lock(&self.loss).clear();
        *lock(&self.stall_at) = None;
        self.reconnect();
    }
}

impl Default for DeliveryController {
    fn default() -> Self {
        Self::new()
    }
}
