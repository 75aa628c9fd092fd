//! Coordinator Loop - the per-step rendezvous state machine.
//!
//! ```text
//! Idle ──► Stepping ──► Draining ──► Reporting ──┐
//!             ▲                                  │
//!             └──────────────────────────────────┤
//!                                                ▼ (cancel / max steps / fatal)
//!                                          ShuttingDown ──► Terminated
//! ```
//!
//! A new step is never issued before the previous one has been drained, so a
//! record can only be correlated with the step it was produced in. Shutdown
//! runs on every exit path, including `Drop`.

use crate::clock::{ClockController, ClockRole, StepId};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncWarning};
use crate::fleet::{FleetProvisioner, PendingBatch, ProvisionedBatch};
use crate::metrics::QueueStats;
use crate::policy::PolicyOverrider;
use crate::registry::ActorRegistry;
use crate::rendezvous::{RecvTimeout, RendezvousQueue, SensorRecord};
use crate::sensor_bridge::{Registration, SensorBridge, SensorSpec};

use framesync_env::{ActorId, Simulator, StorageSink, TrafficPolicy};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Height of the top-down spectator view above the followed actor.
pub const SPECTATOR_HEIGHT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    Stepping,
    Draining,
    Reporting,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCompleteness {
    /// Every registered sensor delivered within its wait window
    Full,

    /// At least one sensor missed the step
    Partial,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: StepId,
    pub completeness: StepCompleteness,

    /// Records produced in this step
    pub received: Vec<SensorRecord>,

    /// Sensors that did not deliver, in registration order
    pub missing: Vec<String>,

    /// Records of earlier steps that arrived during this drain
    pub late: Vec<SensorRecord>,

    /// Overflow drops since the previous report
    pub dropped: u64,

    pub warnings: Vec<SyncWarning>,
    pub elapsed: Duration,
}

impl StepReport {
    pub fn is_full(&self) -> bool {
        self.completeness == StepCompleteness::Full
    }
}

/// Termination signal shared with an interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Totals of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub steps: u64,
    pub full_steps: u64,
    pub partial_steps: u64,
    pub missing_deliveries: u64,
    pub late_deliveries: u64,
    pub last_step: Option<StepId>,
    pub cancelled: bool,
    pub queue: QueueStats,
}

/// Drives the clock and drains sensor records, one step at a time.
pub struct Coordinator<S, T, K>
where
    S: Simulator + 'static,
    T: TrafficPolicy,
    K: StorageSink + 'static,
{
    sim: Arc<S>,
    clock: ClockController<S>,
    queue: RendezvousQueue,
    bridge: SensorBridge<S, K>,
    registrations: Vec<Registration>,
    provisioner: FleetProvisioner<S>,
    overrider: PolicyOverrider<T>,

    /// Wait per drain attempt
    timeout: Duration,

    synchronous: bool,

    /// Actor the spectator camera follows
    follow: Option<ActorId>,

    state: CoordinatorState,
    summary: RunSummary,
    reported_drops: u64,
}

impl<S, T, K> Coordinator<S, T, K>
where
    S: Simulator + 'static,
    T: TrafficPolicy,
    K: StorageSink + 'static,
{
    /// Takes over the world clock and prepares an empty rendezvous.
    ///
    /// The calling thread becomes the coordination thread.
    pub fn new(
        sim: Arc<S>,
        traffic: Arc<T>,
        storage: Arc<K>,
        config: &SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let clock = ClockController::new(sim.clone(), &config.clock)?;
        let queue = RendezvousQueue::new(config.queue.capacity, clock.watermark());
        let bridge = SensorBridge::new(sim.clone(), storage, config.output_dir.clone());
        let provisioner = FleetProvisioner::new(sim.clone());

        Ok(Self {
            sim,
            clock,
            queue,
            bridge,
            registrations: Vec::new(),
            provisioner,
            overrider: PolicyOverrider::new(traffic),
            timeout: config.queue.timeout(),
            synchronous: config.clock.synchronous_mode,
            follow: None,
            state: CoordinatorState::Idle,
            summary: RunSummary::default(),
            reported_drops: 0,
        })
    }

    /// Attaches a sensor to a confirmed actor and starts expecting it every step.
    pub fn attach_sensor(
        &mut self,
        spec: &SensorSpec,
        parent: ActorId,
    ) -> Result<&Registration, SyncError> {
        if !self.provisioner.registry().is_confirmed(parent) {
            return Err(SyncError::NotConfirmed(parent));
        }
        let registration = self.bridge.attach(&mut self.queue, spec, parent)?;
        self.registrations.push(registration);
        Ok(&self.registrations[self.registrations.len() - 1])
    }

    /// Detaches one sensor by name. Returns false if it was not attached.
    pub fn detach_sensor(&mut self, sensor: &str) -> Result<bool, SyncError> {
        let Some(idx) = self.registrations.iter().position(|r| r.sensor == sensor) else {
            return Ok(false);
        };
        let registration = self.registrations.remove(idx);
        self.bridge.detach(&mut self.queue, registration)?;
        Ok(true)
    }

    /// The synchronization point after a spawn batch.
    ///
    /// Once sensors are attached the confirming advance is a regular step:
    /// it is drained and reported like any other, and its report is returned
    /// with the batch.
    pub fn confirm_batch(
        &mut self,
        pending: PendingBatch,
    ) -> Result<(ProvisionedBatch, Option<StepReport>), SyncError> {
        self.ensure_running()?;
        if self.registrations.is_empty() {
            let batch = self.provisioner.confirm(pending, &self.clock)?;
            return Ok((batch, None));
        }

        let report = self.step_once()?;
        let batch = self.provisioner.confirm_at(pending, report.step);
        Ok((batch, Some(report)))
    }

    /// Detaches the actor's sensors, then untracks and destroys it.
    /// Returns false if the actor was not tracked.
    pub fn destroy_actor(&mut self, actor_id: ActorId) -> Result<bool, SyncError> {
        if !self.provisioner.registry().contains(actor_id) {
            return Ok(false);
        }

        let (attached, kept): (Vec<Registration>, Vec<Registration>) = self
            .registrations
            .drain(..)
            .partition(|r| r.parent == actor_id);
        self.registrations = kept;

        let mut first: Option<SyncError> = None;
        for registration in attached {
            if let Err(e) = self.bridge.detach(&mut self.queue, registration) {
                error!("{}", e);
                first.get_or_insert(e);
            }
        }

        if self.follow == Some(actor_id) {
            self.follow = None;
        }

        let destroyed = self.provisioner.destroy(actor_id)?;
        match first {
            Some(e) => Err(e),
            None => Ok(destroyed),
        }
    }

    /// Makes the first `count` fleet vehicles adversarial.
    pub fn designate_adversarial(&mut self, count: usize) -> Result<Vec<ActorId>, SyncError> {
        self.overrider
            .designate_adversarial(self.provisioner.registry_mut(), count)
    }

    /// Runs Stepping, Draining and Reporting for exactly one step.
    pub fn step_once(&mut self) -> Result<StepReport, SyncError> {
        self.ensure_running()?;
        let started = Instant::now();

        self.state = CoordinatorState::Stepping;
        let step = self.clock.advance()?;
        self.follow_spectator();

        self.state = CoordinatorState::Draining;
        let (received, missing, late) = self.drain(step);

        self.state = CoordinatorState::Reporting;
        let stats = self.queue.stats();
        let dropped = stats.overflow_drops - self.reported_drops;
        self.reported_drops = stats.overflow_drops;

        let completeness = if missing.is_empty() {
            StepCompleteness::Full
        } else {
            StepCompleteness::Partial
        };

        let warnings: Vec<SyncWarning> = missing
            .iter()
            .map(|sensor| SyncWarning::SensorDeliveryTimeout {
                step,
                sensor: sensor.clone(),
            })
            .collect();

        match completeness {
            StepCompleteness::Full => info!(
                "{}: full ({} records, {} late)",
                step,
                received.len(),
                late.len()
            ),
            StepCompleteness::Partial => warn!(
                "{}: partial, missing {:?} ({} records, {} late)",
                step,
                missing,
                received.len(),
                late.len()
            ),
        }

        self.summary.steps += 1;
        match completeness {
            StepCompleteness::Full => self.summary.full_steps += 1,
            StepCompleteness::Partial => self.summary.partial_steps += 1,
        }
        self.summary.missing_deliveries += missing.len() as u64;
        self.summary.late_deliveries += late.len() as u64;
        self.summary.last_step = Some(step);

        Ok(StepReport {
            step,
            completeness,
            received,
            missing,
            late,
            dropped,
            warnings,
            elapsed: started.elapsed(),
        })
    }

    /// Drains one record per expected delivery, each attempt with its own
    /// deadline. Late records are set aside without consuming an attempt.
    fn drain(&mut self, step: StepId) -> (Vec<SensorRecord>, Vec<String>, Vec<SensorRecord>) {
        let mut outstanding: Vec<String> = self
            .registrations
            .iter()
            .flat_map(|r| std::iter::repeat(r.sensor.clone()).take(r.expected_per_step))
            .collect();
        let attempts = outstanding.len();

        let mut received = Vec::with_capacity(attempts);
        let mut late = Vec::new();

        for _ in 0..attempts {
            if outstanding.is_empty() {
                break;
            }
            let deadline = Instant::now() + self.timeout;

            loop {
                match self.queue.try_receive_until(deadline) {
                    Ok(record) if record.step < step => {
                        debug!("Late record {} for {}", record.sensor, record.step);
                        late.push(record);
                    }
                    Ok(record) if record.step == step => {
                        match outstanding.iter().position(|s| *s == record.sensor) {
                            Some(idx) => {
                                outstanding.remove(idx);
                                received.push(record);
                                break;
                            }
                            None => {
                                debug!("Extra record from '{}' for {}", record.sensor, step);
                                received.push(record);
                            }
                        }
                    }
                    Ok(record) => {
                        warn!(
                            "Discarding '{}' record for {} while draining {}",
                            record.sensor, record.step, step
                        );
                    }
                    Err(RecvTimeout) => break,
                }
            }
        }

        outstanding.dedup();
        (received, outstanding, late)
    }

    /// Loops until cancelled, `max_steps` is reached or a fatal error occurs.
    ///
    /// Cancellation is honored between steps only. Shutdown always runs
    /// before this returns.
    pub fn run<F>(
        &mut self,
        cancel: &CancelToken,
        max_steps: Option<u64>,
        mut on_report: F,
    ) -> Result<RunSummary, SyncError>
    where
        F: FnMut(&StepReport),
    {
        let outcome = self.run_loop(cancel, max_steps, &mut on_report);
        let cleanup = self.shutdown();

        match (outcome, cleanup) {
            (Err(e), cleanup) => {
                error!("Run failed: {}", e);
                if let Err(c) = cleanup {
                    error!("Cleanup after failure also failed: {}", c);
                }
                Err(e)
            }
            (Ok(()), Err(c)) => Err(c),
            (Ok(()), Ok(())) => Ok(self.summary()),
        }
    }

    fn run_loop<F>(
        &mut self,
        cancel: &CancelToken,
        max_steps: Option<u64>,
        on_report: &mut F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(&StepReport),
    {
        let limit = max_steps.map(|n| self.summary.steps + n);
        loop {
            if cancel.is_cancelled() {
                info!("Termination requested after {}", self.clock.last_step());
                self.summary.cancelled = true;
                return Ok(());
            }
            if limit.is_some_and(|n| self.summary.steps >= n) {
                return Ok(());
            }

            let report = self.step_once()?;
            on_report(&report);
        }
    }

    /// Detaches every sensor, restores the clock settings and destroys every
    /// tracked actor. Each stage runs even if an earlier one failed; the first
    /// failure is returned. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), SyncError> {
        if self.state == CoordinatorState::Terminated {
            return Ok(());
        }
        self.state = CoordinatorState::ShuttingDown;
        info!("Shutting down");

        let mut first: Option<SyncError> = None;
        let mut record = |result: Result<(), SyncError>| {
            if let Err(e) = result {
                error!("{}", e);
                first.get_or_insert(e);
            }
        };

        for registration in self.registrations.drain(..) {
            record(self.bridge.detach(&mut self.queue, registration));
        }

        record(self.clock.restore());

        if let Err(e) = self.overrider.release() {
            warn!("Failed to release traffic policy: {}", e);
        }

        record(self.provisioner.teardown().map(|n| {
            info!("Destroyed {} actors", n);
        }));

        self.summary.queue = self.queue.stats();
        self.state = CoordinatorState::Terminated;
        info!("Terminated");

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        match self.state {
            CoordinatorState::ShuttingDown | CoordinatorState::Terminated => Err(
                SyncError::clock("coordinator has been shut down"),
            ),
            _ => Ok(()),
        }
    }

    fn follow_spectator(&self) {
        let Some(actor) = self.follow else {
            return;
        };
        let placed = self
            .provisioner
            .actor_transform(actor)
            .and_then(|t| {
                self.sim
                    .set_spectator_transform(&t.overhead(SPECTATOR_HEIGHT))
                    .map_err(SyncError::from)
            });
        if let Err(e) = placed {
            debug!("Spectator follow skipped: {}", e);
        }
    }

    /// Keeps the spectator camera above `actor` after every step.
    pub fn set_follow(&mut self, actor: Option<ActorId>) {
        self.follow = actor;
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = self.summary.clone();
        summary.queue = self.queue.stats();
        summary
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn sim(&self) -> &Arc<S> {
        &self.sim
    }

    pub fn clock(&self) -> &ClockController<S> {
        &self.clock
    }

    pub fn clock_role(&self) -> ClockRole {
        self.clock.role()
    }

    pub fn queue(&self) -> &RendezvousQueue {
        &self.queue
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn registry(&self) -> &ActorRegistry {
        self.provisioner.registry()
    }

    pub fn provisioner(&self) -> &FleetProvisioner<S> {
        &self.provisioner
    }

    pub fn provisioner_mut(&mut self) -> &mut FleetProvisioner<S> {
        &mut self.provisioner
    }

    pub fn overrider(&self) -> &PolicyOverrider<T> {
        &self.overrider
    }

    pub fn overrider_mut(&mut self) -> &mut PolicyOverrider<T> {
        &mut self.overrider
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when the world is stepped in lockstep with this coordinator.
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }
}

impl<S, T, K> Drop for Coordinator<S, T, K>
where
    S: Simulator + 'static,
    T: TrafficPolicy,
    K: StorageSink + 'static,
{
    fn drop(&mut self) {
        if self.state != CoordinatorState::Terminated {
            if let Err(e) = self.shutdown() {
                error!("Shutdown on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::ActorSpawnRequest;
    use crate::registry::ActorRole;
    use crate::test_support::{FakeWorld, RecordingSink};
    use framesync_env::{ActorCatalog, Transform, WorldService};

    type FakeCoordinator = Coordinator<FakeWorld, FakeWorld, RecordingSink>;

    fn config(timeout_ms: u64) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.queue.timeout_ms = timeout_ms;
        config.output_dir = "out".into();
        config
    }

    /// A coordinator with a confirmed ego vehicle carrying camera + lidar.
    fn rig(timeout_ms: u64) -> (Arc<FakeWorld>, FakeCoordinator, ActorId) {
        let world = Arc::new(FakeWorld::new(6));
        let mut coordinator = Coordinator::new(
            world.clone(),
            world.clone(),
            Arc::new(RecordingSink::default()),
            &config(timeout_ms),
        )
        .unwrap();

        let request = ActorSpawnRequest::ego(
            "vehicle.mercedes-benz.coupe",
            "0, 255, 0",
            Transform::at(0.0, 0.0, 0.3),
            8000,
        );
        let pending = coordinator.provisioner_mut().provision_batch(vec![request]).unwrap();
        let (batch, report) = coordinator.confirm_batch(pending).unwrap();
        assert!(report.is_none());
        let ego = batch.spawned_ids()[0];

        for spec in SensorSpec::default_rig() {
            coordinator.attach_sensor(&spec, ego).unwrap();
        }
        (world, coordinator, ego)
    }

    #[test]
    fn test_full_step_when_all_sensors_deliver() {
        let (_world, mut coordinator, _) = rig(200);

        let report = coordinator.step_once().unwrap();

        assert!(report.is_full());
        assert!(report.missing.is_empty());
        assert_eq!(report.received.len(), 2);
        assert!(report.received.iter().all(|r| r.step == report.step));
        assert_eq!(coordinator.state(), CoordinatorState::Reporting);
    }

    #[test]
    fn test_withheld_sensor_makes_step_partial() {
        let (world, mut coordinator, _) = rig(50);
        let lidar = coordinator.registrations()[1].sensor_id;
        world.withhold(lidar);

        let start = Instant::now();
        let report = coordinator.step_once().unwrap();

        assert_eq!(report.completeness, StepCompleteness::Partial);
        assert_eq!(report.missing, vec!["lidar".to_string()]);
        assert_eq!(report.received.len(), 1);
        assert_eq!(report.received[0].sensor, "camera");
        assert!(matches!(
            report.warnings.as_slice(),
            [SyncWarning::SensorDeliveryTimeout { sensor, .. }] if sensor == "lidar"
        ));
        assert!(start.elapsed() < Duration::from_secs(2));

        // The loop keeps going
        let next = coordinator.step_once().unwrap();
        assert_eq!(next.step, report.step.next());
    }

    #[test]
    fn test_sensor_on_unconfirmed_actor_rejected() {
        let world = Arc::new(FakeWorld::new(4));
        let mut coordinator: FakeCoordinator = Coordinator::new(
            world.clone(),
            world.clone(),
            Arc::new(RecordingSink::default()),
            &config(50),
        )
        .unwrap();

        let request = ActorSpawnRequest::new("vehicle.audi.tt", Transform::at(0.0, 0.0, 0.3), ActorRole::Fleet);
        let _pending = coordinator.provisioner_mut().provision_batch(vec![request]).unwrap();
        let id = coordinator.registry().ids()[0];

        let err = coordinator.attach_sensor(&SensorSpec::camera(), id).unwrap_err();
        assert!(matches!(err, SyncError::NotConfirmed(_)));
        assert_eq!(world.sensor_count(), 0);
    }

    #[test]
    fn test_run_stops_at_max_steps_and_cleans_up() {
        let (world, mut coordinator, _) = rig(100);
        let mut reports = Vec::new();

        let summary = coordinator
            .run(&CancelToken::new(), Some(3), |r| reports.push(r.step))
            .unwrap();

        assert_eq!(summary.steps, 3);
        assert_eq!(summary.full_steps, 3);
        assert_eq!(reports.len(), 3);
        assert!(!summary.cancelled);

        assert_eq!(coordinator.state(), CoordinatorState::Terminated);
        assert!(coordinator.registry().is_empty());
        assert!(coordinator.registrations().is_empty());
        assert_eq!(world.actor_count(), 0);
        assert_eq!(world.sensor_count(), 0);
        assert!(!world.settings().unwrap().synchronous_mode);
    }

    #[test]
    fn test_cancel_is_honored_after_drain() {
        let (world, mut coordinator, _) = rig(100);
        let cancel = CancelToken::new();

        let trigger = cancel.clone();
        let summary = coordinator
            .run(&cancel, None, move |_| trigger.cancel())
            .unwrap();

        assert_eq!(summary.steps, 1);
        assert!(summary.cancelled);
        assert_eq!(world.actor_count(), 0);
    }

    #[test]
    fn test_fatal_clock_failure_still_cleans_up() {
        let (world, mut coordinator, _) = rig(50);
        world.fail_next_advance();

        let err = coordinator.run(&CancelToken::new(), Some(5), |_| {}).unwrap_err();

        assert!(matches!(err, SyncError::ClockAdvanceFailed(_)));
        assert_eq!(err.exit_code(), 1);
        assert!(coordinator.registry().is_empty());
        assert_eq!(world.actor_count(), 0);
        assert!(!world.settings().unwrap().synchronous_mode);
    }

    #[test]
    fn test_drop_runs_shutdown() {
        let (world, coordinator, _) = rig(50);
        assert_eq!(world.actor_count(), 1);

        drop(coordinator);

        assert_eq!(world.actor_count(), 0);
        assert_eq!(world.sensor_count(), 0);
    }

    #[test]
    fn test_step_after_shutdown_rejected() {
        let (_world, mut coordinator, _) = rig(50);
        coordinator.shutdown().unwrap();
        coordinator.shutdown().unwrap();

        assert!(coordinator.step_once().is_err());
    }

    #[test]
    fn test_spectator_follows_ego() {
        let (world, mut coordinator, ego) = rig(50);
        coordinator.set_follow(Some(ego));

        coordinator.step_once().unwrap();

        let ego_at = world.actor_transform(ego).unwrap();
        let spectator = world.spectator().unwrap();
        approx::assert_relative_eq!(spectator.location.x, ego_at.location.x, epsilon = 1e-9);
        approx::assert_relative_eq!(spectator.location.z, ego_at.location.z + SPECTATOR_HEIGHT, epsilon = 1e-9);
        assert_eq!(spectator.rotation.pitch, -90.0);
    }

    #[test]
    fn test_batch_confirmed_mid_run_is_drained() {
        let (world, mut coordinator, _) = rig(100);
        coordinator.step_once().unwrap();

        let request = ActorSpawnRequest::new("vehicle.audi.tt", Transform::at(10.0, 0.0, 0.3), ActorRole::Fleet);
        let pending = coordinator.provisioner_mut().provision_batch(vec![request]).unwrap();
        let (batch, report) = coordinator.confirm_batch(pending).unwrap();

        let report = report.unwrap();
        assert_eq!(batch.step, report.step);
        assert!(report.is_full());
        assert!(coordinator.provisioner().actor_transform(batch.spawned_ids()[0]).is_ok());
        assert_eq!(world.actor_count(), 2);

        // The confirming step's records were consumed by its own drain
        let next = coordinator.step_once().unwrap();
        assert_eq!(next.step, report.step.next());
        assert!(next.is_full());
        assert!(next.late.is_empty());
        assert_eq!(coordinator.summary().late_deliveries, 0);
        assert_eq!(coordinator.summary().steps, 3);
    }

    #[test]
    fn test_destroying_sensor_parent_detaches_its_sensors() {
        let (world, mut coordinator, ego) = rig(50);
        coordinator.set_follow(Some(ego));
        let sensors: Vec<_> = coordinator.registrations().iter().map(|r| r.sensor_id).collect();

        assert!(coordinator.destroy_actor(ego).unwrap());
        assert!(!coordinator.destroy_actor(ego).unwrap());

        assert!(coordinator.registrations().is_empty());
        assert!(coordinator.registry().is_empty());
        assert_eq!(world.actor_count(), 0);
        for sensor in sensors {
            assert!(!world.sensor_exists(sensor));
        }

        // Nothing is expected from sensors that no longer exist
        let report = coordinator.step_once().unwrap();
        assert!(report.is_full());
        assert!(report.missing.is_empty());
    }

    #[test]
    fn test_late_record_kept_separately() {
        let (world, mut coordinator, _) = rig(50);
        let lidar = coordinator.registrations()[1].sensor_id;

        world.withhold(lidar);
        let first = coordinator.step_once().unwrap();
        assert!(!first.is_full());

        // Withheld payload shows up during the next drain
        world.release(lidar);
        let second = coordinator.step_once().unwrap();

        assert!(second.is_full());
        assert_eq!(second.late.len(), 1);
        assert_eq!(second.late[0].step, first.step);
        assert_eq!(coordinator.summary().late_deliveries, 1);
    }
}
