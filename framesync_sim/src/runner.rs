//! Scenario runner - drives the coordinator against a faulty SimWorld.

use crate::exporter::SimExport;
use crate::scenarios::ScenarioId;
use crate::storage::{AnySink, DiskSink, MemorySink};
use crate::world::{SimConfig, SimWorld};

use framesync_core::{
    ActorRole, ActorSpawnRequest, CancelToken, Coordinator, RunSummary, SetupReport, SpawnOutcome,
    StepReport, SyncConfig, SyncError, SyncWarning,
};
use framesync_env::{ActorCatalog, ActorId, SensorId, WorldService, WorldSettings};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Coordinator totals (default if setup never finished)
    pub summary: RunSummary,

    /// Fatal error the run ended with, if any
    pub fatal: Option<String>,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Per-step export of the run
    pub export: SimExport,
}

/// Everything a scenario produced before its checks.
struct Outcome {
    summary: RunSummary,
    fatal: Option<String>,
}

type Checked = Result<Outcome, (Option<RunSummary>, String)>;

fn fail<T>(reason: impl Into<String>) -> Result<T, (Option<RunSummary>, String)> {
    Err((None, reason.into()))
}

/// One coordinator wired to one SimWorld.
struct Session {
    world: Arc<SimWorld>,
    coordinator: Coordinator<SimWorld, SimWorld, AnySink>,
    setup: SetupReport,
    original: WorldSettings,
}

impl Session {
    fn sensor_id(&self, name: &str) -> Option<SensorId> {
        self.coordinator
            .registrations()
            .iter()
            .find(|r| r.sensor == name)
            .map(|r| r.sensor_id)
    }

    fn run(
        &mut self,
        cancel: &CancelToken,
        steps: Option<u64>,
        export: &mut SimExport,
    ) -> (Result<RunSummary, SyncError>, Vec<StepReport>) {
        let mut reports = Vec::new();
        let result = self.coordinator.run(cancel, steps, |report| {
            export.add_step(report);
            reports.push(report.clone());
        });
        (result, reports)
    }

    /// Nothing we created may outlive the run.
    fn verify_cleanup(&self) -> Result<(), String> {
        if !self.coordinator.registry().is_empty() {
            return Err(format!(
                "registry still tracks {} actors",
                self.coordinator.registry().len()
            ));
        }
        if self.world.actor_count() != 0 {
            return Err(format!("{} actors left in the world", self.world.actor_count()));
        }
        if self.world.sensor_count() != 0 {
            return Err(format!("{} sensors left in the world", self.world.sensor_count()));
        }
        let settings = self.world.settings().map_err(|e| e.to_string())?;
        if settings != self.original {
            return Err(format!(
                "world settings not restored: {:?} != {:?}",
                settings, self.original
            ));
        }
        if self.world.traffic().synchronous {
            return Err("traffic manager left in synchronous mode".to_string());
        }
        Ok(())
    }
}

/// Runs fault scenarios.
pub struct ScenarioRunner {
    config: SyncConfig,

    /// Steps per scenario
    steps: u64,

    /// Write payloads under this directory instead of keeping them in memory
    output: Option<PathBuf>,
}

impl ScenarioRunner {
    /// Creates a runner with harness-sized defaults (10 vehicles, 100 ms wait).
    pub fn new(seed: u64) -> Self {
        let mut config = SyncConfig::default();
        config.seed = seed;
        config.fleet.vehicles = 10;
        config.queue.timeout_ms = 100;
        Self::from_config(config)
    }

    /// Creates a runner around a loaded configuration.
    pub fn from_config(config: SyncConfig) -> Self {
        Self {
            config,
            steps: 20,
            output: None,
        }
    }

    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn with_vehicles(mut self, vehicles: usize) -> Self {
        self.config.fleet.vehicles = vehicles;
        self
    }

    pub fn with_adversarial(mut self, adversarial: usize) -> Self {
        self.config.fleet.adversarial = adversarial;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.queue.timeout_ms = timeout_ms;
        self
    }

    pub fn with_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output = Some(dir.into());
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn sim_config(&self) -> SimConfig {
        SimConfig {
            seed: self.config.seed,
            tm_port: self.config.fleet.tm_port,
            ..SimConfig::default()
        }
    }

    fn sink(&self) -> Arc<AnySink> {
        Arc::new(match self.output {
            Some(_) => AnySink::Disk(DiskSink::new()),
            None => AnySink::Memory(MemorySink::new()),
        })
    }

    fn sync_config(&self, label: &str) -> SyncConfig {
        let mut config = self.config.clone();
        if let Some(dir) = &self.output {
            config.output_dir = dir.join(label);
        }
        config
    }

    fn start(&self, sim: SimConfig, label: &str) -> Result<Session, SyncError> {
        let config = self.sync_config(label);
        let world = SimWorld::shared(sim)?;
        let original = world.settings()?;

        let mut coordinator = Coordinator::new(world.clone(), world.clone(), self.sink(), &config)?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let setup = coordinator.setup(&config, &mut rng)?;

        Ok(Session {
            world,
            coordinator,
            setup,
            original,
        })
    }

    fn start_checked(&self, sim: SimConfig, scenario: ScenarioId) -> Result<Session, (Option<RunSummary>, String)> {
        self.start(sim, scenario.name())
            .map_err(|e| (None, format!("setup failed: {}", e)))
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed());
        debug!("{}", scenario.description());

        let mut export = SimExport::new(scenario.name(), self.seed());

        let checked = match scenario {
            ScenarioId::Nominal => self.run_nominal(&mut export),
            ScenarioId::DroppedSensor => self.run_dropped_sensor(&mut export),
            ScenarioId::SlowSensor => self.run_slow_sensor(&mut export),
            ScenarioId::BlueprintFault => self.run_blueprint_fault(&mut export),
            ScenarioId::CrowdedMap => self.run_crowded_map(&mut export),
            ScenarioId::Interrupt => self.run_interrupt(&mut export),
            ScenarioId::ClockLoss => self.run_clock_loss(&mut export),
        };

        let (summary, fatal, failure_reason) = match checked {
            Ok(outcome) => (outcome.summary, outcome.fatal, None),
            Err((summary, reason)) => (summary.unwrap_or_default(), None, Some(reason)),
        };
        let passed = failure_reason.is_none();
        export.finalize(&summary, passed, failure_reason.clone());

        ScenarioResult {
            scenario,
            seed: self.seed(),
            passed,
            summary,
            fatal,
            failure_reason,
            export,
        }
    }

    /// Runs until `cancel` fires or `max_steps` is reached, without any
    /// injected faults.
    pub fn run_live<F>(
        &self,
        cancel: &CancelToken,
        max_steps: Option<u64>,
        mut on_report: F,
    ) -> Result<RunSummary, SyncError>
    where
        F: FnMut(&StepReport),
    {
        let mut session = self.start(self.sim_config(), "live")?;
        session.coordinator.run(cancel, max_steps, |report| on_report(report))
    }

    /// FS-001: every step full, nothing left behind.
    fn run_nominal(&self, export: &mut SimExport) -> Checked {
        let mut session = self.start_checked(self.sim_config(), ScenarioId::Nominal)?;

        let designated = session.setup.fleet.adversarial.len();
        let expected = self
            .config
            .fleet
            .adversarial
            .min(session.setup.fleet.batch.spawned().len());
        if designated != expected {
            return fail(format!("{} adversarial vehicles, expected {}", designated, expected));
        }
        if session.world.traffic().overrides.len() != designated {
            return fail("adversarial overrides missing from the traffic manager");
        }

        let (result, _) = session.run(&CancelToken::new(), Some(self.steps), export);
        let summary = result.map_err(|e| (None, format!("run failed: {}", e)))?;

        if summary.full_steps != self.steps {
            return Err((
                Some(summary.clone()),
                format!("{} of {} steps full", summary.full_steps, self.steps),
            ));
        }
        session
            .verify_cleanup()
            .map_err(|e| (Some(summary.clone()), e))?;

        Ok(Outcome {
            summary,
            fatal: None,
        })
    }

    /// FS-002: withheld lidar, every step partial with exactly the lidar missing.
    fn run_dropped_sensor(&self, export: &mut SimExport) -> Checked {
        let mut session = self.start_checked(self.sim_config(), ScenarioId::DroppedSensor)?;
        let Some(lidar) = session.sensor_id("lidar") else {
            return fail("no 'lidar' sensor configured");
        };
        session.world.delivery().withhold(lidar);

        let (result, reports) = session.run(&CancelToken::new(), Some(self.steps), export);
        let summary = result.map_err(|e| (None, format!("run failed: {}", e)))?;

        for report in &reports {
            if report.is_full() || report.missing != ["lidar"] {
                return Err((
                    Some(summary),
                    format!("{}: missing {:?}, expected [\"lidar\"]", report.step, report.missing),
                ));
            }
            if !report.received.iter().any(|r| r.sensor == "camera") {
                return Err((Some(summary), format!("{}: camera record lost", report.step)));
            }
        }
        if summary.steps != self.steps {
            return Err((
                Some(summary.clone()),
                format!("loop stopped after {} of {} steps", summary.steps, self.steps),
            ));
        }
        session
            .verify_cleanup()
            .map_err(|e| (Some(summary.clone()), e))?;

        Ok(Outcome {
            summary,
            fatal: None,
        })
    }

    /// FS-003: lidar records arrive one step late and are reported as such.
    fn run_slow_sensor(&self, export: &mut SimExport) -> Checked {
        let mut session = self.start_checked(self.sim_config(), ScenarioId::SlowSensor)?;
        let Some(lidar) = session.sensor_id("lidar") else {
            return fail("no 'lidar' sensor configured");
        };
        let slow_ms = self.config.queue.timeout_ms * 3 / 2;
        session.world.delivery().set_latency(lidar, slow_ms);

        let steps = self.steps.max(3);
        let (result, reports) = session.run(&CancelToken::new(), Some(steps), export);
        let summary = result.map_err(|e| (None, format!("run failed: {}", e)))?;

        if summary.partial_steps != steps {
            return Err((
                Some(summary.clone()),
                format!("{} of {} steps partial", summary.partial_steps, steps),
            ));
        }
        if summary.late_deliveries == 0 {
            return Err((Some(summary), "no late lidar records reported".to_string()));
        }
        let late_from_future = reports
            .iter()
            .flat_map(|r| r.late.iter().map(move |l| (r.step, l.step)))
            .find(|(step, late)| late >= step);
        if let Some((step, late)) = late_from_future {
            return Err((Some(summary), format!("{} reported a late record for {}", step, late)));
        }
        session
            .verify_cleanup()
            .map_err(|e| (Some(summary.clone()), e))?;

        Ok(Outcome {
            summary,
            fatal: None,
        })
    }

    /// FS-004: four valid requests spawn, the bogus one fails alone.
    fn run_blueprint_fault(&self, export: &mut SimExport) -> Checked {
        let sim = SimConfig {
            spawn_points: self.sim_config().spawn_points.max(self.config.fleet.vehicles + 6),
            ..self.sim_config()
        };
        let mut session = self.start_checked(sim, ScenarioId::BlueprintFault)?;

        let plan = &session.setup.fleet.plan;
        let free: Vec<_> = plan.spawn_points.iter().skip(plan.count + 1).take(4).copied().collect();
        if free.len() < 4 {
            return fail("not enough free spawn points for the extra batch");
        }

        let tm_port = self.config.fleet.tm_port;
        let valid = ["vehicle.audi.a2", "vehicle.nissan.micra", "vehicle.toyota.prius", "vehicle.bmw.grandtourer"];
        let mut requests: Vec<ActorSpawnRequest> = valid
            .iter()
            .zip(&free)
            .map(|(bp, point)| ActorSpawnRequest::new(bp, *point, ActorRole::Fleet).with_autopilot(tm_port))
            .collect();
        requests.insert(
            2,
            ActorSpawnRequest::new("vehicle.bogus.prototype", free[0], ActorRole::Fleet).with_autopilot(tm_port),
        );

        let (batch, confirm_report) = session
            .coordinator
            .provisioner_mut()
            .provision_batch(requests)
            .and_then(|pending| session.coordinator.confirm_batch(pending))
            .map_err(|e| (None, format!("extra batch failed: {}", e)))?;

        // Sensors are attached, so the confirming advance is a drained step
        let Some(confirm_report) = confirm_report else {
            return fail("batch confirmed without draining its step");
        };
        export.add_step(&confirm_report);
        if !confirm_report.is_full() {
            return fail(format!(
                "confirming {} was partial, missing {:?}",
                confirm_report.step, confirm_report.missing
            ));
        }

        if batch.failed_count() != 1 || batch.spawned().len() != 4 {
            return fail(format!(
                "{} spawned / {} failed, expected 4 / 1",
                batch.spawned().len(),
                batch.failed_count()
            ));
        }
        if !matches!(&batch.outcomes[2], SpawnOutcome::Failed { blueprint_id, .. } if blueprint_id == "vehicle.bogus.prototype")
        {
            return fail("the failure was not reported at the bogus request's position");
        }
        for id in batch.spawned_ids() {
            if let Err(e) = session.coordinator.provisioner().actor_transform(id) {
                return fail(format!("{} unusable after confirmation: {}", id, e));
            }
        }

        let (result, _) = session.run(&CancelToken::new(), Some(self.steps), export);
        let summary = result.map_err(|e| (None, format!("run failed: {}", e)))?;
        let expected = self.steps + 1;
        if summary.full_steps != expected {
            return Err((
                Some(summary.clone()),
                format!("{} of {} steps full", summary.full_steps, expected),
            ));
        }
        if summary.late_deliveries != 0 {
            return Err((
                Some(summary.clone()),
                format!("{} records reported late", summary.late_deliveries),
            ));
        }
        session
            .verify_cleanup()
            .map_err(|e| (Some(summary.clone()), e))?;

        Ok(Outcome {
            summary,
            fatal: None,
        })
    }

    /// FS-005: fleet clamped to one less than the spawn points, ego still placed.
    fn run_crowded_map(&self, export: &mut SimExport) -> Checked {
        let points = (self.config.fleet.vehicles / 2).max(2);
        let sim = SimConfig {
            spawn_points: points,
            ..self.sim_config()
        };
        let mut session = self.start_checked(sim, ScenarioId::CrowdedMap)?;

        let plan = &session.setup.fleet.plan;
        match &plan.warning {
            Some(SyncWarning::ClampedFleetSize { clamped_to, .. }) if *clamped_to == points - 1 => {}
            other => return fail(format!("expected a clamp to {}, got {:?}", points - 1, other)),
        }
        if plan.count != points - 1 {
            return fail(format!("fleet planned for {} vehicles", plan.count));
        }
        if session.coordinator.registry().with_role(ActorRole::Ego).count() != 1 {
            return fail("ego vehicle missing after the clamp");
        }

        let (result, _) = session.run(&CancelToken::new(), Some(self.steps), export);
        let summary = result.map_err(|e| (None, format!("run failed: {}", e)))?;
        session
            .verify_cleanup()
            .map_err(|e| (Some(summary.clone()), e))?;

        Ok(Outcome {
            summary,
            fatal: None,
        })
    }

    /// FS-006: cancellation while draining still tears everything down.
    fn run_interrupt(&self, export: &mut SimExport) -> Checked {
        let mut session = self.start_checked(self.sim_config(), ScenarioId::Interrupt)?;
        let Some(lidar) = session.sensor_id("lidar") else {
            return fail("no 'lidar' sensor configured");
        };
        // Every drain now waits out the full timeout, so the cancel lands mid-drain
        session.world.delivery().withhold(lidar);

        let tracked: Vec<ActorId> = session.coordinator.registry().ids();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let delay = Duration::from_millis(self.config.queue.timeout_ms * 5 / 2);
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(delay);
            trigger.cancel();
        });

        let (result, _) = session.run(&cancel, None, export);
        if interrupter.join().is_err() {
            warn!("Interrupt thread panicked");
        }
        let summary = result.map_err(|e| (None, format!("run failed: {}", e)))?;

        if !summary.cancelled {
            return Err((Some(summary), "run did not observe the cancellation".to_string()));
        }
        for id in &tracked {
            if session.world.actor_transform(*id).is_ok() {
                return Err((Some(summary), format!("{} survived the shutdown", id)));
            }
        }
        session
            .verify_cleanup()
            .map_err(|e| (Some(summary.clone()), e))?;

        Ok(Outcome {
            summary,
            fatal: None,
        })
    }

    /// FS-007: a stalled clock is fatal, cleanup still runs.
    fn run_clock_loss(&self, export: &mut SimExport) -> Checked {
        let mut session = self.start_checked(self.sim_config(), ScenarioId::ClockLoss)?;
        let frame = session
            .world
            .current_frame()
            .map_err(|e| (None, e.to_string()))?;
        session.world.delivery().stall_clock_at(frame + 3);

        let (result, _) = session.run(&CancelToken::new(), Some(self.steps.max(3)), export);
        let summary = session.coordinator.summary();

        let fatal = match result {
            Err(e @ SyncError::ClockAdvanceFailed(_)) => e,
            Err(other) => return Err((Some(summary), format!("unexpected error: {}", other))),
            Ok(_) => return Err((Some(summary), "run survived a stalled clock".to_string())),
        };
        if summary.steps != 2 {
            return Err((
                Some(summary.clone()),
                format!("{} steps before the stall, expected 2", summary.steps),
            ));
        }
        session
            .verify_cleanup()
            .map_err(|e| (Some(summary.clone()), e))?;

        Ok(Outcome {
            summary,
            fatal: Some(fatal.to_string()),
        })
    }
}
