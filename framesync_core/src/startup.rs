//! Startup sequence: weather, fleet, ego vehicle, sensors.
//!
//! Each stage confirms its spawns before the next one touches them, so the
//! sensors are always attached to a confirmed ego vehicle.

use crate::config::{FleetConfig, SyncConfig};
use crate::coordinator::Coordinator;
use crate::error::SyncError;
use crate::fleet::{build_fleet_requests, plan_fleet, ActorSpawnRequest, FleetPlan, ProvisionedBatch, SpawnOutcome};
use crate::policy::GlobalTrafficPolicy;
use crate::sensor_bridge::SensorSpec;

use framesync_env::{ActorId, EnvError, Simulator, StorageSink, TrafficPolicy, Transform, WeatherParameters};
use rand::Rng;
use tracing::info;

/// What `populate_fleet` spawned.
#[derive(Debug, Clone)]
pub struct FleetReport {
    pub plan: FleetPlan,
    pub batch: ProvisionedBatch,

    /// Fleet vehicles switched to the adversarial override
    pub adversarial: Vec<ActorId>,
}

/// Everything `setup` created.
#[derive(Debug, Clone)]
pub struct SetupReport {
    pub fleet: FleetReport,
    pub ego: ActorId,
    pub sensors: usize,
}

impl<S, T, K> Coordinator<S, T, K>
where
    S: Simulator + 'static,
    T: TrafficPolicy,
    K: StorageSink + 'static,
{
    pub fn apply_weather(&self, weather: &WeatherParameters) -> Result<(), SyncError> {
        self.sim().set_weather(weather)?;
        info!(
            "Weather: cloudiness {}, precipitation {}, fog {}",
            weather.cloudiness, weather.precipitation, weather.fog_density
        );
        Ok(())
    }

    /// Global policy, then one spawn batch for the whole fleet, then the
    /// adversarial overrides.
    pub fn populate_fleet<R: Rng + ?Sized>(
        &mut self,
        fleet: &FleetConfig,
        policy: &GlobalTrafficPolicy,
        rng: &mut R,
    ) -> Result<FleetReport, SyncError> {
        let synchronous = self.is_synchronous();
        self.overrider_mut().apply_global(policy, synchronous)?;

        let spawn_points = self.sim().spawn_points()?;
        let plan = plan_fleet(fleet.vehicles, spawn_points, rng);

        let blueprints = self.sim().filter_blueprints(&fleet.blueprint_filter)?;
        let requests = build_fleet_requests(&plan, &blueprints, fleet.tm_port, rng);

        let pending = self.provisioner_mut().provision_batch(requests)?;
        let (batch, _) = self.confirm_batch(pending)?;

        let adversarial = self.designate_adversarial(fleet.adversarial)?;

        info!(
            "Spawned {} of {} vehicles, {} adversarial",
            batch.spawned().len(),
            plan.count,
            adversarial.len()
        );

        Ok(FleetReport {
            plan,
            batch,
            adversarial,
        })
    }

    /// Spawns and confirms the hero vehicle at `spawn_point`.
    pub fn spawn_ego(
        &mut self,
        fleet: &FleetConfig,
        spawn_point: Transform,
    ) -> Result<ActorId, SyncError> {
        let request = ActorSpawnRequest::ego(
            &fleet.ego_blueprint,
            &fleet.ego_color,
            spawn_point,
            fleet.tm_port,
        );

        let pending = self.provisioner_mut().provision_batch(vec![request])?;
        let (batch, _) = self.confirm_batch(pending)?;

        match batch.outcomes.into_iter().next() {
            Some(SpawnOutcome::Spawned(handle)) => {
                info!("Ego vehicle {} ({})", handle.actor_id, fleet.ego_blueprint);
                Ok(handle.actor_id)
            }
            Some(SpawnOutcome::Failed { reason, .. }) => Err(EnvError::rejected(format!(
                "ego vehicle {}: {}",
                fleet.ego_blueprint, reason
            ))
            .into()),
            None => Err(EnvError::rejected("ego vehicle: empty batch response").into()),
        }
    }

    /// Attaches every sensor to `parent`. Returns how many were attached.
    pub fn attach_sensors(&mut self, specs: &[SensorSpec], parent: ActorId) -> Result<usize, SyncError> {
        for spec in specs {
            self.attach_sensor(spec, parent)?;
        }
        Ok(specs.len())
    }

    /// The full startup sequence.
    pub fn setup<R: Rng + ?Sized>(
        &mut self,
        config: &SyncConfig,
        rng: &mut R,
    ) -> Result<SetupReport, SyncError> {
        if let Some(weather) = &config.weather {
            self.apply_weather(weather)?;
        }

        let fleet = self.populate_fleet(&config.fleet, &config.policy, rng)?;

        let spawn_point = fleet
            .plan
            .ego_point()
            .ok_or_else(|| EnvError::not_found("free spawn point for the ego vehicle"))?;
        let ego = self.spawn_ego(&config.fleet, spawn_point)?;

        let sensors = self.attach_sensors(&config.sensors, ego)?;

        if config.follow_ego {
            self.set_follow(Some(ego));
        }

        let vehicles = self.sim().actors_matching("vehicle.*")?.len();
        info!("Setup complete: {} vehicles in the world, {} sensors on {}", vehicles, sensors, ego);

        Ok(SetupReport {
            fleet,
            ego,
            sensors,
        })
    }
}
