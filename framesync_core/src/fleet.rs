//! Fleet Provisioner - batched actor creation with explicit confirmation.
//!
//! # Protocol
//!
//! ```text
//! plan_fleet ──► build_fleet_requests ──► provision_batch ──► PendingBatch
//!                                                                 │
//!                                   confirm (one clock advance) ◄─┘
//!                                                                 │
//!                                                     ProvisionedBatch
//! ```
//!
//! The batch is transported as one unit but each request succeeds or fails
//! on its own. Spawns only become visible to queries after one
//! synchronization point, so [`PendingBatch`] deliberately exposes nothing
//! that could query actor state; [`FleetProvisioner::confirm`] is the only way
//! to turn it into a [`ProvisionedBatch`].

use crate::clock::{ClockController, StepId};
use crate::error::{SyncError, SyncWarning};
use crate::registry::{ActorHandle, ActorRegistry, ActorRole};

use framesync_env::{ActorCatalog, ActorId, Blueprint, EnvError, SpawnCommand, Transform, WorldService};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Policy an actor starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialPolicy {
    /// Registered with the traffic-policy service on this port
    Autopilot { tm_port: u16 },
    Manual,
}

/// One "create actor + attach policy" instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorSpawnRequest {
    pub blueprint_id: String,
    pub transform: Transform,
    pub attributes: BTreeMap<String, String>,
    pub initial_policy: InitialPolicy,
    pub role: ActorRole,
}

impl ActorSpawnRequest {
    pub fn new(blueprint_id: &str, transform: Transform, role: ActorRole) -> Self {
        Self {
            blueprint_id: blueprint_id.to_string(),
            transform,
            attributes: BTreeMap::new(),
            initial_policy: InitialPolicy::Manual,
            role,
        }
    }

    pub fn with_autopilot(mut self, tm_port: u16) -> Self {
        self.initial_policy = InitialPolicy::Autopilot { tm_port };
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// The hero vehicle: fixed color, `role_name = hero`, on autopilot.
    pub fn ego(blueprint_id: &str, color: &str, transform: Transform, tm_port: u16) -> Self {
        Self::new(blueprint_id, transform, ActorRole::Ego)
            .with_attribute("color", color)
            .with_attribute("role_name", "hero")
            .with_autopilot(tm_port)
    }
}

/// Result of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    Spawned(ActorHandle),
    Failed { blueprint_id: String, reason: String },
}

impl SpawnOutcome {
    pub fn is_spawned(&self) -> bool {
        matches!(self, SpawnOutcome::Spawned(_))
    }

    pub fn handle(&self) -> Option<ActorHandle> {
        match self {
            SpawnOutcome::Spawned(handle) => Some(*handle),
            SpawnOutcome::Failed { .. } => None,
        }
    }
}

/// How many vehicles to spawn and where.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetPlan {
    /// Spawn points in assignment order
    pub spawn_points: Vec<Transform>,

    /// Number of fleet vehicles (the points after them stay free)
    pub count: usize,

    pub warning: Option<SyncWarning>,
}

impl FleetPlan {
    /// Points assigned to fleet vehicles.
    pub fn fleet_points(&self) -> &[Transform] {
        &self.spawn_points[..self.count.min(self.spawn_points.len())]
    }

    /// First point not assigned to the fleet, reserved for the ego vehicle.
    pub fn ego_point(&self) -> Option<Transform> {
        self.spawn_points.get(self.count).copied()
    }
}

/// Decides the fleet size.
///
/// With enough points they are shuffled and `requested` are used. Otherwise
/// the count is clamped to `spawn_points - 1`, keeping one point for the ego
/// vehicle even in flows that never spawn one.
pub fn plan_fleet<R: Rng + ?Sized>(
    requested: usize,
    mut spawn_points: Vec<Transform>,
    rng: &mut R,
) -> FleetPlan {
    let available = spawn_points.len();

    if requested < available {
        spawn_points.shuffle(rng);
        return FleetPlan {
            spawn_points,
            count: requested,
            warning: None,
        };
    }

    let clamped = available.saturating_sub(1);
    let warning = SyncWarning::ClampedFleetSize {
        requested,
        clamped_to: clamped,
        spawn_points: available,
    };
    warn!("{}", warning);

    FleetPlan {
        spawn_points,
        count: clamped,
        warning: Some(warning),
    }
}

/// One autopilot request per planned spawn point.
///
/// Blueprints are sorted by id before the random pick so a seed always
/// yields the same fleet. Color and driver id are drawn from each
/// blueprint's recommended values where present.
pub fn build_fleet_requests<R: Rng + ?Sized>(
    plan: &FleetPlan,
    blueprints: &[Blueprint],
    tm_port: u16,
    rng: &mut R,
) -> Vec<ActorSpawnRequest> {
    let mut sorted: Vec<&Blueprint> = blueprints.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut requests = Vec::with_capacity(plan.count);
    for transform in plan.fleet_points() {
        let Some(blueprint) = sorted.choose(rng) else {
            break;
        };

        let mut request = ActorSpawnRequest::new(&blueprint.id, *transform, ActorRole::Fleet)
            .with_autopilot(tm_port);

        for key in ["color", "driver_id"] {
            if blueprint.has_attribute(key) {
                if let Some(value) = blueprint.recommended_values(key).choose(rng) {
                    request = request.with_attribute(key, value.clone());
                }
            }
        }

        requests.push(request.with_attribute("role_name", "autopilot"));
    }

    requests
}

/// A submitted batch whose spawns are not yet confirmed.
#[must_use = "spawned actors must be confirmed with FleetProvisioner::confirm before use"]
#[derive(Debug)]
pub struct PendingBatch {
    outcomes: Vec<SpawnOutcome>,
}

impl PendingBatch {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn spawned_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_spawned()).count()
    }
}

/// A confirmed batch, one outcome per request in request order.
#[derive(Debug, Clone)]
pub struct ProvisionedBatch {
    /// The synchronization step that confirmed the spawns
    pub step: StepId,

    pub outcomes: Vec<SpawnOutcome>,

    /// One `SpawnFailed` per failed request
    pub warnings: Vec<SyncWarning>,
}

impl ProvisionedBatch {
    pub fn spawned(&self) -> Vec<ActorHandle> {
        self.outcomes.iter().filter_map(SpawnOutcome::handle).collect()
    }

    pub fn spawned_ids(&self) -> Vec<ActorId> {
        self.spawned().iter().map(|h| h.actor_id).collect()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_spawned()).count()
    }
}

/// Spawns actors in batches and owns the registry of everything it spawned.
pub struct FleetProvisioner<C: ActorCatalog> {
    catalog: Arc<C>,
    registry: ActorRegistry,
}

impl<C: ActorCatalog> FleetProvisioner<C> {
    pub fn new(catalog: Arc<C>) -> Self {
        Self {
            catalog,
            registry: ActorRegistry::new(),
        }
    }

    /// Submits every resolvable request as one batch.
    ///
    /// Unknown blueprints fail their own request without reaching the
    /// transport. Spawned actors enter the registry unconfirmed.
    ///
    /// # Errors
    /// Only transport-level failures (lost connection, malformed response).
    pub fn provision_batch(
        &mut self,
        requests: Vec<ActorSpawnRequest>,
    ) -> Result<PendingBatch, SyncError> {
        let mut outcomes: Vec<Option<SpawnOutcome>> = vec![None; requests.len()];
        let mut commands = Vec::new();
        let mut slots = Vec::new();

        for (idx, request) in requests.iter().enumerate() {
            match self.catalog.find_blueprint(&request.blueprint_id) {
                Ok(mut blueprint) => {
                    for (key, value) in &request.attributes {
                        blueprint.set_attribute(key, value.clone());
                    }
                    commands.push(SpawnCommand {
                        blueprint,
                        transform: request.transform,
                        autopilot: match request.initial_policy {
                            InitialPolicy::Autopilot { tm_port } => Some(tm_port),
                            InitialPolicy::Manual => None,
                        },
                    });
                    slots.push(idx);
                }
                Err(e) if e.is_connection_loss() => return Err(e.into()),
                Err(e) => {
                    error!("Request #{} ({}): {}", idx, request.blueprint_id, e);
                    outcomes[idx] = Some(SpawnOutcome::Failed {
                        blueprint_id: request.blueprint_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !commands.is_empty() {
            let submitted = commands.len();
            let responses = self.catalog.apply_batch_sync(commands, false)?;
            if responses.len() != submitted {
                return Err(EnvError::rejected(format!(
                    "batch returned {} responses for {} commands",
                    responses.len(),
                    submitted
                ))
                .into());
            }

            // Every spawned actor is tracked before any error is returned
            let mut untracked: Option<SyncError> = None;
            for (idx, response) in slots.into_iter().zip(responses) {
                let request = &requests[idx];
                outcomes[idx] = Some(match response {
                    Ok(actor_id) => {
                        let handle = ActorHandle::new(actor_id, request.role);
                        if let Err(e) = self.registry.insert(handle) {
                            error!("Request #{} ({}): {}", idx, request.blueprint_id, e);
                            untracked.get_or_insert(e);
                        }
                        SpawnOutcome::Spawned(handle)
                    }
                    Err(reason) => {
                        error!("Request #{} ({}): {}", idx, request.blueprint_id, reason);
                        SpawnOutcome::Failed {
                            blueprint_id: request.blueprint_id.clone(),
                            reason,
                        }
                    }
                });
            }
            if let Some(e) = untracked {
                return Err(e);
            }
        }

        let outcomes: Vec<SpawnOutcome> = outcomes.into_iter().flatten().collect();
        let spawned = outcomes.iter().filter(|o| o.is_spawned()).count();
        info!(
            "Batch submitted: {} spawned, {} failed",
            spawned,
            outcomes.len() - spawned
        );

        Ok(PendingBatch { outcomes })
    }

    /// The mandatory synchronization point after a batch.
    ///
    /// Advances (or waits for) exactly one step, then marks the batch's
    /// spawned actors as confirmed.
    pub fn confirm<W: WorldService>(
        &mut self,
        pending: PendingBatch,
        clock: &ClockController<W>,
    ) -> Result<ProvisionedBatch, SyncError> {
        let step = clock.advance()?;
        Ok(self.confirm_at(pending, step))
    }

    /// Confirms a batch at a step the caller has already issued.
    pub(crate) fn confirm_at(&mut self, pending: PendingBatch, step: StepId) -> ProvisionedBatch {
        let mut outcomes = pending.outcomes;
        let mut warnings = Vec::new();
        let mut confirmed = Vec::new();

        for (index, outcome) in outcomes.iter_mut().enumerate() {
            match outcome {
                SpawnOutcome::Spawned(handle) => {
                    handle.confirmed = true;
                    confirmed.push(handle.actor_id);
                }
                SpawnOutcome::Failed { blueprint_id, reason } => {
                    warnings.push(SyncWarning::SpawnFailed {
                        index,
                        blueprint_id: blueprint_id.clone(),
                        reason: reason.clone(),
                    });
                }
            }
        }
        self.registry.confirm(&confirmed);

        info!("Confirmed {} actors at {}", confirmed.len(), step);

        ProvisionedBatch {
            step,
            outcomes,
            warnings,
        }
    }

    /// Latest transform of a confirmed actor.
    pub fn actor_transform(&self, actor_id: ActorId) -> Result<Transform, SyncError> {
        if !self.registry.is_confirmed(actor_id) {
            return Err(SyncError::NotConfirmed(actor_id));
        }
        Ok(self.catalog.actor_transform(actor_id)?)
    }

    /// Untracks and destroys one actor. Returns false if it was not tracked.
    ///
    /// Sensors attached to the actor are not touched; the coordinator
    /// detaches them first in [`Coordinator::destroy_actor`].
    ///
    /// [`Coordinator::destroy_actor`]: crate::coordinator::Coordinator::destroy_actor
    pub(crate) fn destroy(&mut self, actor_id: ActorId) -> Result<bool, SyncError> {
        if self.registry.remove(actor_id).is_none() {
            return Ok(false);
        }
        self.catalog
            .destroy_actors(&[actor_id])
            .map_err(|e| SyncError::teardown(format!("destroy {}: {}", actor_id, e)))?;
        Ok(true)
    }

    /// Destroys every tracked actor.
    pub fn teardown(&mut self) -> Result<usize, SyncError> {
        self.registry.teardown(self.catalog.as_ref())
    }

    pub fn registry(&self) -> &ActorRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ActorRegistry {
        &mut self.registry
    }

    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }
}
