//! Policy Overrider - global traffic policy and per-actor behavior overrides.
//!
//! Overrides are only ever applied to confirmed actors. A configurable number
//! of fleet vehicles is designated adversarial: they ignore every signal,
//! keep no following distance and drive well above the speed limit.

use crate::error::SyncError;
use crate::registry::{ActorRegistry, ActorRole};

use framesync_env::{ActorId, BehaviorParams, TrafficPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings applied to every autopilot vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalTrafficPolicy {
    /// Distance kept to the leading vehicle, in meters
    pub follow_distance: f64,

    /// Full physics only near the hero vehicle
    pub hybrid_physics: bool,

    /// Percentage below the speed limit
    pub speed_bias_pct: f64,
}

impl Default for GlobalTrafficPolicy {
    fn default() -> Self {
        Self {
            follow_distance: 3.0,
            hybrid_physics: true,
            speed_bias_pct: 80.0,
        }
    }
}

/// Per-actor behavior parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BehaviorOverride {
    pub actor_id: ActorId,
    pub ignore_signals_pct: f64,
    pub min_follow_distance: f64,
    pub speed_bias_pct: f64,
}

impl BehaviorOverride {
    pub fn new(actor_id: ActorId, params: BehaviorParams) -> Self {
        Self {
            actor_id,
            ignore_signals_pct: params.ignore_signals_pct,
            min_follow_distance: params.min_follow_distance,
            speed_bias_pct: params.speed_bias_pct,
        }
    }

    /// Ignores all lights and signs, tailgates, drives 50% over the limit.
    pub fn adversarial(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            ignore_signals_pct: 100.0,
            min_follow_distance: 0.0,
            speed_bias_pct: -50.0,
        }
    }

    /// The same parameters bound to another actor.
    pub fn for_actor(&self, actor_id: ActorId) -> Self {
        Self { actor_id, ..*self }
    }

    pub fn params(&self) -> BehaviorParams {
        BehaviorParams {
            ignore_signals_pct: self.ignore_signals_pct,
            min_follow_distance: self.min_follow_distance,
            speed_bias_pct: self.speed_bias_pct,
        }
    }
}

/// Applies traffic policy. Remembers every override it applied.
pub struct PolicyOverrider<T: TrafficPolicy> {
    traffic: Arc<T>,
    applied: Vec<BehaviorOverride>,
    synchronous: bool,
}

impl<T: TrafficPolicy> PolicyOverrider<T> {
    pub fn new(traffic: Arc<T>) -> Self {
        Self {
            traffic,
            applied: Vec::new(),
            synchronous: false,
        }
    }

    /// Puts the traffic-policy service in lockstep with the world clock and
    /// applies the global settings.
    pub fn apply_global(
        &mut self,
        policy: &GlobalTrafficPolicy,
        synchronous: bool,
    ) -> Result<(), SyncError> {
        if synchronous {
            self.traffic.set_synchronous_mode(true)?;
            self.synchronous = true;
        }
        self.traffic.set_global_follow_distance(policy.follow_distance)?;
        self.traffic.set_hybrid_physics(policy.hybrid_physics)?;
        self.traffic.set_global_speed_bias(policy.speed_bias_pct)?;

        info!(
            "Traffic policy on port {}: follow {} m, hybrid physics {}, speed bias {}%",
            self.traffic.port(),
            policy.follow_distance,
            policy.hybrid_physics,
            policy.speed_bias_pct
        );
        Ok(())
    }

    /// Applies an override to one confirmed actor.
    ///
    /// # Errors
    /// `NotConfirmed` if the actor is unknown to the registry or its spawn has
    /// not been confirmed yet.
    pub fn override_actor(
        &mut self,
        registry: &ActorRegistry,
        behavior: BehaviorOverride,
    ) -> Result<(), SyncError> {
        if !registry.is_confirmed(behavior.actor_id) {
            return Err(SyncError::NotConfirmed(behavior.actor_id));
        }

        self.traffic
            .set_actor_override(behavior.actor_id, &behavior.params())?;

        match self.applied.iter_mut().find(|o| o.actor_id == behavior.actor_id) {
            Some(existing) => *existing = behavior,
            None => self.applied.push(behavior),
        }

        debug!("Override applied to {}: {:?}", behavior.actor_id, behavior.params());
        Ok(())
    }

    /// Makes the first `count` fleet vehicles (insertion order) adversarial.
    ///
    /// Returns the designated actors in the order their overrides were applied.
    pub fn designate_adversarial(
        &mut self,
        registry: &mut ActorRegistry,
        count: usize,
    ) -> Result<Vec<ActorId>, SyncError> {
        let fleet: Vec<ActorId> = registry
            .with_role(ActorRole::Fleet)
            .map(|h| h.actor_id)
            .collect();

        if count > fleet.len() {
            warn!(
                "Requested {} adversarial vehicles, but the fleet has {}; using {}",
                count,
                fleet.len(),
                fleet.len()
            );
        }

        let mut designated = Vec::with_capacity(count.min(fleet.len()));
        for actor_id in fleet.into_iter().take(count) {
            self.override_actor(registry, BehaviorOverride::adversarial(actor_id))?;
            registry.set_role(actor_id, ActorRole::Adversarial);
            designated.push(actor_id);
        }

        if !designated.is_empty() {
            info!("Adversarial vehicles: {:?}", designated);
        }
        Ok(designated)
    }

    /// Transfers the override of a destroyed actor to its replacement.
    ///
    /// Returns false if `old` had no override.
    pub fn reapply(
        &mut self,
        registry: &ActorRegistry,
        old: ActorId,
        new: ActorId,
    ) -> Result<bool, SyncError> {
        let Some(previous) = self.override_for(old).copied() else {
            return Ok(false);
        };

        self.override_actor(registry, previous.for_actor(new))?;
        self.forget(old);
        info!("Override of {} re-applied to {}", old, new);
        Ok(true)
    }

    /// Drops the record of an actor's override.
    pub fn forget(&mut self, actor_id: ActorId) -> Option<BehaviorOverride> {
        let idx = self.applied.iter().position(|o| o.actor_id == actor_id)?;
        Some(self.applied.remove(idx))
    }

    pub fn override_for(&self, actor_id: ActorId) -> Option<&BehaviorOverride> {
        self.applied.iter().find(|o| o.actor_id == actor_id)
    }

    /// Every override currently in force, in application order.
    pub fn applied(&self) -> &[BehaviorOverride] {
        &self.applied
    }

    /// Forgets all overrides and takes the traffic-policy service out of
    /// lockstep if we put it there.
    pub fn release(&mut self) -> Result<(), SyncError> {
        self.applied.clear();
        if self.synchronous {
            self.synchronous = false;
            self.traffic.set_synchronous_mode(false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ActorHandle;
    use crate::test_support::FakeWorld;

    fn confirmed_fleet(world: &FakeWorld, n: usize) -> ActorRegistry {
        let mut registry = ActorRegistry::new();
        for idx in 0..n {
            let id = world.spawn_vehicle("vehicle.audi.tt", idx);
            registry.insert(ActorHandle::new(id, ActorRole::Fleet)).unwrap();
        }
        registry.confirm_all();
        registry
    }

    #[test]
    fn test_global_policy_defaults() {
        let world = Arc::new(FakeWorld::new(4));
        let mut overrider = PolicyOverrider::new(world.clone());

        overrider.apply_global(&GlobalTrafficPolicy::default(), true).unwrap();

        let applied = world.global_policy();
        assert_eq!(applied.follow_distance, 3.0);
        assert!(applied.hybrid_physics);
        assert_eq!(applied.speed_bias_pct, 80.0);
        assert!(world.traffic_synchronous());

        overrider.release().unwrap();
        assert!(!world.traffic_synchronous());
    }

    #[test]
    fn test_unconfirmed_actor_rejected() {
        let world = Arc::new(FakeWorld::new(4));
        let mut overrider = PolicyOverrider::new(world.clone());
        let mut registry = ActorRegistry::new();
        let id = world.spawn_vehicle("vehicle.audi.tt", 0);
        registry.insert(ActorHandle::new(id, ActorRole::Fleet)).unwrap();

        let err = overrider
            .override_actor(&registry, BehaviorOverride::adversarial(id))
            .unwrap_err();

        assert!(matches!(err, SyncError::NotConfirmed(a) if a == id));
        assert!(!err.is_fatal());
        assert!(world.overrides().is_empty());
        assert!(overrider.applied().is_empty());
    }

    #[test]
    fn test_unknown_actor_rejected() {
        let world = Arc::new(FakeWorld::new(4));
        let mut overrider = PolicyOverrider::new(world.clone());

        let err = overrider
            .override_actor(&ActorRegistry::new(), BehaviorOverride::adversarial(ActorId(77)))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConfirmed(ActorId(77))));
    }

    #[test]
    fn test_first_k_fleet_become_adversarial() {
        let world = Arc::new(FakeWorld::new(8));
        let mut overrider = PolicyOverrider::new(world.clone());
        let mut registry = confirmed_fleet(&world, 5);
        let ids = registry.ids();

        let designated = overrider.designate_adversarial(&mut registry, 2).unwrap();

        assert_eq!(designated, ids[..2].to_vec());
        let applied: Vec<ActorId> = world.overrides().iter().map(|(id, _)| *id).collect();
        assert_eq!(applied, ids[..2].to_vec());

        let (_, params) = world.overrides()[0];
        assert_eq!(params.ignore_signals_pct, 100.0);
        assert_eq!(params.min_follow_distance, 0.0);
        assert_eq!(params.speed_bias_pct, -50.0);

        assert_eq!(registry.with_role(ActorRole::Adversarial).count(), 2);
        assert_eq!(registry.with_role(ActorRole::Fleet).count(), 3);
    }

    #[test]
    fn test_adversarial_count_clamped_to_fleet() {
        let world = Arc::new(FakeWorld::new(4));
        let mut overrider = PolicyOverrider::new(world.clone());
        let mut registry = confirmed_fleet(&world, 2);

        let designated = overrider.designate_adversarial(&mut registry, 5).unwrap();
        assert_eq!(designated.len(), 2);
    }

    #[test]
    fn test_ego_never_designated() {
        let world = Arc::new(FakeWorld::new(4));
        let mut overrider = PolicyOverrider::new(world.clone());
        let mut registry = ActorRegistry::new();
        let ego = world.spawn_vehicle("vehicle.mercedes-benz.coupe", 0);
        let fleet = world.spawn_vehicle("vehicle.audi.tt", 1);
        registry.insert(ActorHandle::new(ego, ActorRole::Ego)).unwrap();
        registry.insert(ActorHandle::new(fleet, ActorRole::Fleet)).unwrap();
        registry.confirm_all();

        let designated = overrider.designate_adversarial(&mut registry, 1).unwrap();
        assert_eq!(designated, vec![fleet]);
    }

    #[test]
    fn test_reapply_to_recreated_actor() {
        let world = Arc::new(FakeWorld::new(4));
        let mut overrider = PolicyOverrider::new(world.clone());
        let mut registry = confirmed_fleet(&world, 1);
        let old = registry.ids()[0];

        overrider.designate_adversarial(&mut registry, 1).unwrap();

        registry.remove(old);
        let new = world.spawn_vehicle("vehicle.audi.tt", 2);
        registry.insert(ActorHandle::new(new, ActorRole::Adversarial)).unwrap();
        registry.confirm(&[new]);

        assert!(overrider.reapply(&registry, old, new).unwrap());
        assert!(overrider.override_for(old).is_none());
        assert_eq!(overrider.override_for(new).unwrap().speed_bias_pct, -50.0);
        assert!(!overrider.reapply(&registry, old, new).unwrap());
    }
}
