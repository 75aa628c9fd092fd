//! Actor Registry - the single source of truth for actors we must destroy.
//!
//! Every actor spawned through the fleet provisioner is inserted here and
//! stays until teardown. Removal always happens before (or together with)
//! destruction, so the registry never holds a handle to a destroyed actor.

use crate::error::SyncError;

use framesync_env::{ActorCatalog, ActorId};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Policy role of a tracked actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Autopilot vehicle with default policy
    Fleet,

    /// The distinguished vehicle carrying the sensors
    Ego,

    /// Fleet vehicle with an unsafe behavior override
    Adversarial,
}

/// A tracked actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorHandle {
    pub actor_id: ActorId,
    pub role: ActorRole,

    /// True once a synchronization point has passed since the spawn
    pub confirmed: bool,
}

impl ActorHandle {
    pub fn new(actor_id: ActorId, role: ActorRole) -> Self {
        Self {
            actor_id,
            role,
            confirmed: false,
        }
    }
}

/// Insertion-ordered set of live actors.
#[derive(Debug, Default)]
pub struct ActorRegistry {
    handles: Vec<ActorHandle>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a freshly spawned actor (unconfirmed).
    pub fn insert(&mut self, handle: ActorHandle) -> Result<(), SyncError> {
        if self.contains(handle.actor_id) {
            return Err(SyncError::DuplicateActor(handle.actor_id));
        }
        self.handles.push(handle);
        Ok(())
    }

    /// Stops tracking an actor. The caller destroys it.
    pub fn remove(&mut self, actor_id: ActorId) -> Option<ActorHandle> {
        let idx = self.handles.iter().position(|h| h.actor_id == actor_id)?;
        Some(self.handles.remove(idx))
    }

    pub fn get(&self, actor_id: ActorId) -> Option<&ActorHandle> {
        self.handles.iter().find(|h| h.actor_id == actor_id)
    }

    pub fn contains(&self, actor_id: ActorId) -> bool {
        self.get(actor_id).is_some()
    }

    pub fn is_confirmed(&self, actor_id: ActorId) -> bool {
        self.get(actor_id).map(|h| h.confirmed).unwrap_or(false)
    }

    /// Marks the given actors as confirmed. Unknown ids are ignored.
    pub fn confirm(&mut self, ids: &[ActorId]) {
        for handle in self.handles.iter_mut() {
            if ids.contains(&handle.actor_id) {
                handle.confirmed = true;
            }
        }
    }

    /// Marks every tracked actor as confirmed.
    pub fn confirm_all(&mut self) {
        for handle in self.handles.iter_mut() {
            handle.confirmed = true;
        }
    }

    /// Changes an actor's role. Returns false if the actor is not tracked.
    pub fn set_role(&mut self, actor_id: ActorId, role: ActorRole) -> bool {
        match self.handles.iter_mut().find(|h| h.actor_id == actor_id) {
            Some(handle) => {
                handle.role = role;
                true
            }
            None => false,
        }
    }

    /// All handles in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ActorHandle> {
        self.handles.iter()
    }

    /// Handles with the given role, in insertion order.
    pub fn with_role(&self, role: ActorRole) -> impl Iterator<Item = &ActorHandle> {
        self.handles.iter().filter(move |h| h.role == role)
    }

    pub fn ids(&self) -> Vec<ActorId> {
        self.handles.iter().map(|h| h.actor_id).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Removes every actor from the registry, then destroys them in one batch.
    ///
    /// The registry is empty afterwards even when destruction fails.
    pub fn teardown<C: ActorCatalog + ?Sized>(&mut self, catalog: &C) -> Result<usize, SyncError> {
        let ids: Vec<ActorId> = self.handles.drain(..).map(|h| h.actor_id).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        info!("Destroying {} actors", ids.len());
        catalog
            .destroy_actors(&ids)
            .map_err(|e| SyncError::teardown(format!("destroy {} actors: {}", ids.len(), e)))?;

        Ok(ids.len())
    }
}
