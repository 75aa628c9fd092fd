//! Sensor Bridge - connects simulator sensor callbacks to the rendezvous queue.
//!
//! One bridge serves every sensor. Attaching a sensor opens its lane, spawns
//! the sensor on the parent actor and registers a [`DeliveryHandler`] as the
//! delivery callback. The handler runs on whatever thread the simulator
//! chooses; it persists the payload and then pushes a lightweight
//! [`SensorRecord`] so the queue never carries raw measurement data.

use crate::clock::StepId;
use crate::error::{SyncError, SyncWarning};
use crate::rendezvous::{LaneSender, PushOutcome, RendezvousQueue, SensorRecord};

use framesync_env::{ActorCatalog, ActorId, SensorAttachPoint, SensorId, SensorPayload, StorageSink, Transform};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Description of a sensor to attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    /// Unique name, used for lane and file naming
    pub name: String,

    pub blueprint_id: String,

    /// Blueprint attribute overrides
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Mounting position relative to the parent actor
    #[serde(default)]
    pub transform: Transform,
}

impl SensorSpec {
    pub fn new(name: &str, blueprint_id: &str, transform: Transform) -> Self {
        Self {
            name: name.to_string(),
            blueprint_id: blueprint_id.to_string(),
            attributes: BTreeMap::new(),
            transform,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Front RGB camera above the hood.
    pub fn camera() -> Self {
        Self::new("camera", "sensor.camera.rgb", Transform::at(1.5, 0.0, 2.4))
    }

    /// 32-channel roof lidar with a 20 m range.
    pub fn lidar() -> Self {
        Self::new("lidar", "sensor.lidar.ray_cast", Transform::at(0.0, 0.0, 2.0))
            .with_attribute("channels", 32)
            .with_attribute("points_per_second", 90000)
            .with_attribute("rotation_frequency", 40)
            .with_attribute("range", 20)
    }

    pub fn default_rig() -> Vec<Self> {
        vec![Self::camera(), Self::lidar()]
    }
}

/// A live sensor attachment. Lives as long as the owning actor.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub sensor: String,
    pub sensor_id: SensorId,
    pub parent: ActorId,

    /// Records the coordinator drains per step for this sensor
    pub expected_per_step: usize,
}

/// The `onDeliver` callback of one sensor.
pub struct DeliveryHandler<K: StorageSink> {
    sensor: String,
    output_dir: PathBuf,
    storage: Arc<K>,
    lane: LaneSender,
}

impl<K: StorageSink> DeliveryHandler<K> {
    pub fn new(sensor: &str, output_dir: PathBuf, storage: Arc<K>, lane: LaneSender) -> Self {
        Self {
            sensor: sensor.to_string(),
            output_dir,
            storage,
            lane,
        }
    }

    /// `<output_dir>/<frame:06>_<sensor>.<ext>`, unique per (step, sensor).
    pub fn payload_path(&self, payload: &SensorPayload) -> PathBuf {
        self.output_dir.join(format!(
            "{:06}_{}.{}",
            payload.frame,
            self.sensor,
            payload.kind.extension()
        ))
    }

    /// Persists the payload, then forwards its correlation record.
    ///
    /// Storage failures are logged and do not stop the record.
    pub fn deliver(&self, payload: SensorPayload) -> PushOutcome {
        let path = self.payload_path(&payload);

        if let Err(e) = self.storage.save(&payload, &path) {
            warn!("Failed to save {} payload to {}: {}", self.sensor, path.display(), e);
        }

        let step = StepId(payload.frame);
        let outcome = self.lane.push(SensorRecord::new(step, self.sensor.as_str(), path));
        match &outcome {
            PushOutcome::DroppedOldest { dropped } => {
                let warning = SyncWarning::QueueOverflowDrop {
                    sensor: self.sensor.clone(),
                    dropped: *dropped,
                };
                warn!("{}", warning);
            }
            other => debug!("Delivery {} {} -> {:?}", self.sensor, step, other),
        }
        outcome
    }
}

/// Attaches and detaches sensors.
pub struct SensorBridge<S, K>
where
    S: SensorAttachPoint + ActorCatalog,
    K: StorageSink + 'static,
{
    sim: Arc<S>,
    storage: Arc<K>,
    output_dir: PathBuf,
}

impl<S, K> SensorBridge<S, K>
where
    S: SensorAttachPoint + ActorCatalog,
    K: StorageSink + 'static,
{
    pub fn new(sim: Arc<S>, storage: Arc<K>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            sim,
            storage,
            output_dir: output_dir.into(),
        }
    }

    /// Spawns a sensor on `parent` and starts routing its deliveries into `queue`.
    ///
    /// On any failure nothing stays registered: the lane is closed and a
    /// half-attached sensor is destroyed.
    pub fn attach(
        &self,
        queue: &mut RendezvousQueue,
        spec: &SensorSpec,
        parent: ActorId,
    ) -> Result<Registration, SyncError> {
        let mut blueprint = self.sim.find_blueprint(&spec.blueprint_id)?;
        for (key, value) in &spec.attributes {
            blueprint.set_attribute(key, value.clone());
        }

        let lane = queue.open_lane(&spec.name)?;

        let sensor_id = match self.sim.attach_sensor(&blueprint, &spec.transform, parent) {
            Ok(id) => id,
            Err(e) => {
                queue.close_lane(&spec.name);
                return Err(e.into());
            }
        };

        let handler = DeliveryHandler::new(
            &spec.name,
            self.output_dir.clone(),
            self.storage.clone(),
            lane,
        );
        let listen = self.sim.listen(
            sensor_id,
            Box::new(move |payload| {
                handler.deliver(payload);
            }),
        );

        if let Err(e) = listen {
            queue.close_lane(&spec.name);
            if let Err(cleanup) = self.sim.destroy_sensor(sensor_id) {
                warn!("Failed to destroy half-attached {}: {}", sensor_id, cleanup);
            }
            return Err(e.into());
        }

        info!("Attached '{}' ({}) to {}", spec.name, sensor_id, parent);

        Ok(Registration {
            sensor: spec.name.clone(),
            sensor_id,
            parent,
            expected_per_step: 1,
        })
    }

    /// Closes the lane, stops the sensor and destroys it.
    pub fn detach(
        &self,
        queue: &mut RendezvousQueue,
        registration: Registration,
    ) -> Result<(), SyncError> {
        queue.close_lane(&registration.sensor);

        let stopped = self.sim.stop(registration.sensor_id);
        let destroyed = self.sim.destroy_sensor(registration.sensor_id);

        stopped.and(destroyed).map_err(|e| {
            SyncError::teardown(format!("detach '{}': {}", registration.sensor, e))
        })?;

        info!("Detached '{}' ({})", registration.sensor, registration.sensor_id);
        Ok(())
    }
}
