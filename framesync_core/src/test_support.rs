//! In-crate fake simulator for unit tests.
//!
//! Sensor callbacks run synchronously inside `advance_step`, so every
//! non-withheld record is buffered before the coordinator starts draining.

use crate::policy::GlobalTrafficPolicy;

use framesync_env::{
    glob_match, ActorCatalog, ActorId, ActorSnapshot, BehaviorParams, Blueprint, DeliveryCallback,
    EnvError, PayloadKind, SensorAttachPoint, SensorId, SensorPayload, SpawnCommand, StorageSink,
    TrafficPolicy, Transform, WeatherParameters, WorldService, WorldSettings,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

struct FakeActor {
    id: ActorId,
    type_id: String,
    role_name: Option<String>,
    transform: Transform,
    autopilot: Option<u16>,
}

struct FakeSensor {
    blueprint: Blueprint,
    parent: ActorId,
    callback: Option<Arc<DeliveryCallback>>,
    withheld: bool,
    held: Vec<SensorPayload>,
}

struct FakeState {
    settings: WorldSettings,
    frame: u64,
    connected: bool,
    fail_next: bool,
    skip: u64,
    spawn_points: Vec<Transform>,
    blueprints: Vec<Blueprint>,
    next_id: u32,
    actors: Vec<FakeActor>,
    sensors: BTreeMap<u32, FakeSensor>,
    spectator: Option<Transform>,
    global: GlobalTrafficPolicy,
    traffic_sync: bool,
    overrides: Vec<(ActorId, BehaviorParams)>,
}

pub(crate) struct FakeWorld {
    state: Mutex<FakeState>,
}

impl FakeWorld {
    pub fn new(spawn_points: usize) -> Self {
        let blueprints = vec![
            Blueprint::new("vehicle.audi.tt").with_recommended("color", &["255,0,0", "0,0,255"]),
            Blueprint::new("vehicle.tesla.model3")
                .with_recommended("color", &["10,10,10"])
                .with_recommended("driver_id", &["1", "2"]),
            Blueprint::new("vehicle.mercedes-benz.coupe")
                .with_recommended("color", &["0, 255, 0", "255,255,255"]),
            Blueprint::new("sensor.camera.rgb"),
            Blueprint::new("sensor.lidar.ray_cast"),
        ];

        Self {
            state: Mutex::new(FakeState {
                settings: WorldSettings::default(),
                frame: 100,
                connected: true,
                fail_next: false,
                skip: 0,
                spawn_points: (0..spawn_points)
                    .map(|i| Transform::at(i as f64 * 10.0, 0.0, 0.3))
                    .collect(),
                blueprints,
                next_id: 1,
                actors: Vec::new(),
                sensors: BTreeMap::new(),
                spectator: None,
                global: GlobalTrafficPolicy {
                    follow_distance: 0.0,
                    hybrid_physics: false,
                    speed_bias_pct: 0.0,
                },
                traffic_sync: false,
                overrides: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn connected(&self) -> Result<MutexGuard<'_, FakeState>, EnvError> {
        let state = self.lock();
        if !state.connected {
            return Err(EnvError::connection("fake world disconnected"));
        }
        Ok(state)
    }

    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    /// The next step jumps `n` extra frames.
    pub fn skip_frames(&self, n: u64) {
        self.lock().skip = n;
    }

    pub fn fail_next_advance(&self) {
        self.lock().fail_next = true;
    }

    /// Spawns a vehicle directly at spawn point `idx`.
    pub fn spawn_vehicle(&self, blueprint_id: &str, idx: usize) -> ActorId {
        let transform = self.lock().spawn_points[idx];
        let blueprint = self.find_blueprint(blueprint_id).unwrap();
        self.spawn_actor(&blueprint, &transform, None).unwrap()
    }

    pub fn actor_count(&self) -> usize {
        self.lock().actors.len()
    }

    pub fn autopilot_port(&self, id: ActorId) -> Option<u16> {
        self.lock()
            .actors
            .iter()
            .find(|a| a.id == id)
            .and_then(|a| a.autopilot)
    }

    pub fn is_listening(&self, sensor: SensorId) -> bool {
        self.lock()
            .sensors
            .get(&sensor.0)
            .map(|s| s.callback.is_some())
            .unwrap_or(false)
    }

    pub fn sensor_attribute(&self, sensor: SensorId, key: &str) -> Option<String> {
        self.lock()
            .sensors
            .get(&sensor.0)
            .and_then(|s| s.blueprint.attribute(key).map(str::to_string))
    }

    pub fn sensor_exists(&self, sensor: SensorId) -> bool {
        self.lock().sensors.contains_key(&sensor.0)
    }

    pub fn sensor_count(&self) -> usize {
        self.lock().sensors.len()
    }

    /// Holds back the sensor's payloads until [`FakeWorld::release`].
    pub fn withhold(&self, sensor: SensorId) {
        if let Some(s) = self.lock().sensors.get_mut(&sensor.0) {
            s.withheld = true;
        }
    }

    /// Held payloads are delivered at the start of the next step.
    pub fn release(&self, sensor: SensorId) {
        if let Some(s) = self.lock().sensors.get_mut(&sensor.0) {
            s.withheld = false;
        }
    }

    pub fn spectator(&self) -> Option<Transform> {
        self.lock().spectator
    }

    pub fn global_policy(&self) -> GlobalTrafficPolicy {
        self.lock().global.clone()
    }

    pub fn traffic_synchronous(&self) -> bool {
        self.lock().traffic_sync
    }

    pub fn overrides(&self) -> Vec<(ActorId, BehaviorParams)> {
        self.lock().overrides.clone()
    }

    fn step(&self) -> Result<u64, EnvError> {
        let (frame, deliveries) = {
            let mut state = self.connected()?;
            if std::mem::take(&mut state.fail_next) {
                return Err(EnvError::Timeout(2000));
            }

            state.frame += 1 + std::mem::take(&mut state.skip);
            let frame = state.frame;
            let timestamp = frame as f64 * state.settings.fixed_delta_seconds.unwrap_or(0.05);

            let mut deliveries = Vec::new();
            for sensor in state.sensors.values_mut() {
                let Some(callback) = sensor.callback.clone() else {
                    continue;
                };
                let kind = if sensor.blueprint.id.starts_with("sensor.camera") {
                    PayloadKind::Image { width: 2, height: 2 }
                } else {
                    PayloadKind::PointCloud { points: 4 }
                };
                let payload = SensorPayload {
                    frame,
                    timestamp,
                    kind,
                    data: vec![0; 16],
                };

                if sensor.withheld {
                    sensor.held.push(payload);
                    continue;
                }
                for held in sensor.held.drain(..) {
                    deliveries.push((callback.clone(), held));
                }
                deliveries.push((callback, payload));
            }
            (frame, deliveries)
        };

        for (callback, payload) in deliveries {
            (callback.as_ref())(payload);
        }
        Ok(frame)
    }

    fn spawn_locked(
        state: &mut FakeState,
        blueprint: &Blueprint,
        transform: &Transform,
    ) -> Result<ActorId, String> {
        let occupied = state
            .actors
            .iter()
            .any(|a| (a.transform.location - transform.location).norm() < 0.5);
        if occupied {
            return Err("Spawn failed because of collision at spawn position".to_string());
        }

        let id = ActorId(state.next_id);
        state.next_id += 1;
        state.actors.push(FakeActor {
            id,
            type_id: blueprint.id.clone(),
            role_name: blueprint.attribute("role_name").map(str::to_string),
            transform: *transform,
            autopilot: None,
        });
        Ok(id)
    }
}

impl WorldService for FakeWorld {
    fn settings(&self) -> Result<WorldSettings, EnvError> {
        Ok(self.connected()?.settings)
    }

    fn apply_settings(&self, settings: &WorldSettings) -> Result<u64, EnvError> {
        let mut state = self.connected()?;
        state.settings = *settings;
        Ok(state.frame)
    }

    fn advance_step(&self) -> Result<u64, EnvError> {
        self.step()
    }

    fn wait_for_step(&self) -> Result<u64, EnvError> {
        self.step()
    }

    fn current_frame(&self) -> Result<u64, EnvError> {
        Ok(self.connected()?.frame)
    }

    fn actors_matching(&self, pattern: &str) -> Result<Vec<ActorSnapshot>, EnvError> {
        Ok(self
            .connected()?
            .actors
            .iter()
            .filter(|a| glob_match(pattern, &a.type_id))
            .map(|a| ActorSnapshot {
                id: a.id,
                type_id: a.type_id.clone(),
                role_name: a.role_name.clone(),
                transform: a.transform,
            })
            .collect())
    }

    fn spawn_points(&self) -> Result<Vec<Transform>, EnvError> {
        Ok(self.connected()?.spawn_points.clone())
    }

    fn set_weather(&self, _weather: &WeatherParameters) -> Result<(), EnvError> {
        self.connected().map(|_| ())
    }

    fn set_spectator_transform(&self, transform: &Transform) -> Result<(), EnvError> {
        self.connected()?.spectator = Some(*transform);
        Ok(())
    }
}

impl ActorCatalog for FakeWorld {
    fn find_blueprint(&self, id: &str) -> Result<Blueprint, EnvError> {
        self.connected()?
            .blueprints
            .iter()
            .find(|bp| bp.id == id)
            .cloned()
            .ok_or_else(|| EnvError::not_found(format!("blueprint '{}'", id)))
    }

    fn filter_blueprints(&self, pattern: &str) -> Result<Vec<Blueprint>, EnvError> {
        Ok(self
            .connected()?
            .blueprints
            .iter()
            .filter(|bp| glob_match(pattern, &bp.id))
            .cloned()
            .collect())
    }

    fn spawn_actor(
        &self,
        blueprint: &Blueprint,
        transform: &Transform,
        _attach_to: Option<ActorId>,
    ) -> Result<ActorId, EnvError> {
        let mut state = self.connected()?;
        Self::spawn_locked(&mut state, blueprint, transform).map_err(EnvError::rejected)
    }

    fn apply_batch_sync(
        &self,
        commands: Vec<SpawnCommand>,
        advance: bool,
    ) -> Result<Vec<Result<ActorId, String>>, EnvError> {
        let responses = {
            let mut state = self.connected()?;
            let mut responses = Vec::with_capacity(commands.len());
            for command in &commands {
                let response = Self::spawn_locked(&mut state, &command.blueprint, &command.transform);
                if let (Ok(id), Some(port)) = (&response, command.autopilot) {
                    if let Some(actor) = state.actors.iter_mut().find(|a| a.id == *id) {
                        actor.autopilot = Some(port);
                    }
                }
                responses.push(response);
            }
            responses
        };

        if advance {
            self.step()?;
        }
        Ok(responses)
    }

    fn destroy_actors(&self, ids: &[ActorId]) -> Result<(), EnvError> {
        let mut state = self.connected()?;
        state.actors.retain(|a| !ids.contains(&a.id));
        state.sensors.retain(|_, s| !ids.contains(&s.parent));
        Ok(())
    }

    fn set_autopilot(&self, id: ActorId, enabled: bool, tm_port: u16) -> Result<(), EnvError> {
        let mut state = self.connected()?;
        let actor = state
            .actors
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| EnvError::not_found(id.to_string()))?;
        actor.autopilot = enabled.then_some(tm_port);
        Ok(())
    }

    fn actor_transform(&self, id: ActorId) -> Result<Transform, EnvError> {
        self.connected()?
            .actors
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.transform)
            .ok_or_else(|| EnvError::not_found(id.to_string()))
    }
}

impl SensorAttachPoint for FakeWorld {
    fn attach_sensor(
        &self,
        blueprint: &Blueprint,
        _transform: &Transform,
        parent: ActorId,
    ) -> Result<SensorId, EnvError> {
        let mut state = self.connected()?;
        if !state.actors.iter().any(|a| a.id == parent) {
            return Err(EnvError::not_found(parent.to_string()));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.sensors.insert(
            id,
            FakeSensor {
                blueprint: blueprint.clone(),
                parent,
                callback: None,
                withheld: false,
                held: Vec::new(),
            },
        );
        Ok(SensorId(id))
    }

    fn listen(&self, sensor: SensorId, callback: DeliveryCallback) -> Result<(), EnvError> {
        let mut state = self.connected()?;
        let s = state
            .sensors
            .get_mut(&sensor.0)
            .ok_or_else(|| EnvError::not_found(sensor.to_string()))?;
        s.callback = Some(Arc::new(callback));
        Ok(())
    }

    fn stop(&self, sensor: SensorId) -> Result<(), EnvError> {
        if let Some(s) = self.connected()?.sensors.get_mut(&sensor.0) {
            s.callback = None;
        }
        Ok(())
    }

    fn destroy_sensor(&self, sensor: SensorId) -> Result<(), EnvError> {
        self.connected()?.sensors.remove(&sensor.0);
        Ok(())
    }
}

impl TrafficPolicy for FakeWorld {
    fn port(&self) -> u16 {
        8000
    }

    fn set_synchronous_mode(&self, enabled: bool) -> Result<(), EnvError> {
        self.connected()?.traffic_sync = enabled;
        Ok(())
    }

    fn set_global_follow_distance(&self, meters: f64) -> Result<(), EnvError> {
        self.connected()?.global.follow_distance = meters;
        Ok(())
    }

    fn set_hybrid_physics(&self, enabled: bool) -> Result<(), EnvError> {
        self.connected()?.global.hybrid_physics = enabled;
        Ok(())
    }

    fn set_global_speed_bias(&self, pct: f64) -> Result<(), EnvError> {
        self.connected()?.global.speed_bias_pct = pct;
        Ok(())
    }

    fn set_actor_override(&self, id: ActorId, params: &BehaviorParams) -> Result<(), EnvError> {
        self.connected()?.overrides.push((id, *params));
        Ok(())
    }
}

/// Storage sink that records saved paths.
#[derive(Default)]
pub(crate) struct RecordingSink {
    saved: Mutex<Vec<PathBuf>>,
    failing: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn saved(&self) -> Vec<PathBuf> {
        self.saved.lock().unwrap().clone()
    }
}

impl StorageSink for RecordingSink {
    fn save(&self, _payload: &SensorPayload, path: &Path) -> Result<(), EnvError> {
        if self.failing {
            return Err(EnvError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.saved.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
