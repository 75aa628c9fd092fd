//! SimWorld - deterministic in-memory simulator.
//!
//! Implements every collaborator interface of `framesync_env`. Sensor
//! payloads are delivered from a tokio multi-thread runtime after a
//! per-sensor latency, so callbacks never run on the thread that stepped the
//! world.

use crate::context::{lock, SimClock};
use crate::delivery::DeliveryController;

use framesync_env::{
    glob_match, ActorCatalog, ActorId, ActorSnapshot, BehaviorParams, Blueprint, DeliveryCallback,
    EnvError, PayloadKind, Rotation, SensorAttachPoint, SensorId, SensorPayload, SpawnCommand,
    TrafficPolicy, Transform, WeatherParameters, WorldService, WorldSettings,
};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Step size used when the world runs without a fixed delta.
const VARIABLE_STEP_SECONDS: f64 = 0.05;

/// A stalled clock reports a timeout after this long.
const CLOCK_TIMEOUT_MS: u64 = 2000;

/// Actors closer than this to a spawn transform block the spawn.
const COLLISION_RADIUS: f64 = 2.0;

/// Configuration of the simulated world.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of recommended spawn points on the map
    pub spawn_points: usize,

    /// Distance between neighbouring spawn points in meters
    pub spawn_spacing: f64,

    /// Frame number before the first step
    pub start_frame: u64,

    /// Base camera delivery latency
    pub camera_latency_ms: u64,

    /// Base lidar delivery latency
    pub lidar_latency_ms: u64,

    /// Standard deviation of the latency jitter
    pub jitter_ms: f64,

    /// Autopilot cruise speed in m/s
    pub vehicle_speed: f64,

    /// Another client already drives the clock synchronously
    pub externally_synchronous: bool,

    /// Traffic-manager port
    pub tm_port: u16,

    /// Camera resolution unless the blueprint overrides it
    pub image_size: (u32, u32),
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            spawn_points: 40,
            spawn_spacing: 15.0,
            start_frame: 1000,
            camera_latency_ms: 4,
            lidar_latency_ms: 6,
            jitter_ms: 1.0,
            vehicle_speed: 8.0,
            externally_synchronous: false,
            tm_port: 8000,
            image_size: (160, 120),
        }
    }
}

struct SimActor {
    blueprint: Blueprint,
    transform: Transform,
    autopilot: Option<u16>,
}

struct SimSensor {
    blueprint: Blueprint,
    parent: ActorId,
    offset: Transform,
    callback: Option<Arc<DeliveryCallback>>,
    held: Vec<SensorPayload>,
}

/// Global traffic-manager state as last applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrafficState {
    pub synchronous: bool,
    pub follow_distance: f64,
    pub hybrid_physics: bool,
    pub speed_bias_pct: f64,
    pub overrides: BTreeMap<ActorId, BehaviorParams>,
}

struct WorldState {
    settings: WorldSettings,
    next_id: u32,
    actors: BTreeMap<ActorId, SimActor>,
    sensors: BTreeMap<u32, SimSensor>,
    spectator: Transform,
    weather: WeatherParameters,
    traffic: TrafficState,
}

/// The simulated world.
pub struct SimWorld {
    config: SimConfig,
    clock: SimClock,
    blueprints: Vec<Blueprint>,
    spawn_points: Vec<Transform>,
    state: Mutex<WorldState>,
    delivery: Arc<DeliveryController>,
    rng: Mutex<ChaCha8Rng>,
    runtime: Runtime,
}

impl SimWorld {
    /// Creates a world with a fresh delivery runtime.
    pub fn new(config: SimConfig) -> Result<Self, EnvError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sim-sensor")
            .enable_time()
            .build()?;

        let settings = if config.externally_synchronous {
            WorldSettings {
                synchronous_mode: true,
                fixed_delta_seconds: Some(VARIABLE_STEP_SECONDS),
            }
        } else {
            WorldSettings::default()
        };

        let spawn_points = grid_spawn_points(config.spawn_points, config.spawn_spacing);
        let latency_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        info!(
            "SimWorld ready: seed={}, {} spawn points, frame {}",
            config.seed,
            spawn_points.len(),
            config.start_frame
        );

        Ok(Self {
            clock: SimClock::new(config.start_frame),
            blueprints: blueprint_library(config.image_size),
            spawn_points,
            state: Mutex::new(WorldState {
                settings,
                next_id: 1,
                actors: BTreeMap::new(),
                sensors: BTreeMap::new(),
                spectator: Transform::default(),
                weather: WeatherParameters {
                    cloudiness: 0.0,
                    precipitation: 0.0,
                    fog_density: 0.0,
                },
                traffic: TrafficState::default(),
            }),
            delivery: Arc::new(DeliveryController::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(latency_seed)),
            runtime,
            config,
        })
    }

    /// Creates an Arc-wrapped world for sharing.
    pub fn shared(config: SimConfig) -> Result<Arc<Self>, EnvError> {
        Self::new(config).map(Arc::new)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn delivery(&self) -> &Arc<DeliveryController> {
        &self.delivery
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Live vehicles and other non-sensor actors.
    pub fn actor_count(&self) -> usize {
        lock(&self.state).actors.len()
    }

    pub fn sensor_count(&self) -> usize {
        lock(&self.state).sensors.len()
    }

    pub fn is_listening(&self, sensor: SensorId) -> bool {
        lock(&self.state)
            .sensors
            .get(&sensor.0)
            .is_some_and(|s| s.callback.is_some())
    }

    pub fn autopilot_port(&self, actor: ActorId) -> Option<u16> {
        lock(&self.state).actors.get(&actor).and_then(|a| a.autopilot)
    }

    pub fn actor_attribute(&self, actor: ActorId, key: &str) -> Option<String> {
        lock(&self.state)
            .actors
            .get(&actor)
            .and_then(|a| a.blueprint.attribute(key).map(str::to_string))
    }

    pub fn traffic(&self) -> TrafficState {
        lock(&self.state).traffic.clone()
    }

    pub fn spectator(&self) -> Transform {
        lock(&self.state).spectator
    }

    pub fn weather(&self) -> WeatherParameters {
        lock(&self.state).weather
    }

    /// Steps the world and schedules one payload per listening sensor.
    fn step(&self) -> Result<u64, EnvError> {
        self.delivery.check_connected()?;
        if self.delivery.clock_stalls(self.clock.frame() + 1) {
            return Err(EnvError::Timeout(CLOCK_TIMEOUT_MS));
        }

        let mut scheduled = Vec::new();
        let frame = {
            let mut state = lock(&self.state);
            let dt = state
                .settings
                .fixed_delta_seconds
                .unwrap_or(VARIABLE_STEP_SECONDS);
            let (frame, timestamp) = self.clock.tick(dt);

            for actor in state.actors.values_mut() {
                if actor.autopilot.is_some() {
                    actor.transform.location.x += self.config.vehicle_speed * dt;
                }
            }

            let mut rng = lock(&self.rng);
            for (&id, sensor) in state.sensors.iter_mut() {
                let Some(callback) = sensor.callback.clone() else {
                    continue;
                };
                let sensor_id = SensorId(id);
                let payload = render_payload(&sensor.blueprint, frame, timestamp);

                if self.delivery.is_withheld(sensor_id) {
                    sensor.held.push(payload);
                    continue;
                }

                let mut outgoing: Vec<SensorPayload> = sensor.held.drain(..).collect();
                outgoing.push(payload);

                for payload in outgoing {
                    if self.delivery.should_drop(sensor_id, &mut *rng) {
                        debug!("Lost {} payload for frame {}", sensor_id, payload.frame);
                        continue;
                    }
                    let delay = self.delivery_delay(sensor_id, &sensor.blueprint, &mut *rng);
                    scheduled.push((callback.clone(), payload, delay));
                }
            }
            frame
        };

        for (callback, payload, delay) in scheduled {
            self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                (callback.as_ref())(payload);
            });
        }

        debug!("Frame {}", frame);
        Ok(frame)
    }

    fn delivery_delay(&self, sensor: SensorId, blueprint: &Blueprint, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.delivery.latency(sensor).unwrap_or_else(|| {
            if blueprint.id.starts_with("sensor.camera") {
                self.config.camera_latency_ms
            } else {
                self.config.lidar_latency_ms
            }
        });

        let jitter = Normal::new(0.0, self.config.jitter_ms.max(0.0))
            .map(|n| n.sample(rng).abs())
            .unwrap_or(0.0);

        Duration::from_secs_f64((base as f64 + jitter) / 1000.0)
    }

    fn spawn_locked(
        state: &mut WorldState,
        blueprint: &Blueprint,
        transform: &Transform,
    ) -> Result<ActorId, EnvError> {
        if !blueprint.id.starts_with("vehicle.") && !blueprint.id.starts_with("walker.") {
            return Err(EnvError::rejected(format!(
                "'{}' cannot be spawned as a free actor",
                blueprint.id
            )));
        }

        let blocked = state
            .actors
            .values()
            .any(|a| (a.transform.location - transform.location).norm() < COLLISION_RADIUS);
        if blocked {
            return Err(EnvError::rejected(
                "Spawn failed because of collision at spawn position",
            ));
        }

        let id = ActorId(state.next_id);
        state.next_id += 1;
        state.actors.insert(
            id,
            SimActor {
                blueprint: blueprint.clone(),
                transform: *transform,
                autopilot: None,
            },
        );
        Ok(id)
    }
}

impl WorldService for SimWorld {
    fn settings(&self) -> Result<WorldSettings, EnvError> {
        self.delivery.check_connected()?;
        Ok(lock(&self.state).settings)
    }

    fn apply_settings(&self, settings: &WorldSettings) -> Result<u64, EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).settings = *settings;
        info!(
            "World settings: synchronous={}, fixed_delta={:?}",
            settings.synchronous_mode, settings.fixed_delta_seconds
        );
        Ok(self.clock.frame())
    }

    fn advance_step(&self) -> Result<u64, EnvError> {
        self.step()
    }

    /// The simulated external master ticks as soon as we wait.
    fn wait_for_step(&self) -> Result<u64, EnvError> {
        self.step()
    }

    fn current_frame(&self) -> Result<u64, EnvError> {
        self.delivery.check_connected()?;
        Ok(self.clock.frame())
    }

    fn actors_matching(&self, pattern: &str) -> Result<Vec<ActorSnapshot>, EnvError> {
        self.delivery.check_connected()?;
        let state = lock(&self.state);

        let mut snapshots: Vec<ActorSnapshot> = state
            .actors
            .iter()
            .filter(|(_, a)| glob_match(pattern, &a.blueprint.id))
            .map(|(&id, a)| ActorSnapshot {
                id,
                type_id: a.blueprint.id.clone(),
                role_name: a.blueprint.attribute("role_name").map(str::to_string),
                transform: a.transform,
            })
            .collect();

        for (&id, sensor) in state.sensors.iter() {
            if !glob_match(pattern, &sensor.blueprint.id) {
                continue;
            }
            let parent = state
                .actors
                .get(&sensor.parent)
                .map(|a| a.transform)
                .unwrap_or_default();
            snapshots.push(ActorSnapshot {
                id: ActorId(id),
                type_id: sensor.blueprint.id.clone(),
                role_name: None,
                transform: Transform::new(
                    parent.location + sensor.offset.location,
                    sensor.offset.rotation,
                ),
            });
        }

        Ok(snapshots)
    }

    fn spawn_points(&self) -> Result<Vec<Transform>, EnvError> {
        self.delivery.check_connected()?;
        Ok(self.spawn_points.clone())
    }

    fn set_weather(&self, weather: &WeatherParameters) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).weather = *weather;
        Ok(())
    }

    fn set_spectator_transform(&self, transform: &Transform) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).spectator = *transform;
        Ok(())
    }
}

impl ActorCatalog for SimWorld {
    fn find_blueprint(&self, id: &str) -> Result<Blueprint, EnvError> {
        self.delivery.check_connected()?;
        self.blueprints
            .iter()
            .find(|bp| bp.id == id)
            .cloned()
            .ok_or_else(|| EnvError::not_found(format!("blueprint '{}'", id)))
    }

    fn filter_blueprints(&self, pattern: &str) -> Result<Vec<Blueprint>, EnvError> {
        self.delivery.check_connected()?;
        Ok(self
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
        attach_to: Option<ActorId>,
    ) -> Result<ActorId, EnvError> {
        self.delivery.check_connected()?;
        let mut state = lock(&self.state);

        let world_transform = match attach_to {
            Some(parent) => {
                let base = state
                    .actors
                    .get(&parent)
                    .map(|a| a.transform)
                    .ok_or_else(|| EnvError::not_found(parent))?;
                Transform::new(base.location + transform.location, transform.rotation)
            }
            None => *transform,
        };

        Self::spawn_locked(&mut state, blueprint, &world_transform)
    }

    fn apply_batch_sync(
        &self,
        commands: Vec<SpawnCommand>,
        advance: bool,
    ) -> Result<Vec<Result<ActorId, String>>, EnvError> {
        self.delivery.check_connected()?;

        let responses = {
            let mut state = lock(&self.state);
            commands
                .iter()
                .map(|command| {
                    let id = Self::spawn_locked(&mut state, &command.blueprint, &command.transform)
                        .map_err(|e| e.to_string())?;
                    if let (Some(port), Some(actor)) = (command.autopilot, state.actors.get_mut(&id)) {
                        actor.autopilot = Some(port);
                    }
                    Ok(id)
                })
                .collect::<Vec<Result<ActorId, String>>>()
        };

        if advance {
            self.step()?;
        }
        Ok(responses)
    }

    fn destroy_actors(&self, ids: &[ActorId]) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        let mut state = lock(&self.state);

        state.actors.retain(|id, _| !ids.contains(id));
        state.sensors.retain(|_, s| !ids.contains(&s.parent));
        state.traffic.overrides.retain(|id, _| !ids.contains(id));

        debug!("Destroyed {} actors", ids.len());
        Ok(())
    }

    fn set_autopilot(&self, id: ActorId, enabled: bool, tm_port: u16) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        let mut state = lock(&self.state);
        let actor = state
            .actors
            .get_mut(&id)
            .ok_or_else(|| EnvError::not_found(id))?;
        actor.autopilot = enabled.then_some(tm_port);
        Ok(())
    }

    fn actor_transform(&self, id: ActorId) -> Result<Transform, EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state)
            .actors
            .get(&id)
            .map(|a| a.transform)
            .ok_or_else(|| EnvError::not_found(id))
    }
}

impl SensorAttachPoint for SimWorld {
    fn attach_sensor(
        &self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: ActorId,
    ) -> Result<SensorId, EnvError> {
        self.delivery.check_connected()?;
        if !blueprint.id.starts_with("sensor.") {
            return Err(EnvError::rejected(format!("'{}' is not a sensor", blueprint.id)));
        }

        let mut state = lock(&self.state);
        if !state.actors.contains_key(&parent) {
            return Err(EnvError::not_found(parent));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.sensors.insert(
            id,
            SimSensor {
                blueprint: blueprint.clone(),
                parent,
                offset: *transform,
                callback: None,
                held: Vec::new(),
            },
        );
        Ok(SensorId(id))
    }

    fn listen(&self, sensor: SensorId, callback: DeliveryCallback) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        let mut state = lock(&self.state);
        let entry = state
            .sensors
            .get_mut(&sensor.0)
            .ok_or_else(|| EnvError::not_found(sensor))?;
        entry.callback = Some(Arc::new(callback));
        Ok(())
    }

    fn stop(&self, sensor: SensorId) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        if let Some(entry) = lock(&self.state).sensors.get_mut(&sensor.0) {
            entry.callback = None;
            entry.held.clear();
        }
        Ok(())
    }

    /// Unknown sensors are ignored; destroying a parent already removed them.
    fn destroy_sensor(&self, sensor: SensorId) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).sensors.remove(&sensor.0);
        Ok(())
    }
}

impl TrafficPolicy for SimWorld {
    fn port(&self) -> u16 {
        self.config.tm_port
    }

    fn set_synchronous_mode(&self, enabled: bool) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).traffic.synchronous = enabled;
        Ok(())
    }

    fn set_global_follow_distance(&self, meters: f64) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).traffic.follow_distance = meters;
        Ok(())
    }

    fn set_hybrid_physics(&self, enabled: bool) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).traffic.hybrid_physics = enabled;
        Ok(())
    }

    fn set_global_speed_bias(&self, pct: f64) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        lock(&self.state).traffic.speed_bias_pct = pct;
        Ok(())
    }

    fn set_actor_override(&self, id: ActorId, params: &BehaviorParams) -> Result<(), EnvError> {
        self.delivery.check_connected()?;
        let mut state = lock(&self.state);
        if !state.actors.contains_key(&id) {
            return Err(EnvError::not_found(id));
        }
        state.traffic.overrides.insert(id, *params);
        Ok(())
    }
}

/// Spawn points on a 10-wide grid, all facing +x.
fn grid_spawn_points(count: usize, spacing: f64) -> Vec<Transform> {
    (0..count)
        .map(|i| {
            Transform::new(
                Vector3::new((i % 10) as f64 * spacing, (i / 10) as f64 * spacing, 0.3),
                Rotation::default(),
            )
        })
        .collect()
}

fn blueprint_library(image_size: (u32, u32)) -> Vec<Blueprint> {
    let colors: &[&str] = &["255,0,0", "0,0,255", "255,255,255", "20,20,20", "200,180,0"];

    vec![
        Blueprint::new("vehicle.audi.a2").with_recommended("color", colors),
        Blueprint::new("vehicle.audi.tt")
            .with_recommended("color", colors)
            .with_recommended("driver_id", &["0", "1"]),
        Blueprint::new("vehicle.bmw.grandtourer").with_recommended("color", colors),
        Blueprint::new("vehicle.lincoln.mkz_2020")
            .with_recommended("color", colors)
            .with_recommended("driver_id", &["0", "1", "2"]),
        Blueprint::new("vehicle.mercedes-benz.coupe")
            .with_recommended("color", &["0, 255, 0", "255,255,255"]),
        Blueprint::new("vehicle.nissan.micra").with_recommended("color", colors),
        Blueprint::new("vehicle.tesla.model3").with_recommended("color", colors),
        Blueprint::new("vehicle.toyota.prius")
            .with_recommended("color", colors)
            .with_recommended("driver_id", &["0"]),
        Blueprint::new("sensor.camera.rgb")
            .with_recommended("image_size_x", &[image_size.0.to_string().as_str()])
            .with_recommended("image_size_y", &[image_size.1.to_string().as_str()]),
        Blueprint::new("sensor.lidar.ray_cast")
            .with_recommended("channels", &["32"])
            .with_recommended("points_per_second", &["56000"])
            .with_recommended("rotation_frequency", &["10"])
            .with_recommended("range", &["10"]),
    ]
}

fn attribute_or<T: std::str::FromStr>(blueprint: &Blueprint, key: &str, default: T) -> T {
    blueprint
        .attribute(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Synthesizes the payload a sensor produces for `frame`.
///
/// Cameras yield an RGBA gradient; lidars yield `x, y, z, intensity` as
/// little-endian `f32` on a ring of the configured range.
fn render_payload(blueprint: &Blueprint, frame: u64, timestamp: f64) -> SensorPayload {
    if blueprint.id.starts_with("sensor.camera") {
        let width: u32 = attribute_or(blueprint, "image_size_x", 160);
        let height: u32 = attribute_or(blueprint, "image_size_y", 120);
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push((x as u64 + frame) as u8);
                data.push((y as u64 + frame) as u8);
                data.push((frame * 3) as u8);
                data.push(255);
            }
        }
        return SensorPayload {
            frame,
            timestamp,
            kind: PayloadKind::Image { width, height },
            data,
        };
    }

    let pps: f64 = attribute_or(blueprint, "points_per_second", 56000.0);
    let hz: f64 = attribute_or(blueprint, "rotation_frequency", 10.0);
    let range: f32 = attribute_or(blueprint, "range", 10.0);
    let channels: u32 = attribute_or(blueprint, "channels", 32).max(1);
    let points = (pps / hz.max(1.0)) as u32;

    let mut data = Vec::with_capacity(points as usize * 16);
    for i in 0..points {
        let angle = (i as f32 / points.max(1) as f32) * std::f32::consts::TAU + frame as f32 * 0.01;
        let radius = range * (0.5 + 0.5 * ((i * 7 % 13) as f32 / 13.0));
        let ring = (i % channels) as f32;
        let point = [
            radius * angle.cos(),
            radius * angle.sin(),
            -1.5 + ring * 0.1,
            1.0,
        ];
        for v in point {
            data.extend_from_slice(&v.to_le_bytes());
        }
    }

    SensorPayload {
        frame,
        timestamp,
        kind: PayloadKind::PointCloud { points },
        data,
    }
}
