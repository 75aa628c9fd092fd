//! End-to-end coordination against SimWorld.

use framesync_core::{
    ActorRole, ActorSpawnRequest, BehaviorOverride, CancelToken, ClockController, Coordinator,
    FleetProvisioner, PolicyOverrider, SyncConfig, SyncError,
};
use framesync_env::{ActorCatalog, WorldService, WorldSettings};
use framesync_sim::{MemorySink, SimConfig, SimWorld};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

type SimCoordinator = Coordinator<SimWorld, SimWorld, MemorySink>;

fn config(vehicles: usize) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.fleet.vehicles = vehicles;
    config.queue.timeout_ms = 150;
    config
}

fn start(vehicles: usize) -> (Arc<SimWorld>, Arc<MemorySink>, SimCoordinator, SyncConfig) {
    let world = SimWorld::shared(SimConfig::default()).unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = config(vehicles);
    let mut coordinator = Coordinator::new(world.clone(), world.clone(), sink.clone(), &config).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    coordinator.setup(&config, &mut rng).unwrap();
    (world, sink, coordinator, config)
}

fn lidar_id(coordinator: &SimCoordinator) -> framesync_env::SensorId {
    coordinator
        .registrations()
        .iter()
        .find(|r| r.sensor == "lidar")
        .map(|r| r.sensor_id)
        .unwrap()
}

#[test]
fn test_both_sensors_on_time_gives_full_step() {
    let (_world, sink, mut coordinator, _) = start(3);

    let report = coordinator.step_once().unwrap();

    assert!(report.is_full());
    assert!(report.missing.is_empty());
    assert_eq!(report.received.len(), 2);
    assert!(report.received.iter().all(|r| r.step == report.step));
    assert_eq!(sink.count_for_frame(report.step.value()), 2);
}

#[test]
fn test_withheld_sensor_gives_partial_step_and_loop_continues() {
    let (world, _sink, mut coordinator, config) = start(3);
    world.delivery().withhold(lidar_id(&coordinator));

    let first = coordinator.step_once().unwrap();
    let second = coordinator.step_once().unwrap();

    for report in [&first, &second] {
        assert!(!report.is_full());
        assert_eq!(report.missing, vec!["lidar".to_string()]);
        assert_eq!(report.received.len(), 1);
        assert_eq!(report.received[0].sensor, "camera");
        // One timed-out attempt, never an unbounded wait
        assert!(report.elapsed < config.queue.timeout() * 3);
    }
    assert_eq!(second.step, first.step.next());
}

#[test]
fn test_released_sensor_records_arrive_late() {
    let (world, _sink, mut coordinator, _) = start(2);
    let lidar = lidar_id(&coordinator);
    world.delivery().withhold(lidar);

    let withheld = coordinator.step_once().unwrap();
    world.delivery().release(lidar);

    // The held payload goes out with the next step's own payload
    let mut late = Vec::new();
    for _ in 0..3 {
        let report = coordinator.step_once().unwrap();
        late.extend(report.late.iter().map(|r| r.step));
        if report.is_full() && !late.is_empty() {
            break;
        }
    }

    assert!(late.contains(&withheld.step));
}

#[test]
fn test_records_never_reference_unissued_steps() {
    let (_world, _sink, mut coordinator, _) = start(2);

    for _ in 0..5 {
        let report = coordinator.step_once().unwrap();
        let latest = coordinator.clock().last_step();
        assert!(report.received.iter().all(|r| r.step <= latest));
        assert!(report.late.iter().all(|r| r.step < report.step));
    }
    assert_eq!(coordinator.queue().stats().future_rejects, 0);
}

#[test]
fn test_batch_with_one_bad_blueprint() {
    let (world, _sink, mut coordinator, _) = start(0);
    let occupied = world.actors_matching("vehicle.*").unwrap();
    let points: Vec<_> = world
        .spawn_points()
        .unwrap()
        .into_iter()
        .filter(|p| occupied.iter().all(|a| (a.transform.location - p.location).norm() > 5.0))
        .collect();

    let ids = ["vehicle.audi.a2", "vehicle.audi.tt", "vehicle.nonexistent", "vehicle.nissan.micra", "vehicle.tesla.model3"];
    let requests: Vec<ActorSpawnRequest> = ids
        .iter()
        .zip(&points)
        .map(|(bp, point)| ActorSpawnRequest::new(bp, *point, ActorRole::Fleet).with_autopilot(8000))
        .collect();

    let pending = coordinator.provisioner_mut().provision_batch(requests).unwrap();
    let (batch, report) = coordinator.confirm_batch(pending).unwrap();

    // Sensors were attached during setup, so the confirming step is drained
    let report = report.unwrap();
    assert_eq!(report.step, batch.step);
    assert!(report.is_full());

    assert_eq!(batch.spawned().len(), 4);
    assert_eq!(batch.failed_count(), 1);
    assert!(!batch.outcomes[2].is_spawned());
    assert_eq!(batch.warnings.len(), 1);

    for id in batch.spawned_ids() {
        assert!(coordinator.provisioner().actor_transform(id).is_ok());
        assert_eq!(world.autopilot_port(id), Some(8000));
    }
    let next = coordinator.step_once().unwrap();
    assert!(next.is_full());
    assert!(next.late.is_empty());
}

#[test]
fn test_mid_run_batch_leaves_no_late_records() {
    let (world, _sink, mut coordinator, _) = start(1);
    coordinator.step_once().unwrap();

    let occupied = world.actors_matching("vehicle.*").unwrap();
    let point = world
        .spawn_points()
        .unwrap()
        .into_iter()
        .find(|p| occupied.iter().all(|a| (a.transform.location - p.location).norm() > 5.0))
        .unwrap();
    let request = ActorSpawnRequest::new("vehicle.audi.tt", point, ActorRole::Fleet);

    let pending = coordinator.provisioner_mut().provision_batch(vec![request]).unwrap();
    let (_, report) = coordinator.confirm_batch(pending).unwrap();
    assert!(report.unwrap().late.is_empty());

    for _ in 0..3 {
        let report = coordinator.step_once().unwrap();
        assert!(report.is_full());
        assert!(report.late.is_empty());
    }
    assert_eq!(coordinator.summary().late_deliveries, 0);
}

#[test]
fn test_destroying_ego_detaches_its_sensors() {
    let (world, _sink, mut coordinator, _) = start(2);
    let ego = coordinator
        .registry()
        .with_role(ActorRole::Ego)
        .map(|h| h.actor_id)
        .next()
        .unwrap();

    assert!(coordinator.destroy_actor(ego).unwrap());

    assert!(coordinator.registrations().is_empty());
    assert_eq!(world.sensor_count(), 0);
    assert!(world.actor_transform(ego).is_err());
    assert_eq!(world.actor_count(), 2);

    let report = coordinator.step_once().unwrap();
    assert!(report.missing.is_empty());
    assert!(report.is_full());
}

#[test]
fn test_override_before_confirmation_is_rejected() {
    let world = SimWorld::shared(SimConfig::default()).unwrap();
    let clock = ClockController::new(world.clone(), &SyncConfig::default().clock).unwrap();
    let mut provisioner = FleetProvisioner::new(world.clone());
    let mut overrider = PolicyOverrider::new(world.clone());
    let point = world.spawn_points().unwrap()[0];

    let pending = provisioner
        .provision_batch(vec![ActorSpawnRequest::new("vehicle.audi.tt", point, ActorRole::Fleet)])
        .unwrap();
    let id = provisioner.registry().ids()[0];

    let err = overrider
        .override_actor(provisioner.registry(), BehaviorOverride::adversarial(id))
        .unwrap_err();
    assert!(matches!(err, SyncError::NotConfirmed(actor) if actor == id));
    assert!(world.traffic().overrides.is_empty());

    provisioner.confirm(pending, &clock).unwrap();
    overrider
        .override_actor(provisioner.registry(), BehaviorOverride::adversarial(id))
        .unwrap();
    assert_eq!(world.traffic().overrides[&id].ignore_signals_pct, 100.0);

    provisioner.teardown().unwrap();
    clock.restore().unwrap();
}

#[test]
fn test_interrupt_while_draining_cleans_up() {
    let (world, _sink, mut coordinator, config) = start(5);
    world.delivery().withhold(lidar_id(&coordinator));

    let tracked = coordinator.registry().ids();
    assert_eq!(tracked.len(), 6);
    assert_eq!(world.actor_count(), 6);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let delay = config.queue.timeout() / 2;
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(delay);
        trigger.cancel();
    });

    let summary = coordinator.run(&cancel, None, |_| {}).unwrap();
    interrupter.join().unwrap();

    // The step in flight was drained to completion before shutting down
    assert!(summary.cancelled);
    assert_eq!(summary.steps, 1);
    assert_eq!(summary.partial_steps, 1);

    assert!(coordinator.registry().is_empty());
    assert_eq!(world.actor_count(), 0);
    assert_eq!(world.sensor_count(), 0);
    for id in tracked {
        assert!(world.actor_transform(id).is_err());
    }
    assert_eq!(world.settings().unwrap(), WorldSettings::default());
    assert!(!world.traffic().synchronous);
}

#[test]
fn test_disconnect_mid_run_is_fatal_and_cleanup_is_attempted() {
    let (world, _sink, mut coordinator, _) = start(2);
    coordinator.step_once().unwrap();

    world.delivery().disconnect();
    let err = coordinator.run(&CancelToken::new(), Some(3), |_| {}).unwrap_err();

    assert!(matches!(err, SyncError::ClockAdvanceFailed(_)));
    assert!(err.is_fatal());
    // Destruction failed on the wire, but nothing is tracked anymore
    assert!(coordinator.registry().is_empty());

    // Terminated coordinators refuse new steps
    world.delivery().reconnect();
    assert!(coordinator.step_once().is_err());
}

#[test]
fn test_drop_runs_shutdown() {
    let (world, _sink, mut coordinator, _) = start(4);
    coordinator.step_once().unwrap();
    assert_eq!(world.actor_count(), 5);

    drop(coordinator);

    assert_eq!(world.actor_count(), 0);
    assert_eq!(world.settings().unwrap(), WorldSettings::default());
}

#[test]
fn test_spectator_follows_ego() {
    let (world, _sink, mut coordinator, _) = start(1);
    let ego = coordinator
        .registry()
        .with_role(ActorRole::Ego)
        .map(|h| h.actor_id)
        .next()
        .unwrap();

    coordinator.step_once().unwrap();

    let ego_at = world.actor_transform(ego).unwrap();
    let spectator = world.spectator();
    approx::assert_relative_eq!(spectator.location.x, ego_at.location.x, epsilon = 1e-9);
    approx::assert_relative_eq!(spectator.location.z, ego_at.location.z + 20.0, epsilon = 1e-9);
    assert_eq!(spectator.rotation.pitch, -90.0);
}
