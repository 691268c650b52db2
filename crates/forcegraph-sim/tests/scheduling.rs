//! Tick scheduling: stage order, serialization, failures and locks.
//!
//! Run with: `cargo test --package forcegraph-sim --test scheduling`

mod common;

use common::{random_pairs, uniform_points, Event, RecordingDevice, TICK_KERNELS};
use forcegraph_sim::{
    EdgeSet, KernelId, Locks, SharedSimulator, SimConfig, SimError, Simulator, TickOptions,
};

fn simulator(device: RecordingDevice) -> Simulator<RecordingDevice> {
    let mut sim = Simulator::new(device, SimConfig::default()).unwrap();
    sim.set_points(&uniform_points(64, 500.0, 21)).unwrap();
    sim.set_edges(&EdgeSet::from_pairs(64, &random_pairs(64, 96, 22)).unwrap())
        .unwrap();
    sim.device().clear();
    sim
}

/// Split the log at each flush and check every tick ran the full stage order.
fn assert_whole_ticks(events: &[Event], ticks: usize) {
    let chunks: Vec<_> = events.split(|e| *e == Event::Finish).collect();
    // Trailing empty chunk after the last flush.
    assert_eq!(chunks.len(), ticks + 1, "{events:?}");
    let expected: Vec<_> = TICK_KERNELS.iter().map(|k| Event::Dispatch(*k)).collect();
    for chunk in &chunks[..ticks] {
        assert_eq!(chunk, &expected.as_slice());
    }
    assert!(chunks[ticks].is_empty());
}

#[tokio::test]
async fn test_stages_run_in_order() {
    let mut sim = simulator(RecordingDevice::new());
    sim.tick(0, TickOptions::default()).await.unwrap();
    sim.tick(1, TickOptions::default()).await.unwrap();
    assert_whole_ticks(&sim.device().events(), 2);
}

#[tokio::test]
async fn test_concurrent_ticks_are_serialized() {
    let device = RecordingDevice::new().yielding();
    let log = device.log();
    let shared = SharedSimulator::new(simulator(device));

    let (a, b, c) = futures::join!(
        shared.tick(0, TickOptions::default()),
        shared.tick(1, TickOptions::default()),
        shared.tick(2, TickOptions::default()),
    );
    let mut ticks = vec![a.unwrap().tick, b.unwrap().tick, c.unwrap().tick];
    ticks.sort();
    ticks.dedup();

    assert_eq!(ticks.len(), 3, "every tick got its own version");
    assert_whole_ticks(&log.borrow(), 3);
}

#[tokio::test]
async fn test_try_tick_rejects_while_in_flight() {
    let device = RecordingDevice::new().yielding();
    let log = device.log();
    let shared = SharedSimulator::new(simulator(device));

    let second = shared.clone();
    let (first, rejected) = futures::join!(shared.tick(0, TickOptions::default()), async move {
        // Let the first tick take the simulator and suspend on its first stage.
        tokio::task::yield_now().await;
        second.try_tick(1, TickOptions::default()).await
    });

    first.unwrap();
    assert!(matches!(rejected, Err(SimError::TickInFlight)), "{rejected:?}");
    assert_whole_ticks(&log.borrow(), 1);

    // Free again once the first tick is done.
    shared.try_tick(2, TickOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_failed_stage_aborts_tick() {
    let mut sim = simulator(RecordingDevice::new());
    sim.tick(0, TickOptions::default()).await.unwrap();
    sim.device().clear();
    let versions = sim.versions().clone();

    sim.device_mut().set_fail_at(Some(KernelId::BuildTree));
    let result = sim.tick(1, TickOptions::default()).await;

    match result {
        Err(SimError::KernelExecution { kernel, .. }) => assert_eq!(kernel, KernelId::BuildTree),
        other => panic!("expected a kernel failure, got {other:?}"),
    }
    assert_eq!(sim.versions(), &versions);
    assert_eq!(
        sim.device().events(),
        vec![
            Event::Dispatch(KernelId::ToBarnesLayout),
            Event::Dispatch(KernelId::BoundBox),
            Event::Dispatch(KernelId::BuildTree),
        ]
    );

    // Scratch state is rebuilt by the next tick.
    sim.device_mut().set_fail_at(None);
    sim.device().clear();
    let state = sim.tick(2, TickOptions::default()).await.unwrap();
    assert!(state.tick > versions.tick);
    assert_whole_ticks(&sim.device().events(), 1);
}

#[tokio::test]
async fn test_failed_integration_keeps_positions_version() {
    let mut sim = simulator(RecordingDevice::new());
    let positions = sim.versions().get(forcegraph_sim::BufferName::Positions);

    sim.device_mut().set_fail_at(Some(KernelId::Integrate));
    assert!(sim.tick(0, TickOptions::default()).await.is_err());
    assert_eq!(sim.versions().get(forcegraph_sim::BufferName::Positions), positions);
}

#[tokio::test]
async fn test_locked_points_dispatch_nothing() {
    let mut sim = simulator(RecordingDevice::new());
    let positions = sim.read_positions().await.unwrap();
    let versions = sim.versions().clone();

    sim.set_locks(Locks { lock_points: true });
    for step in 0..3 {
        sim.tick(step, TickOptions::default()).await.unwrap();
    }

    assert_eq!(sim.versions(), &versions);
    assert_eq!(sim.read_positions().await.unwrap(), positions);
    // Only the queue flush of each tick reaches the device.
    assert!(sim
        .device()
        .events()
        .iter()
        .all(|e| *e == Event::Finish));

    sim.set_locks(Locks::default());
    sim.device().clear();
    sim.tick(3, TickOptions::default()).await.unwrap();
    assert_ne!(sim.read_positions().await.unwrap(), positions);
    assert_whole_ticks(&sim.device().events(), 1);
}

#[tokio::test]
async fn test_tick_before_points_is_a_no_op() {
    let mut sim = Simulator::new(RecordingDevice::new(), SimConfig::default()).unwrap();
    let state = sim.tick(0, TickOptions::default()).await.unwrap();
    assert_eq!(state.point_count, 0);
    assert_eq!(state.tick, 0);
    assert!(sim.device().events().is_empty());
}
