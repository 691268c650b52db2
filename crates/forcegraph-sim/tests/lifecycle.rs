//! Dataset lifecycle: input validation, allocation, reallocation and versions.
//!
//! Run with: `cargo test --package forcegraph-sim --test lifecycle`

mod common;

use common::{random_pairs, uniform_points, RecordingDevice};
use forcegraph_sim::{
    compute_sizes, BufferName, ComputeDevice, CpuDevice, EdgeSet, SimConfig, SimError, Simulator,
    TickOptions, Versions,
};

fn simulator() -> Simulator<RecordingDevice> {
    Simulator::new(RecordingDevice::new(), SimConfig::default()).unwrap()
}

fn assert_no_leaks<D: ComputeDevice>(sim: &Simulator<D>) {
    assert_eq!(sim.device().live_buffers(), sim.registry().handles());
}

fn assert_monotonic(before: &Versions, after: &Versions) {
    assert!(after.tick >= before.tick);
    for (name, version) in &before.buffers {
        let now = after.get(*name).unwrap_or(0);
        assert!(now >= *version, "{name} went from {version} to {now}");
    }
}

// =============================================================================
// Input validation
// =============================================================================

#[test]
fn test_empty_points_allocate_nothing() {
    let mut sim = simulator();
    assert!(matches!(sim.set_points(&[]), Err(SimError::InvalidInput(_))));
    assert!(matches!(sim.set_points(&[1.0, 2.0, 3.0]), Err(SimError::InvalidInput(_))));
    assert!(matches!(sim.set_points(&[1.0, f32::NAN]), Err(SimError::InvalidInput(_))));
    assert!(sim.device().live_buffers().is_empty());
    assert_eq!(sim.point_count(), 0);
}

#[test]
fn test_empty_edges_rejected() {
    assert!(matches!(EdgeSet::from_pairs(3, &[]), Err(SimError::InvalidInput(_))));

    let mut sim = simulator();
    sim.set_points(&uniform_points(3, 10.0, 1)).unwrap();
    let live = sim.device().live_buffers();
    let versions = sim.versions().clone();

    let mut edges = EdgeSet::from_pairs(3, &[(0, 1)]).unwrap();
    edges.forward.edges.clear();
    edges.forward.weights.clear();
    assert!(matches!(sim.set_edges(&edges), Err(SimError::InvalidInput(_))));

    let mut edges = EdgeSet::from_pairs(3, &[(0, 1)]).unwrap();
    edges.backward.work_items.pop();
    assert!(matches!(sim.set_edges(&edges), Err(SimError::InvalidInput(_))));

    assert_eq!(sim.device().live_buffers(), live);
    assert_eq!(sim.versions(), &versions);
}

#[test]
fn test_edges_before_points() {
    let mut sim = simulator();
    let edges = EdgeSet::from_pairs(2, &[(0, 1)]).unwrap();
    assert!(sim.set_edges(&edges).is_err());
    assert!(sim.device().live_buffers().is_empty());
}

// =============================================================================
// Allocation
// =============================================================================

#[test]
fn test_set_points_installs_tree_for_count() {
    let mut sim = simulator();
    let state = sim.set_points(&uniform_points(100, 1000.0, 7)).unwrap();

    assert_eq!(state.point_count, 100);
    assert_eq!(state.edge_count, 0);
    assert_eq!(state.tree, Some(compute_sizes(100, 32).unwrap()));
    for name in BufferName::POINT.iter().chain(BufferName::EDGE).chain(BufferName::TREE) {
        assert!(sim.registry().contains(*name), "{name} missing");
    }
    assert_no_leaks(&sim);
}

#[test]
fn test_allocation_failure_keeps_previous_dataset() {
    let mut reference = Simulator::new(CpuDevice::new(), SimConfig::default()).unwrap();
    reference.set_points(&uniform_points(10, 100.0, 3)).unwrap();
    let limit = reference.device().allocated_bytes() * 2;

    let device = RecordingDevice::wrap(CpuDevice::new().with_memory_limit(limit));
    let mut sim = Simulator::new(device, SimConfig::default()).unwrap();
    sim.set_points(&uniform_points(10, 100.0, 3)).unwrap();
    let versions = sim.versions().clone();
    let live = sim.device().live_buffers();

    let result = sim.set_points(&uniform_points(5000, 100.0, 4));
    assert!(matches!(result, Err(SimError::Allocation { .. })), "{result:?}");

    assert_eq!(sim.point_count(), 10);
    assert_eq!(sim.versions(), &versions);
    assert_eq!(sim.device().live_buffers(), live);
    assert_no_leaks(&sim);

    // The old dataset still runs.
    pollster::block_on(sim.tick(0, TickOptions::default())).unwrap();
}

#[test]
fn test_reallocation_releases_everything() {
    let mut sim = simulator();
    sim.set_points(&uniform_points(500, 1000.0, 11)).unwrap();
    let edges = EdgeSet::from_pairs(500, &random_pairs(500, 800, 12)).unwrap();
    sim.set_edges(&edges).unwrap();
    pollster::block_on(sim.tick(0, TickOptions::default())).unwrap();

    let large: Vec<_> = sim.device().live_buffers();
    let state = sim.set_points(&uniform_points(50, 1000.0, 13)).unwrap();

    assert_eq!(state.tree, Some(compute_sizes(50, 32).unwrap()));
    assert_eq!(state.edge_count, 0);
    let live = sim.device().live_buffers();
    assert!(large.iter().all(|handle| !live.contains(handle)));
    assert_no_leaks(&sim);

    // Same footprint as a fresh 50-point simulator.
    let mut fresh = Simulator::new(CpuDevice::new(), SimConfig::default()).unwrap();
    fresh.set_points(&uniform_points(50, 1000.0, 13)).unwrap();
    assert_eq!(live.len(), fresh.device().live_buffers().len());
    for descriptor in fresh.registry().descriptors() {
        let ours = sim.registry().get(descriptor.name).unwrap();
        assert_eq!(ours.byte_len, descriptor.byte_len, "{}", descriptor.name);
    }
}

#[test]
fn test_point_count_change_resets_edges() {
    let mut sim = simulator();
    sim.set_points(&uniform_points(4, 10.0, 1)).unwrap();
    sim.set_edges(&EdgeSet::from_pairs(4, &[(0, 1), (2, 3)]).unwrap()).unwrap();
    assert_eq!(sim.state().edge_count, 2);

    sim.set_points(&uniform_points(4, 10.0, 2)).unwrap();
    assert_eq!(sim.state().edge_count, 0);
    // One placeholder pair, no work.
    assert_eq!(sim.registry().get(BufferName::ForwardEdges).unwrap().len, 2);
    assert_eq!(sim.registry().get(BufferName::PointDegrees).unwrap().len, 4);
}

// =============================================================================
// Versions
// =============================================================================

#[tokio::test]
async fn test_versions_never_decrease() {
    let mut sim = simulator();
    let mut seen = vec![sim.versions().clone()];
    let mut record = |sim: &Simulator<RecordingDevice>| {
        let now = sim.versions().clone();
        assert_monotonic(seen.last().unwrap(), &now);
        seen.push(now);
    };

    sim.set_points(&uniform_points(20, 100.0, 5)).unwrap();
    record(&sim);
    sim.set_edges(&EdgeSet::from_pairs(20, &random_pairs(20, 30, 6)).unwrap()).unwrap();
    record(&sim);
    for step in 0..3 {
        sim.tick(step, TickOptions::default()).await.unwrap();
        record(&sim);
    }
    sim.set_sizes(&[2.0; 20]).unwrap();
    record(&sim);
    sim.tick_buffers(&[BufferName::PointColors], Some(1));
    record(&sim);
    sim.move_nodes(&[0, 1], [5.0, 5.0]).await.unwrap();
    record(&sim);
    sim.select_nodes_in_circle([50.0, 50.0], 30.0).await.unwrap();
    record(&sim);
    sim.set_points(&uniform_points(8, 100.0, 9)).unwrap();
    record(&sim);
}

#[tokio::test]
async fn test_tick_without_layout_changes_nothing() {
    let mut sim = simulator();
    sim.set_points(&uniform_points(30, 100.0, 5)).unwrap();
    sim.device().clear();
    let versions = sim.versions().clone();
    let positions = sim.read_positions().await.unwrap();

    let options = TickOptions {
        play: true,
        layout: false,
    };
    let state = sim.tick(1, options).await.unwrap();

    assert_eq!(state.versions, versions);
    assert_eq!(sim.read_positions().await.unwrap(), positions);
    assert!(sim.device().events().is_empty());
}

#[tokio::test]
async fn test_tick_bumps_positions_only() {
    let mut sim = simulator();
    sim.set_points(&uniform_points(30, 100.0, 5)).unwrap();
    let before = sim.versions().clone();

    let state = sim.tick(1, TickOptions::default()).await.unwrap();

    assert!(state.tick > before.tick);
    assert_eq!(state.versions.get(BufferName::Positions), Some(state.tick));
    for (name, version) in &before.buffers {
        if *name != BufferName::Positions {
            assert_eq!(state.versions.get(*name), Some(*version), "{name}");
        }
    }
}

#[test]
fn test_manual_bump_is_monotonic() {
    let mut sim = simulator();
    sim.set_points(&uniform_points(4, 10.0, 1)).unwrap();
    let fresh = sim.tick_buffers(&[BufferName::PointColors], None);
    assert_eq!(sim.versions().get(BufferName::PointColors), Some(fresh));

    sim.tick_buffers(&[BufferName::PointColors], Some(fresh + 10));
    assert_eq!(sim.versions().get(BufferName::PointColors), Some(fresh + 10));
    assert_eq!(sim.versions().tick, fresh + 10);

    sim.tick_buffers(&[BufferName::PointColors], Some(1));
    assert_eq!(sim.versions().get(BufferName::PointColors), Some(fresh + 10));
}

#[tokio::test]
async fn test_reset_buffers_invalidates_bound_handles() {
    let mut sim = simulator();
    sim.set_points(&uniform_points(10, 100.0, 2)).unwrap();
    let before = sim.versions().get(BufferName::Swings).unwrap();

    let tick = sim.reset_buffers(&[BufferName::Swings]).unwrap();
    assert!(tick > before);
    assert_eq!(sim.versions().get(BufferName::Swings), Some(tick));
    assert!(!sim.registry().contains(BufferName::Swings));
    assert_no_leaks(&sim);

    let positions = sim.versions().get(BufferName::Positions);
    let result = sim.tick(1, TickOptions::default()).await;
    assert!(matches!(result, Err(SimError::KernelExecution { .. })), "{result:?}");
    assert_eq!(sim.versions().get(BufferName::Positions), positions);

    // Reallocation binds fresh handles again.
    sim.set_points(&uniform_points(10, 100.0, 2)).unwrap();
    sim.tick(2, TickOptions::default()).await.unwrap();
}
