//! Large graph benchmark (9000 nodes) on the GPU, falling back to the host.
//!
//! Run with: cargo run --example large_graph --release

use std::time::Instant;

use forcegraph_sim::{ComputeDevice, CpuDevice, EdgeSet, SimConfig, Simulator, TickOptions, WgpuDevice};

fn main() {
    tracing_subscriber::fmt::init();

    let node_count: u32 = 9000;
    let edge_count: u32 = 9000;

    println!("=== Barnes-Hut ForceAtlas2 Benchmark ===");
    println!("Graph: {} nodes, {} edges", node_count, edge_count);
    println!();

    let mut points = Vec::with_capacity(node_count as usize * 2);
    for i in 0..node_count {
        let t = i as f32;
        let angle = t * 0.1;
        let radius = 200.0 + t * 0.3;
        points.push(radius * angle.cos() + (t * 13.37).sin() * 100.0);
        points.push(radius * angle.sin() + (t * 7.13).cos() * 100.0);
    }

    let mut pairs = Vec::with_capacity(edge_count as usize);
    for i in 1..node_count {
        pairs.push((i - 1, i));
    }
    for i in 0..(edge_count - (node_count - 1)) {
        let source = (i * 17) % node_count;
        let target = (i * 31 + 7) % node_count;
        if source != target {
            pairs.push((source, target));
        }
    }
    let edges = EdgeSet::from_pairs(node_count, &pairs).expect("edges rejected");

    match pollster::block_on(WgpuDevice::request()) {
        Ok(device) => bench(device, &points, &edges),
        Err(e) => {
            println!("GPU unavailable ({}), using host device", e);
            bench(CpuDevice::new(), &points, &edges);
        }
    }
}

fn bench<D: ComputeDevice>(device: D, points: &[f32], edges: &EdgeSet) {
    println!("Device: {}", device.properties().name);

    let mut sim = Simulator::new(device, SimConfig::default()).expect("invalid configuration");
    sim.set_points(points).expect("points rejected");
    sim.set_edges(edges).expect("edges rejected");

    if let Some(tree) = sim.state().tree {
        println!("Tree: {} nodes, {} reduction groups", tree.num_nodes, tree.num_work_groups);
    }

    // Warm up
    for step in 0..5 {
        pollster::block_on(sim.tick(step, TickOptions::default())).expect("tick failed");
    }

    println!("Running 100 ticks...");
    println!();

    let iterations = 100;
    let start = Instant::now();

    for i in 0..iterations {
        pollster::block_on(sim.tick(5 + i, TickOptions::default())).expect("tick failed");

        if i == 0 || i == 49 || i == 99 {
            let positions = pollster::block_on(sim.read_positions()).expect("readback failed");
            let (min_x, max_x, min_y, max_y) = positions.iter().fold(
                (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
                |(min_x, max_x, min_y, max_y), p| {
                    (min_x.min(p.x), max_x.max(p.x), min_y.min(p.y), max_y.max(p.y))
                },
            );
            println!("  Tick {:3}: layout size {:.0} x {:.0}", i, max_x - min_x, max_y - min_y);
        }
    }

    let elapsed = start.elapsed();
    let rate = iterations as f64 / elapsed.as_secs_f64();

    println!();
    println!("=== Results ===");
    println!("  Total time:  {:.2?}", elapsed);
    println!("  Ticks/s:     {:.1}", rate);
    println!("  ms/tick:     {:.2}ms", 1000.0 / rate);
}
