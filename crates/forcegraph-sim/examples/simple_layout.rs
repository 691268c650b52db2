//! Small ForceAtlas2 layout on the host reference device.
//!
//! Run with: cargo run --example simple_layout

use std::time::Instant;

use forcegraph_sim::{CpuDevice, EdgeSet, SimConfig, Simulator, TickOptions};

fn main() {
    tracing_subscriber::fmt::init();

    let node_count: u32 = 1000;
    let edge_count: u32 = 2000;

    println!("Creating graph with {} nodes and {} edges...", node_count, edge_count);

    // Spiral with some jitter
    let mut points = Vec::with_capacity(node_count as usize * 2);
    for i in 0..node_count {
        let t = i as f32;
        let angle = t * 0.1;
        let radius = 100.0 + t * 0.5;
        points.push(radius * angle.cos() + (t * 13.37).sin() * 50.0);
        points.push(radius * angle.sin() + (t * 7.13).cos() * 50.0);
    }

    // A path keeps the graph connected, the rest are spread chords
    let mut pairs = Vec::with_capacity(edge_count as usize);
    for i in 1..node_count {
        pairs.push((i - 1, i));
    }
    for i in 0..(edge_count - node_count + 1) {
        let source = (i * 17) % node_count;
        let target = (i * 31 + 7) % node_count;
        if source != target {
            pairs.push((source, target));
        }
    }

    let mut sim =
        Simulator::new(CpuDevice::new(), SimConfig::default()).expect("invalid configuration");
    sim.set_points(&points).expect("points rejected");
    let edges = EdgeSet::from_pairs(node_count, &pairs).expect("edges rejected");
    sim.set_edges(&edges).expect("edges rejected");

    println!("Running layout simulation...");

    let iterations = 100;
    let start = Instant::now();

    for i in 0..iterations {
        pollster::block_on(sim.tick(i, TickOptions::default())).expect("tick failed");

        if i % 10 == 0 {
            let positions = pollster::block_on(sim.read_positions()).expect("readback failed");
            let (min_x, max_x, min_y, max_y) = positions.iter().fold(
                (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
                |(min_x, max_x, min_y, max_y), p| {
                    (min_x.min(p.x), max_x.max(p.x), min_y.min(p.y), max_y.max(p.y))
                },
            );
            println!(
                "Tick {}: bounds = ({:.1}, {:.1}) to ({:.1}, {:.1})",
                i, min_x, min_y, max_x, max_y
            );
        }
    }

    let elapsed = start.elapsed();
    let rate = iterations as f64 / elapsed.as_secs_f64();
    println!("\nCompleted {} ticks in {:.2?} ({:.1} ticks/sec)", iterations, elapsed, rate);

    let positions = pollster::block_on(sim.read_positions()).expect("readback failed");
    println!("\nFinal positions (first 5 nodes):");
    for (i, pos) in positions.iter().take(5).enumerate() {
        println!("  Node {}: ({:.2}, {:.2})", i, pos.x, pos.y);
    }
}
