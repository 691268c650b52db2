//! Run command: lay out a graph for a number of ticks.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use forcegraph_sim::{
    ComputeDevice, CpuDevice, EdgeSet, Position, Simulator, SimulatorState, TickOptions, WgpuDevice,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Backend, Config};

/// Graph input file.
#[derive(Debug, Deserialize)]
pub struct GraphFile {
    pub points: Vec<[f32; 2]>,
    #[serde(default)]
    pub edges: Vec<[u32; 2]>,
    /// One weight per edge; unit weights when absent.
    #[serde(default)]
    pub weights: Option<Vec<f32>>,
}

/// Where the graph comes from.
#[derive(Debug, Clone)]
pub enum GraphSource {
    File(PathBuf),
    Random { points: u32, edges: u32, seed: u64 },
}

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub source: GraphSource,
    pub ticks: u32,
    pub backend: Backend,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    device: String,
    ticks: u32,
    elapsed_ms: f64,
    state: SimulatorState,
    positions: Vec<[f32; 2]>,
}

pub async fn execute(config: &Config, args: RunArgs) -> Result<()> {
    let (points, edges) = match &args.source {
        GraphSource::File(path) => load_graph(path)?,
        GraphSource::Random {
            points,
            edges,
            seed,
        } => random_graph(*points, *edges, *seed)?,
    };

    let report = match args.backend {
        Backend::Cpu => simulate(CpuDevice::new(), config, &points, edges.as_ref(), args.ticks).await?,
        Backend::Gpu => {
            let device = WgpuDevice::request()
                .await
                .context("GPU backend requested but no device could be created")?;
            simulate(device, config, &points, edges.as_ref(), args.ticks).await?
        }
        Backend::Auto => match WgpuDevice::request().await {
            Ok(device) => simulate(device, config, &points, edges.as_ref(), args.ticks).await?,
            Err(e) => {
                warn!(error = %e, "GPU unavailable, falling back to the host device");
                simulate(CpuDevice::new(), config, &points, edges.as_ref(), args.ticks).await?
            }
        },
    };

    print_summary(&report);

    if let Some(output) = &args.output {
        let contents = serde_json::to_string_pretty(&report)?;
        std::fs::write(output, contents)
            .with_context(|| format!("Failed to write result to {}", output.display()))?;
        println!("\nResult written to {}", output.display());
    }

    Ok(())
}

async fn simulate<D: ComputeDevice>(
    device: D,
    config: &Config,
    points: &[f32],
    edges: Option<&EdgeSet>,
    ticks: u32,
) -> Result<RunReport> {
    let device_name = device.properties().name.clone();
    info!(device = %device_name, points = points.len() / 2, "starting layout");

    let mut sim =
        Simulator::new(device, config.simulation.clone()).context("Invalid simulation config")?;
    sim.set_points(points).context("Points rejected")?;
    if let Some(edges) = edges {
        sim.set_edges(edges).context("Edges rejected")?;
    }

    let start = Instant::now();
    let mut state = sim.state();
    for step in 0..ticks {
        state = sim
            .tick(step, TickOptions::default())
            .await
            .with_context(|| format!("Tick {} failed", step))?;
    }
    let elapsed = start.elapsed();

    let positions = sim
        .read_positions()
        .await
        .context("Failed to read positions back")?;

    Ok(RunReport {
        device: device_name,
        ticks,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        state,
        positions: positions.iter().map(|p| [p.x, p.y]).collect(),
    })
}

fn print_summary(report: &RunReport) {
    let positions: Vec<Position> = report
        .positions
        .iter()
        .map(|p| Position::new(p[0], p[1]))
        .collect();
    let (min_x, max_x, min_y, max_y) = positions.iter().fold(
        (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
        |(min_x, max_x, min_y, max_y), p| {
            (min_x.min(p.x), max_x.max(p.x), min_y.min(p.y), max_y.max(p.y))
        },
    );

    println!("Layout complete");
    println!("{:-<40}", "");
    println!("Device:        {}", report.device);
    println!("Points:        {}", report.state.point_count);
    println!("Edges:         {}", report.state.edge_count);
    println!("Ticks:         {}", report.ticks);
    println!("Version tick:  {}", report.state.tick);
    println!("Elapsed:       {:.2}ms", report.elapsed_ms);
    if report.ticks > 0 {
        println!("ms/tick:       {:.2}ms", report.elapsed_ms / f64::from(report.ticks));
    }
    println!(
        "Bounds:        ({:.1}, {:.1}) to ({:.1}, {:.1})",
        min_x, min_y, max_x, max_y
    );
}

/// Read a graph file into packed points and an optional edge set.
pub fn load_graph(path: &Path) -> Result<(Vec<f32>, Option<EdgeSet>)> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read graph from {}", path.display()))?;
    let graph: GraphFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse graph file {}", path.display()))?;

    let points: Vec<f32> = graph.points.iter().flatten().copied().collect();
    let point_count = u32::try_from(graph.points.len()).context("Too many points")?;
    if graph.edges.is_empty() {
        return Ok((points, None));
    }

    let edges = match graph.weights {
        Some(weights) => {
            if weights.len() != graph.edges.len() {
                anyhow::bail!(
                    "{} weights given for {} edges",
                    weights.len(),
                    graph.edges.len()
                );
            }
            let pairs: Vec<_> = graph
                .edges
                .iter()
                .zip(weights)
                .map(|(e, w)| (e[0], e[1], w))
                .collect();
            EdgeSet::from_weighted_pairs(point_count, &pairs)
        }
        None => {
            let pairs: Vec<_> = graph.edges.iter().map(|e| (e[0], e[1])).collect();
            EdgeSet::from_pairs(point_count, &pairs)
        }
    }
    .context("Invalid edge list")?;

    Ok((points, Some(edges)))
}

/// Points uniform in a square sized to the point count, plus a spanning
/// path and random chords.
pub fn random_graph(points: u32, edges: u32, seed: u64) -> Result<(Vec<f32>, Option<EdgeSet>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let extent = (points as f32).sqrt() * 100.0;
    let coords: Vec<f32> = (0..points as usize * 2)
        .map(|_| rng.random_range(0.0..extent.max(1.0)))
        .collect();

    if edges == 0 || points < 2 {
        return Ok((coords, None));
    }

    let mut pairs = Vec::with_capacity(edges as usize);
    for i in 1..points.min(edges + 1) {
        pairs.push((i - 1, i));
    }
    while pairs.len() < edges as usize {
        let source = rng.random_range(0..points);
        let target = rng.random_range(0..points);
        if source != target {
            pairs.push((source, target));
        }
    }

    let edge_set = EdgeSet::from_pairs(points, &pairs).context("Invalid random edge list")?;
    Ok((coords, Some(edge_set)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_graph_shape() {
        let (points, edges) = random_graph(10, 15, 1).unwrap();
        assert_eq!(points.len(), 20);
        let edges = edges.unwrap();
        assert_eq!(edges.edge_count(), 15);
        assert_eq!(edges.degrees.iter().sum::<u32>(), 30);
    }

    #[test]
    fn test_random_graph_is_seeded() {
        let (a, _) = random_graph(5, 0, 9).unwrap();
        let (b, _) = random_graph(5, 0, 9).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_graph_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{"points": [[0, 0], [1, 0], [0, 1]], "edges": [[0, 1], [1, 2]], "weights": [1.0, 2.0]}"#,
        )
        .unwrap();

        let (points, edges) = load_graph(&path).unwrap();
        assert_eq!(points, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        assert_eq!(edges.unwrap().forward.weights, vec![1.0, 2.0]);
    }

    #[test]
    fn test_load_graph_rejects_mismatched_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, r#"{"points": [[0, 0], [1, 0]], "edges": [[0, 1]], "weights": []}"#).unwrap();
        assert!(load_graph(&path).is_err());
    }
}
