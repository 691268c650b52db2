//! Sizes command: tree capacities and dispatch geometry for a point count.

use anyhow::{Context, Result};
use forcegraph_sim::WorkSizes;
use serde_json::json;

use crate::config::Config;

/// Warp size assumed when neither the flag nor the config names one.
const DEFAULT_WARP_SIZE: u32 = 32;

pub fn execute(config: &Config, points: u32, warp_size: Option<u32>, json: bool) -> Result<()> {
    let profile = &config.simulation.device;
    let warp_size = warp_size
        .or(profile.warp_size)
        .unwrap_or(DEFAULT_WARP_SIZE);
    let mut profile = profile.clone();
    profile.warp_size = Some(warp_size);

    let sizes = WorkSizes::derive(points, warp_size, &profile)
        .with_context(|| format!("Cannot size a tree for {} points", points))?;

    if json {
        let out = json!({
            "points": points,
            "warp_size": warp_size,
            "block_count": profile.block_count,
            "tree": sizes.tree,
            "stages": sizes.stages,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let tree = &sizes.tree;
    println!("Work sizes for {} points", points);
    println!("{:-<40}", "");
    println!("Warp Size:         {}", warp_size);
    println!("Block Count:       {}", profile.block_count);
    println!("Root Node:         {}", tree.num_nodes);
    println!("Node Slots:        {}", tree.node_slots());
    println!("Cell Capacity:     {}", tree.num_nodes - tree.num_bodies);
    println!("Reduction Groups:  {}", tree.num_work_groups);
    println!();
    println!("{:<18} {:>8} {:>6}", "Stage", "Global", "Local");
    for (stage, geometry) in [
        ("to_barnes_layout", sizes.stages.to_barnes_layout),
        ("bound_box", sizes.stages.bound_box),
        ("build_tree", sizes.stages.build_tree),
        ("compute_sums", sizes.stages.compute_sums),
        ("sort", sizes.stages.sort),
        ("calculate_forces", sizes.stages.calculate_forces),
        ("integrate", sizes.stages.integrate),
        ("query", sizes.stages.query),
    ] {
        println!("{:<18} {:>8} {:>6}", stage, geometry.global, geometry.local);
    }

    Ok(())
}
