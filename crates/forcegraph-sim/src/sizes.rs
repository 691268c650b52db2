//! Tree capacity and per-stage dispatch geometry.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DeviceProfile;
use crate::error::SimError;
use crate::Result;

/// Block count used when the device profile does not name one.
pub const DEFAULT_BLOCK_COUNT: u32 = 8;

/// Work groups of the bounding-box reduction.
pub const BOUND_BOX_WORK_GROUPS: u32 = 30;

/// Threads per work group expected by the WGSL kernels.
pub const WORKGROUP_SIZE: u32 = 256;

/// Capacities of the Barnes-Hut tree for one point count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeSizes {
    /// Index of the root cell; also the highest valid node index.
    pub num_nodes: u32,
    pub num_bodies: u32,
    pub num_work_groups: u32,
}

impl TreeSizes {
    /// Number of node slots (bodies and cells) in per-node buffers.
    pub fn node_slots(&self) -> usize {
        self.num_nodes as usize + 1
    }
}

/// Derive tree capacities from the point count and the device warp size.
pub fn compute_sizes(point_count: u32, warp_size: u32) -> Result<TreeSizes> {
    compute_sizes_with_blocks(point_count, warp_size, DEFAULT_BLOCK_COUNT)
}

/// [`compute_sizes`] with an explicit block count.
pub fn compute_sizes_with_blocks(
    point_count: u32,
    warp_size: u32,
    block_count: u32,
) -> Result<TreeSizes> {
    if point_count == 0 {
        return Err(SimError::invalid("point count must be positive"));
    }
    if warp_size == 0 {
        return Err(SimError::invalid("warp size must be positive"));
    }
    if block_count == 0 {
        return Err(SimError::invalid("block count must be positive"));
    }

    let mut num_nodes = u64::from(point_count) * 5;
    num_nodes = num_nodes.max(1024 * u64::from(block_count));
    num_nodes = num_nodes.next_multiple_of(u64::from(warp_size));
    num_nodes -= 1;

    // Children are stored as signed 32-bit node indices.
    if num_nodes > i32::MAX as u64 / 4 {
        return Err(SimError::invalid(format!(
            "{point_count} points exceed the tree capacity"
        )));
    }

    Ok(TreeSizes {
        num_nodes: num_nodes as u32,
        num_bodies: point_count,
        num_work_groups: BOUND_BOX_WORK_GROUPS,
    })
}

/// A `(global, local)` dispatch size pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchGeometry {
    pub global: u32,
    pub local: u32,
}

impl DispatchGeometry {
    pub fn new(global: u32, local: u32) -> Result<Self> {
        let geometry = Self { global, local };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Geometry of `groups` work groups of [`WORKGROUP_SIZE`] threads.
    pub const fn groups(groups: u32) -> Self {
        Self {
            global: groups * WORKGROUP_SIZE,
            local: WORKGROUP_SIZE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.local == 0 || self.global == 0 {
            return Err(SimError::invalid(format!(
                "dispatch geometry {}/{} must be non-zero",
                self.global, self.local
            )));
        }
        if self.global % self.local != 0 {
            return Err(SimError::invalid(format!(
                "global size {} is not a multiple of local size {}",
                self.global, self.local
            )));
        }
        Ok(())
    }

    pub fn work_groups(&self) -> u32 {
        self.global / self.local
    }
}

/// Dispatch geometry of every stage, as probed from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageGeometry {
    pub to_barnes_layout: DispatchGeometry,
    pub bound_box: DispatchGeometry,
    pub build_tree: DispatchGeometry,
    pub compute_sums: DispatchGeometry,
    pub sort: DispatchGeometry,
    pub calculate_forces: DispatchGeometry,
    pub integrate: DispatchGeometry,
    pub query: DispatchGeometry,
}

impl Default for StageGeometry {
    fn default() -> Self {
        Self {
            to_barnes_layout: DispatchGeometry::groups(30),
            bound_box: DispatchGeometry::groups(BOUND_BOX_WORK_GROUPS),
            build_tree: DispatchGeometry::groups(30),
            compute_sums: DispatchGeometry::groups(10),
            sort: DispatchGeometry::groups(16),
            calculate_forces: DispatchGeometry::groups(60),
            integrate: DispatchGeometry::groups(30),
            query: DispatchGeometry::groups(16),
        }
    }
}

impl StageGeometry {
    fn entries(&self) -> [(&'static str, DispatchGeometry); 8] {
        [
            ("to_barnes_layout", self.to_barnes_layout),
            ("bound_box", self.bound_box),
            ("build_tree", self.build_tree),
            ("compute_sums", self.compute_sums),
            ("sort", self.sort),
            ("calculate_forces", self.calculate_forces),
            ("integrate", self.integrate),
            ("query", self.query),
        ]
    }

    /// Check every pair and that the bounding-box reduction fits its scratch.
    pub fn validate(&self, sizes: &TreeSizes) -> Result<()> {
        for (stage, geometry) in self.entries() {
            geometry
                .validate()
                .map_err(|e| SimError::invalid(format!("{stage}: {e}")))?;
        }
        if self.bound_box.work_groups() > sizes.num_work_groups {
            return Err(SimError::invalid(format!(
                "bound_box uses {} work groups, at most {} are reduced",
                self.bound_box.work_groups(),
                sizes.num_work_groups
            )));
        }
        Ok(())
    }
}

/// Tree capacities plus validated stage geometry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkSizes {
    pub tree: TreeSizes,
    pub stages: StageGeometry,
}

impl WorkSizes {
    /// Derive work sizes for `point_count` points on a device with `warp_size`.
    pub fn derive(point_count: u32, warp_size: u32, profile: &DeviceProfile) -> Result<Self> {
        let warp_size = profile.warp_size.unwrap_or(warp_size);
        let tree = compute_sizes_with_blocks(point_count, warp_size, profile.block_count)?;
        profile.stages.validate(&tree)?;
        info!(
            point_count,
            warp_size,
            num_nodes = tree.num_nodes,
            num_work_groups = tree.num_work_groups,
            "derived work sizes"
        );
        Ok(Self {
            tree,
            stages: profile.stages.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_counts_use_block_floor() {
        let sizes = compute_sizes(10, 32).unwrap();
        assert_eq!(sizes.num_nodes, 8191);
        assert_eq!(sizes.num_bodies, 10);
        assert_eq!(sizes.num_work_groups, 30);
    }

    #[test]
    fn test_large_counts_round_to_warp() {
        // 5 * 5000 = 25000 -> 25024 is the next multiple of 64.
        let sizes = compute_sizes(5000, 64).unwrap();
        assert_eq!(sizes.num_nodes, 25023);
    }

    #[test]
    fn test_zero_points_rejected() {
        assert!(matches!(compute_sizes(0, 32), Err(SimError::InvalidInput(_))));
        assert!(matches!(compute_sizes(4, 0), Err(SimError::InvalidInput(_))));
    }

    #[test]
    fn test_sizes_property() {
        for warp in [1u32, 16, 32, 48, 64] {
            for blocks in [1u32, 8, 13] {
                for n in (1u32..20_000).step_by(97) {
                    let sizes = compute_sizes_with_blocks(n, warp, blocks).unwrap();
                    assert_eq!(sizes.num_nodes % warp, warp - 1, "n={n} warp={warp}");
                    let floor = (n * 5).max(1024 * blocks);
                    assert!(sizes.num_nodes + 1 >= floor);
                    assert!(sizes.num_nodes + 1 < floor + warp);
                    assert!(sizes.num_nodes >= sizes.num_bodies);
                }
            }
        }
    }

    #[test]
    fn test_geometry_must_divide() {
        assert!(DispatchGeometry::new(512, 256).is_ok());
        assert!(DispatchGeometry::new(500, 256).is_err());
        assert!(DispatchGeometry::new(0, 256).is_err());
        assert!(DispatchGeometry::new(256, 0).is_err());
    }

    #[test]
    fn test_bound_box_groups_capped() {
        let sizes = compute_sizes(100, 32).unwrap();
        let mut stages = StageGeometry::default();
        assert!(stages.validate(&sizes).is_ok());

        stages.bound_box = DispatchGeometry::groups(31);
        assert!(stages.validate(&sizes).is_err());
    }

    #[test]
    fn test_profile_warp_override() {
        let profile = DeviceProfile {
            warp_size: Some(64),
            ..DeviceProfile::default()
        };
        let sizes = WorkSizes::derive(3000, 32, &profile).unwrap();
        assert_eq!(sizes.tree.num_nodes % 64, 63);
    }
}
