//! Typed kernel arguments and kernel binding.
//!
//! Each kernel has its own argument struct. Arguments are validated against
//! the registry when they are bound with [`Kernel::set`], so a dispatch never
//! discovers a missing or undersized buffer.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::device::{BufferHandle, ComputeDevice, KernelCall};
use crate::error::SimError;
use crate::fa2::ForceParams;
use crate::registry::BufferRegistry;
use crate::sizes::DispatchGeometry;
use crate::Result;

/// Identity of a device kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelId {
    ToBarnesLayout,
    BoundBox,
    BuildTree,
    ComputeSums,
    Sort,
    CalculateForces,
    Integrate,
    MoveNodes,
    SelectNodes,
}

impl KernelId {
    /// Barnes-Hut stages in execution order.
    pub const BARNES_HUT: [KernelId; 6] = [
        Self::ToBarnesLayout,
        Self::BoundBox,
        Self::BuildTree,
        Self::ComputeSums,
        Self::Sort,
        Self::CalculateForces,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToBarnesLayout => "to_barnes_layout",
            Self::BoundBox => "bound_box",
            Self::BuildTree => "build_tree",
            Self::ComputeSums => "compute_sums",
            Self::Sort => "sort",
            Self::CalculateForces => "calculate_forces",
            Self::Integrate => "integrate",
            Self::MoveNodes => "move_nodes",
            Self::SelectNodes => "select_nodes",
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buffer a kernel touches and the smallest size it accepts.
#[derive(Debug, Clone, Copy)]
pub struct Requirement {
    pub label: &'static str,
    pub buffer: BufferHandle,
    pub min_bytes: u64,
}

const fn req(label: &'static str, buffer: BufferHandle, elements: u64) -> Requirement {
    Requirement {
        label,
        buffer,
        min_bytes: elements * 4,
    }
}

/// Argument struct of one kernel.
pub trait KernelArgs: Clone + fmt::Debug {
    const KERNEL: KernelId;

    fn requirements(&self) -> Vec<Requirement>;

    fn into_stage(self) -> StageArgs;
}

/// Layout transform: positions and degrees into tree input.
#[derive(Debug, Clone, PartialEq)]
pub struct ToBarnesLayoutArgs {
    pub positions: BufferHandle,
    pub degrees: BufferHandle,
    pub x_coords: BufferHandle,
    pub y_coords: BufferHandle,
    pub mass: BufferHandle,
    pub blocked: BufferHandle,
    pub max_depth: BufferHandle,
    pub num_points: u32,
    pub num_nodes: u32,
    pub step_number: u32,
}

impl KernelArgs for ToBarnesLayoutArgs {
    const KERNEL: KernelId = KernelId::ToBarnesLayout;

    fn requirements(&self) -> Vec<Requirement> {
        let n = u64::from(self.num_points);
        let slots = u64::from(self.num_nodes) + 1;
        vec![
            req("positions", self.positions, n * 2),
            req("degrees", self.degrees, n),
            req("x_coords", self.x_coords, slots),
            req("y_coords", self.y_coords, slots),
            req("mass", self.mass, slots),
            req("blocked", self.blocked, 1),
            req("max_depth", self.max_depth, 1),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::ToBarnesLayout(self)
    }
}

/// Bounding box, root initialization and global speed update.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundBoxArgs {
    pub x_coords: BufferHandle,
    pub y_coords: BufferHandle,
    pub mass: BufferHandle,
    pub children: BufferHandle,
    pub start: BufferHandle,
    pub x_mins: BufferHandle,
    pub x_maxs: BufferHandle,
    pub y_mins: BufferHandle,
    pub y_maxs: BufferHandle,
    pub swings: BufferHandle,
    pub tractions: BufferHandle,
    pub global_swings: BufferHandle,
    pub global_tractions: BufferHandle,
    pub global_speed: BufferHandle,
    pub blocked: BufferHandle,
    pub step: BufferHandle,
    pub bottom: BufferHandle,
    pub max_depth: BufferHandle,
    pub radius: BufferHandle,
    pub num_bodies: u32,
    pub num_nodes: u32,
    pub num_work_groups: u32,
    pub jitter_tolerance: f32,
}

impl KernelArgs for BoundBoxArgs {
    const KERNEL: KernelId = KernelId::BoundBox;

    fn requirements(&self) -> Vec<Requirement> {
        let n = u64::from(self.num_bodies);
        let slots = u64::from(self.num_nodes) + 1;
        let groups = u64::from(self.num_work_groups);
        vec![
            req("x_coords", self.x_coords, slots),
            req("y_coords", self.y_coords, slots),
            req("mass", self.mass, slots),
            req("children", self.children, slots * 4),
            req("start", self.start, slots),
            req("x_mins", self.x_mins, groups),
            req("x_maxs", self.x_maxs, groups),
            req("y_mins", self.y_mins, groups),
            req("y_maxs", self.y_maxs, groups),
            req("swings", self.swings, n),
            req("tractions", self.tractions, n),
            req("global_swings", self.global_swings, groups),
            req("global_tractions", self.global_tractions, groups),
            req("global_speed", self.global_speed, 3),
            req("blocked", self.blocked, 1),
            req("step", self.step, 1),
            req("bottom", self.bottom, 1),
            req("max_depth", self.max_depth, 1),
            req("radius", self.radius, 1),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::BoundBox(self)
    }
}

/// Concurrent quadtree insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTreeArgs {
    pub x_coords: BufferHandle,
    pub y_coords: BufferHandle,
    pub mass: BufferHandle,
    pub children: BufferHandle,
    pub start: BufferHandle,
    pub blocked: BufferHandle,
    pub bottom: BufferHandle,
    pub max_depth: BufferHandle,
    pub radius: BufferHandle,
    pub num_bodies: u32,
    pub num_nodes: u32,
}

impl KernelArgs for BuildTreeArgs {
    const KERNEL: KernelId = KernelId::BuildTree;

    fn requirements(&self) -> Vec<Requirement> {
        let slots = u64::from(self.num_nodes) + 1;
        vec![
            req("x_coords", self.x_coords, slots),
            req("y_coords", self.y_coords, slots),
            req("mass", self.mass, slots),
            req("children", self.children, slots * 4),
            req("start", self.start, slots),
            req("blocked", self.blocked, 1),
            req("bottom", self.bottom, 1),
            req("max_depth", self.max_depth, 1),
            req("radius", self.radius, 1),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::BuildTree(self)
    }
}

/// Bottom-up mass and center-of-mass summarization.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeSumsArgs {
    pub x_coords: BufferHandle,
    pub y_coords: BufferHandle,
    pub mass: BufferHandle,
    pub children: BufferHandle,
    pub count: BufferHandle,
    pub bottom: BufferHandle,
    pub num_bodies: u32,
    pub num_nodes: u32,
}

impl KernelArgs for ComputeSumsArgs {
    const KERNEL: KernelId = KernelId::ComputeSums;

    fn requirements(&self) -> Vec<Requirement> {
        let slots = u64::from(self.num_nodes) + 1;
        vec![
            req("x_coords", self.x_coords, slots),
            req("y_coords", self.y_coords, slots),
            req("mass", self.mass, slots),
            req("children", self.children, slots * 4),
            req("count", self.count, slots),
            req("bottom", self.bottom, 1),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::ComputeSums(self)
    }
}

/// Depth-first body ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct SortArgs {
    pub children: BufferHandle,
    pub start: BufferHandle,
    pub sort: BufferHandle,
    pub count: BufferHandle,
    pub bottom: BufferHandle,
    pub num_bodies: u32,
    pub num_nodes: u32,
}

impl KernelArgs for SortArgs {
    const KERNEL: KernelId = KernelId::Sort;

    fn requirements(&self) -> Vec<Requirement> {
        let slots = u64::from(self.num_nodes) + 1;
        vec![
            req("children", self.children, slots * 4),
            req("start", self.start, slots),
            req("sort", self.sort, slots),
            req("count", self.count, slots),
            req("bottom", self.bottom, 1),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::Sort(self)
    }
}

/// Adjacency buffers of one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjacencyArgs {
    pub edges: BufferHandle,
    pub work_items: BufferHandle,
    pub weights: BufferHandle,
    pub edge_count: u32,
}

impl AdjacencyArgs {
    fn requirements(&self, prefix: &'static [&'static str; 3], num_points: u64) -> [Requirement; 3] {
        let edges = u64::from(self.edge_count);
        [
            req(prefix[0], self.edges, edges * 2),
            req(prefix[1], self.work_items, num_points * 4),
            req(prefix[2], self.weights, edges),
        ]
    }
}

/// Tree traversal, edge attraction and gravity.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculateForcesArgs {
    pub x_coords: BufferHandle,
    pub y_coords: BufferHandle,
    pub mass: BufferHandle,
    pub children: BufferHandle,
    pub sort: BufferHandle,
    pub max_depth: BufferHandle,
    pub radius: BufferHandle,
    pub point_sizes: BufferHandle,
    pub forward: AdjacencyArgs,
    pub backward: AdjacencyArgs,
    pub point_forces: BufferHandle,
    pub num_bodies: u32,
    pub num_nodes: u32,
    pub params: ForceParams,
}

impl KernelArgs for CalculateForcesArgs {
    const KERNEL: KernelId = KernelId::CalculateForces;

    fn requirements(&self) -> Vec<Requirement> {
        let n = u64::from(self.num_bodies);
        let slots = u64::from(self.num_nodes) + 1;
        let mut reqs = vec![
            req("x_coords", self.x_coords, slots),
            req("y_coords", self.y_coords, slots),
            req("mass", self.mass, slots),
            req("children", self.children, slots * 4),
            req("sort", self.sort, slots),
            req("max_depth", self.max_depth, 1),
            req("radius", self.radius, 1),
            req("point_sizes", self.point_sizes, n),
            req("point_forces", self.point_forces, n * 2),
        ];
        reqs.extend(self.forward.requirements(
            &["forward_edges", "forward_work_items", "forward_weights"],
            n,
        ));
        reqs.extend(self.backward.requirements(
            &["backward_edges", "backward_work_items", "backward_weights"],
            n,
        ));
        reqs
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::CalculateForces(self)
    }
}

/// Adaptive-speed position update.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrateArgs {
    pub positions: BufferHandle,
    pub point_forces: BufferHandle,
    pub prev_forces: BufferHandle,
    pub swings: BufferHandle,
    pub tractions: BufferHandle,
    pub degrees: BufferHandle,
    pub global_speed: BufferHandle,
    pub num_points: u32,
    pub adjust_sizes: bool,
}

impl KernelArgs for IntegrateArgs {
    const KERNEL: KernelId = KernelId::Integrate;

    fn requirements(&self) -> Vec<Requirement> {
        let n = u64::from(self.num_points);
        vec![
            req("positions", self.positions, n * 2),
            req("point_forces", self.point_forces, n * 2),
            req("prev_forces", self.prev_forces, n * 2),
            req("swings", self.swings, n),
            req("tractions", self.tractions, n),
            req("degrees", self.degrees, n),
            req("global_speed", self.global_speed, 3),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::Integrate(self)
    }
}

/// Translate selected points.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveNodesArgs {
    pub positions: BufferHandle,
    pub selection: BufferHandle,
    pub num_points: u32,
    pub delta: [f32; 2],
}

impl KernelArgs for MoveNodesArgs {
    const KERNEL: KernelId = KernelId::MoveNodes;

    fn requirements(&self) -> Vec<Requirement> {
        let n = u64::from(self.num_points);
        vec![
            req("positions", self.positions, n * 2),
            req("selection", self.selection, n),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::MoveNodes(self)
    }
}

/// Selection region in layout coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Region {
    Rect { min: [f32; 2], max: [f32; 2] },
    Circle { center: [f32; 2], radius: f32 },
}

impl Region {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        match *self {
            Region::Rect { min, max } => x >= min[0] && x <= max[0] && y >= min[1] && y <= max[1],
            Region::Circle { center, radius } => {
                let dx = x - center[0];
                let dy = y - center[1];
                dx * dx + dy * dy <= radius * radius
            }
        }
    }
}

/// Mark points inside a region in the selection mask.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectNodesArgs {
    pub positions: BufferHandle,
    pub selection: BufferHandle,
    pub num_points: u32,
    pub region: Region,
}

impl KernelArgs for SelectNodesArgs {
    const KERNEL: KernelId = KernelId::SelectNodes;

    fn requirements(&self) -> Vec<Requirement> {
        let n = u64::from(self.num_points);
        vec![
            req("positions", self.positions, n * 2),
            req("selection", self.selection, n),
        ]
    }

    fn into_stage(self) -> StageArgs {
        StageArgs::SelectNodes(self)
    }
}

/// Arguments of any kernel, as carried by a [`KernelCall`].
#[derive(Debug, Clone, PartialEq)]
pub enum StageArgs {
    ToBarnesLayout(ToBarnesLayoutArgs),
    BoundBox(BoundBoxArgs),
    BuildTree(BuildTreeArgs),
    ComputeSums(ComputeSumsArgs),
    Sort(SortArgs),
    CalculateForces(CalculateForcesArgs),
    Integrate(IntegrateArgs),
    MoveNodes(MoveNodesArgs),
    SelectNodes(SelectNodesArgs),
}

impl StageArgs {
    pub fn kernel(&self) -> KernelId {
        match self {
            Self::ToBarnesLayout(_) => KernelId::ToBarnesLayout,
            Self::BoundBox(_) => KernelId::BoundBox,
            Self::BuildTree(_) => KernelId::BuildTree,
            Self::ComputeSums(_) => KernelId::ComputeSums,
            Self::Sort(_) => KernelId::Sort,
            Self::CalculateForces(_) => KernelId::CalculateForces,
            Self::Integrate(_) => KernelId::Integrate,
            Self::MoveNodes(_) => KernelId::MoveNodes,
            Self::SelectNodes(_) => KernelId::SelectNodes,
        }
    }

    pub fn requirements(&self) -> Vec<Requirement> {
        match self {
            Self::ToBarnesLayout(a) => a.requirements(),
            Self::BoundBox(a) => a.requirements(),
            Self::BuildTree(a) => a.requirements(),
            Self::ComputeSums(a) => a.requirements(),
            Self::Sort(a) => a.requirements(),
            Self::CalculateForces(a) => a.requirements(),
            Self::Integrate(a) => a.requirements(),
            Self::MoveNodes(a) => a.requirements(),
            Self::SelectNodes(a) => a.requirements(),
        }
    }
}

/// A kernel with its bound arguments.
#[derive(Debug, Clone)]
pub struct Kernel<A: KernelArgs> {
    args: Option<A>,
}

impl<A: KernelArgs> Default for Kernel<A> {
    fn default() -> Self {
        Self { args: None }
    }
}

impl<A: KernelArgs> Kernel<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `args` against the registry and bind them.
    pub fn set(&mut self, args: A, registry: &BufferRegistry) -> Result<()> {
        validate(&args, registry)?;
        self.args = Some(args);
        Ok(())
    }

    /// Change scalar arguments of an already bound kernel.
    pub fn update(&mut self, f: impl FnOnce(&mut A)) -> Result<()> {
        let args = self
            .args
            .as_mut()
            .ok_or_else(|| SimError::binding(A::KERNEL, "kernel is not bound"))?;
        f(args);
        Ok(())
    }

    pub fn args(&self) -> Option<&A> {
        self.args.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.args.is_some()
    }

    pub fn clear(&mut self) {
        self.args = None;
    }

    /// Dispatch the kernel and wait for its completion signal.
    pub async fn exec<D: ComputeDevice>(
        &self,
        device: &mut D,
        geometry: DispatchGeometry,
        dependencies: &[BufferHandle],
    ) -> Result<()> {
        let args = self
            .args
            .clone()
            .ok_or_else(|| SimError::binding(A::KERNEL, "kernel is not bound"))?;
        geometry
            .validate()
            .map_err(|e| SimError::kernel(A::KERNEL, e.to_string()))?;
        debug!(
            kernel = %A::KERNEL,
            global = geometry.global,
            local = geometry.local,
            dependencies = dependencies.len(),
            "dispatch"
        );
        device
            .dispatch(KernelCall {
                args: args.into_stage(),
                geometry,
                dependencies: dependencies.to_vec(),
            })
            .await
    }
}

fn validate<A: KernelArgs>(args: &A, registry: &BufferRegistry) -> Result<()> {
    for requirement in args.requirements() {
        match registry.find(requirement.buffer) {
            None => {
                return Err(SimError::binding(
                    A::KERNEL,
                    format!("{} is not a live buffer", requirement.label),
                ))
            }
            Some(descriptor) if descriptor.byte_len < requirement.min_bytes => {
                return Err(SimError::binding(
                    A::KERNEL,
                    format!(
                        "{} ({}) holds {} bytes, needs {}",
                        requirement.label, descriptor.name, descriptor.byte_len, requirement.min_bytes
                    ),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
