//! The six-stage Barnes-Hut force pipeline.
//!
//! ```text
//! positions ─▶ to_barnes_layout ─▶ bound_box ─▶ build_tree ─▶ compute_sums ─▶ sort ─▶ calculate_forces ─▶ point_forces
//! ```
//!
//! Every stage is awaited before the next one is dispatched, and each
//! dispatch declares the buffers written by earlier stages that it reads.

use tracing::{debug, info};

use crate::device::{BufferHandle, ComputeDevice};
use crate::fa2::GlobalSpeed;
use crate::kernels::{
    AdjacencyArgs, BoundBoxArgs, BuildTreeArgs, CalculateForcesArgs, ComputeSumsArgs, Kernel,
    KernelArgs, SortArgs, ToBarnesLayoutArgs,
};
use crate::layout::SimContext;
use crate::registry::{BufferName, BufferRegistry, BufferSpec, ElementType};
use crate::sizes::{DispatchGeometry, StageGeometry, TreeSizes, WorkSizes};
use crate::{Result, SimError};

/// Handles of every tree-sized scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeBuffers {
    pub sizes: TreeSizes,
    pub x_coords: BufferHandle,
    pub y_coords: BufferHandle,
    pub mass: BufferHandle,
    pub children: BufferHandle,
    pub start: BufferHandle,
    pub sort: BufferHandle,
    pub count: BufferHandle,
    pub x_mins: BufferHandle,
    pub x_maxs: BufferHandle,
    pub y_mins: BufferHandle,
    pub y_maxs: BufferHandle,
    pub global_swings: BufferHandle,
    pub global_tractions: BufferHandle,
    pub blocked: BufferHandle,
    pub step: BufferHandle,
    pub bottom: BufferHandle,
    pub max_depth: BufferHandle,
    pub radius: BufferHandle,
    pub global_speed: BufferHandle,
}

impl TreeBuffers {
    /// Allocation requests for a tree of `sizes`.
    pub fn specs(sizes: &TreeSizes) -> Vec<BufferSpec> {
        let slots = sizes.node_slots();
        let groups = sizes.num_work_groups as usize;
        vec![
            BufferSpec::zeroed(BufferName::XCoords, ElementType::F32, slots),
            BufferSpec::zeroed(BufferName::YCoords, ElementType::F32, slots),
            BufferSpec::zeroed(BufferName::Mass, ElementType::F32, slots),
            BufferSpec::filled(BufferName::Children, ElementType::I32, slots * 4, -1i32),
            BufferSpec::zeroed(BufferName::Start, ElementType::I32, slots),
            BufferSpec::zeroed(BufferName::Sort, ElementType::I32, slots),
            BufferSpec::zeroed(BufferName::Count, ElementType::I32, slots),
            BufferSpec::zeroed(BufferName::GlobalXMins, ElementType::F32, groups),
            BufferSpec::zeroed(BufferName::GlobalXMaxs, ElementType::F32, groups),
            BufferSpec::zeroed(BufferName::GlobalYMins, ElementType::F32, groups),
            BufferSpec::zeroed(BufferName::GlobalYMaxs, ElementType::F32, groups),
            BufferSpec::zeroed(BufferName::GlobalSwings, ElementType::F32, groups),
            BufferSpec::zeroed(BufferName::GlobalTractions, ElementType::F32, groups),
            BufferSpec::zeroed(BufferName::Blocked, ElementType::I32, 1),
            BufferSpec::zeroed(BufferName::Step, ElementType::I32, 1),
            BufferSpec::filled(BufferName::Bottom, ElementType::I32, 1, sizes.num_nodes as i32),
            BufferSpec::filled(BufferName::MaxDepth, ElementType::I32, 1, 1i32),
            BufferSpec::zeroed(BufferName::Radius, ElementType::F32, 1),
            BufferSpec::with_contents(
                BufferName::GlobalSpeed,
                ElementType::F32,
                &[GlobalSpeed::default()],
            ),
        ]
    }

    pub fn resolve(registry: &BufferRegistry, sizes: TreeSizes) -> Result<Self> {
        let slots = sizes.node_slots() as u64;
        let x_coords = registry.get(BufferName::XCoords)?;
        if x_coords.len < slots {
            return Err(SimError::invalid(format!(
                "tree buffers hold {} slots, {slots} needed",
                x_coords.len
            )));
        }
        Ok(Self {
            sizes,
            x_coords: x_coords.handle,
            y_coords: registry.handle(BufferName::YCoords)?,
            mass: registry.handle(BufferName::Mass)?,
            children: registry.handle(BufferName::Children)?,
            start: registry.handle(BufferName::Start)?,
            sort: registry.handle(BufferName::Sort)?,
            count: registry.handle(BufferName::Count)?,
            x_mins: registry.handle(BufferName::GlobalXMins)?,
            x_maxs: registry.handle(BufferName::GlobalXMaxs)?,
            y_mins: registry.handle(BufferName::GlobalYMins)?,
            y_maxs: registry.handle(BufferName::GlobalYMaxs)?,
            global_swings: registry.handle(BufferName::GlobalSwings)?,
            global_tractions: registry.handle(BufferName::GlobalTractions)?,
            blocked: registry.handle(BufferName::Blocked)?,
            step: registry.handle(BufferName::Step)?,
            bottom: registry.handle(BufferName::Bottom)?,
            max_depth: registry.handle(BufferName::MaxDepth)?,
            radius: registry.handle(BufferName::Radius)?,
            global_speed: registry.handle(BufferName::GlobalSpeed)?,
        })
    }
}

/// Point and edge buffers the pipeline reads or writes.
#[derive(Debug, Clone, Copy)]
struct PointBuffers {
    positions: BufferHandle,
    degrees: BufferHandle,
    point_sizes: BufferHandle,
    point_forces: BufferHandle,
    swings: BufferHandle,
    tractions: BufferHandle,
    forward: AdjacencyArgs,
    backward: AdjacencyArgs,
}

impl PointBuffers {
    fn resolve(registry: &BufferRegistry, edge_count: u32) -> Result<Self> {
        Ok(Self {
            positions: registry.handle(BufferName::Positions)?,
            degrees: registry.handle(BufferName::PointDegrees)?,
            point_sizes: registry.handle(BufferName::PointSizes)?,
            point_forces: registry.handle(BufferName::PointForces)?,
            swings: registry.handle(BufferName::Swings)?,
            tractions: registry.handle(BufferName::Tractions)?,
            forward: AdjacencyArgs {
                edges: registry.handle(BufferName::ForwardEdges)?,
                work_items: registry.handle(BufferName::ForwardWorkItems)?,
                weights: registry.handle(BufferName::ForwardWeights)?,
                edge_count,
            },
            backward: AdjacencyArgs {
                edges: registry.handle(BufferName::BackwardEdges)?,
                work_items: registry.handle(BufferName::BackwardWorkItems)?,
                weights: registry.handle(BufferName::BackwardWeights)?,
                edge_count,
            },
        })
    }
}

/// Barnes-Hut force evaluation over the registry's point, edge and tree buffers.
#[derive(Debug, Default)]
pub struct BarnesHutPipeline {
    to_barnes_layout: Kernel<ToBarnesLayoutArgs>,
    bound_box: Kernel<BoundBoxArgs>,
    build_tree: Kernel<BuildTreeArgs>,
    compute_sums: Kernel<ComputeSumsArgs>,
    sort: Kernel<SortArgs>,
    calculate_forces: Kernel<CalculateForcesArgs>,
    tree: Option<TreeBuffers>,
    stages: StageGeometry,
}

impl BarnesHutPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> Option<&TreeBuffers> {
        self.tree.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.tree.is_some()
    }

    /// Bind every stage to freshly allocated buffers.
    ///
    /// Called after point or edge counts changed and the tree buffers for
    /// `sizes` were installed in the registry.
    pub fn bind<D: ComputeDevice>(&mut self, ctx: &SimContext<D>, sizes: &WorkSizes) -> Result<()> {
        let registry = &ctx.registry;
        let tree = TreeBuffers::resolve(registry, sizes.tree)?;
        let points = PointBuffers::resolve(registry, ctx.edge_count)?;
        let num_bodies = sizes.tree.num_bodies;
        let num_nodes = sizes.tree.num_nodes;

        if num_bodies != ctx.point_count {
            return Err(SimError::invalid(format!(
                "tree sized for {num_bodies} bodies, {} points are set",
                ctx.point_count
            )));
        }

        self.to_barnes_layout.set(
            ToBarnesLayoutArgs {
                positions: points.positions,
                degrees: points.degrees,
                x_coords: tree.x_coords,
                y_coords: tree.y_coords,
                mass: tree.mass,
                blocked: tree.blocked,
                max_depth: tree.max_depth,
                num_points: num_bodies,
                num_nodes,
                step_number: 0,
            },
            registry,
        )?;
        self.bound_box.set(
            BoundBoxArgs {
                x_coords: tree.x_coords,
                y_coords: tree.y_coords,
                mass: tree.mass,
                children: tree.children,
                start: tree.start,
                x_mins: tree.x_mins,
                x_maxs: tree.x_maxs,
                y_mins: tree.y_mins,
                y_maxs: tree.y_maxs,
                swings: points.swings,
                tractions: points.tractions,
                global_swings: tree.global_swings,
                global_tractions: tree.global_tractions,
                global_speed: tree.global_speed,
                blocked: tree.blocked,
                step: tree.step,
                bottom: tree.bottom,
                max_depth: tree.max_depth,
                radius: tree.radius,
                num_bodies,
                num_nodes,
                num_work_groups: sizes.tree.num_work_groups,
                jitter_tolerance: ctx.physics.jitter_tolerance,
            },
            registry,
        )?;
        self.build_tree.set(
            BuildTreeArgs {
                x_coords: tree.x_coords,
                y_coords: tree.y_coords,
                mass: tree.mass,
                children: tree.children,
                start: tree.start,
                blocked: tree.blocked,
                bottom: tree.bottom,
                max_depth: tree.max_depth,
                radius: tree.radius,
                num_bodies,
                num_nodes,
            },
            registry,
        )?;
        self.compute_sums.set(
            ComputeSumsArgs {
                x_coords: tree.x_coords,
                y_coords: tree.y_coords,
                mass: tree.mass,
                children: tree.children,
                count: tree.count,
                bottom: tree.bottom,
                num_bodies,
                num_nodes,
            },
            registry,
        )?;
        self.sort.set(
            SortArgs {
                children: tree.children,
                start: tree.start,
                sort: tree.sort,
                count: tree.count,
                bottom: tree.bottom,
                num_bodies,
                num_nodes,
            },
            registry,
        )?;
        self.calculate_forces.set(
            CalculateForcesArgs {
                x_coords: tree.x_coords,
                y_coords: tree.y_coords,
                mass: tree.mass,
                children: tree.children,
                sort: tree.sort,
                max_depth: tree.max_depth,
                radius: tree.radius,
                point_sizes: points.point_sizes,
                forward: points.forward,
                backward: points.backward,
                point_forces: points.point_forces,
                num_bodies,
                num_nodes,
                params: ctx.physics.force_params(),
            },
            registry,
        )?;

        self.tree = Some(tree);
        self.stages = sizes.stages.clone();
        info!(num_bodies, num_nodes, edges = ctx.edge_count, "bound Barnes-Hut pipeline");
        Ok(())
    }

    /// Rebind attribute inputs and physics without touching the tree.
    pub fn refresh<D: ComputeDevice>(&mut self, ctx: &SimContext<D>) -> Result<()> {
        if self.tree.is_none() {
            return Err(SimError::NotInitialized);
        }
        let registry = &ctx.registry;
        let point_sizes = registry.handle(BufferName::PointSizes)?;
        let params = ctx.physics.force_params();
        let jitter_tolerance = ctx.physics.jitter_tolerance;

        if let Some(args) = self.calculate_forces.args() {
            let mut args = args.clone();
            args.point_sizes = point_sizes;
            args.params = params;
            self.calculate_forces.set(args, registry)?;
        }
        self.bound_box.update(|args| args.jitter_tolerance = jitter_tolerance)?;
        debug!("refreshed Barnes-Hut attribute bindings");
        Ok(())
    }

    /// Forget every binding.
    pub fn unbind(&mut self) {
        self.to_barnes_layout.clear();
        self.bound_box.clear();
        self.build_tree.clear();
        self.compute_sums.clear();
        self.sort.clear();
        self.calculate_forces.clear();
        self.tree = None;
    }

    /// Run the six stages for `step`, awaiting each before the next.
    pub async fn exec<D: ComputeDevice>(&mut self, device: &mut D, step: u32) -> Result<()> {
        let tree = self.tree.ok_or(SimError::NotInitialized)?;
        self.to_barnes_layout.update(|args| args.step_number = step)?;
        let inputs = self
            .to_barnes_layout
            .args()
            .map(|a| [a.positions, a.degrees])
            .ok_or(SimError::NotInitialized)?;
        let speed_inputs = self
            .bound_box
            .args()
            .map(|a| [a.swings, a.tractions])
            .ok_or(SimError::NotInitialized)?;
        let stages = &self.stages;

        run_stage(&self.to_barnes_layout, device, stages.to_barnes_layout, &inputs).await?;
        run_stage(
            &self.bound_box,
            device,
            stages.bound_box,
            &[tree.x_coords, tree.y_coords, tree.mass, speed_inputs[0], speed_inputs[1]],
        )
        .await?;
        run_stage(
            &self.build_tree,
            device,
            stages.build_tree,
            &[tree.x_coords, tree.y_coords, tree.children, tree.start, tree.radius, tree.bottom],
        )
        .await?;
        run_stage(
            &self.compute_sums,
            device,
            stages.compute_sums,
            &[tree.x_coords, tree.y_coords, tree.mass, tree.children, tree.bottom, tree.max_depth],
        )
        .await?;
        run_stage(
            &self.sort,
            device,
            stages.sort,
            &[tree.children, tree.count, tree.start, tree.bottom],
        )
        .await?;
        run_stage(
            &self.calculate_forces,
            device,
            stages.calculate_forces,
            &[tree.x_coords, tree.y_coords, tree.mass, tree.children, tree.sort, tree.radius],
        )
        .await?;
        Ok(())
    }
}

async fn run_stage<A: KernelArgs, D: ComputeDevice>(
    kernel: &Kernel<A>,
    device: &mut D,
    geometry: DispatchGeometry,
    dependencies: &[BufferHandle],
) -> Result<()> {
    kernel.exec(device, geometry, dependencies).await.map_err(|e| {
        debug!(kernel = %A::KERNEL, error = %e, "stage failed, aborting tick");
        e
    })
}
