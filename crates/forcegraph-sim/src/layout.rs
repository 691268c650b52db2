//! Layout algorithms and the context they run against.

use futures::future::LocalBoxFuture;
use tracing::debug;

use crate::config::{DeviceProfile, ForceAtlas2Config, Locks};
use crate::device::ComputeDevice;
use crate::kernels::{IntegrateArgs, Kernel};
use crate::pipeline::{BarnesHutPipeline, TreeBuffers};
use crate::registry::{BufferName, BufferRegistry, BufferSpec};
use crate::sizes::WorkSizes;
use crate::{Result, SimError};

/// Device, buffers and dataset parameters shared by all layout algorithms.
pub struct SimContext<D> {
    pub device: D,
    pub registry: BufferRegistry,
    pub point_count: u32,
    pub edge_count: u32,
    pub physics: ForceAtlas2Config,
    pub locks: Locks,
    pub profile: DeviceProfile,
}

impl<D: ComputeDevice> SimContext<D> {
    pub fn new(device: D, physics: ForceAtlas2Config, profile: DeviceProfile, locks: Locks) -> Self {
        Self {
            device,
            registry: BufferRegistry::new(),
            point_count: 0,
            edge_count: 0,
            physics,
            locks,
            profile,
        }
    }

    /// Work sizes for `point_count` points on this device.
    pub fn work_sizes_for(&self, point_count: u32) -> Result<WorkSizes> {
        WorkSizes::derive(point_count, self.device.properties().warp_size, &self.profile)
    }

    /// Work sizes of the current dataset.
    pub fn work_sizes(&self) -> Result<WorkSizes> {
        if self.point_count == 0 {
            return Err(SimError::NotInitialized);
        }
        self.work_sizes_for(self.point_count)
    }
}

/// What a tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Buffers whose content changed and must be version-bumped.
    pub changed: Vec<BufferName>,
}

/// A layout algorithm driven once per tick.
pub trait LayoutAlgorithm<D: ComputeDevice> {
    fn name(&self) -> &'static str;

    /// Extra buffers for `point_count` points, installed with the point or edge set.
    fn buffer_specs(&self, ctx: &SimContext<D>, point_count: u32) -> Result<Vec<BufferSpec>>;

    /// Rebind after counts changed and new buffers were installed.
    fn bind(&mut self, ctx: &SimContext<D>) -> Result<()>;

    /// Rebind attribute buffers and physics; counts are unchanged.
    fn refresh(&mut self, ctx: &SimContext<D>) -> Result<()>;

    /// Advance the layout one step.
    fn tick<'a>(&'a mut self, ctx: &'a mut SimContext<D>, step: u32) -> LocalBoxFuture<'a, Result<TickOutcome>>;
}

/// ForceAtlas2 with Barnes-Hut repulsion.
///
/// Runs the Barnes-Hut pipeline to produce forces, then integrates them
/// into positions with per-point swing damping.
#[derive(Debug, Default)]
pub struct ForceAtlas2Barnes {
    pipeline: BarnesHutPipeline,
    integrate: Kernel<IntegrateArgs>,
    sizes: Option<WorkSizes>,
}

impl ForceAtlas2Barnes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn work_sizes(&self) -> Option<&WorkSizes> {
        self.sizes.as_ref()
    }

    pub fn pipeline(&self) -> &BarnesHutPipeline {
        &self.pipeline
    }
}

impl<D: ComputeDevice> LayoutAlgorithm<D> for ForceAtlas2Barnes {
    fn name(&self) -> &'static str {
        "force_atlas2_barnes"
    }

    fn buffer_specs(&self, ctx: &SimContext<D>, point_count: u32) -> Result<Vec<BufferSpec>> {
        let sizes = ctx.work_sizes_for(point_count)?;
        Ok(TreeBuffers::specs(&sizes.tree))
    }

    fn bind(&mut self, ctx: &SimContext<D>) -> Result<()> {
        let sizes = ctx.work_sizes()?;
        self.pipeline.bind(ctx, &sizes)?;

        let registry = &ctx.registry;
        self.integrate.set(
            IntegrateArgs {
                positions: registry.handle(BufferName::Positions)?,
                point_forces: registry.handle(BufferName::PointForces)?,
                prev_forces: registry.handle(BufferName::PrevForces)?,
                swings: registry.handle(BufferName::Swings)?,
                tractions: registry.handle(BufferName::Tractions)?,
                degrees: registry.handle(BufferName::PointDegrees)?,
                global_speed: registry.handle(BufferName::GlobalSpeed)?,
                num_points: ctx.point_count,
                adjust_sizes: ctx.physics.prevent_overlap,
            },
            registry,
        )?;
        self.sizes = Some(sizes);
        Ok(())
    }

    fn refresh(&mut self, ctx: &SimContext<D>) -> Result<()> {
        self.pipeline.refresh(ctx)?;
        let adjust_sizes = ctx.physics.prevent_overlap;
        self.integrate.update(|args| args.adjust_sizes = adjust_sizes)
    }

    fn tick<'a>(&'a mut self, ctx: &'a mut SimContext<D>, step: u32) -> LocalBoxFuture<'a, Result<TickOutcome>> {
        Box::pin(async move {
            if ctx.locks.lock_points {
                debug!(step, "points locked, skipping layout");
                return Ok(TickOutcome::default());
            }
            let sizes = self.sizes.as_ref().ok_or(SimError::NotInitialized)?;
            let geometry = sizes.stages.integrate;

            self.pipeline.exec(&mut ctx.device, step).await?;

            let tree = self.pipeline.tree().ok_or(SimError::NotInitialized)?;
            let dependencies = self
                .integrate
                .args()
                .map(|a| vec![a.point_forces, a.swings, tree.global_speed])
                .unwrap_or_default();
            self.integrate.exec(&mut ctx.device, geometry, &dependencies).await?;

            Ok(TickOutcome {
                changed: vec![BufferName::Positions],
            })
        })
    }
}
