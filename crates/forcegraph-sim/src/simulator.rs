//! The simulator: dataset lifecycle, tick scheduling and point queries.

use std::rc::Rc;

use futures::lock::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ForceAtlas2Config, Locks, SimConfig};
use crate::device::ComputeDevice;
use crate::graph::EdgeSet;
use crate::kernels::{Kernel, MoveNodesArgs, Region, SelectNodesArgs};
use crate::layout::{ForceAtlas2Barnes, LayoutAlgorithm, SimContext};
use crate::registry::{BufferName, BufferRegistry, BufferSpec, ElementType, Versions};
use crate::sizes::TreeSizes;
use crate::{Position, Result, SimError, POINT_DIMENSIONS};

/// Size given to every point until sizes are set.
pub const DEFAULT_POINT_SIZE: f32 = 1.0;
/// Packed RGBA color given to every point until colors are set.
pub const DEFAULT_POINT_COLOR: u32 = 0xffff_ffff;

/// Options of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickOptions {
    /// The caller's animation is playing. Informational only.
    pub play: bool,
    /// Run the layout algorithms; a tick without layout changes nothing.
    pub layout: bool,
}

impl Default for TickOptions {
    fn default() -> Self {
        Self {
            play: true,
            layout: true,
        }
    }
}

/// Snapshot of the simulator as seen by external readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatorState {
    pub point_count: u32,
    pub edge_count: u32,
    pub tick: u64,
    pub versions: Versions,
    pub layout_algorithms: Vec<&'static str>,
    pub tree: Option<TreeSizes>,
}

/// Owns the device buffers of one dataset and advances its layout.
pub struct Simulator<D: ComputeDevice> {
    ctx: SimContext<D>,
    algorithms: Vec<Box<dyn LayoutAlgorithm<D>>>,
}

impl<D: ComputeDevice> Simulator<D> {
    /// A simulator running ForceAtlas2 with Barnes-Hut repulsion.
    pub fn new(device: D, config: SimConfig) -> Result<Self> {
        Self::with_algorithms(device, config, vec![Box::new(ForceAtlas2Barnes::new())])
    }

    /// A simulator running `algorithms` in order on every tick.
    ///
    /// Fails with `InvalidInput` when the configured physics would be rejected
    /// by [`Simulator::set_physics`].
    pub fn with_algorithms(
        device: D,
        config: SimConfig,
        algorithms: Vec<Box<dyn LayoutAlgorithm<D>>>,
    ) -> Result<Self> {
        config.physics.validate()?;
        Ok(Self {
            ctx: SimContext::new(device, config.physics, config.device, config.locks),
            algorithms,
        })
    }

    /// Append an algorithm; it is bound immediately when points are set.
    pub fn add_algorithm(&mut self, mut algorithm: Box<dyn LayoutAlgorithm<D>>) -> Result<()> {
        if self.ctx.point_count > 0 {
            let specs = algorithm.buffer_specs(&self.ctx, self.ctx.point_count)?;
            self.ctx.registry.install(&mut self.ctx.device, specs)?;
            algorithm.bind(&self.ctx)?;
        }
        self.algorithms.push(algorithm);
        Ok(())
    }

    pub fn device(&self) -> &D {
        &self.ctx.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.ctx.device
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.ctx.registry
    }

    pub fn versions(&self) -> &Versions {
        self.ctx.registry.versions()
    }

    pub fn physics(&self) -> &ForceAtlas2Config {
        &self.ctx.physics
    }

    pub fn locks(&self) -> Locks {
        self.ctx.locks
    }

    pub fn point_count(&self) -> u32 {
        self.ctx.point_count
    }

    pub fn state(&self) -> SimulatorState {
        SimulatorState {
            point_count: self.ctx.point_count,
            edge_count: self.ctx.edge_count,
            tick: self.ctx.registry.tick(),
            versions: self.ctx.registry.versions().clone(),
            layout_algorithms: self.algorithms.iter().map(|a| a.name()).collect(),
            tree: self.ctx.work_sizes().ok().map(|sizes| sizes.tree),
        }
    }

    /// Replace the point set with packed `[x0, y0, x1, y1, ..]` positions.
    ///
    /// Installs fresh point buffers, an empty adjacency and tree buffers
    /// sized for the new count. On failure nothing changes.
    pub fn set_points(&mut self, points: &[f32]) -> Result<SimulatorState> {
        let n = validate_points(points)?;

        let mut specs = point_specs(points, n);
        specs.extend(EdgeSet::empty_specs(n));
        for algorithm in &self.algorithms {
            specs.extend(algorithm.buffer_specs(&self.ctx, n)?);
        }
        self.ctx.registry.install(&mut self.ctx.device, specs)?;
        self.ctx.point_count = n;
        self.ctx.edge_count = 0;
        self.bind_all()?;

        info!(points = n, "points set");
        Ok(self.state())
    }

    /// Replace the edge set; tree buffers are reallocated with it.
    pub fn set_edges(&mut self, edges: &EdgeSet) -> Result<SimulatorState> {
        let n = self.ctx.point_count;
        edges.validate(n)?;
        if n == 0 {
            return Err(SimError::NotInitialized);
        }

        let mut specs = edges.specs();
        for algorithm in &self.algorithms {
            specs.extend(algorithm.buffer_specs(&self.ctx, n)?);
        }
        self.ctx.registry.install(&mut self.ctx.device, specs)?;
        self.ctx.edge_count = edges.edge_count();
        self.bind_all()?;

        info!(points = n, edges = self.ctx.edge_count, "edges set");
        Ok(self.state())
    }

    /// Replace per-point sizes.
    pub fn set_sizes(&mut self, sizes: &[f32]) -> Result<SimulatorState> {
        self.check_attribute_len("sizes", sizes.len())?;
        if let Some(bad) = sizes.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(SimError::invalid(format!("point size {bad} is invalid")));
        }
        self.ctx.registry.install(
            &mut self.ctx.device,
            vec![BufferSpec::with_contents(BufferName::PointSizes, ElementType::F32, sizes)],
        )?;
        self.refresh_all()?;
        Ok(self.state())
    }

    /// Replace per-point packed RGBA colors.
    pub fn set_colors(&mut self, colors: &[u32]) -> Result<SimulatorState> {
        self.check_attribute_len("colors", colors.len())?;
        self.ctx.registry.install(
            &mut self.ctx.device,
            vec![BufferSpec::with_contents(BufferName::PointColors, ElementType::U32, colors)],
        )?;
        self.refresh_all()?;
        Ok(self.state())
    }

    pub fn set_physics(&mut self, physics: ForceAtlas2Config) -> Result<()> {
        physics.validate()?;
        self.ctx.physics = physics;
        if self.ctx.point_count > 0 {
            self.refresh_all()?;
        }
        debug!(physics = ?self.ctx.physics, "physics updated");
        Ok(())
    }

    pub fn set_locks(&mut self, locks: Locks) {
        self.ctx.locks = locks;
    }

    /// Run every layout algorithm once, in order, then flush the device.
    ///
    /// A tick without `layout`, or before points are set, returns the
    /// current state untouched. A failed stage aborts the tick and bumps
    /// nothing.
    pub async fn tick(&mut self, step: u32, options: TickOptions) -> Result<SimulatorState> {
        if !options.layout || self.ctx.point_count == 0 {
            debug!(step, layout = options.layout, "tick skipped");
            return Ok(self.state());
        }

        let mut changed = Vec::new();
        for algorithm in &mut self.algorithms {
            let outcome = algorithm.tick(&mut self.ctx, step).await?;
            changed.extend(outcome.changed);
        }
        self.ctx.device.finish().await?;

        changed.sort();
        changed.dedup();
        if !changed.is_empty() {
            self.ctx.registry.bump(&changed, None);
        }
        debug!(step, play = options.play, tick = self.ctx.registry.tick(), "tick done");
        Ok(self.state())
    }

    /// Mark buffers changed by code outside the pipeline.
    pub fn tick_buffers(&mut self, names: &[BufferName], tick: Option<u64>) -> u64 {
        self.ctx.registry.bump(names, tick)
    }

    /// Release the named buffers and bump their versions.
    pub fn reset_buffers(&mut self, names: &[BufferName]) -> Result<u64> {
        self.ctx.registry.reset(&mut self.ctx.device, names)
    }

    /// Translate the points at `indices` by `delta`.
    pub async fn move_nodes(&mut self, indices: &[u32], delta: [f32; 2]) -> Result<()> {
        let n = self.require_points()?;
        let mut mask = vec![0u32; n as usize];
        for &index in indices {
            let slot = mask
                .get_mut(index as usize)
                .ok_or_else(|| SimError::invalid(format!("point {index} is out of range")))?;
            *slot = 1;
        }
        let registry = &self.ctx.registry;
        registry.write(&mut self.ctx.device, BufferName::SelectionMask, &mask)?;

        let mut kernel = Kernel::new();
        kernel.set(
            MoveNodesArgs {
                positions: registry.handle(BufferName::Positions)?,
                selection: registry.handle(BufferName::SelectionMask)?,
                num_points: n,
                delta,
            },
            registry,
        )?;
        let dependencies = [registry.handle(BufferName::Positions)?];
        kernel
            .exec(&mut self.ctx.device, self.ctx.profile.stages.query, &dependencies)
            .await?;
        self.ctx
            .registry
            .bump(&[BufferName::Positions, BufferName::SelectionMask], None);
        Ok(())
    }

    pub async fn select_nodes_in_rect(&mut self, min: [f32; 2], max: [f32; 2]) -> Result<Vec<u32>> {
        self.select_nodes(Region::Rect { min, max }).await
    }

    pub async fn select_nodes_in_circle(&mut self, center: [f32; 2], radius: f32) -> Result<Vec<u32>> {
        self.select_nodes(Region::Circle { center, radius }).await
    }

    /// Mark the points inside `region` in the selection mask and return them.
    pub async fn select_nodes(&mut self, region: Region) -> Result<Vec<u32>> {
        let n = self.require_points()?;
        let registry = &self.ctx.registry;
        let mut kernel = Kernel::new();
        kernel.set(
            SelectNodesArgs {
                positions: registry.handle(BufferName::Positions)?,
                selection: registry.handle(BufferName::SelectionMask)?,
                num_points: n,
                region,
            },
            registry,
        )?;
        let dependencies = [registry.handle(BufferName::Positions)?];
        kernel
            .exec(&mut self.ctx.device, self.ctx.profile.stages.query, &dependencies)
            .await?;
        self.ctx.registry.bump(&[BufferName::SelectionMask], None);

        let mask: Vec<u32> = self
            .ctx
            .registry
            .read(&mut self.ctx.device, BufferName::SelectionMask)
            .await?;
        Ok(mask
            .iter()
            .enumerate()
            .filter(|(_, &selected)| selected != 0)
            .map(|(i, _)| i as u32)
            .collect())
    }

    pub async fn read_positions(&mut self) -> Result<Vec<Position>> {
        self.require_points()?;
        self.ctx
            .registry
            .read(&mut self.ctx.device, BufferName::Positions)
            .await
    }

    /// Forces computed by the last tick.
    pub async fn read_forces(&mut self) -> Result<Vec<[f32; 2]>> {
        self.require_points()?;
        self.ctx
            .registry
            .read(&mut self.ctx.device, BufferName::PointForces)
            .await
    }

    fn bind_all(&mut self) -> Result<()> {
        for algorithm in &mut self.algorithms {
            algorithm.bind(&self.ctx)?;
        }
        Ok(())
    }

    fn refresh_all(&mut self) -> Result<()> {
        for algorithm in &mut self.algorithms {
            algorithm.refresh(&self.ctx)?;
        }
        Ok(())
    }

    fn require_points(&self) -> Result<u32> {
        match self.ctx.point_count {
            0 => Err(SimError::NotInitialized),
            n => Ok(n),
        }
    }

    fn check_attribute_len(&self, what: &str, len: usize) -> Result<()> {
        let n = self.require_points()?;
        if len != n as usize {
            return Err(SimError::invalid(format!("{len} {what} for {n} points")));
        }
        Ok(())
    }
}

fn validate_points(points: &[f32]) -> Result<u32> {
    if points.is_empty() {
        return Err(SimError::invalid("point buffer is empty"));
    }
    if points.len() % POINT_DIMENSIONS != 0 {
        return Err(SimError::invalid(format!(
            "point buffer length {} is not a multiple of {POINT_DIMENSIONS}",
            points.len()
        )));
    }
    if let Some(bad) = points.iter().find(|v| !v.is_finite()) {
        return Err(SimError::invalid(format!("point coordinate {bad} is not finite")));
    }
    u32::try_from(points.len() / POINT_DIMENSIONS)
        .map_err(|_| SimError::invalid("too many points"))
}

fn point_specs(points: &[f32], n: u32) -> Vec<BufferSpec> {
    let n = n as usize;
    vec![
        BufferSpec::with_contents(BufferName::Positions, ElementType::F32, points),
        BufferSpec::filled(BufferName::PointSizes, ElementType::F32, n, DEFAULT_POINT_SIZE),
        BufferSpec::filled(BufferName::PointColors, ElementType::U32, n, DEFAULT_POINT_COLOR),
        BufferSpec::zeroed(BufferName::PointForces, ElementType::F32, n * 2),
        BufferSpec::zeroed(BufferName::PrevForces, ElementType::F32, n * 2),
        BufferSpec::zeroed(BufferName::Swings, ElementType::F32, n),
        BufferSpec::zeroed(BufferName::Tractions, ElementType::F32, n),
        BufferSpec::zeroed(BufferName::SelectionMask, ElementType::U32, n),
    ]
}

/// A simulator shared between tasks of one thread.
///
/// `tick` waits for an in-flight tick to complete; `try_tick` rejects
/// instead. Ticks never interleave.
pub struct SharedSimulator<D: ComputeDevice> {
    inner: Rc<Mutex<Simulator<D>>>,
}

impl<D: ComputeDevice> Clone for SharedSimulator<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<D: ComputeDevice> SharedSimulator<D> {
    pub fn new(simulator: Simulator<D>) -> Self {
        Self {
            inner: Rc::new(Mutex::new(simulator)),
        }
    }

    /// Tick once the simulator is free.
    pub async fn tick(&self, step: u32, options: TickOptions) -> Result<SimulatorState> {
        let mut simulator = self.inner.lock().await;
        simulator.tick(step, options).await
    }

    /// Tick now, or fail with [`SimError::TickInFlight`].
    pub async fn try_tick(&self, step: u32, options: TickOptions) -> Result<SimulatorState> {
        let mut simulator = self.inner.try_lock().ok_or(SimError::TickInFlight)?;
        simulator.tick(step, options).await
    }

    /// Exclusive access for any other operation.
    pub async fn lock(&self) -> MutexGuard<'_, Simulator<D>> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;

    fn simulator() -> Simulator<CpuDevice> {
        Simulator::new(CpuDevice::new(), SimConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_bad_points() {
        let mut sim = simulator();
        assert!(matches!(sim.set_points(&[]), Err(SimError::InvalidInput(_))));
        assert!(matches!(sim.set_points(&[1.0, 2.0, 3.0]), Err(SimError::InvalidInput(_))));
        assert!(matches!(sim.set_points(&[1.0, f32::NAN]), Err(SimError::InvalidInput(_))));
        assert!(sim.device().live_buffers().is_empty());
        assert_eq!(sim.versions(), &Versions::default());
    }

    #[test]
    fn test_set_points_installs_everything() {
        let mut sim = simulator();
        let state = sim.set_points(&[0.0, 0.0, 1.0, 1.0, 2.0, 0.5]).unwrap();

        assert_eq!(state.point_count, 3);
        assert_eq!(state.edge_count, 0);
        assert_eq!(state.layout_algorithms, vec!["force_atlas2_barnes"]);
        for name in BufferName::POINT.iter().chain(BufferName::EDGE).chain(BufferName::TREE) {
            assert!(sim.registry().contains(*name), "{name} missing");
        }
        assert_eq!(sim.device().live_buffers(), sim.registry().handles());
    }

    #[test]
    fn test_attribute_length_checked() {
        let mut sim = simulator();
        assert!(matches!(sim.set_sizes(&[1.0]), Err(SimError::NotInitialized)));
        sim.set_points(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        assert!(matches!(sim.set_sizes(&[1.0]), Err(SimError::InvalidInput(_))));
        assert!(sim.set_sizes(&[1.0, 2.0]).is_ok());
        assert!(sim.set_colors(&[0, 1]).is_ok());
    }

    #[test]
    fn test_tick_without_layout_is_noop() {
        let mut sim = simulator();
        sim.set_points(&[0.0, 0.0, 10.0, 10.0]).unwrap();
        let before = sim.versions().clone();
        let state = pollster::block_on(sim.tick(
            1,
            TickOptions {
                play: true,
                layout: false,
            },
        ))
        .unwrap();
        assert_eq!(state.versions, before);
    }

    #[test]
    fn test_tick_before_points_is_noop() {
        let mut sim = simulator();
        let state = pollster::block_on(sim.tick(1, TickOptions::default())).unwrap();
        assert_eq!(state.tick, 0);
        assert!(sim.device().live_buffers().is_empty());
    }

    #[test]
    fn test_locked_points_do_not_move() {
        let mut sim = simulator();
        sim.set_points(&[0.0, 0.0, 10.0, 10.0]).unwrap();
        sim.set_locks(Locks { lock_points: true });
        let before = sim.versions().clone();

        pollster::block_on(sim.tick(1, TickOptions::default())).unwrap();

        assert_eq!(sim.versions(), &before);
        let positions = pollster::block_on(sim.read_positions()).unwrap();
        assert_eq!(positions[1], Position::new(10.0, 10.0));
    }

    #[test]
    fn test_tick_bumps_positions_only() {
        let mut sim = simulator();
        sim.set_points(&[0.0, 0.0, 10.0, 10.0, -5.0, 3.0]).unwrap();
        let before = sim.versions().clone();

        let state = pollster::block_on(sim.tick(1, TickOptions::default())).unwrap();

        assert_eq!(state.tick, before.tick + 1);
        for (name, version) in &state.versions.buffers {
            if *name == BufferName::Positions {
                assert_eq!(*version, state.tick);
            } else {
                assert_eq!(Some(*version), before.get(*name), "{name} bumped");
            }
        }
    }

    #[test]
    fn test_move_and_select() {
        let mut sim = simulator();
        sim.set_points(&[0.0, 0.0, 10.0, 10.0, 20.0, 20.0]).unwrap();

        pollster::block_on(sim.move_nodes(&[1], [5.0, -5.0])).unwrap();
        let positions = pollster::block_on(sim.read_positions()).unwrap();
        assert_eq!(positions[1], Position::new(15.0, 5.0));
        assert_eq!(positions[0], Position::new(0.0, 0.0));

        let selected = pollster::block_on(sim.select_nodes_in_rect([-1.0, -1.0], [16.0, 6.0])).unwrap();
        assert_eq!(selected, vec![0, 1]);

        let selected = pollster::block_on(sim.select_nodes_in_circle([20.0, 20.0], 1.0)).unwrap();
        assert_eq!(selected, vec![2]);

        assert!(pollster::block_on(sim.move_nodes(&[3], [1.0, 1.0])).is_err());
    }

    #[test]
    fn test_physics_validated() {
        let mut sim = simulator();
        let bad = ForceAtlas2Config {
            tau: 2.0,
            ..Default::default()
        };
        assert!(sim.set_physics(bad).is_err());
        assert_eq!(sim.physics().tau, 0.5);
    }
}
