//! Host-memory reference device.
//!
//! [`CpuDevice`] executes every kernel's buffer contract on the host. It is
//! the device the test suite runs on and the fallback when no GPU adapter is
//! available.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::device::{BufferHandle, ComputeDevice, DeviceProperties, KernelCall};
use crate::error::SimError;
use crate::fa2::{self, GlobalSpeed};
use crate::kernels::{
    AdjacencyArgs, BoundBoxArgs, BuildTreeArgs, CalculateForcesArgs, ComputeSumsArgs, IntegrateArgs,
    KernelId, MoveNodesArgs, SelectNodesArgs, SortArgs, StageArgs, ToBarnesLayoutArgs,
};
use crate::quadtree::{self, Bounds, Cells, TreeView};
use crate::Result;

const DEFAULT_WARP_SIZE: u32 = 32;

struct HostBuffer {
    words: Vec<u32>,
    byte_len: u64,
}

/// Reference compute device backed by host memory.
pub struct CpuDevice {
    properties: DeviceProperties,
    buffers: HashMap<BufferHandle, HostBuffer>,
    next_id: u64,
    memory_limit: Option<u64>,
    allocated: u64,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            properties: DeviceProperties {
                name: "cpu reference".to_string(),
                warp_size: DEFAULT_WARP_SIZE,
                max_buffer_size: u64::from(u32::MAX),
            },
            buffers: HashMap::new(),
            next_id: 1,
            memory_limit: None,
            allocated: 0,
        }
    }

    pub fn with_warp_size(mut self, warp_size: u32) -> Self {
        self.properties.warp_size = warp_size;
        self
    }

    /// Refuse allocations once `bytes` are live.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&HostBuffer> {
        self.buffers.get(&handle).ok_or(SimError::UnknownHandle(handle))
    }

    fn load<T: bytemuck::Pod>(&self, handle: BufferHandle) -> Result<Vec<T>> {
        let buffer = self.buffer(handle)?;
        let bytes: &[u8] = bytemuck::cast_slice(&buffer.words);
        let bytes = &bytes[..buffer.byte_len as usize];
        let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>();
        Ok(bytemuck::pod_collect_to_vec(&bytes[..whole]))
    }

    fn store<T: bytemuck::Pod>(&mut self, handle: BufferHandle, data: &[T]) -> Result<()> {
        self.write_buffer(handle, 0, bytemuck::cast_slice(data))
    }

    fn scalar_i32(&self, handle: BufferHandle) -> Result<i32> {
        self.load::<i32>(handle)?
            .first()
            .copied()
            .ok_or(SimError::UnknownHandle(handle))
    }

    fn run(&mut self, args: &StageArgs, groups: u32) -> Result<()> {
        match args {
            StageArgs::ToBarnesLayout(a) => self.to_barnes_layout(a),
            StageArgs::BoundBox(a) => self.bound_box(a, groups),
            StageArgs::BuildTree(a) => self.build_tree(a),
            StageArgs::ComputeSums(a) => self.compute_sums(a),
            StageArgs::Sort(a) => self.sort(a),
            StageArgs::CalculateForces(a) => self.calculate_forces(a),
            StageArgs::Integrate(a) => self.integrate(a),
            StageArgs::MoveNodes(a) => self.move_nodes(a),
            StageArgs::SelectNodes(a) => self.select_nodes(a),
        }
    }

    fn to_barnes_layout(&mut self, a: &ToBarnesLayoutArgs) -> Result<()> {
        let n = a.num_points as usize;
        let positions = self.load::<f32>(a.positions)?;
        let degrees = self.load::<u32>(a.degrees)?;
        let mut x = self.load::<f32>(a.x_coords)?;
        let mut y = self.load::<f32>(a.y_coords)?;
        let mut mass = self.load::<f32>(a.mass)?;
        for i in 0..n {
            x[i] = positions[2 * i];
            y[i] = positions[2 * i + 1];
            mass[i] = degrees[i] as f32 + 1.0;
        }
        self.store(a.x_coords, &x)?;
        self.store(a.y_coords, &y)?;
        self.store(a.mass, &mass)?;
        self.store(a.blocked, &[0i32])?;
        self.store(a.max_depth, &[1i32])
    }

    fn bound_box(&mut self, a: &BoundBoxArgs, groups: u32) -> Result<()> {
        let n = a.num_bodies as usize;
        let root = a.num_nodes as usize;
        let groups = groups.min(a.num_work_groups).max(1) as usize;

        let mut x = self.load::<f32>(a.x_coords)?;
        let mut y = self.load::<f32>(a.y_coords)?;
        let mut mass = self.load::<f32>(a.mass)?;
        let mut children = self.load::<i32>(a.children)?;
        let mut start = self.load::<i32>(a.start)?;

        let partials = quadtree::group_bounds(&x[..n], &y[..n], groups);
        let mut x_mins = self.load::<f32>(a.x_mins)?;
        let mut x_maxs = self.load::<f32>(a.x_maxs)?;
        let mut y_mins = self.load::<f32>(a.y_mins)?;
        let mut y_maxs = self.load::<f32>(a.y_maxs)?;
        for (g, partial) in partials.iter().enumerate() {
            x_mins[g] = partial.min_x;
            x_maxs[g] = partial.max_x;
            y_mins[g] = partial.min_y;
            y_maxs[g] = partial.max_y;
        }
        let bounds = partials.into_iter().fold(Bounds::default(), Bounds::merge);
        let radius = bounds.radius();

        // Speed control over last tick's swing and traction.
        let swings = self.load::<f32>(a.swings)?;
        let tractions = self.load::<f32>(a.tractions)?;
        let chunk = n.div_ceil(groups).max(1);
        let mut global_swings = self.load::<f32>(a.global_swings)?;
        let mut global_tractions = self.load::<f32>(a.global_tractions)?;
        global_swings[..groups].fill(0.0);
        global_tractions[..groups].fill(0.0);
        for i in 0..n {
            global_swings[i / chunk] += mass[i] * swings[i];
            global_tractions[i / chunk] += mass[i] * tractions[i];
        }
        let total_swing: f32 = global_swings[..groups].iter().sum();
        let total_traction: f32 = global_tractions[..groups].iter().sum();
        let speed = self
            .load::<GlobalSpeed>(a.global_speed)?
            .first()
            .copied()
            .unwrap_or_default()
            .adapt(total_swing, total_traction, a.num_bodies, a.jitter_tolerance);

        let mut cells = Cells {
            x: &mut x,
            y: &mut y,
            mass: &mut mass,
            children: &mut children,
        };
        quadtree::init_root(&mut cells, &mut start, root, &bounds);
        let step = self.scalar_i32(a.step)?;

        self.store(a.x_mins, &x_mins)?;
        self.store(a.x_maxs, &x_maxs)?;
        self.store(a.y_mins, &y_mins)?;
        self.store(a.y_maxs, &y_maxs)?;
        self.store(a.global_swings, &global_swings)?;
        self.store(a.global_tractions, &global_tractions)?;
        self.store(a.global_speed, &[speed])?;
        self.store(a.x_coords, &x)?;
        self.store(a.y_coords, &y)?;
        self.store(a.mass, &mass)?;
        self.store(a.children, &children)?;
        self.store(a.start, &start)?;
        self.store(a.radius, &[radius])?;
        self.store(a.bottom, &[root as i32])?;
        self.store(a.max_depth, &[1i32])?;
        self.store(a.blocked, &[0i32])?;
        self.store(a.step, &[step.wrapping_add(1)])?;
        trace!(radius, speed = speed.speed, "bound box");
        Ok(())
    }

    fn build_tree(&mut self, a: &BuildTreeArgs) -> Result<()> {
        let n = a.num_bodies as usize;
        let root = a.num_nodes as usize;
        let mut x = self.load::<f32>(a.x_coords)?;
        let mut y = self.load::<f32>(a.y_coords)?;
        let mut mass = self.load::<f32>(a.mass)?;
        let mut children = self.load::<i32>(a.children)?;
        let mut start = self.load::<i32>(a.start)?;
        let radius = self.load::<f32>(a.radius)?.first().copied().unwrap_or(0.0);

        let mut cells = Cells {
            x: &mut x,
            y: &mut y,
            mass: &mut mass,
            children: &mut children,
        };
        let outcome = quadtree::build_tree(&mut cells, &mut start, n, root, radius)
            .map_err(|message| SimError::kernel(KernelId::BuildTree, message))?;

        self.store(a.x_coords, &x)?;
        self.store(a.y_coords, &y)?;
        self.store(a.mass, &mass)?;
        self.store(a.children, &children)?;
        self.store(a.start, &start)?;
        self.store(a.bottom, &[outcome.bottom])?;
        self.store(a.max_depth, &[outcome.max_depth])?;
        self.store(a.blocked, &[outcome.inserted as i32])?;
        trace!(bottom = outcome.bottom, max_depth = outcome.max_depth, "tree built");
        Ok(())
    }

    fn compute_sums(&mut self, a: &ComputeSumsArgs) -> Result<()> {
        let n = a.num_bodies as usize;
        let root = a.num_nodes as usize;
        let bottom = self.tree_bottom(a.bottom, n, root, KernelId::ComputeSums)?;
        let mut x = self.load::<f32>(a.x_coords)?;
        let mut y = self.load::<f32>(a.y_coords)?;
        let mut mass = self.load::<f32>(a.mass)?;
        let mut children = self.load::<i32>(a.children)?;
        let mut count = self.load::<i32>(a.count)?;

        let mut cells = Cells {
            x: &mut x,
            y: &mut y,
            mass: &mut mass,
            children: &mut children,
        };
        quadtree::compute_sums(&mut cells, &mut count, n, bottom, root);

        self.store(a.x_coords, &x)?;
        self.store(a.y_coords, &y)?;
        self.store(a.mass, &mass)?;
        self.store(a.count, &count)
    }

    fn sort(&mut self, a: &SortArgs) -> Result<()> {
        let n = a.num_bodies as usize;
        let root = a.num_nodes as usize;
        let bottom = self.tree_bottom(a.bottom, n, root, KernelId::Sort)?;
        let children = self.load::<i32>(a.children)?;
        let count = self.load::<i32>(a.count)?;
        let mut start = self.load::<i32>(a.start)?;
        let mut sort = self.load::<i32>(a.sort)?;

        quadtree::sort_bodies(&children, &mut start, &mut sort, &count, n, bottom, root);

        self.store(a.start, &start)?;
        self.store(a.sort, &sort)
    }

    fn tree_bottom(&self, handle: BufferHandle, n: usize, root: usize, kernel: KernelId) -> Result<usize> {
        let bottom = self.scalar_i32(handle)?;
        if bottom < n as i32 || bottom as usize > root {
            return Err(SimError::kernel(kernel, format!("bottom {bottom} outside the cell range")));
        }
        Ok(bottom as usize)
    }

    fn calculate_forces(&mut self, a: &CalculateForcesArgs) -> Result<()> {
        let n = a.num_bodies as usize;
        let x = self.load::<f32>(a.x_coords)?;
        let y = self.load::<f32>(a.y_coords)?;
        let mass = self.load::<f32>(a.mass)?;
        let children = self.load::<i32>(a.children)?;
        let sort = self.load::<i32>(a.sort)?;
        let radius = self.load::<f32>(a.radius)?.first().copied().unwrap_or(0.0);
        let sizes = self.load::<f32>(a.point_sizes)?;
        let mut forces = vec![0.0f32; n * 2];

        let params = &a.params;
        let opening = quadtree::opening_table(radius, params.tau);
        let tree = TreeView {
            x: &x,
            y: &y,
            mass: &mass,
            children: &children,
            num_bodies: n,
            root: a.num_nodes as usize,
        };
        let sizes = &sizes[..n];
        for &body in &sort[..n] {
            let i = body as usize;
            if i >= n {
                return Err(SimError::kernel(KernelId::CalculateForces, "sort permutation is incomplete"));
            }
            let f = quadtree::tree_repulsion(&tree, i, &opening, params, sizes);
            let g = fa2::gravity(params, mass[i], x[i], y[i]);
            forces[2 * i] = f[0] + g[0];
            forces[2 * i + 1] = f[1] + g[1];
        }

        for adjacency in [&a.forward, &a.backward] {
            self.accumulate_attraction(adjacency, n, &x, &y, &mass, sizes, params, &mut forces)?;
        }

        self.store(a.point_forces, &forces)
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate_attraction(
        &self,
        adjacency: &AdjacencyArgs,
        n: usize,
        x: &[f32],
        y: &[f32],
        mass: &[f32],
        sizes: &[f32],
        params: &fa2::ForceParams,
        forces: &mut [f32],
    ) -> Result<()> {
        if adjacency.edge_count == 0 {
            return Ok(());
        }
        let edges = self.load::<u32>(adjacency.edges)?;
        let work_items = self.load::<u32>(adjacency.work_items)?;
        let weights = self.load::<f32>(adjacency.weights)?;
        for item in work_items[..n * 4].chunks_exact(4) {
            let (first, count, i) = (item[0] as usize, item[1] as usize, item[2] as usize);
            for e in first..first + count {
                let j = edges[2 * e + 1] as usize;
                let f = fa2::attraction(
                    params,
                    mass[i],
                    weights[e],
                    x[j] - x[i],
                    y[j] - y[i],
                    Some(sizes[i] + sizes[j]),
                );
                forces[2 * i] += f[0];
                forces[2 * i + 1] += f[1];
            }
        }
        Ok(())
    }

    fn integrate(&mut self, a: &IntegrateArgs) -> Result<()> {
        let n = a.num_points as usize;
        let mut positions = self.load::<f32>(a.positions)?;
        let forces = self.load::<f32>(a.point_forces)?;
        let mut prev = self.load::<f32>(a.prev_forces)?;
        let mut swings = self.load::<f32>(a.swings)?;
        let mut tractions = self.load::<f32>(a.tractions)?;
        let degrees = self.load::<u32>(a.degrees)?;
        let speed = self
            .load::<GlobalSpeed>(a.global_speed)?
            .first()
            .copied()
            .unwrap_or_default();

        for i in 0..n {
            let force = [forces[2 * i], forces[2 * i + 1]];
            let (swing, traction) =
                fa2::swing_traction(degrees[i] as f32 + 1.0, force, [prev[2 * i], prev[2 * i + 1]]);
            swings[i] = swing;
            tractions[i] = traction;
            let d = fa2::displacement(speed.speed, swing, force, a.adjust_sizes);
            positions[2 * i] += d[0];
            positions[2 * i + 1] += d[1];
            prev[2 * i] = force[0];
            prev[2 * i + 1] = force[1];
        }

        self.store(a.positions, &positions)?;
        self.store(a.prev_forces, &prev)?;
        self.store(a.swings, &swings)?;
        self.store(a.tractions, &tractions)
    }

    fn move_nodes(&mut self, a: &MoveNodesArgs) -> Result<()> {
        let n = a.num_points as usize;
        let mut positions = self.load::<f32>(a.positions)?;
        let selection = self.load::<u32>(a.selection)?;
        for (point, &selected) in positions.chunks_exact_mut(2).zip(&selection[..n]) {
            if selected != 0 {
                point[0] += a.delta[0];
                point[1] += a.delta[1];
            }
        }
        self.store(a.positions, &positions)
    }

    fn select_nodes(&mut self, a: &SelectNodesArgs) -> Result<()> {
        let positions = self.load::<f32>(a.positions)?;
        let selection: Vec<u32> = positions[..a.num_points as usize * 2]
            .chunks_exact(2)
            .map(|p| u32::from(a.region.contains(p[0], p[1])))
            .collect();
        self.store(a.selection, &selection)
    }
}

impl ComputeDevice for CpuDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn create_buffer(&mut self, label: &str, byte_len: u64) -> Result<BufferHandle> {
        if let Some(limit) = self.memory_limit {
            if self.allocated + byte_len > limit {
                return Err(SimError::Allocation {
                    label: label.to_string(),
                    bytes: byte_len,
                    message: format!("{} of {limit} bytes in use", self.allocated),
                });
            }
        }
        if byte_len > self.properties.max_buffer_size {
            return Err(SimError::Allocation {
                label: label.to_string(),
                bytes: byte_len,
                message: "exceeds the maximum buffer size".to_string(),
            });
        }
        let handle = BufferHandle::new(self.next_id);
        self.next_id += 1;
        self.buffers.insert(
            handle,
            HostBuffer {
                words: vec![0; byte_len.div_ceil(4) as usize],
                byte_len,
            },
        );
        self.allocated += byte_len;
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or(SimError::UnknownHandle(buffer))?;
        let end = offset + data.len() as u64;
        if end > target.byte_len {
            return Err(SimError::invalid(format!(
                "write of {} bytes at {offset} overruns a {} byte buffer",
                data.len(),
                target.byte_len
            )));
        }
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut target.words);
        bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    async fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>> {
        let source = self.buffer(buffer)?;
        let bytes: &[u8] = bytemuck::cast_slice(&source.words);
        Ok(bytes[..source.byte_len as usize].to_vec())
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let released = self
            .buffers
            .remove(&buffer)
            .ok_or(SimError::UnknownHandle(buffer))?;
        self.allocated -= released.byte_len;
        Ok(())
    }

    async fn dispatch(&mut self, call: KernelCall) -> Result<()> {
        let kernel = call.kernel();
        let stale = call
            .args
            .requirements()
            .into_iter()
            .map(|r| r.buffer)
            .chain(call.dependencies.iter().copied())
            .find(|handle| !self.buffers.contains_key(handle));
        if let Some(handle) = stale {
            return Err(SimError::kernel(
                kernel,
                format!("buffer handle {} is no longer live", handle.id()),
            ));
        }

        debug!(%kernel, groups = call.geometry.work_groups(), "cpu dispatch");
        let result = self.run(&call.args, call.geometry.work_groups());
        result.map_err(|e| match e {
            e @ SimError::KernelExecution { .. } => e,
            other => SimError::kernel(kernel, other.to_string()),
        })
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn live_buffers(&self) -> Vec<BufferHandle> {
        let mut handles: Vec<_> = self.buffers.keys().copied().collect();
        handles.sort();
        handles
    }
}
