//! Barnes-Hut force-directed graph layout on compute devices.
//!
//! This crate drives a ForceAtlas2 layout whose repulsion is approximated
//! with a Barnes-Hut quadtree built on the device every tick. It owns the
//! device buffers of a dataset, sizes the tree and the kernel dispatches for
//! the device it runs on, and schedules the kernel pipeline tick by tick.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Host Side                            │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  Simulator  │───▶│   Buffer    │───▶│  Work-size  │      │
//! │  │ (set/tick)  │    │  Registry   │    │ Calculator  │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ ComputeDevice
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Device Side                           │
//! │  to_barnes_layout ─▶ bound_box ─▶ build_tree ─▶ compute_sums│
//! │        ─▶ sort ─▶ calculate_forces ─▶ integrate             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Back                              │
//! │  Positions and buffer versions for renderers and queries    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two devices implement [`ComputeDevice`]: [`WgpuDevice`] runs the WGSL
//! kernels on a GPU and [`CpuDevice`] runs the same buffer contracts on the
//! host.
//!
//! ## Example
//!
//! ```
//! use forcegraph_sim::{CpuDevice, EdgeSet, SimConfig, Simulator, TickOptions};
//!
//! let mut sim = Simulator::new(CpuDevice::new(), SimConfig::default())?;
//! sim.set_points(&[0.0, 0.0, 10.0, 0.0, 0.0, 10.0])?;
//! sim.set_edges(&EdgeSet::from_pairs(3, &[(0, 1), (1, 2)])?)?;
//! let state = pollster::block_on(sim.tick(1, TickOptions::default()))?;
//! assert_eq!(state.point_count, 3);
//! # Ok::<(), forcegraph_sim::SimError>(())
//! ```

mod config;
mod cpu;
mod device;
mod error;
pub mod fa2;
mod gpu;
mod gpu_tree;
mod graph;
pub mod kernels;
mod layout;
mod pipeline;
pub mod quadtree;
mod registry;
mod shaders;
mod simulator;
mod sizes;
mod tree_shaders;

pub use config::{DeviceProfile, ForceAtlas2Config, Locks, SimConfig};
pub use cpu::CpuDevice;
pub use device::{read_typed, BufferHandle, ComputeDevice, DeviceProperties, KernelCall};
pub use error::SimError;
pub use gpu::{GpuContext, WgpuDevice};
pub use graph::{Adjacency, EdgeSet, WORK_ITEM_WORDS};
pub use kernels::{Kernel, KernelArgs, KernelId, Region, StageArgs};
pub use layout::{ForceAtlas2Barnes, LayoutAlgorithm, SimContext, TickOutcome};
pub use pipeline::{BarnesHutPipeline, TreeBuffers};
pub use registry::{BufferDescriptor, BufferName, BufferRegistry, BufferSpec, ElementType, Versions};
pub use simulator::{
    SharedSimulator, Simulator, SimulatorState, TickOptions, DEFAULT_POINT_COLOR, DEFAULT_POINT_SIZE,
};
pub use sizes::{
    compute_sizes, compute_sizes_with_blocks, DispatchGeometry, StageGeometry, TreeSizes, WorkSizes,
    BOUND_BOX_WORK_GROUPS, DEFAULT_BLOCK_COUNT, WORKGROUP_SIZE,
};

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;

/// Coordinates per point in packed position buffers.
pub const POINT_DIMENSIONS: usize = 2;

/// A 2D position.
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}
