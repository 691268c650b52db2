//! Shared helpers for the simulator integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use forcegraph_sim::{
    BufferHandle, ComputeDevice, CpuDevice, DeviceProperties, KernelCall, KernelId, SimError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Something the device was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Dispatch(KernelId),
    Finish,
}

/// Kernels of one layout tick, in order.
pub const TICK_KERNELS: [KernelId; 7] = [
    KernelId::ToBarnesLayout,
    KernelId::BoundBox,
    KernelId::BuildTree,
    KernelId::ComputeSums,
    KernelId::Sort,
    KernelId::CalculateForces,
    KernelId::Integrate,
];

/// Reference device that records what it runs.
///
/// It can yield to the executor once per dispatch, which exposes any
/// interleaving of two ticks, and fail a chosen kernel.
pub struct RecordingDevice {
    inner: CpuDevice,
    events: Rc<RefCell<Vec<Event>>>,
    yield_per_dispatch: bool,
    fail_at: Option<KernelId>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::wrap(CpuDevice::new())
    }

    pub fn wrap(inner: CpuDevice) -> Self {
        Self {
            inner,
            events: Rc::new(RefCell::new(Vec::new())),
            yield_per_dispatch: false,
            fail_at: None,
        }
    }

    pub fn yielding(mut self) -> Self {
        self.yield_per_dispatch = true;
        self
    }

    pub fn set_fail_at(&mut self, kernel: Option<KernelId>) {
        self.fail_at = kernel;
    }

    /// Shared view of the event log; stays valid after the device is moved.
    pub fn log(&self) -> Rc<RefCell<Vec<Event>>> {
        Rc::clone(&self.events)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl ComputeDevice for RecordingDevice {
    fn properties(&self) -> &DeviceProperties {
        self.inner.properties()
    }

    fn create_buffer(&mut self, label: &str, byte_len: u64) -> forcegraph_sim::Result<BufferHandle> {
        self.inner.create_buffer(label, byte_len)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> forcegraph_sim::Result<()> {
        self.inner.write_buffer(buffer, offset, data)
    }

    async fn read_buffer(&mut self, buffer: BufferHandle) -> forcegraph_sim::Result<Vec<u8>> {
        self.inner.read_buffer(buffer).await
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> forcegraph_sim::Result<()> {
        self.inner.release_buffer(buffer)
    }

    async fn dispatch(&mut self, call: KernelCall) -> forcegraph_sim::Result<()> {
        let kernel = call.kernel();
        self.events.borrow_mut().push(Event::Dispatch(kernel));
        if self.yield_per_dispatch {
            tokio::task::yield_now().await;
        }
        if self.fail_at == Some(kernel) {
            return Err(SimError::KernelExecution {
                kernel,
                message: "injected failure".into(),
            });
        }
        self.inner.dispatch(call).await
    }

    async fn finish(&mut self) -> forcegraph_sim::Result<()> {
        self.events.borrow_mut().push(Event::Finish);
        self.inner.finish().await
    }

    fn live_buffers(&self) -> Vec<BufferHandle> {
        self.inner.live_buffers()
    }
}

/// `n` points uniformly spread over `[0, extent)²`, packed.
pub fn uniform_points(n: usize, extent: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * 2).map(|_| rng.random_range(0.0..extent)).collect()
}

/// Two gaussian clusters of `per_cluster` points at `(-offset, 0)` and `(offset, 0)`.
pub fn two_clusters(per_cluster: usize, offset: f32, sigma: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(per_cluster * 4);
    for center in [-offset, offset] {
        for _ in 0..per_cluster {
            // Box-Muller
            let u1: f32 = rng.random_range(f32::EPSILON..1.0);
            let u2: f32 = rng.random_range(0.0..1.0);
            let r = (-2.0 * u1.ln()).sqrt() * sigma;
            let theta = std::f32::consts::TAU * u2;
            points.push(center + r * theta.cos());
            points.push(r * theta.sin());
        }
    }
    points
}

/// `count` distinct random pairs over `n` points, without self loops.
pub fn random_pairs(n: u32, count: usize, seed: u64) -> Vec<(u32, u32)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pairs = Vec::with_capacity(count);
    while pairs.len() < count {
        let source = rng.random_range(0..n);
        let target = rng.random_range(0..n);
        if source != target && !pairs.contains(&(source, target)) {
            pairs.push((source, target));
        }
    }
    pairs
}

/// A `side × side` grid with `spacing` between neighbors, packed.
pub fn grid(side: usize, spacing: f32) -> Vec<f32> {
    let mut points = Vec::with_capacity(side * side * 2);
    for row in 0..side {
        for col in 0..side {
            points.push(col as f32 * spacing);
            points.push(row as f32 * spacing);
        }
    }
    points
}
