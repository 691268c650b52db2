//! The compute device seam.
//!
//! Everything the simulator does to device memory goes through
//! [`ComputeDevice`]. Dispatch and readback are asynchronous: the returned
//! future is the completion signal of that piece of device work.

use serde::Serialize;

use crate::kernels::{KernelId, StageArgs};
use crate::sizes::DispatchGeometry;
use crate::Result;

/// Opaque handle of a device buffer. Devices never reuse a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// What the device reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProperties {
    pub name: String,
    pub warp_size: u32,
    pub max_buffer_size: u64,
}

/// One kernel dispatch.
#[derive(Debug, Clone)]
pub struct KernelCall {
    pub args: StageArgs,
    pub geometry: DispatchGeometry,
    /// Buffers that must be finished writing before this dispatch starts.
    pub dependencies: Vec<BufferHandle>,
}

impl KernelCall {
    pub fn kernel(&self) -> KernelId {
        self.args.kernel()
    }
}

/// A device that owns buffers and runs the simulation kernels.
#[allow(async_fn_in_trait)]
pub trait ComputeDevice {
    fn properties(&self) -> &DeviceProperties;

    /// Allocate a zero-filled buffer.
    fn create_buffer(&mut self, label: &str, byte_len: u64) -> Result<BufferHandle>;

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    async fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>>;

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    /// Run one kernel; resolves once its writes are visible to later dispatches.
    async fn dispatch(&mut self, call: KernelCall) -> Result<()>;

    /// Flush the queue.
    async fn finish(&mut self) -> Result<()>;

    fn live_buffers(&self) -> Vec<BufferHandle>;
}

/// Read a buffer back as typed elements.
pub async fn read_typed<D, T>(device: &mut D, buffer: BufferHandle) -> Result<Vec<T>>
where
    D: ComputeDevice,
    T: bytemuck::Pod,
{
    let bytes = device.read_buffer(buffer).await?;
    let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>();
    Ok(bytemuck::pod_collect_to_vec(&bytes[..whole]))
}
