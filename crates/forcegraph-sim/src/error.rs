//! Error types for simulation operations.

use thiserror::Error;

use crate::device::BufferHandle;
use crate::kernels::KernelId;
use crate::registry::BufferName;

/// Errors that can occur while preparing or running a simulation.
#[derive(Error, Debug)]
pub enum SimError {
    /// Input data was rejected before any device work was done.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A registry lookup named a buffer that is not allocated.
    #[error("buffer not found: {0}")]
    BufferNotFound(BufferName),

    /// A device handle is unknown to the device that was asked about it.
    #[error("unknown buffer handle {0:?}")]
    UnknownHandle(BufferHandle),

    /// The device refused an allocation.
    #[error("allocation of {label} ({bytes} bytes) failed: {message}")]
    Allocation {
        label: String,
        bytes: u64,
        message: String,
    },

    /// Kernel arguments failed validation when they were bound.
    #[error("invalid binding for {kernel}: {message}")]
    Binding { kernel: KernelId, message: String },

    /// A dispatched kernel failed on the device.
    #[error("kernel {kernel} failed: {message}")]
    KernelExecution { kernel: KernelId, message: String },

    /// Another tick holds the simulator.
    #[error("a tick is already in flight")]
    TickInFlight,

    /// Operation needs points that have not been set yet.
    #[error("simulator not initialized")]
    NotInitialized,

    /// Failed to initialize GPU device.
    #[error("GPU initialization failed: {0}")]
    GpuInit(String),

    /// Failed to read back data from the device.
    #[error("readback failed: {0}")]
    Readback(String),
}

impl SimError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn kernel(kernel: KernelId, message: impl Into<String>) -> Self {
        Self::KernelExecution {
            kernel,
            message: message.into(),
        }
    }

    pub(crate) fn binding(kernel: KernelId, message: impl Into<String>) -> Self {
        Self::Binding {
            kernel,
            message: message.into(),
        }
    }
}
