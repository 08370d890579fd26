//! Error types for Fornax

use thiserror::Error;

/// Result type alias using Fornax's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Fornax operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported cache quant bit-width: {0}")]
    UnsupportedCacheQuantBits(u32),

    #[error("unknown/unsupported quant method: {0}")]
    UnsupportedQuantMethod(String),

    #[error("tensor_parallel_size {0} > 1 requires communicator support")]
    CommUnsupported(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device bind failed: {0}")]
    DeviceBind(String),

    #[error("stream creation failed: {0}")]
    StreamCreate(String),

    #[error("engine construction failed: {0}")]
    EngineCreate(String),

    #[error("communicator error: {0}")]
    Comm(String),

    #[error("device context construction failed: {0}")]
    DeviceContext(String),

    #[error("model load failed for [{path}]: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("device memory allocation of {bytes} bytes failed: {reason}")]
    Alloc { bytes: u64, reason: String },

    #[error("no accelerator device context found in runtime")]
    NoAcceleratorContext,

    #[error("sampler construction failed: {0}")]
    Sampler(String),

    #[error("device {device}: {source}")]
    Worker { device: usize, source: Box<Error> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The device index this error is attributed to, if it came out of a
    /// failed per-device worker.
    #[must_use]
    pub fn device(&self) -> Option<usize> {
        match self {
            Self::Worker { device, .. } => Some(*device),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Optional From impls for cudarc error types (enabled by the `cuda` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for Error {
    fn from(e: cudarc::driver::DriverError) -> Self {
        Self::Other(format!("CUDA error: {e}"))
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::nccl::result::NcclError> for Error {
    fn from(e: cudarc::nccl::result::NcclError) -> Self {
        Self::Comm(format!("{e:?}"))
    }
}
