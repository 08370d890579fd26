//! Backend trait seam for the external engine/runtime collaborators
//!
//! The init protocol is generic over [`Backend`]: an implementation wraps
//! the real inference library (engine construction, runtime building,
//! collective communicators, device memory) behind associated types. The
//! protocol itself never touches a device API directly, which is also what
//! makes it testable with an instrumented in-memory backend.
//!
//! # Design notes
//!
//! - **All operations are fallible** and return this crate's [`Result`];
//!   implementations map their library's error codes into [`Error`]
//!   variants naming the failing stage.
//! - **Device contexts are a closed enumeration.** A runtime exposes an
//!   ordered list of contexts, each reporting a [`DeviceContextKind`];
//!   the accelerator-kind context can be asked for its current stream.
//! - **Streams are cheap handles** (`Clone`), matching how the underlying
//!   driver APIs hand them out.

use std::path::Path;

use crate::config::{ModelFormat, QuantMethod};
use crate::Result;

/// What a device context executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceContextKind {
    /// Accelerator-resident context (owns an execution stream).
    Accelerator,
    /// Host-side context.
    Host,
}

/// Free/total memory reading for one device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub free: u64,
    pub total: u64,
}

/// The external inference library, seen through the init protocol's eyes.
///
/// One implementation serves all devices; per-device state lives in the
/// associated types, which the protocol owns and moves into the shared
/// resource table.
pub trait Backend: Send + Sync + Sized + 'static {
    /// Execution stream handle for one device.
    type Stream: Clone + Send;
    /// Inference engine instance bound to one device.
    type Engine: Send;
    /// Loaded model runtime.
    type Runtime: Send;
    /// Input/output or host device context.
    type DeviceContext: Send;
    /// Owned device memory region.
    type Memory: Send;
    /// Communicator handles for the whole device group.
    type CommGroup: Send + Sync;
    /// Token sampler bound to an execution stream.
    type Sampler: Send;
    /// Staged runtime builder for this backend.
    type Builder: RuntimeBuilder<Self>;

    /// Bind the calling thread to `device`.
    fn bind_device(&self, device: usize) -> Result<()>;

    /// Create a dedicated execution stream on `device`.
    fn create_stream(&self, device: usize) -> Result<Self::Stream>;

    /// Initialize one communicator per device as a single collective
    /// operation. Called once, before any worker starts, and only when
    /// `world_size > 1`. Backends without collective support must reject
    /// this with [`Error::CommUnsupported`](crate::Error::CommUnsupported).
    fn init_comm_group(&self, world_size: usize) -> Result<Self::CommGroup>;

    /// Construct the inference engine for `device`.
    fn create_engine(
        &self,
        device: usize,
        quant_method: QuantMethod,
        stream: &Self::Stream,
    ) -> Result<Self::Engine>;

    /// Attach `device`'s communicator handle to its engine.
    fn attach_comm(
        &self,
        engine: &mut Self::Engine,
        comms: &Self::CommGroup,
        device: usize,
    ) -> Result<()>;

    /// Create the input/output device context for `device`.
    fn create_io_context(&self, device: usize, stream: &Self::Stream)
        -> Result<Self::DeviceContext>;

    /// Create a host-side device context.
    fn create_host_context(&self) -> Result<Self::DeviceContext>;

    /// Bind every input and output tensor of `runtime` to `ctx`.
    fn bind_io_tensors(&self, runtime: &mut Self::Runtime, ctx: &Self::DeviceContext)
        -> Result<()>;

    /// Number of device contexts the runtime exposes.
    fn context_count(&self, runtime: &Self::Runtime) -> usize;

    /// The runtime's `index`-th device context.
    fn context_at<'rt>(&self, runtime: &'rt Self::Runtime, index: usize)
        -> &'rt Self::DeviceContext;

    /// Which kind of context this is.
    fn context_kind(&self, ctx: &Self::DeviceContext) -> DeviceContextKind;

    /// Current execution stream of an accelerator context.
    fn context_stream(&self, ctx: &Self::DeviceContext) -> Result<Self::Stream>;

    /// Current free and total memory of `device`.
    fn mem_info(&self, device: usize) -> Result<MemInfo>;

    /// Allocate `bytes` of memory on `device`. The returned region owns the
    /// allocation and releases it on drop.
    fn alloc(&self, device: usize, bytes: u64) -> Result<Self::Memory>;

    /// Construct the sampler on the given execution stream.
    fn create_sampler(&self, stream: Self::Stream) -> Result<Self::Sampler>;
}

/// Staged construction of a [`Backend::Runtime`] from a model slice file.
///
/// Each stage short-circuits on failure, mirroring the underlying library's
/// load → bind engines → preprocess → create pipeline.
pub trait RuntimeBuilder<B: Backend>: Sized {
    /// Parse the model slice at `path` in the given format.
    fn load(backend: &B, format: ModelFormat, path: &Path) -> Result<Self>;

    /// Hand the device engine to the builder.
    fn bind(self, engine: &B::Engine) -> Result<Self>;

    /// Run format preprocessing (graph rewrites, weight placement).
    fn preprocess(self) -> Result<Self>;

    /// Finish construction, producing the runtime.
    fn create_runtime(self) -> Result<B::Runtime>;
}

/// Run the full builder pipeline for one device's model slice.
///
/// # Errors
/// Propagates the first failing stage.
pub fn build_runtime<B: Backend>(
    backend: &B,
    engine: &B::Engine,
    format: ModelFormat,
    path: &Path,
) -> Result<B::Runtime> {
    B::Builder::load(backend, format, path)?
        .bind(engine)?
        .preprocess()?
        .create_runtime()
}
