//! Parallel per-device resource bring-up
//!
//! [`ResourceManager::init`] runs one initializer per device on the
//! [`WorkerPool`], with all workers sharing a [`Barrier`] and a write-once
//! [`DeviceTable`]. Each worker builds its device's engine and runtime,
//! the device-0 worker computes the shared KV-cache token budget from its
//! own free-memory reading, and after the rendezvous every worker allocates
//! an identically-sized cache region.
//!
//! Shared-state discipline: every table field is written at most once, by a
//! single designated writer (each slot by its own worker, the budget by the
//! coordinator), and read by others only after the barrier. The barrier's
//! release is the only cross-worker ordering edge the protocol needs.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{error, info};

use crate::backend::{build_runtime, Backend, DeviceContextKind};
use crate::barrier::Barrier;
use crate::budget::{CacheBlockBytes, CacheBudget};
use crate::config::{ModelConfig, ModelFormat, QuantMethod, ServerConfig};
use crate::worker_pool::WorkerPool;
use crate::{Error, Result};

/// Per-device engine-side state, published before the rendezvous.
pub struct RuntimeParam<B: Backend> {
    /// Execution stream the engine and i/o context were created on.
    pub stream: B::Stream,
    /// The device's inference engine.
    pub engine: B::Engine,
    /// Device context bound to the runtime's input/output tensors.
    pub input_output_context: B::DeviceContext,
}

/// Per-device runtime-side state, published after the rendezvous.
pub struct ResourceItem<B: Backend> {
    /// The loaded model runtime for this device's slice.
    pub runtime: B::Runtime,
    /// Host-side device context.
    pub host_context: B::DeviceContext,
    /// KV-cache payload region, `kv_cache_max_tokens * block.cache` bytes.
    pub kv_cache_mem: B::Memory,
    /// Quantization-scale region, present only when the cache is quantized.
    pub kv_scale_mem: Option<B::Memory>,
}

// ---------------------------------------------------------------------------
// Shared state table
// ---------------------------------------------------------------------------

/// One slot per device plus the shared token budget.
///
/// Each slot is written exactly once by its own worker; the budget exactly
/// once by the coordinator. Reads happen only after the barrier (workers)
/// or after the join (orchestrator).
struct DeviceTable<B: Backend> {
    params: Vec<Mutex<Option<RuntimeParam<B>>>>,
    items: Vec<Mutex<Option<ResourceItem<B>>>>,
    kv_cache_max_tokens: OnceLock<u64>,
}

impl<B: Backend> DeviceTable<B> {
    fn new(size: usize) -> Self {
        Self {
            params: (0..size).map(|_| Mutex::new(None)).collect(),
            items: (0..size).map(|_| Mutex::new(None)).collect(),
            kv_cache_max_tokens: OnceLock::new(),
        }
    }

    fn publish_param(&self, device: usize, param: RuntimeParam<B>) -> Result<()> {
        let mut slot = self.params[device].lock().unwrap();
        if slot.replace(param).is_some() {
            return Err(Error::Other(format!(
                "runtime param slot {device} written twice"
            )));
        }
        Ok(())
    }

    fn publish_item(&self, device: usize, item: ResourceItem<B>) -> Result<()> {
        let mut slot = self.items[device].lock().unwrap();
        if slot.replace(item).is_some() {
            return Err(Error::Other(format!(
                "resource item slot {device} written twice"
            )));
        }
        Ok(())
    }

    fn publish_max_tokens(&self, max_tokens: u64) -> Result<()> {
        self.kv_cache_max_tokens
            .set(max_tokens)
            .map_err(|_| Error::Other("kv_cache_max_tokens published twice".into()))
    }

    fn max_tokens(&self) -> Result<u64> {
        self.kv_cache_max_tokens
            .get()
            .copied()
            .ok_or_else(|| Error::Other("kv_cache_max_tokens was never published".into()))
    }

    /// Drain every slot, failing if any device left its slot unpopulated.
    fn take_all(&self) -> Result<(Vec<RuntimeParam<B>>, Vec<ResourceItem<B>>)> {
        let params = self
            .params
            .iter()
            .enumerate()
            .map(|(device, slot)| {
                slot.lock().unwrap().take().ok_or_else(|| {
                    Error::Other(format!("device {device} never published its runtime param"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let items = self
            .items
            .iter()
            .enumerate()
            .map(|(device, slot)| {
                slot.lock().unwrap().take().ok_or_else(|| {
                    Error::Other(format!("device {device} never published its resources"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((params, items))
    }
}

// ---------------------------------------------------------------------------
// Per-device init task
// ---------------------------------------------------------------------------

/// Read-only inputs shared by every worker, plus the barrier and table.
struct InitShared<B: Backend> {
    backend: Arc<B>,
    model_dir: PathBuf,
    model_format: ModelFormat,
    quant_method: QuantMethod,
    block_bytes: CacheBlockBytes,
    max_tokens_scale: f32,
    comms: Option<Arc<B::CommGroup>>,
    barrier: Barrier,
    table: DeviceTable<B>,
}

/// State staged before the rendezvous, consumed after it.
struct Staged<B: Backend> {
    runtime: B::Runtime,
    host_context: B::DeviceContext,
}

/// The task each worker runs: steps 1–10 of the init protocol.
fn init_device<B: Backend>(shared: &InitShared<B>, device: usize) -> Result<()> {
    // Every worker reaches the rendezvous exactly once, whether its stage
    // succeeded, failed, or panicked. A worker that skipped the barrier
    // would hang its siblings, so errors are propagated after the release
    // and a panicking backend call arrives from the guard's drop while
    // unwinding.
    let rendezvous = Rendezvous::new(&shared.barrier);
    let staged = stage_device(shared, device);
    rendezvous.arrive();

    finish_device(shared, device, staged?)
}

/// Guarantees exactly one barrier arrival per worker, even when the init
/// task unwinds out of a panicking backend call.
struct Rendezvous<'a> {
    barrier: &'a Barrier,
    arrived: bool,
}

impl<'a> Rendezvous<'a> {
    fn new(barrier: &'a Barrier) -> Self {
        Self {
            barrier,
            arrived: false,
        }
    }

    fn arrive(mut self) {
        self.arrived = true;
        self.barrier.wait();
    }
}

impl Drop for Rendezvous<'_> {
    fn drop(&mut self) {
        if !self.arrived {
            self.barrier.wait();
        }
    }
}

/// Steps before the barrier: bind, stream, engine, contexts, runtime, and
/// (on the coordinator) the shared budget.
fn stage_device<B: Backend>(shared: &InitShared<B>, device: usize) -> Result<Staged<B>> {
    let backend = shared.backend.as_ref();

    backend.bind_device(device)?;

    // The stream stays a local until it moves into the published slot;
    // every early return below releases it.
    let stream = backend.create_stream(device)?;

    let mut engine = backend.create_engine(device, shared.quant_method, &stream)?;
    if let Some(comms) = &shared.comms {
        backend.attach_comm(&mut engine, comms, device)?;
    }
    info!(device, "engine created");

    let io_context = backend.create_io_context(device, &stream)?;
    let host_context = backend.create_host_context()?;

    let path = shared.model_format.shard_path(&shared.model_dir, device);
    info!(device, path = %path.display(), "loading model slice");
    let mut runtime = build_runtime(backend, &engine, shared.model_format, &path)?;
    backend.bind_io_tensors(&mut runtime, &io_context)?;

    shared.table.publish_param(
        device,
        RuntimeParam {
            stream,
            engine,
            input_output_context: io_context,
        },
    )?;

    // The coordinator's free-memory reading fixes the token budget for
    // every device. Its own engine and runtime are already resident at
    // this point, so the reading reflects post-construction free memory.
    if device == 0 {
        let mem = backend.mem_info(device)?;
        let budget = CacheBudget::compute(mem.free, shared.max_tokens_scale, shared.block_bytes);
        info!(
            avail_bytes = mem.free,
            kv_cache_max_bytes = budget.cache_bytes,
            kv_scale_max_bytes = budget.scale_bytes,
            max_tokens = budget.max_tokens,
            "kv cache budget computed"
        );
        shared.table.publish_max_tokens(budget.max_tokens)?;
    }

    Ok(Staged {
        runtime,
        host_context,
    })
}

/// Steps after the barrier: allocate cache regions and publish the slot.
fn finish_device<B: Backend>(
    shared: &InitShared<B>,
    device: usize,
    staged: Staged<B>,
) -> Result<()> {
    let backend = shared.backend.as_ref();
    let max_tokens = shared.table.max_tokens()?;

    let kv_cache_mem = backend.alloc(device, max_tokens * shared.block_bytes.cache)?;
    // A failed scale allocation drops `kv_cache_mem` on the way out.
    let kv_scale_mem = if shared.block_bytes.scale > 0 {
        Some(backend.alloc(device, max_tokens * shared.block_bytes.scale)?)
    } else {
        None
    };

    shared.table.publish_item(
        device,
        ResourceItem {
            runtime: staged.runtime,
            host_context: staged.host_context,
            kv_cache_mem,
            kv_scale_mem,
        },
    )
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the post-initialization state of the whole device group: one
/// [`RuntimeParam`] and [`ResourceItem`] per device, the shared token
/// budget, the sampler, and the worker pool used for later parallel work.
pub struct ResourceManager<B: Backend> {
    backend: Arc<B>,
    block_bytes: CacheBlockBytes,
    kv_cache_max_tokens: u64,
    runtime_params: Vec<RuntimeParam<B>>,
    items: Vec<ResourceItem<B>>,
    sampler: B::Sampler,
    comms: Option<Arc<B::CommGroup>>,
    worker_pool: WorkerPool,
}

impl<B: Backend> ResourceManager<B> {
    /// Bring up every device and build the shared KV cache.
    ///
    /// Initialization is all-or-nothing: any worker failure aborts the
    /// whole call, and dropping the partially-filled table releases every
    /// resource sibling workers had already published.
    ///
    /// # Errors
    /// Returns a configuration error before any device work starts, or the
    /// first per-device failure tagged with its device index.
    pub fn init(
        backend: B,
        model_config: &ModelConfig,
        server_config: &ServerConfig,
    ) -> Result<Self> {
        let tensor_parallel_size = server_config.tensor_parallel_size;
        let block_bytes = CacheBlockBytes::derive(model_config, tensor_parallel_size)?;
        if !(server_config.max_tokens_scale > 0.0 && server_config.max_tokens_scale <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "max_tokens_scale must be in (0, 1], got {}",
                server_config.max_tokens_scale
            )));
        }

        let backend = Arc::new(backend);

        // Communicators are one collective operation across all devices,
        // performed before any worker starts. A single device needs none.
        let comms = if tensor_parallel_size > 1 {
            let group = backend.init_comm_group(tensor_parallel_size)?;
            info!(tensor_parallel_size, "communicator group initialized");
            Some(Arc::new(group))
        } else {
            None
        };

        let worker_pool = WorkerPool::init(tensor_parallel_size)?;

        let shared = Arc::new(InitShared {
            backend: Arc::clone(&backend),
            model_dir: server_config.model_dir.clone(),
            model_format: server_config.model_format,
            quant_method: server_config.quant_method,
            block_bytes,
            max_tokens_scale: server_config.max_tokens_scale,
            comms: comms.clone(),
            barrier: Barrier::new(tensor_parallel_size),
            table: DeviceTable::new(tensor_parallel_size),
        });

        {
            let shared = Arc::clone(&shared);
            if let Err(err) = worker_pool.run_parallel(move |device| init_device(&shared, device)) {
                error!(%err, "device initialization failed");
                return Err(err);
            }
        }

        let kv_cache_max_tokens = shared.table.max_tokens()?;
        let (runtime_params, items) = shared.table.take_all()?;

        let sampler = build_sampler(backend.as_ref(), &items[0].runtime)?;
        info!(kv_cache_max_tokens, "resource manager initialized");

        Ok(Self {
            backend,
            block_bytes,
            kv_cache_max_tokens,
            runtime_params,
            items,
            sampler,
            comms,
            worker_pool,
        })
    }

    /// The backend handle shared with the workers.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Per-token byte costs the cache was sized with.
    #[must_use]
    pub fn block_bytes(&self) -> CacheBlockBytes {
        self.block_bytes
    }

    /// The token budget every device allocated.
    #[must_use]
    pub fn kv_cache_max_tokens(&self) -> u64 {
        self.kv_cache_max_tokens
    }

    /// Engine-side state, one entry per device, indexed by device ordinal.
    #[must_use]
    pub fn runtime_params(&self) -> &[RuntimeParam<B>] {
        &self.runtime_params
    }

    /// Runtime-side state, one entry per device, indexed by device ordinal.
    #[must_use]
    pub fn items(&self) -> &[ResourceItem<B>] {
        &self.items
    }

    /// The sampler bound to device 0's execution stream.
    #[must_use]
    pub fn sampler(&self) -> &B::Sampler {
        &self.sampler
    }

    /// The communicator group, when multi-device parallelism is active.
    #[must_use]
    pub fn comm_group(&self) -> Option<&B::CommGroup> {
        self.comms.as_deref()
    }

    /// The persistent per-device worker pool.
    #[must_use]
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }
}

/// Build the sampler from device 0's runtime: locate the accelerator-kind
/// device context and take its current stream.
fn build_sampler<B: Backend>(backend: &B, runtime: &B::Runtime) -> Result<B::Sampler> {
    let accelerator = (0..backend.context_count(runtime))
        .map(|index| backend.context_at(runtime, index))
        .find(|ctx| backend.context_kind(ctx) == DeviceContextKind::Accelerator)
        .ok_or(Error::NoAcceleratorContext)?;

    let stream = backend.context_stream(accelerator)?;
    backend.create_sampler(stream)
}
