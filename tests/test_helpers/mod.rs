//! Instrumented in-memory backend for exercising the init protocol
//!
//! Simulates the external inference library: deterministic streams,
//! recorded allocations, injectable free-memory readings, and failure
//! injection at the model-load and allocation stages. A live-allocation
//! counter (decremented on drop) lets tests prove that failed
//! initializations release everything.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fornax::{
    Backend, DeviceContextKind, Error, MemInfo, ModelFormat, QuantMethod, Result, RuntimeBuilder,
};

/// Deterministic stream handle for a device.
pub fn stream_id(device: usize) -> u64 {
    1000 + device as u64
}

pub struct MockState {
    pub free_bytes: u64,
    pub comm_supported: bool,
    /// Fail the model load on this device.
    pub fail_load_on: Option<usize>,
    /// Panic (rather than fail) during the model load on this device.
    pub panic_load_on: Option<usize>,
    /// Fail the `nth` (0-based) allocation made on this device.
    pub fail_alloc_on: Option<(usize, usize)>,
    /// Slow down device 0's model load so siblings reach the barrier first.
    pub coordinator_load_delay: Duration,

    pub engines_created: AtomicUsize,
    pub comm_groups_created: AtomicUsize,
    pub samplers_created: AtomicUsize,
    pub mem_queries: Mutex<Vec<usize>>,
    /// `(device, bytes)` per allocation, in request order.
    pub allocs: Mutex<Vec<(usize, u64)>>,
    /// Allocations currently alive (incremented on alloc, decremented on drop).
    pub live_allocs: Arc<AtomicI64>,
    pub loaded_paths: Mutex<Vec<PathBuf>>,
}

#[derive(Clone)]
pub struct MockBackend(pub Arc<MockState>);

impl MockBackend {
    pub fn new(free_bytes: u64) -> Self {
        Self(Arc::new(MockState {
            free_bytes,
            comm_supported: true,
            fail_load_on: None,
            panic_load_on: None,
            fail_alloc_on: None,
            coordinator_load_delay: Duration::ZERO,
            engines_created: AtomicUsize::new(0),
            comm_groups_created: AtomicUsize::new(0),
            samplers_created: AtomicUsize::new(0),
            mem_queries: Mutex::new(Vec::new()),
            allocs: Mutex::new(Vec::new()),
            live_allocs: Arc::new(AtomicI64::new(0)),
            loaded_paths: Mutex::new(Vec::new()),
        }))
    }

    pub fn with_comm_support(mut self, supported: bool) -> Self {
        Arc::get_mut(&mut self.0).unwrap().comm_supported = supported;
        self
    }

    pub fn with_failing_load(mut self, device: usize) -> Self {
        Arc::get_mut(&mut self.0).unwrap().fail_load_on = Some(device);
        self
    }

    pub fn with_panicking_load(mut self, device: usize) -> Self {
        Arc::get_mut(&mut self.0).unwrap().panic_load_on = Some(device);
        self
    }

    pub fn with_failing_alloc(mut self, device: usize, nth: usize) -> Self {
        Arc::get_mut(&mut self.0).unwrap().fail_alloc_on = Some((device, nth));
        self
    }

    pub fn with_coordinator_load_delay(mut self, delay: Duration) -> Self {
        Arc::get_mut(&mut self.0).unwrap().coordinator_load_delay = delay;
        self
    }

    pub fn state(&self) -> &MockState {
        &self.0
    }
}

pub struct MockEngine {
    pub device: usize,
    pub quant_method: QuantMethod,
    pub comm_attached: bool,
}

pub struct MockContext {
    pub kind: DeviceContextKind,
    pub stream: Option<u64>,
}

pub struct MockRuntime {
    pub device: usize,
    pub contexts: Vec<MockContext>,
    pub io_bound: bool,
}

pub struct MockCommGroup {
    pub world_size: usize,
}

pub struct MockSampler {
    pub stream: u64,
}

pub struct MockMemory {
    #[allow(dead_code)]
    pub device: usize,
    #[allow(dead_code)]
    pub bytes: u64,
    live: Arc<AtomicI64>,
}

impl Drop for MockMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Device index encoded in the fixed `model_slice_{i}` path scheme.
fn device_from_path(path: &Path) -> usize {
    path.parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("model_slice_"))
        .and_then(|index| index.parse().ok())
        .expect("shard path should follow the model_slice_{i} scheme")
}

pub struct MockBuilder {
    device: usize,
    bound: bool,
    preprocessed: bool,
}

impl RuntimeBuilder<MockBackend> for MockBuilder {
    fn load(backend: &MockBackend, _format: ModelFormat, path: &Path) -> Result<Self> {
        let device = device_from_path(path);
        let state = backend.state();

        if device == 0 && !state.coordinator_load_delay.is_zero() {
            std::thread::sleep(state.coordinator_load_delay);
        }
        state.loaded_paths.lock().unwrap().push(path.to_path_buf());

        assert!(
            state.panic_load_on != Some(device),
            "injected load panic on device {device}"
        );
        if state.fail_load_on == Some(device) {
            return Err(Error::ModelLoad {
                path: path.display().to_string(),
                reason: "injected load failure".into(),
            });
        }

        Ok(Self {
            device,
            bound: false,
            preprocessed: false,
        })
    }

    fn bind(mut self, engine: &MockEngine) -> Result<Self> {
        assert_eq!(engine.device, self.device, "engine/slice device mismatch");
        self.bound = true;
        Ok(self)
    }

    fn preprocess(mut self) -> Result<Self> {
        assert!(self.bound, "preprocess before bind");
        self.preprocessed = true;
        Ok(self)
    }

    fn create_runtime(self) -> Result<MockRuntime> {
        assert!(self.preprocessed, "create_runtime before preprocess");
        // Host context first so sampler construction has to scan past it.
        Ok(MockRuntime {
            device: self.device,
            contexts: vec![
                MockContext {
                    kind: DeviceContextKind::Host,
                    stream: None,
                },
                MockContext {
                    kind: DeviceContextKind::Accelerator,
                    stream: Some(stream_id(self.device)),
                },
            ],
            io_bound: false,
        })
    }
}

impl Backend for MockBackend {
    type Stream = u64;
    type Engine = MockEngine;
    type Runtime = MockRuntime;
    type DeviceContext = MockContext;
    type Memory = MockMemory;
    type CommGroup = MockCommGroup;
    type Sampler = MockSampler;
    type Builder = MockBuilder;

    fn bind_device(&self, _device: usize) -> Result<()> {
        Ok(())
    }

    fn create_stream(&self, device: usize) -> Result<u64> {
        Ok(stream_id(device))
    }

    fn init_comm_group(&self, world_size: usize) -> Result<MockCommGroup> {
        if !self.state().comm_supported {
            return Err(Error::CommUnsupported(world_size));
        }
        self.state()
            .comm_groups_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(MockCommGroup { world_size })
    }

    fn create_engine(
        &self,
        device: usize,
        quant_method: QuantMethod,
        stream: &u64,
    ) -> Result<MockEngine> {
        assert_eq!(*stream, stream_id(device));
        self.state().engines_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockEngine {
            device,
            quant_method,
            comm_attached: false,
        })
    }

    fn attach_comm(
        &self,
        engine: &mut MockEngine,
        comms: &MockCommGroup,
        device: usize,
    ) -> Result<()> {
        assert_eq!(engine.device, device);
        assert!(device < comms.world_size);
        engine.comm_attached = true;
        Ok(())
    }

    fn create_io_context(&self, _device: usize, stream: &u64) -> Result<MockContext> {
        Ok(MockContext {
            kind: DeviceContextKind::Accelerator,
            stream: Some(*stream),
        })
    }

    fn create_host_context(&self) -> Result<MockContext> {
        Ok(MockContext {
            kind: DeviceContextKind::Host,
            stream: None,
        })
    }

    fn bind_io_tensors(&self, runtime: &mut MockRuntime, ctx: &MockContext) -> Result<()> {
        assert_eq!(ctx.kind, DeviceContextKind::Accelerator);
        runtime.io_bound = true;
        Ok(())
    }

    fn context_count(&self, runtime: &MockRuntime) -> usize {
        runtime.contexts.len()
    }

    fn context_at<'rt>(&self, runtime: &'rt MockRuntime, index: usize) -> &'rt MockContext {
        &runtime.contexts[index]
    }

    fn context_kind(&self, ctx: &MockContext) -> DeviceContextKind {
        ctx.kind
    }

    fn context_stream(&self, ctx: &MockContext) -> Result<u64> {
        ctx.stream
            .ok_or_else(|| Error::DeviceContext("host context has no stream".into()))
    }

    fn mem_info(&self, device: usize) -> Result<MemInfo> {
        self.state().mem_queries.lock().unwrap().push(device);
        Ok(MemInfo {
            free: self.state().free_bytes,
            total: self.state().free_bytes * 2,
        })
    }

    fn alloc(&self, device: usize, bytes: u64) -> Result<MockMemory> {
        let state = self.state();
        let nth_on_device = state
            .allocs
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| *d == device)
            .count();
        if state.fail_alloc_on == Some((device, nth_on_device)) {
            return Err(Error::Alloc {
                bytes,
                reason: "injected allocation failure".into(),
            });
        }

        state.allocs.lock().unwrap().push((device, bytes));
        state.live_allocs.fetch_add(1, Ordering::SeqCst);
        Ok(MockMemory {
            device,
            bytes,
            live: Arc::clone(&state.live_allocs),
        })
    }

    fn create_sampler(&self, stream: u64) -> Result<MockSampler> {
        self.state().samplers_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockSampler { stream })
    }
}
