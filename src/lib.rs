//! Fornax: parallel per-device bring-up for tensor-parallel inference serving
//!
//! This crate coordinates N concurrently-initializing device workers so
//! that every worker builds its device's engine and runtime, exactly one
//! globally-agreed KV-cache budget is computed from the coordinator
//! device's free memory, and every worker then allocates an
//! identically-sized cache region — with correct unwinding if any step
//! fails.
//!
//! The inference engine, runtime builder, collective communicator, and
//! sampler are external collaborators reached through the [`Backend`]
//! trait; implementations wrap the real inference library. The protocol
//! itself is device-agnostic and fully testable with an in-memory backend.
//!
//! # Example
//!
//! ```ignore
//! use fornax::{ModelConfig, ResourceManager, ServerConfig};
//!
//! let model_config = ModelConfig::from_file("models/llama/config.json")?;
//! let server_config = ServerConfig {
//!     model_dir: "models/llama".into(),
//!     model_format: Default::default(),
//!     tensor_parallel_size: 4,
//!     max_tokens_scale: 0.9,
//!     quant_method: Default::default(),
//! };
//!
//! let manager = ResourceManager::init(backend, &model_config, &server_config)?;
//! println!("kv cache tokens: {}", manager.kv_cache_max_tokens());
//! ```

pub mod backend;
pub mod barrier;
pub mod budget;
pub mod config;
pub mod error;
pub mod resource;
pub mod worker_pool;

pub use backend::{build_runtime, Backend, DeviceContextKind, MemInfo, RuntimeBuilder};
pub use barrier::Barrier;
pub use budget::{cache_elem_bytes, CacheBlockBytes, CacheBudget};
pub use config::{ModelConfig, ModelFormat, QuantMethod, ServerConfig};
pub use error::{Error, Result};
pub use resource::{ResourceItem, ResourceManager, RuntimeParam};
pub use worker_pool::WorkerPool;
