//! KV-cache sizing: per-token block bytes and the shared memory budget
//!
//! Two pure computations, kept free of any device access so they can be
//! unit-tested by injecting the free-memory reading:
//!
//! - [`CacheBlockBytes::derive`] turns model shape + parallelism degree into
//!   the per-token byte cost of the cache payload and its quantization-scale
//!   side table.
//! - [`CacheBudget::compute`] splits one device's free memory proportionally
//!   between the two regions and converts it into the token count every
//!   device will allocate.

use crate::config::ModelConfig;
use crate::{Error, Result};

/// Byte size of one scale entry (f16).
const SCALE_ELEM_BYTES: u64 = 2;

/// Payload element size for a supported cache quantization bit-width.
///
/// Closed set: `0` stores f16 payloads, `8` stores int8 payloads.
///
/// # Errors
/// Returns [`Error::UnsupportedCacheQuantBits`] for any other width.
pub fn cache_elem_bytes(cache_quant_bits: u32) -> Result<u64> {
    match cache_quant_bits {
        0 => Ok(2),
        8 => Ok(1),
        other => Err(Error::UnsupportedCacheQuantBits(other)),
    }
}

/// Per-token byte cost of the KV cache, split into payload and scale parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBlockBytes {
    /// Bytes per token for the cache payload.
    pub cache: u64,
    /// Bytes per token for the quantization-scale side table
    /// (0 when the cache is not quantized).
    pub scale: u64,
}

impl CacheBlockBytes {
    /// Derive the per-token byte costs from the model shape and the
    /// tensor-parallel degree.
    ///
    /// Computed as the running product
    /// `num_layers * 2 * num_kv_heads / tp * hidden_dim / num_heads`,
    /// scaled by the element size. Each division truncates the accumulated
    /// product in place, so the result is not the per-device head count
    /// times the head dimension when the divisions do not land evenly.
    ///
    /// # Errors
    /// Returns an error for an unsupported quantization bit-width, a
    /// zero divisor in the shape, or when the shape/parallelism combination
    /// yields a zero-byte block.
    pub fn derive(model: &ModelConfig, tensor_parallel_size: usize) -> Result<Self> {
        let elem_bytes = cache_elem_bytes(model.cache_quant_bits)?;
        let tp = tensor_parallel_size as u64;
        if tp == 0 {
            return Err(Error::InvalidConfig(
                "tensor_parallel_size must be at least 1".into(),
            ));
        }
        if model.num_heads == 0 {
            return Err(Error::InvalidConfig("num_heads must be at least 1".into()));
        }
        if model.cache_quant_bits > 0 && model.cache_quant_group == 0 {
            return Err(Error::InvalidConfig(
                "cache_quant_group must be at least 1 when the cache is quantized".into(),
            ));
        }

        let cache = model.num_layers * 2 * model.num_kv_heads / tp * model.hidden_dim
            / model.num_heads
            * elem_bytes;
        if cache == 0 {
            return Err(Error::InvalidConfig(format!(
                "kv cache block bytes derived to zero \
                 (num_kv_heads {} / tensor_parallel_size {tp})",
                model.num_kv_heads
            )));
        }

        let scale = if model.cache_quant_bits > 0 {
            model.num_layers * 2 * model.num_kv_heads / tp * model.hidden_dim / model.num_heads
                / model.cache_quant_group
                * SCALE_ELEM_BYTES
        } else {
            0
        };

        Ok(Self { cache, scale })
    }

    /// Total bytes one token occupies across both regions.
    #[must_use]
    pub fn per_token(self) -> u64 {
        self.cache + self.scale
    }
}

/// The memory budget computed once by the coordinator worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    /// Bytes reserved for the cache payload region.
    pub cache_bytes: u64,
    /// Bytes reserved for the scale region.
    pub scale_bytes: u64,
    /// Number of token slots every device will allocate.
    pub max_tokens: u64,
}

impl CacheBudget {
    /// Split `max_tokens_scale * free_bytes` proportionally between payload
    /// and scale regions so the token budget consumes both fully.
    ///
    /// Deterministic given its inputs; the caller injects the free-memory
    /// reading.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compute(free_bytes: u64, max_tokens_scale: f32, block: CacheBlockBytes) -> Self {
        let eligible = f64::from(max_tokens_scale) * free_bytes as f64;
        let per_token = block.per_token() as f64;

        let cache_bytes = (eligible * block.cache as f64 / per_token) as u64;
        let scale_bytes = (eligible * block.scale as f64 / per_token) as u64;
        let max_tokens = cache_bytes / block.cache;

        Self {
            cache_bytes,
            scale_bytes,
            max_tokens,
        }
    }
}
