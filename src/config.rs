//! Model and server configuration
//!
//! [`ModelConfig`] describes the shape of the model being served and is
//! parsed from the model directory's `config.json`. [`ServerConfig`] carries
//! the deployment knobs (parallelism degree, cache sizing fraction, quant
//! method). Both are read once at startup and shared read-only with every
//! device worker.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::{Error, Result};

/// Model shape configuration, parsed from the model's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer layers
    pub num_layers: u64,

    /// Number of attention heads
    pub num_heads: u64,

    /// Number of key-value heads (GQA)
    pub num_kv_heads: u64,

    /// Hidden dimension size
    pub hidden_dim: u64,

    /// KV cache quantization bit-width (0 = no quantization)
    #[serde(default)]
    pub cache_quant_bits: u32,

    /// KV cache quantization group size (elements per scale entry)
    #[serde(default = "default_cache_quant_group")]
    pub cache_quant_group: u64,
}

fn default_cache_quant_group() -> u64 {
    8
}

impl ModelConfig {
    /// Load the model configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Serving configuration for the resource bring-up.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Directory holding one `model_slice_{i}` subdirectory per device
    pub model_dir: PathBuf,

    /// On-disk format of each model slice
    #[serde(default)]
    pub model_format: ModelFormat,

    /// Number of devices the model is sharded across
    pub tensor_parallel_size: usize,

    /// Fraction (0, 1] of free device memory eligible for the KV cache
    pub max_tokens_scale: f32,

    /// Weight quantization method handed to the engine
    #[serde(default)]
    pub quant_method: QuantMethod,
}

/// Weight quantization methods the engine accepts.
///
/// Closed set: anything else is a configuration error rejected before any
/// device or engine work begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantMethod {
    /// No weight quantization
    #[default]
    None,
    /// Online int8 x int8 quantization
    OnlineI8i8,
}

impl FromStr for QuantMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "online_i8i8" => Ok(Self::OnlineI8i8),
            other => Err(Error::UnsupportedQuantMethod(other.to_string())),
        }
    }
}

/// On-disk model slice format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// ONNX graph format
    #[default]
    Onnx,
    /// PMX native format
    Pmx,
}

impl ModelFormat {
    /// File extension for this format.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Onnx => "onnx",
            Self::Pmx => "pmx",
        }
    }

    /// Path of one device's model slice.
    ///
    /// Fixed naming scheme assumed by every worker:
    /// `{model_dir}/model_slice_{device}/model.{ext}`.
    #[must_use]
    pub fn shard_path(self, model_dir: &Path, device: usize) -> PathBuf {
        model_dir
            .join(format!("model_slice_{device}"))
            .join(format!("model.{}", self.extension()))
    }
}
