//! Decoding parameters and backend selection

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

use crate::models::DevicePreference;

/// Upper bound on `max_tokens` accepted per request
pub const MAX_TOKENS_LIMIT: usize = 1000;

/// Upper bound on `temperature` accepted per request
pub const MAX_TEMPERATURE: f32 = 2.0;

/// Which generation strategy backs the model handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process decoding with Candle
    #[default]
    Candle,
    /// External generation tool invoked per request
    Subprocess,
    /// Deterministic stand-in, no model weights
    Mock,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "candle" | "in-process" => Ok(Self::Candle),
            "subprocess" | "process" | "mlx" => Ok(Self::Subprocess),
            "mock" => Ok(Self::Mock),
            _ => Err(anyhow::anyhow!(
                "Invalid backend: {}. Valid options: candle, subprocess, mock",
                s
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candle => write!(f, "candle"),
            Self::Subprocess => write!(f, "subprocess"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Configuration for loading one in-process decoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// HuggingFace model ID or local path
    pub model_id: String,

    /// LoRA adapter directory merged into the base weights
    pub adapter_path: Option<PathBuf>,

    /// Device preference (auto, cuda, metal, cpu)
    pub device: DevicePreference,

    /// Model data type ("f32", "f16", "bf16")
    pub dtype: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model_id: "deepseek-ai/deepseek-coder-1.3b-instruct".to_string(),
            adapter_path: None,
            device: DevicePreference::Auto,
            dtype: "f32".to_string(),
        }
    }
}

impl GeneratorConfig {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_adapter(mut self, path: impl Into<PathBuf>) -> Self {
        self.adapter_path = Some(path.into());
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_dtype(mut self, dtype: &str) -> Self {
        self.dtype = dtype.to_string();
        self
    }
}

/// Sampling parameters for text generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature (0.0 = greedy, higher = more random)
    pub temperature: f32,

    /// Nucleus sampling threshold, 1.0 disables it
    pub top_p: f32,

    /// Top-k sampling (0 = disabled)
    pub top_k: usize,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Maximum new tokens to generate
    pub max_new_tokens: usize,

    /// Generation stops when any of these is produced
    pub stop_sequences: Vec<String>,

    /// Sampler seed
    pub seed: u64,

    /// Backends abandon decoding once this instant passes
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            max_new_tokens: 400,
            stop_sequences: vec![],
            seed: 42,
            deadline: None,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding parameters (deterministic)
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            top_k: 0,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    pub fn with_max_new_tokens(mut self, max_tokens: usize) -> Self {
        self.max_new_tokens = max_tokens;
        self
    }

    pub fn with_stop_sequences(mut self, sequences: Vec<String>) -> Self {
        self.stop_sequences = sequences;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cut `text` before the earliest stop sequence it contains
    pub fn truncate_at_stop<'a>(&self, text: &'a str) -> &'a str {
        self.stop_sequences
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| text.find(s.as_str()))
            .min()
            .map_or(text, |end| &text[..end])
    }

    /// True when decoding is greedy and therefore reproducible
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}
