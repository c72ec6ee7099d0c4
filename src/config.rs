//! Harness configuration
//!
//! Resolved in three layers: built-in defaults, an optional JSON file, then
//! command-line flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{validate_parameters, BackendKind, GeneratorConfig, SamplingParams};
use crate::models::DevicePreference;

/// Base model both variants start from
pub const DEFAULT_MODEL: &str = "deepseek-ai/deepseek-coder-1.3b-instruct";

/// Where the training pipeline writes its LoRA adapter
pub const DEFAULT_ADAPTER: &str = "~/ai/screenpipe/training_pipeline/output/adapters";

pub const DEFAULT_PROGRAM: &str = "mlx_lm.generate";

pub const DEFAULT_TIMEOUT_SECS: f64 = 120.0;

/// Longest accepted per-request timeout, one day
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Generation strategy behind both handles
    pub backend: BackendKind,

    /// HuggingFace model ID or local directory
    pub model_id: String,

    /// LoRA adapter directory for the fine-tuned variant
    pub adapter: PathBuf,

    pub device: DevicePreference,

    /// Weight dtype for in-process decoding
    pub dtype: String,

    /// Executable for the subprocess backend
    pub program: String,

    /// Per-request generation timeout, in seconds
    pub timeout_secs: f64,

    /// Run the two comparison slots concurrently
    pub parallel_compare: bool,

    pub max_tokens: usize,
    pub temperature: f32,
    pub seed: u64,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,

    /// Output is cut at the first of these
    pub stop_sequences: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let sampling = SamplingParams::default();
        Self {
            backend: BackendKind::default(),
            model_id: DEFAULT_MODEL.to_string(),
            adapter: PathBuf::from(DEFAULT_ADAPTER),
            device: DevicePreference::Auto,
            dtype: "f32".to_string(),
            program: DEFAULT_PROGRAM.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            parallel_compare: true,
            max_tokens: sampling.max_new_tokens,
            temperature: sampling.temperature,
            seed: sampling.seed,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            repetition_penalty: sampling.repetition_penalty,
            stop_sequences: sampling.stop_sequences,
        }
    }
}

impl HarnessConfig {
    /// Read a JSON config file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the defaults would be accepted as a request
    pub fn validate(&self) -> Result<()> {
        validate_parameters(self.max_tokens, self.temperature)
            .context("Invalid default decoding parameters")?;
        if !self.timeout_secs.is_finite()
            || self.timeout_secs <= 0.0
            || self.timeout_secs > MAX_TIMEOUT_SECS
        {
            anyhow::bail!(
                "timeout_secs must be in (0, {}], got {}",
                MAX_TIMEOUT_SECS,
                self.timeout_secs
            );
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            anyhow::bail!("top_p must be in (0, 1], got {}", self.top_p);
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            anyhow::bail!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            );
        }
        if self.model_id.trim().is_empty() {
            anyhow::bail!("model_id must not be empty");
        }
        Ok(())
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_model(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    pub fn with_adapter(mut self, path: impl Into<PathBuf>) -> Self {
        self.adapter = path.into();
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_parallel_compare(mut self, parallel: bool) -> Self {
        self.parallel_compare = parallel;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Per-request timeout; out-of-range values fall back to the default
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout_secs.is_finite() && self.timeout_secs > 0.0 {
            self.timeout_secs.min(MAX_TIMEOUT_SECS)
        } else {
            DEFAULT_TIMEOUT_SECS
        };
        Duration::from_secs_f64(secs)
    }

    /// Adapter directory with a leading `~` expanded
    pub fn adapter_path(&self) -> PathBuf {
        expand_home(&self.adapter)
    }

    /// Sampling template shared by both handles
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams::default()
            .with_temperature(self.temperature)
            .with_max_new_tokens(self.max_tokens)
            .with_top_p(self.top_p)
            .with_top_k(self.top_k)
            .with_repetition_penalty(self.repetition_penalty)
            .with_stop_sequences(self.stop_sequences.clone())
            .with_seed(self.seed)
    }

    /// In-process loader settings for one variant
    pub fn generator_config(&self, adapter: Option<&Path>) -> GeneratorConfig {
        let config = GeneratorConfig::new(&self.model_id)
            .with_device(self.device)
            .with_dtype(&self.dtype);
        match adapter {
            Some(path) => config.with_adapter(path),
            None => config,
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
