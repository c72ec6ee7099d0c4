//! LoRA adapter overlays
//!
//! A LoRA adapter stores, for each targeted linear layer, a low-rank pair whose
//! product is a weight delta:
//!
//! ```text
//! W' = W + (B · A) * scaling
//! ```
//!
//! where A ∈ ℝ^(rank × in) projects down and B ∈ ℝ^(out × rank) projects up.
//! The fine-tuned variant is produced by merging every delta into the frozen
//! base weights once at load time, so decoding costs the same as the base model.
//!
//! Two on-disk layouts are understood:
//!
//! - MLX (`adapters.safetensors`, keys `<module>.lora_a` / `<module>.lora_b`,
//!   stored transposed as `(in, rank)` / `(rank, out)`; `adapter_config.json`
//!   carries `lora_parameters.rank` and `lora_parameters.scale`)
//! - PEFT (`adapter_model.safetensors`, keys
//!   `base_model.model.<module>.lora_A.weight` / `.lora_B.weight`;
//!   `adapter_config.json` carries `r` and `lora_alpha`)

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const ADAPTER_CONFIG: &str = "adapter_config.json";
const PEFT_PREFIX: &str = "base_model.model.";

/// LoRA hyper-parameters needed to apply an adapter
#[derive(Debug, Clone, PartialEq)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition
    pub rank: usize,
    /// Scaling numerator (scaling = alpha / rank)
    pub alpha: f32,
    /// Explicit scaling factor, overrides alpha / rank when present
    pub scale: Option<f32>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            scale: None,
        }
    }
}

impl LoraConfig {
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            scale: None,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Get the scaling factor
    pub fn scaling(&self) -> f32 {
        self.scale.unwrap_or(self.alpha / self.rank.max(1) as f32)
    }

    fn from_json(value: &serde_json::Value, format: AdapterFormat) -> Result<Self> {
        match format {
            AdapterFormat::Mlx => {
                let params = &value["lora_parameters"];
                let rank = params["rank"]
                    .as_u64()
                    .ok_or_else(|| anyhow!("adapter config missing lora_parameters.rank"))?
                    as usize;
                let alpha = params["alpha"].as_f64().map(|a| a as f32).unwrap_or(rank as f32);
                let scale = params["scale"].as_f64().map(|s| s as f32);
                Ok(Self { rank, alpha, scale })
            }
            AdapterFormat::Peft => {
                let rank = value["r"]
                    .as_u64()
                    .ok_or_else(|| anyhow!("adapter config missing r"))? as usize;
                let alpha = value["lora_alpha"]
                    .as_f64()
                    .ok_or_else(|| anyhow!("adapter config missing lora_alpha"))?
                    as f32;
                Ok(Self::new(rank, alpha))
            }
        }
    }
}

/// On-disk adapter layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFormat {
    Mlx,
    Peft,
}

/// Which half of a low-rank pair a tensor holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Down,
    Up,
}

impl AdapterFormat {
    pub fn weights_file(&self) -> &'static str {
        match self {
            Self::Mlx => "adapters.safetensors",
            Self::Peft => "adapter_model.safetensors",
        }
    }

    /// Detect the layout of an adapter directory
    pub fn detect(dir: &Path) -> Result<Self> {
        [Self::Mlx, Self::Peft]
            .into_iter()
            .find(|f| dir.join(f.weights_file()).exists())
            .ok_or_else(|| {
                anyhow!(
                    "No adapter weights in {:?} (expected {} or {})",
                    dir,
                    Self::Mlx.weights_file(),
                    Self::Peft.weights_file()
                )
            })
    }

    /// Split a tensor name into (module path, half)
    fn split_key<'a>(&self, name: &'a str) -> Option<(&'a str, Half)> {
        match self {
            Self::Mlx => name
                .strip_suffix(".lora_a")
                .map(|m| (m, Half::Down))
                .or_else(|| name.strip_suffix(".lora_b").map(|m| (m, Half::Up))),
            Self::Peft => {
                let name = name.strip_prefix(PEFT_PREFIX).unwrap_or(name);
                name.strip_suffix(".lora_A.weight")
                    .map(|m| (m, Half::Down))
                    .or_else(|| name.strip_suffix(".lora_B.weight").map(|m| (m, Half::Up)))
            }
        }
    }
}

/// One adapted linear layer, normalized to down `(rank, in)` and up `(out, rank)`
struct LoraLayer {
    target: String,
    down: Tensor,
    up: Tensor,
}

/// A LoRA adapter loaded from disk
pub struct LoraAdapter {
    config: LoraConfig,
    format: AdapterFormat,
    source: PathBuf,
    layers: Vec<LoraLayer>,
}

impl LoraAdapter {
    /// Load an adapter directory onto a device
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let format = AdapterFormat::detect(dir)?;

        let config_path = dir.join(ADAPTER_CONFIG);
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {:?}", config_path))?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).context("Failed to parse adapter config")?;
        let config = LoraConfig::from_json(&value, format)?;

        let weights_path = dir.join(format.weights_file());
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .with_context(|| format!("Failed to load adapter weights {:?}", weights_path))?;

        let mut pairs: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();
        for (name, tensor) in tensors {
            match format.split_key(&name) {
                Some((module, Half::Down)) => {
                    pairs.entry(module.to_string()).or_default().0 = Some(tensor);
                }
                Some((module, Half::Up)) => {
                    pairs.entry(module.to_string()).or_default().1 = Some(tensor);
                }
                None => tracing::warn!("Ignoring non-LoRA adapter tensor: {}", name),
            }
        }

        let layers = pairs
            .into_iter()
            .map(|(module, pair)| -> Result<LoraLayer> {
                let (Some(down), Some(up)) = pair else {
                    anyhow::bail!("Adapter layer {} is missing one of its low-rank halves", module);
                };
                let (down, up) = match format {
                    AdapterFormat::Mlx => (down.t()?.contiguous()?, up.t()?.contiguous()?),
                    AdapterFormat::Peft => (down, up),
                };
                Ok(LoraLayer {
                    target: format!("{}.weight", module),
                    down,
                    up,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if layers.is_empty() {
            anyhow::bail!("Adapter {:?} contains no LoRA layers", weights_path);
        }

        tracing::info!(
            "Loaded {:?} adapter from {:?}: {} layers, rank {}, scaling {}",
            format,
            dir,
            layers.len(),
            config.rank,
            config.scaling()
        );

        Ok(Self {
            config,
            format,
            source: dir.to_path_buf(),
            layers,
        })
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn format(&self) -> AdapterFormat {
        self.format
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Merge every delta into the matching base weight, keeping its dtype
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<LoraStats> {
        let scaling = self.config.scaling() as f64;
        let mut adapter_params = 0;

        for layer in &self.layers {
            let base = weights.get(&layer.target).ok_or_else(|| {
                anyhow!("Adapter targets {} which is not in the base model", layer.target)
            })?;

            let delta = layer
                .up
                .to_dtype(DType::F32)?
                .matmul(&layer.down.to_dtype(DType::F32)?)?;
            let delta = (delta * scaling)?;

            if delta.dims() != base.dims() {
                anyhow::bail!(
                    "Adapter delta for {} has shape {:?}, base weight has {:?}",
                    layer.target,
                    delta.dims(),
                    base.dims()
                );
            }

            let merged = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            weights.insert(layer.target.clone(), merged);

            adapter_params += layer.down.elem_count() + layer.up.elem_count();
        }

        let base_params = weights.values().map(|t| t.elem_count()).sum();
        Ok(LoraStats::new(base_params, adapter_params, self.layers.len()))
    }
}

/// Statistics about a merged adapter
#[derive(Debug, Clone)]
pub struct LoraStats {
    /// Parameters in the base model
    pub total_params: usize,
    /// Parameters carried by the adapter
    pub adapter_params: usize,
    /// Adapter parameters as a percentage of the base model
    pub adapter_percent: f64,
    /// Number of adapted layers
    pub num_lora_layers: usize,
}

impl LoraStats {
    pub fn new(total: usize, adapter: usize, num_layers: usize) -> Self {
        Self {
            total_params: total,
            adapter_params: adapter,
            adapter_percent: if total == 0 {
                0.0
            } else {
                adapter as f64 / total as f64 * 100.0
            },
            num_lora_layers: num_layers,
        }
    }
}

impl std::fmt::Display for LoraStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LoRA: {}/{} params ({:.3}%) merged across {} layers",
            self.adapter_params, self.total_params, self.adapter_percent, self.num_lora_layers
        )
    }
}
