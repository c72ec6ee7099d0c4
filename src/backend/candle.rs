//! Candle-based decoder backend
//!
//! Supports Qwen2 and Llama-family (Llama, Mistral, DeepSeek-Coder) decoders.
//! When a LoRA adapter is configured its deltas are merged into the base weights
//! before the model is built.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{
    Cache as LlamaCache, Config as LlamaConfig, Llama, Llama3RopeConfig, Llama3RopeType,
};
use candle_transformers::models::qwen2::{Config as Qwen2Config, ModelForCausalLM as Qwen2Model};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{GeneratorConfig, SamplingParams, TextGenerator};
use crate::models::{select_device, LoraAdapter, ModelLoader, ModelPath, TokenizerWrapper};

/// Supported decoder architectures
enum DecoderModel {
    Qwen2(Qwen2Model),
    Llama(Llama, LlamaConfig),
}

/// In-process text generator backed by Candle
pub struct CandleGenerator {
    /// The KV cache is mutated during a forward pass, so one generation holds the lock
    model: Mutex<DecoderModel>,
    tokenizer: TokenizerWrapper,
    name: String,
    device: Device,
    dtype: DType,
    eos_token_ids: Vec<u32>,
    max_context: usize,
}

impl CandleGenerator {
    /// Load a generator from config
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let device = select_device(config.device)?;
        let dtype = parse_dtype(&config.dtype);

        tracing::info!("Loading generator model: {}", config.model_id);
        tracing::info!("  Device: {:?}", device);
        tracing::info!("  Dtype: {:?}", dtype);

        let loader = ModelLoader::new()?;
        let model_path = loader.load_model_path(&config.model_id)?;
        model_path.validate()?;

        let tokenizer =
            TokenizerWrapper::from_model_path(&model_path).context("Failed to load tokenizer")?;

        let adapter = match &config.adapter_path {
            Some(path) => {
                tracing::info!("  Adapter: {:?}", path);
                Some(LoraAdapter::load(path, &device).context("Failed to load LoRA adapter")?)
            }
            None => None,
        };

        let (config_str, model_config) = model_path.read_config()?;
        let vb = Self::var_builder(&model_path, adapter.as_ref(), dtype, &device)?;
        let model = Self::load_model(&config_str, &model_config, vb)?;

        let mut eos_token_ids = config_eos_ids(&model_config);
        if let Some(id) = tokenizer.eos_token_id() {
            if !eos_token_ids.contains(&id) {
                eos_token_ids.push(id);
            }
        }
        if eos_token_ids.is_empty() {
            tracing::warn!("No EOS token known for {}, generation runs to max_tokens", config.model_id);
        }

        let max_context = model_config["max_position_embeddings"]
            .as_u64()
            .unwrap_or(4096) as usize;

        let name = match &config.adapter_path {
            Some(path) => format!("{}+{}", config.model_id, path.display()),
            None => config.model_id.clone(),
        };

        tracing::info!("Generator loaded: {}", name);

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            name,
            device,
            dtype,
            eos_token_ids,
            max_context,
        })
    }

    /// Memory-map the base weights, or materialize and merge them when adapted
    fn var_builder(
        model_path: &ModelPath,
        adapter: Option<&LoraAdapter>,
        dtype: DType,
        device: &Device,
    ) -> Result<VarBuilder<'static>> {
        match adapter {
            None => unsafe {
                VarBuilder::from_mmaped_safetensors(&model_path.weight_files, dtype, device)
                    .context("Failed to load model weights")
            },
            Some(adapter) => {
                let mut weights: HashMap<String, Tensor> = HashMap::new();
                for file in &model_path.weight_files {
                    let shard = candle_core::safetensors::load(file, device)
                        .with_context(|| format!("Failed to load weights {:?}", file))?;
                    weights.extend(shard);
                }

                let stats = adapter.merge_into(&mut weights)?;
                tracing::info!("{}", stats);

                Ok(VarBuilder::from_tensors(weights, dtype, device))
            }
        }
    }

    fn load_model(
        config_str: &str,
        model_config: &serde_json::Value,
        vb: VarBuilder<'static>,
    ) -> Result<DecoderModel> {
        let arch = model_config["architectures"]
            .get(0)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();

        let model_type = model_config["model_type"]
            .as_str()
            .unwrap_or("")
            .to_lowercase();

        tracing::info!("Detected architecture: {}, model_type: {}", arch, model_type);

        if arch.contains("qwen2") || model_type.contains("qwen2") {
            let qwen_config: Qwen2Config =
                serde_json::from_str(config_str).context("Failed to parse Qwen2 config")?;
            let model = Qwen2Model::new(&qwen_config, vb).context("Failed to create Qwen2 model")?;
            Ok(DecoderModel::Qwen2(model))
        } else if arch.contains("llama")
            || model_type.contains("llama")
            || arch.contains("mistral")
            || model_type.contains("mistral")
        {
            let llama_config = parse_llama_config(model_config)?;
            tracing::info!(
                "Loading Llama-family decoder: hidden={}, layers={}, vocab={}",
                llama_config.hidden_size,
                llama_config.num_hidden_layers,
                llama_config.vocab_size
            );
            let model = Llama::load(vb, &llama_config).context("Failed to create Llama model")?;
            Ok(DecoderModel::Llama(model, llama_config))
        } else {
            anyhow::bail!(
                "Unsupported model architecture: {} / {}. Supported: qwen2, llama, mistral",
                arch,
                model_type
            )
        }
    }

    fn generate_internal(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        let prompt_tokens = self.tokenizer.encode(prompt, true)?;
        let prompt_len = prompt_tokens.len();

        if prompt_len == 0 {
            anyhow::bail!("Empty prompt after tokenization");
        }
        if prompt_len + params.max_new_tokens > self.max_context {
            anyhow::bail!(
                "Prompt of {} tokens plus {} new tokens exceeds the {}-token context",
                prompt_len,
                params.max_new_tokens,
                self.max_context
            );
        }

        let temperature = (params.temperature > 0.0).then_some(params.temperature as f64);
        let top_p = (params.top_p < 1.0).then_some(params.top_p as f64);
        let mut logits_processor = LogitsProcessor::new(params.seed, temperature, top_p);

        let mut model_guard = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("Model lock poisoned: {}", e))?;

        let mut llama_cache = match &mut *model_guard {
            DecoderModel::Qwen2(model) => {
                model.clear_kv_cache();
                None
            }
            DecoderModel::Llama(_, config) => {
                Some(LlamaCache::new(true, self.dtype, config, &self.device)?)
            }
        };

        let mut all_tokens = prompt_tokens;
        let mut pos = 0;

        for step in 0..params.max_new_tokens {
            if params.deadline_passed() {
                anyhow::bail!("Generation abandoned at its deadline after {} tokens", step);
            }

            let context_size = if pos == 0 { all_tokens.len() } else { 1 };
            let start_pos = all_tokens.len() - context_size;
            let input = Tensor::new(&all_tokens[start_pos..], &self.device)?.unsqueeze(0)?;

            let logits = match (&mut *model_guard, llama_cache.as_mut()) {
                (DecoderModel::Qwen2(model), _) => model.forward(&input, pos)?,
                (DecoderModel::Llama(model, _), Some(cache)) => model.forward(&input, pos, cache)?,
                (DecoderModel::Llama(..), None) => anyhow::bail!("Llama cache missing"),
            };
            let logits = last_token_logits(&logits)?;

            let logits = if params.top_k > 0 {
                apply_top_k(&logits, params.top_k)?
            } else {
                logits
            };

            let logits = if params.repetition_penalty != 1.0 {
                apply_repetition_penalty(&logits, &all_tokens, params.repetition_penalty)?
            } else {
                logits
            };

            let next_token = logits_processor.sample(&logits)?;
            all_tokens.push(next_token);
            pos += context_size;

            if self.eos_token_ids.contains(&next_token) {
                tracing::debug!("Generation stopped: EOS token");
                break;
            }

            if !params.stop_sequences.is_empty() {
                let generated = self.tokenizer.decode(&all_tokens[prompt_len..], true)?;
                if params.stop_sequences.iter().any(|s| generated.contains(s)) {
                    tracing::debug!("Generation stopped: stop sequence");
                    break;
                }
            }
        }

        drop(model_guard);

        let output = self.tokenizer.decode(&all_tokens[prompt_len..], true)?;
        Ok(params.truncate_at_stop(&output).trim().to_string())
    }
}

impl TextGenerator for CandleGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        self.generate_internal(prompt, params)
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

fn parse_dtype(dtype: &str) -> DType {
    match dtype {
        "f16" => DType::F16,
        "bf16" => DType::BF16,
        _ => DType::F32,
    }
}

/// `eos_token_id` in config.json may be a single id or a list
fn config_eos_ids(model_config: &serde_json::Value) -> Vec<u32> {
    match &model_config["eos_token_id"] {
        serde_json::Value::Number(n) => n.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
        serde_json::Value::Array(ids) => ids
            .iter()
            .filter_map(|v| v.as_u64())
            .map(|id| id as u32)
            .collect(),
        _ => Vec::new(),
    }
}

/// Parse Llama config from JSON (LlamaConfig doesn't implement Deserialize)
fn parse_llama_config(model_config: &serde_json::Value) -> Result<LlamaConfig> {
    let num_attention_heads = model_config["num_attention_heads"].as_u64().unwrap_or(32) as usize;

    Ok(LlamaConfig {
        hidden_size: model_config["hidden_size"].as_u64().unwrap_or(4096) as usize,
        intermediate_size: model_config["intermediate_size"].as_u64().unwrap_or(11008) as usize,
        vocab_size: model_config["vocab_size"].as_u64().unwrap_or(32000) as usize,
        num_hidden_layers: model_config["num_hidden_layers"].as_u64().unwrap_or(32) as usize,
        num_attention_heads,
        num_key_value_heads: model_config["num_key_value_heads"]
            .as_u64()
            .map(|v| v as usize)
            .unwrap_or(num_attention_heads),
        use_flash_attn: false,
        rms_norm_eps: model_config["rms_norm_eps"].as_f64().unwrap_or(1e-6),
        rope_theta: model_config["rope_theta"].as_f64().unwrap_or(10000.0) as f32,
        bos_token_id: model_config["bos_token_id"].as_u64().map(|v| v as u32),
        eos_token_id: None,
        rope_scaling: parse_rope_scaling(&model_config["rope_scaling"])?,
        max_position_embeddings: model_config["max_position_embeddings"]
            .as_u64()
            .unwrap_or(4096) as usize,
        tie_word_embeddings: model_config["tie_word_embeddings"].as_bool().unwrap_or(false),
    })
}

/// Map `rope_scaling` onto the one form Candle's Llama understands
///
/// Linear scaling (DeepSeek-Coder) divides every rotary frequency by
/// `factor`. The llama3 form does exactly that for every frequency whose
/// wavelength exceeds both cutoffs; with `original_max_position_embeddings`
/// and both freq factors at 1, the cutoffs sit at 1, below the shortest
/// rotary wavelength (2π).
fn parse_rope_scaling(value: &serde_json::Value) -> Result<Option<Llama3RopeConfig>> {
    if value.is_null() {
        return Ok(None);
    }

    let kind = value["rope_type"]
        .as_str()
        .or_else(|| value["type"].as_str())
        .unwrap_or("default");
    let factor = || -> Result<f32> {
        value["factor"]
            .as_f64()
            .map(|f| f as f32)
            .filter(|f| f.is_finite() && *f > 0.0)
            .with_context(|| format!("rope_scaling of type {} needs a positive factor", kind))
    };

    match kind {
        "default" => Ok(None),
        "linear" => {
            let factor = factor()?;
            tracing::info!("Applying linear rope scaling, factor {}", factor);
            Ok(Some(Llama3RopeConfig {
                factor,
                low_freq_factor: 1.0,
                high_freq_factor: 1.0,
                original_max_position_embeddings: 1,
                rope_type: Llama3RopeType::Llama3,
            }))
        }
        "llama3" => Ok(Some(Llama3RopeConfig {
            factor: factor()?,
            low_freq_factor: value["low_freq_factor"].as_f64().unwrap_or(1.0) as f32,
            high_freq_factor: value["high_freq_factor"].as_f64().unwrap_or(4.0) as f32,
            original_max_position_embeddings: value["original_max_position_embeddings"]
                .as_u64()
                .unwrap_or(8192) as usize,
            rope_type: Llama3RopeType::Llama3,
        })),
        other => anyhow::bail!(
            "Unsupported rope_scaling type: {} (supported: linear, llama3)",
            other
        ),
    }
}

/// Reduce `[1, vocab]` or `[1, seq, vocab]` logits to the last position as f32
fn last_token_logits(logits: &Tensor) -> Result<Tensor> {
    let logits = logits.squeeze(0)?;
    let logits = if logits.rank() > 1 {
        logits.get(logits.dim(0)? - 1)?
    } else {
        logits
    };
    Ok(logits.to_dtype(DType::F32)?)
}

/// Keep the k largest logits, mask the rest to -inf
fn apply_top_k(logits: &Tensor, k: usize) -> Result<Tensor> {
    let vocab_size = logits.dim(0)?;
    if k >= vocab_size {
        return Ok(logits.clone());
    }

    let logits_vec: Vec<f32> = logits.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = logits_vec.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut filtered = vec![f32::NEG_INFINITY; vocab_size];
    for (idx, val) in indexed.into_iter().take(k) {
        filtered[idx] = val;
    }

    Ok(Tensor::new(&filtered[..], logits.device())?)
}

/// Penalize every token already present in the sequence
fn apply_repetition_penalty(logits: &Tensor, tokens: &[u32], penalty: f32) -> Result<Tensor> {
    let mut logits_vec: Vec<f32> = logits.to_vec1()?;

    for &token in tokens {
        if let Some(logit) = logits_vec.get_mut(token as usize) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }

    Ok(Tensor::new(&logits_vec[..], logits.device())?)
}
