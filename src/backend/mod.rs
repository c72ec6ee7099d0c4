//! Generation backends
//!
//! Every model handle wraps a [`TextGenerator`]. Three strategies exist:
//!
//! - [`CandleGenerator`] decodes in-process, merging a LoRA adapter into the
//!   base weights for the fine-tuned variant
//! - [`SubprocessGenerator`] invokes an external generation CLI per request
//! - [`MockGenerator`] produces deterministic filler without weights
//!
//! [`generate`] is the single adapter the request handler calls: it checks
//! the request parameters and turns any backend error into
//! [`HarnessError::GenerationFailure`].

pub mod candle;
pub mod config;
pub mod mock;
pub mod subprocess;

pub use candle::CandleGenerator;
pub use config::{BackendKind, GeneratorConfig, SamplingParams, MAX_TEMPERATURE, MAX_TOKENS_LIMIT};
pub use mock::MockGenerator;
pub use subprocess::SubprocessGenerator;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::registry::ModelHandle;

/// Trait for text generation
///
/// Implementations must be callable from several threads; the comparison
/// path runs both variants concurrently.
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `prompt`
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String>;

    /// Name of the underlying model (and adapter, if any)
    fn model_name(&self) -> &str;
}

/// Reject empty or whitespace-only prompts
pub fn validate_prompt(prompt: &str) -> HarnessResult<()> {
    if prompt.trim().is_empty() {
        return Err(HarnessError::InvalidRequest(
            "prompt must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Reject decoding parameters outside the supported ranges
pub fn validate_parameters(max_tokens: usize, temperature: f32) -> HarnessResult<()> {
    if max_tokens == 0 || max_tokens > MAX_TOKENS_LIMIT {
        return Err(HarnessError::InvalidRequest(format!(
            "max_tokens must be between 1 and {}, got {}",
            MAX_TOKENS_LIMIT, max_tokens
        )));
    }
    if !temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
        return Err(HarnessError::InvalidRequest(format!(
            "temperature must be between 0 and {}, got {}",
            MAX_TEMPERATURE, temperature
        )));
    }
    Ok(())
}

/// Run one generation against a model handle
///
/// Blocking; callers on an async runtime should move this onto a blocking
/// thread.
pub fn generate(
    handle: &ModelHandle,
    prompt: &str,
    max_tokens: usize,
    temperature: f32,
) -> HarnessResult<String> {
    generate_until(handle, prompt, max_tokens, temperature, None)
}

/// [`generate`], with backends told to give up once `deadline` passes
pub fn generate_until(
    handle: &ModelHandle,
    prompt: &str,
    max_tokens: usize,
    temperature: f32,
    deadline: Option<Instant>,
) -> HarnessResult<String> {
    validate_prompt(prompt)?;
    validate_parameters(max_tokens, temperature)?;

    let mut params = handle
        .sampling
        .clone()
        .with_max_new_tokens(max_tokens)
        .with_temperature(temperature);
    params.deadline = deadline;

    handle
        .generator
        .generate(prompt, &params)
        .map(|text| params.truncate_at_stop(&text).to_string())
        .map_err(|e| HarnessError::GenerationFailure(format!("{:#}", e)))
}

/// Build the generator backing one variant
///
/// `adapter` is `None` for the base model and the adapter directory for the
/// fine-tuned one.
pub fn create_generator(
    config: &HarnessConfig,
    adapter: Option<&Path>,
) -> Result<Arc<dyn TextGenerator>> {
    let generator: Arc<dyn TextGenerator> = match config.backend {
        BackendKind::Candle => Arc::new(CandleGenerator::new(&config.generator_config(adapter))?),
        BackendKind::Subprocess => Arc::new(SubprocessGenerator::new(
            config.program.clone(),
            config.model_id.clone(),
            adapter.map(Path::to_path_buf),
            config.timeout(),
        )),
        BackendKind::Mock => {
            let label = match adapter {
                Some(_) => format!("mock:{}:fine-tuned", config.model_id),
                None => format!("mock:{}:base", config.model_id),
            };
            Arc::new(MockGenerator::new(label))
        }
    };

    tracing::info!(
        "Created {} generator for {}",
        config.backend,
        generator.model_name()
    );
    Ok(generator)
}
