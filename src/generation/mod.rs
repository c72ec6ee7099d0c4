//! Request handling
//!
//! [`GenerationHandler`] turns one request into one [`GenerationResult`]:
//! validate, resolve the handle, run the blocking backend call on a worker
//! thread under the configured timeout, and fold any error into the result.
//! [`ComparisonOrchestrator`] pairs two such calls, one per variant.

pub mod compare;

pub use compare::{ComparisonOrchestrator, ComparisonResult};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{self, validate_parameters, validate_prompt};
use crate::error::{ErrorKind, HarnessError, HarnessResult};
use crate::registry::{ModelRegistry, ModelVariant};

/// One generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub variant: ModelVariant,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        variant: ModelVariant,
        max_tokens: usize,
        temperature: f32,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            variant,
            max_tokens,
            temperature,
        }
    }

    /// Same parameters, different variant
    pub fn for_variant(&self, variant: ModelVariant) -> Self {
        Self {
            variant,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        validate_prompt(&self.prompt)?;
        validate_parameters(self.max_tokens, self.temperature)
    }
}

/// Outcome of one request: generated text or a classified error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationResult {
    Success { text: String },
    Failure { kind: ErrorKind, message: String },
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { text } => Some(text),
            Self::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Text to show in place of the output
    pub fn display_text(&self) -> String {
        match self {
            Self::Success { text } => text.clone(),
            Self::Failure { kind, message } => format!("Error ({}): {}", kind, message),
        }
    }
}

impl From<HarnessError> for GenerationResult {
    fn from(err: HarnessError) -> Self {
        Self::Failure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<HarnessResult<String>> for GenerationResult {
    fn from(result: HarnessResult<String>) -> Self {
        match result {
            Ok(text) => Self::Success { text },
            Err(err) => err.into(),
        }
    }
}

/// Serves single-variant requests against a shared registry
#[derive(Clone)]
pub struct GenerationHandler {
    registry: Arc<ModelRegistry>,
    timeout: Duration,
}

impl GenerationHandler {
    pub fn new(registry: Arc<ModelRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handle one request; never fails, errors are part of the result
    pub async fn handle(&self, request: GenerationRequest) -> GenerationResult {
        let variant = request.variant;
        let started = Instant::now();
        let result = self.run(request).await;

        match &result {
            Ok(text) => tracing::info!(
                "{} generation finished in {:.2}s ({} chars)",
                variant,
                started.elapsed().as_secs_f64(),
                text.len()
            ),
            Err(err) => tracing::warn!("{} generation failed: {}", variant, err),
        }

        result.into()
    }

    async fn run(&self, request: GenerationRequest) -> HarnessResult<String> {
        request.validate()?;
        let handle = self.registry.resolve(request.variant)?;

        tracing::debug!(
            "Dispatching to {} (max_tokens={}, temperature={})",
            handle.model_name(),
            request.max_tokens,
            request.temperature
        );

        // Backends stop decoding at the same deadline the await gives up at
        let deadline = Instant::now() + self.timeout;
        let task = tokio::task::spawn_blocking(move || {
            backend::generate_until(
                &handle,
                &request.prompt,
                request.max_tokens,
                request.temperature,
                Some(deadline),
            )
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HarnessError::GenerationFailure(format!(
                "generation task aborted: {}",
                join_err
            ))),
            Err(_) => Err(HarnessError::GenerationTimeout(self.timeout)),
        }
    }
}
