//! Side-by-side generation for both variants

use serde::{Deserialize, Serialize};

use super::{GenerationHandler, GenerationRequest, GenerationResult};
use crate::evaluation::OutputDivergence;
use crate::registry::ModelVariant;

/// Both variants' outputs for one request template
///
/// The prompt and decoding parameters are stored once; the two slots can
/// only differ in the variant that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub base: GenerationResult,
    pub fine_tuned: GenerationResult,
    /// Present only when both slots succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence: Option<OutputDivergence>,
}

impl ComparisonResult {
    pub fn slot(&self, variant: ModelVariant) -> &GenerationResult {
        match variant {
            ModelVariant::Base => &self.base,
            ModelVariant::FineTuned => &self.fine_tuned,
        }
    }

    pub fn both_succeeded(&self) -> bool {
        self.base.is_success() && self.fine_tuned.is_success()
    }
}

/// Runs one prompt through both variants
#[derive(Clone)]
pub struct ComparisonOrchestrator {
    handler: GenerationHandler,
    parallel: bool,
}

impl ComparisonOrchestrator {
    pub fn new(handler: GenerationHandler) -> Self {
        Self {
            handler,
            parallel: true,
        }
    }

    /// Dispatch the two variants one after the other instead of concurrently
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn handler(&self) -> &GenerationHandler {
        &self.handler
    }

    pub async fn compare(
        &self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> ComparisonResult {
        let template = GenerationRequest::new(prompt, ModelVariant::Base, max_tokens, temperature);
        let base_request = template.for_variant(ModelVariant::Base);
        let tuned_request = template.for_variant(ModelVariant::FineTuned);

        tracing::info!(
            "Comparing variants ({}, max_tokens={}, temperature={})",
            if self.parallel { "parallel" } else { "sequential" },
            max_tokens,
            temperature
        );

        let (base, fine_tuned) = if self.parallel {
            tokio::join!(
                self.handler.handle(base_request),
                self.handler.handle(tuned_request)
            )
        } else {
            let base = self.handler.handle(base_request).await;
            let fine_tuned = self.handler.handle(tuned_request).await;
            (base, fine_tuned)
        };

        let divergence = match (base.text(), fine_tuned.text()) {
            (Some(b), Some(f)) => Some(OutputDivergence::compute(b, f)),
            _ => None,
        };

        ComparisonResult {
            prompt: template.prompt,
            max_tokens,
            temperature,
            base,
            fine_tuned,
            divergence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockGenerator, SamplingParams, TextGenerator};
    use crate::error::ErrorKind;
    use crate::registry::{ModelHandle, ModelRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    struct Broken;

    impl TextGenerator for Broken {
        fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
            anyhow::bail!("adapter weights missing")
        }

        fn model_name(&self) -> &str {
            "broken"
        }
    }

    fn orchestrator(fine_tuned: Arc<dyn TextGenerator>) -> ComparisonOrchestrator {
        let registry = ModelRegistry::from_handles(
            ModelHandle::new(
                ModelVariant::Base,
                Arc::new(MockGenerator::new("base")),
                SamplingParams::default(),
            ),
            ModelHandle::new(ModelVariant::FineTuned, fine_tuned, SamplingParams::default()),
        );
        ComparisonOrchestrator::new(GenerationHandler::new(
            Arc::new(registry),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_both_slots_succeed() {
        let result = orchestrator(Arc::new(MockGenerator::new("ft")))
            .compare("Add a toggle", 20, 0.0)
            .await;

        assert!(result.both_succeeded());
        assert!(result.base.text().unwrap().contains("[base]"));
        assert!(result.fine_tuned.text().unwrap().contains("[ft]"));
        assert!(result.divergence.is_some());
        assert_eq!(result.max_tokens, 20);
    }

    #[tokio::test]
    async fn test_one_failure_keeps_other_slot() {
        for orch in [
            orchestrator(Arc::new(Broken)),
            orchestrator(Arc::new(Broken)).sequential(),
        ] {
            let result = orch.compare("Add a toggle", 20, 0.0).await;
            assert!(result.base.is_success());
            assert_eq!(
                result.slot(ModelVariant::FineTuned).error_kind(),
                Some(ErrorKind::GenerationFailure)
            );
            assert!(result.divergence.is_none());
        }
    }

    #[tokio::test]
    async fn test_invalid_request_fills_both_slots() {
        let result = orchestrator(Arc::new(MockGenerator::new("ft")))
            .compare("", 20, 0.0)
            .await;
        assert_eq!(result.base.error_kind(), Some(ErrorKind::InvalidRequest));
        assert_eq!(result.fine_tuned.error_kind(), Some(ErrorKind::InvalidRequest));
    }
}
