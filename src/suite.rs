//! Probe suite over the built-in prompts
//!
//! Runs every example prompt through the fine-tuned variant (or both
//! variants) and tallies how each call ended.

use serde::Serialize;

use crate::error::ErrorKind;
use crate::evaluation::OutputDivergence;
use crate::generation::{ComparisonOrchestrator, ComparisonResult, GenerationRequest, GenerationResult};
use crate::prompts::ExamplePrompt;
use crate::registry::ModelVariant;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Single { result: GenerationResult },
    Compare { comparison: ComparisonResult },
}

impl ProbeOutcome {
    fn results(&self) -> Vec<&GenerationResult> {
        match self {
            Self::Single { result } => vec![result],
            Self::Compare { comparison } => vec![&comparison.base, &comparison.fine_tuned],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeEntry {
    pub name: String,
    pub seen_in_training: bool,
    pub outcome: ProbeOutcome,
}

/// Counts over every generation call the suite made
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl Tally {
    fn record(&mut self, result: &GenerationResult) {
        match result.error_kind() {
            None => self.succeeded += 1,
            Some(ErrorKind::GenerationTimeout) => self.timed_out += 1,
            Some(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }
}

impl std::fmt::Display for Tally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} timed out ({} calls)",
            self.succeeded,
            self.failed,
            self.timed_out,
            self.total()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub entries: Vec<ProbeEntry>,
    pub tally: Tally,
    /// Mean divergence over prompts where both variants succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_divergence: Option<OutputDivergence>,
}

/// Run `prompts` in order, one at a time
pub async fn run_suite(
    orchestrator: &ComparisonOrchestrator,
    prompts: &[ExamplePrompt],
    compare: bool,
    max_tokens: usize,
    temperature: f32,
) -> SuiteReport {
    let mut entries = Vec::with_capacity(prompts.len());
    let mut tally = Tally::default();
    let mut divergences = Vec::new();

    for prompt in prompts {
        tracing::info!("Probe: {}", prompt.name);
        let outcome = if compare {
            let comparison = orchestrator
                .compare(prompt.text, max_tokens, temperature)
                .await;
            if let Some(d) = &comparison.divergence {
                divergences.push(d.clone());
            }
            ProbeOutcome::Compare { comparison }
        } else {
            let request =
                GenerationRequest::new(prompt.text, ModelVariant::FineTuned, max_tokens, temperature);
            ProbeOutcome::Single {
                result: orchestrator.handler().handle(request).await,
            }
        };

        for result in outcome.results() {
            tally.record(result);
        }
        entries.push(ProbeEntry {
            name: prompt.name.to_string(),
            seen_in_training: prompt.seen_in_training,
            outcome,
        });
    }

    SuiteReport {
        entries,
        tally,
        mean_divergence: OutputDivergence::average(&divergences),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockGenerator, SamplingParams, TextGenerator};
    use crate::generation::GenerationHandler;
    use crate::prompts::EXAMPLES;
    use crate::registry::{ModelHandle, ModelRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    struct Stalling;

    impl TextGenerator for Stalling {
        fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
            std::thread::sleep(Duration::from_millis(500));
            Ok("late".to_string())
        }

        fn model_name(&self) -> &str {
            "stalling"
        }
    }

    fn orchestrator(fine_tuned: Arc<dyn TextGenerator>, timeout: Duration) -> ComparisonOrchestrator {
        let registry = ModelRegistry::from_handles(
            ModelHandle::new(
                ModelVariant::Base,
                Arc::new(MockGenerator::new("base")),
                SamplingParams::default(),
            ),
            ModelHandle::new(ModelVariant::FineTuned, fine_tuned, SamplingParams::default()),
        );
        ComparisonOrchestrator::new(GenerationHandler::new(Arc::new(registry), timeout))
    }

    #[tokio::test]
    async fn test_single_mode_tally() {
        let orch = orchestrator(Arc::new(MockGenerator::new("ft")), Duration::from_secs(5));
        let report = run_suite(&orch, &EXAMPLES, false, 16, 0.0).await;

        assert_eq!(report.entries.len(), EXAMPLES.len());
        assert_eq!(report.tally.succeeded, EXAMPLES.len());
        assert!(report.mean_divergence.is_none());
    }

    #[tokio::test]
    async fn test_compare_mode_counts_timeouts() {
        let orch = orchestrator(Arc::new(Stalling), Duration::from_millis(50));
        let report = run_suite(&orch, &EXAMPLES[..1], true, 16, 0.0).await;

        assert_eq!(
            report.tally,
            Tally {
                succeeded: 1,
                failed: 0,
                timed_out: 1
            }
        );
        assert!(report.mean_divergence.is_none());
    }
}
