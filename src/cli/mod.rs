//! Command-line interface
//!
//! Provides CLI commands for generate, compare, suite, session, prompts, and config.

use anyhow::{Context, Result};
use std::future::Future;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::HarnessConfig;
use crate::generation::{
    ComparisonOrchestrator, ComparisonResult, GenerationHandler, GenerationRequest, GenerationResult,
};
use crate::prompts::{self, EXAMPLES};
use crate::registry::{ModelRegistry, ModelVariant};
use crate::session::Session;
use crate::suite::{run_suite, ProbeOutcome, SuiteReport};

const RULE: &str = "================================================================================";
const THIN_RULE: &str = "--------------------------------------------------------------------------------";

/// How long exit waits on blocking generations that are still running
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Drive `future` to completion on a fresh multi-threaded runtime
///
/// Blocking generations still running afterwards get `grace` to wind down;
/// the runtime is then torn down without joining them.
pub fn block_on<F: Future>(future: F, grace: Duration) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

/// Where the prompt text comes from
#[derive(Debug, Clone, Default)]
pub struct PromptSource {
    /// Literal prompt text, `-` reads stdin
    pub text: Option<String>,
    /// Built-in example, by name or 1-based index
    pub example: Option<String>,
    pub file: Option<PathBuf>,
}

impl PromptSource {
    pub fn resolve(&self) -> Result<String> {
        match (&self.text, &self.example, &self.file) {
            (Some(text), None, None) if text == "-" => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read prompt from stdin")?;
                Ok(buf)
            }
            (Some(text), None, None) => Ok(text.clone()),
            (None, Some(key), None) => prompts::find(key)
                .map(|p| p.text.to_string())
                .with_context(|| format!("Unknown example prompt: {} (see `duet prompts`)", key)),
            (None, None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display())),
            (None, None, None) => Ok(EXAMPLES[0].text.to_string()),
            _ => anyhow::bail!("Give at most one of --prompt, --example, --file"),
        }
    }
}

/// Per-call decoding overrides; `None` falls back to the configured defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoding {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

impl Decoding {
    fn resolve(&self, config: &HarnessConfig) -> (usize, f32) {
        (
            self.max_tokens.unwrap_or(config.max_tokens),
            self.temperature.unwrap_or(config.temperature),
        )
    }
}

/// Load both variants; any failure here is fatal
pub fn build_registry(config: &HarnessConfig) -> Result<Arc<ModelRegistry>> {
    tracing::info!("Initializing model registry");
    tracing::info!("  Backend: {}", config.backend);
    tracing::info!("  Model: {}", config.model_id);
    tracing::info!("  Adapter: {}", config.adapter_path().display());

    let registry = ModelRegistry::new();
    registry.initialize(config)?;
    Ok(Arc::new(registry))
}

fn build_orchestrator(config: &HarnessConfig) -> Result<ComparisonOrchestrator> {
    let registry = build_registry(config)?;
    let handler = GenerationHandler::new(registry, config.timeout());
    Ok(ComparisonOrchestrator::new(handler).with_parallel(config.parallel_compare))
}

/// Execute the generate command
pub async fn generate(
    config: HarnessConfig,
    source: PromptSource,
    variant: String,
    decoding: Decoding,
    json: bool,
) -> Result<()> {
    let prompt = source.resolve()?;
    let (max_tokens, temperature) = decoding.resolve(&config);

    // Reject an unknown selector before any model is loaded
    let result = match variant.parse::<ModelVariant>() {
        Ok(variant) => {
            let handler = GenerationHandler::new(build_registry(&config)?, config.timeout());
            handler
                .handle(GenerationRequest::new(prompt.as_str(), variant, max_tokens, temperature))
                .await
        }
        Err(err) => GenerationResult::from(err),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", RULE);
        println!("Variant: {}", variant);
        println!("{}", RULE);
        print_prompt(&prompt);
        print_result(&result);
    }
    Ok(())
}

/// Execute the compare command
pub async fn compare(
    config: HarnessConfig,
    source: PromptSource,
    decoding: Decoding,
    json: bool,
) -> Result<()> {
    let prompt = source.resolve()?;
    let (max_tokens, temperature) = decoding.resolve(&config);

    let orchestrator = build_orchestrator(&config)?;
    let comparison = orchestrator.compare(&prompt, max_tokens, temperature).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
    } else {
        print_prompt(&prompt);
        print_comparison(&comparison);
    }
    Ok(())
}

/// Execute the suite command
pub async fn suite(
    config: HarnessConfig,
    compare: bool,
    decoding: Decoding,
    json: bool,
) -> Result<()> {
    let (max_tokens, temperature) = decoding.resolve(&config);
    let orchestrator = build_orchestrator(&config)?;

    println!("{}", RULE);
    println!("Probing {} ({} prompts)", config.model_id, EXAMPLES.len());
    println!("{}", RULE);

    let report = run_suite(&orchestrator, &EXAMPLES, compare, max_tokens, temperature).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Execute the session command, serving JSON lines on stdin/stdout
pub async fn session(config: HarnessConfig) -> Result<()> {
    let orchestrator = build_orchestrator(&config)?;
    let session = Session::new(orchestrator, config.max_tokens, config.temperature);

    tracing::info!("Ready for requests on stdin");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    session.run(stdin, tokio::io::stdout()).await?;
    Ok(())
}

/// Execute the prompts command
pub fn prompts(name: Option<String>) -> Result<()> {
    if let Some(key) = name {
        let prompt = prompts::find(&key)
            .with_context(|| format!("Unknown example prompt: {}", key))?;
        println!("{}", prompt.text);
        return Ok(());
    }

    for (i, prompt) in EXAMPLES.iter().enumerate() {
        let headline = prompt.text.lines().next().unwrap_or_default();
        let tag = if prompt.seen_in_training { " (training)" } else { "" };
        println!("{}. {}{}", i + 1, prompt.name, tag);
        println!("   {}", headline);
    }
    Ok(())
}

/// Execute the config command
pub fn show_config(config: &HarnessConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn print_prompt(prompt: &str) {
    let preview: String = prompt.chars().take(200).collect();
    let ellipsis = if preview.len() < prompt.len() { "..." } else { "" };
    println!("\nPrompt:\n{}{}\n", preview, ellipsis);
}

fn print_result(result: &GenerationResult) {
    match result {
        GenerationResult::Success { text } => {
            println!("Generated Code:\n{}", THIN_RULE);
            println!("{}", text);
            println!("{}", THIN_RULE);
        }
        GenerationResult::Failure { .. } => println!("❌ {}", result.display_text()),
    }
}

fn print_comparison(comparison: &ComparisonResult) {
    for variant in ModelVariant::ALL {
        println!("{}", RULE);
        println!("{}", variant);
        println!("{}", RULE);
        print_result(comparison.slot(variant));
    }
    if let Some(divergence) = &comparison.divergence {
        println!("\n{}", divergence);
    }
}

fn print_report(report: &SuiteReport) {
    for entry in &report.entries {
        println!("\n{}", RULE);
        let tag = if entry.seen_in_training { "seen in training" } else { "new scenario" };
        println!("Test: {} ({})", entry.name, tag);
        println!("{}", RULE);
        match &entry.outcome {
            ProbeOutcome::Single { result } => print_result(result),
            ProbeOutcome::Compare { comparison } => print_comparison(comparison),
        }
    }

    println!("\n{}", RULE);
    println!("Summary: {}", report.tally);
    if let Some(divergence) = &report.mean_divergence {
        println!("\nMean {}", divergence);
    }
    println!("{}", RULE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_prompt_source_resolution() {
        let source = PromptSource {
            text: Some("fix it".to_string()),
            ..Default::default()
        };
        assert_eq!(source.resolve().unwrap(), "fix it");

        let source = PromptSource {
            example: Some("auth-middleware-fix".to_string()),
            ..Default::default()
        };
        assert!(source.resolve().unwrap().starts_with("Fix authentication bug"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "from a file").unwrap();
        let source = PromptSource {
            file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(source.resolve().unwrap(), "from a file");
    }

    #[test]
    fn test_prompt_source_conflicts() {
        let source = PromptSource {
            text: Some("a".to_string()),
            example: Some("1".to_string()),
            file: None,
        };
        assert!(source.resolve().is_err());

        let source = PromptSource {
            example: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(source.resolve().is_err());
    }

    #[test]
    fn test_decoding_falls_back_to_config() {
        let config = HarnessConfig::default();
        let decoding = Decoding {
            max_tokens: Some(300),
            temperature: None,
        };
        let (max_tokens, temperature) = decoding.resolve(&config);
        assert_eq!(max_tokens, 300);
        assert_eq!(temperature, config.temperature);
    }
}
