//! End-to-end behaviour of the request handler and comparison path

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use duet::backend::{MockGenerator, SamplingParams, TextGenerator};
use duet::prompts::DARK_MODE_TOGGLE;
use duet::{
    ComparisonOrchestrator, ErrorKind, GenerationHandler, GenerationRequest, HarnessConfig,
    HarnessError, ModelHandle, ModelRegistry, ModelVariant,
};

/// Counts calls and answers with a fixed string
struct Counting {
    calls: AtomicUsize,
    reply: &'static str,
}

impl Counting {
    fn new(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            reply,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for Counting {
    fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.to_string())
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

/// Blocks well past any test timeout
struct Hanging;

impl TextGenerator for Hanging {
    fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
        std::thread::sleep(Duration::from_millis(1500));
        Ok("too late".to_string())
    }

    fn model_name(&self) -> &str {
        "hanging"
    }
}

/// Decodes "tokens" slowly and honours the request deadline like the Candle loop
struct Stepping {
    stopped: AtomicBool,
}

impl TextGenerator for Stepping {
    fn generate(&self, _prompt: &str, params: &SamplingParams) -> anyhow::Result<String> {
        for step in 0..params.max_new_tokens {
            if params.deadline_passed() {
                self.stopped.store(true, Ordering::SeqCst);
                anyhow::bail!("abandoned after {} tokens", step);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok("finished".to_string())
    }

    fn model_name(&self) -> &str {
        "stepping"
    }
}

/// Ignores deadlines entirely
struct Stubborn;

impl TextGenerator for Stubborn {
    fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
        std::thread::sleep(Duration::from_secs(4));
        Ok("too late".to_string())
    }

    fn model_name(&self) -> &str {
        "stubborn"
    }
}

struct Failing;

impl TextGenerator for Failing {
    fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
        anyhow::bail!("Metal device lost")
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

fn registry(base: Arc<dyn TextGenerator>, fine_tuned: Arc<dyn TextGenerator>) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::from_handles(
        ModelHandle::new(ModelVariant::Base, base, SamplingParams::default()),
        ModelHandle::new(ModelVariant::FineTuned, fine_tuned, SamplingParams::default()),
    ))
}

fn mock_registry() -> Arc<ModelRegistry> {
    registry(
        Arc::new(MockGenerator::new("base")),
        Arc::new(MockGenerator::new("fine-tuned")),
    )
}

#[tokio::test]
async fn greedy_generation_is_reproducible() {
    let handler = GenerationHandler::new(mock_registry(), Duration::from_secs(5));
    let request = GenerationRequest::new("Add a toggle", ModelVariant::FineTuned, 64, 0.0);

    let first = handler.handle(request.clone()).await;
    let second = handler.handle(request).await;

    assert!(first.is_success());
    assert_eq!(first, second);
}

#[tokio::test]
async fn empty_prompt_never_reaches_backend() {
    let base = Counting::new("ok");
    let tuned = Counting::new("ok");
    let handler = GenerationHandler::new(
        registry(base.clone(), tuned.clone()),
        Duration::from_secs(5),
    );

    for prompt in ["", "   \n"] {
        let result = handler
            .handle(GenerationRequest::new(prompt, ModelVariant::Base, 100, 0.7))
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidRequest));
    }

    let orchestrator = ComparisonOrchestrator::new(handler);
    let comparison = orchestrator.compare("", 100, 0.7).await;
    assert_eq!(comparison.base.error_kind(), Some(ErrorKind::InvalidRequest));
    assert_eq!(comparison.fine_tuned.error_kind(), Some(ErrorKind::InvalidRequest));

    assert_eq!(base.calls(), 0);
    assert_eq!(tuned.calls(), 0);
}

#[tokio::test]
async fn out_of_range_parameters_are_rejected() {
    let base = Counting::new("ok");
    let handler = GenerationHandler::new(
        registry(base.clone(), Counting::new("ok")),
        Duration::from_secs(5),
    );

    for (max_tokens, temperature) in [(0, 0.7), (1001, 0.7), (100, -1.0), (100, 3.0)] {
        let result = handler
            .handle(GenerationRequest::new("p", ModelVariant::Base, max_tokens, temperature))
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidRequest));
    }
    assert_eq!(base.calls(), 0);
}

#[test]
fn unknown_variant_is_rejected_before_dispatch() {
    let err = "large".parse::<ModelVariant>().unwrap_err();
    assert_eq!(err, HarnessError::UnknownVariant("large".to_string()));
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn hanging_backend_times_out_within_bound() {
    let timeout = Duration::from_millis(200);
    let handler = GenerationHandler::new(registry(Arc::new(Hanging), Arc::new(Hanging)), timeout);

    let started = Instant::now();
    let result = handler
        .handle(GenerationRequest::new("p", ModelVariant::Base, 10, 0.0))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.error_kind(), Some(ErrorKind::GenerationTimeout));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(800), "{:?}", elapsed);
}

#[tokio::test]
async fn compare_always_fills_both_slots() {
    fn mock(label: &str) -> Arc<dyn TextGenerator> {
        Arc::new(MockGenerator::new(label))
    }
    fn failing() -> Arc<dyn TextGenerator> {
        Arc::new(Failing)
    }

    let cases = vec![
        (mock("b"), mock("f")),
        (failing(), mock("f")),
        (mock("b"), failing()),
        (failing(), failing()),
    ];

    for (base, fine_tuned) in cases {
        let handler = GenerationHandler::new(registry(base, fine_tuned), Duration::from_secs(5));
        let comparison = ComparisonOrchestrator::new(handler)
            .compare("Fix authentication bug in middleware...", 300, 0.7)
            .await;

        for variant in ModelVariant::ALL {
            let slot = comparison.slot(variant);
            assert!(
                slot.is_success() || slot.error_kind() == Some(ErrorKind::GenerationFailure)
            );
        }
        assert_eq!(comparison.divergence.is_some(), comparison.both_succeeded());
    }
}

#[tokio::test]
async fn compare_slot_timeout_does_not_block_other_slot() {
    let handler = GenerationHandler::new(
        registry(Arc::new(MockGenerator::new("b")), Arc::new(Hanging)),
        Duration::from_millis(200),
    );
    let comparison = ComparisonOrchestrator::new(handler)
        .compare("Fix authentication bug in middleware...", 300, 0.7)
        .await;

    assert!(comparison.base.is_success());
    assert_eq!(
        comparison.fine_tuned.error_kind(),
        Some(ErrorKind::GenerationTimeout)
    );
}

#[tokio::test]
async fn compare_sends_identical_parameters() {
    let handler = GenerationHandler::new(mock_registry(), Duration::from_secs(5));
    let comparison = ComparisonOrchestrator::new(handler)
        .sequential()
        .compare("Fix authentication bug in middleware...", 300, 0.7)
        .await;

    assert_eq!(comparison.prompt, "Fix authentication bug in middleware...");
    assert_eq!(comparison.max_tokens, 300);
    assert!((comparison.temperature - 0.7).abs() < f32::EPSILON);
    assert!(comparison.both_succeeded());
}

#[tokio::test]
async fn dark_mode_request_yields_text_or_classified_failure() {
    let config = HarnessConfig::default().with_backend(duet::backend::BackendKind::Mock);
    let registry = ModelRegistry::new();
    registry.initialize(&config).unwrap();

    let handler = GenerationHandler::new(Arc::new(registry), config.timeout());
    let result = handler
        .handle(GenerationRequest::new(
            DARK_MODE_TOGGLE.text,
            ModelVariant::FineTuned,
            400,
            0.7,
        ))
        .await;

    match result.text() {
        Some(text) => assert!(!text.is_empty()),
        None => assert!(result.error_kind().is_some()),
    }
}

#[tokio::test]
async fn uninitialized_registry_reports_not_initialized() {
    let handler = GenerationHandler::new(Arc::new(ModelRegistry::new()), Duration::from_secs(1));
    let comparison = ComparisonOrchestrator::new(handler).compare("p", 10, 0.0).await;

    assert_eq!(comparison.base.error_kind(), Some(ErrorKind::NotInitialized));
    assert_eq!(comparison.fine_tuned.error_kind(), Some(ErrorKind::NotInitialized));
}

#[test]
fn second_initialize_keeps_first_handles() {
    let config = HarnessConfig::default().with_backend(duet::backend::BackendKind::Mock);
    let registry = ModelRegistry::new();
    registry.initialize(&config).unwrap();
    let before = registry.resolve(ModelVariant::Base).unwrap();

    registry
        .initialize(&config.clone().with_model("other/model"))
        .unwrap();
    let after = registry.resolve(ModelVariant::Base).unwrap();

    assert_eq!(before.model_name(), after.model_name());
    assert!(after.model_name().contains("deepseek-coder"));
}

#[tokio::test]
async fn timed_out_generation_stops_decoding() {
    let stepping = Arc::new(Stepping {
        stopped: AtomicBool::new(false),
    });
    let handler = GenerationHandler::new(
        registry(stepping.clone(), Arc::new(MockGenerator::new("f"))),
        Duration::from_millis(150),
    );

    // 1000 tokens at 10ms each would run for ten seconds
    let result = handler
        .handle(GenerationRequest::new("p", ModelVariant::Base, 1000, 0.0))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::GenerationTimeout));

    let waited = Instant::now();
    while !stepping.stopped.load(Ordering::SeqCst) {
        assert!(
            waited.elapsed() < Duration::from_secs(1),
            "backend kept decoding past the deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn exit_does_not_wait_for_abandoned_generation() {
    let handler = GenerationHandler::new(
        registry(Arc::new(Stubborn), Arc::new(Stubborn)),
        Duration::from_millis(100),
    );

    let started = Instant::now();
    let result = duet::cli::block_on(
        async move {
            handler
                .handle(GenerationRequest::new("p", ModelVariant::Base, 10, 0.0))
                .await
        },
        Duration::from_millis(200),
    )
    .unwrap();

    assert_eq!(result.error_kind(), Some(ErrorKind::GenerationTimeout));
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "{:?}",
        started.elapsed()
    );
}
