//! Model registry holding the base and fine-tuned handles

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{create_generator, SamplingParams, TextGenerator};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};

/// The two model variants under evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "fine-tuned", alias = "fine_tuned", alias = "finetuned")]
    FineTuned,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 2] = [ModelVariant::Base, ModelVariant::FineTuned];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::FineTuned => "fine-tuned",
        }
    }
}

impl std::str::FromStr for ModelVariant {
    type Err = HarnessError;

    fn from_str(s: &str) -> HarnessResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "fine-tuned" | "fine_tuned" | "finetuned" | "ft" => Ok(Self::FineTuned),
            _ => Err(HarnessError::UnknownVariant(s.to_string())),
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded model plus the decoding defaults it was configured with
#[derive(Clone)]
pub struct ModelHandle {
    pub variant: ModelVariant,
    pub generator: Arc<dyn TextGenerator>,
    /// Template for per-request sampling; max tokens and temperature are
    /// overridden by each request
    pub sampling: SamplingParams,
}

impl ModelHandle {
    pub fn new(
        variant: ModelVariant,
        generator: Arc<dyn TextGenerator>,
        sampling: SamplingParams,
    ) -> Self {
        Self {
            variant,
            generator,
            sampling,
        }
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("variant", &self.variant)
            .field("model", &self.model_name())
            .finish()
    }
}

struct Handles {
    base: ModelHandle,
    fine_tuned: ModelHandle,
}

/// Holds exactly two handles, set once and read-only afterwards
#[derive(Default)]
pub struct ModelRegistry {
    handles: OnceCell<Handles>,
}

impl ModelRegistry {
    /// Empty registry; call [`initialize`](Self::initialize) before serving
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry built directly from already-loaded handles
    pub fn from_handles(base: ModelHandle, fine_tuned: ModelHandle) -> Self {
        let registry = Self::new();
        let _ = registry.handles.set(Handles { base, fine_tuned });
        registry
    }

    /// Load both variants from configuration
    ///
    /// The fine-tuned variant is the base model with the configured adapter
    /// applied. Calling this again after success does nothing.
    pub fn initialize(&self, config: &HarnessConfig) -> HarnessResult<()> {
        let factory = |variant: ModelVariant| {
            let adapter = match variant {
                ModelVariant::Base => None,
                ModelVariant::FineTuned => Some(config.adapter_path()),
            };
            create_generator(config, adapter.as_deref())
        };
        self.initialize_with(factory, config.sampling())
    }

    /// Load both variants with a custom generator factory
    pub fn initialize_with<F>(&self, factory: F, sampling: SamplingParams) -> HarnessResult<()>
    where
        F: Fn(ModelVariant) -> Result<Arc<dyn TextGenerator>>,
    {
        if self.is_initialized() {
            tracing::debug!("Model registry already initialized");
            return Ok(());
        }

        self.handles
            .get_or_try_init(|| {
                let load = |variant: ModelVariant| -> HarnessResult<ModelHandle> {
                    tracing::info!("Loading {} model", variant);
                    let generator = factory(variant).map_err(|e| {
                        HarnessError::Startup(format!("failed to load {} model: {:#}", variant, e))
                    })?;
                    tracing::info!("Loaded {} model: {}", variant, generator.model_name());
                    Ok(ModelHandle::new(variant, generator, sampling.clone()))
                };

                Ok(Handles {
                    base: load(ModelVariant::Base)?,
                    fine_tuned: load(ModelVariant::FineTuned)?,
                })
            })
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.handles.get().is_some()
    }

    /// Look up the handle for a variant
    pub fn resolve(&self, variant: ModelVariant) -> HarnessResult<ModelHandle> {
        let handles = self.handles.get().ok_or(HarnessError::NotInitialized)?;
        Ok(match variant {
            ModelVariant::Base => handles.base.clone(),
            ModelVariant::FineTuned => handles.fine_tuned.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock(label: &str) -> Arc<dyn TextGenerator> {
        Arc::new(MockGenerator::new(label))
    }

    #[test]
    fn test_variant_parsing() {
        assert_eq!("base".parse::<ModelVariant>().unwrap(), ModelVariant::Base);
        for s in ["fine-tuned", "fine_tuned", "FineTuned", "ft"] {
            assert_eq!(s.parse::<ModelVariant>().unwrap(), ModelVariant::FineTuned);
        }
        assert_eq!(
            "large".parse::<ModelVariant>().unwrap_err(),
            HarnessError::UnknownVariant("large".to_string())
        );
    }

    #[test]
    fn test_variant_serde_names() {
        let json = serde_json::to_string(&ModelVariant::FineTuned).unwrap();
        assert_eq!(json, "\"fine-tuned\"");
        let parsed: ModelVariant = serde_json::from_str("\"fine_tuned\"").unwrap();
        assert_eq!(parsed, ModelVariant::FineTuned);
    }

    #[test]
    fn test_resolve_before_initialize() {
        let registry = ModelRegistry::new();
        assert!(!registry.is_initialized());
        assert_eq!(
            registry.resolve(ModelVariant::Base).unwrap_err(),
            HarnessError::NotInitialized
        );
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let registry = ModelRegistry::new();
        let loads = AtomicUsize::new(0);
        let factory = |variant: ModelVariant| -> Result<Arc<dyn TextGenerator>> {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(mock(variant.as_str()))
        };

        registry.initialize_with(&factory, SamplingParams::default()).unwrap();
        registry.initialize_with(&factory, SamplingParams::default()).unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(
            registry.resolve(ModelVariant::FineTuned).unwrap().model_name(),
            "fine-tuned"
        );
    }

    #[test]
    fn test_failed_load_is_startup_error() {
        let registry = ModelRegistry::new();
        let err = registry
            .initialize_with(
                |variant| match variant {
                    ModelVariant::Base => Ok(mock("base")),
                    ModelVariant::FineTuned => Err(anyhow::anyhow!("adapter not found")),
                },
                SamplingParams::default(),
            )
            .unwrap_err();

        assert!(matches!(err, HarnessError::Startup(ref msg) if msg.contains("adapter not found")));
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_from_handles_resolves_each_variant() {
        let registry = ModelRegistry::from_handles(
            ModelHandle::new(ModelVariant::Base, mock("b"), SamplingParams::default()),
            ModelHandle::new(ModelVariant::FineTuned, mock("f"), SamplingParams::default()),
        );
        assert_eq!(registry.resolve(ModelVariant::Base).unwrap().model_name(), "b");
        assert_eq!(registry.resolve(ModelVariant::FineTuned).unwrap().model_name(), "f");
    }
}
