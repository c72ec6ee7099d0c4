//! # duet
//!
//! Side-by-side evaluation harness for a code-generation model and its LoRA
//! fine-tune.
//!
//! ## Overview
//!
//! Two model variants are loaded once at startup: the base model and the
//! same model with a LoRA adapter applied. Requests are routed to one
//! variant, or to both for a side-by-side comparison, with every failure
//! reported in the result instead of aborting the caller.
//!
//! ## Architecture
//!
//! - `models` - device selection, hub/local model files, tokenizer, LoRA adapters
//! - `backend` - the `TextGenerator` trait and its Candle, subprocess, and mock strategies
//! - `registry` - the two long-lived model handles
//! - `generation` - request handling with timeouts, and variant comparison
//! - `evaluation` - divergence between base and fine-tuned outputs
//! - `session` - JSON-lines front end
//! - `suite` - probe run over the built-in prompts
//! - `cli` - command-line interface

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod generation;
pub mod models;
pub mod prompts;
pub mod registry;
pub mod session;
pub mod suite;

// Re-export commonly used types
pub use config::HarnessConfig;
pub use error::{ErrorKind, HarnessError, HarnessResult};
pub use generation::{
    ComparisonOrchestrator, ComparisonResult, GenerationHandler, GenerationRequest, GenerationResult,
};
pub use registry::{ModelHandle, ModelRegistry, ModelVariant};
