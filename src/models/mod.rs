//! Model loading for in-process decoding
//!
//! - `device` - CPU/CUDA/Metal device selection
//! - `hub` - HuggingFace Hub and local model directories
//! - `tokenizer` - tokenizer wrapper
//! - `lora` - LoRA adapter overlays merged into base weights

pub mod device;
pub mod hub;
pub mod lora;
pub mod tokenizer;

pub use device::{select_device, DevicePreference};
pub use hub::{ModelLoader, ModelPath};
pub use lora::{AdapterFormat, LoraAdapter, LoraConfig, LoraStats};
pub use tokenizer::TokenizerWrapper;
