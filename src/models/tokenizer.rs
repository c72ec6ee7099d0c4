//! Tokenizer wrapper for HuggingFace tokenizers

use anyhow::Result;
use std::path::Path;
use tokenizers::Tokenizer;

use crate::models::hub::ModelPath;

/// End-of-sequence markers used by the decoder families we load
const EOS_CANDIDATES: &[&str] = &[
    "<|EOT|>",
    "<｜end▁of▁sentence｜>",
    "<|endoftext|>",
    "<|im_end|>",
    "</s>",
];

/// Wrapper around HuggingFace tokenizer
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
}

impl TokenizerWrapper {
    /// Load tokenizer from a file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        Ok(Self { tokenizer })
    }

    /// Load tokenizer from a ModelPath
    pub fn from_model_path(model_path: &ModelPath) -> Result<Self> {
        let tokenizer_path = model_path
            .tokenizer_file
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Tokenizer file not found for {}", model_path.model_id))?;

        Self::from_file(tokenizer_path)
    }

    /// Encode text to token IDs
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// Look up the id of a vocabulary token
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// First known end-of-sequence token in the vocabulary
    pub fn eos_token_id(&self) -> Option<u32> {
        EOS_CANDIDATES.iter().find_map(|t| self.token_id(t))
    }
}
