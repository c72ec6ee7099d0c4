//! Deterministic stand-in generator
//!
//! Produces code-shaped filler without loading weights, so the request and
//! comparison paths can be exercised end to end (`--backend mock`).

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::{SamplingParams, TextGenerator};

const VOCAB: &[&str] = &[
    "const", "let", "return", "export", "function", "props", "state", "useEffect", "=>", "{",
    "}", "(", ")", ";", "await", "if", "else", "className", "onClick", "settings",
];

/// Mock generator keyed by a label, e.g. the variant it stands in for
pub struct MockGenerator {
    label: String,
}

impl MockGenerator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    fn seed(&self, prompt: &str, params: &SamplingParams) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.label.hash(&mut hasher);
        prompt.hash(&mut hasher);
        params.seed.hash(&mut hasher);
        hasher.finish()
    }
}

impl TextGenerator for MockGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        let seed = if params.is_greedy() {
            self.seed(prompt, params)
        } else {
            rand::thread_rng().gen()
        };
        let mut rng = StdRng::seed_from_u64(seed);

        let headline = prompt.lines().next().unwrap_or_default();
        let words: Vec<&str> = (0..params.max_new_tokens.min(48))
            .map(|_| VOCAB[rng.gen_range(0..VOCAB.len())])
            .collect();

        Ok(format!("// [{}] {}\n{}", self.label, headline, words.join(" ")))
    }

    fn model_name(&self) -> &str {
        &self.label
    }
}
