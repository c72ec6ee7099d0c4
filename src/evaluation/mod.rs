//! Output divergence between the base and fine-tuned completions
//!
//! Neither output is a reference answer, so the scores are symmetric where
//! possible and read as "how far did fine-tuning move the output":
//! - Exact match after whitespace normalization
//! - Token F1 over the multiset of code tokens
//! - ROUGE-L over the token sequences

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Similarity scores for one pair of outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDivergence {
    /// 1.0 when both outputs are identical modulo whitespace
    pub exact_match: f32,
    /// Token-overlap F1
    pub token_f1: f32,
    /// ROUGE-L F-measure (longest common subsequence)
    pub rouge_l: f32,
    pub base_tokens: usize,
    pub fine_tuned_tokens: usize,
}

impl OutputDivergence {
    /// Score a base output against a fine-tuned output
    pub fn compute(base: &str, fine_tuned: &str) -> Self {
        let base_tokens = code_tokens(base);
        let tuned_tokens = code_tokens(fine_tuned);

        let exact_match = if normalize_whitespace(base) == normalize_whitespace(fine_tuned) {
            1.0
        } else {
            0.0
        };

        Self {
            exact_match,
            token_f1: token_f1(&base_tokens, &tuned_tokens),
            rouge_l: rouge_l(&base_tokens, &tuned_tokens),
            base_tokens: base_tokens.len(),
            fine_tuned_tokens: tuned_tokens.len(),
        }
    }

    /// Mean over several comparisons
    pub fn average(scores: &[Self]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as f32;
        let mean = |f: fn(&Self) -> f32| scores.iter().map(f).sum::<f32>() / n;
        let mean_count =
            |f: fn(&Self) -> usize| (scores.iter().map(f).sum::<usize>() as f32 / n).round() as usize;

        Some(Self {
            exact_match: mean(|s| s.exact_match),
            token_f1: mean(|s| s.token_f1),
            rouge_l: mean(|s| s.rouge_l),
            base_tokens: mean_count(|s| s.base_tokens),
            fine_tuned_tokens: mean_count(|s| s.fine_tuned_tokens),
        })
    }

    pub fn is_identical(&self) -> bool {
        self.exact_match >= 1.0
    }
}

impl std::fmt::Display for OutputDivergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Output divergence:")?;
        writeln!(f, "  Identical: {}", if self.is_identical() { "yes" } else { "no" })?;
        writeln!(f, "  Token F1:  {:.2}%", self.token_f1 * 100.0)?;
        writeln!(f, "  ROUGE-L:   {:.2}%", self.rouge_l * 100.0)?;
        write!(
            f,
            "  Tokens:    base {} / fine-tuned {}",
            self.base_tokens, self.fine_tuned_tokens
        )
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split source text into identifiers/numbers and single punctuation marks
///
/// Case is kept; in code `Button` and `button` are different tokens.
fn code_tokens(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        let is_word = c.is_alphanumeric() || c == '_' || c == '$';
        match (is_word, start) {
            (true, None) => start = Some(i),
            (true, Some(_)) => {}
            (false, Some(s)) => {
                tokens.push(&text[s..i]);
                start = None;
            }
            (false, None) => {}
        }
        if !is_word && !c.is_whitespace() {
            tokens.push(&text[i..i + c.len_utf8()]);
        }
    }
    if let Some(s) = start {
        tokens.push(&text[s..]);
    }

    tokens
}

fn f_measure(overlap: usize, a_len: usize, b_len: usize) -> f32 {
    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f32 / a_len as f32;
    let recall = overlap as f32 / b_len as f32;
    2.0 * precision * recall / (precision + recall)
}

/// F1 over token multisets, so repeated tokens count once per occurrence
fn token_f1(a: &[&str], b: &[&str]) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in a {
        *counts.entry(*token).or_insert(0) += 1;
    }
    let mut overlap = 0;
    for token in b {
        if let Some(count) = counts.get_mut(token) {
            if *count > 0 {
                *count -= 1;
                overlap += 1;
            }
        }
    }

    f_measure(overlap, a.len(), b.len())
}

fn rouge_l(a: &[&str], b: &[&str]) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    f_measure(lcs_length(a, b), a.len(), b.len())
}

/// Longest common subsequence length, single-row DP
fn lcs_length(a: &[&str], b: &[&str]) -> usize {
    let mut row = vec![0usize; b.len() + 1];

    for x in a {
        let mut diag = 0;
        for (j, y) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if x == y { diag + 1 } else { above.max(row[j]) };
            diag = above;
        }
    }

    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_tokens() {
        assert_eq!(
            code_tokens("const x = useState(false);"),
            vec!["const", "x", "=", "useState", "(", "false", ")", ";"]
        );
        assert_eq!(code_tokens("  "), Vec::<&str>::new());
    }

    #[test]
    fn test_identical_outputs() {
        let d = OutputDivergence::compute("let a = 1;", "let  a =\n1;");
        assert!(d.is_identical());
        assert!((d.token_f1 - 1.0).abs() < 1e-6);
        assert!((d.rouge_l - 1.0).abs() < 1e-6);
        assert_eq!(d.base_tokens, 5);
    }

    #[test]
    fn test_case_matters() {
        let d = OutputDivergence::compute("Button", "button");
        assert!(!d.is_identical());
        assert_eq!(d.token_f1, 0.0);
    }

    #[test]
    fn test_partial_overlap() {
        // a b c vs a b d: 2 of 3 shared
        let d = OutputDivergence::compute("a b c", "a b d");
        assert!((d.token_f1 - 2.0 / 3.0).abs() < 1e-4);
        assert!((d.rouge_l - 2.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_repeated_tokens_counted_per_occurrence() {
        // overlap is one "a", precision 1/3, recall 1/1
        let d = OutputDivergence::compute("a a a", "a");
        assert!((d.token_f1 - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_lcs_respects_order() {
        assert_eq!(lcs_length(&["a", "b", "c", "d"], &["a", "c", "d"]), 3);
        assert_eq!(lcs_length(&["a", "b"], &["b", "a"]), 1);
    }

    #[test]
    fn test_empty_outputs() {
        let d = OutputDivergence::compute("", "");
        assert!(d.is_identical());
        assert_eq!(d.token_f1, 1.0);

        let d = OutputDivergence::compute("x", "");
        assert_eq!(d.token_f1, 0.0);
        assert_eq!(d.rouge_l, 0.0);
    }

    #[test]
    fn test_average() {
        assert!(OutputDivergence::average(&[]).is_none());
        let avg = OutputDivergence::average(&[
            OutputDivergence::compute("a b", "a b"),
            OutputDivergence::compute("a b", "c d"),
        ])
        .unwrap();
        assert!((avg.exact_match - 0.5).abs() < 1e-6);
        assert!((avg.token_f1 - 0.5).abs() < 1e-6);
        assert_eq!(avg.base_tokens, 2);
    }
}
