//! HuggingFace Hub integration and local model directories
//!
//! Resolves a model identifier to the files needed for decoding: `config.json`,
//! `tokenizer.json`, and one or more safetensors weight files.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const SINGLE_WEIGHTS: &str = "model.safetensors";
const SHARD_INDEX: &str = "model.safetensors.index.json";

/// Files backing a decoder model
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Original model ID (e.g., "deepseek-ai/deepseek-coder-1.3b-instruct")
    pub model_id: String,
    /// Whether this is a local path (not downloaded from Hub)
    pub is_local: bool,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Safetensors weight files, sorted (one entry unless sharded)
    pub weight_files: Vec<PathBuf>,
    /// Path to tokenizer.json
    pub tokenizer_file: Option<PathBuf>,
}

impl ModelPath {
    /// Create a ModelPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.is_dir() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }

        let weight_files = find_weight_files(&path)?;
        let tokenizer_file = Some(path.join("tokenizer.json")).filter(|p| p.exists());

        Ok(Self {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            path,
            is_local: true,
            config_file,
            weight_files,
            tokenizer_file,
        })
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("Config file not found: {:?}", self.config_file));
        }
        if self.weight_files.is_empty() {
            return Err(anyhow!("No weight files for model {}", self.model_id));
        }
        for file in &self.weight_files {
            if !file.exists() {
                return Err(anyhow!("Weights file not found: {:?}", file));
            }
        }
        Ok(())
    }

    /// Read and parse config.json
    pub fn read_config(&self) -> Result<(String, serde_json::Value)> {
        let raw = std::fs::read_to_string(&self.config_file)
            .with_context(|| format!("Failed to read model config: {:?}", self.config_file))?;
        let value = serde_json::from_str(&raw).context("Failed to parse model config")?;
        Ok((raw, value))
    }
}

/// Find weight files in a directory (single file or `model-XXXXX-of-YYYYY` shards)
fn find_weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let single_file = model_dir.join(SINGLE_WEIGHTS);
    if single_file.exists() {
        return Ok(vec![single_file]);
    }

    let mut shards = Vec::new();
    for entry in std::fs::read_dir(model_dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == "safetensors").unwrap_or(false) {
            if let Some(name) = path.file_name() {
                let name = name.to_string_lossy();
                if name.starts_with("model-") && name.contains("-of-") {
                    shards.push(path);
                }
            }
        }
    }

    if shards.is_empty() {
        anyhow::bail!("No safetensors weight files found in {:?}", model_dir);
    }

    shards.sort();
    Ok(shards)
}

/// Shard file names listed in a `model.safetensors.index.json`
fn shard_names(index_file: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(index_file)
        .with_context(|| format!("Failed to read shard index: {:?}", index_file))?;
    let index: serde_json::Value = serde_json::from_str(&raw).context("Failed to parse shard index")?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("Shard index has no weight_map"))?;

    let names: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(names.into_iter().collect())
}

/// Model loader that handles both local and HuggingFace models
pub struct ModelLoader {
    api: Api,
}

impl ModelLoader {
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
        Ok(Self { api })
    }

    /// Resolve a model - local directories win, anything else is a Hub ID
    pub fn load_model_path(&self, model_id_or_path: &str) -> Result<ModelPath> {
        let local_path = Path::new(model_id_or_path);
        let looks_local = model_id_or_path.starts_with('.')
            || model_id_or_path.starts_with('/')
            || model_id_or_path.starts_with('~');

        if local_path.exists() {
            tracing::info!("Loading model from local path: {}", model_id_or_path);
            ModelPath::from_local(local_path)
        } else if looks_local {
            Err(anyhow!("Local model path does not exist: {}", model_id_or_path))
        } else {
            self.download_model(model_id_or_path)
        }
    }

    /// Download (or reuse the cached copy of) a model from the Hub
    pub fn download_model(&self, model_id: &str) -> Result<ModelPath> {
        tracing::info!("Fetching model from HuggingFace Hub: {}", model_id);

        let repo = self.api.model(model_id.to_string());

        let config_file = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let weight_files = Self::download_weights(&repo)?;
        let tokenizer_file = repo.get("tokenizer.json").ok();
        if tokenizer_file.is_none() {
            tracing::warn!("{} has no tokenizer.json", model_id);
        }

        let path = config_file
            .parent()
            .ok_or_else(|| anyhow!("Invalid config path"))?
            .to_path_buf();

        Ok(ModelPath {
            path,
            model_id: model_id.to_string(),
            is_local: false,
            config_file,
            weight_files,
            tokenizer_file,
        })
    }

    fn download_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
        if let Ok(path) = repo.get(SINGLE_WEIGHTS) {
            return Ok(vec![path]);
        }

        let index = repo.get(SHARD_INDEX).map_err(|_| {
            anyhow!("No safetensors weights found (tried {} and {})", SINGLE_WEIGHTS, SHARD_INDEX)
        })?;

        shard_names(&index)?
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download weight shard {}", name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_local_path_is_error() {
        let loader = ModelLoader::new().unwrap();
        assert!(loader
            .load_model_path("./no-such-model")
            .is_err_and(|e| e.to_string().contains("does not exist")));
    }

    #[test]
    fn test_local_dir_with_shards() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();
        std::fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();

        let model_path = ModelPath::from_local(dir.path()).unwrap();
        assert!(model_path.is_local);
        assert_eq!(model_path.weight_files.len(), 2);
        assert!(model_path.weight_files[0].ends_with("model-00001-of-00002.safetensors"));
        assert!(model_path.tokenizer_file.is_none());
    }

    #[test]
    fn test_local_dir_without_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        assert!(ModelPath::from_local(dir.path()).is_err());
    }

    #[test]
    fn test_shard_names_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join(SHARD_INDEX);
        std::fs::write(
            &index,
            r#"{"weight_map": {"a": "model-00001-of-00002.safetensors",
                               "b": "model-00002-of-00002.safetensors",
                               "c": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();

        let names = shard_names(&index).unwrap();
        assert_eq!(
            names,
            vec!["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]
        );
    }
}
