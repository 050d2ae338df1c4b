//! Model weights
//!
//! Provides functionality for:
//! - Finding weights in the models directory or the HuggingFace cache
//! - Resolving the HuggingFace access token
//! - Downloading missing weights from the hub

pub mod cache;
pub mod download;
pub mod token;

pub use cache::{get_model_cache_path, model_id_to_cache_name};
pub use download::{DownloadError, HfHubDownloader, WeightDownloader};
pub use token::{TokenSource, resolve_token};

use crate::specs::ModelSpec;
use std::path::{Path, PathBuf};

/// Files whose presence marks a directory as holding usable weights
const WEIGHT_MARKERS: &[&str] = &[
    "config.json",
    "model.safetensors",
    "model.safetensors.index.json",
    "pytorch_model.bin",
];

/// HuggingFace hub cache directory
///
/// Checks in order:
/// 1. `$HF_HOME/hub`
/// 2. `$XDG_CACHE_HOME/huggingface/hub`
/// 3. `~/.cache/huggingface/hub`
pub fn default_hf_cache_dir() -> PathBuf {
    if let Ok(hf_home) = std::env::var("HF_HOME") {
        return PathBuf::from(hf_home).join("hub");
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("huggingface").join("hub");
    }

    dirs::home_dir()
        .map(|h| h.join(".cache").join("huggingface").join("hub"))
        .unwrap_or_else(|| PathBuf::from("/tmp/huggingface/hub"))
}

/// Where a model's weights are, or would be placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsLocation {
    pub path: PathBuf,
    pub present: bool,
}

/// Presence check over the two conventional locations
#[derive(Debug, Clone)]
pub struct WeightLocator {
    models_dir: PathBuf,
    hf_cache: PathBuf,
}

impl WeightLocator {
    pub fn new(models_dir: PathBuf, hf_cache: PathBuf) -> Self {
        Self {
            models_dir,
            hf_cache,
        }
    }

    /// `<models_dir>/<model_name>` first, then the hub cache snapshot
    ///
    /// When neither holds weights the models-directory path is returned with
    /// `present: false`.
    pub fn find(&self, spec: &ModelSpec) -> WeightsLocation {
        let local = self.models_dir.join(&spec.model_name);
        if has_weights(&local) {
            return WeightsLocation {
                path: local,
                present: true,
            };
        }

        if !spec.hf_model_repo.is_empty()
            && let Some(snapshot) = get_model_cache_path(&self.hf_cache, &spec.hf_model_repo)
            && has_weights(&snapshot)
        {
            return WeightsLocation {
                path: snapshot,
                present: true,
            };
        }

        WeightsLocation {
            path: local,
            present: false,
        }
    }
}

fn has_weights(dir: &Path) -> bool {
    dir.is_dir() && WEIGHT_MARKERS.iter().any(|m| dir.join(m).exists())
}
