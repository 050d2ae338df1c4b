//! HuggingFace hub cache layout
//!
//! ```text
//! <hf_cache>/
//! └── models--meta-llama--Llama-3.1-8B-Instruct/
//!     ├── refs/
//!     │   └── main
//!     └── snapshots/
//!         └── {revision}/
//!             ├── config.json
//!             └── model.safetensors
//! ```

use std::path::{Path, PathBuf};

/// Directory name of a repository in the hub cache
///
/// e.g. "meta-llama/Llama-3.1-8B-Instruct" -> "models--meta-llama--Llama-3.1-8B-Instruct"
pub fn model_id_to_cache_name(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}

/// Snapshot directory of a cached repository
///
/// Resolves `refs/main` first, then falls back to the first snapshot that
/// holds a `config.json`.
pub fn get_model_cache_path(cache_dir: &Path, repo_id: &str) -> Option<PathBuf> {
    let model_dir = cache_dir.join(model_id_to_cache_name(repo_id));

    if let Ok(revision) = std::fs::read_to_string(model_dir.join("refs").join("main")) {
        let snapshot_path = model_dir.join("snapshots").join(revision.trim());
        if !revision.trim().is_empty() && snapshot_path.is_dir() {
            return Some(snapshot_path);
        }
    }

    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(model_dir.join("snapshots"))
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.join("config.json").exists())
        .collect();
    // read_dir order is platform dependent
    snapshots.sort();
    snapshots.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cache: &Path, repo_id: &str, revision: &str) -> PathBuf {
        let path = cache
            .join(model_id_to_cache_name(repo_id))
            .join("snapshots")
            .join(revision);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("config.json"), "{}").unwrap();
        path
    }

    #[test]
    fn test_model_id_to_cache_name() {
        assert_eq!(
            model_id_to_cache_name("meta-llama/Llama-3.1-8B-Instruct"),
            "models--meta-llama--Llama-3.1-8B-Instruct"
        );
        assert_eq!(model_id_to_cache_name("gpt2"), "models--gpt2");
    }

    #[test]
    fn test_not_cached() {
        let cache = tempfile::tempdir().unwrap();
        assert!(get_model_cache_path(cache.path(), "org/missing").is_none());
    }

    #[test]
    fn test_refs_main_wins() {
        let cache = tempfile::tempdir().unwrap();
        snapshot(cache.path(), "org/model", "aaaa");
        let main = snapshot(cache.path(), "org/model", "bbbb");
        let refs = cache.path().join("models--org--model").join("refs");
        std::fs::create_dir_all(&refs).unwrap();
        std::fs::write(refs.join("main"), "bbbb\n").unwrap();

        assert_eq!(get_model_cache_path(cache.path(), "org/model"), Some(main));
    }

    #[test]
    fn test_fallback_to_snapshot_with_config() {
        let cache = tempfile::tempdir().unwrap();
        let incomplete = cache
            .path()
            .join("models--org--model")
            .join("snapshots")
            .join("0000");
        std::fs::create_dir_all(&incomplete).unwrap();
        let complete = snapshot(cache.path(), "org/model", "ffff");

        assert_eq!(
            get_model_cache_path(cache.path(), "org/model"),
            Some(complete)
        );
    }

    #[test]
    fn test_dangling_ref_falls_back() {
        let cache = tempfile::tempdir().unwrap();
        let only = snapshot(cache.path(), "org/model", "cccc");
        let refs = cache.path().join("models--org--model").join("refs");
        std::fs::create_dir_all(&refs).unwrap();
        std::fs::write(refs.join("main"), "deleted-revision").unwrap();

        assert_eq!(get_model_cache_path(cache.path(), "org/model"), Some(only));
    }
}
