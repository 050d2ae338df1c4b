//! Model weight download using hf-hub
//!
//! A metadata request against the hub API runs first so that gated or
//! private repositories fail fast with an actionable message instead of
//! partway through a multi-gigabyte download.

use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(
        "HuggingFace authentication required for {repo_id}. Either:\n  \
         1. Set HF_TOKEN: export HF_TOKEN=hf_...\n  \
         2. Pass --hf-token <token>\n  \
         3. Or login with: huggingface-cli login"
    )]
    AuthRequired { repo_id: String },

    #[error("failed to download {repo_id}: {detail}")]
    Failed { repo_id: String, detail: String },
}

/// Capability for fetching a repository's weights into local storage
#[async_trait]
pub trait WeightDownloader: Send + Sync {
    /// Download every file of `repo_id`, returning the local snapshot directory
    async fn download(&self, repo_id: &str, token: Option<&str>) -> Result<PathBuf, DownloadError>;
}

/// Outcome of the metadata request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Proceed,
    AuthRequired,
    Failed(String),
}

/// Decide from the metadata response whether a download can start
pub fn classify_preflight(
    status: u16,
    body: Option<&serde_json::Value>,
    has_token: bool,
) -> Preflight {
    match status {
        401 | 403 => Preflight::AuthRequired,
        // The hub answers 404 for private repositories when anonymous
        404 if !has_token => Preflight::AuthRequired,
        404 => Preflight::Failed("repository not found".to_string()),
        200..=299 => {
            let gated = body
                .and_then(|b| b.get("gated"))
                .is_some_and(|g| !matches!(g, serde_json::Value::Bool(false) | serde_json::Value::Null));
            if gated && !has_token {
                Preflight::AuthRequired
            } else {
                Preflight::Proceed
            }
        }
        other => Preflight::Failed(format!("hub API returned HTTP {}", other)),
    }
}

/// Whether an hf-hub error message reports an authorization failure
pub fn is_auth_failure(message: &str) -> bool {
    ["401", "403", "Unauthorized", "Forbidden", "gated"]
        .iter()
        .any(|marker| message.contains(marker))
}

/// Snapshot root for a downloaded file, undoing the file's relative path
pub fn snapshot_root(file_path: &Path, rfilename: &str) -> Option<PathBuf> {
    let depth = rfilename.split('/').filter(|c| !c.is_empty()).count();
    file_path.ancestors().nth(depth).map(Path::to_path_buf)
}

/// Production downloader backed by the HuggingFace Hub
pub struct HfHubDownloader {
    endpoint: String,
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl HfHubDownloader {
    pub fn new(endpoint: impl Into<String>, cache_dir: PathBuf) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            cache_dir,
            client: reqwest::Client::new(),
        }
    }

    async fn preflight(&self, repo_id: &str, token: Option<&str>) -> Preflight {
        let url = format!("{}/api/models/{}", self.endpoint, repo_id);
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Preflight::Failed(e.to_string()),
        };

        let status = response.status().as_u16();
        let body = response.json::<serde_json::Value>().await.ok();
        let outcome = classify_preflight(status, body.as_ref(), token.is_some());

        tracing::debug!(
            repo_id = %repo_id,
            status = status,
            outcome = ?outcome,
            "HuggingFace preflight"
        );
        outcome
    }
}

#[async_trait]
impl WeightDownloader for HfHubDownloader {
    async fn download(&self, repo_id: &str, token: Option<&str>) -> Result<PathBuf, DownloadError> {
        let failed = |detail: String| DownloadError::Failed {
            repo_id: repo_id.to_string(),
            detail,
        };
        let classify = |detail: String| {
            if is_auth_failure(&detail) {
                DownloadError::AuthRequired {
                    repo_id: repo_id.to_string(),
                }
            } else {
                failed(detail)
            }
        };

        match self.preflight(repo_id, token).await {
            Preflight::Proceed => {}
            Preflight::AuthRequired => {
                return Err(DownloadError::AuthRequired {
                    repo_id: repo_id.to_string(),
                });
            }
            Preflight::Failed(detail) => return Err(failed(detail)),
        }

        tracing::info!(
            repo_id = %repo_id,
            cache_dir = ?self.cache_dir,
            "Starting model download via hf-hub"
        );

        let api = ApiBuilder::new()
            .with_token(token.map(str::to_string))
            .with_cache_dir(self.cache_dir.clone())
            .with_endpoint(self.endpoint.clone())
            .with_progress(true)
            .build()
            .map_err(|e| failed(format!("failed to create HF API client: {}", e)))?;

        let repo = api.model(repo_id.to_string());
        let info = repo.info().await.map_err(|e| classify(e.to_string()))?;

        let mut snapshot = None;
        for sibling in &info.siblings {
            tracing::debug!(repo_id = %repo_id, file = %sibling.rfilename, "Downloading file");
            let path = repo
                .get(&sibling.rfilename)
                .await
                .map_err(|e| classify(format!("{}: {}", sibling.rfilename, e)))?;
            if snapshot.is_none() {
                snapshot = snapshot_root(&path, &sibling.rfilename);
            }
        }

        let snapshot = snapshot.ok_or_else(|| failed("repository has no files".to_string()))?;
        tracing::info!(
            repo_id = %repo_id,
            files = info.siblings.len(),
            path = ?snapshot,
            "Model download complete"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_preflight() {
        assert_eq!(classify_preflight(401, None, true), Preflight::AuthRequired);
        assert_eq!(classify_preflight(403, None, true), Preflight::AuthRequired);
        assert_eq!(classify_preflight(404, None, false), Preflight::AuthRequired);
        assert!(matches!(classify_preflight(404, None, true), Preflight::Failed(_)));
        assert!(matches!(classify_preflight(500, None, true), Preflight::Failed(_)));
    }

    #[test]
    fn test_gated_model_needs_token() {
        let gated = json!({ "id": "meta-llama/Llama-3.1-8B-Instruct", "gated": "manual" });
        let open = json!({ "id": "Qwen/Qwen2.5-7B-Instruct", "gated": false });

        assert_eq!(
            classify_preflight(200, Some(&gated), false),
            Preflight::AuthRequired
        );
        assert_eq!(classify_preflight(200, Some(&gated), true), Preflight::Proceed);
        assert_eq!(classify_preflight(200, Some(&open), false), Preflight::Proceed);
        assert_eq!(classify_preflight(200, None, false), Preflight::Proceed);
    }

    #[test]
    fn test_is_auth_failure() {
        assert!(is_auth_failure("request error: HTTP status client error (403 Forbidden)"));
        assert!(is_auth_failure("status 401"));
        assert!(!is_auth_failure("connection reset by peer"));
    }

    #[test]
    fn test_snapshot_root() {
        let snapshot = PathBuf::from("/cache/models--org--m/snapshots/abc");
        assert_eq!(
            snapshot_root(&snapshot.join("config.json"), "config.json"),
            Some(snapshot.clone())
        );
        assert_eq!(
            snapshot_root(&snapshot.join("onnx").join("model.onnx"), "onnx/model.onnx"),
            Some(snapshot)
        );
    }

    #[test]
    fn test_auth_message_is_actionable() {
        let message = DownloadError::AuthRequired {
            repo_id: "meta-llama/Llama-3.1-8B-Instruct".to_string(),
        }
        .to_string();

        assert!(message.contains("export HF_TOKEN=hf_..."));
        assert!(message.contains("--hf-token"));
        assert!(message.contains("huggingface-cli login"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let cache = tempfile::tempdir().unwrap();
        let downloader = HfHubDownloader::new("http://127.0.0.1:9/", cache.path().to_path_buf());

        let err = downloader.download("org/model", None).await.unwrap_err();
        assert!(matches!(err, DownloadError::Failed { .. }));
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_download_small_model() {
        let cache = tempfile::tempdir().unwrap();
        let downloader =
            HfHubDownloader::new("https://huggingface.co", cache.path().to_path_buf());

        let path = downloader
            .download("hf-internal-testing/tiny-random-gpt2", None)
            .await
            .unwrap();
        assert!(path.join("config.json").exists());
    }
}
