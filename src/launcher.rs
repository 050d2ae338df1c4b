//! Bundled vLLM launcher script
//!
//! vLLM's own entrypoint does not know the Tenstorrent model
//! implementations in tt-metal. The bundled script registers them with
//! vLLM's `ModelRegistry` and then runs the OpenAI-compatible server.
//! It is written under the scratch directory on demand.

use crate::command::shell_quote;
use crate::config::ServeOptions;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const SCRIPT_NAME: &str = "start-vllm-server.py";

/// Script contents, embedded at build time
pub const SCRIPT: &str = include_str!("../assets/start-vllm-server.py");

/// Write the launcher into `dir` unless an identical copy is already there
pub async fn install(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(SCRIPT_NAME);

    if fs::read_to_string(&path)
        .await
        .is_ok_and(|existing| existing == SCRIPT)
    {
        tracing::debug!(path = ?path, "Launcher already installed");
        return Ok(path);
    }

    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create launcher directory: {:?}", dir))?;

    // Atomic write: temp file, then rename
    let temp = dir.join(format!("{}.tmp", SCRIPT_NAME));
    fs::write(&temp, SCRIPT)
        .await
        .with_context(|| format!("Failed to write launcher: {:?}", temp))?;
    fs::rename(&temp, &path)
        .await
        .with_context(|| format!("Failed to install launcher: {:?}", path))?;

    tracing::info!(path = ?path, "Installed vLLM launcher");
    Ok(path)
}

/// Launcher command for the rendered server command
///
/// A launcher set in the configuration is used verbatim; otherwise the
/// bundled script is installed into `dir` and run with `python`.
pub async fn resolve(serve: &ServeOptions, dir: &Path) -> Result<String> {
    if let Some(custom) = serve.launcher.as_deref() {
        return Ok(custom.to_string());
    }
    let path = install(dir).await?;
    Ok(format!("python {}", shell_quote(&path.to_string_lossy())))
}
