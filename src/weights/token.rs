//! HuggingFace access token resolution

use std::path::PathBuf;

/// Where a resolved token came from, for log lines that must not print it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    CommandLine,
    Environment,
    TokenFile,
}

/// Resolve a token: `--hf-token`, then `HF_TOKEN`, then the stored login token
pub fn resolve_token(cli: Option<&str>) -> Option<(String, TokenSource)> {
    if let Some(token) = non_empty(cli) {
        return Some((token, TokenSource::CommandLine));
    }

    if let Some(token) = non_empty(std::env::var("HF_TOKEN").ok().as_deref()) {
        return Some((token, TokenSource::Environment));
    }

    let path = token_file()?;
    let content = std::fs::read_to_string(&path).ok()?;
    non_empty(Some(&content)).map(|token| (token, TokenSource::TokenFile))
}

/// Token written by `huggingface-cli login`
fn token_file() -> Option<PathBuf> {
    if let Ok(hf_home) = std::env::var("HF_HOME") {
        return Some(PathBuf::from(hf_home).join("token"));
    }
    dirs::home_dir().map(|home| home.join(".cache").join("huggingface").join("token"))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
