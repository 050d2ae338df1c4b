//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Working directory for the spec cache and log files
    pub scratch_dir: PathBuf,
    /// URL of the validated model spec document
    pub specs_url: String,
    pub cache_ttl_secs: u64,
    /// Hardware diagnostic binary
    pub smi_binary: String,
    pub timeouts: Timeouts,
    pub metal: RepoConfig,
    pub vllm: RepoConfig,
    /// User-facing models directory, weights live in `<models_dir>/<model_name>`
    pub models_dir: PathBuf,
    /// HuggingFace hub cache (`$HF_HOME/hub` when unset)
    pub hf_cache_dir: Option<PathBuf>,
    pub hf_endpoint: String,
    pub serve: ServeOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch_dir: home().join("tt-scratchpad"),
            specs_url: default_specs_url(),
            cache_ttl_secs: 3600,
            smi_binary: "tt-smi".to_string(),
            timeouts: Timeouts::default(),
            metal: RepoConfig::metal(),
            vllm: RepoConfig::vllm(),
            models_dir: home().join("models"),
            hf_cache_dir: None,
            hf_endpoint: "https://huggingface.co".to_string(),
            serve: ServeOptions::default(),
        }
    }
}

impl Config {
    /// Default config file location: `~/.config/tt-jukebox/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tt-jukebox").join("config.toml"))
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// An explicit path must exist. Without one, the default location is used
    /// when present and built-in defaults otherwise.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| Self::default_path().filter(|p| p.exists()));

        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.expand_paths();
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.scratch_dir = expand_home(&self.scratch_dir);
        self.models_dir = expand_home(&self.models_dir);
        self.hf_cache_dir = self.hf_cache_dir.as_deref().map(expand_home);
        self.serve.venv = expand_home(&self.serve.venv);
        for repo in [&mut self.metal, &mut self.vllm] {
            repo.install_path = expand_home(&repo.install_path);
            repo.search_paths = repo.search_paths.iter().map(|p| expand_home(p)).collect();
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("TT_JUKEBOX_SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("TT_JUKEBOX_SPECS_URL") {
            self.specs_url = url;
        }
        if let Ok(ttl) = std::env::var("TT_JUKEBOX_CACHE_TTL_SECS") {
            self.cache_ttl_secs = ttl
                .parse()
                .context("Invalid TT_JUKEBOX_CACHE_TTL_SECS value")?;
        }
        if let Ok(dir) = std::env::var("TT_JUKEBOX_MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }
        if let Ok(hf_home) = std::env::var("HF_HOME") {
            self.hf_cache_dir.get_or_insert_with(|| PathBuf::from(hf_home).join("hub"));
        }
        if let Ok(endpoint) = std::env::var("HF_ENDPOINT") {
            self.hf_endpoint = endpoint;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.specs_url.trim().is_empty() {
            anyhow::bail!("specs_url cannot be empty");
        }
        if self.cache_ttl_secs == 0 {
            anyhow::bail!("cache_ttl_secs must be > 0");
        }
        if self.smi_binary.trim().is_empty() {
            anyhow::bail!("smi_binary cannot be empty");
        }
        if self.serve.port == 0 {
            anyhow::bail!("serve.port must be > 0");
        }
        if self
            .serve
            .launcher
            .as_deref()
            .is_some_and(|launcher| launcher.trim().is_empty())
        {
            anyhow::bail!("serve.launcher cannot be empty; remove it to use the bundled launcher");
        }

        for repo in [&self.metal, &self.vllm] {
            if repo.name.is_empty() {
                anyhow::bail!("Repository name cannot be empty");
            }
            if repo.upstream_url.is_empty() {
                anyhow::bail!("Repository '{}' has no upstream_url", repo.name);
            }
            if repo.install_path.as_os_str().is_empty() {
                anyhow::bail!("Repository '{}' has no install_path", repo.name);
            }
        }

        if self.metal.install_path == self.vllm.install_path {
            anyhow::bail!(
                "metal and vllm share the install path {:?}",
                self.metal.install_path
            );
        }

        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.scratch_dir.join("cache")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.scratch_dir.join("logs")
    }

    /// Where the bundled launcher script is written
    pub fn launcher_dir(&self) -> PathBuf {
        self.scratch_dir.join("bin")
    }

    /// Resolved HuggingFace hub cache directory
    pub fn hf_cache(&self) -> PathBuf {
        self.hf_cache_dir
            .clone()
            .unwrap_or_else(crate::weights::default_hf_cache_dir)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Timeouts for every external operation, in seconds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    pub detect_secs: u64,
    pub fetch_secs: u64,
    /// Local git operations (status, stash, checkout, rev-parse)
    pub git_secs: u64,
    /// Networked git operations (clone, fetch)
    pub network_secs: u64,
    pub submodule_secs: u64,
    pub build_secs: u64,
    pub download_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            detect_secs: 10,
            fetch_secs: 10,
            git_secs: 60,
            network_secs: 300,
            submodule_secs: 300,
            build_secs: 900,
            download_secs: 1800,
        }
    }
}

impl Timeouts {
    pub fn detect(&self) -> Duration {
        Duration::from_secs(self.detect_secs)
    }
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }
    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }
    pub fn network(&self) -> Duration {
        Duration::from_secs(self.network_secs)
    }
    pub fn submodule(&self) -> Duration {
        Duration::from_secs(self.submodule_secs)
    }
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }
    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }
}

/// One external source repository
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepoConfig {
    /// Display name ("tt-metal", "tt-vllm")
    pub name: String,
    pub upstream_url: String,
    /// Where the repository is cloned when no existing checkout is found
    pub install_path: PathBuf,
    /// Existing checkouts are looked for here, in order
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Environment variable naming a checkout, searched before `search_paths`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_env: Option<String>,
    /// Build command run inside the checkout after its commit changes
    #[serde(default)]
    pub build_command: Vec<String>,
}

impl RepoConfig {
    pub fn metal() -> Self {
        Self {
            name: "tt-metal".to_string(),
            upstream_url: "https://github.com/tenstorrent/tt-metal.git".to_string(),
            install_path: home().join("tt-metal"),
            search_paths: vec![
                home().join("tt-metal"),
                home().join("tenstorrent").join("tt-metal"),
                PathBuf::from("/opt/tt-metal"),
            ],
            home_env: Some("TT_METAL_HOME".to_string()),
            build_command: vec!["./build_metal.sh".to_string()],
        }
    }

    pub fn vllm() -> Self {
        Self {
            name: "tt-vllm".to_string(),
            upstream_url: "https://github.com/tenstorrent/vllm.git".to_string(),
            install_path: home().join("tt-vllm"),
            search_paths: vec![
                home().join("tt-vllm"),
                home().join("vllm"),
                home().join("tenstorrent").join("vllm"),
            ],
            home_env: None,
            build_command: Vec::new(),
        }
    }

    /// Candidate checkout locations, environment override first
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(self.search_paths.len() + 1);
        if let Some(var) = &self.home_env
            && let Ok(value) = std::env::var(var)
            && !value.is_empty()
        {
            paths.push(PathBuf::from(value));
        }
        for path in &self.search_paths {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

/// Settings that shape the rendered server command
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServeOptions {
    /// Python virtualenv activated before launching the server
    pub venv: PathBuf,
    /// Program and leading arguments that start the OpenAI-compatible server.
    /// Unset runs the bundled launcher that registers the TT models.
    pub launcher: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            venv: home().join("tt-vllm-venv"),
            launcher: None,
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

fn default_specs_url() -> String {
    "https://raw.githubusercontent.com/tenstorrent/tt-inference-server/main/model_specs_output.json"
        .to_string()
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
