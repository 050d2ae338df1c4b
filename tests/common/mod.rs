//! Shared fakes for integration tests
//!
//! `FakeGit` simulates git working trees keyed by directory, plus the
//! hardware detection and build scripts, so reconciliation runs end to end
//! without touching real repositories.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tt_jukebox::config::{Config, RepoConfig, ServeOptions};
use tt_jukebox::process::{CommandError, CommandOutput, CommandRunner, Invocation};
use tt_jukebox::session::Prompter;
use tt_jukebox::specs::{CatalogError, SpecSource};
use tt_jukebox::weights::{DownloadError, WeightDownloader};

pub const METAL_OLD: &str = "aaaaaaaa11111111111111111111111111111111";
pub const METAL_PINNED: &str = "bbbbbbbb22222222222222222222222222222222";
pub const VLLM_OLD: &str = "cccccccc33333333333333333333333333333333";
pub const VLLM_PINNED: &str = "dddddddd44444444444444444444444444444444";

pub const SMI_N150: &str = r#"{
  "device_info": [
    { "board_info": { "board_type": "n150 L" }, "firmwares": { "fw_bundle_version": "18.3.0.0" } }
  ]
}"#;

// ============================================================================
// Fake command runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeRepo {
    pub head: String,
    pub branch: Option<String>,
    pub dirty: bool,
    /// Commits reachable after `git fetch`
    pub known: HashSet<String>,
    pub stash_fails: bool,
    /// Stash leaves the tree dirty (e.g. conflicting index state)
    pub stash_ineffective: bool,
    pub submodules_fail: bool,
}

impl FakeRepo {
    pub fn at(head: &str) -> Self {
        Self {
            head: head.to_string(),
            branch: Some("main".to_string()),
            dirty: false,
            known: [METAL_OLD, METAL_PINNED, VLLM_OLD, VLLM_PINNED]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            stash_fails: false,
            stash_ineffective: false,
            submodules_fail: false,
        }
    }
}

#[derive(Default)]
struct FakeState {
    repos: HashMap<PathBuf, FakeRepo>,
    smi_output: Option<String>,
    build_exit: i32,
    serve_exit: i32,
    calls: Vec<Invocation>,
}

/// Simulated git, tt-smi, build scripts and shell
#[derive(Default)]
pub struct FakeGit {
    state: Mutex<FakeState>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a working tree; creates `<path>/.git` so it is discoverable
    pub fn add_repo(&self, path: &Path, repo: FakeRepo) {
        std::fs::create_dir_all(path.join(".git")).unwrap();
        self.state
            .lock()
            .unwrap()
            .repos
            .insert(path.to_path_buf(), repo);
    }

    pub fn with_repo<R>(&self, path: &Path, f: impl FnOnce(&mut FakeRepo) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(state.repos.get_mut(path).expect("unknown fake repo"))
    }

    pub fn head(&self, path: &Path) -> String {
        self.with_repo(path, |r| r.head.clone())
    }

    pub fn set_smi_output(&self, output: &str) {
        self.state.lock().unwrap().smi_output = Some(output.to_string());
    }

    pub fn set_build_exit(&self, code: i32) {
        self.state.lock().unwrap().build_exit = code;
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Calls that change a working tree or run a build
    pub fn mutating_calls(&self) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|inv| !is_read_only(inv))
            .collect()
    }

    /// Mutating calls made inside `dir`
    pub fn mutating_calls_in(&self, dir: &Path) -> Vec<String> {
        self.mutating_calls()
            .into_iter()
            .filter(|inv| inv.cwd.as_deref() == Some(dir))
            .map(|inv| inv.display())
            .collect()
    }

    fn handle(&self, inv: &Invocation) -> Result<CommandOutput, CommandError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(inv.clone());

        match inv.program.as_str() {
            "tt-smi" => match &state.smi_output {
                Some(out) => Ok(ok(out)),
                None => Err(CommandError::Spawn {
                    program: "tt-smi".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            },
            "git" => Ok(git(&mut state, inv)),
            "bash" => Ok(exit(state.serve_exit, "", "")),
            _ => Ok(exit(state.build_exit, "", "build failed: missing toolchain")),
        }
    }
}

fn is_read_only(inv: &Invocation) -> bool {
    if inv.program == "tt-smi" {
        return true;
    }
    inv.program == "git"
        && matches!(
            inv.args.first().map(String::as_str),
            Some("rev-parse" | "branch" | "describe" | "status")
        )
}

fn ok(stdout: &str) -> CommandOutput {
    exit(0, stdout, "")
}

fn exit(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

fn git(state: &mut FakeState, inv: &Invocation) -> CommandOutput {
    let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();

    if args.first() == Some(&"clone") {
        let path = PathBuf::from(args[2]);
        std::fs::create_dir_all(path.join(".git")).unwrap();
        state.repos.insert(path, FakeRepo::at(METAL_OLD));
        return ok("");
    }

    let Some(repo) = inv.cwd.as_ref().and_then(|cwd| state.repos.get_mut(cwd)) else {
        return exit(128, "", "fatal: not a git repository");
    };

    match args.as_slice() {
        ["rev-parse", "HEAD"] => ok(&format!("{}\n", repo.head)),
        ["branch", "--show-current"] => ok(repo.branch.as_deref().unwrap_or("")),
        ["rev-parse", "--abbrev-ref", "HEAD"] => ok(repo.branch.as_deref().unwrap_or("HEAD")),
        ["describe", "--tags", "--always"] => ok(&repo.head[..7]),
        ["status", "--porcelain", "--untracked-files=no"] => {
            ok(if repo.dirty { " M tt_metal/CMakeLists.txt\n" } else { "" })
        }
        ["stash", "push", "-m", _] => {
            if repo.stash_fails {
                exit(1, "", "error: could not write index")
            } else {
                if !repo.stash_ineffective {
                    repo.dirty = false;
                }
                ok("Saved working directory and index state")
            }
        }
        ["fetch", "origin"] => ok(""),
        ["checkout", commit] => {
            match repo.known.iter().find(|k| k.starts_with(commit)).cloned() {
                Some(full) => {
                    repo.head = full;
                    repo.branch = None;
                    ok("")
                }
                None => exit(
                    1,
                    "",
                    &format!("error: pathspec '{}' did not match any file(s) known to git", commit),
                ),
            }
        }
        ["submodule", "update", "--init", "--recursive"] => {
            if repo.submodules_fail {
                exit(1, "", "fatal: could not read from remote repository")
            } else {
                ok("")
            }
        }
        _ => exit(1, "", "unsupported fake git command"),
    }
}

#[async_trait]
impl CommandRunner for FakeGit {
    async fn run(
        &self,
        invocation: &Invocation,
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.handle(invocation)
    }
}

// ============================================================================
// Fake downloader
// ============================================================================

pub enum DownloadBehavior {
    /// Writes a config.json into the given snapshot directory
    Succeed(PathBuf),
    /// Requires a token
    Gated(PathBuf),
    Fail(String),
}

pub struct FakeDownloader {
    behavior: DownloadBehavior,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeDownloader {
    pub fn new(behavior: DownloadBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

fn materialize(path: &Path) -> PathBuf {
    std::fs::create_dir_all(path).unwrap();
    std::fs::write(path.join("config.json"), "{}").unwrap();
    path.to_path_buf()
}

#[async_trait]
impl WeightDownloader for FakeDownloader {
    async fn download(&self, repo_id: &str, token: Option<&str>) -> Result<PathBuf, DownloadError> {
        self.calls
            .lock()
            .unwrap()
            .push((repo_id.to_string(), token.map(str::to_string)));

        match &self.behavior {
            DownloadBehavior::Succeed(path) => Ok(materialize(path)),
            DownloadBehavior::Gated(path) => match token {
                Some(_) => Ok(materialize(path)),
                None => Err(DownloadError::AuthRequired {
                    repo_id: repo_id.to_string(),
                }),
            },
            DownloadBehavior::Fail(detail) => Err(DownloadError::Failed {
                repo_id: repo_id.to_string(),
                detail: detail.clone(),
            }),
        }
    }
}

// ============================================================================
// Catalog source and prompter
// ============================================================================

pub struct StaticSource {
    document: Mutex<Option<serde_json::Value>>,
}

impl StaticSource {
    pub fn new(document: serde_json::Value) -> Self {
        Self {
            document: Mutex::new(Some(document)),
        }
    }

    pub fn offline() -> Self {
        Self {
            document: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SpecSource for StaticSource {
    async fn fetch(&self) -> Result<serde_json::Value, CatalogError> {
        self.document
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CatalogError::Fetch {
                url: "static".to_string(),
                detail: "offline".to_string(),
            })
    }
}

pub struct ScriptedPrompter {
    interactive: bool,
    answers: Mutex<VecDeque<String>>,
}

impl ScriptedPrompter {
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            answers: Mutex::new(VecDeque::new()),
        }
    }

    pub fn answering(answers: &[&str]) -> Self {
        Self {
            interactive: true,
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
        }
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    async fn ask(&self, _question: &str) -> Option<String> {
        self.answers.lock().unwrap().pop_front()
    }
}

/// Interactive prompter whose questions are never answered, like a user
/// who walks away from the terminal
#[derive(Default)]
pub struct StalledPrompter {
    asked: AtomicUsize,
}

impl StalledPrompter {
    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompter for StalledPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    async fn ask(&self, _question: &str) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Configuration rooted entirely inside `root`
pub fn test_config(root: &Path) -> Config {
    let repo = |name: &str, base: RepoConfig| RepoConfig {
        install_path: root.join(name),
        search_paths: vec![root.join(name)],
        home_env: None,
        ..base
    };

    Config {
        scratch_dir: root.join("scratch"),
        metal: repo("tt-metal", RepoConfig::metal()),
        vllm: repo("tt-vllm", RepoConfig::vllm()),
        models_dir: root.join("models"),
        hf_cache_dir: Some(root.join("hub")),
        serve: ServeOptions {
            venv: root.join("venv"),
            ..ServeOptions::default()
        },
        ..Config::default()
    }
}

pub fn spec_json(name: &str, device: &str) -> serde_json::Value {
    serde_json::json!({
        "model_name": name,
        "model_id": format!("id_tt-transformers_{}_{}", name, device.to_lowercase()),
        "hf_model_repo": format!("meta-llama/{}", name),
        "device_type": device,
        "tt_metal_commit": &METAL_PINNED[..10],
        "vllm_commit": &VLLM_PINNED[..8],
        "status": "COMPLETE",
        "param_count": 8,
        "device_model_spec": { "max_context": 131072, "max_num_seqs": 32, "block_size": 64 },
        "env_vars": { "ARCH_NAME": "wormhole_b0" }
    })
}

/// Place weights for `model_name` under the models directory
pub fn install_weights(config: &Config, model_name: &str) -> PathBuf {
    materialize(&config.models_dir.join(model_name))
}
