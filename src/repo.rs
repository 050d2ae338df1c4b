//! Source repository discovery and state
//!
//! Finds the tt-metal and tt-vllm checkouts by convention, clones them when
//! absent, and reads commit, branch and version through git.

use crate::config::{RepoConfig, Timeouts};
use crate::process::{CommandError, CommandRunner, Invocation};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Branch of a working tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    Named(String),
    /// Checked out at a commit rather than a branch
    Detached,
    /// git information could not be read
    Unknown,
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => write!(f, "{}", name),
            Self::Detached => write!(f, "(detached HEAD)"),
            Self::Unknown => write!(f, "(unknown)"),
        }
    }
}

/// Point-in-time view of one checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoState {
    pub name: String,
    pub path: PathBuf,
    pub exists: bool,
    /// Full hash of HEAD, None when unreadable
    pub commit: Option<String>,
    pub branch: BranchState,
    /// `git describe --tags --always`
    pub version: Option<String>,
}

impl RepoState {
    /// First 8 characters of the commit, or "unknown"
    pub fn short_commit(&self) -> String {
        self.commit
            .as_deref()
            .map(short_hash)
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Whether HEAD matches `wanted` (prefix comparison)
    pub fn is_at(&self, wanted: &str) -> bool {
        self.commit
            .as_deref()
            .is_some_and(|commit| commits_match(commit, wanted))
    }
}

/// Abbreviate a hash for display
pub fn short_hash(hash: &str) -> String {
    hash.chars().take(8).collect()
}

/// Two commit identifiers refer to the same commit
///
/// Both must be non-empty and one must be a case-insensitive prefix of the
/// other, so a short hash from the catalog matches a full hash from git.
pub fn commits_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.starts_with(&b) || b.starts_with(&a)
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("failed to clone {name} from {url} into {path:?}: {detail}")]
    Clone {
        name: String,
        url: String,
        path: PathBuf,
        detail: String,
    },
}

/// Reads and installs checkouts through a [`CommandRunner`]
#[derive(Clone)]
pub struct RepoLocator {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
}

impl RepoLocator {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self { runner, timeouts }
    }

    /// First candidate path holding a git checkout
    pub fn locate(&self, repo: &RepoConfig) -> Option<PathBuf> {
        repo.candidates()
            .into_iter()
            .find(|path| path.join(".git").exists())
    }

    /// Find an existing checkout or clone the upstream into the install path
    pub async fn locate_or_install(&self, repo: &RepoConfig) -> Result<RepoState, RepoError> {
        if let Some(path) = self.locate(repo) {
            tracing::debug!(repo = %repo.name, path = ?path, "Found existing checkout");
            return Ok(self.read_state(&repo.name, &path).await);
        }

        tracing::info!(
            repo = %repo.name,
            url = %repo.upstream_url,
            path = ?repo.install_path,
            "No checkout found, cloning"
        );

        let clone_error = |detail: String| RepoError::Clone {
            name: repo.name.clone(),
            url: repo.upstream_url.clone(),
            path: repo.install_path.clone(),
            detail,
        };

        if let Some(parent) = repo.install_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| clone_error(e.to_string()))?;
        }

        let invocation = Invocation::new("git")
            .arg("clone")
            .arg(&repo.upstream_url)
            .arg(repo.install_path.to_string_lossy())
            .env("GIT_TERMINAL_PROMPT", "0");

        let output = self
            .runner
            .run(&invocation, self.timeouts.network())
            .await
            .map_err(|e| clone_error(e.to_string()))?;

        if !output.success() {
            return Err(clone_error(output.diagnostic_tail(500)));
        }

        Ok(self.read_state(&repo.name, &repo.install_path).await)
    }

    /// Read commit, branch and version of a checkout
    ///
    /// Never fails: unreadable information is reported as None or
    /// [`BranchState::Unknown`] with a warning.
    pub async fn read_state(&self, name: &str, path: &Path) -> RepoState {
        let mut state = RepoState {
            name: name.to_string(),
            path: path.to_path_buf(),
            exists: path.join(".git").exists(),
            commit: None,
            branch: BranchState::Unknown,
            version: None,
        };

        if !state.exists {
            tracing::warn!(repo = %name, path = ?path, "Checkout does not exist");
            return state;
        }

        state.commit = self.git_line(path, &["rev-parse", "HEAD"]).await;
        if state.commit.is_none() {
            tracing::warn!(repo = %name, path = ?path, "Could not read current commit");
        }

        state.branch = match self.git_line(path, &["branch", "--show-current"]).await {
            Some(branch) => BranchState::Named(branch),
            None => match self
                .git_line(path, &["rev-parse", "--abbrev-ref", "HEAD"])
                .await
            {
                Some(head) if head == "HEAD" => BranchState::Detached,
                Some(branch) => BranchState::Named(branch),
                None => BranchState::Unknown,
            },
        };

        state.version = self
            .git_line(path, &["describe", "--tags", "--always"])
            .await;

        tracing::debug!(
            repo = %name,
            commit = ?state.commit,
            branch = %state.branch,
            version = ?state.version,
            "Read repository state"
        );

        state
    }

    /// First line of a successful git command's stdout, None if empty or failed
    async fn git_line(&self, path: &Path, args: &[&str]) -> Option<String> {
        let invocation = Invocation::git(path, args.iter().copied());
        match self.runner.run(&invocation, self.timeouts.git()).await {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .next()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
            Ok(output) => {
                tracing::debug!(
                    command = %invocation.display(),
                    exit_code = ?output.exit_code,
                    "git query failed"
                );
                None
            }
            Err(e) => {
                log_query_error(&invocation, &e);
                None
            }
        }
    }
}

fn log_query_error(invocation: &Invocation, error: &CommandError) {
    tracing::warn!(
        command = %invocation.display(),
        error = %error,
        "git query could not be run"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mocks::ScriptedRunner;

    const HEAD: &str = "3f9a2c1d4e5b6a7980112233445566778899aabb";

    fn git_checkout() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        dir
    }

    fn locator(runner: &Arc<ScriptedRunner>) -> RepoLocator {
        RepoLocator::new(runner.clone(), Timeouts::default())
    }

    #[test]
    fn test_commits_match() {
        assert!(commits_match(HEAD, "3f9a2c1d"));
        assert!(commits_match("3F9A2C1D", HEAD));
        assert!(commits_match(HEAD, HEAD));
        assert!(!commits_match(HEAD, "3f9a2c1e"));
        assert!(!commits_match(HEAD, ""));
        assert!(!commits_match("", ""));
    }

    #[test]
    fn test_branch_display() {
        assert_eq!(BranchState::Named("main".into()).to_string(), "main");
        assert_eq!(BranchState::Detached.to_string(), "(detached HEAD)");
        assert_eq!(BranchState::Unknown.to_string(), "(unknown)");
    }

    #[tokio::test]
    async fn test_read_state_named_branch() {
        let dir = git_checkout();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(0, &format!("{}\n", HEAD), "");
        runner.push_output(0, "main\n", "");
        runner.push_output(0, "v0.59.0-12-g3f9a2c1\n", "");

        let state = locator(&runner).read_state("tt-metal", dir.path()).await;

        assert!(state.exists);
        assert_eq!(state.commit.as_deref(), Some(HEAD));
        assert_eq!(state.branch, BranchState::Named("main".to_string()));
        assert_eq!(state.version.as_deref(), Some("v0.59.0-12-g3f9a2c1"));
        assert_eq!(state.short_commit(), "3f9a2c1d");
        assert!(state.is_at("3f9a2c1d4e"));

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].display(), "git rev-parse HEAD");
        assert_eq!(calls[0].cwd.as_deref(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_read_state_detached_head() {
        let dir = git_checkout();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(0, HEAD, "");
        runner.push_output(0, "", "");
        runner.push_output(0, "HEAD\n", "");
        runner.push_output(0, "3f9a2c1", "");

        let state = locator(&runner).read_state("tt-metal", dir.path()).await;

        assert_eq!(state.branch, BranchState::Detached);
        assert!(!state.branch.to_string().is_empty());
        assert_ne!(state.branch.to_string(), "main");
        assert_eq!(runner.calls()[2].display(), "git rev-parse --abbrev-ref HEAD");
    }

    #[tokio::test]
    async fn test_read_state_git_failure_is_unknown() {
        let dir = git_checkout();
        let runner = Arc::new(ScriptedRunner::new());
        for _ in 0..4 {
            runner.push_output(128, "", "fatal: not a git repository");
        }

        let state = locator(&runner).read_state("tt-vllm", dir.path()).await;

        assert!(state.exists);
        assert_eq!(state.commit, None);
        assert_eq!(state.branch, BranchState::Unknown);
        assert_eq!(state.short_commit(), "unknown");
        assert!(!state.is_at(HEAD));
    }

    #[tokio::test]
    async fn test_read_state_missing_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let state = locator(&runner)
            .read_state("tt-vllm", &dir.path().join("absent"))
            .await;

        assert!(!state.exists);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_locate_prefers_first_git_candidate() {
        let root = tempfile::tempdir().unwrap();
        let plain = root.path().join("plain");
        let second = root.path().join("second");
        std::fs::create_dir_all(&plain).unwrap();
        std::fs::create_dir_all(second.join(".git")).unwrap();

        let mut repo = RepoConfig::vllm();
        repo.search_paths = vec![root.path().join("missing"), plain, second.clone()];

        let runner = Arc::new(ScriptedRunner::new());
        assert_eq!(locator(&runner).locate(&repo), Some(second));
    }

    #[tokio::test]
    async fn test_clone_when_absent() {
        let root = tempfile::tempdir().unwrap();
        let mut repo = RepoConfig::vllm();
        repo.search_paths = vec![root.path().join("nowhere")];
        repo.install_path = root.path().join("src").join("tt-vllm");

        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(0, "", "Cloning into 'tt-vllm'...");

        let state = locator(&runner).locate_or_install(&repo).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].program, "git");
        assert_eq!(calls[0].args[0], "clone");
        assert_eq!(calls[0].args[1], repo.upstream_url);
        assert_eq!(state.path, repo.install_path);
        // The scripted clone creates nothing on disk
        assert!(!state.exists);
    }

    #[tokio::test]
    async fn test_clone_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let mut repo = RepoConfig::metal();
        repo.home_env = None;
        repo.search_paths = vec![];
        repo.install_path = root.path().join("tt-metal");

        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(128, "", "fatal: unable to access 'https://github.com/'");

        let err = locator(&runner).locate_or_install(&repo).await.unwrap_err();
        assert!(err.to_string().contains("unable to access"));
    }
}
