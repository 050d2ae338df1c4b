//! Environment reconciliation
//!
//! Brings the two source checkouts and the model weights into agreement with
//! a chosen spec record. The work is a fixed sequence of sub-goals:
//!
//! ```text
//! MetalCheckout -> MetalBuild -> VllmCheckout -> VllmBuild -> Weights -> Ready
//! ```
//!
//! [`plan`] is a pure function over observed state that lists the pending
//! sub-goals, used for display and confirmation. [`Reconciler::reconcile`]
//! re-observes and executes; satisfied sub-goals only print a confirmation,
//! so a second run performs no mutating actions.

use crate::config::{Config, RepoConfig, Timeouts};
use crate::display;
use crate::hardware::Hardware;
use crate::matcher::Candidate;
use crate::process::{CommandError, CommandOutput, CommandRunner, Invocation};
use crate::repo::{RepoLocator, RepoState, short_hash};
use crate::specs::ModelSpec;
use crate::weights::{DownloadError, WeightDownloader, WeightLocator, WeightsLocation};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Selection and Requirements
// ============================================================================

/// Everything decided before reconciliation starts. Immutable once built.
#[derive(Debug, Clone)]
pub struct SelectionContext {
    /// Chosen spec, runtime parameters already derated when experimental
    pub spec: ModelSpec,
    /// Device label for the server environment
    pub device: String,
    pub experimental: bool,
    pub force: bool,
    pub token: Option<String>,
}

impl SelectionContext {
    /// The detected device wins over the spec's own device type, so an
    /// experimental N150 spec run on an N300 targets the N300
    pub fn new(candidate: Candidate, hardware: &Hardware, force: bool, token: Option<String>) -> Self {
        let device = hardware
            .device_type()
            .map(str::to_string)
            .unwrap_or_else(|| candidate.spec.device_type.to_uppercase());
        Self {
            spec: candidate.spec,
            device,
            experimental: candidate.experimental,
            force,
            token,
        }
    }
}

/// What the chosen spec requires of the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirements {
    pub metal_commit: Option<String>,
    pub vllm_commit: Option<String>,
    pub hf_repo: String,
    pub build_vllm: bool,
}

impl Requirements {
    pub fn new(spec: &ModelSpec, vllm: &RepoConfig) -> Self {
        Self {
            metal_commit: spec.tt_metal_commit.clone(),
            vllm_commit: spec.vllm_commit.clone(),
            hf_repo: spec.hf_model_repo.clone(),
            build_vllm: !vllm.build_command.is_empty(),
        }
    }
}

// ============================================================================
// Sub-goals and Planning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubGoal {
    MetalCheckout,
    MetalBuild,
    VllmCheckout,
    VllmBuild,
    Weights,
}

impl fmt::Display for SubGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MetalCheckout => "tt-metal checkout",
            Self::MetalBuild => "tt-metal build",
            Self::VllmCheckout => "tt-vllm checkout",
            Self::VllmBuild => "tt-vllm build",
            Self::Weights => "model weights",
        };
        f.write_str(name)
    }
}

/// Current state of everything reconciliation touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub metal: RepoState,
    pub vllm: RepoState,
    pub weights: WeightsLocation,
}

/// A pending sub-goal with a human-readable description of the change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub goal: SubGoal,
    pub detail: String,
}

/// Pending sub-goals, in execution order
///
/// A build is pending only together with its checkout. A repository whose
/// spec pins no commit is left alone.
pub fn plan(observed: &Observed, requirements: &Requirements) -> Vec<PlannedStep> {
    let mut steps = Vec::new();

    if let Some(commit) = pending_commit(&observed.metal, requirements.metal_commit.as_deref()) {
        steps.push(PlannedStep {
            goal: SubGoal::MetalCheckout,
            detail: describe_move(&observed.metal, commit),
        });
        steps.push(PlannedStep {
            goal: SubGoal::MetalBuild,
            detail: "rebuild after commit change".to_string(),
        });
    }

    if let Some(commit) = pending_commit(&observed.vllm, requirements.vllm_commit.as_deref()) {
        steps.push(PlannedStep {
            goal: SubGoal::VllmCheckout,
            detail: describe_move(&observed.vllm, commit),
        });
        if requirements.build_vllm {
            steps.push(PlannedStep {
                goal: SubGoal::VllmBuild,
                detail: "rebuild after commit change".to_string(),
            });
        }
    }

    if !observed.weights.present {
        steps.push(PlannedStep {
            goal: SubGoal::Weights,
            detail: format!(
                "download {} (not found at {})",
                requirements.hf_repo,
                observed.weights.path.display()
            ),
        });
    }

    steps
}

fn pending_commit<'a>(state: &RepoState, wanted: Option<&'a str>) -> Option<&'a str> {
    wanted.filter(|commit| !state.is_at(commit))
}

fn describe_move(state: &RepoState, commit: &str) -> String {
    format!("{} -> {}", state.short_commit(), short_hash(commit))
}

// ============================================================================
// Actions, Report and Errors
// ============================================================================

/// A mutating action performed during reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Stash { repo: String },
    Fetch { repo: String },
    Checkout {
        repo: String,
        from: Option<String>,
        to: String,
    },
    SubmoduleUpdate { repo: String },
    Build { repo: String },
    Download { repo_id: String, path: PathBuf },
}

impl Action {
    /// Repository the action touched, None for downloads
    pub fn repo(&self) -> Option<&str> {
        match self {
            Self::Stash { repo }
            | Self::Fetch { repo }
            | Self::Checkout { repo, .. }
            | Self::SubmoduleUpdate { repo }
            | Self::Build { repo } => Some(repo),
            Self::Download { .. } => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stash { repo } => write!(f, "{}: stashed local changes", repo),
            Self::Fetch { repo } => write!(f, "{}: fetched origin", repo),
            Self::Checkout { repo, from, to } => write!(
                f,
                "{}: checked out {} (was {})",
                repo,
                short_hash(to),
                from.as_deref().map(short_hash).unwrap_or_else(|| "unknown".to_string())
            ),
            Self::SubmoduleUpdate { repo } => write!(f, "{}: updated submodules", repo),
            Self::Build { repo } => write!(f, "{}: rebuilt", repo),
            Self::Download { repo_id, path } => {
                write!(f, "downloaded {} to {}", repo_id, path.display())
            }
        }
    }
}

/// Outcome of a successful reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub actions: Vec<Action>,
    pub metal: RepoState,
    pub vllm: RepoState,
    pub weights_path: PathBuf,
}

impl ReconcileReport {
    /// Report for an observation that already meets every requirement
    pub fn from_satisfied(observed: Observed, requirements: &Requirements) -> Option<Self> {
        if !observed.metal.exists || !observed.vllm.exists {
            return None;
        }
        plan(&observed, requirements).is_empty().then(|| Self {
            actions: Vec::new(),
            metal: observed.metal,
            vllm: observed.vllm,
            weights_path: observed.weights.path,
        })
    }

    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{goal} failed: {path:?} is not a git checkout")]
    NotInstalled { goal: SubGoal, path: PathBuf },

    #[error("{goal} failed: uncommitted changes could not be stashed: {detail}")]
    DirtyWorkingTree { goal: SubGoal, detail: String },

    #[error("{goal} failed: `git fetch origin` failed: {detail}")]
    Fetch { goal: SubGoal, detail: String },

    #[error("{goal} failed: could not check out {commit}: {detail}")]
    Checkout {
        goal: SubGoal,
        commit: String,
        detail: String,
    },

    #[error("{goal} failed: submodule update failed: {detail}")]
    Submodules { goal: SubGoal, detail: String },

    #[error("{goal} failed: `{command}` exited with {status}")]
    Build {
        goal: SubGoal,
        command: String,
        status: String,
    },

    #[error("{goal} failed: {source}")]
    Command {
        goal: SubGoal,
        #[source]
        source: CommandError,
    },

    #[error("model weights failed: {0}")]
    Weights(#[from] DownloadError),
}

impl ReconcileError {
    /// The sub-goal that failed
    pub fn step(&self) -> SubGoal {
        match self {
            Self::NotInstalled { goal, .. }
            | Self::DirtyWorkingTree { goal, .. }
            | Self::Fetch { goal, .. }
            | Self::Checkout { goal, .. }
            | Self::Submodules { goal, .. }
            | Self::Build { goal, .. }
            | Self::Command { goal, .. } => *goal,
            Self::Weights(_) => SubGoal::Weights,
        }
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::Weights(DownloadError::AuthRequired { .. }))
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Executes sub-goals through injected command and download capabilities
pub struct Reconciler {
    runner: Arc<dyn CommandRunner>,
    downloader: Arc<dyn WeightDownloader>,
    locator: RepoLocator,
    weights: WeightLocator,
    metal: RepoConfig,
    vllm: RepoConfig,
    timeouts: Timeouts,
}

/// One repository's checkout/build pair
struct RepoGoals<'a> {
    repo: &'a RepoConfig,
    checkout: SubGoal,
    build: SubGoal,
    commit: Option<&'a str>,
}

impl Reconciler {
    pub fn new(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        downloader: Arc<dyn WeightDownloader>,
    ) -> Self {
        Self {
            locator: RepoLocator::new(runner.clone(), config.timeouts.clone()),
            runner,
            downloader,
            weights: WeightLocator::new(config.models_dir.clone(), config.hf_cache()),
            metal: config.metal.clone(),
            vllm: config.vllm.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    pub fn locator(&self) -> &RepoLocator {
        &self.locator
    }

    /// Observe current state for the checkouts at the given paths
    pub async fn observe(&self, spec: &ModelSpec, metal: &Path, vllm: &Path) -> Observed {
        Observed {
            metal: self.locator.read_state(&self.metal.name, metal).await,
            vllm: self.locator.read_state(&self.vllm.name, vllm).await,
            weights: self.weights.find(spec),
        }
    }

    /// Run every sub-goal in order; the first failure aborts the rest
    ///
    /// `metal` and `vllm` identify the checkouts; their state is re-read
    /// before acting, so a stale observation never drives a mutation.
    pub async fn reconcile(
        &self,
        ctx: &SelectionContext,
        metal: &RepoState,
        vllm: &RepoState,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut actions = Vec::new();
        let spec = &ctx.spec;

        tracing::info!(
            model = %spec.model_name,
            device = %ctx.device,
            experimental = ctx.experimental,
            "Starting environment reconciliation"
        );

        let metal = self
            .reconcile_repo(
                RepoGoals {
                    repo: &self.metal,
                    checkout: SubGoal::MetalCheckout,
                    build: SubGoal::MetalBuild,
                    commit: spec.tt_metal_commit.as_deref(),
                },
                metal,
                &mut actions,
            )
            .await?;

        let vllm = self
            .reconcile_repo(
                RepoGoals {
                    repo: &self.vllm,
                    checkout: SubGoal::VllmCheckout,
                    build: SubGoal::VllmBuild,
                    commit: spec.vllm_commit.as_deref(),
                },
                vllm,
                &mut actions,
            )
            .await?;

        let weights_path = self.ensure_weights(ctx, &mut actions).await?;

        tracing::info!(
            actions = actions.len(),
            weights = ?weights_path,
            "Environment reconciled"
        );

        Ok(ReconcileReport {
            actions,
            metal,
            vllm,
            weights_path,
        })
    }

    async fn reconcile_repo(
        &self,
        goals: RepoGoals<'_>,
        observed: &RepoState,
        actions: &mut Vec<Action>,
    ) -> Result<RepoState, ReconcileError> {
        let before = self
            .locator
            .read_state(&observed.name, &observed.path)
            .await;

        let Some(commit) = goals.commit else {
            display::warning(&format!(
                "⚠ No {} commit pinned for this model, leaving {} at {}",
                goals.repo.name,
                before.path.display(),
                before.short_commit()
            ));
            return Ok(before);
        };

        if before.is_at(commit) {
            display::success(&format!(
                "✓ {} already at {} ({})",
                goals.repo.name,
                short_hash(commit),
                before.branch
            ));
            return Ok(before);
        }

        let after = self.checkout(goals.checkout, &before, commit, actions).await?;

        if before.commit != after.commit && !goals.repo.build_command.is_empty() {
            self.build(goals.build, goals.repo, &after, actions).await?;
        }

        Ok(after)
    }

    /// status -> (stash) -> fetch -> checkout -> submodules -> re-read
    async fn checkout(
        &self,
        goal: SubGoal,
        state: &RepoState,
        commit: &str,
        actions: &mut Vec<Action>,
    ) -> Result<RepoState, ReconcileError> {
        if !state.exists {
            return Err(ReconcileError::NotInstalled {
                goal,
                path: state.path.clone(),
            });
        }

        display::info(&format!(
            "→ {}: {} -> {}",
            state.name,
            state.short_commit(),
            short_hash(commit)
        ));

        if self.is_dirty(goal, state).await? {
            display::warning(&format!(
                "⚠ {} has uncommitted changes, stashing them",
                state.name
            ));
            let message = format!("tt-jukebox: before checkout of {}", short_hash(commit));
            let stash = self
                .git(goal, state, ["stash", "push", "-m", message.as_str()], self.timeouts.git())
                .await?;
            if !stash.success() {
                return Err(ReconcileError::DirtyWorkingTree {
                    goal,
                    detail: stash.diagnostic_tail(500),
                });
            }
            actions.push(Action::Stash {
                repo: state.name.clone(),
            });

            if self.is_dirty(goal, state).await? {
                return Err(ReconcileError::DirtyWorkingTree {
                    goal,
                    detail: "working tree still dirty after stash".to_string(),
                });
            }
        }

        let fetch = self
            .run(
                goal,
                Invocation::git(&state.path, ["fetch", "origin"]).env("GIT_TERMINAL_PROMPT", "0"),
                self.timeouts.network(),
            )
            .await?;
        if !fetch.success() {
            return Err(ReconcileError::Fetch {
                goal,
                detail: fetch.diagnostic_tail(500),
            });
        }
        actions.push(Action::Fetch {
            repo: state.name.clone(),
        });

        let checkout = self
            .git(goal, state, ["checkout", commit], self.timeouts.git())
            .await?;
        if !checkout.success() {
            return Err(ReconcileError::Checkout {
                goal,
                commit: commit.to_string(),
                detail: checkout.diagnostic_tail(500),
            });
        }
        actions.push(Action::Checkout {
            repo: state.name.clone(),
            from: state.commit.clone(),
            to: commit.to_string(),
        });

        let submodules = self
            .git(
                goal,
                state,
                ["submodule", "update", "--init", "--recursive"],
                self.timeouts.submodule(),
            )
            .await?;
        if !submodules.success() {
            return Err(ReconcileError::Submodules {
                goal,
                detail: submodules.diagnostic_tail(500),
            });
        }
        actions.push(Action::SubmoduleUpdate {
            repo: state.name.clone(),
        });

        let after = self.locator.read_state(&state.name, &state.path).await;
        if !after.is_at(commit) {
            return Err(ReconcileError::Checkout {
                goal,
                commit: commit.to_string(),
                detail: format!("HEAD is at {} after checkout", after.short_commit()),
            });
        }

        display::success(&format!(
            "✓ {} checked out to {}",
            state.name,
            short_hash(commit)
        ));
        Ok(after)
    }

    async fn build(
        &self,
        goal: SubGoal,
        repo: &RepoConfig,
        state: &RepoState,
        actions: &mut Vec<Action>,
    ) -> Result<(), ReconcileError> {
        let Some((program, args)) = repo.build_command.split_first() else {
            return Ok(());
        };
        let invocation = Invocation::new(program.as_str())
            .args(args.iter().map(String::as_str))
            .cwd(&state.path)
            .streamed();

        display::info(&format!(
            "→ Building {} with `{}` (this can take several minutes)",
            repo.name,
            invocation.display()
        ));

        let output = self.run(goal, invocation.clone(), self.timeouts.build()).await?;
        if !output.success() {
            return Err(ReconcileError::Build {
                goal,
                command: invocation.display(),
                status: exit_status(&output),
            });
        }

        actions.push(Action::Build {
            repo: repo.name.clone(),
        });
        display::success(&format!("✓ {} built", repo.name));
        Ok(())
    }

    async fn ensure_weights(
        &self,
        ctx: &SelectionContext,
        actions: &mut Vec<Action>,
    ) -> Result<PathBuf, ReconcileError> {
        let location = self.weights.find(&ctx.spec);
        if location.present {
            display::success(&format!(
                "✓ Model weights present at {}",
                location.path.display()
            ));
            return Ok(location.path);
        }

        let repo_id = ctx.spec.hf_model_repo.as_str();
        if repo_id.is_empty() {
            return Err(DownloadError::Failed {
                repo_id: ctx.spec.model_name.clone(),
                detail: "spec names no HuggingFace repository".to_string(),
            }
            .into());
        }

        display::info(&format!("→ Downloading {} from HuggingFace", repo_id));

        let timeout = self.timeouts.download();
        let path = tokio::time::timeout(
            timeout,
            self.downloader.download(repo_id, ctx.token.as_deref()),
        )
        .await
        .map_err(|_| DownloadError::Failed {
            repo_id: repo_id.to_string(),
            detail: format!("timed out after {}s", timeout.as_secs()),
        })??;

        actions.push(Action::Download {
            repo_id: repo_id.to_string(),
            path: path.clone(),
        });
        display::success(&format!("✓ Model downloaded to {}", path.display()));
        Ok(path)
    }

    async fn is_dirty(&self, goal: SubGoal, state: &RepoState) -> Result<bool, ReconcileError> {
        let status = self
            .git(
                goal,
                state,
                ["status", "--porcelain", "--untracked-files=no"],
                self.timeouts.git(),
            )
            .await?;
        if !status.success() {
            return Err(ReconcileError::DirtyWorkingTree {
                goal,
                detail: format!("git status failed: {}", status.diagnostic_tail(500)),
            });
        }
        Ok(!status.stdout.trim().is_empty())
    }

    async fn git<const N: usize>(
        &self,
        goal: SubGoal,
        state: &RepoState,
        args: [&str; N],
        timeout: std::time::Duration,
    ) -> Result<CommandOutput, ReconcileError> {
        self.run(goal, Invocation::git(&state.path, args), timeout).await
    }

    async fn run(
        &self,
        goal: SubGoal,
        invocation: Invocation,
        timeout: std::time::Duration,
    ) -> Result<CommandOutput, ReconcileError> {
        tracing::info!(step = %goal, command = %invocation.display(), "Running step command");
        self.runner
            .run(&invocation, timeout)
            .await
            .map_err(|source| ReconcileError::Command { goal, source })
    }
}

fn exit_status(output: &CommandOutput) -> String {
    match output.exit_code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}
