//! TT-Jukebox - model and environment manager for Tenstorrent hardware
//!
//! Matches the attached accelerator to validated model configurations,
//! reconciles the tt-metal and tt-vllm checkouts to the commits a
//! configuration was validated against, fetches model weights, and renders
//! the command that starts an OpenAI-compatible vLLM server.

pub mod command;
pub mod config;
pub mod display;
pub mod hardware;
pub mod launcher;
pub mod matcher;
pub mod process;
pub mod reconcile;
pub mod repo;
pub mod session;
pub mod specs;
pub mod weights;

pub use command::{LaunchPlan, ServeCommands, format_commands};
pub use config::Config;
pub use hardware::Hardware;
pub use matcher::{Candidate, MatchMode, match_specs};
pub use process::{CommandError, CommandOutput, CommandRunner, Invocation, SystemCommandRunner};
pub use reconcile::{
    Action, ReconcileError, ReconcileReport, Reconciler, SelectionContext, SubGoal, plan,
};
pub use repo::{BranchState, RepoState};
pub use session::{Outcome, Session, SessionOptions};
pub use specs::{ModelSpec, SpecCache};
