//! Rendering of the server launch and smoke-test commands
//!
//! Formatting is pure: identical inputs yield byte-identical output.

use crate::config::ServeOptions;
use crate::reconcile::{ReconcileReport, SelectionContext};
use std::path::{Path, PathBuf};

/// Everything the rendered commands depend on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchInputs<'a> {
    pub model_name: &'a str,
    pub hf_repo: &'a str,
    pub device: &'a str,
    pub weights_path: &'a Path,
    pub metal_home: &'a Path,
    pub vllm_home: &'a Path,
    pub max_context: u32,
    pub max_num_seqs: u32,
    pub block_size: u32,
    pub tensor_parallel: Option<u32>,
    /// Program and leading arguments that start the server
    pub launcher: &'a str,
    pub serve: &'a ServeOptions,
}

/// The two rendered shell snippets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeCommands {
    /// Starts the OpenAI-compatible server
    pub run: String,
    /// curl request against the running server
    pub test: String,
}

/// Render the launch and test commands
pub fn format_commands(inputs: &LaunchInputs<'_>) -> ServeCommands {
    let metal = shell_quote(&inputs.metal_home.to_string_lossy());
    let vllm = shell_quote(&inputs.vllm_home.to_string_lossy());
    let activate = shell_quote(&inputs.serve.venv.join("bin").join("activate").to_string_lossy());
    let setup_script = shell_quote(
        &inputs
            .vllm_home
            .join("tt_metal")
            .join("setup-metal.sh")
            .to_string_lossy(),
    );

    let mut env = vec![
        format!("export TT_METAL_HOME={}", metal),
        format!("export MESH_DEVICE={}", shell_quote(inputs.device)),
        format!("export PYTHONPATH={}:$PYTHONPATH", metal),
    ];
    if inputs.device.to_uppercase().starts_with('P') {
        env.push("export TT_METAL_ARCH_NAME=blackhole".to_string());
    }

    let weights = inputs.weights_path.to_string_lossy();
    let mut flags = vec![format!("--model {}", shell_quote(&weights))];
    if !inputs.hf_repo.is_empty() {
        flags.push(format!("--served-model-name {}", shell_quote(inputs.hf_repo)));
    }
    flags.extend([
        format!("--host {}", shell_quote(&inputs.serve.host)),
        format!("--port {}", inputs.serve.port),
        format!("--max-model-len {}", inputs.max_context),
        format!("--max-num-seqs {}", inputs.max_num_seqs),
        format!("--block-size {}", inputs.block_size),
    ]);
    if let Some(tp) = inputs.tensor_parallel.filter(|tp| *tp > 1) {
        flags.push(format!("--tensor-parallel-size {}", tp));
    }

    let run = format!(
        "# Start vLLM server with {model} on {device}\n\
         cd {vllm} && \\\n  \
         source {activate} && \\\n  \
         {env} && \\\n  \
         source {setup_script} && \\\n  \
         {launcher} \\\n    \
         {flags}",
        model = inputs.model_name,
        device = inputs.device,
        env = env.join(" && "),
        launcher = inputs.launcher,
        flags = flags.join(" \\\n    "),
    );

    let test = format!(
        "curl http://localhost:{port}/v1/chat/completions \\\n  \
         -H \"Content-Type: application/json\" \\\n  \
         -d '{body}'",
        port = inputs.serve.port,
        // Without a served name vLLM serves the model under its path
        body = test_request_body(if inputs.hf_repo.is_empty() {
            &weights
        } else {
            inputs.hf_repo
        }),
    );

    ServeCommands { run, test }
}

fn test_request_body(model: &str) -> String {
    let body = serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": "Hello!" }],
        "max_tokens": 128,
    });
    // Single quotes cannot appear inside the single-quoted curl argument
    body.to_string().replace('\'', "'\\''")
}

/// Quote a word for POSIX shells when it holds anything beyond a safe set
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Rendered commands for an environment that reconciled successfully
///
/// Only obtainable from a [`ReconcileReport`], so no command is ever shown
/// for an environment that failed to reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    commands: ServeCommands,
    weights_path: PathBuf,
    device: String,
}

impl LaunchPlan {
    pub fn from_report(
        ctx: &SelectionContext,
        report: &ReconcileReport,
        serve: &ServeOptions,
        launcher: &str,
    ) -> Self {
        let spec = &ctx.spec;
        let commands = format_commands(&LaunchInputs {
            model_name: &spec.model_name,
            hf_repo: &spec.hf_model_repo,
            device: &ctx.device,
            weights_path: &report.weights_path,
            metal_home: &report.metal.path,
            vllm_home: &report.vllm.path,
            max_context: spec.max_context(),
            max_num_seqs: spec.max_num_seqs(),
            block_size: spec.block_size(),
            tensor_parallel: spec.tensor_parallel(),
            launcher,
            serve,
        });
        Self {
            commands,
            weights_path: report.weights_path.clone(),
            device: ctx.device.clone(),
        }
    }

    pub fn run_command(&self) -> &str {
        &self.commands.run
    }

    pub fn test_command(&self) -> &str {
        &self.commands.test
    }

    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}
