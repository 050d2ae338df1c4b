//! End-to-end jukebox session
//!
//! detect -> catalog -> match -> select -> plan -> confirm -> reconcile ->
//! render (-> run)

use crate::command::LaunchPlan;
use crate::config::{Config, RepoConfig};
use crate::display;
use crate::hardware::{self, Hardware};
use crate::launcher;
use crate::matcher::{self, Candidate, MatchMode};
use crate::process::{CommandRunner, Invocation, SystemCommandRunner};
use crate::reconcile::{
    Observed, PlannedStep, ReconcileReport, Reconciler, Requirements, SelectionContext, plan,
};
use crate::repo::short_hash;
use crate::specs::{CatalogOrigin, HttpSpecSource, SpecCache};
use crate::weights::{HfHubDownloader, WeightDownloader, resolve_token};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What the user asked for on the command line
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Task keyword or model-name substring
    pub query: Option<String>,
    pub list: bool,
    pub show_experimental: bool,
    /// Run the full reconciliation pass even when nothing is pending
    pub setup: bool,
    pub force: bool,
    pub hf_token: Option<String>,
    pub refresh_cache: bool,
    /// Execute the rendered server command after reconciliation
    pub run: bool,
}

/// How a session ended without error
#[derive(Debug)]
pub enum Outcome {
    Listed,
    NoMatches,
    /// User quit at the selection prompt
    Quit,
    /// Setup declined, or refused in a non-interactive session
    Cancelled,
    Ready(LaunchPlan),
    Served {
        plan: LaunchPlan,
        exit_code: Option<i32>,
    },
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Served { exit_code, .. } if *exit_code != Some(0) => 1,
            _ => 0,
        }
    }
}

// ============================================================================
// User Interaction
// ============================================================================

/// Source of answers to interactive questions
#[async_trait]
pub trait Prompter: Send + Sync {
    fn is_interactive(&self) -> bool;

    /// Ask a question, None on end of input
    async fn ask(&self, question: &str) -> Option<String>;
}

/// Prompts on the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    async fn ask(&self, question: &str) -> Option<String> {
        print!("{} ", display::bold(question));
        let _ = std::io::stdout().flush();

        // Blocking read off the runtime so Ctrl-C is still observed
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.trim().to_string()),
            }
        })
        .await
        .ok()
        .flatten()
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    catalog: SpecCache,
    reconciler: Reconciler,
    prompter: Arc<dyn Prompter>,
}

impl Session {
    /// Production wiring: real processes, HTTP, hub downloads and terminal
    pub fn new(config: Config) -> Result<Self> {
        let source = HttpSpecSource::new(config.specs_url.clone(), config.timeouts.fetch())
            .context("Failed to create HTTP client")?;
        let catalog = SpecCache::new(config.cache_dir(), config.cache_ttl(), Arc::new(source));
        let downloader = HfHubDownloader::new(config.hf_endpoint.clone(), config.hf_cache());

        Ok(Self::new_with(
            config,
            Arc::new(SystemCommandRunner::new()),
            Arc::new(downloader),
            catalog,
            Arc::new(TerminalPrompter),
        ))
    }

    pub fn new_with(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        downloader: Arc<dyn WeightDownloader>,
        catalog: SpecCache,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        let reconciler = Reconciler::new(&config, runner.clone(), downloader);
        Self {
            config,
            runner,
            catalog,
            reconciler,
            prompter,
        }
    }

    pub async fn run(&self, options: &SessionOptions) -> Result<Outcome> {
        display::header("🎵 TT-Jukebox: Model & Environment Manager");

        let hardware = hardware::detect(
            self.runner.as_ref(),
            &self.config.smi_binary,
            self.config.timeouts.detect(),
        )
        .await;
        show_hardware(&hardware);

        let catalog = self
            .catalog
            .load(options.refresh_cache)
            .await
            .context("Failed to load model specifications")?;
        show_catalog_origin(catalog.origin, catalog.specs.len());

        let mode = MatchMode {
            include_experimental: options.show_experimental,
        };

        if options.list {
            let candidates = matcher::match_specs(&catalog.specs, &hardware, None, mode);
            show_list(&hardware, &candidates, options.show_experimental);
            return Ok(Outcome::Listed);
        }

        let query = options.query.as_deref().map(str::trim).filter(|q| !q.is_empty());
        match query {
            Some(q) if matcher::is_task_keyword(q) => {
                display::info(&format!("\nSearching for models suitable for '{}'...", q))
            }
            Some(q) => display::info(&format!("\nSearching for models matching '{}'...", q)),
            None => display::info("\nNo task or model given, considering every compatible model"),
        }

        let candidates = matcher::match_specs(&catalog.specs, &hardware, query, mode);
        if candidates.is_empty() {
            display::warning(&format!("No models found for {}", hardware));
            display::info("Try:");
            display::info("  • A different model name or task");
            display::info("  • --list to see all available models");
            if !options.show_experimental {
                display::info("  • --show-experimental to include same-family models");
            }
            return Ok(Outcome::NoMatches);
        }

        let experimental = candidates.iter().filter(|c| c.experimental).count();
        if experimental > 0 {
            display::info(&format!(
                "Including {} experimental models with conservative parameters",
                experimental
            ));
        }

        for (i, candidate) in candidates.iter().enumerate() {
            show_candidate(i + 1, candidate);
        }

        let Some(index) = self.select(candidates.len()).await else {
            display::info("Selection cancelled");
            return Ok(Outcome::Quit);
        };
        let Some(candidate) = candidates.into_iter().nth(index) else {
            return Ok(Outcome::Quit);
        };

        let token = resolve_token(options.hf_token.as_deref()).map(|(token, source)| {
            tracing::info!(source = ?source, "Using HuggingFace token");
            token
        });
        let ctx = SelectionContext::new(candidate, &hardware, options.force, token);
        display::success(&format!(
            "\n✓ Selected {} for {}{}",
            ctx.spec.model_name,
            ctx.device,
            if ctx.experimental { " (experimental)" } else { "" }
        ));

        self.prepare(&ctx, options).await
    }

    /// Plan, confirm, reconcile and render for the chosen spec
    async fn prepare(&self, ctx: &SelectionContext, options: &SessionOptions) -> Result<Outcome> {
        let observed = self
            .reconciler
            .observe(
                &ctx.spec,
                &self.checkout_path(&self.config.metal),
                &self.checkout_path(&self.config.vllm),
            )
            .await;
        let requirements = Requirements::new(&ctx.spec, &self.config.vllm);
        let steps = plan(&observed, &requirements);

        show_environment(&observed, &self.config);

        if !options.setup
            && let Some(report) = ReconcileReport::from_satisfied(observed.clone(), &requirements)
        {
            display::success("\n✓ Environment already matches this configuration");
            return self.finish(ctx, &report, options).await;
        }

        show_plan(&steps);

        let mutating = !steps.is_empty() || !observed.metal.exists || !observed.vllm.exists;
        if mutating && !self.confirm(ctx).await {
            return Ok(Outcome::Cancelled);
        }

        display::header("🔧 Setting up environment");

        let metal = self
            .reconciler
            .locator()
            .locate_or_install(&self.config.metal)
            .await?;
        let vllm = self
            .reconciler
            .locator()
            .locate_or_install(&self.config.vllm)
            .await?;

        let report = self.reconciler.reconcile(ctx, &metal, &vllm).await?;

        display::header("✅ Setup Complete!");
        if report.is_noop() {
            display::info("No changes were needed");
        }
        for action in &report.actions {
            display::info(&format!("  • {}", action));
        }

        self.finish(ctx, &report, options).await
    }

    async fn finish(
        &self,
        ctx: &SelectionContext,
        report: &ReconcileReport,
        options: &SessionOptions,
    ) -> Result<Outcome> {
        let launcher = launcher::resolve(&self.config.serve, &self.config.launcher_dir()).await?;
        let plan = LaunchPlan::from_report(ctx, report, &self.config.serve, &launcher);
        show_launch_plan(ctx, report, &plan, &self.config);

        if !options.run {
            return Ok(Outcome::Ready(plan));
        }

        display::header("🚀 Starting vLLM server");
        let invocation = Invocation::new("bash")
            .args(["-lc", plan.run_command()])
            .streamed();
        let output = self
            .runner
            .run(&invocation, Duration::MAX)
            .await
            .context("Failed to start the vLLM server")?;

        if !output.success() {
            display::error(&format!(
                "✗ vLLM server exited with {}",
                output
                    .exit_code
                    .map(|c| format!("code {}", c))
                    .unwrap_or_else(|| "a signal".to_string())
            ));
        }

        Ok(Outcome::Served {
            plan,
            exit_code: output.exit_code,
        })
    }

    /// Existing checkout, or where one would be cloned
    fn checkout_path(&self, repo: &RepoConfig) -> PathBuf {
        self.reconciler
            .locator()
            .locate(repo)
            .unwrap_or_else(|| repo.install_path.clone())
    }

    /// Index into the candidate list, None when the user quits
    async fn select(&self, count: usize) -> Option<usize> {
        if count == 1 {
            return Some(0);
        }
        if !self.prompter.is_interactive() {
            display::info("Non-interactive session, auto-selecting the first match");
            return Some(0);
        }

        loop {
            let answer = self
                .prompter
                .ask(&format!("\nSelect a configuration [1-{}] (q to quit):", count))
                .await?;
            if answer.eq_ignore_ascii_case("q") {
                return None;
            }
            match answer.parse::<usize>() {
                Ok(n) if (1..=count).contains(&n) => return Some(n - 1),
                _ => display::warning(&format!("Please enter a number between 1 and {}", count)),
            }
        }
    }

    async fn confirm(&self, ctx: &SelectionContext) -> bool {
        if ctx.force {
            return true;
        }
        if !self.prompter.is_interactive() {
            display::warning("Non-interactive session: setup cancelled");
            display::info("Re-run with --force to apply these changes");
            return false;
        }

        let answer = self
            .prompter
            .ask("\nProceed with setup? [y/N]:")
            .await
            .unwrap_or_default();
        let proceed = matches!(answer.to_lowercase().as_str(), "y" | "yes");
        if !proceed {
            display::info("Setup cancelled");
        }
        proceed
    }
}

// ============================================================================
// Presentation
// ============================================================================

fn show_hardware(hardware: &Hardware) {
    match hardware {
        Hardware::Detected {
            device_type,
            firmware_version,
        } => {
            display::success(&format!("✓ Detected hardware: {}", device_type));
            if let Some(fw) = firmware_version {
                display::info(&format!("  Firmware: {}", fw));
            }
        }
        Hardware::Unknown => {
            display::warning("⚠ Could not detect Tenstorrent hardware");
            display::info("  Showing models for every device type");
        }
    }
}

fn show_catalog_origin(origin: CatalogOrigin, count: usize) {
    match origin {
        CatalogOrigin::Fetched => {
            display::success(&format!("✓ Fetched {} model specifications", count))
        }
        CatalogOrigin::Cache { age } => display::success(&format!(
            "✓ Loaded {} model specifications from cache ({} min old)",
            count,
            age.as_secs() / 60
        )),
        CatalogOrigin::StaleFallback { age } => display::warning(&format!(
            "⚠ Could not refresh model specifications, using cached copy{} ({} specs)",
            age.map(|a| format!(" from {} min ago", a.as_secs() / 60))
                .unwrap_or_default(),
            count
        )),
    }
}

fn show_candidate(index: usize, candidate: &Candidate) {
    let spec = &candidate.spec;
    display::plain(&format!(
        "\n{} {} ({}, {})",
        display::bold(&format!("[{}]", index)),
        display::bold(&spec.model_name),
        spec.device_type.to_uppercase(),
        spec.status_label()
    ));
    if !spec.hf_model_repo.is_empty() {
        display::plain(&format!("    HF repo:  {}", spec.hf_model_repo));
    }
    display::plain(&format!(
        "    tt-metal: {}   vLLM: {}",
        commit_label(spec.tt_metal_commit.as_deref()),
        commit_label(spec.vllm_commit.as_deref())
    ));

    let mut params = format!(
        "    Context:  {} tokens   Max seqs: {}",
        display::thousands(spec.max_context()),
        spec.max_num_seqs()
    );
    if let Some(tp) = spec.tensor_parallel() {
        params.push_str(&format!("   TP: {}", tp));
    }
    if let Some(params_b) = spec.param_count {
        params.push_str(&format!("   Params: {}B", params_b));
    }
    display::plain(&params);

    if candidate.experimental {
        display::warning(&format!(
            "    ⚠ Experimental: {}",
            candidate.reason.as_deref().unwrap_or("unvalidated on this device")
        ));
    }
}

fn commit_label(commit: Option<&str>) -> String {
    commit.map(short_hash).unwrap_or_else(|| "unpinned".to_string())
}

fn show_list(hardware: &Hardware, candidates: &[Candidate], show_experimental: bool) {
    display::header(&format!("Models for {}", hardware));

    let (validated, experimental): (Vec<Candidate>, Vec<Candidate>) =
        candidates.iter().cloned().partition(|c| !c.experimental);

    if validated.is_empty() && experimental.is_empty() {
        display::warning(&format!("No models cataloged for {}", hardware));
        return;
    }

    for (family, members) in matcher::group_by_family(&validated) {
        display::plain(&format!("\n{}", display::bold(&family)));
        for candidate in members {
            display::plain(&list_line(candidate));
        }
    }
    display::plain(&format!("\nTotal validated: {} models", validated.len()));

    if show_experimental && !experimental.is_empty() {
        display::header("Experimental (same architecture family, conservative parameters)");
        for (family, members) in matcher::group_by_family(&experimental) {
            display::plain(&format!("\n{}", display::bold(&family)));
            for candidate in members {
                display::plain(&list_line(candidate));
            }
        }
        display::plain(&format!("\nTotal experimental: {} models", experimental.len()));
        display::warning("Use --show-experimental with a model search to try these");
    }
}

fn list_line(candidate: &Candidate) -> String {
    let spec = &candidate.spec;
    format!(
        "  • {} ({}) [{}] {} tokens",
        spec.model_name,
        spec.device_type.to_uppercase(),
        spec.status_label(),
        display::thousands(spec.max_context())
    )
}

fn show_environment(observed: &Observed, config: &Config) {
    display::plain(&format!("\n{}", display::bold("Current environment:")));
    for (state, repo) in [(&observed.metal, &config.metal), (&observed.vllm, &config.vllm)] {
        if state.exists {
            display::plain(&format!(
                "  {}: {} @ {} ({}){}",
                state.name,
                state.path.display(),
                state.short_commit(),
                state.branch,
                state
                    .version
                    .as_deref()
                    .map(|v| format!(" [{}]", v))
                    .unwrap_or_default()
            ));
        } else {
            display::warning(&format!(
                "  {}: not found, will clone {} into {}",
                state.name,
                repo.upstream_url,
                state.path.display()
            ));
        }
    }
    display::plain(&format!(
        "  weights: {} ({})",
        observed.weights.path.display(),
        if observed.weights.present { "present" } else { "missing" }
    ));
}

fn show_plan(steps: &[PlannedStep]) {
    if steps.is_empty() {
        display::info("\nNo changes planned, verifying the environment");
        return;
    }
    display::plain(&format!("\n{}", display::bold("Planned changes:")));
    for step in steps {
        display::plain(&format!("  • {}: {}", step.goal, step.detail));
    }
}

fn show_launch_plan(ctx: &SelectionContext, report: &ReconcileReport, plan: &LaunchPlan, config: &Config) {
    display::header("Ready-to-Run vLLM Command");

    display::plain(&display::bold("Start vLLM Server:"));
    for line in plan.run_command().lines() {
        display::plain(line);
    }
    display::plain("");
    display::plain(&display::bold("Test Server:"));
    for line in plan.test_command().lines() {
        display::plain(line);
    }

    let spec = &ctx.spec;
    display::plain(&format!("\n{}", display::bold("Configuration Details:")));
    display::plain(&format!("  Model: {}", spec.model_name));
    display::plain(&format!("  Device: {}", plan.device()));
    display::plain(&format!(
        "  tt-metal: {} ({})",
        report.metal.short_commit(),
        report.metal.branch
    ));
    display::plain(&format!(
        "  tt-vllm: {} ({})",
        report.vllm.short_commit(),
        report.vllm.branch
    ));
    display::plain(&format!("  Weights: {}", plan.weights_path().display()));
    display::plain(&format!(
        "  Max context: {} tokens",
        display::thousands(spec.max_context())
    ));
    display::plain(&format!("  Max sequences: {}", spec.max_num_seqs()));
    if ctx.experimental {
        display::warning("  ⚠ Experimental configuration: parameters reduced to two-thirds");
    }
    display::info(&format!(
        "\nNote: first model load takes 2-5 minutes. Server: http://localhost:{}",
        config.serve.port
    ));
}
