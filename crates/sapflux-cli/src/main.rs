use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use sapflux_contracts::decomposition::{
    synthesize_fallback, FallbackPolicy, FallbackScaling, PromptTemplates, DEFAULT_STEP_BUDGET,
};
use sapflux_contracts::prompts::read_prompts_file;
use sapflux_contracts::runs::layout::{GenerationMode, RunLayout};
use sapflux_contracts::runs::store::{DecompositionStore, DEFAULT_STORE_FILE};
use sapflux_engine::config::{GenerationSettings, TextBackendConfig, DEFAULT_SEEDS};
use sapflux_engine::decompose::DecompositionService;
use sapflux_engine::image_backend::DryrunImageBackend;
use sapflux_engine::text::text_backend_by_name;
use sapflux_engine::{RunPlan, SapRun};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(
    name = "sapflux",
    version,
    about = "Staged prompt decomposition and batch image generation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decompose a prompts file into SAP_prompts.json.
    Decompose(DecomposeArgs),
    /// Generate images for a prompts file in direct and/or sap mode.
    Run(RunArgs),
    /// Print the local fallback decomposition of one prompt.
    Fallback(FallbackArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Direct,
    Sap,
    Both,
}

impl ModeArg {
    fn modes(self) -> Vec<GenerationMode> {
        match self {
            Self::Direct => vec![GenerationMode::Direct],
            Self::Sap => vec![GenerationMode::Sap],
            Self::Both => GenerationMode::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScalingArg {
    Fixed,
    Proportional,
}

impl From<ScalingArg> for FallbackScaling {
    fn from(value: ScalingArg) -> Self {
        match value {
            ScalingArg::Fixed => FallbackScaling::Fixed,
            ScalingArg::Proportional => FallbackScaling::Proportional,
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
struct TextBackendArgs {
    #[arg(long, default_value = "openai")]
    text_backend: String,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    templates_dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = ScalingArg::Proportional)]
    fallback_scaling: ScalingArg,
    #[arg(long, default_value_t = 120.0)]
    timeout: f64,
}

impl TextBackendArgs {
    fn service(&self, steps: u32) -> Result<DecompositionService> {
        let templates = match &self.templates_dir {
            Some(dir) => PromptTemplates::from_dir(dir)?,
            None => PromptTemplates::default(),
        };
        let policy = FallbackScaling::from(self.fallback_scaling).policy(steps);
        let config =
            TextBackendConfig::from_env(self.text_model.clone()).with_timeout(self.timeout);
        let backend = text_backend_by_name(&self.text_backend, config, policy)?;
        Ok(DecompositionService::new(backend, templates, policy).with_step_budget(steps))
    }
}

#[derive(Debug, Parser)]
struct DecomposeArgs {
    #[arg(long)]
    prompts_file: PathBuf,
    #[arg(long, default_value = DEFAULT_STORE_FILE)]
    out: PathBuf,
    #[arg(long, default_value_t = DEFAULT_STEP_BUDGET)]
    steps: u32,
    #[command(flatten)]
    text: TextBackendArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompts_file: PathBuf,
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = ModeArg::Both)]
    mode: ModeArg,
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SEEDS)]
    seeds: Vec<u64>,
    #[arg(long, default_value_t = DEFAULT_STEP_BUDGET)]
    steps: u32,
    #[arg(long, default_value_t = 3.5)]
    guidance_scale: f32,
    #[arg(long, default_value_t = 1024)]
    width: u32,
    #[arg(long, default_value_t = 1024)]
    height: u32,
    /// Reuse decompositions from an existing SAP_prompts.json.
    #[arg(long)]
    decompositions: Option<PathBuf>,
    #[command(flatten)]
    text: TextBackendArgs,
}

#[derive(Debug, Parser)]
struct FallbackArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = DEFAULT_STEP_BUDGET)]
    steps: u32,
    #[arg(long, value_enum, default_value_t = ScalingArg::Proportional)]
    fallback_scaling: ScalingArg,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sapflux error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Decompose(args) => run_decompose(args),
        Command::Run(args) => run_generation(args),
        Command::Fallback(args) => run_fallback(args),
    }
}

fn run_decompose(args: DecomposeArgs) -> Result<i32> {
    let prompts = read_prompts_file(&args.prompts_file)?;
    let service = args.text.service(args.steps)?;
    let decompositions = service.decompose_detailed(&prompts)?;
    let store = DecompositionStore::from_decompositions(&args.out, &prompts, &decompositions);
    store.save()?;

    let fallback = decompositions.iter().filter(|item| item.is_fallback()).count();
    let stats = store.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "out": args.out.to_string_lossy(),
            "backend": service.backend_name(),
            "model": service.backend_model(),
            "total_prompts": stats.total_prompts,
            "parsed": stats.total_prompts - fallback,
            "fallback": fallback,
        }))?
    );
    Ok(0)
}

fn run_generation(args: RunArgs) -> Result<i32> {
    let prompts = read_prompts_file(&args.prompts_file)?;
    let plan = RunPlan {
        prompts,
        modes: args.mode.modes(),
        seeds: args.seeds.clone(),
        settings: GenerationSettings {
            width: args.width,
            height: args.height,
            num_inference_steps: args.steps,
            guidance_scale: args.guidance_scale,
        },
    };

    let store = args
        .decompositions
        .as_deref()
        .map(load_store)
        .transpose()?;
    let layout = RunLayout::timestamped(&args.out_dir, Local::now());
    let mut run = SapRun::new(layout)?;
    let service = if plan.modes.contains(&GenerationMode::Sap) {
        Some(args.text.service(args.steps)?.with_events(run.event_writer()))
    } else {
        None
    };

    let report = run.execute(
        &plan,
        service.as_ref(),
        store.as_ref(),
        Box::new(DryrunImageBackend::new()),
    )?;
    let summary_path = run.finish(&report)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "run_dir": run.layout().run_dir().to_string_lossy(),
            "summary": summary_path.to_string_lossy(),
            "total_jobs": report.total(),
            "succeeded": report.succeeded(),
            "failed": report.failed(),
        }))?
    );
    Ok(0)
}

fn load_store(path: &Path) -> Result<DecompositionStore> {
    let store = DecompositionStore::load(path)
        .with_context(|| format!("failed loading decompositions from {}", path.display()))?;
    let stats = store.stats();
    tracing::info!(
        total = stats.total_prompts,
        decomposed = stats.successfully_decomposed,
        success_rate = %stats.success_rate,
        "loaded stored decompositions"
    );
    Ok(store)
}

fn run_fallback(args: FallbackArgs) -> Result<i32> {
    let policy: FallbackPolicy = FallbackScaling::from(args.fallback_scaling).policy(args.steps);
    let record = synthesize_fallback(&args.prompt, &policy);
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(0)
}
