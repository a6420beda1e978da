use anyhow::Result;
use clap::Parser;
use model_hub::HubCache;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use workshop::{Pipeline, PipelineConfig};

/// Fine-tune a LoRA adapter on a small FAQ set and compare answers before
/// and after.
#[derive(Parser, Debug)]
#[command(name = "finetune-validate", version)]
struct Args {
    /// YAML run configuration.
    #[arg(long, conflicts_with = "quick")]
    config: Option<PathBuf>,

    /// Reduced smoke-test run (3 epochs, 3 pairs, 2 prompts).
    #[arg(long)]
    quick: bool,

    /// Overrides the model id or local directory.
    #[arg(long)]
    model: Option<String>,

    /// Overrides the training output directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Only use files already in the model cache.
    #[arg(long)]
    offline: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match (&args.config, args.quick) {
        (Some(path), _) => PipelineConfig::from_yaml_file(path)?,
        (None, true) => PipelineConfig::quick(),
        (None, false) => PipelineConfig::default(),
    };
    if let Some(model) = args.model {
        config.model.id = model;
    }
    if let Some(dir) = args.output_dir {
        config.training.output_dir = dir;
    }
    if args.offline {
        config.model.hub.offline = true;
    }

    let hub = HubCache::new(config.model.hub.clone());
    let report = Pipeline::new(config).run(&hub)?;
    tracing::info!(adapter = %report.adapter_dir.display(), "done");
    Ok(())
}
