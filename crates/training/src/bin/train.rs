use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use training::{init_tracing, ConfigArgs, ModelBuilder};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train an FCN/U-Net segmentation network on chip records")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    /// Training records (overrides [paths].train_records).
    #[arg(long)]
    train_records: Option<PathBuf>,
    /// Evaluation records checked after every epoch (overrides [paths].test_records).
    #[arg(long)]
    test_records: Option<PathBuf>,
    /// Checkpoint and log directory (overrides [paths].output_dir).
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.config.resolve()?;
    let network = config.network.context("no network given (--network or config)")?;
    let train_records = args
        .train_records
        .or(config.train_records)
        .context("no training records given")?;
    let test_records = args.test_records.or(config.test_records);
    let output_dir = args
        .output_dir
        .or(config.output_dir)
        .context("no output directory given")?;

    let report = ModelBuilder::new(network).train(
        &train_records,
        test_records.as_deref(),
        &config.params,
        &output_dir,
    )?;
    let path = output_dir.join("train_report.json");
    std::fs::write(&path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(epochs = report.epochs.len(), steps = report.global_step, "training finished");
    Ok(())
}
