use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use training::{init_tracing, ConfigArgs, ModelBuilder};

#[derive(Parser, Debug)]
#[command(name = "validate", about = "Score a trained checkpoint against labelled chip records")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    /// Labelled records to validate on (defaults to [paths].test_records).
    #[arg(long)]
    records: Option<PathBuf>,
    /// Directory holding model.bin (defaults to [paths].output_dir).
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.config.resolve()?;
    let network = config.network.context("no network given (--network or config)")?;
    let records = args
        .records
        .or(config.test_records)
        .context("no records given")?;
    let model_dir = args
        .model_dir
        .or(config.output_dir)
        .context("no model directory given")?;
    let (metrics, _) = ModelBuilder::new(network).validate(&records, &config.params, &model_dir)?;
    tracing::info!(accuracy = metrics.accuracy, "validation finished");
    Ok(())
}
