use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use training::{init_tracing, write_predictions, ConfigArgs, ModelBuilder};

#[derive(Parser, Debug)]
#[command(name = "predict", about = "Write class maps for chip records using a trained checkpoint")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    /// Records to classify.
    #[arg(long)]
    records: PathBuf,
    /// Directory holding model.bin (defaults to [paths].output_dir).
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Output record file.
    #[arg(long)]
    out: PathBuf,
    /// Store per-class probabilities as the image feature.
    #[arg(long, default_value_t = false)]
    probabilities: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.config.resolve()?;
    let network = config.network.context("no network given (--network or config)")?;
    let model_dir = args
        .model_dir
        .or(config.output_dir)
        .context("no model directory given")?;
    let predictions = ModelBuilder::new(network).predict(
        &args.records,
        &config.params,
        &model_dir,
        args.probabilities,
    )?;
    write_predictions(&args.out, &predictions)?;
    Ok(())
}
