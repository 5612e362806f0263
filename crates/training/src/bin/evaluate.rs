use anyhow::{bail, Context};
use chip_dataset::{DatasetLoader, LoaderParams};
use clap::Parser;
use quality_metrics::{evaluate_classification, LabelGrid, ProbabilityGrid};
use std::path::PathBuf;
use training::{init_tracing, read_predictions, ConfigArgs};

#[derive(Parser, Debug)]
#[command(
    name = "evaluate",
    about = "Compare predicted class maps with ground truth records and write quality reports"
)]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,
    /// Prediction records written by `predict`.
    #[arg(long)]
    predictions: PathBuf,
    /// Ground truth records, one per prediction in the same order.
    #[arg(long)]
    ground_truth: PathBuf,
    /// Directory for classification_report<suffix>.txt and classification_metrics<suffix>.json.
    #[arg(long)]
    out_dir: Option<PathBuf>,
    #[arg(long, default_value = "")]
    suffix: String,
    /// Class ids left out of the metrics (defaults to the config's classes_ignore).
    #[arg(long, value_delimiter = ',')]
    classes_ignore: Option<Vec<usize>>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.config.resolve()?;
    let params = &config.params;
    if params.class_names.is_empty() {
        bail!("class_names must be set in the config");
    }
    let predicted = read_predictions(&args.predictions)?;
    let truth = DatasetLoader::new(&args.ground_truth, LoaderParams::default()).load_chips()?;
    if predicted.len() != truth.len() {
        bail!(
            "{} prediction records but {} ground truth records",
            predicted.len(),
            truth.len()
        );
    }
    let Some(first) = predicted.first() else {
        bail!("no prediction records in {}", args.predictions.display());
    };

    let cols = first.width;
    let classes = params.class_names.len();
    let with_probs = first.probabilities.is_some();
    if with_probs && first.probabilities.iter().any(|p| p.len() != first.pixels() * classes) {
        bail!("prediction probabilities do not cover {classes} classes");
    }
    let (mut pred_rows, mut pred_data, mut truth_data, mut probs) = (0, Vec::new(), Vec::new(), Vec::new());
    for (pred, gt) in predicted.iter().zip(&truth) {
        if pred.width != cols {
            bail!("prediction chips must share a width to be evaluated together");
        }
        let gt = LabelGrid::new(gt.shape.height, gt.shape.width, gt.label.clone())?
            .center_crop(pred.height, pred.width)
            .context("ground truth smaller than prediction")?;
        pred_rows += pred.height;
        pred_data.extend_from_slice(&pred.classes);
        truth_data.extend(gt.data);
        if let Some(p) = &pred.probabilities {
            probs.extend_from_slice(p);
        }
    }
    let prediction = LabelGrid::new(pred_rows, cols, pred_data)?;
    let ground_truth = LabelGrid::new(pred_rows, cols, truth_data)?;
    let probabilities = if with_probs {
        Some(ProbabilityGrid::new(pred_rows, cols, classes, probs)?)
    } else {
        None
    };
    let ignore = args
        .classes_ignore
        .clone()
        .unwrap_or_else(|| params.classes_ignore.clone());
    evaluate_classification(
        &prediction,
        &ground_truth,
        &params.class_names,
        probabilities.as_ref(),
        args.out_dir.as_deref(),
        &args.suffix,
        &ignore,
    )?;
    Ok(())
}
