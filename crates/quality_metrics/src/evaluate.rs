//! Whole-map evaluation: metrics, curves, report text and on-disk outputs.

use crate::curves::{auc, precision_recall_curve, roc_curve, PrCurve, RocCurve};
use crate::report::{
    classification_report, confusion_matrix, format_confusion_matrix, normalize_rows, ClassStats,
};
use crate::types::{LabelGrid, MetricsError, MetricsResult, ProbabilityGrid};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

pub const RESULTS_BANNER: &str = "<<------------------------------------------------------------>>\n\
<<---------------- Classification Results -------------------->>\n\
<<------------------------------------------------------------>>\n";

#[derive(Debug, Clone, Serialize)]
pub struct ClassCurves {
    pub class_id: usize,
    pub class_name: String,
    pub prec_rec_curve: PrCurve,
    pub roc_curve: RocCurve,
    pub auc_roc: f64,
}

/// Metrics over the classes that survive `classes_remove`, in class id order.
#[derive(Debug, Clone, Serialize)]
pub struct QualityMetrics {
    pub class_names: Vec<String>,
    pub class_ids: Vec<usize>,
    pub f1_score: Vec<f64>,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub support: Vec<usize>,
    pub accuracy: f64,
    pub classification_report: String,
    pub curves: Vec<ClassCurves>,
    /// Row-normalized; rows without ground truth pixels are NaN.
    pub confusion_matrix: Vec<Vec<f64>>,
}

impl QualityMetrics {
    pub fn auc_roc(&self, class_name: &str) -> Option<f64> {
        self.curves
            .iter()
            .find(|c| c.class_name == class_name)
            .map(|c| c.auc_roc)
    }
}

/// Compute metrics over flattened label/prediction maps.
///
/// Pixels labelled with a removed class are dropped; predictions of a removed class are
/// reassigned to the first kept class. Without probabilities the curves score each class
/// with the one-hot prediction.
pub fn compute_quality_metrics(
    labels: &[i32],
    predictions: &[i32],
    class_names: &[String],
    probabilities: Option<&ProbabilityGrid>,
    classes_remove: &[usize],
) -> MetricsResult<(QualityMetrics, String)> {
    if predictions.len() != labels.len() {
        return Err(MetricsError::Length {
            what: "predictions",
            expected: labels.len(),
            actual: predictions.len(),
        });
    }
    if let Some(probs) = probabilities {
        if probs.pixels() != labels.len() {
            return Err(MetricsError::Length {
                what: "probability pixels",
                expected: labels.len(),
                actual: probs.pixels(),
            });
        }
        if probs.classes != class_names.len() {
            return Err(MetricsError::Length {
                what: "probability classes",
                expected: class_names.len(),
                actual: probs.classes,
            });
        }
    }
    let num_classes = class_names.len();
    if let Some(&id) = classes_remove.iter().find(|id| **id >= num_classes) {
        return Err(MetricsError::UnknownClass {
            id,
            classes: num_classes,
        });
    }
    let removed = |v: i32| v >= 0 && classes_remove.contains(&(v as usize));
    let kept: Vec<usize> = (0..num_classes)
        .filter(|id| !classes_remove.contains(id))
        .collect();
    let first_kept = *kept.first().ok_or(MetricsError::Empty)? as i32;

    let pixels: Vec<usize> = (0..labels.len()).filter(|i| !removed(labels[*i])).collect();
    if pixels.is_empty() {
        return Err(MetricsError::Empty);
    }
    let y_true: Vec<i32> = pixels.iter().map(|i| labels[*i]).collect();
    let y_pred: Vec<i32> = pixels
        .iter()
        .map(|i| {
            let p = predictions[*i];
            if removed(p) {
                first_kept
            } else {
                p
            }
        })
        .collect();

    let kept_names: Vec<String> = kept.iter().map(|id| class_names[*id].clone()).collect();
    let stats: Vec<ClassStats> = kept
        .par_iter()
        .map(|id| ClassStats::compute(&y_true, &y_pred, *id as i32))
        .collect();
    let correct = y_true.iter().zip(&y_pred).filter(|(l, p)| l == p).count();
    let accuracy = correct as f64 / y_true.len() as f64;
    let report = classification_report(&kept_names, &stats, accuracy);

    let curves = kept
        .par_iter()
        .map(|id| -> MetricsResult<ClassCurves> {
            let scores: Vec<f64> = match probabilities {
                Some(probs) => pixels.iter().map(|i| probs.pixel(*i)[*id] as f64).collect(),
                None => y_pred
                    .iter()
                    .map(|p| if *p == *id as i32 { 1.0 } else { 0.0 })
                    .collect(),
            };
            let pos = *id as i32;
            let roc = roc_curve(&y_true, &scores, pos)?;
            let auc_roc = auc(&roc.fpr, &roc.tpr)?;
            Ok(ClassCurves {
                class_id: *id,
                class_name: class_names[*id].clone(),
                prec_rec_curve: precision_recall_curve(&y_true, &scores, pos)?,
                roc_curve: roc,
                auc_roc,
            })
        })
        .collect::<MetricsResult<Vec<_>>>()?;

    let kept_i32: Vec<i32> = kept.iter().map(|id| *id as i32).collect();
    let matrix = normalize_rows(&confusion_matrix(&y_true, &y_pred, &kept_i32));

    let metrics = QualityMetrics {
        class_names: kept_names,
        class_ids: kept,
        f1_score: stats.iter().map(|s| s.f1).collect(),
        precision: stats.iter().map(|s| s.precision).collect(),
        recall: stats.iter().map(|s| s.recall).collect(),
        support: stats.iter().map(|s| s.support).collect(),
        accuracy,
        classification_report: report,
        curves,
        confusion_matrix: matrix,
    };
    let text = render(&metrics);
    Ok((metrics, text))
}

fn render(metrics: &QualityMetrics) -> String {
    let mut out = String::new();
    let sections = [
        ("F1-Score:", &metrics.f1_score),
        ("Precision:", &metrics.precision),
        ("Recall:", &metrics.recall),
    ];
    for (title, values) in sections {
        out.push_str(title);
        out.push('\n');
        for (name, v) in metrics.class_names.iter().zip(values.iter()) {
            let _ = writeln!(out, "  - {name}: {v:?}");
        }
    }
    for c in &metrics.curves {
        let _ = writeln!(out, "AUC-ROC {}: {:?}", c.class_name, c.auc_roc);
    }
    let _ = writeln!(out, "Classification Report:\n{}", metrics.classification_report);
    let _ = writeln!(
        out,
        "Confusion Matrix:\n{}",
        format_confusion_matrix(&metrics.confusion_matrix)
    );
    out
}

/// Evaluate a predicted class map against ground truth, cropping the truth to the
/// prediction extent when they differ. With `out_dir`, writes
/// `classification_report<suffix>.txt` and `classification_metrics<suffix>.json`.
pub fn evaluate_classification(
    prediction: &LabelGrid,
    ground_truth: &LabelGrid,
    class_names: &[String],
    probabilities: Option<&ProbabilityGrid>,
    out_dir: Option<&Path>,
    suffix: &str,
    classes_ignore: &[usize],
) -> MetricsResult<(QualityMetrics, String)> {
    let truth = if ground_truth.dims() != prediction.dims() {
        ground_truth.center_crop(prediction.rows, prediction.cols)?
    } else {
        ground_truth.clone()
    };
    let (metrics, report) = compute_quality_metrics(
        &truth.data,
        &prediction.data,
        class_names,
        probabilities,
        classes_ignore,
    )?;
    let out = format!("{RESULTS_BANNER}{report}");
    info!("\n{out}");

    if let Some(dir) = out_dir {
        let io = |path: &Path, source| MetricsError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(|e| io(dir, e))?;
        let report_path = dir.join(format!("classification_report{suffix}.txt"));
        std::fs::write(&report_path, &out).map_err(|e| io(&report_path, e))?;
        let metrics_path = dir.join(format!("classification_metrics{suffix}.json"));
        let json = serde_json::to_string_pretty(&metrics)?;
        std::fs::write(&metrics_path, json).map_err(|e| io(&metrics_path, e))?;
        info!(report = %report_path.display(), metrics = %metrics_path.display(), "wrote classification outputs");
    }
    Ok((metrics, out))
}
