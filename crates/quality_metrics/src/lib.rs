//! Classification quality metrics for segmentation outputs.
//!
//! Per-class F1/precision/recall, a text classification report, one-vs-rest
//! precision-recall and ROC curves with trapezoidal AUC, and row-normalized confusion
//! matrices. Curves are returned as data; rendering them is left to callers.

pub mod curves;
pub mod evaluate;
pub mod report;
pub mod types;

pub use curves::{auc, precision_recall_curve, roc_curve, PrCurve, RocCurve};
pub use evaluate::{
    compute_quality_metrics, evaluate_classification, ClassCurves, QualityMetrics,
    RESULTS_BANNER,
};
pub use report::{
    classification_report, confusion_matrix, format_confusion_matrix, normalize_rows,
    ClassStats,
};
pub use types::{LabelGrid, MetricsError, MetricsResult, ProbabilityGrid};
