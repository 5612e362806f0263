//! Per-class statistics, the text classification report and confusion matrices.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

const REPORT_DIGITS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassStats {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

impl ClassStats {
    /// One-vs-rest statistics for `class`; zero denominators yield 0.
    pub fn compute(labels: &[i32], predictions: &[i32], class: i32) -> Self {
        let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
        for (l, p) in labels.iter().zip(predictions) {
            match (*l == class, *p == class) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        Self {
            precision: ratio(tp, tp + fp),
            recall: ratio(tp, tp + fn_),
            f1: ratio(2 * tp, 2 * tp + fp + fn_),
            support: tp + fn_,
        }
    }
}

/// Counts with truth on rows and prediction on columns, restricted to `classes`.
pub fn confusion_matrix(labels: &[i32], predictions: &[i32], classes: &[i32]) -> Vec<Vec<u64>> {
    let mut matrix = vec![vec![0u64; classes.len()]; classes.len()];
    for (l, p) in labels.iter().zip(predictions) {
        let row = classes.iter().position(|c| c == l);
        let col = classes.iter().position(|c| c == p);
        if let (Some(r), Some(c)) = (row, col) {
            matrix[r][c] += 1;
        }
    }
    matrix
}

/// Divide every row by its sum; empty rows become NaN.
pub fn normalize_rows(matrix: &[Vec<u64>]) -> Vec<Vec<f64>> {
    matrix
        .iter()
        .map(|row| {
            let total: u64 = row.iter().sum();
            row.iter()
                .map(|v| if total == 0 { f64::NAN } else { *v as f64 / total as f64 })
                .collect()
        })
        .collect()
}

pub fn format_confusion_matrix(matrix: &[Vec<f64>]) -> String {
    let rows: Vec<String> = matrix
        .iter()
        .map(|row| {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.4}")).collect();
            format!("[{}]", cells.join(" "))
        })
        .collect();
    format!("[{}]", rows.join("\n "))
}

/// Text report with one row per class followed by accuracy, macro and weighted averages.
pub fn classification_report(
    class_names: &[String],
    stats: &[ClassStats],
    accuracy: f64,
) -> String {
    const AVG: &str = "weighted avg";
    let width = class_names
        .iter()
        .map(|n| n.chars().count())
        .max()
        .unwrap_or(0)
        .max(AVG.len())
        .max(REPORT_DIGITS);
    let d = REPORT_DIGITS;
    let mut out = String::new();

    let _ = write!(out, "{:>width$} ", "");
    for header in ["precision", "recall", "f1-score", "support"] {
        let _ = write!(out, " {header:>9}");
    }
    out.push_str("\n\n");

    let row = |out: &mut String, name: &str, p: f64, r: f64, f: f64, support: usize| {
        let _ = writeln!(out, "{name:>width$}  {p:>9.d$} {r:>9.d$} {f:>9.d$} {support:>9}");
    };
    for (name, s) in class_names.iter().zip(stats) {
        row(&mut out, name, s.precision, s.recall, s.f1, s.support);
    }
    out.push('\n');

    let total: usize = stats.iter().map(|s| s.support).sum();
    let _ = writeln!(
        out,
        "{:>width$}  {:>9} {:>9} {accuracy:>9.d$} {total:>9}",
        "accuracy", "", ""
    );

    let n = stats.len().max(1) as f64;
    let mean = |f: fn(&ClassStats) -> f64| stats.iter().map(f).sum::<f64>() / n;
    row(
        &mut out,
        "macro avg",
        mean(|s| s.precision),
        mean(|s| s.recall),
        mean(|s| s.f1),
        total,
    );
    let weighted = |f: fn(&ClassStats) -> f64| {
        if total == 0 {
            0.0
        } else {
            stats.iter().map(|s| f(s) * s.support as f64).sum::<f64>() / total as f64
        }
    };
    row(
        &mut out,
        AVG,
        weighted(|s| s.precision),
        weighted(|s| s.recall),
        weighted(|s| s.f1),
        total,
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn report_layout_matches_reference() {
        let labels = [0, 1, 2, 2, 2];
        let preds = [0, 0, 2, 2, 1];
        let stats: Vec<ClassStats> = (0..3)
            .map(|c| ClassStats::compute(&labels, &preds, c))
            .collect();
        let report = classification_report(&names(&["class 0", "class 1", "class 2"]), &stats, 0.6);
        let expected = "              precision    recall  f1-score   support\n\
\n     class 0       0.50      1.00      0.67         1\
\n     class 1       0.00      0.00      0.00         1\
\n     class 2       1.00      0.67      0.80         3\
\n\
\n    accuracy                           0.60         5\
\n   macro avg       0.50      0.56      0.49         5\
\nweighted avg       0.70      0.60      0.61         5\n";
        assert_eq!(report, expected);
    }

    #[test]
    fn stats_handle_zero_division() {
        let s = ClassStats::compute(&[1, 1], &[1, 1], 2);
        assert_eq!(s, ClassStats { precision: 0.0, recall: 0.0, f1: 0.0, support: 0 });
        let s = ClassStats::compute(&[1, 2, 2], &[2, 2, 1], 2);
        assert_relative_eq!(s.precision, 0.5);
        assert_relative_eq!(s.recall, 0.5);
        assert_relative_eq!(s.f1, 0.5);
    }

    #[test]
    fn confusion_rows_normalize_and_print() {
        let cm = confusion_matrix(&[1, 1, 1, 2, 3], &[1, 2, 2, 2, 1], &[1, 2]);
        assert_eq!(cm, vec![vec![1, 2], vec![0, 1]]);
        let norm = normalize_rows(&cm);
        assert_relative_eq!(norm[0][1], 2.0 / 3.0);
        assert_eq!(
            format_confusion_matrix(&norm),
            "[[0.3333 0.6667]\n [0.0000 1.0000]]"
        );
        let empty = normalize_rows(&[vec![0, 0]]);
        assert!(empty[0].iter().all(|v| v.is_nan()));
    }
}
