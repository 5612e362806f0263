//! One-vs-rest threshold curves and trapezoidal area.

use crate::types::{MetricsError, MetricsResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    /// Increasing; one fewer entry than `precision`/`recall`.
    pub thresholds: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Decreasing; the first entry is `+inf`.
    pub thresholds: Vec<f64>,
}

struct ClfCounts {
    fps: Vec<f64>,
    tps: Vec<f64>,
    thresholds: Vec<f64>,
}

/// False/true positive counts at every distinct score, highest score first.
fn binary_clf_curve(y_true: &[i32], scores: &[f64], pos_label: i32) -> MetricsResult<ClfCounts> {
    if y_true.len() != scores.len() {
        return Err(MetricsError::Length {
            what: "scores",
            expected: y_true.len(),
            actual: scores.len(),
        });
    }
    if y_true.is_empty() {
        return Err(MetricsError::Empty);
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut counts = ClfCounts {
        fps: Vec::new(),
        tps: Vec::new(),
        thresholds: Vec::new(),
    };
    let mut tp = 0.0;
    for (i, &idx) in order.iter().enumerate() {
        if y_true[idx] == pos_label {
            tp += 1.0;
        }
        let last_of_value = order
            .get(i + 1)
            .map_or(true, |&next| scores[next] != scores[idx]);
        if last_of_value {
            counts.tps.push(tp);
            counts.fps.push((i + 1) as f64 - tp);
            counts.thresholds.push(scores[idx]);
        }
    }
    Ok(counts)
}

pub fn precision_recall_curve(
    y_true: &[i32],
    scores: &[f64],
    pos_label: i32,
) -> MetricsResult<PrCurve> {
    let counts = binary_clf_curve(y_true, scores, pos_label)?;
    let total_tp = counts.tps.last().copied().unwrap_or(0.0);

    let mut precision: Vec<f64> = counts
        .tps
        .iter()
        .zip(&counts.fps)
        .map(|(tp, fp)| if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 })
        .rev()
        .collect();
    let mut recall: Vec<f64> = counts
        .tps
        .iter()
        .map(|tp| if total_tp > 0.0 { tp / total_tp } else { 1.0 })
        .rev()
        .collect();
    precision.push(1.0);
    recall.push(0.0);
    let thresholds = counts.thresholds.into_iter().rev().collect();
    Ok(PrCurve {
        precision,
        recall,
        thresholds,
    })
}

/// ROC curve with collinear points dropped. Without negatives (or positives) the
/// corresponding rate is NaN.
pub fn roc_curve(y_true: &[i32], scores: &[f64], pos_label: i32) -> MetricsResult<RocCurve> {
    let counts = binary_clf_curve(y_true, scores, pos_label)?;
    let n = counts.fps.len();
    let keep: Vec<usize> = if n > 2 {
        (0..n)
            .filter(|&i| {
                i == 0
                    || i == n - 1
                    || counts.fps[i + 1] - 2.0 * counts.fps[i] + counts.fps[i - 1] != 0.0
                    || counts.tps[i + 1] - 2.0 * counts.tps[i] + counts.tps[i - 1] != 0.0
            })
            .collect()
    } else {
        (0..n).collect()
    };

    let mut fps = vec![0.0];
    let mut tps = vec![0.0];
    let mut thresholds = vec![f64::INFINITY];
    for i in keep {
        fps.push(counts.fps[i]);
        tps.push(counts.tps[i]);
        thresholds.push(counts.thresholds[i]);
    }
    let rate = |values: Vec<f64>| {
        let total = values.last().copied().unwrap_or(0.0);
        values
            .into_iter()
            .map(|v| if total > 0.0 { v / total } else { f64::NAN })
            .collect::<Vec<_>>()
    };
    Ok(RocCurve {
        fpr: rate(fps),
        tpr: rate(tps),
        thresholds,
    })
}

/// Trapezoidal area under `y(x)`; `x` must be monotonic in either direction.
pub fn auc(x: &[f64], y: &[f64]) -> MetricsResult<f64> {
    if x.len() != y.len() {
        return Err(MetricsError::Length {
            what: "auc y values",
            expected: x.len(),
            actual: y.len(),
        });
    }
    if x.len() < 2 {
        return Err(MetricsError::TooFewPoints(x.len()));
    }
    let dx: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let direction = if dx.iter().any(|d| *d < 0.0) {
        if dx.iter().all(|d| *d <= 0.0) {
            -1.0
        } else {
            return Err(MetricsError::NonMonotonic);
        }
    } else {
        1.0
    };
    let area: f64 = dx
        .iter()
        .zip(y.windows(2))
        .map(|(d, w)| d * (w[0] + w[1]) / 2.0)
        .sum();
    Ok(direction * area)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const Y: [i32; 4] = [1, 1, 2, 2];
    const SCORES: [f64; 4] = [0.1, 0.4, 0.35, 0.8];

    #[test]
    fn roc_matches_reference_example() {
        let roc = roc_curve(&Y, &SCORES, 2).unwrap();
        assert_eq!(roc.fpr, vec![0.0, 0.0, 0.5, 0.5, 1.0]);
        assert_eq!(roc.tpr, vec![0.0, 0.5, 0.5, 1.0, 1.0]);
        assert!(roc.thresholds[0].is_infinite());
        assert_eq!(&roc.thresholds[1..], &[0.8, 0.4, 0.35, 0.1]);
        assert_abs_diff_eq!(auc(&roc.fpr, &roc.tpr).unwrap(), 0.75, epsilon = 1e-12);
    }

    #[test]
    fn precision_recall_matches_reference_example() {
        let pr = precision_recall_curve(&Y, &SCORES, 2).unwrap();
        let expected = [0.5, 2.0 / 3.0, 0.5, 1.0, 1.0];
        for (got, want) in pr.precision.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
        assert_eq!(pr.recall, vec![1.0, 1.0, 0.5, 0.5, 0.0]);
        assert_eq!(pr.thresholds, vec![0.1, 0.35, 0.4, 0.8]);
    }

    #[test]
    fn collinear_roc_points_are_dropped() {
        let y = [0, 0, 0, 1, 1, 1];
        let s = [0.1, 0.2, 0.3, 0.7, 0.8, 0.9];
        let roc = roc_curve(&y, &s, 1).unwrap();
        assert_eq!(roc.tpr, vec![0.0, 1.0 / 3.0, 1.0, 1.0]);
        assert_eq!(roc.fpr, vec![0.0, 0.0, 0.0, 1.0]);
        assert_abs_diff_eq!(auc(&roc.fpr, &roc.tpr).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_positives_give_nan_tpr() {
        let roc = roc_curve(&[0, 0], &[0.2, 0.4], 1).unwrap();
        assert!(roc.tpr.iter().all(|v| v.is_nan()));
        assert!(auc(&roc.fpr, &roc.tpr).unwrap().is_nan());
    }

    #[test]
    fn auc_direction_and_errors() {
        assert_abs_diff_eq!(auc(&[1.0, 0.0], &[1.0, 1.0]).unwrap(), 1.0);
        assert!(matches!(auc(&[0.0, 1.0, 0.5], &[1.0; 3]), Err(MetricsError::NonMonotonic)));
        assert!(matches!(auc(&[0.0], &[1.0]), Err(MetricsError::TooFewPoints(1))));
        assert!(matches!(roc_curve(&[], &[], 1), Err(MetricsError::Empty)));
    }
}
