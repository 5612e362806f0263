//! Streaming metrics tracked while training and evaluating.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const AUC_THRESHOLDS: usize = 200;
const AUC_EPSILON: f64 = 1e-7;

/// Streaming ROC AUC over fixed, evenly spaced thresholds.
#[derive(Debug, Clone)]
pub struct StreamingAuc {
    thresholds: Vec<f64>,
    tp: Vec<u64>,
    fp: Vec<u64>,
    tn: Vec<u64>,
    fn_: Vec<u64>,
}

impl StreamingAuc {
    pub fn new(num_thresholds: usize) -> Self {
        let n = num_thresholds.max(3);
        let mut thresholds = Vec::with_capacity(n);
        thresholds.push(-AUC_EPSILON);
        for i in 1..n - 1 {
            thresholds.push(i as f64 / (n - 1) as f64);
        }
        thresholds.push(1.0 + AUC_EPSILON);
        Self {
            thresholds,
            tp: vec![0; n],
            fp: vec![0; n],
            tn: vec![0; n],
            fn_: vec![0; n],
        }
    }

    pub fn update(&mut self, positive: bool, score: f32) {
        let score = score as f64;
        for (i, t) in self.thresholds.iter().enumerate() {
            match (score > *t, positive) {
                (true, true) => self.tp[i] += 1,
                (true, false) => self.fp[i] += 1,
                (false, true) => self.fn_[i] += 1,
                (false, false) => self.tn[i] += 1,
            }
        }
    }

    /// Trapezoidal area under the (fpr, tpr) points, thresholds ascending.
    pub fn value(&self) -> f64 {
        let point = |i: usize| {
            let (tp, fp) = (self.tp[i] as f64, self.fp[i] as f64);
            let (tn, fn_) = (self.tn[i] as f64, self.fn_[i] as f64);
            let tpr = (tp + AUC_EPSILON) / (tp + fn_ + AUC_EPSILON);
            let fpr = fp / (fp + tn + AUC_EPSILON);
            (fpr, tpr)
        };
        (0..self.thresholds.len() - 1)
            .map(|i| {
                let (x0, y0) = point(i);
                let (x1, y1) = point(i + 1);
                (x0 - x1) * (y0 + y1) / 2.0
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub step: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub f1_score: f64,
    pub cross_entropy: f64,
    pub auc_roc: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone)]
pub struct StepMetrics {
    num_classes: usize,
    confusion: Vec<u64>,
    correct: u64,
    pixels: u64,
    xent_sum: f64,
    xent_count: u64,
    loss_sum: f64,
    loss_count: u64,
    learning_rate: f64,
    auc: StreamingAuc,
}

impl StepMetrics {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            confusion: vec![0; num_classes * num_classes],
            correct: 0,
            pixels: 0,
            xent_sum: 0.0,
            xent_count: 0,
            loss_sum: 0.0,
            loss_count: 0,
            learning_rate: 0.0,
            auc: StreamingAuc::new(AUC_THRESHOLDS),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Fold in one batch: `labels` are `[N, H, W]`, `probs` the softmax output with
    /// `dims = [N, C, H, W]`. Pixels whose label is outside the class range are skipped.
    pub fn update(
        &mut self,
        labels: &[i32],
        probs: &[f32],
        dims: [usize; 4],
        loss: f32,
        learning_rate: f64,
    ) {
        let [n, c, h, w] = dims;
        let plane = h * w;
        self.loss_sum += loss as f64;
        self.loss_count += 1;
        self.learning_rate = learning_rate;
        if c != self.num_classes || labels.len() != n * plane || probs.len() != n * c * plane {
            return;
        }

        for (i, &label) in labels.iter().enumerate() {
            if label < 0 || label as usize >= c {
                continue;
            }
            let label = label as usize;
            let (sample, pixel) = (i / plane, i % plane);
            let at = |class: usize| probs[(sample * c + class) * plane + pixel];

            let mut best = 0;
            for class in 1..c {
                if at(class) > at(best) {
                    best = class;
                }
            }
            self.confusion[label * c + best] += 1;
            if best == label {
                self.correct += 1;
            }
            self.pixels += 1;

            for class in 0..c {
                let p = at(class);
                let z = if class == label { 1.0 } else { 0.0 };
                self.xent_sum += sigmoid_cross_entropy(p as f64, z);
                self.xent_count += 1;
                self.auc.update(class == label, p);
            }
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct as f64, self.pixels as f64)
    }

    /// Macro F1 over the classes seen in labels or predictions.
    pub fn f1_score(&self) -> f64 {
        let c = self.num_classes;
        let mut total = 0.0;
        let mut seen = 0usize;
        for k in 0..c {
            let tp = self.confusion[k * c + k] as f64;
            let row: u64 = (0..c).map(|j| self.confusion[k * c + j]).sum();
            let col: u64 = (0..c).map(|i| self.confusion[i * c + k]).sum();
            let (fn_, fp) = (row as f64 - tp, col as f64 - tp);
            if tp + fp + fn_ == 0.0 {
                continue;
            }
            total += 2.0 * tp / (2.0 * tp + fp + fn_);
            seen += 1;
        }
        ratio(total, seen as f64)
    }

    pub fn cross_entropy(&self) -> f64 {
        ratio(self.xent_sum, self.xent_count as f64)
    }

    pub fn auc_roc(&self) -> f64 {
        self.auc.value()
    }

    pub fn loss(&self) -> f64 {
        ratio(self.loss_sum, self.loss_count as f64)
    }

    pub fn snapshot(&self, step: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            step,
            loss: self.loss(),
            accuracy: self.accuracy(),
            f1_score: self.f1_score(),
            cross_entropy: self.cross_entropy(),
            auc_roc: self.auc_roc(),
            learning_rate: self.learning_rate,
        }
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// `max(x, 0) - x*z + ln(1 + exp(-|x|))`
fn sigmoid_cross_entropy(x: f64, z: f64) -> f64 {
    x.max(0.0) - x * z + (-x.abs()).exp().ln_1p()
}

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    phase: &'a str,
    epoch: usize,
    #[serde(flatten)]
    metrics: &'a MetricsSnapshot,
}

/// Logs snapshots every `every_n_steps` and appends them to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct LoggingHook {
    every_n_steps: usize,
    phase: &'static str,
    path: PathBuf,
}

impl LoggingHook {
    /// `metrics.jsonl` in `output_dir`.
    pub fn train(output_dir: &Path, every_n_steps: usize) -> Self {
        Self {
            every_n_steps,
            phase: "train",
            path: output_dir.join("metrics.jsonl"),
        }
    }

    /// `eval/metrics.jsonl` in `output_dir`.
    pub fn eval(output_dir: &Path, every_n_steps: usize) -> Self {
        Self {
            every_n_steps,
            phase: "eval",
            path: output_dir.join("eval").join("metrics.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn every_n_steps(&self) -> usize {
        self.every_n_steps
    }

    /// Record the snapshot when `step` falls on the logging interval.
    pub fn on_step(&self, epoch: usize, snapshot: &MetricsSnapshot) -> std::io::Result<bool> {
        if self.every_n_steps == 0 || snapshot.step % self.every_n_steps != 0 {
            return Ok(false);
        }
        self.record(epoch, snapshot)?;
        Ok(true)
    }

    pub fn record(&self, epoch: usize, snapshot: &MetricsSnapshot) -> std::io::Result<()> {
        info!(
            phase = self.phase,
            epoch,
            step = snapshot.step,
            loss = snapshot.loss,
            accuracy = snapshot.accuracy,
            f1_score = snapshot.f1_score,
            auc_roc = snapshot.auc_roc,
            learning_rate = snapshot.learning_rate,
            "metrics"
        );
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&LogLine {
            phase: self.phase,
            epoch,
            metrics: snapshot,
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    // two pixels, two classes, NCHW with N=1 H=1 W=2
    fn probs(p0: [f32; 2], p1: [f32; 2]) -> Vec<f32> {
        vec![p0[0], p1[0], p0[1], p1[1]]
    }

    #[test]
    fn perfect_predictions_score_one() {
        let mut m = StepMetrics::new(2);
        m.update(&[0, 1], &probs([0.9, 0.1], [0.2, 0.8]), [1, 2, 1, 2], 0.5, 0.001);
        assert_eq!(m.accuracy(), 1.0);
        assert_eq!(m.f1_score(), 1.0);
        assert_abs_diff_eq!(m.auc_roc(), 1.0, epsilon = 1e-6);
        let snap = m.snapshot(7);
        assert_eq!(snap.step, 7);
        assert_eq!(snap.loss, 0.5);
        assert_eq!(snap.learning_rate, 0.001);
    }

    #[test]
    fn confusion_drives_macro_f1() {
        let mut m = StepMetrics::new(2);
        // pixel 0 labelled 0 predicted 1, pixel 1 labelled 1 predicted 1
        m.update(&[0, 1], &probs([0.3, 0.7], [0.2, 0.8]), [1, 2, 1, 2], 1.0, 0.1);
        assert_eq!(m.accuracy(), 0.5);
        // class 0: f1 0; class 1: tp 1 fp 1 -> 2/3
        assert_abs_diff_eq!(m.f1_score(), (0.0 + 2.0 / 3.0) / 2.0, epsilon = 1e-12);
        m.update(&[1, 1], &probs([0.2, 0.8], [0.1, 0.9]), [1, 2, 1, 2], 3.0, 0.05);
        assert_eq!(m.loss(), 2.0);
        assert_eq!(m.accuracy(), 0.75);
    }

    #[test]
    fn out_of_range_labels_are_skipped() {
        let mut m = StepMetrics::new(2);
        m.update(&[-1, 4], &probs([0.5, 0.5], [0.5, 0.5]), [1, 2, 1, 2], 0.0, 0.0);
        assert_eq!(m.accuracy(), 0.0);
        assert_eq!(m.cross_entropy(), 0.0);
    }

    #[test]
    fn sigmoid_cross_entropy_matches_closed_form() {
        let x: f64 = 0.7;
        let expected = -(1.0 / (1.0 + (-x).exp())).ln();
        assert_abs_diff_eq!(sigmoid_cross_entropy(x, 1.0), expected, epsilon = 1e-12);
    }

    #[test]
    fn hook_appends_on_interval() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let hook = LoggingHook::eval(dir.path(), 2);
        let m = StepMetrics::new(2);
        assert!(!hook.on_step(1, &m.snapshot(1))?);
        assert!(hook.on_step(1, &m.snapshot(2))?);
        hook.record(1, &m.snapshot(3))?;
        let text = std::fs::read_to_string(dir.path().join("eval/metrics.jsonl"))?;
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["phase"], "eval");
        assert_eq!(lines[1]["step"], 3);
        Ok(())
    }
}
