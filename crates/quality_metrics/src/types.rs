use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("{what}: expected {expected} values, got {actual}")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("class id {id} is outside the {classes} configured classes")]
    UnknownClass { id: usize, classes: usize },
    #[error("no pixels left to evaluate after removing ignored classes")]
    Empty,
    #[error("x values are neither increasing nor decreasing")]
    NonMonotonic,
    #[error("at least 2 points are needed to compute an area under a curve, got {0}")]
    TooFewPoints(usize),
    #[error("ground truth {truth:?} is smaller than prediction {prediction:?}")]
    Crop {
        truth: (usize, usize),
        prediction: (usize, usize),
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize metrics: {0}")]
    Json(#[from] serde_json::Error),
}

/// Row-major map of class ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelGrid {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<i32>,
}

impl LabelGrid {
    pub fn new(rows: usize, cols: usize, data: Vec<i32>) -> MetricsResult<Self> {
        if data.len() != rows * cols {
            return Err(MetricsError::Length {
                what: "label grid",
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Center crop to `rows`x`cols`; offsets are `floor(diff / 2)`.
    pub fn center_crop(&self, rows: usize, cols: usize) -> MetricsResult<LabelGrid> {
        if rows > self.rows || cols > self.cols {
            return Err(MetricsError::Crop {
                truth: self.dims(),
                prediction: (rows, cols),
            });
        }
        let top = (self.rows - rows) / 2;
        let left = (self.cols - cols) / 2;
        let mut data = Vec::with_capacity(rows * cols);
        for r in top..top + rows {
            let start = r * self.cols + left;
            data.extend_from_slice(&self.data[start..start + cols]);
        }
        Ok(LabelGrid { rows, cols, data })
    }
}

/// Per-pixel class probabilities, row-major with the class axis fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityGrid {
    pub rows: usize,
    pub cols: usize,
    pub classes: usize,
    pub data: Vec<f32>,
}

impl ProbabilityGrid {
    pub fn new(rows: usize, cols: usize, classes: usize, data: Vec<f32>) -> MetricsResult<Self> {
        if data.len() != rows * cols * classes {
            return Err(MetricsError::Length {
                what: "probability grid",
                expected: rows * cols * classes,
                actual: data.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            classes,
            data,
        })
    }

    pub fn pixels(&self) -> usize {
        self.rows * self.cols
    }

    pub fn pixel(&self, index: usize) -> &[f32] {
        &self.data[index * self.classes..(index + 1) * self.classes]
    }
}
