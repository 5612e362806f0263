#![recursion_limit = "256"]

pub mod cli;
pub mod config;
pub mod loss;
pub mod model_builder;
pub mod step_metrics;

pub use cli::{init_tracing, validate_backend_choice, BackendKind, ConfigArgs};
pub use config::{TrainConfig, TrainParams};
pub use loss::LossKind;
pub use model_builder::{
    discretize_values, predict_with, read_predictions, validation_metrics, write_predictions,
    ModelBuilder, Prediction, TrainReport, TrainState,
};
pub use step_metrics::{LoggingHook, MetricsSnapshot, StepMetrics};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = burn::backend::Autodiff<TrainBackend>;
