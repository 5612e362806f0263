use crate::config::{TrainConfig, TrainParams};
use crate::loss::LossKind;
use clap::{Args, ValueEnum};
use seg_models::ModelKind;
use std::path::PathBuf;
use tracing::warn;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; the WGPU backend is used despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

/// Install the fmt subscriber; `RUST_LOG` refines the `info` default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Config file plus the flags that override it, shared by every binary.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// TOML config (defaults to $DEEPGEO_CONFIG, then ./deepgeo.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Network to use (fcn1s, fcn2s, fcn4s, fcn8s, fcn32s, unet, unet_lf).
    #[arg(long, value_enum)]
    pub network: Option<ModelKind>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long, value_enum)]
    pub loss_func: Option<LossKind>,
    /// Comma-separated augmentation keys (e.g. rot90,flip_left_right).
    #[arg(long, value_delimiter = ',')]
    pub data_aug_ops: Option<Vec<String>>,
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ConfigArgs {
    /// Load the config file and apply the flags on top of it.
    pub fn resolve(&self) -> anyhow::Result<TrainConfig> {
        validate_backend_choice(self.backend)?;
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_path(path)?,
            None => TrainConfig::load()?,
        };
        if self.network.is_some() {
            config.network = self.network;
        }
        self.apply(&mut config.params);
        Ok(config)
    }

    fn apply(&self, params: &mut TrainParams) {
        if let Some(v) = self.epochs {
            params.epochs = v;
        }
        if let Some(v) = self.batch_size {
            params.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            params.learning_rate = v;
        }
        if let Some(v) = self.loss_func {
            params.loss_func = v;
        }
        if let Some(v) = &self.data_aug_ops {
            params.data_aug_ops = v.clone();
        }
        if self.seed.is_some() {
            params.seed = self.seed;
        }
    }
}
