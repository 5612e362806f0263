//! Network names selectable from configuration and the CLIs.

use crate::fcn::{Fcn, FcnConfig, FcnStride};
use crate::unet::{unet_output_size, LateFusionConfig, UNet, UNetConfig, UNetLateFusion};
use burn::tensor::backend::Backend;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("unknown network `{0}` (expected one of fcn1s, fcn2s, fcn4s, fcn8s, fcn32s, unet, unet_lf)")]
    UnknownModel(String),
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum ModelKind {
    #[serde(rename = "fcn1s")]
    #[value(name = "fcn1s")]
    Fcn1s,
    #[serde(rename = "fcn2s")]
    #[value(name = "fcn2s")]
    Fcn2s,
    #[serde(rename = "fcn4s")]
    #[value(name = "fcn4s")]
    Fcn4s,
    #[serde(rename = "fcn8s")]
    #[value(name = "fcn8s")]
    Fcn8s,
    #[serde(rename = "fcn32s")]
    #[value(name = "fcn32s")]
    Fcn32s,
    #[serde(rename = "unet")]
    #[value(name = "unet")]
    UNet,
    #[serde(rename = "unet_lf")]
    #[value(name = "unet_lf")]
    UNetLateFusion,
}

impl ModelKind {
    pub const ALL: [ModelKind; 7] = [
        ModelKind::Fcn1s,
        ModelKind::Fcn2s,
        ModelKind::Fcn4s,
        ModelKind::Fcn8s,
        ModelKind::Fcn32s,
        ModelKind::UNet,
        ModelKind::UNetLateFusion,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Fcn1s => "fcn1s",
            ModelKind::Fcn2s => "fcn2s",
            ModelKind::Fcn4s => "fcn4s",
            ModelKind::Fcn8s => "fcn8s",
            ModelKind::Fcn32s => "fcn32s",
            ModelKind::UNet => "unet",
            ModelKind::UNetLateFusion => "unet_lf",
        }
    }

    pub fn fcn_stride(self) -> Option<FcnStride> {
        match self {
            ModelKind::Fcn1s => Some(FcnStride::S1),
            ModelKind::Fcn2s => Some(FcnStride::S2),
            ModelKind::Fcn4s => Some(FcnStride::S4),
            ModelKind::Fcn8s => Some(FcnStride::S8),
            ModelKind::Fcn32s => Some(FcnStride::S32),
            ModelKind::UNet | ModelKind::UNetLateFusion => None,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| ModelError::UnknownModel(s.to_string()))
    }
}

/// Everything needed to instantiate a registered network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub kind: ModelKind,
    pub bands: usize,
    pub num_classes: usize,
    pub dropout: f64,
    pub var_scale: f64,
    /// Overrides the family default (64).
    pub base_filters: Option<usize>,
    /// U-Net pooling levels.
    pub depth: usize,
    /// Late-fusion band split; defaults to half the bands.
    pub fusion_split: Option<usize>,
}

impl NetworkConfig {
    pub fn new(kind: ModelKind, bands: usize, num_classes: usize) -> Self {
        Self {
            kind,
            bands,
            num_classes,
            dropout: 0.5,
            var_scale: 2.0,
            base_filters: None,
            depth: UNetConfig::default().depth,
            fusion_split: None,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.bands == 0 {
            return Err(ModelError::InvalidConfig("bands must be positive".into()));
        }
        if self.num_classes == 0 {
            return Err(ModelError::InvalidConfig("num_classes must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        if self.kind == ModelKind::UNetLateFusion {
            let split = self.split();
            if self.bands < 2 || split == 0 || split >= self.bands {
                return Err(ModelError::InvalidConfig(format!(
                    "late fusion needs bands on both sides of split {split} (bands {})",
                    self.bands
                )));
            }
        }
        Ok(())
    }

    /// Reject inputs the network would shrink to nothing.
    pub fn check_input(&self, height: usize, width: usize) -> Result<(), ModelError> {
        for (side, input) in [("height", height), ("width", width)] {
            if self.output_size(input) == 0 {
                let need = self.min_input();
                return Err(ModelError::InvalidConfig(format!(
                    "{} input {side} {input} leaves no output pixels (needs at least {need})",
                    self.kind
                )));
            }
        }
        Ok(())
    }

    /// Smallest square input with a non-empty output.
    pub fn min_input(&self) -> usize {
        match self.kind {
            ModelKind::UNet | ModelKind::UNetLateFusion => {
                // Search upward from the size that leaves a 5-pixel bottleneck input.
                let mut size = 5;
                for _ in 0..self.depth {
                    size = size * 2 + 4;
                }
                (size..)
                    .find(|s| unet_output_size(self.depth, *s) > 0)
                    .unwrap_or(size)
            }
            _ => crate::fcn::FCN_REDUCTION,
        }
    }

    fn split(&self) -> usize {
        self.fusion_split.unwrap_or(self.bands / 2)
    }

    pub fn unet_config(&self) -> UNetConfig {
        let defaults = UNetConfig::default();
        UNetConfig {
            depth: self.depth,
            base_filters: self.base_filters.unwrap_or(defaults.base_filters),
            dropout: self.dropout,
            var_scale: self.var_scale,
        }
    }

    pub fn late_fusion_config(&self) -> LateFusionConfig {
        LateFusionConfig {
            unet: self.unet_config(),
            split: self.split(),
        }
    }

    pub fn fcn_config(&self) -> FcnConfig {
        let defaults = FcnConfig::default();
        FcnConfig {
            stride: self.kind.fcn_stride().unwrap_or(defaults.stride),
            base_filters: self.base_filters.unwrap_or(defaults.base_filters),
            head_filters: self
                .base_filters
                .map(|f| f * 16)
                .unwrap_or(defaults.head_filters),
            dropout: self.dropout,
            var_scale: self.var_scale,
        }
    }

    /// Spatial output extent for a square input, without building the network.
    pub fn output_size(&self, input: usize) -> usize {
        match self.kind {
            ModelKind::UNet | ModelKind::UNetLateFusion => unet_output_size(self.depth, input),
            _ => input - input % crate::fcn::FCN_REDUCTION,
        }
    }

    pub fn init_unet<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        UNet::new(&self.unet_config(), self.bands, self.num_classes, device)
    }

    pub fn init_late_fusion<B: Backend>(&self, device: &B::Device) -> UNetLateFusion<B> {
        UNetLateFusion::new(&self.late_fusion_config(), self.bands, self.num_classes, device)
    }

    pub fn init_fcn<B: Backend>(&self, device: &B::Device) -> Fcn<B> {
        Fcn::new(&self.fcn_config(), self.bands, self.num_classes, device)
    }
}
