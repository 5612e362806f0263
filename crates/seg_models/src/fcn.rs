//! Fully convolutional networks over a VGG-style encoder.

use crate::blocks::{conv, upsample, ConvBlock};
use crate::{crop_features, Segmenter};
use burn::module::Module;
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Total downsampling of the encoder.
pub const FCN_REDUCTION: usize = 32;

/// Output stride of the final upsampling; smaller strides fuse more encoder skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FcnStride {
    #[serde(rename = "32")]
    S32,
    #[serde(rename = "8")]
    S8,
    #[serde(rename = "4")]
    S4,
    #[serde(rename = "2")]
    S2,
    #[serde(rename = "1")]
    S1,
}

impl FcnStride {
    pub fn factor(self) -> usize {
        match self {
            FcnStride::S32 => 32,
            FcnStride::S8 => 8,
            FcnStride::S4 => 4,
            FcnStride::S2 => 2,
            FcnStride::S1 => 1,
        }
    }

    /// Skip connections fused before the final upsampling (pool4, pool3, pool2, pool1, conv1).
    pub fn fused_skips(self) -> usize {
        match self {
            FcnStride::S32 => 0,
            FcnStride::S8 => 2,
            FcnStride::S4 => 3,
            FcnStride::S2 => 4,
            FcnStride::S1 => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FcnConfig {
    pub stride: FcnStride,
    /// Filters of the first VGG block; later blocks use 2x, 4x, 8x, 8x.
    pub base_filters: usize,
    /// Width of the 1x1 fully convolutional head.
    pub head_filters: usize,
    pub dropout: f64,
    pub var_scale: f64,
}

impl Default for FcnConfig {
    fn default() -> Self {
        Self {
            stride: FcnStride::S8,
            base_filters: 64,
            head_filters: 1024,
            dropout: 0.5,
            var_scale: 2.0,
        }
    }
}

impl FcnConfig {
    fn block_filters(&self) -> [usize; 5] {
        let f = self.base_filters.max(1);
        [f, f * 2, f * 4, f * 8, f * 8]
    }
}

const VGG_LAYERS: [usize; 5] = [2, 2, 3, 3, 3];

#[derive(Debug, Module)]
pub struct Fcn<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    pool: MaxPool2d,
    fc6: Conv2d<B>,
    fc7: Conv2d<B>,
    dropout: Dropout,
    score: Conv2d<B>,
    /// 1x1 class scores for each fused skip, deepest first.
    skip_scores: Vec<Conv2d<B>>,
    /// 2x upsampling applied before each fusion.
    skip_ups: Vec<ConvTranspose2d<B>>,
    final_up: Option<ConvTranspose2d<B>>,
    stride: usize,
}

impl<B: Backend> Fcn<B> {
    pub fn new(cfg: &FcnConfig, bands: usize, classes: usize, device: &B::Device) -> Self {
        let filters = cfg.block_filters();
        let same = PaddingConfig2d::Same;
        let mut blocks = Vec::with_capacity(5);
        let mut input = bands;
        for (out, layers) in filters.iter().zip(VGG_LAYERS) {
            blocks.push(ConvBlock::new(input, *out, layers, same.clone(), cfg.var_scale, device));
            input = *out;
        }
        let head = cfg.head_filters.max(1);
        let fc6 = conv([input, head], 1, PaddingConfig2d::Valid, cfg.var_scale, device);
        let fc7 = conv([head, head], 1, PaddingConfig2d::Valid, cfg.var_scale, device);
        let score = conv([head, classes], 1, PaddingConfig2d::Valid, cfg.var_scale, device);

        // Skip sources from deepest to shallowest: pool4, pool3, pool2, pool1, conv1.
        let skip_channels = [filters[3], filters[2], filters[1], filters[0], filters[0]];
        let fused = cfg.stride.fused_skips();
        let skip_scores = skip_channels[..fused]
            .iter()
            .map(|ch| conv([*ch, classes], 1, PaddingConfig2d::Valid, cfg.var_scale, device))
            .collect();
        let skip_ups = (0..fused)
            .map(|_| upsample([classes, classes], 2, cfg.var_scale, device))
            .collect();
        let stride = cfg.stride.factor();
        let final_up = (stride > 1).then(|| upsample([classes, classes], stride, cfg.var_scale, device));
        debug!(bands, classes, stride, fused, ?filters, head, "built fcn");

        Self {
            blocks,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc6,
            fc7,
            dropout: DropoutConfig::new(cfg.dropout).init(),
            score,
            skip_scores,
            skip_ups,
            final_up,
            stride,
        }
    }
}

impl<B: Backend> Segmenter<B> for Fcn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        // conv1 at full resolution, then pool1..pool5.
        let mut taps = Vec::with_capacity(6);
        let mut x = images;
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if i == 0 {
                taps.push(x.clone());
            }
            x = self.pool.forward(x);
            taps.push(x.clone());
        }
        let x = self.dropout.forward(relu(self.fc6.forward(x)));
        let x = self.dropout.forward(relu(self.fc7.forward(x)));
        let mut scores = self.score.forward(x);

        // taps: [conv1, pool1, pool2, pool3, pool4, pool5]; fuse pool4 first.
        for (k, (up, skip_score)) in self.skip_ups.iter().zip(&self.skip_scores).enumerate() {
            let upsampled = up.forward(scores);
            let skip = skip_score.forward(taps[4 - k].clone());
            let [_, _, uh, uw] = upsampled.dims();
            let [_, _, sh, sw] = skip.dims();
            let (h, w) = (uh.min(sh), uw.min(sw));
            scores = crop_features(upsampled, h, w) + crop_features(skip, h, w);
        }
        match &self.final_up {
            Some(up) => up.forward(scores),
            None => scores,
        }
    }

    fn output_size(&self, input: usize) -> usize {
        input - input % FCN_REDUCTION
    }

    fn name(&self) -> &'static str {
        match self.stride {
            32 => "fcn32s",
            8 => "fcn8s",
            4 => "fcn4s",
            2 => "fcn2s",
            _ => "fcn1s",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_fuse_progressively_more_skips() {
        let fused: Vec<usize> = [FcnStride::S32, FcnStride::S8, FcnStride::S4, FcnStride::S2, FcnStride::S1]
            .iter()
            .map(|s| s.fused_skips())
            .collect();
        assert_eq!(fused, vec![0, 2, 3, 4, 5]);
        for s in [FcnStride::S8, FcnStride::S4, FcnStride::S2, FcnStride::S1] {
            // each fusion doubles resolution from 1/32
            assert_eq!(FCN_REDUCTION >> s.fused_skips(), s.factor());
        }
    }

    #[test]
    fn stride_serializes_as_number_string() {
        let json = serde_json::to_string(&FcnStride::S4).unwrap();
        assert_eq!(json, "\"4\"");
    }
}
