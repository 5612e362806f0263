//! U-Net with valid convolutions, plus a late-fusion variant over a band split.

use crate::blocks::{conv, upsample, ConvBlock};
use crate::{crop_features, Segmenter};
use burn::module::Module;
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, PaddingConfig2d};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    /// Number of pooling levels between input and bottleneck.
    pub depth: usize,
    /// Filters at the first level; doubled at every level down.
    pub base_filters: usize,
    pub dropout: f64,
    pub var_scale: f64,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            base_filters: 64,
            dropout: 0.5,
            var_scale: 2.0,
        }
    }
}

impl UNetConfig {
    pub fn filters(&self, level: usize) -> usize {
        self.base_filters.max(1) << level
    }

    pub fn output_size(&self, input: usize) -> usize {
        unet_output_size(self.depth, input)
    }
}

/// Each level loses 4 pixels to two valid 3x3 convolutions; pooling halves (floor) and
/// upsampling doubles.
pub fn unet_output_size(depth: usize, input: usize) -> usize {
    let mut size = input;
    for _ in 0..depth {
        size = size.saturating_sub(4) / 2;
    }
    size = size.saturating_sub(4);
    for _ in 0..depth {
        size = (size * 2).saturating_sub(4);
    }
    size
}

#[derive(Debug, Module)]
pub struct UNetEncoder<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    bottleneck: ConvBlock<B>,
    pool: MaxPool2d,
}

impl<B: Backend> UNetEncoder<B> {
    pub fn new(cfg: &UNetConfig, bands: usize, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(cfg.depth);
        let mut input = bands;
        for level in 0..cfg.depth {
            blocks.push(ConvBlock::valid_pair(input, cfg.filters(level), cfg.var_scale, device));
            input = cfg.filters(level);
        }
        let bottleneck = ConvBlock::valid_pair(input, cfg.filters(cfg.depth), cfg.var_scale, device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        Self {
            blocks,
            bottleneck,
            pool,
        }
    }

    /// Returns the pre-pooling feature map of every level and the bottleneck output.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Vec<Tensor<B, 4>>, Tensor<B, 4>) {
        let mut skips = Vec::with_capacity(self.blocks.len());
        let mut x = input;
        for block in &self.blocks {
            let features = block.forward(x);
            x = self.pool.forward(features.clone());
            skips.push(features);
        }
        (skips, self.bottleneck.forward(x))
    }
}

#[derive(Debug, Module)]
pub struct UNetDecoder<B: Backend> {
    ups: Vec<ConvTranspose2d<B>>,
    blocks: Vec<ConvBlock<B>>,
    dropout: Dropout,
    classifier: Conv2d<B>,
}

impl<B: Backend> UNetDecoder<B> {
    /// `branches` encoders feed the decoder; their skips and bottlenecks arrive concatenated.
    pub fn new(cfg: &UNetConfig, branches: usize, classes: usize, device: &B::Device) -> Self {
        let mut ups = Vec::with_capacity(cfg.depth);
        let mut blocks = Vec::with_capacity(cfg.depth);
        let mut input = branches * cfg.filters(cfg.depth);
        for level in (0..cfg.depth).rev() {
            let filters = cfg.filters(level);
            ups.push(upsample([input, filters], 2, cfg.var_scale, device));
            blocks.push(ConvBlock::valid_pair(
                branches * filters + filters,
                filters,
                cfg.var_scale,
                device,
            ));
            input = filters;
        }
        let classifier = conv([input, classes], 1, PaddingConfig2d::Valid, cfg.var_scale, device);
        Self {
            ups,
            blocks,
            dropout: DropoutConfig::new(cfg.dropout).init(),
            classifier,
        }
    }

    pub fn forward(&self, bottom: Tensor<B, 4>, skips: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let mut x = self.dropout.forward(bottom);
        for ((up, block), skip) in self.ups.iter().zip(&self.blocks).zip(skips.into_iter().rev()) {
            x = up.forward(x);
            let [_, _, h, w] = x.dims();
            x = Tensor::cat(vec![crop_features(skip, h, w), x], 1);
            x = block.forward(x);
        }
        self.classifier.forward(x)
    }
}

#[derive(Debug, Module)]
pub struct UNet<B: Backend> {
    encoder: UNetEncoder<B>,
    decoder: UNetDecoder<B>,
    depth: usize,
}

impl<B: Backend> UNet<B> {
    pub fn new(cfg: &UNetConfig, bands: usize, classes: usize, device: &B::Device) -> Self {
        debug!(bands, classes, depth = cfg.depth, base_filters = cfg.base_filters, "built unet");
        Self {
            encoder: UNetEncoder::new(cfg, bands, device),
            decoder: UNetDecoder::new(cfg, 1, classes, device),
            depth: cfg.depth,
        }
    }
}

impl<B: Backend> Segmenter<B> for UNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let (skips, bottom) = self.encoder.forward(images);
        self.decoder.forward(bottom, skips)
    }

    fn output_size(&self, input: usize) -> usize {
        unet_output_size(self.depth, input)
    }

    fn name(&self) -> &'static str {
        "unet"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateFusionConfig {
    pub unet: UNetConfig,
    /// Bands `[0, split)` feed the first branch, the rest the second.
    pub split: usize,
}

/// Two U-Net encoders over disjoint band groups sharing one decoder.
#[derive(Debug, Module)]
pub struct UNetLateFusion<B: Backend> {
    branch_a: UNetEncoder<B>,
    branch_b: UNetEncoder<B>,
    decoder: UNetDecoder<B>,
    split: usize,
    depth: usize,
}

impl<B: Backend> UNetLateFusion<B> {
    /// `cfg.split` must leave at least one band on each side.
    pub fn new(cfg: &LateFusionConfig, bands: usize, classes: usize, device: &B::Device) -> Self {
        let split = cfg.split.clamp(1, bands.saturating_sub(1).max(1));
        Self {
            branch_a: UNetEncoder::new(&cfg.unet, split, device),
            branch_b: UNetEncoder::new(&cfg.unet, bands - split, device),
            decoder: UNetDecoder::new(&cfg.unet, 2, classes, device),
            split,
            depth: cfg.unet.depth,
        }
    }
}

impl<B: Backend> Segmenter<B> for UNetLateFusion<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n, bands, h, w] = images.dims();
        let first = images.clone().slice([0..n, 0..self.split, 0..h, 0..w]);
        let second = images.slice([0..n, self.split..bands, 0..h, 0..w]);
        let (skips_a, bottom_a) = self.branch_a.forward(first);
        let (skips_b, bottom_b) = self.branch_b.forward(second);
        let skips = skips_a
            .into_iter()
            .zip(skips_b)
            .map(|(a, b)| Tensor::cat(vec![a, b], 1))
            .collect();
        self.decoder
            .forward(Tensor::cat(vec![bottom_a, bottom_b], 1), skips)
    }

    fn output_size(&self, input: usize) -> usize {
        unet_output_size(self.depth, input)
    }

    fn name(&self) -> &'static str {
        "unet_lf"
    }
}
