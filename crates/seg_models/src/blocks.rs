//! Convolution building blocks shared by the U-Net and FCN families.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Variance-scaling initializer: Kaiming normal with gain `sqrt(var_scale)` (fan in).
pub fn variance_scaling(var_scale: f64) -> Initializer {
    Initializer::KaimingNormal {
        gain: var_scale.max(f64::EPSILON).sqrt(),
        fan_out_only: false,
    }
}

pub fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    padding: PaddingConfig2d,
    var_scale: f64,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_padding(padding)
        .with_initializer(variance_scaling(var_scale))
        .init(device)
}

/// Transposed convolution with kernel and stride `factor`: exact `factor`x upsampling.
pub fn upsample<B: Backend>(
    channels: [usize; 2],
    factor: usize,
    var_scale: f64,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new(channels, [factor, factor])
        .with_stride([factor, factor])
        .with_initializer(variance_scaling(var_scale))
        .init(device)
}

/// Stack of 3x3 convolutions, each followed by ReLU.
#[derive(Debug, Module)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        layers: usize,
        padding: PaddingConfig2d,
        var_scale: f64,
        device: &B::Device,
    ) -> Self {
        let convs = (0..layers.max(1))
            .map(|i| {
                let input = if i == 0 { in_channels } else { out_channels };
                conv([input, out_channels], 3, padding.clone(), var_scale, device)
            })
            .collect();
        Self { convs }
    }

    /// Two valid 3x3 convolutions, the U-Net level unit.
    pub fn valid_pair(in_channels: usize, out_channels: usize, var_scale: f64, device: &B::Device) -> Self {
        Self::new(in_channels, out_channels, 2, PaddingConfig2d::Valid, var_scale, device)
    }

    pub fn layers(&self) -> usize {
        self.convs.len()
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convs
            .iter()
            .fold(input, |x, conv| relu(conv.forward(x)))
    }
}
