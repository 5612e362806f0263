//! Burn segmentation networks for multi-band satellite chips.
//!
//! Every network consumes `[N, bands, H, W]` images and produces per-pixel class logits
//! `[N, classes, h, w]`. Valid-padded networks (U-Net) shrink the spatial extent; use
//! [`Segmenter::output_size`] to size label crops.
//!
//! - `UNet` / `UNetLateFusion`: encoder/decoder with crop-and-concatenate skips.
//! - `Fcn`: VGG-style fully convolutional network at output strides 32, 8, 4, 2, 1.
//! - `ModelKind` / `NetworkConfig`: the name registry used by training and the CLIs.

pub mod blocks;
pub mod fcn;
pub mod registry;
pub mod unet;

pub use fcn::{Fcn, FcnConfig, FcnStride};
pub use registry::{ModelError, ModelKind, NetworkConfig};
pub use unet::{LateFusionConfig, UNet, UNetConfig, UNetLateFusion};

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// A network `ModelBuilder` can train, evaluate and predict with.
pub trait Segmenter<B: Backend>: Module<B> {
    /// Logits `[N, classes, h, w]` for images `[N, bands, H, W]`.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Spatial output extent for a square input of side `input`.
    fn output_size(&self, input: usize) -> usize;

    fn name(&self) -> &'static str;
}

/// Center crop of the last two dimensions. Offsets are `floor(diff / 2)`; targets larger
/// than the input are clamped to the input extent.
pub fn crop_features<B: Backend>(features: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [n, c, h, w] = features.dims();
    let height = height.min(h);
    let width = width.min(w);
    if height == h && width == w {
        return features;
    }
    let top = (h - height) / 2;
    let left = (w - width) / 2;
    features.slice([0..n, 0..c, top..top + height, left..left + width])
}

pub mod prelude {
    pub use super::{
        crop_features, Fcn, FcnConfig, FcnStride, ModelKind, NetworkConfig, Segmenter, UNet,
        UNetConfig, UNetLateFusion,
    };
}
