use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("chip shape has a zero dimension: {0:?}")]
    ZeroDimension(ChipShape),
    #[error("image buffer holds {actual} values, shape {shape:?} needs {expected}")]
    ImageLength {
        shape: ChipShape,
        expected: usize,
        actual: usize,
    },
    #[error("label buffer holds {actual} values, shape {shape:?} needs {expected}")]
    LabelLength {
        shape: ChipShape,
        expected: usize,
        actual: usize,
    },
    #[error("image value at index {index} is not finite ({value})")]
    NonFinite { index: usize, value: f32 },
}

/// Spatial extent and band count of a chip (HWC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChipShape {
    pub height: usize,
    pub width: usize,
    pub bands: usize,
}

impl ChipShape {
    pub fn new(height: usize, width: usize, bands: usize) -> Self {
        Self {
            height,
            width,
            bands,
        }
    }

    pub fn pixels(&self) -> usize {
        self.height * self.width
    }

    pub fn image_len(&self) -> usize {
        self.pixels() * self.bands
    }

    pub fn label_shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Same shape with height and width swapped (rotations, transpose).
    pub fn transposed(&self) -> Self {
        Self::new(self.width, self.height, self.bands)
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        if self.height == 0 || self.width == 0 || self.bands == 0 {
            return Err(ContractError::ZeroDimension(*self));
        }
        Ok(())
    }
}

/// One training/inference sample: image in HWC order, one class id per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Chip {
    pub shape: ChipShape,
    pub image: Vec<f32>,
    pub label: Vec<i32>,
}

impl Chip {
    pub fn new(shape: ChipShape, image: Vec<f32>, label: Vec<i32>) -> Result<Self, ContractError> {
        let chip = Self {
            shape,
            image,
            label,
        };
        chip.validate()?;
        Ok(chip)
    }

    /// Chip with an all-zero label (inference inputs).
    pub fn unlabeled(shape: ChipShape, image: Vec<f32>) -> Result<Self, ContractError> {
        let label = vec![0; shape.pixels()];
        Self::new(shape, image, label)
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        self.shape.validate()?;
        if self.image.len() != self.shape.image_len() {
            return Err(ContractError::ImageLength {
                shape: self.shape,
                expected: self.shape.image_len(),
                actual: self.image.len(),
            });
        }
        if self.label.len() != self.shape.pixels() {
            return Err(ContractError::LabelLength {
                shape: self.shape,
                expected: self.shape.pixels(),
                actual: self.label.len(),
            });
        }
        if let Some((index, value)) = self
            .image
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite())
        {
            return Err(ContractError::NonFinite {
                index,
                value: *value,
            });
        }
        Ok(())
    }

    pub fn pixel(&self, row: usize, col: usize) -> &[f32] {
        let bands = self.shape.bands;
        let base = (row * self.shape.width + col) * bands;
        &self.image[base..base + bands]
    }

    pub fn label_at(&self, row: usize, col: usize) -> i32 {
        self.label[row * self.shape.width + col]
    }

    /// Image reordered to CHW, the layout convolution layers consume.
    pub fn image_chw(&self) -> Vec<f32> {
        let ChipShape {
            height,
            width,
            bands,
        } = self.shape;
        let plane = height * width;
        let mut out = vec![0.0f32; self.image.len()];
        for (idx, px) in self.image.chunks_exact(bands).enumerate() {
            for (c, v) in px.iter().enumerate() {
                out[c * plane + idx] = *v;
            }
        }
        out
    }
}

/// Summary of a record that skips the pixel payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipMetadata {
    pub shape: ChipShape,
    pub image_present: bool,
    pub label_present: bool,
}
