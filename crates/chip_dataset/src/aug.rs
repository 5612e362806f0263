//! Geometric augmentations applied identically to chip image and label.

use crate::types::{DatasetError, DatasetResult};
use chip_contracts::{Chip, ChipShape};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type AugmentationOp = Arc<dyn Fn(Chip) -> Chip + Send + Sync>;

/// Build a chip of `out_shape` where output pixel (r, c) copies input pixel `src(r, c)`.
fn remap<F>(chip: &Chip, out_shape: ChipShape, src: F) -> Chip
where
    F: Fn(usize, usize) -> (usize, usize),
{
    let bands = chip.shape.bands;
    let in_w = chip.shape.width;
    let mut image = Vec::with_capacity(chip.image.len());
    let mut label = Vec::with_capacity(chip.label.len());
    for r in 0..out_shape.height {
        for c in 0..out_shape.width {
            let (sr, sc) = src(r, c);
            let idx = sr * in_w + sc;
            image.extend_from_slice(&chip.image[idx * bands..(idx + 1) * bands]);
            label.push(chip.label[idx]);
        }
    }
    Chip {
        shape: out_shape,
        image,
        label,
    }
}

/// Rotate counter-clockwise by `k` quarter turns.
pub fn rot90(chip: &Chip, k: usize) -> Chip {
    let h = chip.shape.height;
    let w = chip.shape.width;
    match k % 4 {
        0 => chip.clone(),
        1 => remap(chip, chip.shape.transposed(), |r, c| (c, w - 1 - r)),
        2 => remap(chip, chip.shape, |r, c| (h - 1 - r, w - 1 - c)),
        _ => remap(chip, chip.shape.transposed(), |r, c| (h - 1 - c, r)),
    }
}

pub fn flip_left_right(chip: &Chip) -> Chip {
    let w = chip.shape.width;
    remap(chip, chip.shape, |r, c| (r, w - 1 - c))
}

pub fn flip_up_down(chip: &Chip) -> Chip {
    let h = chip.shape.height;
    remap(chip, chip.shape, |r, c| (h - 1 - r, c))
}

pub fn transpose(chip: &Chip) -> Chip {
    remap(chip, chip.shape.transposed(), |r, c| (c, r))
}

/// Named augmentations selectable from configuration (`data_aug_ops`).
#[derive(Clone)]
pub struct AugmentationRegistry {
    ops: BTreeMap<String, AugmentationOp>,
}

impl Default for AugmentationRegistry {
    fn default() -> Self {
        let mut registry = Self {
            ops: BTreeMap::new(),
        };
        registry.register("rot90", |c: Chip| rot90(&c, 1));
        registry.register("rot180", |c: Chip| rot90(&c, 2));
        registry.register("rot270", |c: Chip| rot90(&c, 3));
        registry.register("flip_left_right", |c: Chip| flip_left_right(&c));
        registry.register("flip_up_down", |c: Chip| flip_up_down(&c));
        registry.register("flip_transpose", |c: Chip| transpose(&c));
        registry
    }
}

impl fmt::Debug for AugmentationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AugmentationRegistry")
            .field("ops", &self.keys())
            .finish()
    }
}

impl AugmentationRegistry {
    /// Add or replace an augmentation under `key`.
    pub fn register<F>(&mut self, key: impl Into<String>, op: F)
    where
        F: Fn(Chip) -> Chip + Send + Sync + 'static,
    {
        self.ops.insert(key.into(), Arc::new(op));
    }

    pub fn get(&self, key: &str) -> Option<AugmentationOp> {
        self.ops.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.ops.keys().map(String::as_str).collect()
    }

    pub fn resolve(&self, keys: &[String]) -> DatasetResult<Vec<(String, AugmentationOp)>> {
        keys.iter()
            .map(|key| {
                self.get(key)
                    .map(|op| (key.clone(), op))
                    .ok_or_else(|| DatasetError::UnknownAugmentation(key.clone()))
            })
            .collect()
    }
}
