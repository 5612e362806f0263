use burn::tensor::activation::{log_softmax, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DICE_EPSILON: f64 = 1e-5;

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    #[serde(rename = "cross_entropy")]
    #[value(name = "cross_entropy")]
    CrossEntropy,
    #[serde(rename = "weighted_crossentropy")]
    #[value(name = "weighted_crossentropy")]
    WeightedCrossEntropy,
    #[serde(rename = "soft_dice")]
    #[value(name = "soft_dice")]
    SoftDice,
}

impl LossKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::CrossEntropy => "cross_entropy",
            LossKind::WeightedCrossEntropy => "weighted_crossentropy",
            LossKind::SoftDice => "soft_dice",
        }
    }

    /// Scalar loss for `[N, C, H, W]` logits against one-hot targets of the same shape.
    /// Weighted cross entropy without weights falls back to uniform weights.
    pub fn compute<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        one_hot: Tensor<B, 4>,
        class_weights: Option<&[f32]>,
    ) -> Tensor<B, 1> {
        match self {
            LossKind::CrossEntropy => softmax_cross_entropy(logits, one_hot),
            LossKind::WeightedCrossEntropy => {
                let [_, classes, _, _] = logits.dims();
                let uniform;
                let weights = match class_weights {
                    Some(w) => w,
                    None => {
                        uniform = vec![1.0; classes];
                        &uniform
                    }
                };
                weighted_cross_entropy(logits, one_hot, weights)
            }
            LossKind::SoftDice => avg_soft_dice(logits, one_hot),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cross_entropy" => Ok(LossKind::CrossEntropy),
            "weighted_crossentropy" => Ok(LossKind::WeightedCrossEntropy),
            "soft_dice" => Ok(LossKind::SoftDice),
            other => anyhow::bail!(
                "unknown loss `{other}` (expected cross_entropy, weighted_crossentropy or soft_dice)"
            ),
        }
    }
}

/// `[N, C, H, W]` one-hot encoding of `[N, H, W]` labels; out-of-range labels give zeros.
pub fn one_hot<B: Backend>(
    labels: &[i32],
    num_classes: usize,
    dims: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    let [n, h, w] = dims;
    let plane = h * w;
    let mut data = vec![0f32; n * num_classes * plane];
    for (i, label) in labels.iter().enumerate().take(n * plane) {
        if *label < 0 || *label as usize >= num_classes {
            continue;
        }
        let (sample, pixel) = (i / plane, i % plane);
        data[(sample * num_classes + *label as usize) * plane + pixel] = 1.0;
    }
    Tensor::<B, 4>::from_data(TensorData::new(data, [n, num_classes, h, w]), device)
}

fn pixel_cross_entropy<B: Backend>(logits: Tensor<B, 4>, one_hot: Tensor<B, 4>) -> Tensor<B, 4> {
    (one_hot * log_softmax(logits, 1)).sum_dim(1).neg()
}

pub fn softmax_cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    one_hot: Tensor<B, 4>,
) -> Tensor<B, 1> {
    pixel_cross_entropy(logits, one_hot).mean()
}

pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    one_hot: Tensor<B, 4>,
    class_weights: &[f32],
) -> Tensor<B, 1> {
    let device = logits.device();
    let weights = Tensor::<B, 4>::from_data(
        TensorData::new(class_weights.to_vec(), [1, class_weights.len(), 1, 1]),
        &device,
    );
    let pixel_weights = (one_hot.clone() * weights).sum_dim(1);
    (pixel_cross_entropy(logits, one_hot) * pixel_weights).mean()
}

/// One minus the class-averaged soft Dice coefficient over softmax probabilities.
pub fn avg_soft_dice<B: Backend>(logits: Tensor<B, 4>, one_hot: Tensor<B, 4>) -> Tensor<B, 1> {
    let probs = softmax(logits, 1);
    let per_class = |t: Tensor<B, 4>| t.sum_dim(0).sum_dim(2).sum_dim(3);
    let intersection = per_class(probs.clone() * one_hot.clone());
    let denominator = per_class(probs) + per_class(one_hot);
    let dice = intersection
        .mul_scalar(2.0)
        .add_scalar(DICE_EPSILON)
        .div(denominator.add_scalar(DICE_EPSILON));
    dice.mean().neg().add_scalar(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    fn logits(values: Vec<f32>, dims: [usize; 4]) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(values, dims), &Default::default())
    }

    #[test]
    fn one_hot_marks_label_channel() {
        let t = one_hot::<B>(&[0, 2, 5, -1], 3, [1, 2, 2], &Default::default());
        let data = t.into_data().to_vec::<f32>().unwrap();
        #[rustfmt::skip]
        let expected = vec![
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        ];
        assert_eq!(data, expected);
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_classes() {
        let y = one_hot::<B>(&[0, 1], 2, [1, 1, 2], &Default::default());
        let loss = softmax_cross_entropy(logits(vec![0.0; 4], [1, 2, 1, 2]), y);
        assert_abs_diff_eq!(scalar(loss), 2f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn weights_scale_each_pixel_by_its_class() {
        let y = one_hot::<B>(&[0, 1], 2, [1, 1, 2], &Default::default());
        let plain = scalar(softmax_cross_entropy(logits(vec![0.0; 4], [1, 2, 1, 2]), y.clone()));
        let weighted = scalar(weighted_cross_entropy(
            logits(vec![0.0; 4], [1, 2, 1, 2]),
            y.clone(),
            &[1.0, 3.0],
        ));
        assert_abs_diff_eq!(weighted, 2.0 * plain, epsilon = 1e-6);
        let uniform = scalar(LossKind::WeightedCrossEntropy.compute(
            logits(vec![0.0; 4], [1, 2, 1, 2]),
            y,
            None,
        ));
        assert_abs_diff_eq!(uniform, plain, epsilon = 1e-6);
    }

    #[test]
    fn soft_dice_is_small_for_confident_correct_logits() {
        let y = one_hot::<B>(&[0, 1], 2, [1, 1, 2], &Default::default());
        // channel 0 = [10, -10], channel 1 = [-10, 10]
        let good = scalar(avg_soft_dice(
            logits(vec![10.0, -10.0, -10.0, 10.0], [1, 2, 1, 2]),
            y.clone(),
        ));
        let bad = scalar(avg_soft_dice(
            logits(vec![-10.0, 10.0, 10.0, -10.0], [1, 2, 1, 2]),
            y,
        ));
        assert!(good < 1e-3, "dice loss {good}");
        assert!(bad > 0.99, "dice loss {bad}");
    }

    #[test]
    fn loss_names_parse() {
        assert_eq!("soft_dice".parse::<LossKind>().unwrap(), LossKind::SoftDice);
        assert_eq!(
            " Weighted_CrossEntropy ".parse::<LossKind>().unwrap(),
            LossKind::WeightedCrossEntropy
        );
        assert!("focal".parse::<LossKind>().is_err());
        assert_eq!(LossKind::CrossEntropy.to_string(), "cross_entropy");
    }
}
