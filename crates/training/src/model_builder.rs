//! Training, validation and prediction orchestration around the segmentation networks.

use crate::config::TrainParams;
use crate::loss::one_hot;
use crate::step_metrics::{LoggingHook, MetricsSnapshot, StepMetrics};
use crate::{ADBackend, TrainBackend};
use anyhow::{bail, Context};
use burn::module::{AutodiffModule, Module};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use chip_dataset::{
    decode_metadata, write_chips, BatchIter, Chip, ChipShape, DatasetLoader, FeatureSchema,
    LoaderParams, RecordReader,
};
use quality_metrics::{compute_quality_metrics, ProbabilityGrid, QualityMetrics};
use seg_models::{ModelKind, NetworkConfig, Segmenter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const MODEL_FILE: &str = "model.bin";
pub const STATE_FILE: &str = "state.json";
pub const PARAMETERS_FILE: &str = "parameters.csv";
/// Image key of prediction records that store per-class probabilities.
pub const PROBABILITIES_KEY: &str = "probabilities";

pub const VALIDATION_BANNER: &str = "<<------------------------------------------------------------>>\n\
<<------------------ Validation Results ---------------------->>\n\
<<------------------------------------------------------------>>\n";

type Device = <TrainBackend as Backend>::Device;

/// Progress persisted next to the checkpoint so training can resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainState {
    pub global_step: usize,
    pub epoch: usize,
}

impl TrainState {
    pub fn load(dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("invalid training state {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join(STATE_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: MetricsSnapshot,
    pub eval: Option<MetricsSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainReport {
    pub network: String,
    pub decay_steps: usize,
    pub global_step: usize,
    pub epochs: Vec<EpochReport>,
}

/// Class map of one chip, `height x width` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub height: usize,
    pub width: usize,
    pub classes: Vec<i32>,
    /// Per-pixel class probabilities, classes fastest.
    pub probabilities: Option<Vec<f32>>,
    /// Input label cropped to the prediction extent; `None` when the records had no labels.
    pub truth: Option<Vec<i32>>,
}

impl Prediction {
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

#[derive(Debug, Clone)]
enum Network {
    Registered(ModelKind),
    Custom(String),
}

/// Builds, trains and runs one segmentation network.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    network: Network,
}

impl ModelBuilder {
    pub fn new(kind: ModelKind) -> Self {
        Self {
            network: Network::Registered(kind),
        }
    }

    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        Ok(Self::new(name.parse::<ModelKind>()?))
    }

    /// A user network, trained through [`ModelBuilder::fit`].
    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            network: Network::Custom(name.into()),
        }
    }

    pub fn network_name(&self) -> &str {
        match &self.network {
            Network::Registered(kind) => kind.as_str(),
            Network::Custom(name) => name,
        }
    }

    pub fn kind(&self) -> Option<ModelKind> {
        match self.network {
            Network::Registered(kind) => Some(kind),
            Network::Custom(_) => None,
        }
    }

    /// Network settings derived from `params`; `fusion = "late"` turns `unet` into `unet_lf`.
    pub fn network_config(&self, params: &TrainParams) -> anyhow::Result<NetworkConfig> {
        let Some(mut kind) = self.kind() else {
            bail!(
                "`{}` is a custom network; build it yourself and use fit/predict_with",
                self.network_name()
            );
        };
        if kind == ModelKind::UNet && params.fusion == "late" {
            kind = ModelKind::UNetLateFusion;
        }
        let shape = params.chip_shape()?;
        let cfg = NetworkConfig {
            dropout: params.dropout_rate,
            var_scale: params.var_scale_factor,
            base_filters: params.base_filters,
            depth: params.unet_depth,
            fusion_split: params.fusion_split,
            ..NetworkConfig::new(kind, shape.bands, params.num_classes)
        };
        cfg.validate()?;
        cfg.check_input(shape.height, shape.width)?;
        Ok(cfg)
    }

    pub fn output_size(&self, params: &TrainParams, input: usize) -> anyhow::Result<usize> {
        Ok(self.network_config(params)?.output_size(input))
    }

    /// Train on `train_records`, evaluating on `test_records` after every epoch.
    pub fn train(
        &self,
        train_records: &Path,
        test_records: Option<&Path>,
        params: &TrainParams,
        output_dir: &Path,
    ) -> anyhow::Result<TrainReport> {
        params.validate()?;
        let cfg = self.network_config(params)?;
        let device = Device::default();
        info!(network = cfg.kind.as_str(), bands = cfg.bands, classes = cfg.num_classes, "building network");
        let report = match cfg.kind {
            ModelKind::UNet => {
                let model = cfg.init_unet::<ADBackend>(&device);
                self.fit(model, train_records, test_records, params, output_dir, &device)?.1
            }
            ModelKind::UNetLateFusion => {
                let model = cfg.init_late_fusion::<ADBackend>(&device);
                self.fit(model, train_records, test_records, params, output_dir, &device)?.1
            }
            _ => {
                let model = cfg.init_fcn::<ADBackend>(&device);
                self.fit(model, train_records, test_records, params, output_dir, &device)?.1
            }
        };
        Ok(report)
    }

    /// Training loop for any [`Segmenter`]; returns the trained model with its report.
    pub fn fit<M>(
        &self,
        model: M,
        train_records: &Path,
        test_records: Option<&Path>,
        params: &TrainParams,
        output_dir: &Path,
        device: &Device,
    ) -> anyhow::Result<(M, TrainReport)>
    where
        M: Segmenter<ADBackend> + AutodiffModule<ADBackend>,
        M::InnerModule: Segmenter<TrainBackend>,
    {
        params.validate()?;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        let train_loader = DatasetLoader::new(train_records, params.loader_params());
        let epoch_len = train_loader.epoch_len(true)?;
        let decay_steps = epoch_len.div_ceil(params.batch_size).max(1);
        self.write_parameters(output_dir, params, decay_steps)?;
        info!(epoch_len, decay_steps, "training set ready");

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let model_path = output_dir.join(MODEL_FILE);
        let (mut model, mut state) = if model_path.exists() {
            let model = model
                .load_file(model_path.clone(), &recorder, device)
                .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", model_path.display()))?;
            let state = TrainState::load(output_dir)?.unwrap_or_default();
            info!(epoch = state.epoch, global_step = state.global_step, "resuming from checkpoint");
            (model, state)
        } else {
            (model, TrainState::default())
        };

        let mut optim = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(params.l2_reg_rate as f32)))
            .init();
        let train_hook = LoggingHook::train(output_dir, params.log_every);
        let eval_hook = LoggingHook::eval(output_dir, params.log_every);
        let weights = params.class_weights.as_deref();
        let mut report = TrainReport {
            network: self.network_name().to_string(),
            decay_steps,
            global_step: state.global_step,
            epochs: Vec::new(),
        };
        if state.epoch >= params.epochs {
            info!(epoch = state.epoch, "checkpoint already covers the requested epochs");
        }

        for epoch in state.epoch + 1..=params.epochs {
            let mut metrics = StepMetrics::new(params.num_classes);
            let mut batches = train_loader.input_pipeline(true)?;
            while let Some((batch, images)) = batches.next_batch::<ADBackend>(device)? {
                let logits = model.forward(images);
                let dims = logits.dims();
                let labels = target_labels(&batch, dims, params.num_classes)?;
                let targets =
                    one_hot::<ADBackend>(&labels, params.num_classes, [dims[0], dims[2], dims[3]], device);
                let loss = params.loss_func.compute(logits.clone(), targets, weights);
                let lr = params.learning_rate_at(state.global_step, decay_steps);

                let loss_value = scalar(loss.clone().detach())?;
                let probs = host(softmax(logits.detach(), 1))?;
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);
                state.global_step += 1;

                metrics.update(&labels, &probs, dims, loss_value, lr);
                train_hook.on_step(epoch, &metrics.snapshot(state.global_step))?;
            }
            if batches.processed_batches() == 0 {
                warn!(epoch, "training pipeline produced no batches");
            }
            let train = metrics.snapshot(state.global_step);
            info!(
                epoch,
                step = train.step,
                loss = train.loss,
                accuracy = train.accuracy,
                f1_score = train.f1_score,
                "epoch finished"
            );

            let eval = match test_records {
                Some(path) => {
                    let loader = DatasetLoader::new(path, params.loader_params());
                    let batches = loader.input_pipeline(false)?;
                    let metrics =
                        evaluate_pass::<TrainBackend, _>(&model.valid(), batches, params, device)?;
                    let snapshot = metrics.snapshot(state.global_step);
                    eval_hook.record(epoch, &snapshot)?;
                    Some(snapshot)
                }
                None => None,
            };

            model
                .clone()
                .save_file(model_path.clone(), &recorder)
                .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
            state.epoch = epoch;
            state.save(output_dir)?;
            info!(path = %model_path.display(), epoch, "saved checkpoint");
            report.epochs.push(EpochReport { epoch, train, eval });
        }
        report.global_step = state.global_step;
        Ok((model, report))
    }

    /// Predict on `records`, score against their labels and write the report into
    /// `model_dir/validation/`.
    pub fn validate(
        &self,
        records: &Path,
        params: &TrainParams,
        model_dir: &Path,
    ) -> anyhow::Result<(QualityMetrics, String)> {
        let predictions = self.predict(records, params, model_dir, true)?;
        let (metrics, out) = validation_metrics(&predictions, params)?;
        info!("\n{out}");

        let dir = model_dir.join("validation");
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let report_path = dir.join("validation_report.txt");
        fs::write(&report_path, &out)
            .with_context(|| format!("failed to write {}", report_path.display()))?;
        let metrics_path = dir.join("validation_metrics.json");
        fs::write(&metrics_path, serde_json::to_string_pretty(&metrics)?)
            .with_context(|| format!("failed to write {}", metrics_path.display()))?;
        Ok((metrics, out))
    }

    /// Class maps for every chip in `records` using the checkpoint in `model_dir`.
    pub fn predict(
        &self,
        records: &Path,
        params: &TrainParams,
        model_dir: &Path,
        with_probabilities: bool,
    ) -> anyhow::Result<Vec<Prediction>> {
        params.validate()?;
        let cfg = self.network_config(params)?;
        let device = Device::default();
        let loader = DatasetLoader::new(records, params.loader_params());
        match cfg.kind {
            ModelKind::UNet => {
                let model = load_network(cfg.init_unet::<TrainBackend>(&device), model_dir, &device)?;
                predict_with(&model, &loader, with_probabilities, &device)
            }
            ModelKind::UNetLateFusion => {
                let model =
                    load_network(cfg.init_late_fusion::<TrainBackend>(&device), model_dir, &device)?;
                predict_with(&model, &loader, with_probabilities, &device)
            }
            _ => {
                let model = load_network(cfg.init_fcn::<TrainBackend>(&device), model_dir, &device)?;
                predict_with(&model, &loader, with_probabilities, &device)
            }
        }
    }

    fn write_parameters(
        &self,
        output_dir: &Path,
        params: &TrainParams,
        decay_steps: usize,
    ) -> anyhow::Result<()> {
        let effective = TrainParams {
            decay_steps,
            ..params.clone()
        };
        let mut out = format!("network;{}\n", self.network_name());
        for (key, value) in effective.csv_rows()? {
            out.push_str(&format!("{key};{value}\n"));
        }
        let path = output_dir.join(PARAMETERS_FILE);
        fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))
    }
}

fn host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> anyhow::Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read tensor data: {e:?}"))
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> anyhow::Result<f32> {
    host(tensor)?
        .first()
        .copied()
        .context("empty loss tensor")
}

/// Labels cropped to the logits extent, checking the class dimension.
fn target_labels(
    batch: &chip_dataset::ChipBatch,
    dims: [usize; 4],
    num_classes: usize,
) -> anyhow::Result<Vec<i32>> {
    let [_, classes, h, w] = dims;
    if classes != num_classes {
        bail!("network produced {classes} class channels, expected {num_classes}");
    }
    Ok(batch.crop_labels(h, w)?)
}

fn evaluate_pass<B: Backend, M: Segmenter<B>>(
    model: &M,
    mut batches: BatchIter,
    params: &TrainParams,
    device: &B::Device,
) -> anyhow::Result<StepMetrics> {
    let mut metrics = StepMetrics::new(params.num_classes);
    let weights = params.class_weights.as_deref();
    while let Some((batch, images)) = batches.next_batch::<B>(device)? {
        let logits = model.forward(images);
        let dims = logits.dims();
        let labels = target_labels(&batch, dims, params.num_classes)?;
        let targets = one_hot::<B>(&labels, params.num_classes, [dims[0], dims[2], dims[3]], device);
        let loss = scalar(params.loss_func.compute(logits.clone(), targets, weights))?;
        let probs = host(softmax(logits, 1))?;
        metrics.update(&labels, &probs, dims, loss, 0.0);
    }
    Ok(metrics)
}

fn load_network<M: Module<TrainBackend>>(model: M, model_dir: &Path, device: &Device) -> anyhow::Result<M> {
    let path = model_dir.join(MODEL_FILE);
    if !path.exists() {
        bail!("no checkpoint at {}", path.display());
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.clone(), &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", path.display()))
}

/// Run `model` over every chip of `loader` in file order.
pub fn predict_with<B: Backend, M: Segmenter<B>>(
    model: &M,
    loader: &DatasetLoader,
    with_probabilities: bool,
    device: &B::Device,
) -> anyhow::Result<Vec<Prediction>> {
    let labeled = loader.labels_present()?;
    if !labeled {
        info!(path = %loader.path().display(), "records carry no labels; predicting without truth");
    }
    let mut loader = loader.clone();
    loader.params_mut().require_labels = false;
    let mut batches = loader.input_pipeline(false)?;
    let mut predictions = Vec::new();
    while let Some((batch, images)) = batches.next_batch::<B>(device)? {
        let logits = model.forward(images);
        let [n, c, h, w] = logits.dims();
        let truth = if labeled {
            Some(batch.crop_labels(h, w)?)
        } else {
            None
        };
        let probs = host(softmax(logits, 1))?;
        let plane = h * w;
        for sample in 0..n {
            let at = |class: usize, pixel: usize| probs[(sample * c + class) * plane + pixel];
            let mut classes = Vec::with_capacity(plane);
            let mut pixel_probs = Vec::with_capacity(if with_probabilities { plane * c } else { 0 });
            for pixel in 0..plane {
                let mut best = 0;
                for class in 0..c {
                    if at(class, pixel) > at(best, pixel) {
                        best = class;
                    }
                    if with_probabilities {
                        pixel_probs.push(at(class, pixel));
                    }
                }
                classes.push(best as i32);
            }
            predictions.push(Prediction {
                height: h,
                width: w,
                classes,
                probabilities: with_probabilities.then_some(pixel_probs),
                truth: truth
                    .as_ref()
                    .map(|t| t[sample * plane..(sample + 1) * plane].to_vec()),
            });
        }
    }
    info!(chips = predictions.len(), "prediction finished");
    Ok(predictions)
}

/// Quality metrics over all predictions, with the validation banner prefixed to the report.
pub fn validation_metrics(
    predictions: &[Prediction],
    params: &TrainParams,
) -> anyhow::Result<(QualityMetrics, String)> {
    if predictions.iter().any(|p| p.truth.is_none()) {
        bail!("predictions have no ground truth to validate against");
    }
    let labels: Vec<i32> = predictions
        .iter()
        .flat_map(|p| p.truth.iter().flatten().copied())
        .collect();
    let classes: Vec<i32> = predictions.iter().flat_map(|p| p.classes.iter().copied()).collect();
    let probabilities = if predictions.iter().all(|p| p.probabilities.is_some()) {
        let data: Vec<f32> = predictions
            .iter()
            .flat_map(|p| p.probabilities.iter().flatten().copied())
            .collect();
        Some(ProbabilityGrid::new(labels.len(), 1, params.num_classes, data)?)
    } else {
        None
    };
    let (metrics, report) = compute_quality_metrics(
        &labels,
        &classes,
        &params.class_names,
        probabilities.as_ref(),
        &params.classes_ignore,
    )?;
    Ok((metrics, format!("{VALIDATION_BANNER}{report}")))
}

/// Store predictions as chip records. The label feature holds the class map. Probabilities go
/// under [`PROBABILITIES_KEY`]; without them the class ids are written as a one-band image.
pub fn write_predictions(path: &Path, predictions: &[Prediction]) -> anyhow::Result<usize> {
    let with_probabilities = predictions.iter().all(|p| p.probabilities.is_some());
    let chips = predictions
        .iter()
        .map(|p| {
            let (bands, image) = match (&p.probabilities, with_probabilities) {
                (Some(probs), true) => (probs.len() / p.pixels().max(1), probs.clone()),
                _ => (1, p.classes.iter().map(|c| *c as f32).collect()),
            };
            Chip::new(ChipShape::new(p.height, p.width, bands), image, p.classes.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;
    let written = write_chips(path, &prediction_schema(with_probabilities), &chips)?;
    info!(path = %path.display(), records = written, with_probabilities, "wrote predictions");
    Ok(written)
}

/// Read records written by [`write_predictions`]; `truth` is left empty.
pub fn read_predictions(path: &Path) -> anyhow::Result<Vec<Prediction>> {
    let first = RecordReader::open(path)?
        .next()
        .transpose()?
        .with_context(|| format!("no prediction records in {}", path.display()))?;
    let with_probabilities = decode_metadata(&first, &prediction_schema(true))?.image_present;
    let mut loader = DatasetLoader::new(path, LoaderParams::default());
    loader.set_features(prediction_schema(with_probabilities));
    let predictions = loader
        .load_chips()?
        .into_iter()
        .map(|chip| Prediction {
            height: chip.shape.height,
            width: chip.shape.width,
            classes: chip.label,
            probabilities: with_probabilities.then_some(chip.image),
            truth: None,
        })
        .collect();
    Ok(predictions)
}

fn prediction_schema(with_probabilities: bool) -> FeatureSchema {
    if with_probabilities {
        FeatureSchema::default().with_image_key(PROBABILITIES_KEY)
    } else {
        FeatureSchema::default()
    }
}

/// Snap continuous values to class ids in `start..=num_classes`, rounding halves down.
pub fn discretize_values(values: &[f32], num_classes: usize, start: usize) -> Vec<u8> {
    let low = start as f32 + 0.5;
    let high = num_classes as f32 - 0.5;
    values
        .iter()
        .map(|&v| {
            if !(v > low) {
                start as u8
            } else if v > high {
                num_classes as u8
            } else {
                (v - 0.5).ceil() as u8
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discretize_snaps_to_nearest_class() {
        let values = [-3.0, 1.0, 1.5, 1.51, 2.4, 2.6, 3.49, 3.6, 9.0, f32::NAN];
        assert_eq!(
            discretize_values(&values, 4, 1),
            vec![1, 1, 1, 2, 2, 3, 3, 4, 4, 1]
        );
    }

    #[test]
    fn builder_names_and_configs() -> anyhow::Result<()> {
        assert!(ModelBuilder::from_name("segnet").is_err());
        let builder = ModelBuilder::from_name("unet")?;
        assert_eq!(builder.network_name(), "unet");
        let params = TrainParams {
            num_classes: 2,
            class_names: vec!["a".into(), "b".into()],
            shape: Some(ChipShape::new(572, 572, 4)),
            fusion: "late".into(),
            ..TrainParams::default()
        };
        let cfg = builder.network_config(&params)?;
        assert_eq!(cfg.kind, ModelKind::UNetLateFusion);
        assert_eq!(cfg.fusion_split, None);
        assert_eq!(builder.output_size(&params, 572)?, 388);
        assert_eq!(ModelBuilder::new(ModelKind::Fcn8s).output_size(&params, 100)?, 96);

        let small = TrainParams {
            shape: Some(ChipShape::new(32, 32, 4)),
            fusion: "none".into(),
            ..params.clone()
        };
        assert!(builder.network_config(&small).is_err());
        assert!(builder.output_size(&small, 32).is_err());
        let fcn = ModelBuilder::new(ModelKind::Fcn32s);
        assert!(fcn.network_config(&small).is_ok());
        let narrow = TrainParams {
            shape: Some(ChipShape::new(64, 16, 4)),
            ..small.clone()
        };
        assert!(fcn.network_config(&narrow).is_err());

        let custom = ModelBuilder::custom("mynet");
        assert_eq!(custom.network_name(), "mynet");
        assert!(custom.network_config(&params).is_err());
        Ok(())
    }

    #[test]
    fn validation_metrics_uses_probabilities() -> anyhow::Result<()> {
        let params = TrainParams {
            num_classes: 3,
            class_names: vec!["none".into(), "water".into(), "forest".into()],
            shape: Some(ChipShape::new(2, 1, 1)),
            ..TrainParams::default()
        };
        let predictions = vec![Prediction {
            height: 2,
            width: 1,
            classes: vec![1, 2],
            probabilities: Some(vec![0.1, 0.8, 0.1, 0.1, 0.2, 0.7]),
            truth: Some(vec![1, 2]),
        }];
        let (metrics, out) = validation_metrics(&predictions, &params)?;
        assert!(out.starts_with(VALIDATION_BANNER));
        assert_eq!(metrics.class_names, vec!["water", "forest"]);
        assert_eq!(metrics.accuracy, 1.0);

        let unlabeled = vec![Prediction {
            truth: None,
            ..predictions[0].clone()
        }];
        assert!(validation_metrics(&unlabeled, &params).is_err());
        Ok(())
    }
}
