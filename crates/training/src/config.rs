use crate::loss::LossKind;
use anyhow::{bail, Context};
use chip_contracts::ChipShape;
use chip_dataset::LoaderParams;
use seg_models::ModelKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_NAME: &str = "deepgeo.toml";
const CONFIG_ENV: &str = "DEEPGEO_CONFIG";

/// Hyper-parameters and dataset description shared by train, validate and predict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub learning_rate_decay: bool,
    pub decay_rate: f64,
    /// Recomputed from the training set size when training starts.
    pub decay_steps: usize,
    pub l2_reg_rate: f64,
    pub dropout_rate: f64,
    pub var_scale_factor: f64,
    /// `none` or `late`; `late` turns a `unet` into its late-fusion variant.
    pub fusion: String,
    pub fusion_split: Option<usize>,
    pub loss_func: LossKind,
    pub data_aug_ops: Vec<String>,
    pub log_every: usize,
    pub seed: Option<u64>,
    pub shuffle_buffer: Option<usize>,
    pub num_classes: usize,
    pub class_names: Vec<String>,
    pub shape: Option<ChipShape>,
    pub class_weights: Option<Vec<f32>>,
    pub classes_ignore: Vec<usize>,
    pub base_filters: Option<usize>,
    pub unet_depth: usize,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 10,
            learning_rate: 0.001,
            learning_rate_decay: true,
            decay_rate: 0.1,
            decay_steps: 245,
            l2_reg_rate: 0.5,
            dropout_rate: 0.5,
            var_scale_factor: 2.0,
            fusion: "none".to_string(),
            fusion_split: None,
            loss_func: LossKind::WeightedCrossEntropy,
            data_aug_ops: Vec::new(),
            log_every: 100,
            seed: None,
            shuffle_buffer: None,
            num_classes: 0,
            class_names: Vec::new(),
            shape: None,
            class_weights: None,
            classes_ignore: vec![0],
            base_filters: None,
            unet_depth: 4,
        }
    }
}

impl TrainParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_classes == 0 {
            bail!("num_classes must be set");
        }
        if self.class_names.len() != self.num_classes {
            bail!(
                "class_names has {} entries but num_classes is {}",
                self.class_names.len(),
                self.num_classes
            );
        }
        if let Some(weights) = &self.class_weights {
            if weights.len() != self.num_classes {
                bail!(
                    "class_weights has {} entries but num_classes is {}",
                    weights.len(),
                    self.num_classes
                );
            }
        }
        if let Some(id) = self.classes_ignore.iter().find(|id| **id >= self.num_classes) {
            bail!("classes_ignore contains {id}, outside the {} classes", self.num_classes);
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        match self.shape {
            Some(shape) => shape.validate()?,
            None => bail!("shape (chip height, width, bands) must be set"),
        }
        if !matches!(self.fusion.as_str(), "none" | "late") {
            bail!("fusion must be `none` or `late`, got `{}`", self.fusion);
        }
        Ok(())
    }

    /// Chip shape; call after [`TrainParams::validate`].
    pub fn chip_shape(&self) -> anyhow::Result<ChipShape> {
        self.shape.context("shape (chip height, width, bands) must be set")
    }

    /// Exponential decay `lr * rate^(step / decay_steps)` when enabled.
    pub fn learning_rate_at(&self, step: usize, decay_steps: usize) -> f64 {
        if !self.learning_rate_decay || decay_steps == 0 {
            return self.learning_rate;
        }
        self.learning_rate * self.decay_rate.powf(step as f64 / decay_steps as f64)
    }

    /// Loader settings for one pass over a record file.
    pub fn loader_params(&self) -> LoaderParams {
        LoaderParams {
            shape: self.shape,
            data_aug_ops: self.data_aug_ops.clone(),
            batch_size: self.batch_size,
            epochs: 1,
            shuffle_buffer: self.shuffle_buffer,
            seed: self.seed,
            ..LoaderParams::default()
        }
    }

    /// `key;value` rows; strings are written bare, everything else as JSON.
    pub fn csv_rows(&self) -> anyhow::Result<Vec<(String, String)>> {
        let value = serde_json::to_value(self)?;
        let map = value
            .as_object()
            .context("parameters did not serialize to an object")?;
        Ok(map
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect())
    }
}

/// File-backed run configuration (`deepgeo.toml`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainConfig {
    pub network: Option<ModelKind>,
    pub train_records: Option<PathBuf>,
    pub test_records: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub params: TrainParams,
}

#[derive(Debug, Deserialize, Default)]
struct TrainConfigFile {
    network: Option<ModelKind>,
    paths: Option<PathsSection>,
    params: Option<TrainParams>,
}

#[derive(Debug, Deserialize, Default)]
struct PathsSection {
    train_records: Option<String>,
    test_records: Option<String>,
    output_dir: Option<String>,
}

impl TrainConfig {
    /// Read `$DEEPGEO_CONFIG`, or `deepgeo.toml` in the working directory. A missing file
    /// yields defaults; a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_path(&expand_path(&path)),
            Err(_) => Self::from_path(Path::new(DEFAULT_CONFIG_NAME)),
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let file: TrainConfigFile = toml::from_str(raw)?;
        let paths = file.paths.unwrap_or_default();
        Ok(Self {
            network: file.network,
            train_records: paths.train_records.map(|v| expand_path(&v)),
            test_records: paths.test_records.map(|v| expand_path(&v)),
            output_dir: paths.output_dir.map(|v| expand_path(&v)),
            params: file.params.unwrap_or_default(),
        })
    }
}

pub(crate) fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

/// Replace `${VAR}` with its value; unknown variables are left as written.
fn expand_env(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&rest[start..start + end + 3]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> TrainParams {
        TrainParams {
            num_classes: 3,
            class_names: vec!["no_data".into(), "forest".into(), "deforestation".into()],
            shape: Some(ChipShape::new(286, 286, 10)),
            ..TrainParams::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let p = TrainParams::default();
        assert_eq!(p.epochs, 1);
        assert_eq!(p.batch_size, 10);
        assert_eq!(p.decay_steps, 245);
        assert_eq!(p.loss_func, LossKind::WeightedCrossEntropy);
        assert_eq!(p.classes_ignore, vec![0]);
        assert!(p.validate().is_err());
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn validation_catches_inconsistent_classes() {
        let mut p = valid_params();
        p.class_weights = Some(vec![1.0; 2]);
        assert!(p.validate().is_err());
        let mut p = valid_params();
        p.classes_ignore = vec![3];
        assert!(p.validate().is_err());
        let mut p = valid_params();
        p.fusion = "early".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn learning_rate_decays_exponentially() {
        let p = valid_params();
        assert_eq!(p.learning_rate_at(0, 10), 0.001);
        assert!((p.learning_rate_at(10, 10) - 0.0001).abs() < 1e-12);
        assert!((p.learning_rate_at(5, 10) - 0.001 * 0.1f64.sqrt()).abs() < 1e-12);
        let fixed = TrainParams {
            learning_rate_decay: false,
            ..valid_params()
        };
        assert_eq!(fixed.learning_rate_at(1000, 10), 0.001);
    }

    #[test]
    fn toml_config_expands_paths() {
        std::env::set_var("DEEPGEO_TEST_ROOT", "/data/geo");
        let cfg = TrainConfig::from_toml(
            r#"
network = "unet"

[paths]
train_records = "${DEEPGEO_TEST_ROOT}/train.tfrecords"
output_dir = "${DEEPGEO_TEST_UNSET}/out"

[params]
epochs = 3
num_classes = 2
class_names = ["background", "water"]
shape = { height = 64, width = 64, bands = 4 }
loss_func = "soft_dice"
"#,
        )
        .unwrap();
        assert_eq!(cfg.network, Some(ModelKind::UNet));
        assert_eq!(
            cfg.train_records,
            Some(PathBuf::from("/data/geo/train.tfrecords"))
        );
        assert_eq!(
            cfg.output_dir,
            Some(PathBuf::from("${DEEPGEO_TEST_UNSET}/out"))
        );
        assert_eq!(cfg.params.epochs, 3);
        assert_eq!(cfg.params.batch_size, 10);
        assert_eq!(cfg.params.loss_func, LossKind::SoftDice);
        assert!(cfg.params.validate().is_ok());
        assert!(TrainConfig::from_toml("network = \"segnet\"").is_err());
    }

    #[test]
    fn csv_rows_write_strings_bare() {
        let rows = valid_params().csv_rows().unwrap();
        let get = |key: &str| rows.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        assert_eq!(get("loss_func").as_deref(), Some("weighted_crossentropy"));
        assert_eq!(get("batch_size").as_deref(), Some("10"));
        assert_eq!(get("seed").as_deref(), Some(""));
    }
}
