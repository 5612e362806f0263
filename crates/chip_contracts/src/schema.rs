use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Bytes,
    Int64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub key: String,
    pub kind: FeatureKind,
}

impl FeatureSpec {
    fn new(key: &str, kind: FeatureKind) -> Self {
        Self {
            key: key.to_string(),
            kind,
        }
    }
}

/// Feature keys of a chip record. Missing bytes features default to empty, missing
/// integers to 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub image: FeatureSpec,
    pub channels: FeatureSpec,
    pub label: FeatureSpec,
    pub height: FeatureSpec,
    pub width: FeatureSpec,
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self {
            image: FeatureSpec::new("image", FeatureKind::Bytes),
            channels: FeatureSpec::new("channels", FeatureKind::Int64),
            label: FeatureSpec::new("label", FeatureKind::Bytes),
            height: FeatureSpec::new("height", FeatureKind::Int64),
            width: FeatureSpec::new("width", FeatureKind::Int64),
        }
    }
}

impl FeatureSchema {
    pub fn specs(&self) -> [&FeatureSpec; 5] {
        [
            &self.image,
            &self.channels,
            &self.label,
            &self.height,
            &self.width,
        ]
    }

    pub fn with_image_key(mut self, key: impl Into<String>) -> Self {
        self.image.key = key.into();
        self
    }

    pub fn with_label_key(mut self, key: impl Into<String>) -> Self {
        self.label.key = key.into();
        self
    }
}
