//! Chip dataset plumbing for the deepgeo segmentation stack.
//!
//! This crate provides utilities for:
//! - Reading and writing length-prefixed tensor records (TFRecord framing, CRC32C)
//! - Encoding/decoding chips as `Example` protobuf payloads
//! - Geometric augmentation shared between image and label
//! - Streaming input pipelines (augment, shuffle, repeat, batch, prefetch)

pub mod aug;
pub mod batch;
pub mod loader;
pub mod record;
pub mod types;

pub use aug::{AugmentationOp, AugmentationRegistry};
pub use batch::{BatchIter, ChipBatch, ShuffleBuffer};
pub use loader::{DatasetLoader, LoaderParams};
pub use record::{
    count_records, decode_chip, decode_input_chip, decode_metadata, encode_chip, encode_image,
    masked_crc32c, write_chips, RecordReader, RecordWriter,
};
pub use types::{DatasetError, DatasetResult};

pub use chip_contracts::{Chip, ChipMetadata, ChipShape, FeatureSchema};
