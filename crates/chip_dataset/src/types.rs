//! Error definitions for chip_dataset.

use chip_contracts::{ChipShape, ContractError};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("truncated record at byte {offset} in {path}")]
    Truncated { path: PathBuf, offset: u64 },
    #[error("{section} checksum mismatch for record at byte {offset} in {path}")]
    Checksum {
        path: PathBuf,
        offset: u64,
        section: &'static str,
    },
    #[error("record at byte {offset} in {path} declares {len} bytes, which does not fit in memory")]
    Oversized { path: PathBuf, offset: u64, len: u64 },
    #[error("failed to decode example payload: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("feature `{key}`: {msg}")]
    Feature { key: String, msg: String },
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("unknown augmentation `{0}`")]
    UnknownAugmentation(String),
    #[error("dataset {path} contains no records")]
    Empty { path: PathBuf },
    #[error("batch mixes chip shapes {expected:?} and {actual:?}; set a fixed shape")]
    MixedShapes {
        expected: ChipShape,
        actual: ChipShape,
    },
    #[error("{0}")]
    Other(String),
}

impl DatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }
}
