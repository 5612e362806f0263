//! Streaming input pipelines over a single tensor-record file.

use crate::aug::{AugmentationOp, AugmentationRegistry};
use crate::batch::{BatchIter, ShuffleBuffer};
use crate::record::{count_records, decode_chip, decode_input_chip, decode_metadata, RecordReader};
use crate::types::{DatasetError, DatasetResult};
use chip_contracts::{Chip, ChipShape, FeatureSchema};
use crossbeam_channel::{bounded, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderParams {
    /// Fixed chip shape; when unset each record's height/width/channels are used.
    pub shape: Option<ChipShape>,
    pub data_aug_ops: Vec<String>,
    pub batch_size: usize,
    pub epochs: usize,
    /// Shuffle buffer capacity; defaults to the number of records in the file.
    pub shuffle_buffer: Option<usize>,
    pub seed: Option<u64>,
    /// Decoded chips buffered ahead of batch assembly.
    pub prefetch: usize,
    /// Records decoded together on the rayon pool.
    pub parse_chunk: usize,
    pub drop_last: bool,
    /// Reject records without a label; off for inference inputs, which get an all-zero label.
    pub require_labels: bool,
}

impl Default for LoaderParams {
    fn default() -> Self {
        Self {
            shape: None,
            data_aug_ops: Vec::new(),
            batch_size: 10,
            epochs: 1,
            shuffle_buffer: None,
            seed: None,
            prefetch: 64,
            parse_chunk: 64,
            drop_last: false,
            require_labels: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetLoader {
    path: PathBuf,
    params: LoaderParams,
    features: FeatureSchema,
    registry: AugmentationRegistry,
}

impl DatasetLoader {
    pub fn new(path: impl Into<PathBuf>, params: LoaderParams) -> Self {
        Self {
            path: path.into(),
            params,
            features: FeatureSchema::default(),
            registry: AugmentationRegistry::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn params(&self) -> &LoaderParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut LoaderParams {
        &mut self.params
    }

    pub fn set_features(&mut self, features: FeatureSchema) {
        self.features = features;
    }

    pub fn features(&self) -> &FeatureSchema {
        &self.features
    }

    pub fn register_augmentation<F>(&mut self, key: impl Into<String>, op: F)
    where
        F: Fn(Chip) -> Chip + Send + Sync + 'static,
    {
        self.registry.register(key, op);
    }

    pub fn registry(&self) -> &AugmentationRegistry {
        &self.registry
    }

    /// Shape recorded in the first record of the file.
    pub fn image_shape(&self) -> DatasetResult<ChipShape> {
        let mut reader = RecordReader::open(&self.path)?;
        match reader.next() {
            Some(payload) => Ok(decode_metadata(&payload?, &self.features)?.shape),
            None => Err(DatasetError::Empty {
                path: self.path.clone(),
            }),
        }
    }

    pub fn dataset_size(&self) -> DatasetResult<usize> {
        count_records(&self.path)
    }

    pub fn parse(&self, payload: &[u8]) -> DatasetResult<Chip> {
        decode_record(payload, &self.features, self.params.shape, self.params.require_labels)
    }

    /// Whether every record in the file carries label bytes.
    pub fn labels_present(&self) -> DatasetResult<bool> {
        for payload in RecordReader::open(&self.path)? {
            if !decode_metadata(&payload?, &self.features)?.label_present {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decode every record in file order.
    pub fn load_chips(&self) -> DatasetResult<Vec<Chip>> {
        RecordReader::open(&self.path)?
            .map(|payload| self.parse(&payload?))
            .collect()
    }

    /// Chips produced by one repetition of the pipeline.
    pub fn epoch_len(&self, train: bool) -> DatasetResult<usize> {
        let size = self.dataset_size()?;
        if train {
            Ok(size * (1 + self.params.data_aug_ops.len()))
        } else {
            Ok(size)
        }
    }

    /// Train: original chips followed by one augmented copy per configured op, shuffled
    /// through a bounded buffer and repeated `epochs` times. Eval: file order, once.
    pub fn input_pipeline(&self, train: bool) -> DatasetResult<BatchIter> {
        let ops = if train {
            self.registry.resolve(&self.params.data_aug_ops)?
        } else {
            Vec::new()
        };
        let size = self.dataset_size()?;
        if size == 0 {
            return Err(DatasetError::Empty {
                path: self.path.clone(),
            });
        }
        let repetitions = if train { self.params.epochs.max(1) } else { 1 };
        let shuffle_capacity = if train {
            self.params.shuffle_buffer.unwrap_or(size)
        } else {
            0
        };
        let seed = self.params.seed.unwrap_or_else(|| rand::rng().random());
        let expected = size * (1 + ops.len()) * repetitions;
        info!(
            path = %self.path.display(),
            train,
            records = size,
            augmentations = ?ops.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            repetitions,
            shuffle_capacity,
            seed,
            "building input pipeline"
        );

        let job = PipelineJob {
            path: self.path.clone(),
            features: self.features.clone(),
            shape: self.params.shape,
            require_labels: self.params.require_labels,
            ops: ops.into_iter().map(|(_, op)| op).collect(),
            repetitions,
            shuffle_capacity,
            seed,
            parse_chunk: self.params.parse_chunk.max(1),
        };
        let (tx, rx) = bounded(self.params.prefetch.max(1));
        let producer = thread::spawn(move || match job.run(&tx) {
            Ok(()) | Err(Halt::Disconnected) => {}
            Err(Halt::Failed(e)) => {
                warn!("[dataset] pipeline stopped: {e}");
                let _ = tx.send(Err(e));
            }
        });
        Ok(BatchIter::from_stream(
            rx,
            producer,
            self.params.batch_size,
            train && self.params.drop_last,
            Some(expected),
        ))
    }
}

fn decode_record(
    payload: &[u8],
    features: &FeatureSchema,
    shape: Option<ChipShape>,
    require_labels: bool,
) -> DatasetResult<Chip> {
    if require_labels {
        decode_chip(payload, features, shape)
    } else {
        decode_input_chip(payload, features, shape)
    }
}

enum Halt {
    Disconnected,
    Failed(DatasetError),
}

impl From<DatasetError> for Halt {
    fn from(e: DatasetError) -> Self {
        Halt::Failed(e)
    }
}

struct PipelineJob {
    path: PathBuf,
    features: FeatureSchema,
    shape: Option<ChipShape>,
    require_labels: bool,
    ops: Vec<AugmentationOp>,
    repetitions: usize,
    shuffle_capacity: usize,
    seed: u64,
    parse_chunk: usize,
}

impl PipelineJob {
    fn run(&self, tx: &Sender<DatasetResult<Chip>>) -> Result<(), Halt> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let passes: Vec<Option<&AugmentationOp>> = std::iter::once(None)
            .chain(self.ops.iter().map(Some))
            .collect();
        for repetition in 0..self.repetitions {
            let mut buffer = ShuffleBuffer::new(self.shuffle_capacity);
            for op in &passes {
                let mut reader = RecordReader::open(&self.path)?;
                loop {
                    let mut chunk = Vec::with_capacity(self.parse_chunk);
                    for payload in reader.by_ref().take(self.parse_chunk) {
                        chunk.push(payload?);
                    }
                    if chunk.is_empty() {
                        break;
                    }
                    let decoded: Vec<DatasetResult<Chip>> = chunk
                        .par_iter()
                        .map(|payload| -> DatasetResult<Chip> {
                            let chip = decode_record(
                                payload,
                                &self.features,
                                self.shape,
                                self.require_labels,
                            )?;
                            Ok(match op {
                                Some(op) => op(chip),
                                None => chip,
                            })
                        })
                        .collect();
                    for chip in decoded {
                        if let Some(out) = buffer.push(chip?, &mut rng) {
                            tx.send(Ok(out)).map_err(|_| Halt::Disconnected)?;
                        }
                    }
                }
            }
            for out in buffer.drain(&mut rng) {
                tx.send(Ok(out)).map_err(|_| Halt::Disconnected)?;
            }
            debug!(repetition, "[dataset] repetition complete");
        }
        Ok(())
    }
}
