//! Batch iteration for training and evaluation.

use crate::types::{DatasetError, DatasetResult};
use chip_contracts::{Chip, ChipShape};
use crossbeam_channel::Receiver;
use rand::seq::SliceRandom;
use rand::Rng;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub(crate) const DEFAULT_LOG_EVERY_CHIPS: usize = 1000;

/// Buffered random sampling: holds up to `capacity` items and emits a random one for
/// every item pushed once full. Capacity 0 or 1 passes items through in order.
#[derive(Debug)]
pub struct ShuffleBuffer<T> {
    capacity: usize,
    items: Vec<T>,
}

impl<T> ShuffleBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity.min(4096)),
        }
    }

    pub fn push<R: Rng + ?Sized>(&mut self, item: T, rng: &mut R) -> Option<T> {
        if self.capacity <= 1 {
            return Some(item);
        }
        if self.items.len() < self.capacity {
            self.items.push(item);
            return None;
        }
        let idx = rng.random_range(0..self.items.len());
        Some(std::mem::replace(&mut self.items[idx], item))
    }

    pub fn drain<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<T> {
        self.items.shuffle(rng);
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Host-side batch: images NCHW, labels NHW.
#[derive(Debug, Clone)]
pub struct ChipBatch {
    pub shape: ChipShape,
    pub len: usize,
    pub images: Vec<f32>,
    pub labels: Vec<i32>,
}

impl ChipBatch {
    pub fn from_chips(chips: &[Chip]) -> DatasetResult<Self> {
        let first = chips
            .first()
            .ok_or_else(|| DatasetError::Other("cannot batch zero chips".to_string()))?;
        let shape = first.shape;
        let mut images = Vec::with_capacity(chips.len() * shape.image_len());
        let mut labels = Vec::with_capacity(chips.len() * shape.pixels());
        for chip in chips {
            if chip.shape != shape {
                return Err(DatasetError::MixedShapes {
                    expected: shape,
                    actual: chip.shape,
                });
            }
            images.extend_from_slice(&chip.image_chw());
            labels.extend_from_slice(&chip.label);
        }
        Ok(Self {
            shape,
            len: chips.len(),
            images,
            labels,
        })
    }

    /// Center-crop labels to `height`x`width` (the network output extent).
    pub fn crop_labels(&self, height: usize, width: usize) -> DatasetResult<Vec<i32>> {
        let (h, w) = self.shape.label_shape();
        if height > h || width > w {
            return Err(DatasetError::Other(format!(
                "cannot crop {h}x{w} labels to larger {height}x{width}"
            )));
        }
        let top = (h - height) / 2;
        let left = (w - width) / 2;
        let mut out = Vec::with_capacity(self.len * height * width);
        for n in 0..self.len {
            let base = n * h * w;
            for r in top..top + height {
                let row = base + r * w;
                out.extend_from_slice(&self.labels[row + left..row + left + width]);
            }
        }
        Ok(out)
    }

    #[cfg(feature = "burn-runtime")]
    pub fn images_tensor<B: burn::tensor::backend::Backend>(
        &self,
        device: &B::Device,
    ) -> burn::tensor::Tensor<B, 4> {
        burn::tensor::Tensor::<B, 1>::from_floats(self.images.as_slice(), device).reshape([
            self.len,
            self.shape.bands,
            self.shape.height,
            self.shape.width,
        ])
    }
}

enum ChipFeed {
    Memory(std::vec::IntoIter<Chip>),
    Stream {
        rx: Receiver<DatasetResult<Chip>>,
        producer: Option<JoinHandle<()>>,
    },
}

pub struct BatchIter {
    feed: ChipFeed,
    batch_size: usize,
    drop_last: bool,
    expected_chips: Option<usize>,
    processed_chips: usize,
    processed_batches: usize,
    finished: bool,
    started: Instant,
    last_log: Instant,
    last_logged_chips: usize,
    log_every_chips: Option<usize>,
}

impl BatchIter {
    pub fn from_chips(chips: Vec<Chip>, batch_size: usize) -> Self {
        let expected = Some(chips.len());
        Self::with_feed(ChipFeed::Memory(chips.into_iter()), batch_size, false, expected)
    }

    pub(crate) fn from_stream(
        rx: Receiver<DatasetResult<Chip>>,
        producer: JoinHandle<()>,
        batch_size: usize,
        drop_last: bool,
        expected_chips: Option<usize>,
    ) -> Self {
        Self::with_feed(
            ChipFeed::Stream {
                rx,
                producer: Some(producer),
            },
            batch_size,
            drop_last,
            expected_chips,
        )
    }

    fn with_feed(
        feed: ChipFeed,
        batch_size: usize,
        drop_last: bool,
        expected_chips: Option<usize>,
    ) -> Self {
        let log_every_chips = match std::env::var("CHIP_DATASET_LOG_EVERY") {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.trim().parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_CHIPS),
        };
        let now = Instant::now();
        Self {
            feed,
            batch_size: batch_size.max(1),
            drop_last,
            expected_chips,
            processed_chips: 0,
            processed_batches: 0,
            finished: false,
            started: now,
            last_log: now,
            last_logged_chips: 0,
            log_every_chips,
        }
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Chips the iterator expects to yield in total, when known.
    pub fn expected_chips(&self) -> Option<usize> {
        self.expected_chips
    }

    pub fn processed_chips(&self) -> usize {
        self.processed_chips
    }

    pub fn processed_batches(&self) -> usize {
        self.processed_batches
    }

    fn next_chip(&mut self) -> DatasetResult<Option<Chip>> {
        if self.finished {
            return Ok(None);
        }
        let next = match &mut self.feed {
            ChipFeed::Memory(iter) => iter.next().map(Ok),
            ChipFeed::Stream { rx, .. } => rx.recv().ok(),
        };
        match next {
            Some(Ok(chip)) => Ok(Some(chip)),
            Some(Err(e)) => {
                self.finish();
                Err(e)
            }
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let ChipFeed::Stream { producer, .. } = &mut self.feed {
            if let Some(handle) = producer.take() {
                if handle.join().is_err() {
                    tracing::warn!("chip producer thread panicked");
                }
            }
        }
    }

    pub fn next_host_batch(&mut self) -> DatasetResult<Option<ChipBatch>> {
        let mut chips = Vec::with_capacity(self.batch_size);
        while chips.len() < self.batch_size {
            match self.next_chip()? {
                Some(chip) => chips.push(chip),
                None => break,
            }
        }
        if chips.is_empty() || (self.drop_last && chips.len() < self.batch_size) {
            return Ok(None);
        }
        let batch = ChipBatch::from_chips(&chips)?;
        self.processed_chips += batch.len;
        self.processed_batches += 1;
        debug!(
            batch = self.processed_batches,
            chips = batch.len,
            height = batch.shape.height,
            width = batch.shape.width,
            "assembled chip batch"
        );
        self.maybe_log_progress();
        Ok(Some(batch))
    }

    /// Next batch with images already on `device`.
    #[cfg(feature = "burn-runtime")]
    pub fn next_batch<B: burn::tensor::backend::Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<(ChipBatch, burn::tensor::Tensor<B, 4>)>> {
        Ok(self.next_host_batch()?.map(|batch| {
            let images = batch.images_tensor::<B>(device);
            (batch, images)
        }))
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_chips else {
            return;
        };
        let since = self.processed_chips.saturating_sub(self.last_logged_chips);
        if since < threshold && self.last_log.elapsed() < Duration::from_secs(30) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        info!(
            batches = self.processed_batches,
            chips = self.processed_chips,
            expected = self.expected_chips.unwrap_or(0),
            rate = format!("{:.1} chips/s", self.processed_chips as f32 / secs),
            "[dataset] progress"
        );
        self.last_logged_chips = self.processed_chips;
        self.last_log = Instant::now();
    }
}

impl Iterator for BatchIter {
    type Item = DatasetResult<ChipBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_host_batch().transpose()
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        // Dropping the receiver first unblocks a producer waiting on a full channel.
        if let ChipFeed::Stream { rx, producer } = &mut self.feed {
            let (_, empty) = crossbeam_channel::bounded(0);
            *rx = empty;
            if let Some(handle) = producer.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn chip(label: i32, shape: ChipShape) -> Chip {
        Chip::new(
            shape,
            vec![label as f32; shape.image_len()],
            vec![label; shape.pixels()],
        )
        .unwrap()
    }

    #[test]
    fn shuffle_buffer_emits_every_item_once() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut buffer = ShuffleBuffer::new(4);
        let mut out = Vec::new();
        for i in 0..10 {
            out.extend(buffer.push(i, &mut rng));
        }
        assert_eq!(buffer.len(), 4);
        out.extend(buffer.drain(&mut rng));
        assert!(buffer.is_empty());
        let mut sorted = out.clone();
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_buffer_of_one_preserves_order() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let mut buffer = ShuffleBuffer::new(1);
        let out: Vec<_> = (0..5).filter_map(|i| buffer.push(i, &mut rng)).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn batches_keep_partial_tail_unless_dropped() {
        let shape = ChipShape::new(2, 2, 1);
        let chips: Vec<_> = (0..5).map(|i| chip(i, shape)).collect();
        let sizes: Vec<usize> = BatchIter::from_chips(chips.clone(), 2)
            .map(|b| b.unwrap().len)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let dropped = BatchIter::from_chips(chips, 2).with_drop_last(true).count();
        assert_eq!(dropped, 2);
    }

    #[test]
    fn mixed_shapes_are_rejected() {
        let chips = vec![
            chip(0, ChipShape::new(2, 2, 1)),
            chip(1, ChipShape::new(3, 3, 1)),
        ];
        assert!(matches!(
            ChipBatch::from_chips(&chips),
            Err(DatasetError::MixedShapes { .. })
        ));
    }

    #[test]
    fn labels_crop_from_center() {
        let shape = ChipShape::new(4, 4, 1);
        let label: Vec<i32> = (0..16).collect();
        let c = Chip::new(shape, vec![0.0; 16], label).unwrap();
        let batch = ChipBatch::from_chips(&[c]).unwrap();
        assert_eq!(batch.crop_labels(2, 2).unwrap(), vec![5, 6, 9, 10]);
        assert!(batch.crop_labels(5, 5).is_err());
    }
}
