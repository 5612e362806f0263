//! Length-prefixed tensor records and the `Example` payload that carries a chip.
//!
//! Framing per record:
//! `u64 len | u32 masked_crc(len) | payload | u32 masked_crc(payload)`, little-endian.

use crate::types::{DatasetError, DatasetResult};
use chip_contracts::{Chip, ChipMetadata, ChipShape, FeatureKind, FeatureSchema, FeatureSpec};
use prost::Message;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const MASK_DELTA: u32 = 0xa282_ead8;
const HEADER_LEN: usize = 12;
const FOOTER_LEN: usize = 4;
const STREAM_PATH: &str = "<stream>";

/// Protobuf messages of the `Example` record payload.
pub mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Example {
        #[prost(message, optional, tag = "1")]
        pub features: Option<Features>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Features {
        #[prost(map = "string, message", tag = "1")]
        pub feature: HashMap<String, Feature>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Feature {
        #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
        pub kind: Option<feature::Kind>,
    }

    pub mod feature {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            BytesList(super::BytesList),
            #[prost(message, tag = "2")]
            FloatList(super::FloatList),
            #[prost(message, tag = "3")]
            Int64List(super::Int64List),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BytesList {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub value: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FloatList {
        #[prost(float, repeated, tag = "1")]
        pub value: Vec<f32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Int64List {
        #[prost(int64, repeated, tag = "1")]
        pub value: Vec<i64>,
    }

    impl Feature {
        pub fn bytes(value: Vec<u8>) -> Self {
            Self {
                kind: Some(feature::Kind::BytesList(BytesList { value: vec![value] })),
            }
        }

        pub fn int64(value: i64) -> Self {
            Self {
                kind: Some(feature::Kind::Int64List(Int64List { value: vec![value] })),
            }
        }
    }
}

use proto::feature::Kind;

pub fn masked_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data).rotate_right(15).wrapping_add(MASK_DELTA)
}

pub struct RecordWriter<W: Write> {
    inner: W,
    path: PathBuf,
    records: usize,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> DatasetResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatasetError::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| DatasetError::io(path, e))?;
        Ok(Self {
            inner: BufWriter::new(file),
            path: path.to_path_buf(),
            records: 0,
        })
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            path: PathBuf::from(STREAM_PATH),
            records: 0,
        }
    }

    pub fn write_record(&mut self, payload: &[u8]) -> DatasetResult<()> {
        let len = (payload.len() as u64).to_le_bytes();
        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(&len);
        header[8..].copy_from_slice(&masked_crc32c(&len).to_le_bytes());
        let footer = masked_crc32c(payload).to_le_bytes();
        self.inner
            .write_all(&header)
            .and_then(|_| self.inner.write_all(payload))
            .and_then(|_| self.inner.write_all(&footer))
            .map_err(|e| DatasetError::io(&self.path, e))?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> usize {
        self.records
    }

    pub fn flush(&mut self) -> DatasetResult<()> {
        self.inner
            .flush()
            .map_err(|e| DatasetError::io(&self.path, e))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct RecordReader<R: Read> {
    inner: R,
    path: PathBuf,
    offset: u64,
    verify: bool,
    done: bool,
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> DatasetResult<Self> {
        let file = File::open(path).map_err(|e| DatasetError::io(path, e))?;
        Ok(Self {
            inner: BufReader::new(file),
            path: path.to_path_buf(),
            offset: 0,
            verify: true,
            done: false,
        })
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            path: PathBuf::from(STREAM_PATH),
            offset: 0,
            verify: true,
            done: false,
        }
    }

    /// Toggle CRC verification of lengths and payloads (on by default).
    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Byte offset of the next record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> DatasetResult<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_LEN];
        let got = read_full(&mut self.inner, &mut header).map_err(|e| DatasetError::io(&self.path, e))?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(self.truncated());
        }
        let len = parse_header(&header, self.verify, &self.path, self.offset)?;
        let len_usize = usize::try_from(len).map_err(|_| DatasetError::Oversized {
            path: self.path.clone(),
            offset: self.offset,
            len,
        })?;

        // Grow with the bytes actually present; the header length alone is untrusted.
        let mut payload = Vec::new();
        let got = (&mut self.inner)
            .take(len)
            .read_to_end(&mut payload)
            .map_err(|e| DatasetError::io(&self.path, e))?;
        if got < len_usize {
            return Err(self.truncated());
        }
        let mut footer = [0u8; FOOTER_LEN];
        let got = read_full(&mut self.inner, &mut footer).map_err(|e| DatasetError::io(&self.path, e))?;
        if got < FOOTER_LEN {
            return Err(self.truncated());
        }
        if self.verify && masked_crc32c(&payload) != u32::from_le_bytes(footer) {
            return Err(DatasetError::Checksum {
                path: self.path.clone(),
                offset: self.offset,
                section: "payload",
            });
        }
        self.offset += (HEADER_LEN + len_usize + FOOTER_LEN) as u64;
        Ok(Some(payload))
    }

    fn truncated(&self) -> DatasetError {
        DatasetError::Truncated {
            path: self.path.clone(),
            offset: self.offset,
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = DatasetResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn parse_header(header: &[u8; HEADER_LEN], verify: bool, path: &Path, offset: u64) -> DatasetResult<u64> {
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[..8]);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&header[8..]);
    if verify && masked_crc32c(&len_bytes) != u32::from_le_bytes(crc_bytes) {
        return Err(DatasetError::Checksum {
            path: path.to_path_buf(),
            offset,
            section: "length",
        });
    }
    Ok(u64::from_le_bytes(len_bytes))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Count records without decoding payloads (length CRCs are still checked).
pub fn count_records(path: &Path) -> DatasetResult<usize> {
    let file = File::open(path).map_err(|e| DatasetError::io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| DatasetError::io(path, e))?
        .len();
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;
    let mut count = 0usize;
    loop {
        let mut header = [0u8; HEADER_LEN];
        let got = read_full(&mut reader, &mut header).map_err(|e| DatasetError::io(path, e))?;
        if got == 0 {
            break;
        }
        if got < HEADER_LEN {
            return Err(DatasetError::Truncated {
                path: path.to_path_buf(),
                offset,
            });
        }
        let len = parse_header(&header, true, path, offset)?;
        let next = offset
            .checked_add(HEADER_LEN as u64 + len + FOOTER_LEN as u64)
            .filter(|end| *end <= file_len)
            .ok_or_else(|| DatasetError::Truncated {
                path: path.to_path_buf(),
                offset,
            })?;
        let skip = (len + FOOTER_LEN as u64) as i64;
        reader
            .seek_relative(skip)
            .map_err(|e| DatasetError::io(path, e))?;
        offset = next;
        count += 1;
    }
    debug!(path = %path.display(), records = count, "counted tensor records");
    Ok(count)
}

pub fn encode_chip(chip: &Chip, schema: &FeatureSchema) -> Vec<u8> {
    let label: Vec<u8> = chip.label.iter().flat_map(|v| v.to_le_bytes()).collect();
    let mut feature = image_features(chip.shape, &chip.image, schema);
    feature.insert(schema.label.key.clone(), proto::Feature::bytes(label));
    example_bytes(feature)
}

/// Payload carrying only the image and its dimensions (inference inputs).
pub fn encode_image(shape: ChipShape, image: &[f32], schema: &FeatureSchema) -> Vec<u8> {
    example_bytes(image_features(shape, image, schema))
}

fn image_features(
    shape: ChipShape,
    image: &[f32],
    schema: &FeatureSchema,
) -> HashMap<String, proto::Feature> {
    let mut feature = HashMap::new();
    let bytes: Vec<u8> = image.iter().flat_map(|v| v.to_le_bytes()).collect();
    feature.insert(schema.image.key.clone(), proto::Feature::bytes(bytes));
    feature.insert(
        schema.channels.key.clone(),
        proto::Feature::int64(shape.bands as i64),
    );
    feature.insert(
        schema.height.key.clone(),
        proto::Feature::int64(shape.height as i64),
    );
    feature.insert(
        schema.width.key.clone(),
        proto::Feature::int64(shape.width as i64),
    );
    feature
}

fn example_bytes(feature: HashMap<String, proto::Feature>) -> Vec<u8> {
    proto::Example {
        features: Some(proto::Features { feature }),
    }
    .encode_to_vec()
}

struct ParsedFeatures {
    map: HashMap<String, proto::Feature>,
}

impl ParsedFeatures {
    fn decode(payload: &[u8]) -> DatasetResult<Self> {
        let example = proto::Example::decode(payload)?;
        Ok(Self {
            map: example.features.map(|f| f.feature).unwrap_or_default(),
        })
    }

    fn bytes(&self, spec: &FeatureSpec) -> DatasetResult<&[u8]> {
        expect_kind(spec, FeatureKind::Bytes)?;
        match self.map.get(&spec.key).and_then(|f| f.kind.as_ref()) {
            None => Ok(&[]),
            Some(Kind::BytesList(list)) => match list.value.as_slice() {
                [] => Ok(&[]),
                [single] => Ok(single.as_slice()),
                many => Err(feature_err(
                    spec,
                    format!("expected one bytes value, found {}", many.len()),
                )),
            },
            Some(_) => Err(feature_err(spec, "expected a bytes_list".to_string())),
        }
    }

    fn int(&self, spec: &FeatureSpec) -> DatasetResult<i64> {
        expect_kind(spec, FeatureKind::Int64)?;
        match self.map.get(&spec.key).and_then(|f| f.kind.as_ref()) {
            None => Ok(0),
            Some(Kind::Int64List(list)) => match list.value.as_slice() {
                [v] => Ok(*v),
                other => Err(feature_err(
                    spec,
                    format!("expected one int64 value, found {}", other.len()),
                )),
            },
            Some(_) => Err(feature_err(spec, "expected an int64_list".to_string())),
        }
    }

    fn dim(&self, spec: &FeatureSpec) -> DatasetResult<usize> {
        let v = self.int(spec)?;
        usize::try_from(v).map_err(|_| feature_err(spec, format!("negative dimension {v}")))
    }

    fn shape(&self, schema: &FeatureSchema) -> DatasetResult<ChipShape> {
        Ok(ChipShape::new(
            self.dim(&schema.height)?,
            self.dim(&schema.width)?,
            self.dim(&schema.channels)?,
        ))
    }
}

fn expect_kind(spec: &FeatureSpec, kind: FeatureKind) -> DatasetResult<()> {
    if spec.kind != kind {
        return Err(feature_err(
            spec,
            format!("schema declares {:?}, decoder needs {:?}", spec.kind, kind),
        ));
    }
    Ok(())
}

fn feature_err(spec: &FeatureSpec, msg: String) -> DatasetError {
    DatasetError::Feature {
        key: spec.key.clone(),
        msg,
    }
}

fn le_words(spec: &FeatureSpec, raw: &[u8], expected: usize) -> DatasetResult<Vec<[u8; 4]>> {
    if raw.len() % 4 != 0 || raw.len() / 4 != expected {
        return Err(feature_err(
            spec,
            format!(
                "{} bytes cannot be reshaped into {} 4-byte values",
                raw.len(),
                expected
            ),
        ));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect())
}

/// Decode a chip payload. A fixed `expected` shape overrides the per-record dimensions.
pub fn decode_chip(
    payload: &[u8],
    schema: &FeatureSchema,
    expected: Option<ChipShape>,
) -> DatasetResult<Chip> {
    decode_with(payload, schema, expected, true)
}

/// Like [`decode_chip`], but a record without label bytes becomes [`Chip::unlabeled`].
pub fn decode_input_chip(
    payload: &[u8],
    schema: &FeatureSchema,
    expected: Option<ChipShape>,
) -> DatasetResult<Chip> {
    decode_with(payload, schema, expected, false)
}

fn decode_with(
    payload: &[u8],
    schema: &FeatureSchema,
    expected: Option<ChipShape>,
    require_label: bool,
) -> DatasetResult<Chip> {
    let features = ParsedFeatures::decode(payload)?;
    let shape = match expected {
        Some(shape) => shape,
        None => features.shape(schema)?,
    };
    shape.validate()?;

    let image = le_words(&schema.image, features.bytes(&schema.image)?, shape.image_len())?
        .into_iter()
        .map(f32::from_le_bytes)
        .collect();
    let raw_label = features.bytes(&schema.label)?;
    if raw_label.is_empty() && !require_label {
        return Ok(Chip::unlabeled(shape, image)?);
    }
    let label = le_words(&schema.label, raw_label, shape.pixels())?
        .into_iter()
        .map(i32::from_le_bytes)
        .collect();
    Ok(Chip::new(shape, image, label)?)
}

pub fn decode_metadata(payload: &[u8], schema: &FeatureSchema) -> DatasetResult<ChipMetadata> {
    let features = ParsedFeatures::decode(payload)?;
    let shape = features.shape(schema)?;
    let image_present = !features.bytes(&schema.image)?.is_empty();
    let label_present = !features.bytes(&schema.label)?.is_empty();
    Ok(ChipMetadata {
        shape,
        image_present,
        label_present,
    })
}

/// Write chips as one record file; returns the number of records written.
pub fn write_chips<'a, I>(path: &Path, schema: &FeatureSchema, chips: I) -> DatasetResult<usize>
where
    I: IntoIterator<Item = &'a Chip>,
{
    let mut writer = RecordWriter::create(path)?;
    for chip in chips {
        writer.write_record(&encode_chip(chip, schema))?;
    }
    writer.flush()?;
    Ok(writer.records_written())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn masked_crc_matches_reference_value() {
        // crc32c("") == 0, masked = rotate(0) + delta
        assert_eq!(masked_crc32c(b""), MASK_DELTA);
        // crc32c("123456789") == 0xe3069283
        let crc = 0xe306_9283u32;
        let expected = ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA);
        assert_eq!(masked_crc32c(b"123456789"), expected);
    }

    #[test]
    fn reader_reports_truncation_mid_payload() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_record(b"hello world").unwrap();
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 6);
        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.next(),
            Some(Err(DatasetError::Truncated { offset: 0, .. }))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn reader_detects_payload_corruption() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_record(b"first").unwrap();
        writer.write_record(b"second").unwrap();
        let mut bytes = writer.into_inner();
        let second_payload = HEADER_LEN + 5 + FOOTER_LEN + HEADER_LEN;
        bytes[second_payload] ^= 0xff;

        let mut reader = RecordReader::new(Cursor::new(bytes.clone()));
        assert_eq!(reader.next().unwrap().unwrap(), b"first");
        match reader.next() {
            Some(Err(DatasetError::Checksum {
                offset, section, ..
            })) => {
                assert_eq!(offset, (HEADER_LEN + 5 + FOOTER_LEN) as u64);
                assert_eq!(section, "payload");
            }
            other => panic!("expected checksum error, got {other:?}"),
        }

        let unchecked: Vec<_> = RecordReader::new(Cursor::new(bytes))
            .with_checksums(false)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(unchecked.len(), 2);
    }

    #[test]
    fn oversized_length_without_payload_is_truncation() {
        let len = (u64::MAX / 2).to_le_bytes();
        let mut bytes = len.to_vec();
        bytes.extend_from_slice(&masked_crc32c(&len).to_le_bytes());
        bytes.extend_from_slice(b"short");

        let mut reader = RecordReader::new(Cursor::new(bytes.clone()));
        assert!(matches!(
            reader.next(),
            Some(Err(DatasetError::Truncated { offset: 0, .. }))
        ));
        let mut unchecked = RecordReader::new(Cursor::new(bytes)).with_checksums(false);
        assert!(matches!(
            unchecked.next(),
            Some(Err(DatasetError::Truncated { offset: 0, .. }))
        ));
    }

    #[test]
    fn image_only_records_decode_as_unlabeled() {
        let schema = FeatureSchema::default();
        let shape = ChipShape::new(2, 2, 1);
        let payload = encode_image(shape, &[0.5, 1.0, 1.5, 2.0], &schema);

        let meta = decode_metadata(&payload, &schema).unwrap();
        assert!(meta.image_present);
        assert!(!meta.label_present);
        assert!(matches!(
            decode_chip(&payload, &schema, None),
            Err(DatasetError::Feature { ref key, .. }) if key == "label"
        ));
        let chip = decode_input_chip(&payload, &schema, None).unwrap();
        assert_eq!(chip.shape, shape);
        assert_eq!(chip.image, vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(chip.label, vec![0; 4]);

        let labeled = Chip::new(shape, vec![0.0; 4], vec![1, 2, 3, 4]).unwrap();
        let payload = encode_chip(&labeled, &schema);
        assert_eq!(decode_input_chip(&payload, &schema, None).unwrap(), labeled);
    }

    #[test]
    fn missing_features_fall_back_to_defaults() {
        let payload = proto::Example { features: None }.encode_to_vec();
        let meta = decode_metadata(&payload, &FeatureSchema::default()).unwrap();
        assert_eq!(meta.shape, ChipShape::new(0, 0, 0));
        assert!(!meta.image_present);
        assert!(!meta.label_present);
        assert!(decode_chip(&payload, &FeatureSchema::default(), None).is_err());
    }
}
