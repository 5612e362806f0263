use burn_ndarray::NdArray;
use chip_dataset::{
    encode_image, write_chips, Chip, ChipShape, DatasetError, DatasetLoader, FeatureSchema,
    LoaderParams, RecordReader, RecordWriter,
};
use std::path::Path;

fn make_chip(id: i32) -> Chip {
    let shape = ChipShape::new(4, 4, 2);
    let image = (0..shape.image_len()).map(|i| id as f32 + i as f32 * 0.01).collect();
    let label = (0..shape.pixels() as i32).map(|p| (id + p) % 3).collect();
    Chip::new(shape, image, label).unwrap()
}

fn write_dataset(path: &Path, n: i32) -> Vec<Chip> {
    let chips: Vec<Chip> = (0..n).map(make_chip).collect();
    let written = write_chips(path, &FeatureSchema::default(), &chips).unwrap();
    assert_eq!(written, n as usize);
    chips
}

fn params(batch_size: usize) -> LoaderParams {
    LoaderParams {
        batch_size,
        seed: Some(42),
        parse_chunk: 3,
        prefetch: 2,
        ..LoaderParams::default()
    }
}

#[test]
fn records_round_trip_through_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.tfrecords");
    let chips = write_dataset(&path, 5);

    let loader = DatasetLoader::new(&path, params(2));
    assert_eq!(loader.dataset_size()?, 5);
    assert_eq!(loader.image_shape()?, ChipShape::new(4, 4, 2));
    assert_eq!(loader.load_chips()?, chips);

    let payloads: Vec<Vec<u8>> = RecordReader::open(&path)?.collect::<Result<_, _>>()?;
    assert_eq!(loader.parse(&payloads[3])?, chips[3]);
    Ok(())
}

#[test]
fn eval_pipeline_keeps_file_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.tfrecords");
    let chips = write_dataset(&path, 7);

    let mut loader = DatasetLoader::new(&path, params(3));
    loader.params_mut().data_aug_ops = vec!["rot90".into()];
    assert_eq!(loader.epoch_len(false)?, 7);

    let batches: Vec<_> = loader.input_pipeline(false)?.collect::<Result<_, _>>()?;
    assert_eq!(batches.iter().map(|b| b.len).collect::<Vec<_>>(), vec![3, 3, 1]);
    let labels: Vec<i32> = batches.iter().flat_map(|b| b.labels.clone()).collect();
    let expected: Vec<i32> = chips.iter().flat_map(|c| c.label.clone()).collect();
    assert_eq!(labels, expected);
    Ok(())
}

#[test]
fn train_pipeline_adds_one_copy_per_augmentation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.tfrecords");
    write_dataset(&path, 6);

    let mut p = params(4);
    p.data_aug_ops = vec!["flip_left_right".into(), "rot180".into()];
    p.epochs = 2;
    let loader = DatasetLoader::new(&path, p);
    assert_eq!(loader.epoch_len(true)?, 18);

    let mut iter = loader.input_pipeline(true)?;
    assert_eq!(iter.expected_chips(), Some(36));
    let mut total = 0;
    while let Some(batch) = iter.next_host_batch()? {
        total += batch.len;
    }
    assert_eq!(total, 36);
    assert_eq!(iter.processed_chips(), 36);
    Ok(())
}

#[test]
fn seeded_shuffle_is_reproducible() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.tfrecords");
    write_dataset(&path, 20);

    let order = |seed: u64| -> anyhow::Result<Vec<f32>> {
        let mut p = params(5);
        p.seed = Some(seed);
        let loader = DatasetLoader::new(&path, p);
        let mut firsts = Vec::new();
        for batch in loader.input_pipeline(true)? {
            let batch = batch?;
            let per_chip = batch.shape.image_len();
            firsts.extend(batch.images.chunks(per_chip).map(|c| c[0]));
        }
        Ok(firsts)
    };
    let a = order(9)?;
    assert_eq!(a, order(9)?);
    let mut sorted = a.clone();
    sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
    assert_eq!(sorted, (0..20).map(|i| i as f32).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn custom_augmentation_is_applied() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.tfrecords");
    write_dataset(&path, 3);

    let mut p = params(10);
    p.data_aug_ops = vec!["zero_label".into()];
    p.shuffle_buffer = Some(1);
    let mut loader = DatasetLoader::new(&path, p);
    loader.register_augmentation("zero_label", |mut chip: Chip| {
        chip.label.iter_mut().for_each(|l| *l = 0);
        chip
    });
    let batch = loader.input_pipeline(true)?.next_host_batch()?.unwrap();
    assert_eq!(batch.len, 6);
    let per_chip = batch.shape.pixels();
    assert!(batch.labels[3 * per_chip..].iter().all(|l| *l == 0));
    assert!(batch.labels[..3 * per_chip].iter().any(|l| *l != 0));
    Ok(())
}

#[test]
fn unknown_augmentation_and_empty_files_are_errors() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.tfrecords");
    write_dataset(&path, 2);
    let mut p = params(2);
    p.data_aug_ops = vec!["warp".into()];
    let loader = DatasetLoader::new(&path, p);
    assert!(matches!(
        loader.input_pipeline(true),
        Err(DatasetError::UnknownAugmentation(_))
    ));

    let empty = dir.path().join("empty.tfrecords");
    std::fs::write(&empty, b"")?;
    let loader = DatasetLoader::new(&empty, params(2));
    assert!(matches!(loader.image_shape(), Err(DatasetError::Empty { .. })));
    assert!(matches!(
        loader.input_pipeline(false),
        Err(DatasetError::Empty { .. })
    ));
    Ok(())
}

#[test]
fn corrupted_payload_surfaces_through_batches() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.tfrecords");
    write_dataset(&path, 4);
    let mut bytes = std::fs::read(&path)?;
    let last = bytes.len() - 10;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes)?;

    let loader = DatasetLoader::new(&path, params(2));
    let results: Vec<_> = loader.input_pipeline(false)?.collect();
    assert!(results.iter().any(|r| matches!(r, Err(DatasetError::Checksum { .. }))));
    Ok(())
}

#[test]
fn batches_upload_images_in_nchw_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.tfrecords");
    let chips = write_dataset(&path, 3);

    let loader = DatasetLoader::new(&path, params(2));
    let device = Default::default();
    let mut iter = loader.input_pipeline(false)?;
    let (batch, images) = iter.next_batch::<NdArray<f32>>(&device)?.unwrap();
    assert_eq!(images.dims(), [2, 2, 4, 4]);
    let uploaded = images.into_data().to_vec::<f32>().unwrap();
    let expected: Vec<f32> = chips[..2].iter().flat_map(|c| c.image_chw()).collect();
    assert_eq!(uploaded, expected);
    assert_eq!(batch.images, expected);

    let (rest, images) = iter.next_batch::<NdArray<f32>>(&device)?.unwrap();
    assert_eq!(rest.len, 1);
    assert_eq!(images.dims(), [1, 2, 4, 4]);
    assert!(iter.next_batch::<NdArray<f32>>(&device)?.is_none());
    Ok(())
}

#[test]
fn image_only_records_need_labels_disabled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scene.tfrecords");
    let schema = FeatureSchema::default();
    let shape = ChipShape::new(4, 4, 2);
    let mut writer = RecordWriter::create(&path)?;
    for id in 0..3 {
        writer.write_record(&encode_image(shape, &make_chip(id).image, &schema))?;
    }
    writer.flush()?;

    let labeled = DatasetLoader::new(&path, params(2));
    assert!(!labeled.labels_present()?);
    assert!(matches!(
        labeled.load_chips(),
        Err(DatasetError::Feature { .. })
    ));

    let mut p = params(2);
    p.require_labels = false;
    let loader = DatasetLoader::new(&path, p);
    let chips = loader.load_chips()?;
    assert_eq!(chips.len(), 3);
    assert_eq!(chips[1].image, make_chip(1).image);
    let batches: Vec<_> = loader.input_pipeline(false)?.collect::<Result<_, _>>()?;
    assert_eq!(batches.iter().map(|b| b.len).sum::<usize>(), 3);
    assert!(batches.iter().all(|b| b.labels.iter().all(|l| *l == 0)));

    let full = dir.path().join("labeled.tfrecords");
    write_dataset(&full, 2);
    assert!(DatasetLoader::new(&full, params(2)).labels_present()?);
    Ok(())
}
