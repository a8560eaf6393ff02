mod common;

use common::*;
use keypose::{
    DescriptorMatrix, Encoding, Error, KeyPoint, ObjectPoint, ReferenceModel, TrainingBatch,
};
use std::io::Write;

fn binary_batch(first: u8, count: usize) -> TrainingBatch {
    let keypoints = (0..count)
        .map(|i| {
            KeyPoint::new(i as f32 * 1.25 + 0.1, 3.0 / (i as f32 + 1.0))
                .size(7.5)
                .response(0.1 * i as f32)
        })
        .collect();
    let rows: Vec<[u8; 4]> = (0..count)
        .map(|i| [first, i as u8, first ^ i as u8, 0xa5])
        .collect();
    let descriptors = DescriptorMatrix::from_rows(4, rows).unwrap().into();
    TrainingBatch::new(keypoints, descriptors)
}

fn sample_model() -> ReferenceModel {
    let mut model = ReferenceModel::new();
    let points = (0..3)
        .map(|i| ObjectPoint::new(0.1 * i as f64, -1.0 / 3.0, std::f64::consts::PI))
        .collect();
    model
        .append(
            binary_batch(1, 3)
                .points(points)
                .image(render(&[(5, (10, 10))])),
        )
        .unwrap();
    model.append(binary_batch(2, 0)).unwrap();
    model.append(binary_batch(3, 2)).unwrap();
    model
}

#[test]
fn binary_round_trip_is_exact() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    let model = sample_model();
    model.save(&path, Encoding::Binary, true).unwrap();

    let mut loaded = ReferenceModel::new();
    let ids = loaded.load(&path, Encoding::Binary, false).unwrap();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(loaded, model);
    assert_eq!(loaded.points()[3], None);
    assert!(loaded.image(0).is_some());
}

#[test]
fn text_round_trip_preserves_values() {
    let model = sample_model();
    let mut text = Vec::new();
    model.write_to(&mut text, Encoding::Text, true).unwrap();
    let loaded = ReferenceModel::read_from(text.as_slice(), Encoding::Text).unwrap();
    assert_eq!(loaded, model);
    assert!(String::from_utf8(text).unwrap().starts_with("keypose-reference 1\n"));
}

#[test]
fn float_descriptors_round_trip_in_both_encodings() {
    let mut model = ReferenceModel::new();
    let descriptors = DescriptorMatrix::from_rows(2, [[0.1f32, -2.5e-7], [f32::MAX, 1.0 / 3.0]])
        .unwrap()
        .into();
    model
        .append(TrainingBatch::new(
            vec![KeyPoint::new(1.0, 2.0), KeyPoint::new(3.0, 4.0)],
            descriptors,
        ))
        .unwrap();
    for encoding in [Encoding::Binary, Encoding::Text] {
        let mut bytes = Vec::new();
        model.write_to(&mut bytes, encoding, false).unwrap();
        let loaded = ReferenceModel::read_from(bytes.as_slice(), encoding).unwrap();
        assert_eq!(loaded, model, "{:?}", encoding);
    }
}

#[test]
fn images_are_optional() {
    let model = sample_model();
    let mut bytes = Vec::new();
    model.write_to(&mut bytes, Encoding::Binary, false).unwrap();
    let loaded = ReferenceModel::read_from(bytes.as_slice(), Encoding::Binary).unwrap();
    assert_eq!(loaded.image_count(), 3);
    assert_eq!(loaded.images().count(), 0);
    assert_eq!(loaded.keypoints(), model.keypoints());
}

#[test]
fn appended_data_gets_fresh_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.txt");
    sample_model().save(&path, Encoding::Text, true).unwrap();

    let mut model = ReferenceModel::new();
    model.append(binary_batch(9, 4)).unwrap();
    let ids = model.load(&path, Encoding::Text, true).unwrap();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(model.len(), 9);
    assert_eq!(model.image_id_of(4), Some(1));
    assert_eq!(model.image_id_of(7), Some(3));
    // The image keeps following its training data.
    assert!(model.image(1).is_some());
    assert!(model.points()[4].is_some());
    assert!(model.points()[0].is_none());
}

#[test]
fn incompatible_append_leaves_the_model_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    sample_model().save(&path, Encoding::Binary, false).unwrap();

    let mut model = ReferenceModel::new();
    let wide = DescriptorMatrix::from_rows(8, [[0u8; 8]]).unwrap().into();
    model
        .append(TrainingBatch::new(vec![KeyPoint::new(0.0, 0.0)], wide))
        .unwrap();
    let before = model.clone();
    assert!(matches!(
        model.load(&path, Encoding::Binary, true),
        Err(Error::SizeMismatch { .. })
    ));
    assert_eq!(model, before);
}

#[test]
fn truncated_files_are_corrupt() {
    let model = sample_model();
    for encoding in [Encoding::Binary, Encoding::Text] {
        let mut bytes = Vec::new();
        model.write_to(&mut bytes, encoding, true).unwrap();
        bytes.truncate(bytes.len() * 2 / 3);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let mut target = sample_model();
        let before = target.clone();
        assert!(matches!(
            target.load(file.path(), encoding, false),
            Err(Error::CorruptFormat(_))
        ));
        assert_eq!(target, before);
    }
}

#[test]
fn inconsistent_headers_are_corrupt() {
    let mut text = Vec::new();
    sample_model()
        .write_to(&mut text, Encoding::Text, false)
        .unwrap();
    let text = String::from_utf8(text).unwrap();

    let wrong_count = text.replacen("train 5", "train 6", 1);
    assert!(matches!(
        ReferenceModel::read_from(wrong_count.as_bytes(), Encoding::Text),
        Err(Error::CorruptFormat(_))
    ));
    let wrong_version = text.replacen("keypose-reference 1", "keypose-reference 9", 1);
    assert!(matches!(
        ReferenceModel::read_from(wrong_version.as_bytes(), Encoding::Text),
        Err(Error::CorruptFormat(_))
    ));
    assert!(matches!(
        ReferenceModel::read_from(&b"not a model"[..], Encoding::Binary),
        Err(Error::CorruptFormat(_))
    ));
}

#[test]
fn oversized_image_headers_are_corrupt() {
    let text = "keypose-reference 1\ntrain 0\ndescriptors none 0\npoints 0\n\
                records 1\nimages 1\nrecord 0 0 0\nimage 0 4000000000 4000000000\n";
    assert!(matches!(
        ReferenceModel::read_from(text.as_bytes(), Encoding::Text),
        Err(Error::CorruptFormat(_))
    ));
}

#[test]
fn exhausted_image_ids_are_corrupt() {
    let last_id = "keypose-reference 1\ntrain 0\ndescriptors binary 4\npoints 0\n\
                   records 1\nimages 0\nrecord 4294967295 0 0\n";
    assert!(matches!(
        ReferenceModel::read_from(last_id.as_bytes(), Encoding::Text),
        Err(Error::CorruptFormat(_))
    ));
}

#[test]
fn recognizer_learning_data_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.bin");
    let mut trained = recognizer();
    let image = render(&[(1, (20, 20)), (2, (40, 20)), (3, (60, 40))]);
    trained.build_reference(&image, None).unwrap();
    trained
        .save_learning_data(&path, Encoding::Binary, true)
        .unwrap();

    let mut restored = recognizer();
    restored
        .load_learning_data(&path, Encoding::Binary, false)
        .unwrap();
    assert_eq!(restored.reference(), trained.reference());
    assert_eq!(restored.match_point(&image, None).unwrap(), 3);
}
