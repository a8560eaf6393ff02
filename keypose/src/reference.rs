//! The learned reference model: training keypoints, their descriptors and 3d points.

use image::GrayImage;
use keypose_core::{DescriptorMatrix, Descriptors, Error, KeyPoint, ObjectPoint, Result};
use log::debug;
use std::collections::BTreeMap;
use std::ops::Range;

/// Identifies the training image a batch of keypoints came from.
pub type ImageId = u32;

/// The contiguous range of training indices contributed by one training image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingImageRecord {
    pub id: ImageId,
    pub range: Range<usize>,
}

/// One training image worth of data, validated and added by [`ReferenceModel::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingBatch {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Descriptors,
    /// One point per keypoint, or `None` for pure 2d matching.
    pub points: Option<Vec<ObjectPoint>>,
    pub image: Option<GrayImage>,
}

impl TrainingBatch {
    pub fn new(keypoints: Vec<KeyPoint>, descriptors: Descriptors) -> Self {
        Self {
            keypoints,
            descriptors,
            points: None,
            image: None,
        }
    }

    #[must_use]
    pub fn points(self, points: Vec<ObjectPoint>) -> Self {
        Self {
            points: Some(points),
            ..self
        }
    }

    #[must_use]
    pub fn image(self, image: GrayImage) -> Self {
        Self {
            image: Some(image),
            ..self
        }
    }
}

/// The training side of matching.
///
/// Keypoints, descriptor rows and object points are index-aligned at all times.
/// Data is only ever appended, so a training index stays valid for the lifetime of the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceModel {
    pub(crate) keypoints: Vec<KeyPoint>,
    pub(crate) descriptors: Option<Descriptors>,
    pub(crate) points: Vec<Option<ObjectPoint>>,
    pub(crate) records: Vec<TrainingImageRecord>,
    pub(crate) images: BTreeMap<ImageId, GrayImage>,
    pub(crate) next_image_id: ImageId,
}

impl ReferenceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of training keypoints.
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.keypoints
    }

    /// `None` until the first batch is appended.
    pub fn descriptors(&self) -> Option<&Descriptors> {
        self.descriptors.as_ref()
    }

    pub fn points(&self) -> &[Option<ObjectPoint>] {
        &self.points
    }

    /// Whether at least one training keypoint has an object point.
    pub fn has_points(&self) -> bool {
        self.points.iter().any(Option::is_some)
    }

    pub fn records(&self) -> &[TrainingImageRecord] {
        &self.records
    }

    /// Number of training images appended, whether or not their pixels were kept.
    pub fn image_count(&self) -> usize {
        self.records.len()
    }

    pub fn image(&self, id: ImageId) -> Option<&GrayImage> {
        self.images.get(&id)
    }

    pub fn images(&self) -> impl Iterator<Item = (ImageId, &GrayImage)> + '_ {
        self.images.iter().map(|(&id, image)| (id, image))
    }

    /// The training image a training index came from.
    pub fn image_id_of(&self, train_index: usize) -> Option<ImageId> {
        let position = self
            .records
            .partition_point(|record| record.range.end <= train_index);
        self.records
            .get(position)
            .filter(|record| record.range.contains(&train_index))
            .map(|record| record.id)
    }

    /// Adds one training image worth of data and returns its id.
    ///
    /// Fails with [`Error::SizeMismatch`] if the batch is not index-aligned or its
    /// descriptors differ in type or width from the stored ones. Nothing is modified on failure.
    pub fn append(&mut self, batch: TrainingBatch) -> Result<ImageId> {
        self.check_batch(&batch)?;
        let TrainingBatch {
            keypoints,
            descriptors,
            points,
            image,
        } = batch;
        let points = match points {
            Some(points) => points.into_iter().map(Some).collect(),
            None => vec![None; keypoints.len()],
        };
        self.push(keypoints, descriptors, points, image)
    }

    /// Removes everything. Image ids keep increasing.
    pub fn clear(&mut self) {
        let next_image_id = self.next_image_id;
        *self = Self {
            next_image_id,
            ..Self::default()
        };
    }

    fn check_batch(&self, batch: &TrainingBatch) -> Result<()> {
        if batch.descriptors.len() != batch.keypoints.len() {
            return Err(Error::SizeMismatch {
                what: "descriptors",
                expected: batch.keypoints.len(),
                found: batch.descriptors.len(),
            });
        }
        if let Some(points) = &batch.points {
            if points.len() != batch.keypoints.len() {
                return Err(Error::SizeMismatch {
                    what: "object points",
                    expected: batch.keypoints.len(),
                    found: points.len(),
                });
            }
        }
        self.check_descriptors(&batch.descriptors)
    }

    /// Descriptors of a new batch must match the stored type and width. An empty side
    /// fixes neither, so an empty first batch does not constrain later ones.
    fn check_descriptors(&self, incoming: &Descriptors) -> Result<()> {
        match &self.descriptors {
            Some(stored) if !stored.is_empty() && !incoming.is_empty() => {
                stored.check_compatible(incoming)
            }
            _ => Ok(()),
        }
    }

    /// Adds aligned data under a fresh id. Descriptors are appended first so a
    /// type or width mismatch leaves the model untouched.
    fn push(
        &mut self,
        keypoints: Vec<KeyPoint>,
        descriptors: Descriptors,
        points: Vec<Option<ObjectPoint>>,
        image: Option<GrayImage>,
    ) -> Result<ImageId> {
        match &mut self.descriptors {
            Some(stored) if !stored.is_empty() => {
                if !descriptors.is_empty() {
                    stored.append(&descriptors)?;
                }
            }
            _ => self.descriptors = Some(descriptors),
        }
        let id = self.next_image_id;
        self.next_image_id += 1;
        let start = self.keypoints.len();
        self.keypoints.extend(keypoints);
        self.points.extend(points);
        self.records.push(TrainingImageRecord {
            id,
            range: start..self.keypoints.len(),
        });
        if let Some(image) = image {
            self.images.insert(id, image);
        }
        debug!(
            "training image {} added keypoints {}..{}",
            id,
            start,
            self.keypoints.len()
        );
        Ok(id)
    }

    /// Appends every training image of `other` under fresh ids.
    ///
    /// Nothing is modified when the descriptors are incompatible.
    pub fn extend_from(&mut self, other: ReferenceModel) -> Result<Vec<ImageId>> {
        if let Some(incoming) = &other.descriptors {
            self.check_descriptors(incoming)?;
        }
        let ReferenceModel {
            keypoints,
            descriptors,
            points,
            records,
            mut images,
            ..
        } = other;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let rows = record.range.clone();
            let batch_descriptors = match &descriptors {
                Some(descriptors) => select_rows(descriptors, rows.clone())?,
                None => continue,
            };
            let id = self.push(
                keypoints[rows.clone()].to_vec(),
                batch_descriptors,
                points[rows].to_vec(),
                images.remove(&record.id),
            )?;
            ids.push(id);
        }
        Ok(ids)
    }
}

fn select_rows(descriptors: &Descriptors, rows: Range<usize>) -> Result<Descriptors> {
    let width = descriptors.width();
    let span = rows.start * width..rows.end * width;
    Ok(match descriptors {
        Descriptors::Binary(m) => {
            DescriptorMatrix::from_vec(width, m.as_slice()[span].to_vec())?.into()
        }
        Descriptors::Float(m) => {
            DescriptorMatrix::from_vec(width, m.as_slice()[span].to_vec())?.into()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(count: usize, width: usize) -> TrainingBatch {
        let keypoints = (0..count).map(|i| KeyPoint::new(i as f32, 0.0)).collect();
        let descriptors = DescriptorMatrix::from_vec(width, vec![count as u8; count * width])
            .unwrap()
            .into();
        TrainingBatch::new(keypoints, descriptors)
    }

    #[test]
    fn ids_increase_and_ranges_are_contiguous() {
        let mut model = ReferenceModel::new();
        let a = model.append(batch(3, 4)).unwrap();
        let b = model.append(batch(2, 4)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(model.len(), 5);
        assert_eq!(model.descriptors().unwrap().len(), 5);
        assert_eq!(model.records()[1].range, 3..5);
        assert_eq!(model.image_id_of(2), Some(0));
        assert_eq!(model.image_id_of(3), Some(1));
        assert_eq!(model.image_id_of(5), None);
    }

    #[test]
    fn mismatched_batches_leave_the_model_unchanged() {
        let mut model = ReferenceModel::new();
        model.append(batch(3, 4)).unwrap();
        let before = model.clone();

        let mut short = batch(3, 4);
        short.keypoints.pop();
        assert!(matches!(model.append(short), Err(Error::SizeMismatch { .. })));

        let points = batch(3, 4).points(vec![ObjectPoint::new(0.0, 0.0, 0.0); 2]);
        assert!(matches!(model.append(points), Err(Error::SizeMismatch { .. })));

        assert!(matches!(model.append(batch(3, 8)), Err(Error::SizeMismatch { .. })));
        assert_eq!(model, before);
    }

    #[test]
    fn empty_batches_get_an_id() {
        let mut model = ReferenceModel::new();
        model.append(batch(2, 4)).unwrap();
        let empty = model.append(batch(0, 4)).unwrap();
        let last = model.append(batch(1, 4)).unwrap();
        assert_eq!((empty, last), (1, 2));
        assert_eq!(model.image_id_of(2), Some(2));
    }

    #[test]
    fn an_empty_first_batch_does_not_fix_the_descriptor_layout() {
        let mut model = ReferenceModel::new();
        let nothing = Descriptors::empty(keypose_core::DescriptorKind::Float, 0);
        model.append(TrainingBatch::new(Vec::new(), nothing)).unwrap();
        model.append(batch(3, 4)).unwrap();
        assert_eq!(model.descriptors().unwrap().width(), 4);
        assert_eq!(model.descriptors().unwrap().len(), 3);
        model.append(batch(2, 4)).unwrap();
        assert!(matches!(model.append(batch(1, 8)), Err(Error::SizeMismatch { .. })));
        assert_eq!(model.len(), 5);
        assert_eq!(model.image_id_of(0), Some(1));
    }

    #[test]
    fn clear_does_not_reuse_ids() {
        let mut model = ReferenceModel::new();
        model.append(batch(2, 4)).unwrap();
        model.clear();
        assert!(model.is_empty());
        assert_eq!(model.append(batch(2, 4)).unwrap(), 1);
    }
}
