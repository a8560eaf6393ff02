use crate::{
    AdapterRegistry, BruteForceMatcher, DescriptorMatcher, DetectionDecision, DetectionRule,
    Encoding, ImageId, MatchFilter, ReferenceModel, Settings, TrainingBatch,
};
use image::GrayImage;
use keypose_core::{
    nalgebra::{Matrix6, Point2, Vector2},
    CameraIntrinsics, Correspondence, Descriptors, Error, ImagePoint, KeyPoint, ObjectPoint,
    ObjectToCamera, PoseCorrespondence, RawMatches, Rect, Result,
};
use keypose_pnp::{PoseCheck, PoseEstimator, PoseSolution};
use log::{debug, info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

/// Wall clock time spent in each stage of the last call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub detection: Duration,
    pub extraction: Duration,
    pub matching: Duration,
    pub pose: Duration,
}

/// The result of [`Recognizer::match_point_and_estimate_pose`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoseEstimate {
    pub pose: ObjectToCamera,
    /// Indices into [`Recognizer::matches`] consistent with the pose.
    pub inliers: Vec<usize>,
    /// Indices into [`Recognizer::matches`] used for estimation but rejected.
    pub outliers: Vec<usize>,
    /// Mean pixel reprojection error over the inliers.
    pub reprojection_error: f64,
    pub covariance: Option<Matrix6<f64>>,
    pub timings: Timings,
}

/// The result of [`Recognizer::match_point_and_detect`].
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub decision: DetectionDecision,
    /// Bounding box of the matched query keypoints.
    pub bounding_box: Option<Rect>,
    pub centroid: Option<Point2<f64>>,
    pub timings: Timings,
}

/// The result of [`Recognizer::match_point_detect_and_estimate_pose`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPose {
    pub decision: DetectionDecision,
    /// Only estimated when the object is present.
    pub pose: Option<PoseEstimate>,
    /// Bounding box of every training object point projected with the pose.
    pub bounding_box: Option<Rect>,
    pub centroid: Option<Point2<f64>>,
}

#[derive(Debug, Default)]
struct QueryState {
    keypoints: Vec<KeyPoint>,
    descriptors: Option<Descriptors>,
    raw: Option<RawMatches>,
    matches: Vec<Correspondence>,
    /// Indices into `matches` of the matches whose training keypoint has an object point.
    pose_matches: Vec<usize>,
    pose: Option<PoseSolution>,
    timings: Timings,
}

/// Learns objects from training images and finds them again in query images.
///
/// Every call goes through `&mut self`, so the reference model is never modified while
/// a query is in flight. The results of the last query stay readable until the next one.
pub struct Recognizer {
    registry: AdapterRegistry,
    settings: Settings,
    filter: MatchFilter,
    detection: DetectionRule,
    /// Replaces the registered matcher when brute force cross-checking is on.
    cross_check: Option<BruteForceMatcher>,
    estimator: PoseEstimator,
    reference: ReferenceModel,
    query: QueryState,
}

impl Recognizer {
    /// Fails with [`Error::InvalidParameter`] on invalid settings or adapter names
    /// missing from the registry.
    pub fn new(registry: AdapterRegistry, settings: Settings) -> Result<Self> {
        let (filter, detection, cross_check) = resolve(&registry, &settings)?;
        let estimator = PoseEstimator::seeded(settings.pose_settings()?, settings.seed)?;
        info!(
            "recognizer ready with detectors {:?}, extractor {} and matcher {}",
            settings.detectors, settings.extractor, settings.matcher
        );
        Ok(Self {
            registry,
            settings,
            filter,
            detection,
            cross_check,
            estimator,
            reference: ReferenceModel::new(),
            query: QueryState::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Edits the settings. A rejected configuration leaves the previous one in force.
    pub fn configure(&mut self, edit: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut settings = self.settings.clone();
        edit(&mut settings);
        let (filter, detection, cross_check) = resolve(&self.registry, &settings)?;
        self.estimator.set_settings(settings.pose_settings()?)?;
        if settings.seed != self.settings.seed {
            self.estimator.reseed(settings.seed);
        }
        self.filter = filter;
        self.detection = detection;
        self.cross_check = cross_check;
        self.settings = settings;
        Ok(())
    }

    /// Installs a predicate vetoing candidate poses during RANSAC.
    pub fn set_pose_check(&mut self, check: Option<PoseCheck>) {
        self.estimator.set_pose_check(check);
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn reference(&self) -> &ReferenceModel {
        &self.reference
    }

    /// Direct access to the reference model, e.g. to [`clear`](ReferenceModel::clear) it.
    pub fn reference_mut(&mut self) -> &mut ReferenceModel {
        &mut self.reference
    }

    /// Runs every configured detector and concatenates their keypoints.
    ///
    /// Keypoints outside `roi` are discarded even if a detector ignores it.
    pub fn detect(&self, image: &GrayImage, roi: Option<&Rect>) -> Result<Vec<KeyPoint>> {
        let mut keypoints = Vec::new();
        for name in &self.settings.detectors {
            let found = self.registry.detector(name)?.detect(image, roi);
            debug!("detector {} found {} keypoints", name, found.len());
            keypoints.extend(found);
        }
        if let Some(roi) = roi {
            keypoints.retain(|kp| roi.contains(kp));
        }
        Ok(keypoints)
    }

    /// Computes one descriptor per keypoint with the configured extractor.
    pub fn extract(&self, image: &GrayImage, keypoints: &[KeyPoint]) -> Result<Descriptors> {
        let descriptors = self
            .registry
            .extractor(&self.settings.extractor)?
            .extract(image, keypoints)?;
        if descriptors.len() != keypoints.len() {
            return Err(Error::SizeMismatch {
                what: "extracted descriptors",
                expected: keypoints.len(),
                found: descriptors.len(),
            });
        }
        Ok(descriptors)
    }

    /// Detects and describes keypoints in `image` and appends them to the reference model
    /// as a new training image. Returns the number of keypoints added.
    pub fn build_reference(&mut self, image: &GrayImage, roi: Option<&Rect>) -> Result<usize> {
        let mut timings = Timings::default();
        let (keypoints, descriptors) = self.detect_and_extract(image, roi, &mut timings)?;
        let count = keypoints.len();
        let batch = TrainingBatch::new(keypoints, descriptors).image(image.clone());
        let id = self.reference.append(batch)?;
        info!(
            "training image {} contributed {} keypoints in {:?}",
            id,
            count,
            timings.detection + timings.extraction
        );
        self.query.timings = timings;
        Ok(count)
    }

    /// Describes caller supplied keypoints with known object points and adds them to the
    /// reference model, replacing its content unless `append` is set.
    ///
    /// Returns the number of keypoints the reference model holds afterwards.
    pub fn build_reference_with_points(
        &mut self,
        image: &GrayImage,
        keypoints: Vec<KeyPoint>,
        points: Vec<ObjectPoint>,
        append: bool,
    ) -> Result<usize> {
        if points.len() != keypoints.len() {
            return Err(Error::SizeMismatch {
                what: "object points",
                expected: keypoints.len(),
                found: points.len(),
            });
        }
        let start = Instant::now();
        let descriptors = self.extract(image, &keypoints)?;
        let extraction = start.elapsed();
        let batch = TrainingBatch::new(keypoints, descriptors)
            .points(points)
            .image(image.clone());
        if append {
            self.reference.append(batch)?;
        } else {
            let mut fresh = ReferenceModel {
                next_image_id: self.reference.next_image_id,
                ..ReferenceModel::default()
            };
            fresh.append(batch)?;
            self.reference = fresh;
        }
        self.query.timings = Timings {
            extraction,
            ..Timings::default()
        };
        Ok(self.reference.len())
    }

    /// Matches the keypoints of `image` against the reference model and filters the
    /// matches. Returns the number of matches kept.
    pub fn match_point(&mut self, image: &GrayImage, roi: Option<&Rect>) -> Result<usize> {
        self.query = QueryState::default();
        let mut timings = Timings::default();
        let result = self.match_query(image, roi, &mut timings);
        self.query.timings = timings;
        result
    }

    fn match_query(
        &mut self,
        image: &GrayImage,
        roi: Option<&Rect>,
        timings: &mut Timings,
    ) -> Result<usize> {
        let train = self
            .reference
            .descriptors()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Precondition("the reference model is empty".to_owned()))?;
        let (keypoints, descriptors) = self.detect_and_extract(image, roi, timings)?;
        self.query.keypoints = keypoints;

        let start = Instant::now();
        let k = if self.filter.requires_knn() { 2 } else { 1 };
        let matcher: &dyn DescriptorMatcher = match &self.cross_check {
            Some(matcher) => matcher,
            None => self.registry.matcher(&self.settings.matcher)?,
        };
        let raw = matcher.knn_match(train, &descriptors, k)?;
        self.query.descriptors = Some(descriptors);
        check_match_indices(&raw, self.query.keypoints.len(), self.reference.len())?;
        let filtered = self.filter.filter(&raw);
        self.query.raw = Some(raw);
        self.query.matches = filtered?;
        timings.matching = start.elapsed();
        debug!(
            "{} query keypoints, {} matches kept in {:?}",
            self.query.keypoints.len(),
            self.query.matches.len(),
            timings.matching
        );
        Ok(self.query.matches.len())
    }

    /// Matches `image` against the reference model and estimates the object pose from the
    /// matches whose training keypoint has an object point.
    pub fn match_point_and_estimate_pose(
        &mut self,
        image: &GrayImage,
        intrinsics: &CameraIntrinsics,
    ) -> Result<PoseEstimate> {
        self.match_point(image, None)?;
        self.estimate_pose(intrinsics)
    }

    fn estimate_pose(&mut self, intrinsics: &CameraIntrinsics) -> Result<PoseEstimate> {
        if !self.reference.has_points() {
            return Err(Error::Precondition(
                "the reference model has no object points".to_owned(),
            ));
        }
        let start = Instant::now();
        let mut pose_matches = Vec::new();
        let mut data = Vec::new();
        for (ix, m) in self.query.matches.iter().enumerate() {
            if let Some(object) = self.reference.points()[m.train] {
                let keypoint = intrinsics.calibrate(self.query.keypoints[m.query]);
                pose_matches.push(ix);
                data.push(PoseCorrespondence::new(keypoint, object));
            }
        }
        self.query.pose_matches = pose_matches;
        let solution = self.estimator.estimate(&data, intrinsics);
        self.query.timings.pose = start.elapsed();
        let solution = solution?;

        let to_matches = |indices: &[usize]| -> Vec<usize> {
            indices.iter().map(|&ix| self.query.pose_matches[ix]).collect()
        };
        let estimate = PoseEstimate {
            pose: solution.pose,
            inliers: to_matches(&solution.inliers),
            outliers: to_matches(&solution.outliers),
            reprojection_error: solution.reprojection_error,
            covariance: solution.covariance,
            timings: self.query.timings,
        };
        info!(
            "pose found with {} of {} correspondences after {} iterations",
            estimate.inliers.len(),
            data.len(),
            solution.iterations
        );
        self.query.pose = Some(solution);
        Ok(estimate)
    }

    /// Matches `image` against the reference model and decides whether the object is present.
    pub fn match_point_and_detect(
        &mut self,
        image: &GrayImage,
        roi: Option<&Rect>,
    ) -> Result<Detection> {
        self.match_point(image, roi)?;
        let decision = self.detection.decide(&self.query.matches)?;
        let matched: Vec<Point2<f64>> = self
            .query
            .matches
            .iter()
            .map(|m| self.query.keypoints[m.query].image_point())
            .collect();
        Ok(Detection {
            decision,
            bounding_box: Rect::bounding(matched.iter().copied()),
            centroid: centroid(matched.iter().copied()),
            timings: self.query.timings,
        })
    }

    /// Decides whether the object is present and, if so, estimates its pose and locates it
    /// by projecting every training object point.
    pub fn match_point_detect_and_estimate_pose(
        &mut self,
        image: &GrayImage,
        intrinsics: &CameraIntrinsics,
    ) -> Result<DetectedPose> {
        self.match_point(image, None)?;
        let decision = self.detection.decide(&self.query.matches)?;
        if !decision.present {
            debug!(
                "object absent, mean distance {} and score {}",
                decision.mean_distance, decision.score
            );
            return Ok(DetectedPose {
                decision,
                pose: None,
                bounding_box: None,
                centroid: None,
            });
        }
        let estimate = self.estimate_pose(intrinsics)?;
        let projected: Vec<Point2<f64>> = self
            .reference
            .points()
            .iter()
            .flatten()
            .filter_map(|&p| estimate.pose.project(p))
            .map(|p| intrinsics.uncalibrate(p))
            .collect();
        Ok(DetectedPose {
            decision,
            bounding_box: Rect::bounding(projected.iter().copied()),
            centroid: centroid(projected.iter().copied()),
            pose: Some(estimate),
        })
    }

    /// Saves the reference model.
    pub fn save_learning_data(
        &self,
        path: impl AsRef<Path>,
        encoding: Encoding,
        include_images: bool,
    ) -> Result<()> {
        self.reference.save(path, encoding, include_images)
    }

    /// Loads a reference model, replacing the current one unless `append` is set.
    pub fn load_learning_data(
        &mut self,
        path: impl AsRef<Path>,
        encoding: Encoding,
        append: bool,
    ) -> Result<Vec<ImageId>> {
        self.reference.load(path, encoding, append)
    }

    pub fn query_keypoints(&self) -> &[KeyPoint] {
        &self.query.keypoints
    }

    pub fn query_descriptors(&self) -> Option<&Descriptors> {
        self.query.descriptors.as_ref()
    }

    /// Matches before filtering.
    pub fn raw_matches(&self) -> Option<&RawMatches> {
        self.query.raw.as_ref()
    }

    /// Matches kept by the filter.
    pub fn matches(&self) -> &[Correspondence] {
        &self.query.matches
    }

    /// The (query, training) keypoint pair of every kept match.
    pub fn match_query_to_train_keypoints(&self) -> Vec<(KeyPoint, KeyPoint)> {
        self.query
            .matches
            .iter()
            .filter_map(|m| {
                Some((
                    *self.query.keypoints.get(m.query)?,
                    *self.reference.keypoints().get(m.train)?,
                ))
            })
            .collect()
    }

    /// The training image each kept match comes from.
    pub fn match_image_ids(&self) -> Vec<Option<ImageId>> {
        self.query
            .matches
            .iter()
            .map(|m| self.reference.image_id_of(m.train))
            .collect()
    }

    pub fn image_id_of(&self, train_index: usize) -> Option<ImageId> {
        self.reference.image_id_of(train_index)
    }

    /// Object points of the kept matches used for pose estimation.
    pub fn match_object_points(&self) -> Vec<ObjectPoint> {
        self.query
            .pose_matches
            .iter()
            .filter_map(|&ix| {
                let m = self.query.matches.get(ix)?;
                *self.reference.points().get(m.train)?
            })
            .collect()
    }

    /// Query keypoints consistent with the last estimated pose.
    pub fn ransac_inliers(&self) -> Vec<KeyPoint> {
        self.pose_keypoints(|solution| &solution.inliers)
    }

    /// Query keypoints rejected by the last estimated pose.
    pub fn ransac_outliers(&self) -> Vec<KeyPoint> {
        self.pose_keypoints(|solution| &solution.outliers)
    }

    fn pose_keypoints(&self, select: impl Fn(&PoseSolution) -> &Vec<usize>) -> Vec<KeyPoint> {
        self.query
            .pose
            .as_ref()
            .map(|solution| {
                select(solution)
                    .iter()
                    .map(|&ix| {
                        let m = self.query.matches[self.query.pose_matches[ix]];
                        self.query.keypoints[m.query]
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Covariance of the last estimated pose, when it was computed.
    pub fn covariance_matrix(&self) -> Option<Matrix6<f64>> {
        self.query.pose.as_ref().and_then(|solution| solution.covariance)
    }

    pub fn timings(&self) -> Timings {
        self.query.timings
    }

    fn detect_and_extract(
        &self,
        image: &GrayImage,
        roi: Option<&Rect>,
        timings: &mut Timings,
    ) -> Result<(Vec<KeyPoint>, Descriptors)> {
        let start = Instant::now();
        let keypoints = self.detect(image, roi)?;
        timings.detection = start.elapsed();
        let start = Instant::now();
        let descriptors = self.extract(image, &keypoints)?;
        timings.extraction = start.elapsed();
        Ok((keypoints, descriptors))
    }
}

/// Validates the settings against the registry and builds the components they select.
fn resolve(
    registry: &AdapterRegistry,
    settings: &Settings,
) -> Result<(MatchFilter, DetectionRule, Option<BruteForceMatcher>)> {
    settings.validate()?;
    for name in &settings.detectors {
        registry.detector(name)?;
    }
    registry.extractor(&settings.extractor)?;
    registry.matcher(&settings.matcher)?;
    let filter = settings.match_filter()?;
    let cross_check = settings.cross_check_matcher();
    if settings.use_brute_force_cross_check && (cross_check.is_none() || filter.requires_knn()) {
        warn!(
            "cross check has no effect with matcher {} and filter {:?}",
            settings.matcher,
            filter.kind()
        );
    }
    Ok((filter, settings.detection_rule()?, cross_check))
}

/// Rejects matcher output referring to keypoints that do not exist.
fn check_match_indices(raw: &RawMatches, query_len: usize, train_len: usize) -> Result<()> {
    match raw
        .matches
        .iter()
        .find(|m| m.query >= query_len || m.train >= train_len)
    {
        Some(m) => Err(Error::invalid(
            "matcher",
            format!(
                "returned match ({}, {}) for {} query and {} training keypoints",
                m.query, m.train, query_len, train_len
            ),
        )),
        None => Ok(()),
    }
}

fn centroid(points: impl Iterator<Item = Point2<f64>>) -> Option<Point2<f64>> {
    let (sum, count) = points.fold((Vector2::zeros(), 0usize), |(sum, count), p| {
        (sum + p.coords, count + 1)
    });
    (count > 0).then(|| Point2::from(sum / count as f64))
}
