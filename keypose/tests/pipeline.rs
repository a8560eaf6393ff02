mod common;

use common::*;
use keypose::{
    Correspondence, DescriptorMatcher, Descriptors, Error, FilterType, KeyPoint, ObjectPoint,
    RawMatches, Recognizer, Rect, Result, Settings,
};

/// Trains on the object grid seen from the training pose, ids `1..=100`.
fn train_with_points(recognizer: &mut Recognizer) {
    let points = object_points();
    let locations = project(&points, &training_pose());
    let features: Vec<_> = (1..).zip(locations.iter().copied()).collect();
    let image = render(&features);
    let keypoints = locations
        .iter()
        .map(|&(x, y)| KeyPoint::new(x as f32, y as f32))
        .collect();
    let count = recognizer
        .build_reference_with_points(&image, keypoints, points, false)
        .unwrap();
    assert_eq!(count, 100);
}

#[test]
fn batches_are_attributed_to_their_training_image() {
    let mut recognizer = recognizer();
    let grid = |ids: std::ops::Range<u32>| -> Vec<(u32, (u32, u32))> {
        ids.map(|id| (id, (20 + 12 * (id % 40), 20 + 10 * (id / 40))))
            .collect()
    };
    assert_eq!(recognizer.build_reference(&render(&grid(1..51)), None).unwrap(), 50);
    assert_eq!(recognizer.build_reference(&render(&grid(51..101)), None).unwrap(), 50);
    assert_eq!(recognizer.reference().image_count(), 2);

    let query = render(&grid(40..61));
    let matched = recognizer.match_point(&query, None).unwrap();
    assert_eq!(matched, 21);
    let ids = recognizer.match_image_ids();
    for (m, image_id) in recognizer.matches().iter().zip(ids) {
        assert_eq!(m.distance, 0.0);
        let feature = decode(&query, &recognizer.query_keypoints()[m.query]);
        let expected = if feature <= 50 { 0 } else { 1 };
        assert_eq!(image_id, Some(expected));
    }
}

#[test]
fn region_of_interest_restricts_training_keypoints() {
    let mut recognizer = recognizer();
    let image = render(&[(1, (100, 100)), (2, (300, 100)), (3, (500, 400))]);
    let roi = Rect::new(50.0, 50.0, 300.0, 100.0);
    assert_eq!(recognizer.build_reference(&image, Some(&roi)).unwrap(), 2);
    assert!(recognizer
        .reference()
        .keypoints()
        .iter()
        .all(|kp| roi.contains(kp)));
}

#[test]
fn pose_is_recovered_and_planted_outliers_are_flagged() {
    let mut recognizer = recognizer();
    train_with_points(&mut recognizer);

    let mut locations = project(&object_points(), &query_pose());
    // Features 91..=100 are painted far away from where the pose projects them.
    for (k, location) in locations[90..].iter_mut().enumerate() {
        *location = (20 + 6 * k as u32, 20);
    }
    let features: Vec<_> = (1..).zip(locations).collect();
    let estimate = recognizer
        .match_point_and_estimate_pose(&render(&features), &intrinsics())
        .unwrap();

    assert!(estimate.pose.rotation_angle_to(query_pose()) < 0.02);
    assert!(estimate.pose.translation_distance_to(query_pose()) < 0.01);
    assert!(estimate.reprojection_error < 2.0);
    assert_eq!(estimate.inliers.len(), 90);

    let mut outlier_features: Vec<usize> = estimate
        .outliers
        .iter()
        .map(|&ix| recognizer.matches()[ix].train)
        .collect();
    outlier_features.sort_unstable();
    assert_eq!(outlier_features, (90..100).collect::<Vec<_>>());
    assert_eq!(recognizer.ransac_outliers().len(), 10);
    assert_eq!(recognizer.match_object_points().len(), 100);
    assert!(recognizer.covariance_matrix().is_none());
}

#[test]
fn covariance_is_reported_when_requested() {
    let mut recognizer = recognizer();
    train_with_points(&mut recognizer);
    recognizer.configure(|s| s.compute_covariance = true).unwrap();
    let features: Vec<_> = (1..).zip(project(&object_points(), &query_pose())).collect();
    let estimate = recognizer
        .match_point_and_estimate_pose(&render(&features), &intrinsics())
        .unwrap();
    let covariance = estimate.covariance.unwrap();
    assert_eq!(recognizer.covariance_matrix(), Some(covariance));
    assert!((0..6).all(|i| covariance[(i, i)] >= 0.0));
}

#[test]
fn detection_and_pose_locate_the_object() {
    let mut recognizer = recognizer();
    train_with_points(&mut recognizer);
    let features: Vec<_> = (1..).zip(project(&object_points(), &query_pose())).collect();
    let found = recognizer
        .match_point_detect_and_estimate_pose(&render(&features), &intrinsics())
        .unwrap();
    assert!(found.decision.present);
    assert_eq!(found.decision.mean_distance, 0.0);
    let pose = found.pose.unwrap().pose;
    let centroid = found.centroid.unwrap();
    let center = intrinsics().uncalibrate(pose.project(ObjectPoint::new(0.0, 0.0, 0.0)).unwrap());
    assert!((centroid - center).norm() < 5.0);
    let bounding_box = found.bounding_box.unwrap();
    assert!(bounding_box.contains(&centroid));
}

#[test]
fn unknown_features_are_not_detected() {
    let mut recognizer = recognizer();
    train_with_points(&mut recognizer);

    let features: Vec<_> = (1001..).zip(project(&object_points(), &query_pose())).collect();
    let query = render(&features);
    // Unrelated descriptors are too ambiguous for the ratio test.
    assert!(matches!(
        recognizer.match_point_and_detect(&query, None),
        Err(Error::NoMatches)
    ));

    recognizer
        .configure(|s| s.filter_type = FilterType::NoFilterMatching)
        .unwrap();
    let detection = recognizer.match_point_and_detect(&query, None).unwrap();
    assert!(!detection.decision.present);
    assert!(detection.decision.mean_distance > 100.0);
    let absent = recognizer
        .match_point_detect_and_estimate_pose(&query, &intrinsics())
        .unwrap();
    assert!(absent.pose.is_none());
}

#[test]
fn pose_needs_object_points() {
    let mut recognizer = recognizer();
    let features: Vec<_> = (1..).zip(project(&object_points(), &training_pose())).collect();
    let image = render(&features);
    recognizer.build_reference(&image, None).unwrap();
    assert!(matches!(
        recognizer.match_point_and_estimate_pose(&image, &intrinsics()),
        Err(Error::Precondition(_))
    ));
    // The matches of the failed query stay readable.
    assert_eq!(recognizer.matches().len(), 100);
}

#[test]
fn querying_an_empty_model_is_a_precondition_failure() {
    let mut recognizer = recognizer();
    assert!(matches!(
        recognizer.match_point(&render(&[(1, (10, 10))]), None),
        Err(Error::Precondition(_))
    ));
}

#[test]
fn rejected_configuration_keeps_the_previous_one() {
    let mut recognizer = recognizer();
    let before = recognizer.settings().clone();
    assert!(matches!(
        recognizer.configure(|s| s.matcher = "FLANN".to_owned()),
        Err(Error::InvalidParameter { .. })
    ));
    assert!(recognizer
        .configure(|s| s.matching_ratio_threshold = 1.5)
        .is_err());
    assert_eq!(recognizer.settings(), &before);
}

#[test]
fn query_state_is_replaced_by_the_next_query() {
    let mut recognizer = recognizer();
    train_with_points(&mut recognizer);
    let features: Vec<_> = (1..).zip(project(&object_points(), &query_pose())).collect();
    recognizer
        .match_point_and_estimate_pose(&render(&features), &intrinsics())
        .unwrap();
    assert_eq!(recognizer.ransac_inliers().len(), 100);

    recognizer
        .match_point(&render(&features[..20]), None)
        .unwrap();
    assert_eq!(recognizer.matches().len(), 20);
    assert!(recognizer.ransac_inliers().is_empty());
    let pairs = recognizer.match_query_to_train_keypoints();
    assert_eq!(pairs.len(), 20);
}

/// Answers every query with a training index far beyond the model.
struct StrayMatcher;

impl DescriptorMatcher for StrayMatcher {
    fn knn_match(
        &self,
        _train: &Descriptors,
        _query: &Descriptors,
        k: usize,
    ) -> Result<RawMatches> {
        let stray = Correspondence::new(0, 999_999, 1.0).with_second(5.0);
        Ok(RawMatches::new(k, vec![stray]))
    }
}

#[test]
fn out_of_range_matches_are_rejected() {
    init_logging();
    let mut registry = registry();
    registry.register_matcher("stray", StrayMatcher);
    let settings = Settings {
        matcher: "stray".to_owned(),
        ..settings()
    };
    let mut recognizer = Recognizer::new(registry, settings).unwrap();
    train_with_points(&mut recognizer);

    let features: Vec<_> = (1..).zip(project(&object_points(), &query_pose())).collect();
    assert!(matches!(
        recognizer.match_point_and_estimate_pose(&render(&features), &intrinsics()),
        Err(Error::InvalidParameter { name: "matcher", .. })
    ));
    assert!(recognizer.matches().is_empty());
    assert!(recognizer.match_query_to_train_keypoints().is_empty());
}

#[test]
fn getters_survive_a_replaced_reference() {
    let mut recognizer = recognizer();
    train_with_points(&mut recognizer);
    let features: Vec<_> = (1..).zip(project(&object_points(), &query_pose())).collect();
    recognizer
        .match_point_and_estimate_pose(&render(&features), &intrinsics())
        .unwrap();

    recognizer.reference_mut().clear();
    assert_eq!(recognizer.matches().len(), 100);
    assert!(recognizer.match_query_to_train_keypoints().is_empty());
    assert!(recognizer.match_object_points().is_empty());
    assert!(recognizer.match_image_ids().iter().all(Option::is_none));
}

#[test]
fn cross_check_keeps_mutual_nearest_neighbors_only() {
    let mut recognizer = recognizer();
    train_with_points(&mut recognizer);
    let mut features: Vec<_> = (1..).zip(project(&object_points(), &query_pose())).collect();
    // A second copy of feature 1, far from the object.
    features.push((1, (600, 20)));
    let query = render(&features);

    recognizer
        .configure(|s| s.filter_type = FilterType::NoFilterMatching)
        .unwrap();
    assert_eq!(recognizer.match_point(&query, None).unwrap(), 101);

    recognizer
        .configure(|s| s.use_brute_force_cross_check = true)
        .unwrap();
    assert_eq!(recognizer.match_point(&query, None).unwrap(), 100);
    let trains: Vec<usize> = recognizer.matches().iter().map(|m| m.train).collect();
    assert_eq!(trains.iter().filter(|&&t| t == 0).count(), 1);
}
