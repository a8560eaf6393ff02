//! Synthetic adapters: features are painted into images as pixel pairs encoding an id.
//!
//! A feature at an even column `x` occupies `(x, y)` and `(x + 1, y)`. The detector
//! reports every lit pixel in an even column, and the extractor turns the encoded id
//! into a 512 bit descriptor, so the same id always matches at distance zero while
//! different ids are far apart.

#![allow(dead_code)]

use keypose::image::{GrayImage, Luma};
use keypose::nalgebra::{IsometryMatrix3, Point2, Rotation3, Vector2, Vector3};
use keypose::{
    AdapterRegistry, CameraIntrinsics, DescriptorExtractor, DescriptorMatrix, Descriptors,
    KeyPoint, ObjectPoint, ObjectToCamera, Rect, Recognizer, Result, Settings,
};

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const DESCRIPTOR_BYTES: usize = 64;

pub fn init_logging() {
    let _ = pretty_env_logger::try_init_timed();
}

fn encode(id: u32) -> (u8, u8) {
    (1 + ((id - 1) % 255) as u8, ((id - 1) / 255) as u8)
}

pub fn decode(image: &GrayImage, keypoint: &KeyPoint) -> u32 {
    let (x, y) = (keypoint.point.0 as u32, keypoint.point.1 as u32);
    let low = image.get_pixel(x, y)[0] as u32;
    let high = image.get_pixel(x + 1, y)[0] as u32;
    high * 255 + low
}

/// Snaps a pixel location onto the feature grid.
pub fn snap(pixel: Point2<f64>) -> (u32, u32) {
    let x = (pixel.x / 2.0).round() as u32 * 2;
    (x, pixel.y.round() as u32)
}

/// Paints features with ids `>= 1` at the given snapped locations.
pub fn render(features: &[(u32, (u32, u32))]) -> GrayImage {
    let mut image = GrayImage::new(WIDTH, HEIGHT);
    for &(id, (x, y)) in features {
        let (low, high) = encode(id);
        image.put_pixel(x, y, Luma([low]));
        image.put_pixel(x + 1, y, Luma([high]));
    }
    image
}

pub fn detect(image: &GrayImage, _roi: Option<&Rect>) -> Vec<KeyPoint> {
    let mut keypoints = Vec::new();
    for y in 0..image.height() {
        for x in (0..image.width() - 1).step_by(2) {
            if image.get_pixel(x, y)[0] != 0 {
                keypoints.push(KeyPoint::new(x as f32, y as f32).size(2.0));
            }
        }
    }
    keypoints
}

pub struct IdExtractor;

impl DescriptorExtractor for IdExtractor {
    fn extract(&self, image: &GrayImage, keypoints: &[KeyPoint]) -> Result<Descriptors> {
        let rows = keypoints.iter().map(|kp| descriptor(decode(image, kp)));
        Ok(DescriptorMatrix::from_rows(DESCRIPTOR_BYTES, rows)?.into())
    }
}

fn descriptor(id: u32) -> Vec<u8> {
    let mut state = id as u64;
    (0..DESCRIPTOR_BYTES / 8)
        .flat_map(|_| splitmix64(&mut state).to_le_bytes())
        .collect()
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

pub fn registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::with_brute_force_matchers();
    registry
        .register_detector("ids", detect)
        .register_extractor("ids", IdExtractor);
    registry
}

pub fn settings() -> Settings {
    Settings {
        detectors: vec!["ids".to_owned()],
        extractor: "ids".to_owned(),
        ransac_min_inlier_count: 50,
        seed: Some(7),
        ..Settings::default()
    }
}

pub fn recognizer() -> Recognizer {
    init_logging();
    Recognizer::new(registry(), settings()).unwrap()
}

pub fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::identity()
        .focals(Vector2::new(600.0, 600.0))
        .principal_point(Point2::new(320.0, 240.0))
}

/// A 10 by 10 grid of points on the `z = 0` plane, 2cm apart.
pub fn object_points() -> Vec<ObjectPoint> {
    (0..100)
        .map(|ix| {
            let (col, row) = ((ix % 10) as f64, (ix / 10) as f64);
            ObjectPoint::new((col - 4.5) * 0.02, (row - 4.5) * 0.02, 0.0)
        })
        .collect()
}

pub fn training_pose() -> ObjectToCamera {
    ObjectToCamera(IsometryMatrix3::from_parts(
        Vector3::new(0.0, 0.0, 0.5).into(),
        Rotation3::identity(),
    ))
}

pub fn query_pose() -> ObjectToCamera {
    ObjectToCamera(IsometryMatrix3::from_parts(
        Vector3::new(0.01, -0.02, 0.6).into(),
        Rotation3::from_euler_angles(0.15, -0.1, 0.2),
    ))
}

/// Snapped pixel locations of `points` seen from `pose`.
pub fn project(points: &[ObjectPoint], pose: &ObjectToCamera) -> Vec<(u32, u32)> {
    let intrinsics = intrinsics();
    points
        .iter()
        .map(|&p| snap(intrinsics.uncalibrate(pose.project(p).unwrap())))
        .collect()
}
