//! Recovering 3d object points for keypoints lying on known planar faces.

use keypose_core::{
    nalgebra::{Point2, Point3, Vector3},
    CameraIntrinsics, CameraPoint, ImagePoint, KeyPoint, ObjectPoint, ObjectToCamera, Pose,
};

/// A simple polygon in pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub corners: Vec<Point2<f64>>,
}

impl Polygon {
    pub fn new(corners: Vec<Point2<f64>>) -> Self {
        Self { corners }
    }

    /// The polygon made of the projections of `points`, or `None` if one is behind the camera.
    pub fn project(
        points: &[ObjectPoint],
        intrinsics: &CameraIntrinsics,
        pose: &ObjectToCamera,
    ) -> Option<Self> {
        points
            .iter()
            .map(|&p| pose.project(p).map(|p| intrinsics.uncalibrate(p)))
            .collect::<Option<Vec<_>>>()
            .map(Self::new)
    }

    /// Even-odd rule containment test.
    pub fn contains(&self, point: &impl ImagePoint) -> bool {
        let p = point.image_point();
        let n = self.corners.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (self.corners[i], self.corners[j]);
            if (a.y > p.y) != (b.y > p.y) {
                let x = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// Intersects the viewing ray of `point` with the plane through the first three `plane` points.
///
/// Returns the intersection in the object frame, or `None` when fewer than three plane
/// points are given, they are collinear, the ray is parallel to the plane or the
/// intersection is behind the camera.
pub fn back_project_onto_plane(
    point: &impl ImagePoint,
    plane: &[ObjectPoint],
    intrinsics: &CameraIntrinsics,
    pose: &ObjectToCamera,
) -> Option<ObjectPoint> {
    let [a, b, c] = match plane {
        [a, b, c, ..] => [a, b, c].map(|&p| pose.transform(p).0.coords),
        _ => return None,
    };
    let normal = (b - a).cross(&(c - a));
    if normal.norm_squared() < 1e-18 {
        return None;
    }
    let ray: Vector3<f64> = intrinsics.calibrate(point.image_point()).with_depth(1.0).0.coords;
    let denominator = normal.dot(&ray);
    if denominator.abs() < 1e-12 {
        return None;
    }
    let depth = normal.dot(&a) / denominator;
    let camera = CameraPoint(Point3::from(ray * depth));
    if !camera.is_visible() {
        return None;
    }
    Some(pose.inverse().transform(camera))
}

/// Harvests object points for the keypoints lying inside the projected faces.
///
/// `polygons[i]` is the image outline of the planar face through `planes[i]`. A keypoint
/// is attributed to the first polygon containing it and is dropped when no polygon does
/// or back-projection fails. Returns the kept keypoints and their object points, aligned.
pub fn compute_3d_in_polygons(
    pose: &ObjectToCamera,
    intrinsics: &CameraIntrinsics,
    keypoints: &[KeyPoint],
    polygons: &[Polygon],
    planes: &[Vec<ObjectPoint>],
) -> (Vec<KeyPoint>, Vec<ObjectPoint>) {
    keypoints
        .iter()
        .filter_map(|keypoint| {
            let face = polygons.iter().position(|polygon| polygon.contains(keypoint))?;
            let plane = planes.get(face)?;
            back_project_onto_plane(keypoint, plane, intrinsics, pose)
                .map(|point| (*keypoint, point))
        })
        .unzip()
}
