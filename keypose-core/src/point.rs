use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Point2, Point3, Unit, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A 3d point expressed in the object (model) frame.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ObjectPoint(pub Point3<f64>);

impl ObjectPoint {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self(Point3::new(x, y, z))
    }
}

/// A 3d point relative to the optical center of the camera.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPoint(pub Point3<f64>);

impl CameraPoint {
    /// Whether the point lies strictly in front of the camera.
    pub fn is_visible(&self) -> bool {
        self.z > 0.0
    }
}

/// A point on the virtual image plane at depth `1.0`, with the camera intrinsics removed.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct NormalizedKeyPoint(pub Point2<f64>);

impl NormalizedKeyPoint {
    /// Projects a camera point onto the virtual image plane.
    ///
    /// Returns `None` for points that are not in front of the camera.
    pub fn from_camera_point(point: CameraPoint) -> Option<Self> {
        if point.is_visible() {
            Some(Self(Point2::new(point.x / point.z, point.y / point.z)))
        } else {
            None
        }
    }

    /// The unit direction from the optical center through this point.
    pub fn bearing(&self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.coords.push(1.0))
    }

    /// The camera point on this keypoint's ray at the given `depth` along the optical axis.
    pub fn with_depth(self, depth: f64) -> CameraPoint {
        CameraPoint(Point3::from(self.coords.push(1.0) * depth))
    }
}

/// A 2d-3d pair consumed by pose estimation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseCorrespondence {
    /// The observed query keypoint, normalized by the camera intrinsics.
    pub keypoint: NormalizedKeyPoint,
    /// The object point of the matched training keypoint.
    pub object: ObjectPoint,
}

impl PoseCorrespondence {
    pub fn new(keypoint: NormalizedKeyPoint, object: ObjectPoint) -> Self {
        Self { keypoint, object }
    }
}
