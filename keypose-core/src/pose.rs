use crate::{CameraPoint, NormalizedKeyPoint, ObjectPoint, PoseCorrespondence};
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Matrix4, Point3, Rotation3, Vector3, Vector6};
use sample_consensus::Model;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented by both poses in this library:
///
/// * [`ObjectToCamera`] - Transforms [`ObjectPoint`] into [`CameraPoint`]
/// * [`CameraToObject`] - Transforms [`CameraPoint`] into [`ObjectPoint`]
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type InputPoint: From<Point3<f64>> + Into<Point3<f64>>;
    type OutputPoint: From<Point3<f64>> + Into<Point3<f64>>;
    type Inverse: Pose;

    /// Retrieve the isometry.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// Creates a pose with no change in position or orientation.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    /// Takes the inverse of the pose.
    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    /// Create the pose from rotation and translation.
    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// Retrieve the homogeneous matrix.
    fn homogeneous(self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Retrieve the se(3) representation of the pose, translation first and
    /// the rotation as a scaled axis last.
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r = isometry.rotation.scaled_axis();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Set the se(3) representation of the pose.
    fn from_se3(se3: Vector6<f64>) -> Self {
        let translation = se3.xyz();
        let rotation = Rotation3::new(Vector3::new(se3[3], se3[4], se3[5]));
        Self::from_parts(translation, rotation)
    }

    /// Transform the given point to an output point.
    fn transform(self, input: Self::InputPoint) -> Self::OutputPoint {
        let point: Point3<f64> = input.into();
        (self.isometry() * point).into()
    }
}

/// The pose of the object relative to the camera.
///
/// This maps [`ObjectPoint`] into [`CameraPoint`] and is what pose estimation recovers.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ObjectToCamera(pub IsometryMatrix3<f64>);

impl ObjectToCamera {
    /// Projects an object point onto the normalized image plane.
    ///
    /// Returns `None` when the point lands behind the camera.
    pub fn project(self, point: ObjectPoint) -> Option<NormalizedKeyPoint> {
        NormalizedKeyPoint::from_camera_point(self.transform(point))
    }

    /// Angle in radians of the relative rotation between two poses.
    pub fn rotation_angle_to(self, other: Self) -> f64 {
        self.0.rotation.angle_to(&other.0.rotation)
    }

    /// Distance between the translation components of two poses.
    pub fn translation_distance_to(self, other: Self) -> f64 {
        (self.0.translation.vector - other.0.translation.vector).norm()
    }
}

impl Pose for ObjectToCamera {
    type InputPoint = ObjectPoint;
    type OutputPoint = CameraPoint;
    type Inverse = CameraToObject;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl Model<PoseCorrespondence> for ObjectToCamera {
    /// Distance on the normalized image plane between the observation and the
    /// reprojected object point. Points behind the camera never fit.
    #[inline(always)]
    fn residual(&self, data: &PoseCorrespondence) -> f64 {
        match self.project(data.object) {
            Some(projected) => (projected.0 - data.keypoint.0).norm(),
            None => f64::INFINITY,
        }
    }
}

/// The pose of the camera relative to the object.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToObject(pub IsometryMatrix3<f64>);

impl Pose for CameraToObject {
    type InputPoint = CameraPoint;
    type OutputPoint = ObjectPoint;
    type Inverse = ObjectToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}
