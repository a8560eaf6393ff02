//! Pose refinement by virtual visual servoing.
//!
//! A virtual camera is moved with the velocity that drives the reprojection of the
//! object points onto their observations, using the interaction matrix of image points.
//! This amounts to Gauss-Newton on the normalized reprojection error.

use keypose_core::{
    nalgebra::{
        IsometryMatrix3, Matrix2x6, Matrix6, Rotation3, Translation3, Vector2, Vector3, Vector6,
    },
    ObjectToCamera, Pose, PoseCorrespondence,
};
use log::trace;

/// Below this rotation angle the exponential map uses its Taylor expansion.
const SMALL_ANGLE: f64 = 1e-4;

#[derive(Copy, Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct VirtualVisualServoing {
    /// Scales every velocity step. `1.0` is a plain Gauss-Newton step.
    pub gain: f64,
    pub max_iterations: usize,
    /// Stop once the squared residual changes by less than this between iterations.
    pub epsilon: f64,
    /// Singular values below this are ignored when inverting the normal equations.
    pub pseudo_inverse_epsilon: f64,
}

impl Default for VirtualVisualServoing {
    fn default() -> Self {
        Self {
            gain: 1.0,
            max_iterations: 200,
            epsilon: 1e-20,
            pseudo_inverse_epsilon: 1e-12,
        }
    }
}

/// The converged pose and optional covariance of a refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VvsOutcome {
    pub pose: ObjectToCamera,
    pub iterations: usize,
    /// Sum of squared normalized reprojection errors at the returned pose.
    pub squared_error: f64,
    /// Covariance of the pose in camera velocity coordinates, translation first.
    pub covariance: Option<Matrix6<f64>>,
}

impl VirtualVisualServoing {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn gain(self, gain: f64) -> Self {
        Self { gain, ..self }
    }

    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Refines `pose` against `data`, which should only contain inliers.
    ///
    /// Correspondences behind the camera are ignored. With fewer than three usable
    /// correspondences the pose is returned unchanged.
    pub fn refine(
        &self,
        pose: ObjectToCamera,
        data: &[PoseCorrespondence],
        compute_covariance: bool,
    ) -> VvsOutcome {
        let mut pose = pose;
        let mut system = NormalEquations::build(pose, data);
        let mut iterations = 0;
        let mut previous = f64::INFINITY;
        while iterations < self.max_iterations
            && system.count >= 3
            && (previous - system.squared_error).abs() > self.epsilon
        {
            let inverse = match system.jtj.pseudo_inverse(self.pseudo_inverse_epsilon) {
                Ok(inverse) => inverse,
                Err(_) => break,
            };
            let velocity = -self.gain * (inverse * system.jte);
            pose = ObjectToCamera(exponential_map(velocity).inverse() * pose.isometry());
            previous = system.squared_error;
            system = NormalEquations::build(pose, data);
            iterations += 1;
        }
        trace!(
            "vvs stopped after {} iterations with squared error {}",
            iterations,
            system.squared_error
        );

        let covariance = if compute_covariance {
            system.covariance(self.pseudo_inverse_epsilon)
        } else {
            None
        };
        VvsOutcome {
            pose,
            iterations,
            squared_error: system.squared_error,
            covariance,
        }
    }
}

/// `LᵀL`, `Lᵀe` and `eᵀe` of the stacked point features at one pose.
struct NormalEquations {
    jtj: Matrix6<f64>,
    jte: Vector6<f64>,
    squared_error: f64,
    count: usize,
}

impl NormalEquations {
    fn build(pose: ObjectToCamera, data: &[PoseCorrespondence]) -> Self {
        let mut system = Self {
            jtj: Matrix6::zeros(),
            jte: Vector6::zeros(),
            squared_error: 0.0,
            count: 0,
        };
        for correspondence in data {
            let camera = pose.transform(correspondence.object);
            if !camera.is_visible() {
                continue;
            }
            let inv_z = 1.0 / camera.z;
            let x = camera.x * inv_z;
            let y = camera.y * inv_z;
            let error = Vector2::new(x - correspondence.keypoint.x, y - correspondence.keypoint.y);
            let l = interaction_matrix(x, y, inv_z);
            system.jtj += l.transpose() * l;
            system.jte += l.transpose() * error;
            system.squared_error += error.norm_squared();
            system.count += 1;
        }
        system
    }

    /// `σ² (LᵀL)⁺` with `σ² = eᵀe / (2n - 6)`.
    fn covariance(&self, epsilon: f64) -> Option<Matrix6<f64>> {
        let dof = 2 * self.count;
        if dof <= 6 {
            return None;
        }
        let sigma2 = self.squared_error / (dof - 6) as f64;
        self.jtj.pseudo_inverse(epsilon).ok().map(|inverse| inverse * sigma2)
    }
}

/// Interaction matrix of a normalized image point `(x, y)` at inverse depth `inv_z`,
/// relating its motion to the camera velocity `(v, ω)`.
#[rustfmt::skip]
fn interaction_matrix(x: f64, y: f64, inv_z: f64) -> Matrix2x6<f64> {
    Matrix2x6::new(
        -inv_z, 0.0,    x * inv_z, x * y,       -(1.0 + x * x), y,
        0.0,    -inv_z, y * inv_z, 1.0 + y * y, -x * y,         -x,
    )
}

/// The rigid motion obtained by applying the twist `(v, ω)` for unit time.
pub fn exponential_map(twist: Vector6<f64>) -> IsometryMatrix3<f64> {
    let v = Vector3::new(twist[0], twist[1], twist[2]);
    let w = Vector3::new(twist[3], twist[4], twist[5]);
    let theta2 = w.norm_squared();
    let theta = theta2.sqrt();
    let (sinc, mcosc, msinc) = if theta < SMALL_ANGLE {
        (
            1.0 - theta2 / 6.0,
            0.5 - theta2 / 24.0,
            1.0 / 6.0 - theta2 / 120.0,
        )
    } else {
        let sinc = theta.sin() / theta;
        (sinc, (1.0 - theta.cos()) / theta2, (1.0 - sinc) / theta2)
    };
    let translation = v * sinc + w.cross(&v) * mcosc + w * (w.dot(&v) * msinc);
    IsometryMatrix3::from_parts(Translation3::from(translation), Rotation3::new(w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exponential_of_pure_translation() {
        let motion = exponential_map(Vector6::new(0.1, -0.2, 0.3, 0.0, 0.0, 0.0));
        assert_relative_eq!(motion.translation.vector, Vector3::new(0.1, -0.2, 0.3));
        assert_relative_eq!(motion.rotation, Rotation3::identity());
    }

    #[test]
    fn exponential_of_rotation_about_z_moves_along_an_arc() {
        // Rotating at pi/2 rad/s while moving along x ends on a quarter circle.
        let half_pi = core::f64::consts::FRAC_PI_2;
        let motion = exponential_map(Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, half_pi));
        let radius = 1.0 / half_pi;
        assert_relative_eq!(
            motion.translation.vector,
            Vector3::new(radius, radius, 0.0),
            epsilon = 1e-12
        );
    }
}
