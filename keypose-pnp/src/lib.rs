//! Robust Perspective-n-Point pose estimation.
//!
//! Given 2d-3d [`PoseCorrespondence`](keypose_core::PoseCorrespondence)s polluted by
//! wrong matches, [`PoseEstimator`] recovers the [`ObjectToCamera`](keypose_core::ObjectToCamera)
//! pose explaining most of them:
//!
//!  - [`LambdaTwist`] solves P3P on minimal samples of four correspondences
//!    (the fourth picks one of the up to four P3P solutions),
//!  - [`Ransac`] keeps the candidate with the largest inlier set,
//!  - [`VirtualVisualServoing`] optionally refines it and estimates its covariance.

mod estimator;
mod lambda_twist;
mod ransac;
mod vvs;

pub use estimator::*;
pub use lambda_twist::LambdaTwist;
pub use ransac::*;
pub use vvs::*;
