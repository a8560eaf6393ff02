//! # keypose core
//!
//! Shared types for keypoint-based object recognition and pose estimation.
//! Every crate in the `keypose` workspace speaks in terms of these types:
//!
//! * [`KeyPoint`] - a detected feature location with its detector metadata
//! * [`Descriptors`] - a row-major descriptor matrix, one row per keypoint
//! * [`Correspondence`] - a raw or filtered match between a query and a training descriptor
//! * [`ObjectPoint`] / [`CameraPoint`] - 3d points in the object and camera frames
//! * [`ObjectToCamera`] - the rigid transform recovered by pose estimation
//! * [`CameraIntrinsics`] - the pinhole model relating pixels to [`NormalizedKeyPoint`]s
//! * [`Error`] - the error taxonomy used across the workspace
//!
//! ## Coordinate frames
//!
//! The object frame is the frame in which the learned 3d model points are expressed.
//! The camera frame has its origin at the optical center with:
//!
//! * Positive z axis forwards
//! * Positive y axis down
//! * Positive x axis right
//!
//! A point is only visible when its camera frame `z` is strictly positive.

mod camera;
mod descriptor;
mod error;
mod keypoint;
mod matches;
mod point;
mod pose;
mod rect;

pub use camera::*;
pub use descriptor::*;
pub use error::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use point::*;
pub use pose::*;
pub use rect::*;
pub use sample_consensus;
