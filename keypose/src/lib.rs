//! # keypose
//!
//! Keypoint-based recognition of learned objects and estimation of their pose.
//!
//! A [`Recognizer`] learns a [`ReferenceModel`] from training images: the keypoints
//! found by the registered detectors, their descriptors and, when known, the 3d
//! object points they lie on. Query images are then matched against the model,
//! the matches are filtered by a [`MatchFilter`], and the object is either declared
//! present by a [`DetectionRule`] or located in 3d by a robust PnP
//! [`PoseEstimator`](keypose_pnp::PoseEstimator).
//!
//! Detectors and extractors are external. They are plugged into an
//! [`AdapterRegistry`] under the names the [`Settings`] refer to:
//!
//! ```
//! use keypose::{AdapterRegistry, KeyPoint, Rect, Recognizer, Settings};
//! use keypose::image::GrayImage;
//!
//! let mut registry = AdapterRegistry::with_brute_force_matchers();
//! registry.register_detector("corners", |image: &GrayImage, _roi: Option<&Rect>| {
//!     vec![KeyPoint::new(0.0, 0.0), KeyPoint::new(image.width() as f32 - 1.0, 0.0)]
//! });
//! let settings = Settings {
//!     detectors: vec!["corners".to_owned()],
//!     ..Settings::default()
//! };
//! // No extractor is registered under the default name.
//! assert!(Recognizer::new(registry, settings).is_err());
//! ```

mod adapter;
mod brute_force;
mod detection;
mod filter;
pub mod geometry;
mod persistence;
mod recognizer;
mod reference;
mod settings;

pub use adapter::*;
pub use brute_force::*;
pub use detection::*;
pub use filter::*;
pub use persistence::Encoding;
pub use recognizer::*;
pub use reference::*;
pub use settings::*;

pub use image;
pub use keypose_core::*;
pub use keypose_pnp;
