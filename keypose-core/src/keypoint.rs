use nalgebra::Point2;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows the retrieval of the point on the image the feature came from.
pub trait ImagePoint {
    /// Retrieves the point on the image
    fn image_point(&self) -> Point2<f64>;
}

/// A feature detected on an image, in pixel coordinates.
///
/// Apart from the location, the fields are detector metadata: they are carried
/// through the pipeline and persisted, but never interpreted by it.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeyPoint {
    /// The horizontal and vertical sub-pixel location of the keypoint.
    pub point: (f32, f32),
    /// The magnitude of response from the detector.
    pub response: f32,
    /// The diameter of the meaningful keypoint neighborhood.
    pub size: f32,
    /// The orientation angle in degrees, or `-1.0` when not applicable.
    pub angle: f32,
    /// The pyramid octave the keypoint was detected in.
    pub octave: i32,
    /// Detector specific object class.
    pub class_id: i32,
}

impl KeyPoint {
    /// Creates a keypoint at a location with no detector metadata.
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            point: (x, y),
            response: 0.0,
            size: 0.0,
            angle: -1.0,
            octave: 0,
            class_id: -1,
        }
    }

    #[must_use]
    pub fn size(self, size: f32) -> Self {
        Self { size, ..self }
    }

    #[must_use]
    pub fn response(self, response: f32) -> Self {
        Self { response, ..self }
    }
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        Point2::new(self.point.0 as f64, self.point.1 as f64)
    }
}

impl ImagePoint for Point2<f64> {
    fn image_point(&self) -> Point2<f64> {
        *self
    }
}
