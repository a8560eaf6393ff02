use crate::ImagePoint;
use nalgebra::Point2;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    /// Whether the point lies inside the rectangle, borders included.
    pub fn contains(&self, point: &impl ImagePoint) -> bool {
        let p = point.image_point();
        p.x >= self.left && p.x <= self.right() && p.y >= self.top && p.y <= self.bottom()
    }

    /// The smallest rectangle containing every point, or `None` without points.
    pub fn bounding<I, P>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = P>,
        P: ImagePoint,
    {
        let mut points = points.into_iter().map(|p| p.image_point());
        let first = points.next()?;
        let (min, max) = points.fold((first, first), |(min, max), p| {
            (
                Point2::new(min.x.min(p.x), min.y.min(p.y)),
                Point2::new(max.x.max(p.x), max.y.max(p.y)),
            )
        });
        Some(Self::new(min.x, min.y, max.x - min.x, max.y - min.y))
    }
}
