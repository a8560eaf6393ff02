//! The capabilities the pipeline consumes from feature detection libraries.

use crate::BruteForceMatcher;
use image::GrayImage;
use keypose_core::{Descriptors, Error, KeyPoint, RawMatches, Rect, Result};
use std::collections::BTreeMap;

/// Finds keypoints in an image.
pub trait FeatureDetector {
    /// Detects keypoints, only considering the region of interest when one is given.
    fn detect(&self, image: &GrayImage, roi: Option<&Rect>) -> Vec<KeyPoint>;
}

/// Computes one descriptor per keypoint.
pub trait DescriptorExtractor {
    /// Must return exactly one descriptor row per keypoint, in keypoint order.
    fn extract(&self, image: &GrayImage, keypoints: &[KeyPoint]) -> Result<Descriptors>;
}

/// Finds the nearest training descriptors of every query descriptor.
pub trait DescriptorMatcher {
    /// Returns at most one correspondence per query descriptor, carrying the second
    /// nearest distance when `k >= 2`.
    fn knn_match(&self, train: &Descriptors, query: &Descriptors, k: usize) -> Result<RawMatches>;
}

impl<F> FeatureDetector for F
where
    F: Fn(&GrayImage, Option<&Rect>) -> Vec<KeyPoint>,
{
    fn detect(&self, image: &GrayImage, roi: Option<&Rect>) -> Vec<KeyPoint> {
        self(image, roi)
    }
}

/// Named adapters available to a [`Recognizer`](crate::Recognizer).
///
/// Names are looked up when the recognizer is configured, so an unknown name is
/// reported before any image is processed.
#[derive(Default)]
pub struct AdapterRegistry {
    detectors: BTreeMap<String, Box<dyn FeatureDetector>>,
    extractors: BTreeMap<String, Box<dyn DescriptorExtractor>>,
    matchers: BTreeMap<String, Box<dyn DescriptorMatcher>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the brute-force matchers registered under
    /// `BruteForce` (L2), `BruteForce-L1` and `BruteForce-Hamming`.
    pub fn with_brute_force_matchers() -> Self {
        let mut registry = Self::new();
        registry
            .register_matcher("BruteForce", BruteForceMatcher::l2())
            .register_matcher("BruteForce-L1", BruteForceMatcher::l1())
            .register_matcher("BruteForce-Hamming", BruteForceMatcher::hamming());
        registry
    }

    pub fn register_detector(
        &mut self,
        name: impl Into<String>,
        detector: impl FeatureDetector + 'static,
    ) -> &mut Self {
        self.detectors.insert(name.into(), Box::new(detector));
        self
    }

    pub fn register_extractor(
        &mut self,
        name: impl Into<String>,
        extractor: impl DescriptorExtractor + 'static,
    ) -> &mut Self {
        self.extractors.insert(name.into(), Box::new(extractor));
        self
    }

    pub fn register_matcher(
        &mut self,
        name: impl Into<String>,
        matcher: impl DescriptorMatcher + 'static,
    ) -> &mut Self {
        self.matchers.insert(name.into(), Box::new(matcher));
        self
    }

    pub fn detector(&self, name: &str) -> Result<&dyn FeatureDetector> {
        self.detectors
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| unknown("detector", name))
    }

    pub fn extractor(&self, name: &str) -> Result<&dyn DescriptorExtractor> {
        self.extractors
            .get(name)
            .map(|e| e.as_ref())
            .ok_or_else(|| unknown("extractor", name))
    }

    pub fn matcher(&self, name: &str) -> Result<&dyn DescriptorMatcher> {
        self.matchers
            .get(name)
            .map(|m| m.as_ref())
            .ok_or_else(|| unknown("matcher", name))
    }

    pub fn detector_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.detectors.keys().map(String::as_str)
    }
}

fn unknown(name: &'static str, value: &str) -> Error {
    Error::invalid(name, format!("no {} registered under `{}`", name, value))
}
