use crate::{BruteForceMatcher, DetectionMethod, DetectionRule, FilterType, MatchFilter};
use keypose_core::{Error, Result};
use keypose_pnp::{ConsensusCriterion, PoseMethod, PoseSettings};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// The settings of a [`Recognizer`](crate::Recognizer).
///
/// Every field is optional in a settings file and falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Registered detectors to run, their keypoints are concatenated in this order.
    #[serde(default = "default_detectors")]
    pub detectors: Vec<String>,
    /// The registered descriptor extractor.
    #[serde(default = "default_extractor")]
    pub extractor: String,
    /// The registered descriptor matcher.
    #[serde(default = "default_matcher")]
    pub matcher: String,
    /// Only keep brute force matches that are mutual nearest neighbors. Applies to the
    /// built-in `BruteForce*` matchers when a single neighbor is searched, i.e. not with
    /// the ratio tests.
    #[serde(default)]
    pub use_brute_force_cross_check: bool,
    /// Policy used to reject spurious matches.
    #[serde(default = "default_filter_type")]
    pub filter_type: FilterType,
    /// Multiplier of the minimum distance for [`FilterType::ConstantFactorDistanceThreshold`].
    #[serde(default = "default_matching_factor_threshold")]
    pub matching_factor_threshold: f64,
    /// Nearest to second nearest distance ratio for the ratio tests.
    #[serde(default = "default_matching_ratio_threshold")]
    pub matching_ratio_threshold: f64,
    /// Maximum number of RANSAC samples.
    #[serde(default = "default_ransac_iterations")]
    pub ransac_iterations: usize,
    /// Inlier threshold in pixels, used when virtual visual servoing is off.
    #[serde(default = "default_ransac_reprojection_error")]
    pub ransac_reprojection_error: f64,
    /// Inlier threshold on the normalized image plane, used with virtual visual servoing.
    #[serde(default = "default_ransac_threshold")]
    pub ransac_threshold: f64,
    #[serde(default = "default_ransac_min_inlier_count")]
    pub ransac_min_inlier_count: usize,
    /// Percentage of the matches that must be inliers when `use_consensus_percentage` is set.
    #[serde(default = "default_ransac_consensus_percentage")]
    pub ransac_consensus_percentage: f64,
    #[serde(default)]
    pub use_consensus_percentage: bool,
    /// Refine the consensus pose by virtual visual servoing.
    #[serde(default = "default_use_ransac_vvs")]
    pub use_ransac_vvs: bool,
    /// Compute the pose covariance. Requires `use_ransac_vvs`.
    #[serde(default)]
    pub compute_covariance: bool,
    #[serde(default = "default_detection_method")]
    pub detection_method: DetectionMethod,
    /// Maximum mean descriptor distance for [`DetectionMethod::DetectionThreshold`].
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,
    /// Minimum score for [`DetectionMethod::DetectionScore`].
    #[serde(default = "default_detection_score")]
    pub detection_score: f64,
    /// Seed of the RANSAC generator, seeded from entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            detectors: default_detectors(),
            extractor: default_extractor(),
            matcher: default_matcher(),
            use_brute_force_cross_check: false,
            filter_type: default_filter_type(),
            matching_factor_threshold: default_matching_factor_threshold(),
            matching_ratio_threshold: default_matching_ratio_threshold(),
            ransac_iterations: default_ransac_iterations(),
            ransac_reprojection_error: default_ransac_reprojection_error(),
            ransac_threshold: default_ransac_threshold(),
            ransac_min_inlier_count: default_ransac_min_inlier_count(),
            ransac_consensus_percentage: default_ransac_consensus_percentage(),
            use_consensus_percentage: false,
            use_ransac_vvs: default_use_ransac_vvs(),
            compute_covariance: false,
            detection_method: default_detection_method(),
            detection_threshold: default_detection_threshold(),
            detection_score: default_detection_score(),
            seed: None,
        }
    }
}

impl Settings {
    /// Parses JSON settings.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        serde_json::from_reader(reader).map_err(|e| Error::invalid("settings", e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Checks the adapter list and the parameters of the selected methods.
    pub fn validate(&self) -> Result<()> {
        if self.detectors.is_empty() {
            return Err(Error::invalid("detectors", "at least one detector is needed"));
        }
        self.match_filter()?;
        self.pose_settings()?;
        self.detection_rule()?;
        Ok(())
    }

    /// The cross-checking brute force matcher replacing the registered one, if any.
    pub fn cross_check_matcher(&self) -> Option<BruteForceMatcher> {
        if !self.use_brute_force_cross_check {
            return None;
        }
        BruteForceMatcher::from_name(&self.matcher).map(|matcher| matcher.cross_check(true))
    }

    pub fn match_filter(&self) -> Result<MatchFilter> {
        MatchFilter::new(
            self.filter_type,
            self.matching_factor_threshold,
            self.matching_ratio_threshold,
        )
    }

    pub fn pose_settings(&self) -> Result<PoseSettings> {
        let method = if self.use_ransac_vvs {
            PoseMethod::VirtualVisualServoing {
                threshold: self.ransac_threshold,
            }
        } else {
            PoseMethod::ClosedForm {
                reprojection_error: self.ransac_reprojection_error,
            }
        };
        let consensus = if self.use_consensus_percentage {
            ConsensusCriterion::Percentage(self.ransac_consensus_percentage)
        } else {
            ConsensusCriterion::MinInliers(self.ransac_min_inlier_count)
        };
        let settings = PoseSettings {
            method,
            max_iterations: self.ransac_iterations,
            consensus,
            compute_covariance: self.compute_covariance,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn detection_rule(&self) -> Result<DetectionRule> {
        DetectionRule::new(
            self.detection_method,
            self.detection_threshold,
            self.detection_score,
        )
    }
}

fn default_detectors() -> Vec<String> {
    vec!["ORB".to_owned()]
}

fn default_extractor() -> String {
    "ORB".to_owned()
}

fn default_matcher() -> String {
    "BruteForce-Hamming".to_owned()
}

fn default_filter_type() -> FilterType {
    FilterType::RatioDistanceThreshold
}

fn default_matching_factor_threshold() -> f64 {
    2.0
}

fn default_matching_ratio_threshold() -> f64 {
    0.85
}

fn default_ransac_iterations() -> usize {
    200
}

fn default_ransac_reprojection_error() -> f64 {
    6.0
}

fn default_ransac_threshold() -> f64 {
    0.01
}

fn default_ransac_min_inlier_count() -> usize {
    100
}

fn default_ransac_consensus_percentage() -> f64 {
    20.0
}

fn default_use_ransac_vvs() -> bool {
    true
}

fn default_detection_method() -> DetectionMethod {
    DetectionMethod::DetectionThreshold
}

fn default_detection_threshold() -> f64 {
    100.0
}

fn default_detection_score() -> f64 {
    0.15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let json = br#"{
            "filterType": "stdAndRatioDistanceThreshold",
            "matchingRatioThreshold": 0.7,
            "seed": 7
        }"#;
        let settings = Settings::from_reader(json.as_slice()).unwrap();
        assert_eq!(settings.filter_type, FilterType::StdAndRatioDistanceThreshold);
        assert_eq!(settings.matching_ratio_threshold, 0.7);
        assert_eq!(settings.seed, Some(7));
        assert_eq!(
            Settings {
                filter_type: FilterType::RatioDistanceThreshold,
                matching_ratio_threshold: 0.85,
                seed: None,
                ..settings
            },
            Settings::default()
        );
    }

    #[test]
    fn unknown_method_names_are_rejected() {
        let error = Settings::from_reader(br#"{ "detectionMethod": "detectionGuess" }"#.as_slice())
            .unwrap_err();
        assert!(matches!(error, Error::InvalidParameter { name: "settings", .. }));
    }

    #[test]
    fn defaults_map_to_pipeline_components() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.match_filter().unwrap(), MatchFilter::Ratio { ratio: 0.85 });
        assert_eq!(settings.pose_settings().unwrap(), PoseSettings::default());
        assert_eq!(
            settings.detection_rule().unwrap(),
            DetectionRule::MeanDistance { threshold: 100.0 }
        );
    }

    #[test]
    fn cross_check_only_replaces_brute_force_matchers() {
        let settings = Settings::from_reader(br#"{ "useBruteForceCrossCheck": true }"#.as_slice())
            .unwrap();
        assert_eq!(
            settings.cross_check_matcher(),
            Some(BruteForceMatcher::hamming().cross_check(true))
        );
        let custom = Settings {
            matcher: "flann".to_owned(),
            ..settings
        };
        assert_eq!(custom.cross_check_matcher(), None);
        assert_eq!(Settings::default().cross_check_matcher(), None);
    }

    #[test]
    fn consensus_percentage_and_closed_form() {
        let settings = Settings {
            use_consensus_percentage: true,
            ransac_consensus_percentage: 50.0,
            use_ransac_vvs: false,
            ..Settings::default()
        };
        let pose = settings.pose_settings().unwrap();
        assert_eq!(pose.consensus, ConsensusCriterion::Percentage(50.0));
        assert_eq!(
            pose.method,
            PoseMethod::ClosedForm {
                reprojection_error: 6.0
            }
        );
        let bad = Settings {
            ransac_consensus_percentage: 120.0,
            ..settings
        };
        assert!(bad.validate().is_err());
    }
}
