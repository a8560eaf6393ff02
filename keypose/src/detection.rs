use average::Mean;
use keypose_core::{ensure_positive, Correspondence, Error, Result};
use serde::{Deserialize, Serialize};

/// The names of the detection methods, as they appear in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionMethod {
    DetectionThreshold,
    DetectionScore,
}

/// Decides whether the learned object is present from the filtered matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionRule {
    /// Present when the mean descriptor distance is below the threshold.
    MeanDistance { threshold: f64 },
    /// Present when `match_count / mean_distance` exceeds the threshold.
    Score { threshold: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionDecision {
    pub present: bool,
    pub matches: usize,
    pub mean_distance: f64,
    /// `matches / mean_distance`, infinite when every distance is zero.
    pub score: f64,
}

impl DetectionRule {
    pub fn new(
        method: DetectionMethod,
        distance_threshold: f64,
        score_threshold: f64,
    ) -> Result<Self> {
        Ok(match method {
            DetectionMethod::DetectionThreshold => DetectionRule::MeanDistance {
                threshold: ensure_positive("detection_threshold", distance_threshold)?,
            },
            DetectionMethod::DetectionScore => DetectionRule::Score {
                threshold: ensure_positive("detection_score", score_threshold)?,
            },
        })
    }

    pub fn method(&self) -> DetectionMethod {
        match self {
            DetectionRule::MeanDistance { .. } => DetectionMethod::DetectionThreshold,
            DetectionRule::Score { .. } => DetectionMethod::DetectionScore,
        }
    }

    /// Fails with [`Error::NoMatches`] when no match survived filtering.
    pub fn decide(&self, matches: &[Correspondence]) -> Result<DetectionDecision> {
        if matches.is_empty() {
            return Err(Error::NoMatches);
        }
        let mean: Mean = matches.iter().map(|m| m.distance as f64).collect();
        let mean_distance = mean.mean();
        let score = detection_score(matches.len(), mean_distance);
        let present = match *self {
            DetectionRule::MeanDistance { threshold } => mean_distance < threshold,
            DetectionRule::Score { threshold } => score > threshold,
        };
        Ok(DetectionDecision {
            present,
            matches: matches.len(),
            mean_distance,
            score,
        })
    }
}

pub fn detection_score(count: usize, mean_distance: f64) -> f64 {
    if mean_distance > 0.0 {
        count as f64 / mean_distance
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(distances: &[f32]) -> Vec<Correspondence> {
        distances
            .iter()
            .enumerate()
            .map(|(ix, &d)| Correspondence::new(ix, ix, d))
            .collect()
    }

    #[test]
    fn threshold_on_mean_distance() {
        let rule = DetectionRule::new(DetectionMethod::DetectionThreshold, 10.0, 1.0).unwrap();
        let decision = rule.decide(&matches(&[4.0, 8.0, 12.0])).unwrap();
        assert_eq!(decision.mean_distance, 8.0);
        assert!(decision.present);
        assert!(!rule.decide(&matches(&[10.0, 10.0])).unwrap().present);
    }

    #[test]
    fn score_is_count_over_mean() {
        let rule = DetectionRule::new(DetectionMethod::DetectionScore, 1.0, 0.5).unwrap();
        let decision = rule.decide(&matches(&[4.0, 8.0, 12.0])).unwrap();
        assert_eq!(decision.score, 3.0 / 8.0);
        assert!(!decision.present);
        let perfect = rule.decide(&matches(&[0.0])).unwrap();
        assert!(perfect.score.is_infinite() && perfect.present);
    }

    #[test]
    fn no_matches_is_an_error() {
        let rule = DetectionRule::new(DetectionMethod::DetectionScore, 1.0, 0.5).unwrap();
        assert!(matches!(rule.decide(&[]), Err(Error::NoMatches)));
        assert!(DetectionRule::new(DetectionMethod::DetectionThreshold, 0.0, 1.0).is_err());
    }
}
