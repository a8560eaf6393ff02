//! Statistical rejection of spurious descriptor matches.

use average::Variance;
use float_ord::FloatOrd;
use keypose_core::{ensure_positive, Correspondence, Error, RawMatches, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// The names of the filtering policies, as they appear in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterType {
    ConstantFactorDistanceThreshold,
    StdDistanceThreshold,
    RatioDistanceThreshold,
    StdAndRatioDistanceThreshold,
    NoFilterMatching,
}

/// A validated filtering policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchFilter {
    /// Keep matches with `distance <= min_distance * factor`.
    ConstantFactor { factor: f64 },
    /// Keep matches with `distance <= min_distance + std_dev(distances)`.
    StdDistance,
    /// Keep matches with a second neighbor such that `distance <= ratio * second_distance`.
    Ratio { ratio: f64 },
    /// Keep matches passing either the standard deviation or the ratio test.
    StdAndRatio { ratio: f64 },
    NoFilter,
}

impl MatchFilter {
    /// Builds the policy `kind`, validating the parameter it uses.
    pub fn new(kind: FilterType, factor: f64, ratio: f64) -> Result<Self> {
        Ok(match kind {
            FilterType::ConstantFactorDistanceThreshold => Self::constant_factor(factor)?,
            FilterType::StdDistanceThreshold => MatchFilter::StdDistance,
            FilterType::RatioDistanceThreshold => Self::ratio(ratio)?,
            FilterType::StdAndRatioDistanceThreshold => MatchFilter::StdAndRatio {
                ratio: validate_ratio(ratio)?,
            },
            FilterType::NoFilterMatching => MatchFilter::NoFilter,
        })
    }

    pub fn constant_factor(factor: f64) -> Result<Self> {
        Ok(MatchFilter::ConstantFactor {
            factor: ensure_positive("matching_factor_threshold", factor)?,
        })
    }

    pub fn ratio(ratio: f64) -> Result<Self> {
        Ok(MatchFilter::Ratio {
            ratio: validate_ratio(ratio)?,
        })
    }

    pub fn kind(&self) -> FilterType {
        match self {
            MatchFilter::ConstantFactor { .. } => FilterType::ConstantFactorDistanceThreshold,
            MatchFilter::StdDistance => FilterType::StdDistanceThreshold,
            MatchFilter::Ratio { .. } => FilterType::RatioDistanceThreshold,
            MatchFilter::StdAndRatio { .. } => FilterType::StdAndRatioDistanceThreshold,
            MatchFilter::NoFilter => FilterType::NoFilterMatching,
        }
    }

    /// Whether matching must search for two neighbors per query descriptor.
    pub fn requires_knn(&self) -> bool {
        matches!(
            self,
            MatchFilter::Ratio { .. } | MatchFilter::StdAndRatio { .. }
        )
    }

    /// Keeps the matches accepted by the policy, in their original order.
    ///
    /// Fails with [`Error::Precondition`] when a ratio test is requested on
    /// matches computed without a second neighbor.
    pub fn filter(&self, raw: &RawMatches) -> Result<Vec<Correspondence>> {
        if self.requires_knn() && !raw.has_second_neighbors() {
            return Err(Error::Precondition(format!(
                "{:?} needs k-nn matching with k >= 2, matches were computed with k = {}",
                self.kind(),
                raw.k
            )));
        }
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let kept: Vec<Correspondence> = match *self {
            MatchFilter::ConstantFactor { factor } => {
                let threshold = min_distance(&raw.matches) * factor;
                keep(raw, |m| m.distance as f64 <= threshold)
            }
            MatchFilter::StdDistance => {
                let threshold = std_threshold(&raw.matches);
                keep(raw, |m| m.distance as f64 <= threshold)
            }
            MatchFilter::Ratio { ratio } => keep(raw, |m| passes_ratio(m, ratio)),
            MatchFilter::StdAndRatio { ratio } => {
                let threshold = std_threshold(&raw.matches);
                keep(raw, |m| {
                    m.distance as f64 <= threshold || passes_ratio(m, ratio)
                })
            }
            MatchFilter::NoFilter => raw.matches.clone(),
        };
        debug!(
            "{:?} kept {} of {} matches",
            self.kind(),
            kept.len(),
            raw.len()
        );
        Ok(kept)
    }
}

fn validate_ratio(ratio: f64) -> Result<f64> {
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(ratio)
    } else {
        Err(Error::invalid(
            "matching_ratio_threshold",
            format!("must be in (0, 1], got {}", ratio),
        ))
    }
}

fn keep(raw: &RawMatches, accept: impl Fn(&Correspondence) -> bool) -> Vec<Correspondence> {
    raw.matches.iter().filter(|m| accept(*m)).copied().collect()
}

fn min_distance(matches: &[Correspondence]) -> f64 {
    matches
        .iter()
        .map(|m| FloatOrd(m.distance))
        .min()
        .map_or(0.0, |FloatOrd(d)| d as f64)
}

/// Minimum distance plus the population standard deviation of the distances.
fn std_threshold(matches: &[Correspondence]) -> f64 {
    let variance: Variance = matches.iter().map(|m| m.distance as f64).collect();
    min_distance(matches) + variance.population_variance().sqrt()
}

fn passes_ratio(m: &Correspondence, ratio: f64) -> bool {
    match m.second_distance {
        Some(second) if second > 0.0 => m.distance as f64 <= ratio * second as f64,
        _ => false,
    }
}
