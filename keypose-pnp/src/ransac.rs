use keypose_core::{
    ensure_positive,
    sample_consensus::{Estimator, Model},
    CameraIntrinsics, Error, ObjectToCamera, PoseCorrespondence, Result,
};
use log::{debug, trace};
use rand::{seq::index, Rng};

/// How the residual of a correspondence is measured against a candidate pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InlierMetric {
    /// Reprojection error in pixels, through the given camera intrinsics.
    Pixel(CameraIntrinsics),
    /// Reprojection error on the normalized image plane (metric units at depth `1.0`).
    Normalized,
}

impl InlierMetric {
    pub fn residual(&self, pose: &ObjectToCamera, data: &PoseCorrespondence) -> f64 {
        match self {
            InlierMetric::Pixel(intrinsics) => match pose.project(data.object) {
                Some(projected) => {
                    (intrinsics.uncalibrate(projected) - intrinsics.uncalibrate(data.keypoint))
                        .norm()
                }
                None => f64::INFINITY,
            },
            InlierMetric::Normalized => pose.residual(data),
        }
    }
}

/// The minimum consensus a pose needs to be accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsensusCriterion {
    /// An absolute number of inliers.
    MinInliers(usize),
    /// A percentage in `(0, 100]` of all correspondences, truncated to an integer count.
    Percentage(f64),
}

impl ConsensusCriterion {
    pub fn validate(self) -> Result<Self> {
        match self {
            ConsensusCriterion::MinInliers(0) => Err(Error::invalid(
                "ransac_min_inlier_count",
                "must be > 0",
            )),
            ConsensusCriterion::Percentage(pct) if !(pct > 0.0 && pct <= 100.0) => {
                Err(Error::invalid(
                    "ransac_consensus_percentage",
                    format!("must be in (0, 100], got {}", pct),
                ))
            }
            criterion => Ok(criterion),
        }
    }

    /// The number of inliers required out of `total` correspondences.
    pub fn required(&self, total: usize) -> usize {
        match *self {
            ConsensusCriterion::MinInliers(count) => count,
            ConsensusCriterion::Percentage(pct) => (pct / 100.0 * total as f64) as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RansacConfig {
    /// Upper bound on the number of minimal samples drawn.
    pub max_iterations: usize,
    /// A correspondence is an inlier when its residual is strictly below this.
    pub threshold: f64,
    pub consensus: ConsensusCriterion,
}

impl RansacConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::invalid("ransac_iterations", "must be > 0"));
        }
        ensure_positive("ransac_threshold", self.threshold)?;
        self.consensus.validate()?;
        Ok(())
    }
}

/// A user supplied predicate that can veto candidate poses.
pub type PoseCheck = Box<dyn Fn(&ObjectToCamera) -> bool + Send + Sync>;

/// The best consensus found by [`Ransac::estimate`].
#[derive(Debug, Clone, PartialEq)]
pub struct RansacOutcome {
    pub pose: ObjectToCamera,
    /// Indices into the input correspondences, in increasing order.
    pub inliers: Vec<usize>,
    /// Number of minimal samples drawn.
    pub iterations: usize,
}

/// Random sample consensus over [`PoseCorrespondence`]s.
///
/// The random generator is injected, so a seeded generator gives reproducible runs.
pub struct Ransac<R> {
    config: RansacConfig,
    rng: R,
    check: Option<PoseCheck>,
}

impl<R> Ransac<R>
where
    R: Rng,
{
    pub fn new(config: RansacConfig, rng: R) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng,
            check: None,
        })
    }

    /// Rejects every candidate pose for which `check` returns `false`.
    #[must_use]
    pub fn with_check(self, check: PoseCheck) -> Self {
        Self {
            check: Some(check),
            ..self
        }
    }

    pub fn set_check(&mut self, check: Option<PoseCheck>) {
        self.check = check;
    }

    pub fn config(&self) -> &RansacConfig {
        &self.config
    }

    /// Replaces the configuration while keeping the generator state.
    pub fn reconfigure(&mut self, config: RansacConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Replaces the generator, e.g. to reseed between runs.
    pub fn set_rng(&mut self, rng: R) {
        self.rng = rng;
    }

    /// Searches for the pose with the largest inlier set.
    ///
    /// The best candidate is only replaced by one with strictly more inliers, and the search
    /// stops early once every correspondence is an inlier.
    pub fn estimate<E>(
        &mut self,
        estimator: &E,
        data: &[PoseCorrespondence],
        metric: &InlierMetric,
    ) -> Result<RansacOutcome>
    where
        E: Estimator<PoseCorrespondence, Model = ObjectToCamera>,
    {
        if data.len() < E::MIN_SAMPLES {
            return Err(Error::InsufficientCorrespondences {
                found: data.len(),
                required: E::MIN_SAMPLES,
            });
        }
        let required = self.config.consensus.required(data.len());

        let mut best: Option<(ObjectToCamera, Vec<usize>)> = None;
        let mut iterations = 0;
        while iterations < self.config.max_iterations {
            iterations += 1;
            let sample: Vec<PoseCorrespondence> =
                index::sample(&mut self.rng, data.len(), E::MIN_SAMPLES)
                    .into_iter()
                    .map(|ix| data[ix])
                    .collect();

            for pose in estimator.estimate(sample.iter().copied()) {
                if let Some(check) = &self.check {
                    if !check(&pose) {
                        continue;
                    }
                }
                let inliers = self.inliers(&pose, data, metric);
                let best_count = best.as_ref().map_or(0, |(_, inliers)| inliers.len());
                if inliers.len() > best_count {
                    trace!(
                        "ransac iteration {}: consensus improved to {} of {}",
                        iterations,
                        inliers.len(),
                        data.len()
                    );
                    best = Some((pose, inliers));
                }
            }

            if best
                .as_ref()
                .map_or(false, |(_, inliers)| inliers.len() == data.len())
            {
                break;
            }
        }

        match best {
            Some((pose, inliers)) if inliers.len() >= required => {
                debug!(
                    "ransac accepted a pose with {} of {} inliers after {} iterations",
                    inliers.len(),
                    data.len(),
                    iterations
                );
                Ok(RansacOutcome {
                    pose,
                    inliers,
                    iterations,
                })
            }
            best => {
                let inliers = best.map_or(0, |(_, inliers)| inliers.len());
                debug!(
                    "ransac failed: best consensus {} of {}, {} required",
                    inliers,
                    data.len(),
                    required
                );
                Err(Error::PoseNotFound { inliers, required })
            }
        }
    }

    fn inliers(
        &self,
        pose: &ObjectToCamera,
        data: &[PoseCorrespondence],
        metric: &InlierMetric,
    ) -> Vec<usize> {
        data.iter()
            .enumerate()
            .filter(|(_, d)| metric.residual(pose, d) < self.config.threshold)
            .map(|(ix, _)| ix)
            .collect()
    }
}
