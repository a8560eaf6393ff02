use crate::{
    ConsensusCriterion, InlierMetric, LambdaTwist, PoseCheck, Ransac, RansacConfig,
    VirtualVisualServoing,
};
use keypose_core::{
    ensure_positive, nalgebra::Matrix6, CameraIntrinsics, ObjectToCamera, PoseCorrespondence,
    Result,
};
use log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

/// How candidate poses are scored and whether they are refined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoseMethod {
    /// Closed-form P3P candidates scored by pixel reprojection error. No refinement.
    ClosedForm {
        /// Inlier threshold in pixels.
        reprojection_error: f64,
    },
    /// P3P candidates scored on the normalized image plane, the best one refined
    /// on its inliers by virtual visual servoing.
    VirtualVisualServoing {
        /// Inlier threshold in normalized image plane units.
        threshold: f64,
    },
}

impl PoseMethod {
    fn threshold(&self) -> f64 {
        match *self {
            PoseMethod::ClosedForm { reprojection_error } => reprojection_error,
            PoseMethod::VirtualVisualServoing { threshold } => threshold,
        }
    }

    pub fn validate(self) -> Result<Self> {
        match self {
            PoseMethod::ClosedForm { reprojection_error } => {
                ensure_positive("ransac_reprojection_error", reprojection_error)?;
            }
            PoseMethod::VirtualVisualServoing { threshold } => {
                ensure_positive("ransac_threshold", threshold)?;
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSettings {
    pub method: PoseMethod,
    pub max_iterations: usize,
    pub consensus: ConsensusCriterion,
    /// Only honored by [`PoseMethod::VirtualVisualServoing`].
    pub compute_covariance: bool,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            method: PoseMethod::VirtualVisualServoing { threshold: 0.01 },
            max_iterations: 200,
            consensus: ConsensusCriterion::MinInliers(100),
            compute_covariance: false,
        }
    }
}

impl PoseSettings {
    fn ransac_config(&self) -> RansacConfig {
        RansacConfig {
            max_iterations: self.max_iterations,
            threshold: self.method.threshold(),
            consensus: self.consensus,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.method.validate()?;
        self.ransac_config().validate()
    }
}

/// A robustly estimated pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSolution {
    pub pose: ObjectToCamera,
    /// Indices of the input correspondences consistent with the pose, increasing.
    pub inliers: Vec<usize>,
    /// Every other input index, increasing.
    pub outliers: Vec<usize>,
    /// Mean pixel reprojection error over the inliers at the final pose.
    pub reprojection_error: f64,
    /// Only produced by the virtual visual servoing method with covariance enabled.
    pub covariance: Option<Matrix6<f64>>,
    pub iterations: usize,
}

/// RANSAC over lambda twist P3P, optionally followed by virtual visual servoing.
pub struct PoseEstimator<R = Pcg64> {
    settings: PoseSettings,
    ransac: Ransac<R>,
    solver: LambdaTwist,
    vvs: VirtualVisualServoing,
    covariance_warning_issued: bool,
}

impl PoseEstimator<Pcg64> {
    /// Creates an estimator whose generator is seeded with `seed`, or from entropy when `None`.
    pub fn seeded(settings: PoseSettings, seed: Option<u64>) -> Result<Self> {
        Self::new(settings, seeded_rng(seed))
    }

    /// Restarts the generator from `seed`, or from entropy when `None`.
    pub fn reseed(&mut self, seed: Option<u64>) {
        self.set_rng(seeded_rng(seed));
    }
}

fn seeded_rng(seed: Option<u64>) -> Pcg64 {
    match seed {
        Some(seed) => Pcg64::seed_from_u64(seed),
        None => Pcg64::from_entropy(),
    }
}

impl<R> PoseEstimator<R>
where
    R: Rng,
{
    pub fn new(settings: PoseSettings, rng: R) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            ransac: Ransac::new(settings.ransac_config(), rng)?,
            solver: LambdaTwist::new(),
            vvs: VirtualVisualServoing::new(),
            covariance_warning_issued: false,
        })
    }

    pub fn settings(&self) -> &PoseSettings {
        &self.settings
    }

    /// Replaces the settings. On failure the previous settings stay in force.
    pub fn set_settings(&mut self, settings: PoseSettings) -> Result<()> {
        settings.validate()?;
        self.ransac.reconfigure(settings.ransac_config())?;
        if settings != self.settings {
            self.covariance_warning_issued = false;
        }
        self.settings = settings;
        Ok(())
    }

    pub fn set_rng(&mut self, rng: R) {
        self.ransac.set_rng(rng);
    }

    pub fn set_pose_check(&mut self, check: Option<PoseCheck>) {
        self.ransac.set_check(check);
    }

    #[must_use]
    pub fn vvs(self, vvs: VirtualVisualServoing) -> Self {
        Self { vvs, ..self }
    }

    /// Estimates the pose explaining the most correspondences.
    ///
    /// `intrinsics` converts the normalized correspondences back to pixels, both for the
    /// closed-form inlier test and for the reported reprojection error.
    pub fn estimate(
        &mut self,
        data: &[PoseCorrespondence],
        intrinsics: &CameraIntrinsics,
    ) -> Result<PoseSolution> {
        if self.settings.compute_covariance && !self.covariance_warning_issued {
            if let PoseMethod::ClosedForm { .. } = self.settings.method {
                warn!("pose covariance is only computed by the virtual visual servoing method");
                self.covariance_warning_issued = true;
            }
        }

        let metric = match self.settings.method {
            PoseMethod::ClosedForm { .. } => InlierMetric::Pixel(*intrinsics),
            PoseMethod::VirtualVisualServoing { .. } => InlierMetric::Normalized,
        };
        let outcome = self.ransac.estimate(&self.solver, data, &metric)?;

        let (pose, inliers, covariance) = match self.settings.method {
            PoseMethod::ClosedForm { .. } => (outcome.pose, outcome.inliers, None),
            PoseMethod::VirtualVisualServoing { threshold } => {
                let consensus: Vec<PoseCorrespondence> =
                    outcome.inliers.iter().map(|&ix| data[ix]).collect();
                let refined =
                    self.vvs
                        .refine(outcome.pose, &consensus, self.settings.compute_covariance);
                // The refined pose is re-scored so the partition matches the returned pose.
                let inliers: Vec<usize> = (0..data.len())
                    .filter(|&ix| metric.residual(&refined.pose, &data[ix]) < threshold)
                    .collect();
                if inliers.len() >= outcome.inliers.len() {
                    (refined.pose, inliers, refined.covariance)
                } else {
                    debug!("refinement lost inliers, keeping the consensus pose");
                    (outcome.pose, outcome.inliers, None)
                }
            }
        };

        let outliers = complement(&inliers, data.len());
        let reprojection_error = mean_pixel_error(&pose, &inliers, data, intrinsics);
        debug!(
            "pose estimated with {} inliers, {} outliers, mean reprojection error {:.3}px",
            inliers.len(),
            outliers.len(),
            reprojection_error
        );
        Ok(PoseSolution {
            pose,
            inliers,
            outliers,
            reprojection_error,
            covariance,
            iterations: outcome.iterations,
        })
    }
}

/// Mean pixel distance between the observations and their reprojections.
fn mean_pixel_error(
    pose: &ObjectToCamera,
    indices: &[usize],
    data: &[PoseCorrespondence],
    intrinsics: &CameraIntrinsics,
) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    let metric = InlierMetric::Pixel(*intrinsics);
    let total: f64 = indices
        .iter()
        .map(|&ix| metric.residual(pose, &data[ix]))
        .sum();
    total / indices.len() as f64
}

/// The sorted indices in `0..len` missing from the sorted `indices`.
fn complement(indices: &[usize], len: usize) -> Vec<usize> {
    let mut members = indices.iter().peekable();
    (0..len)
        .filter(|ix| {
            if members.peek() == Some(&ix) {
                members.next();
                false
            } else {
                true
            }
        })
        .collect()
}
