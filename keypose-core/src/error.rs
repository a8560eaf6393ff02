use thiserror::Error;

/// Errors produced anywhere in the recognition and pose pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Two collections that must stay index-aligned have different sizes.
    #[error("size mismatch in {what}: expected {expected}, found {found}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    /// A configuration value is outside of its valid domain.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    /// An operation was requested before the state it depends on exists.
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("insufficient correspondences: got {found}, need at least {required}")]
    InsufficientCorrespondences { found: usize, required: usize },
    /// The best consensus found did not reach the acceptance floor.
    #[error("no pose found: best consensus had {inliers} inliers, {required} required")]
    PoseNotFound { inliers: usize, required: usize },
    #[error("no matches survived filtering")]
    NoMatches,
    /// Learning data could not be decoded. The store is never partially modified.
    #[error("corrupt learning data: {0}")]
    CorruptFormat(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidParameter`].
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Checks that a configuration value is finite and strictly positive.
pub fn ensure_positive(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::invalid(name, format!("must be > 0, got {}", value)))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
