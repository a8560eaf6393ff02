#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A match between a query descriptor and a training descriptor.
///
/// Indices are valid against the original query and training collections,
/// both before and after filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Correspondence {
    pub query: usize,
    pub train: usize,
    /// Descriptor distance to the nearest training neighbor.
    pub distance: f32,
    /// Distance to the second nearest training neighbor, when k-NN matching ran with `k >= 2`
    /// and a second neighbor existed.
    pub second_distance: Option<f32>,
}

impl Correspondence {
    pub fn new(query: usize, train: usize, distance: f32) -> Self {
        Self {
            query,
            train,
            distance,
            second_distance: None,
        }
    }

    #[must_use]
    pub fn with_second(self, second_distance: f32) -> Self {
        Self {
            second_distance: Some(second_distance),
            ..self
        }
    }
}

/// The output of a descriptor matcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMatches {
    /// The number of neighbors that were searched for each query descriptor.
    pub k: usize,
    /// At most one entry per query descriptor.
    pub matches: Vec<Correspondence>,
}

impl RawMatches {
    pub fn new(k: usize, matches: Vec<Correspondence>) -> Self {
        Self { k, matches }
    }

    /// Whether a second neighbor was searched for, which ratio tests require.
    pub fn has_second_neighbors(&self) -> bool {
        self.k >= 2
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}
