use crate::DescriptorMatcher;
use float_ord::FloatOrd;
use keypose_core::{Correspondence, DescriptorMatrix, Descriptors, Error, RawMatches, Result};
use log::trace;

/// The distance used to compare descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    L1,
    L2,
    /// Number of differing bits. Only defined for binary descriptors.
    Hamming,
}

/// Exhaustive nearest neighbor search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BruteForceMatcher {
    pub norm: Norm,
    /// Keep a match only if the query is also the nearest query of its training descriptor.
    /// Only applies to `k = 1` searches.
    pub cross_check: bool,
}

impl BruteForceMatcher {
    pub fn new(norm: Norm) -> Self {
        Self {
            norm,
            cross_check: false,
        }
    }

    pub fn l1() -> Self {
        Self::new(Norm::L1)
    }

    pub fn l2() -> Self {
        Self::new(Norm::L2)
    }

    pub fn hamming() -> Self {
        Self::new(Norm::Hamming)
    }

    /// The built-in matcher registered under `name` by
    /// [`crate::AdapterRegistry::with_brute_force_matchers`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "BruteForce" => Some(Self::l2()),
            "BruteForce-L1" => Some(Self::l1()),
            "BruteForce-Hamming" => Some(Self::hamming()),
            _ => None,
        }
    }

    #[must_use]
    pub fn cross_check(self, cross_check: bool) -> Self {
        Self {
            cross_check,
            ..self
        }
    }

    fn match_rows<T: Copy>(
        &self,
        train: &DescriptorMatrix<T>,
        query: &DescriptorMatrix<T>,
        k: usize,
        distance: impl Fn(&[T], &[T]) -> f32,
    ) -> Vec<Correspondence> {
        let mut matches: Vec<Correspondence> = query
            .rows()
            .enumerate()
            .filter_map(|(query_ix, q)| {
                let ((best, d1), d2) = nearest_two(train.rows().map(|t| distance(t, q)))?;
                let correspondence = Correspondence::new(query_ix, best, d1);
                Some(match d2 {
                    Some(d2) if k >= 2 => correspondence.with_second(d2),
                    _ => correspondence,
                })
            })
            .collect();

        if self.cross_check && k == 1 {
            matches.retain(|m| {
                let t = train.row(m.train);
                let best_query = nearest_two(query.rows().map(|q| distance(t, q)));
                best_query.map(|((ix, _), _)| ix) == Some(m.query)
            });
        }
        matches
    }
}

/// The index and distance of the nearest candidate and the distance of the second nearest.
///
/// Ties go to the lowest index.
fn nearest_two(distances: impl Iterator<Item = f32>) -> Option<((usize, f32), Option<f32>)> {
    let mut best: Option<(usize, f32)> = None;
    let mut second: Option<f32> = None;
    for (ix, d) in distances.enumerate() {
        match best {
            Some((_, b)) if FloatOrd(d) >= FloatOrd(b) => {
                if second.map_or(true, |s| FloatOrd(d) < FloatOrd(s)) {
                    second = Some(d);
                }
            }
            _ => {
                second = best.map(|(_, b)| b);
                best = Some((ix, d));
            }
        }
    }
    best.map(|best| (best, second))
}

fn hamming(a: &[u8], b: &[u8]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(a, b)| (a ^ b).count_ones())
        .sum::<u32>() as f32
}

/// L1 or L2 distance.
fn norm_distance<T: Copy + Into<f64>>(norm: Norm, a: &[T], b: &[T]) -> f32 {
    let diffs = a
        .iter()
        .zip(b)
        .map(|(&a, &b)| Into::<f64>::into(a) - Into::<f64>::into(b));
    if norm == Norm::L1 {
        diffs.map(f64::abs).sum::<f64>() as f32
    } else {
        diffs.map(|d| d * d).sum::<f64>().sqrt() as f32
    }
}

impl DescriptorMatcher for BruteForceMatcher {
    fn knn_match(&self, train: &Descriptors, query: &Descriptors, k: usize) -> Result<RawMatches> {
        if k == 0 {
            return Err(Error::invalid("k", "must be > 0"));
        }
        train.check_compatible(query)?;
        let norm = self.norm;
        let matches = match (train, query, norm) {
            (Descriptors::Binary(t), Descriptors::Binary(q), Norm::Hamming) => {
                self.match_rows(t, q, k, hamming)
            }
            (Descriptors::Binary(t), Descriptors::Binary(q), _) => {
                self.match_rows(t, q, k, |a, b| norm_distance(norm, a, b))
            }
            (Descriptors::Float(t), Descriptors::Float(q), Norm::L1 | Norm::L2) => {
                self.match_rows(t, q, k, |a, b| norm_distance(norm, a, b))
            }
            _ => {
                return Err(Error::invalid(
                    "norm",
                    "the hamming norm requires binary descriptors",
                ))
            }
        };
        trace!(
            "brute force matched {} query descriptors against {} training descriptors",
            query.len(),
            train.len()
        );
        Ok(RawMatches::new(k, matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(rows: &[[u8; 2]]) -> Descriptors {
        DescriptorMatrix::from_rows(2, rows).unwrap().into()
    }

    #[test]
    fn hamming_nearest_and_second() {
        let train = binary(&[[0b0000_0000, 0], [0b0000_0111, 0], [0b1111_1111, 0xff]]);
        let query = binary(&[[0b0000_0001, 0], [0b1111_1110, 0xff]]);
        let raw = BruteForceMatcher::hamming()
            .knn_match(&train, &query, 2)
            .unwrap();
        assert_eq!(raw.k, 2);
        assert_eq!(raw.matches[0], Correspondence::new(0, 0, 1.0).with_second(2.0));
        assert_eq!(raw.matches[1], Correspondence::new(1, 2, 1.0).with_second(14.0));
    }

    #[test]
    fn cross_check_drops_one_sided_matches() {
        let train = binary(&[[0, 0], [0xff, 0xff]]);
        let query = binary(&[[0, 0], [1, 0]]);
        let raw = BruteForceMatcher::hamming()
            .cross_check(true)
            .knn_match(&train, &query, 1)
            .unwrap();
        assert_eq!(raw.matches, vec![Correspondence::new(0, 0, 0.0)]);
    }

    #[test]
    fn ties_go_to_the_lowest_training_index() {
        let train = binary(&[[0xff, 0], [0x0f, 0], [0x0f, 0], [0xf0, 0]]);
        let query = binary(&[[0x0f, 0], [0x00, 0]]);
        let raw = BruteForceMatcher::hamming()
            .knn_match(&train, &query, 2)
            .unwrap();
        assert_eq!(raw.matches[0], Correspondence::new(0, 1, 0.0).with_second(0.0));
        assert_eq!(raw.matches[1], Correspondence::new(1, 1, 4.0).with_second(4.0));
    }

    #[test]
    fn l1_over_binary_descriptors() {
        let train = binary(&[[10, 0], [0, 3]]);
        let query = binary(&[[1, 1]]);
        let raw = BruteForceMatcher::l1().knn_match(&train, &query, 2).unwrap();
        assert_eq!(raw.matches, vec![Correspondence::new(0, 1, 3.0).with_second(10.0)]);
    }

    #[test]
    fn hamming_rejects_float_descriptors() {
        let float: Descriptors = DescriptorMatrix::from_rows(2, [[0.0f32, 1.0]])
            .unwrap()
            .into();
        assert!(BruteForceMatcher::hamming()
            .knn_match(&float, &float, 1)
            .is_err());
        let raw = BruteForceMatcher::l2().knn_match(&float, &float, 1).unwrap();
        assert_eq!(raw.matches, vec![Correspondence::new(0, 0, 0.0)]);
    }
}
