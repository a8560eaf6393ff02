use crate::{Error, Result};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The element type of a descriptor matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum DescriptorKind {
    /// Bit strings packed into bytes, compared with the Hamming distance.
    Binary,
    /// Floating point vectors, compared with L1 or L2 distances.
    Float,
}

impl DescriptorKind {
    /// Size in bytes of one element.
    pub fn element_size(self) -> usize {
        match self {
            DescriptorKind::Binary => core::mem::size_of::<u8>(),
            DescriptorKind::Float => core::mem::size_of::<f32>(),
        }
    }
}

/// A row-major matrix with one fixed-width descriptor per row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct DescriptorMatrix<T> {
    width: usize,
    data: Vec<T>,
}

impl<T: Copy> DescriptorMatrix<T> {
    /// Creates an empty matrix whose rows will have `width` elements.
    pub fn new(width: usize) -> Self {
        Self {
            width,
            data: Vec::new(),
        }
    }

    /// Wraps row-major `data`, which must hold a whole number of rows.
    pub fn from_vec(width: usize, data: Vec<T>) -> Result<Self> {
        if width == 0 {
            return Err(Error::invalid("width", "descriptor width must be > 0"));
        }
        if data.len() % width != 0 {
            return Err(Error::SizeMismatch {
                what: "descriptor data",
                expected: (data.len() / width + 1) * width,
                found: data.len(),
            });
        }
        Ok(Self { width, data })
    }

    /// Builds a matrix from rows which must all have the same length.
    pub fn from_rows<I, R>(width: usize, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[T]>,
    {
        let mut data = Vec::new();
        for row in rows {
            let row = row.as_ref();
            if row.len() != width {
                return Err(Error::SizeMismatch {
                    what: "descriptor row",
                    expected: width,
                    found: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::from_vec(width, data)
    }

    /// Number of rows (descriptors).
    pub fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row(&self, index: usize) -> &[T] {
        &self.data[index * self.width..(index + 1) * self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.data.chunks_exact(self.width.max(1))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Appends the rows of `other`, which must have the same width.
    pub fn extend(&mut self, other: &Self) -> Result<()> {
        if other.width != self.width {
            return Err(Error::SizeMismatch {
                what: "descriptor width",
                expected: self.width,
                found: other.width,
            });
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }
}

/// Descriptors of a keypoint collection. Row `i` describes keypoint `i`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum Descriptors {
    Binary(DescriptorMatrix<u8>),
    Float(DescriptorMatrix<f32>),
}

impl Descriptors {
    /// Creates an empty descriptor matrix of the given kind and width.
    pub fn empty(kind: DescriptorKind, width: usize) -> Self {
        match kind {
            DescriptorKind::Binary => Descriptors::Binary(DescriptorMatrix::new(width)),
            DescriptorKind::Float => Descriptors::Float(DescriptorMatrix::new(width)),
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        match self {
            Descriptors::Binary(_) => DescriptorKind::Binary,
            Descriptors::Float(_) => DescriptorKind::Float,
        }
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Binary(m) => m.len(),
            Descriptors::Float(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements per descriptor.
    pub fn width(&self) -> usize {
        match self {
            Descriptors::Binary(m) => m.width(),
            Descriptors::Float(m) => m.width(),
        }
    }

    /// Fails with [`Error::SizeMismatch`] unless `other` has the same element type and width.
    pub fn check_compatible(&self, other: &Descriptors) -> Result<()> {
        if self.kind() != other.kind() {
            return Err(Error::SizeMismatch {
                what: "descriptor element size",
                expected: self.kind().element_size(),
                found: other.kind().element_size(),
            });
        }
        if self.width() != other.width() {
            return Err(Error::SizeMismatch {
                what: "descriptor width",
                expected: self.width(),
                found: other.width(),
            });
        }
        Ok(())
    }

    /// Appends the rows of `other`. Nothing is modified on failure.
    pub fn append(&mut self, other: &Descriptors) -> Result<()> {
        self.check_compatible(other)?;
        match (self, other) {
            (Descriptors::Binary(a), Descriptors::Binary(b)) => a.extend(b),
            (Descriptors::Float(a), Descriptors::Float(b)) => a.extend(b),
            _ => unreachable!("descriptor kinds were checked to match"),
        }
    }
}

impl From<DescriptorMatrix<u8>> for Descriptors {
    fn from(matrix: DescriptorMatrix<u8>) -> Self {
        Descriptors::Binary(matrix)
    }
}

impl From<DescriptorMatrix<f32>> for Descriptors {
    fn from(matrix: DescriptorMatrix<f32>) -> Self {
        Descriptors::Float(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_row_major() {
        let matrix = DescriptorMatrix::from_vec(2, vec![1u8, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(matrix.len(), 3);
        assert_eq!(matrix.row(1), &[3, 4]);
        assert_eq!(matrix.rows().count(), 3);
    }

    #[test]
    fn ragged_data_is_rejected() {
        assert!(matches!(
            DescriptorMatrix::from_vec(4, vec![0u8; 6]),
            Err(Error::SizeMismatch { .. })
        ));
        assert!(matches!(
            DescriptorMatrix::from_rows(2, [vec![0.0f32, 1.0], vec![2.0]]),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn append_rejects_other_kind_and_width() {
        let mut binary: Descriptors = DescriptorMatrix::from_vec(2, vec![1u8, 2]).unwrap().into();
        let float: Descriptors = DescriptorMatrix::from_vec(2, vec![1.0f32, 2.0])
            .unwrap()
            .into();
        let wide: Descriptors = DescriptorMatrix::from_vec(3, vec![1u8, 2, 3]).unwrap().into();
        assert!(binary.append(&float).is_err());
        assert!(binary.append(&wide).is_err());
        assert_eq!(binary.len(), 1);

        let more: Descriptors = DescriptorMatrix::from_vec(2, vec![3u8, 4]).unwrap().into();
        binary.append(&more).unwrap();
        assert_eq!(binary.len(), 2);
    }
}
