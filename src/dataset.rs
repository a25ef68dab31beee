//! Point storage with stable IDs.
//!
//! Points live in one row-major buffer. A point's ID is its row number, so
//! IDs are never reused: removal only tombstones the row, and the storage
//! persists until the dataset itself is dropped.

use std::ops::Range;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::error::{AnnError, Result};

/// Content summary used to check that a re-supplied dataset matches the one
/// an index was saved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFingerprint {
    pub rows: usize,
    pub cols: usize,
    pub checksum: u32,
}

/// A mutable collection of fixed-dimensionality points.
#[derive(Debug, Clone)]
pub struct Dataset<T: Element> {
    data: Vec<T>,
    cols: usize,
    removed: Vec<bool>,
    removed_count: usize,
}

impl<T: Element> Dataset<T> {
    /// Create an empty dataset of the given dimensionality.
    pub fn new(cols: usize) -> Result<Self> {
        if cols == 0 {
            return Err(AnnError::invalid("Dimensionality must be at least 1"));
        }
        Ok(Self {
            data: Vec::new(),
            cols,
            removed: Vec::new(),
            removed_count: 0,
        })
    }

    /// Take ownership of a row-major buffer holding `data.len() / cols` points.
    pub fn from_flat(cols: usize, data: Vec<T>) -> Result<Self> {
        if cols == 0 {
            return Err(AnnError::invalid("Dimensionality must be at least 1"));
        }
        if data.len() % cols != 0 {
            return Err(AnnError::invalid(format!(
                "Buffer of {} elements is not divisible into rows of {}",
                data.len(),
                cols
            )));
        }
        let rows = data.len() / cols;
        Ok(Self {
            data,
            cols,
            removed: vec![false; rows],
            removed_count: 0,
        })
    }

    /// Copy a `rows x cols` row-major buffer.
    pub fn from_rows(rows: usize, cols: usize, data: &[T]) -> Result<Self> {
        check_shape(rows, cols, data.len())?;
        Self::from_flat(cols, data.to_vec())
    }

    /// Copy a 2-D array view (one point per row).
    pub fn from_array(view: ArrayView2<'_, T>) -> Result<Self> {
        let cols = view.ncols();
        let data: Vec<T> = view.iter().copied().collect();
        Self::from_flat(cols, data)
    }

    /// Dimensionality of every point.
    pub fn dimension(&self) -> usize {
        self.cols
    }

    /// Number of live points.
    pub fn len(&self) -> usize {
        self.removed.len() - self.removed_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored rows, including tombstoned ones.
    pub fn rows(&self) -> usize {
        self.removed.len()
    }

    /// Row data regardless of tombstone state. Panics on an out-of-range ID.
    #[inline]
    pub(crate) fn row(&self, id: usize) -> &[T] {
        &self.data[id * self.cols..(id + 1) * self.cols]
    }

    /// Get a live point by ID.
    pub fn get(&self, id: usize) -> Option<&[T]> {
        if self.is_live(id) {
            Some(self.row(id))
        } else {
            None
        }
    }

    #[inline]
    pub fn is_live(&self, id: usize) -> bool {
        matches!(self.removed.get(id), Some(false))
    }

    /// IDs of all live points in ascending order.
    pub fn live_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.removed
            .iter()
            .enumerate()
            .filter_map(|(id, &gone)| if gone { None } else { Some(id) })
    }

    /// IDs of all tombstoned points in ascending order.
    pub fn removed_ids(&self) -> Vec<usize> {
        self.removed
            .iter()
            .enumerate()
            .filter_map(|(id, &gone)| if gone { Some(id) } else { None })
            .collect()
    }

    /// The raw row-major buffer, tombstoned rows included.
    pub fn as_flat(&self) -> &[T] {
        &self.data
    }

    /// Append points given as a row-major buffer. Returns the assigned IDs.
    pub fn push_rows(&mut self, points: &[T]) -> Result<Range<usize>> {
        if points.len() % self.cols != 0 {
            return Err(AnnError::DimensionMismatch {
                expected: self.cols,
                actual: points.len() % self.cols,
            });
        }
        let start = self.rows();
        let added = points.len() / self.cols;
        self.data
            .try_reserve(points.len())
            .map_err(|e| AnnError::OutOfMemory(e.to_string()))?;
        self.data.extend_from_slice(points);
        self.removed.resize(start + added, false);
        Ok(start..start + added)
    }

    /// Drop every row from `rows` on, undoing a failed append.
    pub(crate) fn truncate(&mut self, rows: usize) {
        if rows >= self.rows() {
            return;
        }
        let dropped = self.removed[rows..].iter().filter(|&&gone| gone).count();
        self.removed_count -= dropped;
        self.removed.truncate(rows);
        self.data.truncate(rows * self.cols);
    }

    /// Tombstone a live point.
    pub fn remove(&mut self, id: usize) -> Result<()> {
        match self.removed.get_mut(id) {
            Some(gone) if !*gone => {
                *gone = true;
                self.removed_count += 1;
                Ok(())
            }
            _ => Err(AnnError::NotFound { id }),
        }
    }

    /// Checksum over shape and the content of every stored row, tombstoned
    /// rows included; tombstones are validated separately on load.
    pub fn fingerprint(&self) -> DatasetFingerprint {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = Vec::with_capacity(8);
        for &v in &self.data {
            buf.clear();
            v.write_le(&mut buf);
            hasher.update(&buf);
        }
        DatasetFingerprint {
            rows: self.rows(),
            cols: self.cols,
            checksum: hasher.finalize(),
        }
    }

    /// Bytes held by the point buffer and tombstone map.
    pub fn used_memory(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<T>() + self.removed.capacity()
    }

    /// Copy the selected rows into a new dataset (IDs are renumbered).
    pub(crate) fn subset(&self, ids: &[usize]) -> Self {
        let mut data = Vec::with_capacity(ids.len() * self.cols);
        for &id in ids {
            data.extend_from_slice(self.row(id));
        }
        Self {
            data,
            cols: self.cols,
            removed: vec![false; ids.len()],
            removed_count: 0,
        }
    }
}

/// Validate a `rows x cols` buffer description.
pub(crate) fn check_shape(rows: usize, cols: usize, len: usize) -> Result<()> {
    if cols == 0 {
        return Err(AnnError::invalid("Column count must be at least 1"));
    }
    if rows.checked_mul(cols) != Some(len) {
        return Err(AnnError::invalid(format!(
            "Buffer of {} elements does not hold {} rows of {} columns",
            len, rows, cols
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Dataset<f32> {
        Dataset::from_rows(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
    }

    #[test]
    fn test_rows_and_get() {
        let ds = sample();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.dimension(), 2);
        assert_eq!(ds.get(1), Some(&[3.0, 4.0][..]));
        assert_eq!(ds.get(3), None);
    }

    #[test]
    fn test_from_array() {
        let arr = array![[1u8, 2, 3], [4, 5, 6]];
        let ds = Dataset::from_array(arr.view()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1), Some(&[4u8, 5, 6][..]));
    }

    #[test]
    fn test_bad_shapes() {
        assert!(Dataset::<f32>::from_rows(2, 2, &[1.0, 2.0, 3.0]).is_err());
        assert!(Dataset::<f32>::new(0).is_err());
        let mut ds = sample();
        assert!(matches!(
            ds.push_rows(&[1.0, 2.0, 3.0]),
            Err(AnnError::DimensionMismatch { expected: 2, .. })
        ));
    }

    #[test]
    fn test_remove_tombstones_without_reuse() {
        let mut ds = sample();
        ds.remove(1).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows(), 3);
        assert!(!ds.is_live(1));
        assert_eq!(ds.live_ids().collect::<Vec<_>>(), vec![0, 2]);
        assert!(matches!(ds.remove(1), Err(AnnError::NotFound { id: 1 })));
        assert!(matches!(ds.remove(42), Err(AnnError::NotFound { id: 42 })));

        let ids = ds.push_rows(&[7.0, 8.0]).unwrap();
        assert_eq!(ids, 3..4);
        assert_eq!(ds.get(3), Some(&[7.0, 8.0][..]));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = sample();
        let b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = Dataset::from_rows(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.5]).unwrap();
        assert_ne!(a.fingerprint().checksum, c.fingerprint().checksum);
    }

    #[test]
    fn test_fingerprint_covers_tombstoned_rows() {
        let mut a = sample();
        let before = a.fingerprint();
        a.remove(2).unwrap();
        assert_eq!(a.fingerprint(), before);

        let mut c = Dataset::from_rows(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.5]).unwrap();
        c.remove(2).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_truncate_drops_rows_and_tombstones() {
        let mut ds = sample();
        ds.push_rows(&[7.0, 8.0, 9.0, 10.0]).unwrap();
        ds.remove(1).unwrap();
        ds.remove(4).unwrap();
        ds.truncate(3);
        assert_eq!(ds.rows(), 3);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.removed_ids(), vec![1]);
        assert_eq!(ds.as_flat().len(), 6);
        assert_eq!(ds.fingerprint(), {
            let mut fresh = sample();
            fresh.remove(1).unwrap();
            fresh.fingerprint()
        });
        ds.truncate(10);
        assert_eq!(ds.rows(), 3);
        assert_eq!(ds.push_rows(&[0.0, 0.0]).unwrap(), 3..4);
    }

    #[test]
    fn test_subset_renumbers() {
        let ds = sample();
        let sub = ds.subset(&[2, 0]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.get(0), Some(&[5.0, 6.0][..]));
    }
}
