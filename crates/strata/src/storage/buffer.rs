//! Column-major in-memory buffer of points not yet persisted.

use crate::error::{Result, StrataError};

/// Time-ordered, column-major point buffer.
///
/// Column 0 holds times and is strictly increasing; every other column has
/// the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointBuffer {
    columns: Vec<Vec<i64>>,
}

impl PointBuffer {
    /// Creates an empty buffer with `width` columns, time included.
    pub fn new(width: usize) -> Self {
        Self {
            columns: vec![Vec::new(); width.max(1)],
        }
    }

    /// Builds a buffer from columns that are already ordered.
    pub fn from_columns(columns: Vec<Vec<i64>>) -> Result<Self> {
        let Some(times) = columns.first() else {
            return Err(StrataError::ColumnMismatch {
                expected: 1,
                actual: 0,
            });
        };
        for column in &columns {
            if column.len() != times.len() {
                return Err(StrataError::ColumnMismatch {
                    expected: times.len(),
                    actual: column.len(),
                });
            }
        }
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StrataError::Decode("buffer times not strictly increasing".into()));
        }
        Ok(Self { columns })
    }

    /// Number of columns, time included.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Number of buffered points.
    pub fn len(&self) -> usize {
        self.columns[0].len()
    }

    /// Returns true if no points are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The time column.
    pub fn times(&self) -> &[i64] {
        &self.columns[0]
    }

    /// Column `index` (0 is time).
    pub fn column(&self, index: usize) -> &[i64] {
        &self.columns[index]
    }

    /// All columns.
    pub fn columns(&self) -> &[Vec<i64>] {
        &self.columns
    }

    /// Time of the oldest buffered point.
    pub fn first_time(&self) -> Option<i64> {
        self.columns[0].first().copied()
    }

    /// Time of the newest buffered point.
    pub fn last_time(&self) -> Option<i64> {
        self.columns[0].last().copied()
    }

    /// Number of leading points with time `<= time`.
    pub fn count_until(&self, time: i64) -> usize {
        self.columns[0].partition_point(|&t| t <= time)
    }

    /// Stores values for the point at `time`.
    ///
    /// `values` pairs a column index (1-based) with its value. An existing
    /// point keeps the columns not mentioned; a new point starts zero-filled.
    /// Returns true if a new point was created.
    pub fn insert(&mut self, time: i64, values: &[(usize, i64)]) -> Result<bool> {
        for &(index, _) in values {
            if index == 0 || index >= self.columns.len() {
                return Err(StrataError::ColumnMismatch {
                    expected: self.columns.len(),
                    actual: index + 1,
                });
            }
        }
        let (slot, created) = match self.columns[0].binary_search(&time) {
            Ok(slot) => (slot, false),
            Err(slot) => {
                self.columns[0].insert(slot, time);
                for column in self.columns.iter_mut().skip(1) {
                    column.insert(slot, 0);
                }
                (slot, true)
            }
        };
        for &(index, value) in values {
            self.columns[index][slot] = value;
        }
        Ok(created)
    }

    /// Stores a full row (`row[0]` is the time), replacing any existing point.
    pub fn insert_row(&mut self, row: &[i64]) -> Result<bool> {
        if row.len() != self.columns.len() {
            return Err(StrataError::ColumnMismatch {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        let values: Vec<(usize, i64)> = row.iter().copied().enumerate().skip(1).collect();
        self.insert(row[0], &values)
    }

    /// Removes and returns the first `n` points as columns.
    pub fn drain_front(&mut self, n: usize) -> Vec<Vec<i64>> {
        let n = n.min(self.len());
        self.columns
            .iter_mut()
            .map(|c| c.drain(..n).collect())
            .collect()
    }

    /// Puts points back in front of the buffer.
    ///
    /// The caller guarantees that every time in `columns` precedes the
    /// current first time.
    pub fn prepend(&mut self, columns: Vec<Vec<i64>>) {
        for (dst, mut src) in self.columns.iter_mut().zip(columns) {
            src.append(dst);
            *dst = src;
        }
    }

    /// Copies the points with `start <= time <= end`.
    pub fn range(&self, start: i64, end: i64) -> PointBuffer {
        let lo = self.columns[0].partition_point(|&t| t < start);
        let hi = self.columns[0].partition_point(|&t| t <= end).max(lo);
        PointBuffer {
            columns: self.columns.iter().map(|c| c[lo..hi].to_vec()).collect(),
        }
    }

    /// Approximate heap usage in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.columns.iter().map(|c| c.capacity() * 8).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_order() {
        let mut buf = PointBuffer::new(3);
        assert!(buf.insert(20, &[(1, 2)]).unwrap());
        assert!(buf.insert(10, &[(1, 1), (2, 10)]).unwrap());
        assert!(buf.insert(30, &[(2, 30)]).unwrap());
        assert_eq!(buf.times(), &[10, 20, 30]);
        assert_eq!(buf.column(1), &[1, 2, 0]);
        assert_eq!(buf.column(2), &[10, 0, 30]);
    }

    #[test]
    fn test_partial_update_keeps_other_columns() {
        let mut buf = PointBuffer::new(3);
        buf.insert(10, &[(1, 5), (2, 6)]).unwrap();
        assert!(!buf.insert(10, &[(2, 7)]).unwrap());
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.column(1), &[5]);
        assert_eq!(buf.column(2), &[7]);
    }

    #[test]
    fn test_insert_row_replaces() {
        let mut buf = PointBuffer::new(2);
        buf.insert_row(&[10, 1]).unwrap();
        buf.insert_row(&[10, 9]).unwrap();
        assert_eq!(buf.column(1), &[9]);
        assert!(matches!(
            buf.insert_row(&[10]),
            Err(StrataError::ColumnMismatch { .. })
        ));
        assert!(buf.insert(11, &[(2, 1)]).is_err());
        assert!(buf.insert(11, &[(0, 1)]).is_err());
    }

    #[test]
    fn test_drain_and_prepend() {
        let mut buf = PointBuffer::new(2);
        for t in 1..=5 {
            buf.insert_row(&[t, t * 10]).unwrap();
        }
        assert_eq!(buf.count_until(3), 3);
        let head = buf.drain_front(3);
        assert_eq!(head, vec![vec![1, 2, 3], vec![10, 20, 30]]);
        assert_eq!(buf.times(), &[4, 5]);
        buf.prepend(head);
        assert_eq!(buf.times(), &[1, 2, 3, 4, 5]);
        assert_eq!(buf.column(1), &[10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_range_copy() {
        let mut buf = PointBuffer::new(2);
        for t in [10, 20, 30, 40] {
            buf.insert_row(&[t, t]).unwrap();
        }
        let r = buf.range(15, 30);
        assert_eq!(r.times(), &[20, 30]);
        assert!(buf.range(50, 60).is_empty());
        assert!(buf.range(30, 10).is_empty());
    }

    #[test]
    fn test_from_columns_validates() {
        assert!(PointBuffer::from_columns(vec![vec![1, 2], vec![1]]).is_err());
        assert!(PointBuffer::from_columns(vec![vec![2, 1]]).is_err());
        assert!(PointBuffer::from_columns(vec![]).is_err());
        let buf = PointBuffer::from_columns(vec![vec![1, 2], vec![3, 4]]).unwrap();
        assert_eq!(buf.last_time(), Some(2));
    }
}
