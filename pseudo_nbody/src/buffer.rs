use crate::error::{try_zeroed, Result, Stage};
use glam::Vec3;

/// Accelerations of every (test, source) pair of one iteration, stored row-major with one
/// row per test particle and one column per source particle.
///
/// Reduction compacts every row in place: after each pass only the first
/// [`active`](Self::active) columns of a row are meaningful, and once the active count
/// reaches 1 the first column holds the total acceleration of the row's test particle.
#[derive(Clone, Debug, Default)]
pub struct PartialAccelerations {
    data: Vec<Vec3>,
    rows: usize,
    columns: usize,
    active: usize,
}

impl PartialAccelerations {
    /// Allocates a zeroed buffer of `rows` by `columns` accelerations.
    pub fn new(rows: usize, columns: usize) -> Result<Self> {
        let len = rows.checked_mul(columns).unwrap_or(usize::MAX);

        Ok(Self {
            data: try_zeroed(len, Stage::Upload)?,
            rows,
            columns,
            active: columns,
        })
    }

    /// Returns the number of rows, one per test particle.
    #[inline]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the number of columns, one per source particle.
    #[inline]
    pub const fn columns(&self) -> usize {
        self.columns
    }

    /// Returns the number of columns of every row not yet summed.
    #[inline]
    pub const fn active(&self) -> usize {
        self.active
    }

    /// Returns row `index`, including its inactive columns.
    #[inline]
    pub fn row(&self, index: usize) -> &[Vec3] {
        &self.data[index * self.columns..(index + 1) * self.columns]
    }

    /// Returns an iterator over the mutable rows, including their inactive columns.
    ///
    /// Yields nothing when there are no columns.
    #[inline]
    pub fn rows_mut(&mut self) -> std::slice::ChunksExactMut<'_, Vec3> {
        self.data.chunks_exact_mut(self.columns.max(1))
    }

    /// Returns the mutable rows as a slice to split between threads, with the row length.
    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> (&mut [Vec3], usize) {
        (&mut self.data, self.columns.max(1))
    }

    /// Marks every column as active again, before the buffer is refilled.
    #[inline]
    pub fn reset(&mut self) {
        self.active = self.columns;
    }

    #[inline]
    pub(crate) fn set_active(&mut self, active: usize) {
        debug_assert!(active <= self.active, "the active range only shrinks");
        self.active = active;
    }

    /// Returns the total acceleration of row `index`.
    ///
    /// Only meaningful once the active count is at most 1. Rows without any source particle
    /// have a zero acceleration.
    #[inline]
    pub fn total(&self, index: usize) -> Vec3 {
        debug_assert!(self.active <= 1, "total read before the reduction finished");
        if self.columns == 0 {
            Vec3::ZERO
        } else {
            self.data[index * self.columns]
        }
    }

    /// Returns the total acceleration of every row.
    #[inline]
    pub fn totals(&self) -> impl ExactSizeIterator<Item = Vec3> + '_ {
        (0..self.rows).map(|row| self.total(row))
    }
}
