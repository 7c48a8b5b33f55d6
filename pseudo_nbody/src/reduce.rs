//! Block reduction of the source-particle axis.
//!
//! A reduction sequence starts with every source column active. Each pass sums every
//! block of up to `group_size` consecutive active columns into one, so the active count
//! goes from `n` to `ceil(n / group_size)` until a single column remains.

use glam::Vec3;

/// One pass of a reduction sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pass {
    /// Active columns read by the pass.
    pub active: usize,
    /// Active columns left after the pass.
    pub remaining: usize,
}

/// Iterator over the passes needed to reduce `columns` active columns with blocks of
/// `group_size`.
///
/// ```
/// # use pseudo_nbody::reduce::ReductionPlan;
/// let counts: Vec<_> = ReductionPlan::new(5, 2).map(|pass| pass.remaining).collect();
///
/// assert_eq!(counts, [3, 2, 1]);
/// assert_eq!(ReductionPlan::new(1, 2).count(), 0);
/// ```
#[derive(Clone, Debug)]
pub struct ReductionPlan {
    active: usize,
    group_size: usize,
}

impl ReductionPlan {
    /// Creates the plan reducing `columns` columns with blocks of `group_size`.
    ///
    /// # Panics
    ///
    /// Panics if `group_size` is below 2, which would never shrink the active range.
    #[inline]
    pub fn new(columns: usize, group_size: usize) -> Self {
        assert!(group_size >= 2, "group size {group_size} cannot shrink the active range");
        Self {
            active: columns,
            group_size,
        }
    }
}

impl Iterator for ReductionPlan {
    type Item = Pass;

    #[inline]
    fn next(&mut self) -> Option<Pass> {
        if self.active <= 1 {
            return None;
        }

        let pass = Pass {
            active: self.active,
            remaining: self.active.div_ceil(self.group_size),
        };
        self.active = pass.remaining;

        Some(pass)
    }
}

/// Returns the number of passes needed to reduce `columns` columns with blocks of
/// `group_size`, that is `ceil(log_group_size(columns))`.
#[inline]
pub fn passes(columns: usize, group_size: usize) -> usize {
    ReductionPlan::new(columns, group_size).count()
}

/// Sums every block of `group_size` elements among the first `active` ones of `row` into
/// the element at the index of the block. Returns the new active count.
///
/// Each block is copied to `scratch` and summed pairwise there, the way a work group sums
/// its elements in shared memory. The last block may be partial; elements past `active`
/// are never read.
pub fn reduce_row(
    row: &mut [Vec3],
    active: usize,
    group_size: usize,
    scratch: &mut Vec<Vec3>,
) -> usize {
    assert!(active <= row.len(), "active range exceeds the row");

    let remaining = active.div_ceil(group_size);
    for block in 0..remaining {
        let start = block * group_size;
        let end = (start + group_size).min(active);

        // Every later block starts past `block`, so it is never overwritten before read.
        row[block] = block_sum(&row[start..end], scratch);
    }

    remaining
}

/// Sums one block through `scratch`, pairwise.
#[inline]
pub(crate) fn block_sum(block: &[Vec3], scratch: &mut Vec<Vec3>) -> Vec3 {
    scratch.clear();
    scratch.extend_from_slice(block);
    tree_sum(scratch)
}

/// Sums `values` by repeatedly folding the upper half onto the lower half.
fn tree_sum(values: &mut [Vec3]) -> Vec3 {
    let mut width = values.len();
    while width > 1 {
        let half = width.div_ceil(2);
        for i in 0..width / 2 {
            let upper = values[i + half];
            values[i] += upper;
        }
        width = half;
    }

    values.first().copied().unwrap_or(Vec3::ZERO)
}

/// Sums the first `active` elements of `row` into its first element in a single pass.
#[inline]
pub fn sum_row(row: &mut [Vec3], active: usize) {
    if active > 1 {
        row[0] = row[..active].iter().sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contributions(len: usize) -> Vec<Vec3> {
        (0..len)
            .map(|i| {
                let i = i as f32;
                Vec3::new(i.sin() * 3.0, (i * 0.37).cos(), 1.0 / (1.0 + i))
            })
            .collect()
    }

    fn relative_error(a: Vec3, b: Vec3) -> f32 {
        (a - b).length() / b.length().max(f32::MIN_POSITIVE)
    }

    #[test]
    fn five_columns_in_groups_of_two() {
        let plan: Vec<_> = ReductionPlan::new(5, 2).collect();

        assert_eq!(
            plan,
            [
                Pass { active: 5, remaining: 3 },
                Pass { active: 3, remaining: 2 },
                Pass { active: 2, remaining: 1 },
            ]
        );
        assert_eq!(passes(5, 2), 3);
    }

    #[test]
    fn single_or_no_column_needs_no_pass() {
        assert_eq!(passes(1, 2), 0);
        assert_eq!(passes(0, 64), 0);
    }

    #[test]
    fn pass_count_is_ceil_log() {
        assert_eq!(passes(64, 64), 1);
        assert_eq!(passes(65, 64), 2);
        assert_eq!(passes(4096, 64), 2);
        assert_eq!(passes(4097, 64), 3);
        assert_eq!(passes(1000, 10), 3);
        assert_eq!(passes(1001, 10), 4);
    }

    #[test]
    #[should_panic]
    fn group_of_one_is_rejected() {
        ReductionPlan::new(5, 1);
    }

    #[test]
    fn blocks_match_direct_sum() {
        for columns in [1, 2, 5, 7, 64, 100, 1000, 10_000] {
            for group_size in [2, 3, 16, 64, 256] {
                let mut row = contributions(columns);
                let expected: Vec3 = row.iter().sum();

                let mut scratch = Vec::new();
                let mut active = columns;
                for pass in ReductionPlan::new(columns, group_size) {
                    assert_eq!(pass.active, active);
                    active = reduce_row(&mut row, active, group_size, &mut scratch);
                    assert_eq!(active, pass.remaining);
                }

                assert!(
                    relative_error(row[0], expected) < 1e-4,
                    "{columns} columns, group {group_size}: {} != {expected}",
                    row[0]
                );
            }
        }
    }

    #[test]
    fn partial_block_stops_at_active_count() {
        let mut row = vec![Vec3::ONE; 5];
        row.push(Vec3::splat(1e9)); // past the active range

        assert_eq!(reduce_row(&mut row, 5, 2, &mut Vec::new()), 3);
        assert_eq!(&row[..3], &[Vec3::splat(2.0), Vec3::splat(2.0), Vec3::ONE]);
    }

    #[test]
    fn tree_sum_handles_odd_widths() {
        let mut values: Vec<_> = (1..=7).map(|i| Vec3::splat(i as f32)).collect();

        assert_eq!(tree_sum(&mut values), Vec3::splat(28.0));
        assert_eq!(tree_sum(&mut []), Vec3::ZERO);
    }

    #[test]
    fn direct_sum_of_one_column_is_itself() {
        let mut row = vec![Vec3::new(1.0, 2.0, 3.0)];
        sum_row(&mut row, 1);

        assert_eq!(row[0], Vec3::new(1.0, 2.0, 3.0));
    }
}
