use crate::{
    buffer::PartialAccelerations,
    config::GroupSizes,
    error::Result,
    gravity,
    particle::{ParticleStore, SourceParticle, TestParticle},
    reduce::{self, Pass, ReductionPlan},
    ComputeBackend,
};
use rayon::prelude::*;

/// Backend running every stage on multiple CPU threads with
/// [rayon](https://github.com/rayon-rs/rayon).
///
/// The work is split the way a data-parallel device would split it:
///
/// - the acceleration computation runs one task per tile of `groups.compute[0]` test
///   particles by `groups.compute[1]` source particles,
/// - every reduction pass runs one task per block of `groups.reduce` active columns, across
///   rows and within each row, each block first gathered into a per-task scratch buffer,
/// - the integration runs one task per test particle.
///
/// Every stage returns once all of its tasks have finished.
#[derive(Clone, Debug)]
pub struct Parallel {
    /// Softening parameter of the acceleration.
    pub softening: f32,
    /// Local group sizes partitioning the work.
    pub groups: GroupSizes,
    sources: Vec<SourceParticle>,
    tests: Vec<TestParticle>,
    accelerations: PartialAccelerations,
}

impl Parallel {
    /// Creates a new [`Parallel`] backend with the given softening parameter and group sizes.
    ///
    /// # Panics
    ///
    /// Panics if a compute group dimension is zero or if the reduce group is below 2.
    #[inline]
    pub fn new(softening: f32, groups: GroupSizes) -> Self {
        assert!(!groups.compute.contains(&0), "empty compute group");
        assert!(groups.reduce >= 2, "reduce group below 2");

        Self {
            softening,
            groups,
            sources: Vec::new(),
            tests: Vec::new(),
            accelerations: PartialAccelerations::default(),
        }
    }

    /// Returns the partial-acceleration buffer of the current iteration.
    #[inline]
    pub fn accelerations(&self) -> &PartialAccelerations {
        &self.accelerations
    }
}

impl ComputeBackend for Parallel {
    fn upload(&mut self, store: &ParticleStore) -> Result<()> {
        self.sources = store.sources().to_vec();
        self.tests = store.tests().to_vec();
        self.accelerations = PartialAccelerations::new(self.tests.len(), self.sources.len())?;

        log::debug!(
            "Parallel backend on {} threads, groups {:?}",
            rayon::current_num_threads(),
            self.groups
        );

        Ok(())
    }

    fn compute_accelerations(&mut self) -> Result<()> {
        self.accelerations.reset();

        let [group_rows, group_columns] = self.groups.compute.map(|size| size as usize);
        let (data, row_len) = self.accelerations.as_mut_slice();
        let (sources, softening) = (&self.sources, self.softening);

        data.par_chunks_mut(row_len * group_rows)
            .zip(self.tests.par_chunks(group_rows))
            .for_each(|(rows, tests)| {
                for (row, test) in rows.chunks_exact_mut(row_len).zip(tests) {
                    row.par_chunks_mut(group_columns)
                        .zip(sources.par_chunks(group_columns))
                        .for_each(|(tile, sources)| {
                            for (acceleration, source) in tile.iter_mut().zip(sources) {
                                *acceleration =
                                    gravity::acceleration(source, test.position, softening);
                            }
                        });
                }
            });

        Ok(())
    }

    #[inline]
    fn reduction_plan(&self) -> ReductionPlan {
        ReductionPlan::new(self.sources.len(), self.groups.reduce as usize)
    }

    fn reduce(&mut self, pass: Pass) -> Result<()> {
        debug_assert_eq!(pass.active, self.accelerations.active());

        let group_size = self.groups.reduce as usize;
        let (data, row_len) = self.accelerations.as_mut_slice();

        data.par_chunks_exact_mut(row_len).for_each_init(
            || Vec::with_capacity(pass.remaining),
            |sums, row| {
                row[..pass.active]
                    .par_chunks(group_size)
                    .map_init(
                        || Vec::with_capacity(group_size),
                        |scratch, block| reduce::block_sum(block, scratch),
                    )
                    .collect_into_vec(sums);
                row[..pass.remaining].copy_from_slice(sums);
            },
        );
        self.accelerations.set_active(pass.remaining);

        Ok(())
    }

    fn integrate(&mut self, time_step: f32) -> Result<()> {
        let accelerations = &self.accelerations;

        self.tests
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, test)| {
                gravity::integrate(test, accelerations.total(index), time_step);
            });

        Ok(())
    }

    fn download(&mut self, tests: &mut [TestParticle]) -> Result<()> {
        tests.copy_from_slice(&self.tests);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reduce::passes,
        sequential::{tests::*, Sequential},
        Driver, DEFAULT_SOFTENING,
    };

    fn groups(compute: [u32; 2], reduce: u32) -> GroupSizes {
        GroupSizes { compute, reduce }
    }

    // Test particles far from the sources, so that contributions do not cancel out.
    fn distant_store(seed: u64, tests: usize, sources: usize) -> ParticleStore {
        let cloud = random_store(seed, 0, sources);
        let tests: Vec<_> = random_store(seed, tests, 0)
            .tests()
            .iter()
            .map(|test| {
                TestParticle::new(test.position + glam::Vec3::splat(5e3), test.velocity)
            })
            .collect();

        ParticleStore::new(cloud.sources(), tests)
    }

    #[test]
    fn five_sources_groups_of_two() {
        let store = random_store(1808, 3, 5);
        let mut backend = Parallel::new(DEFAULT_SOFTENING, groups([2, 2], 2));

        backend.upload(&store).unwrap();
        backend.compute_accelerations().unwrap();

        let mut counts = vec![backend.accelerations().active()];
        for pass in backend.reduction_plan() {
            backend.reduce(pass).unwrap();
            counts.push(backend.accelerations().active());
        }

        assert_eq!(counts, [5, 3, 2, 1]);
        for (computed, expected) in backend
            .accelerations()
            .totals()
            .zip(brute_force(&store, DEFAULT_SOFTENING))
        {
            assert_relative_eq(computed, expected, 1e-5);
        }
    }

    #[test]
    fn reduction_matches_brute_force_for_any_group() {
        for sources in [1, 2, 7, 63, 64, 65, 1000, 4099] {
            let store = distant_store(sources as u64, 5, sources);
            let expected = brute_force(&store, DEFAULT_SOFTENING);

            for reduce in [2, 3, 32, 64, 256] {
                let mut backend = Parallel::new(DEFAULT_SOFTENING, groups([3, 16], reduce));
                reduced_accelerations(&mut backend, &store);

                assert_eq!(
                    backend.reduction_plan().count(),
                    passes(sources, reduce as usize)
                );
                for (computed, expected) in backend.accelerations().totals().zip(&expected) {
                    assert_relative_eq(computed, *expected, 1e-4);
                }
            }
        }
    }

    #[test]
    fn single_row_is_reduced_block_by_block() {
        let store = distant_store(4099, 1, 4099);
        let expected = brute_force(&store, DEFAULT_SOFTENING);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();

        let mut backend = Parallel::new(DEFAULT_SOFTENING, groups([1, 64], 3));
        let mut counts = Vec::new();
        pool.install(|| {
            backend.upload(&store).unwrap();
            backend.compute_accelerations().unwrap();
            for pass in backend.reduction_plan() {
                backend.reduce(pass).unwrap();
                counts.push(backend.accelerations().active());
            }
        });

        assert_eq!(counts, [1367, 456, 152, 51, 17, 6, 2, 1]);
        assert_relative_eq(backend.accelerations().total(0), expected[0], 1e-4);
    }

    #[test]
    fn partial_tiles_are_computed() {
        // Neither count is a multiple of the compute group.
        let store = random_store(11, 7, 13);
        let mut parallel = Parallel::new(DEFAULT_SOFTENING, groups([4, 5], 64));
        let mut sequential = Sequential::new(DEFAULT_SOFTENING);

        parallel.upload(&store).unwrap();
        parallel.compute_accelerations().unwrap();
        sequential.upload(&store).unwrap();
        sequential.compute_accelerations().unwrap();

        for row in 0..7 {
            assert_eq!(
                parallel.accelerations().row(row),
                sequential.accelerations().row(row)
            );
        }
    }

    #[test]
    fn agrees_with_sequential_after_many_iterations() {
        let store = random_store(1808, 16, 500);
        let (iterations, time_step) = (50, 0.01);

        let mut sequential = store.clone();
        Driver::new(Sequential::new(DEFAULT_SOFTENING), iterations, time_step)
            .run(&mut sequential, &mut ())
            .unwrap();

        let mut parallel = store.clone();
        Driver::new(
            Parallel::new(DEFAULT_SOFTENING, groups([1, 64], 8)),
            iterations,
            time_step,
        )
        .run(&mut parallel, &mut ())
        .unwrap();

        for (p, s) in parallel.tests().iter().zip(sequential.tests()) {
            assert_relative_eq(p.position, s.position, 1e-3);
        }
    }

    #[test]
    #[should_panic]
    fn reduce_group_of_one_panics() {
        Parallel::new(DEFAULT_SOFTENING, groups([1, 1], 1));
    }
}
