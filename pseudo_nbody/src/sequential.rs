use crate::{
    buffer::PartialAccelerations,
    error::Result,
    gravity,
    particle::{ParticleStore, SourceParticle, TestParticle},
    reduce::{self, Pass, ReductionPlan},
    ComputeBackend,
};

/// Backend running every stage on one CPU thread.
///
/// The reduction is a single pass summing every row directly, so this backend is the
/// reference the others are compared against.
#[derive(Clone, Debug, Default)]
pub struct Sequential {
    /// Softening parameter of the acceleration.
    pub softening: f32,
    sources: Vec<SourceParticle>,
    tests: Vec<TestParticle>,
    accelerations: PartialAccelerations,
}

impl Sequential {
    /// Creates a new [`Sequential`] backend with the given softening parameter.
    #[inline]
    pub fn new(softening: f32) -> Self {
        Self {
            softening,
            ..Default::default()
        }
    }

    /// Returns the partial-acceleration buffer of the current iteration.
    #[inline]
    pub fn accelerations(&self) -> &PartialAccelerations {
        &self.accelerations
    }
}

impl ComputeBackend for Sequential {
    fn upload(&mut self, store: &ParticleStore) -> Result<()> {
        self.sources = store.sources().to_vec();
        self.tests = store.tests().to_vec();
        self.accelerations = PartialAccelerations::new(self.tests.len(), self.sources.len())?;

        Ok(())
    }

    fn compute_accelerations(&mut self) -> Result<()> {
        self.accelerations.reset();

        for (row, test) in self.accelerations.rows_mut().zip(&self.tests) {
            for (acceleration, source) in row.iter_mut().zip(&self.sources) {
                *acceleration = gravity::acceleration(source, test.position, self.softening);
            }
        }

        Ok(())
    }

    #[inline]
    fn reduction_plan(&self) -> ReductionPlan {
        // One block spanning every column.
        ReductionPlan::new(self.sources.len(), self.sources.len().max(2))
    }

    fn reduce(&mut self, pass: Pass) -> Result<()> {
        for row in self.accelerations.rows_mut() {
            reduce::sum_row(row, pass.active);
        }
        self.accelerations.set_active(pass.remaining);

        Ok(())
    }

    fn integrate(&mut self, time_step: f32) -> Result<()> {
        for (index, test) in self.tests.iter_mut().enumerate() {
            gravity::integrate(test, self.accelerations.total(index), time_step);
        }

        Ok(())
    }

    fn download(&mut self, tests: &mut [TestParticle]) -> Result<()> {
        tests.copy_from_slice(&self.tests);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{Driver, InitRanges, DEFAULT_SOFTENING};
    use glam::Vec3;
    use rand::{rngs::StdRng, SeedableRng};

    /// Direct sum of the accelerations of every source on every test particle.
    pub fn brute_force(store: &ParticleStore, softening: f32) -> Vec<Vec3> {
        store
            .tests()
            .iter()
            .map(|test| {
                store.sources().iter().fold(Vec3::ZERO, |acc, source| {
                    acc + gravity::acceleration(source, test.position, softening)
                })
            })
            .collect()
    }

    /// Uploads `store` to `backend` and runs the compute and reduce stages once.
    pub fn reduced_accelerations<B: ComputeBackend>(backend: &mut B, store: &ParticleStore) {
        backend.upload(store).unwrap();
        backend.compute_accelerations().unwrap();
        for pass in backend.reduction_plan() {
            backend.reduce(pass).unwrap();
        }
    }

    pub fn random_store(seed: u64, tests: usize, sources: usize) -> ParticleStore {
        ParticleStore::random(
            &mut StdRng::seed_from_u64(seed),
            tests,
            sources,
            &InitRanges::default(),
        )
    }

    pub fn assert_relative_eq(computed: Vec3, expected: Vec3, tolerance: f32) {
        let error = (computed - expected).length() / expected.length().max(f32::MIN_POSITIVE);
        assert!(
            error < tolerance,
            "{computed} differs from {expected} by a relative {error}"
        );
    }

    #[test]
    fn one_pass_whatever_the_source_count() {
        for sources in [2, 5, 1000] {
            let mut backend = Sequential::new(DEFAULT_SOFTENING);
            backend.upload(&random_store(0, 1, sources)).unwrap();

            assert_eq!(backend.reduction_plan().count(), 1);
        }
    }

    #[test]
    fn reduction_matches_brute_force() {
        let store = random_store(1808, 3, 5);
        let mut backend = Sequential::new(DEFAULT_SOFTENING);

        reduced_accelerations(&mut backend, &store);

        assert_eq!(backend.accelerations().active(), 1);
        for (computed, expected) in backend
            .accelerations()
            .totals()
            .zip(brute_force(&store, DEFAULT_SOFTENING))
        {
            assert_relative_eq(computed, expected, 1e-5);
        }
    }

    #[test]
    fn single_source_column_is_the_total() {
        let store = random_store(3, 4, 1);
        let mut backend = Sequential::new(DEFAULT_SOFTENING);

        reduced_accelerations(&mut backend, &store);

        for (index, test) in store.tests().iter().enumerate() {
            let expected =
                gravity::acceleration(&store.sources()[0], test.position, DEFAULT_SOFTENING);
            assert_eq!(backend.accelerations().row(index), &[expected]);
            assert_eq!(backend.accelerations().total(index), expected);
        }
    }

    #[test]
    fn one_iteration_towards_a_single_source() {
        let mut store = ParticleStore::new(
            [SourceParticle::new(Vec3::ZERO, 1000.0)],
            [TestParticle::at_rest(Vec3::new(100.0, 0.0, 0.0))],
        );
        let time_step = 0.01;

        Driver::new(Sequential::new(DEFAULT_SOFTENING), 1, time_step)
            .run(&mut store, &mut ())
            .unwrap();

        // Starting at rest, the velocity after one step is the acceleration times the step.
        let acceleration = store.tests()[0].velocity / time_step;
        assert!(acceleration.x < 0.0);
        assert!((acceleration.length() - 1000.0 / (100.0f32 * 100.0)).abs() < 1e-5);
        assert!(store.tests()[0].position.x < 100.0);
    }

    #[test]
    fn zero_time_step_leaves_particles_unchanged() {
        let mut store = random_store(9, 4, 16);
        let before = store.clone();

        Driver::new(Sequential::new(DEFAULT_SOFTENING), 10, 0.0)
            .run(&mut store, &mut ())
            .unwrap();

        assert_eq!(store, before);
    }

    #[test]
    fn no_source_means_no_acceleration() {
        let mut store = ParticleStore::new(
            Vec::<SourceParticle>::new(),
            [TestParticle::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0))],
        );

        Driver::new(Sequential::new(DEFAULT_SOFTENING), 4, 0.5)
            .run(&mut store, &mut ())
            .unwrap();

        assert_eq!(store.tests()[0].velocity, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(store.tests()[0].position, Vec3::new(2.0, 4.0, 6.0));
    }
}
