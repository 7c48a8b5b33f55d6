use crate::config::InitRanges;
use glam::Vec3;
use rand::Rng;
use std::ops::Range;

/// Stationary point-mass pulling on the test particles.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SourceParticle {
    /// Position of the particle.
    pub position: Vec3,
    /// Mass of the particle, in units where the gravitational constant is 1.
    pub mass: f32,
}

impl SourceParticle {
    /// Creates a new [`SourceParticle`] with the given position and mass.
    #[inline]
    pub const fn new(position: Vec3, mass: f32) -> Self {
        Self { position, mass }
    }
}

/// Massless particle moving through the field of the source particles.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TestParticle {
    /// Position of the particle.
    pub position: Vec3,
    /// Velocity of the particle.
    pub velocity: Vec3,
}

impl TestParticle {
    /// Creates a new [`TestParticle`] with the given position and velocity.
    #[inline]
    pub const fn new(position: Vec3, velocity: Vec3) -> Self {
        Self { position, velocity }
    }

    /// Creates a new [`TestParticle`] at rest at the given position.
    #[inline]
    pub const fn at_rest(position: Vec3) -> Self {
        Self::new(position, Vec3::ZERO)
    }
}

/// Particles of a run.
///
/// The source particles are fixed once the store is created. The test particles can be
/// updated in place, but never added or removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleStore {
    sources: Box<[SourceParticle]>,
    tests: Box<[TestParticle]>,
}

impl ParticleStore {
    /// Creates a new [`ParticleStore`] from the given particles.
    #[inline]
    pub fn new(
        sources: impl Into<Box<[SourceParticle]>>,
        tests: impl Into<Box<[TestParticle]>>,
    ) -> Self {
        Self {
            sources: sources.into(),
            tests: tests.into(),
        }
    }

    /// Creates a new [`ParticleStore`] with particles drawn from the given ranges.
    ///
    /// # Panics
    ///
    /// Panics if a range that is sampled is empty, which [`SimulationConfig::validate`] rejects
    /// beforehand. No range is sampled when both counts are zero.
    ///
    /// [`SimulationConfig::validate`]: crate::SimulationConfig::validate
    ///
    /// ```
    /// # use pseudo_nbody::{InitRanges, ParticleStore};
    /// # use rand::{rngs::StdRng, SeedableRng};
    /// let store = ParticleStore::random(&mut StdRng::seed_from_u64(1), 3, 5, &InitRanges::default());
    ///
    /// assert_eq!(store.tests().len(), 3);
    /// assert_eq!(store.sources().len(), 5);
    /// ```
    pub fn random(
        rng: &mut impl Rng,
        test_count: usize,
        source_count: usize,
        ranges: &InitRanges,
    ) -> Self {
        let sources: Vec<_> = (0..source_count)
            .map(|_| SourceParticle {
                position: gen_range_vector(rng, &ranges.position),
                mass: rng.gen_range(ranges.mass.clone()),
            })
            .collect();

        let tests: Vec<_> = (0..test_count)
            .map(|_| TestParticle {
                position: gen_range_vector(rng, &ranges.position),
                velocity: gen_range_vector(rng, &ranges.velocity),
            })
            .collect();

        Self::new(sources, tests)
    }

    /// Returns the source particles.
    #[inline]
    pub fn sources(&self) -> &[SourceParticle] {
        &self.sources
    }

    /// Returns the test particles.
    #[inline]
    pub fn tests(&self) -> &[TestParticle] {
        &self.tests
    }

    /// Returns the test particles as a mutable slice.
    #[inline]
    pub fn tests_mut(&mut self) -> &mut [TestParticle] {
        &mut self.tests
    }
}

fn gen_range_vector(rng: &mut impl Rng, range: &Range<f32>) -> Vec3 {
    Vec3::from_array([0.0; 3].map(|_| rng.gen_range(range.clone())))
}
