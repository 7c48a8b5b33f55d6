use crate::{
    error::{Error, Result},
    particle::ParticleStore,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::Deserialize;
use std::ops::Range;

/// Softening parameter added to the squared distance of every (test, source) pair.
pub const DEFAULT_SOFTENING: f32 = 1e-9;

/// Local group sizes used by the data-parallel engines to partition the work.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct GroupSizes {
    /// Group size of the acceleration computation, as `[test particles, source particles]`.
    pub compute: [u32; 2],
    /// Number of active elements summed into one by a reduction pass.
    pub reduce: u32,
}

impl Default for GroupSizes {
    #[inline]
    fn default() -> Self {
        Self {
            compute: [1, 64],
            reduce: 64,
        }
    }
}

/// Ranges the initial particle attributes are drawn from.
///
/// Every range is half-open and sampled uniformly, per component for vectors.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct InitRanges {
    /// Positions of both source and test particles.
    pub position: Range<f32>,
    /// Velocities of the test particles.
    pub velocity: Range<f32>,
    /// Masses of the source particles.
    pub mass: Range<f32>,
}

impl Default for InitRanges {
    #[inline]
    fn default() -> Self {
        Self {
            position: 0.0..1e3,
            velocity: 0.0..5.0,
            mass: 1.0..1e4,
        }
    }
}

/// Parameters of a run.
///
/// ```
/// # use pseudo_nbody::SimulationConfig;
/// let config = SimulationConfig {
///     test_particles: 3,
///     source_particles: 5,
///     ..Default::default()
/// };
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of test particles.
    pub test_particles: usize,
    /// Number of source (pseudo-)particles.
    pub source_particles: usize,
    /// Number of iterations of the run.
    pub iterations: usize,
    /// Time step of every iteration.
    pub time_step: f32,
    /// Softening parameter of the gravitational acceleration.
    pub softening: f32,
    /// Local group sizes for the data-parallel engines.
    pub groups: GroupSizes,
    /// Seed of the generator used to initialise the particles.
    pub seed: u64,
    /// Ranges the initial particle attributes are drawn from.
    pub ranges: InitRanges,
}

impl Default for SimulationConfig {
    #[inline]
    fn default() -> Self {
        Self {
            test_particles: 1,
            source_particles: 100,
            iterations: 100,
            time_step: 0.01,
            softening: DEFAULT_SOFTENING,
            groups: GroupSizes::default(),
            seed: 1808,
            ranges: InitRanges::default(),
        }
    }
}

impl SimulationConfig {
    /// Draws the particles of a run from [`ranges`](Self::ranges), with a generator seeded
    /// by [`seed`](Self::seed).
    #[inline]
    pub fn particles(&self) -> ParticleStore {
        ParticleStore::random(
            &mut StdRng::seed_from_u64(self.seed),
            self.test_particles,
            self.source_particles,
            &self.ranges,
        )
    }

    /// Checks that the parameters can be used for a run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::InvalidConfig(message));

        if !self.time_step.is_finite() {
            return invalid(format!("time step {} is not finite", self.time_step));
        }
        if !self.softening.is_finite() || self.softening < 0.0 {
            return invalid(format!("softening {} is negative or not finite", self.softening));
        }
        if self.groups.compute.contains(&0) {
            return invalid(format!("compute group {:?} is empty", self.groups.compute));
        }
        if self.groups.reduce < 2 {
            // A group of one never shrinks the active range.
            return invalid(format!("reduce group size {} is below 2", self.groups.reduce));
        }

        for (name, range) in [
            ("position", &self.ranges.position),
            ("velocity", &self.ranges.velocity),
            ("mass", &self.ranges.mass),
        ] {
            if !(range.start.is_finite() && range.end.is_finite() && range.start < range.end) {
                return invalid(format!("{name} range {range:?} is empty"));
            }
        }

        Ok(())
    }
}
