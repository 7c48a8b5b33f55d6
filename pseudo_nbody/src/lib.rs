//! # pseudo_nbody
//!
//! pseudo_nbody moves massless *test particles* through the gravitational field of fixed
//! *source particles* (pseudo-particles). Sources never move and never attract each other,
//! and test particles never attract each other: only the source → test interactions are
//! computed.
//!
//! Every iteration runs three stages, each one finished before the next one starts:
//!
//! 1. **compute**: the softened acceleration of every (test, source) pair is written to a
//!    buffer with one row per test particle and one column per source particle,
//! 2. **reduce**: the columns of every row are summed in one or more block passes until the
//!    first column holds the total acceleration of the row,
//! 3. **integrate**: every test particle is advanced by one time step.
//!
//! The stages are provided by a [`ComputeBackend`], and the [`Driver`] runs them for a
//! fixed number of iterations. Three backends are available:
//!
//! - [`sequential::Sequential`], on one CPU thread, summing every row directly,
//! - [`parallel::Parallel`], on multiple CPU threads thanks to
//!   [rayon](https://github.com/rayon-rs/rayon) (feature "parallel", enabled by default),
//! - [`gpu::Gpu`], on the GPU thanks to [wgpu](https://github.com/gfx-rs/wgpu) (feature
//!   "gpu").
//!
//! # Running a simulation
//!
//! ```
//! use pseudo_nbody::prelude::*;
//! use glam::Vec3;
//!
//! let sources = [SourceParticle::new(Vec3::ZERO, 1000.0)];
//! let tests = [TestParticle::at_rest(Vec3::new(100.0, 0.0, 0.0))];
//! let mut store = ParticleStore::new(sources, tests);
//!
//! let mut driver = Driver::new(Sequential::new(DEFAULT_SOFTENING), 1, 0.01);
//! let summary = driver.run(&mut store, &mut ()).unwrap();
//!
//! assert_eq!(driver.state(), State::Done);
//! // A single source column is already its own total.
//! assert_eq!(summary.reduction_passes, 0);
//! // Pulled towards the source at the origin.
//! assert!(store.tests()[0].velocity.x < 0.0);
//! ```

#![warn(missing_docs)]

/// Buffer of the partial accelerations of one iteration.
pub mod buffer;
/// Parameters of a run.
pub mod config;
/// Orchestration of the compute, reduce and integrate stages.
pub mod driver;
/// Errors aborting a run.
pub mod error;
/// Backend using the GPU.
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod gravity;
/// Backend using multiple CPU threads.
#[cfg(feature = "parallel")]
pub mod parallel;
/// Source and test particles.
pub mod particle;
pub mod reduce;
/// Backend using one CPU thread.
pub mod sequential;

pub use config::{GroupSizes, InitRanges, SimulationConfig, DEFAULT_SOFTENING};
pub use driver::{Driver, Report, RunSummary, State};
pub use error::{Error, Result, Stage};
pub use particle::{ParticleStore, SourceParticle, TestParticle};

use reduce::{Pass, ReductionPlan};

/// Trait implemented by the engines running the stages of an iteration.
///
/// A backend owns its working copy of the particles and its partial-acceleration buffer
/// from [`upload`](ComputeBackend::upload) to [`download`](ComputeBackend::download).
/// Every method returns once its stage is complete, so the caller never observes partially
/// written data. The [`Driver`] is the intended caller and only depends on this trait.
pub trait ComputeBackend {
    /// Copies the particles to the backend and allocates the buffers for them.
    ///
    /// Called once before the first iteration of a run.
    fn upload(&mut self, store: &ParticleStore) -> Result<()>;

    /// Computes the acceleration of every (test, source) pair into the partial-acceleration
    /// buffer and marks all of its columns as active.
    fn compute_accelerations(&mut self) -> Result<()>;

    /// Returns the reduction passes needed to collapse the uploaded source particles.
    fn reduction_plan(&self) -> ReductionPlan;

    /// Performs one reduction pass over every row of the partial-acceleration buffer.
    ///
    /// Passes are performed in the order of [`reduction_plan`](ComputeBackend::reduction_plan).
    fn reduce(&mut self, pass: Pass) -> Result<()>;

    /// Advances every test particle by `time_step` using the reduced accelerations.
    fn integrate(&mut self, time_step: f32) -> Result<()>;

    /// Copies the test particles from the backend to `tests`.
    fn download(&mut self, tests: &mut [TestParticle]) -> Result<()>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for &mut B {
    #[inline]
    fn upload(&mut self, store: &ParticleStore) -> Result<()> {
        (**self).upload(store)
    }

    #[inline]
    fn compute_accelerations(&mut self) -> Result<()> {
        (**self).compute_accelerations()
    }

    #[inline]
    fn reduction_plan(&self) -> ReductionPlan {
        (**self).reduction_plan()
    }

    #[inline]
    fn reduce(&mut self, pass: Pass) -> Result<()> {
        (**self).reduce(pass)
    }

    #[inline]
    fn integrate(&mut self, time_step: f32) -> Result<()> {
        (**self).integrate(time_step)
    }

    #[inline]
    fn download(&mut self, tests: &mut [TestParticle]) -> Result<()> {
        (**self).download(tests)
    }
}

/// Everything needed to run a simulation.
pub mod prelude {
    #[cfg(feature = "gpu")]
    pub use crate::gpu::{Gpu, GpuContext};
    #[cfg(feature = "parallel")]
    pub use crate::parallel::Parallel;
    pub use crate::sequential::Sequential;
    pub use crate::{
        ComputeBackend, Driver, GroupSizes, InitRanges, ParticleStore, Report, RunSummary,
        SimulationConfig, SourceParticle, State, TestParticle, DEFAULT_SOFTENING,
    };
}
