use crate::{
    config::SimulationConfig,
    error::{Error, Result},
    particle::{ParticleStore, TestParticle},
    reduce::Pass,
    ComputeBackend,
};
use std::time::{Duration, Instant};

/// Stage the [`Driver`] is in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum State {
    /// No iteration has started yet.
    #[default]
    Idle,
    /// Computing the partial accelerations.
    Computing,
    /// Reducing the partial accelerations, possibly over multiple passes.
    Reducing,
    /// Advancing the test particles.
    Integrating,
    /// Every iteration has completed and the test particles were copied back.
    Done,
}

/// Receives the first test particle before the first iteration and after the last one.
///
/// Implemented by `()` to report nothing.
pub trait Report {
    /// Called with the first test particle before the first iteration.
    #[inline]
    fn before(&mut self, _first: &TestParticle) {}

    /// Called with the first test particle after the last iteration.
    #[inline]
    fn after(&mut self, _first: &TestParticle) {}
}

impl Report for () {}

/// Outcome of a completed run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    /// Number of iterations performed.
    pub iterations: usize,
    /// Number of reduction passes performed in every iteration.
    pub reduction_passes: usize,
    /// First test particle before the first iteration, if any.
    pub first_before: Option<TestParticle>,
    /// First test particle after the last iteration, if any.
    pub first_after: Option<TestParticle>,
    /// Wall time of the run, including the transfers to and from the backend.
    pub elapsed: Duration,
}

/// Runs a fixed number of iterations on a [`ComputeBackend`].
///
/// Every iteration goes through [`State::Computing`], [`State::Reducing`] and
/// [`State::Integrating`], and each stage is complete before the next one starts. The first
/// error returned by the backend aborts the run: it is logged with the stage that failed and
/// returned, and the driver stays in that stage.
#[derive(Debug)]
pub struct Driver<B> {
    backend: B,
    iterations: usize,
    time_step: f32,
    state: State,
}

impl<B> Driver<B> {
    /// Creates a new [`Driver`] running `iterations` iterations of `time_step` on `backend`.
    #[inline]
    pub const fn new(backend: B, iterations: usize, time_step: f32) -> Self {
        Self {
            backend,
            iterations,
            time_step,
            state: State::Idle,
        }
    }

    /// Creates a new [`Driver`] with the iteration count and time step of `config`.
    #[inline]
    pub fn from_config(backend: B, config: &SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(backend, config.iterations, config.time_step))
    }

    /// Returns the current state.
    #[inline]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns the backend.
    #[inline]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Consumes the driver and returns its backend.
    #[inline]
    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: ComputeBackend> Driver<B> {
    /// Runs every iteration on the particles of `store`, then writes the test particles back
    /// to it.
    ///
    /// The source particles are never modified.
    pub fn run<R>(&mut self, store: &mut ParticleStore, report: &mut R) -> Result<RunSummary>
    where
        R: Report + ?Sized,
    {
        let start = Instant::now();
        self.state = State::Idle;

        log::info!(
            "Running {} iterations of {} test particles through {} source particles",
            self.iterations,
            store.tests().len(),
            store.sources().len()
        );

        let first_before = store.tests().first().copied();
        if let Some(first) = &first_before {
            report.before(first);
        }

        self.backend.upload(store).map_err(|e| self.abort(e))?;
        let plan: Vec<Pass> = self.backend.reduction_plan().collect();

        for iteration in 0..self.iterations {
            log::debug!("Iteration {iteration}");

            self.state = State::Computing;
            log::trace!("Computing partial accelerations");
            self.backend
                .compute_accelerations()
                .map_err(|e| self.abort(e))?;

            self.state = State::Reducing;
            for &pass in &plan {
                log::trace!("Reducing {} -> {} columns", pass.active, pass.remaining);
                self.backend.reduce(pass).map_err(|e| self.abort(e))?;
            }

            self.state = State::Integrating;
            log::trace!("Integrating with a time step of {}", self.time_step);
            self.backend
                .integrate(self.time_step)
                .map_err(|e| self.abort(e))?;
        }

        self.backend
            .download(store.tests_mut())
            .map_err(|e| self.abort(e))?;
        self.state = State::Done;

        let first_after = store.tests().first().copied();
        if let Some(first) = &first_after {
            report.after(first);
        }

        let elapsed = start.elapsed();
        log::info!("Run completed in {elapsed:?}");

        Ok(RunSummary {
            iterations: self.iterations,
            reduction_passes: plan.len(),
            first_before,
            first_after,
            elapsed,
        })
    }

    fn abort(&self, error: Error) -> Error {
        log::error!("Run aborted while {:?}: {error}", self.state);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reduce::ReductionPlan, SourceParticle, Stage};
    use glam::Vec3;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Call {
        Upload,
        Compute,
        Reduce(Pass),
        Integrate(f32),
        Download,
    }

    #[derive(Default)]
    struct Recorder {
        columns: usize,
        group_size: usize,
        fail_on: Option<Stage>,
        calls: Vec<Call>,
    }

    impl Recorder {
        fn fail(&self, stage: Stage) -> Result<()> {
            match self.fail_on {
                Some(failing) if failing == stage => Err(Error::Dispatch {
                    stage,
                    message: "injected".into(),
                }),
                _ => Ok(()),
            }
        }
    }

    impl ComputeBackend for Recorder {
        fn upload(&mut self, store: &ParticleStore) -> Result<()> {
            self.columns = store.sources().len();
            self.calls.push(Call::Upload);
            self.fail(Stage::Upload)
        }

        fn compute_accelerations(&mut self) -> Result<()> {
            self.calls.push(Call::Compute);
            self.fail(Stage::Compute)
        }

        fn reduction_plan(&self) -> ReductionPlan {
            ReductionPlan::new(self.columns, self.group_size)
        }

        fn reduce(&mut self, pass: Pass) -> Result<()> {
            self.calls.push(Call::Reduce(pass));
            self.fail(Stage::Reduce)
        }

        fn integrate(&mut self, time_step: f32) -> Result<()> {
            self.calls.push(Call::Integrate(time_step));
            self.fail(Stage::Integrate)
        }

        fn download(&mut self, _tests: &mut [TestParticle]) -> Result<()> {
            self.calls.push(Call::Download);
            self.fail(Stage::Download)
        }
    }

    fn store(sources: usize, tests: usize) -> ParticleStore {
        ParticleStore::new(
            vec![SourceParticle::new(Vec3::ZERO, 1.0); sources],
            vec![TestParticle::at_rest(Vec3::X); tests],
        )
    }

    #[test]
    fn stages_run_in_order_for_every_iteration() {
        let backend = Recorder {
            group_size: 2,
            ..Default::default()
        };
        let mut driver = Driver::new(backend, 2, 0.5);

        let summary = driver.run(&mut store(5, 3), &mut ()).unwrap();

        let pass = |active, remaining| Call::Reduce(Pass { active, remaining });
        let iteration = [
            Call::Compute,
            pass(5, 3),
            pass(3, 2),
            pass(2, 1),
            Call::Integrate(0.5),
        ];
        let expected: Vec<_> = std::iter::once(Call::Upload)
            .chain(iteration)
            .chain(iteration)
            .chain(std::iter::once(Call::Download))
            .collect();

        assert_eq!(driver.backend().calls, expected);
        assert_eq!(driver.state(), State::Done);
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.reduction_passes, 3);
    }

    #[test]
    fn single_source_skips_reduction() {
        let backend = Recorder {
            group_size: 64,
            ..Default::default()
        };
        let mut driver = Driver::new(backend, 1, 1.0);

        let summary = driver.run(&mut store(1, 1), &mut ()).unwrap();

        assert_eq!(summary.reduction_passes, 0);
        assert!(!driver
            .backend()
            .calls
            .iter()
            .any(|call| matches!(call, Call::Reduce(_))));
    }

    #[test]
    fn failure_aborts_the_run() {
        let backend = Recorder {
            group_size: 2,
            fail_on: Some(Stage::Reduce),
            ..Default::default()
        };
        let mut driver = Driver::new(backend, 3, 0.5);

        let error = driver.run(&mut store(5, 3), &mut ()).unwrap_err();

        assert_eq!(error.stage(), Some(Stage::Reduce));
        assert_eq!(driver.state(), State::Reducing);
        // Nothing runs after the failing pass.
        let first_pass = Call::Reduce(Pass {
            active: 5,
            remaining: 3,
        });
        assert_eq!(driver.backend().calls.last(), Some(&first_pass));
        assert!(!driver.backend().calls.contains(&Call::Download));
    }

    #[test]
    fn zero_iterations_still_round_trips() {
        let backend = Recorder {
            group_size: 2,
            ..Default::default()
        };
        let mut driver = Driver::new(backend, 0, 0.5);

        driver.run(&mut store(4, 2), &mut ()).unwrap();

        assert_eq!(driver.backend().calls, [Call::Upload, Call::Download]);
        assert_eq!(driver.state(), State::Done);
    }

    #[test]
    fn report_sees_first_particle() {
        #[derive(Default)]
        struct Positions(Vec<Vec3>);

        impl Report for Positions {
            fn before(&mut self, first: &TestParticle) {
                self.0.push(first.position);
            }

            fn after(&mut self, first: &TestParticle) {
                self.0.push(first.position);
            }
        }

        let backend = Recorder {
            group_size: 2,
            ..Default::default()
        };
        let mut report = Positions::default();

        Driver::new(backend, 1, 0.5)
            .run(&mut store(2, 2), &mut report)
            .unwrap();

        assert_eq!(report.0, [Vec3::X, Vec3::X]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SimulationConfig {
            time_step: f32::INFINITY,
            ..Default::default()
        };

        assert!(matches!(
            Driver::from_config(Recorder::default(), &config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
