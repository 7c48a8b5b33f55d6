use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use pseudo_nbody::prelude::*;
use std::{fs::File, io::BufReader, path::PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Engine {
    Sequential,
    Parallel,
    Gpu,
}

/// Moves test particles through the gravity of fixed source particles and prints the
/// position of the first test particle before and after the run.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Engine running the stages of every iteration.
    #[arg(long, value_enum, default_value_t = Engine::Sequential)]
    engine: Engine,
    /// YAML file with the parameters of the run. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of test particles.
    #[arg(long)]
    tests: Option<usize>,
    /// Number of source particles.
    #[arg(long)]
    sources: Option<usize>,
    /// Number of iterations of the compute, reduce and integrate stages.
    #[arg(long)]
    iterations: Option<usize>,
    /// Time step of one iteration, in seconds.
    #[arg(long)]
    time_step: Option<f32>,
    /// Compute group size, as test particles then source particles.
    #[arg(long, num_args = 2, value_names = ["TESTS", "SOURCES"])]
    compute_group: Option<Vec<u32>>,
    /// Number of elements summed into one by a reduction pass.
    #[arg(long)]
    reduce_group: Option<u32>,
    /// Seed of the particle generator.
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn config(&self) -> Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("could not open {}", path.display()))?;
                serde_yaml::from_reader(BufReader::new(file))
                    .with_context(|| format!("could not parse {}", path.display()))?
            }
            None => SimulationConfig::default(),
        };

        if let Some(tests) = self.tests {
            config.test_particles = tests;
        }
        if let Some(sources) = self.sources {
            config.source_particles = sources;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(time_step) = self.time_step {
            config.time_step = time_step;
        }
        if let Some(&[tests, sources]) = self.compute_group.as_deref() {
            config.groups.compute = [tests, sources];
        }
        if let Some(reduce) = self.reduce_group {
            config.groups.reduce = reduce;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        Ok(config)
    }
}

/// Prints the position of the first test particle with 12 decimals.
struct PrintPosition;

impl PrintPosition {
    fn print(first: &TestParticle) {
        let position = first.position;
        println!(
            "position: ({:.12}, {:.12}, {:.12})",
            position.x, position.y, position.z
        );
    }
}

impl Report for PrintPosition {
    fn before(&mut self, first: &TestParticle) {
        Self::print(first)
    }

    fn after(&mut self, first: &TestParticle) {
        Self::print(first)
    }
}

fn run<B: ComputeBackend>(
    backend: B,
    config: &SimulationConfig,
    store: &mut ParticleStore,
) -> Result<RunSummary> {
    // The configuration is validated once in `main`, before any backend is built.
    let mut driver = Driver::new(backend, config.iterations, config.time_step);
    Ok(driver.run(store, &mut PrintPosition)?)
}

#[cfg(feature = "parallel")]
fn run_parallel(config: &SimulationConfig, store: &mut ParticleStore) -> Result<RunSummary> {
    run(Parallel::new(config.softening, config.groups), config, store)
}

#[cfg(not(feature = "parallel"))]
fn run_parallel(_: &SimulationConfig, _: &mut ParticleStore) -> Result<RunSummary> {
    bail!("testbed was built without the \"parallel\" feature")
}

#[cfg(feature = "gpu")]
fn run_gpu(config: &SimulationConfig, store: &mut ParticleStore) -> Result<RunSummary> {
    let gpu = Gpu::new(GpuContext::new()?, config.softening, config.groups)?;
    run(gpu, config, store)
}

#[cfg(not(feature = "gpu"))]
fn run_gpu(_: &SimulationConfig, _: &mut ParticleStore) -> Result<RunSummary> {
    bail!("testbed was built without the \"gpu\" feature")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config()?;
    config.validate()?;

    log::info!("{:?} engine, {config:?}", args.engine);
    let mut store = config.particles();

    let summary = match args.engine {
        Engine::Sequential => run(Sequential::new(config.softening), &config, &mut store)?,
        Engine::Parallel => run_parallel(&config, &mut store)?,
        Engine::Gpu => run_gpu(&config, &mut store)?,
    };

    println!(
        "{} iterations, {} reduction passes each, in {:?}",
        summary.iterations, summary.reduction_passes, summary.elapsed
    );

    Ok(())
}
