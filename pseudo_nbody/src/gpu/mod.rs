mod resources;

use crate::{
    config::GroupSizes,
    error::{Error, Result, Stage},
    particle::{ParticleStore, TestParticle},
    reduce::{Pass, ReductionPlan},
    ComputeBackend,
};
use bytemuck::Pod;
use glam::Vec3;
use resources::{
    GpuParams, GpuSource, GpuTest, WgpuResources, ACCELERATION_SIZE, UPDATE_WORKGROUP_SIZE,
};

/// Device and queue used by a [`Gpu`] backend.
pub struct GpuContext {
    /// Device the buffers and pipelines are created on.
    pub device: wgpu::Device,
    /// Queue the dispatches are submitted to.
    pub queue: wgpu::Queue,
    /// Information about the adapter of the device.
    pub adapter: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Requests the default adapter and a device with its limits, blocking until ready.
    #[inline]
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    /// Requests the default adapter and a device with its limits.
    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::default();

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::Bootstrap("no suitable GPU adapter".into()))?;

        let info = adapter.get_info();
        log::info!("Using GPU: {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("pseudo_nbody device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| Error::Bootstrap(format!("could not create device: {e}")))?;

        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            log::error!("GPU uncaptured error: {error}");
        }));

        Ok(Self {
            device,
            queue,
            adapter: info,
        })
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug)]
enum Kernel {
    Compute,
    Reduce,
    Update,
}

/// Backend running every stage on the GPU with [wgpu](https://github.com/gfx-rs/wgpu).
///
/// Each stage is one or more dispatches of the kernels in `nbody.wgsl`. Every dispatch is
/// submitted on its own and waited for before the next one is encoded, which is the barrier
/// between stages. Device errors raised while a stage is encoded or submitted are captured
/// with error scopes and returned as [`Error`]s of that stage.
///
/// - the acceleration computation runs one invocation per (test, source) pair, in
///   workgroups of `groups.compute[0]` test particles by `groups.compute[1]` source
///   particles,
/// - every reduction pass runs one workgroup of `groups.reduce` invocations per block of
///   active columns, summing the block in workgroup memory,
/// - the integration runs one invocation per test particle.
///
/// Test particles are spread over two dimensions of the dispatch grid, so their count is
/// not bound by the per-dimension workgroup limit.
///
/// Reduction passes do not move the partial sums: after `k` passes, active element `e` of
/// a row lives in column `e * groups.reduce^k`, so the total always ends up in column 0.
pub struct Gpu {
    context: GpuContext,
    softening: f32,
    groups: GroupSizes,
    resources: WgpuResources,
    tests: u32,
    sources: u32,
    active: u32,
    stride: u32,
}

impl Gpu {
    /// Creates a new [`Gpu`] backend on `context`, building the kernels for the given
    /// softening parameter and group sizes.
    pub fn new(context: GpuContext, softening: f32, groups: GroupSizes) -> Result<Self> {
        check_groups(&groups, &context.device.limits())?;

        let resources = scoped(&context.device, None, || {
            WgpuResources::new(&context.device, &groups)
        })?;

        log::debug!("GPU kernels built for groups {groups:?}");

        Ok(Self {
            context,
            softening,
            groups,
            resources,
            tests: 0,
            sources: 0,
            active: 0,
            stride: 1,
        })
    }

    /// Returns the device and queue of this backend.
    #[inline]
    pub const fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Reads back the total acceleration of every test particle.
    ///
    /// Only meaningful once every reduction pass of the current iteration is done.
    pub fn totals(&self) -> Result<Vec<Vec3>> {
        if self.sources == 0 {
            return Ok(vec![Vec3::ZERO; self.tests as usize]);
        }

        let len = u64::from(self.tests) * u64::from(self.sources);
        let accelerations: Vec<[f32; 4]> =
            self.read(self.resources.accelerations.buffer(), len)?;

        Ok(accelerations
            .chunks_exact(self.sources as usize)
            .map(|row| Vec3::from_slice(&row[0]))
            .collect())
    }

    fn params(&self, time_step: f32) -> GpuParams {
        GpuParams {
            tests: self.tests,
            sources: self.sources,
            active_count: self.active,
            stride: self.stride,
            softening: self.softening,
            time_step,
            padding: [0; 2],
        }
    }

    #[inline]
    fn max_workgroups(&self) -> u32 {
        self.context.device.limits().max_compute_workgroups_per_dimension
    }

    fn dispatch(
        &self,
        stage: Stage,
        kernel: Kernel,
        workgroups: [u32; 3],
        params: GpuParams,
    ) -> Result<()> {
        let max = self.max_workgroups();
        if workgroups.iter().any(|&count| count > max) {
            return Err(Error::Dispatch {
                stage,
                message: format!("{workgroups:?} workgroups exceed the limit of {max}"),
            });
        }

        let GpuContext { device, queue, .. } = &self.context;
        let pipeline = match kernel {
            Kernel::Compute => &self.resources.compute,
            Kernel::Reduce => &self.resources.reduce,
            Kernel::Update => &self.resources.update,
        };

        let index = scoped(device, Some(stage), || {
            queue.write_buffer(&self.resources.params, 0, bytemuck::bytes_of(&params));

            let mut encoder =
                device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: None,
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, self.resources.bind_group(), &[]);
                let [x, y, z] = workgroups;
                pass.dispatch_workgroups(x, y, z);
            }

            queue.submit([encoder.finish()])
        })?;

        device.poll(wgpu::Maintain::wait_for(index));

        Ok(())
    }

    fn read<T: Pod>(&self, source: &wgpu::Buffer, len: u64) -> Result<Vec<T>> {
        let stage = Stage::Download;
        let size = len * std::mem::size_of::<T>() as u64;
        if size == 0 {
            return Ok(Vec::new());
        }

        let GpuContext { device, queue, .. } = &self.context;
        let staging = self.resources.staging.buffer();

        let index = scoped(device, Some(stage), || {
            let mut encoder =
                device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            encoder.copy_buffer_to_buffer(source, 0, staging, 0, size);
            queue.submit([encoder.finish()])
        })?;

        let slice = staging.slice(..size);
        let (sender, receiver) = flume::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver only goes away once this function returned.
            let _ = sender.send(result);
        });
        device.poll(wgpu::Maintain::wait_for(index));

        let transfer = |message: String| Error::Transfer { stage, message };
        pollster::block_on(receiver.recv_async())
            .map_err(|_| transfer("mapping callback dropped, device lost".into()))?
            .map_err(|e| transfer(e.to_string()))?;

        let data = bytemuck::cast_slice::<u8, T>(&slice.get_mapped_range()).to_vec();
        staging.unmap();

        Ok(data)
    }
}

impl ComputeBackend for Gpu {
    fn upload(&mut self, store: &ParticleStore) -> Result<()> {
        let stage = Stage::Upload;
        let (tests, sources) = (store.tests().len() as u64, store.sources().len() as u64);

        let limits = self.context.device.limits();
        let max = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        let bytes = tests.saturating_mul(sources).saturating_mul(ACCELERATION_SIZE);
        if bytes > max || tests > u64::from(u32::MAX) || sources > u64::from(u32::MAX) {
            return Err(Error::Allocation { stage, bytes });
        }

        let gpu_sources: Vec<GpuSource> = store.sources().iter().map(GpuSource::from).collect();
        let gpu_tests: Vec<GpuTest> = store.tests().iter().map(GpuTest::from).collect();

        let Self {
            context, resources, ..
        } = self;
        let (device, queue) = (&context.device, &context.queue);
        let allocated = scoped(device, Some(stage), || {
            let allocated = resources.resize(device, tests, sources);
            if !gpu_sources.is_empty() {
                let data = bytemuck::cast_slice(&gpu_sources);
                queue.write_buffer(resources.sources.buffer(), 0, data);
            }
            if !gpu_tests.is_empty() {
                queue.write_buffer(resources.tests.buffer(), 0, bytemuck::cast_slice(&gpu_tests));
            }
            allocated
        })
        .map_err(|e| match e {
            Error::Allocation { stage, .. } => Error::Allocation { stage, bytes },
            e => e,
        })?;

        self.tests = tests as u32;
        self.sources = sources as u32;
        self.active = self.sources;
        self.stride = 1;

        log::debug!("Uploaded particles to the GPU, {allocated} bytes of storage");

        Ok(())
    }

    fn compute_accelerations(&mut self) -> Result<()> {
        self.active = self.sources;
        self.stride = 1;

        if self.tests == 0 || self.sources == 0 {
            return Ok(());
        }

        let [group_tests, group_sources] = self.groups.compute;
        let [y, z] = grid(self.tests.div_ceil(group_tests), self.max_workgroups());
        let workgroups = [self.sources.div_ceil(group_sources), y, z];

        self.dispatch(Stage::Compute, Kernel::Compute, workgroups, self.params(0.0))
    }

    #[inline]
    fn reduction_plan(&self) -> ReductionPlan {
        ReductionPlan::new(self.sources as usize, self.groups.reduce as usize)
    }

    fn reduce(&mut self, pass: Pass) -> Result<()> {
        debug_assert_eq!(pass.active, self.active as usize);

        if self.tests > 0 {
            let [y, z] = grid(self.tests, self.max_workgroups());
            let workgroups = [self.active.div_ceil(self.groups.reduce), y, z];
            self.dispatch(Stage::Reduce, Kernel::Reduce, workgroups, self.params(0.0))?;
        }

        self.active = pass.remaining as u32;
        self.stride = self.stride.saturating_mul(self.groups.reduce);

        Ok(())
    }

    fn integrate(&mut self, time_step: f32) -> Result<()> {
        if self.tests == 0 {
            return Ok(());
        }

        let [x, y] = grid(self.tests.div_ceil(UPDATE_WORKGROUP_SIZE), self.max_workgroups());
        let workgroups = [x, y, 1];
        self.dispatch(Stage::Integrate, Kernel::Update, workgroups, self.params(time_step))
    }

    fn download(&mut self, tests: &mut [TestParticle]) -> Result<()> {
        let particles: Vec<GpuTest> =
            self.read(self.resources.tests.buffer(), u64::from(self.tests))?;

        for (test, particle) in tests.iter_mut().zip(particles) {
            *test = particle.into();
        }

        Ok(())
    }
}

/// Spreads `count` workgroups over two dimensions of at most `max` workgroups each.
///
/// The kernels skip the workgroups past `count` in the last slice.
#[inline]
fn grid(count: u32, max: u32) -> [u32; 2] {
    let first = count.min(max).max(1);
    [first, count.div_ceil(first)]
}

/// Rejects group sizes the device cannot run.
fn check_groups(groups: &GroupSizes, limits: &wgpu::Limits) -> Result<()> {
    let [group_tests, group_sources] = groups.compute;
    let invalid = |message: String| Err(Error::InvalidConfig(message));

    if group_tests == 0 || group_sources == 0 || groups.reduce < 2 {
        return invalid(format!("unusable group sizes {groups:?}"));
    }
    if group_sources > limits.max_compute_workgroup_size_x
        || group_tests > limits.max_compute_workgroup_size_y
        || group_sources.saturating_mul(group_tests)
            > limits.max_compute_invocations_per_workgroup
    {
        let compute = groups.compute;
        return invalid(format!("compute group {compute:?} exceeds the device limits"));
    }
    if groups.reduce > limits.max_compute_workgroup_size_x
        || groups.reduce > limits.max_compute_invocations_per_workgroup
        || u64::from(groups.reduce) * ACCELERATION_SIZE
            > u64::from(limits.max_compute_workgroup_storage_size)
    {
        return invalid(format!("reduce group {} exceeds the device limits", groups.reduce));
    }

    Ok(())
}

/// Runs `f` inside validation and out-of-memory error scopes and converts the captured
/// errors into errors of `stage`.
///
/// Without a stage, any captured error becomes an [`Error::Bootstrap`]: nothing runs before
/// the first stage except the construction of the kernels.
fn scoped<T>(device: &wgpu::Device, stage: Option<Stage>, f: impl FnOnce() -> T) -> Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let value = f();

    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());

    let Some(error) = out_of_memory.or(validation) else {
        return Ok(value);
    };

    let message = error.to_string();
    Err(match (stage, error) {
        (None, _) => Error::Bootstrap(message),
        (Some(stage), wgpu::Error::OutOfMemory { .. }) => Error::Allocation { stage, bytes: 0 },
        (Some(stage @ (Stage::Upload | Stage::Download)), _) => Error::Transfer { stage, message },
        (Some(stage), _) => Error::Dispatch { stage, message },
    })
}
