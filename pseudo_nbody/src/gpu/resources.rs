use crate::{config::GroupSizes, particle::SourceParticle, particle::TestParticle};
use bytemuck::{Pod, Zeroable};

/// Workgroup size of the integration kernel.
pub const UPDATE_WORKGROUP_SIZE: u32 = 64;

/// Uniform parameters shared by every kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuParams {
    pub tests: u32,
    pub sources: u32,
    pub active_count: u32,
    pub stride: u32,
    pub softening: f32,
    pub time_step: f32,
    pub padding: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuSource {
    position_mass: [f32; 4],
}

impl From<&SourceParticle> for GpuSource {
    #[inline]
    fn from(source: &SourceParticle) -> Self {
        Self {
            position_mass: source.position.extend(source.mass).to_array(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct GpuTest {
    position: [f32; 4],
    velocity: [f32; 4],
}

impl From<&TestParticle> for GpuTest {
    #[inline]
    fn from(test: &TestParticle) -> Self {
        Self {
            position: test.position.extend(0.0).to_array(),
            velocity: test.velocity.extend(0.0).to_array(),
        }
    }
}

impl From<GpuTest> for TestParticle {
    #[inline]
    fn from(test: GpuTest) -> Self {
        let [px, py, pz, _] = test.position;
        let [vx, vy, vz, _] = test.velocity;
        TestParticle::new(glam::Vec3::new(px, py, pz), glam::Vec3::new(vx, vy, vz))
    }
}

/// Size of one partial acceleration on the GPU. `vec3<f32>` has the alignment of `vec4<f32>`.
pub const ACCELERATION_SIZE: u64 = 16;

/// Buffer recreated whenever the number of items it must hold changes.
///
/// A buffer always holds at least one item, so that it can be bound even when empty.
pub struct DynamicBuffer {
    buffer: wgpu::Buffer,
    label: &'static str,
    item_size: u64,
}

impl DynamicBuffer {
    #[inline]
    fn new(
        device: &wgpu::Device,
        label: &'static str,
        usage: wgpu::BufferUsages,
        item_size: u64,
    ) -> Self {
        Self {
            buffer: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: item_size,
                usage,
                mapped_at_creation: false,
            }),
            label,
            item_size,
        }
    }

    /// Size in bytes needed to hold `len` items.
    #[inline]
    pub fn size_for(&self, len: u64) -> u64 {
        len.max(1).saturating_mul(self.item_size)
    }

    /// Recreates the buffer if it cannot hold exactly `len` items. Returns whether it was
    /// recreated.
    #[inline]
    fn resize(&mut self, device: &wgpu::Device, len: u64) -> bool {
        let size = self.size_for(len);
        if self.buffer.size() == size {
            return false;
        }

        self.buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(self.label),
            size,
            usage: self.buffer.usage(),
            mapped_at_creation: false,
        });

        true
    }

    #[inline]
    pub const fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    #[inline]
    pub fn size(&self) -> wgpu::BufferAddress {
        self.buffer.size()
    }
}

/// Returns the kernels specialised for the given group sizes.
pub fn shader(groups: &GroupSizes) -> String {
    let [compute_tests, compute_sources] = groups.compute;

    include_str!("nbody.wgsl")
        .replace("#COMPUTE_SOURCES", &format!("{compute_sources}u"))
        .replace("#COMPUTE_TESTS", &format!("{compute_tests}u"))
        .replace("#REDUCE_SIZE", &format!("{}u", groups.reduce))
        .replace("#UPDATE_SIZE", &format!("{UPDATE_WORKGROUP_SIZE}u"))
}

/// Every `wgpu` object of the GPU backend.
pub struct WgpuResources {
    pub params: wgpu::Buffer,
    pub sources: DynamicBuffer,
    pub tests: DynamicBuffer,
    pub accelerations: DynamicBuffer,
    pub staging: DynamicBuffer,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    pub compute: wgpu::ComputePipeline,
    pub reduce: wgpu::ComputePipeline,
    pub update: wgpu::ComputePipeline,
}

impl WgpuResources {
    /// Builds the pipelines of the kernels specialised for `groups`, with empty buffers.
    pub fn new(device: &wgpu::Device, groups: &GroupSizes) -> Self {
        let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Particles layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage(1, true),
                storage(2, false),
                storage(3, false),
            ],
        });

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Params buffer"),
            size: std::mem::size_of::<GpuParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let storage_usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let sources = DynamicBuffer::new(
            device,
            "Sources buffer",
            storage_usage,
            std::mem::size_of::<GpuSource>() as u64,
        );
        let tests = DynamicBuffer::new(
            device,
            "Tests buffer",
            storage_usage,
            std::mem::size_of::<GpuTest>() as u64,
        );
        let accelerations = DynamicBuffer::new(
            device,
            "Accelerations buffer",
            storage_usage,
            ACCELERATION_SIZE,
        );
        let staging = DynamicBuffer::new(
            device,
            "Staging buffer",
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            1,
        );

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Particles pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("N-body kernels"),
            source: wgpu::ShaderSource::Wgsl(shader(groups).into()),
        });

        let pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            })
        };
        let (compute, reduce, update) = (pipeline("compute"), pipeline("reduce"), pipeline("update"));

        let bind_group = Self::create_bind_group(
            device,
            &bind_group_layout,
            &params,
            [&sources, &tests, &accelerations],
        );

        Self {
            params,
            sources,
            tests,
            accelerations,
            staging,
            bind_group_layout,
            bind_group,
            compute,
            reduce,
            update,
        }
    }

    fn create_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        params: &wgpu::Buffer,
        [sources, tests, accelerations]: [&DynamicBuffer; 3],
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Particles bind group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: sources.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: tests.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: accelerations.buffer().as_entire_binding(),
                },
            ],
        })
    }

    /// Sizes every buffer for `tests` test particles and `sources` source particles, and
    /// returns the number of bytes of the storage buffers.
    pub fn resize(&mut self, device: &wgpu::Device, tests: u64, sources: u64) -> u64 {
        let mut recreated = self.sources.resize(device, sources);
        recreated |= self.tests.resize(device, tests);
        recreated |= self.accelerations.resize(device, tests.saturating_mul(sources));

        // Large enough to read back either the test particles or the accelerations.
        let staging = self.tests.size().max(self.accelerations.size());
        self.staging.resize(device, staging);

        if recreated {
            self.bind_group = Self::create_bind_group(
                device,
                &self.bind_group_layout,
                &self.params,
                [&self.sources, &self.tests, &self.accelerations],
            );
        }

        self.sources.size() + self.tests.size() + self.accelerations.size()
    }

    #[inline]
    pub const fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}
