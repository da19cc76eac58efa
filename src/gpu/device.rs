// gpu/device.rs — wgpu compute backend.
//
// Responsibilities:
//   - Enumerate adapters and pick one with `select_device`.
//   - Turn a specialised WGSL template into one compute pipeline per entry
//     point, with an explicit bind group layout derived from the entry's
//     declared arguments.
//   - Storage-buffer allocation, blocking upload/readback, dispatch.
//
// ADAPTER SELECTION:
// wgpu exposes no compute-unit count or clock rate, so the selection score
// is estimated from the adapter's device type (see `estimate_capacity`).
// Software rasterisers (llvmpipe, WARP) report DeviceType::Cpu and are only
// accepted when `allow_software` is set.
//
// ARGUMENT BINDINGS:
// Kernel argument `i` is not binding `i`. Buffer arguments take bindings
// 0, 1, 2, ... in argument order; all scalar arguments are packed into one
// uniform block (each scalar aligned to its own size, the block padded to
// 16 bytes) bound after the last buffer. WGSL sources declare their
// `@group(0) @binding(n)` variables to match.
//
// ERROR SCOPES:
// wgpu reports shader and pipeline errors asynchronously through the
// uncaptured-error handler, which panics by default. Module and pipeline
// creation run inside a Validation scope and allocations inside an
// OutOfMemory scope so both come back as `GpuError` values.
//
// Field drop order: `_instance` is declared last so the instance outlives
// `device` and `queue` (dzn on WSL2 crashes otherwise).

use std::collections::HashMap;

use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

use crate::error::{GpuError, Result};
use crate::gpu::backend::{
    CompiledInner, CompiledProgram, ComputeBackend, DeviceInfo, DeviceKind, DeviceMemory, KernelArg, Launch,
    MemoryHandle,
};
use crate::gpu::buffer::align_to;
use crate::gpu::kernel::{ArgKind, Defines, EntryPoint, KernelSource};
use crate::image::PixelType;

const BACKENDS: wgpu::Backends = wgpu::Backends::PRIMARY;

// ============================================================
// Device selection
// ============================================================

/// Index of the best candidate, or `None` when nothing qualifies.
///
/// Candidates are narrowed to those whose platform or name contains
/// `filter` (case-insensitive); if none match, every candidate stays in
/// play. Software devices are dropped unless `allow_software`. The survivor
/// with the highest [`DeviceInfo::estimated_flops`] wins; ties go to the
/// first enumerated.
pub fn select_device(candidates: &[DeviceInfo], filter: Option<&str>, allow_software: bool) -> Option<usize> {
    let mut pool: Vec<usize> = (0..candidates.len()).collect();
    if let Some(f) = filter {
        let needle = f.to_ascii_lowercase();
        let matching: Vec<usize> = pool
            .iter()
            .copied()
            .filter(|&i| {
                let c = &candidates[i];
                c.platform.to_ascii_lowercase().contains(&needle) || c.name.to_ascii_lowercase().contains(&needle)
            })
            .collect();
        if matching.is_empty() {
            debug!(filter = f, "no platform matches; considering all devices");
        } else {
            pool = matching;
        }
    }
    pool.retain(|&i| allow_software || candidates[i].kind != DeviceKind::Software);
    pool.into_iter().rev().max_by_key(|&i| candidates[i].estimated_flops())
}

/// Compute units and clock stand-ins for a wgpu adapter.
///
/// Tiers, from most to least preferred: discrete, integrated, virtual,
/// other, software. Work-group capacity breaks ties within a tier.
fn estimate_capacity(kind: DeviceKind, max_invocations: u32) -> (u32, u32) {
    let units = match kind {
        DeviceKind::DiscreteGpu => 64,
        DeviceKind::IntegratedGpu => 16,
        DeviceKind::VirtualGpu => 8,
        DeviceKind::Other => 4,
        DeviceKind::Software | DeviceKind::Host => 1,
    };
    (units, 1000 + max_invocations)
}

fn device_kind(t: wgpu::DeviceType) -> DeviceKind {
    match t {
        wgpu::DeviceType::DiscreteGpu => DeviceKind::DiscreteGpu,
        wgpu::DeviceType::IntegratedGpu => DeviceKind::IntegratedGpu,
        wgpu::DeviceType::VirtualGpu => DeviceKind::VirtualGpu,
        wgpu::DeviceType::Cpu => DeviceKind::Software,
        wgpu::DeviceType::Other => DeviceKind::Other,
    }
}

fn describe(adapter: &wgpu::Adapter) -> DeviceInfo {
    let raw = adapter.get_info();
    let limits = adapter.limits();
    let kind = device_kind(raw.device_type);
    let (compute_units, clock_mhz) = estimate_capacity(kind, limits.max_compute_invocations_per_workgroup);
    DeviceInfo {
        name: raw.name.clone(),
        platform: format!("{:?} {}", raw.backend, raw.driver).trim().to_string(),
        kind,
        compute_units,
        clock_mhz,
        max_workgroup_size: limits.max_compute_invocations_per_workgroup as usize,
        max_allocation: limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64),
        supports_f64: adapter.features().contains(wgpu::Features::SHADER_F64),
    }
}

fn new_instance() -> wgpu::Instance {
    let flags = if cfg!(debug_assertions) {
        wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    } else {
        wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    };
    wgpu::Instance::new(wgpu::InstanceDescriptor { backends: BACKENDS, flags, ..Default::default() })
}

/// Whether a device matching `filter` exists. Enumerates adapters only;
/// no device is created.
pub fn is_gpu_available(filter: Option<&str>, allow_software: bool) -> bool {
    let instance = new_instance();
    let infos: Vec<DeviceInfo> = instance.enumerate_adapters(BACKENDS).iter().map(describe).collect();
    select_device(&infos, filter, allow_software).is_some()
}

// ============================================================
// Backend
// ============================================================

/// Compiled pipelines of one program, by entry point name.
pub(crate) struct WgpuProgram {
    entries: HashMap<&'static str, (wgpu::ComputePipeline, wgpu::BindGroupLayout)>,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    _instance: wgpu::Instance,
}

impl WgpuBackend {
    /// Open the adapter `select_device` prefers.
    pub fn new(filter: Option<&str>, allow_software: bool) -> Result<Self> {
        pollster::block_on(Self::init_async(filter, allow_software))
    }

    async fn init_async(filter: Option<&str>, allow_software: bool) -> Result<Self> {
        let unavailable = || GpuError::DeviceUnavailable { filter: filter.map(str::to_string) };
        let instance = new_instance();
        let mut adapters = instance.enumerate_adapters(BACKENDS);
        let infos: Vec<DeviceInfo> = adapters.iter().map(describe).collect();
        for i in &infos {
            debug!(adapter = %i, "candidate adapter");
        }
        let chosen = select_device(&infos, filter, allow_software).ok_or_else(unavailable)?;
        let adapter = adapters.swap_remove(chosen);
        let info = infos[chosen].clone();

        let required_features =
            if info.supports_f64 { wgpu::Features::SHADER_F64 } else { wgpu::Features::empty() };
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("fdgpu"),
                    required_features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| {
                warn!(adapter = %info.name, error = %e, "device request failed");
                unavailable()
            })?;

        info!(adapter = %info, "wgpu device opened");
        Ok(WgpuBackend { device, queue, info, _instance: instance })
    }

    fn check_queue(&self, queue: usize) -> Result<()> {
        if queue != 0 {
            return Err(GpuError::InvalidQueue { id: queue, count: 1 });
        }
        Ok(())
    }

    fn pipeline_for(&self, module: &wgpu::ShaderModule, entry: &EntryPoint) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
        let mut layout_entries = Vec::new();
        let mut binding = 0u32;
        for kind in entry.args {
            let read_only = match kind {
                ArgKind::Buffer => true,
                ArgKind::BufferMut => false,
                ArgKind::Scalar => continue,
            };
            layout_entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
            binding += 1;
        }
        if entry.args.contains(&ArgKind::Scalar) {
            layout_entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let bgl = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(entry.name),
            entries: &layout_entries,
        });
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(entry.name),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry.name),
            layout: Some(&layout),
            module,
            entry_point: entry.name,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        (pipeline, bgl)
    }
}

fn wgpu_buffer(mem: &DeviceMemory) -> Result<&wgpu::Buffer> {
    match mem.handle() {
        MemoryHandle::Wgpu(b) => Ok(b.as_ref()),
        MemoryHandle::Host(_) => Err(GpuError::InvalidArgument("host allocation handed to the wgpu backend".into())),
    }
}

impl ComputeBackend for WgpuBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn queue_count(&self) -> usize {
        1
    }

    fn supports(&self, pixel: PixelType) -> bool {
        match pixel {
            PixelType::Double => self.info.supports_f64,
            p => p.wgsl_name().is_some(),
        }
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceMemory> {
        let padded = align_to(bytes, wgpu::COPY_BUFFER_ALIGNMENT as usize);
        if bytes == 0 || padded as u64 > self.info.max_allocation {
            return Err(GpuError::DeviceAllocation {
                bytes,
                reason: format!("outside 1..={} bytes", self.info.max_allocation),
            });
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fdgpu storage"),
            size: padded as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::DeviceAllocation { bytes, reason: e.to_string() });
        }
        Ok(DeviceMemory::from_wgpu(buffer, padded))
    }

    fn write(&self, queue: usize, mem: &DeviceMemory, data: &[u8]) -> Result<()> {
        self.check_queue(queue)?;
        let buffer = wgpu_buffer(mem)?;
        if data.len() > mem.len_bytes() {
            return Err(GpuError::Transfer(format!("write of {} bytes into {} byte buffer", data.len(), mem.len_bytes())));
        }
        if data.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize == 0 {
            self.queue.write_buffer(buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align_to(data.len(), wgpu::COPY_BUFFER_ALIGNMENT as usize), 0);
            self.queue.write_buffer(buffer, 0, &padded);
        }
        Ok(())
    }

    fn read(&self, queue: usize, mem: &DeviceMemory, out: &mut [u8]) -> Result<()> {
        self.check_queue(queue)?;
        let buffer = wgpu_buffer(mem)?;
        if out.len() > mem.len_bytes() {
            return Err(GpuError::Transfer(format!("read of {} bytes from {} byte buffer", out.len(), mem.len_bytes())));
        }
        if out.is_empty() {
            return Ok(());
        }
        let size = align_to(out.len(), wgpu::COPY_BUFFER_ALIGNMENT as usize) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fdgpu readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder =
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("fdgpu readback") });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| GpuError::Transfer("readback callback never fired".into()))?
            .map_err(|e| GpuError::Transfer(format!("readback map failed: {e}")))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        staging.unmap();
        Ok(())
    }

    fn build(&self, source: &'static KernelSource, defines: &Defines) -> Result<CompiledProgram> {
        let compile_error = |log: String| GpuError::Compile { program: source.id.to_string(), log };
        let wgsl = defines.substitute(source.wgsl).map_err(compile_error)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.id),
            source: wgpu::ShaderSource::Wgsl(wgsl.into()),
        });
        let mut entries = HashMap::new();
        for entry in source.entry_points {
            entries.insert(entry.name, self.pipeline_for(&module, entry));
        }
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(compile_error(e.to_string()));
        }
        Ok(CompiledProgram { inner: CompiledInner::Wgpu(WgpuProgram { entries }) })
    }

    fn dispatch(&self, queue: usize, launch: &Launch<'_>) -> Result<()> {
        self.check_queue(queue)?;
        let CompiledInner::Wgpu(program) = launch.program.compiled() else {
            return Err(GpuError::InvalidArgument("program was not built by the wgpu backend".into()));
        };
        let name = launch.entry.name;
        let (pipeline, bgl) = program.entries.get(name).ok_or_else(|| GpuError::KernelNotFound(name.to_string()))?;

        let groups = launch.groups();
        let limits = self.device.limits();
        let max_groups = limits.max_compute_workgroups_per_dimension as usize;
        let max_local = [
            limits.max_compute_workgroup_size_x as usize,
            limits.max_compute_workgroup_size_y as usize,
            limits.max_compute_workgroup_size_z as usize,
        ];
        if (0..3).any(|d| groups[d] > max_groups || launch.local[d] > max_local[d]) {
            return Err(GpuError::InvalidWorkGroupSize {
                global: launch.global[..launch.dims].to_vec(),
                local: launch.local[..launch.dims].to_vec(),
            });
        }

        let mut storage = Vec::new();
        let mut uniform: Vec<u8> = Vec::new();
        for arg in launch.args {
            match arg {
                KernelArg::Buffer(mem) => storage.push(wgpu_buffer(mem)?),
                KernelArg::Scalar(bytes) => {
                    let offset = align_to(uniform.len(), bytes.len());
                    uniform.resize(offset, 0);
                    uniform.extend_from_slice(bytes);
                }
            }
        }
        let params = if launch.entry.args.contains(&ArgKind::Scalar) {
            uniform.resize(align_to(uniform.len().max(1), 16), 0);
            Some(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("fdgpu params"),
                contents: &uniform,
                usage: wgpu::BufferUsages::UNIFORM,
            }))
        } else {
            None
        };

        let mut entries: Vec<wgpu::BindGroupEntry> = storage
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry { binding: i as u32, resource: b.as_entire_binding() })
            .collect();
        if let Some(p) = &params {
            entries.push(wgpu::BindGroupEntry { binding: storage.len() as u32, resource: p.as_entire_binding() });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group =
            self.device.create_bind_group(&wgpu::BindGroupDescriptor { label: Some(name), layout: bgl, entries: &entries });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
        {
            let mut pass =
                encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some(name), timestamp_writes: None });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0] as u32, groups[1] as u32, groups[2] as u32);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::InvalidArgument(format!("dispatch of `{name}` rejected: {e}")));
        }
        Ok(())
    }
}

// ============================================================
// Tests
// ============================================================
