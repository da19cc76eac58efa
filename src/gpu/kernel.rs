// gpu/kernel.rs — Kernel program manager.
//
// A kernel program is a WGSL template plus a define block. The define block
// plays the role of a C preprocessor header: it fixes dimensionality, pixel
// type and block size for one instantiation. Rendered as text
// (`#define KEY VALUE` lines) it is the program cache key; substituted into
// `{{KEY}}` placeholders it specialises the WGSL source.
//
// naga does not accept `override` expressions in `@workgroup_size` or array
// lengths, so sizes that shape local memory are baked in by substitution
// rather than pipeline-overridable constants.
//
// `KernelManager` mirrors the classic handle-based flow:
//
//   load_program → create_kernel(name) → set_kernel_arg*(handle, i, ...) → launch
//
// Argument slots must be bound contiguously from index 0 before launch. A
// buffer argument is held by reference to its buffer manager and resolved
// (host → device sync) both when it is bound and again at launch, so host
// writes made between the two are never handed to the device stale.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::trace;

use crate::error::{GpuError, Result};
use crate::gpu::backend::{KernelArg, Launch, Program};
use crate::gpu::buffer::{BufferManager, DeviceBinding};
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::image::{Geometry, PixelType};

// ---------------------------------------------------------------------------
// Kernel sources
// ---------------------------------------------------------------------------

/// Declared kind of one kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Storage buffer the kernel only reads.
    Buffer,
    /// Storage buffer the kernel writes.
    BufferMut,
    /// 4- or 8-byte scalar, packed into the launch's uniform block.
    Scalar,
}

/// Host emulation of one entry point.
pub type HostKernelFn = fn(&mut HostLaunch<'_>) -> Result<()>;

/// One `@compute` entry point of a kernel source.
pub struct EntryPoint {
    pub name: &'static str,
    pub args: &'static [ArgKind],
    pub host: HostKernelFn,
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoint").field("name", &self.name).field("args", &self.args).finish()
    }
}

/// A kernel program template.
#[derive(Debug)]
pub struct KernelSource {
    pub id: &'static str,
    pub wgsl: &'static str,
    pub entry_points: &'static [EntryPoint],
}

// ---------------------------------------------------------------------------
// Defines
// ---------------------------------------------------------------------------

/// Preprocessor-style define block for one program instantiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Defines {
    values: BTreeMap<String, String>,
    pixels: BTreeMap<String, PixelType>,
}

impl Defines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(mut self, key: &str, value: impl ToString) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    /// `DIM_<d>` marker plus `DIM = d`.
    pub fn dim(self, d: usize) -> Self {
        self.define(&format!("DIM_{d}"), 1).define("DIM", d)
    }

    /// Bind a pixel type to `key`.
    pub fn pixel(mut self, key: &str, pixel: PixelType) -> Self {
        self.pixels.insert(key.to_string(), pixel);
        self
    }

    /// `WG_X`, `WG_Y`, `WG_Z` work-group extents.
    pub fn workgroup(self, local: [usize; 3]) -> Self {
        self.define("WG_X", local[0]).define("WG_Y", local[1]).define("WG_Z", local[2])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn pixel_type(&self, key: &str) -> Option<PixelType> {
        self.pixels.get(key).copied()
    }

    pub fn pixel_types(&self) -> impl Iterator<Item = PixelType> + '_ {
        self.pixels.values().copied()
    }

    pub fn needs_f64(&self) -> bool {
        self.pixels.values().any(|&p| p == PixelType::Double)
    }

    /// Text form: used as the cache key and in build diagnostics.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.needs_f64() {
            out.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n");
        }
        for (k, p) in &self.pixels {
            out.push_str(&format!("#define {k} {}\n", p.cl_name()));
        }
        for (k, v) in &self.values {
            out.push_str(&format!("#define {k} {v}\n"));
        }
        out
    }

    /// Replace `{{KEY}}` placeholders in `template`.
    ///
    /// Fails with the list of placeholders left unresolved, which includes
    /// pixel types that have no WGSL spelling.
    pub fn substitute(&self, template: &str) -> std::result::Result<String, String> {
        let mut src = template.to_string();
        for (k, v) in &self.values {
            src = src.replace(&format!("{{{{{k}}}}}"), v);
        }
        for (k, p) in &self.pixels {
            if let Some(name) = p.wgsl_name() {
                src = src.replace(&format!("{{{{{k}}}}}"), name);
            }
        }

        let mut missing = Vec::new();
        let mut rest = src.as_str();
        while let Some(start) = rest.find("{{") {
            let tail = &rest[start + 2..];
            match tail.find("}}") {
                Some(end) => {
                    missing.push(tail[..end].to_string());
                    rest = &tail[end + 2..];
                }
                None => break,
            }
        }
        if missing.is_empty() {
            Ok(src)
        } else {
            missing.sort();
            missing.dedup();
            Err(format!("unresolved template placeholders: {}", missing.join(", ")))
        }
    }
}

/// Round a logical extent up to the next multiple of the local size.
pub fn round_up_global(extent: usize, local: usize) -> usize {
    extent.div_ceil(local) * local
}

/// Work-group shape for image-shaped kernels: 256 invocations at most.
pub fn image_local_size(dim: usize) -> [usize; 3] {
    match dim {
        1 => [64, 1, 1],
        2 => [16, 16, 1],
        _ => [8, 8, 4],
    }
}

/// Global size covering `geometry`, each axis rounded up to the local size.
pub fn image_global_size(geometry: &Geometry) -> [usize; 3] {
    let local = image_local_size(geometry.dim());
    let extent = geometry.extent();
    [
        round_up_global(extent[0], local[0]),
        round_up_global(extent[1], local[1]),
        round_up_global(extent[2], local[2]),
    ]
}

/// Scalar uniform words shared by image-shaped kernels: extent and component count.
pub fn image_extent_args(geometry: &Geometry) -> [u32; 4] {
    let e = geometry.extent();
    [e[0] as u32, e[1] as u32, e[2] as u32, geometry.components() as u32]
}

// ---------------------------------------------------------------------------
// KernelManager
// ---------------------------------------------------------------------------

/// Index of a kernel created by [`KernelManager::create_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(usize);

enum BoundArg {
    Scalar(Vec<u8>),
    Buffer(Arc<dyn DeviceBinding>),
}

struct KernelSlot {
    entry: &'static EntryPoint,
    args: Vec<Option<BoundArg>>,
}

/// Loads one program and manages its kernel handles and argument slots.
pub struct KernelManager {
    ctx: Arc<DeviceContext>,
    program: Option<Arc<Program>>,
    kernels: Vec<KernelSlot>,
    queue: usize,
}

impl KernelManager {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        KernelManager { ctx, program: None, kernels: Vec::new(), queue: 0 }
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Build (or fetch from the context cache) `source` with `defines`.
    ///
    /// Existing kernel handles are invalidated.
    pub fn load_program(&mut self, source: &'static KernelSource, defines: &Defines) -> Result<()> {
        let program = self.ctx.load_program(source, defines)?;
        self.program = Some(program);
        self.kernels.clear();
        Ok(())
    }

    pub fn program(&self) -> Option<&Arc<Program>> {
        self.program.as_ref()
    }

    /// Handle for the entry point `name` of the loaded program.
    pub fn create_kernel(&mut self, name: &str) -> Result<KernelHandle> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| GpuError::InvalidArgument(format!("no program loaded; cannot create `{name}`")))?;
        let entry = program.entry(name).ok_or_else(|| GpuError::KernelNotFound(name.to_string()))?;
        self.kernels.push(KernelSlot { entry, args: (0..entry.args.len()).map(|_| None).collect() });
        Ok(KernelHandle(self.kernels.len() - 1))
    }

    /// Bind raw scalar bytes (4 or 8) to argument `index`.
    pub fn set_kernel_arg(&mut self, handle: KernelHandle, index: usize, value: &[u8]) -> Result<()> {
        if value.len() != 4 && value.len() != 8 {
            return Err(GpuError::InvalidArgument(format!(
                "scalar argument {index} must be 4 or 8 bytes, got {}",
                value.len()
            )));
        }
        let slot = self.slot_for(handle, index, ArgKind::Scalar)?;
        *slot = Some(BoundArg::Scalar(value.to_vec()));
        Ok(())
    }

    pub fn set_kernel_arg_scalar<S: Pod>(&mut self, handle: KernelHandle, index: usize, value: S) -> Result<()> {
        self.set_kernel_arg(handle, index, bytemuck::bytes_of(&value))
    }

    /// Bind a buffer argument. Pending host writes are pushed to the device
    /// now and again at launch.
    pub fn set_kernel_arg_with_buffer<T: Pod + Send + Sync>(
        &mut self,
        handle: KernelHandle,
        index: usize,
        buffer: &Arc<BufferManager<T>>,
    ) -> Result<()> {
        let kind = self.kernel(handle)?.entry.args.get(index).copied();
        let writable = match kind {
            Some(ArgKind::BufferMut) => true,
            Some(ArgKind::Buffer) => false,
            Some(ArgKind::Scalar) => {
                return Err(GpuError::InvalidArgument(format!("argument {index} is a scalar, got a buffer")))
            }
            None => return Err(self.arity_error(handle, index)),
        };
        buffer.bind(writable)?;
        let binding: Arc<dyn DeviceBinding> = buffer.clone();
        let slot = self.slot_for(handle, index, if writable { ArgKind::BufferMut } else { ArgKind::Buffer })?;
        *slot = Some(BoundArg::Buffer(binding));
        Ok(())
    }

    /// Queue used for subsequent launches.
    pub fn set_command_queue(&mut self, queue: usize) -> Result<()> {
        let count = self.ctx.queue_count();
        if queue >= count {
            return Err(GpuError::InvalidQueue { id: queue, count });
        }
        self.queue = queue;
        Ok(())
    }

    /// Enqueue `handle` over `global` work-items in groups of `local`.
    ///
    /// `global[i]` must be a multiple of `local[i]`; see [`round_up_global`].
    pub fn launch(&self, handle: KernelHandle, dims: usize, global: &[usize], local: &[usize]) -> Result<()> {
        let slot = self.kernel(handle)?;
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| GpuError::InvalidArgument("no program loaded".into()))?;

        let bad_geometry = || GpuError::InvalidWorkGroupSize { global: global.to_vec(), local: local.to_vec() };
        if !(1..=3).contains(&dims) || global.len() < dims || local.len() < dims {
            return Err(bad_geometry());
        }
        let mut g = [1usize; 3];
        let mut l = [1usize; 3];
        for d in 0..dims {
            if local[d] == 0 || global[d] == 0 || global[d] % local[d] != 0 {
                return Err(bad_geometry());
            }
            g[d] = global[d];
            l[d] = local[d];
        }
        if l.iter().product::<usize>() > self.ctx.info().max_workgroup_size {
            return Err(bad_geometry());
        }

        let mut args = Vec::with_capacity(slot.args.len());
        for (i, bound) in slot.args.iter().enumerate() {
            match bound {
                Some(BoundArg::Scalar(bytes)) => args.push(KernelArg::Scalar(bytes.clone())),
                Some(BoundArg::Buffer(b)) => {
                    let writable = slot.entry.args[i] == ArgKind::BufferMut;
                    args.push(KernelArg::Buffer(b.bind(writable)?));
                }
                None => {
                    return Err(GpuError::InvalidArgument(format!(
                        "argument {i} of `{}` is not set",
                        slot.entry.name
                    )))
                }
            }
        }

        trace!(kernel = slot.entry.name, ?g, ?l, queue = self.queue, "launch");
        let launch = Launch { program, entry: slot.entry, args: &args, dims, global: g, local: l };
        self.ctx.backend().dispatch(self.queue, &launch)
    }

    /// Launch over every pixel of `geometry` with [`image_local_size`] groups.
    pub fn launch_image(&self, handle: KernelHandle, geometry: &Geometry) -> Result<()> {
        let dims = geometry.dim();
        let global = image_global_size(geometry);
        let local = image_local_size(dims);
        self.launch(handle, dims, &global[..dims], &local[..dims])
    }

    fn kernel(&self, handle: KernelHandle) -> Result<&KernelSlot> {
        self.kernels
            .get(handle.0)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown kernel handle {}", handle.0)))
    }

    fn arity_error(&self, handle: KernelHandle, index: usize) -> GpuError {
        match self.kernels.get(handle.0) {
            Some(k) => GpuError::InvalidArgument(format!(
                "argument index {index} out of range for `{}` ({} arguments)",
                k.entry.name,
                k.entry.args.len()
            )),
            None => GpuError::InvalidArgument(format!("unknown kernel handle {}", handle.0)),
        }
    }

    fn slot_for(&mut self, handle: KernelHandle, index: usize, kind: ArgKind) -> Result<&mut Option<BoundArg>> {
        let declared = self.kernel(handle)?.entry.args.get(index).copied();
        match declared {
            None => Err(self.arity_error(handle, index)),
            Some(d) if d != kind => {
                Err(GpuError::InvalidArgument(format!("argument {index} is declared {d:?}, got {kind:?}")))
            }
            Some(_) => Ok(&mut self.kernels[handle.0].args[index]),
        }
    }
}
