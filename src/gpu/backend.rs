// gpu/backend.rs — The seam between the core and a concrete compute API.
//
// Everything above this trait (buffer manager, kernel manager, reduction,
// solvers) is written against `ComputeBackend`. Two implementations exist:
//
//   gpu::device::WgpuBackend — real accelerator through wgpu compute
//                              pipelines and storage buffers.
//   gpu::host::HostBackend   — emulates device memory and every kernel on
//                              the host, work-group by work-group.
//
// Both follow in-order queue semantics: `write`, `read` and `dispatch`
// complete (or are ordered before any later `read`) in call order on the
// same queue. `read` blocks until the data is on the host.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::gpu::kernel::{Defines, EntryPoint, KernelSource};
use crate::image::PixelType;

// ---------------------------------------------------------------------------
// Device description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    /// Software rasteriser exposed as an adapter (llvmpipe, WARP).
    Software,
    /// Host emulation backend.
    Host,
    Other,
}

/// What the context knows about its device; also the input to device selection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub platform: String,
    pub kind: DeviceKind,
    pub compute_units: u32,
    pub clock_mhz: u32,
    /// Maximum invocations per work-group.
    pub max_workgroup_size: usize,
    pub max_allocation: u64,
    pub supports_f64: bool,
}

impl DeviceInfo {
    /// Selection score: compute units times clock.
    pub fn estimated_flops(&self) -> u64 {
        self.compute_units as u64 * self.clock_mhz as u64
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] ({:?}, {} CU @ {} MHz, wg ≤ {})",
            self.name, self.platform, self.kind, self.compute_units, self.clock_mhz, self.max_workgroup_size
        )
    }
}

// ---------------------------------------------------------------------------
// Device memory
// ---------------------------------------------------------------------------

/// A device allocation. Cloning shares the allocation; it is released when
/// the last clone drops.
#[derive(Clone)]
pub struct DeviceMemory {
    bytes: usize,
    handle: MemoryHandle,
}

#[derive(Clone)]
pub(crate) enum MemoryHandle {
    Wgpu(Arc<wgpu::Buffer>),
    Host(Arc<Mutex<Vec<u8>>>),
}

impl DeviceMemory {
    pub(crate) fn from_wgpu(buffer: wgpu::Buffer, bytes: usize) -> Self {
        DeviceMemory { bytes, handle: MemoryHandle::Wgpu(Arc::new(buffer)) }
    }

    pub(crate) fn from_host(storage: Vec<u8>) -> Self {
        DeviceMemory { bytes: storage.len(), handle: MemoryHandle::Host(Arc::new(Mutex::new(storage))) }
    }

    pub(crate) fn handle(&self) -> &MemoryHandle {
        &self.handle
    }

    /// Allocated size in bytes (including alignment padding).
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// True when both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceMemory) -> bool {
        match (&self.handle, &other.handle) {
            (MemoryHandle::Wgpu(a), MemoryHandle::Wgpu(b)) => Arc::ptr_eq(a, b),
            (MemoryHandle::Host(a), MemoryHandle::Host(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.handle {
            MemoryHandle::Wgpu(_) => "wgpu",
            MemoryHandle::Host(_) => "host",
        };
        write!(f, "DeviceMemory({kind}, {} bytes)", self.bytes)
    }
}

// ---------------------------------------------------------------------------
// Programs and launches
// ---------------------------------------------------------------------------

/// Backend-specific compiled form of a program.
pub struct CompiledProgram {
    pub(crate) inner: CompiledInner,
}

pub(crate) enum CompiledInner {
    Host,
    Wgpu(crate::gpu::device::WgpuProgram),
}

/// A built kernel program: template, defines and the compiled pipelines.
pub struct Program {
    source: &'static KernelSource,
    defines: Defines,
    compiled: CompiledProgram,
}

impl Program {
    pub(crate) fn new(source: &'static KernelSource, defines: Defines, compiled: CompiledProgram) -> Self {
        Program { source, defines, compiled }
    }

    pub fn source_id(&self) -> &'static str {
        self.source.id
    }

    pub fn defines(&self) -> &Defines {
        &self.defines
    }

    pub fn entry(&self, name: &str) -> Option<&'static EntryPoint> {
        self.source.entry_points.iter().find(|e| e.name == name)
    }

    pub(crate) fn compiled(&self) -> &CompiledInner {
        &self.compiled.inner
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source", &self.source.id)
            .field("defines", &self.defines.render())
            .finish()
    }
}

/// A resolved kernel argument, ready for dispatch.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Scalar(Vec<u8>),
    Buffer(DeviceMemory),
}

/// One kernel execution request.
pub struct Launch<'a> {
    pub program: &'a Program,
    pub entry: &'static EntryPoint,
    pub args: &'a [KernelArg],
    pub dims: usize,
    /// Global work size, padded to three axes with 1.
    pub global: [usize; 3],
    /// Local (work-group) size, padded to three axes with 1.
    pub local: [usize; 3],
}

impl Launch<'_> {
    /// Number of work-groups along each axis.
    pub fn groups(&self) -> [usize; 3] {
        [self.global[0] / self.local[0], self.global[1] / self.local[1], self.global[2] / self.local[2]]
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// A compute API the core can drive.
pub trait ComputeBackend: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Number of command queues; valid queue ids are `0..queue_count()`.
    fn queue_count(&self) -> usize;

    /// Whether kernels can be instantiated for `pixel` on this backend.
    fn supports(&self, pixel: PixelType) -> bool;

    /// Allocate `bytes` of uninitialised device memory.
    fn allocate(&self, bytes: usize) -> Result<DeviceMemory>;

    /// Blocking host → device copy into the start of `mem`.
    fn write(&self, queue: usize, mem: &DeviceMemory, data: &[u8]) -> Result<()>;

    /// Blocking device → host copy from the start of `mem`.
    fn read(&self, queue: usize, mem: &DeviceMemory, out: &mut [u8]) -> Result<()>;

    /// Compile `source` specialised by `defines`.
    fn build(&self, source: &'static KernelSource, defines: &Defines) -> Result<CompiledProgram>;

    /// Enqueue one kernel execution.
    fn dispatch(&self, queue: usize, launch: &Launch<'_>) -> Result<()>;
}
