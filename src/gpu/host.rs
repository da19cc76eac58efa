// gpu/host.rs — Host emulation backend.
//
// Device memory is a byte vector behind a mutex; kernels are the
// `HostKernelFn` attached to each entry point. A dispatch copies every
// buffer argument into a `HostLaunch`, runs the entry point once over the
// whole global range, and writes back the buffers declared `BufferMut`.
// Copying in and out means a kernel that binds the same allocation twice
// behaves like the device would (reads see pre-launch contents) and never
// deadlocks on its own storage lock.
//
// Kernels are expected to honour the launch geometry: emulations iterate
// work-group by work-group with `local` work-items each, so tree reductions
// and out-of-range guards behave exactly as on the device.

use bytemuck::Pod;
use tracing::debug;

use crate::error::{GpuError, Result};
use crate::gpu::backend::{
    CompiledInner, CompiledProgram, ComputeBackend, DeviceInfo, DeviceKind, DeviceMemory, KernelArg, Launch,
    MemoryHandle,
};
use crate::gpu::kernel::{ArgKind, Defines, EntryPoint, KernelSource};
use crate::image::PixelType;

/// Emulated device memory and kernel execution on the calling thread.
pub struct HostBackend {
    info: DeviceInfo,
    queues: usize,
}

impl HostBackend {
    pub fn new(queues: usize) -> Self {
        let info = DeviceInfo {
            name: "host emulation".into(),
            platform: "fdgpu host".into(),
            kind: DeviceKind::Host,
            compute_units: rayon::current_num_threads() as u32,
            clock_mhz: 1,
            max_workgroup_size: 1024,
            max_allocation: isize::MAX as u64,
            supports_f64: true,
        };
        HostBackend { info, queues: queues.max(1) }
    }

    fn check_queue(&self, queue: usize) -> Result<()> {
        if queue >= self.queues {
            return Err(GpuError::InvalidQueue { id: queue, count: self.queues });
        }
        Ok(())
    }
}

fn host_storage(mem: &DeviceMemory) -> Result<&parking_lot::Mutex<Vec<u8>>> {
    match mem.handle() {
        MemoryHandle::Host(v) => Ok(v.as_ref()),
        MemoryHandle::Wgpu(_) => Err(GpuError::InvalidArgument("wgpu buffer handed to the host backend".into())),
    }
}

impl ComputeBackend for HostBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn queue_count(&self) -> usize {
        self.queues
    }

    fn supports(&self, _pixel: PixelType) -> bool {
        true
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceMemory> {
        if bytes == 0 {
            return Err(GpuError::DeviceAllocation { bytes, reason: "zero-sized allocation".into() });
        }
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(bytes)
            .map_err(|e| GpuError::DeviceAllocation { bytes, reason: e.to_string() })?;
        storage.resize(bytes, 0);
        Ok(DeviceMemory::from_host(storage))
    }

    fn write(&self, queue: usize, mem: &DeviceMemory, data: &[u8]) -> Result<()> {
        self.check_queue(queue)?;
        let mut dst = host_storage(mem)?.lock();
        if data.len() > dst.len() {
            return Err(GpuError::Transfer(format!("write of {} bytes into {} byte buffer", data.len(), dst.len())));
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, queue: usize, mem: &DeviceMemory, out: &mut [u8]) -> Result<()> {
        self.check_queue(queue)?;
        let src = host_storage(mem)?.lock();
        if out.len() > src.len() {
            return Err(GpuError::Transfer(format!("read of {} bytes from {} byte buffer", out.len(), src.len())));
        }
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }

    fn build(&self, source: &'static KernelSource, defines: &Defines) -> Result<CompiledProgram> {
        // Same template check the device compiler would trip over.
        defines
            .substitute(source.wgsl)
            .map_err(|log| GpuError::Compile { program: source.id.to_string(), log })?;
        Ok(CompiledProgram { inner: CompiledInner::Host })
    }

    fn dispatch(&self, queue: usize, launch: &Launch<'_>) -> Result<()> {
        self.check_queue(queue)?;
        let entry = launch.entry;
        let mut args = Vec::with_capacity(launch.args.len());
        for (i, arg) in launch.args.iter().enumerate() {
            args.push(match arg {
                KernelArg::Scalar(bytes) => HostArg::Scalar(bytes.clone()),
                KernelArg::Buffer(mem) => HostArg::Buffer { bytes: host_storage(mem)?.lock().clone(), index: i },
            });
        }

        let mut hl = HostLaunch {
            defines: launch.program.defines(),
            entry,
            args,
            dims: launch.dims,
            global: launch.global,
            local: launch.local,
        };
        (entry.host)(&mut hl)?;

        for (i, arg) in hl.args.into_iter().enumerate() {
            if let (HostArg::Buffer { bytes, .. }, ArgKind::BufferMut) = (arg, entry.args[i]) {
                if let KernelArg::Buffer(mem) = &launch.args[i] {
                    let mut dst = host_storage(mem)?.lock();
                    let n = bytes.len().min(dst.len());
                    dst[..n].copy_from_slice(&bytes[..n]);
                }
            }
        }
        debug!(kernel = entry.name, groups = ?launch.groups(), "host dispatch");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HostLaunch
// ---------------------------------------------------------------------------

enum HostArg {
    Scalar(Vec<u8>),
    Buffer { bytes: Vec<u8>, index: usize },
}

/// Arguments and geometry of one emulated dispatch.
pub struct HostLaunch<'a> {
    defines: &'a Defines,
    entry: &'static EntryPoint,
    args: Vec<HostArg>,
    pub dims: usize,
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl HostLaunch<'_> {
    pub fn defines(&self) -> &Defines {
        self.defines
    }

    /// Pixel type bound to `key` in the program's defines.
    pub fn pixel(&self, key: &str) -> Result<PixelType> {
        self.defines
            .pixel_type(key)
            .ok_or_else(|| GpuError::InvalidArgument(format!("`{}`: define {key} has no pixel type", self.entry.name)))
    }

    pub fn define_usize(&self, key: &str) -> Result<usize> {
        self.defines
            .get(key)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| GpuError::InvalidArgument(format!("`{}`: define {key} missing or not an integer", self.entry.name)))
    }

    pub fn define_bool(&self, key: &str) -> Result<bool> {
        match self.defines.get(key) {
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            _ => Err(GpuError::InvalidArgument(format!("`{}`: define {key} missing or not a bool", self.entry.name))),
        }
    }

    /// Work-groups along each axis.
    pub fn groups(&self) -> [usize; 3] {
        [self.global[0] / self.local[0], self.global[1] / self.local[1], self.global[2] / self.local[2]]
    }

    /// Copy of buffer argument `index` as `T` elements (padding included).
    pub fn buffer<T: Pod>(&self, index: usize) -> Result<Vec<T>> {
        match self.args.get(index) {
            Some(HostArg::Buffer { bytes, .. }) => {
                let usable = bytes.len() / std::mem::size_of::<T>() * std::mem::size_of::<T>();
                Ok(bytemuck::pod_collect_to_vec(&bytes[..usable]))
            }
            _ => Err(self.not_a("buffer", index)),
        }
    }

    /// Overwrite the start of writable buffer argument `index` with `data`.
    pub fn store<T: Pod>(&mut self, index: usize, data: &[T]) -> Result<()> {
        if self.entry.args.get(index) != Some(&ArgKind::BufferMut) {
            return Err(self.not_a("writable buffer", index));
        }
        let name = self.entry.name;
        match self.args.get_mut(index) {
            Some(HostArg::Buffer { bytes, index: i }) => {
                let src: &[u8] = bytemuck::cast_slice(data);
                if src.len() > bytes.len() {
                    return Err(GpuError::InvalidArgument(format!(
                        "`{name}`: store of {} bytes into argument {i} of {} bytes",
                        src.len(),
                        bytes.len()
                    )));
                }
                bytes[..src.len()].copy_from_slice(src);
                Ok(())
            }
            _ => Err(self.not_a("buffer", index)),
        }
    }

    /// Scalar argument `index` reinterpreted as `T`.
    pub fn scalar<T: Pod>(&self, index: usize) -> Result<T> {
        match self.args.get(index) {
            Some(HostArg::Scalar(bytes)) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            _ => Err(self.not_a("scalar of matching size", index)),
        }
    }

    fn not_a(&self, what: &str, index: usize) -> GpuError {
        GpuError::InvalidArgument(format!("`{}`: argument {index} is not a {what}", self.entry.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_roundtrip() {
        let be = HostBackend::new(1);
        let mem = be.allocate(8).unwrap();
        be.write(0, &mem, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 6];
        be.read(0, &mem, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_huge_allocation_fails_cleanly() {
        let be = HostBackend::new(1);
        let err = be.allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, GpuError::DeviceAllocation { .. }));
    }

    #[test]
    fn test_bad_queue() {
        let be = HostBackend::new(2);
        let mem = be.allocate(4).unwrap();
        let err = be.write(2, &mem, &[0; 4]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidQueue { id: 2, count: 2 }));
    }

    #[test]
    fn test_oversized_write_rejected() {
        let be = HostBackend::new(1);
        let mem = be.allocate(4).unwrap();
        assert!(matches!(be.write(0, &mem, &[0; 8]), Err(GpuError::Transfer(_))));
    }
}
