// gpu/apply.rs — The apply-update step of the finite-difference loop.
//
// `output += dt * update` over every component of every pixel, run as one
// image-shaped launch. Both buffers must hold `geometry.num_elements()`
// values; the update buffer is only read.

use std::sync::Arc;

use crate::error::{GpuError, Result};
use crate::gpu::buffer::BufferManager;
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::gpu::kernel::{
    image_extent_args, image_local_size, ArgKind, Defines, EntryPoint, KernelHandle, KernelManager, KernelSource,
};
use crate::image::{Geometry, PixelType, RealPixel};

pub static APPLY_UPDATE: KernelSource = KernelSource {
    id: "apply_update",
    wgsl: include_str!("../shaders/apply_update.wgsl"),
    entry_points: &[EntryPoint {
        name: "apply_update",
        args: &[
            ArgKind::BufferMut,
            ArgKind::Buffer,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
        ],
        host: apply_update_host,
    }],
};

/// Compiled apply-update kernel for one image geometry.
pub struct UpdateApplier<T: RealPixel> {
    kernels: KernelManager,
    handle: KernelHandle,
    geometry: Geometry,
    _pixel: std::marker::PhantomData<T>,
}

impl<T: RealPixel> UpdateApplier<T> {
    pub fn new(ctx: Arc<DeviceContext>, geometry: Geometry) -> Result<Self> {
        let mut kernels = KernelManager::new(ctx);
        let defines = Defines::new()
            .pixel("T", T::TYPE)
            .dim(geometry.dim())
            .workgroup(image_local_size(geometry.dim()));
        kernels.load_program(&APPLY_UPDATE, &defines)?;
        let handle = kernels.create_kernel("apply_update")?;
        Ok(UpdateApplier { kernels, handle, geometry, _pixel: std::marker::PhantomData })
    }

    pub fn apply(&mut self, output: &Arc<BufferManager<T>>, update: &Arc<BufferManager<T>>, dt: T) -> Result<()> {
        let n = self.geometry.num_elements();
        if output.len() != n || update.len() != n {
            return Err(GpuError::InvalidArgument(format!(
                "apply_update expects {n} elements, got output {} and update {}",
                output.len(),
                update.len()
            )));
        }
        let h = self.handle;
        self.kernels.set_kernel_arg_with_buffer(h, 0, output)?;
        self.kernels.set_kernel_arg_with_buffer(h, 1, update)?;
        for (i, v) in image_extent_args(&self.geometry).into_iter().enumerate() {
            self.kernels.set_kernel_arg_scalar(h, 2 + i, v)?;
        }
        self.kernels.set_kernel_arg_scalar(h, 6, dt)?;
        self.kernels.launch_image(h, &self.geometry)
    }
}

fn apply_update_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    match hl.pixel("T")? {
        PixelType::Float => apply_emulated::<f32>(hl),
        PixelType::Double => apply_emulated::<f64>(hl),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn apply_emulated<T: RealPixel>(hl: &mut HostLaunch<'_>) -> Result<()> {
    let mut output: Vec<T> = hl.buffer(0)?;
    let update: Vec<T> = hl.buffer(1)?;
    let pixels = (0..3).map(|i| hl.scalar::<u32>(2 + i)).product::<Result<u32>>()? as usize;
    let components = hl.scalar::<u32>(5)? as usize;
    let dt = hl.scalar::<T>(6)?.to_f64();
    for k in 0..pixels * components {
        output[k] = T::from_f64(output[k].to_f64() + dt * update[k].to_f64());
    }
    hl.store(0, &output)
}
