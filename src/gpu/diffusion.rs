// gpu/diffusion.rs — Accelerator executor for gradient anisotropic diffusion.
//
// PER ITERATION
// ──────────────
//   initialize_iteration  gradient_magnitude → per-pixel |∇I|²
//                         reduction → Σ, divided by N → K
//   compute_update        compute_update → update, update²
//                         reduction → Σ update² (for the RMS change)
//   apply_update          output += dt·update
//
// The image is uploaded once when the scheme is built and stays on the
// device until the filter asks for its output. Both per-pixel statistics
// buffers are the reductions' own input buffers, written in full on every
// launch.

use std::sync::Arc;

use tracing::debug;

use crate::config::DiffusionConfig;
use crate::diffusion::{compute_update_at, conductance_k, DiffusionInputs, DiffusionScheme};
use crate::error::{GpuError, Result};
use crate::gpu::apply::UpdateApplier;
use crate::gpu::buffer::BufferManager;
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::gpu::image::GpuImage;
use crate::gpu::kernel::{image_local_size, ArgKind, Defines, EntryPoint, KernelHandle, KernelManager, KernelSource};
use crate::gpu::reduction::{ReduceElement, Reduction};
use crate::gpu::smooth::image_from_arg;
use crate::gradient::gradient_magnitude_squared;
use crate::image::{Geometry, Image, PixelType, RealPixel, MAX_DIM};
use crate::solver::{resolve_time_step, UpdateScheme};

pub static DIFFUSION_GRADIENT: KernelSource = KernelSource {
    id: "diffusion_gradient",
    wgsl: include_str!("../shaders/diffusion_gradient.wgsl"),
    entry_points: &[EntryPoint {
        name: "gradient_magnitude",
        args: &[
            ArgKind::Buffer,
            ArgKind::BufferMut,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
        ],
        host: gradient_magnitude_host,
    }],
};

pub static DIFFUSION_UPDATE: KernelSource = KernelSource {
    id: "diffusion_update",
    wgsl: include_str!("../shaders/diffusion_update.wgsl"),
    entry_points: &[EntryPoint {
        name: "compute_update",
        args: &[
            ArgKind::Buffer,
            ArgKind::BufferMut,
            ArgKind::BufferMut,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
        ],
        host: compute_update_host,
    }],
};

pub(crate) struct AcceleratorDiffusion<T: RealPixel> {
    inputs: DiffusionInputs<T>,
    coefficients: [f64; MAX_DIM],
    output: GpuImage<T>,
    update: GpuImage<T>,
    gradient_kernels: KernelManager,
    gradient_handle: KernelHandle,
    update_kernels: KernelManager,
    update_handle: KernelHandle,
    applier: UpdateApplier<T>,
    gradient_sum: Reduction<T>,
    update_sum: Reduction<T>,
    average: f64,
    k: f64,
    sum_squared_update: f64,
    rms_change: f64,
}

fn program(
    ctx: &Arc<DeviceContext>,
    source: &'static KernelSource,
    entry: &str,
    dim: usize,
    pixel: PixelType,
) -> Result<(KernelManager, KernelHandle)> {
    let mut kernels = KernelManager::new(Arc::clone(ctx));
    let defines = Defines::new().pixel("T", pixel).dim(dim).workgroup(image_local_size(dim));
    kernels.load_program(source, &defines)?;
    let handle = kernels.create_kernel(entry)?;
    Ok((kernels, handle))
}

fn input_of<E: ReduceElement>(r: &Reduction<E>) -> Result<&Arc<BufferManager<E>>> {
    r.input_buffer()
        .ok_or_else(|| GpuError::InvalidArgument("statistics buffer not allocated".into()))
}

impl<T: RealPixel> AcceleratorDiffusion<T> {
    pub(crate) fn new(ctx: Arc<DeviceContext>, inputs: DiffusionInputs<T>) -> Result<Self> {
        let geometry = *inputs.input.geometry();
        let pixels = geometry.num_pixels();
        let (gradient_kernels, gradient_handle) =
            program(&ctx, &DIFFUSION_GRADIENT, "gradient_magnitude", geometry.dim(), T::TYPE)?;
        let (update_kernels, update_handle) =
            program(&ctx, &DIFFUSION_UPDATE, "compute_update", geometry.dim(), T::TYPE)?;

        let mut gradient_sum = Reduction::new(Arc::clone(&ctx), inputs.reduction.clone())?;
        let mut update_sum = Reduction::new(Arc::clone(&ctx), inputs.reduction.clone())?;
        for r in [&mut gradient_sum, &mut update_sum] {
            r.initialize_kernel(pixels)?;
            r.allocate_input_buffer(pixels)?;
        }

        debug!(%geometry, device = %ctx.info().name, "diffusion accelerator scheme ready");
        Ok(AcceleratorDiffusion {
            coefficients: [1.0; MAX_DIM],
            output: GpuImage::from_image(Arc::clone(&ctx), &inputs.input)?,
            update: GpuImage::new(Arc::clone(&ctx), geometry)?,
            applier: UpdateApplier::new(Arc::clone(&ctx), geometry)?,
            gradient_kernels,
            gradient_handle,
            update_kernels,
            update_handle,
            gradient_sum,
            update_sum,
            average: 0.0,
            k: 0.0,
            sum_squared_update: 0.0,
            rms_change: 0.0,
            inputs,
        })
    }

    fn scale(&self) -> [T; MAX_DIM] {
        self.coefficients.map(T::from_f64)
    }
}

impl<T: RealPixel> UpdateScheme for AcceleratorDiffusion<T> {
    fn geometry(&self) -> Geometry {
        *self.inputs.input.geometry()
    }

    fn copy_input_to_output(&mut self) -> Result<()> {
        self.output.host_buffer_mut()?.copy_from_slice(self.inputs.input.as_slice());
        Ok(())
    }

    fn initialize(&mut self, coefficients: [f64; MAX_DIM]) -> Result<()> {
        self.coefficients = coefficients;
        self.inputs.check_time_step(&coefficients);
        Ok(())
    }

    fn allocate_update_buffer(&mut self) -> Result<()> {
        self.update.fill(T::default())
    }

    fn initialize_iteration(&mut self) -> Result<()> {
        let geometry = *self.output.geometry();
        let (h, scale) = (self.gradient_handle, self.scale());
        let k = &mut self.gradient_kernels;
        k.set_kernel_arg_with_buffer(h, 0, self.output.buffer())?;
        k.set_kernel_arg_with_buffer(h, 1, input_of(&self.gradient_sum)?)?;
        for (i, v) in geometry.extent().into_iter().enumerate() {
            k.set_kernel_arg_scalar(h, 2 + i, v as u32)?;
        }
        for (i, v) in scale.into_iter().enumerate() {
            k.set_kernel_arg_scalar(h, 5 + i, v)?;
        }
        k.launch_image(h, &geometry)?;

        self.average = self.gradient_sum.generate()?.to_f64() / geometry.num_pixels() as f64;
        self.k = conductance_k(self.average, self.inputs.config.conductance);
        debug!(average = self.average, k = self.k, "diffusion conductance");
        Ok(())
    }

    fn compute_update(&mut self) -> Result<f64> {
        let geometry = *self.output.geometry();
        let (h, scale) = (self.update_handle, self.scale());
        let k = &mut self.update_kernels;
        k.set_kernel_arg_with_buffer(h, 0, self.output.buffer())?;
        k.set_kernel_arg_with_buffer(h, 1, self.update.buffer())?;
        k.set_kernel_arg_with_buffer(h, 2, input_of(&self.update_sum)?)?;
        for (i, v) in geometry.extent().into_iter().enumerate() {
            k.set_kernel_arg_scalar(h, 3 + i, v as u32)?;
        }
        k.set_kernel_arg_scalar(h, 6, T::from_f64(self.k))?;
        for (i, v) in scale.into_iter().enumerate() {
            k.set_kernel_arg_scalar(h, 7 + i, v)?;
        }
        k.launch_image(h, &geometry)?;

        self.sum_squared_update = self.update_sum.generate()?.to_f64();
        resolve_time_step(&[self.inputs.config.time_step], &[true])
    }

    fn apply_update(&mut self, dt: f64) -> Result<()> {
        self.applier.apply(self.output.buffer(), self.update.buffer(), T::from_f64(dt))?;
        let n = self.output.geometry().num_pixels() as f64;
        self.rms_change = dt.abs() * (self.sum_squared_update / n).sqrt();
        Ok(())
    }

    fn rms_change(&self) -> f64 {
        self.rms_change
    }
}

impl<T: RealPixel> DiffusionScheme<T> for AcceleratorDiffusion<T> {
    fn configure(&mut self, config: &DiffusionConfig) {
        self.inputs.config = config.clone();
    }

    fn output(&self) -> Result<Image<T>> {
        self.output.to_image()
    }

    fn average_gradient_magnitude_squared(&self) -> f64 {
        self.average
    }
}

// ---------------------------------------------------------------------------
// Host emulation
// ---------------------------------------------------------------------------

fn gradient_magnitude_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    match hl.pixel("T")? {
        PixelType::Float => gradient_magnitude_emulated::<f32>(hl),
        PixelType::Double => gradient_magnitude_emulated::<f64>(hl),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn compute_update_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    match hl.pixel("T")? {
        PixelType::Float => compute_update_emulated::<f32>(hl),
        PixelType::Double => compute_update_emulated::<f64>(hl),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

/// Geometry and axis coefficients from the size args at `first` and the
/// coefficient args at `scale_first`.
fn launch_geometry<T: RealPixel>(
    hl: &HostLaunch<'_>,
    first: usize,
    scale_first: usize,
) -> Result<(Geometry, [f64; MAX_DIM])> {
    let dim = hl.define_usize("DIM")?;
    if !(1..=MAX_DIM).contains(&dim) {
        return Err(GpuError::InvalidArgument(format!("diffusion: DIM = {dim}")));
    }
    let mut size = [1usize; MAX_DIM];
    let mut scale = [1.0f64; MAX_DIM];
    for d in 0..MAX_DIM {
        size[d] = hl.scalar::<u32>(first + d)? as usize;
        scale[d] = hl.scalar::<T>(scale_first + d)?.to_f64();
    }
    Ok((Geometry::try_new(&size[..dim])?, scale))
}

fn gradient_magnitude_emulated<T: RealPixel>(hl: &mut HostLaunch<'_>) -> Result<()> {
    let (geometry, scale) = launch_geometry::<T>(hl, 2, 5)?;
    let src = image_from_arg::<T>(hl, 0, geometry)?;
    let out: Vec<T> = (0..geometry.num_pixels())
        .map(|p| T::from_f64(gradient_magnitude_squared(&src, &geometry.index_of(p), &scale)))
        .collect();
    hl.store(1, &out)
}

fn compute_update_emulated<T: RealPixel>(hl: &mut HostLaunch<'_>) -> Result<()> {
    let (geometry, scale) = launch_geometry::<T>(hl, 3, 7)?;
    let k = hl.scalar::<T>(6)?.to_f64();
    let src = image_from_arg::<T>(hl, 0, geometry)?;
    let mut update = Vec::with_capacity(geometry.num_pixels());
    let mut squared = Vec::with_capacity(geometry.num_pixels());
    for p in 0..geometry.num_pixels() {
        let u = compute_update_at(&src, &geometry.index_of(p), k, &scale);
        update.push(T::from_f64(u));
        squared.push(T::from_f64(u * u));
    }
    hl.store(1, &update)?;
    hl.store(2, &squared)
}
