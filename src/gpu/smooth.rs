// gpu/smooth.rs — Separable Gaussian smoothing of device-resident images.
//
// One launch per axis whose truncated kernel has more than one tap. Each
// pass reads one image and writes another, so the smoother ping-pongs
// between the caller's image and a scratch image of the same geometry and
// swaps the two `GpuImage` handles after every pass. No pixels are copied
// back; after an odd number of passes the caller's handle simply points at
// what used to be the scratch buffer.
//
// The per-axis weights come from `convolution::gaussian_kernel`, so the
// device result matches the host `smooth` pass for pass.

use std::sync::Arc;

use tracing::debug;

use crate::convolution::{convolve_axis, gaussian_kernel};
use crate::error::{GpuError, Result};
use crate::gpu::buffer::BufferManager;
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::gpu::image::GpuImage;
use crate::gpu::kernel::{
    image_extent_args, image_local_size, ArgKind, Defines, EntryPoint, KernelHandle, KernelManager, KernelSource,
};
use crate::image::{Geometry, Image, Pixel, PixelType, RealPixel, MAX_DIM};

pub static SMOOTH: KernelSource = KernelSource {
    id: "smooth",
    wgsl: include_str!("../shaders/smooth.wgsl"),
    entry_points: &[EntryPoint {
        name: "smooth_axis",
        args: &[
            ArgKind::Buffer,
            ArgKind::BufferMut,
            ArgKind::Buffer,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
        ],
        host: smooth_axis_host,
    }],
};

struct AxisPass<T: RealPixel> {
    axis: usize,
    radius: usize,
    weights: Arc<BufferManager<T>>,
}

/// Gaussian smoother for one geometry and one set of per-axis sigmas.
pub struct GaussianSmoother<T: RealPixel> {
    kernels: KernelManager,
    handle: KernelHandle,
    geometry: Geometry,
    sigmas: [f64; MAX_DIM],
    passes: Vec<AxisPass<T>>,
}

impl<T: RealPixel> GaussianSmoother<T> {
    /// `sigmas` are standard deviations in pixels, one per axis; missing
    /// axes are left unsmoothed.
    pub fn new(
        ctx: Arc<DeviceContext>,
        geometry: Geometry,
        sigmas: &[f64],
        max_error: f64,
        max_width: usize,
    ) -> Result<Self> {
        let mut kernels = KernelManager::new(Arc::clone(&ctx));
        let defines = Defines::new()
            .pixel("T", T::TYPE)
            .dim(geometry.dim())
            .workgroup(image_local_size(geometry.dim()));
        kernels.load_program(&SMOOTH, &defines)?;
        let handle = kernels.create_kernel("smooth_axis")?;

        let mut stored = [0.0; MAX_DIM];
        let mut passes = Vec::new();
        for axis in 0..geometry.dim() {
            let sigma = sigmas.get(axis).copied().unwrap_or(0.0);
            stored[axis] = sigma;
            let taps = gaussian_kernel(sigma, max_error, max_width);
            if taps.len() == 1 {
                continue;
            }
            let weights: Vec<T> = taps.iter().map(|&w| T::from_f64(w)).collect();
            passes.push(AxisPass {
                axis,
                radius: taps.len() / 2,
                weights: Arc::new(BufferManager::from_vec(Arc::clone(&ctx), weights)?),
            });
        }
        debug!(%geometry, ?stored, passes = passes.len(), "gaussian smoother ready");
        Ok(GaussianSmoother { kernels, handle, geometry, sigmas: stored, passes })
    }

    pub fn sigmas(&self) -> &[f64; MAX_DIM] {
        &self.sigmas
    }

    /// Number of axis passes one `smooth` call launches.
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Smooth `image` in place, using `scratch` as the second buffer.
    pub fn smooth(&mut self, image: &mut GpuImage<T>, scratch: &mut GpuImage<T>) -> Result<()> {
        if image.geometry() != &self.geometry || scratch.geometry() != &self.geometry {
            return Err(GpuError::Geometry(format!(
                "smoother built for {}, got image {} and scratch {}",
                self.geometry,
                image.geometry(),
                scratch.geometry()
            )));
        }
        let h = self.handle;
        for pass in &self.passes {
            self.kernels.set_kernel_arg_with_buffer(h, 0, image.buffer())?;
            self.kernels.set_kernel_arg_with_buffer(h, 1, scratch.buffer())?;
            self.kernels.set_kernel_arg_with_buffer(h, 2, &pass.weights)?;
            for (i, v) in image_extent_args(&self.geometry).into_iter().enumerate() {
                self.kernels.set_kernel_arg_scalar(h, 3 + i, v)?;
            }
            self.kernels.set_kernel_arg_scalar(h, 7, pass.axis as u32)?;
            self.kernels.set_kernel_arg_scalar(h, 8, pass.radius as u32)?;
            self.kernels.launch_image(h, &self.geometry)?;
            std::mem::swap(image, scratch);
        }
        Ok(())
    }
}

fn smooth_axis_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    match hl.pixel("T")? {
        PixelType::Float => smooth_emulated::<f32>(hl),
        PixelType::Double => smooth_emulated::<f64>(hl),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn smooth_emulated<T: RealPixel>(hl: &mut HostLaunch<'_>) -> Result<()> {
    let dim = hl.define_usize("DIM")?;
    let extent = [hl.scalar::<u32>(3)?, hl.scalar::<u32>(4)?, hl.scalar::<u32>(5)?].map(|v| v as usize);
    let components = hl.scalar::<u32>(6)? as usize;
    let axis = hl.scalar::<u32>(7)? as usize;
    let radius = hl.scalar::<u32>(8)? as usize;
    if !(1..=MAX_DIM).contains(&dim) || axis >= dim {
        return Err(GpuError::InvalidArgument(format!("smooth_axis: axis {axis} for a {dim}D image")));
    }

    let geometry = Geometry::try_new(&extent[..dim])?.with_components(components);
    let src = image_from_arg::<T>(hl, 0, geometry)?;
    let mut weights: Vec<T> = hl.buffer(2)?;
    weights.truncate(2 * radius + 1);
    let taps: Vec<f64> = weights.iter().map(|w| w.to_f64()).collect();
    let out = convolve_axis(&src, axis, &taps);
    hl.store(1, out.as_slice())
}

/// Buffer argument `index` as an image of `geometry`, padding dropped.
pub(crate) fn image_from_arg<T: Pixel>(hl: &HostLaunch<'_>, index: usize, geometry: Geometry) -> Result<Image<T>> {
    let mut data: Vec<T> = hl.buffer(index)?;
    let n = geometry.num_elements();
    if data.len() < n {
        return Err(GpuError::InvalidArgument(format!(
            "buffer argument {index} holds {} elements, {geometry} needs {n}",
            data.len()
        )));
    }
    data.truncate(n);
    Ok(Image::from_vec(geometry, data))
}
