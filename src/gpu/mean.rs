// gpu/mean.rs — Box mean kernel.
//
// The radius is compiled into the program (RADIUS_X/Y/Z defines), so every
// distinct radius is its own cache entry and the WGSL loops have constant
// bounds. Real pixels accumulate in their own precision; integer pixels
// accumulate in f32 and round half away from zero, like `Pixel::from_f64`.
//
// u8, i8 and i16 have no WGSL storage type and are rejected up front; the
// host executor in `crate::mean` handles them.

use std::sync::Arc;

use tracing::debug;

use crate::error::{GpuError, Result};
use crate::gpu::buffer::BufferManager;
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::gpu::image::GpuImage;
use crate::gpu::kernel::{
    image_extent_args, image_local_size, ArgKind, Defines, EntryPoint, KernelHandle, KernelManager, KernelSource,
};
use crate::gpu::smooth::image_from_arg;
use crate::image::{Geometry, Image, Pixel, PixelType, MAX_DIM};
use crate::mean::{effective_radius, mean_image};

pub static MEAN: KernelSource = KernelSource {
    id: "mean",
    wgsl: include_str!("../shaders/mean.wgsl"),
    entry_points: &[EntryPoint {
        name: "mean_filter",
        args: &[
            ArgKind::Buffer,
            ArgKind::BufferMut,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
        ],
        host: mean_filter_host,
    }],
};

/// Compiled mean kernel for one geometry and radius.
pub struct MeanKernel<T: Pixel> {
    kernels: KernelManager,
    handle: KernelHandle,
    geometry: Geometry,
    _pixel: std::marker::PhantomData<T>,
}

impl<T: Pixel> MeanKernel<T> {
    pub fn new(ctx: Arc<DeviceContext>, geometry: Geometry, radius: &[usize; MAX_DIM]) -> Result<Self> {
        if T::TYPE.wgsl_name().is_none() {
            return Err(GpuError::UnsupportedPixelType(T::TYPE.cl_name()));
        }
        let radius = effective_radius(radius, geometry.dim());
        let acc = if T::TYPE == PixelType::Double { "f64" } else { "f32" };
        let defines = Defines::new()
            .pixel("T", T::TYPE)
            .dim(geometry.dim())
            .workgroup(image_local_size(geometry.dim()))
            .define("ACC", acc)
            .define("ROUND", !T::TYPE.is_float())
            .define("RADIUS_X", radius[0])
            .define("RADIUS_Y", radius[1])
            .define("RADIUS_Z", radius[2]);
        let mut kernels = KernelManager::new(ctx);
        kernels.load_program(&MEAN, &defines)?;
        let handle = kernels.create_kernel("mean_filter")?;
        debug!(pixel = %T::TYPE, ?radius, "mean kernel ready");
        Ok(MeanKernel { kernels, handle, geometry, _pixel: std::marker::PhantomData })
    }

    /// `output` ← box mean of `input`. The buffers must be distinct.
    pub fn run(&mut self, input: &Arc<BufferManager<T>>, output: &Arc<BufferManager<T>>) -> Result<()> {
        let n = self.geometry.num_elements();
        if input.len() != n || output.len() != n {
            return Err(GpuError::InvalidArgument(format!(
                "mean_filter expects {n} elements, got input {} and output {}",
                input.len(),
                output.len()
            )));
        }
        let h = self.handle;
        self.kernels.set_kernel_arg_with_buffer(h, 0, input)?;
        self.kernels.set_kernel_arg_with_buffer(h, 1, output)?;
        for (i, v) in image_extent_args(&self.geometry).into_iter().enumerate() {
            self.kernels.set_kernel_arg_scalar(h, 2 + i, v)?;
        }
        self.kernels.launch_image(h, &self.geometry)
    }
}

/// Upload `image`, run the mean kernel once, read the result back.
pub fn mean_on_device<T: Pixel>(
    ctx: Arc<DeviceContext>,
    image: &Image<T>,
    radius: &[usize; MAX_DIM],
) -> Result<Image<T>> {
    let geometry = *image.geometry();
    let src = GpuImage::from_image(Arc::clone(&ctx), image)?;
    let dst = GpuImage::<T>::new(Arc::clone(&ctx), geometry)?;
    let mut kernel = MeanKernel::<T>::new(ctx, geometry, radius)?;
    kernel.run(src.buffer(), dst.buffer())?;
    dst.to_image()
}

fn mean_filter_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    match hl.pixel("T")? {
        PixelType::Int => mean_emulated::<i32>(hl),
        PixelType::UInt => mean_emulated::<u32>(hl),
        PixelType::Float => mean_emulated::<f32>(hl),
        PixelType::Double => mean_emulated::<f64>(hl),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn mean_emulated<T: Pixel>(hl: &mut HostLaunch<'_>) -> Result<()> {
    let dim = hl.define_usize("DIM")?;
    let radius = [hl.define_usize("RADIUS_X")?, hl.define_usize("RADIUS_Y")?, hl.define_usize("RADIUS_Z")?];
    let extent = [hl.scalar::<u32>(2)?, hl.scalar::<u32>(3)?, hl.scalar::<u32>(4)?].map(|v| v as usize);
    let components = hl.scalar::<u32>(5)? as usize;
    if !(1..=MAX_DIM).contains(&dim) || components == 0 {
        return Err(GpuError::InvalidArgument(format!("mean_filter: DIM = {dim}, {components} components")));
    }
    let geometry = Geometry::try_new(&extent[..dim])?.with_components(components);
    let src = image_from_arg::<T>(hl, 0, geometry)?;
    let out = mean_image(&src, &radius);
    hl.store(1, out.as_slice())
}
