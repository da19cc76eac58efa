// gpu/functor.rs — Unary functor kernels.
//
// `FunctorKernel` loads whichever program a `PixelFunctor` names, binds the
// input/output buffers and image extent, and lets the functor bind its own
// scalars after them. The binary-threshold program lives here too.
//
// Host emulations compare and convert through f64, which is exact for every
// pixel type that has a WGSL storage type.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{GpuError, Result};
use crate::functor::{PixelFunctor, FUNCTOR_FIRST_ARG};
use crate::gpu::buffer::BufferManager;
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::gpu::image::GpuImage;
use crate::gpu::kernel::{
    image_extent_args, image_local_size, ArgKind, Defines, EntryPoint, KernelHandle, KernelManager, KernelSource,
};
use crate::image::{Geometry, Image, Pixel, PixelType};

pub static BINARY_THRESHOLD: KernelSource = KernelSource {
    id: "binary_threshold",
    wgsl: include_str!("../shaders/binary_threshold.wgsl"),
    entry_points: &[EntryPoint {
        name: "binary_threshold",
        args: &[
            ArgKind::Buffer,
            ArgKind::BufferMut,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
            ArgKind::Scalar,
        ],
        host: binary_threshold_host,
    }],
};

/// A functor's program compiled for one geometry and pixel-type pair.
pub struct FunctorKernel<I: Pixel, O: Pixel, F: PixelFunctor<I, O>> {
    kernels: KernelManager,
    handle: KernelHandle,
    geometry: Geometry,
    _functor: PhantomData<fn(I) -> (O, F)>,
}

impl<I: Pixel, O: Pixel, F: PixelFunctor<I, O>> FunctorKernel<I, O, F> {
    pub fn new(ctx: Arc<DeviceContext>, geometry: Geometry, functor: &F) -> Result<Self> {
        for pixel in [I::TYPE, O::TYPE] {
            if pixel.wgsl_name().is_none() {
                return Err(GpuError::UnsupportedPixelType(pixel.cl_name()));
            }
        }
        let defines = Defines::new()
            .pixel("IN", I::TYPE)
            .pixel("OUT", O::TYPE)
            .dim(geometry.dim())
            .workgroup(image_local_size(geometry.dim()));
        let mut kernels = KernelManager::new(ctx);
        kernels.load_program(functor.kernel_source(), &defines)?;
        let handle = kernels.create_kernel(functor.entry_point())?;
        Ok(FunctorKernel { kernels, handle, geometry, _functor: PhantomData })
    }

    pub fn run(&mut self, functor: &F, input: &Arc<BufferManager<I>>, output: &Arc<BufferManager<O>>) -> Result<()> {
        let n = self.geometry.num_elements();
        if input.len() != n || output.len() != n {
            return Err(GpuError::InvalidArgument(format!(
                "{} expects {n} elements, got input {} and output {}",
                functor.entry_point(),
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
        functor.set_kernel_arguments(&mut self.kernels, h, FUNCTOR_FIRST_ARG)?;
        self.kernels.launch_image(h, &self.geometry)
    }
}

/// Upload `image`, apply `functor` once, read the result back.
pub fn functor_on_device<I: Pixel, O: Pixel, F: PixelFunctor<I, O>>(
    ctx: Arc<DeviceContext>,
    image: &Image<I>,
    functor: &F,
) -> Result<Image<O>> {
    let geometry = *image.geometry();
    let src = GpuImage::from_image(Arc::clone(&ctx), image)?;
    let dst = GpuImage::<O>::new(Arc::clone(&ctx), geometry)?;
    let mut kernel = FunctorKernel::<I, O, F>::new(ctx, geometry, functor)?;
    kernel.run(functor, src.buffer(), dst.buffer())?;
    dst.to_image()
}

// ---------------------------------------------------------------------------
// Host emulation
// ---------------------------------------------------------------------------

fn buffer_f64(hl: &HostLaunch<'_>, index: usize, pixel: PixelType) -> Result<Vec<f64>> {
    fn widen<T: Pixel>(v: Vec<T>) -> Vec<f64> {
        v.into_iter().map(Pixel::to_f64).collect()
    }
    match pixel {
        PixelType::Int => hl.buffer::<i32>(index).map(widen),
        PixelType::UInt => hl.buffer::<u32>(index).map(widen),
        PixelType::Float => hl.buffer::<f32>(index).map(widen),
        PixelType::Double => hl.buffer::<f64>(index).map(widen),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn scalar_f64(hl: &HostLaunch<'_>, index: usize, pixel: PixelType) -> Result<f64> {
    match pixel {
        PixelType::Int => hl.scalar::<i32>(index).map(Pixel::to_f64),
        PixelType::UInt => hl.scalar::<u32>(index).map(Pixel::to_f64),
        PixelType::Float => hl.scalar::<f32>(index).map(Pixel::to_f64),
        PixelType::Double => hl.scalar::<f64>(index).map(Pixel::to_f64),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn store_f64(hl: &mut HostLaunch<'_>, index: usize, pixel: PixelType, data: &[f64]) -> Result<()> {
    fn narrow<T: Pixel>(data: &[f64]) -> Vec<T> {
        data.iter().map(|&v| T::from_f64(v)).collect()
    }
    match pixel {
        PixelType::Int => hl.store(index, &narrow::<i32>(data)),
        PixelType::UInt => hl.store(index, &narrow::<u32>(data)),
        PixelType::Float => hl.store(index, &narrow::<f32>(data)),
        PixelType::Double => hl.store(index, &narrow::<f64>(data)),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn binary_threshold_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    let (input, output) = (hl.pixel("IN")?, hl.pixel("OUT")?);
    let n = (2..6).map(|i| hl.scalar::<u32>(i)).product::<Result<u32>>()? as usize;
    let lower = scalar_f64(hl, 6, input)?;
    let upper = scalar_f64(hl, 7, input)?;
    let inside = scalar_f64(hl, 8, output)?;
    let outside = scalar_f64(hl, 9, output)?;
    let src = buffer_f64(hl, 0, input)?;
    if src.len() < n {
        return Err(GpuError::InvalidArgument(format!("binary_threshold: {n} elements, input holds {}", src.len())));
    }
    let out: Vec<f64> =
        src[..n].iter().map(|&v| if lower <= v && v <= upper { inside } else { outside }).collect();
    store_f64(hl, 1, output, &out)
}
