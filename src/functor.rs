// functor.rs — Per-pixel functor filters.
//
// A `PixelFunctor` maps one input value to one output value. It is
// evaluated directly on the host, and on the accelerator through a kernel
// program that follows a fixed argument layout:
//
//   0      input buffer  (IN)
//   1      output buffer (OUT, written)
//   2..=5  size x, y, z and components (u32)
//   6..    the functor's own scalars, bound by `set_kernel_arguments`
//
// The program is compiled with the pixel types bound to `IN` and `OUT`.
// `UnaryFunctorFilter` applies a functor to every component of every pixel
// with either executor.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::info;

use crate::error::{GpuError, Result};
use crate::gpu::kernel::{KernelHandle, KernelManager, KernelSource};
use crate::image::{Image, Pixel};
use crate::solver::Executor;

/// First kernel argument index available to a functor.
pub const FUNCTOR_FIRST_ARG: usize = 6;

pub trait PixelFunctor<I: Pixel, O: Pixel>: Clone + fmt::Debug + Send + Sync + 'static {
    /// Program evaluating the functor, in the layout described above.
    fn kernel_source(&self) -> &'static KernelSource;

    fn entry_point(&self) -> &'static str;

    fn evaluate(&self, value: I) -> O;

    /// Bind the functor's scalars from `first` on; returns the next free index.
    fn set_kernel_arguments(&self, kernels: &mut KernelManager, handle: KernelHandle, first: usize) -> Result<usize>;
}

/// Host evaluation over every element.
pub fn apply_functor<I: Pixel, O: Pixel, F: PixelFunctor<I, O>>(image: &Image<I>, functor: &F) -> Image<O> {
    let data = image.as_slice().par_iter().map(|&v| functor.evaluate(v)).collect();
    Image::from_vec(*image.geometry(), data)
}

pub struct UnaryFunctorFilter<I: Pixel, O: Pixel, F: PixelFunctor<I, O>> {
    functor: F,
    executor: Executor,
    input: Option<Arc<Image<I>>>,
    output: Option<Image<O>>,
    _pixels: PhantomData<fn(I) -> O>,
}

impl<I: Pixel, O: Pixel, F: PixelFunctor<I, O>> UnaryFunctorFilter<I, O, F> {
    pub fn new(functor: F, executor: Executor) -> Self {
        UnaryFunctorFilter { functor, executor, input: None, output: None, _pixels: PhantomData }
    }

    pub fn functor(&self) -> &F {
        &self.functor
    }

    /// Mutable functor; the previous output is dropped.
    pub fn functor_mut(&mut self) -> &mut F {
        self.output = None;
        &mut self.functor
    }

    pub fn set_functor(&mut self, functor: F) {
        self.functor = functor;
        self.output = None;
    }

    pub fn set_input(&mut self, image: Image<I>) {
        self.input = Some(Arc::new(image));
        self.output = None;
    }

    pub fn output(&self) -> Option<&Image<O>> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<Image<O>> {
        self.output.take()
    }

    pub fn update(&mut self) -> Result<()> {
        let input = self.input.clone().ok_or_else(|| GpuError::InvalidArgument("input image not set".into()))?;
        info!(executor = self.executor.name(), input = %I::TYPE, output = %O::TYPE, functor = ?self.functor, "unary functor");
        let out = match &self.executor {
            Executor::Host => apply_functor(&input, &self.functor),
            Executor::Accelerator(ctx) => {
                crate::gpu::functor::functor_on_device(Arc::clone(ctx), &input, &self.functor)?
            }
        };
        self.output = Some(out);
        Ok(())
    }
}

impl<I: Pixel, O: Pixel, F: PixelFunctor<I, O>> fmt::Debug for UnaryFunctorFilter<I, O, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryFunctorFilter")
            .field("input", &I::TYPE)
            .field("output", &O::TYPE)
            .field("executor", &self.executor)
            .field("functor", &self.functor)
            .finish()
    }
}
