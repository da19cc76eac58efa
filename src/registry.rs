//! Capability registry: picks a filter implementation by pixel type,
//! dimensionality and operation.
//!
//! Constructors are registered against a [`Capability`] and resolved once,
//! when a pipeline is configured. Resolution never falls back silently:
//! asking for a capability nobody registered is an error, and integer
//! pixel types are reported as unsupported because every finite-difference
//! filter here produces real-valued output. The single-pass mean and
//! threshold filters are registered for the same real pixel types so one
//! pipeline can mix them with the iterative filters.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::config::FdConfig;
use crate::demons::DemonsRegistration;
use crate::diffusion::GradientAnisotropicDiffusion;
use crate::error::{GpuError, Result};
use crate::functor::UnaryFunctorFilter;
use crate::image::{Geometry, Image, PixelType, RealPixel, MAX_DIM};
use crate::mean::MeanImageFilter;
use crate::solver::{AbortHandle, Executor};
use crate::threshold::{binary_threshold_filter, BinaryThresholdImageFilter};

// ── Capability ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    DemonsRegistration,
    AnisotropicDiffusion,
    Mean,
    BinaryThreshold,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::DemonsRegistration => "demons_registration",
            OpKind::AnisotropicDiffusion => "anisotropic_diffusion",
            OpKind::Mean => "mean",
            OpKind::BinaryThreshold => "binary_threshold",
        }
    }

    /// Whether the filter runs the finite-difference solver loop.
    pub fn is_iterative(self) -> bool {
        matches!(self, OpKind::DemonsRegistration | OpKind::AnisotropicDiffusion)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    pub pixel: PixelType,
    pub dim: usize,
    pub op: OpKind,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}, {}D>", self.op.name(), self.pixel, self.dim)
    }
}

// ── DynImage ─────────────────────────────────────────────────────────────────

/// An image whose pixel type is only known at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum DynImage {
    F32(Image<f32>),
    F64(Image<f64>),
}

impl DynImage {
    pub fn pixel_type(&self) -> PixelType {
        match self {
            DynImage::F32(_) => PixelType::Float,
            DynImage::F64(_) => PixelType::Double,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        match self {
            DynImage::F32(i) => i.geometry(),
            DynImage::F64(i) => i.geometry(),
        }
    }
}

impl From<Image<f32>> for DynImage {
    fn from(i: Image<f32>) -> Self {
        DynImage::F32(i)
    }
}

impl From<Image<f64>> for DynImage {
    fn from(i: Image<f64>) -> Self {
        DynImage::F64(i)
    }
}

/// Pixel types that can be moved in and out of a [`DynImage`].
pub trait DynPixel: RealPixel {
    fn wrap(image: Image<Self>) -> DynImage;
    fn unwrap(image: DynImage) -> Option<Image<Self>>;
}

impl DynPixel for f32 {
    fn wrap(image: Image<f32>) -> DynImage {
        DynImage::F32(image)
    }

    fn unwrap(image: DynImage) -> Option<Image<f32>> {
        match image {
            DynImage::F32(i) => Some(i),
            DynImage::F64(_) => None,
        }
    }
}

impl DynPixel for f64 {
    fn wrap(image: Image<f64>) -> DynImage {
        DynImage::F64(image)
    }

    fn unwrap(image: DynImage) -> Option<Image<f64>> {
        match image {
            DynImage::F64(i) => Some(i),
            DynImage::F32(_) => None,
        }
    }
}

// ── Filter ───────────────────────────────────────────────────────────────────

/// Type-erased finite-difference filter.
///
/// Inputs are numbered: demons takes the fixed image at 0, the moving
/// image at 1 and an optional initial deformation field at 2; diffusion,
/// mean and threshold take their image at 0.
///
/// Single-pass filters report an RMS change of 0 and one elapsed
/// iteration once updated.
pub trait Filter: Send {
    fn capability(&self) -> Capability;

    fn set_input(&mut self, index: usize, image: DynImage) -> Result<()>;

    fn update(&mut self) -> Result<()>;

    fn output(&self) -> Option<DynImage>;

    fn rms_change(&self) -> f64;

    fn elapsed_iterations(&self) -> u32;

    fn abort_handle(&self) -> AbortHandle;
}

pub type Constructor = fn(&FdConfig, Executor) -> Box<dyn Filter>;

fn checked_input<T: DynPixel>(cap: Capability, index: usize, image: DynImage) -> Result<Image<T>> {
    let geometry = *image.geometry();
    if geometry.dim() != cap.dim {
        return Err(GpuError::Geometry(format!("{cap} given a {}D input {index}", geometry.dim())));
    }
    let pixel = image.pixel_type();
    T::unwrap(image).ok_or_else(|| GpuError::InvalidArgument(format!("{cap} input {index} has pixel type {pixel}")))
}

struct DemonsFilter<T: DynPixel> {
    cap: Capability,
    inner: DemonsRegistration<T>,
}

impl<T: DynPixel> Filter for DemonsFilter<T> {
    fn capability(&self) -> Capability {
        self.cap
    }

    fn set_input(&mut self, index: usize, image: DynImage) -> Result<()> {
        let image = checked_input::<T>(self.cap, index, image)?;
        match index {
            0 => self.inner.set_fixed_image(image),
            1 => self.inner.set_moving_image(image),
            2 => self.inner.set_initial_deformation_field(Some(image)),
            _ => return Err(GpuError::InvalidArgument(format!("{} has no input {index}", self.cap))),
        }
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.inner.update()
    }

    fn output(&self) -> Option<DynImage> {
        self.inner.output().cloned().map(T::wrap)
    }

    fn rms_change(&self) -> f64 {
        self.inner.rms_change()
    }

    fn elapsed_iterations(&self) -> u32 {
        self.inner.elapsed_iterations()
    }

    fn abort_handle(&self) -> AbortHandle {
        self.inner.solver().abort_handle()
    }
}

struct DiffusionFilter<T: DynPixel> {
    cap: Capability,
    inner: GradientAnisotropicDiffusion<T>,
}

impl<T: DynPixel> Filter for DiffusionFilter<T> {
    fn capability(&self) -> Capability {
        self.cap
    }

    fn set_input(&mut self, index: usize, image: DynImage) -> Result<()> {
        if index != 0 {
            return Err(GpuError::InvalidArgument(format!("{} has no input {index}", self.cap)));
        }
        let image = checked_input::<T>(self.cap, index, image)?;
        self.inner.set_input(&image);
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.inner.update()
    }

    fn output(&self) -> Option<DynImage> {
        self.inner.output().cloned().map(T::wrap)
    }

    fn rms_change(&self) -> f64 {
        self.inner.rms_change()
    }

    fn elapsed_iterations(&self) -> u32 {
        self.inner.elapsed_iterations()
    }

    fn abort_handle(&self) -> AbortHandle {
        self.inner.solver().abort_handle()
    }
}

/// Filters with one input and one output of the same pixel type.
struct SinglePassFilter<T: DynPixel, F> {
    cap: Capability,
    inner: F,
    run: fn(&mut F) -> Result<()>,
    set: fn(&mut F, Image<T>),
    get: fn(&F) -> Option<&Image<T>>,
    abort: AbortHandle,
    updated: bool,
}

impl<T: DynPixel, F: Send> Filter for SinglePassFilter<T, F> {
    fn capability(&self) -> Capability {
        self.cap
    }

    fn set_input(&mut self, index: usize, image: DynImage) -> Result<()> {
        if index != 0 {
            return Err(GpuError::InvalidArgument(format!("{} has no input {index}", self.cap)));
        }
        let image = checked_input::<T>(self.cap, index, image)?;
        (self.set)(&mut self.inner, image);
        self.updated = false;
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        if self.abort.is_aborted() {
            return Err(GpuError::ProcessAborted { iteration: 0 });
        }
        (self.run)(&mut self.inner)?;
        self.updated = true;
        Ok(())
    }

    fn output(&self) -> Option<DynImage> {
        (self.get)(&self.inner).cloned().map(T::wrap)
    }

    fn rms_change(&self) -> f64 {
        0.0
    }

    fn elapsed_iterations(&self) -> u32 {
        u32::from(self.updated)
    }

    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

fn demons<T: DynPixel, const D: usize>(cfg: &FdConfig, executor: Executor) -> Box<dyn Filter> {
    let mut inner = DemonsRegistration::<T>::new(cfg.demons.clone(), executor);
    inner.set_reduction_config(cfg.reduction.clone());
    let cap = Capability { pixel: T::TYPE, dim: D, op: OpKind::DemonsRegistration };
    Box::new(DemonsFilter { cap, inner })
}

fn diffusion<T: DynPixel, const D: usize>(cfg: &FdConfig, executor: Executor) -> Box<dyn Filter> {
    let mut inner = GradientAnisotropicDiffusion::<T>::new(cfg.diffusion.clone(), executor);
    inner.set_reduction_config(cfg.reduction.clone());
    let cap = Capability { pixel: T::TYPE, dim: D, op: OpKind::AnisotropicDiffusion };
    Box::new(DiffusionFilter { cap, inner })
}

fn mean<T: DynPixel, const D: usize>(cfg: &FdConfig, executor: Executor) -> Box<dyn Filter> {
    let cap = Capability { pixel: T::TYPE, dim: D, op: OpKind::Mean };
    Box::new(SinglePassFilter::<T, MeanImageFilter<T>> {
        cap,
        inner: MeanImageFilter::new(cfg.mean.clone(), executor),
        run: MeanImageFilter::update,
        set: MeanImageFilter::set_input,
        get: MeanImageFilter::output,
        abort: AbortHandle::default(),
        updated: false,
    })
}

fn threshold<T: DynPixel, const D: usize>(cfg: &FdConfig, executor: Executor) -> Box<dyn Filter> {
    let cap = Capability { pixel: T::TYPE, dim: D, op: OpKind::BinaryThreshold };
    Box::new(SinglePassFilter::<T, BinaryThresholdImageFilter<T, T>> {
        cap,
        inner: binary_threshold_filter(&cfg.threshold, executor),
        run: UnaryFunctorFilter::update,
        set: UnaryFunctorFilter::set_input,
        get: UnaryFunctorFilter::output,
        abort: AbortHandle::default(),
        updated: false,
    })
}

// ── FilterRegistry ───────────────────────────────────────────────────────────

pub struct FilterRegistry {
    constructors: HashMap<Capability, Constructor>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self { constructors: HashMap::new() }
    }

    /// Demons registration, anisotropic diffusion, mean and binary
    /// threshold for `float` and `double` in 1, 2 and 3 dimensions.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        let table: [(PixelType, usize, OpKind, Constructor); 24] = [
            (PixelType::Float, 1, OpKind::DemonsRegistration, demons::<f32, 1>),
            (PixelType::Float, 2, OpKind::DemonsRegistration, demons::<f32, 2>),
            (PixelType::Float, 3, OpKind::DemonsRegistration, demons::<f32, 3>),
            (PixelType::Double, 1, OpKind::DemonsRegistration, demons::<f64, 1>),
            (PixelType::Double, 2, OpKind::DemonsRegistration, demons::<f64, 2>),
            (PixelType::Double, 3, OpKind::DemonsRegistration, demons::<f64, 3>),
            (PixelType::Float, 1, OpKind::AnisotropicDiffusion, diffusion::<f32, 1>),
            (PixelType::Float, 2, OpKind::AnisotropicDiffusion, diffusion::<f32, 2>),
            (PixelType::Float, 3, OpKind::AnisotropicDiffusion, diffusion::<f32, 3>),
            (PixelType::Double, 1, OpKind::AnisotropicDiffusion, diffusion::<f64, 1>),
            (PixelType::Double, 2, OpKind::AnisotropicDiffusion, diffusion::<f64, 2>),
            (PixelType::Double, 3, OpKind::AnisotropicDiffusion, diffusion::<f64, 3>),
            (PixelType::Float, 1, OpKind::Mean, mean::<f32, 1>),
            (PixelType::Float, 2, OpKind::Mean, mean::<f32, 2>),
            (PixelType::Float, 3, OpKind::Mean, mean::<f32, 3>),
            (PixelType::Double, 1, OpKind::Mean, mean::<f64, 1>),
            (PixelType::Double, 2, OpKind::Mean, mean::<f64, 2>),
            (PixelType::Double, 3, OpKind::Mean, mean::<f64, 3>),
            (PixelType::Float, 1, OpKind::BinaryThreshold, threshold::<f32, 1>),
            (PixelType::Float, 2, OpKind::BinaryThreshold, threshold::<f32, 2>),
            (PixelType::Float, 3, OpKind::BinaryThreshold, threshold::<f32, 3>),
            (PixelType::Double, 1, OpKind::BinaryThreshold, threshold::<f64, 1>),
            (PixelType::Double, 2, OpKind::BinaryThreshold, threshold::<f64, 2>),
            (PixelType::Double, 3, OpKind::BinaryThreshold, threshold::<f64, 3>),
        ];
        for (pixel, dim, op, ctor) in table {
            r.register(Capability { pixel, dim, op }, ctor);
        }
        r
    }

    /// Register a constructor, replacing any previous one for `cap`.
    pub fn register(&mut self, cap: Capability, ctor: Constructor) {
        debug!(%cap, "filter registered");
        self.constructors.insert(cap, ctor);
    }

    pub fn contains(&self, cap: &Capability) -> bool {
        self.constructors.contains_key(cap)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Constructor registered for `cap`.
    pub fn resolve(&self, cap: Capability) -> Result<Constructor> {
        if !cap.pixel.is_float() {
            warn!(%cap, "integer pixel types have no finite-difference implementation");
            return Err(GpuError::UnsupportedPixelType(cap.pixel.cl_name()));
        }
        if !(1..=MAX_DIM).contains(&cap.dim) {
            return Err(GpuError::InvalidArgument(format!("{cap}: dimension must be 1..={MAX_DIM}")));
        }
        self.constructors
            .get(&cap)
            .copied()
            .ok_or_else(|| GpuError::InvalidArgument(format!("no filter registered for {cap}")))
    }

    /// Resolve and construct in one step.
    pub fn create(&self, cap: Capability, cfg: &FdConfig, executor: Executor) -> Result<Box<dyn Filter>> {
        let ctor = self.resolve(cap)?;
        Ok(ctor(cfg, executor))
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut caps: Vec<String> = self.constructors.keys().map(|c| c.to_string()).collect();
        caps.sort();
        f.debug_struct("FilterRegistry").field("capabilities", &caps).finish()
    }
}
