// gpu/demons.rs — Accelerator executor for demons registration.
//
// PER ITERATION
// ──────────────
//   compute_update  one launch over the fixed grid → update field plus the
//                   per-pixel counter / sq_change / sq_diff buffers
//                   three reductions → N, Σ|update|², Σspeed²
//   apply_update    [smooth update] → output += dt·update → [smooth output]
//
// The fixed and moving images are uploaded once when the scheme is built;
// the deformation field, the update and the statistics never leave the
// device between iterations. The field is read back only when the filter
// asks for its output.
//
// KERNEL ARGUMENTS
// ────────────────
//   0 fixed  1 moving  2 field  3 update (rw)
//   4 counter (rw, i32)  5 sq_change (rw)  6 sq_diff (rw)
//   7..=12  fixed size xyz, moving size xyz           (u32)
//   13      use moving-image gradient                 (u32, 0/1)
//   14..=25 fixed spacing, fixed origin, moving spacing, moving origin (T)
//   26 normalizer  27 intensity threshold  28 denominator threshold  (T)
//
// The host emulation of `compute_update` rebuilds host images from the
// bound buffers and calls `demons::compute_update_at` per pixel.

use std::sync::Arc;

use tracing::debug;

use crate::config::DemonsConfig;
use crate::demons::{compute_update_at, DemonsInputs, DemonsParameters, DemonsScheme, GlobalData};
use crate::error::{GpuError, Result};
use crate::gpu::apply::UpdateApplier;
use crate::gpu::buffer::BufferManager;
use crate::gpu::context::DeviceContext;
use crate::gpu::host::HostLaunch;
use crate::gpu::image::GpuImage;
use crate::gpu::kernel::{image_local_size, ArgKind, Defines, EntryPoint, KernelHandle, KernelManager, KernelSource};
use crate::gpu::reduction::Reduction;
use crate::gpu::smooth::{image_from_arg, GaussianSmoother};
use crate::image::{Geometry, Image, PixelType, RealPixel, MAX_DIM};
use crate::solver::{resolve_time_step, UpdateScheme};

const SCALAR_ARGS: usize = 22;

static DEMONS_ARGS: [ArgKind; 7 + SCALAR_ARGS] = {
    let mut args = [ArgKind::Scalar; 7 + SCALAR_ARGS];
    args[0] = ArgKind::Buffer;
    args[1] = ArgKind::Buffer;
    args[2] = ArgKind::Buffer;
    args[3] = ArgKind::BufferMut;
    args[4] = ArgKind::BufferMut;
    args[5] = ArgKind::BufferMut;
    args[6] = ArgKind::BufferMut;
    args
};

pub static DEMONS: KernelSource = KernelSource {
    id: "demons",
    wgsl: include_str!("../shaders/demons.wgsl"),
    entry_points: &[EntryPoint { name: "compute_update", args: &DEMONS_ARGS, host: compute_update_host }],
};

pub(crate) struct AcceleratorDemons<T: RealPixel> {
    inputs: DemonsInputs<T>,
    ctx: Arc<DeviceContext>,
    params: DemonsParameters,
    fixed: GpuImage<T>,
    moving: GpuImage<T>,
    field: GpuImage<T>,
    update: GpuImage<T>,
    scratch: GpuImage<T>,
    kernels: KernelManager,
    handle: KernelHandle,
    applier: UpdateApplier<T>,
    field_smoother: Option<GaussianSmoother<T>>,
    update_smoother: Option<GaussianSmoother<T>>,
    counter: Reduction<i32>,
    squared_change: Reduction<T>,
    squared_difference: Reduction<T>,
    metric: f64,
    rms_change: f64,
}

impl<T: RealPixel> AcceleratorDemons<T> {
    pub(crate) fn new(ctx: Arc<DeviceContext>, inputs: DemonsInputs<T>) -> Result<Self> {
        let geometry = inputs.field_geometry();
        let pixels = geometry.num_pixels();

        let mut kernels = KernelManager::new(Arc::clone(&ctx));
        let defines = Defines::new()
            .pixel("T", T::TYPE)
            .dim(geometry.dim())
            .workgroup(image_local_size(geometry.dim()));
        kernels.load_program(&DEMONS, &defines)?;
        let handle = kernels.create_kernel("compute_update")?;

        let mut counter = Reduction::new(Arc::clone(&ctx), inputs.reduction.clone())?;
        let mut squared_change = Reduction::new(Arc::clone(&ctx), inputs.reduction.clone())?;
        let mut squared_difference = Reduction::new(Arc::clone(&ctx), inputs.reduction.clone())?;
        counter.initialize_kernel(pixels)?;
        squared_change.initialize_kernel(pixels)?;
        squared_difference.initialize_kernel(pixels)?;
        counter.allocate_input_buffer(pixels)?;
        squared_change.allocate_input_buffer(pixels)?;
        squared_difference.allocate_input_buffer(pixels)?;

        debug!(%geometry, device = %ctx.info().name, "demons accelerator scheme ready");
        Ok(AcceleratorDemons {
            params: inputs.parameters(),
            fixed: GpuImage::from_image(Arc::clone(&ctx), &inputs.fixed)?,
            moving: GpuImage::from_image(Arc::clone(&ctx), &inputs.moving)?,
            field: GpuImage::new(Arc::clone(&ctx), geometry)?,
            update: GpuImage::new(Arc::clone(&ctx), geometry)?,
            scratch: GpuImage::new(Arc::clone(&ctx), geometry)?,
            applier: UpdateApplier::new(Arc::clone(&ctx), geometry)?,
            kernels,
            handle,
            field_smoother: None,
            update_smoother: None,
            counter,
            squared_change,
            squared_difference,
            metric: f64::MAX,
            rms_change: f64::MAX,
            ctx,
            inputs,
        })
    }

    fn bind_arguments(&mut self) -> Result<()> {
        let h = self.handle;
        let k = &mut self.kernels;
        k.set_kernel_arg_with_buffer(h, 0, self.fixed.buffer())?;
        k.set_kernel_arg_with_buffer(h, 1, self.moving.buffer())?;
        k.set_kernel_arg_with_buffer(h, 2, self.field.buffer())?;
        k.set_kernel_arg_with_buffer(h, 3, self.update.buffer())?;
        k.set_kernel_arg_with_buffer(h, 4, input_of(&self.counter)?)?;
        k.set_kernel_arg_with_buffer(h, 5, input_of(&self.squared_change)?)?;
        k.set_kernel_arg_with_buffer(h, 6, input_of(&self.squared_difference)?)?;

        let fg = self.fixed.geometry();
        let mg = self.moving.geometry();
        let mut i = 7;
        for v in fg.extent().into_iter().chain(mg.extent()) {
            k.set_kernel_arg_scalar(h, i, v as u32)?;
            i += 1;
        }
        k.set_kernel_arg_scalar(h, i, self.params.use_moving_image_gradient as u32)?;
        i += 1;
        let reals = fg
            .full_spacing()
            .into_iter()
            .chain(fg.full_origin())
            .chain(mg.full_spacing())
            .chain(mg.full_origin())
            .chain([
                self.params.normalizer,
                self.params.intensity_difference_threshold,
                self.params.denominator_threshold,
            ]);
        for v in reals {
            k.set_kernel_arg_scalar(h, i, T::from_f64(v))?;
            i += 1;
        }
        Ok(())
    }

    /// Smoother for `sigmas`, rebuilt only when the sigmas change.
    fn smoother<'a>(
        slot: &'a mut Option<GaussianSmoother<T>>,
        ctx: &Arc<DeviceContext>,
        geometry: Geometry,
        sigmas: &[f64; MAX_DIM],
        config: &DemonsConfig,
    ) -> Result<&'a mut GaussianSmoother<T>> {
        let dim = geometry.dim();
        let stale = match slot {
            Some(s) => s.sigmas()[..dim] != sigmas[..dim],
            None => true,
        };
        if stale {
            *slot = Some(GaussianSmoother::new(
                Arc::clone(ctx),
                geometry,
                &sigmas[..dim],
                config.maximum_error,
                config.maximum_kernel_width,
            )?);
        }
        slot.as_mut().ok_or_else(|| GpuError::InvalidArgument("smoother missing".into()))
    }
}

fn input_of<E: crate::gpu::reduction::ReduceElement>(r: &Reduction<E>) -> Result<&Arc<BufferManager<E>>> {
    r.input_buffer()
        .ok_or_else(|| GpuError::InvalidArgument("statistics buffer not allocated".into()))
}

impl<T: RealPixel> UpdateScheme for AcceleratorDemons<T> {
    fn geometry(&self) -> Geometry {
        self.inputs.field_geometry()
    }

    fn copy_input_to_output(&mut self) -> Result<()> {
        let initial = self.inputs.initial_field();
        self.field.host_buffer_mut()?.copy_from_slice(initial.as_slice());
        Ok(())
    }

    fn initialize(&mut self, _coefficients: [f64; MAX_DIM]) -> Result<()> {
        self.inputs.stop.reset();
        self.params = self.inputs.parameters();
        Ok(())
    }

    fn allocate_update_buffer(&mut self) -> Result<()> {
        self.update.fill(T::default())
    }

    fn initialize_iteration(&mut self) -> Result<()> {
        self.params = self.inputs.parameters();
        Ok(())
    }

    fn compute_update(&mut self) -> Result<f64> {
        self.bind_arguments()?;
        let geometry = *self.fixed.geometry();
        self.kernels.launch_image(self.handle, &geometry)?;

        let processed = self.counter.generate()?;
        let squared_change = self.squared_change.generate()?.to_f64();
        let squared_difference = self.squared_difference.generate()?.to_f64();
        let totals = GlobalData {
            sum_of_squared_difference: squared_difference,
            pixels_processed: processed.max(0) as u64,
            sum_of_squared_change: squared_change,
        };
        if let Some(m) = totals.metric() {
            self.metric = m;
        }
        if let Some(r) = totals.rms_change() {
            self.rms_change = r;
        }
        resolve_time_step(&[self.inputs.config.time_step], &[true])
    }

    fn apply_update(&mut self, dt: f64) -> Result<()> {
        let geometry = self.inputs.field_geometry();
        let config = self.inputs.config.clone();
        if config.smooth_update_field {
            let s = Self::smoother(&mut self.update_smoother, &self.ctx, geometry, &config.update_sigma, &config)?;
            s.smooth(&mut self.update, &mut self.scratch)?;
        }
        self.applier.apply(self.field.buffer(), self.update.buffer(), T::from_f64(dt))?;
        if config.smooth_deformation_field {
            let s =
                Self::smoother(&mut self.field_smoother, &self.ctx, geometry, &config.deformation_sigma, &config)?;
            s.smooth(&mut self.field, &mut self.scratch)?;
        }
        Ok(())
    }

    fn rms_change(&self) -> f64 {
        self.rms_change
    }

    fn metric(&self) -> Option<f64> {
        Some(self.metric)
    }

    fn halt_requested(&self) -> bool {
        self.inputs.stop.is_stopped()
    }
}

impl<T: RealPixel> DemonsScheme<T> for AcceleratorDemons<T> {
    fn configure(&mut self, config: &DemonsConfig) {
        if config.maximum_error != self.inputs.config.maximum_error
            || config.maximum_kernel_width != self.inputs.config.maximum_kernel_width
        {
            self.field_smoother = None;
            self.update_smoother = None;
        }
        self.inputs.config = config.clone();
    }

    fn deformation_field(&self) -> Result<Image<T>> {
        self.field.to_image()
    }
}

// ---------------------------------------------------------------------------
// Host emulation
// ---------------------------------------------------------------------------

fn compute_update_host(hl: &mut HostLaunch<'_>) -> Result<()> {
    match hl.pixel("T")? {
        PixelType::Float => compute_update_emulated::<f32>(hl),
        PixelType::Double => compute_update_emulated::<f64>(hl),
        other => Err(GpuError::UnsupportedPixelType(other.cl_name())),
    }
}

fn compute_update_emulated<T: RealPixel>(hl: &mut HostLaunch<'_>) -> Result<()> {
    let dim = hl.define_usize("DIM")?;
    if !(1..=MAX_DIM).contains(&dim) {
        return Err(GpuError::InvalidArgument(format!("compute_update: DIM = {dim}")));
    }
    let u = |i: usize| hl.scalar::<u32>(i).map(|v| v as usize);
    let t = |i: usize| hl.scalar::<T>(i).map(|v| v.to_f64());
    let fixed_size = [u(7)?, u(8)?, u(9)?];
    let moving_size = [u(10)?, u(11)?, u(12)?];
    let use_moving = hl.scalar::<u32>(13)? != 0;
    let mut reals = [0.0; 15];
    for (k, r) in reals.iter_mut().enumerate() {
        *r = t(14 + k)?;
    }

    let fixed_geometry =
        Geometry::try_new(&fixed_size[..dim])?.with_spacing(&reals[0..dim]).with_origin(&reals[3..3 + dim]);
    let moving_geometry =
        Geometry::try_new(&moving_size[..dim])?.with_spacing(&reals[6..6 + dim]).with_origin(&reals[9..9 + dim]);
    let params = DemonsParameters {
        normalizer: reals[12],
        intensity_difference_threshold: reals[13],
        denominator_threshold: reals[14],
        use_moving_image_gradient: use_moving,
    };

    let fixed = image_from_arg::<T>(hl, 0, fixed_geometry)?;
    let moving = image_from_arg::<T>(hl, 1, moving_geometry)?;
    let field = image_from_arg::<T>(hl, 2, fixed_geometry.vector_field())?;

    let pixels = fixed_geometry.num_pixels();
    let mut update = vec![T::default(); pixels * dim];
    let mut counter = vec![0i32; pixels];
    let mut squared_change = vec![T::default(); pixels];
    let mut squared_difference = vec![T::default(); pixels];
    for p in 0..pixels {
        let index = fixed_geometry.index_of(p);
        let mut gd = GlobalData::default();
        let v = compute_update_at(&fixed, &moving, &field, &index, &params, Some(&mut gd));
        for d in 0..dim {
            update[p * dim + d] = T::from_f64(v[d]);
        }
        counter[p] = gd.pixels_processed as i32;
        squared_change[p] = T::from_f64(gd.sum_of_squared_change);
        squared_difference[p] = T::from_f64(gd.sum_of_squared_difference);
    }

    hl.store(3, &update)?;
    hl.store(4, &counter)?;
    hl.store(5, &squared_change)?;
    hl.store(6, &squared_difference)
}
