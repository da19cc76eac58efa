// demons.rs — Demons deformable registration.
//
// Finds a displacement field `u` such that `moving(x + u(x)) ≈ fixed(x)`.
// Each iteration computes, for every fixed-image pixel,
//
//   speed  = fixed(x) - moving(x + u(x))
//   update = speed · ∇ / (speed² / K + |∇|²)
//
// where ∇ is the fixed-image gradient at x (or the moving-image gradient at
// the mapped point) and K is the mean squared spacing of the fixed image,
// which puts both denominator terms in intensity² units. The update is
// zeroed when the mapped point leaves the moving image, when |speed| is
// below the intensity-difference threshold, or when the denominator is
// below the denominator threshold.
//
// STATISTICS
// ──────────
// Every pixel whose mapped point lands inside the moving image counts
// towards the metric, thresholded or not:
//
//   metric     = Σ speed² / N             (mean squared difference)
//   rms_change = sqrt(Σ |update|² / N)
//
// Both start at f64::MAX and keep their previous value through an
// iteration in which no pixel was processed.
//
// EXECUTORS
// ─────────
// The filter owns the inputs, the configuration and a
// `FiniteDifferenceSolver`; the per-pixel work sits behind a
// `DemonsScheme` picked from the `Executor` when a run initialises:
//
//   Host         — rayon over rows; each row accumulates a private
//                  `GlobalData`, merged into the shared total under one lock.
//   Accelerator  — `gpu::demons`: one kernel launch writes the update plus
//                  per-pixel statistics, three reductions fold them.
//
// After each update the field is smoothed with a Gaussian (on by default);
// smoothing the update before it is applied is optional.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::{DemonsConfig, ReductionConfig};
use crate::convolution::smooth;
use crate::error::{GpuError, Result};
use crate::gradient::{central_difference_at_continuous_index, central_difference_at_index};
use crate::image::{interpolate_linear, Geometry, Image, Pixel, RealPixel, MAX_DIM};
use crate::solver::{resolve_time_step, Executor, FiniteDifferenceSolver, IterationEvent, UpdateScheme};

// ---------------------------------------------------------------------------
// Per-pixel update
// ---------------------------------------------------------------------------

/// Per-iteration constants of the update rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemonsParameters {
    pub intensity_difference_threshold: f64,
    pub denominator_threshold: f64,
    pub use_moving_image_gradient: bool,
    /// Mean squared spacing of the fixed image.
    pub normalizer: f64,
}

impl DemonsParameters {
    pub fn new(config: &DemonsConfig, fixed: &Geometry) -> Self {
        DemonsParameters {
            intensity_difference_threshold: config.intensity_difference_threshold,
            denominator_threshold: config.denominator_threshold,
            use_moving_image_gradient: config.use_moving_image_gradient,
            normalizer: normalizer(fixed),
        }
    }
}

/// Mean of the squared pixel spacing.
pub fn normalizer(geometry: &Geometry) -> f64 {
    let spacing = geometry.spacing();
    spacing.iter().map(|s| s * s).sum::<f64>() / spacing.len() as f64
}

/// Metric accumulators for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GlobalData {
    pub sum_of_squared_difference: f64,
    pub pixels_processed: u64,
    pub sum_of_squared_change: f64,
}

impl GlobalData {
    pub fn merge(&mut self, other: &GlobalData) {
        self.sum_of_squared_difference += other.sum_of_squared_difference;
        self.pixels_processed += other.pixels_processed;
        self.sum_of_squared_change += other.sum_of_squared_change;
    }

    /// Mean squared difference, if any pixel was processed.
    pub fn metric(&self) -> Option<f64> {
        (self.pixels_processed > 0).then(|| self.sum_of_squared_difference / self.pixels_processed as f64)
    }

    pub fn rms_change(&self) -> Option<f64> {
        (self.pixels_processed > 0).then(|| (self.sum_of_squared_change / self.pixels_processed as f64).sqrt())
    }
}

/// Update vector at one fixed-image pixel.
///
/// `field` shares the fixed image's grid and holds one component per axis.
/// Statistics are added to `gd` when given. Axes past the image
/// dimensionality are always zero.
pub fn compute_update_at<T: Pixel>(
    fixed: &Image<T>,
    moving: &Image<T>,
    field: &Image<T>,
    index: &[usize; MAX_DIM],
    params: &DemonsParameters,
    mut gd: Option<&mut GlobalData>,
) -> [f64; MAX_DIM] {
    let zero = [0.0; MAX_DIM];
    let fg = fixed.geometry();
    let dim = fg.dim();
    let fixed_value = fixed.at(index, 0).to_f64();

    let mut mapped = fg.physical_point(index);
    for d in 0..dim {
        mapped[d] += field.at(index, d).to_f64();
    }
    let cindex = moving.geometry().continuous_index(&mapped);
    if !moving.geometry().is_inside_buffer(&cindex) {
        return zero;
    }
    let moving_value = interpolate_linear(moving, &cindex, 0);

    let gradient = if params.use_moving_image_gradient {
        central_difference_at_continuous_index(moving, &cindex)
    } else {
        central_difference_at_index(fixed, index)
    };
    let gradient_squared: f64 = gradient[..dim].iter().map(|g| g * g).sum();

    let speed = fixed_value - moving_value;
    let speed_squared = speed * speed;
    if let Some(gd) = gd.as_deref_mut() {
        gd.sum_of_squared_difference += speed_squared;
        gd.pixels_processed += 1;
    }

    let denominator = speed_squared / params.normalizer + gradient_squared;
    if speed.abs() < params.intensity_difference_threshold || denominator < params.denominator_threshold {
        return zero;
    }

    let mut update = zero;
    for d in 0..dim {
        update[d] = speed * gradient[d] / denominator;
    }
    if let Some(gd) = gd {
        gd.sum_of_squared_change += update[..dim].iter().map(|u| u * u).sum::<f64>();
    }
    update
}

// ---------------------------------------------------------------------------
// Stop flag
// ---------------------------------------------------------------------------

/// Ends a registration run gracefully before the next iteration starts.
///
/// Unlike an abort, a stop is a normal halt: the run returns `Ok` and the
/// output holds the field of the last completed iteration. The flag is
/// cleared whenever a run initialises.
#[derive(Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StopHandle({})", self.is_stopped())
    }
}

// ---------------------------------------------------------------------------
// Inputs shared by both executors
// ---------------------------------------------------------------------------

pub(crate) struct DemonsInputs<T: RealPixel> {
    pub fixed: Arc<Image<T>>,
    pub moving: Arc<Image<T>>,
    pub initial: Option<Arc<Image<T>>>,
    pub config: DemonsConfig,
    pub reduction: ReductionConfig,
    pub stop: StopHandle,
}

impl<T: RealPixel> DemonsInputs<T> {
    fn validate(&self) -> Result<()> {
        let fg = self.fixed.geometry();
        let mg = self.moving.geometry();
        if fg.dim() != mg.dim() {
            return Err(GpuError::Geometry(format!("fixed image is {}D, moving image is {}D", fg.dim(), mg.dim())));
        }
        if fg.components() != 1 || mg.components() != 1 {
            return Err(GpuError::Geometry("fixed and moving images must be scalar".into()));
        }
        if let Some(initial) = &self.initial {
            let ig = initial.geometry();
            if !ig.same_grid(fg) || ig.components() != fg.dim() {
                return Err(GpuError::Geometry(format!(
                    "initial deformation field {ig} does not match fixed image {fg}"
                )));
            }
        }
        Ok(())
    }

    /// Grid of the deformation field: the fixed grid, one component per axis.
    pub fn field_geometry(&self) -> Geometry {
        self.fixed.geometry().vector_field()
    }

    /// Starting field: the initial deformation field, or zero.
    pub fn initial_field(&self) -> Image<T> {
        match &self.initial {
            Some(field) => Image::clone(field),
            None => Image::new(self.field_geometry()),
        }
    }

    pub fn parameters(&self) -> DemonsParameters {
        DemonsParameters::new(&self.config, self.fixed.geometry())
    }
}

/// One executor's implementation of the registration iteration.
pub(crate) trait DemonsScheme<T: RealPixel>: UpdateScheme + Send {
    /// Pick up configuration changes made between resumed runs.
    fn configure(&mut self, config: &DemonsConfig);

    fn deformation_field(&self) -> Result<Image<T>>;
}

// ---------------------------------------------------------------------------
// Host executor
// ---------------------------------------------------------------------------

struct HostDemons<T: RealPixel> {
    inputs: DemonsInputs<T>,
    params: DemonsParameters,
    field: Image<T>,
    update: Image<T>,
    totals: Mutex<GlobalData>,
    metric: f64,
    rms_change: f64,
}

impl<T: RealPixel> HostDemons<T> {
    fn new(inputs: DemonsInputs<T>) -> Self {
        let geometry = inputs.field_geometry();
        let params = inputs.parameters();
        HostDemons {
            inputs,
            params,
            field: Image::new(geometry),
            update: Image::new(geometry),
            totals: Mutex::new(GlobalData::default()),
            metric: f64::MAX,
            rms_change: f64::MAX,
        }
    }
}

impl<T: RealPixel> UpdateScheme for HostDemons<T> {
    fn geometry(&self) -> Geometry {
        self.inputs.field_geometry()
    }

    fn copy_input_to_output(&mut self) -> Result<()> {
        self.field = self.inputs.initial_field();
        Ok(())
    }

    fn initialize(&mut self, _coefficients: [f64; MAX_DIM]) -> Result<()> {
        self.inputs.stop.reset();
        self.params = self.inputs.parameters();
        Ok(())
    }

    fn allocate_update_buffer(&mut self) -> Result<()> {
        self.update = Image::new(self.inputs.field_geometry());
        Ok(())
    }

    fn initialize_iteration(&mut self) -> Result<()> {
        self.params = self.inputs.parameters();
        *self.totals.lock() = GlobalData::default();
        Ok(())
    }

    fn compute_update(&mut self) -> Result<f64> {
        let geometry = self.inputs.field_geometry();
        let dim = geometry.dim();
        let row = geometry.extent()[0];
        let time_step = self.inputs.config.time_step;
        let (fixed, moving, field, params) = (&*self.inputs.fixed, &*self.inputs.moving, &self.field, &self.params);
        let totals = &self.totals;

        let steps: Vec<f64> = self
            .update
            .as_mut_slice()
            .par_chunks_mut(row * dim)
            .enumerate()
            .map(|(r, chunk)| {
                let mut local = GlobalData::default();
                for (x, out) in chunk.chunks_mut(dim).enumerate() {
                    let index = geometry.index_of(r * row + x);
                    let u = compute_update_at(fixed, moving, field, &index, params, Some(&mut local));
                    for (o, v) in out.iter_mut().zip(u) {
                        *o = T::from_f64(v);
                    }
                }
                totals.lock().merge(&local);
                time_step
            })
            .collect();

        let totals = *self.totals.lock();
        if let Some(m) = totals.metric() {
            self.metric = m;
        }
        if let Some(r) = totals.rms_change() {
            self.rms_change = r;
        }
        resolve_time_step(&steps, &vec![true; steps.len()])
    }

    fn apply_update(&mut self, dt: f64) -> Result<()> {
        let cfg = &self.inputs.config;
        let dim = self.field.geometry().dim();
        if cfg.smooth_update_field {
            self.update = smooth(&self.update, &cfg.update_sigma[..dim], cfg.maximum_error, cfg.maximum_kernel_width);
        }
        for (f, u) in self.field.as_mut_slice().iter_mut().zip(self.update.as_slice()) {
            *f = T::from_f64(f.to_f64() + dt * u.to_f64());
        }
        if cfg.smooth_deformation_field {
            self.field =
                smooth(&self.field, &cfg.deformation_sigma[..dim], cfg.maximum_error, cfg.maximum_kernel_width);
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

impl<T: RealPixel> DemonsScheme<T> for HostDemons<T> {
    fn configure(&mut self, config: &DemonsConfig) {
        self.inputs.config = config.clone();
    }

    fn deformation_field(&self) -> Result<Image<T>> {
        Ok(self.field.clone())
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Demons registration of a moving image onto a fixed image.
///
/// ```text
/// let mut reg = DemonsRegistration::<f32>::new(DemonsConfig::default(), Executor::Host);
/// reg.set_fixed_image(fixed);
/// reg.set_moving_image(moving);
/// reg.update()?;
/// let field = reg.output();
/// ```
pub struct DemonsRegistration<T: RealPixel> {
    config: DemonsConfig,
    reduction: ReductionConfig,
    executor: Executor,
    fixed: Option<Arc<Image<T>>>,
    moving: Option<Arc<Image<T>>>,
    initial: Option<Arc<Image<T>>>,
    solver: FiniteDifferenceSolver,
    stop: StopHandle,
    scheme: Option<Box<dyn DemonsScheme<T>>>,
    output: Option<Image<T>>,
    metric: f64,
    rms_change: f64,
}

impl<T: RealPixel> DemonsRegistration<T> {
    pub fn new(config: DemonsConfig, executor: Executor) -> Self {
        let solver = FiniteDifferenceSolver::new(config.solver.clone());
        DemonsRegistration {
            config,
            reduction: ReductionConfig::default(),
            executor,
            fixed: None,
            moving: None,
            initial: None,
            solver,
            stop: StopHandle::default(),
            scheme: None,
            output: None,
            metric: f64::MAX,
            rms_change: f64::MAX,
        }
    }

    pub fn config(&self) -> &DemonsConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn set_fixed_image(&mut self, image: Image<T>) {
        self.fixed = Some(Arc::new(image));
        self.invalidate();
    }

    pub fn set_moving_image(&mut self, image: Image<T>) {
        self.moving = Some(Arc::new(image));
        self.invalidate();
    }

    /// Field the first iteration starts from; zero when unset.
    pub fn set_initial_deformation_field(&mut self, field: Option<Image<T>>) {
        self.initial = field.map(Arc::new);
        self.invalidate();
    }

    /// New inputs always start a fresh run, even with manual reinitialisation.
    fn invalidate(&mut self) {
        self.scheme = None;
        self.solver.reinitialize();
    }

    pub fn fixed_image(&self) -> Option<&Image<T>> {
        self.fixed.as_deref()
    }

    pub fn moving_image(&self) -> Option<&Image<T>> {
        self.moving.as_deref()
    }

    /// Reduction engine settings used by the accelerator executor.
    pub fn set_reduction_config(&mut self, reduction: ReductionConfig) {
        self.reduction = reduction;
    }

    pub fn set_time_step(&mut self, dt: f64) {
        self.config.time_step = dt;
    }

    pub fn set_intensity_difference_threshold(&mut self, threshold: f64) {
        self.config.intensity_difference_threshold = threshold;
    }

    pub fn intensity_difference_threshold(&self) -> f64 {
        self.config.intensity_difference_threshold
    }

    pub fn set_denominator_threshold(&mut self, threshold: f64) {
        self.config.denominator_threshold = threshold;
    }

    pub fn set_use_moving_image_gradient(&mut self, on: bool) {
        self.config.use_moving_image_gradient = on;
    }

    pub fn set_smooth_deformation_field(&mut self, on: bool) {
        self.config.smooth_deformation_field = on;
    }

    /// Per-axis Gaussian standard deviations for field smoothing, in pixels.
    pub fn set_standard_deviations(&mut self, sigma: &[f64]) {
        copy_sigmas(&mut self.config.deformation_sigma, sigma);
    }

    pub fn set_smooth_update_field(&mut self, on: bool) {
        self.config.smooth_update_field = on;
    }

    pub fn set_update_field_standard_deviations(&mut self, sigma: &[f64]) {
        copy_sigmas(&mut self.config.update_sigma, sigma);
    }

    pub fn set_maximum_error(&mut self, e: f64) {
        self.config.maximum_error = e;
    }

    pub fn set_maximum_kernel_width(&mut self, w: usize) {
        self.config.maximum_kernel_width = w;
    }

    pub fn set_number_of_iterations(&mut self, n: u32) {
        self.config.solver.max_iterations = n;
        self.solver.set_max_iterations(n);
    }

    /// The solver loop: halting policy, observers and abort handle.
    pub fn solver(&self) -> &FiniteDifferenceSolver {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut FiniteDifferenceSolver {
        &mut self.solver
    }

    pub fn on_iteration<F>(&mut self, f: F)
    where
        F: FnMut(&IterationEvent) + Send + 'static,
    {
        self.solver.on_iteration(f);
    }

    /// Halt after the iteration in progress.
    pub fn stop_registration(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Mean squared difference of the last iteration; f64::MAX before any.
    pub fn metric(&self) -> f64 {
        self.metric
    }

    pub fn rms_change(&self) -> f64 {
        self.rms_change
    }

    pub fn elapsed_iterations(&self) -> u32 {
        self.solver.elapsed_iterations()
    }

    /// Deformation field produced by the last run.
    pub fn output(&self) -> Option<&Image<T>> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<Image<T>> {
        self.output.take()
    }

    /// Run the registration.
    ///
    /// With manual reinitialisation on, a second call resumes from the
    /// field the first one left; otherwise every call starts over.
    pub fn update(&mut self) -> Result<()> {
        let mut scheme = match self.scheme.take() {
            Some(mut s) if self.solver.state() == crate::solver::SolverState::Initialized => {
                s.configure(&self.config);
                s
            }
            _ => self.build_scheme()?,
        };

        info!(executor = self.executor.name(), pixel = %T::TYPE, "demons registration");
        let run = self.solver.run(scheme.as_mut());
        if run.is_ok() || matches!(run, Err(GpuError::ProcessAborted { .. })) {
            self.output = Some(scheme.deformation_field()?);
        }
        self.rms_change = scheme.rms_change();
        self.metric = scheme.metric().unwrap_or(f64::MAX);
        debug!(metric = self.metric, rms = self.rms_change, "demons run complete");
        self.scheme = Some(scheme);
        run
    }

    fn build_scheme(&self) -> Result<Box<dyn DemonsScheme<T>>> {
        let fixed = self.fixed.clone().ok_or_else(|| GpuError::InvalidArgument("fixed image not set".into()))?;
        let moving = self.moving.clone().ok_or_else(|| GpuError::InvalidArgument("moving image not set".into()))?;
        let inputs = DemonsInputs {
            fixed,
            moving,
            initial: self.initial.clone(),
            config: self.config.clone(),
            reduction: self.reduction.clone(),
            stop: self.stop.clone(),
        };
        inputs.validate()?;
        match &self.executor {
            Executor::Host => Ok(Box::new(HostDemons::new(inputs))),
            Executor::Accelerator(ctx) => {
                Ok(Box::new(crate::gpu::demons::AcceleratorDemons::new(Arc::clone(ctx), inputs)?))
            }
        }
    }
}

impl<T: RealPixel> fmt::Debug for DemonsRegistration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemonsRegistration")
            .field("pixel", &T::TYPE)
            .field("executor", &self.executor)
            .field("config", &self.config)
            .field("solver", &self.solver)
            .field("metric", &self.metric)
            .field("rms_change", &self.rms_change)
            .finish()
    }
}

fn copy_sigmas(dst: &mut [f64; MAX_DIM], src: &[f64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DemonsParameters {
        DemonsParameters {
            intensity_difference_threshold: 0.001,
            denominator_threshold: 1e-9,
            use_moving_image_gradient: false,
            normalizer: 1.0,
        }
    }

    fn ramp(w: usize, h: usize, offset: f64) -> Image<f64> {
        let g = Geometry::new(&[w, h]);
        Image::from_vec(g, (0..w * h).map(|i| (i % w) as f64 + offset).collect())
    }

    #[test]
    fn test_normalizer_is_mean_squared_spacing() {
        let g = Geometry::new(&[4, 4]).with_spacing(&[1.0, 3.0]);
        assert_eq!(normalizer(&g), 5.0);
    }

    #[test]
    fn test_update_points_along_gradient() {
        let fixed = ramp(6, 6, 0.0);
        let moving = ramp(6, 6, -1.0);
        let field = Image::new(fixed.geometry().vector_field());
        let mut gd = GlobalData::default();
        let u = compute_update_at(&fixed, &moving, &field, &[2, 2, 0], &params(), Some(&mut gd));
        // speed = 1, gradient = (1, 0), denominator = 1 + 1.
        assert!((u[0] - 0.5).abs() < 1e-12);
        assert_eq!(u[1], 0.0);
        assert_eq!(gd.pixels_processed, 1);
        assert!((gd.sum_of_squared_difference - 1.0).abs() < 1e-12);
        assert!((gd.sum_of_squared_change - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_mapped_point_outside_moving_is_zero() {
        let fixed = ramp(6, 6, 0.0);
        let moving = ramp(6, 6, -1.0);
        let mut field = Image::new(fixed.geometry().vector_field());
        field.set_vector(&[2, 2], &[10.0, 0.0]);
        let mut gd = GlobalData::default();
        let u = compute_update_at(&fixed, &moving, &field, &[2, 2, 0], &params(), Some(&mut gd));
        assert_eq!(u, [0.0; 3]);
        assert_eq!(gd.pixels_processed, 0);
    }

    #[test]
    fn test_small_speed_is_zero_but_counted() {
        let fixed = ramp(6, 6, 0.0);
        let moving = ramp(6, 6, -0.0005);
        let field = Image::new(fixed.geometry().vector_field());
        let mut gd = GlobalData::default();
        let u = compute_update_at(&fixed, &moving, &field, &[2, 2, 0], &params(), Some(&mut gd));
        assert_eq!(u, [0.0; 3]);
        assert_eq!(gd.pixels_processed, 1);
        assert_eq!(gd.sum_of_squared_change, 0.0);
    }

    #[test]
    fn test_small_denominator_is_zero() {
        let fixed = Image::filled(Geometry::new(&[5, 5]), 0.01f64);
        let moving = Image::filled(Geometry::new(&[5, 5]), 0.0f64);
        let field = Image::new(fixed.geometry().vector_field());
        let p = DemonsParameters { denominator_threshold: 1.0, ..params() };
        let u = compute_update_at(&fixed, &moving, &field, &[2, 2, 0], &p, None);
        assert_eq!(u, [0.0; 3]);
    }

    #[test]
    fn test_global_data_merge() {
        let mut a = GlobalData { sum_of_squared_difference: 1.0, pixels_processed: 2, sum_of_squared_change: 8.0 };
        a.merge(&GlobalData { sum_of_squared_difference: 3.0, pixels_processed: 2, sum_of_squared_change: 8.0 });
        assert_eq!(a.metric(), Some(1.0));
        assert_eq!(a.rms_change(), Some(2.0));
        assert_eq!(GlobalData::default().metric(), None);
    }

    #[test]
    fn test_stop_handle() {
        let reg = DemonsRegistration::<f32>::new(DemonsConfig::default(), Executor::Host);
        let h = reg.stop_handle();
        reg.stop_registration();
        assert!(h.is_stopped());
        h.reset();
        assert!(!h.is_stopped());
    }

    #[test]
    fn test_missing_inputs() {
        let mut reg = DemonsRegistration::<f32>::new(DemonsConfig::default(), Executor::Host);
        assert!(matches!(reg.update(), Err(GpuError::InvalidArgument(_))));
        assert_eq!(reg.metric(), f64::MAX);
    }
}
