// diffusion.rs — Gradient anisotropic diffusion (Perona-Malik, N-D).
//
// Edge-preserving smoothing driven by the same solver loop as demons
// registration. Per iteration:
//
//   1. initialize_iteration: average squared gradient magnitude over the
//      image, ⟨|∇I|²⟩, and the conductance constant
//          K = ⟨|∇I|²⟩ · conductance² · −2
//   2. compute_update: for every pixel and axis i,
//          ∂⁺ = I(x + eᵢ) − I(x)        ∂⁻ = I(x) − I(x − eᵢ)
//      each scaled by the axis coefficient, and the conductances
//          C⁺ = exp((∂⁺² + Σⱼ≠ᵢ ¼(∂ⱼ(x) + ∂ⱼ(x + eᵢ))²) / K)
//          C⁻ = exp((∂⁻² + Σⱼ≠ᵢ ¼(∂ⱼ(x) + ∂ⱼ(x − eᵢ))²) / K)
//      give   update = Σᵢ ∂⁺·C⁺ − ∂⁻·C⁻
//      K = 0 (a constant image) switches conduction off: the update is 0.
//   3. apply_update: I += dt · update.
//
// Neighbours past the border are clamped (zero-flux boundary), so no
// intensity flows through the image edge.
//
// The time step is constant. Explicit diffusion is stable only for
// dt ≤ min_spacing / 2^(dim+1); a larger step is allowed but logged.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{DiffusionConfig, ReductionConfig};
use crate::error::{GpuError, Result};
use crate::gradient::gradient_magnitude_squared;
use crate::image::{Geometry, Image, Pixel, RealPixel, MAX_DIM};
use crate::solver::{resolve_time_step, Executor, FiniteDifferenceSolver, IterationEvent, UpdateScheme};

// ---------------------------------------------------------------------------
// Per-pixel terms
// ---------------------------------------------------------------------------

/// Mean of [`gradient_magnitude_squared`] over every pixel.
pub fn average_gradient_magnitude_squared<T: Pixel>(img: &Image<T>, coefficients: &[f64; MAX_DIM]) -> f64 {
    let g = img.geometry();
    let total: f64 = (0..g.num_pixels())
        .into_par_iter()
        .map(|p| gradient_magnitude_squared(img, &g.index_of(p), coefficients))
        .sum();
    total / g.num_pixels() as f64
}

pub fn conductance_k(average_gradient_squared: f64, conductance: f64) -> f64 {
    average_gradient_squared * conductance * conductance * -2.0
}

/// Largest time step for which explicit diffusion is stable.
pub fn stable_time_step(dim: usize, coefficients: &[f64; MAX_DIM]) -> f64 {
    let min_spacing = coefficients[..dim].iter().map(|c| 1.0 / c).fold(f64::INFINITY, f64::min);
    min_spacing / 2f64.powi(dim as i32 + 1)
}

/// Gradient-conductance update at one pixel.
pub fn compute_update_at<T: Pixel>(img: &Image<T>, index: &[usize; MAX_DIM], k: f64, coefficients: &[f64; MAX_DIM]) -> f64 {
    let dim = img.geometry().dim();
    let c = [index[0] as isize, index[1] as isize, index[2] as isize];
    let at = |off: [isize; MAX_DIM]| img.at_clamped(&off, 0).to_f64();
    let shift = |base: [isize; MAX_DIM], axis: usize, by: isize| {
        let mut s = base;
        s[axis] += by;
        s
    };
    let centre = at(c);

    let mut delta = 0.0;
    for i in 0..dim {
        let fwd_pt = shift(c, i, 1);
        let bwd_pt = shift(c, i, -1);
        let forward = (at(fwd_pt) - centre) * coefficients[i];
        let backward = (centre - at(bwd_pt)) * coefficients[i];

        let mut accum = 0.0;
        let mut accum_d = 0.0;
        for j in (0..dim).filter(|&j| j != i) {
            let half_diff = |p: [isize; MAX_DIM]| (at(shift(p, j, 1)) - at(shift(p, j, -1))) * 0.5 * coefficients[j];
            let dx = half_diff(c);
            let dx_aug = half_diff(fwd_pt);
            let dx_dim = half_diff(bwd_pt);
            accum += 0.25 * (dx + dx_aug) * (dx + dx_aug);
            accum_d += 0.25 * (dx + dx_dim) * (dx + dx_dim);
        }

        let (cx, cxd) = if k == 0.0 {
            (0.0, 0.0)
        } else {
            (((forward * forward + accum) / k).exp(), ((backward * backward + accum_d) / k).exp())
        };
        delta += forward * cx - backward * cxd;
    }
    delta
}

// ---------------------------------------------------------------------------
// Schemes
// ---------------------------------------------------------------------------

pub(crate) struct DiffusionInputs<T: RealPixel> {
    pub input: Arc<Image<T>>,
    pub config: DiffusionConfig,
    pub reduction: ReductionConfig,
}

impl<T: RealPixel> DiffusionInputs<T> {
    /// Warn once per run when the time step exceeds the stability bound.
    pub fn check_time_step(&self, coefficients: &[f64; MAX_DIM]) {
        let dim = self.input.geometry().dim();
        let limit = stable_time_step(dim, coefficients);
        if self.config.time_step > limit {
            warn!(time_step = self.config.time_step, limit, "anisotropic diffusion time step may be unstable");
        }
    }
}

pub(crate) trait DiffusionScheme<T: RealPixel>: UpdateScheme + Send {
    fn configure(&mut self, config: &DiffusionConfig);

    fn output(&self) -> Result<Image<T>>;

    /// ⟨|∇I|²⟩ of the last iteration.
    fn average_gradient_magnitude_squared(&self) -> f64;
}

struct HostDiffusion<T: RealPixel> {
    inputs: DiffusionInputs<T>,
    coefficients: [f64; MAX_DIM],
    output: Image<T>,
    update: Image<T>,
    average: f64,
    k: f64,
    sum_squared_update: f64,
    rms_change: f64,
}

impl<T: RealPixel> HostDiffusion<T> {
    fn new(inputs: DiffusionInputs<T>) -> Self {
        let g = *inputs.input.geometry();
        HostDiffusion {
            inputs,
            coefficients: [1.0; MAX_DIM],
            output: Image::new(g),
            update: Image::new(g),
            average: 0.0,
            k: 0.0,
            sum_squared_update: 0.0,
            rms_change: 0.0,
        }
    }
}

impl<T: RealPixel> UpdateScheme for HostDiffusion<T> {
    fn geometry(&self) -> Geometry {
        *self.inputs.input.geometry()
    }

    fn copy_input_to_output(&mut self) -> Result<()> {
        self.output = Image::clone(&self.inputs.input);
        Ok(())
    }

    fn initialize(&mut self, coefficients: [f64; MAX_DIM]) -> Result<()> {
        self.coefficients = coefficients;
        self.inputs.check_time_step(&coefficients);
        Ok(())
    }

    fn allocate_update_buffer(&mut self) -> Result<()> {
        self.update = Image::new(*self.inputs.input.geometry());
        Ok(())
    }

    fn initialize_iteration(&mut self) -> Result<()> {
        self.average = average_gradient_magnitude_squared(&self.output, &self.coefficients);
        self.k = conductance_k(self.average, self.inputs.config.conductance);
        debug!(average = self.average, k = self.k, "diffusion conductance");
        Ok(())
    }

    fn compute_update(&mut self) -> Result<f64> {
        let g = *self.output.geometry();
        let row = g.extent()[0];
        let (output, k, coefficients) = (&self.output, self.k, &self.coefficients);
        let total = Mutex::new(0.0f64);

        self.update.as_mut_slice().par_chunks_mut(row).enumerate().for_each(|(r, chunk)| {
            let mut local = 0.0;
            for (x, out) in chunk.iter_mut().enumerate() {
                let u = compute_update_at(output, &g.index_of(r * row + x), k, coefficients);
                local += u * u;
                *out = T::from_f64(u);
            }
            *total.lock() += local;
        });

        self.sum_squared_update = total.into_inner();
        resolve_time_step(&[self.inputs.config.time_step], &[true])
    }

    fn apply_update(&mut self, dt: f64) -> Result<()> {
        for (o, u) in self.output.as_mut_slice().iter_mut().zip(self.update.as_slice()) {
            *o = T::from_f64(o.to_f64() + dt * u.to_f64());
        }
        let n = self.output.geometry().num_pixels() as f64;
        self.rms_change = dt.abs() * (self.sum_squared_update / n).sqrt();
        Ok(())
    }

    fn rms_change(&self) -> f64 {
        self.rms_change
    }
}

impl<T: RealPixel> DiffusionScheme<T> for HostDiffusion<T> {
    fn configure(&mut self, config: &DiffusionConfig) {
        self.inputs.config = config.clone();
    }

    fn output(&self) -> Result<Image<T>> {
        Ok(self.output.clone())
    }

    fn average_gradient_magnitude_squared(&self) -> f64 {
        self.average
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// N-D gradient anisotropic diffusion of a scalar image.
pub struct GradientAnisotropicDiffusion<T: RealPixel> {
    config: DiffusionConfig,
    reduction: ReductionConfig,
    executor: Executor,
    input: Option<Arc<Image<T>>>,
    solver: FiniteDifferenceSolver,
    scheme: Option<Box<dyn DiffusionScheme<T>>>,
    output: Option<Image<T>>,
    rms_change: f64,
    average: f64,
}

impl<T: RealPixel> GradientAnisotropicDiffusion<T> {
    pub fn new(config: DiffusionConfig, executor: Executor) -> Self {
        let solver = FiniteDifferenceSolver::new(config.solver.clone());
        GradientAnisotropicDiffusion {
            config,
            reduction: ReductionConfig::default(),
            executor,
            input: None,
            solver,
            scheme: None,
            output: None,
            rms_change: 0.0,
            average: 0.0,
        }
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    /// Input of any pixel type; it is converted to `T`.
    pub fn set_input<I: Pixel>(&mut self, image: &Image<I>) {
        let data = image.as_slice().iter().map(|v| T::from_f64(v.to_f64())).collect();
        self.input = Some(Arc::new(Image::from_vec(*image.geometry(), data)));
        self.scheme = None;
        self.solver.reinitialize();
    }

    pub fn set_reduction_config(&mut self, reduction: ReductionConfig) {
        self.reduction = reduction;
    }

    pub fn set_time_step(&mut self, dt: f64) {
        self.config.time_step = dt;
    }

    pub fn set_conductance_parameter(&mut self, conductance: f64) {
        self.config.conductance = conductance;
    }

    pub fn set_number_of_iterations(&mut self, n: u32) {
        self.config.solver.max_iterations = n;
        self.solver.set_max_iterations(n);
    }

    pub fn set_use_image_spacing(&mut self, on: bool) {
        self.config.solver.use_image_spacing = on;
        self.solver.set_use_image_spacing(on);
    }

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

    pub fn rms_change(&self) -> f64 {
        self.rms_change
    }

    /// ⟨|∇I|²⟩ computed at the start of the last iteration.
    pub fn average_gradient_magnitude_squared(&self) -> f64 {
        self.average
    }

    pub fn elapsed_iterations(&self) -> u32 {
        self.solver.elapsed_iterations()
    }

    pub fn output(&self) -> Option<&Image<T>> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<Image<T>> {
        self.output.take()
    }

    pub fn update(&mut self) -> Result<()> {
        let mut scheme = match self.scheme.take() {
            Some(mut s) if self.solver.state() == crate::solver::SolverState::Initialized => {
                s.configure(&self.config);
                s
            }
            _ => self.build_scheme()?,
        };

        info!(executor = self.executor.name(), pixel = %T::TYPE, "anisotropic diffusion");
        let run = self.solver.run(scheme.as_mut());
        if run.is_ok() || matches!(run, Err(GpuError::ProcessAborted { .. })) {
            self.output = Some(scheme.output()?);
        }
        self.rms_change = scheme.rms_change();
        self.average = scheme.average_gradient_magnitude_squared();
        self.scheme = Some(scheme);
        run
    }

    fn build_scheme(&self) -> Result<Box<dyn DiffusionScheme<T>>> {
        let input = self.input.clone().ok_or_else(|| GpuError::InvalidArgument("input image not set".into()))?;
        if input.geometry().components() != 1 {
            return Err(GpuError::Geometry(format!("diffusion needs a scalar image, got {}", input.geometry())));
        }
        let inputs = DiffusionInputs { input, config: self.config.clone(), reduction: self.reduction.clone() };
        match &self.executor {
            Executor::Host => Ok(Box::new(HostDiffusion::new(inputs))),
            Executor::Accelerator(ctx) => {
                Ok(Box::new(crate::gpu::diffusion::AcceleratorDiffusion::new(Arc::clone(ctx), inputs)?))
            }
        }
    }
}

impl<T: RealPixel> fmt::Debug for GradientAnisotropicDiffusion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradientAnisotropicDiffusion")
            .field("pixel", &T::TYPE)
            .field("executor", &self.executor)
            .field("config", &self.config)
            .field("solver", &self.solver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k_zero_gives_zero_update() {
        let g = Geometry::new(&[5, 5]);
        let img = Image::from_vec(g, (0..25).map(|i| i as f32).collect());
        assert_eq!(compute_update_at(&img, &[2, 2, 0], 0.0, &[1.0; 3]), 0.0);
    }

    #[test]
    fn test_constant_image_has_zero_average() {
        let img = Image::filled(Geometry::new(&[4, 4, 3]), 7.0f64);
        assert_eq!(average_gradient_magnitude_squared(&img, &[1.0; 3]), 0.0);
    }

    #[test]
    fn test_impulse_diffuses_outwards() {
        let g = Geometry::new(&[5]);
        let mut img = Image::<f64>::new(g);
        img.set(&[2], 1.0);
        // Large |K| makes both conductances close to 1 (linear diffusion).
        let u = compute_update_at(&img, &[2, 0, 0], -1e12, &[1.0; 3]);
        assert!((u + 2.0).abs() < 1e-6);
        let side = compute_update_at(&img, &[1, 0, 0], -1e12, &[1.0; 3]);
        assert!((side - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_stable_time_step() {
        assert_eq!(stable_time_step(2, &[1.0; 3]), 0.125);
        assert_eq!(stable_time_step(3, &[0.5, 1.0, 1.0]), 0.0625);
        assert_eq!(stable_time_step(1, &[1.0; 3]), 0.25);
    }

    #[test]
    fn test_conductance_k_sign() {
        assert_eq!(conductance_k(2.0, 3.0), -36.0);
    }
}
