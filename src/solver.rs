//! Finite-difference solver loop.
//!
//! [`FiniteDifferenceSolver`] owns the iteration state and the halting
//! policy; everything that touches pixels lives behind [`UpdateScheme`],
//! implemented once per filter and executor. A run is:
//!
//! ```text
//! Uninitialized ──run──▶ copy input → output, scale coefficients,
//!                        allocate update buffer ──▶ Initialized
//! while !halt():
//!     initialize_iteration → compute_update → apply_update(dt)
//!     elapsed += 1, notify observers, check abort
//! Initialized ──▶ Uninitialized   (unless manual reinitialisation)
//! post_process
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::SolverConfig;
use crate::error::{GpuError, Result};
use crate::gpu::context::DeviceContext;
use crate::image::{Geometry, MAX_DIM};

// ── Executor ────────────────────────────────────────────────────────

/// Where a filter's per-pixel work runs, fixed when the filter is built.
#[derive(Clone)]
pub enum Executor {
    /// Rayon-parallel host loop.
    Host,
    /// Kernels launched through the given context (wgpu or host emulation).
    Accelerator(Arc<DeviceContext>),
}

impl Executor {
    pub fn name(&self) -> &'static str {
        match self {
            Executor::Host => "host",
            Executor::Accelerator(_) => "accelerator",
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Host => write!(f, "Executor::Host"),
            Executor::Accelerator(ctx) => write!(f, "Executor::Accelerator({})", ctx.info().name),
        }
    }
}

// ── UpdateScheme ────────────────────────────────────────────────────

/// The per-filter half of the solver: what to compute and where.
pub trait UpdateScheme {
    /// Grid of the solution; its spacing feeds the scale coefficients.
    fn geometry(&self) -> Geometry;

    /// Seed the output with the input (or the initial solution).
    fn copy_input_to_output(&mut self) -> Result<()>;

    /// Per-axis derivative scale factors plus any pre-iteration setup.
    fn initialize(&mut self, coefficients: [f64; MAX_DIM]) -> Result<()>;

    fn allocate_update_buffer(&mut self) -> Result<()>;

    /// Recompute global terms that depend on the current solution.
    fn initialize_iteration(&mut self) -> Result<()> {
        Ok(())
    }

    /// Fill the update buffer; returns the time step to apply it with.
    fn compute_update(&mut self) -> Result<f64>;

    /// `output += dt * update`, plus any regularisation.
    fn apply_update(&mut self, dt: f64) -> Result<()>;

    /// Root-mean-square change of the last iteration.
    fn rms_change(&self) -> f64;

    /// Filter-specific similarity metric, if the filter has one.
    fn metric(&self) -> Option<f64> {
        None
    }

    /// An early stop requested through the filter itself.
    fn halt_requested(&self) -> bool {
        false
    }

    fn post_process(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── Time steps ──────────────────────────────────────────────────────

/// Smallest valid candidate time step.
///
/// Fails with `NoValidTimeStep` when no candidate is flagged valid.
pub fn resolve_time_step(time_steps: &[f64], valid: &[bool]) -> Result<f64> {
    time_steps
        .iter()
        .zip(valid)
        .filter(|(_, &ok)| ok)
        .map(|(&dt, _)| dt)
        .reduce(f64::min)
        .ok_or(GpuError::NoValidTimeStep { candidates: time_steps.len() })
}

/// Derivative scale factors: `1 / spacing` per axis when spacing-aware, else 1.
pub fn scale_coefficients(geometry: &Geometry, use_image_spacing: bool) -> [f64; MAX_DIM] {
    let mut coeffs = [1.0; MAX_DIM];
    if use_image_spacing {
        for (c, s) in coeffs.iter_mut().zip(geometry.spacing()) {
            *c = 1.0 / s;
        }
    }
    coeffs
}

// ── Observers and abort ─────────────────────────────────────────────

/// Reported after every completed iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationEvent {
    /// Iterations completed so far in this run.
    pub iteration: u32,
    /// `iteration / max_iterations`, or 0 when unbounded by zero.
    pub progress: f32,
    pub rms_change: f64,
    pub metric: Option<f64>,
}

/// Cooperative cancellation flag, shareable across threads.
///
/// The solver clears it when a run starts and checks it once per
/// iteration, after the update has been applied.
#[derive(Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbortHandle({})", self.is_aborted())
    }
}

type Observer = Box<dyn FnMut(&IterationEvent) + Send>;

// ── Solver ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Uninitialized,
    Initialized,
}

pub struct FiniteDifferenceSolver {
    config: SolverConfig,
    state: SolverState,
    elapsed: u32,
    rms_change: f64,
    progress: f32,
    abort: AbortHandle,
    observers: Vec<Observer>,
}

impl FiniteDifferenceSolver {
    pub fn new(config: SolverConfig) -> Self {
        FiniteDifferenceSolver {
            config,
            state: SolverState::Uninitialized,
            elapsed: 0,
            rms_change: 0.0,
            progress: 0.0,
            abort: AbortHandle::default(),
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn set_max_iterations(&mut self, n: u32) {
        self.config.max_iterations = n;
    }

    pub fn set_max_rms_error(&mut self, e: f64) {
        self.config.max_rms_error = e;
    }

    pub fn set_use_image_spacing(&mut self, on: bool) {
        self.config.use_image_spacing = on;
    }

    pub fn set_manual_reinitialization(&mut self, on: bool) {
        self.config.manual_reinitialization = on;
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Force the next run to start from the input again.
    pub fn reinitialize(&mut self) {
        self.state = SolverState::Uninitialized;
    }

    pub fn elapsed_iterations(&self) -> u32 {
        self.elapsed
    }

    pub fn rms_change(&self) -> f64 {
        self.rms_change
    }

    /// Fraction of `max_iterations` completed, as of the last halt check.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Register a callback invoked after every iteration.
    pub fn on_iteration<F>(&mut self, f: F)
    where
        F: FnMut(&IterationEvent) + Send + 'static,
    {
        self.observers.push(Box::new(f));
    }

    /// Whether the loop should stop before starting another iteration.
    pub fn halt<S: UpdateScheme + ?Sized>(&mut self, scheme: &S) -> bool {
        let max = self.config.max_iterations;
        if max != 0 {
            self.progress = self.elapsed as f32 / max as f32;
        }
        if scheme.halt_requested() {
            return true;
        }
        if self.elapsed >= max {
            true
        } else if self.elapsed == 0 {
            false
        } else {
            self.config.max_rms_error > self.rms_change
        }
    }

    /// Iterate `scheme` until the halting policy says stop.
    pub fn run<S: UpdateScheme + ?Sized>(&mut self, scheme: &mut S) -> Result<()> {
        self.abort.reset();
        if self.state == SolverState::Uninitialized {
            let geometry = scheme.geometry();
            scheme.copy_input_to_output()?;
            scheme.initialize(scale_coefficients(&geometry, self.config.use_image_spacing))?;
            scheme.allocate_update_buffer()?;
            self.state = SolverState::Initialized;
            self.elapsed = 0;
            debug!(%geometry, "solver initialized");
        }

        while !self.halt(scheme) {
            scheme.initialize_iteration()?;
            let dt = scheme.compute_update()?;
            scheme.apply_update(dt)?;
            self.rms_change = scheme.rms_change();
            self.elapsed += 1;

            let max = self.config.max_iterations;
            let event = IterationEvent {
                iteration: self.elapsed,
                progress: if max == 0 { 0.0 } else { self.elapsed as f32 / max as f32 },
                rms_change: self.rms_change,
                metric: scheme.metric(),
            };
            debug!(iteration = event.iteration, dt, rms = event.rms_change, metric = ?event.metric, "iteration");
            for observer in &mut self.observers {
                observer(&event);
            }
            if self.abort.is_aborted() {
                info!(iteration = self.elapsed, "run aborted");
                return Err(GpuError::ProcessAborted { iteration: self.elapsed });
            }
        }

        info!(iterations = self.elapsed, rms = self.rms_change, "run finished");
        if !self.config.manual_reinitialization {
            self.state = SolverState::Uninitialized;
        }
        scheme.post_process()
    }
}

impl fmt::Debug for FiniteDifferenceSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiniteDifferenceSolver")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("elapsed", &self.elapsed)
            .field("rms_change", &self.rms_change)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_time_step_min_of_valid() {
        let dt = resolve_time_step(&[0.5, 0.1, 0.3], &[true, false, true]).unwrap();
        assert_eq!(dt, 0.3);
    }

    #[test]
    fn test_resolve_time_step_none_valid() {
        let err = resolve_time_step(&[0.5, 0.1], &[false, false]).unwrap_err();
        assert!(matches!(err, GpuError::NoValidTimeStep { candidates: 2 }));
        assert!(resolve_time_step(&[], &[]).is_err());
    }

    #[test]
    fn test_scale_coefficients() {
        let g = Geometry::new(&[4, 4]).with_spacing(&[2.0, 0.5]);
        assert_eq!(scale_coefficients(&g, true), [0.5, 2.0, 1.0]);
        assert_eq!(scale_coefficients(&g, false), [1.0; 3]);
    }

    #[test]
    fn test_abort_handle_shared() {
        let a = AbortHandle::default();
        let b = a.clone();
        b.abort();
        assert!(a.is_aborted());
        a.reset();
        assert!(!b.is_aborted());
    }
}
