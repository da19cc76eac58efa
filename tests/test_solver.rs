// tests/test_solver.rs — Halting policy, observers, abort and
// reinitialisation of FiniteDifferenceSolver.
//
// A scripted UpdateScheme records the calls the solver makes and reports
// a fixed sequence of RMS changes, so every halting branch can be hit
// without touching pixels.

use std::sync::{Arc, Mutex};

use fdgpu::config::SolverConfig;
use fdgpu::image::MAX_DIM;
use fdgpu::solver::{SolverState, UpdateScheme};
use fdgpu::{FiniteDifferenceSolver, Geometry, GpuError, IterationEvent, Result};

#[derive(Default)]
struct Scripted {
    rms: Vec<f64>,
    iteration: usize,
    copies: u32,
    applied: Vec<f64>,
    coefficients: Option<[f64; MAX_DIM]>,
    post_processed: u32,
    stop: bool,
    no_time_step: bool,
}

impl Scripted {
    fn with_rms(rms: &[f64]) -> Self {
        Scripted { rms: rms.to_vec(), ..Default::default() }
    }
}

impl UpdateScheme for Scripted {
    fn geometry(&self) -> Geometry {
        Geometry::new(&[4, 4]).with_spacing(&[0.5, 2.0])
    }

    fn copy_input_to_output(&mut self) -> Result<()> {
        self.copies += 1;
        Ok(())
    }

    fn initialize(&mut self, coefficients: [f64; MAX_DIM]) -> Result<()> {
        self.coefficients = Some(coefficients);
        Ok(())
    }

    fn allocate_update_buffer(&mut self) -> Result<()> {
        Ok(())
    }

    fn compute_update(&mut self) -> Result<f64> {
        if self.no_time_step {
            return fdgpu::solver::resolve_time_step(&[0.1], &[false]);
        }
        Ok(0.25)
    }

    fn apply_update(&mut self, dt: f64) -> Result<()> {
        self.applied.push(dt);
        self.iteration += 1;
        Ok(())
    }

    fn rms_change(&self) -> f64 {
        let i = self.iteration.saturating_sub(1);
        self.rms.get(i).or(self.rms.last()).copied().unwrap_or(1.0)
    }

    fn metric(&self) -> Option<f64> {
        Some(self.iteration as f64 * 10.0)
    }

    fn halt_requested(&self) -> bool {
        self.stop
    }

    fn post_process(&mut self) -> Result<()> {
        self.post_processed += 1;
        Ok(())
    }
}

fn solver(max_iterations: u32, max_rms_error: f64) -> FiniteDifferenceSolver {
    FiniteDifferenceSolver::new(SolverConfig { max_iterations, max_rms_error, ..SolverConfig::default() })
}

#[test]
fn zero_iterations_still_initializes() {
    let mut s = solver(0, 0.0);
    let mut scheme = Scripted::with_rms(&[1.0]);
    s.run(&mut scheme).unwrap();
    assert_eq!(s.elapsed_iterations(), 0);
    assert_eq!(scheme.copies, 1);
    assert!(scheme.applied.is_empty());
    assert_eq!(scheme.post_processed, 1);
    assert_eq!(s.state(), SolverState::Uninitialized);
}

#[test]
fn runs_to_max_iterations() {
    let mut s = solver(5, 0.0);
    let mut scheme = Scripted::with_rms(&[1.0]);
    s.run(&mut scheme).unwrap();
    assert_eq!(s.elapsed_iterations(), 5);
    assert_eq!(scheme.applied, vec![0.25; 5]);
    assert_eq!(s.progress(), 1.0);
}

#[test]
fn halts_when_rms_drops_below_threshold() {
    let mut s = solver(100, 0.5);
    let mut scheme = Scripted::with_rms(&[2.0, 0.9, 0.3, 0.1]);
    s.run(&mut scheme).unwrap();
    assert_eq!(s.elapsed_iterations(), 3);
    assert_eq!(s.rms_change(), 0.3);
}

#[test]
fn rms_is_ignored_before_the_first_iteration() {
    // The scheme reports a tiny RMS up front; the first iteration still runs.
    let mut s = solver(10, 0.5);
    let mut scheme = Scripted::with_rms(&[0.0]);
    s.run(&mut scheme).unwrap();
    assert_eq!(s.elapsed_iterations(), 1);
}

#[test]
fn scheme_halt_request_stops_before_iterating() {
    let mut s = solver(10, 0.0);
    let mut scheme = Scripted { stop: true, ..Scripted::with_rms(&[1.0]) };
    s.run(&mut scheme).unwrap();
    assert_eq!(s.elapsed_iterations(), 0);
    assert_eq!(scheme.post_processed, 1);
}

#[test]
fn spacing_coefficients_follow_config() {
    let mut s = FiniteDifferenceSolver::new(SolverConfig {
        max_iterations: 1,
        use_image_spacing: true,
        ..SolverConfig::default()
    });
    let mut scheme = Scripted::with_rms(&[1.0]);
    s.run(&mut scheme).unwrap();
    assert_eq!(scheme.coefficients, Some([2.0, 0.5, 1.0]));

    s.set_use_image_spacing(false);
    let mut scheme = Scripted::with_rms(&[1.0]);
    s.run(&mut scheme).unwrap();
    assert_eq!(scheme.coefficients, Some([1.0; MAX_DIM]));
}

#[test]
fn observers_see_every_iteration() {
    let mut s = solver(4, 0.0);
    let events: Arc<Mutex<Vec<IterationEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    s.on_iteration(move |e| sink.lock().unwrap().push(*e));
    s.run(&mut Scripted::with_rms(&[1.0, 0.5])).unwrap();

    let events = events.lock().unwrap();
    let iterations: Vec<u32> = events.iter().map(|e| e.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3, 4]);
    assert_eq!(events[1].progress, 0.5);
    assert_eq!(events[1].rms_change, 0.5);
    assert_eq!(events[3].metric, Some(40.0));
}

#[test]
fn abort_from_observer_stops_the_run() {
    let mut s = solver(10, 0.0);
    let handle = s.abort_handle();
    s.on_iteration(move |e| {
        if e.iteration == 2 {
            handle.abort();
        }
    });
    let mut scheme = Scripted::with_rms(&[1.0]);
    let err = s.run(&mut scheme).unwrap_err();
    assert!(matches!(err, GpuError::ProcessAborted { iteration: 2 }));
    assert_eq!(scheme.applied.len(), 2);
    assert_eq!(scheme.post_processed, 0);
}

#[test]
fn abort_flag_is_cleared_by_the_next_run() {
    let mut s = solver(3, 0.0);
    s.abort_handle().abort();
    s.run(&mut Scripted::with_rms(&[1.0])).unwrap();
    assert_eq!(s.elapsed_iterations(), 3);
    assert!(!s.abort_handle().is_aborted());
}

#[test]
fn missing_time_step_propagates() {
    let mut s = solver(3, 0.0);
    let mut scheme = Scripted { no_time_step: true, ..Scripted::with_rms(&[1.0]) };
    let err = s.run(&mut scheme).unwrap_err();
    assert!(matches!(err, GpuError::NoValidTimeStep { candidates: 1 }));
    assert!(scheme.applied.is_empty());
}

#[test]
fn manual_reinitialization_resumes() {
    let mut s = FiniteDifferenceSolver::new(SolverConfig {
        max_iterations: 3,
        manual_reinitialization: true,
        ..SolverConfig::default()
    });
    let mut scheme = Scripted::with_rms(&[1.0]);
    s.run(&mut scheme).unwrap();
    assert_eq!(s.state(), SolverState::Initialized);
    assert_eq!(s.elapsed_iterations(), 3);

    // Raising the cap continues from iteration 3 without re-seeding.
    s.set_max_iterations(5);
    s.run(&mut scheme).unwrap();
    assert_eq!(s.elapsed_iterations(), 5);
    assert_eq!(scheme.copies, 1);
    assert_eq!(scheme.applied.len(), 5);

    s.reinitialize();
    assert_eq!(s.state(), SolverState::Uninitialized);
    s.run(&mut scheme).unwrap();
    assert_eq!(scheme.copies, 2);
    assert_eq!(s.elapsed_iterations(), 5);
    assert_eq!(scheme.applied.len(), 10);
}
