// gpu/context.rs — Device context: one backend, its queues and the program cache.
//
// A `DeviceContext` is created once and shared as `Arc<DeviceContext>` by
// every buffer manager, kernel manager and filter that uses the device.
// Nothing in the core reaches for a hidden singleton; `global()` exists for
// callers that want a process-wide default and builds it from `FDGPU_*`.
//
// BACKEND CHOICE:
//   Gpu  — wgpu adapter selected by `select_device`, or DeviceUnavailable.
//   Host — host emulation, `host_queues` queues sharing one memory space.
//   Auto — wgpu if `is_gpu_available`, else host with a warning.
//
// PROGRAM CACHE:
// Programs are keyed by (source id, rendered defines). Building is the
// expensive step (naga validation + pipeline creation on wgpu), so two
// kernel managers asking for the same instantiation share one `Program`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{BackendPreference, DeviceConfig};
use crate::error::{GpuError, Result};
use crate::gpu::backend::{ComputeBackend, DeviceInfo, Program};
use crate::gpu::device::{is_gpu_available, WgpuBackend};
use crate::gpu::host::HostBackend;
use crate::gpu::kernel::{Defines, KernelSource};

type ProgramKey = (&'static str, String);

static GLOBAL: Mutex<Option<Arc<DeviceContext>>> = parking_lot::const_mutex(None);

/// A compute device plus the programs built for it.
pub struct DeviceContext {
    backend: Box<dyn ComputeBackend>,
    programs: Mutex<HashMap<ProgramKey, Arc<Program>>>,
    built: AtomicUsize,
}

impl DeviceContext {
    /// Create a context according to `cfg`.
    pub fn init(cfg: &DeviceConfig) -> Result<Arc<Self>> {
        cfg.validate()?;
        let filter = cfg.platform.as_deref();
        let ctx = match cfg.backend {
            BackendPreference::Host => Self::host(cfg.host_queues),
            BackendPreference::Gpu => Self::with_backend(Box::new(WgpuBackend::new(filter, cfg.allow_software)?)),
            BackendPreference::Auto => {
                if is_gpu_available(filter, cfg.allow_software) {
                    match WgpuBackend::new(filter, cfg.allow_software) {
                        Ok(be) => Self::with_backend(Box::new(be)),
                        Err(e) => {
                            warn!(error = %e, "accelerator present but unusable; falling back to host emulation");
                            Self::host(cfg.host_queues)
                        }
                    }
                } else {
                    warn!(filter = filter.unwrap_or("<any>"), "no accelerator found; using host emulation");
                    Self::host(cfg.host_queues)
                }
            }
        };
        info!(device = %ctx.info(), "device context ready");
        Ok(ctx)
    }

    pub fn with_backend(backend: Box<dyn ComputeBackend>) -> Arc<Self> {
        Arc::new(DeviceContext { backend, programs: Mutex::new(HashMap::new()), built: AtomicUsize::new(0) })
    }

    /// Host emulation context with `queues` command queues.
    pub fn host(queues: usize) -> Arc<Self> {
        Self::with_backend(Box::new(HostBackend::new(queues)))
    }

    /// Process-wide default context, created on first use from the environment.
    pub fn global() -> Result<Arc<Self>> {
        let mut slot = GLOBAL.lock();
        if let Some(ctx) = slot.as_ref() {
            return Ok(Arc::clone(ctx));
        }
        let ctx = Self::init(&DeviceConfig::from_env()?)?;
        *slot = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Release the program cache and this handle. The backend goes away
    /// with the last outstanding `Arc`.
    pub fn shutdown(self: Arc<Self>) {
        self.programs.lock().clear();
        let mut slot = GLOBAL.lock();
        if slot.as_ref().is_some_and(|g| Arc::ptr_eq(g, &self)) {
            *slot = None;
        }
        debug!(remaining = Arc::strong_count(&self) - 1, "device context shut down");
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn info(&self) -> &DeviceInfo {
        self.backend.info()
    }

    pub fn queue_count(&self) -> usize {
        self.backend.queue_count()
    }

    /// Number of programs actually compiled (cache misses) so far.
    pub fn programs_built(&self) -> usize {
        self.built.load(Ordering::Relaxed)
    }

    /// Fetch `source` specialised by `defines` from the cache, building it on a miss.
    pub fn load_program(&self, source: &'static KernelSource, defines: &Defines) -> Result<Arc<Program>> {
        for pixel in defines.pixel_types() {
            if !self.backend.supports(pixel) {
                return Err(GpuError::UnsupportedPixelType(pixel.cl_name()));
            }
        }

        let key = (source.id, defines.render());
        let mut programs = self.programs.lock();
        if let Some(p) = programs.get(&key) {
            debug!(program = source.id, "program cache hit");
            return Ok(Arc::clone(p));
        }

        let compiled = self.backend.build(source, defines).map_err(|e| {
            error!(program = source.id, defines = %key.1, error = %e, "program build failed");
            e
        })?;
        self.built.fetch_add(1, Ordering::Relaxed);
        let program = Arc::new(Program::new(source, defines.clone(), compiled));
        programs.insert(key, Arc::clone(&program));
        debug!(program = source.id, cached = programs.len(), "program built");
        Ok(program)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.info().name)
            .field("queues", &self.queue_count())
            .field("programs", &self.programs.lock().len())
            .finish()
    }
}
