// error.rs — error taxonomy for the buffer, kernel, reduction and solver layers.
//
// Every failure the core can report is a `GpuError` variant. Accelerator
// failures are translated at the call site into one of these variants and
// carry an OpenCL-style numeric status so diagnostics read the same way on
// every backend (`CL_BUILD_PROGRAM_FAILURE`, `CL_INVALID_WORK_GROUP_SIZE`, ...).
//
// Nothing in the crate retries. A variant reaching the caller means the
// operation is over; only `ProcessAborted` is an expected outcome of a
// cooperative cancel.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = GpuError> = std::result::Result<T, E>;

/// Errors produced by the accelerator core.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No platform/device passed the selection filter.
    #[error("no qualifying compute device found (platform filter: {})", .filter.as_deref().unwrap_or("<any>"))]
    DeviceUnavailable { filter: Option<String> },

    /// A kernel program failed to build. `log` is the compiler output.
    #[error("kernel program `{program}` failed to build:\n{log}")]
    Compile { program: String, log: String },

    /// `create_kernel` was asked for an entry point the program lacks.
    #[error("kernel `{0}` not found in the loaded program")]
    KernelNotFound(String),

    /// Argument wiring error (bad index, kind mismatch, unbound slot).
    #[error("invalid kernel argument: {0}")]
    InvalidArgument(String),

    /// The accelerator refused a buffer allocation.
    #[error("device allocation of {bytes} bytes failed: {reason}")]
    DeviceAllocation { bytes: usize, reason: String },

    /// Host and device copies were both modified since the last sync.
    #[error("host and device buffers are both dirty; two unsynchronised writers")]
    InconsistentState,

    /// The solver produced no valid candidate time step.
    #[error("no valid time step among {candidates} candidates")]
    NoValidTimeStep { candidates: usize },

    /// Cooperative cancellation observed between iterations.
    #[error("process aborted after {iteration} iterations")]
    ProcessAborted { iteration: u32 },

    /// A global work size is not a multiple of the local work size, or the
    /// launch geometry is otherwise unusable.
    #[error("invalid work-group size: global {global:?}, local {local:?}")]
    InvalidWorkGroupSize { global: Vec<usize>, local: Vec<usize> },

    /// A command-queue index outside the context's queue list.
    #[error("command queue {id} does not exist (context has {count})")]
    InvalidQueue { id: usize, count: usize },

    /// The pixel type has no representation on the active backend.
    #[error("pixel type `{0}` is not supported by the active backend")]
    UnsupportedPixelType(&'static str),

    /// A host/device transfer failed after it was enqueued.
    #[error("buffer transfer failed: {0}")]
    Transfer(String),

    /// Mismatched image geometry handed to a filter.
    #[error("image geometry mismatch: {0}")]
    Geometry(String),

    /// Configuration could not be read or validated.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GpuError {
    /// OpenCL-style status code for this error.
    pub fn status(&self) -> i32 {
        match self {
            GpuError::DeviceUnavailable { .. } => -1,
            GpuError::Compile { .. } => -11,
            GpuError::KernelNotFound(_) => -46,
            GpuError::InvalidArgument(_) => -49,
            GpuError::DeviceAllocation { .. } => -4,
            GpuError::InconsistentState => -5,
            GpuError::NoValidTimeStep { .. } => -30,
            GpuError::ProcessAborted { .. } => -36,
            GpuError::InvalidWorkGroupSize { .. } => -54,
            GpuError::InvalidQueue { .. } => -36,
            GpuError::UnsupportedPixelType(_) => -30,
            GpuError::Transfer(_) => -14,
            GpuError::Geometry(_) => -30,
            GpuError::Config(_) => -30,
            GpuError::Io(_) => -30,
        }
    }

    /// Symbolic name of [`GpuError::status`].
    pub fn status_name(&self) -> &'static str {
        status_name(self.status())
    }
}

/// Map an OpenCL-style status code to its symbolic name.
pub fn status_name(code: i32) -> &'static str {
    match code {
        0 => "CL_SUCCESS",
        -1 => "CL_DEVICE_NOT_FOUND",
        -2 => "CL_DEVICE_NOT_AVAILABLE",
        -3 => "CL_COMPILER_NOT_AVAILABLE",
        -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
        -5 => "CL_OUT_OF_RESOURCES",
        -6 => "CL_OUT_OF_HOST_MEMORY",
        -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
        -8 => "CL_MEM_COPY_OVERLAP",
        -9 => "CL_IMAGE_FORMAT_MISMATCH",
        -10 => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
        -11 => "CL_BUILD_PROGRAM_FAILURE",
        -12 => "CL_MAP_FAILURE",
        -13 => "CL_MISALIGNED_SUB_BUFFER_OFFSET",
        -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
        -30 => "CL_INVALID_VALUE",
        -31 => "CL_INVALID_DEVICE_TYPE",
        -32 => "CL_INVALID_PLATFORM",
        -33 => "CL_INVALID_DEVICE",
        -34 => "CL_INVALID_CONTEXT",
        -35 => "CL_INVALID_QUEUE_PROPERTIES",
        -36 => "CL_INVALID_COMMAND_QUEUE",
        -37 => "CL_INVALID_HOST_PTR",
        -38 => "CL_INVALID_MEM_OBJECT",
        -39 => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
        -40 => "CL_INVALID_IMAGE_SIZE",
        -41 => "CL_INVALID_SAMPLER",
        -42 => "CL_INVALID_BINARY",
        -43 => "CL_INVALID_BUILD_OPTIONS",
        -44 => "CL_INVALID_PROGRAM",
        -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
        -46 => "CL_INVALID_KERNEL_NAME",
        -47 => "CL_INVALID_KERNEL_DEFINITION",
        -48 => "CL_INVALID_KERNEL",
        -49 => "CL_INVALID_ARG_INDEX",
        -50 => "CL_INVALID_ARG_VALUE",
        -51 => "CL_INVALID_ARG_SIZE",
        -52 => "CL_INVALID_KERNEL_ARGS",
        -53 => "CL_INVALID_WORK_DIMENSION",
        -54 => "CL_INVALID_WORK_GROUP_SIZE",
        -55 => "CL_INVALID_WORK_ITEM_SIZE",
        -56 => "CL_INVALID_GLOBAL_OFFSET",
        -57 => "CL_INVALID_EVENT_WAIT_LIST",
        -58 => "CL_INVALID_EVENT",
        -59 => "CL_INVALID_OPERATION",
        -60 => "CL_INVALID_GL_OBJECT",
        -61 => "CL_INVALID_BUFFER_SIZE",
        -62 => "CL_INVALID_MIP_LEVEL",
        -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
        _ => "CL_UNKNOWN_ERROR",
    }
}
