//! Runtime configuration: TOML file, `FDGPU_*` environment variables and
//! defaults, for the device context, reduction engine, solver loop, the
//! two finite-difference filters and the mean and threshold filters.

use std::path::Path;
use std::{env, fmt, fs};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GpuError, Result};

// ── BackendPreference ───────────────────────────────────────────────

/// Which compute backend a [`crate::gpu::context::DeviceContext`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// wgpu when an adapter is available, host emulation otherwise.
    #[default]
    Auto,
    /// wgpu only; fails with `DeviceUnavailable` if no adapter qualifies.
    #[serde(alias = "wgpu")]
    Gpu,
    /// Host emulation of every kernel.
    #[serde(alias = "cpu")]
    Host,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Gpu => write!(f, "gpu"),
            Self::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for BackendPreference {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "gpu" | "wgpu" => Ok(Self::Gpu),
            "host" | "cpu" => Ok(Self::Host),
            other => Err(GpuError::Config(format!("unknown backend: {other}"))),
        }
    }
}

// ── DeviceConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendPreference,
    /// Case-insensitive substring matched against platform and adapter names.
    pub platform: Option<String>,
    /// Accept software rasterisers (llvmpipe, WARP) as compute devices.
    pub allow_software: bool,
    /// Number of command queues the host backend emulates.
    pub host_queues: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { backend: BackendPreference::Auto, platform: None, allow_software: false, host_queues: 1 }
    }
}

impl DeviceConfig {
    /// Defaults overridden by `FDGPU_BACKEND`, `FDGPU_PLATFORM`,
    /// `FDGPU_ALLOW_SOFTWARE` and `FDGPU_HOST_QUEUES`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Overlay `FDGPU_*` variables onto `self`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("FDGPU_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Ok(v) = env::var("FDGPU_PLATFORM") {
            self.platform = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = env::var("FDGPU_ALLOW_SOFTWARE") {
            self.allow_software = parse_bool("FDGPU_ALLOW_SOFTWARE", &v)?;
        }
        if let Ok(v) = env::var("FDGPU_HOST_QUEUES") {
            self.host_queues = v
                .parse()
                .map_err(|_| GpuError::Config(format!("FDGPU_HOST_QUEUES: not an integer: {v}")))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_queues == 0 {
            return Err(GpuError::Config("host_queues must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GpuError::Config(format!("{key}: not a boolean: {v}"))),
    }
}

// ── ReductionConfig ─────────────────────────────────────────────────

/// Reduction kernel variant, numbered after the classic tree-reduction series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReductionVariant {
    /// Kernel 2: one element per work-item, tree in local memory.
    SinglePerThread,
    /// Kernel 5: each work-item adds two elements while loading.
    FirstAddDuringLoad,
    /// Kernel 6: grid-stride accumulation, block count capped.
    #[default]
    GridStride,
}

impl ReductionVariant {
    pub fn number(self) -> u32 {
        match self {
            Self::SinglePerThread => 2,
            Self::FirstAddDuringLoad => 5,
            Self::GridStride => 6,
        }
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            Self::SinglePerThread => "reduce2",
            Self::FirstAddDuringLoad => "reduce5",
            Self::GridStride => "reduce6",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub max_threads: usize,
    /// Work-group size used instead when the device limit is below `max_threads`.
    pub small_block_threads: usize,
    pub max_blocks: usize,
    pub variant: ReductionVariant,
    /// Fold the partial sums on the host once at most
    /// `cpu_final_threshold` remain; otherwise keep reducing on the device.
    pub cpu_final_reduction: bool,
    pub cpu_final_threshold: usize,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            max_threads: 128,
            small_block_threads: 64,
            max_blocks: 64,
            variant: ReductionVariant::GridStride,
            cpu_final_reduction: true,
            cpu_final_threshold: 1,
        }
    }
}

impl ReductionConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("max_threads", self.max_threads), ("small_block_threads", self.small_block_threads)] {
            if v == 0 || !v.is_power_of_two() {
                return Err(GpuError::Config(format!("{name} must be a power of two, got {v}")));
            }
        }
        if self.max_blocks == 0 {
            return Err(GpuError::Config("max_blocks must be at least 1".into()));
        }
        if self.cpu_final_threshold == 0 {
            return Err(GpuError::Config("cpu_final_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

// ── SolverConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iterations: u32,
    /// Halt once the RMS change drops below this value (0 disables).
    pub max_rms_error: f64,
    /// Scale derivatives by inverse pixel spacing.
    pub use_image_spacing: bool,
    /// Keep the initialised state after a run so the next run resumes.
    pub manual_reinitialization: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: u32::MAX,
            max_rms_error: 0.0,
            use_image_spacing: false,
            manual_reinitialization: false,
        }
    }
}

// ── DemonsConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemonsConfig {
    pub time_step: f64,
    pub denominator_threshold: f64,
    pub intensity_difference_threshold: f64,
    pub use_moving_image_gradient: bool,
    pub smooth_deformation_field: bool,
    pub deformation_sigma: [f64; 3],
    pub smooth_update_field: bool,
    pub update_sigma: [f64; 3],
    /// Tail mass the truncated Gaussian may discard.
    pub maximum_error: f64,
    pub maximum_kernel_width: usize,
    pub solver: SolverConfig,
}

impl Default for DemonsConfig {
    fn default() -> Self {
        Self {
            time_step: 1.0,
            denominator_threshold: 1e-9,
            intensity_difference_threshold: 0.001,
            use_moving_image_gradient: false,
            smooth_deformation_field: true,
            deformation_sigma: [1.0; 3],
            smooth_update_field: false,
            update_sigma: [1.0; 3],
            maximum_error: 0.1,
            maximum_kernel_width: 30,
            solver: SolverConfig { max_iterations: 10, ..SolverConfig::default() },
        }
    }
}

// ── DiffusionConfig ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub time_step: f64,
    pub conductance: f64,
    pub solver: SolverConfig,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            time_step: 0.125,
            conductance: 1.0,
            solver: SolverConfig { max_iterations: 5, ..SolverConfig::default() },
        }
    }
}

// ── MeanConfig ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanConfig {
    /// Box half-width per axis; axes past the image dimensionality are ignored.
    pub radius: [usize; 3],
}

impl Default for MeanConfig {
    fn default() -> Self {
        Self { radius: [1; 3] }
    }
}

// ── ThresholdConfig ─────────────────────────────────────────────────

/// Binary threshold values; an unset field takes the pixel type's default
/// (lower = lowest value, upper = highest, inside = highest, outside = 0).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inside: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outside: Option<f64>,
}

// ── FdConfig ────────────────────────────────────────────────────────

/// Top-level configuration, one table per component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FdConfig {
    pub device: DeviceConfig,
    pub reduction: ReductionConfig,
    pub solver: SolverConfig,
    pub demons: DemonsConfig,
    pub diffusion: DiffusionConfig,
    pub mean: MeanConfig,
    pub threshold: ThresholdConfig,
}

impl FdConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn from_toml(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("config file not found: {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| GpuError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GpuError::Config(e.to_string()))
    }

    /// File (or defaults) with `FDGPU_*` device overrides applied on top.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_toml(path)?;
        cfg.device.apply_env()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.reduction.validate()?;
        for (name, dt) in [("demons", self.demons.time_step), ("diffusion", self.diffusion.time_step)] {
            if !(dt.is_finite() && dt > 0.0) {
                return Err(GpuError::Config(format!("{name}.time_step must be positive, got {dt}")));
            }
        }
        if self.demons.maximum_kernel_width == 0 {
            return Err(GpuError::Config("demons.maximum_kernel_width must be at least 1".into()));
        }
        if let (Some(lower), Some(upper)) = (self.threshold.lower, self.threshold.upper) {
            if lower > upper {
                return Err(GpuError::Config(format!("threshold.lower {lower} exceeds threshold.upper {upper}")));
            }
        }
        Ok(())
    }
}
