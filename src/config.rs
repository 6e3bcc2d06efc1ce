//! Trainer configuration.
//!
//! [`SomConfig`] describes the grid (width × height × depth neurons), the
//! feature length, and the knobs that shape the kernels: the preferred
//! work-group size, the convergence threshold and the metric variants.
//!
//! # Example
//!
//! ```rust
//! use somgrid::SomConfig;
//!
//! let config = SomConfig {
//!     width: 16,
//!     height: 16,
//!     depth: 4,
//!     neuron_size: 31,
//!     ..Default::default()
//! };
//! config.validate().expect("valid config");
//! assert_eq!(config.neuron_size_rounded(), 32);
//! ```
//!
//! # Kernel flags
//!
//! `kernel_flags` carries extra build switches in compiler-flag form. They
//! are parsed by [`KernelVariant::parse`]:
//!
//! | Flag | Effect |
//! |------|--------|
//! | `-DCPU` | force the sequential per-neuron distance sum |
//! | `-DNEIGHBORHOOD=EUCLIDEAN` | update only neurons inside the radius sphere |
//! | `-DWEIGHTING=CHEBYSHEV` | Gaussian weight from the Chebyshev distance |
//! | `-DWEIGHT_THRESHOLD=0.05` | override the radius-decay threshold |

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dispatch::round_up_power2;

/// Work-group size the planner asks for before clamping to the device.
pub const DEFAULT_GROUP_SIZE: usize = 512;

/// Radius decay stops shrinking once the edge weight reaches this value.
pub const DEFAULT_WEIGHT_THRESHOLD: f64 = 0.01;

/// Distance metric on grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GridMetric {
    /// `max(|dx|, |dy|, |dz|)`
    #[default]
    Chebyshev,
    /// `sqrt(dx² + dy² + dz²)`
    Euclidean,
}

impl GridMetric {
    /// Squared distance for the given coordinate deltas.
    #[inline]
    pub fn distance_sq(self, dx: i64, dy: i64, dz: i64) -> i64 {
        match self {
            GridMetric::Chebyshev => {
                let m = dx.abs().max(dy.abs()).max(dz.abs());
                m * m
            }
            GridMetric::Euclidean => dx * dx + dy * dy + dz * dz,
        }
    }

    /// True if the deltas lie within `radius` under this metric.
    #[inline]
    pub fn within(self, dx: i64, dy: i64, dz: i64, radius: usize) -> bool {
        let r = radius as i64;
        self.distance_sq(dx, dy, dz) <= r * r
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "CHEBYSHEV" => Some(GridMetric::Chebyshev),
            "EUCLIDEAN" => Some(GridMetric::Euclidean),
            _ => None,
        }
    }
}

/// Trainer configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SomConfig {
    /// Grid width (x axis).
    pub width: usize,
    /// Grid height (y axis).
    pub height: usize,
    /// Grid depth (z axis).
    pub depth: usize,
    /// Feature-vector length. Rounded up to a power of two internally.
    pub neuron_size: usize,
    /// Extra kernel build flags, e.g. `"-DWEIGHTING=CHEBYSHEV"`.
    pub kernel_flags: String,
    /// Preferred work-group size (clamped to the device maximum).
    pub preferred_group_size: usize,
    /// Edge-weight threshold for radius decay.
    pub weight_threshold: f64,
    /// Which neurons inside the dispatch window get updated.
    pub neighborhood_metric: GridMetric,
    /// Metric feeding the Gaussian update weight.
    pub weighting_metric: GridMetric,
    /// Collect per-kernel timings with a [`ProfileReport`](crate::ProfileReport).
    pub profiling: bool,
}

impl Default for SomConfig {
    fn default() -> Self {
        Self {
            width: 16,
            height: 16,
            depth: 1,
            neuron_size: 3,
            kernel_flags: String::new(),
            preferred_group_size: DEFAULT_GROUP_SIZE,
            weight_threshold: DEFAULT_WEIGHT_THRESHOLD,
            neighborhood_metric: GridMetric::Chebyshev,
            weighting_metric: GridMetric::Euclidean,
            profiling: false,
        }
    }
}

impl SomConfig {
    /// Cubic grid with `side³` neurons of `neuron_size` features.
    pub fn cube(side: usize, neuron_size: usize) -> Self {
        Self {
            width: side,
            height: side,
            depth: side,
            neuron_size,
            ..Default::default()
        }
    }

    /// Flat 2-D grid (depth 1).
    pub fn planar(width: usize, height: usize, neuron_size: usize) -> Self {
        Self {
            width,
            height,
            depth: 1,
            neuron_size,
            ..Default::default()
        }
    }

    /// Padded feature stride: `round_up_power2(max(neuron_size, 2))`.
    ///
    /// The floor of two keeps at least one work item per neuron in the
    /// paired distance reduction.
    pub fn neuron_size_rounded(&self) -> usize {
        round_up_power2(self.neuron_size.max(2)).unwrap_or(2)
    }

    /// Total neuron count.
    pub fn total_size(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - any grid dimension or the feature length is zero
    /// - the preferred group size is below two
    /// - the weight threshold is not a positive finite number
    /// - `kernel_flags` contains an unknown or malformed flag
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 {
            return Err(ConfigError::InvalidDimension("width must be > 0"));
        }
        if self.height == 0 {
            return Err(ConfigError::InvalidDimension("height must be > 0"));
        }
        if self.depth == 0 {
            return Err(ConfigError::InvalidDimension("depth must be > 0"));
        }
        if self.neuron_size == 0 {
            return Err(ConfigError::InvalidDimension("neuron_size must be > 0"));
        }
        if self
            .width
            .checked_mul(self.height)
            .and_then(|wh| wh.checked_mul(self.depth))
            .and_then(|t| t.checked_mul(self.neuron_size_rounded()))
            .map_or(true, |floats| floats > u32::MAX as usize)
        {
            return Err(ConfigError::GridTooLarge(
                "grid floats must be addressable with 32-bit indices".to_string(),
            ));
        }
        if self.preferred_group_size < 2 {
            return Err(ConfigError::InvalidGroupSize(self.preferred_group_size));
        }
        if !(self.weight_threshold.is_finite() && self.weight_threshold > 0.0) {
            return Err(ConfigError::InvalidThreshold(self.weight_threshold));
        }
        self.variant().map(|_| ())
    }

    /// Resolves typed fields and `kernel_flags` into one kernel variant.
    pub fn variant(&self) -> Result<KernelVariant, ConfigError> {
        let base = KernelVariant {
            force_cpu: false,
            neighborhood: self.neighborhood_metric,
            weighting: self.weighting_metric,
            weight_threshold: self.weight_threshold,
        };
        base.with_flags(&self.kernel_flags)
    }
}

/// Algorithmic variant of the kernels, after flag parsing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelVariant {
    /// Use the CPU code path regardless of the device class.
    pub force_cpu: bool,
    /// Neighborhood membership metric.
    pub neighborhood: GridMetric,
    /// Weighting metric.
    pub weighting: GridMetric,
    /// Radius-decay threshold.
    pub weight_threshold: f64,
}

impl Default for KernelVariant {
    fn default() -> Self {
        Self {
            force_cpu: false,
            neighborhood: GridMetric::Chebyshev,
            weighting: GridMetric::Euclidean,
            weight_threshold: DEFAULT_WEIGHT_THRESHOLD,
        }
    }
}

impl KernelVariant {
    /// Parses a flag string on top of the default variant.
    pub fn parse(flags: &str) -> Result<Self, ConfigError> {
        Self::default().with_flags(flags)
    }

    /// Applies a flag string to this variant. Later flags win.
    pub fn with_flags(mut self, flags: &str) -> Result<Self, ConfigError> {
        for token in flags.split_whitespace() {
            let define = token
                .strip_prefix("-D")
                .ok_or_else(|| ConfigError::UnknownKernelFlag(token.to_string()))?;
            let (name, value) = match define.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (define, None),
            };
            match (name, value) {
                ("CPU", None) => self.force_cpu = true,
                ("NEIGHBORHOOD", Some(v)) => {
                    self.neighborhood = GridMetric::parse(v)
                        .ok_or_else(|| ConfigError::UnknownKernelFlag(token.to_string()))?;
                }
                ("WEIGHTING", Some(v)) => {
                    self.weighting = GridMetric::parse(v)
                        .ok_or_else(|| ConfigError::UnknownKernelFlag(token.to_string()))?;
                }
                ("WEIGHT_THRESHOLD", Some(v)) => {
                    let threshold: f64 = v
                        .parse()
                        .map_err(|_| ConfigError::UnknownKernelFlag(token.to_string()))?;
                    if !(threshold.is_finite() && threshold > 0.0) {
                        return Err(ConfigError::InvalidThreshold(threshold));
                    }
                    self.weight_threshold = threshold;
                }
                _ => return Err(ConfigError::UnknownKernelFlag(token.to_string())),
            }
        }
        Ok(self)
    }
}

/// Errors raised before any device interaction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A dimension parameter is invalid (zero or mismatched).
    #[error("Invalid dimension: {0}")]
    InvalidDimension(&'static str),

    /// A rounding helper received zero.
    #[error("{0} must be positive")]
    ZeroSize(&'static str),

    /// The training stream has no vectors.
    #[error("Training set is empty")]
    EmptyTrainingSet,

    /// A training vector has the wrong number of features.
    #[error("Training vector {index} has {got} features, expected {expected}")]
    FeatureLengthMismatch {
        /// Index of the offending vector.
        index: usize,
        /// Configured feature length.
        expected: usize,
        /// Length received.
        got: usize,
    },

    /// Vectors and parameter pairs are not matched 1:1.
    #[error("Got {vectors} training vectors but {params} parameter pairs")]
    ParameterCountMismatch {
        /// Number of vectors.
        vectors: usize,
        /// Number of `(sigma, learn_rate)` pairs.
        params: usize,
    },

    /// A `(sigma, learn_rate)` pair is unusable.
    #[error("Training parameters {index} invalid: {reason}")]
    InvalidParameter {
        /// Index of the offending pair.
        index: usize,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Work-group size is below two, so a reduction round cannot shrink.
    #[error("Work-group size must be at least 2, got {0}")]
    InvalidGroupSize(usize),

    /// Weight threshold is not a positive finite number.
    #[error("Weight threshold must be positive and finite, got {0}")]
    InvalidThreshold(f64),

    /// A kernel flag is unknown or malformed.
    #[error("Unknown kernel flag '{0}'")]
    UnknownKernelFlag(String),

    /// Half the padded feature length exceeds the usable work-group size.
    #[error("Neuron half-width {half} exceeds work-group size {group_size}")]
    NeuronTooLarge {
        /// `neuron_size_rounded / 2`.
        half: usize,
        /// Work-group size after clamping.
        group_size: usize,
    },

    /// The grid needs more workgroups or floats than the device can address.
    #[error("Grid too large: {0}")]
    GridTooLarge(String),
}
