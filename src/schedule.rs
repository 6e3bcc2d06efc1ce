//! Training vectors, per-step parameters and decay schedules.
//!
//! Every training vector carries its own `(sigma, learn_rate)` pair. Callers
//! can supply the pairs directly or let a [`TrainingSchedule`] generate them
//! from the position of the vector in the stream.
//!
//! The update radius is not scheduled. It shrinks on its own, see
//! [`decay_radius`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::buffer::AlignedBuffer;
use crate::config::ConfigError;
use crate::dispatch::round_up_power2;

/// Neighborhood width and step size for one training vector.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainingParams {
    /// Gaussian width of the neighborhood weight.
    pub sigma: f64,
    /// Weight at the winner itself.
    pub learn_rate: f64,
}

impl TrainingParams {
    /// Creates a parameter pair.
    pub const fn new(sigma: f64, learn_rate: f64) -> Self {
        Self { sigma, learn_rate }
    }

    /// `sigma²`.
    #[inline]
    pub fn sigma_sq(&self) -> f64 {
        self.sigma * self.sigma
    }

    /// Weight a neuron at radius `r` would receive under the decay test:
    /// `learn_rate * exp(-r / (2σ²))`.
    #[inline]
    pub fn edge_weight(&self, radius: usize) -> f64 {
        self.learn_rate * (-(radius as f64) / (2.0 * self.sigma_sq())).exp()
    }

    fn check(&self, index: usize) -> Result<(), ConfigError> {
        if !self.sigma.is_finite() || self.sigma <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                index,
                reason: "sigma must be positive and finite",
            });
        }
        if !self.learn_rate.is_finite() || self.learn_rate < 0.0 {
            return Err(ConfigError::InvalidParameter {
                index,
                reason: "learn_rate must be non-negative and finite",
            });
        }
        Ok(())
    }
}

/// Shrinks `radius` until the edge weight reaches `threshold`.
///
/// Starting from the current radius, the radius is decremented while it is
/// positive and `learn_rate * exp(-radius / (2σ²)) < threshold`. A result of
/// zero means training has converged.
///
/// ```rust
/// use somgrid::{decay_radius, TrainingParams};
///
/// let params = TrainingParams::new(1.0, 0.5);
/// assert_eq!(decay_radius(3, &params, 0.01), 3);
/// assert_eq!(decay_radius(3, &TrainingParams::new(1.0, 0.005), 0.01), 0);
/// ```
pub fn decay_radius(radius: usize, params: &TrainingParams, threshold: f64) -> usize {
    let mut radius = radius;
    while radius > 0 && params.edge_weight(radius) < threshold {
        radius -= 1;
    }
    radius
}

/// Produces training parameters for position `iteration` of `total`.
pub trait TrainingSchedule {
    /// Parameters for the given iteration.
    fn params(&self, iteration: usize, total: usize) -> TrainingParams;
}

/// Holds the same parameters for every vector.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSchedule(pub TrainingParams);

impl TrainingSchedule for ConstantSchedule {
    fn params(&self, _: usize, _: usize) -> TrainingParams {
        self.0
    }
}

/// Geometric decay: `start * (end / start)^(i / n)` for both values.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialDecay {
    /// Parameters at the first vector.
    pub start: TrainingParams,
    /// Parameters approached at the last vector.
    pub end: TrainingParams,
}

impl ExponentialDecay {
    /// Decays from `start` to `end` over a run.
    pub fn new(start: TrainingParams, end: TrainingParams) -> Self {
        Self { start, end }
    }
}

impl TrainingSchedule for ExponentialDecay {
    fn params(&self, iteration: usize, total: usize) -> TrainingParams {
        let t = progress(iteration, total);
        let lerp = |a: f64, b: f64| {
            if a <= 0.0 || b <= 0.0 {
                a + (b - a) * t
            } else {
                a * (b / a).powf(t)
            }
        };
        TrainingParams {
            sigma: lerp(self.start.sigma, self.end.sigma),
            learn_rate: lerp(self.start.learn_rate, self.end.learn_rate),
        }
    }
}

/// Linear interpolation from `start` to `end`.
#[derive(Debug, Clone, Copy)]
pub struct LinearDecay {
    /// Parameters at the first vector.
    pub start: TrainingParams,
    /// Parameters approached at the last vector.
    pub end: TrainingParams,
}

impl LinearDecay {
    /// Interpolates from `start` to `end` over a run.
    pub fn new(start: TrainingParams, end: TrainingParams) -> Self {
        Self { start, end }
    }
}

impl TrainingSchedule for LinearDecay {
    fn params(&self, iteration: usize, total: usize) -> TrainingParams {
        let t = progress(iteration, total);
        TrainingParams {
            sigma: self.start.sigma + (self.end.sigma - self.start.sigma) * t,
            learn_rate: self.start.learn_rate + (self.end.learn_rate - self.start.learn_rate) * t,
        }
    }
}

#[inline]
fn progress(iteration: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        iteration.min(total) as f64 / total as f64
    }
}

/// Ordered training vectors, each paired with its parameters.
///
/// Vectors are validated and padded to the neuron stride on construction,
/// so the trainer can upload them as one block.
///
/// # Example
///
/// ```rust
/// use somgrid::{TrainingParams, TrainingSet};
///
/// let set = TrainingSet::new(
///     3,
///     &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
///     vec![TrainingParams::new(2.0, 0.5), TrainingParams::new(1.5, 0.4)],
/// )
/// .unwrap();
/// assert_eq!(set.len(), 2);
/// assert_eq!(set.padded_vectors().len(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct TrainingSet {
    neuron_size: usize,
    stride: usize,
    vectors: AlignedBuffer,
    params: Vec<TrainingParams>,
}

impl TrainingSet {
    /// Builds a set from vectors and matching parameters.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::EmptyTrainingSet`] if `vectors` is empty
    /// - [`ConfigError::ParameterCountMismatch`] if the counts differ
    /// - [`ConfigError::FeatureLengthMismatch`] for a vector of wrong length
    /// - [`ConfigError::InvalidParameter`] for non-finite or negative values
    pub fn new<V: AsRef<[f32]>>(
        neuron_size: usize,
        vectors: &[V],
        params: Vec<TrainingParams>,
    ) -> Result<Self, ConfigError> {
        if neuron_size == 0 {
            return Err(ConfigError::InvalidDimension("neuron_size must be > 0"));
        }
        if vectors.is_empty() {
            return Err(ConfigError::EmptyTrainingSet);
        }
        if vectors.len() != params.len() {
            return Err(ConfigError::ParameterCountMismatch {
                vectors: vectors.len(),
                params: params.len(),
            });
        }
        for (index, p) in params.iter().enumerate() {
            p.check(index)?;
        }

        let stride = round_up_power2(neuron_size.max(2))?;
        let mut padded = AlignedBuffer::zeroed(vectors.len() * stride);
        for (index, (dst, v)) in padded
            .as_mut_slice()
            .chunks_exact_mut(stride)
            .zip(vectors)
            .enumerate()
        {
            let v = v.as_ref();
            if v.len() != neuron_size {
                return Err(ConfigError::FeatureLengthMismatch {
                    index,
                    expected: neuron_size,
                    got: v.len(),
                });
            }
            dst[..neuron_size].copy_from_slice(v);
        }

        Ok(Self {
            neuron_size,
            stride,
            vectors: padded,
            params,
        })
    }

    /// Builds a set whose parameters come from `schedule`.
    pub fn with_schedule<V, S>(neuron_size: usize, vectors: &[V], schedule: &S) -> Result<Self, ConfigError>
    where
        V: AsRef<[f32]>,
        S: TrainingSchedule + ?Sized,
    {
        let total = vectors.len();
        let params = (0..total).map(|i| schedule.params(i, total)).collect();
        Self::new(neuron_size, vectors, params)
    }

    /// Number of vectors.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Always false: empty sets are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Feature length.
    pub fn neuron_size(&self) -> usize {
        self.neuron_size
    }

    /// Padded stride.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Unpadded features of vector `index`.
    pub fn vector(&self, index: usize) -> &[f32] {
        let start = index * self.stride;
        &self.vectors.as_slice()[start..start + self.neuron_size]
    }

    /// All vectors in padded layout.
    pub fn padded_vectors(&self) -> &[f32] {
        self.vectors.as_slice()
    }

    /// Parameters of vector `index`.
    pub fn params(&self, index: usize) -> TrainingParams {
        self.params[index]
    }

    /// All parameter pairs.
    pub fn all_params(&self) -> &[TrainingParams] {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_keeps_radius_when_weight_is_high() {
        let p = TrainingParams::new(1.0, 0.5);
        // 0.5 * exp(-1.5) ≈ 0.11
        assert_eq!(decay_radius(3, &p, 0.01), 3);
    }

    #[test]
    fn test_decay_reaches_zero_for_tiny_rate() {
        let p = TrainingParams::new(1.0, 0.005);
        assert_eq!(decay_radius(5, &p, 0.01), 0);
    }

    #[test]
    fn test_decay_stops_at_threshold() {
        let p = TrainingParams::new(1.0, 0.1);
        // 0.1 * exp(-r/2) >= 0.01  <=>  r <= 2 ln 10 ≈ 4.6
        assert_eq!(decay_radius(10, &p, 0.01), 4);
    }

    #[test]
    fn test_decay_never_increases() {
        for r in 0..20 {
            let p = TrainingParams::new(0.7, 0.3);
            assert!(decay_radius(r, &p, 0.01) <= r);
        }
    }

    #[test]
    fn test_exponential_schedule_endpoints() {
        let s = ExponentialDecay::new(TrainingParams::new(4.0, 0.5), TrainingParams::new(1.0, 0.05));
        let first = s.params(0, 10);
        assert!((first.sigma - 4.0).abs() < 1e-12);
        let mid = s.params(5, 10);
        assert!((mid.sigma - 2.0).abs() < 1e-9);
        let last = s.params(10, 10);
        assert!((last.learn_rate - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_linear_schedule() {
        let s = LinearDecay::new(TrainingParams::new(3.0, 0.4), TrainingParams::new(1.0, 0.0));
        let p = s.params(1, 2);
        assert!((p.sigma - 2.0).abs() < 1e-12);
        assert!((p.learn_rate - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_set_validation() {
        let empty: Vec<Vec<f32>> = vec![];
        assert_eq!(
            TrainingSet::new(2, &empty, vec![]).unwrap_err(),
            ConfigError::EmptyTrainingSet
        );
        assert!(matches!(
            TrainingSet::new(2, &[vec![1.0, 2.0]], vec![]),
            Err(ConfigError::ParameterCountMismatch { vectors: 1, params: 0 })
        ));
        assert!(matches!(
            TrainingSet::new(2, &[vec![1.0]], vec![TrainingParams::new(1.0, 0.1)]),
            Err(ConfigError::FeatureLengthMismatch { index: 0, expected: 2, got: 1 })
        ));
        assert!(matches!(
            TrainingSet::new(2, &[vec![1.0, 2.0]], vec![TrainingParams::new(f64::NAN, 0.1)]),
            Err(ConfigError::InvalidParameter { index: 0, .. })
        ));
        assert!(matches!(
            TrainingSet::new(2, &[vec![1.0, 2.0]], vec![TrainingParams::new(1.0, -0.1)]),
            Err(ConfigError::InvalidParameter { index: 0, .. })
        ));
    }

    #[test]
    fn test_set_pads_vectors() {
        let set = TrainingSet::with_schedule(
            3,
            &[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]],
            &ConstantSchedule(TrainingParams::new(1.0, 0.1)),
        )
        .unwrap();
        assert_eq!(set.padded_vectors(), &[1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
        assert_eq!(set.vector(1), &[4.0, 5.0, 6.0]);
    }
}
