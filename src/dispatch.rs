//! Work-group and dispatch sizing.
//!
//! Every kernel launch in a training step is sized here, once, from the
//! device limits, the grid shape and the feature length. The only part that
//! changes per step is the update window, which follows the radius.
//!
//! # Stages
//!
//! | Stage | Local | Global |
//! |-------|-------|--------|
//! | distances | `(X_DIM, group/X_DIM, 1)` | `(X_DIM*w, round_up(h, ly), d)` |
//! | local minima | `group` | `round_up(round_up_power2(total), group)` |
//! | global min round | `group` or `round_up_power2(n)` | `round_up(n, local)` |
//! | update | `(X_DIM, min(group/X_DIM, p2(win_h)), 1)` | `(X_DIM*win_w, round_up(win_h, ly), win_d)` |
//!
//! Reduction rounds ping-pong between two buffer pairs. The local-minima
//! pass writes pair 0, round `i` reads pair `i % 2` and writes the other
//! one, so the winner ends up in pair [`DispatchPlan::winner_slot`].

use log::{debug, warn};

use crate::config::ConfigError;
use crate::device::DeviceInfo;
use crate::error::{SomError, SomResult};
use crate::grid::GridShape;

/// Rounds `x` up to the next multiple of `multiple`.
///
/// # Errors
///
/// [`ConfigError::ZeroSize`] if either argument is zero.
pub fn round_up(x: usize, multiple: usize) -> Result<usize, ConfigError> {
    if x == 0 {
        return Err(ConfigError::ZeroSize("round_up value"));
    }
    if multiple == 0 {
        return Err(ConfigError::ZeroSize("round_up multiple"));
    }
    let rem = x % multiple;
    if rem == 0 {
        Ok(x)
    } else {
        x.checked_add(multiple - rem)
            .ok_or_else(|| ConfigError::GridTooLarge(format!("round_up({x}, {multiple}) overflows")))
    }
}

/// Smallest power of two `>= n`.
///
/// # Errors
///
/// [`ConfigError::ZeroSize`] if `n` is zero.
pub fn round_up_power2(n: usize) -> Result<usize, ConfigError> {
    if n == 0 {
        return Err(ConfigError::ZeroSize("round_up_power2 value"));
    }
    n.checked_next_power_of_two()
        .ok_or_else(|| ConfigError::GridTooLarge(format!("round_up_power2({n}) overflows")))
}

/// Largest power of two `<= n` (n > 0).
fn floor_power2(n: usize) -> usize {
    1 << (usize::BITS - 1 - n.leading_zeros())
}

/// Local and global sizes of one dispatch, in work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Work-group size per axis.
    pub local: [usize; 3],
    /// Total work items per axis. Always a multiple of `local`.
    pub global: [usize; 3],
}

impl Geometry {
    /// One-dimensional geometry.
    pub fn linear(local: usize, global: usize) -> Self {
        Self {
            local: [local, 1, 1],
            global: [global, 1, 1],
        }
    }

    /// Number of work groups per axis.
    pub fn group_counts(&self) -> [usize; 3] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
            self.global[2] / self.local[2],
        ]
    }

    /// Work-group counts in dispatch form. Counts past `u32::MAX` saturate;
    /// planned geometries never reach them.
    pub fn workgroups(&self) -> [u32; 3] {
        self.group_counts()
            .map(|count| u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Work items per group.
    pub fn group_volume(&self) -> usize {
        self.local.iter().product()
    }
}

/// One round of the cross-group minimum reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionRound {
    /// Candidates entering the round.
    pub elements: usize,
    /// Dispatch geometry (1-D).
    pub geometry: Geometry,
    /// Candidates left after the round (`global / local`).
    pub output_elements: usize,
}

impl ReductionRound {
    /// Buffer pair read by round `index`.
    pub fn source_slot(index: usize) -> usize {
        index % 2
    }

    /// Buffer pair written by round `index`.
    pub fn target_slot(index: usize) -> usize {
        (index + 1) % 2
    }
}

/// Update dispatch for one radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateGeometry {
    /// Radius the window was derived from.
    pub radius: usize,
    /// Clipped window extent per axis: `min(2r+1, dim)`.
    pub window: [usize; 3],
    /// Dispatch sizes.
    pub geometry: Geometry,
}

/// Immutable dispatch plan for one trainer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    /// Grid shape the plan was built for.
    pub shape: GridShape,
    /// Unpadded feature length.
    pub neuron_size: usize,
    /// Padded feature stride.
    pub neuron_size_rounded: usize,
    /// Half the padded stride (`X_DIM`).
    pub half: usize,
    /// Work-group size after device clamping.
    pub group_size: usize,
    /// Distance stage.
    pub distance: Geometry,
    /// Local-minima stage.
    pub reduction: Geometry,
    /// Number of per-group candidates the local-minima stage emits.
    pub reduced_elems: usize,
    /// Cross-group reduction rounds, in order. Empty when one group suffices.
    pub rounds: Vec<ReductionRound>,
    /// Largest y extent a work group may have on this device.
    max_local_y: usize,
}

impl DispatchPlan {
    /// Builds the plan.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidGroupSize`] if `preferred_group_size`, or the
    ///   size the device allows, is below two
    /// - [`ConfigError::NeuronTooLarge`] if half the padded feature length
    ///   exceeds the usable group size
    /// - [`ConfigError::GridTooLarge`] if any stage needs more work groups
    ///   per axis than the device allows
    /// - [`SomError::Invariant`] if a reduction size fails divisibility
    pub fn new(
        shape: GridShape,
        neuron_size: usize,
        info: &DeviceInfo,
        preferred_group_size: usize,
    ) -> SomResult<Self> {
        if preferred_group_size < 2 {
            return Err(ConfigError::InvalidGroupSize(preferred_group_size).into());
        }
        if shape.total() == 0 {
            return Err(ConfigError::InvalidDimension("grid must contain at least one neuron").into());
        }
        if neuron_size == 0 {
            return Err(ConfigError::InvalidDimension("neuron_size must be > 0").into());
        }

        let group_size = Self::usable_group_size(info, preferred_group_size)?;
        let neuron_size_rounded = round_up_power2(neuron_size.max(2))?;
        let half = neuron_size_rounded / 2;
        if half > group_size || half > info.max_workgroup_size[0] {
            return Err(ConfigError::NeuronTooLarge { half, group_size }.into());
        }

        let max_local_y = info.max_workgroup_size[1].max(1);
        let local_y = (group_size / half).min(max_local_y);
        let distance = Geometry {
            local: [half, local_y, 1],
            global: [half * shape.width, round_up(shape.height, local_y)?, shape.depth],
        };

        let padded_total = round_up_power2(shape.total())?;
        let reduction = Geometry::linear(group_size, round_up(padded_total, group_size)?);
        if reduction.global[0] % reduction.local[0] != 0 {
            return Err(SomError::invariant(format!(
                "local-minima global size {} is not a multiple of {}",
                reduction.global[0], reduction.local[0]
            )));
        }
        let reduced_elems = reduction.global[0] / reduction.local[0];

        let mut rounds = Vec::new();
        let mut elements = reduced_elems;
        while elements > 1 {
            let local = if elements < group_size {
                round_up_power2(elements)?
            } else {
                group_size
            };
            let geometry = Geometry::linear(local, round_up(elements, local)?);
            if geometry.global[0] % local != 0 {
                return Err(SomError::invariant(format!(
                    "reduction round global size {} is not a multiple of {local}",
                    geometry.global[0]
                )));
            }
            let output_elements = geometry.global[0] / local;
            if output_elements >= elements {
                return Err(SomError::invariant(format!(
                    "reduction round does not shrink {elements} candidates with groups of {local}"
                )));
            }
            rounds.push(ReductionRound {
                elements,
                geometry,
                output_elements,
            });
            elements = output_elements;
        }

        let plan = Self {
            shape,
            neuron_size,
            neuron_size_rounded,
            half,
            group_size,
            distance,
            reduction,
            reduced_elems,
            rounds,
            max_local_y,
        };
        plan.check_workgroup_counts(info)?;

        debug!(
            "Dispatch plan for {}x{}x{} grid: group={}, X_DIM={}, distance={:?}, reduction={:?}, rounds={}",
            shape.width,
            shape.height,
            shape.depth,
            group_size,
            half,
            plan.distance,
            plan.reduction,
            plan.rounds.len()
        );
        Ok(plan)
    }

    /// Largest power of two within the preferred size and every device limit.
    fn usable_group_size(info: &DeviceInfo, preferred: usize) -> Result<usize, ConfigError> {
        let mut limit = preferred
            .min(info.max_group_size.max(1))
            .min(info.max_workgroup_size[0].max(1));
        // local minima keep one f32 and one u32 per lane in shared memory
        if info.max_shared_memory_bytes > 0 {
            limit = limit.min((info.max_shared_memory_bytes / 8).max(1));
        }
        let group_size = floor_power2(limit);
        if group_size < 2 {
            return Err(ConfigError::InvalidGroupSize(group_size));
        }
        if group_size < preferred {
            warn!(
                "Work-group size clamped from {} to {} on '{}'",
                preferred, group_size, info.name
            );
        }
        Ok(group_size)
    }

    fn check_workgroup_counts(&self, info: &DeviceInfo) -> SomResult<()> {
        let max = info.max_workgroups_per_dim;
        let mut stages = vec![("distances", self.distance), ("local minima", self.reduction)];
        stages.extend(self.rounds.iter().map(|r| ("global min", r.geometry)));
        for (stage, geometry) in stages {
            let counts = geometry.group_counts();
            if let Some(count) = counts
                .iter()
                .find(|&&c| c > max || u32::try_from(c).is_err())
            {
                return Err(ConfigError::GridTooLarge(format!(
                    "{stage} needs {count} work groups on one axis, device allows {max}"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Buffer pair holding the winner after all rounds.
    pub fn winner_slot(&self) -> usize {
        self.rounds.len() % 2
    }

    /// Update dispatch for the given radius.
    pub fn update_geometry(&self, radius: usize) -> SomResult<UpdateGeometry> {
        let span = radius.saturating_mul(2).saturating_add(1);
        let window = [
            span.min(self.shape.width),
            span.min(self.shape.height),
            span.min(self.shape.depth),
        ];
        let local_y = (self.group_size / self.half)
            .min(round_up_power2(window[1])?)
            .min(self.max_local_y);
        let geometry = Geometry {
            local: [self.half, local_y, 1],
            global: [self.half * window[0], round_up(window[1], local_y)?, window[2]],
        };
        Ok(UpdateGeometry {
            radius,
            window,
            geometry,
        })
    }

    /// Every distinct work-group shape the kernels will be launched with.
    ///
    /// Used to build pipelines up front, since WGSL fixes the work-group
    /// size at compile time.
    pub fn update_group_heights(&self) -> Vec<usize> {
        let max = (self.group_size / self.half).min(self.max_local_y);
        let mut heights = Vec::new();
        let mut h = 1;
        while h <= max {
            heights.push(h);
            h *= 2;
        }
        if heights.last() != Some(&max) {
            heights.push(max);
        }
        heights
    }

    /// Distinct local sizes used by the reduction rounds.
    pub fn round_group_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.rounds.iter().map(|r| r.geometry.local[0]).collect();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, DeviceInfo};

    fn device(max_group: usize) -> DeviceInfo {
        DeviceInfo {
            name: "test".to_string(),
            class: DeviceClass::Accelerator,
            max_group_size: max_group,
            max_workgroup_size: [max_group, max_group, 64],
            max_workgroups_per_dim: 65535,
            max_shared_memory_bytes: 0,
        }
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(10, 4), Ok(12));
        assert_eq!(round_up(12, 4), Ok(12));
        assert_eq!(round_up(1, 1), Ok(1));
        assert!(round_up(0, 4).is_err());
        assert!(round_up(4, 0).is_err());

        assert_eq!(round_up_power2(1), Ok(1));
        assert_eq!(round_up_power2(5), Ok(8));
        assert_eq!(round_up_power2(64), Ok(64));
        assert!(matches!(round_up_power2(0), Err(ConfigError::ZeroSize(_))));
    }

    #[test]
    fn test_workgroup_counts() {
        let g = Geometry {
            local: [2, 4, 1],
            global: [14, 8, 3],
        };
        assert_eq!(g.group_counts(), [7, 2, 3]);
        assert_eq!(g.workgroups(), [7, 2, 3]);
        assert_eq!(g.group_volume(), 8);

        #[cfg(target_pointer_width = "64")]
        {
            let wide = Geometry::linear(1, u32::MAX as usize + 5);
            assert_eq!(wide.group_counts()[0], u32::MAX as usize + 5);
            assert_eq!(wide.workgroups()[0], u32::MAX);
        }
    }

    #[test]
    fn test_floor_power2() {
        assert_eq!(floor_power2(1), 1);
        assert_eq!(floor_power2(300), 256);
        assert_eq!(floor_power2(512), 512);
    }

    #[test]
    fn test_small_grid_single_round_free() {
        let plan = DispatchPlan::new(GridShape::new(4, 4, 1), 3, &device(256), 512).unwrap();
        assert_eq!(plan.group_size, 256);
        assert_eq!(plan.half, 2);
        assert_eq!(plan.distance.local, [2, 128, 1]);
        assert_eq!(plan.distance.global, [8, 128, 1]);
        assert_eq!(plan.reduction.global, [256, 1, 1]);
        assert_eq!(plan.reduced_elems, 1);
        assert!(plan.rounds.is_empty());
        assert_eq!(plan.winner_slot(), 0);
    }

    #[test]
    fn test_neuron_too_large() {
        let err = DispatchPlan::new(GridShape::new(2, 2, 2), 1024, &device(256), 512).unwrap_err();
        assert!(matches!(
            err,
            SomError::Config(ConfigError::NeuronTooLarge { half: 512, group_size: 256 })
        ));
    }

    #[test]
    fn test_update_window_clips_to_grid() {
        let plan = DispatchPlan::new(GridShape::new(8, 4, 2), 4, &device(64), 64).unwrap();
        let upd = plan.update_geometry(3).unwrap();
        assert_eq!(upd.window, [7, 4, 2]);
        assert_eq!(upd.geometry.local, [2, 4, 1]);
        assert_eq!(upd.geometry.global, [14, 4, 2]);

        let upd = plan.update_geometry(0).unwrap();
        assert_eq!(upd.window, [1, 1, 1]);
        assert_eq!(upd.geometry.local, [2, 1, 1]);
    }

    #[test]
    fn test_update_heights_cover_all_windows() {
        let plan = DispatchPlan::new(GridShape::new(16, 16, 16), 8, &device(64), 64).unwrap();
        let heights = plan.update_group_heights();
        for r in 0..16 {
            let upd = plan.update_geometry(r).unwrap();
            assert!(heights.contains(&upd.geometry.local[1]));
        }
    }
}
