//! Dispatch planning tests.
//!
//! These tests verify:
//! - Work-group sizes respect every device limit
//! - Reduction rounds shrink to one candidate with exact divisibility
//! - Planning errors are reported before any kernel is built

use somgrid::{
    ConfigError, CpuDevice, CpuOptions, DeviceClass, DeviceInfo, DispatchPlan, GridShape, SomConfig,
    SomError, SomTrainer,
};

fn device(max_group: usize, shared_bytes: usize) -> DeviceInfo {
    DeviceInfo {
        name: "planner test".to_string(),
        class: DeviceClass::Accelerator,
        max_group_size: max_group,
        max_workgroup_size: [max_group, max_group, 64],
        max_workgroups_per_dim: 65535,
        max_shared_memory_bytes: shared_bytes,
    }
}

// =============================================================================
// Group size selection
// =============================================================================

#[test]
fn test_group_size_floors_to_power_of_two() {
    let plan = DispatchPlan::new(GridShape::new(8, 8, 1), 3, &device(1024, 0), 300).unwrap();
    assert_eq!(plan.group_size, 256);
}

#[test]
fn test_group_size_clamped_by_shared_memory() {
    // 8 bytes per lane: 1024 bytes hold 128 (value, index) pairs
    let plan = DispatchPlan::new(GridShape::new(8, 8, 1), 3, &device(1024, 1024), 512).unwrap();
    assert_eq!(plan.group_size, 128);
}

#[test]
fn test_zero_preferred_group_size_rejected() {
    let err = DispatchPlan::new(GridShape::new(4, 4, 1), 3, &device(256, 0), 0).unwrap_err();
    assert!(matches!(err, SomError::Config(ConfigError::InvalidGroupSize(0))));
}

#[test]
fn test_single_lane_groups_rejected() {
    // one-lane groups cannot shrink the candidate count
    let err = DispatchPlan::new(GridShape::new(2, 2, 1), 2, &device(256, 0), 1).unwrap_err();
    assert!(matches!(err, SomError::Config(ConfigError::InvalidGroupSize(1))));

    let err = DispatchPlan::new(GridShape::new(2, 2, 1), 2, &device(1, 0), 512).unwrap_err();
    assert!(matches!(err, SomError::Config(ConfigError::InvalidGroupSize(1))));

    let config = SomConfig {
        preferred_group_size: 1,
        ..SomConfig::planar(2, 2, 2)
    };
    assert_eq!(config.validate(), Err(ConfigError::InvalidGroupSize(1)));
    let err = SomTrainer::new(config, &CpuDevice::default()).unwrap_err();
    assert!(matches!(err, SomError::Config(ConfigError::InvalidGroupSize(1))));

    let single_lane = CpuDevice::new(CpuOptions {
        max_group_size: 1,
        ..CpuOptions::default()
    });
    let err = SomTrainer::new(SomConfig::planar(2, 2, 2), &single_lane).unwrap_err();
    assert!(matches!(err, SomError::Config(ConfigError::InvalidGroupSize(1))));
}

// =============================================================================
// Feature padding
// =============================================================================

#[test]
fn test_single_feature_padded_to_two_lanes() {
    let plan = DispatchPlan::new(GridShape::new(4, 4, 1), 1, &device(256, 0), 256).unwrap();
    assert_eq!(plan.neuron_size_rounded, 2);
    assert_eq!(plan.half, 1);
}

#[test]
fn test_feature_stride_is_power_of_two() {
    for (features, stride) in [(2, 2), (3, 4), (5, 8), (16, 16), (17, 32)] {
        let plan = DispatchPlan::new(GridShape::new(4, 4, 4), features, &device(256, 0), 256).unwrap();
        assert_eq!(plan.neuron_size_rounded, stride, "features = {features}");
        assert_eq!(plan.half * 2, stride);
        assert_eq!(plan.distance.local[0], plan.half);
        assert!(plan.distance.local[0] * plan.distance.local[1] <= plan.group_size);
    }
}

// =============================================================================
// Reduction rounds
// =============================================================================

#[test]
fn test_three_rounds_with_short_final_group() {
    // 100 neurons pad to 128 -> 32 local minima -> 8 -> 2 -> 1
    let plan = DispatchPlan::new(GridShape::new(10, 10, 1), 2, &device(4, 0), 512).unwrap();
    assert_eq!(plan.group_size, 4);
    assert_eq!(plan.reduction.global[0], 128);
    assert_eq!(plan.reduced_elems, 32);

    let elements: Vec<usize> = plan.rounds.iter().map(|r| r.elements).collect();
    let locals: Vec<usize> = plan.rounds.iter().map(|r| r.geometry.local[0]).collect();
    assert_eq!(elements, vec![32, 8, 2]);
    assert_eq!(locals, vec![4, 4, 2]);
    assert_eq!(plan.rounds.last().unwrap().output_elements, 1);
    assert_eq!(plan.winner_slot(), 1);
    assert_eq!(plan.round_group_sizes(), vec![2, 4]);
}

#[test]
fn test_rounds_chain_and_divide_exactly() {
    for side in [3usize, 7, 12, 20, 33] {
        let plan = DispatchPlan::new(GridShape::new(side, side, 2), 4, &device(8, 0), 8).unwrap();
        let mut expected = plan.reduced_elems;
        for round in &plan.rounds {
            assert_eq!(round.elements, expected, "side = {side}");
            assert_eq!(round.geometry.global[0] % round.geometry.local[0], 0);
            assert!(round.geometry.local[0].is_power_of_two());
            expected = round.output_elements;
        }
        assert_eq!(expected, 1, "side = {side} did not reduce to one candidate");
    }
}

#[test]
fn test_two_lane_groups_reduce_to_one_candidate() {
    // 25 neurons pad to 32 -> 16 local minima, halved every round
    let plan = DispatchPlan::new(GridShape::new(5, 5, 1), 2, &device(2, 0), 2).unwrap();
    assert_eq!(plan.group_size, 2);
    assert_eq!(plan.reduced_elems, 16);
    let elements: Vec<usize> = plan.rounds.iter().map(|r| r.elements).collect();
    assert_eq!(elements, vec![16, 8, 4, 2]);
    assert_eq!(plan.rounds.last().unwrap().output_elements, 1);
}

#[test]
fn test_no_rounds_when_one_group_covers_grid() {
    let plan = DispatchPlan::new(GridShape::new(2, 2, 1), 2, &device(4, 0), 4).unwrap();
    assert_eq!(plan.reduced_elems, 1);
    assert!(plan.rounds.is_empty());
    assert_eq!(plan.winner_slot(), 0);
}

// =============================================================================
// Limits
// =============================================================================

#[test]
fn test_workgroup_count_limit() {
    let mut info = device(4, 0);
    info.max_workgroups_per_dim = 8;
    let err = DispatchPlan::new(GridShape::new(10, 10, 1), 2, &info, 4).unwrap_err();
    assert!(matches!(err, SomError::Config(ConfigError::GridTooLarge(_))));
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_workgroup_counts_past_u32_rejected() {
    // the device limit alone would allow 2^33 groups; dispatch counts are u32
    let mut info = device(2, 0);
    info.max_workgroups_per_dim = usize::MAX;
    let err = DispatchPlan::new(GridShape::new(1 << 33, 1, 1), 2, &info, 2).unwrap_err();
    assert!(matches!(err, SomError::Config(ConfigError::GridTooLarge(_))));
}

#[test]
fn test_trainer_reports_oversized_neuron() {
    let device = CpuDevice::new(CpuOptions {
        max_group_size: 8,
        ..CpuOptions::default()
    });
    let err = SomTrainer::new(SomConfig::cube(2, 64), &device).unwrap_err();
    assert!(matches!(
        err,
        SomError::Config(ConfigError::NeuronTooLarge { half: 32, group_size: 8 })
    ));
}
