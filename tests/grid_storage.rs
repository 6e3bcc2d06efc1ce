//! Host grid storage tests.
//!
//! These tests verify:
//! - A trained grid can be moved into a fresh trainer and answers the same
//! - Packed and padded layouts agree
//! - Grids of another shape or feature length never reach the device
//! - Serialized grids and configs restore exactly (`serde` feature)

use somgrid::{
    CpuDevice, GridShape, SomConfig, SomError, SomGrid, SomTrainer, TrainingParams, TrainingSet,
};

fn trained() -> SomTrainer<somgrid::CpuKernels> {
    let mut trainer = SomTrainer::new(SomConfig::planar(6, 4, 3), &CpuDevice::default()).unwrap();
    let samples = [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 1.0, 0.0]];
    let set = TrainingSet::new(3, &samples, vec![TrainingParams::new(1.2, 0.4); 4]).unwrap();
    trainer.train(&set).unwrap();
    trainer.download_grid().unwrap();
    trainer
}

#[test]
fn test_grid_transfers_between_trainers() {
    let mut source = trained();
    let mut target = SomTrainer::new(SomConfig::planar(6, 4, 3), &CpuDevice::default()).unwrap();
    *target.grid_mut() = source.grid().clone();
    target.upload_grid().unwrap();

    for sample in [[0.9f32, 0.1, 0.0], [0.1, 0.2, 0.8], [0.5, 0.5, 0.5]] {
        assert_eq!(source.find_winner(&sample).unwrap(), target.find_winner(&sample).unwrap());
    }
}

#[test]
fn test_upload_download_round_trip() {
    let mut trainer = SomTrainer::new(SomConfig::cube(3, 5), &CpuDevice::default()).unwrap();
    trainer.grid_mut().fill_with(|x, y, z, c| (x + 3 * y + 9 * z) as f32 * 0.5 - c as f32);
    let expected = trainer.grid().clone();
    trainer.upload_grid().unwrap();

    trainer.grid_mut().clear();
    trainer.download_grid().unwrap();
    assert_eq!(trainer.grid(), &expected);
}

#[test]
fn test_packed_and_padded_layouts_agree() {
    let shape = GridShape::new(3, 2, 2);
    let packed: Vec<f32> = (0..shape.total() * 3).map(|i| i as f32).collect();
    let grid = SomGrid::from_neurons(shape, 3, &packed).unwrap();

    assert_eq!(grid.neuron_size_rounded(), 4);
    assert_eq!(grid.as_padded_slice().len(), shape.total() * 4);
    for (i, chunk) in grid.as_padded_slice().chunks_exact(4).enumerate() {
        assert_eq!(&chunk[..3], &packed[i * 3..i * 3 + 3]);
        assert_eq!(chunk[3], 0.0);
        let (x, y, z) = shape.coords(i);
        assert_eq!(grid.neuron(x, y, z), &packed[i * 3..i * 3 + 3]);
    }
}

#[test]
fn test_wrong_shape_rejected_on_upload() {
    let mut trainer = SomTrainer::new(SomConfig::planar(6, 4, 3), &CpuDevice::default()).unwrap();
    *trainer.grid_mut() = SomGrid::new(GridShape::new(4, 4, 1), 3).unwrap();
    assert!(trainer.upload_grid().is_err());
}

#[test]
fn test_same_stride_grid_with_other_features_rejected() {
    // 3 and 4 features share a stride of 4; the extra lane must never reach the device
    let mut trainer = SomTrainer::new(SomConfig::planar(2, 1, 3), &CpuDevice::default()).unwrap();
    let mut wider = SomGrid::new(GridShape::new(2, 1, 1), 4).unwrap();
    wider.set_neuron(0, 0, 0, &[1.0, 0.0, 0.0, 50.0]).unwrap();
    assert_eq!(wider.as_padded_slice().len(), trainer.grid().as_padded_slice().len());

    *trainer.grid_mut() = wider;
    assert!(matches!(
        trainer.upload_grid(),
        Err(SomError::ShapeMismatch { .. })
    ));

    *trainer.grid_mut() = SomGrid::new(GridShape::new(2, 1, 1), 3).unwrap();
    trainer.grid_mut().set_neuron(0, 0, 0, &[1.0, 0.0, 0.0]).unwrap();
    trainer.upload_grid().unwrap();
    let winner = trainer.find_winner(&[1.0, 0.0, 0.0]).unwrap();
    assert_eq!((winner.index, winner.distance), (0, 0.0));
}

#[test]
fn test_transposed_grid_rejected_on_upload() {
    let mut trainer = SomTrainer::new(SomConfig::planar(6, 4, 3), &CpuDevice::default()).unwrap();
    *trainer.grid_mut() = SomGrid::new(GridShape::new(4, 6, 1), 3).unwrap();
    assert!(matches!(
        trainer.upload_grid(),
        Err(SomError::ShapeMismatch { .. })
    ));
}

#[cfg(feature = "serde")]
#[test]
fn test_deserialized_padding_is_zeroed() {
    let mut grid = SomGrid::new(GridShape::new(2, 1, 1), 3).unwrap();
    grid.set_neuron(0, 0, 0, &[1.0, 0.0, 0.0]).unwrap();
    let mut value = serde_json::to_value(&grid).unwrap();
    value["data"][3] = serde_json::json!(50.0);

    let restored: SomGrid = serde_json::from_value(value.clone()).unwrap();
    assert_eq!(restored, grid);
    assert_eq!(restored.as_padded_slice()[3], 0.0);

    // truncated data is refused
    value["data"].as_array_mut().unwrap().pop();
    assert!(serde_json::from_value::<SomGrid>(value).is_err());
}

#[cfg(feature = "serde")]
#[test]
fn test_serde_roundtrip() {
    let source = trained();

    let json = serde_json::to_string(source.grid()).unwrap();
    let restored: SomGrid = serde_json::from_str(&json).unwrap();
    assert_eq!(&restored, source.grid());

    let config = SomConfig {
        kernel_flags: "-DWEIGHTING=CHEBYSHEV".to_string(),
        ..SomConfig::cube(5, 7)
    };
    let json = serde_json::to_string(&config).unwrap();
    let restored: SomConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.variant().unwrap(), config.variant().unwrap());
    assert_eq!(restored.total_size(), 125);
}
