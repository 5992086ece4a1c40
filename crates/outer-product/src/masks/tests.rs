use super::*;
use candle_core::{Device, Result as CandleResult};
use layers::PrecisionPolicy;

fn features(device: &Device, batch: usize, seq: usize, residues: usize) -> CandleResult<Tensor> {
    Tensor::zeros((batch, seq, residues, 3), DType::F32, device)
}

fn counts_as_rows(counts: &Tensor) -> CandleResult<Vec<Vec<f32>>> {
    counts.squeeze(0)?.to_vec2::<f32>()
}

#[test]
fn counts_follow_joint_validity() -> Result<()> {
    let device = Device::Cpu;
    // seq 0: residue 1 invalid; seq 1: both valid.
    let mask = Tensor::from_vec(vec![1f32, 0., 1., 1.], (1, 2, 2), &device)?;
    let counts = pair_counts(&mask, DType::F32)?;
    assert_eq!(counts.dims(), &[1, 2, 2]);
    assert_eq!(counts_as_rows(&counts)?, vec![vec![2., 1.], vec![1., 1.]]);
    Ok(())
}

#[test]
fn full_mask_counts_every_sequence() -> Result<()> {
    let device = Device::Cpu;
    let (batch, seq, residues) = (2, 5, 3);
    let mask = Tensor::ones((batch, seq, residues), DType::U8, &device)?;
    let divisor = pair_divisor(&pair_counts(&mask, DType::F32)?)?;
    let values = divisor.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values.len(), batch * residues * residues);
    assert!(values.iter().all(|&v| v == seq as f32));
    Ok(())
}

#[test]
fn empty_mask_divisor_is_floored_at_one() -> Result<()> {
    let device = Device::Cpu;
    let mask = Tensor::zeros((1, 4, 3), DType::F32, &device)?;
    let counts = pair_counts(&mask, DType::F32)?;
    assert_eq!(counts.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);
    let divisor = pair_divisor(&counts)?;
    let values = divisor.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|&v| v == 1.0));
    Ok(())
}

#[test]
fn counts_are_symmetric() -> Result<()> {
    let device = Device::Cpu;
    let data = vec![1f32, 0., 1., 1., 0., 1., 1., 1., 0., 0., 1., 1.];
    let mask = Tensor::from_vec(data, (1, 3, 4), &device)?;
    let counts = pair_counts(&mask, DType::F32)?;
    let transposed = counts.transpose(1, 2)?.contiguous()?;
    let diff = counts.sub(&transposed)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}

#[test]
fn pair_mask_shapes_and_dtypes() -> Result<()> {
    let device = Device::Cpu;
    let feats = features(&device, 2, 3, 4)?.to_dtype(DType::BF16)?;
    let mask = Tensor::ones((2, 3, 4), DType::U8, &device)?;
    let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
    let pair = PairMask::new(&mask, &feats, &policy)?;
    assert_eq!(pair.sequence().dims(), &[2, 3, 4, 1]);
    assert_eq!(pair.sequence().dtype(), DType::BF16);
    assert_eq!(pair.divisor().dims(), &[2, 4, 4, 1]);
    assert_eq!(pair.divisor().dtype(), DType::F32);
    Ok(())
}

#[test]
fn mismatched_mask_is_rejected() -> Result<()> {
    let device = Device::Cpu;
    let feats = features(&device, 1, 2, 3)?;
    for dims in [vec![1, 3, 2], vec![1, 2], vec![1, 2, 3, 1], vec![2, 2, 3]] {
        let mask = Tensor::ones(dims, DType::F32, &device)?;
        let err = validate_mask(&mask, &feats).unwrap_err();
        assert!(matches!(err, OuterProductError::InvalidShape { .. }));
    }
    Ok(())
}

#[test]
fn features_must_be_rank_four() -> Result<()> {
    let device = Device::Cpu;
    let feats = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
    let mask = Tensor::ones((2, 3, 4), DType::F32, &device)?;
    assert!(validate_mask(&mask, &feats).is_err());
    Ok(())
}
