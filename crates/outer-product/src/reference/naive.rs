//! Reference loops over flattened host buffers.

use candle_core::{DType, Result, Tensor};

fn host(tensor: &Tensor) -> Result<Vec<f64>> {
    tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()
}

/// Unfloored pair counts `[batch, residue, residue]` as `f32`.
pub fn naive_pair_counts(mask: &Tensor) -> Result<Tensor> {
    let (batch, seq, residues) = mask.dims3()?;
    let m = host(mask)?;
    let mut counts = vec![0f32; batch * residues * residues];
    for b in 0..batch {
        for i in 0..residues {
            for j in 0..residues {
                let mut total = 0f64;
                for s in 0..seq {
                    let base = (b * seq + s) * residues;
                    total += m[base + i] * m[base + j];
                }
                counts[(b * residues + i) * residues + j] = total as f32;
            }
        }
    }
    Tensor::from_vec(counts, (batch, residues, residues), mask.device())
}

/// Masked outer-product mean `[batch, residue, residue, c * d]` as `f32`.
///
/// `left`/`right` need not be pre-masked; the mask is applied to both here.
pub fn naive_outer_product_mean(left: &Tensor, right: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch, seq, residues, left_dim) = left.dims4()?;
    let right_dim = right.dims4()?.3;
    let (a, r, m) = (host(left)?, host(right)?, host(mask)?);
    let pair_dim = left_dim * right_dim;
    let mut out = vec![0f32; batch * residues * residues * pair_dim];

    for b in 0..batch {
        for i in 0..residues {
            for j in 0..residues {
                let mut count = 0f64;
                for s in 0..seq {
                    let base = (b * seq + s) * residues;
                    count += m[base + i] * m[base + j];
                }
                let divisor = count.max(1.0);
                let row = ((b * residues + i) * residues + j) * pair_dim;
                for c in 0..left_dim {
                    for d in 0..right_dim {
                        let mut total = 0f64;
                        for s in 0..seq {
                            let base = (b * seq + s) * residues;
                            let lhs = a[(base + i) * left_dim + c] * m[base + i];
                            let rhs = r[(base + j) * right_dim + d] * m[base + j];
                            total += lhs * rhs;
                        }
                        out[row + c * right_dim + d] = (total / divisor) as f32;
                    }
                }
            }
        }
    }

    Tensor::from_vec(out, (batch, residues, residues, pair_dim), left.device())
}

/// Outer-product mean followed by `z · weightᵀ + bias`, shaped `[batch, N, N, c_out]`.
pub fn naive_outer_product_forward(
    left: &Tensor,
    right: &Tensor,
    mask: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
) -> Result<Tensor> {
    let averaged = naive_outer_product_mean(left, right, mask)?;
    let (batch, residues, _, pair_dim) = averaged.dims4()?;
    let (output_dim, weight_in) = weight.dims2()?;
    if weight_in != pair_dim {
        candle_core::bail!("weight expects {weight_in} inputs, pair features have {pair_dim}");
    }
    let z = host(&averaged)?;
    let w = host(weight)?;
    let bias = match bias {
        Some(bias) => host(bias)?,
        None => vec![0f64; output_dim],
    };

    let rows = batch * residues * residues;
    let mut out = vec![0f32; rows * output_dim];
    for row in 0..rows {
        for o in 0..output_dim {
            let mut total = bias[o];
            for k in 0..pair_dim {
                total += z[row * pair_dim + k] * w[o * pair_dim + k];
            }
            out[row * output_dim + o] = total as f32;
        }
    }
    Tensor::from_vec(out, (batch, residues, residues, output_dim), left.device())
}
