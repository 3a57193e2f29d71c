use rayon::prelude::*;

use crate::error::AttentionError;
use crate::tensor::{Tensor, TensorElement};

#[cfg(test)]
mod transpose_test;

/// Transposes the trailing two axes of a `[batch, rows, cols]` tensor into
/// `[batch, cols, rows]`, independently per batch entry.
pub fn transpose_batched<T: TensorElement>(src: &Tensor<T>, dst: &Tensor<T>) -> Result<(), AttentionError> {
    let (sd, dd) = (src.dims(), dst.dims());
    if sd.len() != 3 || dd.len() != 3 || dd[0] != sd[0] || dd[1] != sd[2] || dd[2] != sd[1] {
        return Err(AttentionError::InvalidShape(format!(
            "transpose expects [b, r, c] -> [b, c, r], got {sd:?} -> {dd:?}"
        )));
    }
    if src.is_empty() {
        return Err(AttentionError::InvalidShape("transpose of empty tensor".to_string()));
    }
    let (rows, cols) = (sd[1], sd[2]);
    let plane = rows * cols;

    let src_guard = src.data();
    let s: &[T::Scalar] = &src_guard;
    let mut dst_guard = dst.data_mut();

    dst_guard.par_chunks_mut(plane).enumerate().for_each(|(b, out)| {
        let plane_in = &s[b * plane..(b + 1) * plane];
        for j in 0..cols {
            for i in 0..rows {
                out[j * rows + i] = plane_in[i * cols + j];
            }
        }
    });

    Ok(())
}

/// GEMM RHS packing: for each batch entry, packs every 4-column block of a
/// `[batch, k, n]` operand into one contiguous `4 * k` row, producing
/// `[batch, ceil(n/4), 4 * k]`. Tail columns are zero-padded.
pub fn transpose_1xw<T: TensorElement>(src: &Tensor<T>, dst: &Tensor<T>) -> Result<(), AttentionError> {
    let (sd, dd) = (src.dims(), dst.dims());
    if sd.len() != 3 || dd.len() != 3 {
        return Err(AttentionError::InvalidShape(format!(
            "transpose_1xw expects rank-3 operands, got {sd:?} -> {dd:?}"
        )));
    }
    let (batch, k, n) = (sd[0], sd[1], sd[2]);
    let n4 = n.div_ceil(4);
    if dd[0] != batch || dd[1] != n4 || dd[2] != 4 * k {
        return Err(AttentionError::InvalidShape(format!(
            "transpose_1xw destination {dd:?} does not match packing of {sd:?}"
        )));
    }
    if src.is_empty() {
        return Err(AttentionError::InvalidShape("transpose_1xw of empty tensor".to_string()));
    }

    let src_guard = src.data();
    let s: &[T::Scalar] = &src_guard;
    let mut dst_guard = dst.data_mut();
    let in_plane = k * n;
    let out_plane = n4 * 4 * k;
    let zero = T::from_f32(0.0);

    dst_guard.par_chunks_mut(out_plane).enumerate().for_each(|(b, out)| {
        let plane_in = &s[b * in_plane..(b + 1) * in_plane];
        for bj in 0..n4 {
            let block = &mut out[bj * 4 * k..(bj + 1) * 4 * k];
            for kk in 0..k {
                for c in 0..4 {
                    let col = bj * 4 + c;
                    block[kk * 4 + c] = if col < n { plane_in[kk * n + col] } else { zero };
                }
            }
        }
    });

    Ok(())
}
