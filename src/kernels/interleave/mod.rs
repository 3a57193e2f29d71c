use rayon::prelude::*;

use crate::error::AttentionError;
use crate::tensor::{Tensor, TensorElement};

#[cfg(test)]
mod interleave_test;

/// GEMM LHS packing: interleaves each 4-row block of a `[batch, m, k]`
/// operand column-major within the block, producing `[batch, ceil(m/4), 4 * k]`
/// where packed row `b` holds `a[4b..4b+4, 0], a[4b..4b+4, 1], ...`. Tail
/// rows are zero-padded so the multiply leaf can assume full 4-row tiles.
pub fn interleave4x4<T: TensorElement>(src: &Tensor<T>, dst: &Tensor<T>) -> Result<(), AttentionError> {
    let (sd, dd) = (src.dims(), dst.dims());
    if sd.len() != 3 || dd.len() != 3 {
        return Err(AttentionError::InvalidShape(format!(
            "interleave4x4 expects rank-3 operands, got {sd:?} -> {dd:?}"
        )));
    }
    let (batch, m, k) = (sd[0], sd[1], sd[2]);
    let m4 = m.div_ceil(4);
    if dd[0] != batch || dd[1] != m4 || dd[2] != 4 * k {
        return Err(AttentionError::InvalidShape(format!(
            "interleave4x4 destination {dd:?} does not match packing of {sd:?}"
        )));
    }
    if src.is_empty() {
        return Err(AttentionError::InvalidShape("interleave4x4 of empty tensor".to_string()));
    }

    let src_guard = src.data();
    let s: &[T::Scalar] = &src_guard;
    let mut dst_guard = dst.data_mut();
    let in_plane = m * k;
    let out_plane = m4 * 4 * k;
    let zero = T::from_f32(0.0);

    dst_guard.par_chunks_mut(out_plane).enumerate().for_each(|(b, out)| {
        let plane_in = &s[b * in_plane..(b + 1) * in_plane];
        for bi in 0..m4 {
            let block = &mut out[bi * 4 * k..(bi + 1) * 4 * k];
            for kk in 0..k {
                for r in 0..4 {
                    let row = bi * 4 + r;
                    block[kk * 4 + r] = if row < m { plane_in[row * k + kk] } else { zero };
                }
            }
        }
    });

    Ok(())
}
