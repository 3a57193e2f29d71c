use rayon::prelude::*;

use crate::error::AttentionError;
use crate::tensor::{Tensor, TensorElement};


/// Element-wise additive mask fuse: `dst[h] = scores[h] + mask`, broadcasting
/// a `[seq_q, seq_k]` mask plane across the head axis of `[h, seq_q, seq_k]`
/// scores.
pub fn add_mask<T: TensorElement>(
    scores: &Tensor<T>,
    mask: &[T::Scalar],
    dst: &Tensor<T>,
) -> Result<(), AttentionError> {
    let (sd, dd) = (scores.dims(), dst.dims());
    if sd.len() != 3 || sd != dd {
        return Err(AttentionError::InvalidShape(format!(
            "mask add expects matching rank-3 operands, got {sd:?} -> {dd:?}"
        )));
    }
    let plane = sd[1] * sd[2];
    if mask.len() != plane {
        return Err(AttentionError::DimensionMismatch {
            expected: plane,
            actual: mask.len(),
        });
    }
    if scores.is_empty() {
        return Err(AttentionError::InvalidShape("mask add of empty tensor".to_string()));
    }

    let src_guard = scores.data();
    let s: &[T::Scalar] = &src_guard;
    let mut dst_guard = dst.data_mut();

    dst_guard.par_chunks_mut(plane).enumerate().for_each(|(h, out)| {
        let plane_in = &s[h * plane..(h + 1) * plane];
        for (idx, slot) in out.iter_mut().enumerate() {
            *slot = T::from_f32(T::to_f32(plane_in[idx]) + T::to_f32(mask[idx]));
        }
    });

    Ok(())
}
