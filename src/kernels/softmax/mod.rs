use rayon::prelude::*;

use crate::error::AttentionError;
use crate::tensor::{Tensor, TensorElement};


/// Row-wise softmax along the trailing axis of a `[h, rows, cols]` tensor,
/// independently per (head, row) pair.
///
/// The max-subtraction is mandatory: a score masked to -1e9 must underflow to
/// a weight of exactly 0.0 rather than overflow the exponential.
pub fn softmax_rows<T: TensorElement>(src: &Tensor<T>, dst: &Tensor<T>) -> Result<(), AttentionError> {
    let (sd, dd) = (src.dims(), dst.dims());
    if sd.len() != 3 || sd != dd {
        return Err(AttentionError::InvalidShape(format!(
            "softmax expects matching rank-3 operands, got {sd:?} -> {dd:?}"
        )));
    }
    if src.is_empty() {
        return Err(AttentionError::InvalidShape("softmax of empty tensor".to_string()));
    }
    let cols = sd[2];

    let src_guard = src.data();
    let s: &[T::Scalar] = &src_guard;
    let mut dst_guard = dst.data_mut();

    dst_guard.par_chunks_mut(cols).enumerate().for_each(|(row, out)| {
        let row_in = &s[row * cols..(row + 1) * cols];
        let mut max = f32::NEG_INFINITY;
        for &v in row_in {
            max = max.max(T::to_f32(v));
        }
        let mut denom = 0f32;
        for &v in row_in {
            denom += (T::to_f32(v) - max).exp();
        }
        for (slot, &v) in out.iter_mut().zip(row_in.iter()) {
            *slot = T::from_f32((T::to_f32(v) - max).exp() / denom);
        }
    });

    Ok(())
}
