use rayon::prelude::*;

use crate::error::AttentionError;
use crate::tensor::{Tensor, TensorElement};


/// Physically reorders axes of `src` into `dst` according to `perm`:
/// output axis `d` takes its extent and data from input axis `perm[d]`.
///
/// Applying the inverse permutation restores the input bit-for-bit on all
/// supported element types; the pipeline relies on this for head merge.
pub fn permute<T: TensorElement>(src: &Tensor<T>, dst: &Tensor<T>, perm: &[usize]) -> Result<(), AttentionError> {
    let rank = src.dims().len();
    if perm.len() != rank {
        return Err(AttentionError::InvalidShape(format!(
            "permutation length {} does not match tensor rank {}",
            perm.len(),
            rank
        )));
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p >= rank || seen[p] {
            return Err(AttentionError::InvalidShape(format!(
                "invalid permutation vector {perm:?} for rank {rank}"
            )));
        }
        seen[p] = true;
    }
    for d in 0..rank {
        if dst.dims()[d] != src.dims()[perm[d]] {
            return Err(AttentionError::InvalidShape(format!(
                "permute destination dims {:?} do not match {:?} permuted by {perm:?}",
                dst.dims(),
                src.dims()
            )));
        }
    }
    if src.len() != dst.len() || src.is_empty() {
        return Err(AttentionError::DimensionMismatch {
            expected: src.len(),
            actual: dst.len(),
        });
    }

    let dst_dims = dst.dims().to_vec();
    let src_strides = src.strides().to_vec();
    let perm = perm.to_vec();

    let src_guard = src.data();
    let s: &[T::Scalar] = &src_guard;
    let mut dst_guard = dst.data_mut();
    let chunk = dst.len() / dst_dims[0];

    dst_guard.par_chunks_mut(chunk).enumerate().for_each(|(i0, out)| {
        for (r, slot) in out.iter_mut().enumerate() {
            let mut lin = i0 * chunk + r;
            let mut src_idx = 0;
            for ax in (0..dst_dims.len()).rev() {
                let c = lin % dst_dims[ax];
                lin /= dst_dims[ax];
                src_idx += c * src_strides[perm[ax]];
            }
            *slot = s[src_idx];
        }
    });

    Ok(())
}
