use rayon::prelude::*;

use crate::error::AttentionError;
use crate::tensor::{Tensor, TensorElement};


/// Blocked matrix-multiply leaf over packed operands, batched over the
/// leading axis: `dst[b] = alpha * (A[b] @ B[b])` with `A` interleaved by
/// [`interleave4x4`](crate::kernels::interleave::interleave4x4) and `B`
/// packed by [`transpose_1xw`](crate::kernels::transpose::transpose_1xw).
///
/// `m`/`n`/`k` are the logical GEMM extents before packing. The k-loop runs
/// in ascending order inside each 4x4 micro-tile, so the accumulated f32
/// result is bit-identical to an unpacked row-by-column multiply.
pub fn gemm_packed<T: TensorElement>(
    lhs: &Tensor<T>,
    rhs: &Tensor<T>,
    dst: &Tensor<T>,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
) -> Result<(), AttentionError> {
    let (ld, rd, dd) = (lhs.dims(), rhs.dims(), dst.dims());
    if dd.len() != 3 {
        return Err(AttentionError::InvalidShape(format!("gemm destination must be rank 3, got {dd:?}")));
    }
    let batch = dd[0];
    let m4 = m.div_ceil(4);
    let n4 = n.div_ceil(4);
    if *ld != [batch, m4, 4 * k] {
        return Err(AttentionError::InvalidShape(format!(
            "gemm packed lhs {ld:?} does not match m={m} k={k} batch={batch}"
        )));
    }
    if *rd != [batch, n4, 4 * k] {
        return Err(AttentionError::InvalidShape(format!(
            "gemm packed rhs {rd:?} does not match n={n} k={k} batch={batch}"
        )));
    }
    if dd[1] != m || dd[2] != n {
        return Err(AttentionError::InvalidShape(format!(
            "gemm destination {dd:?} does not match m={m} n={n}"
        )));
    }
    if dst.is_empty() || k == 0 {
        return Err(AttentionError::InvalidShape("gemm over empty operands".to_string()));
    }

    let lhs_guard = lhs.data();
    let rhs_guard = rhs.data();
    let a: &[T::Scalar] = &lhs_guard;
    let b: &[T::Scalar] = &rhs_guard;
    let mut dst_guard = dst.data_mut();

    let a_plane = m4 * 4 * k;
    let b_plane = n4 * 4 * k;

    dst_guard.par_chunks_mut(m * n).enumerate().for_each(|(batch_idx, c)| {
        let a_h = &a[batch_idx * a_plane..(batch_idx + 1) * a_plane];
        let b_h = &b[batch_idx * b_plane..(batch_idx + 1) * b_plane];
        for bi in 0..m4 {
            let a_blk = &a_h[bi * 4 * k..(bi + 1) * 4 * k];
            for bj in 0..n4 {
                let b_blk = &b_h[bj * 4 * k..(bj + 1) * 4 * k];
                let mut acc = [[0f32; 4]; 4];
                for kk in 0..k {
                    let a4 = &a_blk[kk * 4..kk * 4 + 4];
                    let b4 = &b_blk[kk * 4..kk * 4 + 4];
                    for (r, &av) in a4.iter().enumerate() {
                        let av = T::to_f32(av);
                        for (cc, &bv) in b4.iter().enumerate() {
                            acc[r][cc] += av * T::to_f32(bv);
                        }
                    }
                }
                for (r, acc_row) in acc.iter().enumerate() {
                    let i = bi * 4 + r;
                    if i >= m {
                        break;
                    }
                    for (cc, &sum) in acc_row.iter().enumerate() {
                        let j = bj * 4 + cc;
                        if j >= n {
                            continue;
                        }
                        c[i * n + j] = T::from_f32(alpha * sum);
                    }
                }
            }
        }
    });

    Ok(())
}
