use super::{transpose_1xw, transpose_batched};
use crate::error::AttentionError;
use crate::tensor::{F32Element, Tensor, TensorInit, TensorStorage};

fn host_tensor(dims: Vec<usize>, data: &[f32]) -> Tensor<F32Element> {
    Tensor::new(dims, TensorStorage::Host, TensorInit::CopyFrom(data)).expect("host tensor")
}

fn empty_tensor(dims: Vec<usize>) -> Tensor<F32Element> {
    Tensor::new(dims, TensorStorage::Host, TensorInit::Uninitialized).expect("host tensor")
}

#[test]
fn swaps_trailing_axes_per_batch_entry() {
    let src = host_tensor(vec![2, 2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    let dst = empty_tensor(vec![2, 3, 2]);
    transpose_batched(&src, &dst).expect("transpose");
    assert_eq!(
        dst.to_vec().unwrap(),
        vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0, 7.0, 10.0, 8.0, 11.0, 9.0, 12.0]
    );
}

#[test]
fn rejects_mismatched_transpose_dims() {
    let src = empty_tensor(vec![2, 2, 3]);
    let dst = empty_tensor(vec![2, 2, 3]);
    assert!(matches!(
        transpose_batched(&src, &dst),
        Err(AttentionError::InvalidShape(_))
    ));
}

#[test]
fn packs_column_blocks_into_contiguous_rows() {
    // [1, k=2, n=4]: one full 4-column block, no padding.
    let src = host_tensor(vec![1, 2, 4], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    let dst = empty_tensor(vec![1, 1, 8]);
    transpose_1xw(&src, &dst).expect("pack");
    // k=0 columns 0..4, then k=1 columns 0..4.
    assert_eq!(dst.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
}

#[test]
fn zero_pads_the_column_tail() {
    // n=5 leaves a 3-wide tail in the second block.
    let data: Vec<f32> = (1..=10).map(|v| v as f32).collect();
    let src = host_tensor(vec![1, 2, 5], &data);
    let dst = empty_tensor(vec![1, 2, 8]);
    transpose_1xw(&src, &dst).expect("pack");
    let got = dst.to_vec().unwrap();
    // First block: columns 0..4 of each k-row.
    assert_eq!(&got[..8], &[1.0, 2.0, 3.0, 4.0, 6.0, 7.0, 8.0, 9.0]);
    // Second block: column 4 then zero padding.
    assert_eq!(&got[8..], &[5.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0]);
}
