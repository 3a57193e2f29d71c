use super::interleave4x4;
use crate::error::AttentionError;
use crate::tensor::{F32Element, Tensor, TensorInit, TensorStorage};

fn host_tensor(dims: Vec<usize>, data: &[f32]) -> Tensor<F32Element> {
    Tensor::new(dims, TensorStorage::Host, TensorInit::CopyFrom(data)).expect("host tensor")
}

fn empty_tensor(dims: Vec<usize>) -> Tensor<F32Element> {
    Tensor::new(dims, TensorStorage::Host, TensorInit::Uninitialized).expect("host tensor")
}

#[test]
fn interleaves_full_row_blocks_column_major() {
    // [1, m=4, k=2]: rows (1,2), (3,4), (5,6), (7,8).
    let src = host_tensor(vec![1, 4, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    let dst = empty_tensor(vec![1, 1, 8]);
    interleave4x4(&src, &dst).expect("interleave");
    // Column 0 of rows 0..4, then column 1 of rows 0..4.
    assert_eq!(dst.to_vec().unwrap(), vec![1.0, 3.0, 5.0, 7.0, 2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn zero_pads_the_row_tail() {
    // m=5 leaves a single-row tail in the second block.
    let data: Vec<f32> = (1..=10).map(|v| v as f32).collect();
    let src = host_tensor(vec![1, 5, 2], &data);
    let dst = empty_tensor(vec![1, 2, 8]);
    interleave4x4(&src, &dst).expect("interleave");
    let got = dst.to_vec().unwrap();
    assert_eq!(&got[..8], &[1.0, 3.0, 5.0, 7.0, 2.0, 4.0, 6.0, 8.0]);
    assert_eq!(&got[8..], &[9.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0]);
}

#[test]
fn rejects_a_destination_that_does_not_match_the_packing() {
    let src = empty_tensor(vec![1, 4, 2]);
    let dst = empty_tensor(vec![1, 2, 8]);
    assert!(matches!(
        interleave4x4(&src, &dst),
        Err(AttentionError::InvalidShape(_))
    ));
}
