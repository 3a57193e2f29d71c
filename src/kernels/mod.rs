pub mod add;
pub mod gemm;
pub mod interleave;
pub mod permute;
pub mod softmax;
pub mod transpose;
