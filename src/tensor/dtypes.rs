use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// Defines the element type for a tensor.
pub trait TensorElement: Clone + Copy + Default + Send + Sync + 'static {
    type Scalar: Clone + Copy + Debug + Default + PartialOrd + PartialEq + Send + Sync + 'static;
    const DTYPE: Dtype;

    fn from_f32(v: f32) -> Self::Scalar;
    fn to_f32(v: Self::Scalar) -> f32;
    fn to_f32_vec(slice: &[Self::Scalar]) -> Vec<f32>;
    fn from_f32_slice(slice: &[f32]) -> Vec<Self::Scalar>;
}

/// Represents the data type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum Dtype {
    F32,
    F16,
}

impl Dtype {
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::F32 => std::mem::size_of::<f32>(),
            Dtype::F16 => std::mem::size_of::<half::f16>(),
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct F32;

impl TensorElement for F32 {
    type Scalar = f32;
    const DTYPE: Dtype = Dtype::F32;

    #[inline]
    fn from_f32(v: f32) -> Self::Scalar {
        v
    }

    #[inline]
    fn to_f32(v: Self::Scalar) -> f32 {
        v
    }

    fn to_f32_vec(slice: &[Self::Scalar]) -> Vec<f32> {
        slice.to_vec()
    }

    fn from_f32_slice(slice: &[f32]) -> Vec<Self::Scalar> {
        slice.to_vec()
    }
}

#[derive(Clone, Copy, Default)]
pub struct F16;

impl TensorElement for F16 {
    type Scalar = half::f16;
    const DTYPE: Dtype = Dtype::F16;

    #[inline]
    fn from_f32(v: f32) -> Self::Scalar {
        half::f16::from_f32(v)
    }

    #[inline]
    fn to_f32(v: Self::Scalar) -> f32 {
        v.to_f32()
    }

    fn to_f32_vec(slice: &[Self::Scalar]) -> Vec<f32> {
        slice.iter().map(|v| v.to_f32()).collect()
    }

    fn from_f32_slice(slice: &[f32]) -> Vec<Self::Scalar> {
        slice.iter().map(|&v| half::f16::from_f32(v)).collect()
    }
}

// Common aliases.
pub type F32Element = F32;
pub type F16Element = F16;
