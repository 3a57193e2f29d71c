use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::device::CommandQueue;
use crate::error::AttentionError;

pub mod dtypes;

pub use dtypes::{Dtype, F16Element, F32Element, TensorElement, F16, F32};

/// The memory/compute domain a tensor resides in or a stage executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionDomain {
    Host,
    Device,
}

/// Shape/type contract for a tensor. Carries no storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub dims: Vec<usize>,
    pub dtype: Dtype,
}

impl TensorDescriptor {
    pub fn new(dims: Vec<usize>, dtype: Dtype) -> Self {
        Self { dims, dtype }
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len() * self.dtype.size_bytes()
    }
}

/// Where the backing buffer for a new tensor lives.
pub enum TensorStorage<'a> {
    Host,
    Device(&'a CommandQueue),
}

/// How a new tensor's buffer is initialized.
pub enum TensorInit<'a, T: TensorElement> {
    Uninitialized,
    CopyFrom(&'a [T::Scalar]),
}

/// A handle to a contiguous buffer plus its shape metadata.
///
/// Row-major, contiguous. Clones share the same buffer; `reshape` produces a
/// view with new dims over the same storage. Device-resident tensors carry the
/// command queue that owns their timeline, and host accessors synchronize with
/// that queue before touching bytes.
#[derive(Clone)]
pub struct Tensor<T: TensorElement> {
    buf: Arc<RwLock<Vec<T::Scalar>>>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    dtype: Dtype,
    domain: ExecutionDomain,
    queue: Option<CommandQueue>,
}

impl<T: TensorElement> Tensor<T> {
    pub fn new(dims: Vec<usize>, storage: TensorStorage<'_>, init: TensorInit<'_, T>) -> Result<Self, AttentionError> {
        let len = dims.iter().product::<usize>();
        let data = match init {
            TensorInit::Uninitialized => vec![T::Scalar::default(); len],
            TensorInit::CopyFrom(src) => {
                if src.len() != len {
                    return Err(AttentionError::DimensionMismatch {
                        expected: len,
                        actual: src.len(),
                    });
                }
                src.to_vec()
            }
        };
        let (domain, queue) = match storage {
            TensorStorage::Host => (ExecutionDomain::Host, None),
            TensorStorage::Device(q) => (ExecutionDomain::Device, Some(q.clone())),
        };
        let strides = Self::compute_strides(&dims);
        Ok(Self {
            buf: Arc::new(RwLock::new(data)),
            dims,
            strides,
            dtype: T::DTYPE,
            domain,
            queue,
        })
    }

    fn compute_strides(dims: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        strides
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn domain(&self) -> ExecutionDomain {
        self.domain
    }

    pub fn descriptor(&self) -> TensorDescriptor {
        TensorDescriptor::new(self.dims.clone(), self.dtype)
    }

    /// Reinterprets the tensor under new dims with no data movement.
    pub fn reshape(&self, dims: Vec<usize>) -> Result<Self, AttentionError> {
        let new_len = dims.iter().product::<usize>();
        if new_len != self.len() {
            return Err(AttentionError::InvalidShape(format!(
                "reshape from {:?} to {:?} changes element count",
                self.dims, dims
            )));
        }
        let strides = Self::compute_strides(&dims);
        Ok(Self {
            buf: Arc::clone(&self.buf),
            dims,
            strides,
            dtype: self.dtype,
            domain: self.domain,
            queue: self.queue.clone(),
        })
    }

    /// Waits for any outstanding device work touching this buffer.
    fn sync_defining_work(&self) -> Result<(), AttentionError> {
        if let Some(queue) = &self.queue {
            queue.finish()?;
        }
        Ok(())
    }

    /// Blocking read of the full buffer. For device-resident tensors this
    /// waits for all previously enqueued work on the owning queue first.
    pub fn to_vec(&self) -> Result<Vec<T::Scalar>, AttentionError> {
        self.sync_defining_work()?;
        Ok(self.data().clone())
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, AttentionError> {
        Ok(T::to_f32_vec(&self.to_vec()?))
    }

    /// Blocking write of the full buffer, synchronized against the owning
    /// queue for device-resident tensors.
    pub fn write_from(&self, src: &[T::Scalar]) -> Result<(), AttentionError> {
        if src.len() != self.len() {
            return Err(AttentionError::DimensionMismatch {
                expected: self.len(),
                actual: src.len(),
            });
        }
        self.sync_defining_work()?;
        self.data_mut().copy_from_slice(src);
        Ok(())
    }

    // Lock poisoning implies a panic inside a stage, which already aborts the
    // run; treat it as an invariant violation.
    pub(crate) fn data(&self) -> RwLockReadGuard<'_, Vec<T::Scalar>> {
        self.buf.read().expect("tensor buffer lock poisoned")
    }

    pub(crate) fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<T::Scalar>> {
        self.buf.write().expect("tensor buffer lock poisoned")
    }
}
