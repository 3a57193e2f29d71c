pub use attention::{
    AttentionConfig, AuxSlotId, AuxTensorSlot, MemoryLifetime, ScaledDotProductAttention, TensorBindingSet,
};
pub use device::CommandQueue;
pub use error::AttentionError;
pub use executor::{DeviceExecutor, HostExecutor, StageExecutor, StageTask};
pub use tensor::{
    Dtype, ExecutionDomain, F16Element, F32Element, Tensor, TensorDescriptor, TensorElement, TensorInit, TensorStorage,
};

pub mod attention;
pub mod device;
pub mod error;
pub mod executor;
pub mod kernels;
pub mod tensor;
