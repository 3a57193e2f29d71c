use thiserror::Error;

use crate::attention::AuxSlotId;
use crate::tensor::Dtype;

#[derive(Error, Debug, Clone)]
pub enum AttentionError {
    #[error("Head count {heads} does not evenly divide embedding width {d_model}")]
    HeadCountMismatch { d_model: usize, heads: usize },
    #[error("Dimension mismatch: expected {expected}, actual {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    #[error("Tensor dtype mismatch: expected {expected:?}, got {actual:?}")]
    DtypeMismatch { expected: Dtype, actual: Dtype },
    #[error("Operator is not configured")]
    NotConfigured,
    #[error("Operator is already configured; reconfiguration requires a new instance")]
    AlreadyConfigured,
    #[error("Missing binding for role `{0}`")]
    MissingBinding(&'static str),
    #[error("Missing aux tensor binding for slot {0:?}")]
    MissingAuxSlot(AuxSlotId),
    #[error("Tensor bound to slot {slot:?} resides in the wrong execution domain")]
    DomainMismatch { slot: AuxSlotId },
    #[error("Tensor bound to role `{role}` resides in the wrong execution domain for this pipeline")]
    RoleDomainMismatch { role: &'static str },
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Scheduler construction failed: {0}")]
    Scheduler(String),
    #[error("Command queue worker has shut down")]
    QueueShutDown,
}
