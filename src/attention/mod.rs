use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::AttentionError;
use crate::executor::StageExecutor;
use crate::kernels;
use crate::tensor::{ExecutionDomain, Tensor, TensorDescriptor, TensorElement};

pub(crate) mod mask;
pub(crate) mod plan;

#[cfg(test)]
mod attention_test;

use mask::MaskCache;
use plan::ShapePlan;

/// Static configuration of one attention operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Total embedding width of Q/K/V before head splitting.
    pub d_model: usize,
    /// Number of attention heads; must evenly divide `d_model`.
    pub heads: usize,
    /// Whether a query position may only attend to itself and earlier keys.
    pub causal_mask: bool,
}

/// How long an aux slot's contents must survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryLifetime {
    /// May be freed or reused between successive runs of the same operator.
    Temporary,
    /// Must retain its contents across runs.
    Persistent,
}

/// Identifies one scratch tensor of the pipeline. The discriminant doubles as
/// an index into caller-managed slot storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum AuxSlotId {
    // Host staging buffers for device-resident operands; declared only for
    // host-domain executors.
    QueryStage,
    KeyStage,
    ValueStage,
    OutputStage,
    // Per-head intermediates.
    QueryHeads,
    KeyHeads,
    KeyTransposed,
    ValueHeads,
    Scores,
    MaskedScores,
    Softmaxed,
    Context,
    ContextHeads,
    // Packed GEMM operands, kept alive across runs.
    PackedQuery,
    PackedKey,
    PackedScores,
    PackedValue,
}

impl AuxSlotId {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One scratch buffer requirement, published at configure time so an external
/// allocator can size and bind storage before the first run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxTensorSlot {
    pub id: AuxSlotId,
    pub desc: TensorDescriptor,
    pub lifetime: MemoryLifetime,
}

/// Per-invocation mapping from logical role (query/key/value/output plus each
/// aux slot id) to a concrete tensor. Built fresh per call, never persisted.
pub struct TensorBindingSet<T: TensorElement> {
    query: Option<Tensor<T>>,
    key: Option<Tensor<T>>,
    value: Option<Tensor<T>>,
    output: Option<Tensor<T>>,
    aux: FxHashMap<AuxSlotId, Tensor<T>>,
}

impl<T: TensorElement> Default for TensorBindingSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TensorElement> TensorBindingSet<T> {
    pub fn new() -> Self {
        Self {
            query: None,
            key: None,
            value: None,
            output: None,
            aux: FxHashMap::default(),
        }
    }

    pub fn bind_query(&mut self, tensor: Tensor<T>) -> &mut Self {
        self.query = Some(tensor);
        self
    }

    pub fn bind_key(&mut self, tensor: Tensor<T>) -> &mut Self {
        self.key = Some(tensor);
        self
    }

    pub fn bind_value(&mut self, tensor: Tensor<T>) -> &mut Self {
        self.value = Some(tensor);
        self
    }

    pub fn bind_output(&mut self, tensor: Tensor<T>) -> &mut Self {
        self.output = Some(tensor);
        self
    }

    pub fn bind_aux(&mut self, id: AuxSlotId, tensor: Tensor<T>) -> &mut Self {
        self.aux.insert(id, tensor);
        self
    }

    fn role(&self, name: &'static str) -> Result<&Tensor<T>, AttentionError> {
        let slot = match name {
            "query" => &self.query,
            "key" => &self.key,
            "value" => &self.value,
            "output" => &self.output,
            _ => &None,
        };
        slot.as_ref().ok_or(AttentionError::MissingBinding(name))
    }

    fn aux(&self, id: AuxSlotId) -> Result<&Tensor<T>, AttentionError> {
        self.aux.get(&id).ok_or(AttentionError::MissingAuxSlot(id))
    }
}

struct ConfiguredState<T: TensorElement> {
    config: AttentionConfig,
    plan: ShapePlan,
    slots: Vec<AuxTensorSlot>,
    mask_cache: MaskCache<T>,
}

/// Multi-head scaled dot-product attention operator.
///
/// Lifecycle: `new` -> `configure` (freezes the shape plan and aux slot
/// registry) -> any number of `run` calls. Reconfiguration requires a new
/// instance. The pipeline never allocates storage at run time; every scratch
/// tensor is looked up from the caller-supplied binding set by slot id.
pub struct ScaledDotProductAttention<T: TensorElement> {
    executor: Arc<dyn StageExecutor>,
    configured: Option<ConfiguredState<T>>,
}

fn check_role<T: TensorElement>(
    tensor: &Tensor<T>,
    desc: &TensorDescriptor,
    name: &'static str,
) -> Result<(), AttentionError> {
    if tensor.dims() != desc.dims.as_slice() {
        return Err(AttentionError::InvalidShape(format!(
            "`{name}` binding has dims {:?}, configured as {:?}",
            tensor.dims(),
            desc.dims
        )));
    }
    if tensor.dtype() != desc.dtype {
        return Err(AttentionError::DtypeMismatch {
            expected: desc.dtype,
            actual: tensor.dtype(),
        });
    }
    Ok(())
}

fn fetch_aux<T: TensorElement>(
    pack: &TensorBindingSet<T>,
    id: AuxSlotId,
    desc: &TensorDescriptor,
    domain: ExecutionDomain,
) -> Result<Tensor<T>, AttentionError> {
    let tensor = pack.aux(id)?;
    if tensor.dims() != desc.dims.as_slice() {
        return Err(AttentionError::InvalidShape(format!(
            "aux slot {id:?} bound with dims {:?}, configured as {:?}",
            tensor.dims(),
            desc.dims
        )));
    }
    if tensor.dtype() != desc.dtype {
        return Err(AttentionError::DtypeMismatch {
            expected: desc.dtype,
            actual: tensor.dtype(),
        });
    }
    if tensor.domain() != domain {
        return Err(AttentionError::DomainMismatch { slot: id });
    }
    Ok(tensor.clone())
}

impl<T: TensorElement> ScaledDotProductAttention<T> {
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        Self {
            executor,
            configured: None,
        }
    }

    /// Derives the shape plan and the aux-memory registry. Fails on
    /// incompatible shapes; a failed configure leaves the operator unusable.
    pub fn configure(
        &mut self,
        query: &TensorDescriptor,
        key: &TensorDescriptor,
        value: &TensorDescriptor,
        output: &TensorDescriptor,
        config: AttentionConfig,
    ) -> Result<Vec<AuxTensorSlot>, AttentionError> {
        if self.configured.is_some() {
            return Err(AttentionError::AlreadyConfigured);
        }
        let plan = plan::plan(query, key, value, output, &config)?;

        let mut slots = Vec::new();
        let mut slot = |id: AuxSlotId, desc: &TensorDescriptor, lifetime: MemoryLifetime| {
            slots.push(AuxTensorSlot {
                id,
                desc: desc.clone(),
                lifetime,
            });
        };
        use MemoryLifetime::{Persistent, Temporary};
        if self.executor.domain() == ExecutionDomain::Host {
            slot(AuxSlotId::QueryStage, &plan.query, Temporary);
            slot(AuxSlotId::KeyStage, &plan.key, Temporary);
            slot(AuxSlotId::ValueStage, &plan.value, Temporary);
            slot(AuxSlotId::OutputStage, &plan.output, Temporary);
        }
        slot(AuxSlotId::QueryHeads, &plan.query_heads, Temporary);
        slot(AuxSlotId::KeyHeads, &plan.key_heads, Temporary);
        slot(AuxSlotId::KeyTransposed, &plan.key_transposed, Temporary);
        slot(AuxSlotId::ValueHeads, &plan.value_heads, Temporary);
        slot(AuxSlotId::Scores, &plan.scores, Temporary);
        if config.causal_mask {
            slot(AuxSlotId::MaskedScores, &plan.masked_scores, Temporary);
        }
        slot(AuxSlotId::Softmaxed, &plan.softmaxed, Temporary);
        slot(AuxSlotId::Context, &plan.context, Temporary);
        slot(AuxSlotId::ContextHeads, &plan.context_heads, Temporary);
        slot(AuxSlotId::PackedQuery, &plan.packed_query, Persistent);
        slot(AuxSlotId::PackedKey, &plan.packed_key, Persistent);
        slot(AuxSlotId::PackedScores, &plan.packed_scores, Persistent);
        slot(AuxSlotId::PackedValue, &plan.packed_value, Persistent);

        let mut mask_cache = MaskCache::new();
        if config.causal_mask {
            // Warm the cache here so run() never allocates.
            mask_cache.get_or_build(plan.seq_q);
        }

        debug!(
            d_model = config.d_model,
            heads = config.heads,
            causal = config.causal_mask,
            aux_slots = slots.len(),
            "configured scaled dot-product attention"
        );
        self.configured = Some(ConfiguredState {
            config,
            plan,
            slots: slots.clone(),
            mask_cache,
        });
        Ok(slots)
    }

    /// The complete aux-memory registry. Idempotent after `configure`.
    pub fn workspace(&self) -> Result<&[AuxTensorSlot], AttentionError> {
        self.configured
            .as_ref()
            .map(|state| state.slots.as_slice())
            .ok_or(AttentionError::NotConfigured)
    }

    /// Executes one attention invocation against the caller's binding set.
    ///
    /// On a host executor, stages run to completion in pipeline order and the
    /// call returns with the output written. On a device executor, stages are
    /// enqueued in order and the call returns immediately; observe the result
    /// through `StageExecutor::synchronize` or a blocking tensor read. Device
    /// pipelines require every role tensor to be device-resident; host
    /// pipelines stage device-resident roles through the `*Stage` slots.
    pub fn run(&mut self, pack: &TensorBindingSet<T>) -> Result<(), AttentionError> {
        let executor = Arc::clone(&self.executor);
        let state = self.configured.as_mut().ok_or(AttentionError::NotConfigured)?;
        let plan = state.plan.clone();
        let causal = state.config.causal_mask;
        let domain = executor.domain();
        let host = domain == ExecutionDomain::Host;

        let query = pack.role("query")?;
        let key = pack.role("key")?;
        let value = pack.role("value")?;
        let output = pack.role("output")?;
        check_role(query, &plan.query, "query")?;
        check_role(key, &plan.key, "key")?;
        check_role(value, &plan.value, "value")?;
        check_role(output, &plan.output, "output")?;
        if !host {
            // The device pipeline writes asynchronously; a host-resident role
            // has no owning queue, so a blocking read of it could observe
            // stale bytes. Only the host pipeline stages across domains.
            for (tensor, role) in [(query, "query"), (key, "key"), (value, "value"), (output, "output")] {
                if tensor.domain() != ExecutionDomain::Device {
                    return Err(AttentionError::RoleDomainMismatch { role });
                }
            }
        }

        // Device-staging adapter: on the host pipeline, device-resident
        // operands are read synchronously into host scratch before any
        // head-split work begins. The device pipeline never stages.
        let stage_in = |tensor: &Tensor<T>, id: AuxSlotId, desc: &TensorDescriptor| -> Result<Tensor<T>, AttentionError> {
            if host && tensor.domain() == ExecutionDomain::Device {
                trace!(slot = ?id, "staging device tensor to host");
                let staged = fetch_aux(pack, id, desc, domain)?;
                staged.write_from(&tensor.to_vec()?)?;
                Ok(staged)
            } else {
                Ok(tensor.clone())
            }
        };
        let q_in = stage_in(query, AuxSlotId::QueryStage, &plan.query)?;
        let k_in = stage_in(key, AuxSlotId::KeyStage, &plan.key)?;
        let v_in = stage_in(value, AuxSlotId::ValueStage, &plan.value)?;

        let query_heads = fetch_aux(pack, AuxSlotId::QueryHeads, &plan.query_heads, domain)?;
        let key_heads = fetch_aux(pack, AuxSlotId::KeyHeads, &plan.key_heads, domain)?;
        let key_transposed = fetch_aux(pack, AuxSlotId::KeyTransposed, &plan.key_transposed, domain)?;
        let value_heads = fetch_aux(pack, AuxSlotId::ValueHeads, &plan.value_heads, domain)?;
        let scores = fetch_aux(pack, AuxSlotId::Scores, &plan.scores, domain)?;
        let softmaxed = fetch_aux(pack, AuxSlotId::Softmaxed, &plan.softmaxed, domain)?;
        let context = fetch_aux(pack, AuxSlotId::Context, &plan.context, domain)?;
        let context_heads = fetch_aux(pack, AuxSlotId::ContextHeads, &plan.context_heads, domain)?;
        let packed_query = fetch_aux(pack, AuxSlotId::PackedQuery, &plan.packed_query, domain)?;
        let packed_key = fetch_aux(pack, AuxSlotId::PackedKey, &plan.packed_key, domain)?;
        let packed_scores = fetch_aux(pack, AuxSlotId::PackedScores, &plan.packed_scores, domain)?;
        let packed_value = fetch_aux(pack, AuxSlotId::PackedValue, &plan.packed_value, domain)?;

        // Head split: the reshape is a descriptor-only reinterpretation, the
        // permute moves the head axis to the front.
        let q_split = q_in.reshape(vec![plan.seq_q, plan.heads, plan.d_k])?;
        let k_split = k_in.reshape(vec![plan.seq_k, plan.heads, plan.d_k])?;
        let v_split = v_in.reshape(vec![plan.seq_k, plan.heads, plan.d_k])?;

        {
            let (src, dst) = (q_split.clone(), query_heads.clone());
            executor.dispatch("query_permute", Box::new(move || kernels::permute::permute(&src, &dst, &[1, 0, 2])))?;
        }
        {
            let (src, dst) = (k_split.clone(), key_heads.clone());
            executor.dispatch("key_permute", Box::new(move || kernels::permute::permute(&src, &dst, &[1, 0, 2])))?;
        }
        {
            let (src, dst) = (key_heads.clone(), key_transposed.clone());
            executor.dispatch("key_transpose", Box::new(move || kernels::transpose::transpose_batched(&src, &dst)))?;
        }
        {
            let (src, dst) = (v_split.clone(), value_heads.clone());
            executor.dispatch("value_permute", Box::new(move || kernels::permute::permute(&src, &dst, &[1, 0, 2])))?;
        }

        // First GEMM: scores = scale * (Q_heads @ K_heads^T), batched over the
        // head axis with contraction over d_k.
        {
            let (src, dst) = (query_heads.clone(), packed_query.clone());
            executor.dispatch("query_interleave", Box::new(move || kernels::interleave::interleave4x4(&src, &dst)))?;
        }
        {
            let (src, dst) = (key_transposed.clone(), packed_key.clone());
            executor.dispatch("key_transpose_1xw", Box::new(move || kernels::transpose::transpose_1xw(&src, &dst)))?;
        }
        {
            let (a, b, c) = (packed_query.clone(), packed_key.clone(), scores.clone());
            let (m, n, k, alpha) = (plan.seq_q, plan.seq_k, plan.d_k, plan.scale);
            executor.dispatch(
                "scores_matmul",
                Box::new(move || kernels::gemm::gemm_packed(&a, &b, &c, m, n, k, alpha)),
            )?;
        }

        let probs_input = if causal {
            let mask = state.mask_cache.get_or_build(plan.seq_q);
            let masked = fetch_aux(pack, AuxSlotId::MaskedScores, &plan.masked_scores, domain)?;
            let (src, dst) = (scores.clone(), masked.clone());
            executor.dispatch("causal_mask", Box::new(move || kernels::add::add_mask(&src, &mask, &dst)))?;
            masked
        } else {
            scores.clone()
        };

        {
            let (src, dst) = (probs_input, softmaxed.clone());
            executor.dispatch("softmax", Box::new(move || kernels::softmax::softmax_rows(&src, &dst)))?;
        }

        // Second GEMM: context = softmax(scores) @ V_heads, contraction over
        // the key positions.
        {
            let (src, dst) = (softmaxed.clone(), packed_scores.clone());
            executor.dispatch("scores_interleave", Box::new(move || kernels::interleave::interleave4x4(&src, &dst)))?;
        }
        {
            let (src, dst) = (value_heads.clone(), packed_value.clone());
            executor.dispatch("value_transpose_1xw", Box::new(move || kernels::transpose::transpose_1xw(&src, &dst)))?;
        }
        {
            let (a, b, c) = (packed_scores.clone(), packed_value.clone(), context.clone());
            let (m, n, k) = (plan.seq_q, plan.d_k, plan.seq_k);
            executor.dispatch(
                "context_matmul",
                Box::new(move || kernels::gemm::gemm_packed(&a, &b, &c, m, n, k, 1.0)),
            )?;
        }

        // Head merge: inverse permute, then a descriptor-only reshape back to
        // the query shape, copied into the caller's output.
        {
            let (src, dst) = (context.clone(), context_heads.clone());
            executor.dispatch("merge_permute", Box::new(move || kernels::permute::permute(&src, &dst, &[1, 0, 2])))?;
        }
        let out_target = if host && output.domain() == ExecutionDomain::Device {
            fetch_aux(pack, AuxSlotId::OutputStage, &plan.output, domain)?
        } else {
            output.clone()
        };
        {
            let src = context_heads.reshape(vec![plan.seq_q, plan.d_model])?;
            let dst = out_target.clone();
            executor.dispatch(
                "merge_reshape",
                Box::new(move || {
                    let merged = src.data();
                    dst.data_mut().copy_from_slice(&merged);
                    Ok(())
                }),
            )?;
        }
        if host && output.domain() == ExecutionDomain::Device {
            // Host-mapped write-back into the device-resident output.
            output.write_from(&out_target.to_vec()?)?;
        }

        Ok(())
    }
}
