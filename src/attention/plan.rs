use tracing::debug;

use super::AttentionConfig;
use crate::error::AttentionError;
use crate::tensor::{Dtype, TensorDescriptor};

/// Every intermediate shape the pipeline needs, derived once at configure
/// time, before any data exists.
///
/// All dims are row-major: inputs are `[seq_len, d_model]`, per-head
/// intermediates are `[heads, seq_len, d_k]`, scores are
/// `[heads, seq_q, seq_k]`.
#[derive(Debug, Clone)]
pub(crate) struct ShapePlan {
    pub heads: usize,
    pub d_model: usize,
    pub d_k: usize,
    pub seq_q: usize,
    pub seq_k: usize,
    pub scale: f32,

    pub query: TensorDescriptor,
    pub key: TensorDescriptor,
    pub value: TensorDescriptor,
    pub output: TensorDescriptor,

    pub query_heads: TensorDescriptor,
    pub key_heads: TensorDescriptor,
    pub key_transposed: TensorDescriptor,
    pub value_heads: TensorDescriptor,

    pub packed_query: TensorDescriptor,
    pub packed_key: TensorDescriptor,
    pub packed_scores: TensorDescriptor,
    pub packed_value: TensorDescriptor,

    pub scores: TensorDescriptor,
    pub masked_scores: TensorDescriptor,
    pub softmaxed: TensorDescriptor,
    pub context: TensorDescriptor,
    pub context_heads: TensorDescriptor,
}

fn attention_scale(d_k: usize) -> f32 {
    let scale = 1.0 / (d_k as f32).sqrt();
    if scale.is_infinite() || scale.is_nan() {
        1.0
    } else {
        scale.clamp(1e-6, 1e6)
    }
}

fn require_rank_2(desc: &TensorDescriptor, what: &str) -> Result<(), AttentionError> {
    if desc.dims.len() != 2 || desc.dims.iter().any(|&d| d == 0) {
        return Err(AttentionError::InvalidShape(format!(
            "{what} must be a non-empty [seq_len, d_model] tensor, got {:?}",
            desc.dims
        )));
    }
    Ok(())
}

fn require_dtype(desc: &TensorDescriptor, expected: Dtype) -> Result<(), AttentionError> {
    if desc.dtype != expected {
        return Err(AttentionError::DtypeMismatch {
            expected,
            actual: desc.dtype,
        });
    }
    Ok(())
}

/// Pure shape derivation plus the validation the operator contract promises:
/// rejects indivisible head counts, mismatched embedding widths, K/V sequence
/// disagreement, and an output descriptor that differs from the query.
pub(crate) fn plan(
    query: &TensorDescriptor,
    key: &TensorDescriptor,
    value: &TensorDescriptor,
    output: &TensorDescriptor,
    config: &AttentionConfig,
) -> Result<ShapePlan, AttentionError> {
    if config.heads == 0 || config.d_model % config.heads != 0 {
        return Err(AttentionError::HeadCountMismatch {
            d_model: config.d_model,
            heads: config.heads,
        });
    }
    require_rank_2(query, "query")?;
    require_rank_2(key, "key")?;
    require_rank_2(value, "value")?;
    require_rank_2(output, "output")?;

    let d_model = query.dims[1];
    if d_model != config.d_model {
        return Err(AttentionError::DimensionMismatch {
            expected: config.d_model,
            actual: d_model,
        });
    }
    for other in [key, value] {
        if other.dims[1] != d_model {
            return Err(AttentionError::DimensionMismatch {
                expected: d_model,
                actual: other.dims[1],
            });
        }
    }
    if key.dims[0] != value.dims[0] {
        return Err(AttentionError::DimensionMismatch {
            expected: key.dims[0],
            actual: value.dims[0],
        });
    }
    let dtype = query.dtype;
    require_dtype(key, dtype)?;
    require_dtype(value, dtype)?;
    require_dtype(output, dtype)?;
    if output.dims != query.dims {
        return Err(AttentionError::InvalidShape(format!(
            "output descriptor {:?} must equal the query descriptor {:?}",
            output.dims, query.dims
        )));
    }

    let heads = config.heads;
    let d_k = d_model / heads;
    let seq_q = query.dims[0];
    let seq_k = key.dims[0];
    if config.causal_mask && seq_q != seq_k {
        return Err(AttentionError::InvalidShape(format!(
            "causal masking requires square scores, got seq_q={seq_q} seq_k={seq_k}"
        )));
    }

    let desc = |dims: Vec<usize>| TensorDescriptor::new(dims, dtype);
    let scores = desc(vec![heads, seq_q, seq_k]);

    let plan = ShapePlan {
        heads,
        d_model,
        d_k,
        seq_q,
        seq_k,
        scale: attention_scale(d_k),
        query: query.clone(),
        key: key.clone(),
        value: value.clone(),
        output: output.clone(),
        query_heads: desc(vec![heads, seq_q, d_k]),
        key_heads: desc(vec![heads, seq_k, d_k]),
        key_transposed: desc(vec![heads, d_k, seq_k]),
        value_heads: desc(vec![heads, seq_k, d_k]),
        packed_query: desc(vec![heads, seq_q.div_ceil(4), 4 * d_k]),
        packed_key: desc(vec![heads, seq_k.div_ceil(4), 4 * d_k]),
        packed_scores: desc(vec![heads, seq_q.div_ceil(4), 4 * seq_k]),
        packed_value: desc(vec![heads, d_k.div_ceil(4), 4 * seq_k]),
        masked_scores: scores.clone(),
        softmaxed: scores.clone(),
        scores,
        context: desc(vec![heads, seq_q, d_k]),
        context_heads: desc(vec![seq_q, heads, d_k]),
    };
    debug!(
        heads,
        d_model,
        d_k,
        seq_q,
        seq_k,
        scale = plan.scale,
        "derived attention shape plan"
    );
    Ok(plan)
}
