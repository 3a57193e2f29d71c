use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::tensor::TensorElement;

/// Additive value for masked (future) score entries.
pub(crate) const MASK_FILL: f32 = -1e9;

/// Causal mask cache. The mask is a pure function of `seq_len`
/// (`M[i][j] = -1e9` for `j > i`, else `0`), so it is built once per distinct
/// length and shared across runs.
pub(crate) struct MaskCache<T: TensorElement> {
    masks: FxHashMap<usize, Arc<Vec<T::Scalar>>>,
}

impl<T: TensorElement> MaskCache<T> {
    pub fn new() -> Self {
        Self {
            masks: FxHashMap::default(),
        }
    }

    pub fn get_or_build(&mut self, seq_len: usize) -> Arc<Vec<T::Scalar>> {
        if let Some(mask) = self.masks.get(&seq_len) {
            return Arc::clone(mask);
        }
        let zero = T::from_f32(0.0);
        let fill = T::from_f32(MASK_FILL);
        let mut mask = Vec::with_capacity(seq_len * seq_len);
        for i in 0..seq_len {
            for j in 0..seq_len {
                mask.push(if j > i { fill } else { zero });
            }
        }
        let mask = Arc::new(mask);
        self.masks.insert(seq_len, Arc::clone(&mask));
        mask
    }
}
