use std::sync::Arc;

use super::{AttentionConfig, AuxSlotId, AuxTensorSlot, MemoryLifetime, ScaledDotProductAttention, TensorBindingSet};
use crate::error::AttentionError;
use crate::executor::{HostExecutor, StageExecutor};
use crate::tensor::{F32Element, Tensor, TensorDescriptor, TensorInit, TensorStorage};

fn host_executor() -> Arc<dyn StageExecutor> {
    Arc::new(HostExecutor::with_threads(2).expect("host executor"))
}

fn f32_desc(dims: Vec<usize>) -> TensorDescriptor {
    TensorDescriptor::new(dims, crate::tensor::Dtype::F32)
}

fn host_tensor(dims: Vec<usize>, data: &[f32]) -> Tensor<F32Element> {
    Tensor::new(dims, TensorStorage::Host, TensorInit::CopyFrom(data)).expect("host tensor")
}

fn bind_workspace(slots: &[AuxTensorSlot], pack: &mut TensorBindingSet<F32Element>) {
    for slot in slots {
        let scratch = Tensor::new(slot.desc.dims.clone(), TensorStorage::Host, TensorInit::Uninitialized)
            .expect("aux tensor");
        pack.bind_aux(slot.id, scratch);
    }
}

fn run_host(
    config: AttentionConfig,
    seq_q: usize,
    seq_k: usize,
    q: &[f32],
    k: &[f32],
    v: &[f32],
) -> Vec<f32> {
    let mut op = ScaledDotProductAttention::<F32Element>::new(host_executor());
    let io = f32_desc(vec![seq_q, config.d_model]);
    let kv = f32_desc(vec![seq_k, config.d_model]);
    let slots = op.configure(&io, &kv, &kv, &io, config).expect("configure");

    let mut pack = TensorBindingSet::new();
    pack.bind_query(host_tensor(vec![seq_q, config.d_model], q))
        .bind_key(host_tensor(vec![seq_k, config.d_model], k))
        .bind_value(host_tensor(vec![seq_k, config.d_model], v))
        .bind_output(Tensor::new(vec![seq_q, config.d_model], TensorStorage::Host, TensorInit::Uninitialized).unwrap());
    bind_workspace(&slots, &mut pack);

    op.run(&pack).expect("run");
    pack.role("output").unwrap().to_vec().unwrap()
}

#[test]
fn identity_inputs_blend_by_softmaxed_similarity() {
    // Q = K = V = I with a single head of width 2. The scaled scores are
    // (1/sqrt(2)) * I, so each row blends the matching and the other value row
    // with softmax([0.70711, 0]) = [0.66976, 0.33024].
    let eye = [1.0, 0.0, 0.0, 1.0];
    let out = run_host(
        AttentionConfig { d_model: 2, heads: 1, causal_mask: false },
        2,
        2,
        &eye,
        &eye,
        &eye,
    );
    let want = [0.66976, 0.33024, 0.33024, 0.66976];
    for (got, want) in out.iter().zip(want) {
        assert!((got - want).abs() < 1e-4, "got {out:?}");
    }
}

#[test]
fn causal_first_row_attends_only_to_itself() {
    let eye = [1.0, 0.0, 0.0, 1.0];
    let out = run_host(
        AttentionConfig { d_model: 2, heads: 1, causal_mask: true },
        2,
        2,
        &eye,
        &eye,
        &eye,
    );
    // Row 0 sees only key 0; row 1 blends as in the unmasked case.
    let want = [1.0, 0.0, 0.33024, 0.66976];
    for (got, want) in out.iter().zip(want) {
        assert!((got - want).abs() < 1e-4, "got {out:?}");
    }
}

#[test]
fn causal_rows_are_bitwise_independent_of_future_positions() {
    let config = AttentionConfig { d_model: 4, heads: 2, causal_mask: true };
    let seq = 4;
    let q: Vec<f32> = (0..seq * 4).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.11).collect();
    let k: Vec<f32> = (0..seq * 4).map(|i| ((i * 5 % 11) as f32 - 5.0) * 0.13).collect();
    let v: Vec<f32> = (0..seq * 4).map(|i| ((i * 3 % 17) as f32 - 8.0) * 0.07).collect();

    // Perturb every key/value element at positions >= 2.
    let mut k2 = k.clone();
    let mut v2 = v.clone();
    for slot in &mut k2[2 * 4..] {
        *slot = -*slot + 3.5;
    }
    for slot in &mut v2[2 * 4..] {
        *slot = *slot * -2.0 - 1.0;
    }

    let base = run_host(config, seq, seq, &q, &k, &v);
    let perturbed = run_host(config, seq, seq, &q, &k2, &v2);
    // Output rows 0 and 1 may only depend on positions 0 and 1.
    assert_eq!(&base[..2 * 4], &perturbed[..2 * 4]);
    assert_ne!(&base[2 * 4..], &perturbed[2 * 4..]);
}

#[test]
fn workspace_registry_is_stable_and_marks_packed_slots_persistent() {
    let mut op = ScaledDotProductAttention::<F32Element>::new(host_executor());
    let io = f32_desc(vec![6, 8]);
    let config = AttentionConfig { d_model: 8, heads: 2, causal_mask: true };
    let slots = op.configure(&io, &io, &io, &io, config).expect("configure");
    assert_eq!(op.workspace().expect("workspace"), slots.as_slice());

    for slot in &slots {
        let persistent = matches!(
            slot.id,
            AuxSlotId::PackedQuery | AuxSlotId::PackedKey | AuxSlotId::PackedScores | AuxSlotId::PackedValue
        );
        let expected = if persistent { MemoryLifetime::Persistent } else { MemoryLifetime::Temporary };
        assert_eq!(slot.lifetime, expected, "slot {:?}", slot.id);
    }
    let ids: Vec<AuxSlotId> = slots.iter().map(|s| s.id).collect();
    assert!(ids.contains(&AuxSlotId::MaskedScores));
    assert!(ids.contains(&AuxSlotId::QueryStage));
}

#[test]
fn reconfiguration_is_rejected() {
    let mut op = ScaledDotProductAttention::<F32Element>::new(host_executor());
    let io = f32_desc(vec![4, 4]);
    let config = AttentionConfig { d_model: 4, heads: 2, causal_mask: false };
    op.configure(&io, &io, &io, &io, config).expect("configure");
    assert!(matches!(
        op.configure(&io, &io, &io, &io, config),
        Err(AttentionError::AlreadyConfigured)
    ));
}

#[test]
fn run_requires_configuration_and_complete_bindings() {
    let mut op = ScaledDotProductAttention::<F32Element>::new(host_executor());
    let pack = TensorBindingSet::new();
    assert!(matches!(op.run(&pack), Err(AttentionError::NotConfigured)));

    let io = f32_desc(vec![2, 2]);
    let config = AttentionConfig { d_model: 2, heads: 1, causal_mask: false };
    let slots = op.configure(&io, &io, &io, &io, config).expect("configure");

    // No role bindings at all.
    assert!(matches!(op.run(&pack), Err(AttentionError::MissingBinding("query"))));

    // Roles bound but no workspace.
    let data = [1.0, 0.0, 0.0, 1.0];
    let mut pack = TensorBindingSet::new();
    pack.bind_query(host_tensor(vec![2, 2], &data))
        .bind_key(host_tensor(vec![2, 2], &data))
        .bind_value(host_tensor(vec![2, 2], &data))
        .bind_output(host_tensor(vec![2, 2], &data));
    assert!(matches!(op.run(&pack), Err(AttentionError::MissingAuxSlot(_))));

    // A role bound with the wrong shape.
    bind_workspace(&slots, &mut pack);
    pack.bind_query(host_tensor(vec![3, 2], &[0.0; 6]));
    assert!(matches!(op.run(&pack), Err(AttentionError::InvalidShape(_))));
}

#[test]
fn repeated_runs_reuse_the_workspace_and_agree() {
    let config = AttentionConfig { d_model: 4, heads: 2, causal_mask: false };
    let mut op = ScaledDotProductAttention::<F32Element>::new(host_executor());
    let io = f32_desc(vec![3, 4]);
    let slots = op.configure(&io, &io, &io, &io, config).expect("configure");

    let q: Vec<f32> = (0..12).map(|i| (i as f32 * 0.3).cos()).collect();
    let mut pack = TensorBindingSet::new();
    pack.bind_query(host_tensor(vec![3, 4], &q))
        .bind_key(host_tensor(vec![3, 4], &q))
        .bind_value(host_tensor(vec![3, 4], &q))
        .bind_output(Tensor::new(vec![3, 4], TensorStorage::Host, TensorInit::Uninitialized).unwrap());
    bind_workspace(&slots, &mut pack);

    op.run(&pack).expect("first run");
    let first = pack.role("output").unwrap().to_vec().unwrap();
    op.run(&pack).expect("second run");
    let second = pack.role("output").unwrap().to_vec().unwrap();
    assert_eq!(first, second);
}
