mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::*;
use ipadapter::{
    AttentionBackend, AttentionContext, AttentionPatch, CondOrUncond, ConditionSlot,
    ContextWindow, DiscreteSchedule, KvProjector, NoiseSchedule, ScaledDotProductAttention,
    WeightType,
};
use std::sync::Arc;

const SEQ_LEN: usize = 16;
const TEXT_LEN: usize = 6;

struct Fixture {
    kv: Arc<KvProjector>,
    cond: Tensor,
    uncond: Tensor,
    q: Tensor,
    k: Tensor,
    v: Tensor,
}

impl Fixture {
    fn new(seed: u64, images: usize, batch: usize, hidden: usize) -> Result<Self> {
        let mut rng = TensorRng::new(seed);
        Ok(Self {
            kv: Arc::new(kv_projector(seed + 100, 1, hidden)?),
            cond: rng.tensor(&[images, 4, CROSS_DIM], 2.0)?,
            uncond: rng.tensor(&[images, 4, CROSS_DIM], 2.0)?,
            q: rng.tensor(&[batch, SEQ_LEN, hidden], 2.0)?,
            k: rng.tensor(&[batch, TEXT_LEN, hidden], 2.0)?,
            v: rng.tensor(&[batch, TEXT_LEN, hidden], 2.0)?,
        })
    }

    fn slot(&self, weight: f64, weight_type: WeightType) -> Result<ConditionSlot> {
        Ok(ConditionSlot::new(
            self.kv.clone(),
            self.cond.clone(),
            self.uncond.clone(),
            weight,
            weight_type,
        )?)
    }

    fn slot_with(&self, cond: &Tensor, uncond: &Tensor) -> Result<ConditionSlot> {
        Ok(ConditionSlot::new(
            self.kv.clone(),
            cond.clone(),
            uncond.clone(),
            1.0,
            WeightType::Original,
        )?)
    }

    fn base(&self, ctx: &AttentionContext) -> Result<Tensor> {
        Ok(ScaledDotProductAttention.attend(&self.q, &self.k, &self.v, ctx.num_heads)?)
    }

    fn run(&self, patch: &AttentionPatch, ctx: &AttentionContext) -> Result<Tensor> {
        Ok(patch.forward(&self.q, &self.k, &self.v, ctx, &ScaledDotProductAttention)?)
    }
}

fn cfg_context() -> AttentionContext {
    AttentionContext::new(
        NUM_HEADS,
        vec![CondOrUncond::Cond, CondOrUncond::Uncond],
        (4, 4),
    )
}

fn cond_context() -> AttentionContext {
    AttentionContext::new(NUM_HEADS, vec![CondOrUncond::Cond], (4, 4))
}

#[test]
fn test_schedule_window_gates_contribution() -> Result<()> {
    let fx = Fixture::new(1, 1, 2, HIDDEN_DIM)?;
    let schedule = DiscreteSchedule::default();
    let slot = fx.slot(1.0, WeightType::Original)?.with_sigma_window(
        schedule.percent_to_sigma(0.1),
        schedule.percent_to_sigma(0.3),
    );
    let patch = AttentionPatch::new(0, slot);
    let base = fx.base(&cfg_context())?;

    for (percent, active) in [(0.05, false), (0.2, true), (0.5, false), (0.95, false)] {
        let ctx = cfg_context().with_sigma(schedule.percent_to_sigma(percent));
        let diff = max_abs_diff(&fx.run(&patch, &ctx)?, &base)?;
        if active {
            assert!(diff > 1e-4, "slot should act at {percent}");
        } else {
            assert_eq!(diff, 0.0, "slot should be gated at {percent}");
        }
    }

    // An unknown sigma reads as the start of sampling.
    let diff = max_abs_diff(&fx.run(&patch, &cfg_context())?, &base)?;
    assert_eq!(diff, 0.0);
    Ok(())
}

#[test]
fn test_full_window_is_active_without_sigma() -> Result<()> {
    let fx = Fixture::new(2, 1, 2, HIDDEN_DIM)?;
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?);
    let diff = max_abs_diff(&fx.run(&patch, &cfg_context())?, &fx.base(&cfg_context())?)?;
    assert!(diff > 1e-4);
    Ok(())
}

#[test]
fn test_slots_compose_additively() -> Result<()> {
    let fx = Fixture::new(3, 1, 2, HIDDEN_DIM)?;
    let other = Fixture::new(4, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let base = fx.base(&ctx)?;

    let first = fx.slot(0.8, WeightType::Original)?;
    let second = ConditionSlot::new(
        other.kv.clone(),
        other.cond.clone(),
        other.uncond.clone(),
        0.5,
        WeightType::Linear,
    )?;

    let only_first = fx.run(&AttentionPatch::new(0, first.clone()), &ctx)?;
    let only_second = fx.run(&AttentionPatch::new(0, second.clone()), &ctx)?;
    let mut both = AttentionPatch::new(0, first);
    both.push(second);
    assert_eq!(both.slots().len(), 2);
    let both = fx.run(&both, &ctx)?;

    let expected = ((&only_first - &base)? + (&only_second - &base)? + &base)?;
    assert!(max_abs_diff(&both, &expected)? < 1e-5);
    Ok(())
}

#[test]
fn test_zero_weight_reproduces_base_attention() -> Result<()> {
    let fx = Fixture::new(5, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let base = fx.base(&ctx)?;

    let mut patch = AttentionPatch::new(0, fx.slot(0.0, WeightType::Original)?);
    patch.push(fx.slot(0.0, WeightType::Linear)?);
    patch.push(fx.slot(0.0, WeightType::ChannelPenalty)?);
    assert_eq!(max_abs_diff(&fx.run(&patch, &ctx)?, &base)?, 0.0);
    Ok(())
}

#[test]
fn test_weight_types_agree_at_unit_weight_and_base_width() -> Result<()> {
    let fx = Fixture::new(6, 1, 2, 1280)?;
    let ctx = cfg_context();

    let original = fx.run(&AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?), &ctx)?;
    let linear = fx.run(&AttentionPatch::new(0, fx.slot(1.0, WeightType::Linear)?), &ctx)?;
    let penalty = fx.run(
        &AttentionPatch::new(0, fx.slot(1.0, WeightType::ChannelPenalty)?),
        &ctx,
    )?;
    assert!(max_abs_diff(&original, &linear)? < 1e-4);
    assert!(max_abs_diff(&linear, &penalty)? < 1e-4);
    Ok(())
}

#[test]
fn test_weight_types_differ_away_from_unit_weight() -> Result<()> {
    let fx = Fixture::new(7, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let original = fx.run(&AttentionPatch::new(0, fx.slot(2.0, WeightType::Original)?), &ctx)?;
    let linear = fx.run(&AttentionPatch::new(0, fx.slot(2.0, WeightType::Linear)?), &ctx)?;
    assert!(max_abs_diff(&original, &linear)? > 1e-4);
    Ok(())
}

#[test]
fn test_single_image_broadcasts_over_batch() -> Result<()> {
    let fx = Fixture::new(8, 1, 4, HIDDEN_DIM)?;
    let ctx = cond_context();
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?);
    let batched = fx.run(&patch, &ctx)?;
    assert_eq!(batched.dims(), &[4, SEQ_LEN, HIDDEN_DIM]);

    for row in 0..4 {
        let q = fx.q.narrow(0, row, 1)?;
        let k = fx.k.narrow(0, row, 1)?;
        let v = fx.v.narrow(0, row, 1)?;
        let single = patch.forward(&q, &k, &v, &ctx, &ScaledDotProductAttention)?;
        assert!(max_abs_diff(&batched.narrow(0, row, 1)?, &single)? < 1e-5);
    }
    Ok(())
}

#[test]
fn test_multiple_images_merge_into_one_sequence() -> Result<()> {
    let fx = Fixture::new(9, 2, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let merged_cond = fx.cond.reshape((1, 8, CROSS_DIM))?;
    let merged_uncond = fx.uncond.reshape((1, 8, CROSS_DIM))?;

    let split = fx.run(&AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?), &ctx)?;
    let merged = fx.run(
        &AttentionPatch::new(0, fx.slot_with(&merged_cond, &merged_uncond)?),
        &ctx,
    )?;
    assert!(max_abs_diff(&split, &merged)? < 1e-6);
    Ok(())
}

#[test]
fn test_unfold_truncates_extra_images() -> Result<()> {
    let fx = Fixture::new(10, 6, 4, HIDDEN_DIM)?;
    let ctx = cond_context();

    let unfolded = fx.slot(1.0, WeightType::Original)?.with_unfold_batch(true);
    let first_four = fx
        .slot_with(&fx.cond.narrow(0, 0, 4)?, &fx.uncond.narrow(0, 0, 4)?)?
        .with_unfold_batch(true);

    let got = fx.run(&AttentionPatch::new(0, unfolded), &ctx)?;
    let want = fx.run(&AttentionPatch::new(0, first_four), &ctx)?;
    assert!(max_abs_diff(&got, &want)? < 1e-6);
    Ok(())
}

#[test]
fn test_unfold_pads_with_last_image() -> Result<()> {
    let fx = Fixture::new(11, 2, 4, HIDDEN_DIM)?;
    let ctx = cond_context();
    let rows = Tensor::new(&[0u32, 1, 1, 1], &Device::Cpu)?;

    let unfolded = fx.slot(1.0, WeightType::Original)?.with_unfold_batch(true);
    let padded = fx
        .slot_with(
            &fx.cond.index_select(&rows, 0)?,
            &fx.uncond.index_select(&rows, 0)?,
        )?
        .with_unfold_batch(true);

    let got = fx.run(&AttentionPatch::new(0, unfolded), &ctx)?;
    let want = fx.run(&AttentionPatch::new(0, padded), &ctx)?;
    assert!(max_abs_diff(&got, &want)? < 1e-6);
    Ok(())
}

#[test]
fn test_unfold_follows_context_window() -> Result<()> {
    let fx = Fixture::new(12, 8, 4, HIDDEN_DIM)?;
    let ctx = cond_context().with_context_window(ContextWindow::new(8, vec![2, 3, 4, 5]));

    let unfolded = fx.slot(1.0, WeightType::Original)?.with_unfold_batch(true);
    let windowed = fx
        .slot_with(&fx.cond.narrow(0, 2, 4)?, &fx.uncond.narrow(0, 2, 4)?)?
        .with_unfold_batch(true);

    let got = fx.run(&AttentionPatch::new(0, unfolded), &ctx)?;
    let want = fx.run(&AttentionPatch::new(0, windowed), &cond_context())?;
    assert!(max_abs_diff(&got, &want)? < 1e-6);
    Ok(())
}

#[test]
fn test_zero_mask_removes_contribution() -> Result<()> {
    let fx = Fixture::new(13, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let mask = Tensor::zeros((1, 4, 4), DType::F32, &Device::Cpu)?;
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask))?);
    assert_eq!(max_abs_diff(&fx.run(&patch, &ctx)?, &fx.base(&ctx)?)?, 0.0);
    Ok(())
}

#[test]
fn test_half_mask_limits_contribution_to_masked_tokens() -> Result<()> {
    let fx = Fixture::new(14, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    // Left two columns on, right two off.
    let mask = Tensor::new(&[[1f32, 1., 0., 0.]], &Device::Cpu)?
        .repeat((4, 1))?
        .unsqueeze(0)?;
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask))?);
    let out = fx.run(&patch, &ctx)?;
    let base = fx.base(&ctx)?;

    for token in 0..SEQ_LEN {
        let diff = max_abs_diff(&out.narrow(1, token, 1)?, &base.narrow(1, token, 1)?)?;
        if token % 4 < 2 {
            assert!(diff > 1e-5, "token {token} should be conditioned");
        } else {
            assert_eq!(diff, 0.0, "token {token} should be masked out");
        }
    }
    Ok(())
}

#[test]
fn test_nan_mask_values_are_ignored() -> Result<()> {
    let fx = Fixture::new(15, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let mask = Tensor::full(f32::NAN, (1, 4, 4), &Device::Cpu)?;
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask))?);
    assert_eq!(max_abs_diff(&fx.run(&patch, &ctx)?, &fx.base(&ctx)?)?, 0.0);
    Ok(())
}

#[test]
fn test_empty_mask_removes_contribution() -> Result<()> {
    let fx = Fixture::new(20, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    for shape in [(1, 0, 0), (0, 4, 4), (1, 4, 0)] {
        let mask = Tensor::zeros(shape, DType::F32, &Device::Cpu)?;
        let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask))?);
        assert_eq!(
            max_abs_diff(&fx.run(&patch, &ctx)?, &fx.base(&ctx)?)?,
            0.0,
            "mask {shape:?}"
        );
    }
    Ok(())
}

#[test]
fn test_leading_mask_dims_are_flattened() -> Result<()> {
    let fx = Fixture::new(21, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let mask = TensorRng::new(21).mask(&[1, 4, 4])?;

    let planes = fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask.clone()))?;
    let batched = fx
        .slot(1.0, WeightType::Original)?
        .with_mask(Some(mask.unsqueeze(0)?))?;
    let plane = fx
        .slot(1.0, WeightType::Original)?
        .with_mask(Some(mask.squeeze(0)?))?;
    assert_eq!(batched.mask.as_ref().map(|m| m.dims().to_vec()), Some(vec![1, 4, 4]));

    let want = fx.run(&AttentionPatch::new(0, planes), &ctx)?;
    assert!(max_abs_diff(&fx.run(&AttentionPatch::new(0, batched), &ctx)?, &want)? < 1e-6);
    assert!(max_abs_diff(&fx.run(&AttentionPatch::new(0, plane), &ctx)?, &want)? < 1e-6);
    Ok(())
}

#[test]
fn test_vector_mask_is_rejected() -> Result<()> {
    let fx = Fixture::new(22, 1, 2, HIDDEN_DIM)?;
    let mask = Tensor::ones(16, DType::F32, &Device::Cpu)?;
    let err = fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask));
    assert!(matches!(err, Err(ipadapter::IpAdapterError::ShapeMismatch { .. })));
    Ok(())
}

#[test]
fn test_mask_is_clamped_when_attached() -> Result<()> {
    let fx = Fixture::new(23, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let over = Tensor::full(3.0f32, (1, 4, 4), &Device::Cpu)?;
    let slot = fx.slot(1.0, WeightType::Original)?.with_mask(Some(over))?;
    let stored = slot.mask.as_ref().map(|m| m.flatten_all()?.max(0)?.to_scalar::<f32>());
    assert_eq!(stored.transpose()?, Some(1.0));

    let unmasked = fx.run(&AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?), &ctx)?;
    assert!(max_abs_diff(&fx.run(&AttentionPatch::new(0, slot), &ctx)?, &unmasked)? < 1e-6);
    Ok(())
}

#[test]
fn test_long_mask_follows_context_window() -> Result<()> {
    let fx = Fixture::new(24, 1, 4, HIDDEN_DIM)?;
    let window = ContextWindow::new(8, vec![2, 3, 4, 5]);
    let mask = TensorRng::new(24).mask(&[8, 4, 4])?;

    let windowed = fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask.clone()))?;
    let sliced = fx
        .slot(1.0, WeightType::Original)?
        .with_mask(Some(mask.narrow(0, 2, 4)?))?;

    let got = fx.run(
        &AttentionPatch::new(0, windowed),
        &cond_context().with_context_window(window),
    )?;
    let want = fx.run(&AttentionPatch::new(0, sliced), &cond_context())?;
    assert!(max_abs_diff(&got, &want)? < 1e-6);
    Ok(())
}

#[test]
fn test_short_mask_is_padded_before_window_selection() -> Result<()> {
    let fx = Fixture::new(25, 1, 4, HIDDEN_DIM)?;
    let window = ContextWindow::new(8, vec![2, 3, 4, 5]);
    let mask = TensorRng::new(25).mask(&[3, 4, 4])?;
    // Frames past the end of a 3-frame mask all read its last frame.
    let rows = Tensor::new(&[2u32, 2, 2, 2], &Device::Cpu)?;

    let windowed = fx.slot(1.0, WeightType::Original)?.with_mask(Some(mask.clone()))?;
    let repeated = fx
        .slot(1.0, WeightType::Original)?
        .with_mask(Some(mask.index_select(&rows, 0)?))?;

    let got = fx.run(
        &AttentionPatch::new(0, windowed),
        &cond_context().with_context_window(window),
    )?;
    let want = fx.run(&AttentionPatch::new(0, repeated), &cond_context())?;
    assert!(max_abs_diff(&got, &want)? < 1e-6);
    Ok(())
}

#[test]
fn test_unfold_pads_short_batch_before_window_selection() -> Result<()> {
    let fx = Fixture::new(26, 3, 4, HIDDEN_DIM)?;
    let ctx = cond_context().with_context_window(ContextWindow::new(8, vec![2, 3, 4, 5]));
    let rows = Tensor::new(&[2u32, 2, 2, 2], &Device::Cpu)?;

    let unfolded = fx.slot(1.0, WeightType::Original)?.with_unfold_batch(true);
    let repeated = fx
        .slot_with(
            &fx.cond.index_select(&rows, 0)?,
            &fx.uncond.index_select(&rows, 0)?,
        )?
        .with_unfold_batch(true);

    let got = fx.run(&AttentionPatch::new(0, unfolded), &ctx)?;
    let want = fx.run(&AttentionPatch::new(0, repeated), &cond_context())?;
    assert!(max_abs_diff(&got, &want)? < 1e-6);
    Ok(())
}

#[test]
fn test_output_keeps_query_dtype() -> Result<()> {
    let fx = Fixture::new(16, 1, 2, HIDDEN_DIM)?;
    let ctx = cfg_context();
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?);
    let q = fx.q.to_dtype(DType::F64)?;
    let k = fx.k.to_dtype(DType::F64)?;
    let v = fx.v.to_dtype(DType::F64)?;
    let out = patch.forward(&q, &k, &v, &ctx, &ScaledDotProductAttention)?;
    assert_eq!(out.dtype(), DType::F64);
    assert!(max_abs_diff(&out, &fx.run(&patch, &ctx)?.to_dtype(DType::F64)?)? < 1e-5);
    Ok(())
}

#[test]
fn test_empty_batch_layout_reads_as_conditioned() -> Result<()> {
    let fx = Fixture::new(17, 1, 1, HIDDEN_DIM)?;
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?);
    let empty = AttentionContext::new(NUM_HEADS, Vec::new(), (4, 4));
    let got = fx.run(&patch, &empty)?;
    let want = fx.run(&patch, &cond_context())?;
    assert_eq!(max_abs_diff(&got, &want)?, 0.0);
    Ok(())
}

#[test]
fn test_custom_backend_is_used() -> Result<()> {
    let fx = Fixture::new(18, 1, 2, HIDDEN_DIM)?;
    let patch = AttentionPatch::new(0, fx.slot(1.0, WeightType::Original)?);
    let zeros = |q: &Tensor, _k: &Tensor, _v: &Tensor, _heads: usize| q.zeros_like();
    let out = patch.forward(&fx.q, &fx.k, &fx.v, &cfg_context(), &zeros)?;
    assert_eq!(out.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
    Ok(())
}

#[test]
fn test_patch_key_names() -> Result<()> {
    let fx = Fixture::new(19, 1, 2, HIDDEN_DIM)?;
    let patch = AttentionPatch::new(3, fx.slot(1.0, WeightType::Original)?);
    assert_eq!(patch.layer_number(), 3);
    assert_eq!(patch.k_key(), "7_to_k_ip");
    assert_eq!(patch.v_key(), "7_to_v_ip");
    Ok(())
}
