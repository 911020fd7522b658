//! Cross-attention patch carrying image conditioning.
//!
//! One [`AttentionPatch`] replaces the attention call of one cross-attention
//! layer. It runs the host's attention as usual and then adds, slot by slot,
//! the attention of the same queries over the projected image tokens.

use crate::attention::AttentionBackend;
use crate::batch::{align_batch, broadcast_batch, merge_images, select_context_window};
use crate::error::{IpAdapterError, Result};
use crate::kv_projector::{KvProjector, KvSide, checkpoint_index};
use crate::mask::{prepare_mask, to_planes};
use crate::schedule::MAX_SIGMA;
use candle_core::{D, DType, Device, Tensor};
use ipadapter_domain::{CondOrUncond, ContextWindow, WeightType};
use std::sync::Arc;

/// Cross-attention width the channel penalty is normalised to.
pub const CHANNEL_PENALTY_BASE: f64 = 1280.0;

/// Effective weight of the channel penalty mode.
pub fn channel_penalty_factor(weight: f64, channels: usize) -> f64 {
    weight * (channels as f64 / CHANNEL_PENALTY_BASE)
}

/// One application of an adapter to a layer.
#[derive(Debug, Clone)]
pub struct ConditionSlot {
    pub weight: f64,
    pub weight_type: WeightType,
    pub kv: Arc<KvProjector>,
    pub cond: Tensor,
    pub uncond: Tensor,
    pub mask: Option<Tensor>,
    /// Highest sigma at which the slot acts.
    pub sigma_start: f64,
    /// Lowest sigma at which the slot acts.
    pub sigma_end: f64,
    pub unfold_batch: bool,
}

impl ConditionSlot {
    /// A slot active over the whole schedule with no mask.
    pub fn new(
        kv: Arc<KvProjector>,
        cond: Tensor,
        uncond: Tensor,
        weight: f64,
        weight_type: WeightType,
    ) -> Result<Self> {
        if cond.dims() != uncond.dims() {
            return Err(IpAdapterError::ShapeMismatch {
                tensor: "uncond".to_string(),
                expected: cond.dims().to_vec(),
                actual: uncond.dims().to_vec(),
            });
        }
        Ok(Self {
            weight,
            weight_type,
            kv,
            cond,
            uncond,
            mask: None,
            sigma_start: MAX_SIGMA,
            sigma_end: 0.0,
            unfold_batch: false,
        })
    }

    /// Attach a spatial mask of shape `(h, w)`, `(n, h, w)` or with further
    /// leading dims, which are flattened into `n`.
    ///
    /// The mask is stored as sanitized `(n, h, w)` planes.
    pub fn with_mask(mut self, mask: Option<Tensor>) -> Result<Self> {
        self.mask = match mask {
            Some(mask) if mask.rank() < 2 => {
                let mut expected = vec![1; 2 - mask.rank()];
                expected.extend_from_slice(mask.dims());
                return Err(IpAdapterError::ShapeMismatch {
                    tensor: "mask".to_string(),
                    expected,
                    actual: mask.dims().to_vec(),
                });
            }
            Some(mask) => Some(to_planes(&mask)?),
            None => None,
        };
        Ok(self)
    }

    pub fn with_sigma_window(mut self, sigma_start: f64, sigma_end: f64) -> Self {
        self.sigma_start = sigma_start;
        self.sigma_end = sigma_end;
        self
    }

    pub fn with_unfold_batch(mut self, unfold_batch: bool) -> Self {
        self.unfold_batch = unfold_batch;
        self
    }

    /// Whether `sigma` lies in `[sigma_end, sigma_start]`.
    pub fn is_active(&self, sigma: f64) -> bool {
        !(sigma > self.sigma_start || sigma < self.sigma_end)
    }

    /// Copy of the slot with its tensors on `device` in `dtype`.
    pub fn to_device(&self, kv: Arc<KvProjector>, device: &Device, dtype: DType) -> Result<Self> {
        let mask = match &self.mask {
            Some(mask) => Some(mask.to_device(device)?.to_dtype(dtype)?),
            None => None,
        };
        Ok(Self {
            kv,
            cond: self.cond.to_device(device)?.to_dtype(dtype)?,
            uncond: self.uncond.to_device(device)?.to_dtype(dtype)?,
            mask,
            ..self.clone()
        })
    }
}

/// What the sampler tells a patched layer on every call.
#[derive(Debug, Clone)]
pub struct AttentionContext {
    /// Current noise level; `None` means unknown and gates as [`MAX_SIGMA`].
    pub sigma: Option<f64>,
    pub num_heads: usize,
    /// Layout of the query batch in equal chunks.
    pub cond_or_uncond: Vec<CondOrUncond>,
    /// Latent `(height, width)` of the sample being denoised.
    pub original_hw: (usize, usize),
    pub context_window: Option<ContextWindow>,
}

impl AttentionContext {
    pub fn new(num_heads: usize, cond_or_uncond: Vec<CondOrUncond>, original_hw: (usize, usize)) -> Self {
        Self {
            sigma: None,
            num_heads,
            cond_or_uncond,
            original_hw,
            context_window: None,
        }
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = Some(sigma);
        self
    }

    pub fn with_context_window(mut self, window: ContextWindow) -> Self {
        self.context_window = Some(window);
        self
    }
}

/// Image conditioning bound to one cross-attention layer.
#[derive(Debug, Clone)]
pub struct AttentionPatch {
    layer_number: usize,
    slots: Vec<ConditionSlot>,
    span: tracing::Span,
}

impl AttentionPatch {
    pub fn new(layer_number: usize, slot: ConditionSlot) -> Self {
        Self {
            layer_number,
            slots: vec![slot],
            span: tracing::span!(tracing::Level::TRACE, "ip-attn2", layer = layer_number),
        }
    }

    /// Append another adapter application; earlier slots are kept.
    pub fn push(&mut self, slot: ConditionSlot) {
        self.slots.push(slot);
    }

    pub fn slots(&self) -> &[ConditionSlot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [ConditionSlot] {
        &mut self.slots
    }

    pub fn layer_number(&self) -> usize {
        self.layer_number
    }

    /// Checkpoint name of this layer's key projection.
    pub fn k_key(&self) -> String {
        format!("{}_{}", checkpoint_index(self.layer_number), KvSide::Key.module_name())
    }

    /// Checkpoint name of this layer's value projection.
    pub fn v_key(&self) -> String {
        format!("{}_{}", checkpoint_index(self.layer_number), KvSide::Value.module_name())
    }

    /// Base attention plus every active slot's contribution.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ctx: &AttentionContext,
        backend: &dyn AttentionBackend,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let org_dtype = q.dtype();
        let sigma = ctx.sigma.unwrap_or(MAX_SIGMA);

        let default_chunks = [CondOrUncond::Cond];
        let cond_or_uncond: &[CondOrUncond] = if ctx.cond_or_uncond.is_empty() {
            &default_chunks
        } else {
            &ctx.cond_or_uncond
        };
        let batch_prompt = (q.dim(0)? / cond_or_uncond.len()).max(1);

        let mut out = backend.attend(q, k, v, ctx.num_heads)?;
        for slot in &self.slots {
            // A zero weight contributes exactly nothing, in every mode.
            if !slot.is_active(sigma) || slot.weight == 0.0 {
                continue;
            }
            let out_ip = self.slot_output(slot, q, ctx, cond_or_uncond, batch_prompt, backend)?;
            out = (out + out_ip)?;
        }
        Ok(out.to_dtype(org_dtype)?)
    }

    fn slot_output(
        &self,
        slot: &ConditionSlot,
        q: &Tensor,
        ctx: &AttentionContext,
        cond_or_uncond: &[CondOrUncond],
        batch_prompt: usize,
        backend: &dyn AttentionBackend,
    ) -> Result<Tensor> {
        let index = checkpoint_index(self.layer_number);
        let project = |tokens: &Tensor, side: KvSide| slot.kv.project(index, side, tokens);

        let (k_cond, k_uncond, v_cond, v_uncond) = if slot.unfold_batch && slot.cond.dim(0)? > 1 {
            let (cond, uncond) = match &ctx.context_window {
                Some(window) => (
                    select_context_window(&slot.cond, window)?,
                    select_context_window(&slot.uncond, window)?,
                ),
                None => (slot.cond.clone(), slot.uncond.clone()),
            };
            if cond.dim(0)? != batch_prompt {
                tracing::trace!(
                    "realigning {} conditioning images to {} frames",
                    cond.dim(0)?,
                    batch_prompt
                );
            }
            let cond = align_batch(&cond, batch_prompt)?;
            let uncond = align_batch(&uncond, batch_prompt)?;
            (
                project(&cond, KvSide::Key)?,
                project(&uncond, KvSide::Key)?,
                project(&cond, KvSide::Value)?,
                project(&uncond, KvSide::Value)?,
            )
        } else {
            let cond = merge_images(&slot.cond)?;
            let uncond = merge_images(&slot.uncond)?;
            (
                broadcast_batch(&project(&cond, KvSide::Key)?, batch_prompt)?,
                broadcast_batch(&project(&uncond, KvSide::Key)?, batch_prompt)?,
                broadcast_batch(&project(&cond, KvSide::Value)?, batch_prompt)?,
                broadcast_batch(&project(&uncond, KvSide::Value)?, batch_prompt)?,
            )
        };

        let pick = |c: &Tensor, u: &Tensor| -> candle_core::Result<Tensor> {
            let chunks: Vec<&Tensor> = cond_or_uncond
                .iter()
                .map(|which| match which {
                    CondOrUncond::Cond => c,
                    CondOrUncond::Uncond => u,
                })
                .collect();
            Tensor::cat(&chunks, 0)?.to_dtype(q.dtype())
        };
        let mut ip_k = pick(&k_cond, &k_uncond)?;
        let mut ip_v = pick(&v_cond, &v_uncond)?;

        match slot.weight_type {
            WeightType::Original => {}
            WeightType::Linear => {
                ip_k = ip_k.affine(slot.weight, 0.0)?;
                ip_v = ip_v.affine(slot.weight, 0.0)?;
            }
            WeightType::ChannelPenalty => {
                let ip_v_mean = ip_v.mean_keepdim(1)?;
                let ip_v_offset = ip_v.broadcast_sub(&ip_v_mean)?;
                let w = channel_penalty_factor(slot.weight, ip_k.dim(D::Minus1)?);
                ip_k = ip_k.affine(w, 0.0)?;
                ip_v = ip_v_offset.broadcast_add(&ip_v_mean.affine(w, 0.0)?)?;
            }
        }

        let mut out_ip = backend.attend(q, &ip_k, &ip_v, ctx.num_heads)?;
        if slot.weight_type == WeightType::Original {
            out_ip = out_ip.affine(slot.weight, 0.0)?;
        }

        if let Some(mask) = &slot.mask {
            let mask = prepare_mask(
                mask,
                q.dim(1)?,
                ctx.original_hw,
                ctx.context_window.as_ref(),
                batch_prompt,
                cond_or_uncond.len(),
            )?
            .to_device(out_ip.device())?
            .to_dtype(out_ip.dtype())?;
            out_ip = out_ip.broadcast_mul(&mask)?;
        }

        Ok(out_ip)
    }
}
