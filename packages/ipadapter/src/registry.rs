//! Per-model tables of installed attention patches.
//!
//! A [`ModelHandle`] pairs a host model with the patches installed on it.
//! Registration never mutates a handle in place: each call returns a new
//! handle whose table extends the old one, so a model can be conditioned
//! differently along several branches of a workflow.

use crate::adapter::IpAdapter;
use crate::attention::AttentionBackend;
use crate::embeds::EmbedPair;
use crate::error::{IpAdapterError, Result};
use crate::kv_projector::{KvProjector, KvSide, checkpoint_index};
use crate::patch::{AttentionContext, AttentionPatch, ConditionSlot};
use crate::schedule::NoiseSchedule;
use candle_core::{DType, Device, Tensor};
use ipadapter_domain::{ApplyParams, LayerKey};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Attention patches keyed by the layer they replace.
#[derive(Debug, Clone, Default)]
pub struct PatchTable {
    patches: BTreeMap<LayerKey, AttentionPatch>,
    target: Option<(Device, DType)>,
    /// Slots were installed since the last materialization.
    dirty: bool,
    /// Projectors converted for `target`, paired with the one each came from.
    placed: Vec<(Weak<KvProjector>, Arc<KvProjector>)>,
}

impl PatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the layer's patch, or append the slot to the existing one.
    pub fn install_or_extend(&mut self, key: LayerKey, layer_number: usize, slot: ConditionSlot) {
        match self.patches.get_mut(&key) {
            Some(patch) => patch.push(slot),
            None => {
                self.patches.insert(key, AttentionPatch::new(layer_number, slot));
            }
        }
        self.dirty = true;
    }

    pub fn get(&self, key: &LayerKey) -> Option<&AttentionPatch> {
        self.patches.get(key)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LayerKey, &AttentionPatch)> {
        self.patches.iter()
    }

    /// Cross-attention of one layer: the layer's patch when installed,
    /// otherwise the backend alone.
    pub fn attention(
        &self,
        key: &LayerKey,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ctx: &AttentionContext,
        backend: &dyn AttentionBackend,
    ) -> Result<Tensor> {
        match self.patches.get(key) {
            Some(patch) => patch.forward(q, k, v, ctx, backend),
            None => Ok(backend.attend(q, k, v, ctx.num_heads)?),
        }
    }

    /// Move every slot's tensors to `device` in `dtype`.
    ///
    /// Each projector is converted once per target and stays shared, also by
    /// slots installed after an earlier call. Calling again with the same
    /// target and no new slots is a no-op.
    pub fn materialize(&mut self, device: &Device, dtype: DType) -> Result<()> {
        let same_target = matches!(
            &self.target,
            Some((placed_device, placed_dtype))
                if placed_device.same_device(device) && *placed_dtype == dtype
        );
        if same_target && !self.dirty {
            return Ok(());
        }
        if !same_target {
            self.placed.clear();
        }
        self.placed.retain(|(source, _)| source.strong_count() > 0);

        let mut converted = 0;
        for patch in self.patches.values_mut() {
            for slot in patch.slots_mut() {
                let done = self.placed.iter().any(|(_, kv)| Arc::ptr_eq(kv, &slot.kv));
                let kv = if done {
                    slot.kv.clone()
                } else {
                    let source = Arc::as_ptr(&slot.kv);
                    let found = self
                        .placed
                        .iter()
                        .find(|(from, _)| from.as_ptr() == source)
                        .map(|(_, kv)| kv.clone());
                    match found {
                        Some(kv) => kv,
                        None => {
                            let kv = Arc::new(slot.kv.to_device(device, dtype)?);
                            self.placed.push((Arc::downgrade(&slot.kv), kv.clone()));
                            converted += 1;
                            kv
                        }
                    }
                };
                *slot = slot.to_device(kv, device, dtype)?;
            }
        }

        tracing::debug!(
            "Materialized {} patches ({} projectors converted, {} shared) on {:?} as {:?}",
            self.patches.len(),
            converted,
            self.placed.len(),
            device,
            dtype
        );
        self.target = Some((device.clone(), dtype));
        self.dirty = false;
        Ok(())
    }
}

/// A host model together with its own patch table.
#[derive(Debug)]
pub struct ModelHandle<M> {
    model: Arc<M>,
    patches: PatchTable,
}

impl<M> Clone for ModelHandle<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            patches: self.patches.clone(),
        }
    }
}

impl<M> ModelHandle<M> {
    pub fn new(model: M) -> Self {
        Self {
            model: Arc::new(model),
            patches: PatchTable::new(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn patches(&self) -> &PatchTable {
        &self.patches
    }

    /// New handle with `slot` added to the layer's patch. `self` is unchanged.
    pub fn install_or_extend(&self, key: LayerKey, layer_number: usize, slot: ConditionSlot) -> Self {
        let mut handle = self.clone();
        handle.patches.install_or_extend(key, layer_number, slot);
        tracing::debug!(
            "Installed slot on {} (layer {}, {} slots)",
            key,
            layer_number,
            handle.patches.get(&key).map_or(0, |patch| patch.slots().len())
        );
        handle
    }

    /// Condition every cross-attention layer of the adapter's architecture.
    ///
    /// The embeddings are projected once and shared by all layers. The
    /// returned handle carries the new slots; `self` is unchanged.
    pub fn apply_ip_adapter(
        &self,
        adapter: &IpAdapter,
        embeds: &EmbedPair,
        params: &ApplyParams,
        schedule: &dyn NoiseSchedule,
        mask: Option<Tensor>,
    ) -> Result<Self> {
        params.validate()?;

        let kv = adapter.kv_projector();
        let layers = adapter.layout().cross_attention_layers();
        for number in 0..layers.len() {
            let index = checkpoint_index(number);
            if !kv.has_layer(index) {
                return Err(IpAdapterError::MissingTensor(format!(
                    "{}.{}.weight",
                    index,
                    KvSide::Key.module_name()
                )));
            }
        }

        let (cond, uncond) = adapter.image_embeds(embeds)?;
        let sigma_start = schedule.percent_to_sigma(params.start_at);
        let sigma_end = schedule.percent_to_sigma(params.end_at);
        let slot = ConditionSlot::new(kv.clone(), cond, uncond, params.weight, params.weight_type)?
            .with_mask(mask)?
            .with_sigma_window(sigma_start, sigma_end)
            .with_unfold_batch(params.unfold_batch);

        let mut handle = self.clone();
        for (number, key) in layers.into_iter().enumerate() {
            handle.patches.install_or_extend(key, number, slot.clone());
        }

        tracing::debug!(
            "Applied {} adapter ({}, weight {}) to {} layers, sigma window [{}, {}]",
            adapter.profile().name(),
            params.weight_type,
            params.weight,
            handle.patches.len(),
            sigma_end,
            sigma_start
        );
        Ok(handle)
    }

    /// Move every installed slot to `device` in `dtype`.
    pub fn materialize(&mut self, device: &Device, dtype: DType) -> Result<()> {
        self.patches.materialize(device, dtype)
    }
}
