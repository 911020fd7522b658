//! Per-layer key/value projections of the image tokens.

use crate::error::{IpAdapterError, Result};
use crate::nn::linear_to;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use std::collections::{BTreeSet, HashMap};

/// Which side of cross-attention a projection feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KvSide {
    Key,
    Value,
}

impl KvSide {
    pub fn module_name(&self) -> &'static str {
        match self {
            KvSide::Key => "to_k_ip",
            KvSide::Value => "to_v_ip",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "to_k_ip" => Some(KvSide::Key),
            "to_v_ip" => Some(KvSide::Value),
            _ => None,
        }
    }
}

/// Checkpoint index of the projections used by cross-attention layer `n`.
pub fn checkpoint_index(layer_number: usize) -> usize {
    layer_number * 2 + 1
}

/// Bias-free key/value projections, one pair per checkpoint index.
#[derive(Debug, Clone)]
pub struct KvProjector {
    layers: HashMap<(usize, KvSide), Linear>,
    input_dim: usize,
}

impl KvProjector {
    /// Collect every `<index>.to_k_ip.weight` / `<index>.to_v_ip.weight` of the
    /// `ip_adapter` namespace. Other tensors are ignored.
    pub fn from_checkpoint(ip_adapter: &HashMap<String, Tensor>) -> Result<Self> {
        let mut names: Vec<&String> = ip_adapter.keys().collect();
        names.sort();

        let mut layers = HashMap::new();
        let mut input_dim: Option<usize> = None;
        for name in names {
            let Some((index, side)) = parse_key(name) else {
                continue;
            };
            let weight = &ip_adapter[name];
            let (out_dim, in_dim) = match weight.dims() {
                [out_dim, in_dim] => (*out_dim, *in_dim),
                dims => {
                    return Err(IpAdapterError::InvalidAdapterFile(format!(
                        "'{}' must be a matrix, got shape {:?}",
                        name, dims
                    )));
                }
            };
            match input_dim {
                None => input_dim = Some(in_dim),
                Some(expected) if expected != in_dim => {
                    return Err(IpAdapterError::ShapeMismatch {
                        tensor: name.clone(),
                        expected: vec![out_dim, expected],
                        actual: vec![out_dim, in_dim],
                    });
                }
                Some(_) => {}
            }
            layers.insert((index, side), Linear::new(weight.clone(), None));
        }

        let Some(input_dim) = input_dim else {
            return Err(IpAdapterError::InvalidAdapterFile(
                "checkpoint has no to_k_ip / to_v_ip projections".to_string(),
            ));
        };
        Ok(Self { layers, input_dim })
    }

    pub fn get(&self, index: usize, side: KvSide) -> Option<&Linear> {
        self.layers.get(&(index, side))
    }

    /// Apply the projection stored under `index`: `xs · Wᵀ`.
    pub fn project(&self, index: usize, side: KvSide, xs: &Tensor) -> Result<Tensor> {
        let linear = self.get(index, side).ok_or_else(|| {
            IpAdapterError::MissingTensor(format!("{}.{}.weight", index, side.module_name()))
        })?;
        Ok(linear.forward(xs)?)
    }

    /// Whether both the key and value projections exist for `index`.
    pub fn has_layer(&self, index: usize) -> bool {
        self.layers.contains_key(&(index, KvSide::Key))
            && self.layers.contains_key(&(index, KvSide::Value))
    }

    /// Checkpoint indices with at least one projection, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.layers
            .keys()
            .map(|(index, _)| *index)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Width of the image tokens the projections accept.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn to_device(&self, device: &Device, dtype: DType) -> Result<Self> {
        let mut layers = HashMap::with_capacity(self.layers.len());
        for (key, linear) in &self.layers {
            layers.insert(*key, linear_to(linear, device, dtype)?);
        }
        Ok(Self {
            layers,
            input_dim: self.input_dim,
        })
    }
}

fn parse_key(name: &str) -> Option<(usize, KvSide)> {
    let mut parts = name.split('.');
    let index = parts.next()?.parse().ok()?;
    let side = KvSide::parse(parts.next()?)?;
    match (parts.next(), parts.next()) {
        (Some("weight"), None) => Some((index, side)),
        _ => None,
    }
}
