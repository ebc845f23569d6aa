//! LoRA adapter loading and weight fusion.
//!
//! An adapter ships pairs of low-rank matrices per layer; merging applies
//! `W' = W + scale * (alpha / rank) * (B @ A)` to the base weight. The merge
//! happens on the raw weight map before the model is constructed, which is
//! also why undoing a merge requires reloading pristine weights.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

const DOWN_SUFFIXES: &[&str] = &[".lora_down.weight", ".lora_A.weight"];
const UP_SUFFIXES: &[&str] = &[".lora_up.weight", ".lora_B.weight"];

/// One low-rank weight pair, already matched to a model parameter.
pub struct LoraWeight {
    pub down: Tensor,
    pub up: Tensor,
    pub alpha: f32,
    pub rank: usize,
}

/// A parsed adapter, keyed by the target parameter path
/// (e.g. `double_blocks.0.img_attn.qkv.weight`).
pub struct LoraAdapter {
    weights: HashMap<String, LoraWeight>,
}

impl LoraAdapter {
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to read lora adapter {}", path.display()))?;

        let mut alphas: HashMap<String, f32> = HashMap::new();
        let mut downs: HashMap<String, Tensor> = HashMap::new();
        let mut ups: HashMap<String, Tensor> = HashMap::new();

        for (key, tensor) in tensors {
            if let Some(base) = key.strip_suffix(".alpha") {
                let values = tensor
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?;
                if let Some(alpha) = values.first().copied() {
                    alphas.insert(base.to_string(), alpha);
                }
            } else if let Some(base) = strip_any_suffix(&key, DOWN_SUFFIXES) {
                downs.insert(base, tensor);
            } else if let Some(base) = strip_any_suffix(&key, UP_SUFFIXES) {
                ups.insert(base, tensor);
            } else {
                debug!(%key, "ignoring non-lora tensor");
            }
        }

        let mut weights = HashMap::new();
        for (base, down) in downs {
            let Some(up) = ups.remove(&base) else {
                warn!(layer = %base, "down tensor without matching up tensor");
                continue;
            };
            let Some(target) = lora_key_to_flux(&base) else {
                warn!(layer = %base, "no matching model parameter, skipping");
                continue;
            };
            let rank = down.dims().first().copied().unwrap_or(1);
            let alpha = alphas.get(&base).copied().unwrap_or(rank as f32);
            weights.insert(target, LoraWeight { down, up, alpha, rank });
        }
        for base in ups.keys() {
            warn!(layer = %base, "up tensor without matching down tensor");
        }

        anyhow::ensure!(
            !weights.is_empty(),
            "adapter {} contains no usable weight pairs",
            path.display()
        );
        info!(path = %path.display(), layers = weights.len(), "lora adapter loaded");
        Ok(Self { weights })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Fuses the adapter into a base weight map at the given strength.
    /// The delta is computed in f32 and cast back to the base dtype.
    pub fn fuse_into(&self, tensors: &mut HashMap<String, Tensor>, scale: f64) -> Result<usize> {
        let mut fused = 0;
        for (name, weight) in &self.weights {
            let Some(base) = tensors.get(name).cloned() else {
                warn!(param = %name, "adapter targets an unknown parameter");
                continue;
            };
            let factor = scale * f64::from(weight.alpha) / weight.rank as f64;
            let delta = weight
                .up
                .to_dtype(DType::F32)?
                .matmul(&weight.down.to_dtype(DType::F32)?)?
                .affine(factor, 0.0)?;
            let merged = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            tensors.insert(name.clone(), merged);
            fused += 1;
        }
        anyhow::ensure!(fused > 0, "no adapter layer matched the base weights");
        info!(fused, scale, "lora weights fused");
        Ok(fused)
    }
}

fn strip_any_suffix(key: &str, suffixes: &[&str]) -> Option<String> {
    suffixes
        .iter()
        .find_map(|suffix| key.strip_suffix(suffix))
        .map(str::to_string)
}

/// Maps a kohya-style adapter key to a Flux parameter path, e.g.
/// `lora_unet_double_blocks_0_img_attn_qkv` to
/// `double_blocks.0.img_attn.qkv.weight`. Unknown layouts map to `None`.
fn lora_key_to_flux(key: &str) -> Option<String> {
    let key = key.strip_prefix("lora_unet_").unwrap_or(key);
    for blocks in ["double_blocks", "single_blocks"] {
        let Some(rest) = key.strip_prefix(blocks).and_then(|r| r.strip_prefix('_')) else {
            continue;
        };
        let (index, tail) = rest.split_once('_')?;
        if index.parse::<u32>().is_err() {
            return None;
        }
        let leaf = match tail {
            "img_attn_qkv" => "img_attn.qkv",
            "img_attn_proj" => "img_attn.proj",
            "txt_attn_qkv" => "txt_attn.qkv",
            "txt_attn_proj" => "txt_attn.proj",
            "img_mlp_0" => "img_mlp.0",
            "img_mlp_2" => "img_mlp.2",
            "txt_mlp_0" => "txt_mlp.0",
            "txt_mlp_2" => "txt_mlp.2",
            "img_mod_lin" => "img_mod.lin",
            "txt_mod_lin" => "txt_mod.lin",
            "linear1" => "linear1",
            "linear2" => "linear2",
            "modulation_lin" => "modulation.lin",
            _ => return None,
        };
        return Some(format!("{blocks}.{index}.{leaf}.weight"));
    }
    None
}
