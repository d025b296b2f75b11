//! LoRA merging for the full-precision FLUX transformer.
//!
//! Each adapter pair `down`/`up` (`lora_A`/`lora_B` in peft naming) is folded
//! into the matching base weight as `W += scale * alpha / rank * up @ down`.
//! The merged tensors then back a regular `VarBuilder`, so the model itself
//! never knows an adapter was applied.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};

/// Name prefixes trainers put in front of the transformer's own keys.
const KEY_PREFIXES: [&str; 3] = ["diffusion_model.", "transformer.", "model."];

/// `(down, up)` suffixes of one low-rank pair.
const PAIR_SUFFIXES: [(&str, &str); 2] = [
    (".lora_A.weight", ".lora_B.weight"),
    (".lora_down.weight", ".lora_up.weight"),
];

#[derive(Debug, Default, PartialEq)]
pub struct MergeStats {
    pub merged: usize,
    /// Adapter prefixes with no counterpart in the base weights.
    pub skipped: Vec<String>,
}

fn base_key(prefix: &str) -> String {
    let stripped = KEY_PREFIXES
        .iter()
        .find_map(|p| prefix.strip_prefix(p))
        .unwrap_or(prefix);
    format!("{stripped}.weight")
}

fn scalar(t: &Tensor) -> Result<f64> {
    let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let first = values.first().context("empty alpha tensor")?;
    Ok(*first as f64)
}

/// Folds every adapter pair of `lora` into `base`, scaled by `scale`.
pub fn merge_lora(
    base: &mut HashMap<String, Tensor>,
    lora: &HashMap<String, Tensor>,
    scale: f64,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();
    let mut keys: Vec<&String> = lora.keys().collect();
    keys.sort();

    for key in keys {
        let Some((prefix, up_suffix)) = PAIR_SUFFIXES
            .iter()
            .find_map(|(down, up)| key.strip_suffix(down).map(|prefix| (prefix, *up)))
        else {
            continue;
        };
        let down = &lora[key];
        let Some(up) = lora.get(&format!("{prefix}{up_suffix}")) else {
            stats.skipped.push(prefix.to_string());
            continue;
        };
        let target = base_key(prefix);
        let Some(weight) = base.get(&target) else {
            stats.skipped.push(prefix.to_string());
            continue;
        };

        let rank = down.dim(0)?;
        let factor = match lora.get(&format!("{prefix}.alpha")) {
            Some(alpha) => scale * scalar(alpha)? / rank as f64,
            None => scale,
        };
        let delta = (up.to_dtype(DType::F32)?.matmul(&down.to_dtype(DType::F32)?)? * factor)?;
        if delta.dims() != weight.dims() {
            bail!(
                "LoRA {prefix} has shape {:?}, {target} is {:?}",
                delta.dims(),
                weight.dims()
            );
        }
        let merged = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(weight.dtype())?;
        base.insert(target, merged);
        stats.merged += 1;
    }
    Ok(stats)
}

/// Loads the transformer weights from `flux_file` with every adapter in
/// `loras` merged in, in order.
pub fn load_merged(
    flux_file: &Path,
    loras: &[(PathBuf, f64)],
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut weights = candle_core::safetensors::load(flux_file, device)
        .with_context(|| format!("failed to read {}", flux_file.display()))?;
    for (path, scale) in loras {
        let lora = candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to read LoRA {}", path.display()))?;
        let stats = merge_lora(&mut weights, &lora, *scale)
            .with_context(|| format!("failed to merge LoRA {}", path.display()))?;
        if stats.merged == 0 {
            bail!(
                "LoRA {} matched none of the transformer weights",
                path.display()
            );
        }
        if !stats.skipped.is_empty() {
            tracing::warn!(
                lora = %path.display(),
                skipped = stats.skipped.len(),
                first = %stats.skipped[0],
                "some LoRA layers have no matching weight"
            );
        }
        tracing::info!(lora = %path.display(), scale, merged = stats.merged, "merged LoRA");
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(data, shape, &Device::Cpu).unwrap()
    }

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2::<f32>().unwrap()
    }

    fn base() -> HashMap<String, Tensor> {
        HashMap::from([
            (
                "double_blocks.0.img_attn.qkv.weight".to_string(),
                Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
            ),
            (
                "final_layer.linear.weight".to_string(),
                Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
            ),
        ])
    }

    fn adapter() -> HashMap<String, Tensor> {
        HashMap::from([
            (
                "diffusion_model.double_blocks.0.img_attn.qkv.lora_A.weight".to_string(),
                t(&[1., 2., 3.], (1, 3)),
            ),
            (
                "diffusion_model.double_blocks.0.img_attn.qkv.lora_B.weight".to_string(),
                t(&[1., 2.], (2, 1)),
            ),
            (
                "transformer.final_layer.linear.lora_down.weight".to_string(),
                t(&[1., 1.], (1, 2)),
            ),
            (
                "transformer.final_layer.linear.lora_up.weight".to_string(),
                t(&[1., 0.], (2, 1)),
            ),
            (
                "transformer.final_layer.linear.alpha".to_string(),
                Tensor::new(0.5f32, &Device::Cpu).unwrap(),
            ),
            (
                "diffusion_model.not_in_flux.lora_A.weight".to_string(),
                t(&[1.], (1, 1)),
            ),
            (
                "diffusion_model.not_in_flux.lora_B.weight".to_string(),
                t(&[1.], (1, 1)),
            ),
        ])
    }

    #[test]
    fn pairs_are_folded_into_matching_weights() {
        let mut weights = base();
        let stats = merge_lora(&mut weights, &adapter(), 2.0).unwrap();

        assert_eq!(stats.merged, 2);
        assert_eq!(stats.skipped, vec!["diffusion_model.not_in_flux"]);
        // 2 * up @ down
        assert_eq!(
            rows(&weights["double_blocks.0.img_attn.qkv.weight"]),
            vec![vec![2., 4., 6.], vec![4., 8., 12.]]
        );
        // ones + 2 * (0.5 / rank 1) * up @ down
        assert_eq!(
            rows(&weights["final_layer.linear.weight"]),
            vec![vec![2., 2.], vec![1., 1.]]
        );
    }

    #[test]
    fn mismatched_shapes_are_an_error() {
        let mut weights = base();
        let lora = HashMap::from([
            ("double_blocks.0.img_attn.qkv.lora_A.weight".to_string(), t(&[1., 1.], (1, 2))),
            ("double_blocks.0.img_attn.qkv.lora_B.weight".to_string(), t(&[1., 1.], (2, 1))),
        ]);
        assert!(merge_lora(&mut weights, &lora, 1.0).is_err());
    }

    #[test]
    fn loads_and_merges_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let flux_file = dir.path().join("flux.safetensors");
        let lora_file = dir.path().join("style.safetensors");
        candle_core::safetensors::save(&base(), &flux_file).unwrap();
        candle_core::safetensors::save(&adapter(), &lora_file).unwrap();

        let loras = vec![(lora_file.clone(), 1.0), (lora_file, -1.0)];
        let weights = load_merged(&flux_file, &loras, &Device::Cpu).unwrap();

        // applying the same adapter with opposite scales cancels out
        assert_eq!(
            rows(&weights["double_blocks.0.img_attn.qkv.weight"]),
            vec![vec![0.; 3]; 2]
        );
        assert_eq!(
            rows(&weights["final_layer.linear.weight"]),
            vec![vec![1., 1.]; 2]
        );
    }

    #[test]
    fn adapter_for_another_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let flux_file = dir.path().join("flux.safetensors");
        let lora_file = dir.path().join("sdxl.safetensors");
        candle_core::safetensors::save(&base(), &flux_file).unwrap();
        let unrelated = HashMap::from([
            ("lora_unet_down.lora_down.weight".to_string(), t(&[1.], (1, 1))),
            ("lora_unet_down.lora_up.weight".to_string(), t(&[1.], (1, 1))),
        ]);
        candle_core::safetensors::save(&unrelated, &lora_file).unwrap();

        let err = load_merged(&flux_file, &[(lora_file, 1.0)], &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("matched none"));
    }
}
