use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::tokio::ApiRepo;
use image::{imageops::FilterType, DynamicImage};

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    let device = match device_map {
        DeviceMap::ForceCpu => Device::Cpu,
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal)?,
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal)?,
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Device::Cpu
        }
    };
    tracing::info!(device = ?device, "selected device");
    Ok(device)
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Loads an image, resizes it to exactly `width` x `height` and returns a
/// (1, 3, height, width) tensor scaled to [-1, 1].
pub fn image_to_tensor(
    path: &Path,
    width: usize,
    height: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let img = image::open(path)
        .with_context(|| format!("failed to open init image {}", path.display()))?
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8();
    let tensor = Tensor::from_vec(img.into_raw(), (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_dtype(dtype)?;
    Ok(tensor)
}

/// Takes `file` from `local_dir` when it exists there, otherwise from the hub.
pub(crate) async fn fetch_file(
    repo: &ApiRepo,
    local_dir: Option<&Path>,
    file: &str,
) -> Result<PathBuf> {
    if let Some(dir) = local_dir {
        let candidate = dir.join(file);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "using local weights");
            return Ok(candidate);
        }
    }
    repo.get(file)
        .await
        .with_context(|| format!("failed to fetch {file}"))
}

/// Downloads every shard listed in a sharded safetensors index.
pub(crate) async fn hub_load_safetensors(repo: &ApiRepo, index_file: &str) -> Result<Vec<PathBuf>> {
    let index_path = repo
        .get(index_file)
        .await
        .with_context(|| format!("failed to fetch {index_file}"))?;
    let index = std::fs::read_to_string(&index_path)?;
    let shards = safetensors_shards(&index)?;
    let mut files = Vec::with_capacity(shards.len());
    for shard in &shards {
        files.push(
            repo.get(shard)
                .await
                .with_context(|| format!("failed to fetch {shard}"))?,
        );
    }
    Ok(files)
}

fn safetensors_shards(index: &str) -> Result<BTreeSet<String>> {
    let json: serde_json::Value =
        serde_json::from_str(index).context("failed to parse safetensors index")?;
    let weight_map = json
        .get("weight_map")
        .and_then(|map| map.as_object())
        .context("safetensors index has no weight_map")?;
    Ok(weight_map
        .values()
        .filter_map(|file| file.as_str().map(str::to_string))
        .collect())
}
