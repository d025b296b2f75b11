use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{imageops, DynamicImage, ImageFormat, RgbImage};

/// Writes the intermediate frames of one generation into the job folder:
/// one file per step plus a composite strip of every step so far.
pub struct StepwiseWriter {
    dir: PathBuf,
    seed: u64,
    total_steps: usize,
    composite_suffix: String,
    frames: Vec<RgbImage>,
}

impl StepwiseWriter {
    pub fn new(dir: &Path, seed: u64, total_steps: usize, composite_suffix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            seed,
            total_steps,
            composite_suffix: composite_suffix.to_string(),
            frames: Vec::new(),
        }
    }

    pub fn step_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!(
            "seed_{}_step{}of{}.png",
            self.seed, step, self.total_steps
        ))
    }

    pub fn composite_path(&self) -> PathBuf {
        self.dir
            .join(format!("seed_{}{}", self.seed, self.composite_suffix))
    }

    pub fn record(&mut self, step: usize, frame: &DynamicImage) -> Result<()> {
        let frame = frame.to_rgb8();
        let path = self.step_path(step);
        frame
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.frames.push(frame);
        self.write_composite()
    }

    /// The composite is staged under a hidden name and renamed into place, so
    /// a reader sees either the previous strip or the new one.
    fn write_composite(&self) -> Result<()> {
        let Some(first) = self.frames.first() else {
            return Ok(());
        };
        let (width, height) = first.dimensions();
        let mut strip = RgbImage::new(width * self.frames.len() as u32, height);
        for (i, frame) in self.frames.iter().enumerate() {
            imageops::replace(&mut strip, frame, i as i64 * width as i64, 0);
        }

        let target = self.composite_path();
        let format = ImageFormat::from_path(&target).unwrap_or(ImageFormat::Png);
        let staging = self
            .dir
            .join(format!(".seed_{}_composite.partial", self.seed));
        strip
            .save_with_format(&staging, format)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &target)
            .with_context(|| format!("failed to publish {}", target.display()))?;
        Ok(())
    }
}
