use std::path::Path;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use sapflux_contracts::decomposition::DecompositionRecord;
use sapflux_contracts::runs::layout::GenerationMode;
use sha2::{Digest, Sha256};

use crate::config::GenerationSettings;

pub const DRYRUN_IMAGE_BACKEND: &str = "dryrun";

/// What the generation backend conditions on for one job.
#[derive(Debug, Clone, Copy)]
pub enum JobInput<'a> {
    Prompt(&'a str),
    Staged(&'a DecompositionRecord),
}

#[derive(Debug, Clone, Copy)]
pub struct ImageJob<'a> {
    pub prompt_index: usize,
    pub mode: GenerationMode,
    pub seed: u64,
    pub input: JobInput<'a>,
    pub settings: &'a GenerationSettings,
}

/// Exclusive handle to a generation device. Jobs are fed one at a time and
/// the handle is released once, at the end of the run.
pub trait ImageBackend {
    fn name(&self) -> &str;
    fn generate(&mut self, job: &ImageJob<'_>) -> Result<RgbImage>;
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Offline renderer: one horizontal band per stage, sized by the number of
/// steps that stage is active, colored from the stage text and seed.
#[derive(Debug, Default)]
pub struct DryrunImageBackend {
    generated: u64,
}

impl DryrunImageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }
}

impl ImageBackend for DryrunImageBackend {
    fn name(&self) -> &str {
        DRYRUN_IMAGE_BACKEND
    }

    fn generate(&mut self, job: &ImageJob<'_>) -> Result<RgbImage> {
        let (width, height) = (job.settings.width.max(1), job.settings.height.max(1));
        let bands = match job.input {
            JobInput::Prompt(prompt) => vec![(prompt, 1u32)],
            JobInput::Staged(record) => record
                .stages()
                .iter()
                .map(String::as_str)
                .zip(record.stage_spans(job.settings.num_inference_steps))
                .filter(|(_, span)| *span > 0)
                .collect(),
        };
        let image = render_bands(width, height, &bands, job.seed);
        self.generated += 1;
        Ok(image)
    }

    fn release(&mut self) -> Result<()> {
        tracing::debug!(generated = self.generated, "released dryrun image backend");
        Ok(())
    }
}

fn render_bands(width: u32, height: u32, bands: &[(&str, u32)], seed: u64) -> RgbImage {
    let mut image = RgbImage::new(width, height);
    let total = bands.iter().map(|(_, span)| u64::from(*span)).sum::<u64>();
    if total == 0 {
        return image;
    }
    let mut row = 0u32;
    let mut covered = 0u64;
    for (idx, (text, span)) in bands.iter().enumerate() {
        covered += u64::from(*span);
        let end = if idx + 1 == bands.len() {
            height
        } else {
            u32::try_from(u64::from(height) * covered / total).unwrap_or(height)
        };
        let (r, g, b) = color_from_prompt(text, seed);
        for y in row..end {
            for x in 0..width {
                image.put_pixel(x, y, Rgb([r, g, b]));
            }
        }
        row = end;
    }
    image
}

pub fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Writes through a sibling temp file so an interrupted run never leaves a
/// truncated PNG at `path`.
pub fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("png.partial");
    image
        .save_with_format(&tmp, ImageFormat::Png)
        .with_context(|| format!("failed to save {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move image into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use image::Rgb;
    use sapflux_contracts::decomposition::DecompositionRecord;
    use sapflux_contracts::runs::layout::GenerationMode;

    use super::{color_from_prompt, save_png, DryrunImageBackend, ImageBackend, ImageJob, JobInput};
    use crate::config::GenerationSettings;

    fn settings() -> GenerationSettings {
        GenerationSettings {
            width: 8,
            height: 10,
            num_inference_steps: 10,
            guidance_scale: 3.5,
        }
    }

    #[test]
    fn staged_job_paints_one_band_per_active_stage() -> anyhow::Result<()> {
        let record = DecompositionRecord::new(
            "",
            vec![
                "A dragon blowing white smoke".to_string(),
                "A dragon blowing water".to_string(),
                "never reached".to_string(),
            ],
            vec![3, 40],
        )?;
        let settings = settings();
        let mut backend = DryrunImageBackend::new();
        let image = backend.generate(&ImageJob {
            prompt_index: 0,
            mode: GenerationMode::Sap,
            seed: 30498,
            input: JobInput::Staged(&record),
            settings: &settings,
        })?;

        let (r, g, b) = color_from_prompt("A dragon blowing white smoke", 30498);
        assert_eq!(image.get_pixel(0, 0), &Rgb([r, g, b]));
        assert_eq!(image.get_pixel(7, 2), &Rgb([r, g, b]));
        let (r, g, b) = color_from_prompt("A dragon blowing water", 30498);
        assert_eq!(image.get_pixel(0, 3), &Rgb([r, g, b]));
        assert_eq!(image.get_pixel(7, 9), &Rgb([r, g, b]));
        assert_eq!(backend.generated(), 1);
        Ok(())
    }

    #[test]
    fn direct_job_is_uniform_and_seed_dependent() -> anyhow::Result<()> {
        let settings = settings();
        let mut backend = DryrunImageBackend::new();
        let mut job = ImageJob {
            prompt_index: 0,
            mode: GenerationMode::Direct,
            seed: 1,
            input: JobInput::Prompt("Shrek is blue"),
            settings: &settings,
        };
        let first = backend.generate(&job)?;
        assert_eq!(first.get_pixel(0, 0), first.get_pixel(7, 9));
        job.seed = 2;
        let second = backend.generate(&job)?;
        assert_ne!(first, second);
        backend.release()?;
        Ok(())
    }

    #[test]
    fn save_png_leaves_only_final_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("sap").join("001_x").join("sap_seed_1.png");
        let settings = settings();
        let image = DryrunImageBackend::new().generate(&ImageJob {
            prompt_index: 0,
            mode: GenerationMode::Direct,
            seed: 1,
            input: JobInput::Prompt("x"),
            settings: &settings,
        })?;
        save_png(&image, &path)?;
        let decoded = image::open(&path)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 10));
        let leftovers = std::fs::read_dir(path.parent().unwrap_or(temp.path()))?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }
}
