use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const RUN_DIR_PREFIX: &str = "batch";
pub const METADATA_FILE: &str = "metadata.txt";
pub const SUMMARY_FILE: &str = "summary.json";
pub const EVENTS_FILE: &str = "events.jsonl";
const SLUG_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Direct,
    Sap,
}

impl GenerationMode {
    pub const ALL: [GenerationMode; 2] = [GenerationMode::Direct, GenerationMode::Sap];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Sap => "sap",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "sap" => Ok(Self::Sap),
            other => Err(format!("unknown generation mode '{other}'")),
        }
    }
}

/// Directory contract for one run:
/// `<run_dir>/<mode>/<NNN>_<slug>/<mode>_seed_<seed>.png`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    run_dir: PathBuf,
}

impl RunLayout {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// A fresh `batch_<YYYYmmdd_HHMMSS>` directory under `base`.
    pub fn timestamped(base: &Path, now: DateTime<Local>) -> Self {
        Self::new(base.join(format!(
            "{RUN_DIR_PREFIX}_{}",
            now.format("%Y%m%d_%H%M%S")
        )))
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_id(&self) -> String {
        self.run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("run")
            .to_string()
    }

    pub fn events_path(&self) -> PathBuf {
        self.run_dir.join(EVENTS_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_dir.join(SUMMARY_FILE)
    }

    pub fn mode_dir(&self, mode: GenerationMode) -> PathBuf {
        self.run_dir.join(mode.as_str())
    }

    pub fn metadata_path(&self, mode: GenerationMode) -> PathBuf {
        self.mode_dir(mode).join(METADATA_FILE)
    }

    /// `index` is the 0-based prompt position; directories are numbered from 1.
    pub fn prompt_dir(&self, mode: GenerationMode, index: usize, prompt: &str) -> PathBuf {
        self.mode_dir(mode)
            .join(format!("{:03}_{}", index + 1, prompt_slug(prompt)))
    }

    pub fn image_path(
        &self,
        mode: GenerationMode,
        index: usize,
        prompt: &str,
        seed: u64,
    ) -> PathBuf {
        self.prompt_dir(mode, index, prompt)
            .join(format!("{}_seed_{seed}.png", mode.as_str()))
    }
}

pub fn prompt_slug(prompt: &str) -> String {
    let slug = prompt
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<String>>()
        .join("_");
    let truncated = slug.chars().take(SLUG_MAX_CHARS).collect::<String>();
    let trimmed = truncated.trim_end_matches('_');
    if trimmed.is_empty() {
        "prompt".to_string()
    } else {
        trimmed.to_string()
    }
}
