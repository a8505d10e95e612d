use std::env;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SEEDS: [u64; 1] = [30498];
pub const DEFAULT_TEXT_MODEL: &str = "gpt-4o";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const TEXT_MODEL_ENV: &str = "SAPFLUX_TEXT_MODEL";
pub const MAX_TIMEOUT_S: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            num_inference_steps: 50,
            guidance_scale: 3.5,
        }
    }
}

impl GenerationSettings {
    pub fn image_size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Connection settings for the OpenAI chat-completions text backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBackendConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub timeout_s: f64,
    pub max_retries: usize,
    pub retry_backoff_s: f64,
}

impl Default for TextBackendConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            model: DEFAULT_TEXT_MODEL.to_string(),
            timeout_s: 120.0,
            max_retries: 2,
            retry_backoff_s: 1.5,
        }
    }
}

impl TextBackendConfig {
    /// `model` wins over `SAPFLUX_TEXT_MODEL`, which wins over the default.
    pub fn from_env(model: Option<String>) -> Self {
        let model = model
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| first_non_empty_env(&[TEXT_MODEL_ENV]))
            .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string());
        Self {
            api_key: first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]),
            api_base: openai_api_base(first_non_empty_env(&[
                "OPENAI_API_BASE",
                "OPENAI_BASE_URL",
            ])),
            model,
            ..Self::default()
        }
    }

    /// Non-positive or non-finite values keep the current timeout; anything
    /// above [`MAX_TIMEOUT_S`] is capped.
    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        if timeout_s.is_finite() && timeout_s > 0.0 {
            self.timeout_s = timeout_s.min(MAX_TIMEOUT_S);
        }
        self
    }
}

pub fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Normalizes a configured base URL; a bare host gets `/v1` appended.
pub fn openai_api_base(raw: Option<String>) -> String {
    let raw = raw.unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string());
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::{openai_api_base, GenerationSettings, TextBackendConfig, MAX_TIMEOUT_S};

    #[test]
    fn api_base_gets_version_path_only_when_missing() {
        assert_eq!(
            openai_api_base(Some("https://proxy.local/".to_string())),
            "https://proxy.local/v1"
        );
        assert_eq!(
            openai_api_base(Some("https://proxy.local/openai/v1/".to_string())),
            "https://proxy.local/openai/v1"
        );
        assert_eq!(openai_api_base(None), "https://api.openai.com/v1");
    }

    #[test]
    fn defaults_match_reference_run() {
        let settings = GenerationSettings::default();
        assert_eq!(settings.image_size(), "1024x1024");
        assert_eq!(settings.num_inference_steps, 50);

        let config = TextBackendConfig::from_env(Some("  gpt-4o-mini ".to_string()));
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.clone().with_timeout(-1.0).timeout_s, 120.0);
        assert_eq!(config.clone().with_timeout(f64::NAN).timeout_s, 120.0);
        assert_eq!(config.clone().with_timeout(30.0).timeout_s, 30.0);
        assert_eq!(config.with_timeout(1e300).timeout_s, MAX_TIMEOUT_S);
    }
}
