use std::path::Path;

use anyhow::Context;

use super::segment::{find_sentinels, SENTINEL_WORD};

const DEFAULT_SYSTEM_TEMPLATE: &str = include_str!("../../resources/template_sap_system.txt");
const DEFAULT_USER_TEMPLATE: &str = include_str!("../../resources/template_sap_user.txt");

pub const SYSTEM_TEMPLATE_FILE: &str = "template_sap_system.txt";
pub const USER_TEMPLATE_FILE: &str = "template_sap_user.txt";
pub const OUTPUT_MARKER: &str = "### Output:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub system: String,
    pub user: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            user: DEFAULT_USER_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Loads both templates from `dir`; a missing file keeps the built-in text.
    pub fn from_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut templates = Self::default();
        let system_path = dir.join(SYSTEM_TEMPLATE_FILE);
        if system_path.exists() {
            templates.system = std::fs::read_to_string(&system_path)
                .with_context(|| format!("failed reading {}", system_path.display()))?;
        }
        let user_path = dir.join(USER_TEMPLATE_FILE);
        if user_path.exists() {
            templates.user = std::fs::read_to_string(&user_path)
                .with_context(|| format!("failed reading {}", user_path.display()))?;
        }
        Ok(templates)
    }
}

/// The rendered wire payload for one decomposition round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPayload {
    pub system: String,
    pub user: String,
    pub prompt_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    prompts: &'a [String],
    templates: &'a PromptTemplates,
}

impl<'a> BatchRequest<'a> {
    pub fn new(prompts: &'a [String], templates: &'a PromptTemplates) -> Self {
        Self { prompts, templates }
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn render(&self) -> BatchPayload {
        let blocks = self
            .prompts
            .iter()
            .enumerate()
            .map(|(idx, prompt)| {
                format!(
                    "{} {}\n{OUTPUT_MARKER}",
                    sentinel(idx + 1),
                    normalize_prompt_text(prompt)
                )
            })
            .collect::<Vec<String>>();
        BatchPayload {
            system: self.templates.system.trim().to_string(),
            user: format!("{}\n\n{}", self.templates.user.trim(), blocks.join("\n\n")),
            prompt_count: self.prompts.len(),
        }
    }
}

pub fn sentinel(position: usize) -> String {
    format!("### {SENTINEL_WORD} {position}:")
}

/// Flattens a prompt onto one line and defuses anything that would read as
/// a sentinel, so only the builder's own markers can appear in the payload.
pub fn normalize_prompt_text(prompt: &str) -> String {
    let mut flat = prompt.split_whitespace().collect::<Vec<&str>>().join(" ");
    let colons = find_sentinels(&flat)
        .into_iter()
        .map(|found| found.colon)
        .collect::<Vec<usize>>();
    for colon in colons.into_iter().rev() {
        flat.replace_range(colon..colon + 1, " -");
    }
    flat
}

/// Recovers the prompt texts embedded in the last `expected` sentinel blocks
/// of a rendered user payload.
pub fn read_request_prompts(user: &str, expected: usize) -> Vec<String> {
    let sentinels = find_sentinels(user);
    let skip = sentinels.len().saturating_sub(expected);
    sentinels
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(idx, found)| {
            let stop = sentinels
                .get(idx + 1)
                .map(|next| next.start)
                .unwrap_or(user.len());
            let block = &user[found.end..stop];
            block
                .split(OUTPUT_MARKER)
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
        .collect()
}
