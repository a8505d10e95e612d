use std::fmt::Display;
use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;

/// Flat `key: value` metadata, written in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFile {
    entries: IndexMap<String, String>,
}

impl MetadataFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values are flattened onto a single line so every entry stays one
    /// `key: value` row.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Display) -> &mut Self {
        let flat = value
            .to_string()
            .split_whitespace()
            .collect::<Vec<&str>>()
            .join(" ");
        self.entries.insert(key.into(), flat);
        self
    }

    pub fn insert_list<T: Display>(&mut self, key: impl Into<String>, values: &[T]) -> &mut Self {
        let joined = values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<String>>()
            .join(", ");
        self.insert(key, format!("[{joined}]"))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{key}: {value}\n"))
            .collect()
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())
            .with_context(|| format!("failed writing {}", path.display()))
    }
}
