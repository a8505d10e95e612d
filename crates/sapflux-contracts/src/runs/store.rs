use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::decomposition::{Decomposition, DecompositionOrigin, DecompositionRecord};
use crate::events::now_utc_iso;

pub const DEFAULT_STORE_FILE: &str = "SAP_prompts.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: u64,
    pub original_prompt: String,
    pub decomposition: Option<DecompositionRecord>,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_prompts: usize,
    pub successfully_decomposed: usize,
    pub failed: usize,
    pub success_rate: String,
}

/// Pre-generated decompositions keyed by prompt text (`SAP_prompts.json`).
#[derive(Debug, Clone, Default)]
pub struct DecompositionStore {
    path: PathBuf,
    entries: Vec<StoredEntry>,
}

impl DecompositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    /// Loads `path`. Entries whose decomposition does not satisfy the
    /// schedule invariant are kept as undecomposed, with a warning.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        let rows = parsed
            .get("prompts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let Some(obj) = row.as_object() else {
                continue;
            };
            let Some(original_prompt) = obj.get("original_prompt").and_then(Value::as_str) else {
                continue;
            };
            let decomposition = match obj.get("sap_decomposition") {
                None | Some(Value::Null) => None,
                Some(value) => match serde_json::from_value::<DecompositionRecord>(value.clone()) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        tracing::warn!(
                            index = idx,
                            path = %path.display(),
                            error = %err,
                            "ignoring stored decomposition that fails validation"
                        );
                        None
                    }
                },
            };
            entries.push(StoredEntry {
                id: obj
                    .get("id")
                    .and_then(Value::as_u64)
                    .unwrap_or(idx as u64 + 1),
                original_prompt: original_prompt.to_string(),
                decomposition,
                origin: obj
                    .get("origin")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(Self { path, entries })
    }

    pub fn from_decompositions(
        path: impl Into<PathBuf>,
        prompts: &[String],
        decompositions: &[Decomposition],
    ) -> Self {
        let entries = prompts
            .iter()
            .zip(decompositions)
            .enumerate()
            .map(|(idx, (prompt, decomposition))| StoredEntry {
                id: idx as u64 + 1,
                original_prompt: prompt.clone(),
                decomposition: Some(decomposition.record.clone()),
                origin: Some(decomposition.origin.label().to_string()),
            })
            .collect();
        Self {
            path: path.into(),
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[StoredEntry] {
        &self.entries
    }

    /// First valid record stored for exactly this prompt text.
    pub fn get(&self, original_prompt: &str) -> Option<&DecompositionRecord> {
        self.entries.iter().find_map(|entry| {
            (entry.original_prompt == original_prompt)
                .then_some(entry.decomposition.as_ref())
                .flatten()
        })
    }

    pub fn get_batch(&self, prompts: &[String]) -> Vec<Option<DecompositionRecord>> {
        prompts
            .iter()
            .map(|prompt| self.get(prompt).cloned())
            .collect()
    }

    /// Batch lookup tagged as stored, ready to merge with fresh results.
    pub fn lookup(&self, prompts: &[String]) -> Vec<Option<Decomposition>> {
        self.get_batch(prompts)
            .into_iter()
            .map(|record| {
                record.map(|record| Decomposition {
                    record,
                    origin: DecompositionOrigin::Stored,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let total_prompts = self.entries.len();
        let successfully_decomposed = self
            .entries
            .iter()
            .filter(|entry| entry.decomposition.is_some())
            .count();
        let success_rate = if total_prompts == 0 {
            "0%".to_string()
        } else {
            format!(
                "{:.1}%",
                successfully_decomposed as f64 * 100.0 / total_prompts as f64
            )
        };
        StoreStats {
            total_prompts,
            successfully_decomposed,
            failed: total_prompts - successfully_decomposed,
            success_rate,
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let fallback_count = self
            .entries
            .iter()
            .filter(|entry| entry.origin.as_deref() == Some("fallback"))
            .count();
        let stats = self.stats();
        let prompts = self
            .entries
            .iter()
            .map(|entry| {
                let mut row = Map::new();
                row.insert("id".to_string(), json!(entry.id));
                row.insert(
                    "original_prompt".to_string(),
                    Value::String(entry.original_prompt.clone()),
                );
                row.insert(
                    "sap_decomposition".to_string(),
                    serde_json::to_value(&entry.decomposition)?,
                );
                if let Some(origin) = &entry.origin {
                    row.insert("origin".to_string(), Value::String(origin.clone()));
                }
                Ok(Value::Object(row))
            })
            .collect::<anyhow::Result<Vec<Value>>>()?;
        let payload = json!({
            "metadata": {
                "generated_at": now_utc_iso(),
                "total_prompts": stats.total_prompts,
                "successfully_decomposed": stats.successfully_decomposed,
                "fallback_count": fallback_count,
            },
            "prompts": prompts,
        });

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::DecompositionStore;
    use crate::decomposition::{
        synthesize_fallback, Decomposition, DecompositionOrigin, DecompositionRecord,
        FallbackPolicy,
    };

    fn prompts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn save_then_load_keeps_order_and_origin() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("SAP_prompts.json");
        let input = prompts(&["A dragon blowing water", "A red ball"]);
        let decompositions = vec![
            Decomposition {
                record: DecompositionRecord::new(
                    "smoke first",
                    prompts(&["A dragon blowing white smoke", "A dragon blowing water"]),
                    vec![3],
                )?,
                origin: DecompositionOrigin::Parsed,
            },
            Decomposition {
                record: synthesize_fallback("A red ball", &FallbackPolicy::default()),
                origin: DecompositionOrigin::Fallback {
                    reason: "segment is empty".to_string(),
                },
            },
        ];
        DecompositionStore::from_decompositions(&path, &input, &decompositions).save()?;

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["metadata"]["total_prompts"], json!(2));
        assert_eq!(raw["metadata"]["fallback_count"], json!(1));
        assert_eq!(raw["prompts"][0]["id"], json!(1));
        assert_eq!(
            raw["prompts"][0]["sap_decomposition"]["switch_prompts_steps"],
            json!([3])
        );

        let store = DecompositionStore::load(&path)?;
        assert_eq!(store.entries().len(), 2);
        assert_eq!(store.get("A dragon blowing water"), Some(&decompositions[0].record));
        assert_eq!(store.entries()[1].origin.as_deref(), Some("fallback"));
        let looked_up = store.lookup(&prompts(&["A red ball", "unknown"]));
        assert_eq!(
            looked_up[0].as_ref().map(|found| &found.origin),
            Some(&DecompositionOrigin::Stored)
        );
        assert!(looked_up[1].is_none());
        Ok(())
    }

    #[test]
    fn invalid_or_null_entries_count_as_failed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("SAP_prompts.json");
        let payload = json!({
            "metadata": {},
            "prompts": [
                {"id": 1, "original_prompt": "ok", "sap_decomposition": {
                    "explanation": "", "prompts_list": ["ok"], "switch_prompts_steps": []
                }},
                {"id": 2, "original_prompt": "broken", "sap_decomposition": {
                    "explanation": "", "prompts_list": ["a", "b"], "switch_prompts_steps": []
                }},
                {"id": 3, "original_prompt": "missing", "sap_decomposition": null},
                {"id": 4, "original_prompt": "ok", "sap_decomposition": {
                    "prompts_list": ["second"], "switch_prompts_steps": []
                }},
            ]
        });
        std::fs::write(&path, serde_json::to_string(&payload)?)?;

        let store = DecompositionStore::load(&path)?;
        assert_eq!(store.get("ok").map(|record| record.stages()[0].as_str()), Some("ok"));
        assert!(store.get("broken").is_none());
        assert!(store.get("missing").is_none());
        let stats = store.stats();
        assert_eq!(stats.total_prompts, 4);
        assert_eq!(stats.successfully_decomposed, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.success_rate, "50.0%");
        Ok(())
    }

    #[test]
    fn later_valid_duplicate_wins_over_invalid_entry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("SAP_prompts.json");
        let payload = json!({
            "metadata": {},
            "prompts": [
                {"id": 1, "original_prompt": "A red ball", "sap_decomposition": null},
                {"id": 2, "original_prompt": "A red ball", "sap_decomposition": {
                    "explanation": "", "prompts_list": ["a", "b"], "switch_prompts_steps": []
                }},
                {"id": 3, "original_prompt": "A red ball", "sap_decomposition": {
                    "explanation": "kept", "prompts_list": ["A red ball"],
                    "switch_prompts_steps": []
                }},
            ]
        });
        std::fs::write(&path, serde_json::to_string(&payload)?)?;

        let store = DecompositionStore::load(&path)?;
        let found = store.get("A red ball").map(|record| record.explanation());
        assert_eq!(found, Some("kept"));
        assert!(store.lookup(&prompts(&["A red ball"]))[0].is_some());
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(DecompositionStore::load("/nonexistent/SAP_prompts.json").is_err());
    }
}
