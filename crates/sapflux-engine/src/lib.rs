pub mod config;
pub mod decompose;
pub mod image_backend;
pub mod orchestrator;
pub mod text;

use std::path::PathBuf;

use anyhow::{bail, Result};
use sapflux_contracts::decomposition::Decomposition;
use sapflux_contracts::events::{
    now_utc_iso, EventPayload, EventWriter, RUN_FINISHED, RUN_STARTED,
};
use sapflux_contracts::runs::layout::{GenerationMode, RunLayout};
use sapflux_contracts::runs::metadata::MetadataFile;
use sapflux_contracts::runs::store::{DecompositionStore, DEFAULT_STORE_FILE};
use sapflux_contracts::runs::summary::{write_summary, RunSummary};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::GenerationSettings;
use crate::decompose::DecompositionService;
use crate::image_backend::ImageBackend;
use crate::orchestrator::{GenerationOrchestrator, RunReport};

/// Everything a generation pass needs besides its backends.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub prompts: Vec<String>,
    pub modes: Vec<GenerationMode>,
    pub seeds: Vec<u64>,
    pub settings: GenerationSettings,
}

impl RunPlan {
    pub fn modes_in_order(&self) -> Vec<GenerationMode> {
        let mut modes = self.modes.clone();
        modes.sort();
        modes.dedup();
        modes
    }
}

/// One batch run on disk: owns the run directory, its event log and the
/// final summary.
pub struct SapRun {
    layout: RunLayout,
    run_id: String,
    events: EventWriter,
    started_at: String,
    decompositions: Option<Vec<Decomposition>>,
    text_backend: Option<String>,
    image_backend: Option<String>,
}

impl SapRun {
    pub fn new(layout: RunLayout) -> Result<Self> {
        std::fs::create_dir_all(layout.run_dir())?;
        let run_id = layout.run_id();
        let events = EventWriter::new(layout.events_path(), run_id.clone());
        let started_at = now_utc_iso();

        events.emit(
            RUN_STARTED,
            map_object(json!({
                "out_dir": layout.run_dir().to_string_lossy().to_string(),
            })),
        )?;
        tracing::info!(run_id = %run_id, out_dir = %layout.run_dir().display(), "run started");

        Ok(Self {
            layout,
            run_id,
            events,
            started_at,
            decompositions: None,
            text_backend: None,
            image_backend: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn decompositions(&self) -> Option<&[Decomposition]> {
        self.decompositions.as_deref()
    }

    /// Decomposes (sap mode only), generates every job, releases the image
    /// backend and writes the per-mode metadata files.
    pub fn execute(
        &mut self,
        plan: &RunPlan,
        decomposer: Option<&DecompositionService>,
        store: Option<&DecompositionStore>,
        image_backend: Box<dyn ImageBackend>,
    ) -> Result<RunReport> {
        let modes = plan.modes_in_order();
        if modes.contains(&GenerationMode::Sap) {
            let Some(decomposer) = decomposer else {
                bail!("sap mode needs a decomposition text backend");
            };
            let decompositions = match store {
                Some(store) => decomposer.decompose_with_store(&plan.prompts, store)?,
                None => decomposer.decompose_detailed(&plan.prompts)?,
            };
            self.text_backend = Some(decomposer.backend_name().to_string());
            DecompositionStore::from_decompositions(
                self.layout
                    .mode_dir(GenerationMode::Sap)
                    .join(DEFAULT_STORE_FILE),
                &plan.prompts,
                &decompositions,
            )
            .save()?;
            self.decompositions = Some(decompositions);
        }

        let records = self.decompositions.as_ref().map(|items| {
            items
                .iter()
                .map(|item| item.record.clone())
                .collect::<Vec<_>>()
        });
        self.image_backend = Some(image_backend.name().to_string());
        let mut orchestrator =
            GenerationOrchestrator::new(image_backend, self.layout.clone(), plan.settings)
                .with_events(self.events.clone());
        let report = orchestrator.run(&plan.prompts, &modes, &plan.seeds, records.as_deref())?;
        orchestrator.release()?;

        for mode in modes {
            self.mode_metadata(plan, mode, &report)
                .write(&self.layout.metadata_path(mode))?;
        }
        Ok(report)
    }

    pub fn mode_metadata(
        &self,
        plan: &RunPlan,
        mode: GenerationMode,
        report: &RunReport,
    ) -> MetadataFile {
        let succeeded = report.for_mode(mode).filter(|job| job.succeeded()).count();
        let total = report.for_mode(mode).count();
        let mut metadata = MetadataFile::new();
        metadata
            .insert("mode", mode)
            .insert("run_id", &self.run_id)
            .insert("num_prompts", plan.prompts.len())
            .insert("image_size", plan.settings.image_size())
            .insert("num_inference_steps", plan.settings.num_inference_steps)
            .insert("guidance_scale", plan.settings.guidance_scale)
            .insert_list("seeds", &plan.seeds)
            .insert("succeeded", succeeded)
            .insert("failed", total - succeeded);
        if let Some(backend) = &self.image_backend {
            metadata.insert("image_backend", backend);
        }

        if mode == GenerationMode::Sap {
            if let Some(backend) = &self.text_backend {
                metadata.insert("text_backend", backend);
            }
            if let Some(decompositions) = &self.decompositions {
                for (idx, (prompt, item)) in plan.prompts.iter().zip(decompositions).enumerate() {
                    let key = format!("prompt_{:03}", idx + 1);
                    metadata
                        .insert(key.clone(), prompt)
                        .insert_list(format!("{key}_stages"), item.record.stages())
                        .insert_list(format!("{key}_switch_steps"), item.record.switch_steps())
                        .insert(format!("{key}_origin"), item.origin.label());
                }
            }
        }
        metadata
    }

    pub fn finish(&mut self, report: &RunReport) -> Result<PathBuf> {
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_jobs: report.total() as u64,
            succeeded: report.succeeded() as u64,
            failed: report.failed() as u64,
            jobs: report.rows(),
        };
        let mut extra = Map::new();
        if let Some(backend) = &self.text_backend {
            extra.insert("text_backend".to_string(), json!(backend));
        }
        if let Some(backend) = &self.image_backend {
            extra.insert("image_backend".to_string(), json!(backend));
        }
        if let Some(decompositions) = &self.decompositions {
            let fallback = decompositions.iter().filter(|item| item.is_fallback()).count();
            extra.insert(
                "decompositions".to_string(),
                json!({
                    "total": decompositions.len(),
                    "fallback": fallback,
                    "fingerprint": decomposition_fingerprint(decompositions),
                }),
            );
        }
        let summary_path = self.layout.summary_path();
        write_summary(&summary_path, &summary, Some(&extra))?;

        self.events.emit(
            RUN_FINISHED,
            map_object(json!({
                "summary_path": summary_path.to_string_lossy().to_string(),
                "total_jobs": summary.total_jobs,
                "succeeded": summary.succeeded,
                "failed": summary.failed,
            })),
        )?;
        tracing::info!(
            run_id = %self.run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary_path)
    }
}

/// Stable digest of the decomposition schedule a run was generated with.
pub fn decomposition_fingerprint(decompositions: &[Decomposition]) -> String {
    let records = decompositions
        .iter()
        .map(|item| &item.record)
        .collect::<Vec<_>>();
    let bytes = serde_json::to_vec(&records).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use sapflux_contracts::decomposition::{FallbackPolicy, PromptTemplates};
    use sapflux_contracts::events::read_events;
    use sapflux_contracts::runs::layout::{GenerationMode, RunLayout};
    use sapflux_contracts::runs::store::DecompositionStore;
    use serde_json::{json, Value};

    use super::{RunPlan, SapRun};
    use crate::config::GenerationSettings;
    use crate::decompose::DecompositionService;
    use crate::image_backend::DryrunImageBackend;
    use crate::text::DryrunTextBackend;

    fn plan(modes: Vec<GenerationMode>) -> RunPlan {
        RunPlan {
            prompts: vec![
                "A grand castle and a stormy sky".to_string(),
                "A small dog runs fast today".to_string(),
                "A red ball".to_string(),
            ],
            modes,
            seeds: vec![30498, 7],
            settings: GenerationSettings {
                width: 16,
                height: 16,
                num_inference_steps: 50,
                guidance_scale: 3.5,
            },
        }
    }

    fn dryrun_service(run: &SapRun) -> DecompositionService {
        DecompositionService::new(
            Box::new(DryrunTextBackend::default()),
            PromptTemplates::default(),
            FallbackPolicy::default(),
        )
        .with_events(run.event_writer())
    }

    #[test]
    fn dryrun_pipeline_writes_layout_events_and_summary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = RunLayout::new(temp.path().join("batch_20260101_000000"));
        let mut run = SapRun::new(layout.clone())?;
        let service = dryrun_service(&run);
        let plan = plan(vec![GenerationMode::Direct, GenerationMode::Sap]);

        let report = run.execute(
            &plan,
            Some(&service),
            None,
            Box::new(DryrunImageBackend::new()),
        )?;
        let summary_path = run.finish(&report)?;

        assert_eq!(report.total(), 12);
        assert_eq!(report.succeeded(), 12);
        for (idx, prompt) in plan.prompts.iter().enumerate() {
            for mode in GenerationMode::ALL {
                assert!(layout.image_path(mode, idx, prompt, 7).exists());
            }
        }

        let metadata = std::fs::read_to_string(layout.metadata_path(GenerationMode::Sap))?;
        assert!(metadata.starts_with("mode: sap\n"));
        assert!(metadata.contains("prompt_001_switch_steps: [25]\n"));
        assert!(metadata.contains("prompt_003_origin: parsed\n"));
        assert!(metadata.contains("text_backend: dryrun\n"));
        let direct = std::fs::read_to_string(layout.metadata_path(GenerationMode::Direct))?;
        assert!(!direct.contains("prompt_001"));

        let stored = DecompositionStore::load(
            layout.mode_dir(GenerationMode::Sap).join("SAP_prompts.json"),
        )?;
        assert_eq!(stored.stats().successfully_decomposed, 3);

        let summary: Value = serde_json::from_str(&std::fs::read_to_string(summary_path)?)?;
        assert_eq!(summary["run_id"], json!("batch_20260101_000000"));
        assert_eq!(summary["total_jobs"], json!(12));
        assert_eq!(summary["decompositions"]["fallback"], json!(0));
        assert_eq!(summary["jobs"][0]["status"], json!("succeeded"));

        let events = read_events(&layout.events_path())?;
        let types = events
            .iter()
            .filter_map(|event| event["type"].as_str())
            .collect::<Vec<&str>>();
        assert_eq!(types.first(), Some(&"run_started"));
        assert_eq!(types.get(1), Some(&"decomposition_started"));
        assert_eq!(types.last(), Some(&"run_finished"));
        assert_eq!(
            types.iter().filter(|kind| **kind == "job_succeeded").count(),
            12
        );
        Ok(())
    }

    #[test]
    fn direct_only_run_needs_no_text_backend() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = RunLayout::new(temp.path().join("batch_direct"));
        let mut run = SapRun::new(layout.clone())?;
        let report = run.execute(
            &plan(vec![GenerationMode::Direct]),
            None,
            None,
            Box::new(DryrunImageBackend::new()),
        )?;
        assert_eq!(report.total(), 6);
        assert!(run.decompositions().is_none());
        assert!(!layout.mode_dir(GenerationMode::Sap).exists());

        assert!(run
            .execute(
                &plan(vec![GenerationMode::Sap]),
                None,
                None,
                Box::new(DryrunImageBackend::new()),
            )
            .is_err());
        Ok(())
    }
}
