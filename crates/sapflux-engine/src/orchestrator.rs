use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use sapflux_contracts::decomposition::DecompositionRecord;
use sapflux_contracts::events::{
    EventPayload, EventWriter, JOB_DISPATCHED, JOB_FAILED, JOB_SUCCEEDED,
};
use sapflux_contracts::runs::layout::{GenerationMode, RunLayout};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::GenerationSettings;
use crate::image_backend::{save_png, ImageBackend, ImageJob, JobInput};
use crate::map_object;

/// `pending → dispatched → succeeded | failed`; terminal states are final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Dispatched,
    Succeeded { artifact: PathBuf },
    Failed { reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    fn dispatch(self) -> Self {
        match self {
            Self::Pending => Self::Dispatched,
            other => other,
        }
    }

    fn settle(self, result: Result<PathBuf>) -> Self {
        match (self, result) {
            (Self::Dispatched, Ok(artifact)) => Self::Succeeded { artifact },
            (Self::Dispatched, Err(err)) => Self::Failed {
                reason: format!("{err:#}"),
            },
            (other, _) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub index: usize,
    pub prompt: String,
    pub mode: GenerationMode,
    pub seed: u64,
    #[serde(flatten)]
    pub state: JobState,
    pub elapsed_s: f64,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.state, JobState::Succeeded { .. })
    }

    pub fn artifact(&self) -> Option<&PathBuf> {
        match &self.state {
            JobState::Succeeded { artifact } => Some(artifact),
            _ => None,
        }
    }

    pub fn to_row(&self) -> Map<String, Value> {
        map_object(serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

/// Per-job outcomes in (prompt, mode, seed) enumeration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub outcomes: Vec<JobOutcome>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|job| job.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn for_mode(&self, mode: GenerationMode) -> impl Iterator<Item = &JobOutcome> + '_ {
        self.outcomes.iter().filter(move |job| job.mode == mode)
    }

    pub fn rows(&self) -> Vec<Map<String, Value>> {
        self.outcomes.iter().map(JobOutcome::to_row).collect()
    }
}

/// Drives one generation backend handle through every job of a run.
///
/// The handle is owned for the lifetime of the orchestrator and released
/// exactly once, by [`GenerationOrchestrator::release`] or on drop.
pub struct GenerationOrchestrator {
    backend: Option<Box<dyn ImageBackend>>,
    backend_name: String,
    layout: RunLayout,
    settings: GenerationSettings,
    events: Option<EventWriter>,
}

impl GenerationOrchestrator {
    pub fn new(
        backend: Box<dyn ImageBackend>,
        layout: RunLayout,
        settings: GenerationSettings,
    ) -> Self {
        let backend_name = backend.name().to_string();
        Self {
            backend: Some(backend),
            backend_name,
            layout,
            settings,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Runs every (prompt, mode, seed) job in order. A failing job is
    /// recorded and the loop moves on; only precondition errors abort, and
    /// they do so before anything is dispatched.
    pub fn run(
        &mut self,
        prompts: &[String],
        modes: &[GenerationMode],
        seeds: &[u64],
        records: Option<&[DecompositionRecord]>,
    ) -> Result<RunReport> {
        let mut modes = modes.to_vec();
        modes.sort();
        modes.dedup();
        if modes.contains(&GenerationMode::Sap) {
            match records {
                None => bail!("sap mode requires decomposition records"),
                Some(records) if records.len() != prompts.len() => bail!(
                    "sap mode needs one decomposition per prompt ({} prompts, {} records)",
                    prompts.len(),
                    records.len()
                ),
                Some(_) => {}
            }
        }
        let Some(backend) = self.backend.as_mut() else {
            bail!("generation backend '{}' was already released", self.backend_name);
        };

        let mut report = RunReport::default();
        for (index, prompt) in prompts.iter().enumerate() {
            for mode in &modes {
                let input = match mode {
                    GenerationMode::Direct => JobInput::Prompt(prompt),
                    GenerationMode::Sap => match records.and_then(|records| records.get(index)) {
                        Some(record) => JobInput::Staged(record),
                        None => bail!("missing decomposition for prompt {index}"),
                    },
                };
                for seed in seeds {
                    let job = ImageJob {
                        prompt_index: index,
                        mode: *mode,
                        seed: *seed,
                        input,
                        settings: &self.settings,
                    };
                    let outcome = run_job(
                        &mut **backend,
                        &self.layout,
                        self.events.as_ref(),
                        prompt,
                        &job,
                    );
                    report.outcomes.push(outcome);
                }
            }
        }

        tracing::info!(
            total = report.total(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            "generation pass finished"
        );
        Ok(report)
    }

    pub fn release(&mut self) -> Result<()> {
        if let Some(mut backend) = self.backend.take() {
            backend.release()?;
            tracing::info!(backend = %self.backend_name, "generation backend released");
        }
        Ok(())
    }
}

impl Drop for GenerationOrchestrator {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "generation backend release failed");
        }
    }
}

fn run_job(
    backend: &mut dyn ImageBackend,
    layout: &RunLayout,
    events: Option<&EventWriter>,
    prompt: &str,
    job: &ImageJob<'_>,
) -> JobOutcome {
    let started = Instant::now();
    let mut state = JobState::Pending;

    let stages = match job.input {
        JobInput::Prompt(_) => 1,
        JobInput::Staged(record) => record.stages().len(),
    };
    emit(
        events,
        JOB_DISPATCHED,
        map_object(json!({
            "index": job.prompt_index,
            "mode": job.mode,
            "seed": job.seed,
            "stages": stages,
        })),
    );
    state = state.dispatch();

    let artifact = layout.image_path(job.mode, job.prompt_index, prompt, job.seed);
    let result = backend
        .generate(job)
        .and_then(|image| save_png(&image, &artifact))
        .map(|()| artifact);
    state = state.settle(result);

    match &state {
        JobState::Succeeded { artifact } => {
            tracing::info!(
                index = job.prompt_index,
                mode = %job.mode,
                seed = job.seed,
                artifact = %artifact.display(),
                "job succeeded"
            );
            emit(
                events,
                JOB_SUCCEEDED,
                map_object(json!({
                    "index": job.prompt_index,
                    "mode": job.mode,
                    "seed": job.seed,
                    "artifact": artifact.to_string_lossy(),
                })),
            );
        }
        JobState::Failed { reason } => {
            tracing::error!(
                index = job.prompt_index,
                mode = %job.mode,
                seed = job.seed,
                %reason,
                "job failed"
            );
            emit(
                events,
                JOB_FAILED,
                map_object(json!({
                    "index": job.prompt_index,
                    "mode": job.mode,
                    "seed": job.seed,
                    "reason": reason,
                })),
            );
        }
        JobState::Pending | JobState::Dispatched => {}
    }

    JobOutcome {
        index: job.prompt_index,
        prompt: prompt.to_string(),
        mode: job.mode,
        seed: job.seed,
        state,
        elapsed_s: started.elapsed().as_secs_f64(),
    }
}

fn emit(events: Option<&EventWriter>, event_type: &str, payload: EventPayload) {
    if let Some(events) = events {
        if let Err(err) = events.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "failed to append run event");
        }
    }
}
