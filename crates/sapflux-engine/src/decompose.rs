use sapflux_contracts::decomposition::{
    parse_batched_response, resolve_parsed, synthesize_fallback, BatchRequest, Decomposition,
    DecompositionOrigin, DecompositionRecord, FallbackPolicy, PromptTemplates,
};
use sapflux_contracts::events::{
    EventPayload, EventWriter, DECOMPOSITION_COMPLETED, DECOMPOSITION_FALLBACK,
    DECOMPOSITION_STARTED,
};
use sapflux_contracts::runs::store::DecompositionStore;
use serde_json::json;

use crate::map_object;
use crate::text::TextBackend;

/// The decomposition backend call failed; there is nothing to segment or
/// fall back from, so the whole batch is lost.
#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    #[error("decomposition backend '{backend}' failed")]
    Backend {
        backend: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Request → parse → per-index fallback over one backend round trip.
///
/// Every successful call returns exactly one decomposition per input
/// prompt, in input order.
pub struct DecompositionService {
    backend: Box<dyn TextBackend>,
    templates: PromptTemplates,
    policy: FallbackPolicy,
    step_budget: Option<u32>,
    events: Option<EventWriter>,
}

impl DecompositionService {
    pub fn new(
        backend: Box<dyn TextBackend>,
        templates: PromptTemplates,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            backend,
            templates,
            policy,
            step_budget: None,
            events: None,
        }
    }

    /// Parsed records that switch at or past `total_steps` fall back.
    pub fn with_step_budget(mut self, total_steps: u32) -> Self {
        self.step_budget = Some(total_steps);
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend_model(&self) -> &str {
        self.backend.model()
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn step_budget(&self) -> Option<u32> {
        self.step_budget
    }

    pub fn decompose(
        &self,
        prompts: &[String],
    ) -> Result<Vec<DecompositionRecord>, DecomposeError> {
        Ok(self
            .decompose_detailed(prompts)?
            .into_iter()
            .map(|decomposition| decomposition.record)
            .collect())
    }

    pub fn decompose_detailed(
        &self,
        prompts: &[String],
    ) -> Result<Vec<Decomposition>, DecomposeError> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        self.emit(
            DECOMPOSITION_STARTED,
            map_object(json!({
                "prompts": prompts.len(),
                "backend": self.backend.name(),
                "model": self.backend.model(),
            })),
        );
        tracing::info!(
            prompts = prompts.len(),
            backend = self.backend.name(),
            "requesting batched decomposition"
        );

        let payload = BatchRequest::new(prompts, &self.templates).render();
        let raw = self
            .backend
            .complete(&payload)
            .map_err(|source| DecomposeError::Backend {
                backend: self.backend.name().to_string(),
                source,
            })?;

        let parsed = parse_batched_response(&raw, prompts.len(), self.step_budget);
        let resolved = resolve_parsed(prompts, parsed, &self.policy);

        let mut fallback_count = 0usize;
        for (index, decomposition) in resolved.iter().enumerate() {
            if let DecompositionOrigin::Fallback { reason } = &decomposition.origin {
                fallback_count += 1;
                tracing::warn!(index, %reason, "decomposition fell back to local heuristic");
                self.emit(
                    DECOMPOSITION_FALLBACK,
                    map_object(json!({
                        "index": index,
                        "prompt": prompts[index],
                        "reason": reason,
                    })),
                );
            }
        }
        self.emit(
            DECOMPOSITION_COMPLETED,
            map_object(json!({
                "prompts": prompts.len(),
                "parsed": resolved.len() - fallback_count,
                "fallback": fallback_count,
            })),
        );
        Ok(resolved)
    }

    /// Reuses stored records and sends only the missing prompts, in a single
    /// batch. Output order follows `prompts`.
    pub fn decompose_with_store(
        &self,
        prompts: &[String],
        store: &DecompositionStore,
    ) -> Result<Vec<Decomposition>, DecomposeError> {
        let mut slots = store.lookup(prompts);
        let missing_idx = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(idx, _)| idx)
            .collect::<Vec<usize>>();
        tracing::info!(
            reused = prompts.len() - missing_idx.len(),
            missing = missing_idx.len(),
            store = %store.path().display(),
            "reusing stored decompositions"
        );

        let missing = missing_idx
            .iter()
            .map(|idx| prompts[*idx].clone())
            .collect::<Vec<String>>();
        let fresh = self.decompose_detailed(&missing)?;
        for (idx, decomposition) in missing_idx.into_iter().zip(fresh) {
            slots[idx] = Some(decomposition);
        }

        Ok(slots
            .into_iter()
            .zip(prompts)
            .map(|(slot, prompt)| {
                slot.unwrap_or_else(|| Decomposition {
                    record: synthesize_fallback(prompt, &self.policy),
                    origin: DecompositionOrigin::Fallback {
                        reason: "no decomposition produced".to_string(),
                    },
                })
            })
            .collect())
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(events) = &self.events {
            if let Err(err) = events.emit(event_type, payload) {
                tracing::warn!(event_type, error = %err, "failed to append run event");
            }
        }
    }
}
