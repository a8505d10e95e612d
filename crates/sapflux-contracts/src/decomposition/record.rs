use serde::{Deserialize, Serialize};

pub const STAGES_KEY: &str = "prompts_list";
pub const SWITCH_STEPS_KEY: &str = "switch_prompts_steps";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("stage list is empty")]
    EmptyStages,
    #[error("{stages} stages need {expected} switch steps, got {actual}")]
    SwitchStepCount {
        stages: usize,
        expected: usize,
        actual: usize,
    },
    #[error("switch steps are not strictly increasing at position {0}")]
    NotIncreasing(usize),
}

/// An ordered stage schedule for one prompt.
///
/// `stages` is never empty and `switch_steps` always holds exactly
/// `stages.len() - 1` strictly increasing cut points. Construction goes
/// through [`DecompositionRecord::new`] (or deserialization, which runs the
/// same check), so a value of this type can be indexed by a step scheduler
/// without re-validating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecordWire", into = "RecordWire")]
pub struct DecompositionRecord {
    explanation: String,
    stages: Vec<String>,
    switch_steps: Vec<u32>,
}

/// On-disk shape, kept compatible with existing `SAP_prompts.json` files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordWire {
    #[serde(default)]
    explanation: String,
    #[serde(rename = "prompts_list")]
    stages: Vec<String>,
    #[serde(rename = "switch_prompts_steps", default)]
    switch_steps: Vec<u32>,
}

impl TryFrom<RecordWire> for DecompositionRecord {
    type Error = RecordError;

    fn try_from(wire: RecordWire) -> Result<Self, Self::Error> {
        Self::new(wire.explanation, wire.stages, wire.switch_steps)
    }
}

impl From<DecompositionRecord> for RecordWire {
    fn from(record: DecompositionRecord) -> Self {
        Self {
            explanation: record.explanation,
            stages: record.stages,
            switch_steps: record.switch_steps,
        }
    }
}

pub fn check_schedule(stages: &[String], switch_steps: &[u32]) -> Result<(), RecordError> {
    if stages.is_empty() {
        return Err(RecordError::EmptyStages);
    }
    let expected = stages.len() - 1;
    if switch_steps.len() != expected {
        return Err(RecordError::SwitchStepCount {
            stages: stages.len(),
            expected,
            actual: switch_steps.len(),
        });
    }
    if let Some(idx) = switch_steps
        .windows(2)
        .position(|pair| pair[0] >= pair[1])
    {
        return Err(RecordError::NotIncreasing(idx + 1));
    }
    Ok(())
}

impl DecompositionRecord {
    pub fn new(
        explanation: impl Into<String>,
        stages: Vec<String>,
        switch_steps: Vec<u32>,
    ) -> Result<Self, RecordError> {
        check_schedule(&stages, &switch_steps)?;
        Ok(Self {
            explanation: explanation.into(),
            stages,
            switch_steps,
        })
    }

    pub fn single_stage(explanation: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            explanation: explanation.into(),
            stages: vec![prompt.into()],
            switch_steps: Vec::new(),
        }
    }

    /// Two-stage record; callers guarantee nothing about the step value
    /// beyond it being a single cut point, which is always increasing.
    pub(crate) fn two_stage(
        explanation: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
        switch_step: u32,
    ) -> Self {
        Self {
            explanation: explanation.into(),
            stages: vec![first.into(), second.into()],
            switch_steps: vec![switch_step],
        }
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn switch_steps(&self) -> &[u32] {
        &self.switch_steps
    }

    pub fn is_staged(&self) -> bool {
        self.stages.len() > 1
    }

    pub fn final_stage(&self) -> &str {
        self.stages.last().map(String::as_str).unwrap_or_default()
    }

    /// Index of the stage active at diffusion step `step`: the number of
    /// switch steps already reached.
    pub fn stage_index_at(&self, step: u32) -> usize {
        self.switch_steps
            .iter()
            .take_while(|switch_step| **switch_step <= step)
            .count()
    }

    pub fn stage_at(&self, step: u32) -> &str {
        &self.stages[self.stage_index_at(step)]
    }

    /// Number of steps each stage stays active over a `total_steps` timeline.
    /// Stages whose switch step lies past the end get zero steps.
    pub fn stage_spans(&self, total_steps: u32) -> Vec<u32> {
        let mut spans = Vec::with_capacity(self.stages.len());
        let mut start = 0u32;
        for switch_step in &self.switch_steps {
            let end = (*switch_step).min(total_steps);
            spans.push(end.saturating_sub(start));
            start = start.max(end);
        }
        spans.push(total_steps.saturating_sub(start));
        spans
    }

    pub fn into_parts(self) -> (String, Vec<String>, Vec<u32>) {
        (self.explanation, self.stages, self.switch_steps)
    }
}
