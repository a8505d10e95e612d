use serde::{Deserialize, Serialize};

use super::record::DecompositionRecord;

pub const DEFAULT_STEP_BUDGET: u32 = 50;
pub const CONJUNCTION: &str = " and ";
pub const MIN_SPLIT_WORDS: usize = 5;

const CONJUNCTION_SWITCH_PCT: u32 = 50;
const MIDPOINT_SWITCH_PCT: u32 = 40;

/// Switch steps used when a decomposition has to be synthesized locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    pub conjunction_switch_step: u32,
    pub midpoint_switch_step: u32,
}

impl Default for FallbackPolicy {
    /// Calibrated for a 50-step schedule.
    fn default() -> Self {
        Self {
            conjunction_switch_step: 25,
            midpoint_switch_step: 20,
        }
    }
}

impl FallbackPolicy {
    /// Scales the switch fractions to a `total_steps` schedule. Equal to
    /// [`FallbackPolicy::default`] at 50 steps.
    pub fn for_budget(total_steps: u32) -> Self {
        Self {
            conjunction_switch_step: percent_of(total_steps, CONJUNCTION_SWITCH_PCT),
            midpoint_switch_step: percent_of(total_steps, MIDPOINT_SWITCH_PCT),
        }
        .within_budget(total_steps)
    }

    /// Pulls both switch steps below `total_steps` so the second stage is
    /// always reached.
    pub fn within_budget(self, total_steps: u32) -> Self {
        let last = total_steps.saturating_sub(1);
        Self {
            conjunction_switch_step: self.conjunction_switch_step.min(last),
            midpoint_switch_step: self.midpoint_switch_step.min(last),
        }
    }
}

fn percent_of(total_steps: u32, pct: u32) -> u32 {
    let scaled = (u64::from(total_steps) * u64::from(pct) + 50) / 100;
    u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackScaling {
    Fixed,
    Proportional,
}

impl FallbackScaling {
    pub fn policy(self, total_steps: u32) -> FallbackPolicy {
        match self {
            Self::Fixed => FallbackPolicy::default().within_budget(total_steps),
            Self::Proportional => FallbackPolicy::for_budget(total_steps),
        }
    }
}

/// Builds a decomposition from the prompt text alone. Deterministic and
/// infallible; the last stage is always the full original prompt.
pub fn synthesize_fallback(prompt: &str, policy: &FallbackPolicy) -> DecompositionRecord {
    if let Some((head, _)) = prompt.split_once(CONJUNCTION) {
        let head = head.trim();
        if !head.is_empty() {
            return DecompositionRecord::two_stage(
                "Fallback decomposition: leading clause first, full prompt after the conjunction switch.",
                head,
                prompt,
                policy.conjunction_switch_step,
            );
        }
    }

    let words = prompt.split_whitespace().collect::<Vec<&str>>();
    if words.len() >= MIN_SPLIT_WORDS {
        let first_half = words[..words.len() / 2].join(" ");
        return DecompositionRecord::two_stage(
            "Fallback decomposition: first half of the prompt, then the full prompt.",
            first_half,
            prompt,
            policy.midpoint_switch_step,
        );
    }

    DecompositionRecord::single_stage(
        "Fallback decomposition: prompt used as a single stage.",
        prompt,
    )
}
