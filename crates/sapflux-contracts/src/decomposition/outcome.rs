use serde::{Deserialize, Serialize};

use super::fallback::{synthesize_fallback, FallbackPolicy};
use super::parse::ParseFailure;
use super::record::DecompositionRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecompositionOrigin {
    Parsed,
    Fallback { reason: String },
    Stored,
}

impl DecompositionOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Fallback { .. } => "fallback",
            Self::Stored => "stored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub record: DecompositionRecord,
    pub origin: DecompositionOrigin,
}

impl Decomposition {
    pub fn is_fallback(&self) -> bool {
        matches!(self.origin, DecompositionOrigin::Fallback { .. })
    }
}

/// Pairs every parse result with its prompt, substituting the fallback
/// wherever parsing failed. Output order and length follow `prompts`.
pub fn resolve_parsed(
    prompts: &[String],
    parsed: Vec<Result<DecompositionRecord, ParseFailure>>,
    policy: &FallbackPolicy,
) -> Vec<Decomposition> {
    let mut parsed = parsed.into_iter();
    prompts
        .iter()
        .map(|prompt| match parsed.next() {
            Some(Ok(record)) => Decomposition {
                record,
                origin: DecompositionOrigin::Parsed,
            },
            Some(Err(failure)) => fallback_for(prompt, &failure, policy),
            None => fallback_for(prompt, &ParseFailure::MissingSegment, policy),
        })
        .collect()
}

fn fallback_for(prompt: &str, failure: &ParseFailure, policy: &FallbackPolicy) -> Decomposition {
    Decomposition {
        record: synthesize_fallback(prompt, policy),
        origin: DecompositionOrigin::Fallback {
            reason: failure.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{resolve_parsed, DecompositionOrigin};
    use crate::decomposition::{DecompositionRecord, FallbackPolicy, ParseFailure};

    #[test]
    fn failures_are_replaced_per_index() {
        let prompts = vec![
            "A dragon blowing water".to_string(),
            "A grand castle and a stormy sky".to_string(),
            "A red ball".to_string(),
        ];
        let parsed = vec![
            Ok(DecompositionRecord::single_stage("e", "A dragon blowing water")),
            Err(ParseFailure::MissingDictionaryMarker),
        ];
        let resolved = resolve_parsed(&prompts, parsed, &FallbackPolicy::default());
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].origin, DecompositionOrigin::Parsed);
        assert!(resolved[1].is_fallback());
        assert_eq!(resolved[1].record.stages()[0], "A grand castle");
        assert_eq!(
            resolved[2].origin,
            DecompositionOrigin::Fallback {
                reason: "response has no segment for this prompt".to_string()
            }
        );
        assert_eq!(
            serde_json::to_value(&resolved[1].origin).unwrap(),
            json!({"kind": "fallback", "reason": "dictionary marker not found after the explanation"})
        );
    }
}
