use super::record::{DecompositionRecord, STAGES_KEY, SWITCH_STEPS_KEY};
use super::request::{normalize_prompt_text, sentinel, OUTPUT_MARKER};

/// Canonical response text for one prompt, in the shape the parser expects
/// from a decomposition backend.
pub fn render_response_block(
    position: usize,
    prompt: &str,
    record: &DecompositionRecord,
) -> String {
    format!(
        "{} {}\n{OUTPUT_MARKER}\na. Explanation: {}\nb. Final dictionary:\n{}",
        sentinel(position),
        normalize_prompt_text(prompt),
        record.explanation().trim(),
        render_mapping_literal(record)
    )
}

pub fn render_mapping_literal(record: &DecompositionRecord) -> String {
    let stages = record
        .stages()
        .iter()
        .map(String::as_str)
        .map(quote)
        .collect::<Vec<String>>()
        .join(", ");
    let steps = record
        .switch_steps()
        .iter()
        .map(u32::to_string)
        .collect::<Vec<String>>()
        .join(", ");
    format!("{{'{STAGES_KEY}': [{stages}], '{SWITCH_STEPS_KEY}': [{steps}]}}")
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::{render_mapping_literal, render_response_block};
    use crate::decomposition::parse::{parse_batched_response, parse_segment};
    use crate::decomposition::record::DecompositionRecord;

    #[test]
    fn literal_escapes_quotes_and_backslashes() {
        let record = DecompositionRecord::new(
            "e",
            vec!["it's a \\ path".to_string(), "line\nbreak".to_string()],
            vec![7],
        )
        .unwrap();
        assert_eq!(
            render_mapping_literal(&record),
            "{'prompts_list': ['it\\'s a \\\\ path', 'line\\nbreak'], 'switch_prompts_steps': [7]}"
        );
    }

    #[test]
    fn rendered_blocks_parse_back_in_order() {
        let records = [
            DecompositionRecord::new(
                "smoke first",
                vec![
                    "A dragon blowing white smoke".to_string(),
                    "A dragon blowing water".to_string(),
                ],
                vec![3],
            )
            .unwrap(),
            DecompositionRecord::single_stage("plain", "Shrek's {blue} face"),
        ];
        let response = [
            render_response_block(1, "A dragon blowing water", &records[0]),
            render_response_block(2, "Shrek's {blue} face", &records[1]),
        ]
        .join("\n\n");
        let parsed = parse_batched_response(&response, 2, None);
        assert_eq!(parsed[0].as_ref().ok(), Some(&records[0]));
        assert_eq!(parsed[1].as_ref().ok(), Some(&records[1]));
        assert!(parse_segment("").is_err());
    }
}
