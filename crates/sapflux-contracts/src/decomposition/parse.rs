use super::record::{DecompositionRecord, RecordError, STAGES_KEY, SWITCH_STEPS_KEY};
use super::segment::segment_response;

/// Why one segment could not be turned into a record. Always recovered by
/// the caller through the fallback synthesizer, never surfaced as an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("response has no segment for this prompt")]
    MissingSegment,
    #[error("segment is empty")]
    EmptySegment,
    #[error("explanation marker not found")]
    MissingExplanationMarker,
    #[error("dictionary marker not found after the explanation")]
    MissingDictionaryMarker,
    #[error("no mapping literal after the dictionary marker")]
    MissingMapping,
    #[error("mapping literal is not balanced")]
    UnbalancedMapping,
    #[error("mapping literal syntax error at byte {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("unexpected key '{0}' in mapping literal")]
    UnexpectedKey(String),
    #[error("duplicate key '{0}' in mapping literal")]
    DuplicateKey(String),
    #[error("missing key '{0}' in mapping literal")]
    MissingKey(&'static str),
    #[error("stage {0} is blank")]
    BlankStage(usize),
    #[error("switch step {0} is out of range")]
    StepOutOfRange(i64),
    #[error("invalid schedule: {0}")]
    InvalidRecord(#[from] RecordError),
}

// (explanation marker, dictionary marker), most specific first.
const MARKER_PHRASINGS: &[(&str, &str)] = &[
    ("a. explanation:", "b. final dictionary:"),
    ("explanation:", "dictionary:"),
];

/// Segments a batched response and parses every slot.
///
/// The result always has exactly `expected` entries, in prompt order. With a
/// `step_budget`, a record that switches at or past the last step is
/// rejected since its later stages would never be active.
pub fn parse_batched_response(
    raw: &str,
    expected: usize,
    step_budget: Option<u32>,
) -> Vec<Result<DecompositionRecord, ParseFailure>> {
    segment_response(raw, expected)
        .iter()
        .map(|segment| match segment {
            Some(text) => parse_segment(text)
                .and_then(|record| within_step_budget(record, step_budget)),
            None => Err(ParseFailure::MissingSegment),
        })
        .collect()
}

pub fn within_step_budget(
    record: DecompositionRecord,
    step_budget: Option<u32>,
) -> Result<DecompositionRecord, ParseFailure> {
    let Some(budget) = step_budget else {
        return Ok(record);
    };
    match record.switch_steps().iter().find(|step| **step >= budget) {
        Some(step) => Err(ParseFailure::StepOutOfRange(i64::from(*step))),
        None => Ok(record),
    }
}

pub fn parse_segment(segment: &str) -> Result<DecompositionRecord, ParseFailure> {
    if segment.trim().is_empty() {
        return Err(ParseFailure::EmptySegment);
    }
    let (explanation, dict_block) = split_sections(segment)?;
    let cleaned = strip_code_fences(dict_block);
    let literal = extract_mapping_block(&cleaned)?;
    let mapping = MappingParser::new(literal).parse()?;

    let stages = mapping
        .stages
        .ok_or(ParseFailure::MissingKey(STAGES_KEY))?
        .into_iter()
        .map(|stage| stage.trim().to_string())
        .collect::<Vec<String>>();
    let raw_steps = mapping
        .switch_steps
        .ok_or(ParseFailure::MissingKey(SWITCH_STEPS_KEY))?;

    if let Some(idx) = stages.iter().position(|stage| stage.is_empty()) {
        return Err(ParseFailure::BlankStage(idx));
    }
    let switch_steps = raw_steps
        .into_iter()
        .map(|step| u32::try_from(step).map_err(|_| ParseFailure::StepOutOfRange(step)))
        .collect::<Result<Vec<u32>, ParseFailure>>()?;

    Ok(DecompositionRecord::new(explanation, stages, switch_steps)?)
}

fn split_sections(segment: &str) -> Result<(String, &str), ParseFailure> {
    let lowered = segment.to_ascii_lowercase();
    let mut saw_explanation = false;
    for (phrasing, (explanation_marker, dictionary_marker)) in
        MARKER_PHRASINGS.iter().enumerate()
    {
        let Some(explanation_at) = lowered.find(explanation_marker) else {
            continue;
        };
        saw_explanation = true;
        let explanation_start = explanation_at + explanation_marker.len();
        let Some(dictionary_rel) = lowered[explanation_start..].find(dictionary_marker) else {
            continue;
        };
        let dictionary_at = explanation_start + dictionary_rel;
        let between = &segment[explanation_start..dictionary_at];
        let explanation = if phrasing == 0 {
            between.trim().to_string()
        } else {
            clean_explanation(between)
        };
        return Ok((
            explanation,
            &segment[dictionary_at + dictionary_marker.len()..],
        ));
    }
    if saw_explanation {
        Err(ParseFailure::MissingDictionaryMarker)
    } else {
        Err(ParseFailure::MissingExplanationMarker)
    }
}

// The looser phrasing leaves "b. Final" hanging off the explanation.
fn clean_explanation(text: &str) -> String {
    let mut out = text.trim();
    for suffix in ["final", "b."] {
        let lowered = out.to_ascii_lowercase();
        if lowered.ends_with(suffix) {
            out = out[..out.len() - suffix.len()].trim_end();
        }
    }
    out.to_string()
}

fn strip_code_fences(block: &str) -> String {
    block
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            match trimmed.strip_prefix("```") {
                Some(rest) => rest
                    .trim_start_matches(|ch: char| ch.is_ascii_alphanumeric() || ch == '_')
                    .replace("```", ""),
                None => line.replace("```", ""),
            }
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Returns the first balanced `{...}` block in `text`, honoring quoted
/// strings and `#` line comments the same way the mapping reader does.
pub fn extract_mapping_block(text: &str) -> Result<&str, ParseFailure> {
    let start = text.find('{').ok_or(ParseFailure::MissingMapping)?;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut in_comment = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_comment {
            in_comment = ch != '\n';
            continue;
        }
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '#' => in_comment = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    Err(ParseFailure::UnbalancedMapping)
}

#[derive(Debug, Default)]
struct ParsedMapping {
    stages: Option<Vec<String>>,
    switch_steps: Option<Vec<i64>>,
}

/// Restricted literal grammar: a mapping with quoted keys whose values are
/// lists of quoted strings or lists of integers. Nothing else is accepted.
struct MappingParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> MappingParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn parse(mut self) -> Result<ParsedMapping, ParseFailure> {
        let mut mapping = ParsedMapping::default();
        self.expect(b'{')?;
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                break;
            }
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(b':')?;
            match key.as_str() {
                STAGES_KEY => {
                    if mapping.stages.is_some() {
                        return Err(ParseFailure::DuplicateKey(key));
                    }
                    mapping.stages = Some(self.parse_list(Self::parse_string)?);
                }
                SWITCH_STEPS_KEY => {
                    if mapping.switch_steps.is_some() {
                        return Err(ParseFailure::DuplicateKey(key));
                    }
                    mapping.switch_steps = Some(self.parse_list(Self::parse_int)?);
                }
                _ => return Err(ParseFailure::UnexpectedKey(key)),
            }
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            self.expect(b'}')?;
            break;
        }
        self.skip_ws();
        if self.pos != self.src.len() {
            return Err(self.syntax("trailing characters after mapping"));
        }
        Ok(mapping)
    }

    fn parse_list<T>(
        &mut self,
        item: fn(&mut Self) -> Result<T, ParseFailure>,
    ) -> Result<Vec<T>, ParseFailure> {
        self.skip_ws();
        self.expect(b'[')?;
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b']') {
                return Ok(out);
            }
            self.skip_ws();
            out.push(item(self)?);
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            self.expect(b']')?;
            return Ok(out);
        }
    }

    fn parse_string(&mut self) -> Result<String, ParseFailure> {
        self.skip_ws();
        let quote = match self.peek() {
            Some(b'\'') => '\'',
            Some(b'"') => '"',
            _ => return Err(self.syntax("expected a quoted string")),
        };
        let body_start = self.pos + 1;
        let mut out = String::new();
        let mut chars = self.src[body_start..].char_indices();
        while let Some((offset, ch)) = chars.next() {
            if ch == quote {
                self.pos = body_start + offset + 1;
                return Ok(out);
            }
            match ch {
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, '\n')) => {}
                    Some((_, escaped @ ('\\' | '\'' | '"'))) => out.push(escaped),
                    Some((_, other)) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => break,
                },
                '\n' => {
                    self.pos = body_start + offset;
                    return Err(self.syntax("newline inside string"));
                }
                _ => out.push(ch),
            }
        }
        Err(self.syntax("unterminated string"))
    }

    fn parse_int(&mut self) -> Result<i64, ParseFailure> {
        self.skip_ws();
        let start = self.pos;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(byte) if byte.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(self.syntax("expected an integer"));
        }
        if matches!(self.peek(), Some(b'.' | b'e' | b'E' | b'_' | b'j')) {
            return Err(self.syntax("expected an integer"));
        }
        self.src[start..self.pos]
            .parse::<i64>()
            .map_err(|_| ParseFailure::Syntax {
                offset: start,
                message: "integer out of range".to_string(),
            })
    }

    fn skip_ws(&mut self) {
        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else if byte == b'#' {
                while !matches!(self.peek(), None | Some(b'\n')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseFailure> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.syntax(&format!("expected '{}'", byte as char)))
        }
    }

    fn syntax(&self, message: &str) -> ParseFailure {
        ParseFailure::Syntax {
            offset: self.pos,
            message: message.to_string(),
        }
    }
}
