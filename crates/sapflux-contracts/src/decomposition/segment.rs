pub const SENTINEL_WORD: &str = "Input";

/// One `Input <digits>:` marker located in a text.
///
/// `start` includes a leading `###` decoration when present so the marker
/// does not leak into the preceding segment; `end` is the byte after the colon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelMatch {
    pub start: usize,
    pub end: usize,
    pub colon: usize,
    pub number: Option<u64>,
}

pub fn find_sentinels(text: &str) -> Vec<SentinelMatch> {
    let bytes = text.as_bytes();
    let word = SENTINEL_WORD.as_bytes();
    let mut matches = Vec::new();
    let mut pos = 0usize;
    while pos + word.len() <= bytes.len() {
        if &bytes[pos..pos + word.len()] != word || !is_boundary(bytes, pos) {
            pos += 1;
            continue;
        }
        match match_tail(bytes, pos + word.len()) {
            Some((colon, number)) => {
                matches.push(SentinelMatch {
                    start: decoration_start(text, pos),
                    end: colon + 1,
                    colon,
                    number,
                });
                pos = colon + 1;
            }
            None => pos += 1,
        }
    }
    matches
}

fn is_boundary(bytes: &[u8], pos: usize) -> bool {
    pos == 0 || {
        let prev = bytes[pos - 1];
        !(prev.is_ascii_alphanumeric() || prev == b'_')
    }
}

// `<blank>+ <digits>+ <blank>* :` after the sentinel word.
fn match_tail(bytes: &[u8], mut pos: usize) -> Option<(usize, Option<u64>)> {
    let blanks_start = pos;
    while pos < bytes.len() && is_blank(bytes[pos]) {
        pos += 1;
    }
    if pos == blanks_start {
        return None;
    }
    let digits_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == digits_start {
        return None;
    }
    let number = std::str::from_utf8(&bytes[digits_start..pos])
        .ok()
        .and_then(|digits| digits.parse::<u64>().ok());
    while pos < bytes.len() && is_blank(bytes[pos]) {
        pos += 1;
    }
    (pos < bytes.len() && bytes[pos] == b':').then_some((pos, number))
}

fn is_blank(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

fn decoration_start(text: &str, pos: usize) -> usize {
    let before = text[..pos].trim_end_matches([' ', '\t']);
    if before.ends_with('#') {
        before.trim_end_matches('#').len()
    } else {
        pos
    }
}

/// Per-prompt view of a batched response, aligned by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segmentation<'a> {
    /// Number of segments the response actually contained.
    pub found: usize,
    segments: Vec<Option<&'a str>>,
}

impl<'a> Segmentation<'a> {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a str> {
        self.segments.get(index).copied().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&'a str>> + '_ {
        self.segments.iter().copied()
    }
}

/// Splits `raw` on sentinels into exactly `expected` slots.
///
/// Alignment is by order, never by the number written in the sentinel.
/// Text before the first sentinel is preamble and dropped; a response with
/// no sentinel at all is a single segment. Missing tail slots are `None`
/// and surplus segments are discarded.
pub fn segment_response(raw: &str, expected: usize) -> Segmentation<'_> {
    let sentinels = find_sentinels(raw);
    let found_segments: Vec<&str> = if sentinels.is_empty() {
        if raw.trim().is_empty() {
            Vec::new()
        } else {
            vec![raw]
        }
    } else {
        sentinels
            .iter()
            .enumerate()
            .map(|(idx, sentinel)| {
                let stop = sentinels
                    .get(idx + 1)
                    .map(|next| next.start)
                    .unwrap_or(raw.len());
                &raw[sentinel.end..stop]
            })
            .collect()
    };

    let found = found_segments.len();
    let segments = (0..expected)
        .map(|idx| found_segments.get(idx).copied())
        .collect();
    Segmentation { found, segments }
}

#[cfg(test)]
mod tests {
    use super::{find_sentinels, segment_response};

    #[test]
    fn finds_decorated_and_plain_sentinels() {
        let text = "### Input 1: a\n### Output: x\nInput 2 : b\nInput  17:c";
        let found = find_sentinels(text);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].start, 0);
        assert_eq!(found[0].number, Some(1));
        assert_eq!(found[1].number, Some(2));
        assert_eq!(found[2].number, Some(17));
        assert_eq!(&text[found[2].end..], "c");
    }

    #[test]
    fn ignores_lookalikes() {
        for text in [
            "Input:",
            "Input x:",
            "Input 3",
            "UserInput 1:",
            "input 1:",
            "Input\n1:",
            "Inputs 1:",
        ] {
            assert!(find_sentinels(text).is_empty(), "matched {text:?}");
        }
    }

    #[test]
    fn aligns_by_position_not_number() {
        let raw = "preamble\n### Input 7: first\n### Input 7: second\n### Input 1: third";
        let segmentation = segment_response(raw, 3);
        assert_eq!(segmentation.found, 3);
        assert_eq!(segmentation.get(0).map(str::trim), Some("first"));
        assert_eq!(segmentation.get(1).map(str::trim), Some("second"));
        assert_eq!(segmentation.get(2).map(str::trim), Some("third"));
    }

    #[test]
    fn pads_missing_and_drops_surplus() {
        let raw = "Input 1: a\nInput 2: b";
        let short = segment_response(raw, 4);
        assert_eq!(short.len(), 4);
        assert!(short.get(1).is_some());
        assert!(short.get(2).is_none());
        assert!(short.get(3).is_none());

        let long = segment_response(raw, 1);
        assert_eq!(long.len(), 1);
        assert_eq!(long.found, 2);
        assert_eq!(long.get(0).map(str::trim), Some("a"));
    }

    #[test]
    fn unmarked_and_empty_responses() {
        let unmarked = segment_response("a. Explanation: x", 2);
        assert_eq!(unmarked.found, 1);
        assert_eq!(unmarked.get(0), Some("a. Explanation: x"));
        assert!(unmarked.get(1).is_none());

        let empty = segment_response("  \n ", 2);
        assert_eq!(empty.found, 0);
        assert!(empty.iter().all(|segment| segment.is_none()));
    }
}
