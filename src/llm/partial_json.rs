//! Incremental parser for the structured LLM response
//! `{suggested_keywords: string[], suggested_answers: string[]}`
//! (spec.md §4.5, §9).
//!
//! On every delta the accumulated text is re-parsed allowing an incomplete
//! tail; fully-parsed array elements not yet emitted are surfaced once, in
//! order, and never re-emitted. Any equivalent incremental parser satisfies
//! the same observable contract; this one repairs the accumulated buffer
//! into syntactically valid JSON (closing open strings/arrays/objects)
//! before calling `serde_json`, rather than hand-rolling a JSON tokenizer.

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct StructuredLlmResponse {
    #[serde(default)]
    suggested_keywords: Vec<String>,
    #[serde(default)]
    suggested_answers: Vec<String>,
}

/// Tracks how many array elements of each kind have already been emitted,
/// and the accumulated raw text streamed so far.
#[derive(Debug, Default)]
pub struct PartialJsonStream {
    buffer: String,
    keywords_sent: usize,
    answers_sent: usize,
}

/// A newly-completed array element, ready to emit downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completed {
    Keyword(String),
    Answer(String),
}

impl PartialJsonStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of raw LLM text. Returns newly-completed array
    /// elements discovered by this delta, in emission order (keywords
    /// before answers within one delta; spec.md §5 notes no cross-array
    /// ordering is guaranteed and none is claimed here).
    pub fn push(&mut self, delta: &str) -> Vec<Completed> {
        self.buffer.push_str(delta);
        let mut out = Vec::new();

        let Some(parsed) = best_effort_parse(&self.buffer) else {
            return out;
        };

        // An element is only "completed" once more elements exist after it,
        // or the string is done accumulating further text for it — since we
        // can't know whether a streamed JSON array will grow further except
        // by the closing bracket having arrived, we treat every element
        // except a possibly-still-growing last one as final. The repair
        // step (`close_partial_json`) only closes a trailing *unterminated*
        // string, so a fully-quoted last element is complete too.
        while self.keywords_sent < parsed.suggested_keywords.len() && self.keywords_sent < 10 {
            out.push(Completed::Keyword(parsed.suggested_keywords[self.keywords_sent].clone()));
            self.keywords_sent += 1;
        }
        while self.answers_sent < parsed.suggested_answers.len() && self.answers_sent < 4 {
            out.push(Completed::Answer(parsed.suggested_answers[self.answers_sent].clone()));
            self.answers_sent += 1;
        }
        out
    }
}

/// Attempt to parse `buffer` as the structured response, repairing an
/// incomplete JSON tail (unterminated string/array/object) first.
fn best_effort_parse(buffer: &str) -> Option<StructuredLlmResponse> {
    if let Ok(parsed) = serde_json::from_str::<StructuredLlmResponse>(buffer) {
        return Some(parsed);
    }
    let repaired = close_partial_json(buffer);
    serde_json::from_str::<StructuredLlmResponse>(&repaired).ok()
}

/// Close an incomplete JSON document by closing any open arrays/objects in
/// reverse order of opening. A dangling, not-yet-closed string (the array
/// element currently being streamed) is dropped entirely rather than
/// force-closed: a value is only "completed" once its closing quote has
/// actually arrived, matching the streaming contract's "newly completed"
/// wording (spec.md §4.5, §9).
fn close_partial_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut dangling_string_start: Option<usize> = None;

    for ch in input.chars() {
        if !in_string && ch == '"' {
            dangling_string_start = Some(out.len());
        }
        out.push(ch);
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                dangling_string_start = None;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        if let Some(start) = dangling_string_start {
            out.truncate(start);
        }
    }
    while out.trim_end().ends_with(',') {
        let trimmed = out.trim_end().trim_end_matches(',').to_string();
        out = trimmed;
    }
    for closer in stack.iter().rev() {
        out.push(*closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_keywords_then_answers_without_duplicates() {
        let full = r#"{"suggested_keywords":["a","b"],"suggested_answers":["x"]}"#;
        let mut stream = PartialJsonStream::new();
        let mut all = Vec::new();
        for ch in full.chars() {
            all.extend(stream.push(&ch.to_string()));
        }
        assert_eq!(
            all,
            vec![
                Completed::Keyword("a".to_string()),
                Completed::Keyword("b".to_string()),
                Completed::Answer("x".to_string()),
            ]
        );
    }

    #[test]
    fn never_emits_an_element_twice() {
        let mut stream = PartialJsonStream::new();
        stream.push(r#"{"suggested_keywords":["a"#);
        let first = stream.push(r#""],"suggested_answers":[]}"#);
        assert_eq!(first, vec![Completed::Keyword("a".to_string())]);
        // Re-feeding the same complete buffer must not duplicate it.
        let again = stream.push("");
        assert!(again.is_empty());
    }

    #[test]
    fn caps_at_ten_keywords_and_four_answers() {
        let mut stream = PartialJsonStream::new();
        let keywords: Vec<String> = (0..12).map(|i| format!("k{i}")).collect();
        let answers: Vec<String> = (0..6).map(|i| format!("a{i}")).collect();
        let full = serde_json::json!({
            "suggested_keywords": keywords,
            "suggested_answers": answers,
        })
        .to_string();
        let completed = stream.push(&full);
        let kw_count = completed.iter().filter(|c| matches!(c, Completed::Keyword(_))).count();
        let ans_count = completed.iter().filter(|c| matches!(c, Completed::Answer(_))).count();
        assert_eq!(kw_count, 10);
        assert_eq!(ans_count, 4);
    }
}
