//! Structure-aware splitting of long messages.
//!
//! Splits a finalized text block into chunks that fit a platform's message
//! limit. The split is lossless: concatenating the chunks reproduces the
//! input exactly. Break points are chosen from the last candidate inside the
//! limit, in order of preference:
//!
//! 1. paragraph break (after a blank line)
//! 2. sentence end (`. `, `! `, `? `, or the same followed by a newline)
//! 3. whitespace
//! 4. hard cut at any character boundary
//!
//! No candidate may fall inside a fenced code block or an inline code span.
//! Links and emphasis runs are kept whole too, unless the run alone is longer
//! than the limit. When a code span leaves no legal break inside the limit,
//! the chunk is extended to the end of the span and flagged as oversized.

use super::markup::{Span, protected_spans};
use crate::error::SplitError;

/// Chunks produced by [`split_with_report`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitReport {
    /// Ordered chunks; their concatenation equals the input.
    pub chunks: Vec<String>,
    /// Indices of chunks longer than the requested limit.
    pub oversized: Vec<usize>,
}

impl SplitReport {
    pub fn has_oversized(&self) -> bool {
        !self.oversized.is_empty()
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Returns an empty list for empty input. A zero limit is a caller bug and
/// is rejected.
pub fn split(text: &str, max_chars: usize) -> Result<Vec<String>, SplitError> {
    split_with_report(text, max_chars).map(|report| report.chunks)
}

/// Like [`split`], also reporting chunks that had to exceed the limit.
pub fn split_with_report(text: &str, max_chars: usize) -> Result<SplitReport, SplitError> {
    if max_chars == 0 {
        return Err(SplitError::InvalidLimit(max_chars));
    }
    if text.is_empty() {
        return Ok(SplitReport::default());
    }
    if text.chars().count() <= max_chars {
        return Ok(SplitReport {
            chunks: vec![text.to_string()],
            oversized: Vec::new(),
        });
    }

    let blocked = blocked_positions(text, &protected_spans(text), max_chars);
    let mut report = SplitReport::default();
    let mut start = 0;

    while start < text.len() {
        let Some(limit_end) = nth_boundary(text, start, max_chars) else {
            report.chunks.push(text[start..].to_string());
            break;
        };

        let cut = match best_break(text, start, limit_end, &blocked) {
            Some(cut) => cut,
            None => {
                let cut = next_safe_boundary(text, limit_end, &blocked);
                tracing::debug!(
                    start,
                    cut,
                    max_chars,
                    "No safe break inside limit; extending chunk past a code span"
                );
                report.oversized.push(report.chunks.len());
                cut
            }
        };

        report.chunks.push(text[start..cut].to_string());
        start = cut;
    }

    Ok(report)
}

/// Break preference, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BreakClass {
    Paragraph,
    Sentence,
    Whitespace,
    Hard,
}

/// Mark every byte offset that lies strictly inside an active span.
fn blocked_positions(text: &str, spans: &[Span], max_chars: usize) -> Vec<bool> {
    let mut blocked = vec![false; text.len() + 1];
    for span in spans {
        if !span.kind.is_hard() && text[span.start..span.end].chars().count() > max_chars {
            continue;
        }
        for flag in &mut blocked[span.start + 1..span.end] {
            *flag = true;
        }
    }
    blocked
}

/// Byte offset `n` characters after `start`, or `None` if the rest is shorter.
fn nth_boundary(text: &str, start: usize, n: usize) -> Option<usize> {
    text[start..].char_indices().nth(n).map(|(i, _)| start + i)
}

fn best_break(text: &str, start: usize, limit_end: usize, blocked: &[bool]) -> Option<usize> {
    let mut best: Option<(BreakClass, usize)> = None;

    // Candidates are char boundaries in (start, limit_end].
    let boundaries = text[start..limit_end]
        .char_indices()
        .skip(1)
        .map(|(i, _)| start + i)
        .chain(std::iter::once(limit_end));

    for pos in boundaries {
        if blocked[pos] {
            continue;
        }
        let class = classify_break(text, pos);
        match best {
            Some((best_class, _)) if best_class < class => {}
            _ => best = Some((class, pos)),
        }
    }

    best.map(|(_, pos)| pos)
}

fn classify_break(text: &str, pos: usize) -> BreakClass {
    let before = &text[..pos];
    let next = text[pos..].chars().next();

    if before.ends_with("\n\n") && next != Some('\n') {
        return BreakClass::Paragraph;
    }

    let mut tail = before.chars().rev();
    let last = tail.next();
    let prev = tail.next();
    if let (Some(last), Some(prev)) = (last, prev)
        && last.is_whitespace()
        && matches!(prev, '.' | '!' | '?')
    {
        return BreakClass::Sentence;
    }

    if last.is_some_and(char::is_whitespace) {
        return BreakClass::Whitespace;
    }

    BreakClass::Hard
}

fn next_safe_boundary(text: &str, from: usize, blocked: &[bool]) -> usize {
    text[from..]
        .char_indices()
        .map(|(i, _)| from + i)
        .find(|&pos| !blocked[pos])
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::markup::count_fence_delimiters;
    use pretty_assertions::assert_eq;

    fn char_len(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        assert_eq!(split("abc", 0), Err(SplitError::InvalidLimit(0)));
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(split("", 10).unwrap().is_empty());
    }

    #[test]
    fn test_short_input_is_single_chunk() {
        assert_eq!(split("Hello, world!", 100).unwrap(), vec!["Hello, world!"]);
    }

    #[test]
    fn test_plain_5000_chars_into_three_chunks() {
        let text = "x".repeat(5000);
        let chunks = split(&text, 2000).unwrap();

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| char_len(c) <= 2000));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = "First paragraph here.\n\nSecond one. With sentences here.";
        let chunks = split(text, 40).unwrap();
        assert_eq!(chunks[0], "First paragraph here.\n\n");
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_keeps_whole_newline_run_with_paragraph() {
        let text = "Alpha.\n\n\n\nBravo bravo bravo bravo.";
        let chunks = split(text, 15).unwrap();
        assert_eq!(chunks[0], "Alpha.\n\n\n\n");
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_sentence_break_before_whitespace() {
        let text = "One two three. Four five six seven";
        let chunks = split(text, 25).unwrap();
        assert_eq!(chunks[0], "One two three. ");
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_whitespace_break_fallback() {
        let text = "word1 word2 word3 word4 word5 word6";
        let chunks = split(text, 14).unwrap();
        assert_eq!(chunks[0], "word1 word2 ");
        assert!(chunks.iter().all(|c| char_len(c) <= 14));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_code_block_is_never_cut() {
        let text = "Intro text here.\n\n```rust\nfn main() {\n    println!(\"hi\");\n}\n```\n\nOutro.";
        let chunks = split(text, 30).unwrap();

        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert_eq!(count_fence_delimiters(chunk) % 2, 0, "dangling fence in {chunk:?}");
        }
    }

    #[test]
    fn test_oversized_code_block_is_flagged() {
        let code = format!("```\n{}\n```", "y".repeat(80));
        let text = format!("ok.\n\n{code}\n\nbye.");
        let report = split_with_report(&text, 20).unwrap();

        assert_eq!(report.chunks.concat(), text);
        assert!(report.has_oversized());
        let big = &report.chunks[report.oversized[0]];
        assert!(big.contains(&code));
    }

    #[test]
    fn test_inline_code_not_cut() {
        let text = "aaaa `let x = compute(1, 2);` bbbb";
        let chunks = split(text, 12).unwrap();
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().any(|c| c.contains("`let x = compute(1, 2);`")));
    }

    #[test]
    fn test_emphasis_kept_together() {
        let text = "some words **bold phrase** more words";
        let chunks = split(text, 20).unwrap();
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert_eq!(chunk.matches("**").count() % 2, 0, "split bold in {chunk:?}");
        }
        assert!(chunks.iter().all(|c| char_len(c) <= 20));
    }

    #[test]
    fn test_emphasis_longer_than_limit_may_be_split() {
        let text = format!("**{}z**", "z ".repeat(30));
        let report = split_with_report(&text, 10).unwrap();
        assert_eq!(report.chunks.concat(), text);
        assert!(!report.has_oversized());
        assert!(report.chunks.iter().all(|c| char_len(c) <= 10));
    }

    #[test]
    fn test_link_kept_together() {
        let text = "read [the manual](https://example.com/manual) first";
        let chunks = split(text, 40).unwrap();
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().any(|c| c.contains("[the manual](https://example.com/manual)")));
    }

    #[test]
    fn test_multibyte_characters_counted_as_chars() {
        let text = "é".repeat(25);
        let chunks = split(&text, 10).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| char_len(c) <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_unicode_sentences() {
        let text = "Привет мир, это тест. Second sentence with emojis 🎉🎊 here.";
        let chunks = split(text, 25).unwrap();
        assert_eq!(chunks[0], "Привет мир, это тест. ");
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_deterministic() {
        let text = "Lorem ipsum dolor sit amet. ".repeat(40);
        assert_eq!(split(&text, 97).unwrap(), split(&text, 97).unwrap());
    }
}
