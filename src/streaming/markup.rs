//! Markdown structure scanning.
//!
//! Two views of the same rules:
//! - [`FenceTracker`] is incremental and feeds on deltas as they arrive, so a
//!   fence delimiter split across two deltas is still counted once.
//! - [`protected_spans`] scans a finished text block for ranges that must not
//!   be cut: fenced code, inline code, links and emphasis runs.
//!
//! A fence delimiter is a line whose first non-space content (at most three
//! spaces of indent) is a run of three or more backticks. Every such line
//! toggles the fence, whatever the length of the opener; tilde fences are not
//! recognised.

/// Incremental code-fence depth counter.
#[derive(Debug, Clone, Default)]
pub struct FenceTracker {
    depth: usize,
    leading_spaces: u8,
    backticks: u8,
    line_settled: bool,
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume more text.
    pub fn feed(&mut self, text: &str) {
        for ch in text.chars() {
            if ch == '\n' {
                self.leading_spaces = 0;
                self.backticks = 0;
                self.line_settled = false;
                continue;
            }
            if self.line_settled {
                continue;
            }
            match ch {
                ' ' if self.backticks == 0 && self.leading_spaces < 3 => self.leading_spaces += 1,
                '`' => {
                    self.backticks += 1;
                    if self.backticks == 3 {
                        self.depth += 1;
                        self.line_settled = true;
                    }
                }
                _ => self.line_settled = true,
            }
        }
    }

    /// Total fence delimiters seen so far.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether an opened fence is still waiting for its closing delimiter.
    pub fn is_open(&self) -> bool {
        self.depth % 2 == 1
    }
}

/// Count fence delimiters in a complete text.
pub fn count_fence_delimiters(text: &str) -> usize {
    let mut tracker = FenceTracker::new();
    tracker.feed(text);
    tracker.depth()
}

/// What a protected span covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Fence,
    InlineCode,
    Link,
    Emphasis,
}

impl SpanKind {
    /// Code spans are never cut, even when that overflows a message.
    pub fn is_hard(self) -> bool {
        matches!(self, SpanKind::Fence | SpanKind::InlineCode)
    }
}

/// A byte range `[start, end)` that must not contain a split point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub kind: SpanKind,
}

impl Span {
    fn new(start: usize, end: usize, kind: SpanKind) -> Self {
        Self { start, end, kind }
    }

    /// Whether a cut at byte `pos` would land inside this span.
    pub fn contains_cut(&self, pos: usize) -> bool {
        self.start < pos && pos < self.end
    }
}

/// Find all protected spans in `text`, sorted by start offset.
pub fn protected_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open_fence: Option<usize> = None;
    let mut prose_start = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let content = line.strip_suffix('\n').unwrap_or(line);
        if is_fence_line(content) {
            match open_fence.take() {
                None => {
                    scan_prose(text, prose_start, offset, &mut spans);
                    open_fence = Some(offset);
                }
                Some(start) => {
                    spans.push(Span::new(start, offset + content.len(), SpanKind::Fence));
                    prose_start = offset + content.len();
                }
            }
        }
        offset += line.len();
    }

    match open_fence {
        Some(start) => spans.push(Span::new(start, text.len(), SpanKind::Fence)),
        None => scan_prose(text, prose_start, text.len(), &mut spans),
    }

    spans.sort_by_key(|s| (s.start, s.end));
    spans
}

fn is_fence_line(line: &str) -> bool {
    let indent = line.len() - line.trim_start_matches(' ').len();
    indent <= 3 && line[indent..].starts_with("```")
}

/// Scan a fence-free region paragraph by paragraph.
fn scan_prose(text: &str, start: usize, end: usize, spans: &mut Vec<Span>) {
    if start >= end {
        return;
    }
    let region = &text[start..end];
    let mut para_start = 0;
    let mut search = 0;
    while let Some(found) = region[search..].find("\n\n") {
        let para_end = search + found;
        scan_paragraph(text, start + para_start, start + para_end, spans);
        para_start = para_end + 2;
        search = para_start;
    }
    scan_paragraph(text, start + para_start, end, spans);
}

fn scan_paragraph(text: &str, start: usize, end: usize, spans: &mut Vec<Span>) {
    if start >= end {
        return;
    }
    let bytes = text.as_bytes();

    // Inline code first: it shields its content from every other rule.
    let mut code = Vec::new();
    let mut i = start;
    while i < end {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => {
                let run = run_length(bytes, i, end, b'`');
                match find_backtick_run(bytes, i + run, end, run) {
                    Some(close) => {
                        code.push(Span::new(i, close + run, SpanKind::InlineCode));
                        i = close + run;
                    }
                    None => i += run,
                }
            }
            _ => i += 1,
        }
    }

    let in_code = |pos: usize| code.iter().any(|s| s.start <= pos && pos < s.end);

    let mut links = Vec::new();
    let mut i = start;
    while i < end {
        if bytes[i] == b'[' && !in_code(i) {
            if let Some(link_end) = find_link_end(bytes, i, end, &in_code) {
                let link_start = if i > start && bytes[i - 1] == b'!' { i - 1 } else { i };
                links.push(Span::new(link_start, link_end, SpanKind::Link));
                i = link_end;
                continue;
            }
        }
        i += 1;
    }

    let shielded = |pos: usize| in_code(pos) || links.iter().any(|s| s.start <= pos && pos < s.end);
    let emphasis = scan_emphasis(text, start, end, &shielded);

    spans.extend(code);
    spans.extend(links);
    spans.extend(emphasis);
}

fn run_length(bytes: &[u8], from: usize, end: usize, byte: u8) -> usize {
    bytes[from..end].iter().take_while(|&&b| b == byte).count()
}

fn find_backtick_run(bytes: &[u8], from: usize, end: usize, len: usize) -> Option<usize> {
    let mut i = from;
    while i < end {
        if bytes[i] == b'`' {
            let run = run_length(bytes, i, end, b'`');
            if run == len {
                return Some(i);
            }
            i += run;
        } else {
            i += 1;
        }
    }
    None
}

fn find_link_end(
    bytes: &[u8],
    open: usize,
    end: usize,
    in_code: &impl Fn(usize) -> bool,
) -> Option<usize> {
    let mut i = open + 1;
    while i + 1 < end {
        match bytes[i] {
            b'\n' if bytes.get(i + 1) == Some(&b'\n') => return None,
            b']' if bytes[i + 1] == b'(' && !in_code(i) => {
                let close = bytes[i + 2..end].iter().position(|&b| b == b')' || b == b'\n')?;
                let close = i + 2 + close;
                return (bytes[close] == b')').then_some(close + 1);
            }
            _ => i += 1,
        }
    }
    None
}

fn scan_emphasis(
    text: &str,
    start: usize,
    end: usize,
    shielded: &impl Fn(usize) -> bool,
) -> Vec<Span> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    // (marker byte, marker width, opening offset)
    let mut openers: Vec<(u8, usize, usize)> = Vec::new();
    let mut i = start;

    while i < end {
        let byte = bytes[i];
        let escaped = i > start && bytes[i - 1] == b'\\';
        if !matches!(byte, b'*' | b'_' | b'~') || escaped || shielded(i) {
            i += 1;
            continue;
        }
        let run = run_length(bytes, i, end, byte);
        let width = if run >= 2 { 2 } else { 1 };
        if byte == b'~' && width == 1 {
            i += run;
            continue;
        }

        let before = text[..i].chars().next_back();
        let after = text[i + run..].chars().next();
        let left_flanking = after.is_some_and(|c| !c.is_whitespace());
        let right_flanking = before.is_some_and(|c| !c.is_whitespace());
        let (can_open, can_close) = if byte == b'_' {
            (
                left_flanking && !before.is_some_and(char::is_alphanumeric),
                right_flanking && !after.is_some_and(char::is_alphanumeric),
            )
        } else {
            (left_flanking, right_flanking)
        };

        let matching = openers
            .iter()
            .rposition(|&(b, w, _)| b == byte && w == width);
        match matching {
            Some(idx) if can_close => {
                let (_, _, open_at) = openers[idx];
                openers.truncate(idx);
                spans.push(Span::new(open_at, i + run, SpanKind::Emphasis));
            }
            _ if can_open => openers.push((byte, width, i)),
            _ => {}
        }
        i += run;
    }

    spans
}
