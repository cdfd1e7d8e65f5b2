use std::ops::Range as Span;
use tower_lsp::lsp_types::{Position, Range};

type LineOffset = usize;

/// Raw file text plus a line index for byte offset and LSP position conversion.
///
/// Columns are counted in UTF-16 code units, as the protocol expects.
#[derive(Debug, Clone, Default)]
pub struct Document {
    text: String,
    line_index: LineIndex,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let line_index = LineIndex::new(&text);
        Self { text, line_index }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn line_count(&self) -> usize {
        self.line_index.line_starts.len()
    }

    pub fn offset(&self, position: Position) -> Option<usize> {
        self.line_index.offset(&self.text, position)
    }

    pub fn position_at(&self, byte_offset: usize) -> Position {
        self.line_index.position_at(&self.text, byte_offset)
    }

    pub fn range_of(&self, span: Span<usize>) -> Range {
        Range {
            start: self.position_at(span.start),
            end: self.position_at(span.end),
        }
    }

    /// Text of a single line without its terminator.
    pub fn line(&self, line: usize) -> Option<&str> {
        let span = self.line_span(line)?;
        Some(&self.text[span])
    }

    /// Byte span of a line, excluding the `\n` (and a preceding `\r`).
    pub fn line_span(&self, line: usize) -> Option<Span<usize>> {
        let start = *self.line_index.line_starts.get(line)?;
        let mut end = self
            .line_index
            .line_starts
            .get(line + 1)
            .map(|next| next - 1)
            .unwrap_or(self.text.len());
        if self.text[start..end].ends_with('\r') {
            end -= 1;
        }
        Some(start..end)
    }

    pub fn range(&self) -> Range {
        self.line_index.range(&self.text)
    }

    /// Position just past the last character.
    pub fn end_position(&self) -> Position {
        self.position_at(self.text.len())
    }
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'?' | b':' | b'.')
}

/// Byte spans of `name` inside `scope` matching whole PDDL identifiers,
/// case-insensitively, outside of `;` comments.
pub fn identifier_occurrences(text: &str, scope: Span<usize>, name: &str) -> Vec<Span<usize>> {
    if name.is_empty() || scope.end > text.len() || scope.start >= scope.end {
        return Vec::new();
    }
    let bytes = text.as_bytes();
    let haystack = text[scope.clone()].to_ascii_lowercase();
    let needle = name.to_ascii_lowercase();

    let mut spans = Vec::new();
    for (relative, _) in haystack.match_indices(&needle) {
        let start = scope.start + relative;
        let end = start + needle.len();
        if start > 0 && is_identifier_byte(bytes[start - 1]) {
            continue;
        }
        if end < bytes.len() && is_identifier_byte(bytes[end]) {
            continue;
        }
        if is_commented(text, start) {
            continue;
        }
        spans.push(start..end);
    }
    spans
}

/// Whether a `;` precedes `offset` on its line.
pub fn is_commented(text: &str, offset: usize) -> bool {
    let line_start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    text[line_start..offset].contains(';')
}

#[derive(Debug, Clone)]
struct LineIndex {
    line_starts: Vec<LineOffset>,
}

impl Default for LineIndex {
    fn default() -> Self {
        Self {
            line_starts: vec![0],
        }
    }
}

impl LineIndex {
    fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        for (idx, ch) in text.char_indices() {
            if ch == '\n' {
                line_starts.push(idx + 1);
            }
        }
        Self { line_starts }
    }

    fn offset(&self, text: &str, position: Position) -> Option<usize> {
        let line = position.line as usize;
        let line_start = *self.line_starts.get(line)?;
        let line_end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(text.len());
        let mut line_slice = &text[line_start..line_end];
        if let Some(stripped) = line_slice.strip_suffix('\n') {
            line_slice = stripped;
        }

        let mut current_units = 0u32;
        for (byte_idx, ch) in line_slice.char_indices() {
            if current_units >= position.character {
                return Some(line_start + byte_idx);
            }
            current_units += ch.len_utf16() as u32;
        }

        Some(line_start + line_slice.len())
    }

    fn position_at(&self, text: &str, byte_offset: usize) -> Position {
        let mut clamped = byte_offset.min(text.len());
        while !text.is_char_boundary(clamped) {
            clamped -= 1;
        }
        let line = self.line_for_offset(clamped);
        let line_start = self.line_starts.get(line).copied().unwrap_or(0);
        let column_units = text[line_start..clamped]
            .chars()
            .map(|ch| ch.len_utf16() as u32)
            .sum();

        Position {
            line: line as u32,
            character: column_units,
        }
    }

    fn range(&self, text: &str) -> Range {
        Range {
            start: Position::default(),
            end: self.position_at(text, text.len()),
        }
    }

    fn line_for_offset(&self, offset: usize) -> usize {
        match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next_line) => next_line.saturating_sub(1),
        }
    }
}
