//! Target line selection over OCR output.
//!
//! The shipment identifier looks like `163233702292313922_1_IWV`: a long digit
//! run, a separator, the digit `1` and usually another separator. Worn labels
//! make OCR read the underscores as dots, hyphens or spaces, so all four are
//! accepted and rewritten back to `_`.

use std::ops::Range;

use tracing::debug;
use waybill_core::{OcrLine, TargetMatch};

/// Shortest digit run that can precede the `1`.
pub const MIN_DIGIT_RUN: usize = 10;

pub const CANONICAL_SEPARATOR: char = '_';

/// Characters OCR confuses with the canonical underscore.
pub fn is_separator(c: char) -> bool {
    matches!(c, '_' | '.' | '-') || c.is_whitespace()
}

#[derive(Debug, Clone, Copy)]
enum Scan {
    Idle,
    /// Inside a digit run starting at byte `start`.
    Digits { start: usize, len: usize },
    /// Long-enough run followed by one separator.
    Separator { start: usize },
    /// Run, separator and `1` seen; `end` is just past the `1`.
    One { start: usize, end: usize },
}

/// Byte range of the first `DIGIT{10,} SEP '1' SEP?` occurrence in `line`,
/// scanning left to right.
pub fn find_target_span(line: &str) -> Option<Range<usize>> {
    let mut state = Scan::Idle;

    for (pos, c) in line.char_indices() {
        let next_pos = pos + c.len_utf8();
        state = match state {
            Scan::Idle if c.is_ascii_digit() => Scan::Digits { start: pos, len: 1 },
            Scan::Idle => Scan::Idle,
            Scan::Digits { start, len } if c.is_ascii_digit() => Scan::Digits { start, len: len + 1 },
            Scan::Digits { start, len } if len >= MIN_DIGIT_RUN && is_separator(c) => {
                Scan::Separator { start }
            }
            Scan::Digits { .. } => Scan::Idle,
            Scan::Separator { start } if c == '1' => Scan::One { start, end: next_pos },
            // A digit after the separator may begin a fresh run.
            Scan::Separator { .. } if c.is_ascii_digit() => Scan::Digits { start: pos, len: 1 },
            Scan::Separator { .. } => Scan::Idle,
            Scan::One { start, .. } if is_separator(c) => return Some(start..next_pos),
            Scan::One { start, end } => return Some(start..end),
        };
    }

    match state {
        Scan::One { start, end } => Some(start..end),
        _ => None,
    }
}

/// Canonical form of `text` if it holds a target identifier: surrounding
/// whitespace trimmed and every separator inside the matched span rewritten
/// to `_`. Text outside the span is left as is.
pub fn normalize_line(text: &str) -> Option<String> {
    let line = text.trim();
    let span = find_target_span(line)?;

    let mut out = String::with_capacity(line.len());
    out.push_str(&line[..span.start]);
    out.extend(line[span.clone()].chars().map(|c| {
        if is_separator(c) { CANONICAL_SEPARATOR } else { c }
    }));
    out.push_str(&line[span.end..]);
    Some(out)
}

pub struct Extractor;

impl Extractor {
    /// First line, in engine scan order, that carries the identifier. Its
    /// confidence is passed through exactly as the engine reported it.
    pub fn extract(lines: &[OcrLine]) -> TargetMatch {
        for (index, line) in lines.iter().enumerate() {
            if let Some(canonical) = normalize_line(&line.text) {
                debug!(index, raw = %line.text, line = %canonical, "target line matched");
                return TargetMatch::found(canonical, line.confidence);
            }
        }
        debug!(lines = lines.len(), "no target line");
        TargetMatch::not_found()
    }
}
