//! Entity algebra: pure offset arithmetic over annotated message text.
//!
//! The platform addresses message text in UTF-16 code units, so every
//! operation here measures offsets and lengths in those units. Codepoints
//! outside the Basic Multilingual Plane consume two units; the conversion
//! helpers account for that explicitly.
//!
//! Invariant maintained by `cut`/`insert`: annotations never overlap and all
//! offsets stay within `[0, utf16_len(text)]`.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// What a platform annotation marks over a span of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Tag,
    Link,
    Mention,
    Bold,
    Italic,
    Strikethrough,
    Code,
}

/// A platform-tracked `(kind, offset, length)` span over message text.
///
/// Offsets and lengths are UTF-16 code units. The optional payload carries
/// kind-specific data (a link URL, a mention target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub offset: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Annotation {
    #[must_use]
    pub const fn new(kind: AnnotationKind, offset: usize, length: usize) -> Self {
        Self {
            kind,
            offset,
            length,
            payload: None,
        }
    }

    /// End offset (exclusive) in UTF-16 units.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// A message body plus its ordered annotation list.
///
/// Invariant: annotations sorted ascending by offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichText {
    pub body: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl RichText {
    #[must_use]
    pub fn new(body: impl Into<String>, annotations: Vec<Annotation>) -> Self {
        let mut annotations = annotations;
        annotations.sort_by_key(|a| a.offset);
        Self {
            body: body.into(),
            annotations,
        }
    }
}

/// Length of `text` in UTF-16 code units.
#[must_use]
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Byte index of the given UTF-16 offset.
///
/// Returns `None` when the offset lies beyond the text or inside a
/// surrogate pair.
#[must_use]
pub fn byte_of_utf16(text: &str, offset: usize) -> Option<usize> {
    let mut units = 0;
    for (byte, ch) in text.char_indices() {
        if units == offset {
            return Some(byte);
        }
        if units > offset {
            return None;
        }
        units += ch.len_utf16();
    }
    (units == offset).then_some(text.len())
}

/// The character starting at the given UTF-16 offset, if any.
#[must_use]
pub fn char_at_utf16(text: &str, offset: usize) -> Option<char> {
    let byte = byte_of_utf16(text, offset)?;
    text[byte..].chars().next()
}

/// Slice of `text` covering `[offset, offset + length)` UTF-16 units.
#[must_use]
pub fn span_text(text: &str, offset: usize, length: usize) -> Option<&str> {
    let start = byte_of_utf16(text, offset)?;
    let end = byte_of_utf16(text, offset + length)?;
    text.get(start..end)
}

/// Add `delta` to the offset of every annotation at or after `from_offset`.
pub fn shift(annotations: &mut [Annotation], delta: isize, from_offset: usize) {
    for ann in annotations.iter_mut() {
        if ann.offset >= from_offset {
            ann.offset = ann.offset.saturating_add_signed(delta);
        }
    }
}

/// Remove the annotation at `index`, replacing its span with a single space.
///
/// Whitespace policy: a space immediately before the span is absorbed into
/// the removed range; failing that, a space immediately after is. The span
/// is replaced by one space rather than nothing so adjacent words never
/// merge. Annotations intersecting the removed range leave with it;
/// annotations past it shift by the net length change.
pub fn cut(
    text: &str,
    annotations: &[Annotation],
    index: usize,
) -> Result<(String, Vec<Annotation>), CodecError> {
    let total = utf16_len(text);
    let ann = annotations.get(index).ok_or(CodecError::IndexOutOfRange {
        index,
        count: annotations.len(),
    })?;
    if ann.end() > total {
        return Err(CodecError::SpanOutOfBounds {
            offset: ann.offset,
            length: ann.length,
            text_units: total,
        });
    }

    let mut start = ann.offset;
    let mut end = ann.end();
    if start > 0 && char_at_utf16(text, start - 1) == Some(' ') {
        start -= 1;
    } else if char_at_utf16(text, end) == Some(' ') {
        end += 1;
    }
    let removed = end - start;

    let start_byte =
        byte_of_utf16(text, start).ok_or(CodecError::SurrogateSplit { offset: start })?;
    let end_byte = byte_of_utf16(text, end).ok_or(CodecError::SurrogateSplit { offset: end })?;

    let mut body = String::with_capacity(text.len() - (end_byte - start_byte) + 1);
    body.push_str(&text[..start_byte]);
    body.push(' ');
    body.push_str(&text[end_byte..]);

    let mut out = Vec::with_capacity(annotations.len() - 1);
    let delta = 1 - isize::try_from(removed).unwrap_or(isize::MAX);
    for (i, other) in annotations.iter().enumerate() {
        if i == index {
            continue;
        }
        // Spans inside the removed range leave with it, e.g. a decoration
        // over an absorbed date suffix.
        if other.offset < end && other.end() > start {
            continue;
        }
        let mut other = other.clone();
        if other.offset >= end {
            other.offset = other.offset.saturating_add_signed(delta);
        }
        out.push(other);
    }
    Ok((body, out))
}

/// Insert `literal` at `position`, annotated as `kind`.
///
/// A single trailing space is appended when the position is not at
/// end-of-text. Annotations at or after the position shift right; the new
/// annotation covers exactly `literal` and the list is re-sorted by offset.
pub fn insert(
    text: &str,
    annotations: &[Annotation],
    literal: &str,
    kind: AnnotationKind,
    position: usize,
) -> Result<(String, Vec<Annotation>), CodecError> {
    let (body, mut out) = splice(text, annotations, literal, position)?;
    out.push(Annotation::new(kind, position, utf16_len(literal)));
    out.sort_by_key(|a| a.offset);
    Ok((body, out))
}

/// Insert `literal` at `position` without annotating it.
///
/// Shifting and the trailing-space rule match [`insert`]; used for the
/// plain-text date suffix of a scheduled tag.
pub fn insert_plain(
    text: &str,
    annotations: &[Annotation],
    literal: &str,
    position: usize,
) -> Result<(String, Vec<Annotation>), CodecError> {
    splice(text, annotations, literal, position)
}

fn splice(
    text: &str,
    annotations: &[Annotation],
    literal: &str,
    position: usize,
) -> Result<(String, Vec<Annotation>), CodecError> {
    let total = utf16_len(text);
    if position > total {
        return Err(CodecError::SpanOutOfBounds {
            offset: position,
            length: 0,
            text_units: total,
        });
    }
    let trailing = position < total;
    let at = byte_of_utf16(text, position).ok_or(CodecError::SurrogateSplit { offset: position })?;

    let mut body = String::with_capacity(text.len() + literal.len() + 1);
    body.push_str(&text[..at]);
    body.push_str(literal);
    if trailing {
        body.push(' ');
    }
    body.push_str(&text[at..]);

    let delta = utf16_len(literal) + usize::from(trailing);
    let mut out = annotations.to_vec();
    shift(
        &mut out,
        isize::try_from(delta).unwrap_or(isize::MAX),
        position,
    );
    Ok((body, out))
}

/// Recompute annotation offsets measured in codepoints into UTF-16 units.
///
/// Some upstream producers count codepoints; the platform counts UTF-16
/// units. Offsets and lengths past the text are clamped to its end.
pub fn align_to_utf16(text: &str, annotations: &mut [Annotation]) {
    let mut prefix = Vec::with_capacity(text.chars().count() + 1);
    let mut units = 0;
    for ch in text.chars() {
        prefix.push(units);
        units += ch.len_utf16();
    }
    prefix.push(units);

    let last = prefix.len() - 1;
    for ann in annotations.iter_mut() {
        let start_cp = ann.offset.min(last);
        let end_cp = (ann.offset + ann.length).min(last);
        ann.offset = prefix[start_cp];
        ann.length = prefix[end_cp] - prefix[start_cp];
    }
}
