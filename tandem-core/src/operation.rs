//! Edit operations over a shared text document.
//!
//! Positions and lengths are Unicode codepoint offsets, not byte offsets:
//! editor frontends address text by character, and a multi-byte character
//! must count as one position on every client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single-span edit: insert text at a position, or delete a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edit {
    Insert { pos: usize, text: String },
    Delete { pos: usize, len: usize },
}

impl Edit {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(pos: usize, len: usize) -> Self {
        Self::Delete { pos, len }
    }

    /// Start position of the span.
    pub fn pos(&self) -> usize {
        match self {
            Self::Insert { pos, .. } | Self::Delete { pos, .. } => *pos,
        }
    }

    /// Codepoints inserted or deleted.
    pub fn len(&self) -> usize {
        match self {
            Self::Insert { text, .. } => text.chars().count(),
            Self::Delete { len, .. } => *len,
        }
    }

    /// End of the affected range in the pre-edit text. An insert occupies
    /// no pre-edit range, so its end equals its position.
    pub fn end(&self) -> usize {
        match self {
            Self::Insert { pos, .. } => *pos,
            Self::Delete { pos, len } => pos + len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply this edit to `text` in place.
    pub fn apply(&self, text: &mut String) -> Result<(), SpanOutOfBounds> {
        match self {
            Self::Insert { pos, text: ins } => {
                let at = byte_at(text, *pos).ok_or_else(|| self.out_of_bounds(text))?;
                text.insert_str(at, ins);
            }
            Self::Delete { pos, len } => {
                let start = byte_at(text, *pos).ok_or_else(|| self.out_of_bounds(text))?;
                let end = byte_at(&text[start..], *len)
                    .map(|off| start + off)
                    .ok_or_else(|| self.out_of_bounds(text))?;
                text.replace_range(start..end, "");
            }
        }
        Ok(())
    }

    fn out_of_bounds(&self, text: &str) -> SpanOutOfBounds {
        SpanOutOfBounds {
            pos: self.pos(),
            len: self.len(),
            doc_len: text.chars().count(),
        }
    }
}

/// An edit span fell outside the document it was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanOutOfBounds {
    pub pos: usize,
    pub len: usize,
    pub doc_len: usize,
}

impl std::fmt::Display for SpanOutOfBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "edit span at {} (len {}) outside document of {} chars",
            self.pos, self.len, self.doc_len
        )
    }
}

impl std::error::Error for SpanOutOfBounds {}

/// Byte offset of the codepoint at `char_pos`, or of the end of the text
/// when `char_pos` equals the character count.
fn byte_at(text: &str, char_pos: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(char_pos)
}

/// One edit as authored by a client, tagged with provenance and the
/// revision the author believed was current. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub author: Uuid,
    pub base_revision: u64,
    pub edit: Edit,
}

impl Operation {
    pub fn insert(author: Uuid, base_revision: u64, pos: usize, text: impl Into<String>) -> Self {
        Self {
            author,
            base_revision,
            edit: Edit::insert(pos, text),
        }
    }

    pub fn delete(author: Uuid, base_revision: u64, pos: usize, len: usize) -> Self {
        Self {
            author,
            base_revision,
            edit: Edit::delete(pos, len),
        }
    }
}

/// An operation the sequencer accepted, with its assigned revision and the
/// transformed form actually applied.
///
/// `applied` is either a single insert, or zero-or-more disjoint delete
/// spans in ascending position order. All spans are expressed against the
/// text at `revision - 1` and applied back-to-front so earlier spans do
/// not shift later ones. A delete reconciled across a concurrent interior
/// insert splits into two spans; a delete fully superseded by earlier
/// overlapping deletes commits with no spans at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedOperation {
    pub revision: u64,
    pub author: Uuid,
    pub base_revision: u64,
    pub applied: Vec<Edit>,
}

impl CommittedOperation {
    /// Apply the committed spans to `text` in place.
    pub fn apply(&self, text: &mut String) -> Result<(), SpanOutOfBounds> {
        for edit in self.applied.iter().rev() {
            edit.apply(text)?;
        }
        Ok(())
    }

    /// True when reconciliation left nothing to apply.
    pub fn is_noop(&self) -> bool {
        self.applied.iter().all(Edit::is_empty)
    }
}
