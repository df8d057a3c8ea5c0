//! Per-document sequencing: authoritative text, revision assignment, and
//! the committed-operation log used for catch-up.
//!
//! A `DocumentState` is the single point of serialization for one
//! document. Callers (a session actor, a test) feed it operations one at
//! a time; it folds each across everything committed since the
//! operation's base revision, applies the adjusted spans, and assigns the
//! next revision. Revisions are gap-free from 1; replaying the log
//! against the hydration snapshot always reproduces the current text.

use crate::operation::{CommittedOperation, Edit, Operation};
use crate::transform;

/// Rejection and failure modes of [`DocumentState::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Base revision ahead of the document — the client is desynchronized
    /// and must resubscribe.
    FutureRevision { base: u64, current: u64 },
    /// Base revision predates the retained history — the client must
    /// re-hydrate from a fresh snapshot.
    StaleRevision { base: u64, floor: u64 },
    /// The adjusted span falls outside the current text.
    OutOfRange {
        pos: usize,
        len: usize,
        doc_len: usize,
    },
    /// The text invariant is broken; the owning session must close.
    Corrupted(String),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FutureRevision { base, current } => {
                write!(f, "base revision {base} ahead of document revision {current}")
            }
            Self::StaleRevision { base, floor } => {
                write!(f, "base revision {base} below retained history floor {floor}")
            }
            Self::OutOfRange { pos, len, doc_len } => {
                write!(f, "span at {pos} (len {len}) outside document of {doc_len} chars")
            }
            Self::Corrupted(detail) => write!(f, "document state corrupted: {detail}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Authoritative state of one document.
#[derive(Debug, Clone)]
pub struct DocumentState {
    text: String,
    len_chars: usize,
    revision: u64,
    /// Hydration floor: the log covers `(floor, revision]`.
    floor: u64,
    history: Vec<CommittedOperation>,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentState {
    /// Fresh, empty document at revision 0.
    pub fn new() -> Self {
        Self {
            text: String::new(),
            len_chars: 0,
            revision: 0,
            floor: 0,
            history: Vec::new(),
        }
    }

    /// Hydrate from a snapshot. History before the snapshot revision is
    /// not held; clients older than it must re-hydrate.
    pub fn from_snapshot(text: String, revision: u64) -> Self {
        let len_chars = text.chars().count();
        Self {
            text,
            len_chars,
            revision,
            floor: revision,
            history: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn len_chars(&self) -> usize {
        self.len_chars
    }

    /// Sequence an operation: validate its base, fold it across everything
    /// committed since, apply, and assign the next revision.
    ///
    /// Rejections leave the state untouched. `Corrupted` means the text
    /// invariant no longer holds and the document must be abandoned.
    pub fn submit(&mut self, op: Operation) -> Result<CommittedOperation, SubmitError> {
        if op.base_revision > self.revision {
            log::debug!(
                "rejecting op from {}: base {} ahead of {}",
                op.author,
                op.base_revision,
                self.revision
            );
            return Err(SubmitError::FutureRevision {
                base: op.base_revision,
                current: self.revision,
            });
        }
        if op.base_revision < self.floor {
            log::debug!(
                "rejecting op from {}: base {} below floor {}",
                op.author,
                op.base_revision,
                self.floor
            );
            return Err(SubmitError::StaleRevision {
                base: op.base_revision,
                floor: self.floor,
            });
        }

        let mut applied = if op.edit.is_empty() {
            Vec::new()
        } else {
            vec![op.edit.clone()]
        };
        let skip = (op.base_revision - self.floor) as usize;
        for committed in &self.history[skip..] {
            applied = transform::include_committed(&applied, op.author, committed);
        }

        self.check_bounds(&applied)?;
        for edit in applied.iter().rev() {
            if let Err(e) = edit.apply(&mut self.text) {
                return Err(SubmitError::Corrupted(e.to_string()));
            }
        }
        for edit in &applied {
            match edit {
                Edit::Insert { .. } => self.len_chars += edit.len(),
                Edit::Delete { len, .. } => self.len_chars -= len,
            }
        }

        self.revision += 1;
        let committed = CommittedOperation {
            revision: self.revision,
            author: op.author,
            base_revision: op.base_revision,
            applied,
        };
        self.history.push(committed.clone());
        Ok(committed)
    }

    /// Committed operations with revision greater than `revision`, in
    /// order — the catch-up backlog for a reconnecting client.
    pub fn operations_since(&self, revision: u64) -> Result<&[CommittedOperation], SubmitError> {
        if revision > self.revision {
            return Err(SubmitError::FutureRevision {
                base: revision,
                current: self.revision,
            });
        }
        if revision < self.floor {
            return Err(SubmitError::StaleRevision {
                base: revision,
                floor: self.floor,
            });
        }
        let skip = (revision - self.floor) as usize;
        Ok(&self.history[skip..])
    }

    /// Drop log entries at or below `revision`. Called once every
    /// subscriber has acknowledged that far; acknowledgements only bound
    /// retention, they never affect commits.
    pub fn prune_history(&mut self, revision: u64) {
        let target = revision.min(self.revision);
        if target <= self.floor {
            return;
        }
        let drop = (target - self.floor) as usize;
        self.history.drain(..drop);
        self.floor = target;
    }

    /// Replay a committed log against a snapshot text. Used by recovery
    /// and by the determinism tests.
    pub fn replay(initial: &str, ops: &[CommittedOperation]) -> Result<String, SubmitError> {
        let mut text = initial.to_string();
        for op in ops {
            op.apply(&mut text)
                .map_err(|e| SubmitError::Corrupted(format!("replay of revision {}: {e}", op.revision)))?;
        }
        Ok(text)
    }

    fn check_bounds(&self, applied: &[Edit]) -> Result<(), SubmitError> {
        for edit in applied {
            let ok = match edit {
                Edit::Insert { pos, .. } => *pos <= self.len_chars,
                Edit::Delete { pos, len } => pos + len <= self.len_chars,
            };
            if !ok {
                return Err(SubmitError::OutOfRange {
                    pos: edit.pos(),
                    len: edit.len(),
                    doc_len: self.len_chars,
                });
            }
        }
        Ok(())
    }
}
