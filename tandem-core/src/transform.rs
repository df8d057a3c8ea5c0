//! Reconciliation of concurrent edits.
//!
//! Two operations authored against the same revision are reconciled by
//! rewriting each to account for the other, so that applying them in
//! either order produces the same text. Every function here is pure and
//! total over well-formed spans; this module is the only place conflict
//! rules live.
//!
//! Rules, at character granularity:
//! - insert vs insert: the higher position shifts right; equal positions
//!   tie-break on author id, smaller id first, so both sides converge on
//!   the same order.
//! - insert vs delete: an insert at or before the deleted range shifts the
//!   delete; an insert interior to an already-applied delete lands at the
//!   collapsed range's start. A delete reconciled across an interior
//!   insert splits around it — inserted text is never swallowed.
//! - delete vs delete: overlapping ranges delete the overlap once; the
//!   later-reconciled delete shrinks by it.

use uuid::Uuid;

use crate::operation::{CommittedOperation, Edit, Operation};

/// Rewrite `a` to apply to a text where `b` — authored against the same
/// revision — has already been applied.
///
/// Returns the adjusted span set: one edit in the common case, two when a
/// delete splits around an interior insert, none when a delete was fully
/// covered by `b`. Two operations from the same author are never
/// concurrent; when an author's later edit is folded across its own
/// earlier commit, the committed edit counts as first.
pub fn include(a: &Edit, author_a: Uuid, b: &Edit, author_b: Uuid) -> Vec<Edit> {
    if a.is_empty() {
        return Vec::new();
    }
    if b.is_empty() {
        return vec![a.clone()];
    }
    match (a, b) {
        (Edit::Insert { pos: ap, text }, Edit::Insert { .. }) => {
            let b_first = b.pos() < *ap || (b.pos() == *ap && !(author_a < author_b));
            let pos = if b_first { ap + b.len() } else { *ap };
            vec![Edit::Insert {
                pos,
                text: text.clone(),
            }]
        }
        (Edit::Insert { pos: ap, text }, Edit::Delete { pos: bp, len: blen }) => {
            let pos = if *ap <= *bp {
                *ap
            } else if *ap >= bp + blen {
                ap - blen
            } else {
                // Interior of the removed range: keep the insert, landing
                // at the point the range collapsed to.
                *bp
            };
            vec![Edit::Insert {
                pos,
                text: text.clone(),
            }]
        }
        (Edit::Delete { pos: ap, len: alen }, Edit::Insert { pos: bp, .. }) => {
            let blen = b.len();
            if *bp <= *ap {
                vec![Edit::delete(ap + blen, *alen)]
            } else if *bp >= ap + alen {
                vec![a.clone()]
            } else {
                // The insert landed inside the range this delete targets.
                // Split around it so the inserted text survives.
                vec![
                    Edit::delete(*ap, bp - ap),
                    Edit::delete(bp + blen, ap + alen - bp),
                ]
            }
        }
        (Edit::Delete { pos: ap, len: alen }, Edit::Delete { pos: bp, len: blen }) => {
            let a_end = ap + alen;
            let b_end = bp + blen;
            let overlap = a_end.min(b_end).saturating_sub(*ap.max(bp));
            let len = alen - overlap;
            if len == 0 {
                return Vec::new();
            }
            // Shift left by however much of b's range sat before a's start.
            let pos = if bp < ap { ap - (b_end.min(*ap) - bp) } else { *ap };
            vec![Edit::delete(pos, len)]
        }
    }
}

/// Rewrite span set `a` to apply after span set `b`, both expressed
/// against the same text.
///
/// Sets follow the committed-operation shape: a single insert, or
/// disjoint delete spans in ascending order. Folding over `b`
/// back-to-front keeps every pairwise step in a single coordinate space.
pub fn include_set(a: &[Edit], author_a: Uuid, b: &[Edit], author_b: Uuid) -> Vec<Edit> {
    let mut current = a.to_vec();
    for applied in b.iter().rev() {
        let mut next = Vec::with_capacity(current.len());
        for edit in &current {
            next.extend(include(edit, author_a, applied, author_b));
        }
        current = next;
    }
    current
}

/// Rewrite an in-flight span set across one committed operation.
pub fn include_committed(
    edits: &[Edit],
    author: Uuid,
    committed: &CommittedOperation,
) -> Vec<Edit> {
    include_set(edits, author, &committed.applied, committed.author)
}

/// Symmetric reconciliation of two operations authored against the same
/// revision: `(a', b')` such that applying `a` then `b'` equals applying
/// `b` then `a'`.
pub fn transform(a: &Operation, b: &Operation) -> (Vec<Edit>, Vec<Edit>) {
    (
        include(&a.edit, a.author, &b.edit, b.author),
        include(&b.edit, b.author, &a.edit, a.author),
    )
}
