//! Operational transform for text operations.
//!
//! `transform(incoming, applied)` rewrites `incoming` (authored against the
//! state *before* `applied`) so it can be applied *after* `applied`.
//! Positions are character offsets.
//!
//! | incoming \ applied | Insert                        | Delete                          |
//! |--------------------|-------------------------------|---------------------------------|
//! | Insert             | shift right if applied ≤ pos  | shift left / conflict if inside |
//! | Delete             | shift right / conflict if inside | shrink by overlap / conflict if consumed |

use thiserror::Error;

use crate::model::EditOp;

/// Why an op could not be rebased.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// The incoming insert lands inside a range deleted concurrently.
    #[error("insert target was deleted concurrently")]
    InsertIntoDeletedRange,
    /// The incoming delete's whole range was deleted concurrently.
    #[error("delete target was already deleted")]
    RangeAlreadyDeleted,
    /// A concurrent insert landed inside the range the incoming op deletes.
    #[error("concurrent insert lies inside the deleted range")]
    InsertInsideDeletedRange,
    /// A position or range end does not fit in `usize`.
    #[error("position overflows after rebasing")]
    PositionOverflow,
    /// Non-text op on the text path.
    #[error("{0} cannot be transformed as text")]
    Unsupported(&'static str),
}

fn end_of(pos: usize, len: usize) -> Result<usize, TransformError> {
    pos.checked_add(len).ok_or(TransformError::PositionOverflow)
}

/// Rebase `incoming` over one already-applied op.
pub fn transform(incoming: &EditOp, applied: &EditOp) -> Result<EditOp, TransformError> {
    match (incoming, applied) {
        (EditOp::Insert { pos, text }, EditOp::Insert { pos: a_pos, text: a_text }) => {
            // Equal positions: the already-applied insert stays first.
            let shift = if *a_pos <= *pos { a_text.chars().count() } else { 0 };
            Ok(EditOp::Insert {
                pos: end_of(*pos, shift)?,
                text: text.clone(),
            })
        }
        (EditOp::Insert { pos, text }, EditOp::Delete { pos: d_pos, len: d_len }) => {
            let d_end = end_of(*d_pos, *d_len)?;
            let new_pos = if *pos <= *d_pos {
                *pos
            } else if *pos >= d_end {
                pos - d_len
            } else {
                return Err(TransformError::InsertIntoDeletedRange);
            };
            Ok(EditOp::Insert {
                pos: new_pos,
                text: text.clone(),
            })
        }
        (EditOp::Delete { pos, len }, EditOp::Insert { pos: a_pos, text: a_text }) => {
            let end = end_of(*pos, *len)?;
            let inserted = a_text.chars().count();
            if *a_pos <= *pos {
                let pos = end_of(*pos, inserted)?;
                end_of(pos, *len)?;
                Ok(EditOp::Delete { pos, len: *len })
            } else if *a_pos >= end {
                Ok(incoming.clone())
            } else {
                Err(TransformError::InsertInsideDeletedRange)
            }
        }
        (EditOp::Delete { pos, len }, EditOp::Delete { pos: d_pos, len: d_len }) => {
            let end = end_of(*pos, *len)?;
            let d_end = end_of(*d_pos, *d_len)?;
            if d_end <= *pos {
                return Ok(EditOp::Delete {
                    pos: pos - d_len,
                    len: *len,
                });
            }
            if *d_pos >= end {
                return Ok(incoming.clone());
            }
            let overlap = end.min(d_end) - (*pos).max(*d_pos);
            if overlap >= *len {
                return Err(TransformError::RangeAlreadyDeleted);
            }
            Ok(EditOp::Delete {
                pos: (*pos).min(*d_pos),
                len: len - overlap,
            })
        }
        (EditOp::Insert { .. } | EditOp::Delete { .. }, other) => {
            Err(TransformError::Unsupported(other.kind()))
        }
        (other, _) => Err(TransformError::Unsupported(other.kind())),
    }
}

/// Rebase `incoming` sequentially over every op in `applied`, in order.
pub fn rebase<'a, I>(incoming: &EditOp, applied: I) -> Result<EditOp, TransformError>
where
    I: IntoIterator<Item = &'a EditOp>,
{
    applied
        .into_iter()
        .try_fold(incoming.clone(), |op, prior| transform(&op, prior))
}
