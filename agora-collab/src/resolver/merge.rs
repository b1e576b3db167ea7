//! Record-level resolution: last-write-wins for single-valued fields and
//! three-way merge for multi-field patches.

use std::collections::BTreeMap;

use super::Resolution;
use crate::model::{ChangeRecord, EditOp, Timestamp, Value};

/// Ordering key for a write: later timestamp wins, then the smaller user id.
fn wins(ts: Timestamp, author: &str, other_ts: Timestamp, other_author: &str) -> bool {
    ts > other_ts || (ts == other_ts && author < other_author)
}

/// Timestamp a prior change claims for `field`.
fn write_time(change: &ChangeRecord, field: &str) -> Option<Timestamp> {
    match &change.op {
        EditOp::SetField { field: f, timestamp, .. } if f == field => Some(*timestamp),
        EditOp::Patch { fields } if fields.contains_key(field) => Some(change.timestamp),
        _ => None,
    }
}

/// Last-write-wins for a `SetField` op against concurrent writes to the
/// same field.
pub fn last_write_wins(author: &str, incoming: &EditOp, changes: &[ChangeRecord]) -> Resolution {
    let EditOp::SetField { field, timestamp, .. } = incoming else {
        return three_way(incoming, changes);
    };

    let winner = changes.iter().rev().find(|change| {
        write_time(change, field)
            .is_some_and(|ts| !wins(*timestamp, author, ts, &change.author))
    });

    match winner {
        Some(change) => Resolution::Superseded {
            by: change.change_id,
        },
        None => Resolution::Apply(incoming.clone()),
    }
}

/// Value each field ended up with after `changes`, for the fields they touch.
fn merged_writes(changes: &[ChangeRecord]) -> BTreeMap<&str, Option<&Value>> {
    let mut writes = BTreeMap::new();
    for change in changes {
        match &change.op {
            EditOp::SetField { field, value, .. } => {
                writes.insert(field.as_str(), Some(value));
            }
            EditOp::Patch { fields } => {
                for (name, value) in fields {
                    writes.insert(name.as_str(), value.as_ref());
                }
            }
            EditOp::Insert { .. } | EditOp::Delete { .. } => {}
        }
    }
    writes
}

/// Three-way merge: fields untouched by the intervening changes are kept;
/// a field both sides wrote with different values is a conflict.
pub fn three_way(incoming: &EditOp, changes: &[ChangeRecord]) -> Resolution {
    let theirs = merged_writes(changes);

    let ours: Vec<(&str, Option<&Value>)> = match incoming {
        EditOp::SetField { field, value, .. } => vec![(field.as_str(), Some(value))],
        EditOp::Patch { fields } => fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
            .collect(),
        EditOp::Insert { .. } | EditOp::Delete { .. } => {
            return Resolution::Conflict {
                reason: format!("{} cannot be merged field-wise", incoming.kind()),
                competing: changes.iter().map(|c| c.change_id).collect(),
            };
        }
    };

    let clashing: Vec<&str> = ours
        .iter()
        .filter(|(name, value)| theirs.get(name).is_some_and(|theirs| theirs != value))
        .map(|(name, _)| *name)
        .collect();

    if clashing.is_empty() {
        return Resolution::Apply(incoming.clone());
    }

    let competing = changes
        .iter()
        .filter(|c| {
            let touched = c.op.touched_fields();
            clashing.iter().any(|f| touched.contains(f))
        })
        .map(|c| c.change_id)
        .collect();

    Resolution::Conflict {
        reason: format!("concurrent writes to field(s): {}", clashing.join(", ")),
        competing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn change(author: &str, timestamp: Timestamp, op: EditOp) -> ChangeRecord {
        ChangeRecord {
            change_id: Uuid::new_v4(),
            author: author.to_string(),
            document_id: "doc".to_string(),
            op,
            version: 1,
            timestamp,
        }
    }

    fn patch(pairs: &[(&str, Option<&str>)]) -> EditOp {
        EditOp::Patch {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(Value::from)))
                .collect(),
        }
    }

    #[test]
    fn test_lww_later_timestamp_wins() {
        let prior = change("bob", 100, EditOp::set_field("status", "approved", 100));
        let incoming = EditOp::set_field("status", "rejected", 200);
        assert_eq!(
            last_write_wins("alice", &incoming, &[prior]),
            Resolution::Apply(incoming.clone())
        );
    }

    #[test]
    fn test_lww_earlier_timestamp_is_superseded() {
        let prior = change("bob", 300, EditOp::set_field("status", "approved", 300));
        let incoming = EditOp::set_field("status", "rejected", 200);
        assert_eq!(
            last_write_wins("alice", &incoming, std::slice::from_ref(&prior)),
            Resolution::Superseded { by: prior.change_id }
        );
    }

    #[test]
    fn test_lww_tie_smaller_user_id_wins() {
        let prior = change("bob", 100, EditOp::set_field("status", "approved", 100));
        let incoming = EditOp::set_field("status", "rejected", 100);
        // "alice" < "bob": incoming wins the tie.
        assert!(matches!(
            last_write_wins("alice", &incoming, std::slice::from_ref(&prior)),
            Resolution::Apply(_)
        ));
        // "carol" > "bob": incoming loses the tie.
        assert!(matches!(
            last_write_wins("carol", &incoming, &[prior]),
            Resolution::Superseded { .. }
        ));
    }

    #[test]
    fn test_lww_ignores_other_fields() {
        let prior = change("bob", 900, EditOp::set_field("assignee", "bob", 900));
        let incoming = EditOp::set_field("status", "rejected", 100);
        assert!(matches!(
            last_write_wins("alice", &incoming, &[prior]),
            Resolution::Apply(_)
        ));
    }

    #[test]
    fn test_three_way_disjoint_fields_kept() {
        let prior = change("bob", 1, patch(&[("title", Some("New title"))]));
        let incoming = patch(&[("assignee", Some("alice"))]);
        assert_eq!(three_way(&incoming, &[prior]), Resolution::Apply(incoming.clone()));
    }

    #[test]
    fn test_three_way_same_value_is_not_a_conflict() {
        let prior = change("bob", 1, patch(&[("status", Some("done"))]));
        let incoming = patch(&[("status", Some("done")), ("note", Some("ok"))]);
        assert!(matches!(three_way(&incoming, &[prior]), Resolution::Apply(_)));
    }

    #[test]
    fn test_three_way_overlap_conflicts() {
        let unrelated = change("carol", 1, patch(&[("title", Some("x"))]));
        let prior = change("bob", 2, patch(&[("status", Some("done"))]));
        let incoming = patch(&[("status", None)]);
        match three_way(&incoming, &[unrelated, prior.clone()]) {
            Resolution::Conflict { reason, competing } => {
                assert!(reason.contains("status"));
                assert_eq!(competing, vec![prior.change_id]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
