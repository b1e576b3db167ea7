//! Conflict resolution for concurrent edits.
//!
//! ```text
//! incoming op (author, base_version)
//!       │
//!       ▼
//! changes_since_base ── empty? ──► Apply(op)
//!       │
//!       ▼  strategy (per content type)
//! ┌────────────────────┬──────────────────────┬──────────────────┬─────────┐
//! │ OperationalTransform│ LastWriteWins        │ ThreeWayMerge    │ Manual  │
//! │ rebase over log     │ (timestamp, user id) │ disjoint fields  │ always  │
//! └────────┬───────────┴──────────┬───────────┴────────┬─────────┴────┬────┘
//!          ▼                      ▼                    ▼              ▼
//!     Apply | Conflict     Apply | Superseded    Apply | Conflict   Conflict
//! ```
//!
//! Text ops always go through the transform path and record ops through
//! LWW or merge, so a strategy that does not fit the op kind falls back to
//! the one that does. `Manual` overrides everything once there are
//! intervening changes.

pub mod merge;
pub mod ot;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{ChangeId, ChangeRecord, DocumentContent, EditOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    OperationalTransform,
    LastWriteWins,
    ThreeWayMerge,
    Manual,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::OperationalTransform => "operational_transform",
            Strategy::LastWriteWins => "last_write_wins",
            Strategy::ThreeWayMerge => "three_way_merge",
            Strategy::Manual => "manual",
        }
    }
}

/// Outcome of resolving one incoming op.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Safe to apply to the current state.
    Apply(EditOp),
    /// A later write to the same field already won; nothing to apply.
    Superseded { by: ChangeId },
    /// Could not merge automatically.
    Conflict {
        reason: String,
        competing: Vec<ChangeId>,
    },
}

/// Default content-type → strategy table.
pub fn default_strategies() -> HashMap<String, Strategy> {
    HashMap::from([
        ("text".to_string(), Strategy::OperationalTransform),
        ("field".to_string(), Strategy::LastWriteWins),
        ("record".to_string(), Strategy::ThreeWayMerge),
        ("decision".to_string(), Strategy::Manual),
    ])
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategies: HashMap<String, Strategy>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(default_strategies())
    }
}

impl ConflictResolver {
    pub fn new(strategies: HashMap<String, Strategy>) -> Self {
        Self { strategies }
    }

    /// Strategy for a resource's content type, falling back on the content
    /// kind for unmapped types.
    pub fn strategy_for(&self, content_type: &str, content: &DocumentContent) -> Strategy {
        match self.strategies.get(content_type) {
            Some(strategy) => *strategy,
            None => match content {
                DocumentContent::Text(_) => Strategy::OperationalTransform,
                DocumentContent::Record(_) => Strategy::ThreeWayMerge,
            },
        }
    }

    /// Produce an op that is safe to apply after `changes_since_base`, which
    /// must be every change with a version greater than the op's base
    /// version, in version order.
    pub fn resolve(
        &self,
        strategy: Strategy,
        author: &str,
        incoming: &EditOp,
        changes_since_base: &[ChangeRecord],
    ) -> Resolution {
        if changes_since_base.is_empty() {
            return Resolution::Apply(incoming.clone());
        }

        if strategy == Strategy::Manual {
            return Resolution::Conflict {
                reason: "manual resolution required for concurrent edit".to_string(),
                competing: changes_since_base.iter().map(|c| c.change_id).collect(),
            };
        }

        match incoming {
            EditOp::Insert { .. } | EditOp::Delete { .. } => {
                match ot::rebase(incoming, changes_since_base.iter().map(|c| &c.op)) {
                    Ok(op) => Resolution::Apply(op),
                    Err(e) => Resolution::Conflict {
                        reason: e.to_string(),
                        competing: changes_since_base.iter().map(|c| c.change_id).collect(),
                    },
                }
            }
            EditOp::SetField { .. } if strategy == Strategy::LastWriteWins => {
                merge::last_write_wins(author, incoming, changes_since_base)
            }
            EditOp::SetField { .. } | EditOp::Patch { .. } => {
                merge::three_way(incoming, changes_since_base)
            }
        }
    }
}
