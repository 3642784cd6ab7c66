//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Semantic change records.
//!
//! Module-change callbacks receive the effects of a configuration edit as a
//! list of [`Change`] values decoded from the engine's raw diff records.
//! [`update_config_mirror`] replays such a list into an owned [`DataTree`],
//! which lets a subscriber maintain a full copy of the configuration without
//! asking the engine on every event.

use crate::data::DataTree;
use crate::error::Result;
use crate::value::DataValue;

/// Raw diff operation reported by the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeOperation {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// One raw diff record produced by the engine for a single edit effect.
///
/// Field meaning varies with the operation, following the engine contract:
/// for `Created` and `Moved` on user-ordered (leaf-)lists either
/// `prev_value` (leaf-lists) or `prev_list` (lists) designates the preceding
/// instance, with an empty string when the instance became first. For
/// `Modified`, `prev_value` holds the previous leaf value and `prev_default`
/// tells whether it was a default.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffRecord {
    pub operation: ChangeOperation,
    pub xpath: String,
    pub value: Option<DataValue>,
    pub prev_value: Option<String>,
    pub prev_list: Option<String>,
    pub prev_default: bool,
}

/// A semantic edit record passed to module-change callbacks.
///
/// The `after` anchor of `Created` and `Moved` names the sibling instance
/// that precedes the node once the operation completes: `Some("")` means the
/// node became first, `None` means the node is not user-ordered.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Created {
        xpath: String,
        value: Option<DataValue>,
        after: Option<String>,
    },
    Modified {
        xpath: String,
        value: Option<DataValue>,
        prev_value: Option<String>,
        prev_default: bool,
    },
    Deleted {
        xpath: String,
    },
    Moved {
        xpath: String,
        after: Option<String>,
    },
}

impl Change {
    /// Path of the affected node.
    pub fn xpath(&self) -> &str {
        match self {
            Change::Created { xpath, .. }
            | Change::Modified { xpath, .. }
            | Change::Deleted { xpath }
            | Change::Moved { xpath, .. } => xpath,
        }
    }

    /// Decode one raw diff record.
    pub fn from_record(record: DiffRecord) -> Change {
        match record.operation {
            ChangeOperation::Created => Change::Created {
                xpath: record.xpath,
                value: record.value,
                after: record.prev_list.or(record.prev_value),
            },
            ChangeOperation::Modified => Change::Modified {
                xpath: record.xpath,
                value: record.value,
                prev_value: record.prev_value,
                prev_default: record.prev_default,
            },
            ChangeOperation::Deleted => Change::Deleted {
                xpath: record.xpath,
            },
            ChangeOperation::Moved => Change::Moved {
                xpath: record.xpath,
                after: record.prev_list.or(record.prev_value),
            },
        }
    }

    /// Decode a batch of raw diff records in delivery order.
    pub fn decode(records: Vec<DiffRecord>) -> Vec<Change> {
        records.into_iter().map(Change::from_record).collect()
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn fmt_value(value: &Option<DataValue>) -> String {
            match value {
                Some(value) => value.to_canonical(),
                None => "(none)".to_owned(),
            }
        }
        match self {
            Change::Created {
                xpath,
                value,
                after,
            } => match after.as_deref() {
                Some("") => {
                    write!(f, "{}: {}: FIRST", xpath, fmt_value(value))
                }
                Some(anchor) => write!(
                    f,
                    "{}: {}: AFTER {}",
                    xpath,
                    fmt_value(value),
                    anchor
                ),
                None => write!(f, "{}: {}", xpath, fmt_value(value)),
            },
            Change::Modified {
                xpath,
                value,
                prev_value,
                ..
            } => write!(
                f,
                "{}: {} -> {}",
                xpath,
                prev_value.as_deref().unwrap_or("(none)"),
                fmt_value(value)
            ),
            Change::Deleted { xpath } => write!(f, "{}: DELETED", xpath),
            Change::Moved { xpath, after } => match after.as_deref() {
                Some("") | None => write!(f, "{}: FIRST", xpath),
                Some(anchor) => write!(f, "{}: AFTER {}", xpath, anchor),
            },
        }
    }
}

/// Replay a list of changes into a configuration mirror.
///
/// Intended for module-change callbacks that keep a full view of the
/// configuration instead of fetching it from the engine on every event.
pub fn update_config_mirror(
    mirror: &mut DataTree,
    changes: &[Change],
) -> Result<()> {
    for change in changes {
        match change {
            Change::Created {
                xpath,
                value,
                after,
            } => mirror.set_ordered(xpath, value.clone(), after.as_deref())?,
            Change::Modified { xpath, value, .. } => {
                mirror.set(xpath, value.clone())?
            }
            Change::Deleted { xpath } => mirror.delete(xpath)?,
            Change::Moved { xpath, after } => {
                mirror.move_item(xpath, after.as_deref())?
            }
        }
    }
    Ok(())
}
