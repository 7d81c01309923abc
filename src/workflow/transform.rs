//! Pure transforms applied on connections
//!
//! A transform reshapes upstream output values before they bind to a
//! downstream input slot. The set is closed so that slot compatibility can be
//! checked when the graph is built rather than when a tool is invoked.

use crate::error::NoMatchError;
use crate::workflow::types::{SlotKind, SlotValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// How a connection turns its source value(s) into the target value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Direct passthrough of a single source value
    #[default]
    Identity,
    /// Pick the first file of a list that satisfies the predicate
    SelectByPredicate { predicate: Predicate },
    /// Flatten one or more file (or file list) sources into a list, in
    /// declaration order
    PackList,
}

/// File matching rule for [`Transform::SelectByPredicate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    /// File name (last path component) starts with the value
    FileNamePrefix(String),
    /// File name equals the value
    FileName(String),
    /// Full path ends with the value
    Suffix(String),
    /// Full path contains the value
    Contains(String),
}

impl Predicate {
    /// Whether a candidate path satisfies the predicate
    pub fn matches(&self, path: &Path) -> bool {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let full = path.to_string_lossy();
        match self {
            Predicate::FileNamePrefix(prefix) => file_name.starts_with(prefix.as_str()),
            Predicate::FileName(name) => file_name == name.as_str(),
            Predicate::Suffix(suffix) => full.ends_with(suffix.as_str()),
            Predicate::Contains(needle) => full.contains(needle.as_str()),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::FileNamePrefix(v) => write!(f, "file name prefix '{}'", v),
            Predicate::FileName(v) => write!(f, "file name '{}'", v),
            Predicate::Suffix(v) => write!(f, "suffix '{}'", v),
            Predicate::Contains(v) => write!(f, "substring '{}'", v),
        }
    }
}

impl Transform {
    /// Selector for the left-hemisphere file of a FreeSurfer surface pair
    pub fn left_hemisphere() -> Self {
        Transform::select(Predicate::FileNamePrefix("lh.".to_string()))
    }

    /// Selector for the right-hemisphere file of a FreeSurfer surface pair
    pub fn right_hemisphere() -> Self {
        Transform::select(Predicate::FileNamePrefix("rh.".to_string()))
    }

    /// Select the first file matching `predicate`
    pub fn select(predicate: Predicate) -> Self {
        Transform::SelectByPredicate { predicate }
    }

    /// Short name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Identity => "identity",
            Transform::SelectByPredicate { .. } => "select_by_predicate",
            Transform::PackList => "pack_list",
        }
    }

    /// Human-readable source count this transform accepts
    pub fn arity(&self) -> &'static str {
        match self {
            Transform::Identity | Transform::SelectByPredicate { .. } => "exactly 1",
            Transform::PackList => "at least 1",
        }
    }

    /// Whether the transform takes this many sources
    pub fn accepts_arity(&self, sources: usize) -> bool {
        match self {
            Transform::Identity | Transform::SelectByPredicate { .. } => sources == 1,
            Transform::PackList => sources >= 1,
        }
    }

    /// Static type check: the kind produced from the given source kinds
    ///
    /// Arity is checked separately with [`Transform::accepts_arity`].
    pub fn output_kind(&self, sources: &[SlotKind]) -> Result<SlotKind, String> {
        match self {
            Transform::Identity => sources
                .first()
                .copied()
                .ok_or_else(|| "identity needs a source".to_string()),
            Transform::SelectByPredicate { .. } => match sources.first() {
                Some(SlotKind::FileList) => Ok(SlotKind::File),
                Some(other) => Err(format!("selection needs a file list, source is {}", other)),
                None => Err("selection needs a source".to_string()),
            },
            Transform::PackList => {
                if let Some(bad) = sources.iter().find(|k| **k == SlotKind::Scalar) {
                    return Err(format!("cannot pack a {} into a file list", bad));
                }
                Ok(SlotKind::FileList)
            }
        }
    }

    /// Apply the transform to resolved source values
    ///
    /// `node` and `slot` identify the destination and only feed the error.
    pub fn apply(
        &self,
        node: &str,
        slot: &str,
        values: Vec<SlotValue>,
    ) -> Result<SlotValue, NoMatchError> {
        match self {
            Transform::Identity => Ok(values.into_iter().next().unwrap_or_else(SlotValue::empty)),
            Transform::SelectByPredicate { predicate } => {
                let candidates: Vec<PathBuf> = values
                    .into_iter()
                    .flat_map(SlotValue::into_paths)
                    .collect();
                let mut matching = candidates.iter().filter(|p| predicate.matches(p));
                match matching.next() {
                    Some(found) => {
                        if matching.next().is_some() {
                            tracing::debug!(
                                "🔎 Several candidates match {} for '{}.{}', using {}",
                                predicate,
                                node,
                                slot,
                                found.display()
                            );
                        }
                        Ok(SlotValue::File(found.clone()))
                    }
                    None => Err(NoMatchError {
                        node: node.to_string(),
                        slot: slot.to_string(),
                        predicate: predicate.to_string(),
                        candidates: candidates
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect(),
                    }),
                }
            }
            Transform::PackList => Ok(SlotValue::Files(
                values.into_iter().flat_map(SlotValue::into_paths).collect(),
            )),
        }
    }
}
