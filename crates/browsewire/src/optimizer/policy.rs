//! Snapshot policy: which calls in a sequence ask the server for a page snapshot.
//!
//! Snapshots are the bulk of a response's size. Suppressing them on
//! intermediate steps keeps responses small while the final step still
//! reports the resulting page state.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tool::ToolKind;

/// Argument key that tells the server to omit the snapshot from its response.
pub const SUPPRESS_SNAPSHOT_KEY: &str = "includeSnapshot";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Every call returns a snapshot.
    Always,
    /// No call returns a snapshot.
    Never,
    /// Only the last call of a sequence returns a snapshot.
    FinalOnly,
    /// The last call, plus diagnostic and state-changing calls.
    #[default]
    Smart,
}

impl SnapshotPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::FinalOnly => "final_only",
            Self::Smart => "smart",
        }
    }

    /// Whether call `index` of `total` (zero-based) should include a snapshot.
    ///
    /// A single call is its own final call.
    pub fn include_snapshot(&self, kind: ToolKind, index: usize, total: usize) -> bool {
        let is_last = index + 1 >= total;
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::FinalOnly => is_last,
            Self::Smart => {
                is_last || matches!(kind, ToolKind::Diagnostic | ToolKind::StateChange)
            }
        }
    }
}

impl FromStr for SnapshotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "final_only" | "final-only" | "finalonly" => Ok(Self::FinalOnly),
            "smart" => Ok(Self::Smart),
            other => Err(format!(
                "unknown snapshot policy '{other}' (expected always, never, final_only or smart)"
            )),
        }
    }
}

impl std::fmt::Display for SnapshotPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attach the suppression marker to `arguments`.
///
/// Null becomes an object holding just the marker. Returns false, leaving
/// `arguments` untouched, when they are some other non-object value.
pub fn suppress_snapshot(arguments: &mut Value) -> bool {
    if arguments.is_null() {
        *arguments = Value::Object(Map::new());
    }
    match arguments.as_object_mut() {
        Some(map) => {
            map.insert(SUPPRESS_SNAPSHOT_KEY.to_string(), Value::Bool(false));
            true
        }
        None => false,
    }
}
