use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kinds of synchronized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Entry,
    Settings,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Entry, EntityType::Settings];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Settings => "settings",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// A synchronized record. Only `id` and `updated_at` are interpreted;
/// `data` is replaced whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Epoch milliseconds of the last write
    pub updated_at: i64,
    pub data: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, updated_at: i64, data: Value) -> Self {
        Self {
            id: id.into(),
            updated_at,
            data,
        }
    }
}

/// Latest intended state for one entity, awaiting push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub entity_type: EntityType,
    pub action: ChangeAction,
    pub entity_id: String,
    pub queued_at: i64,
}

impl PendingChange {
    #[must_use]
    pub fn is_for(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
    Offline,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_sync_at: Option<i64>,
    pub status: SyncStatus,
}

/// Outcome of a pull, push or full sync. Partial progress is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote records examined
    pub pulled: usize,
    /// Remote versions written locally
    pub adopted: usize,
    /// Remote versions discarded in favor of the local one
    pub kept_local: usize,
    /// Remote and local already identical
    pub unchanged: usize,
    /// Pending changes accepted by the remote
    pub pushed: usize,
    /// Pending changes whose local record no longer exists
    pub dropped: usize,
    pub failed: usize,
    pub first_error: Option<String>,
}

impl SyncReport {
    pub(crate) fn fail(&mut self, error: impl fmt::Display) {
        self.failed += 1;
        if self.first_error.is_none() {
            self.first_error = Some(error.to_string());
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let change = PendingChange {
            entity_type: EntityType::Settings,
            action: ChangeAction::Delete,
            entity_id: "prefs".into(),
            queued_at: 5,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["entity_type"], "settings");
        assert_eq!(json["action"], "delete");
    }

    #[test]
    fn test_report_keeps_first_error() {
        let mut report = SyncReport::default();
        report.fail("first");
        report.fail("second");
        assert_eq!(report.failed, 2);
        assert_eq!(report.first_error.as_deref(), Some("first"));
        assert!(!report.is_clean());
    }
}
