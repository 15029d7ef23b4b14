//! Push-channel event types.
//!
//! Change events describe a single row insert, update, or delete on a
//! logical entity. Keep-alives carry no data and only refresh the
//! connection heartbeat.

use serde::{Deserialize, Serialize};

use crate::row::{Row, RowId};

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// A single row change on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Logical entity the row belongs to (e.g. `appointments`).
    pub entity: String,
    /// What happened to the row.
    pub change_kind: ChangeKind,
    /// Identifier of the changed row.
    pub row_id: RowId,
    /// Row image before the change (absent for inserts).
    #[serde(default)]
    pub before: Option<Row>,
    /// Row image after the change (absent for deletes).
    #[serde(default)]
    pub after: Option<Row>,
    /// Per-entity sequence number, contiguous on the server.
    pub sequence: u64,
}

impl ChangeEvent {
    pub fn inserted(entity: impl Into<String>, row_id: RowId, row: Row, sequence: u64) -> Self {
        Self {
            entity: entity.into(),
            change_kind: ChangeKind::Inserted,
            row_id,
            before: None,
            after: Some(row),
            sequence,
        }
    }

    pub fn updated(
        entity: impl Into<String>,
        row_id: RowId,
        before: Option<Row>,
        after: Row,
        sequence: u64,
    ) -> Self {
        Self {
            entity: entity.into(),
            change_kind: ChangeKind::Updated,
            row_id,
            before,
            after: Some(after),
            sequence,
        }
    }

    pub fn deleted(
        entity: impl Into<String>,
        row_id: RowId,
        before: Option<Row>,
        sequence: u64,
    ) -> Self {
        Self {
            entity: entity.into(),
            change_kind: ChangeKind::Deleted,
            row_id,
            before,
            after: None,
            sequence,
        }
    }

    /// The most recent row image carried by the event.
    pub fn latest_image(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// A message received on a push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushMessage {
    /// A row change notification.
    Change(ChangeEvent),
    /// Keep-alive with no payload.
    KeepAlive,
}

impl PushMessage {
    /// Get the message type as a string for logging.
    pub fn message_type(&self) -> &'static str {
        match self {
            PushMessage::Change(_) => "change",
            PushMessage::KeepAlive => "keep_alive",
        }
    }
}
