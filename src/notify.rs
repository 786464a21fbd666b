//! Fire-and-forget change notifications toward a frontend or host shell.
//! A failed notification is logged and forgotten; it never rolls back the
//! persisted write it announces.

use log::debug;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Action,
    Event,
    Activity,
    Knowledge,
    Todo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOp {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    pub entity: EntityKind,
    pub op: ChangeOp,
    pub id: String,
}

impl RecordChange {
    pub fn created(entity: EntityKind, id: impl Into<String>) -> Self {
        Self {
            entity,
            op: ChangeOp::Created,
            id: id.into(),
        }
    }
}

pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, change: RecordChange);
}

/// Default sink when no frontend is attached.
pub struct LogNotifier;

impl ChangeNotifier for LogNotifier {
    fn notify(&self, change: RecordChange) {
        debug!("record change: {:?} {:?} {}", change.op, change.entity, change.id);
    }
}
