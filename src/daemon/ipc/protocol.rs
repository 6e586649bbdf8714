//! Wire contract between the daemon and its surfaces. One JSON document per line in both
//! directions. Malformed documents are rejected at this boundary and never reach the engine.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::daemon::{
    selection::{SelectionPatch, SelectionState},
    storage::entities::{
        NewRecord, NewTimeEntry, Record, RecordKind, RecordPatch, TimeEntry, TimeEntryFilter,
        TimeEntryPatch,
    },
    timer::{
        command::{CommandOutcome, RemoteCommand, TimerCommand},
        state::{TimerState, Unsaved},
    },
};

pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Id used for responses to frames that couldn't be parsed far enough to read theirs.
pub const UNKNOWN_REQUEST_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Response { id: u64, body: Response },
    Notification { event: Notification },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Timer,
    Selection,
    RemoteCommands,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Request {
    UpdateTimerState { command: TimerCommand },
    GetTimerState,
    ComputeUnsaved,
    NotifySavedElapsed {
        session: u64,
        #[serde(default)]
        lease: Option<u64>,
        seconds: u64,
    },
    SendRemoteCommand { command: RemoteCommand },
    UpdateSelection { patch: SelectionPatch },
    GetSelection,
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    Store(StoreRequest),
    Shutdown,
}

impl Request {
    pub fn validate(&self) -> Result<()> {
        match self {
            Request::UpdateTimerState { command } => command.validate(),
            Request::UpdateSelection { patch } => patch.validate(),
            Request::Store(request) => request.validate(),
            _ => Ok(()),
        }
    }
}

/// Persistence operations surfaces run through the daemon, so only one process ever writes the
/// record files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StoreRequest {
    CreateRecord {
        record: NewRecord,
    },
    ListRecords {
        kind: RecordKind,
        #[serde(default)]
        parent_id: Option<i64>,
    },
    GetRecord {
        kind: RecordKind,
        id: i64,
    },
    UpdateRecord {
        kind: RecordKind,
        id: i64,
        patch: RecordPatch,
    },
    DeleteRecord {
        kind: RecordKind,
        id: i64,
    },
    CreateTimeEntry {
        entry: NewTimeEntry,
    },
    GetTimeEntries {
        #[serde(default)]
        filter: TimeEntryFilter,
    },
    UpdateTimeEntry {
        id: i64,
        patch: TimeEntryPatch,
    },
    DeleteTimeEntry {
        id: i64,
    },
    TotalDurationByTask {
        task_id: i64,
    },
}

impl StoreRequest {
    fn validate(&self) -> Result<()> {
        let ids = match self {
            StoreRequest::CreateRecord { record } => match record {
                NewRecord::Organization { .. } => vec![],
                NewRecord::Project {
                    organization_id, ..
                } => vec![*organization_id],
                NewRecord::Task { project_id, .. } => vec![*project_id],
            },
            StoreRequest::ListRecords { parent_id, .. } => parent_id.iter().copied().collect(),
            StoreRequest::GetRecord { id, .. }
            | StoreRequest::UpdateRecord { id, .. }
            | StoreRequest::DeleteRecord { id, .. }
            | StoreRequest::UpdateTimeEntry { id, .. }
            | StoreRequest::DeleteTimeEntry { id } => vec![*id],
            StoreRequest::CreateTimeEntry { entry } => vec![entry.task_id],
            StoreRequest::GetTimeEntries { filter } => [
                filter.organization_id,
                filter.project_id,
                filter.task_id,
            ]
            .into_iter()
            .flatten()
            .collect(),
            StoreRequest::TotalDurationByTask { task_id } => vec![*task_id],
        };
        if let Some(id) = ids.into_iter().find(|v| *v <= 0) {
            bail!("id {id} is not positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Command(CommandOutcome),
    TimerState(TimerState),
    Unsaved(Unsaved),
    Delivered { surfaces: usize },
    Selection(SelectionState),
    Store(StoreResponse),
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StoreResponse {
    Record(Record),
    Records(Vec<Record>),
    MaybeRecord(Option<Record>),
    TimeEntry(TimeEntry),
    TimeEntries(Vec<TimeEntry>),
    Duration { seconds: u64 },
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    TimerState(TimerState),
    Selection(SelectionState),
    RemoteCommand(RemoteCommand),
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{ClientFrame, Request, StoreRequest, Topic};

    #[test]
    fn test_request_shapes() -> Result<()> {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"id":4,"request":{"type":"get_timer_state"}}"#)?;
        assert_eq!(frame.request, Request::GetTimerState);

        let frame: ClientFrame = serde_json::from_str(
            r#"{"id":5,"request":{"type":"subscribe","payload":{"topic":"remote_commands"}}}"#,
        )?;
        assert_eq!(
            frame.request,
            Request::Subscribe {
                topic: Topic::RemoteCommands
            }
        );

        let frame: ClientFrame = serde_json::from_str(
            r#"{"id":6,"request":{"type":"update_selection","payload":{"patch":{"projectId":null}}}}"#,
        )?;
        assert!(matches!(frame.request, Request::UpdateSelection { .. }));
        Ok(())
    }

    #[test]
    fn test_invalid_requests_are_rejected() -> Result<()> {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"id":1,"request":{"type":"fly"}}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(
            r#"{"id":1,"request":{"type":"notify_saved_elapsed","payload":{"session":1}}}"#
        )
        .is_err());

        let request = Request::Store(StoreRequest::DeleteRecord {
            kind: crate::daemon::storage::entities::RecordKind::Task,
            id: -2,
        });
        assert!(request.validate().is_err());

        let frame: ClientFrame = serde_json::from_str(
            r#"{"id":2,"request":{"type":"update_timer_state","payload":{"command":{"command":"start","task":{"id":0,"name":"x","project_id":1,"organization_id":1}}}}}"#,
        )?;
        assert!(frame.request.validate().is_err());
        Ok(())
    }
}
