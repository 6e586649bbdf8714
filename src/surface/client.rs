use std::{collections::HashMap, fmt::Debug};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use crate::daemon::{
    ipc::{
        protocol::{
            ClientFrame, Notification, Request, Response, ServerFrame, StoreRequest,
            StoreResponse, Topic, MAX_FRAME_LENGTH,
        },
        transport::{self, Endpoint},
    },
    selection::{SelectionPatch, SelectionState},
    storage::{
        entities::{
            NewRecord, NewTimeEntry, Record, RecordKind, RecordPatch, TimeEntry, TimeEntryFilter,
            TimeEntryPatch,
        },
        store::{CatalogStore, TimeEntryStore},
    },
    timer::{
        command::{CommandOutcome, RemoteCommand, TimerCommand},
        state::{TimerState, Unsaved},
        TimerApi,
    },
};

const REQUEST_BUFFER: usize = 16;

pub type Notifications = mpsc::UnboundedReceiver<Notification>;

struct PendingRequest {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
}

/// Connection of a surface to the daemon. Requests may be issued concurrently from clones, the
/// responses are matched back by id. Notifications arrive on the receiver returned by
/// [SurfaceClient::connect].
#[derive(Clone)]
pub struct SurfaceClient {
    requests: mpsc::Sender<PendingRequest>,
}

impl SurfaceClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<(Self, Notifications)> {
        let stream = transport::connect(endpoint)
            .await
            .with_context(|| format!("Couldn't reach the daemon at {endpoint}, is it running?"))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream<S>(stream: S) -> (Self, Notifications)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, pending) = mpsc::channel(REQUEST_BUFFER);
        let (notifications, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drive_connection(stream, pending, notifications));
        (Self { requests }, receiver)
    }

    /// Sends a request and waits for its answer. Errors reported by the daemon become errors here.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(PendingRequest { request, reply })
            .await
            .map_err(|_| anyhow!("Connection to the daemon is closed"))?;
        let response = response
            .await
            .map_err(|_| anyhow!("Daemon closed the connection before answering"))??;
        match response {
            Response::Error { message } => bail!("Daemon refused the request: {message}"),
            response => Ok(response),
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> Result<()> {
        self.acknowledged(Request::Subscribe { topic }).await
    }

    pub async fn unsubscribe(&self, topic: Topic) -> Result<()> {
        self.acknowledged(Request::Unsubscribe { topic }).await
    }

    pub async fn shutdown_daemon(&self) -> Result<()> {
        self.acknowledged(Request::Shutdown).await
    }

    pub async fn get_selection(&self) -> Result<SelectionState> {
        match self.request(Request::GetSelection).await? {
            Response::Selection(selection) => Ok(selection),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_selection(&self, patch: SelectionPatch) -> Result<SelectionState> {
        match self.request(Request::UpdateSelection { patch }).await? {
            Response::Selection(selection) => Ok(selection),
            other => Err(unexpected(other)),
        }
    }

    /// Returns how many surfaces the command reached.
    pub async fn send_remote_command(&self, command: RemoteCommand) -> Result<usize> {
        match self.request(Request::SendRemoteCommand { command }).await? {
            Response::Delivered { surfaces } => Ok(surfaces),
            other => Err(unexpected(other)),
        }
    }

    async fn acknowledged(&self, request: Request) -> Result<()> {
        match self.request(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn store(&self, request: StoreRequest) -> Result<StoreResponse> {
        match self.request(Request::Store(request)).await? {
            Response::Store(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: impl Debug) -> anyhow::Error {
    anyhow!("Unexpected answer from the daemon {response:?}")
}

async fn drive_connection<S>(
    stream: S,
    mut requests: mpsc::Receiver<PendingRequest>,
    notifications: mpsc::UnboundedSender<Notification>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut pending = HashMap::<u64, oneshot::Sender<Result<Response>>>::new();
    let mut next_id = 1;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(PendingRequest { request, reply }) = request else {
                    break;
                };
                let id = next_id;
                next_id += 1;

                let line = match serde_json::to_string(&ClientFrame { id, request }) {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        continue;
                    }
                };
                if let Err(e) = connection.send(line).await {
                    let _ = reply.send(Err(e.into()));
                    break;
                }
                pending.insert(id, reply);
            }
            line = connection.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!("Lost the connection to the daemon {e:?}");
                        break;
                    }
                    None => {
                        debug!("Daemon closed the connection");
                        break;
                    }
                };
                match serde_json::from_str::<ServerFrame>(&line) {
                    Ok(ServerFrame::Response { id, body }) => match pending.remove(&id) {
                        Some(reply) => {
                            let _ = reply.send(Ok(body));
                        }
                        None => warn!("Daemon answered unknown request {id} with {body:?}"),
                    },
                    Ok(ServerFrame::Notification { event }) => {
                        let _ = notifications.send(event);
                    }
                    Err(e) => warn!("Ignoring malformed frame from the daemon {e}"),
                }
            }
        }
    }
}

#[async_trait]
impl TimerApi for SurfaceClient {
    async fn update_state(&self, command: TimerCommand) -> Result<CommandOutcome> {
        match self.request(Request::UpdateTimerState { command }).await? {
            Response::Command(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn get_state(&self) -> Result<TimerState> {
        match self.request(Request::GetTimerState).await? {
            Response::TimerState(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    async fn compute_unsaved(&self) -> Result<Unsaved> {
        match self.request(Request::ComputeUnsaved).await? {
            Response::Unsaved(unsaved) => Ok(unsaved),
            other => Err(unexpected(other)),
        }
    }

    async fn notify_saved_elapsed(
        &self,
        session: u64,
        lease: Option<u64>,
        seconds: u64,
    ) -> Result<TimerState> {
        match self
            .request(Request::NotifySavedElapsed {
                session,
                lease,
                seconds,
            })
            .await?
        {
            Response::TimerState(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl CatalogStore for SurfaceClient {
    async fn create_record(&self, record: NewRecord) -> Result<Record> {
        match self.store(StoreRequest::CreateRecord { record }).await? {
            StoreResponse::Record(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn list_records(&self, kind: RecordKind, parent_id: Option<i64>) -> Result<Vec<Record>> {
        match self
            .store(StoreRequest::ListRecords { kind, parent_id })
            .await?
        {
            StoreResponse::Records(records) => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    async fn get_record(&self, kind: RecordKind, id: i64) -> Result<Option<Record>> {
        match self.store(StoreRequest::GetRecord { kind, id }).await? {
            StoreResponse::MaybeRecord(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn update_record(
        &self,
        kind: RecordKind,
        id: i64,
        patch: RecordPatch,
    ) -> Result<Record> {
        match self
            .store(StoreRequest::UpdateRecord { kind, id, patch })
            .await?
        {
            StoreResponse::Record(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_record(&self, kind: RecordKind, id: i64) -> Result<()> {
        match self.store(StoreRequest::DeleteRecord { kind, id }).await? {
            StoreResponse::Deleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl TimeEntryStore for SurfaceClient {
    async fn create_time_entry(&self, entry: NewTimeEntry) -> Result<TimeEntry> {
        match self.store(StoreRequest::CreateTimeEntry { entry }).await? {
            StoreResponse::TimeEntry(entry) => Ok(entry),
            other => Err(unexpected(other)),
        }
    }

    async fn get_time_entries(&self, filter: TimeEntryFilter) -> Result<Vec<TimeEntry>> {
        match self.store(StoreRequest::GetTimeEntries { filter }).await? {
            StoreResponse::TimeEntries(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    async fn update_time_entry(&self, id: i64, patch: TimeEntryPatch) -> Result<TimeEntry> {
        match self.store(StoreRequest::UpdateTimeEntry { id, patch }).await? {
            StoreResponse::TimeEntry(entry) => Ok(entry),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_time_entry(&self, id: i64) -> Result<()> {
        match self.store(StoreRequest::DeleteTimeEntry { id }).await? {
            StoreResponse::Deleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn total_duration_by_task(&self, task_id: i64) -> Result<u64> {
        match self
            .store(StoreRequest::TotalDurationByTask { task_id })
            .await?
        {
            StoreResponse::Duration { seconds } => Ok(seconds),
            other => Err(unexpected(other)),
        }
    }
}
