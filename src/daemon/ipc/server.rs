use std::collections::HashMap;

use anyhow::Result;
use futures::{
    stream::{self, BoxStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinSet,
};
use tokio_stream::{wrappers::ReceiverStream, StreamMap};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::daemon::{
    hub::{Hub, Subscription},
    storage::store::PersistenceService,
    timer::TimerApi,
};

use super::{
    protocol::{
        ClientFrame, Notification, Request, Response, ServerFrame, StoreRequest, StoreResponse,
        Topic, MAX_FRAME_LENGTH, UNKNOWN_REQUEST_ID,
    },
    transport::{Endpoint, Listener},
};

type Connection<S> = Framed<S, LinesCodec>;

pub struct IpcServer {
    listener: Listener,
    endpoint: Endpoint,
    hub: Hub,
}

impl IpcServer {
    pub fn bind(endpoint: Endpoint, hub: Hub) -> Result<Self> {
        let listener = Listener::bind(&endpoint)?;
        Ok(Self {
            listener,
            endpoint,
            hub,
        })
    }

    /// Accepts surfaces until shutdown. Connections still open at that point are dropped.
    pub async fn run(mut self) -> Result<()> {
        info!("Listening for surfaces on {}", self.endpoint);
        let shutdown = self.hub.shutdown.clone();
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        let hub = self.hub.clone();
                        clients.spawn(async move {
                            if let Err(e) = handle_client(stream, hub).await {
                                warn!("Surface connection failed {e:?}");
                            }
                        });
                    }
                    Err(e) => error!("Couldn't accept a surface {e:?}"),
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }

        debug!("Closing {} surface connections", clients.len());
        clients.shutdown().await;
        Ok(())
    }
}

/// Serves one surface: answers its requests in order and interleaves notifications for the
/// topics it subscribed to.
pub async fn handle_client<S>(stream: S, hub: Hub) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut subscriptions = HashMap::<Topic, Subscription>::new();
    let mut events = StreamMap::<Topic, EventStream>::new();

    loop {
        tokio::select! {
            line = connection.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("Surface sent a frame over {MAX_FRAME_LENGTH} bytes");
                        let body = Response::error("frame too large");
                        send(&mut connection, ServerFrame::Response { id: UNKNOWN_REQUEST_ID, body }).await?;
                        continue;
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let ClientFrame { id, request } = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Rejecting malformed frame {e}");
                        let body = Response::error(format!("malformed request: {e}"));
                        send(&mut connection, ServerFrame::Response { id: UNKNOWN_REQUEST_ID, body }).await?;
                        continue;
                    }
                };

                let shutdown = matches!(request, Request::Shutdown);
                let body = match request {
                    Request::Subscribe { topic } => {
                        let (subscription, stream) = subscribe(&hub, topic);
                        subscriptions.insert(topic, subscription);
                        events.insert(topic, stream);
                        Response::Ack
                    }
                    Request::Unsubscribe { topic } => {
                        subscriptions.remove(&topic);
                        events.remove(&topic);
                        Response::Ack
                    }
                    request => dispatch(&hub, request).await.unwrap_or_else(|e| {
                        debug!("Request {id} failed {e:?}");
                        Response::error(format!("{e:#}"))
                    }),
                };
                send(&mut connection, ServerFrame::Response { id, body }).await?;

                if shutdown {
                    info!("Shutdown requested by a surface");
                    hub.shutdown.cancel();
                }
            }
            Some((topic, event)) = events.next(), if !events.is_empty() => {
                let Some(event) = event else {
                    warn!("Surface stopped receiving {topic:?} notifications, disconnecting it");
                    break;
                };
                send(&mut connection, ServerFrame::Notification { event }).await?;
            }
        }
    }
    Ok(())
}

/// Notifications of one topic. Ends with `None` once the registry dropped the surface.
type EventStream = BoxStream<'static, Option<Notification>>;

fn subscribe(hub: &Hub, topic: Topic) -> (Subscription, EventStream) {
    match topic {
        Topic::Timer => {
            let (subscription, receiver) = hub.timer_states.subscribe();
            let stream = ReceiverStream::new(receiver)
                .map(|v| Some(Notification::TimerState(v)))
                .chain(stream::once(async { None }))
                .boxed();
            (subscription, stream)
        }
        Topic::Selection => {
            let (subscription, receiver) = hub.selection.subscribe();
            let stream = ReceiverStream::new(receiver)
                .map(|v| Some(Notification::Selection(v)))
                .chain(stream::once(async { None }))
                .boxed();
            (subscription, stream)
        }
        Topic::RemoteCommands => {
            let (subscription, receiver) = hub.remote_commands.subscribe();
            let stream = ReceiverStream::new(receiver)
                .map(|v| Some(Notification::RemoteCommand(v)))
                .chain(stream::once(async { None }))
                .boxed();
            (subscription, stream)
        }
    }
}

async fn send<S>(connection: &mut Connection<S>, frame: ServerFrame) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    connection.send(serde_json::to_string(&frame)?).await?;
    Ok(())
}

async fn dispatch(hub: &Hub, request: Request) -> Result<Response> {
    request.validate()?;
    let response = match request {
        Request::UpdateTimerState { command } => {
            Response::Command(hub.timer.update_state(command).await?)
        }
        Request::GetTimerState => Response::TimerState(hub.timer.get_state().await?),
        Request::ComputeUnsaved => Response::Unsaved(hub.timer.compute_unsaved().await?),
        Request::NotifySavedElapsed {
            session,
            lease,
            seconds,
        } => Response::TimerState(hub.timer.notify_saved_elapsed(session, lease, seconds).await?),
        Request::SendRemoteCommand { command } => Response::Delivered {
            surfaces: hub.send_remote_command(command),
        },
        Request::UpdateSelection { patch } => Response::Selection(hub.selection.update(patch).await),
        Request::GetSelection => Response::Selection(hub.selection.get().await),
        Request::Store(request) => Response::Store(dispatch_store(hub.store.as_ref(), request).await?),
        Request::Subscribe { .. } | Request::Unsubscribe { .. } | Request::Shutdown => Response::Ack,
    };
    Ok(response)
}

async fn dispatch_store(
    store: &dyn PersistenceService,
    request: StoreRequest,
) -> Result<StoreResponse> {
    let response = match request {
        StoreRequest::CreateRecord { record } => {
            StoreResponse::Record(store.create_record(record).await?)
        }
        StoreRequest::ListRecords { kind, parent_id } => {
            StoreResponse::Records(store.list_records(kind, parent_id).await?)
        }
        StoreRequest::GetRecord { kind, id } => {
            StoreResponse::MaybeRecord(store.get_record(kind, id).await?)
        }
        StoreRequest::UpdateRecord { kind, id, patch } => {
            StoreResponse::Record(store.update_record(kind, id, patch).await?)
        }
        StoreRequest::DeleteRecord { kind, id } => {
            store.delete_record(kind, id).await?;
            StoreResponse::Deleted
        }
        StoreRequest::CreateTimeEntry { entry } => {
            StoreResponse::TimeEntry(store.create_time_entry(entry).await?)
        }
        StoreRequest::GetTimeEntries { filter } => {
            StoreResponse::TimeEntries(store.get_time_entries(filter).await?)
        }
        StoreRequest::UpdateTimeEntry { id, patch } => {
            StoreResponse::TimeEntry(store.update_time_entry(id, patch).await?)
        }
        StoreRequest::DeleteTimeEntry { id } => {
            store.delete_time_entry(id).await?;
            StoreResponse::Deleted
        }
        StoreRequest::TotalDurationByTask { task_id } => StoreResponse::Duration {
            seconds: store.total_duration_by_task(task_id).await?,
        },
    };
    Ok(response)
}
