use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    daemon::{
        checkpoint::{CheckpointWriter, Checkpointer},
        hub::SurfaceRegistry,
        storage::{entities::NewTimeEntry, store::TimeEntryStore},
    },
    utils::clock::Clock,
};

use super::{
    command::{CommandOutcome, TimerCommand},
    engine::TimerEngine,
    state::{TimerCheckpoint, TimerState, Unsaved},
    TimerApi,
};

const REQUEST_BUFFER: usize = 32;

enum EngineRequest {
    Update {
        command: TimerCommand,
        reply: oneshot::Sender<CommandOutcome>,
    },
    GetState {
        reply: oneshot::Sender<TimerState>,
    },
    ComputeUnsaved {
        reply: oneshot::Sender<Unsaved>,
    },
    CommitSaved {
        session: u64,
        lease: Option<u64>,
        seconds: u64,
        reply: oneshot::Sender<TimerState>,
    },
}

/// Cheap handle to the running [TimerService].
#[derive(Clone)]
pub struct TimerHandle {
    sender: mpsc::Sender<EngineRequest>,
}

impl TimerHandle {
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> EngineRequest,
    ) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("Timer service has stopped"))?;
        response.await.context("Timer service dropped the request")
    }
}

#[async_trait]
impl TimerApi for TimerHandle {
    async fn update_state(&self, command: TimerCommand) -> Result<CommandOutcome> {
        self.request(|reply| EngineRequest::Update { command, reply })
            .await
    }

    async fn get_state(&self) -> Result<TimerState> {
        self.request(|reply| EngineRequest::GetState { reply }).await
    }

    async fn compute_unsaved(&self) -> Result<Unsaved> {
        self.request(|reply| EngineRequest::ComputeUnsaved { reply })
            .await
    }

    async fn notify_saved_elapsed(
        &self,
        session: u64,
        lease: Option<u64>,
        seconds: u64,
    ) -> Result<TimerState> {
        self.request(|reply| EngineRequest::CommitSaved {
            session,
            lease,
            seconds,
            reply,
        })
        .await
    }
}

/// Owns the engine. Requests, ticks and shutdown are handled one at a time on a single task, so
/// the engine needs no locking. Ticks only run while the timer is running.
pub struct TimerService {
    engine: TimerEngine,
    requests: mpsc::Receiver<EngineRequest>,
    surfaces: SurfaceRegistry<TimerState>,
    checkpoints: CheckpointWriter<TimerCheckpoint>,
    store: Arc<dyn TimeEntryStore>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl TimerService {
    /// Restores the engine from the last checkpoint, or starts idle.
    pub async fn restore(
        checkpointer: Checkpointer<TimerCheckpoint>,
        surfaces: SurfaceRegistry<TimerState>,
        store: Arc<dyn TimeEntryStore>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> (Self, TimerHandle) {
        let engine = match checkpointer.load().await {
            Some(checkpoint) => TimerEngine::restore(checkpoint, clock.clone()),
            None => TimerEngine::new(clock.clone()),
        };
        info!("Timer restored as {:?}", engine.state().status);

        let (sender, requests) = mpsc::channel(REQUEST_BUFFER);
        let service = Self {
            checkpoints: checkpointer.spawn_writer(engine.checkpoint()),
            engine,
            requests,
            surfaces,
            store,
            clock,
            shutdown,
        };
        (service, TimerHandle { sender })
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let next_tick = self.engine.next_tick();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = wait_for_tick(self.clock.as_ref(), next_tick) => {
                    if self.engine.tick() {
                        self.publish();
                    }
                }
            }
        }
        self.finish().await;
        Ok(())
    }

    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Update { command, reply } => {
                debug!("Applying {command:?}");
                let before = self.engine.state();
                let outcome = self.engine.apply(command);
                if outcome.state != before {
                    self.publish();
                }
                let _ = reply.send(outcome);
            }
            EngineRequest::GetState { reply } => {
                let _ = reply.send(self.engine.state());
            }
            EngineRequest::ComputeUnsaved { reply } => {
                if self.engine.tick() {
                    self.publish();
                }
                let _ = reply.send(self.engine.claim_unsaved());
            }
            EngineRequest::CommitSaved {
                session,
                lease,
                seconds,
                reply,
            } => {
                if self.engine.commit_saved(session, lease, seconds) {
                    self.publish();
                }
                let _ = reply.send(self.engine.state());
            }
        }
    }

    fn publish(&self) {
        let state = self.engine.state();
        self.surfaces.broadcast(&state);
        self.checkpoints.update(self.engine.checkpoint());
    }

    /// Stores whatever the surfaces didn't claim, then writes the last checkpoint. Time that
    /// can't be stored stays unsaved in the checkpoint.
    async fn finish(mut self) {
        self.engine.tick();
        let unsaved = self.engine.claim_unsaved();
        match (&unsaved.task, unsaved.seconds()) {
            (Some(task), seconds) if seconds > 0 => {
                let entry = NewTimeEntry {
                    task_id: task.id,
                    duration: seconds,
                    timestamp: self.clock.time(),
                    notes: None,
                };
                match self.store.create_time_entry(entry).await {
                    Ok(entry) => {
                        info!(
                            "Stored {seconds}s of task {} as entry {} before shutdown",
                            task.id, entry.id
                        );
                        self.engine
                            .commit_saved(unsaved.session, unsaved.lease, unsaved.elapsed);
                    }
                    Err(e) => {
                        error!(
                            "Couldn't store {seconds}s of task {} before shutdown {e:?}",
                            task.id
                        );
                        self.engine.commit_saved(
                            unsaved.session,
                            unsaved.lease,
                            unsaved.saved_through,
                        );
                    }
                }
            }
            _ => debug!("Nothing to store before shutdown"),
        }
        self.engine.pause();
        self.publish();
        self.checkpoints.finish().await;
    }
}

async fn wait_for_tick(clock: &dyn Clock, at: Option<Instant>) {
    match at {
        Some(at) => clock.sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::{anyhow, Result};
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use crate::{
        daemon::{
            checkpoint::{Checkpointer, TIMER_CHECKPOINT_FILE},
            hub::SurfaceRegistry,
            storage::{entities::TimeEntry, store::MockTimeEntryStore},
            timer::{
                command::TimerCommand,
                state::{TaskRef, TimerCheckpoint, TimerStatus},
                TimerApi,
            },
        },
        utils::{clock::DefaultClock, logging::TEST_LOGGING},
    };

    use super::TimerService;

    fn task() -> TaskRef {
        TaskRef {
            id: 1,
            name: "Write docs".into(),
            project_id: 2,
            organization_id: 3,
        }
    }

    fn start() -> TimerCommand {
        TimerCommand::Start {
            task: Some(task()),
            force_reset: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_reach_surfaces() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let surfaces = SurfaceRegistry::new();
        let (_subscription, mut states) = surfaces.subscribe();
        let shutdown = CancellationToken::new();
        let (service, handle) = TimerService::restore(
            Checkpointer::new(dir.path().join(TIMER_CHECKPOINT_FILE)),
            surfaces,
            Arc::new(MockTimeEntryStore::new()),
            Arc::new(DefaultClock),
            shutdown.clone(),
        )
        .await;
        let service = tokio::spawn(service.run());

        handle.update_state(start()).await?;
        let mut seen = Vec::new();
        while seen.last() != Some(&3) {
            let state = states.recv().await.ok_or(anyhow!("registry closed"))?;
            seen.push(state.elapsed_time);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);

        handle.update_state(TimerCommand::Pause).await?;
        handle.update_state(TimerCommand::Reset).await?;
        shutdown.cancel();
        service.await??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_mark_through_handle() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let shutdown = CancellationToken::new();
        let (service, handle) = TimerService::restore(
            Checkpointer::new(dir.path().join(TIMER_CHECKPOINT_FILE)),
            SurfaceRegistry::new(),
            Arc::new(MockTimeEntryStore::new()),
            Arc::new(DefaultClock),
            shutdown.clone(),
        )
        .await;
        let service = tokio::spawn(service.run());

        handle.update_state(start()).await?;
        tokio::time::sleep(Duration::from_millis(5200)).await;
        let unsaved = handle.compute_unsaved().await?;
        assert_eq!(unsaved.seconds(), 5);

        let state = handle
            .notify_saved_elapsed(unsaved.session, unsaved.lease, unsaved.elapsed)
            .await?;
        assert_eq!(state.last_saved_elapsed, 5);

        let state = handle
            .notify_saved_elapsed(unsaved.session + 1, None, 100)
            .await?;
        assert_eq!(state.last_saved_elapsed, 5);

        handle.update_state(TimerCommand::Reset).await?;
        shutdown.cancel();
        service.await??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_checkpoints() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let path = dir.path().join(TIMER_CHECKPOINT_FILE);
        let mut store = MockTimeEntryStore::new();
        store
            .expect_create_time_entry()
            .withf(|entry| entry.task_id == 1 && entry.duration == 3)
            .times(1)
            .returning(|entry| {
                Ok(TimeEntry {
                    id: 1,
                    task_id: entry.task_id,
                    duration: entry.duration,
                    timestamp: entry.timestamp,
                    notes: None,
                })
            });
        let shutdown = CancellationToken::new();
        let (service, handle) = TimerService::restore(
            Checkpointer::new(path.clone()),
            SurfaceRegistry::new(),
            Arc::new(store),
            Arc::new(DefaultClock),
            shutdown.clone(),
        )
        .await;
        let service = tokio::spawn(service.run());

        handle.update_state(start()).await?;
        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown.cancel();
        service.await??;

        let checkpoint = Checkpointer::<TimerCheckpoint>::new(path)
            .load()
            .await
            .ok_or(anyhow!("checkpoint missing"))?;
        assert_eq!(checkpoint.status, TimerStatus::Paused);
        assert_eq!(checkpoint.elapsed_time, 3);
        assert_eq!(checkpoint.last_saved_elapsed, Some(3));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_stays_unsaved() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let path = dir.path().join(TIMER_CHECKPOINT_FILE);
        let mut store = MockTimeEntryStore::new();
        store
            .expect_create_time_entry()
            .times(1)
            .returning(|_| Err(anyhow!("disk full")));
        let shutdown = CancellationToken::new();
        let (service, handle) = TimerService::restore(
            Checkpointer::new(path.clone()),
            SurfaceRegistry::new(),
            Arc::new(store),
            Arc::new(DefaultClock),
            shutdown.clone(),
        )
        .await;
        let service = tokio::spawn(service.run());

        handle.update_state(start()).await?;
        tokio::time::sleep(Duration::from_millis(2100)).await;
        shutdown.cancel();
        service.await??;

        let checkpoint = Checkpointer::<TimerCheckpoint>::new(path)
            .load()
            .await
            .ok_or(anyhow!("checkpoint missing"))?;
        assert_eq!(checkpoint.elapsed_time, 2);
        assert_eq!(checkpoint.last_saved_elapsed, Some(0));
        assert!(checkpoint.task.is_some());
        Ok(())
    }
}
