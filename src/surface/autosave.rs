use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, error, info, warn};

use crate::{
    daemon::{
        storage::{
            entities::{NewTimeEntry, Record, RecordKind},
            store::{CatalogStore, TimeEntryStore},
        },
        timer::{
            command::{CommandOutcome, RemoteCommand, TimerCommand},
            state::{TaskRef, TimerState, TimerStatus, Unsaved},
            TimerApi,
        },
    },
    utils::clock::Clock,
};

pub const DEFAULT_AUTOSAVE_INTERVAL: u64 = 15;

/// Surface side of the flush protocol. Stores unsaved time as time entries and reports the new
/// saved mark back to the timer: every `interval` seconds of running time, and whenever a stop,
/// reset or task switch would otherwise discard it.
///
/// Time is only stored after the timer handed it out as a leased range, so several surfaces
/// running auto-savers at once store disjoint parts of a session.
pub struct AutoSaver<T, S> {
    timer: T,
    store: S,
    clock: Arc<dyn Clock>,
    interval: u64,
    /// Session and elapsed time before which a failed auto-save isn't retried.
    backoff: Option<(u64, u64)>,
}

impl<T, S> AutoSaver<T, S>
where
    T: TimerApi,
    S: TimeEntryStore,
{
    pub fn new(timer: T, store: S, clock: Arc<dyn Clock>, interval: u64) -> Self {
        Self {
            timer,
            store,
            clock,
            interval: interval.max(1),
            backoff: None,
        }
    }

    /// Stores the range claimed in `unsaved` and marks it saved. Returns whether an entry was
    /// written; nothing is written for an empty range or a session without task. A range that
    /// couldn't be stored is given back to the timer.
    pub async fn flush(&self, unsaved: &Unsaved) -> Result<bool> {
        let seconds = unsaved.seconds();
        let Some(lease) = unsaved.lease else {
            return Ok(false);
        };
        let Some(task) = unsaved.task.as_ref().filter(|_| seconds > 0) else {
            self.give_back(unsaved).await;
            return Ok(false);
        };

        let created = self
            .store
            .create_time_entry(NewTimeEntry {
                task_id: task.id,
                duration: seconds,
                timestamp: self.clock.time(),
                notes: None,
            })
            .await;
        let entry = match created {
            Ok(entry) => entry,
            Err(e) => {
                self.give_back(unsaved).await;
                return Err(e);
            }
        };
        debug!("Stored {seconds}s of task {} as entry {}", task.id, entry.id);

        if let Err(e) = self
            .timer
            .notify_saved_elapsed(unsaved.session, Some(lease), unsaved.elapsed)
            .await
        {
            // The entry exists, the saved mark only lags behind. The range is handed out again
            // once its lease expires, which may store this time a second time.
            error!("Couldn't report saved time to the timer {e:?}");
            return Err(e);
        }
        Ok(true)
    }

    /// Called for every timer state the surface receives. Flushes once enough running time is
    /// unsaved. The decision is made on a fresh claim from the timer, not on `state`, which may be
    /// stale by the time it is processed.
    pub async fn on_state(&mut self, state: &TimerState) -> Result<bool> {
        if state.status != TimerStatus::Running || state.unsaved() < self.interval {
            return Ok(false);
        }
        if let Some((session, elapsed)) = self.backoff {
            if session == state.session && state.elapsed_time < elapsed {
                return Ok(false);
            }
        }

        let unsaved = self.timer.compute_unsaved().await?;
        if unsaved.seconds() < self.interval {
            self.give_back(&unsaved).await;
            return Ok(false);
        }
        match self.flush(&unsaved).await {
            Ok(saved) => {
                self.backoff = None;
                Ok(saved)
            }
            Err(e) => {
                warn!(
                    "Auto-save of {}s failed, retrying in {}s {e:?}",
                    unsaved.seconds(),
                    self.interval
                );
                self.backoff = Some((unsaved.session, unsaved.elapsed + self.interval));
                Ok(false)
            }
        }
    }

    /// Stops the timer and stores what it hands back. Returns the outcome and whether time was
    /// stored. The timer stops even if storing fails; the time then stays unsaved in the paused
    /// session.
    pub async fn stop(&mut self) -> Result<(CommandOutcome, bool)> {
        let outcome = self.timer.update_state(TimerCommand::Stop).await?;
        let saved = self.flush_outcome(&outcome).await;
        Ok((outcome, saved))
    }

    /// Like [AutoSaver::stop], but the session is discarded afterwards.
    pub async fn reset(&mut self) -> Result<(CommandOutcome, bool)> {
        let outcome = self.timer.update_state(TimerCommand::Reset).await?;
        let saved = self.flush_outcome(&outcome).await;
        Ok((outcome, saved))
    }

    /// Starts or resumes the timer. Starting another task, or a forced reset, begins a new session;
    /// the current one is paused and stored first, and the start is refused if storing fails.
    pub async fn start(&mut self, task: Option<TaskRef>, force_reset: bool) -> Result<CommandOutcome> {
        let held = self.timer.get_state().await?;
        let held_id = held.task.as_ref().map(|v| v.id);
        let switching = force_reset || task.as_ref().is_some_and(|v| held_id != Some(v.id));
        if switching {
            self.settle(&held).await?;
        }
        self.timer
            .update_state(TimerCommand::Start { task, force_reset })
            .await
    }

    pub async fn pause(&mut self) -> Result<CommandOutcome> {
        self.timer.update_state(TimerCommand::Pause).await
    }

    /// Performs a command relayed from another surface.
    pub async fn handle_remote(&mut self, command: RemoteCommand) -> Result<CommandOutcome> {
        info!("Performing remote {command}");
        match command {
            RemoteCommand::Start => self.start(None, false).await,
            RemoteCommand::Pause => self.pause().await,
            RemoteCommand::Stop => self.stop().await.map(|(outcome, _)| outcome),
        }
    }

    /// Freezes a running timer and stores the rest of its session, so nothing ticks between the
    /// flush and the command that discards the session.
    async fn settle(&mut self, held: &TimerState) -> Result<()> {
        if held.status == TimerStatus::Running {
            self.timer.update_state(TimerCommand::Pause).await?;
        }
        let unsaved = self.timer.compute_unsaved().await?;
        self.flush(&unsaved).await?;
        self.backoff = None;
        Ok(())
    }

    /// Returns a claimed range unstored, so the next claim covers it again.
    async fn give_back(&self, unsaved: &Unsaved) {
        let Some(lease) = unsaved.lease else {
            return;
        };
        if let Err(e) = self
            .timer
            .notify_saved_elapsed(unsaved.session, Some(lease), unsaved.saved_through)
            .await
        {
            warn!("Couldn't give lease {lease} back, it expires on its own {e:?}");
        }
    }

    async fn flush_outcome(&mut self, outcome: &CommandOutcome) -> bool {
        self.backoff = None;
        let Some(unsaved) = &outcome.unsaved else {
            return false;
        };
        match self.flush(unsaved).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(
                    "Couldn't store {}s after {:?} {e:?}",
                    unsaved.seconds(),
                    outcome.state.status
                );
                false
            }
        }
    }
}

impl<T, S> AutoSaver<T, S>
where
    T: TimerApi,
    S: TimeEntryStore + CatalogStore,
{
    /// Switches the timer to `task_id`. The current session is paused and flushed first and the
    /// switch is refused if that fails. The new session starts from the time already stored for
    /// the task.
    pub async fn select_task(&mut self, task_id: Option<i64>) -> Result<TimerState> {
        let held = self.timer.get_state().await?;
        if held.task.as_ref().map(|v| v.id) == task_id {
            return Ok(held);
        }
        self.settle(&held).await?;

        let (task, initial_elapsed) = match task_id {
            Some(id) => {
                let task = self.resolve_task(id).await?;
                let stored = self.store.total_duration_by_task(id).await?;
                (Some(task), stored)
            }
            None => (None, 0),
        };
        let outcome = self
            .timer
            .update_state(TimerCommand::SetTaskContext {
                task,
                initial_elapsed,
            })
            .await?;
        Ok(outcome.state)
    }

    pub async fn resolve_task(&self, task_id: i64) -> Result<TaskRef> {
        let Some(Record::Task(task)) = self.store.get_record(RecordKind::Task, task_id).await?
        else {
            bail!("Task {task_id} doesn't exist");
        };
        let Some(Record::Project(project)) = self
            .store
            .get_record(RecordKind::Project, task.project_id)
            .await?
        else {
            bail!("Project {} of task {task_id} doesn't exist", task.project_id);
        };
        Ok(TaskRef::from_task(&task, project.organization_id))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::time::advance;
    use tokio_util::sync::CancellationToken;

    use crate::{
        daemon::{
            checkpoint::{Checkpointer, TIMER_CHECKPOINT_FILE},
            hub::SurfaceRegistry,
            storage::{entities::TimeEntry, store::MockTimeEntryStore},
            timer::{
                command::{CommandOutcome, TimerCommand},
                engine::TimerEngine,
                service::TimerService,
                state::{TaskRef, TimerState, TimerStatus, Unsaved},
                TimerApi,
            },
        },
        utils::{clock::DefaultClock, logging::TEST_LOGGING},
    };

    use super::AutoSaver;

    /// Engine driven in-process, ticks happen only when the test asks for them.
    struct LocalTimer(Mutex<TimerEngine>);

    impl LocalTimer {
        fn new() -> Self {
            Self(Mutex::new(TimerEngine::new(Arc::new(DefaultClock))))
        }

        fn tick(&self) -> TimerState {
            let mut engine = self.0.lock().unwrap();
            engine.tick();
            engine.state()
        }
    }

    #[async_trait]
    impl TimerApi for LocalTimer {
        async fn update_state(&self, command: TimerCommand) -> Result<CommandOutcome> {
            Ok(self.0.lock().unwrap().apply(command))
        }

        async fn get_state(&self) -> Result<TimerState> {
            Ok(self.0.lock().unwrap().state())
        }

        async fn compute_unsaved(&self) -> Result<Unsaved> {
            Ok(self.0.lock().unwrap().claim_unsaved())
        }

        async fn notify_saved_elapsed(
            &self,
            session: u64,
            lease: Option<u64>,
            seconds: u64,
        ) -> Result<TimerState> {
            let mut engine = self.0.lock().unwrap();
            engine.commit_saved(session, lease, seconds);
            Ok(engine.state())
        }
    }

    fn task() -> TaskRef {
        TaskRef {
            id: 7,
            name: "Review".into(),
            project_id: 2,
            organization_id: 1,
        }
    }

    fn recording_store(durations: Arc<Mutex<Vec<u64>>>) -> MockTimeEntryStore {
        let mut store = MockTimeEntryStore::new();
        store.expect_create_time_entry().returning(move |entry| {
            let mut durations = durations.lock().unwrap();
            durations.push(entry.duration);
            Ok(TimeEntry {
                id: durations.len() as i64,
                task_id: entry.task_id,
                duration: entry.duration,
                timestamp: entry.timestamp,
                notes: None,
            })
        });
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_then_stop_persists_everything() -> Result<()> {
        *TEST_LOGGING;
        let timer = Arc::new(LocalTimer::new());
        let durations = Arc::new(Mutex::new(Vec::new()));
        let mut saver = AutoSaver::new(
            timer.clone(),
            recording_store(durations.clone()),
            Arc::new(DefaultClock),
            15,
        );

        saver.start(Some(task()), false).await?;
        for _ in 0..37 {
            advance(Duration::from_secs(1)).await;
            let state = timer.tick();
            saver.on_state(&state).await?;
        }
        assert_eq!(*durations.lock().unwrap(), vec![15, 15]);
        assert_eq!(timer.get_state().await?.last_saved_elapsed, 30);

        let (outcome, saved) = saver.stop().await?;
        assert!(saved);
        assert_eq!(outcome.state.status, TimerStatus::Paused);
        assert_eq!(*durations.lock().unwrap(), vec![15, 15, 7]);

        let state = timer.get_state().await?;
        assert_eq!(state.elapsed_time, 37);
        assert_eq!(state.last_saved_elapsed, 37);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_state_does_not_save_twice() -> Result<()> {
        *TEST_LOGGING;
        let timer = Arc::new(LocalTimer::new());
        let durations = Arc::new(Mutex::new(Vec::new()));
        let mut saver = AutoSaver::new(
            timer.clone(),
            recording_store(durations.clone()),
            Arc::new(DefaultClock),
            15,
        );

        saver.start(Some(task()), false).await?;
        advance(Duration::from_secs(16)).await;
        let stale = timer.tick();
        saver.on_state(&stale).await?;
        saver.on_state(&stale).await?;
        assert_eq!(*durations.lock().unwrap(), vec![16]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_autosave_is_retried_with_larger_diff() -> Result<()> {
        *TEST_LOGGING;
        let timer = Arc::new(LocalTimer::new());
        let mut store = MockTimeEntryStore::new();
        let mut attempts = 0;
        store.expect_create_time_entry().returning(move |entry| {
            attempts += 1;
            if attempts == 1 {
                return Err(anyhow!("store unavailable"));
            }
            Ok(TimeEntry {
                id: attempts,
                task_id: entry.task_id,
                duration: entry.duration,
                timestamp: entry.timestamp,
                notes: None,
            })
        });
        let mut saver = AutoSaver::new(timer.clone(), store, Arc::new(DefaultClock), 15);

        saver.start(Some(task()), false).await?;
        for _ in 0..29 {
            advance(Duration::from_secs(1)).await;
            let state = timer.tick();
            saver.on_state(&state).await?;
        }
        // The first attempt at 15s failed and nothing was marked saved.
        assert_eq!(timer.get_state().await?.last_saved_elapsed, 0);

        advance(Duration::from_secs(1)).await;
        let state = timer.tick();
        assert!(saver.on_state(&state).await?);
        assert_eq!(timer.get_state().await?.last_saved_elapsed, 30);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_survives_failed_flush() -> Result<()> {
        *TEST_LOGGING;
        let timer = Arc::new(LocalTimer::new());
        let mut store = MockTimeEntryStore::new();
        store
            .expect_create_time_entry()
            .returning(|_| Err(anyhow!("store unavailable")));
        let mut saver = AutoSaver::new(timer.clone(), store, Arc::new(DefaultClock), 15);

        saver.start(Some(task()), false).await?;
        advance(Duration::from_secs(5)).await;
        let (outcome, saved) = saver.stop().await?;
        assert!(!saved);
        assert_eq!(outcome.state.status, TimerStatus::Paused);
        assert_eq!(timer.compute_unsaved().await?.seconds(), 5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_task_stores_previous_session() -> Result<()> {
        *TEST_LOGGING;
        let timer = Arc::new(LocalTimer::new());
        let durations = Arc::new(Mutex::new(Vec::new()));
        let mut saver = AutoSaver::new(
            timer.clone(),
            recording_store(durations.clone()),
            Arc::new(DefaultClock),
            15,
        );

        saver.start(Some(task()), false).await?;
        advance(Duration::from_secs(10)).await;
        timer.tick();
        let other = TaskRef {
            id: 8,
            name: "Deploy".into(),
            ..task()
        };
        saver.start(Some(other), false).await?;
        assert_eq!(*durations.lock().unwrap(), vec![10]);

        let state = timer.get_state().await?;
        assert_eq!(state.status, TimerStatus::Running);
        assert_eq!(state.task.map(|v| v.id), Some(8));
        assert_eq!(state.elapsed_time, 0);
        assert_eq!(state.last_saved_elapsed, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_restart_keeps_untracked_seconds() -> Result<()> {
        *TEST_LOGGING;
        let timer = Arc::new(LocalTimer::new());
        let durations = Arc::new(Mutex::new(Vec::new()));
        let mut saver = AutoSaver::new(
            timer.clone(),
            recording_store(durations.clone()),
            Arc::new(DefaultClock),
            15,
        );

        saver.start(Some(task()), false).await?;
        advance(Duration::from_secs(10)).await;
        timer.tick();
        // The clock moves on without a tick reaching the engine.
        advance(Duration::from_secs(2)).await;
        saver.start(None, true).await?;
        assert_eq!(*durations.lock().unwrap(), vec![12]);

        let state = timer.get_state().await?;
        assert_eq!(state.status, TimerStatus::Running);
        assert_eq!(state.elapsed_time, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_is_refused_when_flush_fails() -> Result<()> {
        *TEST_LOGGING;
        let timer = Arc::new(LocalTimer::new());
        let mut store = MockTimeEntryStore::new();
        store
            .expect_create_time_entry()
            .returning(|_| Err(anyhow!("store unavailable")));
        let mut saver = AutoSaver::new(timer.clone(), store, Arc::new(DefaultClock), 15);

        saver.start(Some(task()), false).await?;
        advance(Duration::from_secs(6)).await;
        assert!(saver.start(None, true).await.is_err());

        let state = timer.get_state().await?;
        assert_eq!(state.status, TimerStatus::Paused);
        assert_eq!(state.elapsed_time, 6);
        assert_eq!(timer.compute_unsaved().await?.seconds(), 6);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_surfaces_store_disjoint_time() -> Result<()> {
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

        let durations = Arc::new(Mutex::new(Vec::new()));
        let mut first = AutoSaver::new(
            handle.clone(),
            recording_store(durations.clone()),
            Arc::new(DefaultClock),
            15,
        );
        let mut second = AutoSaver::new(
            handle.clone(),
            recording_store(durations.clone()),
            Arc::new(DefaultClock),
            15,
        );

        first.start(Some(task()), false).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        for expected in [16, 32] {
            tokio::time::sleep(Duration::from_secs(16)).await;
            let state = handle.get_state().await?;
            assert_eq!(state.elapsed_time, expected);
            let (a, b) = tokio::join!(first.on_state(&state), second.on_state(&state));
            let (a, b) = (a?, b?);
            assert!(a ^ b, "exactly one surface stores the window");
        }
        assert_eq!(*durations.lock().unwrap(), vec![16, 16]);

        let (outcome, saved) = second.stop().await?;
        assert!(!saved);
        assert_eq!(outcome.state.last_saved_elapsed, 32);
        assert_eq!(durations.lock().unwrap().iter().sum::<u64>(), 32);

        shutdown.cancel();
        service.await??;
        Ok(())
    }
}
