use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::utils::{
    clock::{whole_seconds_since, Clock},
    time::format_clock,
};

use super::{
    command::{CommandOutcome, TimerCommand},
    state::{TaskRef, TimerCheckpoint, TimerState, TimerStatus, Unsaved},
};

/// How long a surface may hold a claimed range before it is handed out again.
pub const LEASE_TIMEOUT: Duration = Duration::from_secs(60);

struct Lease {
    through: u64,
    expires_at: Instant,
}

/// Authoritative timer state machine. Elapsed time is always recomputed from the monotonic start
/// reference, never accumulated tick by tick, so a late or skipped tick can't drift the total.
///
/// Holds `lastSavedElapsed <= elapsed` at all times and only moves the saved mark forward within
/// one session. Unsaved time is handed out as leased ranges: a second claim while one is in
/// flight only gets the time after it, so two surfaces never store the same seconds.
pub struct TimerEngine {
    status: TimerStatus,
    elapsed: u64,
    task: Option<TaskRef>,
    start_ref: Option<Instant>,
    last_saved: u64,
    /// End of the time handed out to surfaces. `last_saved <= claimed <= elapsed`.
    claimed: u64,
    leases: BTreeMap<u64, Lease>,
    next_lease: u64,
    session: u64,
    updated_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl TimerEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            status: TimerStatus::Idle,
            elapsed: 0,
            task: None,
            start_ref: None,
            last_saved: 0,
            claimed: 0,
            leases: BTreeMap::new(),
            next_lease: 1,
            session: 1,
            updated_at: clock.time(),
            clock,
        }
    }

    /// Rebuilds the engine from a checkpoint. A running timer comes back paused, the previous
    /// process can't prove the clock kept going. Session numbers continue from the checkpoint.
    pub fn restore(checkpoint: TimerCheckpoint, clock: Arc<dyn Clock>) -> Self {
        let mut engine = Self::new(clock);
        engine.session = checkpoint.session.unwrap_or(engine.session);
        let Some(task) = checkpoint.task else {
            if checkpoint.elapsed_time > 0 {
                warn!(
                    "Checkpoint holds {}s without a task, discarding it",
                    checkpoint.elapsed_time
                );
            }
            return engine;
        };

        let elapsed = checkpoint.elapsed_time;
        let last_saved = checkpoint
            .last_saved_elapsed
            .unwrap_or(elapsed)
            .min(elapsed);
        engine.status = match checkpoint.status {
            _ if elapsed == 0 => TimerStatus::Idle,
            TimerStatus::Running => {
                info!("Timer was running when the last process ended, restoring it paused");
                TimerStatus::Paused
            }
            status => status,
        };
        engine.elapsed = elapsed;
        engine.last_saved = last_saved;
        engine.claimed = last_saved;
        engine.task = Some(task);
        engine
    }

    pub fn apply(&mut self, command: TimerCommand) -> CommandOutcome {
        let unsaved = match command {
            TimerCommand::SetTaskContext {
                task,
                initial_elapsed,
            } => {
                self.set_task_context(task, initial_elapsed);
                None
            }
            TimerCommand::Start { task, force_reset } => {
                self.start(task, force_reset);
                None
            }
            TimerCommand::Pause => {
                self.pause();
                None
            }
            TimerCommand::Stop => Some(self.stop()),
            TimerCommand::Reset => Some(self.reset()),
        };
        CommandOutcome {
            state: self.state(),
            unsaved,
        }
    }

    /// Starts a new session for `task`, seeded with `initial_elapsed` seconds that are already
    /// stored. Stops the clock if it was running; the caller flushes before switching.
    pub fn set_task_context(&mut self, task: Option<TaskRef>, initial_elapsed: u64) {
        let Some(task) = task else {
            self.clear();
            return;
        };
        self.warn_discarded("task switch");
        self.status = if initial_elapsed > 0 {
            TimerStatus::Paused
        } else {
            TimerStatus::Idle
        };
        self.elapsed = initial_elapsed;
        self.last_saved = initial_elapsed;
        self.start_ref = None;
        self.task = Some(task);
        self.next_session();
    }

    /// Returns whether the clock started. Without a task, neither given nor held, nothing happens.
    pub fn start(&mut self, task: Option<TaskRef>, force_reset: bool) -> bool {
        let Some(task) = task.or_else(|| self.task.clone()) else {
            warn!("Start requested without a task, ignoring it");
            return false;
        };
        let same_task = self.task.as_ref().is_some_and(|v| v.id == task.id);
        if self.status == TimerStatus::Running && same_task && !force_reset {
            debug!("Timer already running for task {}", task.id);
            return false;
        }

        self.tick();
        if !same_task || force_reset {
            self.warn_discarded("restart");
            self.elapsed = 0;
            self.last_saved = 0;
            self.next_session();
        }

        let now = self.clock.instant();
        self.start_ref = Some(
            now.checked_sub(Duration::from_secs(self.elapsed))
                .unwrap_or(now),
        );
        self.status = TimerStatus::Running;
        self.task = Some(task);
        self.touch();
        true
    }

    pub fn pause(&mut self) -> bool {
        if self.status != TimerStatus::Running {
            return false;
        }
        self.tick();
        self.status = TimerStatus::Paused;
        self.start_ref = None;
        self.touch();
        true
    }

    /// Freezes the clock and claims the diff the caller must store. The session survives so a
    /// late saved-mark still applies.
    pub fn stop(&mut self) -> Unsaved {
        self.tick();
        let unsaved = self.claim_unsaved();
        if self.status == TimerStatus::Idle {
            return unsaved;
        }
        self.status = if self.elapsed > 0 {
            TimerStatus::Paused
        } else {
            TimerStatus::Idle
        };
        self.start_ref = None;
        self.touch();
        unsaved
    }

    /// Returns the unsaved diff claimed before clearing, the same way as [TimerEngine::stop].
    pub fn reset(&mut self) -> Unsaved {
        self.tick();
        let unsaved = self.claim_unsaved();
        self.clear();
        unsaved
    }

    /// Recomputes elapsed time from the start reference. Returns whether the visible state changed.
    pub fn tick(&mut self) -> bool {
        let (TimerStatus::Running, Some(reference)) = (self.status, self.start_ref) else {
            return false;
        };
        let elapsed = whole_seconds_since(reference, self.clock.instant());
        if elapsed == self.elapsed {
            return false;
        }
        self.elapsed = elapsed;
        self.last_saved = self.last_saved.min(elapsed);
        self.claimed = self.claimed.clamp(self.last_saved, elapsed);
        self.touch();
        true
    }

    /// Time of this session nobody has stored or claimed yet. Claims nothing.
    pub fn pending(&self) -> Unsaved {
        Unsaved {
            session: self.session,
            task: self.task.clone(),
            saved_through: self.claimed,
            elapsed: self.elapsed,
            lease: None,
        }
    }

    /// Hands the unclaimed part of the session to the caller. The range stays claimed until it is
    /// committed, given back or [LEASE_TIMEOUT] passes. An empty range carries no lease.
    pub fn claim_unsaved(&mut self) -> Unsaved {
        self.expire_leases();
        let mut unsaved = self.pending();
        if self.task.is_none() || unsaved.seconds() == 0 {
            unsaved.saved_through = self.elapsed;
            return unsaved;
        }

        let lease = self.next_lease;
        self.next_lease += 1;
        self.leases.insert(
            lease,
            Lease {
                through: self.elapsed,
                expires_at: self.clock.instant() + LEASE_TIMEOUT,
            },
        );
        self.claimed = self.elapsed;
        debug!(
            "Lease {lease} covers {}s..{}s of session {}",
            unsaved.saved_through, self.elapsed, self.session
        );
        unsaved.lease = Some(lease);
        unsaved
    }

    /// Second half of the flush protocol. Marks time through `through` as stored and ends
    /// `lease`, unless the mark belongs to an older session. A mark at or below the current one
    /// only gives the leased range back. Returns whether the saved mark moved.
    pub fn commit_saved(&mut self, session: u64, lease: Option<u64>, through: u64) -> bool {
        if session != self.session {
            debug!(
                "Ignoring saved mark for session {session}, current session is {}",
                self.session
            );
            return false;
        }
        if let Some(lease) = lease {
            if self.leases.remove(&lease).is_none() {
                debug!("Lease {lease} already ended");
            }
        }

        let through = through.min(self.elapsed);
        let moved = through > self.last_saved;
        if moved {
            self.last_saved = through;
            self.touch();
        }
        self.rewind_claims();
        moved
    }

    /// Instant at which the displayed elapsed time changes next, if the clock is running.
    pub fn next_tick(&self) -> Option<Instant> {
        match (self.status, self.start_ref) {
            (TimerStatus::Running, Some(reference)) => {
                Some(reference + Duration::from_secs(self.elapsed + 1))
            }
            _ => None,
        }
    }

    pub fn state(&self) -> TimerState {
        TimerState {
            status: self.status,
            elapsed_time: self.elapsed,
            display: format_clock(self.elapsed),
            task: self.task.clone(),
            last_saved_elapsed: self.last_saved,
            session: self.session,
            updated_at: self.updated_at,
        }
    }

    pub fn checkpoint(&self) -> TimerCheckpoint {
        TimerCheckpoint {
            status: self.status,
            elapsed_time: self.elapsed,
            display: format_clock(self.elapsed),
            task: self.task.clone(),
            last_saved_elapsed: Some(self.last_saved),
            session: Some(self.session),
        }
    }

    fn clear(&mut self) {
        self.status = TimerStatus::Idle;
        self.elapsed = 0;
        self.last_saved = 0;
        self.start_ref = None;
        self.task = None;
        self.next_session();
    }

    /// Leases of the previous session end with it.
    fn next_session(&mut self) {
        self.session += 1;
        self.leases.clear();
        self.claimed = self.last_saved;
        self.touch();
    }

    fn expire_leases(&mut self) {
        let now = self.clock.instant();
        let before = self.leases.len();
        self.leases.retain(|id, lease| {
            let live = lease.expires_at > now;
            if !live {
                warn!("Lease {id} through {}s expired unsaved", lease.through);
            }
            live
        });
        if self.leases.len() != before {
            self.rewind_claims();
        }
    }

    fn rewind_claims(&mut self) {
        let in_flight = self.leases.values().map(|v| v.through).max();
        self.claimed = in_flight
            .unwrap_or(self.last_saved)
            .clamp(self.last_saved, self.elapsed);
    }

    fn touch(&mut self) {
        self.updated_at = self.clock.time();
    }

    fn warn_discarded(&self, reason: &str) {
        let unclaimed = self.elapsed.saturating_sub(self.claimed);
        if unclaimed > 0 {
            warn!("{reason} discards {unclaimed}s of unsaved time");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::advance;

    use crate::{
        daemon::timer::{
            command::TimerCommand,
            state::{TaskRef, TimerCheckpoint, TimerStatus},
        },
        utils::{clock::DefaultClock, logging::TEST_LOGGING},
    };

    use super::{TimerEngine, LEASE_TIMEOUT};

    fn task(id: i64) -> TaskRef {
        TaskRef {
            id,
            name: format!("task {id}"),
            project_id: 10,
            organization_id: 100,
        }
    }

    fn engine() -> TimerEngine {
        *TEST_LOGGING;
        TimerEngine::new(Arc::new(DefaultClock))
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_follows_the_clock() {
        let mut engine = engine();
        assert!(engine.start(Some(task(1)), false));

        advance(Duration::from_millis(2500)).await;
        engine.tick();
        assert_eq!(engine.state().elapsed_time, 2);
        assert_eq!(engine.state().display, "00:00:02");

        // Ticks that fire late still land on the right total.
        advance(Duration::from_secs(10)).await;
        engine.tick();
        assert_eq!(engine.state().elapsed_time, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_keeps_total() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(5)).await;
        assert!(engine.pause());
        assert_eq!(engine.state().elapsed_time, 5);

        advance(Duration::from_secs(60)).await;
        engine.tick();
        assert_eq!(engine.state().elapsed_time, 5);

        assert!(engine.start(None, false));
        advance(Duration::from_secs(3)).await;
        engine.tick();
        assert_eq!(engine.state().elapsed_time, 8);
        assert_eq!(engine.state().status, TimerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_mark_never_exceeds_elapsed() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(20)).await;
        engine.tick();

        let session = engine.state().session;
        assert!(engine.commit_saved(session, None, 500));
        assert_eq!(engine.state().last_saved_elapsed, 20);

        // Moving backwards is ignored.
        assert!(!engine.commit_saved(session, None, 10));
        assert_eq!(engine.state().last_saved_elapsed, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_mark_is_ignored() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(30)).await;
        let unsaved = engine.stop();
        assert_eq!(unsaved.seconds(), 30);

        engine.start(Some(task(2)), false);
        advance(Duration::from_secs(4)).await;
        engine.tick();

        assert!(!engine.commit_saved(unsaved.session, unsaved.lease, unsaved.elapsed));
        let state = engine.state();
        assert_eq!(state.last_saved_elapsed, 0);
        assert_eq!(state.elapsed_time, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_same_task_keeps_elapsed() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(7)).await;
        engine.pause();

        engine.start(Some(task(1)), false);
        assert_eq!(engine.state().elapsed_time, 7);

        advance(Duration::from_secs(1)).await;
        engine.start(Some(task(1)), true);
        let state = engine.state();
        assert_eq!(state.elapsed_time, 0);
        assert_eq!(state.last_saved_elapsed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_task_starts_new_session() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(9)).await;
        let session = engine.state().session;

        engine.start(Some(task(2)), false);
        let state = engine.state();
        assert_eq!(state.elapsed_time, 0);
        assert_ne!(state.session, session);
        assert_eq!(state.task.map(|v| v.id), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_task_is_ignored() {
        let mut engine = engine();
        let before = engine.state();
        assert!(!engine.start(None, false));
        assert_eq!(engine.state(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_context_seeds_saved_time() {
        let mut engine = engine();
        let outcome = engine.apply(TimerCommand::SetTaskContext {
            task: Some(task(3)),
            initial_elapsed: 120,
        });
        assert_eq!(outcome.state.status, TimerStatus::Paused);
        assert_eq!(outcome.state.elapsed_time, 120);
        assert_eq!(outcome.state.last_saved_elapsed, 120);
        assert!(outcome.unsaved.is_none());

        engine.start(None, false);
        advance(Duration::from_secs(6)).await;
        engine.tick();
        assert_eq!(engine.pending().seconds(), 6);

        engine.apply(TimerCommand::SetTaskContext {
            task: None,
            initial_elapsed: 0,
        });
        let state = engine.state();
        assert_eq!(state.status, TimerStatus::Idle);
        assert!(state.task.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_returns_unsaved_then_clears() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(12)).await;
        engine.tick();
        engine.commit_saved(engine.state().session, None, 5);

        let outcome = engine.apply(TimerCommand::Reset);
        let unsaved = outcome.unsaved.unwrap();
        assert_eq!(unsaved.saved_through, 5);
        assert_eq!(unsaved.elapsed, 12);
        assert_eq!(unsaved.task.map(|v| v.id), Some(1));
        assert_eq!(outcome.state.status, TimerStatus::Idle);
        assert_eq!(outcome.state.elapsed_time, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_downgrades_running() {
        *TEST_LOGGING;
        let engine = TimerEngine::restore(
            TimerCheckpoint {
                status: TimerStatus::Running,
                elapsed_time: 50,
                display: "00:00:50".into(),
                task: Some(task(4)),
                last_saved_elapsed: Some(30),
                session: None,
            },
            Arc::new(DefaultClock),
        );
        let state = engine.state();
        assert_eq!(state.status, TimerStatus::Paused);
        assert_eq!(state.elapsed_time, 50);
        assert_eq!(state.last_saved_elapsed, 30);
        assert!(engine.next_tick().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_without_saved_mark() {
        *TEST_LOGGING;
        let engine = TimerEngine::restore(
            TimerCheckpoint {
                status: TimerStatus::Paused,
                elapsed_time: 42,
                display: String::new(),
                task: Some(task(4)),
                last_saved_elapsed: None,
                session: None,
            },
            Arc::new(DefaultClock),
        );
        assert_eq!(engine.pending().seconds(), 0);

        let engine = TimerEngine::restore(
            TimerCheckpoint {
                status: TimerStatus::Paused,
                elapsed_time: 42,
                display: String::new(),
                task: Some(task(4)),
                last_saved_elapsed: Some(90),
                session: None,
            },
            Arc::new(DefaultClock),
        );
        assert_eq!(engine.state().last_saved_elapsed, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_lands_on_second_boundary() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        let started = tokio::time::Instant::now();
        advance(Duration::from_millis(1400)).await;
        engine.tick();
        assert_eq!(engine.next_tick(), Some(started + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_stop_after_commit_has_nothing_to_store() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(20)).await;

        let unsaved = engine.stop();
        assert_eq!(unsaved.seconds(), 20);
        assert!(engine.commit_saved(unsaved.session, unsaved.lease, unsaved.elapsed));
        let state = engine.state();
        assert_eq!(state.last_saved_elapsed, 20);
        assert_eq!(state.elapsed_time, 20);

        let again = engine.stop();
        assert_eq!(again.seconds(), 0);
        assert!(again.lease.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_claims_never_overlap() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(15)).await;
        engine.tick();

        let first = engine.claim_unsaved();
        let second = engine.claim_unsaved();
        assert_eq!(first.seconds(), 15);
        assert_eq!(second.seconds(), 0);
        assert!(second.lease.is_none());

        // Time after the first range goes to the next claimer, even while it is in flight.
        advance(Duration::from_secs(5)).await;
        let stopped = engine.stop();
        assert_eq!((stopped.saved_through, stopped.elapsed), (15, 20));

        assert!(engine.commit_saved(stopped.session, stopped.lease, stopped.elapsed));
        assert!(!engine.commit_saved(first.session, first.lease, first.elapsed));
        assert_eq!(engine.state().last_saved_elapsed, 20);
        assert_eq!(engine.pending().seconds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_given_back_range_is_claimed_again() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(8)).await;
        engine.tick();

        let failed = engine.claim_unsaved();
        assert!(!engine.commit_saved(failed.session, failed.lease, failed.saved_through));

        let retry = engine.claim_unsaved();
        assert_eq!((retry.saved_through, retry.elapsed), (0, 8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lease_expires() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        advance(Duration::from_secs(4)).await;
        engine.pause();
        let abandoned = engine.claim_unsaved();
        assert!(abandoned.lease.is_some());
        assert_eq!(engine.claim_unsaved().seconds(), 0);

        advance(LEASE_TIMEOUT).await;
        assert_eq!(engine.claim_unsaved().seconds(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_continue_across_restore() {
        let mut engine = engine();
        engine.start(Some(task(1)), false);
        engine.start(Some(task(2)), false);
        advance(Duration::from_secs(3)).await;
        engine.pause();
        let checkpoint = engine.checkpoint();
        let session = engine.state().session;
        assert_eq!(checkpoint.session, Some(session));

        let mut restored = TimerEngine::restore(checkpoint, Arc::new(DefaultClock));
        assert_eq!(restored.state().session, session);
        restored.start(Some(task(3)), false);
        assert!(restored.state().session > session);
    }
}
