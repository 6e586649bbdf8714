//! The timer: a pure state machine ([engine::TimerEngine]) driven by a single actor task
//! ([service::TimerService]) that every surface talks to through [TimerApi].

use std::ops::Deref;

use anyhow::Result;
use async_trait::async_trait;

use command::{CommandOutcome, TimerCommand};
use state::{TimerState, Unsaved};

pub mod command;
pub mod engine;
pub mod service;
pub mod state;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimerApi: Send + Sync {
    async fn update_state(&self, command: TimerCommand) -> Result<CommandOutcome>;

    async fn get_state(&self) -> Result<TimerState>;

    /// Claims the unsaved time for the caller to store. Callers racing for the same session get
    /// disjoint ranges.
    async fn compute_unsaved(&self) -> Result<Unsaved>;

    /// Marks the session's time through `seconds` as stored and ends `lease`. Marks for an older
    /// session are ignored and the current state is returned unchanged.
    async fn notify_saved_elapsed(
        &self,
        session: u64,
        lease: Option<u64>,
        seconds: u64,
    ) -> Result<TimerState>;
}

#[async_trait]
impl<T> TimerApi for T
where
    T: Deref + Send + Sync,
    T::Target: TimerApi,
{
    async fn update_state(&self, command: TimerCommand) -> Result<CommandOutcome> {
        self.deref().update_state(command).await
    }

    async fn get_state(&self) -> Result<TimerState> {
        self.deref().get_state().await
    }

    async fn compute_unsaved(&self) -> Result<Unsaved> {
        self.deref().compute_unsaved().await
    }

    async fn notify_saved_elapsed(
        &self,
        session: u64,
        lease: Option<u64>,
        seconds: u64,
    ) -> Result<TimerState> {
        self.deref()
            .notify_saved_elapsed(session, lease, seconds)
            .await
    }
}
