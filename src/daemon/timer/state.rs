use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::daemon::storage::entities::Task;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    /// No clock running. A task context may still be held with zero elapsed time.
    #[default]
    Idle,
    Running,
    /// Task context held, clock frozen.
    Paused,
}

/// The task a timer session tracks, denormalized so surfaces can render it without a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub organization_id: i64,
}

impl TaskRef {
    pub fn from_task(task: &Task, organization_id: i64) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            project_id: task.project_id,
            organization_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id <= 0 || self.project_id <= 0 || self.organization_id <= 0 {
            bail!("task reference {} has an invalid id", self.id);
        }
        if self.name.trim().is_empty() {
            bail!("task reference {} has no name", self.id);
        }
        Ok(())
    }
}

/// Snapshot pushed to every surface. The engine is its only writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub status: TimerStatus,
    pub elapsed_time: u64,
    pub display: String,
    pub task: Option<TaskRef>,
    /// High-water mark: seconds of this session already stored as time entries.
    pub last_saved_elapsed: u64,
    /// Changes whenever a new session starts, so stale saved-marks can be told apart.
    pub session: u64,
    pub updated_at: DateTime<Utc>,
}

impl TimerState {
    pub fn unsaved(&self) -> u64 {
        self.elapsed_time.saturating_sub(self.last_saved_elapsed)
    }
}

/// First half of the flush protocol: a range of the session handed to one caller for storing.
/// Ranges handed out while another one is in flight never overlap it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unsaved {
    pub session: u64,
    pub task: Option<TaskRef>,
    pub saved_through: u64,
    pub elapsed: u64,
    /// Present when there is something to store. Passed back with the saved mark, or with
    /// `saved_through` to give the range back after a failed store.
    #[serde(default)]
    pub lease: Option<u64>,
}

impl Unsaved {
    pub fn seconds(&self) -> u64 {
        self.elapsed.saturating_sub(self.saved_through)
    }
}

/// On-disk form of the timer. `startTimeRef` is deliberately absent, a monotonic instant means
/// nothing to the next process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerCheckpoint {
    pub status: TimerStatus,
    pub elapsed_time: u64,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub task: Option<TaskRef>,
    /// Missing only in checkpoints written before the field existed.
    #[serde(default)]
    pub last_saved_elapsed: Option<u64>,
    #[serde(default)]
    pub session: Option<u64>,
}
