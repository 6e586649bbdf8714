use std::fmt::Display;

use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::state::{TaskRef, TimerState, Unsaved};

/// Everything a surface may ask of the engine. Each variant carries exactly the payload its
/// transition needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TimerCommand {
    /// Begins a new session for `task` seeded with the time already stored for it. `None`
    /// discards the session.
    SetTaskContext {
        task: Option<TaskRef>,
        #[serde(default)]
        initial_elapsed: u64,
    },
    Start {
        #[serde(default)]
        task: Option<TaskRef>,
        #[serde(default)]
        force_reset: bool,
    },
    Pause,
    Stop,
    Reset,
}

impl TimerCommand {
    pub fn validate(&self) -> Result<()> {
        match self {
            TimerCommand::SetTaskContext {
                task: Some(task), ..
            }
            | TimerCommand::Start {
                task: Some(task), ..
            } => task.validate(),
            _ => Ok(()),
        }
    }
}

/// Result of a command. `unsaved` is only set by `stop` and `reset`, it is the diff the caller
/// has to store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub state: TimerState,
    #[serde(default)]
    pub unsaved: Option<Unsaved>,
}

/// Remote-control instruction relayed from a secondary surface to the primary one, which then
/// performs the command including its flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCommand {
    Start,
    Pause,
    Stop,
}

impl Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteCommand::Start => write!(f, "start"),
            RemoteCommand::Pause => write!(f, "pause"),
            RemoteCommand::Stop => write!(f, "stop"),
        }
    }
}
