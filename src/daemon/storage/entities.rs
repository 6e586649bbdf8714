use std::fmt::Display;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// The three levels of the catalog. Every organization owns projects, every project owns tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Organization,
    Project,
    Task,
}

impl RecordKind {
    /// Kind of the record that owns records of this kind.
    pub fn parent(self) -> Option<RecordKind> {
        match self {
            RecordKind::Organization => None,
            RecordKind::Project => Some(RecordKind::Organization),
            RecordKind::Task => Some(RecordKind::Project),
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Organization => write!(f, "organization"),
            RecordKind::Project => write!(f, "project"),
            RecordKind::Task => write!(f, "task"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Active,
    OnHold,
    Completed,
    Archived,
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Active => write!(f, "active"),
            RecordStatus::OnHold => write!(f, "on_hold"),
            RecordStatus::Completed => write!(f, "completed"),
            RecordStatus::Archived => write!(f, "archived"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A block of tracked time. `duration` is in whole seconds, `timestamp` is the moment the block
/// was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: i64,
    pub task_id: i64,
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Any catalog record, tagged with its kind on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Organization(Organization),
    Project(Project),
    Task(Task),
}

impl Record {
    pub fn id(&self) -> i64 {
        match self {
            Record::Organization(v) => v.id,
            Record::Project(v) => v.id,
            Record::Task(v) => v.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Organization(_) => RecordKind::Organization,
            Record::Project(_) => RecordKind::Project,
            Record::Task(_) => RecordKind::Task,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Record::Organization(v) => &v.name,
            Record::Project(v) => &v.name,
            Record::Task(v) => &v.name,
        }
    }

    pub fn status(&self) -> RecordStatus {
        match self {
            Record::Organization(v) => v.status,
            Record::Project(v) => v.status,
            Record::Task(v) => v.status,
        }
    }

    /// Id of the owning record, `None` for organizations.
    pub fn parent_id(&self) -> Option<i64> {
        match self {
            Record::Organization(_) => None,
            Record::Project(v) => Some(v.organization_id),
            Record::Task(v) => Some(v.project_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NewRecord {
    Organization {
        name: String,
    },
    Project {
        organization_id: i64,
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    Task {
        project_id: i64,
        name: String,
    },
}

impl NewRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            NewRecord::Organization { .. } => RecordKind::Organization,
            NewRecord::Project { .. } => RecordKind::Project,
            NewRecord::Task { .. } => RecordKind::Task,
        }
    }
}

/// Partial update of a catalog record. `description` is ignored for anything but projects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTimeEntry {
    pub task_id: i64,
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntryPatch {
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Narrows a time entry listing. Every id that is set has to match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntryFilter {
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub task_id: Option<i64>,
}
