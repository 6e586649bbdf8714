use std::{
    collections::{HashMap, HashSet},
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    fs::operations::{read_optional, write_atomic},
    utils::clock::Clock,
};

use super::entities::{
    NewRecord, NewTimeEntry, Organization, Project, Record, RecordKind, RecordPatch, Task,
    TimeEntry, TimeEntryFilter, TimeEntryPatch,
};

const CATALOG_FILE: &str = "catalog.json";
const ENTRIES_FILE: &str = "entries.jsonl";

/// Organizations, projects and tasks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_record(&self, record: NewRecord) -> Result<Record>;

    /// Lists records of `kind`, optionally only those owned by `parent_id`.
    async fn list_records(&self, kind: RecordKind, parent_id: Option<i64>) -> Result<Vec<Record>>;

    async fn get_record(&self, kind: RecordKind, id: i64) -> Result<Option<Record>>;

    async fn update_record(&self, kind: RecordKind, id: i64, patch: RecordPatch)
        -> Result<Record>;

    /// Deletes a record together with everything it owns, time entries included.
    async fn delete_record(&self, kind: RecordKind, id: i64) -> Result<()>;
}

/// Durable time entries plus the aggregate the timer is seeded from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimeEntryStore: Send + Sync {
    async fn create_time_entry(&self, entry: NewTimeEntry) -> Result<TimeEntry>;

    /// Entries matching `filter`, newest first.
    async fn get_time_entries(&self, filter: TimeEntryFilter) -> Result<Vec<TimeEntry>>;

    async fn update_time_entry(&self, id: i64, patch: TimeEntryPatch) -> Result<TimeEntry>;

    async fn delete_time_entry(&self, id: i64) -> Result<()>;

    /// Sum of the durations of every entry of a task, in seconds.
    async fn total_duration_by_task(&self, task_id: i64) -> Result<u64>;
}

/// Full persistence contract. Implemented by [JsonStore] inside the daemon and by the IPC client
/// for surfaces.
pub trait PersistenceService: CatalogStore + TimeEntryStore {}

impl<T: CatalogStore + TimeEntryStore + ?Sized> PersistenceService for T {}

#[async_trait]
impl<T> CatalogStore for T
where
    T: Deref + Send + Sync,
    T::Target: CatalogStore,
{
    async fn create_record(&self, record: NewRecord) -> Result<Record> {
        self.deref().create_record(record).await
    }

    async fn list_records(&self, kind: RecordKind, parent_id: Option<i64>) -> Result<Vec<Record>> {
        self.deref().list_records(kind, parent_id).await
    }

    async fn get_record(&self, kind: RecordKind, id: i64) -> Result<Option<Record>> {
        self.deref().get_record(kind, id).await
    }

    async fn update_record(
        &self,
        kind: RecordKind,
        id: i64,
        patch: RecordPatch,
    ) -> Result<Record> {
        self.deref().update_record(kind, id, patch).await
    }

    async fn delete_record(&self, kind: RecordKind, id: i64) -> Result<()> {
        self.deref().delete_record(kind, id).await
    }
}

#[async_trait]
impl<T> TimeEntryStore for T
where
    T: Deref + Send + Sync,
    T::Target: TimeEntryStore,
{
    async fn create_time_entry(&self, entry: NewTimeEntry) -> Result<TimeEntry> {
        self.deref().create_time_entry(entry).await
    }

    async fn get_time_entries(&self, filter: TimeEntryFilter) -> Result<Vec<TimeEntry>> {
        self.deref().get_time_entries(filter).await
    }

    async fn update_time_entry(&self, id: i64, patch: TimeEntryPatch) -> Result<TimeEntry> {
        self.deref().update_time_entry(id, patch).await
    }

    async fn delete_time_entry(&self, id: i64) -> Result<()> {
        self.deref().delete_time_entry(id).await
    }

    async fn total_duration_by_task(&self, task_id: i64) -> Result<u64> {
        self.deref().total_duration_by_task(task_id).await
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    organizations: Vec<Organization>,
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    tasks: Vec<Task>,
}

impl Catalog {
    fn contains(&self, kind: RecordKind, id: i64) -> bool {
        match kind {
            RecordKind::Organization => self.organizations.iter().any(|v| v.id == id),
            RecordKind::Project => self.projects.iter().any(|v| v.id == id),
            RecordKind::Task => self.tasks.iter().any(|v| v.id == id),
        }
    }

    fn records(&self, kind: RecordKind) -> Vec<Record> {
        match kind {
            RecordKind::Organization => self
                .organizations
                .iter()
                .cloned()
                .map(Record::Organization)
                .collect(),
            RecordKind::Project => self.projects.iter().cloned().map(Record::Project).collect(),
            RecordKind::Task => self.tasks.iter().cloned().map(Record::Task).collect(),
        }
    }

    /// Task id → (project id, organization id), used to answer entry filters.
    fn task_owners(&self) -> HashMap<i64, (i64, Option<i64>)> {
        let project_owner = self
            .projects
            .iter()
            .map(|v| (v.id, v.organization_id))
            .collect::<HashMap<_, _>>();
        self.tasks
            .iter()
            .map(|v| (v.id, (v.project_id, project_owner.get(&v.project_id).copied())))
            .collect()
    }

    /// Removes a record and everything below it. Returns ids of removed tasks.
    fn remove_cascading(&mut self, kind: RecordKind, id: i64) -> HashSet<i64> {
        let projects: HashSet<i64> = match kind {
            RecordKind::Organization => self
                .projects
                .iter()
                .filter(|v| v.organization_id == id)
                .map(|v| v.id)
                .collect(),
            RecordKind::Project => HashSet::from([id]),
            RecordKind::Task => HashSet::new(),
        };
        let tasks: HashSet<i64> = match kind {
            RecordKind::Task => HashSet::from([id]),
            _ => self
                .tasks
                .iter()
                .filter(|v| projects.contains(&v.project_id))
                .map(|v| v.id)
                .collect(),
        };

        if kind == RecordKind::Organization {
            self.organizations.retain(|v| v.id != id);
        }
        self.projects.retain(|v| !projects.contains(&v.id));
        self.tasks.retain(|v| !tasks.contains(&v.id));
        tasks
    }
}

struct StoreInner {
    catalog: Catalog,
    entries: Vec<TimeEntry>,
}

/// The main realization of [PersistenceService].
pub struct JsonStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
}

impl JsonStore {
    /// Opens (or creates) a store in `dir`. A damaged tail of the entries file, which is what a
    /// crash in the middle of an append leaves behind, is dropped and the file is compacted.
    pub async fn open(dir: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let catalog_path = dir.join(CATALOG_FILE);
        let catalog = match read_optional(&catalog_path).await? {
            Some(bytes) => serde_json::from_slice::<Catalog>(&bytes)
                .with_context(|| format!("Catalog {catalog_path:?} is not valid"))?,
            None => Catalog::default(),
        };

        let entries_path = dir.join(ENTRIES_FILE);
        let (entries, needs_compaction) = read_entries(&entries_path).await?;
        if needs_compaction {
            warn!("Compacting {entries_path:?} after dropping damaged lines");
            write_atomic(&entries_path, &encode_entries(&entries)?).await?;
        }

        info!(
            "Opened store with {} organizations, {} projects, {} tasks and {} entries",
            catalog.organizations.len(),
            catalog.projects.len(),
            catalog.tasks.len(),
            entries.len()
        );

        Ok(Self {
            dir,
            inner: Mutex::new(StoreInner { catalog, entries }),
            clock,
        })
    }

    async fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(catalog)?;
        write_atomic(&self.dir.join(CATALOG_FILE), &bytes).await?;
        Ok(())
    }

    async fn rewrite_entries(&self, entries: &[TimeEntry]) -> Result<()> {
        write_atomic(&self.dir.join(ENTRIES_FILE), &encode_entries(entries)?).await?;
        Ok(())
    }

    async fn append_entry(&self, entry: &TimeEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = File::options()
            .create(true)
            .append(true)
            .open(self.dir.join(ENTRIES_FILE))
            .await?;

        // Semi-safe acquire-release for a file
        file.lock_exclusive()?;
        let result = async {
            file.write_all(&line).await?;
            file.sync_data().await
        }
        .await;
        file.unlock_async().await?;
        result?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for JsonStore {
    async fn create_record(&self, record: NewRecord) -> Result<Record> {
        let mut inner = self.inner.lock().await;
        let mut catalog = inner.catalog.clone();
        let now = self.clock.time();

        let created = match record {
            NewRecord::Organization { name } => {
                let organization = Organization {
                    id: next_id(catalog.organizations.iter().map(|v| v.id)),
                    name: clean_name(name)?,
                    status: Default::default(),
                    created_at: now,
                    updated_at: now,
                };
                catalog.organizations.push(organization.clone());
                Record::Organization(organization)
            }
            NewRecord::Project {
                organization_id,
                name,
                description,
            } => {
                if !catalog.contains(RecordKind::Organization, organization_id) {
                    bail!("organization {organization_id} not found");
                }
                let project = Project {
                    id: next_id(catalog.projects.iter().map(|v| v.id)),
                    organization_id,
                    name: clean_name(name)?,
                    description,
                    status: Default::default(),
                    created_at: now,
                    updated_at: now,
                };
                catalog.projects.push(project.clone());
                Record::Project(project)
            }
            NewRecord::Task { project_id, name } => {
                if !catalog.contains(RecordKind::Project, project_id) {
                    bail!("project {project_id} not found");
                }
                let task = Task {
                    id: next_id(catalog.tasks.iter().map(|v| v.id)),
                    project_id,
                    name: clean_name(name)?,
                    status: Default::default(),
                    created_at: now,
                    updated_at: now,
                };
                catalog.tasks.push(task.clone());
                Record::Task(task)
            }
        };

        self.save_catalog(&catalog).await?;
        inner.catalog = catalog;
        debug!("Created {} {}", created.kind(), created.id());
        Ok(created)
    }

    async fn list_records(&self, kind: RecordKind, parent_id: Option<i64>) -> Result<Vec<Record>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .catalog
            .records(kind)
            .into_iter()
            .filter(|v| parent_id.is_none() || v.parent_id() == parent_id)
            .collect())
    }

    async fn get_record(&self, kind: RecordKind, id: i64) -> Result<Option<Record>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .catalog
            .records(kind)
            .into_iter()
            .find(|v| v.id() == id))
    }

    async fn update_record(
        &self,
        kind: RecordKind,
        id: i64,
        patch: RecordPatch,
    ) -> Result<Record> {
        let mut inner = self.inner.lock().await;
        let mut catalog = inner.catalog.clone();
        let now = self.clock.time();
        let name = patch.name.map(clean_name).transpose()?;

        let updated = match kind {
            RecordKind::Organization => {
                let v = catalog
                    .organizations
                    .iter_mut()
                    .find(|v| v.id == id)
                    .ok_or_else(|| anyhow!("{kind} {id} not found"))?;
                if let Some(name) = name {
                    v.name = name;
                }
                v.status = patch.status.unwrap_or(v.status);
                v.updated_at = now;
                Record::Organization(v.clone())
            }
            RecordKind::Project => {
                let v = catalog
                    .projects
                    .iter_mut()
                    .find(|v| v.id == id)
                    .ok_or_else(|| anyhow!("{kind} {id} not found"))?;
                if let Some(name) = name {
                    v.name = name;
                }
                v.status = patch.status.unwrap_or(v.status);
                if patch.description.is_some() {
                    v.description = patch.description;
                }
                v.updated_at = now;
                Record::Project(v.clone())
            }
            RecordKind::Task => {
                let v = catalog
                    .tasks
                    .iter_mut()
                    .find(|v| v.id == id)
                    .ok_or_else(|| anyhow!("{kind} {id} not found"))?;
                if let Some(name) = name {
                    v.name = name;
                }
                v.status = patch.status.unwrap_or(v.status);
                v.updated_at = now;
                Record::Task(v.clone())
            }
        };

        self.save_catalog(&catalog).await?;
        inner.catalog = catalog;
        Ok(updated)
    }

    async fn delete_record(&self, kind: RecordKind, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.catalog.contains(kind, id) {
            bail!("{kind} {id} not found");
        }

        let mut catalog = inner.catalog.clone();
        let removed_tasks = catalog.remove_cascading(kind, id);

        // Entries go first: a crash in between leaves tasks without history rather than history
        // without tasks.
        if inner
            .entries
            .iter()
            .any(|v| removed_tasks.contains(&v.task_id))
        {
            let entries = inner
                .entries
                .iter()
                .filter(|v| !removed_tasks.contains(&v.task_id))
                .cloned()
                .collect::<Vec<_>>();
            self.rewrite_entries(&entries).await?;
            inner.entries = entries;
        }

        self.save_catalog(&catalog).await?;
        inner.catalog = catalog;
        info!(
            "Deleted {kind} {id} together with {} tasks",
            removed_tasks.len()
        );
        Ok(())
    }
}

#[async_trait]
impl TimeEntryStore for JsonStore {
    async fn create_time_entry(&self, entry: NewTimeEntry) -> Result<TimeEntry> {
        let mut inner = self.inner.lock().await;
        if !inner.catalog.contains(RecordKind::Task, entry.task_id) {
            bail!("task {} not found", entry.task_id);
        }
        if entry.duration == 0 {
            bail!("time entry for task {} has no duration", entry.task_id);
        }

        let created = TimeEntry {
            id: next_id(inner.entries.iter().map(|v| v.id)),
            task_id: entry.task_id,
            duration: entry.duration,
            timestamp: entry.timestamp,
            notes: entry.notes,
        };
        self.append_entry(&created).await?;
        inner.entries.push(created.clone());
        debug!(
            "Stored entry {} of {}s for task {}",
            created.id, created.duration, created.task_id
        );
        Ok(created)
    }

    async fn get_time_entries(&self, filter: TimeEntryFilter) -> Result<Vec<TimeEntry>> {
        let inner = self.inner.lock().await;
        let owners = inner.catalog.task_owners();

        let mut entries = inner
            .entries
            .iter()
            .filter(|entry| {
                let (project_id, organization_id) = owners
                    .get(&entry.task_id)
                    .copied()
                    .map_or((None, None), |(p, o)| (Some(p), o));
                filter.task_id.map_or(true, |v| v == entry.task_id)
                    && filter.project_id.map_or(true, |v| Some(v) == project_id)
                    && filter
                        .organization_id
                        .map_or(true, |v| Some(v) == organization_id)
            })
            .cloned()
            .collect::<Vec<_>>();

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn update_time_entry(&self, id: i64, patch: TimeEntryPatch) -> Result<TimeEntry> {
        let mut inner = self.inner.lock().await;
        let mut entries = inner.entries.clone();
        let entry = entries
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| anyhow!("time entry {id} not found"))?;

        if let Some(duration) = patch.duration {
            if duration == 0 {
                bail!("time entry {id} can't have an empty duration");
            }
            entry.duration = duration;
        }
        if let Some(timestamp) = patch.timestamp {
            entry.timestamp = timestamp;
        }
        if patch.notes.is_some() {
            entry.notes = patch.notes;
        }
        let updated = entry.clone();

        self.rewrite_entries(&entries).await?;
        inner.entries = entries;
        Ok(updated)
    }

    async fn delete_time_entry(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.entries.iter().any(|v| v.id == id) {
            bail!("time entry {id} not found");
        }
        let entries = inner
            .entries
            .iter()
            .filter(|v| v.id != id)
            .cloned()
            .collect::<Vec<_>>();
        self.rewrite_entries(&entries).await?;
        inner.entries = entries;
        Ok(())
    }

    async fn total_duration_by_task(&self, task_id: i64) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|v| v.task_id == task_id)
            .map(|v| v.duration)
            .sum())
    }
}

/// Reads every entry that parses. The second value tells whether the file has to be rewritten:
/// either a line was damaged or the last line lacks its terminator, which would make the next
/// append glue two objects together.
async fn read_entries(path: &Path) -> Result<(Vec<TimeEntry>, bool)> {
    let Some(bytes) = read_optional(path).await? else {
        return Ok((vec![], false));
    };

    let text = String::from_utf8_lossy(&bytes);
    let mut entries = vec![];
    let mut damaged = !bytes.is_empty() && !bytes.ends_with(b"\n");
    for line in text.lines().filter(|v| !v.trim().is_empty()) {
        match serde_json::from_str::<TimeEntry>(line) {
            Ok(v) => entries.push(v),
            Err(e) => {
                // Might happen due to shutdown cutting of the write into a file.
                warn!(
                    "During parsing in path {:?} found illegal json string {}: {e}",
                    path, line
                );
                damaged = true;
            }
        }
    }
    Ok((entries, damaged))
}

fn encode_entries(entries: &[TimeEntry]) -> Result<Vec<u8>> {
    let mut buffer = Vec::<u8>::new();
    for entry in entries {
        serde_json::to_writer(&mut buffer, entry)?;
        buffer.push(b'\n');
    }
    Ok(buffer)
}

fn next_id(ids: impl Iterator<Item = i64>) -> i64 {
    ids.max().unwrap_or(0) + 1
}

fn clean_name(name: String) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!("name can't be empty");
    }
    Ok(trimmed.to_string())
}
