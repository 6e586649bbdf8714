use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{
    checkpoint::{CheckpointWriter, Checkpointer},
    hub::{Subscription, SurfaceRegistry},
    storage::{entities::RecordKind, store::CatalogStore},
};

/// The organization, project and task picked in the surfaces. Always a containment chain: a
/// project is only set together with its organization, a task only together with its project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionState {
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub task_id: Option<i64>,
}

impl SelectionState {
    /// Clears every level whose parent level is empty.
    pub fn sanitized(self) -> Self {
        let organization_id = self.organization_id;
        let project_id = organization_id.and(self.project_id);
        let task_id = project_id.and(self.task_id);
        Self {
            organization_id,
            project_id,
            task_id,
        }
    }

    pub fn apply(self, patch: SelectionPatch) -> Self {
        Self {
            organization_id: patch.organization_id.unwrap_or(self.organization_id),
            project_id: patch.project_id.unwrap_or(self.project_id),
            task_id: patch.task_id.unwrap_or(self.task_id),
        }
    }
}

/// Partial selection update. An absent field keeps the current value, `null` clears it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPatch {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub organization_id: Option<Option<i64>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<Option<i64>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_id: Option<Option<i64>>,
}

impl SelectionPatch {
    pub fn validate(&self) -> Result<()> {
        for id in [self.organization_id, self.project_id, self.task_id]
            .into_iter()
            .flatten()
            .flatten()
        {
            if id <= 0 {
                bail!("selection id {id} is not positive");
            }
        }
        Ok(())
    }
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Shared selection, persisted on every change and pushed to every subscribed surface.
#[derive(Clone)]
pub struct SelectionStore {
    state: Arc<Mutex<SelectionState>>,
    surfaces: SurfaceRegistry<SelectionState>,
    checkpoints: Arc<CheckpointWriter<SelectionState>>,
    catalog: Arc<dyn CatalogStore>,
}

impl SelectionStore {
    pub async fn restore(
        checkpointer: Checkpointer<SelectionState>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        let loaded = checkpointer.load().await.unwrap_or_default();
        let state = sanitize(loaded, catalog.as_ref()).await;
        if state != loaded {
            debug!("Restored selection {loaded:?} narrowed to {state:?}");
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            surfaces: SurfaceRegistry::new(),
            checkpoints: Arc::new(checkpointer.spawn_writer(state)),
            catalog,
        }
    }

    pub async fn get(&self) -> SelectionState {
        *self.state.lock().await
    }

    /// Merges the patch, then clears levels that are empty above them or no longer belong to the
    /// level above. Returns the resulting selection.
    pub async fn update(&self, patch: SelectionPatch) -> SelectionState {
        let mut current = self.state.lock().await;
        let next = sanitize(current.apply(patch), self.catalog.as_ref()).await;
        if next != *current {
            *current = next;
            self.checkpoints.update(next);
            self.surfaces.broadcast(&next);
        }
        next
    }

    pub fn subscribe(&self) -> (Subscription, mpsc::Receiver<SelectionState>) {
        self.surfaces.subscribe()
    }

    pub async fn finish(&self) {
        self.checkpoints.finish().await;
    }
}

async fn sanitize(state: SelectionState, catalog: &dyn CatalogStore) -> SelectionState {
    let mut state = state.sanitized();
    let levels = [
        (RecordKind::Organization, state.organization_id, None),
        (RecordKind::Project, state.project_id, state.organization_id),
        (RecordKind::Task, state.task_id, state.project_id),
    ];

    for (depth, (kind, id, parent_id)) in levels.into_iter().enumerate() {
        let Some(id) = id else {
            break;
        };
        let belongs = match catalog.get_record(kind, id).await {
            Ok(Some(record)) => record.parent_id() == parent_id,
            Ok(None) => false,
            Err(e) => {
                warn!("Couldn't verify selected {kind} {id}, keeping it {e:?}");
                true
            }
        };
        if !belongs {
            debug!("Selected {kind} {id} is gone or moved, clearing it");
            state = truncate(state, depth);
            break;
        }
    }
    state
}

fn truncate(state: SelectionState, depth: usize) -> SelectionState {
    SelectionState {
        organization_id: state.organization_id.filter(|_| depth > 0),
        project_id: state.project_id.filter(|_| depth > 1),
        task_id: None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use chrono::Utc;
    use mockall::predicate::eq;
    use tempfile::tempdir;

    use crate::{
        daemon::{
            checkpoint::Checkpointer,
            storage::{
                entities::{Organization, Project, Record, RecordKind, RecordStatus, Task},
                store::MockCatalogStore,
            },
        },
        utils::logging::TEST_LOGGING,
    };

    use super::{SelectionPatch, SelectionState, SelectionStore};

    fn catalog() -> MockCatalogStore {
        let now = Utc::now();
        let mut catalog = MockCatalogStore::new();
        catalog
            .expect_get_record()
            .returning(move |kind, id| {
                Ok(match (kind, id) {
                    (RecordKind::Organization, 1 | 2) => {
                        Some(Record::Organization(Organization {
                            id,
                            name: format!("org {id}"),
                            status: RecordStatus::Active,
                            created_at: now,
                            updated_at: now,
                        }))
                    }
                    (RecordKind::Project, 10) => Some(Record::Project(Project {
                        id,
                        organization_id: 1,
                        name: "project".into(),
                        description: None,
                        status: RecordStatus::Active,
                        created_at: now,
                        updated_at: now,
                    })),
                    (RecordKind::Task, 100) => Some(Record::Task(Task {
                        id,
                        project_id: 10,
                        name: "task".into(),
                        status: RecordStatus::Active,
                        created_at: now,
                        updated_at: now,
                    })),
                    _ => None,
                })
            });
        catalog
    }

    #[test]
    fn test_presence_sanitizing() {
        let state = SelectionState {
            organization_id: None,
            project_id: Some(5),
            task_id: Some(9),
        };
        assert_eq!(state.sanitized(), SelectionState::default());

        let state = SelectionState {
            organization_id: Some(1),
            project_id: None,
            task_id: Some(9),
        };
        assert_eq!(state.sanitized().task_id, None);
    }

    #[test]
    fn test_patch_distinguishes_null_from_absent() -> Result<()> {
        let patch: SelectionPatch = serde_json::from_str(r#"{"projectId": null, "taskId": 4}"#)?;
        assert_eq!(patch.organization_id, None);
        assert_eq!(patch.project_id, Some(None));
        assert_eq!(patch.task_id, Some(Some(4)));

        let patch: SelectionPatch = serde_json::from_str(r#"{"taskId": -4}"#)?;
        assert!(patch.validate().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_clears_orphans() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let store = SelectionStore::restore(
            Checkpointer::new(dir.path().join("selection.json")),
            Arc::new(catalog()),
        )
        .await;
        let (_subscription, mut updates) = store.subscribe();

        let state = store
            .update(SelectionPatch {
                organization_id: Some(Some(1)),
                project_id: Some(Some(10)),
                task_id: Some(Some(100)),
            })
            .await;
        assert_eq!(state.task_id, Some(100));
        assert_eq!(updates.recv().await, Some(state));

        // Switching organization drops the project that belongs to the previous one.
        let state = store
            .update(SelectionPatch {
                organization_id: Some(Some(2)),
                ..Default::default()
            })
            .await;
        assert_eq!(
            state,
            SelectionState {
                organization_id: Some(2),
                project_id: None,
                task_id: None,
            }
        );

        let state = store
            .update(SelectionPatch {
                organization_id: Some(None),
                project_id: Some(Some(10)),
                ..Default::default()
            })
            .await;
        assert_eq!(state, SelectionState::default());
        store.finish().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_selection_survives_restart() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let path = dir.path().join("selection.json");
        let store = SelectionStore::restore(Checkpointer::new(path.clone()), Arc::new(catalog())).await;
        store
            .update(SelectionPatch {
                organization_id: Some(Some(1)),
                project_id: Some(Some(10)),
                task_id: None,
            })
            .await;
        store.finish().await;

        let store = SelectionStore::restore(Checkpointer::new(path), Arc::new(catalog())).await;
        assert_eq!(store.get().await.project_id, Some(10));
        store.finish().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_failure_keeps_selection() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let mut catalog = MockCatalogStore::new();
        catalog
            .expect_get_record()
            .with(eq(RecordKind::Organization), eq(3))
            .returning(|_, _| Err(anyhow!("store unavailable")));
        let store =
            SelectionStore::restore(Checkpointer::new(dir.path().join("s.json")), Arc::new(catalog))
                .await;

        let state = store
            .update(SelectionPatch {
                organization_id: Some(Some(3)),
                ..Default::default()
            })
            .await;
        assert_eq!(state.organization_id, Some(3));
        store.finish().await;
        Ok(())
    }
}
