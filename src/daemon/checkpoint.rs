//! Crash-safety snapshots. Each snapshot is a single JSON document replaced atomically, so a
//! crash mid-write leaves the previous snapshot intact.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::fs::operations::{read_optional, write_atomic};

pub const TIMER_CHECKPOINT_FILE: &str = "timer.json";
pub const SELECTION_CHECKPOINT_FILE: &str = "selection.json";

pub struct Checkpointer<T> {
    path: PathBuf,
    _value: PhantomData<fn() -> T>,
}

impl<T> Checkpointer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best effort. Failures are logged and reported through the return value, never raised.
    pub async fn save(&self, value: &T) -> bool {
        let data = match serde_json::to_vec_pretty(value) {
            Ok(data) => data,
            Err(e) => {
                error!("Couldn't encode checkpoint {:?} {e:?}", self.path);
                return false;
            }
        };
        match write_atomic(&self.path, &data).await {
            Ok(()) => true,
            Err(e) => {
                error!("Couldn't write checkpoint {:?} {e:?}", self.path);
                false
            }
        }
    }

    /// A missing or unreadable snapshot yields `None`, the caller starts from its defaults.
    pub async fn load(&self) -> Option<T> {
        let data = match read_optional(&self.path).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("No checkpoint at {:?}", self.path);
                return None;
            }
            Err(e) => {
                warn!("Couldn't read checkpoint {:?} {e:?}", self.path);
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring damaged checkpoint {:?} {e:?}", self.path);
                None
            }
        }
    }

    /// Moves writes onto a background task. Updates that arrive while a write is in flight are
    /// coalesced, only the newest value reaches the disk.
    pub fn spawn_writer(self, initial: T) -> CheckpointWriter<T> {
        let (sender, receiver) = watch::channel(initial);
        let stop = CancellationToken::new();
        let task = tokio::spawn(write_changes(self, receiver, stop.clone()));
        CheckpointWriter {
            sender,
            stop,
            task: Mutex::new(Some(task)),
        }
    }
}

async fn write_changes<T>(
    checkpointer: Checkpointer<T>,
    mut receiver: watch::Receiver<T>,
    stop: CancellationToken,
) -> Checkpointer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    // The initial value is written too, that also upgrades snapshots from older versions.
    let value = receiver.borrow_and_update().clone();
    checkpointer.save(&value).await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = receiver.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = receiver.borrow_and_update().clone();
                checkpointer.save(&value).await;
            }
        }
    }
    checkpointer
}

pub struct CheckpointWriter<T> {
    sender: watch::Sender<T>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<Checkpointer<T>>>>,
}

impl<T> CheckpointWriter<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn update(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Stops the background task and writes the newest value synchronously. Later updates are not
    /// persisted.
    pub async fn finish(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(task) = task else {
            return;
        };
        self.stop.cancel();
        match task.await {
            Ok(checkpointer) => {
                let value = self.sender.borrow().clone();
                checkpointer.save(&value).await;
            }
            Err(e) => error!("Checkpoint writer failed {e:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use crate::utils::logging::TEST_LOGGING;

    use super::Checkpointer;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[tokio::test]
    async fn test_missing_and_damaged_snapshots() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let checkpointer = Checkpointer::<Counter>::new(dir.path().join("counter.json"));
        assert_eq!(checkpointer.load().await, None);

        tokio::fs::write(checkpointer.path(), b"{\"value\": ").await?;
        assert_eq!(checkpointer.load().await, None);

        assert!(checkpointer.save(&Counter { value: 3 }).await);
        assert_eq!(checkpointer.load().await, Some(Counter { value: 3 }));
        Ok(())
    }

    #[tokio::test]
    async fn test_writer_keeps_newest_value() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let path = dir.path().join("counter.json");
        let writer = Checkpointer::<Counter>::new(path.clone()).spawn_writer(Counter { value: 0 });
        for value in 1..=50 {
            writer.update(Counter { value });
        }
        writer.finish().await;
        // Idempotent.
        writer.finish().await;

        let loaded = Checkpointer::<Counter>::new(path).load().await;
        assert_eq!(loaded, Some(Counter { value: 50 }));
        Ok(())
    }
}
