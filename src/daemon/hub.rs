use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    selection::SelectionStore,
    storage::store::PersistenceService,
    timer::{command::RemoteCommand, service::TimerHandle, state::TimerState},
};

/// Values a surface may have queued before it counts as stalled.
pub const SURFACE_QUEUE: usize = 64;

/// Observer registry fanning one value out to every live surface. Broadcasting never waits:
/// surfaces that went away or stopped draining their queue are dropped instead.
pub struct SurfaceRegistry<T> {
    inner: Arc<Mutex<Surfaces<T>>>,
}

struct Surfaces<T> {
    next_id: u64,
    capacity: usize,
    senders: BTreeMap<u64, mpsc::Sender<T>>,
}

impl<T> Clone for SurfaceRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for SurfaceRegistry<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SurfaceRegistry<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(SURFACE_QUEUE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Surfaces {
                next_id: 0,
                capacity: capacity.max(1),
                senders: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> (Subscription, mpsc::Receiver<T>) {
        let (id, receiver) = {
            let mut surfaces = lock(&self.inner);
            let (sender, receiver) = mpsc::channel(surfaces.capacity);
            let id = surfaces.next_id;
            surfaces.next_id += 1;
            surfaces.senders.insert(id, sender);
            (id, receiver)
        };
        debug!("Surface {id} subscribed");

        let registry = Arc::downgrade(&self.inner);
        let subscription = Subscription {
            unsubscribe: Some(Box::new(move || remove(registry, id))),
        };
        (subscription, receiver)
    }

    /// Returns how many surfaces received the value.
    pub fn broadcast(&self, value: &T) -> usize {
        let mut surfaces = lock(&self.inner);
        surfaces
            .senders
            .retain(|id, sender| match sender.try_send(value.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("Surface {id} has {} values queued, dropping it", sender.max_capacity());
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Dropping closed surface {id}");
                    false
                }
            });
        surfaces.senders.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(surfaces: &Mutex<Surfaces<T>>) -> MutexGuard<'_, Surfaces<T>> {
    surfaces.lock().unwrap_or_else(|e| e.into_inner())
}

fn remove<T>(registry: Weak<Mutex<Surfaces<T>>>, id: u64) {
    if let Some(registry) = registry.upgrade() {
        lock(&registry).senders.remove(&id);
        debug!("Surface {id} unsubscribed");
    }
}

/// Handle returned by [SurfaceRegistry::subscribe]. Dropping it unsubscribes.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Everything a connected surface can reach. Cloned into every client task.
#[derive(Clone)]
pub struct Hub {
    pub timer: TimerHandle,
    pub timer_states: SurfaceRegistry<TimerState>,
    pub selection: SelectionStore,
    pub remote_commands: SurfaceRegistry<RemoteCommand>,
    pub store: Arc<dyn PersistenceService>,
    pub shutdown: CancellationToken,
}

impl Hub {
    /// Relays a remote-control command to the surfaces listening for it. Nothing is queued when
    /// no surface listens.
    pub fn send_remote_command(&self, command: RemoteCommand) -> usize {
        let delivered = self.remote_commands.broadcast(&command);
        if delivered == 0 {
            info!("No surface listens for remote commands, dropping {command}");
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::SurfaceRegistry;

    #[tokio::test]
    async fn test_broadcast_reaches_live_surfaces() {
        let registry = SurfaceRegistry::<u32>::new();
        let (_first, mut first_rx) = registry.subscribe();
        let (second, mut second_rx) = registry.subscribe();

        assert_eq!(registry.broadcast(&1), 2);
        second.unsubscribe();
        assert_eq!(registry.broadcast(&2), 1);

        assert_eq!(first_rx.recv().await, Some(1));
        assert_eq!(first_rx.recv().await, Some(2));
        assert_eq!(second_rx.recv().await, Some(1));
        assert_eq!(second_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_surface_is_dropped() {
        let registry = SurfaceRegistry::<u32>::new();
        let (_kept, receiver) = registry.subscribe();
        let (_other, mut other_rx) = registry.subscribe();
        drop(receiver);

        assert_eq!(registry.broadcast(&7), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(other_rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_stalled_surface_is_dropped() {
        let registry = SurfaceRegistry::<u32>::with_capacity(2);
        let (_stalled, mut stalled_rx) = registry.subscribe();
        let (_draining, mut draining_rx) = registry.subscribe();

        for value in 0..3 {
            registry.broadcast(&value);
            assert_eq!(draining_rx.recv().await, Some(value));
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.broadcast(&3), 1);

        // What was queued before the drop still arrives, then the queue ends.
        assert_eq!(stalled_rx.recv().await, Some(0));
        assert_eq!(stalled_rx.recv().await, Some(1));
        assert_eq!(stalled_rx.recv().await, None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = SurfaceRegistry::<u32>::new();
        {
            let _subscription = registry.subscribe();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
