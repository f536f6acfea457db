//! Per-monitor fan-out of upstream heartbeats
//!
//! Every streaming session registers one listener for its monitor. A listener
//! is a bounded queue; the dispatch pump drains the shared upstream receiver
//! and pushes each heartbeat only into the queues of its monitor. A slow
//! viewer loses events rather than stalling the pump or other viewers.

use kuma_relay_protocol::{ConnectionState, HeartbeatEvent, MonitorId};
use kuma_relay_upstream::Upstream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default capacity of a listener queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Registry of heartbeat listeners keyed by monitor
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    upstream: Arc<dyn Upstream>,
    queue_capacity: usize,
    listeners: Mutex<HashMap<MonitorId, Vec<Listener>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

struct Listener {
    id: Uuid,
    tx: mpsc::Sender<HeartbeatEvent>,
}

impl SubscriptionRegistry {
    /// Create the registry and start draining upstream events into it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(upstream: Arc<dyn Upstream>, queue_capacity: usize) -> Self {
        let inner = Arc::new(RegistryInner {
            upstream,
            queue_capacity: queue_capacity.max(1),
            listeners: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        });

        let events = inner.upstream.events();
        let handle = tokio::spawn(run_pump(Arc::downgrade(&inner), events));
        *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Self { inner }
    }

    /// Register a listener for one monitor.
    ///
    /// Starts the upstream connection in the background when it is down.
    pub fn subscribe(
        &self,
        monitor_id: MonitorId,
    ) -> (SubscriptionHandle, mpsc::Receiver<HeartbeatEvent>) {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let listener_id = Uuid::new_v4();

        {
            let mut listeners = self.inner.lock();
            listeners
                .entry(monitor_id)
                .or_default()
                .push(Listener { id: listener_id, tx });
        }
        debug!(%monitor_id, %listener_id, "Listener registered");

        if self.inner.upstream.status().state == ConnectionState::Disconnected {
            let upstream = self.inner.upstream.clone();
            tokio::spawn(async move {
                if let Err(e) = upstream.connect().await {
                    warn!(error = %e, "Background upstream connect failed");
                }
            });
        }

        let handle = SubscriptionHandle {
            registry: Arc::downgrade(&self.inner),
            monitor_id,
            listener_id,
            released: AtomicBool::new(false),
        };
        (handle, rx)
    }

    /// Deliver an event to every listener of its monitor, in registration order.
    ///
    /// Returns how many listeners accepted it.
    pub fn dispatch(&self, event: &HeartbeatEvent) -> usize {
        self.inner.dispatch(event)
    }

    /// Number of monitors with at least one listener
    pub fn monitor_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Listeners currently registered for one monitor
    pub fn listener_count(&self, monitor_id: MonitorId) -> usize {
        self.inner.lock().get(&monitor_id).map_or(0, Vec::len)
    }

    /// Listeners across all monitors
    pub fn total_listeners(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }

    /// Drop every listener; their sessions observe a closed subscription
    pub fn close_all(&self) {
        let removed = {
            let mut listeners = self.inner.lock();
            let count = listeners.values().map(Vec::len).sum::<usize>();
            listeners.clear();
            count
        };
        if removed > 0 {
            info!(listeners = removed, "Closed all heartbeat listeners");
        }
    }
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<MonitorId, Vec<Listener>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, event: &HeartbeatEvent) -> usize {
        let monitor_id = event.monitor_id;
        let mut listeners = self.lock();
        let Some(entry) = listeners.get_mut(&monitor_id) else {
            return 0;
        };

        let mut delivered = 0;
        entry.retain(|listener| match listener.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(%monitor_id, listener_id = %listener.id, "Listener queue full, dropping heartbeat");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%monitor_id, listener_id = %listener.id, "Listener gone, removing");
                false
            }
        });

        if entry.is_empty() {
            listeners.remove(&monitor_id);
        }
        delivered
    }

    fn remove(&self, monitor_id: MonitorId, listener_id: Uuid) -> bool {
        let mut listeners = self.lock();
        let Some(entry) = listeners.get_mut(&monitor_id) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|listener| listener.id != listener_id);
        let removed = entry.len() != before;

        if entry.is_empty() {
            listeners.remove(&monitor_id);
        }
        removed
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

async fn run_pump(
    registry: Weak<RegistryInner>,
    mut events: tokio::sync::broadcast::Receiver<HeartbeatEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.dispatch(&event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Dispatch pump lagged behind upstream, heartbeats skipped");
            }
            Err(RecvError::Closed) => {
                error!("Upstream event channel closed, dispatch pump stopping");
                break;
            }
        }
    }
}

/// Registration of one listener; releasing it removes exactly that listener
pub struct SubscriptionHandle {
    registry: Weak<RegistryInner>,
    monitor_id: MonitorId,
    listener_id: Uuid,
    released: AtomicBool,
}

impl SubscriptionHandle {
    /// Monitor this listener receives heartbeats for
    pub fn monitor_id(&self) -> MonitorId {
        self.monitor_id
    }

    /// Unique id of this listener within the registry
    pub fn listener_id(&self) -> Uuid {
        self.listener_id
    }

    /// Remove the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.monitor_id, self.listener_id) {
                debug!(monitor_id = %self.monitor_id, listener_id = %self.listener_id, "Listener unsubscribed");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("monitor_id", &self.monitor_id)
            .field("listener_id", &self.listener_id)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}
