//! Notification fan-in
//!
//! Keeps at most one reassembler per endpoint and multiplexes every
//! reassembled message onto one shared broadcast stream. Messages are not
//! tagged with their source endpoint: responses identify themselves by
//! content, so consumers filter on payload bytes.

use crate::config::LinkConfig;
use crate::error::{GattError, TransportError};
use crate::framing::{FrameReassembler, FramingPolicy};
use crate::transport::{Endpoint, Transport, subscribe_with_retry};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of [`NotificationRouter::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyActive,
}

impl fmt::Display for StartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartStatus::Started => write!(f, "notifier started"),
            StartStatus::AlreadyActive => write!(f, "notifier already active"),
        }
    }
}

/// A pending slot reserves the endpoint while notifications are being
/// enabled, so the map lock is never held across the retry loop.
enum Slot {
    Pending,
    Running(JoinHandle<()>),
}

impl Slot {
    fn is_running(&self) -> bool {
        matches!(self, Slot::Running(task) if !task.is_finished())
    }

    fn is_live(&self) -> bool {
        matches!(self, Slot::Pending) || self.is_running()
    }

    fn abort(self) {
        if let Slot::Running(task) = self {
            task.abort();
        }
    }
}

type Listeners = Arc<Mutex<HashMap<Endpoint, Slot>>>;

fn lock(listeners: &Listeners) -> MutexGuard<'_, HashMap<Endpoint, Slot>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases a pending slot if `start` fails or is cancelled before the
/// listener is installed.
struct Reservation<'a> {
    listeners: &'a Listeners,
    endpoint: Option<Endpoint>,
}

impl Reservation<'_> {
    /// Install `task` in the reserved slot. Returns `false` (and aborts the
    /// task) when the slot was cleared by a disconnect in the meantime.
    fn fill(mut self, task: JoinHandle<()>) -> bool {
        let Some(endpoint) = self.endpoint.take() else {
            return false;
        };
        let mut listeners = lock(self.listeners);
        match listeners.get_mut(&endpoint) {
            Some(slot) if matches!(slot, Slot::Pending) => {
                *slot = Slot::Running(task);
                true
            }
            _ => {
                task.abort();
                false
            }
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            let mut listeners = lock(self.listeners);
            if matches!(listeners.get(&endpoint), Some(Slot::Pending)) {
                listeners.remove(&endpoint);
            }
        }
    }
}

pub struct NotificationRouter {
    transport: Arc<dyn Transport>,
    listeners: Listeners,
    messages: broadcast::Sender<Bytes>,
    retry_attempts: u32,
    retry_delay: Duration,
    disconnect_watcher: JoinHandle<()>,
}

impl NotificationRouter {
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: &LinkConfig) -> Self {
        let (messages, _) = broadcast::channel(config.notification_capacity.max(1));
        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let disconnect_watcher = spawn_disconnect_watcher(transport.as_ref(), Arc::clone(&listeners));
        Self {
            transport,
            listeners,
            messages,
            retry_attempts: config.notify_retry_attempts,
            retry_delay: config.notify_retry_delay(),
            disconnect_watcher,
        }
    }

    /// Start reassembling notifications from `endpoint`. A second start for an
    /// endpoint that is still listening, or still starting, is a no-op.
    pub async fn start(&self, endpoint: Endpoint, policy: FramingPolicy) -> Result<StartStatus, GattError> {
        {
            let mut listeners = lock(&self.listeners);
            if listeners.get(&endpoint).is_some_and(Slot::is_live) {
                info!(%endpoint, "Notifier already active");
                return Ok(StartStatus::AlreadyActive);
            }
            listeners.insert(endpoint.clone(), Slot::Pending);
        }
        let reservation = Reservation {
            listeners: &self.listeners,
            endpoint: Some(endpoint.clone()),
        };

        let reassembler = FrameReassembler::new(policy)?;
        let stream =
            subscribe_with_retry(self.transport.as_ref(), &endpoint, self.retry_attempts, self.retry_delay).await?;

        let messages = self.messages.clone();
        let source = endpoint.clone();
        let task = tokio::spawn(async move {
            reassembler
                .drive(stream, |message| {
                    // No receivers is fine: nobody is waiting for this message
                    let _ = messages.send(message);
                })
                .await;
            debug!(endpoint = %source, "Notification stream ended");
        });

        if !reservation.fill(task) {
            warn!(%endpoint, "Device disconnected while enabling notifications");
            return Err(TransportError::Disconnected.into());
        }
        info!(%endpoint, "Notifier started");
        Ok(StartStatus::Started)
    }

    /// Stop listening on `endpoint`. Returns `false` when nothing was running.
    /// A start still enabling notifications is left alone.
    pub async fn stop(&self, endpoint: &Endpoint) -> bool {
        let mut listeners = lock(&self.listeners);
        if !matches!(listeners.get(endpoint), Some(Slot::Running(_))) {
            return false;
        }
        if let Some(slot) = listeners.remove(endpoint) {
            slot.abort();
        }
        info!(%endpoint, "Notifier stopped");
        true
    }

    pub async fn stop_all(&self) {
        let mut listeners = lock(&self.listeners);
        let running: Vec<Endpoint> = listeners
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        for endpoint in running {
            if let Some(slot) = listeners.remove(&endpoint) {
                slot.abort();
                debug!(%endpoint, "Notifier stopped");
            }
        }
    }

    pub async fn is_active(&self, endpoint: &Endpoint) -> bool {
        lock(&self.listeners).get(endpoint).is_some_and(Slot::is_running)
    }

    pub async fn active_endpoints(&self) -> Vec<Endpoint> {
        lock(&self.listeners)
            .iter()
            .filter(|(_, slot)| slot.is_running())
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    /// A new independent view of the shared message stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.messages.subscribe()
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<Bytes> {
        self.messages.clone()
    }
}

impl Drop for NotificationRouter {
    fn drop(&mut self) {
        self.disconnect_watcher.abort();
        for (_, slot) in lock(&self.listeners).drain() {
            slot.abort();
        }
    }
}

/// Tear every listener down when the device goes away.
fn spawn_disconnect_watcher(transport: &dyn Transport, listeners: Listeners) -> JoinHandle<()> {
    let mut events = transport.on_disconnect();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(device) => {
                    let mut slots = lock(&listeners);
                    info!(id = %device.id, count = slots.len(), "Device disconnected, stopping notifiers");
                    for (_, slot) in slots.drain() {
                        slot.abort();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
