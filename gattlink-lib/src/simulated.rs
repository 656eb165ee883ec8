//! In-process transport
//!
//! Simulates a single BLE central talking to advertised peripherals entirely
//! in memory. Tests (and the CLI demo) play the peripheral side: they seed
//! readable values, push notification chunks and watch the write tap.

use crate::constants::MAX_WRITE_CHUNK;
use crate::error::TransportError;
use crate::transport::{ConnectOptions, DeviceHandle, Endpoint, NotificationStream, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, info};

const NOTIFICATION_QUEUE: usize = 64;
const WRITE_TAP_CAPACITY: usize = 256;

struct SimState {
    advertised: Mutex<Vec<DeviceHandle>>,
    device_tx: watch::Sender<Option<DeviceHandle>>,
    disconnect_tx: broadcast::Sender<DeviceHandle>,
    subscribers: Mutex<HashMap<Endpoint, Vec<mpsc::Sender<Bytes>>>>,
    values: Mutex<HashMap<Endpoint, Bytes>>,
    write_tap: broadcast::Sender<(Endpoint, Bytes)>,
    subscribe_failures: AtomicU32,
    write_failures: AtomicU32,
    subscribe_calls: AtomicU32,
}

/// Cheap to clone; clones share the same simulated link.
#[derive(Clone)]
pub struct SimTransport {
    inner: Arc<SimState>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        let (device_tx, _) = watch::channel(None);
        let (disconnect_tx, _) = broadcast::channel(16);
        let (write_tap, _) = broadcast::channel(WRITE_TAP_CAPACITY);
        Self {
            inner: Arc::new(SimState {
                advertised: Mutex::new(Vec::new()),
                device_tx,
                disconnect_tx,
                subscribers: Mutex::new(HashMap::new()),
                values: Mutex::new(HashMap::new()),
                write_tap,
                subscribe_failures: AtomicU32::new(0),
                write_failures: AtomicU32::new(0),
                subscribe_calls: AtomicU32::new(0),
            }),
        }
    }

    /// A transport with one advertised device named `name`.
    pub async fn with_device(name: &str) -> Self {
        let transport = Self::new();
        transport
            .advertise(DeviceHandle {
                id: format!("sim-{name}"),
                name: Some(name.to_string()),
            })
            .await;
        transport
    }

    pub async fn advertise(&self, device: DeviceHandle) {
        self.inner.advertised.lock().await.push(device);
    }

    pub async fn set_value(&self, endpoint: &Endpoint, value: impl Into<Bytes>) {
        self.inner.values.lock().await.insert(endpoint.clone(), value.into());
    }

    /// Deliver one raw chunk to every live subscriber of `endpoint`.
    /// Returns the number of subscribers reached.
    pub async fn notify(&self, endpoint: &Endpoint, chunk: impl Into<Bytes>) -> usize {
        let chunk = chunk.into();
        // Send without the map lock so a full queue cannot block disconnect
        let senders = match self.inner.subscribers.lock().await.get(endpoint) {
            Some(senders) => senders.clone(),
            None => return 0,
        };
        let mut delivered = 0;
        for sender in &senders {
            if sender.send(chunk.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        if let Some(senders) = self.inner.subscribers.lock().await.get_mut(endpoint) {
            senders.retain(|sender| !sender.is_closed());
        }
        delivered
    }

    /// Split `message` into `chunk_size` pieces and notify them in order.
    pub async fn notify_chunked(&self, endpoint: &Endpoint, message: &[u8], chunk_size: usize) {
        for chunk in message.chunks(chunk_size.max(1)) {
            self.notify(endpoint, Bytes::copy_from_slice(chunk)).await;
        }
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> broadcast::Receiver<(Endpoint, Bytes)> {
        self.inner.write_tap.subscribe()
    }

    /// Live notification subscribers for `endpoint`.
    pub async fn subscriber_count(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .subscribers
            .lock()
            .await
            .get(endpoint)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    /// Number of `subscribe_notifications` calls seen, failed ones included.
    pub fn subscribe_calls(&self) -> u32 {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.inner.subscribe_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.inner.write_failures.store(count, Ordering::SeqCst);
    }

    fn current_device(&self) -> Option<DeviceHandle> {
        self.inner.device_tx.borrow().clone()
    }

    fn require_connected(&self) -> Result<DeviceHandle, TransportError> {
        self.current_device().ok_or(TransportError::NotConnected)
    }
}

fn take_injected_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<DeviceHandle, TransportError> {
        if let Some(device) = self.current_device() {
            return Ok(device);
        }
        let device = self
            .inner
            .advertised
            .lock()
            .await
            .iter()
            .find(|d| options.matches(d))
            .cloned()
            .ok_or(TransportError::DeviceNotFound)?;
        info!(id = %device.id, name = ?device.name, "Simulated device connected");
        self.inner.device_tx.send_replace(Some(device.clone()));
        Ok(device)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(device) = self.inner.device_tx.send_replace(None) else {
            return Ok(());
        };
        // Dropping the senders ends every notification stream
        self.inner.subscribers.lock().await.clear();
        info!(id = %device.id, "Simulated device disconnected");
        let _ = self.inner.disconnect_tx.send(device);
        Ok(())
    }

    async fn read(&self, endpoint: &Endpoint) -> Result<Bytes, TransportError> {
        self.require_connected()?;
        self.inner
            .values
            .lock()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::Read(format!("{endpoint} has no value")))
    }

    async fn write(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), TransportError> {
        self.require_connected()?;
        if data.len() > MAX_WRITE_CHUNK {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                max: MAX_WRITE_CHUNK,
            });
        }
        if take_injected_failure(&self.inner.write_failures) {
            return Err(TransportError::Write(format!("{endpoint} rejected the write")));
        }
        debug!(%endpoint, bytes = hex::encode(data), "Simulated write");
        let _ = self
            .inner
            .write_tap
            .send((endpoint.clone(), Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn subscribe_notifications(&self, endpoint: &Endpoint) -> Result<NotificationStream, TransportError> {
        self.require_connected()?;
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if take_injected_failure(&self.inner.subscribe_failures) {
            return Err(TransportError::Subscribe(format!("{endpoint} is busy")));
        }
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE);
        self.inner
            .subscribers
            .lock()
            .await
            .entry(endpoint.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn device(&self) -> watch::Receiver<Option<DeviceHandle>> {
        self.inner.device_tx.subscribe()
    }

    fn on_disconnect(&self) -> broadcast::Receiver<DeviceHandle> {
        self.inner.disconnect_tx.subscribe()
    }
}
