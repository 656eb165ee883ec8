//! Transport abstraction
//!
//! The link layer never talks to a BLE stack directly. It drives a
//! [`Transport`]: something that can connect to one device, read and write a
//! characteristic, and deliver raw notification chunks per characteristic.
//! Real stacks and the in-process [`crate::simulated::SimTransport`] implement it.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

/// A (service, characteristic) pair addressing one GATT value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub service: String,
    pub characteristic: String,
}

impl Endpoint {
    pub fn new(service: impl Into<String>, characteristic: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            characteristic: characteristic.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// The currently connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub name: Option<String>,
}

/// Device selection filter passed to [`Transport::connect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub accept_all_devices: bool,
    pub name_prefix: Option<String>,
    pub optional_services: Vec<String>,
}

impl ConnectOptions {
    pub fn accept_all() -> Self {
        Self {
            accept_all_devices: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, device: &DeviceHandle) -> bool {
        if self.accept_all_devices {
            return true;
        }
        match (&self.name_prefix, &device.name) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

/// Raw notification chunks for one endpoint. Ends when the device disconnects.
pub type NotificationStream = mpsc::Receiver<Bytes>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the first device matching `options`.
    async fn connect(&self, options: &ConnectOptions) -> Result<DeviceHandle, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn read(&self, endpoint: &Endpoint) -> Result<Bytes, TransportError>;

    /// Write at most [`crate::constants::MAX_WRITE_CHUNK`] bytes.
    async fn write(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), TransportError>;

    /// Enable notifications and return the raw value-changed stream.
    async fn subscribe_notifications(&self, endpoint: &Endpoint) -> Result<NotificationStream, TransportError>;

    /// Current device, `None` while disconnected.
    fn device(&self) -> watch::Receiver<Option<DeviceHandle>>;

    /// Fires once per physical disconnect with the handle that went away.
    fn on_disconnect(&self) -> broadcast::Receiver<DeviceHandle>;

    fn is_connected(&self) -> bool {
        self.device().borrow().is_some()
    }
}

/// Enable notifications, retrying a fixed number of times with a fixed delay.
pub async fn subscribe_with_retry(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    attempts: u32,
    delay: Duration,
) -> Result<NotificationStream, TransportError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match transport.subscribe_notifications(endpoint).await {
            Ok(stream) => {
                info!(%endpoint, attempt, "Notifications enabled");
                return Ok(stream);
            }
            Err(TransportError::NotConnected) => return Err(TransportError::NotConnected),
            Err(e) if attempt < attempts => {
                warn!(%endpoint, attempt, error = %e, "Enabling notifications failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
