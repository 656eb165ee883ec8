use crate::cipher::Key;
use crate::config::LinkConfig;
use crate::correlator::{Correlator, ResponseFilter};
use crate::error::GattError;
use crate::framing::FramingPolicy;
use crate::gatt::{self, DeviceInformation};
use crate::router::{NotificationRouter, StartStatus};
use crate::transport::{ConnectOptions, DeviceHandle, Endpoint, Transport};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// A connected GATT peripheral with its notification router and correlator.
pub struct GattDevice {
    transport: Arc<dyn Transport>,
    handle: DeviceHandle,
    config: LinkConfig,
    router: NotificationRouter,
    correlator: Correlator,
}

impl GattDevice {
    /// Connect to the first device matching `options`
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: &ConnectOptions,
        config: LinkConfig,
    ) -> Result<Self, GattError> {
        config.validate()?;
        info!("Searching for BLE device...");
        let handle = transport.connect(options).await?;
        info!(id = %handle.id, name = ?handle.name, "Connected");

        let router = NotificationRouter::new(Arc::clone(&transport), &config);
        let correlator = Correlator::new(Arc::clone(&transport), &router, config.request_timeout());
        Ok(Self {
            transport,
            handle,
            config,
            router,
            correlator,
        })
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Start a notifier with the configured framing policy
    pub async fn start_notifier(&self, endpoint: Endpoint) -> Result<StartStatus, GattError> {
        self.router.start(endpoint, self.config.framing.clone()).await
    }

    pub async fn start_notifier_with(&self, endpoint: Endpoint, policy: FramingPolicy) -> Result<StartStatus, GattError> {
        self.router.start(endpoint, policy).await
    }

    pub async fn stop_notifier(&self, endpoint: &Endpoint) -> bool {
        self.router.stop(endpoint).await
    }

    pub async fn active_notifiers(&self) -> Vec<Endpoint> {
        self.router.active_endpoints().await
    }

    /// Every reassembled message from every active notifier
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.router.subscribe()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub async fn send_and_wait(
        &self,
        message: &[u8],
        endpoint: &Endpoint,
        filter: &ResponseFilter,
        decrypt_key: Option<&Key>,
    ) -> Result<Bytes, GattError> {
        self.correlator
            .send_and_wait(message, endpoint, filter, decrypt_key)
            .await
    }

    pub async fn read(&self, endpoint: &Endpoint) -> Result<Bytes, GattError> {
        Ok(self.transport.read(endpoint).await?)
    }

    pub async fn read_string(&self, endpoint: &Endpoint) -> Result<String, GattError> {
        gatt::read_string(self.transport.as_ref(), endpoint).await
    }

    pub async fn battery_level(&self) -> Result<u8, GattError> {
        gatt::battery_level(self.transport.as_ref()).await
    }

    pub async fn device_information(&self) -> Result<DeviceInformation, GattError> {
        gatt::device_information(self.transport.as_ref()).await
    }

    /// Stop every notifier and drop the connection
    pub async fn disconnect(self) -> Result<(), GattError> {
        self.router.stop_all().await;
        self.transport.disconnect().await?;
        info!(id = %self.handle.id, "Disconnected");
        Ok(())
    }
}
