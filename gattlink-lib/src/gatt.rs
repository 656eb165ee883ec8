//! Well-known GATT services and the standard characteristic getters.

use crate::error::{GattError, TransportError};
use crate::transport::{Endpoint, Transport};
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

pub mod generic_access {
    pub const SERVICE: &str = "generic_access";
    pub const DEVICE_NAME: &str = "device_name";
    pub const APPEARANCE: &str = "appearance";
    pub const PRIVACY_FLAG: &str = "privacy_flag";
    pub const RECONNECTION_ADDRESS: &str = "reconnection_address";
    pub const PERIPHERAL_PREFERRED_CONNECTION_PARAMETERS: &str = "peripheral_preferred_connection_parameters";
}

pub mod battery {
    pub const SERVICE: &str = "battery_service";
    pub const BATTERY_LEVEL: &str = "battery_level";
}

pub mod device_information {
    pub const SERVICE: &str = "device_information";
    pub const MANUFACTURER_NAME: &str = "manufacturer_name_string";
    pub const MODEL_NUMBER: &str = "model_number_string";
    pub const SERIAL_NUMBER: &str = "serial_number_string";
    pub const HARDWARE_REVISION: &str = "hardware_revision_string";
    pub const FIRMWARE_REVISION: &str = "firmware_revision_string";
    pub const SOFTWARE_REVISION: &str = "software_revision_string";
    pub const SYSTEM_ID: &str = "system_id";
    pub const PNP_ID: &str = "pnp_id";
}

/// Services to request access to when connecting with a name filter.
pub const WELL_KNOWN_SERVICES: [&str; 3] = [generic_access::SERVICE, battery::SERVICE, device_information::SERVICE];

pub fn battery_level_endpoint() -> Endpoint {
    Endpoint::new(battery::SERVICE, battery::BATTERY_LEVEL)
}

pub fn device_information_endpoint(characteristic: &str) -> Endpoint {
    Endpoint::new(device_information::SERVICE, characteristic)
}

/// Battery charge in percent: the first byte of the battery level value.
pub async fn battery_level(transport: &dyn Transport) -> Result<u8, GattError> {
    let endpoint = battery_level_endpoint();
    let value = transport.read(&endpoint).await?;
    let level = value
        .first()
        .copied()
        .ok_or_else(|| TransportError::Read(format!("{endpoint} returned an empty value")))?;
    debug!(level, "Battery level read");
    Ok(level)
}

/// Read a characteristic and decode it as UTF-8.
pub async fn read_string(transport: &dyn Transport, endpoint: &Endpoint) -> Result<String, GattError> {
    let value = transport.read(endpoint).await?;
    Ok(String::from_utf8(value.to_vec())?)
}

/// Contents of the device information service. Characteristics the device
/// does not expose are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInformation {
    pub manufacturer_name: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub hardware_revision: Option<String>,
    pub firmware_revision: Option<String>,
    pub software_revision: Option<String>,
    pub system_id: Option<Vec<u8>>,
    pub pnp_id: Option<Vec<u8>>,
}

pub async fn device_information(transport: &dyn Transport) -> Result<DeviceInformation, GattError> {
    use device_information::*;
    Ok(DeviceInformation {
        manufacturer_name: optional_string(transport, MANUFACTURER_NAME).await?,
        model_number: optional_string(transport, MODEL_NUMBER).await?,
        serial_number: optional_string(transport, SERIAL_NUMBER).await?,
        hardware_revision: optional_string(transport, HARDWARE_REVISION).await?,
        firmware_revision: optional_string(transport, FIRMWARE_REVISION).await?,
        software_revision: optional_string(transport, SOFTWARE_REVISION).await?,
        system_id: optional_raw(transport, SYSTEM_ID).await?.map(|v| v.to_vec()),
        pnp_id: optional_raw(transport, PNP_ID).await?.map(|v| v.to_vec()),
    })
}

/// A read failure means the characteristic is absent; anything else (no
/// connection, for one) is a real error.
async fn optional_raw(transport: &dyn Transport, characteristic: &str) -> Result<Option<Bytes>, GattError> {
    let endpoint = device_information_endpoint(characteristic);
    match transport.read(&endpoint).await {
        Ok(value) => Ok(Some(value)),
        Err(TransportError::Read(reason)) => {
            debug!(%endpoint, %reason, "Characteristic not available");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

async fn optional_string(transport: &dyn Transport, characteristic: &str) -> Result<Option<String>, GattError> {
    match optional_raw(transport, characteristic).await? {
        Some(value) => Ok(Some(String::from_utf8(value.to_vec())?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimTransport;
    use crate::transport::ConnectOptions;

    async fn connected() -> SimTransport {
        let transport = SimTransport::with_device("reader").await;
        transport.connect(&ConnectOptions::accept_all()).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_battery_level_is_first_byte() {
        let transport = connected().await;
        transport.set_value(&battery_level_endpoint(), vec![87u8, 0xFF]).await;
        assert_eq!(battery_level(&transport).await.unwrap(), 87);
    }

    #[tokio::test]
    async fn test_battery_level_empty_value_is_an_error() {
        let transport = connected().await;
        transport.set_value(&battery_level_endpoint(), Vec::<u8>::new()).await;
        assert!(matches!(
            battery_level(&transport).await,
            Err(GattError::Transport(TransportError::Read(_)))
        ));
    }

    #[tokio::test]
    async fn test_device_information_missing_fields_are_none() {
        let transport = connected().await;
        transport
            .set_value(&device_information_endpoint(device_information::MANUFACTURER_NAME), "ACS")
            .await;
        transport
            .set_value(&device_information_endpoint(device_information::SYSTEM_ID), vec![0xDEu8, 0xAD])
            .await;

        let info = device_information(&transport).await.unwrap();
        assert_eq!(info.manufacturer_name.as_deref(), Some("ACS"));
        assert_eq!(info.system_id, Some(vec![0xDE, 0xAD]));
        assert_eq!(info.model_number, None);
        assert_eq!(info.pnp_id, None);
    }

    #[tokio::test]
    async fn test_device_information_requires_connection() {
        let transport = SimTransport::with_device("reader").await;
        assert!(matches!(
            device_information(&transport).await,
            Err(GattError::Transport(TransportError::NotConnected))
        ));
    }
}
