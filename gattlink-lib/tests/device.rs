//! End-to-end use of the device facade

mod common;

use common::*;
use gattlink_lib::config::LinkConfig;
use gattlink_lib::correlator::ResponseFilter;
use gattlink_lib::device::GattDevice;
use gattlink_lib::gatt::{battery_level_endpoint, device_information, device_information_endpoint};
use gattlink_lib::router::StartStatus;
use std::sync::Arc;

async fn advertised() -> SimTransport {
    init_tracing();
    let sim = SimTransport::with_device("ACR1255U-J1-0042").await;
    sim.set_value(&battery_level_endpoint(), vec![64u8]).await;
    sim.set_value(&device_information_endpoint(device_information::MODEL_NUMBER), "ACR1255U-J1")
        .await;
    sim.set_value(&device_information_endpoint(device_information::FIRMWARE_REVISION), "1.05")
        .await;
    sim
}

fn by_prefix(prefix: &str) -> ConnectOptions {
    ConnectOptions {
        name_prefix: Some(prefix.to_string()),
        ..ConnectOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_requires_a_matching_device() {
    let sim = advertised().await;
    let result = GattDevice::connect(Arc::new(sim), &by_prefix("scale"), LinkConfig::default()).await;
    assert!(matches!(result, Err(GattError::Transport(TransportError::DeviceNotFound))));
}

#[tokio::test(start_paused = true)]
async fn test_connect_rejects_invalid_config() {
    let sim = advertised().await;
    let config = LinkConfig {
        notification_capacity: 0,
        ..LinkConfig::default()
    };
    let result = GattDevice::connect(Arc::new(sim.clone()), &by_prefix("ACR"), config).await;
    assert!(matches!(result, Err(GattError::Config(_))));
    assert!(!sim.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_standard_characteristics() {
    let sim = advertised().await;
    let device = GattDevice::connect(Arc::new(sim), &by_prefix("ACR1255"), LinkConfig::default())
        .await
        .unwrap();
    assert_eq!(device.handle().name.as_deref(), Some("ACR1255U-J1-0042"));

    assert_eq!(device.battery_level().await.unwrap(), 64);
    let info = device.device_information().await.unwrap();
    assert_eq!(info.model_number.as_deref(), Some("ACR1255U-J1"));
    assert_eq!(info.firmware_revision.as_deref(), Some("1.05"));
    assert_eq!(info.serial_number, None);

    let model = device
        .read_string(&device_information_endpoint(device_information::MODEL_NUMBER))
        .await
        .unwrap();
    assert_eq!(model, "ACR1255U-J1");
}

#[tokio::test(start_paused = true)]
async fn test_request_response_round_trip() {
    let sim = advertised().await;
    let device = GattDevice::connect(Arc::new(sim.clone()), &by_prefix("ACR"), LinkConfig::default())
        .await
        .unwrap();

    assert_eq!(device.start_notifier(response_endpoint()).await.unwrap(), StartStatus::Started);
    assert_eq!(
        device.start_notifier(response_endpoint()).await.unwrap(),
        StartStatus::AlreadyActive
    );
    assert_eq!(device.active_notifiers().await, vec![response_endpoint()]);

    let response = frame(&[0x83, 0x00, 0x90, 0x00]);
    let mut writes = sim.writes();
    let peripheral = sim.clone();
    let reply = response.clone();
    tokio::spawn(async move {
        if writes.recv().await.is_ok() {
            peripheral.notify_chunked(&response_endpoint(), &reply, 20).await;
        }
    });

    let answer = device
        .send_and_wait(&frame(&[0x6B, 0x01]), &request_endpoint(), &ResponseFilter::from([(3, 0x83)]), None)
        .await
        .unwrap();
    assert_eq!(answer.as_ref(), &response[..]);

    assert!(device.stop_notifier(&response_endpoint()).await);
    assert!(device.active_notifiers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_tears_everything_down() {
    let sim = advertised().await;
    let device = GattDevice::connect(Arc::new(sim.clone()), &by_prefix("ACR"), LinkConfig::default())
        .await
        .unwrap();
    device.start_notifier(response_endpoint()).await.unwrap();
    assert!(device.is_connected());

    device.disconnect().await.unwrap();
    assert!(!sim.is_connected());
    assert_eq!(sim.subscriber_count(&response_endpoint()).await, 0);
}
