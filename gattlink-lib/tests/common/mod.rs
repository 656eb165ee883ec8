//! Common test utilities and shared imports

// Shared across test files; not every item is used in every file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use gattlink_lib::cipher::{AesCipher, CipherConfig, CipherMode, IvPolicy, Key, ModeParams};
#[allow(unused_imports)]
pub use gattlink_lib::error::{GattError, TransportError};
#[allow(unused_imports)]
pub use gattlink_lib::simulated::SimTransport;
#[allow(unused_imports)]
pub use gattlink_lib::transport::{ConnectOptions, Endpoint, Transport};

/// Key 01..10 used throughout the cipher vectors
#[allow(dead_code)]
pub const KEY: Key = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

/// IV 21..36
#[allow(dead_code)]
pub const IV: [u8; 16] = [21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36];

#[allow(dead_code)]
pub const ANY_LENGTH_TEXT: &str = "Text may be any length you wish, no padding is required.";

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("Failed to decode hex")
}

#[allow(dead_code)]
pub fn key_from_hex(hex_data: &str) -> Key {
    hex_to_bytes(hex_data).try_into().expect("16 byte key")
}

/// Simulated transport with one device, already connected
#[allow(dead_code)]
pub async fn connected_transport() -> SimTransport {
    let transport = SimTransport::with_device("reader").await;
    transport
        .connect(&ConnectOptions::accept_all())
        .await
        .expect("connect to simulated device");
    transport
}

#[allow(dead_code)]
pub fn request_endpoint() -> Endpoint {
    Endpoint::new("reader_service", "request")
}

#[allow(dead_code)]
pub fn response_endpoint() -> Endpoint {
    Endpoint::new("reader_service", "response")
}

/// `[0x02][len:2][data][checksum][0x03]` with the default length padding of 5
#[allow(dead_code)]
pub fn frame(data: &[u8]) -> Vec<u8> {
    let mut message = vec![0x02];
    message.extend_from_slice(&(data.len() as u16).to_be_bytes());
    message.extend_from_slice(data);
    message.push(data.iter().fold(0u8, |acc, b| acc ^ b));
    message.push(0x03);
    message
}

/// Route library logs to the test harness; `RUST_LOG=debug` shows chunk traffic
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
