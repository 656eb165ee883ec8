use crate::cipher::CipherMode;
use std::io;
use std::string::FromUtf8Error;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No device connected")]
    NotConnected,

    #[error("No matching BLE device found")]
    DeviceNotFound,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Write payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Could not start notifications: {0}")]
    Subscribe(String),

    #[error("Device disconnected")]
    Disconnected,
}

/// The primary error type for the `gattlink` library.
#[derive(Error, Debug)]
pub enum GattError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cipher used before configure() was called")]
    NotConfigured,

    #[error("No matching response within {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{mode} input must be a multiple of 16 bytes, got {len}")]
    BlockAlignment { mode: CipherMode, len: usize },

    #[error("CFB input must be a multiple of the {segment_size} byte segment, got {len}")]
    SegmentAlignment { segment_size: usize, len: usize },

    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Notification stream closed while waiting for a response")]
    StreamClosed,
}
