pub mod cipher;
pub mod cmac;
pub mod codec;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod device;
pub mod error;
pub mod framing;
pub mod gatt;
pub mod router;
pub mod simulated;
pub mod transport;

// Re-export the main entry points for easy access
pub use cipher::{AesCipher, CipherConfig, CipherMode, IvPolicy, ModeParams};
pub use config::LinkConfig;
pub use correlator::{Correlator, ResponseFilter};
pub use device::GattDevice;
pub use error::{GattError, TransportError};
pub use framing::{FrameReassembler, FramingPolicy};
pub use router::{NotificationRouter, StartStatus};
pub use transport::{ConnectOptions, DeviceHandle, Endpoint, Transport};
