// Link-level constants shared by the cipher, framing and correlation layers

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// AES-128 key size in bytes
pub const KEY_SIZE: usize = 16;

/// Largest payload accepted by a single transport write
pub const MAX_WRITE_CHUNK: usize = 16;

/// Largest payload delivered by a single notification frame
pub const MAX_NOTIFICATION_CHUNK: usize = 20;

/// Default start-of-message marker (STX)
pub const DEFAULT_START_MARKER: u8 = 0x02;

/// Default end-of-message marker (ETX)
pub const DEFAULT_STOP_MARKER: u8 = 0x03;

/// Default idle time before a partial message is discarded (ms)
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1000;

/// Default deadline for a correlated response (ms)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;

/// Attempts made to enable notifications before giving up
pub const DEFAULT_NOTIFY_RETRY_ATTEMPTS: u32 = 5;

/// Fixed delay between notification enable attempts (ms)
pub const DEFAULT_NOTIFY_RETRY_DELAY_MS: u64 = 1000;

/// Capacity of the shared reassembled-message stream
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Size of the clear-text header in front of an encrypted data block
pub const DATABLOCK_HEADER_SIZE: usize = 3;

/// Size of the clear-text trailer after an encrypted data block
pub const DATABLOCK_TRAILER_SIZE: usize = 2;

/// CMAC subkey constant (last byte of Rb = 0x00..0087)
pub const CMAC_RB: u8 = 0x87;
