//! AES-128 block cipher engine
//!
//! Implements the five classic modes of operation on top of the raw `Aes128`
//! block primitive, with the configuration model used by the link layer:
//!
//! - **CBC / ECB** zero-pad the plaintext up to the next 16-byte boundary on
//!   encrypt. Padding is never removed on decrypt; callers that need the exact
//!   length must track it themselves.
//! - **CTR / CFB / OFB** operate on unpadded data. CFB requires the input to be
//!   a multiple of its segment size.
//!
//! # IV policy
//!
//! With [`IvPolicy::Static`] every call builds a fresh transform seeded from the
//! stored IV, so calls are independent. With [`IvPolicy::Rolling`] the engine
//! keeps one live transform whose chaining state (last cipher block, counter,
//! shift register, keystream position) carries over between calls, shared by
//! encrypt and decrypt.
//!
//! # CTR seeding
//!
//! The counter block starts at the configured IV (big-endian, incremented per
//! block). `ModeParams::counter` must still be supplied and nonzero for the
//! configuration to be accepted.

use crate::constants::{BLOCK_SIZE, KEY_SIZE};
use crate::error::GattError;
use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::debug;

pub type Key = [u8; KEY_SIZE];
pub type Iv = [u8; BLOCK_SIZE];

/// Block cipher mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum CipherMode {
    #[default]
    Cbc,
    Ctr,
    Cfb,
    Ofb,
    Ecb,
}

impl CipherMode {
    /// Modes that zero-pad plaintext to the block size before encrypting.
    pub fn is_block_aligned(self) -> bool {
        matches!(self, CipherMode::Cbc | CipherMode::Ecb)
    }
}

/// Whether chaining state survives between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum IvPolicy {
    #[default]
    Static,
    Rolling,
}

/// Mode-specific parameters. CTR needs `counter`, CFB needs `segment_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeParams {
    pub counter: Option<u64>,
    /// CFB feedback segment in bytes (1..=16)
    pub segment_size: Option<usize>,
}

impl ModeParams {
    pub fn counter(counter: u64) -> Self {
        Self {
            counter: Some(counter),
            ..Self::default()
        }
    }

    pub fn segment_size(segment_size: usize) -> Self {
        Self {
            segment_size: Some(segment_size),
            ..Self::default()
        }
    }
}

/// Everything needed to build a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherConfig {
    pub key: Key,
    pub iv: Iv,
    pub mode: CipherMode,
    pub params: ModeParams,
    pub iv_policy: IvPolicy,
}

impl CipherConfig {
    /// CBC with an all-zero static IV.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            iv: [0u8; BLOCK_SIZE],
            mode: CipherMode::default(),
            params: ModeParams::default(),
            iv_policy: IvPolicy::default(),
        }
    }

    /// Build a config from untyped key/IV slices (hex-decoded input, config files).
    pub fn from_slices(key: &[u8], iv: Option<&[u8]>) -> Result<Self, GattError> {
        let key: Key = key
            .try_into()
            .map_err(|_| GattError::Config(format!("key must be {KEY_SIZE} bytes, got {}", key.len())))?;
        let mut config = Self::new(key);
        if let Some(iv) = iv {
            config.iv = iv
                .try_into()
                .map_err(|_| GattError::Config(format!("IV must be {BLOCK_SIZE} bytes, got {}", iv.len())))?;
        }
        Ok(config)
    }

    pub fn with_iv(mut self, iv: Iv) -> Self {
        self.iv = iv;
        self
    }

    pub fn with_mode(mut self, mode: CipherMode, params: ModeParams) -> Self {
        self.mode = mode;
        self.params = params;
        self
    }

    pub fn with_iv_policy(mut self, iv_policy: IvPolicy) -> Self {
        self.iv_policy = iv_policy;
        self
    }

    /// Reject configurations missing a mandatory mode parameter.
    pub fn validate(&self) -> Result<(), GattError> {
        match self.mode {
            CipherMode::Ctr => match self.params.counter {
                Some(0) | None => Err(GattError::Config(
                    "mode_params.counter is required to use CTR".to_string(),
                )),
                Some(_) => Ok(()),
            },
            CipherMode::Cfb => match self.params.segment_size {
                Some(size) if (1..=BLOCK_SIZE).contains(&size) => Ok(()),
                Some(size) => Err(GattError::Config(format!(
                    "mode_params.segment_size must be 1..={BLOCK_SIZE} bytes, got {size}"
                ))),
                None => Err(GattError::Config(
                    "mode_params.segment_size is required to use CFB".to_string(),
                )),
            },
            _ => Ok(()),
        }
    }
}

/// Stateful AES engine. Must be configured before use.
#[derive(Default)]
pub struct AesCipher {
    config: Option<CipherConfig>,
    live: Option<Transform>,
}

impl AesCipher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a configuration. Fails without touching the current state when a
    /// mandatory mode parameter is missing.
    pub fn configure(&mut self, config: CipherConfig) -> Result<(), GattError> {
        config.validate()?;
        self.live = match config.iv_policy {
            IvPolicy::Rolling => Some(Transform::new(&config)),
            IvPolicy::Static => None,
        };
        debug!(mode = %config.mode, policy = %config.iv_policy, "Cipher configured");
        self.config = Some(config);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Option<&CipherConfig> {
        self.config.as_ref()
    }

    pub fn change_initial_vector(&mut self, iv: Iv) -> Result<(), GattError> {
        self.reconfigure(|config| config.iv = iv)
    }

    pub fn change_mode(&mut self, mode: CipherMode, params: ModeParams) -> Result<(), GattError> {
        self.reconfigure(|config| {
            config.mode = mode;
            config.params = params;
        })
    }

    pub fn change_iv_policy(&mut self, iv_policy: IvPolicy) -> Result<(), GattError> {
        self.reconfigure(|config| config.iv_policy = iv_policy)
    }

    pub fn change_master_key(&mut self, key: Key) -> Result<(), GattError> {
        self.reconfigure(|config| config.key = key)
    }

    fn reconfigure(&mut self, update: impl FnOnce(&mut CipherConfig)) -> Result<(), GattError> {
        let mut config = self.config.clone().ok_or(GattError::NotConfigured)?;
        update(&mut config);
        self.configure(config)
    }

    /// Encrypt `plaintext`. CBC and ECB output is zero-padded to 16 bytes.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, GattError> {
        let Self { config, live } = self;
        let config = config.as_ref().ok_or(GattError::NotConfigured)?;
        let data = if config.mode.is_block_aligned() {
            zero_pad(plaintext)
        } else {
            plaintext.to_vec()
        };
        match live {
            Some(transform) => transform.encrypt(data),
            None => Transform::new(config).encrypt(data),
        }
    }

    /// Decrypt `ciphertext`. No unpadding is performed.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, GattError> {
        let Self { config, live } = self;
        let config = config.as_ref().ok_or(GattError::NotConfigured)?;
        let data = ciphertext.to_vec();
        match live {
            Some(transform) => transform.decrypt(data),
            None => Transform::new(config).decrypt(data),
        }
    }
}

/// Zero-fill up to the next multiple of the block size.
fn zero_pad(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.resize(data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
    padded
}

pub(crate) fn encrypt_block(cipher: &Aes128, block: &mut [u8]) {
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

fn decrypt_block(cipher: &Aes128, block: &mut [u8]) {
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

fn xor_in_place(target: &mut [u8], other: &[u8]) {
    for (t, o) in target.iter_mut().zip(other) {
        *t ^= o;
    }
}

enum ModeState {
    Ecb,
    Cbc { last: [u8; BLOCK_SIZE] },
    Ctr {
        counter: [u8; BLOCK_SIZE],
        keystream: [u8; BLOCK_SIZE],
        used: usize,
    },
    Cfb { register: [u8; BLOCK_SIZE], segment: usize },
    Ofb { feedback: [u8; BLOCK_SIZE], used: usize },
}

/// One keyed mode instance with its chaining state.
struct Transform {
    cipher: Aes128,
    state: ModeState,
}

impl Transform {
    fn new(config: &CipherConfig) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(&config.key));
        let state = match config.mode {
            CipherMode::Ecb => ModeState::Ecb,
            CipherMode::Cbc => ModeState::Cbc { last: config.iv },
            CipherMode::Ctr => ModeState::Ctr {
                counter: config.iv,
                keystream: [0u8; BLOCK_SIZE],
                used: BLOCK_SIZE,
            },
            CipherMode::Cfb => ModeState::Cfb {
                register: config.iv,
                segment: config.params.segment_size.unwrap_or(1),
            },
            CipherMode::Ofb => ModeState::Ofb {
                feedback: config.iv,
                used: BLOCK_SIZE,
            },
        };
        Self { cipher, state }
    }

    fn encrypt(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, GattError> {
        let Self { cipher, state } = self;
        match state {
            ModeState::Ecb => {
                check_block_aligned(CipherMode::Ecb, &data)?;
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    encrypt_block(cipher, block);
                }
            }
            ModeState::Cbc { last } => {
                check_block_aligned(CipherMode::Cbc, &data)?;
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    xor_in_place(block, last);
                    encrypt_block(cipher, block);
                    last.copy_from_slice(block);
                }
            }
            ModeState::Ctr { counter, keystream, used } => {
                apply_ctr(cipher, counter, keystream, used, &mut data);
            }
            ModeState::Cfb { register, segment } => {
                check_segment_aligned(*segment, &data)?;
                for chunk in data.chunks_exact_mut(*segment) {
                    let mut pad = *register;
                    encrypt_block(cipher, &mut pad);
                    xor_in_place(chunk, &pad);
                    shift_register(register, chunk);
                }
            }
            ModeState::Ofb { feedback, used } => {
                apply_ofb(cipher, feedback, used, &mut data);
            }
        }
        Ok(data)
    }

    fn decrypt(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, GattError> {
        let Self { cipher, state } = self;
        match state {
            ModeState::Ecb => {
                check_block_aligned(CipherMode::Ecb, &data)?;
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    decrypt_block(cipher, block);
                }
            }
            ModeState::Cbc { last } => {
                check_block_aligned(CipherMode::Cbc, &data)?;
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    let mut saved = [0u8; BLOCK_SIZE];
                    saved.copy_from_slice(block);
                    decrypt_block(cipher, block);
                    xor_in_place(block, last);
                    *last = saved;
                }
            }
            ModeState::Ctr { counter, keystream, used } => {
                apply_ctr(cipher, counter, keystream, used, &mut data);
            }
            ModeState::Cfb { register, segment } => {
                check_segment_aligned(*segment, &data)?;
                for chunk in data.chunks_exact_mut(*segment) {
                    let mut saved = [0u8; BLOCK_SIZE];
                    saved[..chunk.len()].copy_from_slice(chunk);
                    let mut pad = *register;
                    encrypt_block(cipher, &mut pad);
                    xor_in_place(chunk, &pad);
                    shift_register(register, &saved[..*segment]);
                }
            }
            ModeState::Ofb { feedback, used } => {
                apply_ofb(cipher, feedback, used, &mut data);
            }
        }
        Ok(data)
    }
}

fn check_block_aligned(mode: CipherMode, data: &[u8]) -> Result<(), GattError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(GattError::BlockAlignment { mode, len: data.len() });
    }
    Ok(())
}

fn check_segment_aligned(segment_size: usize, data: &[u8]) -> Result<(), GattError> {
    if data.len() % segment_size != 0 {
        return Err(GattError::SegmentAlignment {
            segment_size,
            len: data.len(),
        });
    }
    Ok(())
}

fn apply_ctr(
    cipher: &Aes128,
    counter: &mut [u8; BLOCK_SIZE],
    keystream: &mut [u8; BLOCK_SIZE],
    used: &mut usize,
    data: &mut [u8],
) {
    for byte in data.iter_mut() {
        if *used == BLOCK_SIZE {
            *keystream = *counter;
            encrypt_block(cipher, keystream);
            increment_counter(counter);
            *used = 0;
        }
        *byte ^= keystream[*used];
        *used += 1;
    }
}

fn apply_ofb(cipher: &Aes128, feedback: &mut [u8; BLOCK_SIZE], used: &mut usize, data: &mut [u8]) {
    for byte in data.iter_mut() {
        if *used == BLOCK_SIZE {
            encrypt_block(cipher, feedback);
            *used = 0;
        }
        *byte ^= feedback[*used];
        *used += 1;
    }
}

/// 128-bit big-endian increment, wrapping at the top.
fn increment_counter(counter: &mut [u8; BLOCK_SIZE]) {
    for byte in counter.iter_mut().rev() {
        let (value, overflow) = byte.overflowing_add(1);
        *byte = value;
        if !overflow {
            break;
        }
    }
}

/// Drop `feed.len()` bytes off the front of the register and append `feed`.
fn shift_register(register: &mut [u8; BLOCK_SIZE], feed: &[u8]) {
    let n = feed.len();
    register.copy_within(n.., 0);
    register[BLOCK_SIZE - n..].copy_from_slice(feed);
}
