//! Notification frame reassembly
//!
//! A BLE notification carries at most ~20 bytes, so one logical message
//! arrives as a run of chunks. [`FrameReassembler`] folds those chunks back
//! into complete messages using a [`FramingPolicy`]:
//!
//! ```text
//! [start][len_hi len_lo][ ...payload... ][ ... ][stop]
//!        '--- length field ---'
//! expected total = be_u16(length field) + length_padding
//! ```
//!
//! A message is complete when the buffer starts with `start_marker`, ends with
//! `stop_marker` and has exactly the expected length. Chunks arriving before a
//! start marker is seen are dropped, and a partial message older than the idle
//! timeout is discarded so a lost fragment cannot wedge the stream.
//!
//! Reassembly is a pure in-order fold: no reordering, no error on desync.

use crate::constants::{DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_START_MARKER, DEFAULT_STOP_MARKER};
use crate::error::GattError;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where the big-endian 16-bit message length lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthField {
    pub offset_start: usize,
    pub offset_end: usize,
    /// Bytes added to the encoded length to get the full message length
    pub length_padding: usize,
}

impl Default for LengthField {
    /// `[start][len:2][data:N][trailer:2]`: length at bytes 1..3, total N + 5.
    fn default() -> Self {
        Self {
            offset_start: 1,
            offset_end: 3,
            length_padding: 5,
        }
    }
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingPolicy {
    pub start_marker: u8,
    pub stop_marker: u8,
    #[serde(default)]
    pub length_field: LengthField,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for FramingPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_START_MARKER, DEFAULT_STOP_MARKER)
    }
}

impl FramingPolicy {
    pub fn new(start_marker: u8, stop_marker: u8) -> Self {
        Self {
            start_marker,
            stop_marker,
            length_field: LengthField::default(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }

    pub fn with_length_field(mut self, offset_start: usize, offset_end: usize, length_padding: usize) -> Self {
        self.length_field = LengthField {
            offset_start,
            offset_end,
            length_padding,
        };
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout_ms = idle_timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), GattError> {
        let field = &self.length_field;
        if field.offset_start.checked_add(2) != Some(field.offset_end) {
            return Err(GattError::Config(format!(
                "length field must span exactly 2 bytes, got {}..{}",
                field.offset_start, field.offset_end
            )));
        }
        if field.length_padding.checked_add(u16::MAX as usize).is_none() {
            return Err(GattError::Config(format!(
                "length padding {} overflows the message length",
                field.length_padding
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(GattError::Config("idle timeout must be nonzero".to_string()));
        }
        Ok(())
    }

    /// Expected total length, once `buffer` holds the length field.
    pub fn expected_length(&self, buffer: &[u8]) -> Option<usize> {
        let field = &self.length_field;
        let raw = buffer.get(field.offset_start..field.offset_end)?;
        let encoded = u16::from_be_bytes([raw[0], raw[1]]);
        (encoded as usize).checked_add(field.length_padding)
    }
}

/// Per-endpoint accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyState {
    pub start_matched: bool,
    pub stop_matched: bool,
    pub length_matches: bool,
    pub expected_length: Option<usize>,
    pub first_byte_at: Option<Instant>,
    pub buffer: BytesMut,
}

impl ReassemblyState {
    pub fn is_empty(&self) -> bool {
        !self.start_matched && self.buffer.is_empty()
    }
}

pub struct FrameReassembler {
    policy: FramingPolicy,
    state: ReassemblyState,
}

impl FrameReassembler {
    pub fn new(policy: FramingPolicy) -> Result<Self, GattError> {
        policy.validate()?;
        Ok(Self {
            policy,
            state: ReassemblyState::default(),
        })
    }

    pub fn policy(&self) -> &FramingPolicy {
        &self.policy
    }

    pub fn state(&self) -> &ReassemblyState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = ReassemblyState::default();
    }

    /// Feed one chunk received now.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.push_at(chunk, Instant::now())
    }

    /// Feed one chunk received at `now`. Returns the message it completes, if any.
    ///
    /// A completed message stays in the state until the next chunk arrives, so
    /// emitting it has no side effect beyond the return value.
    pub fn push_at(&mut self, chunk: &[u8], now: Instant) -> Option<Bytes> {
        if self.state.length_matches {
            self.reset();
        } else if self.idle_expired(now) {
            warn!(
                discarded = self.state.buffer.len(),
                expected = ?self.state.expected_length,
                "Partial message timed out, resynchronising"
            );
            self.reset();
        }

        let first = *chunk.first()?;
        let state = &mut self.state;

        if !state.start_matched && first == self.policy.start_marker {
            state.start_matched = true;
            state.first_byte_at = Some(now);
        }

        if !state.start_matched {
            debug!(bytes = hex::encode(chunk), "Dropping chunk outside a message");
            return None;
        }

        state.buffer.extend_from_slice(chunk);
        state.stop_matched = chunk.last() == Some(&self.policy.stop_marker);
        if state.expected_length.is_none() {
            state.expected_length = self.policy.expected_length(&state.buffer);
        }

        state.length_matches =
            state.start_matched && state.stop_matched && state.expected_length == Some(state.buffer.len());

        if state.length_matches {
            let message = state.buffer.clone().freeze();
            debug!(bytes = hex::encode(&message), "Message reassembled");
            Some(message)
        } else {
            None
        }
    }

    fn idle_expired(&self, now: Instant) -> bool {
        self.state
            .first_byte_at
            .is_some_and(|first| now.duration_since(first) > self.policy.idle_timeout())
    }

    /// Fold a chunk stream until it ends, handing each complete message to `emit`.
    pub async fn drive<F>(mut self, mut chunks: mpsc::Receiver<Bytes>, mut emit: F)
    where
        F: FnMut(Bytes),
    {
        while let Some(chunk) = chunks.recv().await {
            debug!(bytes = hex::encode(&chunk), "Notification chunk");
            if let Some(message) = self.push(&chunk) {
                emit(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // [start][len=0x0004][4 data bytes][checksum][stop], 9 bytes total
    const MESSAGE: &[u8] = &[0x02, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF, 0x5A, 0x03];

    fn reassembler() -> FrameReassembler {
        FrameReassembler::new(FramingPolicy::new(0x02, 0x03)).unwrap()
    }

    #[test]
    fn test_single_chunk_message() {
        let mut r = reassembler();
        let message = r.push(MESSAGE).expect("complete message");
        assert_eq!(message.as_ref(), MESSAGE);
        assert!(r.state().length_matches);
        assert_eq!(r.state().expected_length, Some(9));
    }

    #[test]
    fn test_two_chunk_message() {
        let mut r = reassembler();
        assert!(r.push(&MESSAGE[..5]).is_none());
        assert_eq!(r.state().expected_length, Some(9));
        assert_eq!(r.push(&MESSAGE[5..]).unwrap().as_ref(), MESSAGE);
    }

    #[test]
    fn test_length_known_only_after_field_arrives() {
        let mut r = reassembler();
        assert!(r.push(&MESSAGE[..1]).is_none());
        assert!(r.state().start_matched);
        assert_eq!(r.state().expected_length, None);
        assert!(r.push(&MESSAGE[1..2]).is_none());
        assert_eq!(r.state().expected_length, None);
        assert!(r.push(&MESSAGE[2..3]).is_none());
        assert_eq!(r.state().expected_length, Some(9));
    }

    #[test]
    fn test_garbage_before_start_is_dropped() {
        let mut r = reassembler();
        assert!(r.push(&[0x99, 0x03]).is_none());
        assert!(r.state().is_empty());
        assert_eq!(r.push(MESSAGE).unwrap().as_ref(), MESSAGE);
    }

    #[test]
    fn test_stop_marker_mid_message_does_not_complete() {
        let policy = FramingPolicy::new(0x02, 0x03);
        let mut r = FrameReassembler::new(policy).unwrap();
        // Chunk boundary falls right after a data byte equal to the stop marker
        let message = [0x02, 0x00, 0x03, 0x03, 0x11, 0x22, 0x77, 0x03];
        assert!(r.push(&message[..4]).is_none());
        assert!(r.state().stop_matched);
        assert!(!r.state().length_matches);
        assert!(r.push(&message[4..7]).is_none());
        assert!(!r.state().stop_matched);
        assert_eq!(r.push(&message[7..]).unwrap().as_ref(), &message[..]);
    }

    #[test]
    fn test_wrong_trailer_never_completes() {
        let mut r = reassembler();
        let mut bad = MESSAGE.to_vec();
        bad[8] = 0x04;
        assert!(r.push(&bad).is_none());
        assert!(!r.state().length_matches);
    }

    #[test]
    fn test_state_resets_lazily_after_emission() {
        let mut r = reassembler();
        r.push(MESSAGE).unwrap();
        assert_eq!(r.state().buffer.len(), 9);

        assert!(r.push(&MESSAGE[..4]).is_none());
        assert_eq!(r.state().buffer.len(), 4);
        assert!(!r.state().length_matches);
    }

    #[test]
    fn test_idle_timeout_discards_stale_partial() {
        let mut r = reassembler();
        let start = Instant::now();
        assert!(r.push_at(&MESSAGE[..4], start).is_none());

        // Rest of the first message was lost; a new one starts after the timeout
        let later = start + Duration::from_millis(1001);
        assert!(r.push_at(&MESSAGE[..4], later).is_none());
        assert_eq!(r.state().buffer.len(), 4);
        assert_eq!(r.state().first_byte_at, Some(later));

        let message = r.push_at(&MESSAGE[4..], later).unwrap();
        assert_eq!(message.as_ref(), MESSAGE);
    }

    #[test]
    fn test_partial_within_timeout_is_kept() {
        let mut r = reassembler();
        let start = Instant::now();
        r.push_at(&MESSAGE[..4], start);
        let message = r.push_at(&MESSAGE[4..], start + Duration::from_millis(999));
        assert_eq!(message.unwrap().as_ref(), MESSAGE);
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut r = reassembler();
        assert!(r.push(&[]).is_none());
        assert!(r.state().is_empty());
    }

    #[test]
    fn test_policy_validation() {
        let wide = FramingPolicy::new(0x02, 0x03).with_length_field(1, 4, 5);
        assert!(matches!(FrameReassembler::new(wide), Err(GattError::Config(_))));

        let no_timeout = FramingPolicy::new(0x02, 0x03).with_idle_timeout(Duration::ZERO);
        assert!(matches!(FrameReassembler::new(no_timeout), Err(GattError::Config(_))));
    }

    #[test]
    fn test_policy_from_json_fills_defaults() {
        let policy: FramingPolicy = serde_json::from_str(r#"{"start_marker": 2, "stop_marker": 3}"#).unwrap();
        assert_eq!(policy, FramingPolicy::new(0x02, 0x03));
        assert_eq!(policy.idle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_oversized_length_field_rejected() {
        let policy = FramingPolicy::new(0x02, 0x03).with_length_field(1, 3, usize::MAX);
        assert!(matches!(policy.validate(), Err(GattError::Config(_))));
        assert!(FrameReassembler::new(policy).is_err());

        let policy = FramingPolicy::new(0x02, 0x03).with_length_field(usize::MAX, 1, 5);
        assert!(matches!(policy.validate(), Err(GattError::Config(_))));
    }

    #[test]
    fn test_length_overflow_is_not_a_match() {
        let policy = FramingPolicy::new(0x02, 0x03).with_length_field(1, 3, usize::MAX);
        assert_eq!(policy.expected_length(&[0x02, 0x00, 0x01, 0x03]), None);
    }
}
