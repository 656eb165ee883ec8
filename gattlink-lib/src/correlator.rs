//! Request/response correlation
//!
//! A request is written to one endpoint while the caller watches the shared
//! reassembled-message stream for the first message whose content matches a
//! [`ResponseFilter`]. The write and the wait run concurrently: a device may
//! answer before the last chunk of the request has been acknowledged.

use crate::cipher::{AesCipher, CipherConfig, Key};
use crate::constants::{DATABLOCK_HEADER_SIZE, DATABLOCK_TRAILER_SIZE, MAX_WRITE_CHUNK};
use crate::error::{GattError, TransportError};
use crate::router::NotificationRouter;
use crate::transport::{Endpoint, Transport};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Byte constraints a response must satisfy, all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFilter(Vec<(usize, u8)>);

impl ResponseFilter {
    pub fn new(constraints: impl IntoIterator<Item = (usize, u8)>) -> Self {
        Self(constraints.into_iter().collect())
    }

    pub fn constraints(&self) -> &[(usize, u8)] {
        &self.0
    }

    /// A position past the end of `message` never matches. An empty filter
    /// matches every message.
    pub fn matches(&self, message: &[u8]) -> bool {
        self.0
            .iter()
            .all(|&(position, expected)| message.get(position) == Some(&expected))
    }
}

impl From<Vec<(usize, u8)>> for ResponseFilter {
    fn from(constraints: Vec<(usize, u8)>) -> Self {
        Self(constraints)
    }
}

impl<const N: usize> From<[(usize, u8); N]> for ResponseFilter {
    fn from(constraints: [(usize, u8); N]) -> Self {
        Self::new(constraints)
    }
}

/// Decrypt the data block of `[header:3][data:N][trailer:2]` in place of the
/// ciphertext, leaving header and trailer in the clear. `N` is the big-endian
/// u16 at bytes 1..3. Decryption is AES-CBC with a zero IV.
pub fn decrypt_datablock(message: &[u8], key: &Key) -> Result<Bytes, GattError> {
    let header = message.get(..DATABLOCK_HEADER_SIZE).ok_or_else(|| {
        GattError::Config(format!("message of {} bytes has no data block header", message.len()))
    })?;
    let data_len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let data_end = DATABLOCK_HEADER_SIZE + data_len;
    let data = message.get(DATABLOCK_HEADER_SIZE..data_end).ok_or_else(|| {
        GattError::Config(format!(
            "data block of {data_len} bytes overruns a {} byte message",
            message.len()
        ))
    })?;
    let trailer_end = (data_end + DATABLOCK_TRAILER_SIZE).min(message.len());
    let trailer = &message[data_end..trailer_end];

    let mut cipher = AesCipher::new();
    cipher.configure(CipherConfig::new(*key))?;
    let plaintext = cipher.decrypt(data)?;

    let mut out = BytesMut::with_capacity(header.len() + plaintext.len() + trailer.len());
    out.put_slice(header);
    out.put_slice(&plaintext);
    out.put_slice(trailer);
    Ok(out.freeze())
}

/// Write `message` in pieces of at most [`MAX_WRITE_CHUNK`] bytes, in order.
/// Stops at the first failed piece; pieces already written are not undone.
pub async fn write_chunked(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    message: &[u8],
) -> Result<(), TransportError> {
    for (index, chunk) in message.chunks(MAX_WRITE_CHUNK).enumerate() {
        transport.write(endpoint, chunk).await.inspect_err(|e| {
            warn!(%endpoint, chunk = index, error = %e, "Chunked write aborted");
        })?;
    }
    debug!(%endpoint, bytes = message.len(), "Request written");
    Ok(())
}

/// Issues requests and waits for their correlated responses.
///
/// Cheap to clone. Any number of `send_and_wait` calls may be in flight at
/// once: each one gets its own view of the shared stream.
#[derive(Clone)]
pub struct Correlator {
    transport: Arc<dyn Transport>,
    messages: broadcast::Sender<Bytes>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>, router: &NotificationRouter, timeout: Duration) -> Self {
        Self {
            transport,
            messages: router.sender(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write `message` to `endpoint` and return the first message on the
    /// shared stream that satisfies `filter`.
    ///
    /// With `decrypt_key`, each candidate's data block is decrypted before the
    /// filter is applied and the decrypted message is returned. The deadline
    /// runs from the start of the call. A disconnect during the wait ends it
    /// early with [`GattError::StreamClosed`].
    pub async fn send_and_wait(
        &self,
        message: &[u8],
        endpoint: &Endpoint,
        filter: &ResponseFilter,
        decrypt_key: Option<&Key>,
    ) -> Result<Bytes, GattError> {
        let deadline = Instant::now() + self.timeout;
        // Subscribe before writing so an early response cannot be missed
        let mut responses = self.messages.subscribe();
        let mut disconnects = self.transport.on_disconnect();

        let transport = Arc::clone(&self.transport);
        let target = endpoint.clone();
        let request = Bytes::copy_from_slice(message);
        let mut write = tokio::spawn(async move { write_chunked(transport.as_ref(), &target, &request).await });

        let wait = async {
            let mut written = false;
            let mut watching = true;
            loop {
                tokio::select! {
                    result = &mut write, if !written => {
                        written = true;
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return Err(GattError::Transport(e)),
                            Err(e) => return Err(GattError::Transport(TransportError::Write(e.to_string()))),
                        }
                    }
                    received = responses.recv() => match received {
                        Ok(candidate) => {
                            if let Some(response) = accept(candidate, filter, decrypt_key) {
                                return Ok(response);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Response stream lagged, some messages were not inspected");
                        }
                        Err(RecvError::Closed) => return Err(GattError::StreamClosed),
                    },
                    event = disconnects.recv(), if watching => match event {
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            warn!(%endpoint, "Device disconnected while waiting for a response");
                            return Err(GattError::StreamClosed);
                        }
                        Err(RecvError::Closed) => watching = false,
                    }
                }
            }
        };

        let outcome = tokio::time::timeout_at(deadline, wait).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                write.abort();
                warn!(%endpoint, timeout = ?self.timeout, "No matching response");
                Err(GattError::Timeout(self.timeout))
            }
        }
    }
}

fn accept(candidate: Bytes, filter: &ResponseFilter, decrypt_key: Option<&Key>) -> Option<Bytes> {
    let candidate = match decrypt_key {
        Some(key) => match decrypt_datablock(&candidate, key) {
            Ok(plain) => plain,
            Err(e) => {
                debug!(bytes = hex::encode(&candidate), error = %e, "Skipping undecryptable message");
                return None;
            }
        },
        None => candidate,
    };
    filter.matches(&candidate).then_some(candidate)
}
