//! AES-CMAC (RFC 4493)
//!
//! Pure functions over byte slices: every helper returns a new buffer and
//! never mutates its inputs.
//!
//! 1. `L = AES(key, 0^128)`
//! 2. `K1 = L << 1`, XOR `Rb` if the top bit of `L` was set; `K2` derived from
//!    `K1` the same way
//! 3. The last block is XORed with `K1` when the message is a nonzero multiple
//!    of 16 bytes, otherwise it is padded with `0x80 0x00..` and XORed with `K2`
//! 4. All blocks are CBC-chained under a zero IV; the final block is the tag

use crate::cipher::{Key, encrypt_block};
use crate::constants::{BLOCK_SIZE, CMAC_RB};
use aes::Aes128;
use aes::cipher::KeyInit;
use aes::cipher::generic_array::GenericArray;

pub type Tag = [u8; BLOCK_SIZE];

/// Derive the two CMAC subkeys `(K1, K2)` for `key`.
pub fn generate_subkeys(key: &Key) -> ([u8; BLOCK_SIZE], [u8; BLOCK_SIZE]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut l = [0u8; BLOCK_SIZE];
    encrypt_block(&cipher, &mut l);

    let k1 = derive_subkey(&l);
    let k2 = derive_subkey(&k1);
    (k1, k2)
}

fn derive_subkey(input: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut shifted = [0u8; BLOCK_SIZE];
    shifted.copy_from_slice(&bit_shift_left(input));
    if input[0] & 0x80 != 0 {
        shifted[BLOCK_SIZE - 1] ^= CMAC_RB;
    }
    shifted
}

/// Shift a buffer left by one bit, carrying each byte's top bit into the
/// previous byte. The top bit of the first byte is dropped.
pub fn bit_shift_left(buffer: &[u8]) -> Vec<u8> {
    let mut shifted = Vec::with_capacity(buffer.len());
    for (index, byte) in buffer.iter().enumerate() {
        let carry = buffer.get(index + 1).map_or(0, |next| next >> 7);
        shifted.push((byte << 1) | carry);
    }
    shifted
}

/// XOR two buffers, truncated to the shorter length.
pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Compute the 16-byte AES-CMAC tag of `message` under `key`.
pub fn aes_cmac(key: &Key, message: &[u8]) -> Tag {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let (k1, k2) = generate_subkeys(key);

    let block_count = message.len().div_ceil(BLOCK_SIZE).max(1);
    let last_complete = !message.is_empty() && message.len() % BLOCK_SIZE == 0;
    let last_index = block_count - 1;

    let last_block = if last_complete {
        xor(message_block(message, last_index), &k1)
    } else {
        xor(&padded_block(message, last_index), &k2)
    };

    let mut x = [0u8; BLOCK_SIZE];
    for index in 0..last_index {
        let mut y = [0u8; BLOCK_SIZE];
        y.copy_from_slice(&xor(&x, message_block(message, index)));
        encrypt_block(&cipher, &mut y);
        x = y;
    }

    let mut tag = [0u8; BLOCK_SIZE];
    tag.copy_from_slice(&xor(&last_block, &x));
    encrypt_block(&cipher, &mut tag);
    tag
}

fn message_block(message: &[u8], index: usize) -> &[u8] {
    &message[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]
}

fn padded_block(message: &[u8], index: usize) -> [u8; BLOCK_SIZE] {
    let tail = &message[index * BLOCK_SIZE..];
    let mut block = [0u8; BLOCK_SIZE];
    block[..tail.len()].copy_from_slice(tail);
    block[tail.len()] = 0x80;
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";

    fn rfc_key() -> Key {
        hex::decode(RFC_KEY).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_rfc4493_subkeys() {
        let (k1, k2) = generate_subkeys(&rfc_key());
        assert_eq!(hex::encode(k1), "fbeed618357133667c85e08f7236a8de");
        assert_eq!(hex::encode(k2), "f7ddac306ae266ccf90bc11ee46d513b");
    }

    #[test]
    fn test_bit_shift_left_carries_between_bytes() {
        assert_eq!(bit_shift_left(&[0x80, 0x80, 0x01]), vec![0x01, 0x00, 0x02]);
        assert_eq!(bit_shift_left(&[0xFF]), vec![0xFE]);
        assert!(bit_shift_left(&[]).is_empty());
    }

    #[test]
    fn test_xor_truncates_to_shorter() {
        assert_eq!(xor(&[0xF0, 0x0F, 0xAA], &[0xFF, 0xFF]), vec![0x0F, 0xF0]);
    }

    #[test]
    fn test_padded_block_marks_end() {
        let block = padded_block(b"abc", 0);
        assert_eq!(&block[..4], &[b'a', b'b', b'c', 0x80]);
        assert!(block[4..].iter().all(|&b| b == 0));

        let empty = padded_block(&[], 0);
        assert_eq!(empty[0], 0x80);
    }
}
