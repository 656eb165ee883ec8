//! AES-CMAC against RFC 4493 and a device-style message

mod common;

use common::*;
use gattlink_lib::cmac::aes_cmac;

const RFC_KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
const RFC_MESSAGE: &str = "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51\
                           30c81c46a35ce411e5fbc1191a0a52eff69f2445df4f9b17ad2b417be66c3710";

#[test]
fn test_rfc4493_examples() {
    let key = key_from_hex(RFC_KEY);
    let message = hex_to_bytes(RFC_MESSAGE);
    let cases = [
        (0, "bb1d6929e95937287fa37d129b756746"),
        (16, "070a16b46b4d4144f79bdd9dd04a287c"),
        (40, "dfa66747de9ae63030ca32611497c827"),
        (64, "51f0bebf7e3b9d92fc49741779363cfe"),
    ];
    for (len, expected) in cases {
        let tag = aes_cmac(&key, &message[..len]);
        assert_eq!(hex::encode(tag), expected, "message length {len}");
    }
}

#[test]
fn test_pipe_delimited_message() {
    let key = key_from_hex("6b334d656e2a702f322e336a34616242");
    let tag = aes_cmac(&key, b"this|is|a|test|message");
    assert_eq!(hex::encode(tag), "0125c538f8be7c4eea370f992a4ffdcb");
}

#[test]
fn test_tag_depends_on_every_byte() {
    let key = key_from_hex(RFC_KEY);
    let message = hex_to_bytes(RFC_MESSAGE);
    let reference = aes_cmac(&key, &message);
    for index in [0, 15, 16, 63] {
        let mut tampered = message.clone();
        tampered[index] ^= 0x01;
        assert_ne!(aes_cmac(&key, &tampered), reference, "flip at byte {index}");
    }
}

#[test]
fn test_cmac_does_not_need_a_configured_cipher() {
    // The CMAC helpers are free functions; an unconfigured engine does not matter
    let mut cipher = AesCipher::new();
    assert!(matches!(cipher.encrypt(b"x"), Err(GattError::NotConfigured)));
    assert_eq!(aes_cmac(&KEY, b"").len(), 16);
}
