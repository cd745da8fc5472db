#![cfg_attr(docsrs, feature(doc_cfg))]

//! Sample-level building blocks for CENC protected elementary streams.
//!
//! This crate knows how an encrypted sample is laid out: its IV, key id and
//! the ordered (clear, cipher) byte ranges of its payload. It moves cipher
//! bytes between the interleaved payload and the contiguous buffer a
//! decryption primitive wants, and names the supported protection systems.
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`SubsampleRange`] | One (clear, cipher) byte range |
//! | [`EncryptedSampleDescriptor`] | IV, key id and ranges of one sample |
//! | [`codec`] | [`gather`](codec::gather) and [`scatter`](codec::scatter) cipher bytes |
//! | [`ProtectionSystem`] | PlayReady, Widevine, ClearKey, Verimatrix |
//! | [`pssh`] | Key ids from `pssh` init data |
//!
//! # Example
//!
//! ```
//! use streamgate_cenc::{SubsampleRange, codec};
//!
//! let mut payload = vec![0u8, 0, 1, 2, 0, 3];
//! let ranges = [SubsampleRange::new(2, 2), SubsampleRange::new(1, 1)];
//!
//! let mut cipher = codec::gather(&payload, &ranges).unwrap();
//! assert_eq!(cipher, vec![1, 2, 3]);
//!
//! cipher.iter_mut().for_each(|byte| *byte += 1);
//! codec::scatter(&mut payload, &ranges, &cipher).unwrap();
//! assert_eq!(payload, vec![0, 0, 2, 3, 0, 4]);
//! ```
//!
//! # Optional Features
//!
//! - **clearkey**: AES-128 `cenc` and `cbc1` ciphers for clear-key sessions.
//! - **serde**: Serialize and deserialize [`ProtectionSystem`] by name.

#[cfg(feature = "clearkey")]
#[cfg_attr(docsrs, doc(cfg(feature = "clearkey")))]
mod cipher;

pub mod codec;
pub mod pssh;

mod error;
mod reader;
mod sample;
mod system;

#[cfg(feature = "clearkey")]
pub use cipher::{Cipher, Scheme};
pub use error::{CencError, Result};
pub use reader::Reader;
pub use sample::{EncryptedSampleDescriptor, SUBSAMPLE_ENTRY_SIZE, SubsampleRange};
pub use system::ProtectionSystem;

/// Parse a 16 byte key or key id from 32 hex characters, dashes allowed.
pub fn parse_hex_16(input: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(input.trim().replace('-', ""))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CencError::HexWrongLength(bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_16() {
        assert!(parse_hex_16("00112233-4455-6677-8899-aabbccddeeff").is_ok());
        assert!(matches!(parse_hex_16("0011"), Err(CencError::HexWrongLength(2))));
        assert!(matches!(parse_hex_16("zz"), Err(CencError::InvalidHex(_))));
    }
}
