use crate::error::{CencError, Result};
use aes::{
    Aes128,
    cipher::{
        BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray,
    },
};
use std::{fmt, str::FromStr};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Common encryption scheme of a clear-key stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Scheme {
    /// AES-128-CTR, counter continuous across cipher ranges.
    #[default]
    Cenc,
    /// AES-128-CBC, chain continuous across cipher ranges.
    Cbc1,
}

impl Scheme {
    pub fn from_scheme_type(scheme_type: u32) -> Option<Self> {
        match scheme_type {
            0x63656E63 => Some(Self::Cenc),
            0x63626331 => Some(Self::Cbc1),
            _ => None,
        }
    }

    pub fn scheme_type(&self) -> u32 {
        match self {
            Self::Cenc => 0x63656E63,
            Self::Cbc1 => 0x63626331,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cenc => f.write_str("cenc"),
            Self::Cbc1 => f.write_str("cbc1"),
        }
    }
}

impl FromStr for Scheme {
    type Err = CencError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cenc" => Ok(Self::Cenc),
            "cbc1" => Ok(Self::Cbc1),
            _ => Err(CencError::UnsupportedScheme(s.to_owned())),
        }
    }
}

/// AES-128 cipher operating on a gathered contiguous cipher buffer.
#[derive(Clone)]
pub struct Cipher {
    scheme: Scheme,
    key: [u8; 16],
}

impl Cipher {
    pub fn new(scheme: Scheme, key: &[u8]) -> Result<Self> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| CencError::InvalidKeySize(key.len()))?;
        Ok(Self { scheme, key })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Decrypt `data` in place.
    pub fn decrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<()> {
        let iv = expand_iv(iv)?;

        match self.scheme {
            Scheme::Cenc => self.apply_ctr(&iv, data),
            Scheme::Cbc1 => self.decrypt_cbc(&iv, data),
        }

        Ok(())
    }

    /// Encrypt `data` in place.
    pub fn encrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<()> {
        let iv = expand_iv(iv)?;

        match self.scheme {
            Scheme::Cenc => self.apply_ctr(&iv, data),
            Scheme::Cbc1 => self.encrypt_cbc(&iv, data),
        }

        Ok(())
    }

    fn apply_ctr(&self, iv: &[u8; 16], data: &mut [u8]) {
        let mut cipher =
            Aes128Ctr::new(GenericArray::from_slice(&self.key), GenericArray::from_slice(iv));
        cipher.apply_keystream(data);
    }

    // Trailing partial block stays clear.
    fn decrypt_cbc(&self, iv: &[u8; 16], data: &mut [u8]) {
        let cipher = Aes128::new(GenericArray::from_slice(&self.key));
        let mut prev = *iv;

        for chunk in data.chunks_exact_mut(16) {
            let mut ciphertext = [0u8; 16];
            ciphertext.copy_from_slice(chunk);

            let block = GenericArray::from_mut_slice(chunk);
            cipher.decrypt_block(block);

            for (byte, mask) in chunk.iter_mut().zip(prev.iter()) {
                *byte ^= mask;
            }
            prev = ciphertext;
        }
    }

    fn encrypt_cbc(&self, iv: &[u8; 16], data: &mut [u8]) {
        let cipher = Aes128::new(GenericArray::from_slice(&self.key));
        let mut prev = *iv;

        for chunk in data.chunks_exact_mut(16) {
            for (byte, mask) in chunk.iter_mut().zip(prev.iter()) {
                *byte ^= mask;
            }

            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
            prev.copy_from_slice(chunk);
        }
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

fn expand_iv(iv: &[u8]) -> Result<[u8; 16]> {
    match iv.len() {
        8 | 16 => {
            let mut expanded = [0u8; 16];
            expanded[..iv.len()].copy_from_slice(iv);
            Ok(expanded)
        }
        other => Err(CencError::InvalidIvSize(other)),
    }
}
