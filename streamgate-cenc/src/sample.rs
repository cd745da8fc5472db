//! Per-sample encryption layout.
//!
//! Tracks the IV, key id and subsample map that travel with each encrypted
//! sample as side metadata.

use crate::{
    error::{CencError, Result},
    reader::Reader,
};

/// Size in bytes of one packed subsample record (u16 clear, u32 cipher).
pub const SUBSAMPLE_ENTRY_SIZE: usize = 6;

/// One (clear, cipher) byte range inside a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubsampleRange {
    /// Number of cleartext bytes at the start of the range.
    pub clear: u32,
    /// Number of encrypted bytes following the cleartext.
    pub cipher: u32,
}

impl SubsampleRange {
    pub fn new(clear: u32, cipher: u32) -> Self {
        Self { clear, cipher }
    }

    pub fn len(&self) -> usize {
        self.clear as usize + self.cipher as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse `count` packed big-endian records from a subsample map.
    pub fn parse_map(count: usize, data: &[u8]) -> Result<Vec<Self>> {
        if data.len() < count * SUBSAMPLE_ENTRY_SIZE {
            return Err(CencError::Subsample(format!(
                "insufficient subsample data: need {} bytes, got {}",
                count * SUBSAMPLE_ENTRY_SIZE,
                data.len()
            )));
        }

        let mut reader = Reader::new(&data[..count * SUBSAMPLE_ENTRY_SIZE]);
        let mut ranges = Vec::with_capacity(count);

        for _ in 0..count {
            let clear = reader.read_u16()?;
            let cipher = reader.read_u32()?;
            ranges.push(Self::new(clear as u32, cipher));
        }

        Ok(ranges)
    }

    /// Pack ranges back into 6-byte records.
    ///
    /// Fails when a clear length does not fit the 16-bit field.
    pub fn to_map(ranges: &[Self]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(ranges.len() * SUBSAMPLE_ENTRY_SIZE);

        for range in ranges {
            let clear = u16::try_from(range.clear).map_err(|_| {
                CencError::Subsample(format!("clear length {} exceeds 16 bits", range.clear))
            })?;
            data.extend_from_slice(&clear.to_be_bytes());
            data.extend_from_slice(&range.cipher.to_be_bytes());
        }

        Ok(data)
    }
}

/// Encryption layout of a single sample.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptedSampleDescriptor {
    pub iv: Vec<u8>,
    pub key_id: Vec<u8>,
    pub subsamples: Vec<SubsampleRange>,
    pub encrypted: bool,
}

impl EncryptedSampleDescriptor {
    pub fn new(iv: impl Into<Vec<u8>>, key_id: impl Into<Vec<u8>>) -> Self {
        Self {
            iv: iv.into(),
            key_id: key_id.into(),
            subsamples: Vec::new(),
            encrypted: true,
        }
    }

    pub fn with_subsamples(mut self, subsamples: Vec<SubsampleRange>) -> Self {
        self.subsamples = subsamples;
        self
    }

    /// Descriptor for a sample that travels in the clear.
    pub fn clear() -> Self {
        Self::default()
    }

    /// Build from the raw side metadata fields attached to a buffer.
    pub fn from_side_data(
        iv: &[u8],
        key_id: &[u8],
        subsample_count: usize,
        subsample_map: &[u8],
    ) -> Result<Self> {
        Ok(Self {
            iv: iv.to_vec(),
            key_id: key_id.to_vec(),
            subsamples: SubsampleRange::parse_map(subsample_count, subsample_map)?,
            encrypted: true,
        })
    }

    /// A sample flagged unencrypted, or carrying a zero-length IV, passes through.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted && !self.iv.is_empty()
    }

    /// Check that the subsample ranges exactly cover `payload_len` bytes.
    pub fn validate(&self, payload_len: usize) -> Result<()> {
        validate_ranges(payload_len, &self.subsamples)
    }
}

pub(crate) fn validate_ranges(payload_len: usize, subsamples: &[SubsampleRange]) -> Result<()> {
    if subsamples.is_empty() {
        return Ok(());
    }

    let covered = subsamples.iter().map(SubsampleRange::len).sum::<usize>();

    if covered != payload_len {
        return Err(CencError::Subsample(format!(
            "subsample ranges cover {} bytes but payload has {} bytes",
            covered, payload_len
        )));
    }

    Ok(())
}
