//! Gather and scatter cipher byte ranges.
//!
//! A sample payload interleaves clear and cipher ranges. Decryption primitives
//! want the cipher bytes as one contiguous buffer, so [`gather`] copies them
//! out and [`scatter`] writes the decrypted bytes back in place. With no
//! subsamples the whole payload is a single cipher block.

use crate::{
    error::{CencError, Result},
    sample::{SubsampleRange, validate_ranges},
};

/// Number of cipher bytes [`gather`] produces for a payload.
pub fn cipher_len(payload_len: usize, subsamples: &[SubsampleRange]) -> usize {
    if subsamples.is_empty() {
        payload_len
    } else {
        subsamples.iter().map(|range| range.cipher as usize).sum()
    }
}

/// Copy every cipher range of `payload` into one contiguous buffer.
pub fn gather(payload: &[u8], subsamples: &[SubsampleRange]) -> Result<Vec<u8>> {
    validate_ranges(payload.len(), subsamples)?;

    if subsamples.is_empty() {
        return Ok(payload.to_vec());
    }

    let mut out = Vec::with_capacity(cipher_len(payload.len(), subsamples));
    let mut offset = 0usize;

    for range in subsamples {
        offset += range.clear as usize;
        let cipher = range.cipher as usize;

        if cipher > 0 {
            out.extend_from_slice(&payload[offset..offset + cipher]);
        }

        offset += cipher;
    }

    Ok(out)
}

/// Write a contiguous decrypted buffer back into the cipher ranges of `payload`.
pub fn scatter(payload: &mut [u8], subsamples: &[SubsampleRange], decrypted: &[u8]) -> Result<()> {
    validate_ranges(payload.len(), subsamples)?;

    let expected = cipher_len(payload.len(), subsamples);

    if decrypted.len() != expected {
        return Err(CencError::Subsample(format!(
            "decrypted buffer has {} bytes but subsamples describe {} cipher bytes",
            decrypted.len(),
            expected
        )));
    }

    if subsamples.is_empty() {
        payload.copy_from_slice(decrypted);
        return Ok(());
    }

    let mut offset = 0usize;
    let mut consumed = 0usize;

    for range in subsamples {
        offset += range.clear as usize;
        let cipher = range.cipher as usize;

        if cipher > 0 {
            payload[offset..offset + cipher].copy_from_slice(&decrypted[consumed..consumed + cipher]);
            consumed += cipher;
        }

        offset += cipher;
    }

    Ok(())
}
