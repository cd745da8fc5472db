//! DRM session seam and the decryption gate built on it.
//!
//! The pipeline never talks to a CDM directly. A [`DrmSessionManager`] turns
//! protection metadata into a [`DrmSession`], and the [`DecryptionGate`]
//! decides when samples may be handed to it.

mod clearkey;
mod gate;

pub use clearkey::{
    ClearKeyError, ClearKeySession, ClearKeySessionManager, ClearKeySessionManagerBuilder,
};
pub use gate::{DecryptionGate, FatalDecrypt, GateConfig, GateError, SessionState};

use crate::media::MediaType;
use std::sync::Arc;
use streamgate_cenc::{ProtectionSystem, SubsampleRange};
use thiserror::Error;

/// Raw status codes shared with session implementations.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const HDCP_AUTHENTICATION_FAILURE: i32 = 1;
    pub const HDCP_OUTPUT_PROTECTION_FAILURE: i32 = 2;
    pub const HDCP_COMPLIANCE_CHECK_FAILURE: i32 = 3;
    pub const KEY_NOT_FOUND: i32 = 0x100;
    pub const GENERIC_FAILURE: i32 = -1;
}

/// Non-zero outcome of [`DrmSession::decrypt`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecryptCode {
    Generic(i32),
    HdcpAuthentication,
    HdcpOutputProtection,
    HdcpCompliance,
}

impl DecryptCode {
    /// `None` for success.
    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            codes::SUCCESS => None,
            codes::HDCP_AUTHENTICATION_FAILURE => Some(Self::HdcpAuthentication),
            codes::HDCP_OUTPUT_PROTECTION_FAILURE => Some(Self::HdcpOutputProtection),
            codes::HDCP_COMPLIANCE_CHECK_FAILURE => Some(Self::HdcpCompliance),
            other => Some(Self::Generic(other)),
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            Self::Generic(code) => *code,
            Self::HdcpAuthentication => codes::HDCP_AUTHENTICATION_FAILURE,
            Self::HdcpOutputProtection => codes::HDCP_OUTPUT_PROTECTION_FAILURE,
            Self::HdcpCompliance => codes::HDCP_COMPLIANCE_CHECK_FAILURE,
        }
    }
}

/// Handle to plaintext held in protected memory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SecureToken(pub Vec<u8>);

/// Where the plaintext ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecryptOutput {
    /// Written back into the buffer passed in.
    InPlace,
    /// Kept in protected memory; the buffer is left untouched.
    Secure(SecureToken),
}

/// A bound licence able to decrypt samples.
pub trait DrmSession: Send + Sync {
    /// Decrypt the gathered cipher bytes of one sample.
    ///
    /// `subsamples` describes the layout of the original payload for sessions
    /// that need it; `data` holds only the cipher bytes.
    fn decrypt(
        &self,
        key_id: &[u8],
        iv: &[u8],
        data: &mut [u8],
        subsamples: &[SubsampleRange],
    ) -> Result<DecryptOutput, DecryptCode>;
}

#[derive(Clone, Copy, Debug)]
pub struct SessionRequest<'a> {
    pub system: ProtectionSystem,
    pub init_data: &'a [u8],
    pub media_type: Option<MediaType>,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SessionFailureReason {
    #[error("licence does not carry any requested key")]
    LicenceKeyMissing,
    #[error("licence request failed")]
    LicenceRequestFailed,
    #[error("protection system not supported")]
    UnsupportedSystem,
    #[error("session creation failed")]
    Unknown,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct SessionFailure {
    pub reason: SessionFailureReason,
    pub code: Option<i32>,
}

impl SessionFailure {
    pub fn new(reason: SessionFailureReason) -> Self {
        Self { reason, code: None }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

/// Negotiates licences and hands out sessions.
pub trait DrmSessionManager: Send + Sync {
    fn create_session(
        &self,
        request: &SessionRequest<'_>,
    ) -> Result<Arc<dyn DrmSession>, SessionFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_code_raw() {
        assert_eq!(DecryptCode::from_raw(0), None);
        assert_eq!(DecryptCode::from_raw(2), Some(DecryptCode::HdcpOutputProtection));
        assert_eq!(DecryptCode::from_raw(-7), Some(DecryptCode::Generic(-7)));
        for code in [1, 2, 3, 42] {
            assert_eq!(DecryptCode::from_raw(code).map(|c| c.raw()), Some(code));
        }
    }
}
