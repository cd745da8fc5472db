//! In-process clear-key sessions.
//!
//! Keys are supplied up front as KID/key pairs, the way clear-key licences
//! are usually handed out for testing and for unprotected-key deployments.

use super::{
    DecryptCode, DecryptOutput, DrmSession, DrmSessionManager, SessionFailure,
    SessionFailureReason, SessionRequest, codes,
};
use log::{debug, warn};
use std::{collections::HashMap, sync::Arc};
use streamgate_cenc::{
    CencError, Cipher, ProtectionSystem, Result, Scheme, SubsampleRange, parse_hex_16, pssh,
};

/// Builder for [`ClearKeySessionManager`].
///
/// ```
/// use streamgate::drm::ClearKeySessionManager;
///
/// let manager = ClearKeySessionManager::builder()
///     .key("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb")?
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct ClearKeySessionManagerBuilder {
    keys: HashMap<[u8; 16], [u8; 16]>,
    scheme: Scheme,
}

impl ClearKeySessionManagerBuilder {
    /// Add a KID/key pair given as 32 hex characters each.
    pub fn key(mut self, kid: &str, key: &str) -> Result<Self> {
        self.keys.insert(parse_hex_16(kid)?, parse_hex_16(key)?);
        Ok(self)
    }

    pub fn key_bytes(mut self, kid: [u8; 16], key: [u8; 16]) -> Self {
        self.keys.insert(kid, key);
        self
    }

    pub fn keys(mut self, keys: &HashMap<String, String>) -> Result<Self> {
        for (kid, key) in keys {
            self.keys.insert(parse_hex_16(kid)?, parse_hex_16(key)?);
        }
        Ok(self)
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn build(self) -> std::result::Result<ClearKeySessionManager, ClearKeyError> {
        if self.keys.is_empty() {
            return Err(ClearKeyError::NoKeys);
        }

        let mut ciphers = HashMap::with_capacity(self.keys.len());
        for (kid, key) in self.keys {
            ciphers.insert(kid, Cipher::new(self.scheme, &key)?);
        }

        Ok(ClearKeySessionManager {
            ciphers: Arc::new(ciphers),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClearKeyError {
    #[error("no decryption keys provided - use .key(kid, key) to add keys")]
    NoKeys,
    #[error(transparent)]
    Cenc(#[from] CencError),
}

/// Session manager backed by a fixed set of clear keys.
#[derive(Clone)]
pub struct ClearKeySessionManager {
    ciphers: Arc<HashMap<[u8; 16], Cipher>>,
}

impl ClearKeySessionManager {
    pub fn builder() -> ClearKeySessionManagerBuilder {
        ClearKeySessionManagerBuilder::default()
    }

    pub fn has_key(&self, kid: &[u8; 16]) -> bool {
        self.ciphers.contains_key(kid)
    }
}

impl DrmSessionManager for ClearKeySessionManager {
    fn create_session(
        &self,
        request: &SessionRequest<'_>,
    ) -> std::result::Result<Arc<dyn DrmSession>, SessionFailure> {
        if request.system != ProtectionSystem::ClearKey {
            return Err(SessionFailure::new(SessionFailureReason::UnsupportedSystem));
        }

        match pssh::key_ids(request.init_data) {
            Ok(kids) if !kids.is_empty() && !kids.iter().any(|kid| self.has_key(kid)) => {
                warn!(
                    "none of the licence key ids [{}] is known",
                    kids.iter().map(hex::encode).collect::<Vec<_>>().join(", ")
                );
                return Err(SessionFailure::new(SessionFailureReason::LicenceKeyMissing));
            }
            Ok(kids) => debug!("clear-key session for {} key id(s)", kids.len()),
            Err(e) => debug!("init data not a pssh box ({}), keys checked per sample", e),
        }

        Ok(Arc::new(ClearKeySession {
            ciphers: self.ciphers.clone(),
        }))
    }
}

pub struct ClearKeySession {
    ciphers: Arc<HashMap<[u8; 16], Cipher>>,
}

impl DrmSession for ClearKeySession {
    fn decrypt(
        &self,
        key_id: &[u8],
        iv: &[u8],
        data: &mut [u8],
        _subsamples: &[SubsampleRange],
    ) -> std::result::Result<DecryptOutput, DecryptCode> {
        let cipher = <[u8; 16]>::try_from(key_id)
            .ok()
            .and_then(|kid| self.ciphers.get(&kid))
            .ok_or(DecryptCode::Generic(codes::KEY_NOT_FOUND))?;

        cipher.decrypt(iv, data).map_err(|e| {
            debug!("clear-key decrypt failed: {}", e);
            DecryptCode::Generic(codes::GENERIC_FAILURE)
        })?;

        Ok(DecryptOutput::InPlace)
    }
}
