//! Key-exchange gate in front of sample decryption.
//!
//! Samples that arrive before a session is bound block here until protection
//! metadata produces one, or until the pipeline disables waiting. Decrypt
//! failures are counted and escalated once past a threshold.

use super::{
    DecryptCode, DecryptOutput, DrmSession, DrmSessionManager, SessionRequest,
};
use crate::{
    media::{FlowError, FormatDescription, MediaBuffer, MediaType},
    notify::{Diagnostic, ErrorKind, ErrorReport, Notifier},
    player::{PlayerContext, ProfileBucket},
};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use streamgate_cenc::{EncryptedSampleDescriptor, ProtectionSystem, codec};
use thiserror::Error;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateConfig {
    /// Consecutive decrypt failures before one fatal report.
    pub decrypt_failure_threshold: u32,
    /// Consecutive output protection failures before one diagnostic.
    pub output_protection_threshold: u32,
    /// Allow a later fatal report once a decrypt succeeds again.
    pub rearm_error_report_on_success: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            decrypt_failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            output_protection_threshold: DEFAULT_FAILURE_THRESHOLD,
            rearm_error_report_on_success: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Pending,
    Bound,
    Failed,
}

/// Escalated decrypt failure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FatalDecrypt {
    #[error("HDCP Authentication Failure")]
    HdcpAuthentication,
    #[error("HDCP Compliance Check Failure")]
    HdcpCompliance,
    #[error("Decrypt Error: code {0}")]
    Decrypt(i32),
}

impl FatalDecrypt {
    fn from_code(code: DecryptCode) -> Self {
        match code {
            DecryptCode::HdcpAuthentication => Self::HdcpAuthentication,
            DecryptCode::HdcpCompliance => Self::HdcpCompliance,
            other => Self::Decrypt(other.raw()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HdcpAuthentication => ErrorKind::HdcpAuthentication,
            Self::HdcpCompliance => ErrorKind::HdcpCompliance,
            Self::Decrypt(_) => ErrorKind::DecryptFailure,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::HdcpAuthentication => DecryptCode::HdcpAuthentication.raw(),
            Self::HdcpCompliance => DecryptCode::HdcpCompliance.raw(),
            Self::Decrypt(code) => *code,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("waiting for a drm session was cancelled")]
    KeyWaitAborted,
    #[error("no drm session is available")]
    SessionUnavailable,
    #[error("malformed subsample metadata: {0}")]
    MalformedSubsamples(String),
    #[error("decrypt failed with code {code}")]
    DecryptFailed { code: i32 },
    #[error("output protection not established")]
    OutputProtection,
    #[error("{0}")]
    Fatal(FatalDecrypt),
}

impl GateError {
    /// How the stream should treat the dropped sample.
    pub fn flow(&self) -> FlowError {
        match self {
            Self::KeyWaitAborted | Self::SessionUnavailable | Self::MalformedSubsamples(_) => {
                FlowError::NotSupported
            }
            Self::DecryptFailed { .. } | Self::OutputProtection => FlowError::Dropped,
            Self::Fatal(_) => FlowError::Error,
        }
    }
}

struct ProtectionContext {
    state: SessionState,
    session: Option<Arc<dyn DrmSession>>,
    media_type: Option<MediaType>,
    can_wait: bool,
    consecutive_decrypt_failures: u32,
    consecutive_output_protection_failures: u32,
    error_already_reported: bool,
    first_sample_profiled: bool,
}

/// Per-stream decryption stage bound to one protection system.
pub struct DecryptionGate {
    system: ProtectionSystem,
    config: GateConfig,
    manager: Arc<dyn DrmSessionManager>,
    player: Arc<dyn PlayerContext>,
    notifier: Notifier,
    context: Mutex<ProtectionContext>,
    bound: Condvar,
}

impl DecryptionGate {
    pub fn new(
        system: ProtectionSystem,
        media_type: Option<MediaType>,
        manager: Arc<dyn DrmSessionManager>,
        player: Arc<dyn PlayerContext>,
        notifier: Notifier,
        config: GateConfig,
    ) -> Self {
        Self {
            system,
            config,
            manager,
            player,
            notifier,
            context: Mutex::new(ProtectionContext {
                state: SessionState::Unbound,
                session: None,
                media_type,
                can_wait: false,
                consecutive_decrypt_failures: 0,
                consecutive_output_protection_failures: 0,
                error_already_reported: false,
                first_sample_profiled: false,
            }),
            bound: Condvar::new(),
        }
    }

    pub fn system(&self) -> ProtectionSystem {
        self.system
    }

    pub fn session_state(&self) -> SessionState {
        self.context.lock().state
    }

    pub fn media_type(&self) -> Option<MediaType> {
        self.context.lock().media_type
    }

    pub fn decrypt_failures(&self) -> u32 {
        self.context.lock().consecutive_decrypt_failures
    }

    pub fn output_protection_failures(&self) -> u32 {
        self.context.lock().consecutive_output_protection_failures
    }

    pub fn error_reported(&self) -> bool {
        self.context.lock().error_already_reported
    }

    /// Let samples wait for a session.
    pub fn activate(&self) {
        self.context.lock().can_wait = true;
    }

    /// Stop waiting and release every blocked sample.
    pub fn deactivate(&self) {
        let mut ctx = self.context.lock();
        ctx.can_wait = false;
        self.bound.notify_all();
    }

    /// Clear counters and the report latch for a reconfigured stream.
    pub fn reset(&self) {
        let mut ctx = self.context.lock();
        ctx.consecutive_decrypt_failures = 0;
        ctx.consecutive_output_protection_failures = 0;
        ctx.error_already_reported = false;
    }

    /// Pick up the media type from the negotiated format if not known yet.
    pub fn set_format(&self, format: &FormatDescription) {
        let mut ctx = self.context.lock();

        if ctx.media_type.is_none() {
            ctx.media_type = format.media_type();

            match ctx.media_type {
                Some(media_type) => debug!("{} gate handles {}", self.system, media_type),
                None => warn!(
                    "{} gate cannot classify format {}",
                    self.system,
                    format.original_media_type.as_deref().unwrap_or(&format.mime)
                ),
            }
        }
    }

    /// Bind a session from protection metadata for `system_id`.
    pub fn on_protection_metadata(
        &self,
        system_id: &str,
        init_data: &[u8],
        media_type: Option<MediaType>,
    ) {
        if !self.system.matches(system_id) {
            debug!(
                "ignoring protection metadata for {}, gate is bound to {}",
                system_id, self.system
            );
            return;
        }

        let (previous, media_type) = {
            let mut ctx = self.context.lock();
            let previous = ctx.state;

            match previous {
                SessionState::Failed => {
                    debug!("{} session already failed, ignoring metadata", self.system);
                    return;
                }
                SessionState::Pending => {
                    debug!("{} session creation already in progress", self.system);
                    return;
                }
                SessionState::Unbound => ctx.state = SessionState::Pending,
                SessionState::Bound => info!("{} session rebinding", self.system),
            }

            if ctx.media_type.is_none() {
                ctx.media_type = media_type;
            }

            (previous, ctx.media_type)
        };

        let profile = !self.player.licence_from_manifest();
        if profile {
            self.player.profile_begin(ProfileBucket::LicenceAcquisition);
        }

        let result = self.manager.create_session(&SessionRequest {
            system: self.system,
            init_data,
            media_type,
        });

        let failure = {
            let mut ctx = self.context.lock();

            match result {
                Ok(session) => {
                    ctx.session = Some(session);
                    ctx.state = SessionState::Bound;
                    self.bound.notify_all();
                    None
                }
                Err(failure) => {
                    if previous == SessionState::Bound {
                        warn!(
                            "{} session rebind failed, keeping the current session: {}",
                            self.system, failure
                        );
                    } else {
                        ctx.state = SessionState::Failed;
                        ctx.session = None;
                        ctx.can_wait = false;
                        self.bound.notify_all();
                    }
                    Some(failure)
                }
            }
        };

        match failure {
            None => {
                if profile {
                    self.player.profile_end(ProfileBucket::LicenceAcquisition);
                }
                info!("{} session bound for {:?}", self.system, media_type);
            }
            Some(failure) => {
                if profile {
                    self.player
                        .profile_error(ProfileBucket::LicenceAcquisition, failure.code);
                }

                if self.player.is_active() {
                    error!("{} session creation failed: {}", self.system, failure);
                    self.notifier.error(ErrorReport {
                        kind: ErrorKind::SessionCreation,
                        media_type,
                        code: failure.code,
                        message: failure.to_string(),
                    });
                } else {
                    warn!(
                        "{} session creation failed while inactive, not reported: {}",
                        self.system, failure
                    );
                }
            }
        }
    }

    /// Decrypt `buffer` in place according to `sample`.
    ///
    /// Blocks while no session is bound and waiting is allowed. On error the
    /// sample must be dropped.
    pub fn on_sample(
        &self,
        sample: &EncryptedSampleDescriptor,
        buffer: &mut MediaBuffer,
    ) -> Result<(), GateError> {
        if !sample.is_encrypted() {
            trace!("clear sample of {} bytes passes through", buffer.data.len());
            return Ok(());
        }

        let (session, first_sample) = self.wait_for_session()?;

        let mut cipher = codec::gather(&buffer.data, &sample.subsamples)
            .map_err(|e| GateError::MalformedSubsamples(e.to_string()))?;

        let bucket = self.decrypt_bucket();
        if first_sample {
            self.player.profile_begin(bucket);
        }

        let result = session.decrypt(&sample.key_id, &sample.iv, &mut cipher, &sample.subsamples);

        let result = match result {
            Ok(DecryptOutput::InPlace) => {
                codec::scatter(&mut buffer.data, &sample.subsamples, &cipher)
                    .map_err(|e| GateError::MalformedSubsamples(e.to_string()))?;
                Ok(())
            }
            Ok(DecryptOutput::Secure(token)) => {
                buffer.secure = Some(token);
                Ok(())
            }
            Err(code) => Err(code),
        };

        if first_sample {
            match result {
                Ok(()) => self.player.profile_end(bucket),
                Err(code) => self.player.profile_error(bucket, Some(code.raw())),
            }
        }

        self.record_outcome(result)
    }

    fn wait_for_session(&self) -> Result<(Arc<dyn DrmSession>, bool), GateError> {
        let mut ctx = self.context.lock();

        loop {
            match ctx.state {
                SessionState::Bound => break,
                SessionState::Failed => return Err(GateError::SessionUnavailable),
                SessionState::Unbound | SessionState::Pending => {
                    if !ctx.can_wait {
                        debug!("{} sample dropped, waiting is disabled", self.system);
                        return Err(GateError::KeyWaitAborted);
                    }

                    debug!("{} sample waiting for a session", self.system);
                    self.bound.wait(&mut ctx);
                }
            }
        }

        let session = ctx.session.clone().ok_or(GateError::SessionUnavailable)?;
        let first_sample = !ctx.first_sample_profiled;
        ctx.first_sample_profiled = true;
        Ok((session, first_sample))
    }

    fn decrypt_bucket(&self) -> ProfileBucket {
        match self.media_type() {
            Some(MediaType::Audio) => ProfileBucket::DecryptAudio,
            _ => ProfileBucket::DecryptVideo,
        }
    }

    fn record_outcome(&self, result: Result<(), DecryptCode>) -> Result<(), GateError> {
        let mut ctx = self.context.lock();

        let code = match result {
            Ok(()) => {
                ctx.consecutive_decrypt_failures = 0;
                ctx.consecutive_output_protection_failures = 0;
                if self.config.rearm_error_report_on_success && ctx.error_already_reported {
                    debug!("{} decrypt recovered, error reporting rearmed", self.system);
                    ctx.error_already_reported = false;
                }
                return Ok(());
            }
            Err(code) => code,
        };

        if code == DecryptCode::HdcpOutputProtection {
            ctx.consecutive_output_protection_failures += 1;
            warn!(
                "{} output protection failure {}/{}",
                self.system,
                ctx.consecutive_output_protection_failures,
                self.config.output_protection_threshold
            );

            if ctx.consecutive_output_protection_failures >= self.config.output_protection_threshold
            {
                let failures = ctx.consecutive_output_protection_failures;
                ctx.consecutive_output_protection_failures = 0;
                self.notifier.diagnostic(Diagnostic::OutputProtection {
                    media_type: ctx.media_type,
                    failures,
                });
            }

            return Err(GateError::OutputProtection);
        }

        ctx.consecutive_decrypt_failures += 1;
        warn!(
            "{} decrypt failed with code {} ({} consecutive)",
            self.system,
            code.raw(),
            ctx.consecutive_decrypt_failures
        );

        if ctx.consecutive_decrypt_failures >= self.config.decrypt_failure_threshold
            && !ctx.error_already_reported
        {
            ctx.error_already_reported = true;
            let fatal = FatalDecrypt::from_code(code);
            error!("{} {}", self.system, fatal);
            self.notifier.error(ErrorReport {
                kind: fatal.kind(),
                media_type: ctx.media_type,
                code: Some(fatal.code()),
                message: fatal.to_string(),
            });
            return Err(GateError::Fatal(fatal));
        }

        Err(GateError::DecryptFailed { code: code.raw() })
    }
}
