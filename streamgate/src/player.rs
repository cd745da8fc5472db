use std::time::Duration;

/// Profiling bucket the gate brackets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProfileBucket {
    LicenceAcquisition,
    DecryptVideo,
    DecryptAudio,
}

/// Player core as seen from the pipeline.
///
/// Every method has a neutral default so embedders implement only what they track.
pub trait PlayerContext: Send + Sync {
    /// False while the player is reconfiguring; session failures are not reported then.
    fn is_active(&self) -> bool {
        true
    }

    /// Licence came with the manifest, so acquisition is not profiled.
    fn licence_from_manifest(&self) -> bool {
        false
    }

    fn position(&self) -> Option<Duration> {
        None
    }

    fn duration(&self) -> Option<Duration> {
        None
    }

    fn profile_begin(&self, _bucket: ProfileBucket) {}

    fn profile_end(&self, _bucket: ProfileBucket) {}

    fn profile_error(&self, _bucket: ProfileBucket, _code: Option<i32>) {}
}

/// Player with no state of its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedPlayer;

impl PlayerContext for DetachedPlayer {}
