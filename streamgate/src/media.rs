//! Buffers, events and formats that travel through a stream.

use crate::drm::SecureToken;
use std::{fmt, time::Duration};
use streamgate_cenc::ProtectionSystem;
use thiserror::Error;

const TRANSPORT_STREAM_MIME: &str = "video/mpegts";

/// Elementary stream kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    /// Classify the codec a protected format wraps.
    pub fn from_original_media_type(mime: &str) -> Option<Self> {
        match mime {
            "audio/mpeg" | "audio/x-eac3" | "audio/x-gst-fourcc-ec_3" => Some(Self::Audio),
            "video/x-h264" | "video/x-h265" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Format of the data carried by a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct FormatDescription {
    pub mime: String,
    /// Codec wrapped by a protected format.
    pub original_media_type: Option<String>,
    pub protection_system: Option<ProtectionSystem>,
}

impl FormatDescription {
    pub fn new(mime: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            original_media_type: None,
            protection_system: None,
        }
    }

    /// Protected `application/x-cenc` format wrapping `original`.
    pub fn protected(original: impl Into<String>, system: ProtectionSystem) -> Self {
        Self {
            mime: "application/x-cenc".to_owned(),
            original_media_type: Some(original.into()),
            protection_system: Some(system),
        }
    }

    pub fn is_transport_stream(&self) -> bool {
        self.mime == TRANSPORT_STREAM_MIME
    }

    /// Media type of the codec, looking through protection.
    pub fn media_type(&self) -> Option<MediaType> {
        let mime = self.original_media_type.as_deref().unwrap_or(&self.mime);
        MediaType::from_original_media_type(mime).or_else(|| {
            if mime.starts_with("video/") {
                Some(MediaType::Video)
            } else if mime.starts_with("audio/") {
                Some(MediaType::Audio)
            } else {
                None
            }
        })
    }
}

/// Sample payload plus timing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaBuffer {
    pub data: Vec<u8>,
    pub pts: Option<Duration>,
    pub dts: Option<Duration>,
    pub duration: Option<Duration>,
    pub discont: bool,
    /// Set when the payload was decrypted into protected memory.
    pub secure: Option<SecureToken>,
}

impl MediaBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: Duration) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Playback segment sent ahead of the first buffer after a reset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub start: Duration,
    pub rate: f64,
    pub applied_rate: f64,
}

/// Structural event delivered in band with buffers.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    StreamStart { stream_id: String },
    Caps(FormatDescription),
    Segment(Segment),
    FlushStart,
    FlushStop { reset_time: bool },
    Eos,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StreamStart { .. } => "stream-start",
            Self::Caps(_) => "caps",
            Self::Segment(_) => "segment",
            Self::FlushStart => "flush-start",
            Self::FlushStop { .. } => "flush-stop",
            Self::Eos => "eos",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum QueueItem {
    Buffer(MediaBuffer),
    Event(StreamEvent),
}

/// Reason a buffer did not make it downstream.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flushing")]
    Flushing,
    #[error("not linked")]
    NotLinked,
    #[error("not supported")]
    NotSupported,
    #[error("sample dropped")]
    Dropped,
    #[error("stream error")]
    Error,
}

/// Opaque handle of the platform video decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DecoderHandle(pub u64);

/// The rest of the media pipeline.
///
/// Called from the drain thread of each stream, and from the flushing
/// thread for flush signals.
pub trait Downstream: Send + Sync {
    fn push_buffer(&self, media: MediaType, buffer: MediaBuffer) -> Result<(), FlowError>;

    fn push_event(&self, media: MediaType, event: StreamEvent) -> bool;

    fn decoder_handle(&self) -> Option<DecoderHandle> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_media_type() {
        assert_eq!(MediaType::from_original_media_type("audio/mpeg"), Some(MediaType::Audio));
        assert_eq!(
            MediaType::from_original_media_type("audio/x-gst-fourcc-ec_3"),
            Some(MediaType::Audio)
        );
        assert_eq!(MediaType::from_original_media_type("video/x-h265"), Some(MediaType::Video));
        assert_eq!(MediaType::from_original_media_type("video/x-vp9"), None);
    }

    #[test]
    fn test_format_media_type() {
        let format = FormatDescription::protected("video/x-h264", ProtectionSystem::Widevine);
        assert_eq!(format.media_type(), Some(MediaType::Video));
        assert!(!format.is_transport_stream());
        assert_eq!(FormatDescription::new("audio/x-opus").media_type(), Some(MediaType::Audio));
        assert_eq!(FormatDescription::new("application/ttml+xml").media_type(), None);
        assert!(FormatDescription::new("video/mpegts").is_transport_stream());
    }
}
