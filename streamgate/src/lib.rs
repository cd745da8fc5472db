//! DRM gated decryption and bounded stream queues for a media pipeline.
//!
//! Samples handed over by a player core pass through a
//! [`DecryptionGate`](drm::DecryptionGate) when encrypted, then into a
//! per-stream [`StreamQueue`](queue::StreamQueue) whose drain thread feeds the
//! [`Downstream`](media::Downstream) consumer. A
//! [`PipelineController`](pipeline::PipelineController) owns the lifecycle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamgate::{
//!     config::Config,
//!     drm::ClearKeySessionManager,
//!     media::{Downstream, FlowError, FormatDescription, MediaBuffer, MediaType, StreamEvent},
//!     notify,
//!     pipeline::{PipelineController, Sample, StreamFormats},
//! };
//! use streamgate_cenc::ProtectionSystem;
//!
//! struct Sink;
//!
//! impl Downstream for Sink {
//!     fn push_buffer(&self, _: MediaType, _: MediaBuffer) -> Result<(), FlowError> {
//!         Ok(())
//!     }
//!
//!     fn push_event(&self, _: MediaType, _: StreamEvent) -> bool {
//!         true
//!     }
//! }
//!
//! let manager = ClearKeySessionManager::builder()
//!     .key("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb")?
//!     .build()?;
//! let (notifier, notices) = notify::channel();
//! let pipeline = PipelineController::new(Config::default(), Arc::new(Sink), notifier)
//!     .with_session_manager(Arc::new(manager));
//!
//! pipeline.tune()?;
//! pipeline.configure(StreamFormats {
//!     video: Some(FormatDescription::protected("video/x-h264", ProtectionSystem::ClearKey)),
//!     audio: None,
//! })?;
//! pipeline.start()?;
//! pipeline.on_protection_metadata(MediaType::Video, ProtectionSystem::ClearKey.system_id(), &[]);
//! pipeline.route_sample(MediaType::Video, Sample::clear(MediaBuffer::new(vec![0; 188])))?;
//! pipeline.stop();
//! # drop(notices);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod drm;
pub mod media;
pub mod notify;
pub mod pipeline;
pub mod player;
pub mod queue;

#[doc(hidden)]
pub mod logger;

pub use streamgate_cenc as cenc;
