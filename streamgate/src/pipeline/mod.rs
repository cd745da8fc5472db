//! Lifecycle orchestration and sample routing.

mod state;

pub use state::PipelineState;

use crate::{
    config::Config,
    drm::{DecryptionGate, DrmSessionManager, GateError},
    media::{DecoderHandle, Downstream, FormatDescription, MediaBuffer, MediaType},
    notify::Notifier,
    player::{DetachedPlayer, PlayerContext},
    queue::{PendingEvents, StreamQueue},
};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::{collections::BTreeMap, io, sync::Arc, time::Duration};
use streamgate_cenc::{EncryptedSampleDescriptor, ProtectionSystem};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot move pipeline from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("pipeline is shutting down")]
    ShuttingDown,
    #[error("pipeline failed to tune")]
    Failed,
    #[error("no {0} stream is configured")]
    StreamNotConfigured(MediaType),
    #[error("{0} protection requires a drm session manager")]
    MissingSessionManager(ProtectionSystem),
    #[error("encrypted {0} sample but the stream has no decryption stage")]
    NoDecryptor(MediaType),
    #[error("{media} sample dropped: {source}")]
    Decrypt { media: MediaType, source: GateError },
    #[error("cannot start drain thread: {0}")]
    Spawn(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Formats announced by the player core when it configures the pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamFormats {
    pub video: Option<FormatDescription>,
    pub audio: Option<FormatDescription>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamLayout {
    /// One transport stream carries every elementary stream.
    Muxed,
    /// One queue per elementary stream.
    Demuxed,
}

/// A sample handed over by the player core.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub buffer: MediaBuffer,
    pub encryption: Option<EncryptedSampleDescriptor>,
}

impl Sample {
    pub fn clear(buffer: MediaBuffer) -> Self {
        Self {
            buffer,
            encryption: None,
        }
    }

    pub fn encrypted(buffer: MediaBuffer, encryption: EncryptedSampleDescriptor) -> Self {
        Self {
            buffer,
            encryption: Some(encryption),
        }
    }
}

#[derive(Clone)]
struct Stream {
    queue: Arc<StreamQueue>,
    gate: Option<Arc<DecryptionGate>>,
}

struct Inner {
    state: PipelineState,
    layout: Option<StreamLayout>,
    formats: StreamFormats,
    streams: BTreeMap<MediaType, Stream>,
    /// Audio decryption stage kept bound while trick play disables audio.
    parked_audio_gate: Option<Arc<DecryptionGate>>,
    audio_enabled: bool,
    rate: f64,
    position: Duration,
    seek_flush: bool,
}

/// Owns the stream queues and decryption stages of one playback session.
pub struct PipelineController {
    config: Config,
    downstream: Arc<dyn Downstream>,
    notifier: Notifier,
    player: Arc<dyn PlayerContext>,
    manager: Option<Arc<dyn DrmSessionManager>>,
    inner: Mutex<Inner>,
    state_changed: Condvar,
}

impl PipelineController {
    pub fn new(config: Config, downstream: Arc<dyn Downstream>, notifier: Notifier) -> Self {
        Self {
            config,
            downstream,
            notifier,
            player: Arc::new(DetachedPlayer),
            manager: None,
            inner: Mutex::new(Inner {
                state: PipelineState::None,
                layout: None,
                formats: StreamFormats::default(),
                streams: BTreeMap::new(),
                parked_audio_gate: None,
                audio_enabled: false,
                rate: 1.0,
                position: Duration::ZERO,
                seek_flush: false,
            }),
            state_changed: Condvar::new(),
        }
    }

    pub fn with_player(mut self, player: Arc<dyn PlayerContext>) -> Self {
        self.player = player;
        self
    }

    pub fn with_session_manager(mut self, manager: Arc<dyn DrmSessionManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.inner.lock().state
    }

    pub fn layout(&self) -> Option<StreamLayout> {
        self.inner.lock().layout
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().rate
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.inner.lock().audio_enabled
    }

    pub fn stream_queue(&self, media: MediaType) -> Option<Arc<StreamQueue>> {
        self.inner
            .lock()
            .streams
            .get(&media)
            .map(|stream| stream.queue.clone())
    }

    /// Decryption stage of `media`, including an audio stage parked by trick play.
    pub fn decryption_gate(&self, media: MediaType) -> Option<Arc<DecryptionGate>> {
        Self::gate_of(&self.inner.lock(), media)
    }

    fn gate_of(inner: &Inner, key: MediaType) -> Option<Arc<DecryptionGate>> {
        match inner.streams.get(&key) {
            Some(stream) => stream.gate.clone(),
            None if key == MediaType::Audio => inner.parked_audio_gate.clone(),
            None => None,
        }
    }

    fn stream_key(inner: &Inner, media: MediaType) -> MediaType {
        match inner.layout {
            Some(StreamLayout::Muxed) => MediaType::Video,
            _ => media,
        }
    }

    fn transition(&self, inner: &mut Inner, next: PipelineState) -> Result<()> {
        if !inner.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: inner.state,
                to: next,
            });
        }

        debug!("pipeline {} -> {}", inner.state, next);
        inner.state = next;
        self.state_changed.notify_all();
        Ok(())
    }

    pub fn tune(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, PipelineState::Tuning)
    }

    pub fn tune_failed(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, PipelineState::Error)?;
        warn!("tune failed, pipeline in error state");
        Ok(())
    }

    /// Create queues and decryption stages for the announced formats.
    pub fn configure(&self, formats: StreamFormats) -> Result<()> {
        let mut inner = self.inner.lock();

        if !inner.state.can_transition_to(PipelineState::Configured) {
            return Err(PipelineError::InvalidTransition {
                from: inner.state,
                to: PipelineState::Configured,
            });
        }

        let layout = if formats
            .video
            .as_ref()
            .is_some_and(FormatDescription::is_transport_stream)
        {
            StreamLayout::Muxed
        } else {
            StreamLayout::Demuxed
        };

        let mut streams = BTreeMap::new();

        if let Some(format) = &formats.video {
            streams.insert(MediaType::Video, self.create_stream(MediaType::Video, format)?);
        }

        let audio_enabled = layout == StreamLayout::Demuxed && inner.rate == 1.0;

        if let Some(format) = &formats.audio {
            if audio_enabled {
                streams.insert(MediaType::Audio, self.create_stream(MediaType::Audio, format)?);
            } else if layout == StreamLayout::Muxed {
                debug!("audio travels inside the transport stream");
            }
        }

        info!(
            "configured {:?} pipeline with {} stream(s)",
            layout,
            streams.len()
        );

        inner.layout = Some(layout);
        inner.formats = formats;
        inner.streams = streams;
        inner.audio_enabled = audio_enabled && inner.streams.contains_key(&MediaType::Audio);
        self.transition(&mut inner, PipelineState::Configured)
    }

    fn create_stream(&self, media: MediaType, format: &FormatDescription) -> Result<Stream> {
        Ok(Stream {
            queue: self.create_queue(media, format),
            gate: self.create_gate(media, format)?,
        })
    }

    fn create_queue(&self, media: MediaType, format: &FormatDescription) -> Arc<StreamQueue> {
        let queue = Arc::new(StreamQueue::new(
            media,
            self.config.queue_capacity,
            self.downstream.clone(),
        ));
        queue.set_format(format.clone());
        queue
    }

    fn create_gate(
        &self,
        media: MediaType,
        format: &FormatDescription,
    ) -> Result<Option<Arc<DecryptionGate>>> {
        let gate = match format.protection_system.or(self.config.protection_system) {
            Some(system) => {
                let manager = self
                    .manager
                    .clone()
                    .ok_or(PipelineError::MissingSessionManager(system))?;
                let gate = DecryptionGate::new(
                    system,
                    Some(media),
                    manager,
                    self.player.clone(),
                    self.notifier.clone(),
                    self.config.gate_config(),
                );
                gate.set_format(format);
                Some(Arc::new(gate))
            }
            None => None,
        };

        Ok(gate)
    }

    fn activate_stream(stream: &Stream, rate: f64) -> Result<()> {
        stream.queue.set_rate(rate);
        stream.queue.mark_pending(PendingEvents::START);
        stream.queue.start()?;

        if let Some(gate) = &stream.gate {
            gate.activate();
        }

        Ok(())
    }

    /// Start the drain threads and let samples flow.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if !inner.state.can_transition_to(PipelineState::Ready) {
            return Err(PipelineError::InvalidTransition {
                from: inner.state,
                to: PipelineState::Ready,
            });
        }

        for stream in inner.streams.values() {
            Self::activate_stream(stream, inner.rate)?;
        }

        self.transition(&mut inner, PipelineState::Ready)
    }

    pub fn play(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, PipelineState::Playing)
    }

    /// Block until the pipeline reaches `target` or can no longer get there.
    pub fn wait_for_state(&self, target: PipelineState) -> PipelineState {
        let mut inner = self.inner.lock();

        while inner.state < target && !inner.state.is_terminal() {
            self.state_changed.wait(&mut inner);
        }

        inner.state
    }

    /// Like [`wait_for_state`](Self::wait_for_state), giving up after `timeout`.
    pub fn wait_for_state_timeout(
        &self,
        target: PipelineState,
        timeout: Duration,
    ) -> PipelineState {
        let mut inner = self.inner.lock();

        while inner.state < target && !inner.state.is_terminal() {
            if self
                .state_changed
                .wait_for(&mut inner, timeout)
                .timed_out()
            {
                break;
            }
        }

        inner.state
    }

    fn stream_for(&self, media: MediaType) -> Result<Option<Stream>> {
        let mut inner = self.inner.lock();

        loop {
            match inner.state {
                PipelineState::Ready | PipelineState::Playing => break,
                PipelineState::ShuttingDown => return Err(PipelineError::ShuttingDown),
                PipelineState::Error => return Err(PipelineError::Failed),
                _ => {
                    trace!("{} sample waiting for the pipeline to be ready", media);
                    self.state_changed.wait(&mut inner);
                }
            }
        }

        let key = Self::stream_key(&inner, media);

        if key == MediaType::Audio && !inner.audio_enabled {
            return Ok(None);
        }

        inner
            .streams
            .get(&key)
            .cloned()
            .map(Some)
            .ok_or(PipelineError::StreamNotConfigured(media))
    }

    /// Decrypt if needed and queue one sample.
    ///
    /// Blocks until the pipeline is ready, while waiting for a key, and while
    /// the stream queue is full.
    pub fn route_sample(&self, media: MediaType, sample: Sample) -> Result<()> {
        let Some(stream) = self.stream_for(media)? else {
            trace!("{} disabled, sample dropped", media);
            return Ok(());
        };

        let mut buffer = sample.buffer;

        if let Some(encryption) = sample.encryption.filter(|e| e.is_encrypted()) {
            let gate = stream.gate.as_ref().ok_or(PipelineError::NoDecryptor(media))?;
            gate.on_sample(&encryption, &mut buffer)
                .map_err(|source| PipelineError::Decrypt { media, source })?;
        }

        if !stream.queue.push_data(buffer) {
            trace!("{} sample discarded by a flushing queue", media);
        }

        Ok(())
    }

    /// Copy a raw payload into a new buffer and route it.
    pub fn send_copy(
        &self,
        media: MediaType,
        data: &[u8],
        pts: Duration,
        dts: Duration,
        duration: Duration,
    ) -> Result<()> {
        let buffer = MediaBuffer::new(data.to_vec())
            .with_pts(pts)
            .with_dts(dts)
            .with_duration(duration);
        self.route_sample(media, Sample::clear(buffer))
    }

    /// Forward protection metadata to the stage of `media`.
    pub fn on_protection_metadata(&self, media: MediaType, system_id: &str, init_data: &[u8]) {
        let gate = {
            let inner = self.inner.lock();
            Self::gate_of(&inner, Self::stream_key(&inner, media))
        };

        match gate {
            Some(gate) => gate.on_protection_metadata(system_id, init_data, Some(media)),
            None => debug!("{} has no decryption stage, metadata ignored", media),
        }
    }

    /// Muxed audio has no queue of its own; its timeline lives in the
    /// transport stream carried by the video queue.
    fn is_muxed_audio(&self, media: MediaType) -> bool {
        media == MediaType::Audio && self.layout() == Some(StreamLayout::Muxed)
    }

    /// Next buffer of `media` starts a new segment.
    ///
    /// Ignored for audio inside a transport stream.
    pub fn discontinuity(&self, media: MediaType) {
        if self.is_muxed_audio(media) {
            debug!("audio discontinuity ignored, audio is muxed into video");
            return;
        }

        match self.stream_queue(media) {
            Some(queue) => queue.mark_pending(PendingEvents::RESYNC),
            None => debug!("discontinuity for unconfigured {}", media),
        }
    }

    /// Queue end of stream for `media`.
    ///
    /// Audio inside a transport stream is a no-op: ending the shared queue
    /// would also end video.
    pub fn end_of_stream(&self, media: MediaType) -> Result<()> {
        if self.is_muxed_audio(media) {
            debug!("audio end of stream ignored, audio is muxed into video");
            return Ok(());
        }

        let queue = self
            .stream_queue(media)
            .ok_or(PipelineError::StreamNotConfigured(media))?;
        queue.push_eos();
        Ok(())
    }

    /// Enable audio only at normal rate.
    pub fn update_rate(&self, rate: f64) -> Result<()> {
        let removed = {
            let mut inner = self.inner.lock();

            if inner.state.is_terminal() {
                return Err(PipelineError::ShuttingDown);
            }

            inner.rate = rate;
            for stream in inner.streams.values() {
                stream.queue.set_rate(rate);
            }

            if inner.layout != Some(StreamLayout::Demuxed) {
                return Ok(());
            }

            let Some(format) = inner.formats.audio.clone() else {
                return Ok(());
            };

            let enable = rate == 1.0;

            if enable && !inner.audio_enabled {
                let gate = match inner.parked_audio_gate.take() {
                    Some(gate) => Some(gate),
                    None => self.create_gate(MediaType::Audio, &format)?,
                };
                let stream = Stream {
                    queue: self.create_queue(MediaType::Audio, &format),
                    gate,
                };

                if inner.state.accepts_samples() {
                    Self::activate_stream(&stream, rate)?;
                }

                info!("audio enabled at rate {}", rate);
                inner.streams.insert(MediaType::Audio, stream);
                inner.audio_enabled = true;
                None
            } else if !enable && inner.audio_enabled {
                info!("audio disabled at rate {}", rate);
                inner.audio_enabled = false;
                let removed = inner.streams.remove(&MediaType::Audio);

                // the gate keeps its session binding, only the queue goes away
                inner.parked_audio_gate = removed.as_ref().and_then(|stream| stream.gate.clone());
                if let Some(gate) = &inner.parked_audio_gate {
                    gate.deactivate();
                }
                removed
            } else {
                None
            }
        };

        if let Some(stream) = removed {
            stream.queue.shutdown();
        }

        Ok(())
    }

    /// Flush every stream for a seek to `position` at `rate`.
    pub fn flush(&self, position: Duration, rate: f64) -> Result<()> {
        let (streams, rate_changed) = {
            let mut inner = self.inner.lock();

            if inner.state.is_terminal() {
                return Err(PipelineError::ShuttingDown);
            }

            if inner.seek_flush {
                debug!("flush already in progress");
                return Ok(());
            }

            inner.seek_flush = true;
            inner.position = position;
            (
                inner.streams.values().cloned().collect::<Vec<_>>(),
                inner.rate != rate,
            )
        };

        info!("flushing to {:?} at rate {}", position, rate);

        for stream in &streams {
            stream.queue.flush_with(PendingEvents::RESYNC);
        }

        let result = if rate_changed {
            self.update_rate(rate)
        } else {
            Ok(())
        };

        self.inner.lock().seek_flush = false;
        result
    }

    /// Tear everything down and release every blocked thread.
    pub fn stop(&self) {
        let streams = {
            let mut inner = self.inner.lock();

            match inner.state {
                PipelineState::ShuttingDown => return,
                PipelineState::Error => {}
                _ => {
                    debug!("pipeline {} -> {}", inner.state, PipelineState::ShuttingDown);
                    inner.state = PipelineState::ShuttingDown;
                }
            }

            inner.audio_enabled = false;
            if let Some(gate) = inner.parked_audio_gate.take() {
                gate.deactivate();
            }
            self.state_changed.notify_all();
            std::mem::take(&mut inner.streams)
        };

        for stream in streams.values() {
            if let Some(gate) = &stream.gate {
                gate.deactivate();
            }
        }

        for stream in streams.values() {
            stream.queue.shutdown();
        }

        info!("pipeline stopped");
    }

    pub fn query_player_instance(&self) -> Arc<dyn PlayerContext> {
        self.player.clone()
    }

    pub fn query_decoder_handle(&self) -> Option<DecoderHandle> {
        self.downstream.decoder_handle()
    }

    /// Player position, or the last flush target when the player has none.
    pub fn query_position(&self) -> Duration {
        self.player
            .position()
            .unwrap_or_else(|| self.inner.lock().position)
    }

    pub fn query_duration(&self) -> Option<Duration> {
        self.player.duration()
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.stop();
    }
}
