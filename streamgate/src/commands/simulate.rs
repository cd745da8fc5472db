use anyhow::{Context, Result, bail};
use clap::Args;
use log::{LevelFilter, debug, info, warn};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use streamgate::{
    config::Config,
    drm::ClearKeySessionManager,
    media::{Downstream, FlowError, FormatDescription, MediaBuffer, MediaType, StreamEvent},
    notify,
    pipeline::{PipelineController, PipelineError, PipelineState, Sample, StreamFormats},
};
use streamgate_cenc::{
    Cipher, EncryptedSampleDescriptor, ProtectionSystem, Scheme, SubsampleRange, codec,
    parse_hex_16, pssh::PsshBox,
};

const FRAME_DURATION: Duration = Duration::from_millis(40);

/// Run synthetic clear-key encrypted samples through a pipeline.
#[derive(Debug, Clone, Args)]
pub struct Simulate {
    /// Path of a json pipeline config.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Samples to produce per stream.
    #[arg(short, long, default_value_t = 50)]
    samples: usize,

    /// Also produce an audio stream.
    #[arg(long)]
    audio: bool,

    /// Playback rate; audio is disabled unless it is 1.
    #[arg(long, default_value_t = 1.0)]
    rate: f64,

    /// Encrypt only part of each sample, leaving a clear header.
    #[arg(long)]
    subsamples: bool,

    /// Key id as 32 hex characters.
    #[arg(long, default_value = "eb676abbcb345e96bbcf616630f1a3da")]
    key_id: String,

    /// Content key as 32 hex characters.
    #[arg(long, default_value = "100b6c20940f779a4589152b57d2dacb")]
    key: String,

    /// Encryption scheme.
    #[arg(long, default_value = "cenc", value_parser = ["cenc", "cbc1"])]
    scheme: String,

    /// Use an unknown key id for the first N video samples.
    #[arg(long, default_value_t = 0)]
    fail_decrypt: usize,

    /// Seek back to the start after this many video samples.
    #[arg(long)]
    seek_at: Option<usize>,

    /// Delay before the licence is bound, in milliseconds.
    #[arg(long, default_value_t = 50)]
    licence_delay: u64,
}

#[derive(Default)]
struct CountingSink {
    buffers: Mutex<BTreeMap<MediaType, usize>>,
    events: Mutex<BTreeMap<&'static str, usize>>,
    corrupt: AtomicUsize,
    eos: AtomicUsize,
}

impl Downstream for CountingSink {
    fn push_buffer(&self, media: MediaType, buffer: MediaBuffer) -> Result<(), FlowError> {
        let index = buffer
            .pts
            .map(|pts| (pts.as_millis() / FRAME_DURATION.as_millis()) as usize)
            .unwrap_or_default();

        if buffer.data != payload(media, index, buffer.data.len()) {
            self.corrupt.fetch_add(1, Ordering::SeqCst);
        }

        *self.buffers.lock().entry(media).or_default() += 1;
        Ok(())
    }

    fn push_event(&self, _media: MediaType, event: StreamEvent) -> bool {
        if event == StreamEvent::Eos {
            self.eos.fetch_add(1, Ordering::SeqCst);
        }

        *self.events.lock().entry(event.name()).or_default() += 1;
        true
    }
}

fn payload(media: MediaType, index: usize, len: usize) -> Vec<u8> {
    let seed = match media {
        MediaType::Video => 0x56,
        MediaType::Audio => 0x41,
    };

    (0..len)
        .map(|i| (seed as usize + index * 31 + i * 7) as u8)
        .collect()
}

struct Encryptor {
    cipher: Cipher,
    key_id: [u8; 16],
    subsamples: bool,
}

impl Encryptor {
    fn sample(&self, media: MediaType, index: usize, key_id: [u8; 16]) -> Result<Sample> {
        let len = match media {
            MediaType::Video => 1024 + (index % 7) * 16,
            MediaType::Audio => 256,
        };

        let mut data = payload(media, index, len);
        let ranges = if self.subsamples {
            vec![SubsampleRange::new(32, (len - 64) as u32), SubsampleRange::new(32, 0)]
        } else {
            Vec::new()
        };

        let iv = (index as u64).to_be_bytes().to_vec();
        let mut block = codec::gather(&data, &ranges)?;
        self.cipher.encrypt(&iv, &mut block)?;
        codec::scatter(&mut data, &ranges, &block)?;

        let pts = FRAME_DURATION * index as u32;
        let buffer = MediaBuffer::new(data)
            .with_pts(pts)
            .with_dts(pts)
            .with_duration(FRAME_DURATION);

        Ok(Sample::encrypted(
            buffer,
            EncryptedSampleDescriptor::new(iv, key_id).with_subsamples(ranges),
        ))
    }
}

impl Simulate {
    pub fn execute(self) -> Result<()> {
        let mut config = match &self.config {
            Some(path) => Config::from_path(path)
                .with_context(|| format!("could not load config {}", path.display()))?,
            None => Config::default(),
        };

        if log::max_level() == LevelFilter::Info {
            if let Some(level) = config.log_level_filter()? {
                log::set_max_level(level);
            }
        }

        match config.protection_system {
            None => config.protection_system = Some(ProtectionSystem::ClearKey),
            Some(ProtectionSystem::ClearKey) => {}
            Some(other) => bail!("simulate only supports clearkey, config names {}", other),
        }

        let scheme = self.scheme.parse::<Scheme>()?;
        let key_id = parse_hex_16(&self.key_id).context("invalid --key-id")?;
        let key = parse_hex_16(&self.key).context("invalid --key")?;
        let manager = ClearKeySessionManager::builder()
            .key_bytes(key_id, key)
            .scheme(scheme)
            .build()?;

        let encryptor = Arc::new(Encryptor {
            cipher: Cipher::new(scheme, &key)?,
            key_id,
            subsamples: self.subsamples,
        });

        let sink = Arc::new(CountingSink::default());
        let (notifier, notices) = notify::channel();
        let pipeline = Arc::new(
            PipelineController::new(config, sink.clone(), notifier)
                .with_session_manager(Arc::new(manager)),
        );

        pipeline.tune()?;
        pipeline.configure(StreamFormats {
            video: Some(FormatDescription::protected(
                "video/x-h264",
                ProtectionSystem::ClearKey,
            )),
            audio: self
                .audio
                .then(|| FormatDescription::protected("audio/mpeg", ProtectionSystem::ClearKey)),
        })?;
        pipeline.start()?;
        pipeline.play()?;

        if self.rate != 1.0 {
            pipeline.update_rate(self.rate)?;
        }

        let init_data = PsshBox::new(ProtectionSystem::ClearKey, vec![key_id]).to_bytes();
        let licence = {
            let pipeline = pipeline.clone();
            let delay = Duration::from_millis(self.licence_delay);
            let audio = self.audio;
            thread::Builder::new()
                .name("licence".into())
                .spawn(move || {
                    thread::sleep(delay);
                    let system_id = ProtectionSystem::ClearKey.system_id();
                    pipeline.on_protection_metadata(MediaType::Video, system_id, &init_data);
                    if audio {
                        pipeline.on_protection_metadata(MediaType::Audio, system_id, &init_data);
                    }
                })?
        };

        let started = Instant::now();
        let mut producers = Vec::new();
        let mut media_types = vec![MediaType::Video];
        if self.audio {
            media_types.push(MediaType::Audio);
        }

        for media in media_types.iter().copied() {
            let pipeline = pipeline.clone();
            let encryptor = encryptor.clone();
            let samples = self.samples;
            let fail_decrypt = self.fail_decrypt;
            let seek_at = self.seek_at;

            producers.push(
                thread::Builder::new()
                    .name(format!("producer-{}", media))
                    .spawn(move || -> Result<usize> {
                        let mut dropped = 0;

                        for index in 0..samples {
                            if media == MediaType::Video && seek_at == Some(index) {
                                pipeline.flush(Duration::ZERO, pipeline.rate())?;
                            }

                            let key_id = if media == MediaType::Video && index < fail_decrypt {
                                [0xff; 16]
                            } else {
                                encryptor.key_id
                            };

                            match pipeline.route_sample(media, encryptor.sample(media, index, key_id)?)
                            {
                                Ok(()) => {}
                                Err(PipelineError::Decrypt { source, .. }) => {
                                    debug!("{} sample {} dropped: {}", media, index, source);
                                    dropped += 1;
                                }
                                Err(e) => return Err(e.into()),
                            }
                        }

                        match pipeline.end_of_stream(media) {
                            Err(PipelineError::StreamNotConfigured(_)) => {
                                debug!("{} disabled, no end of stream sent", media)
                            }
                            other => other?,
                        }

                        Ok(dropped)
                    })?,
            );
        }

        let mut dropped = 0;
        for producer in producers {
            match producer.join() {
                Ok(result) => dropped += result?,
                Err(_) => bail!("producer thread panicked"),
            }
        }

        if licence.join().is_err() {
            bail!("licence thread panicked");
        }

        let expected_eos = media_types
            .iter()
            .filter(|media| **media == MediaType::Video || pipeline.is_audio_enabled())
            .count();
        let deadline = Instant::now() + Duration::from_secs(10);

        while sink.eos.load(Ordering::SeqCst) < expected_eos {
            if Instant::now() > deadline {
                warn!("timed out waiting for end of stream");
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        pipeline.stop();
        let state = pipeline.state();

        info!(
            "simulation finished in {:?} ({})",
            started.elapsed(),
            if state == PipelineState::ShuttingDown {
                "stopped"
            } else {
                "not stopped"
            }
        );

        for (media, count) in sink.buffers.lock().iter() {
            info!("{}: {} buffer(s) delivered", media, count);
        }

        for (event, count) in sink.events.lock().iter() {
            info!("event {}: {}", event, count);
        }

        info!("{} sample(s) dropped by the decryption stage", dropped);

        for report in notices.drain_errors() {
            warn!("reported error: {}", report);
        }

        for diagnostic in notices.drain_diagnostics() {
            warn!("reported diagnostic: {:?}", diagnostic);
        }

        let corrupt = sink.corrupt.load(Ordering::SeqCst);
        if corrupt > 0 {
            bail!("{} delivered buffer(s) did not decrypt to the original payload", corrupt);
        }

        Ok(())
    }
}
