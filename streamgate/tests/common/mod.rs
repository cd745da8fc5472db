#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use streamgate::{
    drm::{
        DecryptCode, DecryptOutput, DrmSession, DrmSessionManager, SessionFailure,
        SessionFailureReason, SessionRequest,
    },
    media::{DecoderHandle, Downstream, FlowError, MediaBuffer, MediaType, QueueItem, StreamEvent},
};
use streamgate_cenc::SubsampleRange;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Records everything pushed downstream, per stream.
#[derive(Default)]
pub struct RecordingSink {
    pub items: Mutex<Vec<(MediaType, QueueItem)>>,
    pub fail_buffers: AtomicBool,
    pub decoder: Option<DecoderHandle>,
}

impl RecordingSink {
    pub fn items_for(&self, media: MediaType) -> Vec<QueueItem> {
        self.items
            .lock()
            .iter()
            .filter(|(m, _)| *m == media)
            .map(|(_, item)| clone_item(item))
            .collect()
    }

    pub fn buffers_for(&self, media: MediaType) -> Vec<MediaBuffer> {
        self.items_for(media)
            .into_iter()
            .filter_map(|item| match item {
                QueueItem::Buffer(buffer) => Some(buffer),
                QueueItem::Event(_) => None,
            })
            .collect()
    }

    pub fn events_for(&self, media: MediaType) -> Vec<&'static str> {
        self.items_for(media)
            .into_iter()
            .filter_map(|item| match item {
                QueueItem::Event(event) => Some(event.name()),
                QueueItem::Buffer(_) => None,
            })
            .collect()
    }

    pub fn wait_for(&self, what: &str, condition: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !condition(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }
}

fn clone_item(item: &QueueItem) -> QueueItem {
    match item {
        QueueItem::Buffer(buffer) => QueueItem::Buffer(buffer.clone()),
        QueueItem::Event(event) => QueueItem::Event(event.clone()),
    }
}

impl Downstream for RecordingSink {
    fn push_buffer(&self, media: MediaType, buffer: MediaBuffer) -> Result<(), FlowError> {
        if self.fail_buffers.load(Ordering::SeqCst) {
            return Err(FlowError::Error);
        }
        self.items.lock().push((media, QueueItem::Buffer(buffer)));
        Ok(())
    }

    fn push_event(&self, media: MediaType, event: StreamEvent) -> bool {
        self.items.lock().push((media, QueueItem::Event(event)));
        true
    }

    fn decoder_handle(&self) -> Option<DecoderHandle> {
        self.decoder
    }
}

/// Downstream whose buffer pushes block until a flush starts.
#[derive(Default)]
pub struct BlockingSink {
    released: Mutex<bool>,
    cond: Condvar,
    pub blocked: AtomicUsize,
    pub flush_starts: AtomicUsize,
}

impl Downstream for BlockingSink {
    fn push_buffer(&self, _media: MediaType, _buffer: MediaBuffer) -> Result<(), FlowError> {
        let mut released = self.released.lock();
        self.blocked.fetch_add(1, Ordering::SeqCst);
        while !*released {
            self.cond.wait(&mut released);
        }
        Err(FlowError::Flushing)
    }

    fn push_event(&self, _media: MediaType, event: StreamEvent) -> bool {
        if event == StreamEvent::FlushStart {
            self.flush_starts.fetch_add(1, Ordering::SeqCst);
            *self.released.lock() = true;
            self.cond.notify_all();
        }
        true
    }
}

/// Session that XORs every byte with a fixed mask, or fails with scripted codes.
pub struct ScriptedSession {
    pub outcomes: Mutex<VecDeque<Option<DecryptCode>>>,
    pub bound: Arc<AtomicBool>,
    pub calls: AtomicUsize,
}

pub const MASK: u8 = 0x5a;

impl DrmSession for ScriptedSession {
    fn decrypt(
        &self,
        _key_id: &[u8],
        _iv: &[u8],
        data: &mut [u8],
        _subsamples: &[SubsampleRange],
    ) -> Result<DecryptOutput, DecryptCode> {
        assert!(
            self.bound.load(Ordering::SeqCst),
            "decrypt reached an unbound session"
        );
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.outcomes.lock().pop_front().flatten() {
            Some(code) => Err(code),
            None => {
                data.iter_mut().for_each(|byte| *byte ^= MASK);
                Ok(DecryptOutput::InPlace)
            }
        }
    }
}

/// Session manager handing out one [`ScriptedSession`].
pub struct ScriptedManager {
    pub session: Arc<ScriptedSession>,
    pub bound: Arc<AtomicBool>,
    pub fail: bool,
    pub delay: Duration,
    pub creates: AtomicUsize,
}

impl ScriptedManager {
    pub fn new(outcomes: Vec<Option<DecryptCode>>) -> Arc<Self> {
        let bound = Arc::new(AtomicBool::new(false));
        Arc::new(Self {
            session: Arc::new(ScriptedSession {
                outcomes: Mutex::new(outcomes.into()),
                bound: bound.clone(),
                calls: AtomicUsize::new(0),
            }),
            bound,
            fail: false,
            delay: Duration::ZERO,
            creates: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        let mut manager = Self::new(Vec::new());
        if let Some(manager) = Arc::get_mut(&mut manager) {
            manager.fail = true;
        }
        manager
    }

    pub fn delayed(delay: Duration) -> Arc<Self> {
        let mut manager = Self::new(Vec::new());
        if let Some(manager) = Arc::get_mut(&mut manager) {
            manager.delay = delay;
        }
        manager
    }

    pub fn decrypt_calls(&self) -> usize {
        self.session.calls.load(Ordering::SeqCst)
    }
}

impl DrmSessionManager for ScriptedManager {
    fn create_session(
        &self,
        _request: &SessionRequest<'_>,
    ) -> Result<Arc<dyn DrmSession>, SessionFailure> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);

        if self.fail {
            return Err(SessionFailure::new(SessionFailureReason::LicenceRequestFailed).with_code(7));
        }

        self.bound.store(true, Ordering::SeqCst);
        Ok(self.session.clone())
    }
}
