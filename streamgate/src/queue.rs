//! Bounded per-stream queue and its drain thread.
//!
//! Producers block while the queue is full. A dedicated thread pops items in
//! FIFO order and hands them to the [`Downstream`]. Structural events are not
//! sent eagerly: they are marked pending and synthesized right before the
//! next data buffer, so ordering survives seeks without the producer tracking
//! downstream state.

use crate::media::{
    Downstream, FlowError, FormatDescription, MediaBuffer, MediaType, QueueItem, Segment,
    StreamEvent,
};
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Structural events owed to downstream before the next buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingEvents {
    pub stream_start: bool,
    pub caps: bool,
    pub segment: bool,
    pub discontinuity: bool,
}

impl PendingEvents {
    /// Everything a freshly started stream owes.
    pub const START: Self = Self {
        stream_start: true,
        caps: true,
        segment: true,
        discontinuity: false,
    };

    /// New segment plus discontinuity, after a seek or timeline jump.
    pub const RESYNC: Self = Self {
        stream_start: false,
        caps: false,
        segment: true,
        discontinuity: true,
    };

    pub fn any(&self) -> bool {
        self.stream_start || self.caps || self.segment || self.discontinuity
    }

    fn merge(&mut self, other: Self) {
        self.stream_start |= other.stream_start;
        self.caps |= other.caps;
        self.segment |= other.segment;
        self.discontinuity |= other.discontinuity;
    }
}

struct QueueState {
    items: VecDeque<QueueItem>,
    flushing: bool,
    closed: bool,
    paused: bool,
    generation: u64,
    pending: PendingEvents,
    format: Option<FormatDescription>,
    rate: f64,
}

struct Shared {
    media: MediaType,
    capacity: usize,
    state: Mutex<QueueState>,
    item_available: Condvar,
    space_available: Condvar,
    downstream: Arc<dyn Downstream>,
}

/// Queue plus drain thread for one elementary stream.
pub struct StreamQueue {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    stream_id: String,
}

impl StreamQueue {
    pub fn new(media: MediaType, capacity: usize, downstream: Arc<dyn Downstream>) -> Self {
        Self {
            shared: Arc::new(Shared {
                media,
                capacity: capacity.max(1),
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity.max(1)),
                    flushing: false,
                    closed: false,
                    paused: false,
                    generation: 0,
                    pending: PendingEvents::default(),
                    format: None,
                    rate: 1.0,
                }),
                item_available: Condvar::new(),
                space_available: Condvar::new(),
                downstream,
            }),
            task: Mutex::new(None),
            stream_id: format!("streamgate/{}", media),
        }
    }

    pub fn media(&self) -> MediaType {
        self.shared.media
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.state.lock().flushing
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Downstream refused a buffer; data is dropped until the next flush or start.
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn pending(&self) -> PendingEvents {
        self.shared.state.lock().pending
    }

    pub fn format(&self) -> Option<FormatDescription> {
        self.shared.state.lock().format.clone()
    }

    pub fn set_format(&self, format: FormatDescription) {
        self.shared.state.lock().format = Some(format);
    }

    /// Rate carried as `applied_rate` by the next segment.
    pub fn set_rate(&self, rate: f64) {
        self.shared.state.lock().rate = rate;
    }

    pub fn mark_pending(&self, events: PendingEvents) {
        self.shared.state.lock().pending.merge(events);
    }

    /// Spawn the drain thread if it is not running.
    pub fn start(&self) -> io::Result<()> {
        let mut task = self.task.lock();

        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        if let Some(handle) = task.take() {
            join(self.shared.media, handle);
        }

        let generation = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.paused = false;
            state.generation
        };

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("streamgate-{}", self.shared.media))
            .spawn(move || drain(shared, generation))?;

        debug!("{} drain thread started", self.shared.media);
        *task = Some(handle);
        Ok(())
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Returns false when the item was discarded because the queue is
    /// flushing or closed.
    pub fn enqueue(&self, item: QueueItem) -> bool {
        self.enqueue_in(item, None)
    }

    /// Like [`enqueue`](Self::enqueue), but also discards the item once a
    /// flush newer than `expected` has started.
    fn enqueue_in(&self, item: QueueItem, expected: Option<u64>) -> bool {
        let mut state = self.shared.state.lock();

        if state.flushing || state.closed {
            trace!("{} flushing, item discarded", self.shared.media);
            return false;
        }

        let generation = state.generation;

        if expected.is_some_and(|expected| expected != generation) {
            trace!("{} flushed since the item was built, discarded", self.shared.media);
            return false;
        }

        while state.items.len() >= self.shared.capacity {
            trace!("{} queue full, waiting", self.shared.media);
            self.shared.space_available.wait(&mut state);

            if state.flushing || state.closed || state.generation != generation {
                trace!("{} flushed while waiting, item discarded", self.shared.media);
                return false;
            }
        }

        state.items.push_back(item);
        self.shared.item_available.notify_one();
        true
    }

    /// Queue a data buffer, preceded by any pending structural events.
    pub fn push_data(&self, mut buffer: MediaBuffer) -> bool {
        let (events, pending, generation) = {
            let mut state = self.shared.state.lock();

            if state.flushing || state.closed {
                return false;
            }

            if state.paused {
                warn!(
                    "{} stream paused after a downstream error, buffer dropped",
                    self.shared.media
                );
                return false;
            }

            let pending = std::mem::take(&mut state.pending);
            let mut events = Vec::new();

            if pending.stream_start {
                events.push(StreamEvent::StreamStart {
                    stream_id: self.stream_id.clone(),
                });
            }

            if pending.caps {
                match &state.format {
                    Some(format) => events.push(StreamEvent::Caps(format.clone())),
                    None => debug!("{} has no format to announce", self.shared.media),
                }
            }

            if pending.segment {
                events.push(StreamEvent::Segment(Segment {
                    start: buffer.pts.unwrap_or(Duration::ZERO),
                    rate: 1.0,
                    applied_rate: state.rate,
                }));
            }

            if pending.any() {
                buffer.discont = true;
            }

            (events, pending, state.generation)
        };

        let queued = events.into_iter().all(|event| {
            trace!("{} synthesized {}", self.shared.media, event.name());
            self.enqueue_in(QueueItem::Event(event), Some(generation))
        }) && self.enqueue_in(QueueItem::Buffer(buffer), Some(generation));

        if !queued && pending.any() {
            // the events went down with the flush, owe them again
            self.shared.state.lock().pending.merge(pending);
        }

        queued
    }

    pub fn push_eos(&self) -> bool {
        debug!("{} end of stream queued", self.shared.media);
        self.enqueue(QueueItem::Event(StreamEvent::Eos))
    }

    /// Drop everything queued and resynchronize downstream.
    ///
    /// The drain thread is stopped around the flush signals and restarted
    /// afterwards if it was running.
    pub fn flush(&self) {
        self.flush_with(PendingEvents::default());
    }

    /// Flush, owing `pending` to the first buffer queued afterwards.
    ///
    /// The events are marked together with the flushing flag, so no producer
    /// can consume them for data the flush is about to drop.
    pub fn flush_with(&self, pending: PendingEvents) {
        {
            let mut state = self.shared.state.lock();

            if state.closed {
                return;
            }

            state.flushing = true;
            state.generation += 1;
            state.paused = false;
            state.pending.merge(pending);

            let dropped = state.items.len();
            state.items.clear();
            self.shared.item_available.notify_all();
            self.shared.space_available.notify_all();
            debug!("{} flush dropped {} item(s)", self.shared.media, dropped);
        }

        self.shared
            .downstream
            .push_event(self.shared.media, StreamEvent::FlushStart);

        let handle = self.task.lock().take();
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            join(self.shared.media, handle);
        }

        self.shared.downstream.push_event(
            self.shared.media,
            StreamEvent::FlushStop { reset_time: true },
        );

        self.shared.state.lock().flushing = false;

        if was_running {
            if let Err(e) = self.start() {
                error!("{} drain thread restart failed: {}", self.shared.media, e);
            }
        }
    }

    /// Close the queue for good and stop the drain thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();

            if state.closed {
                return;
            }

            state.closed = true;
            state.flushing = true;
            state.generation += 1;
            state.items.clear();
            self.shared.item_available.notify_all();
            self.shared.space_available.notify_all();
        }

        self.shared
            .downstream
            .push_event(self.shared.media, StreamEvent::FlushStart);

        if let Some(handle) = self.task.lock().take() {
            join(self.shared.media, handle);
        }

        self.shared.downstream.push_event(
            self.shared.media,
            StreamEvent::FlushStop { reset_time: true },
        );

        debug!("{} queue shut down", self.shared.media);
    }
}

impl Drop for StreamQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join(media: MediaType, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("{} drain thread panicked", media);
    }
}

fn drain(shared: Arc<Shared>, generation: u64) {
    let media = shared.media;

    loop {
        let item = {
            let mut state = shared.state.lock();

            while state.items.is_empty()
                && !state.flushing
                && !state.closed
                && state.generation == generation
            {
                shared.item_available.wait(&mut state);
            }

            if state.flushing || state.closed || state.generation != generation {
                debug!("{} drain thread stopping on flush", media);
                return;
            }

            let Some(item) = state.items.pop_front() else {
                continue;
            };
            shared.space_available.notify_one();
            item
        };

        match item {
            QueueItem::Buffer(buffer) => {
                trace!("{} delivering {} bytes", media, buffer.data.len());

                match shared.downstream.push_buffer(media, buffer) {
                    Ok(()) => {}
                    Err(FlowError::Flushing) => {
                        debug!("{} downstream flushing", media);
                    }
                    Err(e) => {
                        warn!("{} downstream refused buffer ({}), pausing stream", media, e);
                        shared.state.lock().paused = true;
                        return;
                    }
                }
            }
            QueueItem::Event(StreamEvent::Eos) => {
                shared.downstream.push_event(media, StreamEvent::Eos);
                debug!("{} drain thread finished at end of stream", media);
                return;
            }
            QueueItem::Event(event) => {
                let name = event.name();
                if !shared.downstream.push_event(media, event) {
                    debug!("{} downstream did not handle {}", media, name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct Record(Mutex<Vec<QueueItem>>);

    impl Downstream for Record {
        fn push_buffer(&self, _media: MediaType, buffer: MediaBuffer) -> Result<(), FlowError> {
            self.0.lock().push(QueueItem::Buffer(buffer));
            Ok(())
        }

        fn push_event(&self, _media: MediaType, event: StreamEvent) -> bool {
            self.0.lock().push(QueueItem::Event(event));
            true
        }
    }

    fn wait_for(record: &Record, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while record.0.lock().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for delivery");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_pending_events_precede_buffer() {
        let record = Arc::new(Record::default());
        let queue = StreamQueue::new(MediaType::Video, 8, record.clone());
        queue.set_format(FormatDescription::new("video/x-h264"));
        queue.set_rate(2.0);
        queue.mark_pending(PendingEvents::START);

        let pts = Duration::from_millis(40);
        assert!(queue.push_data(MediaBuffer::new(vec![1]).with_pts(pts)));
        assert!(queue.push_data(MediaBuffer::new(vec![2])));
        assert_eq!(queue.len(), 5);
        assert!(!queue.pending().any());

        queue.start().unwrap();
        wait_for(&record, 5);

        let items = record.0.lock();
        assert!(matches!(items[0], QueueItem::Event(StreamEvent::StreamStart { .. })));
        assert!(matches!(items[1], QueueItem::Event(StreamEvent::Caps(_))));
        assert_eq!(
            items[2],
            QueueItem::Event(StreamEvent::Segment(Segment {
                start: pts,
                rate: 1.0,
                applied_rate: 2.0
            }))
        );
        match (&items[3], &items[4]) {
            (QueueItem::Buffer(first), QueueItem::Buffer(second)) => {
                assert!(first.discont);
                assert!(!second.discont);
            }
            other => panic!("unexpected items {:?}", other),
        }
    }

    #[test]
    fn test_discontinuity_only_marks_buffer() {
        let record = Arc::new(Record::default());
        let queue = StreamQueue::new(MediaType::Audio, 8, record);
        queue.mark_pending(PendingEvents {
            discontinuity: true,
            ..Default::default()
        });
        assert!(queue.push_data(MediaBuffer::new(vec![1])));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_enqueue_while_flushing_discards() {
        let queue = StreamQueue::new(MediaType::Video, 2, Arc::new(Record::default()));
        queue.shared.state.lock().flushing = true;
        assert!(!queue.enqueue(QueueItem::Event(StreamEvent::Eos)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_without_task_sends_signal_pair() {
        let record = Arc::new(Record::default());
        let queue = StreamQueue::new(MediaType::Video, 4, record.clone());
        queue.push_data(MediaBuffer::new(vec![1]));
        queue.flush();

        assert!(queue.is_empty());
        assert!(!queue.is_flushing());
        assert!(!queue.is_running());
        assert_eq!(
            *record.0.lock(),
            vec![
                QueueItem::Event(StreamEvent::FlushStart),
                QueueItem::Event(StreamEvent::FlushStop { reset_time: true })
            ]
        );
    }

    #[test]
    fn test_flush_with_owes_events_to_next_buffer() {
        let record = Arc::new(Record::default());
        let queue = StreamQueue::new(MediaType::Video, 4, record);
        assert!(queue.push_data(MediaBuffer::new(vec![1])));

        queue.flush_with(PendingEvents::RESYNC);
        assert_eq!(queue.pending(), PendingEvents::RESYNC);

        assert!(queue.push_data(MediaBuffer::new(vec![2])));
        assert_eq!(queue.len(), 2);
        assert!(!queue.pending().any());
    }

    #[test]
    fn test_discarded_events_are_owed_again() {
        let record = Arc::new(Record::default());
        let queue = Arc::new(StreamQueue::new(MediaType::Video, 1, record));
        queue.set_format(FormatDescription::new("video/x-h264"));
        queue.mark_pending(PendingEvents::START);

        // stream-start fills the queue, caps blocks behind it
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push_data(MediaBuffer::new(vec![1])))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.len() == 0 {
            assert!(Instant::now() < deadline, "producer never queued");
            thread::sleep(Duration::from_millis(1));
        }

        queue.flush();
        assert!(!producer.join().unwrap());
        assert!(queue.is_empty());
        assert_eq!(queue.pending(), PendingEvents::START);
    }

    #[test]
    fn test_shutdown_is_final() {
        let queue = StreamQueue::new(MediaType::Video, 4, Arc::new(Record::default()));
        queue.start().unwrap();
        queue.shutdown();
        assert!(queue.is_closed());
        assert!(!queue.is_running());
        assert!(!queue.push_data(MediaBuffer::new(vec![1])));
        queue.start().unwrap();
        assert!(!queue.is_running());
    }
}
