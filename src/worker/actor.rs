use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::decode::decode_gop;
use super::protocol::{
    ConsumerId, DecodedGop, EventSender, GopSnapshot, MediaMeta, Request, WorkerEvent,
    WorkerStats,
};
use super::state::{DecodeOutcome, DecodeStart, GopSlot, GopState, Released};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gop::{GopIndexer, GopSpan, GopTable};
use crate::media::{Container, Demuxer, Micros};
use crate::range::{ByteSource, RangeCache};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub gop_min_duration: Micros,
    pub debounce: Duration,
    pub block_size: u64,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            gop_min_duration: config.cache.gop_min_duration_us(),
            debounce: config.cache.debounce(),
            block_size: config.range.block_size,
        }
    }
}

/// Sending side of a decode worker. The worker stops once every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<Request>,
    failed: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn send(&self, request: Request) -> Result<()> {
        self.sender.send(request).map_err(|_| Error::WorkerGone)
    }

    /// True once indexing failed. Such a worker only ever answers errors.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> Result<WorkerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Stats { reply })?;
        rx.await.map_err(|_| Error::WorkerGone)
    }

    pub async fn snapshot(&self) -> Result<Vec<GopSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Snapshot { reply })?;
        rx.await.map_err(|_| Error::WorkerGone)
    }
}

/// Starts the decode worker for `url` and begins indexing right away.
pub fn spawn_worker(
    url: String,
    settings: WorkerSettings,
    cache: Arc<RangeCache>,
    demuxer: Arc<dyn Demuxer>,
) -> WorkerHandle {
    let (sender, requests) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let failed = Arc::new(AtomicBool::new(false));
    let url: Arc<str> = Arc::from(url);

    let tx = internal_tx.clone();
    let index_url = Arc::clone(&url);
    tokio::spawn(async move {
        let result = index_file(&index_url, settings, &cache, demuxer.as_ref()).await;
        let _ = tx.send(Internal::Indexed(result));
    });

    let worker = DecodeWorker {
        url,
        settings,
        requests,
        internal_tx,
        internal_rx,
        consumers: HashMap::new(),
        meta: MetaState::Indexing(Vec::new()),
        slots: Vec::new(),
        timers: HashMap::new(),
        next_timer: 0,
        stats: WorkerStats::default(),
        failed: Arc::clone(&failed),
    };
    tokio::spawn(worker.run());

    WorkerHandle { sender, failed }
}

struct Indexed {
    source: ByteSource,
    container: Arc<dyn Container>,
    table: GopTable,
}

async fn index_file(
    url: &str,
    settings: WorkerSettings,
    cache: &Arc<RangeCache>,
    demuxer: &dyn Demuxer,
) -> Result<Indexed> {
    let source = cache.open(url, settings.block_size).await?;
    let container: Arc<dyn Container> = Arc::from(demuxer.open(source.clone()).await?);
    let table = GopIndexer::new(settings.gop_min_duration).index(url, container.meta())?;
    Ok(Indexed {
        source,
        container,
        table,
    })
}

enum Internal {
    Indexed(Result<Indexed>),
    DebounceElapsed {
        index: usize,
        consumer: ConsumerId,
        seq: u64,
    },
    Loaded {
        index: usize,
        result: Result<()>,
    },
    Decoded {
        index: usize,
        result: Result<DecodedGop>,
    },
}

struct Ready {
    meta: Arc<MediaMeta>,
    container: Arc<dyn Container>,
    source: ByteSource,
}

enum MetaState {
    /// Consumers waiting for the table.
    Indexing(Vec<ConsumerId>),
    Ready(Ready),
    Failed(Arc<Error>),
}

struct Timer {
    seq: u64,
    task: JoinHandle<()>,
}

enum Admit {
    Reject(Arc<Error>),
    Deliver(Arc<DecodedGop>),
    Join,
    Debounce,
}

/// Owns the GOP table of one file and every GOP's decode state. Requests
/// are handled one at a time; fetches, debounce timers and decodes run as
/// separate tasks that report back over the internal channel.
struct DecodeWorker {
    url: Arc<str>,
    settings: WorkerSettings,
    requests: mpsc::UnboundedReceiver<Request>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    consumers: HashMap<ConsumerId, EventSender>,
    meta: MetaState,
    slots: Vec<GopSlot>,
    timers: HashMap<(usize, ConsumerId), Timer>,
    next_timer: u64,
    stats: WorkerStats,
    failed: Arc<AtomicBool>,
}

impl DecodeWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
            }
        }

        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
        tracing::info!(url = %self.url, "decode worker stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Attach { consumer, events } => {
                tracing::trace!(url = %self.url, consumer, "consumer attached");
                self.consumers.insert(consumer, events);
            }
            Request::Detach { consumer } => self.detach(consumer),
            Request::Meta { consumer } => self.answer_meta(consumer),
            Request::Decode {
                consumer,
                index,
                retry,
            } => self.decode(consumer, index, retry),
            Request::Release { consumer, index } => self.release(consumer, index),
            Request::Stats { reply } => {
                let _ = reply.send(self.stats);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Indexed(result) => self.on_indexed(result),
            Internal::DebounceElapsed {
                index,
                consumer,
                seq,
            } => self.on_debounce(index, consumer, seq),
            Internal::Loaded { index, result } => self.on_loaded(index, result),
            Internal::Decoded { index, result } => self.on_decoded(index, result),
        }
    }

    fn send(&self, consumer: ConsumerId, event: WorkerEvent) {
        if let Some(events) = self.consumers.get(&consumer) {
            if events.send(event).is_err() {
                tracing::trace!(url = %self.url, consumer, "consumer channel closed");
            }
        }
    }

    fn broadcast(&self, consumers: &[ConsumerId], event: WorkerEvent) {
        for &consumer in consumers {
            self.send(consumer, event.clone());
        }
    }

    fn ready(&self) -> Option<&Ready> {
        match &self.meta {
            MetaState::Ready(ready) => Some(ready),
            _ => None,
        }
    }

    fn span(&self, index: usize) -> Option<GopSpan> {
        self.ready()?.meta.table.get(index).copied()
    }

    fn answer_meta(&mut self, consumer: ConsumerId) {
        let event = match &mut self.meta {
            MetaState::Indexing(waiting) => {
                if !waiting.contains(&consumer) {
                    waiting.push(consumer);
                }
                return;
            }
            MetaState::Ready(ready) => WorkerEvent::Meta(Arc::clone(&ready.meta)),
            MetaState::Failed(error) => WorkerEvent::MetaError(Arc::clone(error)),
        };
        self.send(consumer, event);
    }

    fn on_indexed(&mut self, result: Result<Indexed>) {
        let waiting = match &mut self.meta {
            MetaState::Indexing(waiting) => std::mem::take(waiting),
            _ => return,
        };

        match result {
            Ok(Indexed {
                source,
                container,
                table,
            }) => {
                let info = container.meta();
                let meta = Arc::new(MediaMeta {
                    url: self.url.to_string(),
                    video: info.video.clone(),
                    audio: info.audio.clone(),
                    duration: table.duration(),
                    file_size: source.len(),
                    table,
                });
                self.slots = (0..meta.table.len()).map(|_| GopSlot::default()).collect();
                tracing::debug!(
                    url = %self.url,
                    gops = self.slots.len(),
                    waiting = waiting.len(),
                    "meta ready"
                );

                self.broadcast(&waiting, WorkerEvent::Meta(Arc::clone(&meta)));
                self.meta = MetaState::Ready(Ready {
                    meta,
                    container,
                    source,
                });
            }
            Err(error) => {
                tracing::error!(url = %self.url, error = %error, "failed to index file");
                let error = Arc::new(error);
                self.failed.store(true, Ordering::Release);
                self.broadcast(&waiting, WorkerEvent::MetaError(Arc::clone(&error)));
                self.meta = MetaState::Failed(error);
            }
        }
    }

    fn decode(&mut self, consumer: ConsumerId, index: usize, retry: bool) {
        if self.ready().is_none() {
            tracing::trace!(url = %self.url, gop = index, consumer, "decode before meta, ignored");
            return;
        }
        let Some(slot) = self.slots.get_mut(index) else {
            tracing::trace!(url = %self.url, gop = index, consumer, "decode out of range");
            return;
        };

        let admit = 'admit: {
            if slot.state() == GopState::Error {
                if !retry {
                    if let Some(error) = slot.error() {
                        break 'admit Admit::Reject(Arc::clone(error));
                    }
                }
                slot.retry();
                tracing::debug!(url = %self.url, gop = index, consumer, state = ?slot.state(), "retrying gop");
            }

            slot.add_user(consumer);
            match slot.state() {
                GopState::Decoded => match slot.decoded() {
                    Some(gop) => Admit::Deliver(Arc::clone(gop)),
                    None => Admit::Join,
                },
                // The running decode delivers to every user.
                GopState::Decoding => Admit::Join,
                _ => Admit::Debounce,
            }
        };

        match admit {
            Admit::Reject(error) => self.send(consumer, WorkerEvent::GopError { index, error }),
            Admit::Deliver(gop) => self.send(consumer, WorkerEvent::Decoded { index, gop }),
            Admit::Join => {}
            Admit::Debounce => self.schedule(index, consumer),
        }
    }

    fn schedule(&mut self, index: usize, consumer: ConsumerId) {
        if self.timers.contains_key(&(index, consumer)) {
            return;
        }

        let seq = self.next_timer;
        self.next_timer += 1;
        let delay = self.settings.debounce;
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::DebounceElapsed {
                index,
                consumer,
                seq,
            });
        });

        tracing::trace!(url = %self.url, gop = index, consumer, "decode debounced");
        self.timers.insert((index, consumer), Timer { seq, task });
    }

    fn cancel_timers(&mut self, index: usize) {
        self.timers.retain(|&(gop, _), timer| {
            if gop == index {
                timer.task.abort();
                false
            } else {
                true
            }
        });
    }

    fn on_debounce(&mut self, index: usize, consumer: ConsumerId, seq: u64) {
        match self.timers.get(&(index, consumer)) {
            Some(timer) if timer.seq == seq => {
                self.timers.remove(&(index, consumer));
            }
            // Cancelled or superseded.
            _ => return,
        }

        let Some(slot) = self.slots.get(index) else {
            return;
        };
        if !slot.users().contains(&consumer) {
            return;
        }
        match slot.state() {
            GopState::None => self.start_load(index),
            GopState::Loaded => self.start_decode(index),
            _ => {}
        }
    }

    fn start_load(&mut self, index: usize) {
        let (Some(span), Some(source)) = (self.span(index), self.ready().map(|r| r.source.clone()))
        else {
            return;
        };
        if !self.slots[index].begin_load() {
            return;
        }

        tracing::debug!(url = %self.url, gop = index, state = "loading", "fetching gop bytes");
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = source.prefetch(span.byte_start, span.byte_end).await;
            let _ = tx.send(Internal::Loaded { index, result });
        });
    }

    fn on_loaded(&mut self, index: usize, result: Result<()>) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };

        match result {
            Ok(()) => {
                slot.load_done();
                let wanted = slot.is_wanted();
                tracing::debug!(url = %self.url, gop = index, state = "loaded", wanted, "gop bytes resident");
                if wanted {
                    self.start_decode(index);
                }
            }
            Err(error) => {
                let error = Arc::new(error);
                let users = slot.load_failed(Arc::clone(&error));
                tracing::warn!(url = %self.url, gop = index, error = %error, "gop fetch failed");
                self.cancel_timers(index);
                self.broadcast(&users, WorkerEvent::GopError { index, error });
            }
        }
    }

    fn start_decode(&mut self, index: usize) {
        let (Some(span), Some(container)) = (
            self.span(index),
            self.ready().map(|r| Arc::clone(&r.container)),
        ) else {
            return;
        };

        match self.slots[index].begin_decode() {
            Some(DecodeStart::Spawn) => {
                self.stats.decodes_started += 1;
                tracing::debug!(url = %self.url, gop = index, state = "decoding", "decode started");
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = decode_gop(container, span).await;
                    let _ = tx.send(Internal::Decoded { index, result });
                });
            }
            Some(DecodeStart::Adopt) => {
                self.stats.decodes_adopted += 1;
                tracing::debug!(url = %self.url, gop = index, state = "decoding", "adopted in-flight decode");
            }
            None => {}
        }
    }

    fn on_decoded(&mut self, index: usize, result: Result<DecodedGop>) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };

        match slot.decode_done(result) {
            DecodeOutcome::Delivered(gop) => {
                self.stats.decodes_completed += 1;
                let users: Vec<_> = slot.users().iter().copied().collect();
                tracing::debug!(
                    url = %self.url,
                    gop = index,
                    state = "decoded",
                    frames = gop.video_frames.len(),
                    users = users.len(),
                    "gop decoded"
                );
                self.cancel_timers(index);
                self.broadcast(&users, WorkerEvent::Decoded { index, gop });
            }
            DecodeOutcome::Discarded => {
                self.stats.decodes_discarded += 1;
                tracing::warn!(url = %self.url, gop = index, "discarded decode nobody wants");
            }
            DecodeOutcome::Failed(error, users) => {
                self.stats.decodes_failed += 1;
                tracing::warn!(url = %self.url, gop = index, error = %error, "gop decode failed");
                self.cancel_timers(index);
                self.broadcast(&users, WorkerEvent::GopError { index, error });
            }
        }
    }

    fn release(&mut self, consumer: ConsumerId, index: usize) {
        if let Some(timer) = self.timers.remove(&(index, consumer)) {
            timer.task.abort();
            self.stats.debounces_cancelled += 1;
            tracing::trace!(url = %self.url, gop = index, consumer, "debounced decode cancelled");
        }

        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        match slot.remove_user(consumer) {
            Released::Evicted => {
                self.stats.gops_evicted += 1;
                tracing::debug!(url = %self.url, gop = index, consumer, state = "loaded", "gop evicted");
            }
            Released::Aborted => {
                tracing::debug!(url = %self.url, gop = index, consumer, state = "loaded", "decode abandoned");
            }
            Released::Idle => {
                tracing::trace!(url = %self.url, gop = index, consumer, state = ?slot.state(), "last user left");
            }
            Released::StillWanted => {
                tracing::trace!(url = %self.url, gop = index, consumer, users = slot.users().len(), "user left");
            }
            Released::NotHeld => {}
        }
    }

    fn detach(&mut self, consumer: ConsumerId) {
        let mut held: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.users().contains(&consumer))
            .map(|(index, _)| index)
            .collect();
        held.extend(
            self.timers
                .keys()
                .filter(|(_, c)| *c == consumer)
                .map(|(index, _)| *index),
        );
        held.sort_unstable();
        held.dedup();

        for index in held {
            self.release(consumer, index);
        }
        if let MetaState::Indexing(waiting) = &mut self.meta {
            waiting.retain(|c| *c != consumer);
        }
        self.consumers.remove(&consumer);
        tracing::trace!(url = %self.url, consumer, "consumer detached");
    }

    fn snapshot(&self) -> Vec<GopSnapshot> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| GopSnapshot {
                index,
                state: slot.state(),
                users: slot.users().iter().copied().collect(),
                in_flight: slot.in_flight(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ContainerMeta;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tokio::time::Instant;

    use crate::testing::{scripted_worker, synthetic_meta, URL};

    const DEBOUNCE: Duration = Duration::from_millis(100);

    fn settings() -> WorkerSettings {
        WorkerSettings {
            gop_min_duration: 0,
            debounce: DEBOUNCE,
            block_size: 4096,
        }
    }

    fn attach(handle: &WorkerHandle, consumer: ConsumerId) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let (events, rx) = mpsc::unbounded_channel();
        handle.send(Request::Attach { consumer, events }).unwrap();
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("worker event")
            .expect("channel open")
    }

    async fn attach_with_meta(
        handle: &WorkerHandle,
        consumer: ConsumerId,
    ) -> (mpsc::UnboundedReceiver<WorkerEvent>, Arc<MediaMeta>) {
        let mut rx = attach(handle, consumer);
        handle.send(Request::Meta { consumer }).unwrap();
        match next(&mut rx).await {
            WorkerEvent::Meta(meta) => (rx, meta),
            other => panic!("expected meta, got {other:?}"),
        }
    }

    fn decode(handle: &WorkerHandle, consumer: ConsumerId, index: usize, retry: bool) {
        handle
            .send(Request::Decode {
                consumer,
                index,
                retry,
            })
            .unwrap();
    }

    fn release(handle: &WorkerHandle, consumer: ConsumerId, index: usize) {
        handle.send(Request::Release { consumer, index }).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_then_decode() {
        let (handle, script, _) = scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
        let (mut rx, meta) = attach_with_meta(&handle, 1).await;
        assert_eq!(meta.table.len(), 4);
        assert!(meta.audio.is_some());

        decode(&handle, 1, 1, false);
        match next(&mut rx).await {
            WorkerEvent::Decoded { index, gop } => {
                assert_eq!(index, 1);
                assert_eq!(gop.video_frames.len(), 4);
                assert_eq!(gop.video_frames[0].timestamp, 1_000_000);
                assert!(gop.audio.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 1);
        assert_eq!(stats.decodes_completed, 1);
        assert_eq!(script.video_decodes(), 1);
        assert_eq!(script.audio_decodes(), 1);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[1].state, GopState::Decoded);
        assert_eq!(snapshot[1].users, vec![1]);
        assert_eq!(snapshot[0].state, GopState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_requests_queue_while_indexing() {
        let (handle, script, _) = scripted_worker(synthetic_meta(8, 250_000, 4, false), settings());
        script.set_delay(Duration::from_millis(300));

        let mut a = attach(&handle, 1);
        let mut b = attach(&handle, 2);
        handle.send(Request::Meta { consumer: 1 }).unwrap();
        handle.send(Request::Meta { consumer: 2 }).unwrap();

        assert!(matches!(next(&mut a).await, WorkerEvent::Meta(_)));
        assert!(matches!(next(&mut b).await, WorkerEvent::Meta(_)));
        assert_eq!(script.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_decode_once() {
        let (handle, script, _) = scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
        script.set_delay(Duration::from_millis(200));
        let (mut a, _) = attach_with_meta(&handle, 1).await;
        let (mut b, _) = attach_with_meta(&handle, 2).await;

        decode(&handle, 1, 0, false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Arrives while the first decode is running.
        decode(&handle, 2, 0, false);

        assert!(matches!(next(&mut a).await, WorkerEvent::Decoded { index: 0, .. }));
        assert!(matches!(next(&mut b).await, WorkerEvent::Decoded { index: 0, .. }));
        assert_eq!(script.video_decodes(), 1);
        assert_eq!(handle.stats().await.unwrap().decodes_started, 1);

        // A late joiner is served from the cache.
        let (mut c, _) = attach_with_meta(&handle, 3).await;
        decode(&handle, 3, 0, false);
        assert!(matches!(next(&mut c).await, WorkerEvent::Decoded { index: 0, .. }));
        assert_eq!(script.video_decodes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_within_debounce_does_nothing() {
        let (handle, script, fetcher) =
            scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
        let (_rx, _) = attach_with_meta(&handle, 1).await;
        let fetches = fetcher.fetch_count();

        decode(&handle, 1, 2, false);
        tokio::time::sleep(DEBOUNCE / 2).await;
        release(&handle, 1, 2);
        tokio::time::sleep(DEBOUNCE * 10).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 0);
        assert_eq!(stats.debounces_cancelled, 1);
        assert_eq!(script.video_decodes(), 0);
        assert_eq!(fetcher.fetch_count(), fetches);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[2].state, GopState::None);
        assert!(snapshot[2].users.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_requests_coalesce() {
        let (handle, script, _) = scripted_worker(synthetic_meta(16, 250_000, 4, false), settings());
        let (mut rx, _) = attach_with_meta(&handle, 1).await;

        for _ in 0..5 {
            decode(&handle, 1, 3, false);
            tokio::time::sleep(DEBOUNCE / 10).await;
        }
        assert!(matches!(next(&mut rx).await, WorkerEvent::Decoded { index: 3, .. }));
        tokio::time::sleep(DEBOUNCE * 5).await;
        assert_eq!(script.video_decodes(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_release_evicts() {
        let (handle, _, _) = scripted_worker(synthetic_meta(16, 250_000, 4, false), settings());
        let (mut a, _) = attach_with_meta(&handle, 1).await;
        let (mut b, _) = attach_with_meta(&handle, 2).await;

        decode(&handle, 1, 0, false);
        decode(&handle, 2, 0, false);
        next(&mut a).await;
        next(&mut b).await;

        release(&handle, 1, 0);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].state, GopState::Decoded);
        assert_eq!(snapshot[0].users, vec![2]);

        release(&handle, 2, 0);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].state, GopState::Loaded);
        assert!(snapshot[0].users.is_empty());
        assert_eq!(handle.stats().await.unwrap().gops_evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_decode_is_discarded() {
        let (handle, script, _) = scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
        script.set_delay(Duration::from_millis(500));
        let (mut rx, _) = attach_with_meta(&handle, 1).await;

        decode(&handle, 1, 1, false);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        assert_eq!(handle.snapshot().await.unwrap()[1].state, GopState::Decoding);

        release(&handle, 1, 1);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 1);
        assert_eq!(stats.decodes_discarded, 1);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[1].state, GopState::Loaded);
        assert!(!snapshot[1].in_flight);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerequest_adopts_in_flight_decode() {
        let (handle, script, _) = scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
        script.set_delay(Duration::from_millis(500));
        let (mut rx, _) = attach_with_meta(&handle, 1).await;

        decode(&handle, 1, 1, false);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        release(&handle, 1, 1);
        decode(&handle, 1, 1, false);

        assert!(matches!(next(&mut rx).await, WorkerEvent::Decoded { index: 1, .. }));
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 1);
        assert_eq!(stats.decodes_adopted, 1);
        assert_eq!(stats.decodes_discarded, 0);
        assert_eq!(script.video_decodes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerequest_takes_abandoned_output_before_debounce() {
        let (handle, script, _) = scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
        script.set_delay(Duration::from_millis(500));
        let (mut rx, _) = attach_with_meta(&handle, 1).await;

        decode(&handle, 1, 1, false);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        release(&handle, 1, 1);
        // Back while the abandoned decode is about to finish, so it lands
        // inside the new request's debounce.
        tokio::time::sleep(Duration::from_millis(400)).await;
        decode(&handle, 1, 1, false);

        assert!(matches!(next(&mut rx).await, WorkerEvent::Decoded { index: 1, .. }));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 1);
        assert_eq!(stats.decodes_completed, 1);
        assert_eq!(stats.decodes_discarded, 0);
        assert_eq!(script.video_decodes(), 1);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[1].state, GopState::Decoded);
        assert_eq!(snapshot[1].users, vec![1]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_errors_only_that_gop() {
        let (handle, script, fetcher) =
            scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
        // GOP 2 spans bytes 8000..12000, so its second block is broken.
        fetcher.fail_range(URL, 8192, 12288);
        let (mut rx, _) = attach_with_meta(&handle, 1).await;

        decode(&handle, 1, 2, false);
        let WorkerEvent::GopError { index, error } = next(&mut rx).await else {
            panic!("expected gop error");
        };
        assert_eq!(index, 2);
        assert!(matches!(*error, Error::FetchFailure { status: 500, .. }));
        assert_eq!(script.video_decodes(), 0);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[2].state, GopState::Error);
        assert!(snapshot[2].users.is_empty());

        decode(&handle, 1, 0, false);
        assert!(matches!(next(&mut rx).await, WorkerEvent::Decoded { index: 0, .. }));

        fetcher.heal_ranges();
        decode(&handle, 1, 2, true);
        assert!(matches!(next(&mut rx).await, WorkerEvent::Decoded { index: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gop_waits_for_slower_flush() {
        let fast = Duration::from_millis(100);
        let slow = Duration::from_millis(700);

        for (video, audio) in [(fast, slow), (slow, fast)] {
            let (handle, script, _) =
                scripted_worker(synthetic_meta(16, 250_000, 4, true), settings());
            let (mut rx, _) = attach_with_meta(&handle, 1).await;
            script.set_video_delay(video);
            script.set_audio_delay(audio);

            let requested = Instant::now();
            decode(&handle, 1, 1, false);
            tokio::time::sleep(DEBOUNCE + fast + Duration::from_millis(50)).await;

            // One flush is done, the other is not.
            assert!(rx.try_recv().is_err());
            assert_eq!(handle.snapshot().await.unwrap()[1].state, GopState::Decoding);

            let WorkerEvent::Decoded { gop, .. } = next(&mut rx).await else {
                panic!("expected decoded gop");
            };
            assert!(requested.elapsed() >= DEBOUNCE + slow);
            assert_eq!(gop.video_frames.len(), 4);
            assert!(gop.audio.is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_traffic_keeps_decoded_iff_held() {
        let (handle, script, _) = scripted_worker(synthetic_meta(32, 250_000, 4, false), settings());
        script.set_delay(Duration::from_millis(30));

        let mut channels = Vec::new();
        for consumer in 1..=3 {
            channels.push(attach_with_meta(&handle, consumer).await.0);
        }

        let mut rng = StdRng::seed_from_u64(0x60c);
        for _ in 0..400 {
            let consumer: ConsumerId = rng.gen_range(1..=3);
            let index = rng.gen_range(0..8);
            match rng.gen_range(0..10) {
                0 => {
                    handle.send(Request::Detach { consumer }).unwrap();
                    channels[consumer as usize - 1] = attach(&handle, consumer);
                }
                1..=5 => decode(&handle, consumer, index, false),
                _ => release(&handle, consumer, index),
            }
            tokio::time::sleep(Duration::from_millis(rng.gen_range(0..60))).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = handle.snapshot().await.unwrap();
        for gop in &snapshot {
            assert_eq!(gop.state == GopState::Decoded, !gop.users.is_empty(), "{gop:?}");
            assert!(!gop.in_flight, "{gop:?}");
        }
        let stats = handle.stats().await.unwrap();
        assert!(stats.decodes_started > 0);
        assert_eq!(
            stats.decodes_started,
            stats.decodes_completed + stats.decodes_discarded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_retried_silently() {
        let meta = synthetic_meta(16, 250_000, 4, false);
        let (handle, script, _) = scripted_worker(meta, settings());
        script.fail_at(1_000_000);
        let (mut rx, _) = attach_with_meta(&handle, 1).await;

        decode(&handle, 1, 1, false);
        let WorkerEvent::GopError { index, error } = next(&mut rx).await else {
            panic!("expected gop error");
        };
        assert_eq!(index, 1);
        assert!(matches!(*error, Error::DecodeFailure(_)));

        // Same request without retry: the stored error, no new decode.
        decode(&handle, 1, 1, false);
        assert!(matches!(next(&mut rx).await, WorkerEvent::GopError { index: 1, .. }));
        assert_eq!(handle.stats().await.unwrap().decodes_started, 1);

        // Sibling GOPs are unaffected.
        decode(&handle, 1, 2, false);
        assert!(matches!(next(&mut rx).await, WorkerEvent::Decoded { index: 2, .. }));

        script.heal(1_000_000);
        decode(&handle, 1, 1, true);
        assert!(matches!(next(&mut rx).await, WorkerEvent::Decoded { index: 1, .. }));
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.decodes_started, 3);
        assert_eq!(stats.decodes_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_failure_is_sticky() {
        let (handle, _, _) = scripted_worker(ContainerMeta::default(), settings());
        let mut rx = attach(&handle, 1);
        handle.send(Request::Meta { consumer: 1 }).unwrap();

        let WorkerEvent::MetaError(error) = next(&mut rx).await else {
            panic!("expected meta error");
        };
        assert!(matches!(*error, Error::MissingTrack { .. }));
        assert!(handle.is_failed());

        handle.send(Request::Meta { consumer: 1 }).unwrap();
        assert!(matches!(next(&mut rx).await, WorkerEvent::MetaError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_releases_everything() {
        let (handle, _, _) = scripted_worker(synthetic_meta(16, 250_000, 4, false), settings());
        let (mut rx, _) = attach_with_meta(&handle, 1).await;

        decode(&handle, 1, 0, false);
        decode(&handle, 1, 1, false);
        next(&mut rx).await;
        next(&mut rx).await;
        decode(&handle, 1, 2, false);
        handle.send(Request::Detach { consumer: 1 }).unwrap();
        tokio::time::sleep(DEBOUNCE * 5).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.iter().all(|gop| gop.users.is_empty()));
        assert_eq!(snapshot[0].state, GopState::Loaded);
        assert_eq!(snapshot[2].state, GopState::None);
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.gops_evicted, 2);
        assert_eq!(stats.debounces_cancelled, 1);
    }
}
