//! Streaming coordinator: one consumer's view of a file.
//!
//! A coordinator follows a playhead. Every [`StreamingCoordinator::process`]
//! call moves the decode window and tells the shared worker which GOPs this
//! consumer wants and which it no longer needs.

mod window;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::media::{micros_to_secs, secs_to_micros, AudioBuffer, Micros, VideoFrame};
use crate::registry::{FileHandle, Registry};
use crate::worker::{ConsumerId, DecodedGop, EventSender, MediaMeta, Request, WorkerEvent};

pub use window::{plan, WindowPlan};

static NEXT_CONSUMER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Meta(Arc<MediaMeta>),
    /// The GOP under the playhead is decoded.
    CanPlay { index: usize },
    /// A GOP elsewhere in the window is decoded.
    AudioReady { index: usize },
    Error(Arc<Error>),
}

#[derive(Debug)]
enum Held {
    Pending,
    Ready(Arc<DecodedGop>),
    Failed(Arc<Error>),
}

pub struct StreamingCoordinator {
    registry: Registry,
    url: String,
    consumer: ConsumerId,
    decode_duration: Micros,
    tolerance: Micros,
    file: Option<FileHandle>,
    events_tx: EventSender,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    meta: Option<Arc<MediaMeta>>,
    held: BTreeMap<usize, Held>,
    current_time: Micros,
    gop_index: Option<usize>,
    retry: bool,
    outbox: VecDeque<CoordinatorEvent>,
}

impl StreamingCoordinator {
    pub fn new(registry: Registry, url: impl Into<String>) -> Self {
        let cache = registry.cache_config();
        let decode_duration = cache.decode_duration_us();
        let tolerance = cache.resolve_tolerance_us();
        let (events_tx, events) = mpsc::unbounded_channel();

        Self {
            registry,
            url: url.into(),
            consumer: NEXT_CONSUMER.fetch_add(1, Ordering::Relaxed),
            decode_duration,
            tolerance,
            file: None,
            events_tx,
            events,
            meta: None,
            held: BTreeMap::new(),
            current_time: 0,
            gop_index: None,
            retry: false,
            outbox: VecDeque::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }

    /// Starts playback at `time` seconds, or seeks there. GOPs that failed
    /// earlier are retried once.
    pub fn start(&mut self, time: f64) {
        self.current_time = secs_to_micros(time);
        self.retry = true;

        if self.file.is_none() {
            let file = self.registry.acquire(&self.url);
            let attach = file.worker().send(Request::Attach {
                consumer: self.consumer,
                events: self.events_tx.clone(),
            });
            let meta = file.worker().send(Request::Meta {
                consumer: self.consumer,
            });
            if let Err(error) = attach.and(meta) {
                tracing::warn!(url = %self.url, consumer = self.consumer, error = %error, "could not attach");
                return;
            }
            tracing::debug!(url = %self.url, consumer = self.consumer, time, "coordinator started");
            self.file = Some(file);
            // The window opens once meta arrives.
            return;
        }

        self.update_window();
    }

    /// Moves the playhead to `time` seconds.
    pub fn process(&mut self, time: f64) {
        self.drain();
        self.current_time = secs_to_micros(time);
        self.update_window();
    }

    /// Waits for the next event. Returns `None` only if the worker side
    /// went away, which cannot happen while the coordinator holds a sender.
    pub async fn next_event(&mut self) -> Option<CoordinatorEvent> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            let event = self.events.recv().await?;
            self.handle_event(event);
        }
    }

    pub fn poll_event(&mut self) -> Option<CoordinatorEvent> {
        self.drain();
        self.outbox.pop_front()
    }

    /// Gives up every GOP and detaches from the worker.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            for &index in self.held.keys() {
                let _ = file.worker().send(Request::Release {
                    consumer: self.consumer,
                    index,
                });
            }
            let _ = file.worker().send(Request::Detach {
                consumer: self.consumer,
            });
            tracing::debug!(url = %self.url, consumer = self.consumer, held = self.held.len(), "coordinator released");
        }
        self.held.clear();
        self.meta = None;
        self.gop_index = None;
    }

    pub fn meta(&self) -> Option<&Arc<MediaMeta>> {
        self.meta.as_ref()
    }

    pub fn current_time(&self) -> f64 {
        micros_to_secs(self.current_time)
    }

    pub fn gop_index(&self) -> Option<usize> {
        self.gop_index
    }

    pub fn current_gop(&self) -> Option<&Arc<DecodedGop>> {
        self.ready(self.gop_index?)
    }

    /// Frame showing at `time` seconds, if its GOP is decoded and held.
    pub fn frame_at(&self, time: f64) -> Option<&VideoFrame> {
        let time = secs_to_micros(time);
        let index = self.meta.as_ref()?.table.resolve(time, self.tolerance)?;
        self.ready(index)?.frame_at(time)
    }

    pub fn audio_buffer(&self, index: usize) -> Option<&AudioBuffer> {
        self.ready(index)?.audio.as_ref()
    }

    pub fn held_indices(&self) -> Vec<usize> {
        self.held.keys().copied().collect()
    }

    /// Last error seen for a held GOP.
    pub fn gop_error(&self, index: usize) -> Option<&Arc<Error>> {
        match self.held.get(&index)? {
            Held::Failed(error) => Some(error),
            _ => None,
        }
    }

    fn ready(&self, index: usize) -> Option<&Arc<DecodedGop>> {
        match self.held.get(&index)? {
            Held::Ready(gop) => Some(gop),
            _ => None,
        }
    }

    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Meta(meta) => {
                if self.file.is_none() {
                    return;
                }
                tracing::debug!(url = %self.url, consumer = self.consumer, gops = meta.table.len(), "meta received");
                self.meta = Some(Arc::clone(&meta));
                self.outbox.push_back(CoordinatorEvent::Meta(meta));
                self.update_window();
            }
            WorkerEvent::MetaError(error) => {
                if self.file.is_none() {
                    return;
                }
                // Let go of the failed worker so the next start indexes afresh.
                self.release();
                self.outbox.push_back(CoordinatorEvent::Error(error));
            }
            WorkerEvent::Decoded { index, gop } => {
                let Some(slot) = self.held.get_mut(&index) else {
                    tracing::trace!(url = %self.url, consumer = self.consumer, gop = index, "late decode ignored");
                    return;
                };
                *slot = Held::Ready(gop);
                let event = if self.gop_index == Some(index) {
                    CoordinatorEvent::CanPlay { index }
                } else {
                    CoordinatorEvent::AudioReady { index }
                };
                self.outbox.push_back(event);
            }
            WorkerEvent::GopError { index, error } => {
                let Some(slot) = self.held.get_mut(&index) else {
                    return;
                };
                *slot = Held::Failed(Arc::clone(&error));
                self.outbox.push_back(CoordinatorEvent::Error(error));
            }
        }
    }

    fn update_window(&mut self) {
        let (Some(meta), Some(file)) = (self.meta.as_ref(), self.file.as_ref()) else {
            return;
        };
        let held: Vec<usize> = self.held.keys().copied().collect();
        let plan = plan(
            &meta.table,
            self.current_time,
            self.decode_duration,
            self.tolerance,
            &held,
        );
        let retry = std::mem::take(&mut self.retry);
        let worker = file.worker();

        for index in &plan.release {
            self.held.remove(index);
            if let Err(error) = worker.send(Request::Release {
                consumer: self.consumer,
                index: *index,
            }) {
                tracing::warn!(url = %self.url, consumer = self.consumer, gop = index, error = %error, "release not sent");
            }
        }

        for &index in &plan.wanted {
            let request = match self.held.get(&index) {
                None => true,
                Some(Held::Failed(_)) => retry,
                Some(_) => false,
            };
            if !request {
                continue;
            }
            match worker.send(Request::Decode {
                consumer: self.consumer,
                index,
                retry,
            }) {
                Ok(()) => {
                    self.held.insert(index, Held::Pending);
                }
                Err(error) => {
                    tracing::warn!(url = %self.url, consumer = self.consumer, gop = index, error = %error, "decode not sent");
                }
            }
        }

        if plan.current != self.gop_index {
            tracing::trace!(url = %self.url, consumer = self.consumer, gop = ?plan.current, "playhead moved");
        }
        self.gop_index = plan.current;
    }
}

impl Drop for StreamingCoordinator {
    fn drop(&mut self) {
        self.release();
    }
}
