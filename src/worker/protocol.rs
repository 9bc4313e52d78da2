use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::state::GopState;
use crate::error::Error;
use crate::gop::GopTable;
use crate::media::{find_frame, AudioBuffer, AudioInfo, Micros, VideoFrame, VideoInfo};

pub type ConsumerId = u64;

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Messages a decode worker accepts. Everything is fire-and-forget except
/// the diagnostic queries, which carry a reply channel.
#[derive(Debug)]
pub enum Request {
    Attach {
        consumer: ConsumerId,
        events: EventSender,
    },
    Detach {
        consumer: ConsumerId,
    },
    Meta {
        consumer: ConsumerId,
    },
    Decode {
        consumer: ConsumerId,
        index: usize,
        retry: bool,
    },
    Release {
        consumer: ConsumerId,
        index: usize,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<GopSnapshot>>,
    },
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Meta(Arc<MediaMeta>),
    MetaError(Arc<Error>),
    Decoded { index: usize, gop: Arc<DecodedGop> },
    GopError { index: usize, error: Arc<Error> },
}

/// Track info and the GOP table of one file.
#[derive(Debug, Clone)]
pub struct MediaMeta {
    pub url: String,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
    pub duration: Micros,
    pub file_size: u64,
    pub table: GopTable,
}

/// Output of one GOP decode. Video and audio always arrive together.
#[derive(Debug, Clone)]
pub struct DecodedGop {
    pub index: usize,
    pub timestamp: Micros,
    pub duration: Micros,
    pub video_frames: Vec<VideoFrame>,
    pub audio: Option<AudioBuffer>,
}

impl DecodedGop {
    pub fn frame_at(&self, time: Micros) -> Option<&VideoFrame> {
        find_frame(&self.video_frames, time)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub decodes_started: u64,
    pub decodes_adopted: u64,
    pub decodes_completed: u64,
    pub decodes_discarded: u64,
    pub decodes_failed: u64,
    pub debounces_cancelled: u64,
    pub gops_evicted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GopSnapshot {
    pub index: usize,
    pub state: GopState,
    pub users: Vec<ConsumerId>,
    pub in_flight: bool,
}
