//! Container demuxing and the decode primitive.
//!
//! The engine only talks to [`Demuxer`] and [`Container`]. The shipped
//! backend reads MPEG-TS through the byte range cache and decodes in an
//! `ffmpeg` child process.

mod audio;
mod ffmpeg;
mod frame;
pub mod mpegts;
mod ts;

use async_trait::async_trait;

use crate::error::Result;
use crate::range::ByteSource;

pub use audio::{AudioBuffer, AudioChunk};
pub use ffmpeg::FfmpegDecoder;
pub use frame::{find_frame, VideoFrame};
pub use ts::TsDemuxer;

/// Media time in microseconds.
pub type Micros = i64;

pub const MICROS_PER_SEC: i64 = 1_000_000;

pub fn secs_to_micros(secs: f64) -> Micros {
    (secs * MICROS_PER_SEC as f64).round() as Micros
}

pub fn micros_to_secs(us: Micros) -> f64 {
    us as f64 / MICROS_PER_SEC as f64
}

/// Metadata for one encoded sample, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub timestamp: Micros,
    pub decode_timestamp: Micros,
    pub duration: Micros,
    pub keyframe: bool,
    pub byte_offset: u64,
    pub byte_size: u64,
}

impl PacketInfo {
    pub fn end(&self) -> Micros {
        self.timestamp + self.duration
    }

    pub fn byte_end(&self) -> u64 {
        self.byte_offset + self.byte_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub duration: Micros,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Micros,
}

/// Track layout of an opened container. Packets are in decode order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMeta {
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
    pub video_packets: Vec<PacketInfo>,
    pub audio_packets: Vec<PacketInfo>,
    pub duration: Micros,
    pub file_size: u64,
}

/// What to decode: samples presented in `start..end`, whose data lives in
/// `byte_start..byte_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeRange {
    pub start: Micros,
    pub end: Micros,
    pub byte_start: u64,
    pub byte_end: u64,
}

#[async_trait]
pub trait Container: Send + Sync {
    fn meta(&self) -> &ContainerMeta;

    /// Decoded pictures in presentation order. May include frames outside
    /// `range.start..range.end` that the reference window dragged in.
    async fn decode_video(&self, range: DecodeRange) -> Result<Vec<VideoFrame>>;

    async fn decode_audio(&self, range: DecodeRange) -> Result<Vec<AudioChunk>>;
}

#[async_trait]
pub trait Demuxer: Send + Sync {
    async fn open(&self, source: ByteSource) -> Result<Box<dyn Container>>;
}
