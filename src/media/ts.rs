use async_trait::async_trait;
use bytes::Bytes;

use super::mpegts::{PesPacket, StreamKind, TsScan, TsScanner, PTS_HZ};
use super::{
    AudioChunk, AudioInfo, Container, ContainerMeta, DecodeRange, Demuxer, FfmpegDecoder,
    Micros, PacketInfo, VideoFrame, VideoInfo, MICROS_PER_SEC,
};
use crate::config::DecodeConfig;
use crate::error::Result;
use crate::range::ByteSource;

/// Demuxes MPEG-TS read through the range cache, decodes with `ffmpeg`.
pub struct TsDemuxer {
    decoder: FfmpegDecoder,
}

impl TsDemuxer {
    pub fn new(config: &DecodeConfig) -> Self {
        Self {
            decoder: FfmpegDecoder::new(config),
        }
    }
}

#[async_trait]
impl Demuxer for TsDemuxer {
    async fn open(&self, source: ByteSource) -> Result<Box<dyn Container>> {
        let mut scanner = TsScanner::new();
        let mut offset = 0;
        while offset < source.len() {
            let end = (offset + source.block_size()).min(source.len());
            let chunk = source.read(offset, end).await?;
            scanner.feed(&chunk);
            offset = end;
        }

        let scan = scanner.finish()?;
        let meta = container_meta(&scan, source.len(), &self.decoder);
        tracing::debug!(
            url = %source.url(),
            video_packets = meta.video_packets.len(),
            audio_packets = meta.audio_packets.len(),
            duration_us = meta.duration,
            "scanned transport stream"
        );

        Ok(Box::new(TsContainer {
            source,
            meta,
            decoder: self.decoder.clone(),
        }))
    }
}

struct TsContainer {
    source: ByteSource,
    meta: ContainerMeta,
    decoder: FfmpegDecoder,
}

impl TsContainer {
    async fn input(&self, range: &DecodeRange) -> Result<Bytes> {
        self.source.read(range.byte_start, range.byte_end).await
    }
}

#[async_trait]
impl Container for TsContainer {
    fn meta(&self) -> &ContainerMeta {
        &self.meta
    }

    async fn decode_video(&self, range: DecodeRange) -> Result<Vec<VideoFrame>> {
        let fed = packets_in(&self.meta.video_packets, &range);
        if fed.is_empty() {
            return Ok(Vec::new());
        }

        let pictures = self.decoder.decode_video(self.input(&range).await?).await?;
        Ok(assign_frames(
            fed,
            pictures,
            self.decoder.width(),
            self.decoder.height(),
        ))
    }

    async fn decode_audio(&self, range: DecodeRange) -> Result<Vec<AudioChunk>> {
        let fed = packets_in(&self.meta.audio_packets, &range);
        let Some(first) = fed.iter().map(|p| p.timestamp).min() else {
            return Ok(Vec::new());
        };

        let samples = self.decoder.decode_audio(self.input(&range).await?).await?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![AudioChunk::from_interleaved(
            first,
            self.decoder.sample_rate(),
            self.decoder.channels(),
            &samples,
        )])
    }
}

fn packets_in(packets: &[PacketInfo], range: &DecodeRange) -> Vec<PacketInfo> {
    packets
        .iter()
        .filter(|p| p.byte_offset >= range.byte_start && p.byte_offset < range.byte_end)
        .copied()
        .collect()
}

fn ticks_to_micros(ticks: i64) -> Micros {
    ticks * MICROS_PER_SEC / PTS_HZ as i64
}

/// Builds per-track packet lists. Timestamps are relative to the earliest
/// PTS in the file; durations come from the next PTS in presentation order.
fn container_meta(scan: &TsScan, file_size: u64, decoder: &FfmpegDecoder) -> ContainerMeta {
    let base = scan.packets.iter().filter_map(|p| p.pts).min().unwrap_or(0);
    let video_packets = track_packets(&scan.packets, StreamKind::Video, base);
    let audio_packets = track_packets(&scan.packets, StreamKind::Audio, base);

    let video_duration = track_end(&video_packets);
    let audio_duration = track_end(&audio_packets);

    ContainerMeta {
        video: scan.video.filter(|_| !video_packets.is_empty()).map(|s| VideoInfo {
            codec: s.codec().to_string(),
            width: decoder.width(),
            height: decoder.height(),
            duration: video_duration,
        }),
        audio: scan.audio.filter(|_| !audio_packets.is_empty()).map(|s| AudioInfo {
            codec: s.codec().to_string(),
            sample_rate: decoder.sample_rate(),
            channels: decoder.channels(),
            duration: audio_duration,
        }),
        video_packets,
        audio_packets,
        duration: video_duration.max(audio_duration),
        file_size,
    }
}

fn track_end(packets: &[PacketInfo]) -> Micros {
    packets.iter().map(PacketInfo::end).max().unwrap_or(0)
}

fn track_packets(packets: &[PesPacket], kind: StreamKind, base: u64) -> Vec<PacketInfo> {
    let mut track: Vec<PacketInfo> = packets
        .iter()
        .filter(|p| p.kind == kind)
        .filter_map(|p| {
            let pts = p.pts?;
            Some(PacketInfo {
                timestamp: ticks_to_micros(pts as i64 - base as i64),
                decode_timestamp: ticks_to_micros(p.dts.unwrap_or(pts) as i64 - base as i64),
                duration: 0,
                keyframe: p.keyframe,
                byte_offset: p.byte_offset,
                byte_size: p.byte_end - p.byte_offset,
            })
        })
        .collect();

    let mut order: Vec<usize> = (0..track.len()).collect();
    order.sort_by_key(|&i| track[i].timestamp);

    let mut last = 0;
    for pair in order.windows(2) {
        last = track[pair[1]].timestamp - track[pair[0]].timestamp;
        track[pair[0]].duration = last;
    }
    if let Some(&tail) = order.last() {
        track[tail].duration = last;
    }
    track
}

/// Pairs decoded pictures with the presentation times of the packets fed.
///
/// Leading pictures of an open GOP reference the previous GOP and are not
/// emitted by the decoder, so surplus timestamps before the keyframe are
/// dropped first.
fn assign_frames(
    fed: Vec<PacketInfo>,
    pictures: Vec<Bytes>,
    width: u32,
    height: u32,
) -> Vec<VideoFrame> {
    let keyframe_ts = fed.iter().find(|p| p.keyframe).map(|p| p.timestamp);

    let mut timeline = fed;
    timeline.sort_by_key(|p| p.timestamp);
    if let Some(keyframe_ts) = keyframe_ts {
        let surplus = timeline.len().saturating_sub(pictures.len());
        let leading = timeline
            .iter()
            .take(surplus)
            .take_while(|p| p.timestamp < keyframe_ts)
            .count();
        timeline.drain(..leading);
    }

    if timeline.len() != pictures.len() {
        tracing::trace!(
            packets = timeline.len(),
            pictures = pictures.len(),
            "decoder output does not match packet count"
        );
    }

    timeline
        .into_iter()
        .zip(pictures)
        .map(|(packet, data)| VideoFrame {
            timestamp: packet.timestamp,
            duration: (packet.duration > 0).then_some(packet.duration),
            width,
            height,
            data,
        })
        .collect()
}
