use super::table::{GopSpan, GopTable};
use crate::error::{Error, Result};
use crate::media::{ContainerMeta, Micros, PacketInfo};

/// Builds the GOP table from a container's packet list.
#[derive(Debug, Clone, Copy)]
pub struct GopIndexer {
    min_duration: Micros,
}

impl GopIndexer {
    /// GOPs shorter than `min_duration` are merged with their successors.
    pub fn new(min_duration: Micros) -> Self {
        Self { min_duration }
    }

    pub fn index(&self, url: &str, meta: &ContainerMeta) -> Result<GopTable> {
        let has_video = meta.video.is_some() && !meta.video_packets.is_empty();
        let has_audio = meta.audio.is_some() && !meta.audio_packets.is_empty();

        let mut spans = if has_video {
            let track_end = meta
                .video
                .as_ref()
                .map_or(meta.duration, |v| v.duration.max(meta.duration));
            split_video(&meta.video_packets, track_end)
        } else if has_audio {
            split_audio(&meta.audio_packets)
        } else {
            return Err(Error::MissingTrack {
                url: url.to_string(),
            });
        };

        let before = spans.len();
        merge_short(&mut spans, self.min_duration);
        if has_video && has_audio {
            assign_audio(&mut spans, &meta.audio_packets);
        }
        for (i, span) in spans.iter_mut().enumerate() {
            span.index = i;
        }

        let duration = spans
            .last()
            .map_or(meta.duration, |last| last.end().max(meta.duration));

        tracing::info!(
            url = %url,
            gops = spans.len(),
            merged = before - spans.len(),
            duration_us = duration,
            "indexed file"
        );
        Ok(GopTable::new(spans, duration))
    }
}

/// Opens a span at every keyframe. The first packet always opens one, so a
/// stream without keyframes yields a single span.
fn split_video(packets: &[PacketInfo], track_end: Micros) -> Vec<GopSpan> {
    let mut starts: Vec<usize> = packets
        .iter()
        .enumerate()
        .filter(|(i, p)| *i == 0 || p.keyframe)
        .map(|(i, _)| i)
        .collect();
    starts.push(packets.len());

    let mut spans = Vec::with_capacity(starts.len() - 1);
    for (g, bounds) in starts.windows(2).enumerate() {
        let (first, next) = (bounds[0], bounds[1]);
        let own = &packets[first..next];

        let mut timestamp = packets[first].timestamp;
        if g == 0 {
            timestamp = own.iter().map(|p| p.timestamp).min().unwrap_or(timestamp);
        }
        let own_end = own.iter().map(PacketInfo::end).max().unwrap_or(timestamp);
        let end = match packets.get(next) {
            Some(keyframe) => keyframe.timestamp,
            None => track_end.max(own_end),
        };

        let mut byte_end = own.iter().map(PacketInfo::byte_end).max().unwrap_or(0);
        // Leading pictures of the next GOP that present before `end` need
        // its keyframe and themselves in the decode input.
        let spill = packets
            .iter()
            .skip(next + 1)
            .take_while(|p| !p.keyframe && p.timestamp < end)
            .map(PacketInfo::byte_end)
            .max();
        if let Some(spill_end) = spill {
            byte_end = byte_end.max(spill_end);
        }

        spans.push(GopSpan {
            index: g,
            sequence_number: first,
            timestamp,
            duration: end - timestamp,
            decode_end: own_end,
            byte_start: packets[first].byte_offset,
            byte_end,
            video_packets: own.len(),
            audio_packets: 0,
        });
    }
    spans
}

/// Every audio packet is a sync point.
fn split_audio(packets: &[PacketInfo]) -> Vec<GopSpan> {
    let mut sorted = packets.to_vec();
    sorted.sort_by_key(|p| p.timestamp);

    let mut spans: Vec<GopSpan> = Vec::with_capacity(sorted.len());
    for (i, packet) in sorted.iter().enumerate() {
        let end = sorted
            .get(i + 1)
            .map_or(packet.end(), |next| next.timestamp.max(packet.timestamp));
        spans.push(GopSpan {
            index: i,
            sequence_number: i,
            timestamp: packet.timestamp,
            duration: end - packet.timestamp,
            decode_end: packet.end(),
            byte_start: packet.byte_offset,
            byte_end: packet.byte_end(),
            video_packets: 0,
            audio_packets: 1,
        });
    }
    spans
}

fn merge_short(spans: &mut Vec<GopSpan>, min_duration: Micros) {
    let mut i = 0;
    while i < spans.len() {
        while spans[i].duration < min_duration && i + 1 < spans.len() {
            let next = spans.remove(i + 1);
            let span = &mut spans[i];
            span.duration = next.end() - span.timestamp;
            span.decode_end = span.decode_end.max(next.decode_end);
            span.byte_start = span.byte_start.min(next.byte_start);
            span.byte_end = span.byte_end.max(next.byte_end);
            span.video_packets += next.video_packets;
            span.audio_packets += next.audio_packets;
        }
        i += 1;
    }
}

/// Widens each video GOP over the audio packets that present inside it. The
/// first and last GOP stretch to cover audio outside every video span.
fn assign_audio(spans: &mut [GopSpan], audio: &[PacketInfo]) {
    let Some(last) = spans.len().checked_sub(1) else {
        return;
    };

    for packet in audio {
        let after = spans.partition_point(|s| s.timestamp <= packet.timestamp);
        let index = after.saturating_sub(1);

        if index == 0 && packet.timestamp < spans[0].timestamp {
            let first = &mut spans[0];
            first.duration += first.timestamp - packet.timestamp;
            first.timestamp = packet.timestamp;
        }
        if index == last && packet.end() > spans[last].end() {
            let tail = &mut spans[last];
            tail.duration = packet.end() - tail.timestamp;
        }

        let span = &mut spans[index];
        span.byte_start = span.byte_start.min(packet.byte_offset);
        span.byte_end = span.byte_end.max(packet.byte_end());
        span.audio_packets += 1;
    }
}
