//! MPEG-TS packet scanner.
//!
//! Walks a transport stream and records one [`PesPacket`] per PES on the
//! first video and first audio elementary stream of the first program,
//! without touching the compressed payload beyond the first few bytes.

use thiserror::Error;

pub const TS_PACKET_SIZE: usize = 188;
pub const PTS_HZ: u64 = 90_000;

const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0;
const NAL_SCAN_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum TsError {
    #[error("no transport stream sync byte found")]
    NoSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsStream {
    pub pid: u16,
    pub stream_type: u8,
}

impl TsStream {
    fn classify(stream_type: u8) -> Option<StreamKind> {
        match stream_type {
            0x1B | 0x24 => Some(StreamKind::Video),
            0x0F | 0x03 | 0x04 => Some(StreamKind::Audio),
            _ => None,
        }
    }

    pub fn codec(&self) -> &'static str {
        match self.stream_type {
            0x1B => "h264",
            0x24 => "hevc",
            0x0F => "aac",
            0x03 | 0x04 => "mp3",
            _ => "unknown",
        }
    }
}

/// One PES packet. Timestamps are raw 90 kHz ticks, the byte range covers
/// every TS packet that carried part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesPacket {
    pub kind: StreamKind,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub keyframe: bool,
    pub byte_offset: u64,
    pub byte_end: u64,
}

#[derive(Debug, Default)]
pub struct TsScan {
    pub video: Option<TsStream>,
    pub audio: Option<TsStream>,
    /// Sorted by `byte_offset`.
    pub packets: Vec<PesPacket>,
}

struct OpenPes {
    packet: PesPacket,
    head: Vec<u8>,
    stream_type: Option<u8>,
}

#[derive(Default)]
pub struct TsScanner {
    pmt_pid: Option<u16>,
    video: Option<TsStream>,
    audio: Option<TsStream>,
    position: u64,
    carry: Vec<u8>,
    synced: bool,
    open_video: Option<OpenPes>,
    open_audio: Option<OpenPes>,
    packets: Vec<PesPacket>,
}

impl TsScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the next chunk of the stream. Chunks need not be aligned to
    /// TS packets; a partial packet is carried over to the next call.
    pub fn feed(&mut self, data: &[u8]) {
        self.carry.extend_from_slice(data);

        let mut offset = 0;
        while offset + TS_PACKET_SIZE <= self.carry.len() {
            if self.carry[offset] != SYNC_BYTE {
                offset += 1;
                continue;
            }

            self.synced = true;
            let at = self.position + offset as u64;
            let packet: [u8; TS_PACKET_SIZE] = match self.carry[offset..offset + TS_PACKET_SIZE]
                .try_into()
            {
                Ok(packet) => packet,
                Err(_) => break,
            };
            self.parse_packet(&packet, at);
            offset += TS_PACKET_SIZE;
        }

        self.carry.drain(..offset);
        self.position += offset as u64;
    }

    pub fn finish(mut self) -> Result<TsScan, TsError> {
        if !self.synced {
            return Err(TsError::NoSync);
        }

        for open in [self.open_video.take(), self.open_audio.take()]
            .into_iter()
            .flatten()
        {
            self.packets.push(close(open));
        }
        self.packets.sort_by_key(|p| p.byte_offset);

        Ok(TsScan {
            video: self.video,
            audio: self.audio,
            packets: self.packets,
        })
    }

    fn parse_packet(&mut self, packet: &[u8; TS_PACKET_SIZE], at: u64) {
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let payload_start = (packet[1] & 0x40) != 0;
        let has_adaptation = (packet[3] & 0x20) != 0;
        let has_payload = (packet[3] & 0x10) != 0;

        let mut payload_offset = 4;
        let mut random_access = false;
        if has_adaptation {
            let adaptation_len = packet[4] as usize;
            if adaptation_len > 0 {
                random_access = (packet[5] & 0x40) != 0;
            }
            payload_offset = 5 + adaptation_len;
        }

        let payload = if has_payload && payload_offset < TS_PACKET_SIZE {
            &packet[payload_offset..]
        } else {
            &[][..]
        };

        if pid == PAT_PID {
            if payload_start {
                self.parse_pat(payload);
            }
            return;
        }
        if Some(pid) == self.pmt_pid {
            if payload_start {
                self.parse_pmt(payload);
            }
            return;
        }

        let kind = if self.video.is_some_and(|s| s.pid == pid) {
            StreamKind::Video
        } else if self.audio.is_some_and(|s| s.pid == pid) {
            StreamKind::Audio
        } else {
            return;
        };

        let packet_end = at + TS_PACKET_SIZE as u64;
        if payload_start {
            if let Some(open) = self.open_slot(kind).take() {
                self.packets.push(close(open));
            }
            let video_type = self.video.map(|s| s.stream_type);
            *self.open_slot(kind) = start_pes(kind, payload, at, random_access, video_type);
            return;
        }

        // Continuation of the open PES, if we saw its start.
        if let Some(open) = self.open_slot(kind).as_mut() {
            open.packet.byte_end = packet_end;
            if open.head.len() < NAL_SCAN_LIMIT {
                let room = NAL_SCAN_LIMIT - open.head.len();
                open.head.extend_from_slice(&payload[..payload.len().min(room)]);
            }
        }
    }

    fn open_slot(&mut self, kind: StreamKind) -> &mut Option<OpenPes> {
        match kind {
            StreamKind::Video => &mut self.open_video,
            StreamKind::Audio => &mut self.open_audio,
        }
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some((section, start)) = section(payload, 0x00) else {
            return;
        };

        let mut pos = start + 8;
        while pos + 4 <= section {
            let program_number = ((payload[pos] as u16) << 8) | payload[pos + 1] as u16;
            let pid = ((payload[pos + 2] as u16 & 0x1F) << 8) | payload[pos + 3] as u16;
            if program_number != 0 {
                if self.pmt_pid != Some(pid) {
                    tracing::trace!(pmt_pid = pid, "found PMT PID in PAT");
                }
                self.pmt_pid = Some(pid);
                return;
            }
            pos += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        let Some((section, start)) = section(payload, 0x02) else {
            return;
        };
        if start + 12 > section {
            return;
        }

        let program_info_len =
            ((payload[start + 10] as usize & 0x0F) << 8) | payload[start + 11] as usize;

        let mut pos = start + 12 + program_info_len;
        while pos + 5 <= section {
            let stream_type = payload[pos];
            let pid = ((payload[pos + 1] as u16 & 0x1F) << 8) | payload[pos + 2] as u16;
            let es_info_len = ((payload[pos + 3] as usize & 0x0F) << 8) | payload[pos + 4] as usize;

            let stream = TsStream { pid, stream_type };
            match TsStream::classify(stream_type) {
                Some(StreamKind::Video) if self.video.is_none() => {
                    tracing::debug!(pid, codec = stream.codec(), "detected video PID");
                    self.video = Some(stream);
                }
                Some(StreamKind::Audio) if self.audio.is_none() => {
                    tracing::debug!(pid, codec = stream.codec(), "detected audio PID");
                    self.audio = Some(stream);
                }
                _ => {}
            }

            pos += 5 + es_info_len;
        }
    }
}

/// Locates a PSI section with the given table id. Returns the exclusive end
/// of its body (before the CRC) and the offset of the table id.
fn section(payload: &[u8], table_id: u8) -> Option<(usize, usize)> {
    let pointer = *payload.first()? as usize;
    let start = 1 + pointer;
    if start + 3 > payload.len() || payload[start] != table_id {
        return None;
    }
    let section_len = ((payload[start + 1] as usize & 0x0F) << 8) | payload[start + 2] as usize;
    let end = (start + 3 + section_len).saturating_sub(4).min(payload.len());
    Some((end, start))
}

fn start_pes(
    kind: StreamKind,
    payload: &[u8],
    at: u64,
    random_access: bool,
    video_type: Option<u8>,
) -> Option<OpenPes> {
    if payload.len() < 9 || payload[..3] != [0x00, 0x00, 0x01] {
        return None;
    }

    let flags = (payload[7] >> 6) & 0x03;
    let header_len = payload[8] as usize;

    let pts = (flags & 0x02 != 0 && payload.len() >= 14).then(|| parse_timestamp(&payload[9..14]));
    let dts = (flags == 0x03 && payload.len() >= 19).then(|| parse_timestamp(&payload[14..19]));

    let es_start = (9 + header_len).min(payload.len());
    let head = payload[es_start..payload.len().min(es_start + NAL_SCAN_LIMIT)].to_vec();

    let keyframe = match kind {
        StreamKind::Audio => true,
        StreamKind::Video => {
            random_access || video_type.is_some_and(|t| starts_random_access(t, &head))
        }
    };

    Some(OpenPes {
        packet: PesPacket {
            kind,
            pts,
            dts,
            keyframe,
            byte_offset: at,
            byte_end: at + TS_PACKET_SIZE as u64,
        },
        head,
        stream_type: video_type,
    })
}

fn close(open: OpenPes) -> PesPacket {
    let OpenPes {
        mut packet,
        head,
        stream_type,
    } = open;
    if packet.kind == StreamKind::Video && !packet.keyframe {
        // The IDR NAL may only show up past the first TS packet.
        packet.keyframe = stream_type.is_some_and(|t| starts_random_access(t, &head));
    }
    packet
}

/// Looks for an IDR (H.264) or IRAP (HEVC) NAL unit in the first bytes of
/// an access unit.
fn starts_random_access(stream_type: u8, data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let header = data[i + 3];
            let hit = match stream_type {
                0x1B => header & 0x1F == 5,
                0x24 => (16..=21).contains(&((header >> 1) & 0x3F)),
                _ => false,
            };
            if hit {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}

fn parse_timestamp(data: &[u8]) -> u64 {
    ((data[0] as u64 >> 1) & 0x07) << 30
        | (data[1] as u64) << 22
        | ((data[2] as u64 >> 1) & 0x7F) << 15
        | (data[3] as u64) << 7
        | ((data[4] as u64 >> 1) & 0x7F)
}
