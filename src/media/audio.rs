use super::{Micros, MICROS_PER_SEC};

/// Decoded samples of one audio packet, planar.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub timestamp: Micros,
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioChunk {
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn from_interleaved(
        timestamp: Micros,
        sample_rate: u32,
        channel_count: u16,
        samples: &[f32],
    ) -> Self {
        let count = usize::from(channel_count.max(1));
        let frames = samples.len() / count;
        let mut channels = vec![Vec::with_capacity(frames); count];
        for frame in samples.chunks_exact(count) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }
        Self {
            timestamp,
            sample_rate,
            channels,
        }
    }
}

/// Contiguous planar samples for a whole GOP.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub timestamp: Micros,
    pub sample_rate: u32,
    pub frames: usize,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Concatenates chunks in timestamp order. Chunks with fewer channels
    /// than the widest one are padded with silence.
    pub fn assemble(mut chunks: Vec<AudioChunk>) -> Option<Self> {
        chunks.retain(|c| c.frames() > 0);
        chunks.sort_by_key(|c| c.timestamp);
        let first = chunks.first()?;

        let timestamp = first.timestamp;
        let sample_rate = first.sample_rate;
        let channel_count = chunks.iter().map(|c| c.channels.len()).max().unwrap_or(0);
        let frames: usize = chunks.iter().map(AudioChunk::frames).sum();

        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for chunk in &chunks {
            let len = chunk.frames();
            for (i, channel) in channels.iter_mut().enumerate() {
                match chunk.channels.get(i) {
                    Some(data) => channel.extend_from_slice(&data[..len.min(data.len())]),
                    None => channel.resize(channel.len() + len, 0.0),
                }
            }
        }

        Some(Self {
            timestamp,
            sample_rate,
            frames,
            channels,
        })
    }

    pub fn duration(&self) -> Micros {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frames as i64 * MICROS_PER_SEC) / i64::from(self.sample_rate)
    }

    fn frame_at(&self, time: Micros) -> usize {
        let offset = (time - self.timestamp).max(0);
        let frame = offset * i64::from(self.sample_rate) / MICROS_PER_SEC;
        (frame as usize).min(self.frames)
    }

    /// Keeps only the samples presented in `start..end`.
    pub fn clip(mut self, start: Micros, end: Micros) -> Option<Self> {
        let from = self.frame_at(start);
        let to = self.frame_at(end);
        if from >= to {
            return None;
        }
        if from == 0 && to == self.frames {
            return Some(self);
        }
        for channel in &mut self.channels {
            channel.truncate(to);
            channel.drain(..from);
        }
        if from > 0 {
            self.timestamp += from as i64 * MICROS_PER_SEC / i64::from(self.sample_rate);
        }
        self.frames = to - from;
        Some(self)
    }
}
