use std::fmt;

use bytes::Bytes;

use super::Micros;

/// One decoded RGBA picture.
#[derive(Clone)]
pub struct VideoFrame {
    pub timestamp: Micros,
    pub duration: Option<Micros>,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp", &self.timestamp)
            .field("duration", &self.duration)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Frame shown at `time` from a list sorted by timestamp.
///
/// The last frame starting at or before `time` is the one whose interval
/// contains it, or the one to hold across a gap. A later frame is only
/// returned when it is the sole frame.
pub fn find_frame(frames: &[VideoFrame], time: Micros) -> Option<&VideoFrame> {
    match frames {
        [] => None,
        [only] => Some(only),
        _ => {
            let after = frames.partition_point(|f| f.timestamp <= time);
            after.checked_sub(1).map(|i| &frames[i])
        }
    }
}
