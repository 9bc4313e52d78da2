use std::sync::Arc;

use super::protocol::DecodedGop;
use crate::error::Result;
use crate::gop::GopSpan;
use crate::media::{AudioBuffer, Container};

/// Decodes one GOP. Video and audio run concurrently and the GOP is only
/// returned once both have finished. Output outside the GOP's own span,
/// dragged in by the reference window, is dropped.
pub async fn decode_gop(container: Arc<dyn Container>, span: GopSpan) -> Result<DecodedGop> {
    let range = span.decode_range();
    let meta = container.meta();
    let has_video = meta.video.is_some() && span.video_packets > 0;
    let has_audio = meta.audio.is_some() && span.audio_packets > 0;

    let (frames, chunks) = tokio::try_join!(
        async {
            if has_video {
                container.decode_video(range).await
            } else {
                Ok(Vec::new())
            }
        },
        async {
            if has_audio {
                container.decode_audio(range).await
            } else {
                Ok(Vec::new())
            }
        },
    )?;

    let mut video_frames: Vec<_> = frames
        .into_iter()
        .filter(|f| span.contains(f.timestamp))
        .collect();
    video_frames.sort_by_key(|f| f.timestamp);

    let audio = AudioBuffer::assemble(chunks).and_then(|b| b.clip(span.timestamp, span.end()));

    Ok(DecodedGop {
        index: span.index,
        timestamp: span.timestamp,
        duration: span.duration,
        video_frames,
        audio,
    })
}
