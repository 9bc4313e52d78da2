use thiserror::Error;

use crate::media::mpegts::TsError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown content-length: {url}")]
    MissingContentLength { url: String },
    #[error("no usable audio or video track: {url}")]
    MissingTrack { url: String },
    #[error("bad range response {status}: {url}")]
    FetchFailure { url: String, status: u16 },
    #[error("decode failed: {0}")]
    DecodeFailure(String),
    #[error("unreadable transport stream: {0}")]
    Ts(#[from] TsError),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode worker is gone")]
    WorkerGone,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
