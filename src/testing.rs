//! In-memory fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::media::{
    AudioChunk, AudioInfo, Container, ContainerMeta, DecodeRange, Demuxer, Micros, PacketInfo,
    VideoFrame, VideoInfo,
};
use crate::range::{ByteSource, MemoryStore, RangeCache, RangeFetcher, RangeKey};
use crate::registry::Registry;
use crate::worker::{spawn_worker, WorkerHandle, WorkerSettings};

pub const URL: &str = "http://media.test/clip.ts";

/// Serves byte ranges of registered in-memory files.
#[derive(Default)]
pub struct FakeFetcher {
    files: Mutex<HashMap<String, Bytes>>,
    failing: Mutex<Vec<RangeKey>>,
    fetches: AtomicUsize,
    length_lookups: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, data: impl Into<Bytes>) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), data.into());
    }

    pub fn insert_pattern(&self, url: &str, len: usize) {
        let data: Vec<u8> = (0..len as u64).map(Self::pattern_byte).collect();
        self.insert(url, data);
    }

    /// Fetches overlapping `start..end` of `url` answer 500.
    pub fn fail_range(&self, url: &str, start: u64, end: u64) {
        self.failing
            .lock()
            .unwrap()
            .push(RangeKey::new(url, start, end));
    }

    pub fn heal_ranges(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn pattern_byte(offset: u64) -> u8 {
        (offset % 251) as u8
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn length_lookups(&self) -> usize {
        self.length_lookups.load(Ordering::SeqCst)
    }

    fn file(&self, url: &str) -> Option<Bytes> {
        self.files.lock().unwrap().get(url).cloned()
    }
}

#[async_trait]
impl RangeFetcher for FakeFetcher {
    async fn content_length(&self, url: &str) -> Result<u64> {
        self.length_lookups.fetch_add(1, Ordering::SeqCst);
        self.file(url)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::MissingContentLength {
                url: url.to_string(),
            })
    }

    async fn fetch(&self, url: &str, start: u64, end: u64) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self.file(url).ok_or_else(|| Error::FetchFailure {
            url: url.to_string(),
            status: 404,
        })?;
        let broken = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|k| k.url == url && k.start < end && start < k.end);
        if broken {
            return Err(Error::FetchFailure {
                url: url.to_string(),
                status: 500,
            });
        }
        if end > data.len() as u64 || start > end {
            return Err(Error::FetchFailure {
                url: url.to_string(),
                status: 416,
            });
        }
        Ok(data.slice(start as usize..end as usize))
    }
}

/// Knobs and counters shared by a scripted demuxer and its containers.
#[derive(Default)]
pub struct Script {
    opens: AtomicUsize,
    video_decodes: AtomicUsize,
    audio_decodes: AtomicUsize,
    delay: Mutex<Duration>,
    video_delay: Mutex<Option<Duration>>,
    audio_delay: Mutex<Option<Duration>>,
    failing: Mutex<HashSet<Micros>>,
}

impl Script {
    /// Applied to every open and every decode call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Overrides the delay for video flushes only.
    pub fn set_video_delay(&self, delay: Duration) {
        *self.video_delay.lock().unwrap() = Some(delay);
    }

    /// Overrides the delay for audio flushes only.
    pub fn set_audio_delay(&self, delay: Duration) {
        *self.audio_delay.lock().unwrap() = Some(delay);
    }

    /// Decodes whose range starts at `start` fail.
    pub fn fail_at(&self, start: Micros) {
        self.failing.lock().unwrap().insert(start);
    }

    pub fn heal(&self, start: Micros) {
        self.failing.lock().unwrap().remove(&start);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn video_decodes(&self) -> usize {
        self.video_decodes.load(Ordering::SeqCst)
    }

    pub fn audio_decodes(&self) -> usize {
        self.audio_decodes.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        Self::sleep(delay).await;
    }

    async fn pause_track(&self, track: &Mutex<Option<Duration>>) {
        let own = *track.lock().unwrap();
        let delay = own.unwrap_or_else(|| *self.delay.lock().unwrap());
        Self::sleep(delay).await;
    }

    async fn sleep(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(&self, range: &DecodeRange) -> Result<()> {
        if self.failing.lock().unwrap().contains(&range.start) {
            return Err(Error::DecodeFailure(format!(
                "scripted failure at {}",
                range.start
            )));
        }
        Ok(())
    }
}

pub struct ScriptedDemuxer {
    meta: ContainerMeta,
    script: Arc<Script>,
}

impl ScriptedDemuxer {
    pub fn new(meta: ContainerMeta, script: Arc<Script>) -> Self {
        Self { meta, script }
    }
}

#[async_trait]
impl Demuxer for ScriptedDemuxer {
    async fn open(&self, _source: ByteSource) -> Result<Box<dyn Container>> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        self.script.pause().await;
        Ok(Box::new(ScriptedContainer::new(
            self.meta.clone(),
            Arc::clone(&self.script),
        )))
    }
}

/// Produces one tiny frame per video packet and 48 kHz stereo silence per
/// audio packet found in the requested byte range.
pub struct ScriptedContainer {
    meta: ContainerMeta,
    script: Arc<Script>,
}

impl ScriptedContainer {
    pub fn new(meta: ContainerMeta, script: Arc<Script>) -> Self {
        Self { meta, script }
    }
}

fn in_range<'a>(
    packets: &'a [PacketInfo],
    range: &'a DecodeRange,
) -> impl Iterator<Item = &'a PacketInfo> + 'a {
    packets
        .iter()
        .filter(move |p| p.byte_offset >= range.byte_start && p.byte_offset < range.byte_end)
}

#[async_trait]
impl Container for ScriptedContainer {
    fn meta(&self) -> &ContainerMeta {
        &self.meta
    }

    async fn decode_video(&self, range: DecodeRange) -> Result<Vec<VideoFrame>> {
        self.script.video_decodes.fetch_add(1, Ordering::SeqCst);
        self.script.pause_track(&self.script.video_delay).await;
        self.script.check(&range)?;

        let mut frames: Vec<_> = in_range(&self.meta.video_packets, &range)
            .map(|p| VideoFrame {
                timestamp: p.timestamp,
                duration: Some(p.duration),
                width: 2,
                height: 2,
                data: Bytes::from(vec![0u8; 16]),
            })
            .collect();
        frames.sort_by_key(|f| f.timestamp);
        Ok(frames)
    }

    async fn decode_audio(&self, range: DecodeRange) -> Result<Vec<AudioChunk>> {
        self.script.audio_decodes.fetch_add(1, Ordering::SeqCst);
        self.script.pause_track(&self.script.audio_delay).await;
        self.script.check(&range)?;

        Ok(in_range(&self.meta.audio_packets, &range)
            .map(|p| {
                let frames = (p.duration * 48_000 / 1_000_000) as usize;
                AudioChunk {
                    timestamp: p.timestamp,
                    sample_rate: 48_000,
                    channels: vec![vec![0.0; frames]; 2],
                }
            })
            .collect())
    }
}

/// `frames` video packets of `frame_us` with a keyframe every `gop_len`.
/// Each frame owns 1000 bytes: 800 of video, then 200 of audio when
/// `with_audio` is set.
pub fn synthetic_meta(
    frames: usize,
    frame_us: Micros,
    gop_len: usize,
    with_audio: bool,
) -> ContainerMeta {
    let duration = frames as Micros * frame_us;
    let video_packets = (0..frames)
        .map(|i| PacketInfo {
            timestamp: i as Micros * frame_us,
            decode_timestamp: i as Micros * frame_us,
            duration: frame_us,
            keyframe: i % gop_len == 0,
            byte_offset: i as u64 * 1000,
            byte_size: 800,
        })
        .collect();
    let audio_packets = if with_audio {
        (0..frames)
            .map(|i| PacketInfo {
                timestamp: i as Micros * frame_us,
                decode_timestamp: i as Micros * frame_us,
                duration: frame_us,
                keyframe: true,
                byte_offset: i as u64 * 1000 + 800,
                byte_size: 200,
            })
            .collect()
    } else {
        Vec::new()
    };

    ContainerMeta {
        video: Some(VideoInfo {
            codec: "h264".into(),
            width: 2,
            height: 2,
            duration,
        }),
        audio: with_audio.then(|| AudioInfo {
            codec: "aac".into(),
            sample_rate: 48_000,
            channels: 2,
            duration,
        }),
        video_packets,
        audio_packets,
        duration,
        file_size: frames as u64 * 1000,
    }
}

fn scripted_parts(meta: &ContainerMeta) -> (Arc<RangeCache>, Arc<FakeFetcher>) {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.insert_pattern(URL, meta.file_size as usize);
    let cache = Arc::new(RangeCache::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&fetcher) as Arc<dyn RangeFetcher>,
    ));
    (cache, fetcher)
}

/// A worker for [`URL`] over a scripted container.
pub fn scripted_worker(
    meta: ContainerMeta,
    settings: WorkerSettings,
) -> (WorkerHandle, Arc<Script>, Arc<FakeFetcher>) {
    let (cache, fetcher) = scripted_parts(&meta);
    let script = Arc::new(Script::default());
    let demuxer = Arc::new(ScriptedDemuxer::new(meta, Arc::clone(&script)));
    let handle = spawn_worker(URL.to_string(), settings, cache, demuxer);
    (handle, script, fetcher)
}

/// A registry whose every file is the same scripted container. Only
/// [`URL`] is registered with the fetcher up front.
pub fn scripted_registry(
    meta: ContainerMeta,
    config: &Config,
) -> (Registry, Arc<Script>, Arc<FakeFetcher>) {
    let (cache, fetcher) = scripted_parts(&meta);
    let script = Arc::new(Script::default());
    let demuxer = Arc::new(ScriptedDemuxer::new(meta, Arc::clone(&script)));
    (Registry::new(config, cache, demuxer), script, fetcher)
}

/// Defaults with the given windowing knobs, in milliseconds.
pub fn cache_config(gop_min_ms: u64, decode_ms: u64, tolerance_ms: u64) -> Config {
    let mut config = Config::default();
    config.cache.gop_min_duration_ms = gop_min_ms;
    config.cache.decode_duration_ms = decode_ms;
    config.cache.resolve_tolerance_ms = tolerance_ms;
    config.range.block_size = 4096;
    config
}
