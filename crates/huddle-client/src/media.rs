use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::types::{MediaConfig, MediaKind};

/// Duration of one Opus packet; silence is paced at this rate.
pub const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);

/// A single 20 ms Opus frame that decodes to silence.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

const DEFAULT_VIDEO_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Ogg granule positions count samples at this rate regardless of the input rate.
const OPUS_SAMPLE_RATE: u64 = 48_000;
const MAX_OGG_PAGE_SAMPLES: u64 = OPUS_SAMPLE_RATE;
const OPUS_TAGS_SIGNATURE: &[u8] = b"OpusTags";

/// The local audio and video tracks offered to the peer.
///
/// Each track is fed by its own pump task. Disabling a track keeps it
/// negotiated: audio falls back to silence, video stops producing frames.
pub struct LocalMedia {
    stream_id: String,
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    pumps: Vec<JoinHandle<()>>,
}

impl LocalMedia {
    /// Opens the configured sources and starts pumping samples.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn acquire(config: &MediaConfig) -> Result<Self> {
        let audio_source = config
            .audio_file
            .as_deref()
            .map(OggSource::open)
            .transpose()?;
        let video_source = config
            .video_file
            .as_deref()
            .map(IvfSource::open)
            .transpose()?;

        if let Some(source) = video_source.as_ref() {
            if (source.width, source.height) != (config.video_width, config.video_height) {
                info!(
                    "video file is {}x{}, sending as is (requested {}x{})",
                    source.width, source.height, config.video_width, config.video_height
                );
            }
        }

        let stream_id = format!("huddle-{}", uuid::Uuid::new_v4());
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            stream_id.clone(),
        ));

        let audio_enabled = Arc::new(AtomicBool::new(true));
        let video_enabled = Arc::new(AtomicBool::new(true));

        let mut pumps = vec![tokio::spawn(pump_audio(
            Arc::clone(&audio),
            Arc::clone(&audio_enabled),
            audio_source,
        ))];
        if let Some(source) = video_source {
            pumps.push(tokio::spawn(pump_video(
                Arc::clone(&video),
                Arc::clone(&video_enabled),
                source,
            )));
        }

        info!(
            "local media ready (stream {}, audio from {}, video from {})",
            stream_id,
            describe_source(config.audio_file.as_deref(), "silence"),
            describe_source(config.video_file.as_deref(), "nothing"),
        );

        Ok(Self {
            stream_id,
            audio,
            video,
            audio_enabled,
            video_enabled,
            pumps,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Audio first, then video.
    pub fn tracks(&self) -> [Arc<dyn TrackLocal + Send + Sync>; 2] {
        [
            Arc::clone(&self.audio) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&self.video) as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.flag(kind).load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        self.flag(kind).store(enabled, Ordering::Relaxed);
        debug!("local {} {}", kind, if enabled { "enabled" } else { "disabled" });
    }

    /// Flips the track and returns its new state.
    pub fn toggle(&self, kind: MediaKind) -> bool {
        !self.flag(kind).fetch_xor(true, Ordering::Relaxed)
    }

    /// Stops every pump. The tracks stay valid but carry nothing afterwards.
    pub fn stop(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }

    fn flag(&self, kind: MediaKind) -> &AtomicBool {
        match kind {
            MediaKind::Audio => &self.audio_enabled,
            MediaKind::Video => &self.video_enabled,
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

fn describe_source(path: Option<&Path>, fallback: &str) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

async fn pump_audio(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    mut source: Option<OggSource>,
) {
    let mut deadline = Instant::now();
    loop {
        time::sleep_until(deadline).await;
        let sample = next_audio_sample(&mut source, enabled.load(Ordering::Relaxed));
        // Pace by what was actually sent; fall behind rather than burst.
        deadline = (deadline + sample.duration).max(Instant::now());
        if let Err(e) = track.write_sample(&sample).await {
            debug!("dropping audio sample: {}", e);
        }
    }
}

/// Next audio sample to send. The file keeps advancing while muted so that
/// unmuting resumes in step; muted or missing audio goes out as silence.
fn next_audio_sample(source: &mut Option<OggSource>, enabled: bool) -> Sample {
    let (data, duration) = match source.as_mut().map(OggSource::next_page).transpose() {
        Ok(Some((page, duration))) if enabled => (page, duration),
        Ok(Some((_, duration))) => (Bytes::from_static(&OPUS_SILENCE_FRAME), duration),
        Ok(None) => (Bytes::from_static(&OPUS_SILENCE_FRAME), OPUS_FRAME_DURATION),
        Err(e) => {
            warn!("audio source failed, falling back to silence: {:#}", e);
            *source = None;
            (Bytes::from_static(&OPUS_SILENCE_FRAME), OPUS_FRAME_DURATION)
        }
    };
    Sample {
        data,
        duration,
        ..Default::default()
    }
}

async fn pump_video(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    mut source: IvfSource,
) {
    let frame_duration = source.frame_duration;
    let mut ticker = time::interval(frame_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("video source failed, stopping video: {:#}", e);
                return;
            }
        };
        // Frames keep advancing while disabled so re-enabling resumes in step.
        if !enabled.load(Ordering::Relaxed) {
            continue;
        }
        let sample = Sample {
            data: frame,
            duration: frame_duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!("dropping video sample: {}", e);
        }
    }
}

/// Looping Ogg/Opus page reader.
///
/// Every page is sent as one Opus packet, so files need one packet per page
/// (`ffmpeg -c:a libopus -page_duration 20000`).
struct OggSource {
    path: PathBuf,
    reader: OggReader<BufReader<File>>,
    last_granule: u64,
}

impl OggSource {
    fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening audio file {}", path.display()))?;
        let (mut reader, _header) = OggReader::new(BufReader::new(file), true)
            .with_context(|| format!("{} is not an Ogg/Opus file", path.display()))?;
        // The reader only consumes OpusHead; OpusTags is the second header page.
        let (tags, _) = reader
            .parse_next_page()
            .with_context(|| format!("{} has no OpusTags page", path.display()))?;
        if !tags.starts_with(OPUS_TAGS_SIGNATURE) {
            bail!("{} has no OpusTags page", path.display());
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            last_granule: 0,
        })
    }

    /// Next audio page and how long it plays.
    fn next_page(&mut self) -> Result<(Bytes, Duration)> {
        let (page, header) = match self.reader.parse_next_page() {
            Ok(next) => next,
            Err(_) => {
                *self = Self::open(&self.path)?;
                self.reader
                    .parse_next_page()
                    .with_context(|| format!("{} has no audio pages", self.path.display()))?
            }
        };
        let duration = self.page_duration(header.granule_position);
        Ok((page.freeze(), duration))
    }

    /// Duration from the granule delta (48 kHz samples). Pages that complete
    /// no packet, or carry an implausible position, count as one frame.
    fn page_duration(&mut self, granule: u64) -> Duration {
        if granule == u64::MAX {
            return OPUS_FRAME_DURATION;
        }
        let delta = granule.checked_sub(self.last_granule);
        self.last_granule = granule;
        match delta {
            Some(samples) if samples > 0 && samples <= MAX_OGG_PAGE_SAMPLES => {
                Duration::from_millis(samples * 1000 / OPUS_SAMPLE_RATE)
            }
            _ => OPUS_FRAME_DURATION,
        }
    }
}

/// Looping IVF/VP8 frame reader.
struct IvfSource {
    path: PathBuf,
    reader: IVFReader<BufReader<File>>,
    frame_duration: Duration,
    width: u32,
    height: u32,
}

impl IvfSource {
    fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening video file {}", path.display()))?;
        let (reader, header) = IVFReader::new(BufReader::new(file))
            .with_context(|| format!("{} is not an IVF file", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            frame_duration: ivf_frame_duration(
                header.timebase_numerator,
                header.timebase_denominator,
            ),
            width: u32::from(header.width),
            height: u32::from(header.height),
        })
    }

    fn next_frame(&mut self) -> Result<Bytes> {
        match self.reader.parse_next_frame() {
            Ok((frame, _)) => Ok(frame.freeze()),
            Err(_) => {
                *self = Self::open(&self.path)?;
                let (frame, _) = self
                    .reader
                    .parse_next_frame()
                    .with_context(|| format!("{} has no video frames", self.path.display()))?;
                Ok(frame.freeze())
            }
        }
    }
}

/// Frame interval from an IVF timebase, falling back to ~30 fps for nonsense headers.
fn ivf_frame_duration(numerator: u32, denominator: u32) -> Duration {
    if numerator == 0 || denominator == 0 {
        return DEFAULT_VIDEO_FRAME_DURATION;
    }
    let micros = u64::from(numerator) * 1_000_000 / u64::from(denominator);
    if micros == 0 {
        DEFAULT_VIDEO_FRAME_DURATION
    } else {
        Duration::from_micros(micros)
    }
}

/// Counters for everything received from the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub tracks: u64,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct RemoteCounters {
    tracks: AtomicU64,
    packets: AtomicU64,
    bytes: AtomicU64,
}

/// Sink for the peer's tracks. Each track is drained by its own task.
#[derive(Debug, Default)]
pub struct RemoteMedia {
    readers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<RemoteCounters>,
}

impl RemoteMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts draining `track`. Must be called from inside a Tokio runtime.
    pub fn attach(&self, track: Arc<TrackRemote>) {
        let counters = Arc::clone(&self.counters);
        counters.tracks.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            let mime = track.codec().capability.mime_type;
            info!("receiving remote track {} ({})", track.id(), mime);
            while let Ok((packet, _)) = track.read_rtp().await {
                counters.packets.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes
                    .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
            }
            debug!("remote track {} ended", track.id());
        });
        self.lock_readers().push(handle);
    }

    /// Stops receiving every attached track.
    pub fn stop(&self) {
        let mut readers = self.lock_readers();
        if !readers.is_empty() {
            debug!("stopping {} remote track reader(s)", readers.len());
        }
        for reader in readers.drain(..) {
            reader.abort();
        }
    }

    pub fn active_tracks(&self) -> usize {
        self.lock_readers().iter().filter(|r| !r.is_finished()).count()
    }

    pub fn stats(&self) -> RemoteStats {
        RemoteStats {
            tracks: self.counters.tracks.load(Ordering::Relaxed),
            packets: self.counters.packets.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
        }
    }

    fn lock_readers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        // A poisoned list of join handles is still usable.
        self.readers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RemoteMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("huddle-{name}-{unique}"))
    }

    fn write_ivf(path: &Path, frames: &[&[u8]]) {
        let mut out = Vec::new();
        out.extend_from_slice(b"DKIF");
        out.extend_from_slice(&0u16.to_le_bytes()); // version
        out.extend_from_slice(&32u16.to_le_bytes()); // header size
        out.extend_from_slice(b"VP80");
        out.extend_from_slice(&640u16.to_le_bytes());
        out.extend_from_slice(&480u16.to_le_bytes());
        out.extend_from_slice(&30u32.to_le_bytes()); // timebase denominator
        out.extend_from_slice(&1u32.to_le_bytes()); // timebase numerator
        out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for (i, frame) in frames.iter().enumerate() {
            out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            out.extend_from_slice(&(i as u64).to_le_bytes());
            out.extend_from_slice(frame);
        }
        File::create(path).unwrap().write_all(&out).unwrap();
    }

    /// Ogg CRC-32: polynomial 0x04c11db7, unreflected, zero init.
    fn ogg_crc(data: &[u8]) -> u32 {
        data.iter().fold(0u32, |crc, &byte| {
            let mut r = crc ^ (u32::from(byte) << 24);
            for _ in 0..8 {
                r = if r & 0x8000_0000 != 0 {
                    (r << 1) ^ 0x04c1_1db7
                } else {
                    r << 1
                };
            }
            r
        })
    }

    fn ogg_page(header_type: u8, granule: u64, sequence: u32, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() < 255, "single-segment pages only");
        let mut page = Vec::new();
        page.extend_from_slice(b"OggS");
        page.push(0); // version
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&7u32.to_le_bytes()); // serial
        page.extend_from_slice(&sequence.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes()); // checksum, patched below
        page.push(1);
        page.push(payload.len() as u8);
        page.extend_from_slice(payload);
        let crc = ogg_crc(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        page
    }

    /// OpusHead, OpusTags, then one page per `(granule, packet)`.
    fn write_ogg(path: &Path, packets: &[(u64, &[u8])]) {
        let mut head = Vec::new();
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(2); // channels
        head.extend_from_slice(&3840u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&0u16.to_le_bytes()); // output gain
        head.push(0); // channel mapping

        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&6u32.to_le_bytes());
        tags.extend_from_slice(b"huddle");
        tags.extend_from_slice(&0u32.to_le_bytes());

        let mut out = ogg_page(0x02, 0, 0, &head);
        out.extend(ogg_page(0x00, 0, 1, &tags));
        for (i, (granule, packet)) in packets.iter().enumerate() {
            out.extend(ogg_page(0x00, *granule, i as u32 + 2, packet));
        }
        File::create(path).unwrap().write_all(&out).unwrap();
    }

    const LOUD_PACKET: &[u8] = &[0xfc, 0x01, 0x02, 0x03];

    #[test]
    fn test_ogg_source_skips_tags_and_paces_by_granule() {
        let path = temp_path("paced.ogg");
        write_ogg(&path, &[(960, &OPUS_SILENCE_FRAME[..]), (3840, LOUD_PACKET)]);

        let mut source = OggSource::open(&path).unwrap();
        let (page, duration) = source.next_page().unwrap();
        assert_eq!(&page[..], &OPUS_SILENCE_FRAME);
        assert_eq!(duration, Duration::from_millis(20));

        let (page, duration) = source.next_page().unwrap();
        assert_eq!(&page[..], LOUD_PACKET);
        assert_eq!(duration, Duration::from_millis(60));

        // Reopened at the end: tags are skipped again and timing restarts.
        let (page, duration) = source.next_page().unwrap();
        assert_eq!(&page[..], &OPUS_SILENCE_FRAME);
        assert_eq!(duration, Duration::from_millis(20));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_ogg_page_duration_falls_back_to_one_frame() {
        let path = temp_path("granule.ogg");
        write_ogg(&path, &[(960, &OPUS_SILENCE_FRAME[..])]);
        let mut source = OggSource::open(&path).unwrap();

        assert_eq!(source.page_duration(960), Duration::from_millis(20));
        assert_eq!(source.page_duration(960), OPUS_FRAME_DURATION);
        assert_eq!(source.page_duration(u64::MAX), OPUS_FRAME_DURATION);
        assert_eq!(source.page_duration(960 + 480), Duration::from_millis(10));
        assert_eq!(source.page_duration(10), OPUS_FRAME_DURATION);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_muted_audio_sends_silence_and_keeps_position() {
        let path = temp_path("muted.ogg");
        write_ogg(&path, &[(960, LOUD_PACKET), (1920, &b"second"[..])]);
        let mut source = Some(OggSource::open(&path).unwrap());

        let muted = next_audio_sample(&mut source, false);
        assert_eq!(&muted.data[..], &OPUS_SILENCE_FRAME);
        assert_eq!(muted.duration, Duration::from_millis(20));

        let live = next_audio_sample(&mut source, true);
        assert_eq!(&live.data[..], b"second");

        let mut none = None;
        let silence = next_audio_sample(&mut none, true);
        assert_eq!(&silence.data[..], &OPUS_SILENCE_FRAME);
        assert_eq!(silence.duration, OPUS_FRAME_DURATION);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_ogg_without_tags_page_is_rejected() {
        let path = temp_path("notags.ogg");
        let mut head = b"OpusHead".to_vec();
        head.extend_from_slice(&[1, 2, 0x00, 0x0f, 0x80, 0xbb, 0, 0, 0, 0, 0]);
        let mut out = ogg_page(0x02, 0, 0, &head);
        out.extend(ogg_page(0x00, 960, 1, &OPUS_SILENCE_FRAME));
        File::create(&path).unwrap().write_all(&out).unwrap();

        assert!(OggSource::open(&path).is_err());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_ivf_frame_duration() {
        assert_eq!(ivf_frame_duration(1, 30), Duration::from_micros(33_333));
        assert_eq!(ivf_frame_duration(1, 0), DEFAULT_VIDEO_FRAME_DURATION);
        assert_eq!(ivf_frame_duration(1, 10_000_000), DEFAULT_VIDEO_FRAME_DURATION);
    }

    #[test]
    fn test_ivf_source_loops_at_end_of_file() {
        let path = temp_path("loop.ivf");
        write_ivf(&path, &[b"first", b"second"]);

        let mut source = IvfSource::open(&path).unwrap();
        assert_eq!((source.width, source.height), (640, 480));
        assert_eq!(source.frame_duration, Duration::from_micros(33_333));
        assert_eq!(&source.next_frame().unwrap()[..], b"first");
        assert_eq!(&source.next_frame().unwrap()[..], b"second");
        assert_eq!(&source.next_frame().unwrap()[..], b"first");

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_audio_file_is_an_error() {
        let config = MediaConfig {
            audio_file: Some(temp_path("missing.ogg")),
            ..Default::default()
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        assert!(LocalMedia::acquire(&config).is_err());
    }

    #[tokio::test]
    async fn test_local_media_toggles() {
        let mut media = LocalMedia::acquire(&MediaConfig::default()).unwrap();
        assert!(media.is_enabled(MediaKind::Audio));
        assert!(media.is_enabled(MediaKind::Video));

        assert!(!media.toggle(MediaKind::Audio));
        assert!(!media.is_enabled(MediaKind::Audio));
        assert!(media.is_enabled(MediaKind::Video));
        assert!(media.toggle(MediaKind::Audio));

        media.set_enabled(MediaKind::Video, false);
        assert!(!media.is_enabled(MediaKind::Video));

        let tracks = media.tracks();
        assert_eq!(tracks[0].kind(), webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio);
        assert_eq!(tracks[1].kind(), webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video);
        assert_eq!(tracks[0].stream_id(), media.stream_id());

        media.stop();
    }

    #[test]
    fn test_remote_media_starts_empty() {
        let remote = RemoteMedia::new();
        assert_eq!(remote.stats(), RemoteStats::default());
        assert_eq!(remote.active_tracks(), 0);
        remote.stop();
    }
}
