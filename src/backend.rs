use crate::credentials::decode_for_display;
use crate::session::{Envelope, SessionEvent, SessionId};
use crate::store::TransportMode;
use anyhow::{Context, Result, anyhow, bail};
use futures_util::StreamExt;
use retina::client::{
    Credentials, PlayOptions, Session, SessionOptions, SetupOptions, TcpTransportOptions,
    Transport, UdpTransportOptions,
};
use retina::codec::CodecItem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const RETRY_DELAY_START: Duration = Duration::from_millis(300);
const RETRY_DELAY_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Percentage in `0.0..=100.0`; 100 means frames are flowing.
    BufferingProgress(f32),
    EndReached,
    EncounteredError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Url(String),
    File(PathBuf),
}

/// Operations a session drives on its media engine.
///
/// Implementations report progress through an [`EventSink`] handed to them at
/// construction; they never call back into the session directly.
pub trait PlaybackBackend {
    fn set_source(&mut self, source: MediaSource);
    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    /// Relative seek in milliseconds.
    fn seek(&mut self, offset_ms: i64);
    fn set_rate(&mut self, rate: f32);
    /// 0 mutes, 100 is full volume.
    fn set_volume(&mut self, percent: u8);
    fn track_count(&self) -> usize;
    fn is_playing(&self) -> bool;
    fn detach_surface(&mut self);
    /// Frees the engine. No events are delivered afterwards.
    fn release(&mut self);
}

/// Tags backend events with their session and posts them to the host queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    #[must_use]
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { session, tx }
    }

    pub fn send(&self, event: BackendEvent) {
        let envelope = Envelope {
            session: self.session,
            event: SessionEvent::Backend(event),
        };
        if self.tx.send(envelope).is_err() {
            debug!(session = %self.session, "event queue closed; dropping backend event");
        }
    }
}

/// Media engine for the terminal viewer. Live URLs are pulled with retina and
/// demuxed but not decoded; recordings run on a clock sized by `ffprobe`.
/// The terminal shows status only.
pub struct MediaBackend {
    transport: TransportMode,
    events: EventSink,
    source: Option<MediaSource>,
    worker: Option<JoinHandle<()>>,
    clock: Option<mpsc::UnboundedSender<ClockCommand>>,
    paused: bool,
    tracks: Arc<AtomicUsize>,
    volume: u8,
    surface_attached: bool,
}

impl MediaBackend {
    #[must_use]
    pub fn new(transport: TransportMode, events: EventSink) -> Self {
        Self {
            transport,
            events,
            source: None,
            worker: None,
            clock: None,
            paused: false,
            tracks: Arc::new(AtomicUsize::new(0)),
            volume: 100,
            surface_attached: true,
        }
    }

    #[must_use]
    pub const fn volume(&self) -> u8 {
        self.volume
    }

    fn worker_alive(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    fn abort_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        self.clock = None;
        self.paused = false;
    }

    fn send_clock(&self, command: ClockCommand) -> bool {
        self.clock
            .as_ref()
            .is_some_and(|clock| clock.send(command).is_ok())
    }
}

impl PlaybackBackend for MediaBackend {
    fn set_source(&mut self, source: MediaSource) {
        self.abort_worker();
        self.tracks.store(0, Ordering::Relaxed);
        self.source = Some(source);
    }

    fn play(&mut self) {
        if self.is_playing() {
            return;
        }
        if self.paused && self.worker_alive() && self.send_clock(ClockCommand::Resume) {
            self.paused = false;
            return;
        }
        self.abort_worker();
        match self.source.clone() {
            None => warn!("play requested without a media source"),
            Some(MediaSource::File(path)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let events = self.events.clone();
                self.tracks.store(1, Ordering::Relaxed);
                self.clock = Some(tx);
                self.worker = Some(tokio::spawn(async move {
                    run_file_worker(path, events, rx).await;
                }));
            }
            Some(MediaSource::Url(url)) => {
                let transport = self.transport;
                let events = self.events.clone();
                let tracks = Arc::clone(&self.tracks);
                self.worker = Some(tokio::spawn(async move {
                    run_rtsp_worker(url, transport, events, tracks).await;
                }));
            }
        }
    }

    fn pause(&mut self) {
        if self.send_clock(ClockCommand::Pause) {
            self.paused = true;
            return;
        }
        // Live RTSP has no server-side pause worth keeping a connection for.
        self.abort_worker();
    }

    fn stop(&mut self) {
        self.abort_worker();
    }

    fn seek(&mut self, offset_ms: i64) {
        if !self.send_clock(ClockCommand::Seek(offset_ms)) {
            debug!(offset_ms, "seek ignored for live RTSP");
        }
    }

    fn set_rate(&mut self, rate: f32) {
        if !self.send_clock(ClockCommand::Rate(rate)) {
            debug!(rate, "rate change ignored for live RTSP");
        }
    }

    fn set_volume(&mut self, percent: u8) {
        self.volume = percent.min(100);
    }

    fn track_count(&self) -> usize {
        self.tracks.load(Ordering::Relaxed)
    }

    fn is_playing(&self) -> bool {
        !self.paused && self.worker_alive()
    }

    fn detach_surface(&mut self) {
        self.surface_attached = false;
    }

    fn release(&mut self) {
        self.abort_worker();
        self.source = None;
    }
}

impl Drop for MediaBackend {
    fn drop(&mut self) {
        self.abort_worker();
    }
}

async fn run_rtsp_worker(
    stream_url: String,
    transport: TransportMode,
    events: EventSink,
    tracks: Arc<AtomicUsize>,
) {
    let label = decode_for_display(&stream_url);
    let mut retry_delay = RETRY_DELAY_START;

    loop {
        events.send(BackendEvent::BufferingProgress(0.0));
        match run_rtsp_session(&stream_url, transport, &events, &tracks).await {
            Ok(()) => {
                events.send(BackendEvent::EndReached);
                info!(stream = %label, "RTSP stream ended; reconnecting");
                retry_delay = RETRY_DELAY_START;
            }
            Err(err) if is_unauthorized(&err) => {
                events.send(BackendEvent::EncounteredError(format!("{err:#}")));
                return;
            }
            Err(err) => {
                warn!(stream = %label, "RTSP session failed: {err:#}");
            }
        }

        tokio::time::sleep(retry_delay).await;
        retry_delay = retry_delay.mul_f32(1.5).min(RETRY_DELAY_MAX);
    }
}

async fn run_rtsp_session(
    stream_url: &str,
    transport: TransportMode,
    events: &EventSink,
    tracks: &AtomicUsize,
) -> Result<()> {
    let mut parsed = Url::parse(stream_url)
        .with_context(|| format!("invalid RTSP URL: {}", decode_for_display(stream_url)))?;

    let creds = extract_credentials(&parsed);
    if !parsed.username().is_empty() {
        parsed
            .set_username("")
            .map_err(|()| anyhow!("failed stripping username from RTSP URL"))?;
    }
    if parsed.password().is_some() {
        parsed
            .set_password(None)
            .map_err(|()| anyhow!("failed stripping password from RTSP URL"))?;
    }

    let mut session_options = SessionOptions::default();
    if let Some(credentials) = creds {
        session_options = session_options.creds(Some(credentials));
    }

    let mut session = Session::describe(parsed, session_options)
        .await
        .context("RTSP DESCRIBE failed")?;
    tracks.store(session.streams().len(), Ordering::Relaxed);

    let stream_index = pick_video_stream(&session)?;
    session
        .setup(
            stream_index,
            SetupOptions::default().transport(to_transport(transport)),
        )
        .await
        .context("RTSP SETUP failed")?;

    let playing = session
        .play(PlayOptions::default())
        .await
        .context("RTSP PLAY failed")?;
    let mut demuxed = playing.demuxed().context("RTSP demux setup failed")?;

    let mut flowing = false;
    while let Some(item) = demuxed.next().await {
        let item = item.context("demux receive failed")?;
        let CodecItem::VideoFrame(frame) = item else {
            continue;
        };
        if frame.stream_id() != stream_index {
            continue;
        }
        if !flowing {
            events.send(BackendEvent::BufferingProgress(100.0));
            flowing = true;
        }
    }

    Ok(())
}

fn is_unauthorized(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}");
    text.contains("401") || text.contains("Unauthorized")
}

fn extract_credentials(parsed: &Url) -> Option<Credentials> {
    if parsed.username().is_empty() {
        return None;
    }

    Some(Credentials {
        username: percent_decode_userinfo(parsed.username()),
        password: percent_decode_userinfo(parsed.password().unwrap_or("")),
    })
}

fn percent_decode_userinfo(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'%'
            && idx + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[idx + 1]), hex_value(bytes[idx + 2]))
        {
            decoded.push((hi << 4) | lo);
            idx += 3;
            continue;
        }

        decoded.push(bytes[idx]);
        idx += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn pick_video_stream(session: &Session<retina::client::Described>) -> Result<usize> {
    session
        .streams()
        .iter()
        .position(|stream| stream.media() == "video")
        .ok_or_else(|| anyhow!("no video stream found in RTSP presentation"))
}

fn to_transport(mode: TransportMode) -> Transport {
    match mode {
        TransportMode::Tcp => Transport::Tcp(TcpTransportOptions::default()),
        TransportMode::Udp => Transport::Udp(UdpTransportOptions::default()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ClockCommand {
    Pause,
    Resume,
    Seek(i64),
    Rate(f32),
}

/// Position within a recording of known length. Runs while `resumed_at` is
/// set, advancing `rate` milliseconds per wall-clock millisecond.
#[derive(Debug, Clone)]
struct PlaybackClock {
    length_ms: u64,
    position_ms: u64,
    rate: f32,
    resumed_at: Option<Instant>,
}

impl PlaybackClock {
    fn started(length_ms: u64, now: Instant) -> Self {
        Self {
            length_ms,
            position_ms: 0,
            rate: 1.0,
            resumed_at: Some(now),
        }
    }

    fn position(&self, now: Instant) -> u64 {
        let Some(resumed_at) = self.resumed_at else {
            return self.position_ms;
        };
        let elapsed = now.saturating_duration_since(resumed_at).as_secs_f64() * 1_000.0;
        let advanced = self.position_ms as f64 + elapsed * f64::from(self.rate);
        (advanced as u64).min(self.length_ms)
    }

    /// Wall-clock time until the end, or `None` while paused.
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.resumed_at?;
        let left_ms = self.length_ms.saturating_sub(self.position(now)) as f64;
        Some(Duration::from_secs_f64(left_ms / f64::from(self.rate) / 1_000.0))
    }

    fn apply(&mut self, command: ClockCommand, now: Instant) {
        self.position_ms = self.position(now);
        if self.resumed_at.is_some() {
            self.resumed_at = Some(now);
        }
        match command {
            ClockCommand::Pause => self.resumed_at = None,
            ClockCommand::Resume => self.resumed_at = Some(now),
            ClockCommand::Seek(offset_ms) => {
                let target = i128::from(self.position_ms) + i128::from(offset_ms);
                self.position_ms = u64::try_from(target.max(0))
                    .unwrap_or(u64::MAX)
                    .min(self.length_ms);
            }
            ClockCommand::Rate(rate) if rate.is_finite() && rate > 0.0 => self.rate = rate,
            ClockCommand::Rate(rate) => debug!(rate, "ignoring invalid playback rate"),
        }
    }
}

async fn run_file_worker(
    path: PathBuf,
    events: EventSink,
    mut commands: mpsc::UnboundedReceiver<ClockCommand>,
) {
    events.send(BackendEvent::BufferingProgress(0.0));
    let length = match probe_length(&path).await {
        Ok(length) => length,
        Err(err) => {
            events.send(BackendEvent::EncounteredError(format!("{err:#}")));
            return;
        }
    };
    let length_ms = u64::try_from(length.as_millis()).unwrap_or(u64::MAX);
    info!(path = %path.display(), length_ms, "playing recording");
    events.send(BackendEvent::BufferingProgress(100.0));

    let mut clock = PlaybackClock::started(length_ms, Instant::now());
    loop {
        let remaining = clock.remaining(Instant::now());
        tokio::select! {
            () = sleep_or_wait(remaining) => {
                events.send(BackendEvent::EndReached);
                return;
            }
            command = commands.recv() => match command {
                Some(command) => clock.apply(command, Instant::now()),
                None => return,
            },
        }
    }
}

async fn sleep_or_wait(remaining: Option<Duration>) {
    match remaining {
        Some(remaining) => tokio::time::sleep(remaining).await,
        None => std::future::pending().await,
    }
}

async fn probe_length(path: &Path) -> Result<Duration> {
    tokio::fs::metadata(path)
        .await
        .with_context(|| format!("recording {} is not readable", path.display()))?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .context("failed to run ffprobe; install ffmpeg to play recordings")?;
    if !output.status.success() {
        bail!(
            "ffprobe rejected {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_probe_length(&String::from_utf8_lossy(&output.stdout))
}

fn parse_probe_length(stdout: &str) -> Result<Duration> {
    let text = stdout.trim();
    let seconds = text
        .parse::<f64>()
        .with_context(|| format!("unexpected ffprobe duration '{text}'"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("unexpected ffprobe duration '{text}'");
    }
    Ok(Duration::from_secs_f64(seconds))
}
