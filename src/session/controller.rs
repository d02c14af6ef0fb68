//! Session controller
//!
//! Owns the lifecycle `Disconnected -> Connecting -> Live -> Disconnected |
//! Error`. While live, a single session loop task owns the capture source,
//! the playback scheduler and the transport session and serializes
//! everything that touches them: inbound events, playback completions,
//! captured frames and shutdown.
//!
//! Every connect attempt gets an epoch. `disconnect()` bumps the epoch, so
//! an attempt or a session loop that finds its epoch stale backs off without
//! touching the state.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::scheduler::PlaybackScheduler;
use super::state::{SessionEvent, SessionState, SessionStats, StatsCounters};
use crate::audio::backend::{AudioBackend, CpalBackend};
use crate::audio::buffer::FrameSink;
use crate::audio::capture::CaptureSource;
use crate::audio::playback::BufferId;
use crate::codec::{PcmDecoder, PcmEncoder};
use crate::config::AppConfig;
use crate::error::{AudioError, Error, NetworkError, Result};
use crate::network::{Transport, TransportEvent, TransportSession, WebSocketTransport};

/// Capacity of the notification channel handed to subscribers
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How often the session loop polls device health
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// State read by the UI and written by the session loop
struct Shared {
    transcript: Mutex<String>,
    stats: StatsCounters,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Lifecycle {
    state: SessionState,
    epoch: u64,
    last_error: Option<String>,
    worker: Option<Worker>,
    /// A live session is being torn down
    disconnecting: bool,
}

struct Inner {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<Lifecycle>,
    /// Mirrors `Lifecycle::epoch` so an in-flight connect can wait on it
    epoch_tx: watch::Sender<u64>,
    /// Held for the whole of a connect attempt
    connect_gate: tokio::sync::Mutex<()>,
    shared: Arc<Shared>,
}

impl Inner {
    fn set_state(&self, lifecycle: &mut Lifecycle, state: SessionState, error: Option<String>) {
        lifecycle.state = state;
        if error.is_some() {
            lifecycle.last_error = error.clone();
        }
        info!("Session state: {}", state);
        self.shared.notify(SessionEvent::StateChanged { state, error });
    }

    fn bump_epoch(&self, lifecycle: &mut Lifecycle) -> u64 {
        lifecycle.epoch += 1;
        self.epoch_tx.send_replace(lifecycle.epoch);
        lifecycle.epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lifecycle.lock().epoch == epoch
    }

    /// Record a failed connect attempt. Returns false when the attempt was
    /// already overtaken by a disconnect.
    fn fail_connect(&self, epoch: u64, err: &Error) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.epoch != epoch {
            return false;
        }
        error!("Connect failed: {}", err);
        self.set_state(&mut lifecycle, SessionState::Error, Some(err.to_string()));
        true
    }

    /// Called by a session loop that ended on its own
    fn finish(&self, epoch: u64, exit: LoopExit) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.epoch != epoch {
            return;
        }
        lifecycle.worker.take();
        match exit {
            LoopExit::Shutdown | LoopExit::RemoteClosed => {
                self.set_state(&mut lifecycle, SessionState::Disconnected, None)
            }
            LoopExit::Failed(err) => {
                error!("Session failed: {}", err);
                self.set_state(&mut lifecycle, SessionState::Error, Some(err.to_string()))
            }
        }
    }
}

/// Drives one duplex voice conversation at a time
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (epoch_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                transport,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Disconnected,
                    epoch: 0,
                    last_error: None,
                    worker: None,
                    disconnecting: false,
                }),
                epoch_tx,
                connect_gate: tokio::sync::Mutex::new(()),
                shared: Arc::new(Shared {
                    transcript: Mutex::new(String::new()),
                    stats: StatsCounters::default(),
                    events,
                }),
            }),
        }
    }

    /// System audio devices and a WebSocket channel to `config.transport.url`
    pub fn from_config(config: AppConfig) -> Self {
        let transport = WebSocketTransport::new(
            config.transport.clone(),
            config.capture.sample_rate,
            config.capture.channels,
        );
        Self::new(config, Arc::new(CpalBackend), Arc::new(transport))
    }

    /// Acquire the devices, open the channel and go live.
    ///
    /// A no-op while `Connecting` or `Live`. Returns once the session is live
    /// or the attempt failed; an attempt overtaken by `disconnect()`, or made
    /// while a live session is still being torn down, returns
    /// [`Error::Aborted`] and leaves the state to the disconnect.
    pub async fn connect(&self) -> Result<()> {
        let epoch = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.disconnecting {
                debug!("connect() during teardown, rejecting");
                return Err(Error::Aborted);
            }
            if lifecycle.state.is_active() {
                debug!("connect() while {}, ignoring", lifecycle.state);
                return Ok(());
            }
            let epoch = self.inner.bump_epoch(&mut lifecycle);
            lifecycle.last_error = None;
            self.inner.set_state(&mut lifecycle, SessionState::Connecting, None);
            epoch
        };
        self.inner.shared.transcript.lock().clear();
        self.inner.shared.stats.reset();

        let _gate = self.inner.connect_gate.lock().await;
        match self.establish(epoch).await {
            Ok(()) => Ok(()),
            Err(Error::Aborted) => Err(Error::Aborted),
            Err(e) => {
                if self.inner.fail_connect(epoch, &e) {
                    Err(e)
                } else {
                    Err(Error::Aborted)
                }
            }
        }
    }

    async fn establish(&self, epoch: u64) -> Result<()> {
        let inner = &self.inner;
        if !inner.is_current(epoch) {
            return Err(Error::Aborted);
        }

        let backend = inner.backend.clone();
        let capture_config = inner.config.capture.clone();
        let playback_config = inner.config.playback.clone();
        let (capture, scheduler, completions) = tokio::task::spawn_blocking(move || {
            let capture = backend.open_capture(&capture_config)?;
            let sink = backend.open_playback(&playback_config)?;
            let (scheduler, completions) = PlaybackScheduler::start(sink)?;
            Ok::<_, AudioError>((capture, scheduler, completions))
        })
        .await
        .map_err(|e| Error::DeviceAcquisition(AudioError::StreamError(e.to_string())))?
        .map_err(Error::DeviceAcquisition)?;
        info!("Audio devices acquired");

        if !inner.is_current(epoch) {
            release_devices(Some(capture), scheduler).await;
            return Err(Error::Aborted);
        }

        let mut epoch_rx = inner.epoch_tx.subscribe();
        let overtaken = async move {
            while *epoch_rx.borrow_and_update() == epoch {
                if epoch_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        let opened = tokio::select! {
            opened = inner.transport.open() => opened.map_err(Error::from),
            _ = overtaken => Err(Error::Aborted),
        };
        let transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                release_devices(Some(capture), scheduler).await;
                return Err(e);
            }
        };
        info!("Channel to agent open");

        let codecs = PcmEncoder::new(inner.config.capture.sample_rate, inner.config.capture.channels)
            .and_then(|encoder| {
                let decoder = PcmDecoder::new(
                    inner.config.playback.sample_rate,
                    inner.config.playback.channels,
                )?;
                Ok((encoder, decoder))
            });
        let (encoder, decoder) = match codecs {
            Ok(codecs) => codecs,
            Err(e) => {
                release_devices(Some(capture), scheduler).await;
                transport.close().await;
                return Err(e.into());
            }
        };

        let frames = FrameSink::new(inner.config.capture.queue_frames);
        let capture = match start_capture(capture, frames.clone()).await {
            Ok(capture) => capture,
            Err(e) => {
                release_devices(None, scheduler).await;
                transport.close().await;
                return Err(e);
            }
        };

        {
            let mut lifecycle = inner.lifecycle.lock();
            if lifecycle.epoch == epoch {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let session = SessionLoop {
                    epoch,
                    controller: Arc::downgrade(inner),
                    shared: inner.shared.clone(),
                    stats_interval: Duration::from_secs(inner.config.session.stats_interval_secs),
                    capture,
                    frames,
                    encoder,
                    decoder,
                    scheduler,
                    completions,
                    transport,
                    ring_overflow_seen: 0,
                    backpressured: false,
                };
                let handle = tokio::spawn(session.run(shutdown_rx));
                lifecycle.worker = Some(Worker {
                    shutdown: shutdown_tx,
                    handle,
                });
                inner.set_state(&mut lifecycle, SessionState::Live, None);
                return Ok(());
            }
        }

        debug!("Connect overtaken by disconnect, releasing");
        release_devices(Some(capture), scheduler).await;
        transport.close().await;
        Err(Error::Aborted)
    }

    /// Tear the session down. Safe from any state; returns once capture,
    /// playback and the channel are released (bounded by the shutdown
    /// timeout).
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let timeout = inner.config.session.shutdown_timeout();

        let (epoch, worker, was_connecting) = {
            let mut lifecycle = inner.lifecycle.lock();
            let state = lifecycle.state;
            match state {
                SessionState::Disconnected => return,
                SessionState::Connecting | SessionState::Error => {
                    let epoch = inner.bump_epoch(&mut lifecycle);
                    inner.set_state(&mut lifecycle, SessionState::Disconnected, None);
                    (epoch, None, state == SessionState::Connecting)
                }
                SessionState::Live => {
                    let epoch = inner.bump_epoch(&mut lifecycle);
                    lifecycle.disconnecting = true;
                    (epoch, lifecycle.worker.take(), false)
                }
            }
        };

        if was_connecting {
            // The aborted attempt releases whatever it acquired before it
            // drops the gate
            if tokio::time::timeout(timeout, inner.connect_gate.lock()).await.is_err() {
                warn!("Connect attempt did not abort within {:?}", timeout);
            }
            return;
        }

        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            let mut handle = worker.handle;
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("Session loop did not stop within {:?}, aborting", timeout);
                handle.abort();
                let _ = handle.await;
            }
        }

        let mut lifecycle = inner.lifecycle.lock();
        lifecycle.disconnecting = false;
        if lifecycle.epoch == epoch && lifecycle.state != SessionState::Disconnected {
            inner.set_state(&mut lifecycle, SessionState::Disconnected, None);
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.lock().state
    }

    /// Transcript of the current (or last) session
    pub fn transcript(&self) -> String {
        self.inner.shared.transcript.lock().clone()
    }

    /// Reason for the last failure; cleared by the next `connect()`
    pub fn last_error(&self) -> Option<String> {
        self.inner.lifecycle.lock().last_error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.shared.events.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.shared.stats.snapshot()
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }
}

/// Start capture off the runtime; cpal waits for the stream to come up
async fn start_capture(
    mut capture: Box<dyn CaptureSource>,
    frames: FrameSink,
) -> Result<Box<dyn CaptureSource>> {
    tokio::task::spawn_blocking(move || {
        capture.start(frames)?;
        Ok::<_, AudioError>(capture)
    })
    .await
    .map_err(|e| Error::DeviceAcquisition(AudioError::StreamError(e.to_string())))?
    .map_err(Error::DeviceAcquisition)
}

/// Stop capture and close playback off the runtime; both join device threads
async fn release_devices(capture: Option<Box<dyn CaptureSource>>, mut scheduler: PlaybackScheduler) {
    let released = tokio::task::spawn_blocking(move || {
        if let Some(mut capture) = capture {
            capture.stop();
        }
        scheduler.shutdown();
    })
    .await;
    if let Err(e) = released {
        warn!("Releasing audio devices failed: {}", e);
    }
}

enum LoopExit {
    Shutdown,
    RemoteClosed,
    Failed(Error),
}

struct SessionLoop {
    epoch: u64,
    controller: Weak<Inner>,
    shared: Arc<Shared>,
    stats_interval: Duration,
    capture: Box<dyn CaptureSource>,
    frames: FrameSink,
    encoder: PcmEncoder,
    decoder: PcmDecoder,
    scheduler: PlaybackScheduler,
    completions: mpsc::UnboundedReceiver<BufferId>,
    transport: TransportSession,
    ring_overflow_seen: usize,
    backpressured: bool,
}

impl SessionLoop {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_stats = Instant::now();

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => break LoopExit::Shutdown,
                event = self.transport.next_event() => match event {
                    Some(event) => {
                        if let Some(exit) = self.handle_event(event) {
                            break exit;
                        }
                    }
                    None => break LoopExit::RemoteClosed,
                },
                Some(id) = self.completions.recv() => {
                    if self.scheduler.on_complete(id) {
                        StatsCounters::incr(&self.shared.stats.buffers_completed);
                    }
                }
                _ = self.frames.ready() => self.pump_outbound(),
                _ = health.tick() => {
                    self.pump_outbound();
                    if let Some(exit) = self.check_health() {
                        break exit;
                    }
                    if !self.stats_interval.is_zero() && last_stats.elapsed() >= self.stats_interval {
                        self.log_stats();
                        last_stats = Instant::now();
                    }
                }
            }
        };

        let SessionLoop {
            epoch,
            controller,
            capture,
            frames,
            scheduler,
            transport,
            ..
        } = self;

        release_devices(Some(capture), scheduler).await;
        frames.buffer().clear();
        transport.close().await;
        debug!("Session resources released");

        if let Some(controller) = controller.upgrade() {
            controller.finish(epoch, exit);
        }
    }

    fn handle_event(&mut self, event: TransportEvent) -> Option<LoopExit> {
        let stats = &self.shared.stats;
        match event {
            TransportEvent::AudioChunk(chunk) => {
                StatsCounters::incr(&stats.chunks_received);
                match self.decoder.decode(&chunk) {
                    Ok(frame) => match self.scheduler.schedule(frame) {
                        Ok(Some(buffer)) => {
                            StatsCounters::incr(&stats.buffers_scheduled);
                            debug!("Buffer {} at {:.3}s for {:.3}s", buffer.id, buffer.start_at, buffer.duration);
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Failed to schedule playback: {}", e),
                    },
                    Err(e) => {
                        StatsCounters::incr(&stats.chunks_malformed);
                        warn!("Dropping inbound chunk: {}", e);
                    }
                }
            }
            TransportEvent::TranscriptFragment(fragment) => {
                self.shared.transcript.lock().push_str(&fragment);
                self.shared.notify(SessionEvent::TranscriptAppended { fragment });
            }
            TransportEvent::Interrupted => {
                let stopped = self.scheduler.interrupt();
                StatsCounters::incr(&stats.interruptions);
                debug!("Interrupted, {} buffers stopped", stopped);
                self.shared.notify(SessionEvent::Interrupted);
            }
            TransportEvent::TurnComplete => self.shared.notify(SessionEvent::TurnComplete),
            TransportEvent::Closed => {
                info!("Agent closed the channel");
                return Some(LoopExit::RemoteClosed);
            }
            TransportEvent::Error(reason) => {
                return Some(LoopExit::Failed(Error::Transport(NetworkError::Channel(reason))));
            }
        }
        None
    }

    /// Move captured frames to the transport without ever waiting on it
    fn pump_outbound(&mut self) {
        let stats = &self.shared.stats;

        let overflow = self.frames.buffer().overflow_count();
        let overrun = (overflow - self.ring_overflow_seen) as u64;
        if overrun > 0 {
            self.ring_overflow_seen = overflow;
            StatsCounters::add(&stats.frames_captured, overrun);
            StatsCounters::add(&stats.frames_dropped, overrun);
            warn!("Capture queue full, dropped {} frames", overrun);
        }

        while let Some(frame) = self.frames.buffer().pop() {
            StatsCounters::incr(&stats.frames_captured);
            let chunk = match self.encoder.encode(&frame) {
                Ok(chunk) => chunk,
                Err(e) => {
                    StatsCounters::incr(&stats.frames_dropped);
                    warn!("Failed to encode captured frame: {}", e);
                    continue;
                }
            };
            match self.transport.try_send(chunk) {
                Ok(()) => {
                    StatsCounters::incr(&stats.frames_sent);
                    self.backpressured = false;
                }
                Err(e) => {
                    StatsCounters::incr(&stats.frames_dropped);
                    if !self.backpressured {
                        warn!("Dropping captured audio: {}", e);
                        self.backpressured = true;
                    }
                }
            }
        }
    }

    fn check_health(&self) -> Option<LoopExit> {
        if let Some(e) = self.capture.check_errors() {
            return Some(LoopExit::Failed(Error::Audio(e)));
        }
        if let Some(e) = self.scheduler.check_errors() {
            return Some(LoopExit::Failed(Error::Audio(e)));
        }
        None
    }

    fn log_stats(&self) {
        let stats = self.shared.stats.snapshot();
        info!(
            "Stats: {} frames sent, {} dropped ({:.1}%), {} chunks played, {} malformed, {} interruptions, {} buffers queued",
            stats.frames_sent,
            stats.frames_dropped,
            stats.drop_rate() * 100.0,
            stats.buffers_completed,
            stats.chunks_malformed,
            stats.interruptions,
            self.scheduler.active_count(),
        );
    }
}
