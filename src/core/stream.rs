//! Live camera stream lifecycle.
//!
//! # States
//!
//! ```text
//!          start()            connected
//!   Idle ──────────> Connecting ──────────> Streaming
//!    ^                   │                      │
//!    └──── stop() / connect failure / fatal ────┘
//! ```
//!
//! # Sessions
//!
//! Each `start()` (and each `stop()`) bumps a session counter under the state
//! lock. A worker only acts while its session is current, so a worker from a
//! previous session can never flip the state of a newer one. Frames carry
//! their session id so the presentation side can drop anything already queued
//! from an old session.
//!
//! At most one worker ever acts on the controller: `start()` while running is
//! a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use super::events::EventSender;
use super::frame::{decode_and_scale, Viewport};
use super::outcome::RequestOutcome;
use super::workers::{join_with_timeout, reap_finished, spawn_task};

/// Port the ESP32-CAM serves its MJPEG stream on
pub const DEFAULT_STREAM_PORT: u16 = 81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Failure reading one frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    /// Skip this frame, back off, keep going
    Transient(String),
    /// End the stream
    Fatal(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Transient(msg) => write!(f, "{}", msg),
            FrameError::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FrameError {}

/// Source of encoded frames (one JPEG per call)
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Vec<u8>, FrameError>;
}

/// Opens frame sources; failure here ends the start attempt.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Box<dyn FrameSource>, FrameError>;
}

/// Pacing of the read loop
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Sleep after a failed read
    pub backoff: Duration,
    /// Sleep after a published frame
    pub frame_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(100),
            frame_interval: Duration::from_millis(33),
        }
    }
}

/// `http://{host}:{port}/stream`; any port in `camera_ip` is ignored
pub fn stream_url(camera_ip: &str, port: u16) -> String {
    let host = camera_ip
        .trim()
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let host = host.split(':').next().unwrap_or(host);
    format!("http://{}:{}/stream", host, port)
}

struct Shared {
    running: AtomicBool,
    session: AtomicU64,
    state: Mutex<StreamState>,
}

impl Shared {
    fn is_active(&self, session: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.session.load(Ordering::SeqCst) == session
    }

    /// Set state if `session` still owns the controller
    fn advance(&self, session: u64, next: StreamState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_active(session) {
            return false;
        }
        *state = next;
        true
    }

    /// Go back to Idle if `session` still owns the controller
    fn release(&self, session: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_active(session) {
            return false;
        }
        self.running.store(false, Ordering::SeqCst);
        *state = StreamState::Idle;
        true
    }
}

/// Owns the stream worker and its lifecycle
pub struct StreamController {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    viewport: Viewport,
    events: EventSender,
    timing: Timing,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamController {
    pub fn new(connector: Arc<dyn Connector>, viewport: Viewport, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                session: AtomicU64::new(0),
                state: Mutex::new(StreamState::Idle),
            }),
            connector,
            viewport,
            events,
            timing: Timing::default(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Begin streaming from `http://{camera_ip}:{port}/stream`.
    ///
    /// Returns `Ok(false)` without side effects if already running.
    pub fn start(&self, camera_ip: &str, port: u16) -> anyhow::Result<bool> {
        let session = {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if self.shared.running.load(Ordering::SeqCst) {
                trace!("Stream already running, start ignored");
                return Ok(false);
            }
            self.shared.running.store(true, Ordering::SeqCst);
            *state = StreamState::Connecting;
            self.shared.session.fetch_add(1, Ordering::SeqCst) + 1
        };

        let url = stream_url(camera_ip, port);
        let worker = StreamWorker {
            shared: Arc::clone(&self.shared),
            connector: Arc::clone(&self.connector),
            viewport: self.viewport.clone(),
            events: self.events.clone(),
            timing: self.timing,
            url,
            session,
        };

        let handle = match spawn_task(format!("nutricam-stream-{}", session), move || worker.run()) {
            Ok(h) => h,
            Err(e) => {
                self.shared.release(session);
                return Err(e);
            }
        };

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        reap_finished(&mut workers);
        workers.push(handle);
        Ok(true)
    }

    /// Stop streaming. Returns false if nothing was running.
    ///
    /// Takes effect immediately, even if the worker is still blocked in a read.
    /// A frame already on its way carries the stopped session id and is
    /// discarded on delivery.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.session.fetch_add(1, Ordering::SeqCst);
        *state = StreamState::Idle;
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current session id; bumped by every start and stop
    pub fn session_id(&self) -> u64 {
        self.shared.session.load(Ordering::SeqCst)
    }

    /// Frame produced by `session` is still current
    pub fn is_current(&self, session: u64) -> bool {
        self.shared.is_active(session)
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Stop and wait up to `timeout` for workers to exit
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        join_with_timeout(handles, timeout)
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

struct StreamWorker {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    viewport: Viewport,
    events: EventSender,
    timing: Timing,
    url: String,
    session: u64,
}

impl StreamWorker {
    fn run(self) {
        self.events.log(format!("Connecting to stream: {}", self.url));

        let mut source = match self.connector.connect(&self.url) {
            Ok(s) => s,
            Err(e) => {
                if self.shared.release(self.session) {
                    let outcome = RequestOutcome::<()>::TransportFailure(e.to_string());
                    self.events.status(format!("Stream connection failed. {}", outcome));
                }
                self.events.log(format!("Stream error: {}", e));
                return;
            }
        };

        if !self.shared.advance(self.session, StreamState::Streaming) {
            debug!("Stream session {} superseded before first frame", self.session);
            return;
        }
        self.events.status("Streaming");
        self.events.log("Stream started");

        let mut published: u64 = 0;
        while self.shared.is_active(self.session) {
            match source.next_frame() {
                Ok(bytes) => match decode_and_scale(&bytes, self.viewport.target()) {
                    Ok(image) => {
                        // stop() may have landed during the read
                        if !self.shared.is_active(self.session) {
                            break;
                        }
                        if self.events.frame(self.session, image) {
                            published += 1;
                        }
                        thread::sleep(self.timing.frame_interval);
                    }
                    Err(e) => {
                        debug!("Frame decode failed: {}", e);
                        thread::sleep(self.timing.backoff);
                    }
                },
                Err(FrameError::Transient(msg)) => {
                    debug!("Frame read failed: {}", msg);
                    thread::sleep(self.timing.backoff);
                }
                Err(FrameError::Fatal(msg)) => {
                    self.events.log(format!("Stream error: {}", msg));
                    if self.shared.release(self.session) {
                        self.events.status("Stream stopped");
                    }
                    break;
                }
            }
        }

        debug!("Stream session {} ended after {} frames", self.session, published);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{channel, SinkEvent};
    use crate::core::mjpeg::HttpConnector;
    use crate::core::test_support::{jpeg_bytes, mjpeg_body, port_of, serve};
    use crossbeam_channel::Receiver;
    use std::collections::VecDeque;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const FAST: Timing = Timing {
        backoff: Duration::from_millis(5),
        frame_interval: Duration::from_millis(1),
    };

    type Script = Arc<Mutex<VecDeque<Result<Vec<u8>, FrameError>>>>;

    struct ScriptedSource {
        script: Script,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Vec<u8>, FrameError> {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                thread::sleep(Duration::from_millis(2));
                Err(FrameError::Transient("no data".into()))
            })
        }
    }

    /// Hands out sources reading from one shared script
    struct ScriptedConnector {
        script: Script,
        connects: AtomicUsize,
        fail_connect: bool,
        gate: Option<Mutex<std::sync::mpsc::Receiver<()>>>,
    }

    impl ScriptedConnector {
        fn new(items: Vec<Result<Vec<u8>, FrameError>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(items.into())),
                connects: AtomicUsize::new(0),
                fail_connect: false,
                gate: None,
            }
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, _url: &str) -> Result<Box<dyn FrameSource>, FrameError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _ = gate.lock().unwrap().recv();
            }
            if self.fail_connect {
                return Err(FrameError::Fatal("connection refused".into()));
            }
            Ok(Box::new(ScriptedSource { script: Arc::clone(&self.script) }))
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn collect_frames(rx: &Receiver<SinkEvent>, count: usize) -> Vec<(u64, (u32, u32))> {
        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.len() < count && Instant::now() < deadline {
            if let Ok(SinkEvent::Frame { session, image }) = rx.recv_timeout(Duration::from_millis(50)) {
                frames.push((session, image.dimensions()));
            }
        }
        frames
    }

    #[test]
    fn test_stream_url() {
        assert_eq!(stream_url("192.168.1.4", 81), "http://192.168.1.4:81/stream");
        assert_eq!(stream_url("192.168.1.4:80", 81), "http://192.168.1.4:81/stream");
        assert_eq!(stream_url("http://cam.local/", 8081), "http://cam.local:8081/stream");
    }

    #[test]
    fn test_start_while_running_is_noop() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let (tx, _rx) = channel();
        let ctl = StreamController::new(connector.clone(), Viewport::new(), tx).with_timing(FAST);

        assert!(ctl.start("127.0.0.1", 81).unwrap());
        assert!(wait_for(|| ctl.state() == StreamState::Streaming));
        let session = ctl.session_id();

        assert!(!ctl.start("127.0.0.1", 81).unwrap());
        assert_eq!(ctl.session_id(), session);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(ctl.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_then_start_reconnects() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let mut connector = ScriptedConnector::new(vec![]);
        connector.gate = Some(Mutex::new(gate_rx));
        let connector = Arc::new(connector);
        let (tx, _rx) = channel();
        let ctl = StreamController::new(connector.clone(), Viewport::new(), tx).with_timing(FAST);

        assert!(ctl.start("cam", 81).unwrap());
        assert_eq!(ctl.state(), StreamState::Connecting);
        gate_tx.send(()).unwrap();
        assert!(wait_for(|| ctl.state() == StreamState::Streaming));

        assert!(ctl.stop());
        assert_eq!(ctl.state(), StreamState::Idle);
        assert!(!ctl.is_running());
        assert!(!ctl.stop());

        assert!(ctl.start("cam", 81).unwrap());
        assert_eq!(ctl.state(), StreamState::Connecting);
        gate_tx.send(()).unwrap();
        assert!(wait_for(|| ctl.state() == StreamState::Streaming));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert!(ctl.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_transient_errors_keep_stream_alive_in_order() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Ok(jpeg_bytes(10, 10, 1)),
            Err(FrameError::Transient("read timeout".into())),
            Ok(b"not a jpeg".to_vec()),
            Ok(jpeg_bytes(20, 10, 2)),
            Err(FrameError::Transient("short read".into())),
            Ok(jpeg_bytes(30, 10, 3)),
        ]));
        let (tx, rx) = channel();
        let ctl = StreamController::new(connector, Viewport::new(), tx).with_timing(FAST);
        assert!(ctl.start("cam", 81).unwrap());

        let frames = collect_frames(&rx, 3);
        let sizes: Vec<_> = frames.iter().map(|(_, size)| *size).collect();
        assert_eq!(sizes, vec![(480, 480), (640, 320), (640, 213)]);
        assert!(frames.iter().all(|(s, _)| *s == ctl.session_id()));
        assert_eq!(ctl.state(), StreamState::Streaming);
        assert!(ctl.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_frames_fit_viewport() {
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(jpeg_bytes(40, 30, 9))]));
        let (tx, rx) = channel();
        let viewport = Viewport::new();
        viewport.set(200, 200);
        let ctl = StreamController::new(connector, viewport, tx).with_timing(FAST);
        ctl.start("cam", 81).unwrap();

        let frames = collect_frames(&rx, 1);
        assert_eq!(frames[0].1, (200, 150));
        ctl.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let mut connector = ScriptedConnector::new(vec![]);
        connector.fail_connect = true;
        let (tx, rx) = channel();
        let ctl = StreamController::new(Arc::new(connector), Viewport::new(), tx).with_timing(FAST);

        assert!(ctl.start("cam", 81).unwrap());
        assert!(wait_for(|| !ctl.is_running()));
        assert_eq!(ctl.state(), StreamState::Idle);

        let statuses: Vec<String> = rx
            .try_iter()
            .filter_map(|e| match e {
                SinkEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect();
        assert!(statuses.iter().any(|s| s.contains("connection refused")), "{:?}", statuses);
    }

    #[test]
    fn test_fatal_error_ends_stream() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Ok(jpeg_bytes(10, 10, 1)),
            Err(FrameError::Fatal("stream endpoint returned status 404".into())),
            Ok(jpeg_bytes(10, 10, 2)),
        ]));
        let (tx, rx) = channel();
        let ctl = StreamController::new(connector, Viewport::new(), tx).with_timing(FAST);
        ctl.start("cam", 81).unwrap();

        assert!(wait_for(|| !ctl.is_running()));
        assert_eq!(ctl.state(), StreamState::Idle);
        let frames = rx.try_iter().filter(|e| matches!(e, SinkEvent::Frame { .. })).count();
        assert_eq!(frames, 1);
    }

    #[test]
    fn test_no_frames_after_stop() {
        let items: Vec<_> = (0..500).map(|i| Ok(jpeg_bytes(8, 8, i as u8))).collect();
        let connector = Arc::new(ScriptedConnector::new(items));
        let (tx, rx) = channel();
        let ctl = StreamController::new(connector, Viewport::new(), tx).with_timing(FAST);
        ctl.start("cam", 81).unwrap();
        assert_eq!(collect_frames(&rx, 2).len(), 2);

        let session = ctl.session_id();
        ctl.stop();
        assert!(!ctl.is_current(session));
        thread::sleep(Duration::from_millis(30));
        // Anything still queued belongs to the stopped session
        let stale_only = rx.try_iter().all(|e| match e {
            SinkEvent::Frame { session: s, .. } => s == session,
            _ => true,
        });
        assert!(stale_only);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(rx.try_iter().filter(|e| matches!(e, SinkEvent::Frame { .. })).count(), 0);
        ctl.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_http_stream_reconnects_after_body_ends() {
        let frames = vec![jpeg_bytes(16, 12, 40), jpeg_bytes(16, 12, 90)];
        let body = mjpeg_body("123456789000000000000987654321", &frames);
        let (base, _server, hits) = serve(move |req| {
            assert_eq!(req.url(), "/stream");
            rouille::Response::from_data(
                "multipart/x-mixed-replace;boundary=123456789000000000000987654321",
                body.clone(),
            )
        });

        let (tx, rx) = channel();
        let ctl = StreamController::new(
            Arc::new(HttpConnector::default()),
            Viewport::new(),
            tx,
        )
        .with_timing(FAST);
        ctl.start("127.0.0.1", port_of(&base)).unwrap();

        let got = collect_frames(&rx, 5);
        assert_eq!(got.len(), 5);
        assert!(got.iter().all(|(_, size)| *size == (640, 480)));
        assert!(hits.load(Ordering::SeqCst) >= 3);
        assert!(ctl.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn test_silent_camera_returns_to_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, rx) = channel();
        let connector = HttpConnector { read_timeout: Duration::from_millis(300) };
        let ctl = StreamController::new(Arc::new(connector), Viewport::new(), tx).with_timing(FAST);
        assert!(ctl.start("127.0.0.1", port).unwrap());

        // Accept and read the request, never answer
        let (mut conn, _) = listener.accept().unwrap();
        let mut request = [0u8; 1024];
        let _ = conn.read(&mut request).unwrap();

        assert!(wait_for(|| !ctl.is_running()));
        assert_eq!(ctl.state(), StreamState::Idle);
        let statuses: Vec<String> = rx
            .try_iter()
            .filter_map(|e| match e {
                SinkEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect();
        assert!(
            statuses.iter().any(|s| s.starts_with("Stream connection failed.")),
            "{:?}",
            statuses
        );
        assert!(ctl.shutdown(Duration::from_secs(1)));
        drop(conn);
    }
}
