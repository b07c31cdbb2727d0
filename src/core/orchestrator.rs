//! Acquisition + analysis orchestrator.
//!
//! Owns every component and wires them together:
//!
//! ```text
//!                    ┌────────────────┐
//!   settings ──────> │  Orchestrator  │ ──> SinkEvent channel ──> pump() ──> ResultSink
//!                    └────────────────┘
//!                      │    │    │   │
//!          SessionManager  Capture  Analysis  StreamController
//!            (Arc)         (Arc)    (Arc)      (worker thread)
//! ```
//!
//! Every user action returns at once. Network work runs on a named worker
//! thread which reports back through the event channel only; the presentation
//! thread calls [`Orchestrator::pump`] (or selects on [`Orchestrator::events`])
//! to deliver results to its sink.

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, trace, warn};

use crate::config::{require_non_empty, Settings};

use super::analysis::AnalysisClient;
use super::capture::CaptureService;
use super::events::{self, AuthInfo, EventSender, ResultSink, SinkEvent};
use super::frame::Viewport;
use super::mjpeg::HttpConnector;
use super::outcome::RequestOutcome;
use super::session::SessionManager;
use super::stream::{Connector, StreamController, StreamState};
use super::workers::spawn_task;

/// Bounded wait for the stream worker on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of triggering a background operation
#[derive(Debug)]
pub enum Dispatch {
    /// Worker thread is running; its result arrives as events
    Started(JoinHandle<()>),
    /// Refused before any network traffic
    Rejected(RequestOutcome<()>),
}

impl Dispatch {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }

    /// Wait for the worker. Returns false if nothing was started.
    pub fn join(self) -> bool {
        match self {
            Dispatch::Started(handle) => {
                if handle.join().is_err() {
                    warn!("Worker thread panicked");
                }
                true
            }
            Dispatch::Rejected(_) => false,
        }
    }
}

pub struct Orchestrator {
    settings: RwLock<Settings>,
    session: Arc<SessionManager>,
    capture: Arc<CaptureService>,
    analysis: Arc<AnalysisClient>,
    stream: StreamController,
    events: EventSender,
    inbox: Receiver<SinkEvent>,
}

impl Orchestrator {
    /// Orchestrator talking to a real camera over HTTP
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        Self::with_connector(settings, Arc::new(HttpConnector::default()))
    }

    pub fn with_connector(settings: Settings, connector: Arc<dyn Connector>) -> anyhow::Result<Self> {
        let (events, inbox) = events::channel();
        let stream = StreamController::new(connector, Viewport::new(), events.clone());
        Ok(Self {
            settings: RwLock::new(settings),
            session: Arc::new(SessionManager::new()),
            capture: Arc::new(CaptureService::new()?),
            analysis: Arc::new(AnalysisClient::new()),
            stream,
            events,
            inbox,
        })
    }

    // ===== Settings / views =====

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        f(&mut settings);
        debug!("Settings updated: {:?}", *settings);
    }

    /// Viewport the presentation layer keeps up to date
    pub fn viewport(&self) -> &Viewport {
        self.stream.viewport()
    }

    /// Event receiver, for callers that `select!` over several channels
    pub fn events(&self) -> &Receiver<SinkEvent> {
        &self.inbox
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_running()
    }

    pub fn analysis_in_progress(&self) -> bool {
        self.analysis.is_busy()
    }

    pub fn has_capture(&self) -> bool {
        self.capture.current().is_some()
    }

    // ===== Session =====

    pub fn login(&self) -> anyhow::Result<Dispatch> {
        let settings = self.settings();
        let (api, email, password) = match (
            require_non_empty(settings.api_base(), "API URL"),
            require_non_empty(&settings.email, "email"),
            require_non_empty(&settings.password, "password"),
        ) {
            (Ok(a), Ok(e), Ok(p)) => (a.to_string(), e.to_string(), p.to_string()),
            (Err(msg), _, _) | (_, Err(msg), _) | (_, _, Err(msg)) => {
                return Ok(self.reject(RequestOutcome::PreconditionFailure(msg)));
            }
        };

        self.events.status("Logging in...");
        let session = Arc::clone(&self.session);
        let events = self.events.clone();

        let handle = spawn_task("nutricam-login", move || {
            match session.login(&api, &email, &password) {
                RequestOutcome::Success(auth) => {
                    let name = auth.identity.display_name.clone();
                    let session_based = auth.credential.is_session();
                    events.log(format!("Login successful! Welcome, {}", name));
                    if session_based {
                        events.log("Using session-based authentication");
                    }
                    events.status(format!("Logged in as {}", name));
                    events.auth(Some(AuthInfo { identity: auth.identity, session_based }));
                }
                other => {
                    events.log(format!("Login failed: {}", other));
                    events.status(format!("Login failed: {}", other));
                }
            }
        })?;
        Ok(Dispatch::Started(handle))
    }

    /// Forget the credential. Returns false if nobody was logged in.
    pub fn logout(&self) -> bool {
        if !self.session.invalidate() {
            return false;
        }
        self.events.auth(None);
        self.events.status("Logged out");
        true
    }

    // ===== Stream =====

    /// Returns whether a new stream session was started
    pub fn start_stream(&self) -> anyhow::Result<bool> {
        let settings = self.settings();
        let ip = match require_non_empty(settings.camera_host(), "camera IP address") {
            Ok(ip) => ip,
            Err(msg) => {
                self.reject(RequestOutcome::PreconditionFailure(msg));
                return Ok(false);
            }
        };

        let started = self.stream.start(ip, settings.stream_port)?;
        if started {
            self.events.status("Connecting to camera...");
        }
        Ok(started)
    }

    pub fn stop_stream(&self) -> bool {
        let was_running = self.stream.stop();
        if was_running {
            self.events.log("Stream stopped");
            self.events.status("Stream stopped");
        }
        was_running
    }

    /// Start if idle, stop if running. Returns whether the stream is now running.
    pub fn toggle_stream(&self) -> anyhow::Result<bool> {
        if self.stream.is_running() {
            self.stop_stream();
            Ok(false)
        } else {
            self.start_stream()
        }
    }

    // ===== Capture / analysis =====

    pub fn capture(&self) -> anyhow::Result<Dispatch> {
        let settings = self.settings();
        let ip = match require_non_empty(settings.camera_host(), "camera IP address") {
            Ok(ip) => ip.to_string(),
            Err(msg) => return Ok(self.reject(RequestOutcome::PreconditionFailure(msg))),
        };

        // The shown analysis belongs to the previous image
        self.events.cleared();
        self.events.status("Capturing image...");

        let capture = Arc::clone(&self.capture);
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        let generation = self.session.snapshot().map(|a| a.generation);

        let handle = spawn_task("nutricam-capture", move || match capture.capture_image(&ip) {
            RequestOutcome::Success(image) => {
                let kb = image.size_kb();
                events.capture(image);
                events.log(format!("Image captured successfully ({:.1} KB)", kb));
                events.status("Image captured");
            }
            RequestOutcome::AuthFailure => expire_session(&session, &events, generation),
            other => {
                events.log(format!("Capture failed: {}", other));
                events.status(format!("Capture failed: {}", other));
            }
        })?;
        Ok(Dispatch::Started(handle))
    }

    /// Submit the current capture for analysis.
    ///
    /// Refused synchronously, in this order, when there is no capture, no
    /// credential, or an analysis already running.
    pub fn analyze(&self) -> anyhow::Result<Dispatch> {
        let Some(image) = self.capture.current() else {
            return Ok(self.reject(RequestOutcome::PreconditionFailure(
                "Please capture an image first".to_string(),
            )));
        };
        let Some(auth) = self.session.snapshot() else {
            self.events.log("Authentication required. Please login first.");
            return Ok(self.reject(RequestOutcome::AuthFailure));
        };
        let Some(ticket) = self.analysis.try_acquire() else {
            return Ok(self.reject(RequestOutcome::PreconditionFailure(
                "Analysis already in progress".to_string(),
            )));
        };

        let api = self.settings().api_base().to_string();
        self.events.status("Analyzing image...");
        self.events.log(format!("Sending image for analysis ({:.1} KB)", image.size_kb()));

        let analysis = Arc::clone(&self.analysis);
        let session = Arc::clone(&self.session);
        let events = self.events.clone();

        let handle = spawn_task("nutricam-analyze", move || {
            let outcome = analysis.analyze_with(
                ticket,
                &api,
                Some(&auth.credential),
                auth.identity.id.as_deref(),
                &image,
            );
            match outcome {
                RequestOutcome::Success(result) => {
                    events.log(format!("Analysis complete: {}", result));
                    if let Some(url) = &result.image_url {
                        events.log(format!("Image stored at {}", url));
                    }
                    events.status(format!("Analysis complete: {}", result.food_name));
                    events.analysis(result);
                }
                RequestOutcome::AuthFailure => expire_session(&session, &events, Some(auth.generation)),
                other => {
                    events.log(format!("Analysis failed: {}", other));
                    events.status(format!("Analysis failed: {}", other));
                }
            }
        })?;
        Ok(Dispatch::Started(handle))
    }

    fn reject(&self, outcome: RequestOutcome<()>) -> Dispatch {
        let text = match &outcome {
            RequestOutcome::AuthFailure => "Please login first".to_string(),
            other => other.to_string(),
        };
        self.events.status(text);
        Dispatch::Rejected(outcome)
    }

    // ===== Delivery =====

    /// Hand one event to the sink. Frames from a stopped or replaced stream
    /// session are dropped.
    pub fn dispatch(&self, event: SinkEvent, sink: &mut dyn ResultSink) {
        match event {
            SinkEvent::Frame { session, image } => {
                if self.stream.is_current(session) {
                    sink.on_frame(&image);
                } else {
                    trace!("Dropping stale frame from stream session {}", session);
                }
            }
            SinkEvent::Capture(image) => sink.on_capture(&image),
            SinkEvent::AnalysisResult(result) => sink.on_analysis_result(&result),
            SinkEvent::AnalysisCleared => sink.on_analysis_cleared(),
            SinkEvent::Status(text) => sink.on_status(&text),
            SinkEvent::Log(line) => sink.on_log(&line),
            SinkEvent::Auth(auth) => sink.on_auth(auth.as_ref()),
        }
    }

    /// Deliver everything queued so far. Returns the number of events handled.
    pub fn pump(&self, sink: &mut dyn ResultSink) -> usize {
        let mut count = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.dispatch(event, sink);
            count += 1;
        }
        count
    }

    /// Stop the stream and wait briefly for its worker.
    ///
    /// Login/capture/analysis threads are not waited for.
    pub fn shutdown(&self) -> bool {
        self.stream.stop();
        let clean = self.stream.shutdown(SHUTDOWN_TIMEOUT);
        if !clean {
            debug!("Stream worker still busy after {:?}, detaching", SHUTDOWN_TIMEOUT);
        }
        clean
    }
}

/// 401/403 handling: drop the credential the failed request used
fn expire_session(session: &SessionManager, events: &EventSender, generation: Option<u64>) {
    let cleared = generation.is_some_and(|g| session.invalidate_generation(g));
    events.log("Authentication failed. Please login again.");
    if cleared {
        events.auth(None);
    }
    events.status("Session expired. Please login again.");
}
