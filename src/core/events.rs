//! Background -> presentation events and the sink they are delivered to.
//!
//! Worker threads never touch presentation state. They post [`SinkEvent`]s
//! through an [`EventSender`]; the presentation loop drains the receiver and
//! hands each event to its [`ResultSink`] on its own thread.
//!
//! ```text
//!  stream worker ──┐
//!  capture/login ──┼──> crossbeam channel ──> Orchestrator::pump ──> ResultSink
//!  analysis task ──┘
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use image::RgbImage;
use log::{info, trace};

use super::analysis::AnalysisResult;
use super::capture::CapturedImage;
use super::session::UserIdentity;

/// Frames are dropped (not queued) while this many events are pending
pub const MAX_PENDING_FRAMES: usize = 64;

/// Timestamped diagnostic line for the on-screen log
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub message: String,
}

impl LogLine {
    pub fn now(message: impl Into<String>) -> Self {
        Self { at: Local::now(), message: message.into() }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Who is logged in, and how
#[derive(Debug, Clone, PartialEq)]
pub struct AuthInfo {
    pub identity: UserIdentity,
    pub session_based: bool,
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Scaled stream frame tagged with the stream session that produced it
    Frame { session: u64, image: RgbImage },
    Capture(Arc<CapturedImage>),
    AnalysisResult(AnalysisResult),
    /// Previous analysis no longer matches the current capture
    AnalysisCleared,
    Status(String),
    Log(LogLine),
    /// `None` after logout or session invalidation
    Auth(Option<AuthInfo>),
}

/// Receives events on the presentation thread
pub trait ResultSink {
    fn on_frame(&mut self, image: &RgbImage);
    fn on_capture(&mut self, image: &CapturedImage);
    fn on_analysis_result(&mut self, result: &AnalysisResult);
    fn on_status(&mut self, text: &str);
    fn on_log(&mut self, line: &LogLine);

    fn on_auth(&mut self, _auth: Option<&AuthInfo>) {}

    fn on_analysis_cleared(&mut self) {}
}

/// Cloneable producer side handed to workers
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<SinkEvent>,
}

pub fn channel() -> (EventSender, Receiver<SinkEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSender { tx }, rx)
}

impl EventSender {
    fn send(&self, event: SinkEvent) {
        // Receiver gone means the app is shutting down
        if self.tx.send(event).is_err() {
            trace!("Event dropped, receiver closed");
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.send(SinkEvent::Status(text.into()));
    }

    /// Diagnostic line: goes to the log backend and to the sink
    pub fn log(&self, message: impl Into<String>) {
        let line = LogLine::now(message);
        info!("{}", line.message);
        self.send(SinkEvent::Log(line));
    }

    /// Returns false if the frame was dropped because the consumer is behind
    pub fn frame(&self, session: u64, image: RgbImage) -> bool {
        if self.tx.len() >= MAX_PENDING_FRAMES {
            trace!("Presentation behind ({} pending), dropping frame", self.tx.len());
            return false;
        }
        self.send(SinkEvent::Frame { session, image });
        true
    }

    pub fn capture(&self, image: Arc<CapturedImage>) {
        self.send(SinkEvent::Capture(image));
    }

    pub fn analysis(&self, result: AnalysisResult) {
        self.send(SinkEvent::AnalysisResult(result));
    }

    pub fn cleared(&self) {
        self.send(SinkEvent::AnalysisCleared);
    }

    pub fn auth(&self, auth: Option<AuthInfo>) {
        self.send(SinkEvent::Auth(auth));
    }
}
