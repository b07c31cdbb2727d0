//! Core engine: session, stream, capture, analysis and the orchestrator tying
//! them together.
//!
//! Independent of any presentation layer; results leave through
//! [`events::ResultSink`].

pub mod analysis;
pub mod capture;
pub mod events;
pub mod frame;
pub mod mjpeg;
pub mod orchestrator;
pub mod outcome;
pub mod session;
pub mod stream;
pub mod workers;

#[cfg(test)]
pub mod test_support;

// Re-exports for convenience
pub use analysis::{AnalysisClient, AnalysisResult, DailyShare};
pub use capture::{CaptureService, CapturedImage};
pub use events::{AuthInfo, EventSender, LogLine, ResultSink, SinkEvent};
pub use frame::Viewport;
pub use mjpeg::HttpConnector;
pub use orchestrator::{Dispatch, Orchestrator};
pub use outcome::RequestOutcome;
pub use session::{Credential, SessionManager, UserIdentity};
pub use stream::{Connector, FrameError, FrameSource, StreamController, StreamState};
