//! nutricam - camera-to-nutrition acquisition and analysis library
//!
//! Re-exports all modules for use by binary targets.

// Core engine (session, stream, capture, analysis, orchestrator)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod console;

// Re-export commonly used types from core
pub use core::{
    AnalysisResult, CapturedImage, Orchestrator, RequestOutcome, ResultSink, SinkEvent, StreamState,
};
pub use config::{PathConfig, Settings};
