//! Named background threads and bounded shutdown.
//!
//! Every long-running job (stream reader, login, capture, analysis) gets its own
//! named thread so it shows up in debuggers and panic messages. Shutdown polls
//! `is_finished` against a deadline instead of joining blindly: a thread stuck in
//! a blocking socket read must not hang the process on exit.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::trace;

/// Spawn a named thread running `f`
pub fn spawn_task<F>(name: impl Into<String>, f: F) -> anyhow::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let name = name.into();
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .with_context(|| format!("Failed to spawn thread '{}'", name))
}

/// Join `handles`, giving up once `timeout` has passed.
///
/// Returns true if every thread finished in time. Threads still running at the
/// deadline are detached and die with the process.
pub fn join_with_timeout(handles: Vec<JoinHandle<()>>, timeout: Duration) -> bool {
    let count = handles.len();
    let deadline = Instant::now() + timeout;

    for handle in handles {
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                trace!("Shutdown timeout reached, detaching remaining threads");
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let name = handle.thread().name().unwrap_or("unnamed").to_string();
        if handle.join().is_err() {
            trace!("Thread '{}' panicked", name);
        }
    }

    trace!("All {} threads stopped", count);
    true
}

/// Keep only handles whose threads are still running
pub fn reap_finished(handles: &mut Vec<JoinHandle<()>>) {
    let (done, running): (Vec<_>, Vec<_>) =
        std::mem::take(handles).into_iter().partition(|h| h.is_finished());
    for handle in done {
        let _ = handle.join();
    }
    *handles = running;
}
