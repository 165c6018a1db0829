//! Stream lifecycle controller
//!
//! Drives one session from the first upstream byte to the last downstream
//! frame: reads chunks under the session deadline, feeds them to the
//! [`StreamSession`], writes whatever comes back, and picks the right way to
//! close the stream.

use std::fmt;

use bytes::Bytes;
use futures::{pin_mut, Stream, StreamExt};
use serde::Serialize;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{config::StreamSettings, error::Result};

use super::{
    emitter::EventEmitter,
    session::{SessionEvent, SessionStats, StreamSession, Termination},
};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Open,
    Reading,
    Scanning,
    Emitting,
    Finalizing,
    Closed,
    TimedOut,
    Errored,

    /// The downstream client went away
    Cancelled,
}

impl StreamState {
    /// No further transitions happen from here
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Closed | Self::TimedOut | Self::Errored | Self::Cancelled
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Reading => "reading",
            Self::Scanning => "scanning",
            Self::Emitting => "emitting",
            Self::Finalizing => "finalizing",
            Self::Closed => "closed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: StreamState,
    pub termination: Option<Termination>,
    pub stats: SessionStats,
    pub frames_written: usize,

    /// User-facing text that reached the client
    pub final_text: String,
    pub elapsed_ms: u64,
}

/// Why the read loop stopped
enum Outcome {
    /// EOF, end marker or termination resend
    Exhausted,
    TimedOut,
    Failed(String),
    Cancelled,
}

/// Runs sessions with a fixed set of stream settings
#[derive(Debug, Clone, Default)]
pub struct StreamController {
    settings: StreamSettings,
}

impl StreamController {
    pub fn new(settings: StreamSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Relay `upstream` to `emitter` until the session reaches a terminal
    /// state.
    ///
    /// Never fails: every outcome is reflected in the returned report and,
    /// where the client is still listening, in the frames written to it.
    pub async fn run<S, E>(&self, upstream: S, mut emitter: EventEmitter) -> SessionReport
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: fmt::Display + Send,
    {
        let started = Instant::now();
        let deadline = started + self.settings.deadline();
        let mut session = StreamSession::new(&self.settings);
        let id = session.id();
        let mut state = StreamState::Open;
        pin_mut!(upstream);

        info!(session = %id, deadline_ms = self.settings.deadline_ms, "stream opened");

        let outcome = loop {
            transition(id, &mut state, StreamState::Reading);
            let next = tokio::select! {
                biased;
                () = emitter.closed() => break Outcome::Cancelled,
                next = timeout_at(deadline, upstream.next()) => next,
            };

            let chunk = match next {
                Err(_) => break Outcome::TimedOut,
                Ok(None) => break Outcome::Exhausted,
                Ok(Some(Err(e))) => break Outcome::Failed(e.to_string()),
                Ok(Some(Ok(chunk))) => chunk,
            };

            transition(id, &mut state, StreamState::Scanning);
            trace!(session = %id, bytes = chunk.len(), "chunk received");
            let events = session.ingest(&chunk);

            transition(id, &mut state, StreamState::Emitting);
            match timeout_at(deadline, deliver(&mut emitter, &events)).await {
                Err(_) => break Outcome::TimedOut,
                Ok(Err(_)) => break Outcome::Cancelled,
                Ok(Ok(())) => {}
            }

            if session.should_stop() {
                debug!(session = %id, termination = ?session.termination(), "upstream finished early");
                break Outcome::Exhausted;
            }
        };

        let grace = self.settings.finalize_grace();
        let final_state = match outcome {
            Outcome::Exhausted => {
                transition(id, &mut state, StreamState::Finalizing);
                let tail = session.finalize();
                let close = async {
                    deliver(&mut emitter, &tail).await?;
                    emitter.emit_done().await
                };
                match timeout(grace, close).await {
                    Ok(Ok(())) => StreamState::Closed,
                    Ok(Err(_)) => StreamState::Cancelled,
                    Err(_) => {
                        warn!(session = %id, "client too slow to accept the final frames");
                        StreamState::TimedOut
                    }
                }
            }
            Outcome::TimedOut => {
                warn!(
                    session = %id,
                    deadline_ms = self.settings.deadline_ms,
                    "upstream did not finish before the deadline"
                );
                transition(id, &mut state, StreamState::Finalizing);
                let tail = session.finalize();
                let message = format!(
                    "upstream did not finish within {} ms",
                    self.settings.deadline_ms
                );
                let close = async {
                    deliver(&mut emitter, &tail).await?;
                    emitter.emit_error("timeout", &message).await?;
                    emitter.emit_done().await
                };
                if let Ok(Err(_)) | Err(_) = timeout(grace, close).await {
                    debug!(session = %id, "timeout notice not delivered");
                }
                StreamState::TimedOut
            }
            Outcome::Failed(message) => {
                error!(session = %id, error = %message, "upstream stream failed");
                let close = async {
                    emitter.emit_error("upstream", &message).await?;
                    emitter.emit_done().await
                };
                if let Ok(Err(_)) | Err(_) = timeout(grace, close).await {
                    debug!(session = %id, "error notice not delivered");
                }
                StreamState::Errored
            }
            Outcome::Cancelled => {
                info!(session = %id, "client disconnected");
                StreamState::Cancelled
            }
        };
        transition(id, &mut state, final_state);

        let report = SessionReport {
            session_id: id,
            state,
            termination: session.termination(),
            stats: session.stats(),
            frames_written: emitter.frames_written(),
            final_text: session.final_text().to_string(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        info!(
            session = %id,
            state = %report.state,
            frames = report.frames_written,
            elapsed_ms = report.elapsed_ms,
            "stream closed"
        );
        report
    }
}

fn transition(id: Uuid, state: &mut StreamState, next: StreamState) {
    if *state != next {
        trace!(session = %id, from = %state, to = %next, "state change");
        *state = next;
    }
}

async fn deliver(emitter: &mut EventEmitter, events: &[SessionEvent]) -> Result<()> {
    for event in events {
        match event {
            SessionEvent::Unit(unit) => emitter.emit(unit).await?,
            SessionEvent::Envelope(envelope) => emitter.emit_envelope(envelope).await?,
        }
    }
    Ok(())
}
