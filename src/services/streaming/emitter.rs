//! Event emitter
//!
//! Serializes units and envelopes into Server-Sent Event frames and hands
//! each one to the downstream channel as soon as it is produced. The channel
//! is small and bounded, so a slow client pauses the scan loop instead of
//! letting frames pile up in memory.

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    error::{RelayError, Result},
    messages::{ContentUnit, Envelope},
};

use super::scanner::DONE_MARKER;

/// Format a `data:` frame
pub fn format_frame(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Format a frame with an explicit event type
pub fn format_event(event: &str, payload: &Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {payload}\n\n"))
}

/// The termination marker frame
pub fn done_frame() -> Bytes {
    Bytes::from(format!("data: {DONE_MARKER}\n\n"))
}

/// Writes frames toward one downstream client
#[derive(Debug)]
pub struct EventEmitter {
    tx: mpsc::Sender<Bytes>,
    frames_written: usize,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            frames_written: 0,
        }
    }

    /// Create an emitter together with the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Write one content unit frame
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DownstreamClosed`] if the client went away
    pub async fn emit(&mut self, unit: &ContentUnit) -> Result<()> {
        self.write(format_frame(&unit.to_payload())).await
    }

    /// Write a supplementary metadata frame
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DownstreamClosed`] if the client went away
    pub async fn emit_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        self.write(format_frame(&envelope.to_payload())).await
    }

    /// Tell the client the stream ended abnormally
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DownstreamClosed`] if the client went away
    pub async fn emit_error(&mut self, kind: &str, message: &str) -> Result<()> {
        let payload = json!({ "error": { "kind": kind, "message": message } });
        self.write(format_event("error", &payload)).await
    }

    /// Write the termination marker
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DownstreamClosed`] if the client went away
    pub async fn emit_done(&mut self) -> Result<()> {
        self.write(done_frame()).await
    }

    /// Resolves once the client has gone away
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    async fn write(&mut self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::DownstreamClosed)?;
        self.frames_written += 1;
        Ok(())
    }
}
