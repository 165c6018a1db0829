//! Streaming normalizer
//!
//! Turns an upstream response that delivers JSON objects in arbitrary byte
//! chunks into discrete Server-Sent Events, one per content unit, emitted as
//! soon as each unit is complete.
//!
//! The pipeline is split the way data flows through it:
//! - [`accumulator`] buffers bytes and keeps UTF-8 boundaries intact
//! - [`scanner`] finds balanced objects without parsing the whole buffer
//! - [`interpreter`] turns a span into a unit or an envelope
//! - [`ledger`] suppresses duplicates and spots the closing resend
//! - [`session`] ties these together for one connection
//! - [`emitter`] and [`controller`] handle frames, deadlines and shutdown

pub mod accumulator;
pub mod controller;
pub mod emitter;
pub mod interpreter;
pub mod ledger;
pub mod scanner;
pub mod session;

pub use accumulator::ByteAccumulator;
pub use controller::{SessionReport, StreamController, StreamState};
pub use emitter::{done_frame, format_event, format_frame, EventEmitter};
pub use interpreter::{FragmentInterpreter, Interpretation};
pub use ledger::{DeduplicationLedger, DEFAULT_PREFIX_CHARS};
pub use scanner::{PartsCursor, ScanOutcome, DONE_MARKER};
pub use session::{SessionEvent, SessionStats, StreamSession, Termination};
