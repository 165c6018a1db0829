//! agent-relay: streaming agent responses as discrete Server-Sent Events
//!
//! An upstream agent emits JSON events whose bytes arrive in arbitrary
//! chunks. This library finds each complete content unit as soon as its
//! bytes are in, suppresses duplicates and the closing resend of the whole
//! answer, and writes one SSE frame per unit.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::too_many_lines)]

pub mod cli;
pub mod config;
pub mod error;
pub mod messages;
pub mod server;
pub mod services;

// Re-exports for convenience
pub use error::{RelayError, Result};
