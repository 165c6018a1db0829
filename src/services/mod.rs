//! Service layer: the upstream client and the streaming normalizer

pub mod streaming;
pub mod upstream;

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

use crate::error::Result;

pub use upstream::{HttpUpstream, UpstreamClient};

/// Raw upstream response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;
