//! Server, upstream and stream settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier used for units whose event names no author
pub const DEFAULT_AUTHOR: &str = "astra";

/// How the termination resend is compared with the accumulated text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResendMatch {
    /// Byte-for-byte equality
    Exact,

    /// Equality after trimming leading and trailing whitespace
    #[default]
    Trimmed,
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to bind
    pub listen: String,

    /// Cross-origin policy for browser clients
    pub cors: CorsSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            cors: CorsSettings::default(),
        }
    }
}

/// CORS headers attached to every response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    /// Allowed origins; `*` allows any
    pub allowed_origins: Vec<String>,

    pub allowed_headers: Vec<String>,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_headers: vec!["content-type".to_string(), "authorization".to_string()],
        }
    }
}

impl CorsSettings {
    /// The `Access-Control-Allow-Origin` value for a request origin, if allowed
    #[must_use]
    pub fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Some("*".to_string());
        }
        let origin = origin?;
        self.allowed_origins
            .iter()
            .find(|allowed| allowed.as_str() == origin)
            .cloned()
    }
}

/// Where agent requests are forwarded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Full URL of the streaming agent endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Sent as `Authorization: Bearer <token>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    pub connect_timeout_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            bearer_token: None,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Per-session normalizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Wall-clock ceiling for a whole session
    pub deadline_ms: u64,

    /// Bound on finalize writes once the deadline has passed
    pub finalize_grace_ms: u64,

    /// Author for units whose event names none
    pub default_author: String,

    /// Leading characters folded into a fingerprint
    pub fingerprint_prefix_chars: usize,

    pub resend_match: ResendMatch,

    /// Emit text-less function call / response parts
    pub forward_tool_activity: bool,

    /// Frames queued toward the client before the scan loop waits
    pub channel_capacity: usize,

    /// Delay an event's units until its `author` is known, even when that
    /// key follows the parts array
    pub hold_for_author: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            deadline_ms: 300_000,
            finalize_grace_ms: 5_000,
            default_author: DEFAULT_AUTHOR.to_string(),
            fingerprint_prefix_chars: crate::services::streaming::DEFAULT_PREFIX_CHARS,
            resend_match: ResendMatch::default(),
            forward_tool_activity: false,
            channel_capacity: 16,
            hold_for_author: false,
        }
    }
}

impl StreamSettings {
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    #[must_use]
    pub fn finalize_grace(&self) -> Duration {
        Duration::from_millis(self.finalize_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_settings_default() {
        let settings = StreamSettings::default();
        assert_eq!(settings.deadline(), Duration::from_secs(300));
        assert_eq!(settings.default_author, "astra");
        assert_eq!(settings.fingerprint_prefix_chars, 100);
        assert_eq!(settings.resend_match, ResendMatch::Trimmed);
        assert!(!settings.hold_for_author);
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: StreamSettings =
            serde_json::from_str(r#"{"deadline_ms": 1500, "resend_match": "exact", "hold_for_author": true}"#)
                .unwrap();
        assert_eq!(settings.deadline_ms, 1500);
        assert!(settings.hold_for_author);
        assert_eq!(settings.resend_match, ResendMatch::Exact);
        assert_eq!(settings.channel_capacity, 16);
    }

    #[test]
    fn test_cors_allow_origin() {
        let any = CorsSettings::default();
        assert_eq!(any.allow_origin(None), Some("*".to_string()));

        let listed = CorsSettings {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            ..CorsSettings::default()
        };
        assert_eq!(
            listed.allow_origin(Some("http://localhost:3000")),
            Some("http://localhost:3000".to_string())
        );
        assert_eq!(listed.allow_origin(Some("http://evil.test")), None);
    }
}
