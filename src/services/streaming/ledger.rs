//! Deduplication ledger
//!
//! Guards against emitting the same content unit twice in one session and
//! recognises the upstream's closing habit of resending the whole answer as
//! one last unit.

use std::collections::HashSet;

use crate::{config::ResendMatch, messages::ContentUnit};

/// Default number of leading characters folded into a fingerprint
pub const DEFAULT_PREFIX_CHARS: usize = 100;

/// Text emitted so far, in emission order
#[derive(Debug, Default, Clone)]
struct Transcript {
    /// Every emitted unit's text
    all: String,
    all_units: usize,

    /// Only internal reasoning text
    thought: String,
    thought_units: usize,

    /// Only user-facing (non-thought) text
    answer: String,
    answer_units: usize,
}

/// Per-session set of emitted fingerprints plus the running transcript
#[derive(Debug, Clone)]
pub struct DeduplicationLedger {
    seen: HashSet<String>,
    prefix_chars: usize,
    resend_match: ResendMatch,
    transcript: Transcript,
}

impl DeduplicationLedger {
    pub fn new(prefix_chars: usize, resend_match: ResendMatch) -> Self {
        Self {
            seen: HashSet::new(),
            prefix_chars,
            resend_match,
            transcript: Transcript::default(),
        }
    }

    /// Deduplication key for a unit.
    ///
    /// Combines the thought flag, tool activity, the text length and a
    /// bounded text prefix. Tool activity includes the call name and id so
    /// that distinct text-less calls do not collide.
    pub fn fingerprint(&self, unit: &ContentUnit) -> String {
        let prefix: String = unit.text.chars().take(self.prefix_chars).collect();
        let tool = match (&unit.function_call, &unit.function_response) {
            (Some(call), _) => format!("call:{}:{}", call.name, call.id.as_deref().unwrap_or("")),
            (None, Some(response)) => format!(
                "response:{}:{}",
                response.name,
                response.id.as_deref().unwrap_or("")
            ),
            (None, None) => String::new(),
        };

        format!("{}|{}|{}|{}", unit.thought, tool, unit.text.len(), prefix)
    }

    /// Check-and-record: `true` the first time a fingerprint is offered.
    ///
    /// Admitted units are appended to the transcript.
    pub fn should_emit(&mut self, unit: &ContentUnit) -> bool {
        if !self.seen.insert(self.fingerprint(unit)) {
            return false;
        }

        self.transcript.all.push_str(&unit.text);
        self.transcript.all_units += 1;
        if unit.thought {
            self.transcript.thought.push_str(&unit.text);
            self.transcript.thought_units += 1;
        } else {
            self.transcript.answer.push_str(&unit.text);
            self.transcript.answer_units += 1;
        }
        true
    }

    /// Whether `unit` is the upstream resending everything emitted so far.
    ///
    /// Matches against the concatenation of all units, or of the units of
    /// the same kind: a thought resend against the thought text, an answer
    /// resend against the answer text. The latter covers a final event that
    /// splits the resend into one thought part and one answer part. A
    /// transcript built from a single unit never matches: an identical
    /// repeat of one unit is an ordinary duplicate.
    pub fn is_termination_resend(&self, unit: &ContentUnit) -> bool {
        if unit.text.is_empty() {
            return false;
        }

        let t = &self.transcript;
        let (same_kind, same_kind_units) = if unit.thought {
            (&t.thought, t.thought_units)
        } else {
            (&t.answer, t.answer_units)
        };

        (t.all_units >= 2 && self.matches(&unit.text, &t.all))
            || (same_kind_units >= 2 && self.matches(&unit.text, same_kind))
    }

    fn matches(&self, candidate: &str, accumulated: &str) -> bool {
        match self.resend_match {
            ResendMatch::Exact => candidate == accumulated,
            ResendMatch::Trimmed => candidate.trim() == accumulated.trim(),
        }
    }

    /// Concatenated user-facing text emitted so far
    pub fn answer_text(&self) -> &str {
        &self.transcript.answer
    }

    /// Number of distinct units admitted
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DeduplicationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX_CHARS, ResendMatch::default())
    }
}
