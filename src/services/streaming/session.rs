//! Per-connection stream session
//!
//! Owns the buffer, cursors and ledger for one upstream response. All work
//! here is synchronous: [`StreamSession::ingest`] appends a chunk and returns
//! every event that became available, in buffer order. The controller
//! decides when to read and how to write.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::StreamSettings,
    error::Result,
    messages::{ContentUnit, Envelope},
};

use super::{
    accumulator::ByteAccumulator,
    interpreter::{parts_of, FragmentInterpreter, Interpretation},
    ledger::DeduplicationLedger,
    scanner::{self, FrameStatus, FrameTracker, PartsCursor, ScanOutcome, TopLevel},
};

/// Consumed bytes are dropped from the buffer once the cursor passes this
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Something to send downstream
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Unit(ContentUnit),
    Envelope(Envelope),
}

/// Why the upstream was considered finished before EOF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// `[DONE]` between top-level objects
    DoneMarker,

    /// The whole answer was sent again as one unit
    Resend,
}

/// Counters reported when the session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub units_emitted: usize,
    pub envelopes_emitted: usize,
    pub duplicates_skipped: usize,
    pub malformed_spans: usize,
}

/// A top-level object still being received
#[derive(Debug)]
struct OpenFrame {
    /// Offset of the opening brace in the buffer
    start: usize,
    tracker: FrameTracker,
    parts: PartsCursor,

    /// An `author` preceded the parts array
    author_known: bool,

    /// Units waiting for the frame's trailing `author`
    held: Vec<ContentUnit>,
}

impl OpenFrame {
    fn new(start: usize) -> Self {
        Self {
            start,
            tracker: FrameTracker::new(start),
            parts: PartsCursor::new(),
            author_known: false,
            held: Vec::new(),
        }
    }
}

/// State for one in-flight upstream response
#[derive(Debug)]
pub struct StreamSession {
    id: Uuid,
    buffer: ByteAccumulator,

    /// Top-level position; everything before it has been handled
    cursor: usize,
    frame: Option<OpenFrame>,

    interpreter: FragmentInterpreter,
    ledger: DeduplicationLedger,
    current_author: String,
    last_envelope: Option<Envelope>,

    /// Hold a frame's units until its author is known
    hold_for_author: bool,

    /// No further units may be emitted
    finalized: bool,
    tail_flushed: bool,
    termination: Option<Termination>,
    stats: SessionStats,
}

impl StreamSession {
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            buffer: ByteAccumulator::new(),
            cursor: 0,
            frame: None,
            interpreter: FragmentInterpreter::new(settings.forward_tool_activity),
            ledger: DeduplicationLedger::new(
                settings.fingerprint_prefix_chars,
                settings.resend_match,
            ),
            current_author: settings.default_author.clone(),
            last_envelope: None,
            hold_for_author: settings.hold_for_author,
            finalized: false,
            tail_flushed: false,
            termination: None,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Append an upstream chunk and collect everything it completed
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<SessionEvent> {
        self.buffer.append(chunk);
        let mut out = Vec::new();
        self.scan(&mut out);
        out
    }

    /// Handle whatever is left in the buffer and close the session.
    ///
    /// An unfinished frame is repaired and parsed best-effort. Calling this
    /// more than once returns nothing after the first call.
    pub fn finalize(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        if self.tail_flushed {
            return out;
        }
        self.tail_flushed = true;

        self.buffer.flush_pending();
        self.scan(&mut out);

        if let Some(frame) = self.frame.take() {
            match scanner::parse_truncated(self.buffer.suffix_from(frame.start)) {
                Some(value) => {
                    debug!(session = %self.id, "recovered truncated event at end of stream");
                    if !frame.held.is_empty() {
                        if let Some(author) = value.get("author").and_then(Value::as_str) {
                            author.clone_into(&mut self.current_author);
                        }
                    }
                    self.salvage(value, &mut out);
                }
                None => {
                    warn!(session = %self.id, "discarding unparseable tail at end of stream");
                    self.stats.malformed_spans += 1;
                    self.release(frame.held, &mut out);
                }
            }
        }

        self.finalized = true;
        info!(
            session = %self.id,
            units = self.stats.units_emitted,
            envelopes = self.stats.envelopes_emitted,
            malformed = self.stats.malformed_spans,
            "session finalized"
        );
        out
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// A termination signal arrived and its event has been fully handled
    pub fn should_stop(&self) -> bool {
        self.termination.is_some() && self.frame.is_none()
    }

    /// The authoritative answer: all user-facing text emitted so far
    pub fn final_text(&self) -> &str {
        self.ledger.answer_text()
    }

    pub fn current_author(&self) -> &str {
        &self.current_author
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Stream offset up to which input has been fully handled
    pub fn scan_cursor(&self) -> usize {
        self.buffer.discarded() + self.cursor
    }

    fn scan(&mut self, out: &mut Vec<SessionEvent>) {
        loop {
            let Some(mut frame) = self.frame.take() else {
                if self.termination.is_some() {
                    return;
                }
                match scanner::find_top_level(self.buffer.as_str(), self.cursor) {
                    TopLevel::Object(start) => {
                        self.cursor = start;
                        self.frame = Some(OpenFrame::new(start));
                        continue;
                    }
                    TopLevel::Done { next } => {
                        info!(session = %self.id, "upstream end marker received");
                        self.cursor = next;
                        self.terminate(Termination::DoneMarker);
                        return;
                    }
                    TopLevel::Pending { safe } => {
                        self.cursor = safe;
                        self.compact();
                        return;
                    }
                }
            };

            let status = frame.tracker.advance(self.buffer.as_str());
            let limit = match status {
                FrameStatus::Complete(end) | FrameStatus::Broken(end) => end,
                FrameStatus::Pending => self.buffer.len(),
            };
            self.drain_parts(&mut frame, limit, out);

            match status {
                FrameStatus::Pending => {
                    self.frame = Some(frame);
                    return;
                }
                FrameStatus::Complete(end) => {
                    self.close_frame(frame, end, out);
                    self.cursor = end;
                }
                FrameStatus::Broken(resume) => {
                    warn!(
                        session = %self.id,
                        offset = self.buffer.discarded() + frame.start,
                        "abandoning event with a raw newline inside a string"
                    );
                    self.stats.malformed_spans += 1;
                    self.release(frame.held, out);
                    self.cursor = resume;
                }
            }
            self.compact();
        }
    }

    /// Extract every complete part of `frame` that lies before `limit`
    fn drain_parts(&mut self, frame: &mut OpenFrame, limit: usize, out: &mut Vec<SessionEvent>) {
        while !frame.parts.is_done() {
            let parsed = {
                let region = &self.buffer.as_str()[frame.start..limit];
                let had_array = frame.parts.array_start().is_some();
                let outcome = frame.parts.find_next_complete_object(region);

                if !had_array {
                    if let Some(array_start) = frame.parts.array_start() {
                        let head = &region[..array_start];
                        if let Some(author) = scanner::peek_string_field(head, "author") {
                            self.current_author = author;
                            frame.author_known = true;
                        }
                    }
                }

                match outcome {
                    ScanOutcome::Complete(span) => self.interpreter.interpret(&region[span]),
                    ScanOutcome::Exhausted { .. } | ScanOutcome::Incomplete => return,
                }
            };

            match parsed {
                Ok(Interpretation::Unit(unit)) if self.hold_for_author && !frame.author_known => {
                    frame.held.push(unit);
                }
                other => self.admit_part(other, out),
            }
        }
    }

    /// Admit units that were waiting for their frame to close
    fn release(&mut self, held: Vec<ContentUnit>, out: &mut Vec<SessionEvent>) {
        for unit in held {
            self.admit_unit(unit, out);
        }
    }

    fn admit_part(&mut self, parsed: Result<Interpretation>, out: &mut Vec<SessionEvent>) {
        match parsed {
            Ok(Interpretation::Unit(unit)) => self.admit_unit(unit, out),
            Ok(_) => debug!(session = %self.id, "part carries no usable text"),
            Err(e) => {
                warn!(session = %self.id, error = %e, "discarding malformed part");
                self.stats.malformed_spans += 1;
            }
        }
    }

    fn admit_unit(&mut self, mut unit: ContentUnit, out: &mut Vec<SessionEvent>) {
        if self.finalized {
            debug!(session = %self.id, "unit after finalize suppressed");
            return;
        }
        unit.author.clone_from(&self.current_author);

        if self.ledger.is_termination_resend(&unit) {
            info!(
                session = %self.id,
                chars = unit.text.len(),
                "upstream resent the accumulated answer"
            );
            self.terminate(Termination::Resend);
            return;
        }

        if !self.ledger.should_emit(&unit) {
            debug!(session = %self.id, chars = unit.text.len(), "duplicate unit skipped");
            self.stats.duplicates_skipped += 1;
            return;
        }

        debug!(
            session = %self.id,
            thought = unit.thought,
            chars = unit.text.len(),
            "unit ready"
        );
        self.stats.units_emitted += 1;
        out.push(SessionEvent::Unit(unit));
    }

    fn close_frame(&mut self, frame: OpenFrame, end: usize, out: &mut Vec<SessionEvent>) {
        let parsed = self
            .interpreter
            .interpret(&self.buffer.as_str()[frame.start..end]);

        match parsed {
            // Flat framing: the event is itself a part
            Ok(Interpretation::Unit(unit)) => self.admit_unit(unit, out),
            Ok(Interpretation::Envelope(envelope)) => {
                if let Some(author) = envelope.author() {
                    author.clone_into(&mut self.current_author);
                }
                self.release(frame.held, out);
                self.accept_envelope(envelope, out);
            }
            Ok(Interpretation::Ignored) => self.release(frame.held, out),
            Err(e) => {
                warn!(session = %self.id, error = %e, "discarding malformed event");
                self.stats.malformed_spans += 1;
                self.release(frame.held, out);
            }
        }
    }

    fn accept_envelope(&mut self, envelope: Envelope, out: &mut Vec<SessionEvent>) {
        if let Some(author) = envelope.author() {
            author.clone_into(&mut self.current_author);
        }

        let Some(forward) = envelope.supplementary() else {
            return;
        };
        if self.last_envelope.as_ref() == Some(&forward) {
            debug!(session = %self.id, "unchanged envelope skipped");
            return;
        }

        self.last_envelope = Some(forward.clone());
        self.stats.envelopes_emitted += 1;
        out.push(SessionEvent::Envelope(forward));
    }

    /// Handle an event recovered from a truncated tail
    fn salvage(&mut self, value: Value, out: &mut Vec<SessionEvent>) {
        let units: Vec<ContentUnit> = parts_of(&value)
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|part| self.interpreter.unit_from_part(part))
            .collect();

        if units.is_empty() {
            match self.interpreter.classify(value) {
                Interpretation::Unit(unit) => self.admit_unit(unit, out),
                Interpretation::Envelope(envelope) => self.accept_envelope(envelope, out),
                Interpretation::Ignored => {}
            }
            return;
        }

        for unit in units {
            self.admit_unit(unit, out);
        }
        if let Value::Object(map) = value {
            self.accept_envelope(Envelope::from_map(map), out);
        }
    }

    fn terminate(&mut self, cause: Termination) {
        if self.termination.is_none() {
            self.termination = Some(cause);
        }
        self.finalized = true;
    }

    fn compact(&mut self) {
        if self.frame.is_none() && self.cursor >= COMPACT_THRESHOLD {
            let dropped = self.buffer.compact(self.cursor);
            self.cursor -= dropped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session() -> StreamSession {
        StreamSession::new(&StreamSettings::default())
    }

    fn texts(events: &[SessionEvent]) -> Vec<(String, bool)> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Unit(unit) => Some((unit.text.clone(), unit.thought)),
                SessionEvent::Envelope(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_ndjson_units_and_done_marker() {
        let mut session = session();
        let mut events = session.ingest(
            b"{\"content\":{\"parts\":[{\"thought\":true,\"text\":\"thinking\"}]}}\n",
        );
        events.extend(session.ingest(b"{\"content\":{\"parts\":[{\"text\":\"answer\"}]}}\n"));
        events.extend(session.ingest(b"[DONE]"));

        assert_eq!(
            texts(&events),
            vec![("thinking".to_string(), true), ("answer".to_string(), false)]
        );
        assert_eq!(session.termination(), Some(Termination::DoneMarker));
        assert!(session.should_stop());
        assert!(session.is_finalized());
    }

    #[test]
    fn test_units_emitted_before_the_event_closes() {
        let mut session = session();
        let events = session.ingest(br#"{"content":{"parts":[{"text":"early"},{"text":"la"#);
        assert_eq!(texts(&events), vec![("early".to_string(), false)]);

        let events = session.ingest(br#"te"}]},"author":"planner"}"#);
        assert_eq!(texts(&events), vec![("late".to_string(), false)]);
        assert_eq!(session.current_author(), "planner");
    }

    #[test]
    fn test_author_preceding_parts_applies_to_units() {
        let mut session = session();
        let events = session.ingest(br#"{"author":"researcher","content":{"parts":[{"text":"x"}"#);

        let SessionEvent::Unit(unit) = &events[0] else {
            panic!("expected a unit");
        };
        assert_eq!(unit.author, "researcher");
    }

    #[test]
    fn test_default_author() {
        let mut session = session();
        let events = session.ingest(br#"{"content":{"parts":[{"text":"x"}]}}"#);
        let SessionEvent::Unit(unit) = &events[0] else {
            panic!("expected a unit");
        };
        assert_eq!(unit.author, "astra");
    }

    #[test]
    fn test_termination_resend_is_swallowed() {
        let mut session = session();
        let mut events = Vec::new();
        for line in [
            r#"{"content":{"parts":[{"thought":true,"text":"thinking"}]}}"#,
            r#"{"content":{"parts":[{"text":"answer"}]}}"#,
            r#"{"content":{"parts":[{"text":"thinkinganswer"}]},"usage_metadata":{"total":9}}"#,
            r#"{"content":{"parts":[{"text":"ignored"}]}}"#,
        ] {
            events.extend(session.ingest(format!("{line}\n").as_bytes()));
        }

        assert_eq!(
            texts(&events),
            vec![("thinking".to_string(), true), ("answer".to_string(), false)]
        );
        assert_eq!(session.termination(), Some(Termination::Resend));
        assert_eq!(session.final_text(), "answer");

        // The resend's own metadata still goes out
        assert!(matches!(events.last(), Some(SessionEvent::Envelope(_))));
    }

    #[test]
    fn test_malformed_part_does_not_stall() {
        let mut session = session();
        let events = session.ingest(
            br#"{"content":{"parts":[{"text":"a"},{"text": nope},{"text":"b"}]}}"#,
        );

        assert_eq!(
            texts(&events),
            vec![("a".to_string(), false), ("b".to_string(), false)]
        );
        assert!(session.stats().malformed_spans >= 1);
    }

    #[test]
    fn test_broken_line_resyncs() {
        let mut session = session();
        let events = session.ingest(
            b"{\"content\":{\"parts\":[{\"text\":\"cut off\n{\"content\":{\"parts\":[{\"text\":\"next\"}]}}\n",
        );

        assert_eq!(texts(&events), vec![("next".to_string(), false)]);
        assert_eq!(session.stats().malformed_spans, 1);
    }

    #[test]
    fn test_envelope_only_events_are_forwarded_once() {
        let mut session = session();
        let line = r#"{"invocation_id":"inv-1","actions":{},"author":"astra"}"#;
        let mut events = session.ingest(format!("{line}\n{line}\n").as_bytes());
        events.extend(session.ingest(br#"{"author":"astra","id":"no-extras"}"#));

        assert_eq!(events.len(), 1);
        let SessionEvent::Envelope(envelope) = &events[0] else {
            panic!("expected an envelope");
        };
        assert_eq!(envelope.fields()["invocation_id"], "inv-1");
    }

    #[test]
    fn test_flat_parts_and_array_framing() {
        let mut session = session();
        let events = session.ingest(br#"[{"text":"one"},{"text":"two"}]"#);
        assert_eq!(
            texts(&events),
            vec![("one".to_string(), false), ("two".to_string(), false)]
        );
    }

    #[test]
    fn test_finalize_repairs_truncated_tail() {
        let mut session = session();
        let events = session.ingest(br#"{"content":{"parts":[{"text":"done"},{"text":"half"#);
        assert_eq!(texts(&events), vec![("done".to_string(), false)]);

        let tail = session.finalize();
        assert_eq!(texts(&tail), vec![("half".to_string(), false)]);
        assert!(session.is_finalized());
        assert!(session.finalize().is_empty());
    }

    #[test]
    fn test_no_units_after_finalize() {
        let mut session = session();
        session.finalize();
        let events = session.ingest(br#"{"content":{"parts":[{"text":"late"}]}}"#);
        assert!(texts(&events).is_empty());
    }

    #[test]
    fn test_compaction_keeps_scanning() {
        let mut session = session();
        let line = format!(
            "{{\"content\":{{\"parts\":[{{\"text\":\"{}\"}}]}}}}\n",
            "x".repeat(1000)
        );
        let mut emitted = 0;
        for i in 0..100 {
            let unique = line.replacen("xxxx", &format!("{i:04}"), 1);
            emitted += session.ingest(unique.as_bytes()).len();
        }

        assert_eq!(emitted, 100);
        assert!(session.scan_cursor() > COMPACT_THRESHOLD);
        assert!(session.buffer.len() < COMPACT_THRESHOLD + line.len());
    }

    #[test]
    fn test_resend_of_thoughts_alone_keeps_the_answer() {
        let mut session = session();
        let mut events = Vec::new();
        for line in [
            r#"{"content":{"parts":[{"thought":true,"text":"th"}]}}"#,
            r#"{"content":{"parts":[{"thought":true,"text":"ink"}]}}"#,
            r#"{"content":{"parts":[{"text":"ans"}]}}"#,
            r#"{"content":{"parts":[{"text":"wer"}]}}"#,
            r#"{"content":{"parts":[{"thought":true,"text":"think"},{"text":"answer"}]}}"#,
        ] {
            events.extend(session.ingest(format!("{line}\n").as_bytes()));
        }

        assert_eq!(
            texts(&events),
            vec![
                ("th".to_string(), true),
                ("ink".to_string(), true),
                ("ans".to_string(), false),
                ("wer".to_string(), false),
            ]
        );
        assert_eq!(session.termination(), Some(Termination::Resend));
        assert_eq!(session.final_text(), "answer");
    }

    fn holding_session() -> StreamSession {
        StreamSession::new(&StreamSettings {
            hold_for_author: true,
            ..StreamSettings::default()
        })
    }

    fn authors(events: &[SessionEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Unit(unit) => Some((unit.text.clone(), unit.author.clone())),
                SessionEvent::Envelope(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_held_units_take_a_trailing_author() {
        let mut session = holding_session();
        let mut events = session.ingest(br#"{"content":{"parts":[{"text":"outline"}]},"author":"writer"}"#);
        events.extend(session.ingest(br#"{"content":{"parts":[{"text":"plan"}]}"#));
        assert_eq!(authors(&events), vec![("outline".to_string(), "writer".to_string())]);

        let events = session.ingest(br#","author":"section_planner"}"#);
        assert_eq!(
            authors(&events),
            vec![("plan".to_string(), "section_planner".to_string())]
        );
    }

    #[test]
    fn test_held_units_are_fragmentation_independent() {
        let body = concat!(
            r#"{"content":{"parts":[{"text":"a"},{"text":"b"}]},"author":"one"}"#,
            "\n",
            r#"{"author":"two","content":{"parts":[{"text":"c"}]}}"#,
            "\n",
            r#"{"content":{"parts":[{"text":"d"}]},"author":"three"}"#,
        );
        let expected = vec![
            ("a".to_string(), "one".to_string()),
            ("b".to_string(), "one".to_string()),
            ("c".to_string(), "two".to_string()),
            ("d".to_string(), "three".to_string()),
        ];

        for split in 1..body.len() {
            let mut session = holding_session();
            let mut events = session.ingest(&body.as_bytes()[..split]);
            events.extend(session.ingest(&body.as_bytes()[split..]));
            events.extend(session.finalize());
            assert_eq!(authors(&events), expected, "split at {split}");
        }
    }

    #[test]
    fn test_held_units_survive_a_truncated_tail() {
        let mut session = holding_session();
        let events = session.ingest(br#"{"content":{"parts":[{"text":"kept"}]},"author":"late","usage"#);
        assert!(events.is_empty());

        let tail = session.finalize();
        assert_eq!(authors(&tail), vec![("kept".to_string(), "late".to_string())]);
    }

    #[test]
    fn test_long_event_in_small_chunks() {
        let mut session = session();
        let padding = "p".repeat(20_000);
        let body = format!(
            r#"{{"id":"{padding}","content":{{"parts":[{{"text":"first"}},{{"text":"second"}}]}}}}"#
        );

        let mut events = Vec::new();
        for chunk in body.as_bytes().chunks(16) {
            events.extend(session.ingest(chunk));
        }

        assert_eq!(
            texts(&events),
            vec![("first".to_string(), false), ("second".to_string(), false)]
        );
        assert_eq!(session.scan_cursor(), body.len());
    }
}
