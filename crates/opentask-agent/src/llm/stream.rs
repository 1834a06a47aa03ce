//! Stream sink for incremental reply delivery.
//!
//! Providers push typed chunks (answer text vs separately-reported
//! "thinking" text) into a [`StreamSink`] as they arrive.  The sink
//! assembles complete lines, broadcasts them on the event bus as
//! `response_stream` events with protocol marker lines filtered out (so
//! intermediate UI never sees `<!-- Block-... -->` bytes), and retains the
//! full unfiltered text for the final message.

use serde_json::json;

use opentask_kernel::{EventBus, events};

/// Marker prefixes stripped from streamed UI output.
const MARKER_PREFIXES: [&str; 2] = ["<!-- Block-", "<!-- Cmd-"];

// ---------------------------------------------------------------------------
// Line assembly
// ---------------------------------------------------------------------------

/// Accumulates chunked text and yields complete lines.
#[derive(Debug, Default)]
struct LineReceiver {
    lines: Vec<String>,
    buffer: String,
}

impl LineReceiver {
    /// Feed a chunk; returns the lines completed by it.
    fn feed(&mut self, data: &str) -> Vec<String> {
        self.buffer.push_str(data);
        let mut new_lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').to_owned();
            self.lines.push(line.clone());
            new_lines.push(line);
        }
        new_lines
    }

    /// Flush a trailing partial line, if any.
    fn done(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        self.lines.push(line.clone());
        Some(line)
    }

    fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.buffer.is_empty()
    }

    fn content(&self) -> String {
        self.lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// StreamSink
// ---------------------------------------------------------------------------

/// Receives provider chunks and fans filtered lines out on the bus.
pub struct StreamSink {
    llm_name: String,
    bus: EventBus,
    content: LineReceiver,
    reason: LineReceiver,
}

impl StreamSink {
    pub fn new(llm_name: impl Into<String>, bus: EventBus) -> Self {
        Self {
            llm_name: llm_name.into(),
            bus,
            content: LineReceiver::default(),
            reason: LineReceiver::default(),
        }
    }

    /// Push one chunk; `reason` marks separately-reported thinking text.
    pub fn push(&mut self, chunk: &str, reason: bool) {
        if chunk.is_empty() {
            return;
        }

        // First answer chunk after thinking: flush the dangling reason line
        // so the divider lands in the right place.
        if !reason && self.content.is_empty() && !self.reason.is_empty() {
            if let Some(line) = self.reason.done() {
                self.emit(&format!("{line}\n\n----\n\n"), true);
            }
        }

        let receiver = if reason {
            &mut self.reason
        } else {
            &mut self.content
        };
        let lines = receiver.feed(chunk);
        if lines.is_empty() {
            return;
        }

        let visible: Vec<String> = lines
            .into_iter()
            .filter(|line| !MARKER_PREFIXES.iter().any(|p| line.starts_with(p)))
            .collect();
        if !visible.is_empty() {
            self.emit(&visible.join("\n"), reason);
        }
    }

    /// Flush trailing partial lines once the provider stream ends.
    pub fn finish(&mut self) {
        if !self.reason.buffer.is_empty() {
            let line = self.reason.done().unwrap_or_default();
            if !MARKER_PREFIXES.iter().any(|p| line.starts_with(p)) {
                self.emit(&line, true);
            }
        }
        if !self.content.buffer.is_empty() {
            let line = self.content.done().unwrap_or_default();
            if !MARKER_PREFIXES.iter().any(|p| line.starts_with(p)) {
                self.emit(&line, false);
            }
        }
    }

    /// The full answer text, markers included.
    pub fn content(&self) -> String {
        self.content.content()
    }

    /// The full thinking text, when any arrived.
    pub fn reason(&self) -> Option<String> {
        if self.reason.is_empty() {
            None
        } else {
            Some(self.reason.content())
        }
    }

    fn emit(&self, content: &str, reason: bool) {
        self.bus.broadcast(
            events::RESPONSE_STREAM,
            json!({"llm": self.llm_name, "content": content, "reason": reason}),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::Value;

    use super::*;

    fn sink_with_capture() -> (StreamSink, Arc<Mutex<Vec<Value>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        bus.register(events::RESPONSE_STREAM, move |data| {
            captured.lock().unwrap().push(data.clone());
            None
        });
        (StreamSink::new("test-llm", bus), seen)
    }

    #[test]
    fn assembles_lines_across_chunk_boundaries() {
        let (mut sink, seen) = sink_with_capture();
        sink.push("hel", false);
        sink.push("lo\nwor", false);
        sink.push("ld", false);
        sink.finish();

        assert_eq!(sink.content(), "hello\nworld");
        let events: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| e["content"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(events, vec!["hello", "world"]);
    }

    #[test]
    fn marker_lines_are_filtered_from_events_but_kept_in_content() {
        let (mut sink, seen) = sink_with_capture();
        sink.push("before\n", false);
        sink.push("<!-- Block-Start: {\"id\":\"b1\"} -->\n", false);
        sink.push("print(1)\n", false);
        sink.push("<!-- Cmd-Exec: {\"id\":\"b1\"} -->\n", false);

        let streamed: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| e["content"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(streamed, vec!["before", "print(1)"]);

        // Full content keeps the protocol bytes for the parser.
        assert!(sink.content().contains("<!-- Block-Start"));
        assert!(sink.content().contains("<!-- Cmd-Exec"));
    }

    #[test]
    fn reason_chunks_are_tagged() {
        let (mut sink, seen) = sink_with_capture();
        sink.push("thinking about it\n", true);
        sink.push("the answer\n", false);

        let events = seen.lock().unwrap();
        assert_eq!(events[0]["reason"], true);
        let last = events.last().unwrap();
        assert_eq!(last["reason"], false);
        assert_eq!(last["content"], "the answer");

        assert_eq!(sink.reason().unwrap(), "thinking about it");
        assert_eq!(sink.content(), "the answer");
    }

    #[test]
    fn finish_flushes_partial_line() {
        let (mut sink, seen) = sink_with_capture();
        sink.push("no trailing newline", false);
        assert!(seen.lock().unwrap().is_empty());

        sink.finish();
        assert_eq!(sink.content(), "no trailing newline");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
