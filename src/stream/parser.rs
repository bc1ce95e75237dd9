//! Incremental response stream parser.
//!
//! A pure state machine: feed it one stdout line at a time and it returns
//! at most one [`StreamEvent`] per line. It performs no I/O.
//!
//! # Record types
//!
//! | `type`               | Maps to                                   |
//! |----------------------|-------------------------------------------|
//! | `delta`, `text`      | [`StreamEvent::PartialContent`]           |
//! | `tool_use`           | [`StreamEvent::ToolInvocation`]           |
//! | `stop`, `result`     | [`StreamEvent::Completion`] (terminal)    |
//! | `error`              | [`StreamEvent::Error`] (terminal)         |
//! | *(any other)*        | Skipped; logged at `DEBUG`                |
//!
//! Any record may carry a `usage` object; usage is summed across the stream
//! and reported on the completion event.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{AgentResponse, ResponseOutcome, StreamEvent, ToolInvocation, Usage};

// ── Wire records ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cost_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DeltaFields {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ToolUseFields {
    name: String,
    #[serde(default, alias = "input")]
    arguments: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultFields {
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ErrorFields {
    message: String,
}

impl From<WireUsage> for Usage {
    fn from(wire: WireUsage) -> Self {
        Self {
            input_tokens: wire.input_tokens,
            output_tokens: wire.output_tokens,
            cost_usd: wire.cost_usd,
        }
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

/// Per-stream parser state.
#[derive(Debug, Default)]
pub struct StreamParser {
    closed: bool,
    content: String,
    tool_calls: Vec<ToolInvocation>,
    usage: Usage,
    outcome: Option<ResponseOutcome>,
    decode_failures: u32,
    ignored_after_close: u32,
}

impl StreamParser {
    /// Create a parser for a fresh stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has been emitted.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Content accumulated so far.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Usage aggregated so far.
    #[must_use]
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Decode one line of agent output.
    ///
    /// Returns `None` for blank lines, unknown record types, and any line
    /// arriving after the terminal event (logged as a protocol violation).
    /// Malformed lines produce a non-terminal [`StreamEvent::Error`] with
    /// `decode_failure` set.
    pub fn feed(&mut self, line: &str) -> Option<StreamEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if self.closed {
            self.ignored_after_close += 1;
            warn!(
                ignored = self.ignored_after_close,
                "stream parser: line received after terminal event, ignoring"
            );
            return None;
        }

        let envelope: Envelope = match serde_json::from_str(trimmed) {
            Ok(envelope) => envelope,
            Err(err) => return Some(self.decode_failure(trimmed, &format!("malformed json: {err}"))),
        };

        // Usage counts only once the record itself decodes.
        let usage = envelope.usage.map(Usage::from);
        match envelope.kind.as_str() {
            "delta" | "text" => self.on_delta(trimmed, envelope.fields, usage),
            "tool_use" => self.on_tool_use(trimmed, envelope.fields, usage),
            "stop" => {
                self.add_usage(usage);
                Some(self.complete())
            }
            "result" => self.on_result(trimmed, envelope.fields, usage),
            "error" => self.on_error(trimmed, envelope.fields, usage),
            other => {
                self.add_usage(usage);
                debug!(record_type = other, "stream parser: skipping unknown record type");
                None
            }
        }
    }

    /// Signal end of input.
    ///
    /// If no terminal event was emitted, emits a terminal
    /// [`StreamEvent::Error`] so every stream ends with exactly one terminal
    /// event. Returns `None` when the stream is already closed.
    pub fn close(&mut self) -> Option<StreamEvent> {
        self.abort("stream ended without terminal event")
    }

    /// End the stream with an error, unless it is already closed.
    pub fn abort(&mut self, message: impl Into<String>) -> Option<StreamEvent> {
        if self.closed {
            return None;
        }
        let message = message.into();
        debug!(reason = %message, "stream parser: closing without terminal record");
        Some(self.fail(message))
    }

    /// Consume the parser and build the accumulated response.
    #[must_use]
    pub fn into_response(self) -> AgentResponse {
        AgentResponse {
            content: self.content,
            tool_calls: self.tool_calls,
            usage: self.usage,
            outcome: self.outcome.unwrap_or(ResponseOutcome::Incomplete),
            decode_failures: self.decode_failures,
        }
    }

    fn add_usage(&mut self, usage: Option<Usage>) {
        if let Some(usage) = usage {
            self.usage.accumulate(&usage);
        }
    }

    fn on_delta(
        &mut self,
        raw: &str,
        fields: Map<String, Value>,
        usage: Option<Usage>,
    ) -> Option<StreamEvent> {
        match serde_json::from_value::<DeltaFields>(Value::Object(fields)) {
            Ok(delta) => {
                self.add_usage(usage);
                self.content.push_str(&delta.text);
                Some(StreamEvent::PartialContent { text: delta.text })
            }
            Err(err) => Some(self.decode_failure(raw, &format!("invalid delta record: {err}"))),
        }
    }

    fn on_tool_use(
        &mut self,
        raw: &str,
        fields: Map<String, Value>,
        usage: Option<Usage>,
    ) -> Option<StreamEvent> {
        match serde_json::from_value::<ToolUseFields>(Value::Object(fields)) {
            Ok(tool) => {
                self.add_usage(usage);
                let invocation = ToolInvocation {
                    name: tool.name,
                    arguments: tool.arguments,
                };
                self.tool_calls.push(invocation.clone());
                Some(StreamEvent::ToolInvocation(invocation))
            }
            Err(err) => Some(self.decode_failure(raw, &format!("invalid tool_use record: {err}"))),
        }
    }

    fn on_result(
        &mut self,
        raw: &str,
        fields: Map<String, Value>,
        usage: Option<Usage>,
    ) -> Option<StreamEvent> {
        let result = match serde_json::from_value::<ResultFields>(Value::Object(fields)) {
            Ok(result) => result,
            Err(err) => {
                return Some(self.decode_failure(raw, &format!("invalid result record: {err}")))
            }
        };

        self.add_usage(usage);
        if let Some(total) = result.total_cost_usd {
            self.usage.cost_usd = Some(total);
        }

        if result.is_error {
            let message = result
                .result
                .unwrap_or_else(|| "agent reported an error".to_owned());
            return Some(self.fail(message));
        }

        // Agents that only report the final text in the result record.
        if self.content.is_empty() {
            if let Some(text) = result.result {
                self.content = text;
            }
        }

        Some(self.complete())
    }

    fn on_error(
        &mut self,
        raw: &str,
        fields: Map<String, Value>,
        usage: Option<Usage>,
    ) -> Option<StreamEvent> {
        match serde_json::from_value::<ErrorFields>(Value::Object(fields)) {
            Ok(error) => {
                self.add_usage(usage);
                Some(self.fail(error.message))
            }
            Err(err) => Some(self.decode_failure(raw, &format!("invalid error record: {err}"))),
        }
    }

    fn complete(&mut self) -> StreamEvent {
        self.closed = true;
        self.outcome = Some(ResponseOutcome::Completed);
        StreamEvent::Completion {
            terminal: true,
            usage: self.usage.clone(),
        }
    }

    fn fail(&mut self, message: String) -> StreamEvent {
        self.closed = true;
        self.outcome = Some(ResponseOutcome::Failed(message.clone()));
        StreamEvent::Error {
            message,
            raw_line: None,
            decode_failure: false,
        }
    }

    fn decode_failure(&mut self, raw: &str, message: &str) -> StreamEvent {
        self.decode_failures += 1;
        warn!(error = message, raw_line = raw, "stream parser: undecodable line");
        StreamEvent::Error {
            message: message.to_owned(),
            raw_line: Some(raw.to_owned()),
            decode_failure: true,
        }
    }
}
