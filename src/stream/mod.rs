//! Structured agent output.
//!
//! The agent writes one JSON record per line. The `parser` submodule turns
//! those lines into [`StreamEvent`]s and accumulates the final
//! [`AgentResponse`].

pub mod parser;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{AppError, Result};

pub use parser::StreamParser;

/// Token and cost usage reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// Cost in USD, when the agent reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl Usage {
    /// Add `other` into `self`.
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        if let Some(cost) = other.cost_usd {
            self.cost_usd = Some(self.cost_usd.unwrap_or(0.0) + cost);
        }
    }

    /// Total tokens in both directions.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A tool call announced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    /// Tool name.
    pub name: String,
    /// Tool arguments as a JSON object.
    pub arguments: Map<String, Value>,
}

/// One discrete unit of the agent's incremental output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of response text.
    PartialContent {
        /// The fragment, exactly as emitted.
        text: String,
    },
    /// The agent invoked a tool.
    ToolInvocation(ToolInvocation),
    /// The agent finished.
    Completion {
        /// Always true for a completion emitted by the parser.
        terminal: bool,
        /// Usage aggregated over the whole stream.
        usage: Usage,
    },
    /// The agent reported an error, or a line could not be decoded.
    Error {
        /// Human-readable description.
        message: String,
        /// The offending line when `decode_failure` is set.
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_line: Option<String>,
        /// True when the line was malformed; such errors do not end the stream.
        decode_failure: bool,
    },
}

impl StreamEvent {
    /// Whether this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completion { .. } => true,
            Self::Error { decode_failure, .. } => !decode_failure,
            Self::PartialContent { .. } | Self::ToolInvocation(_) => false,
        }
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// A completion record was received.
    Completed,
    /// The agent reported an error.
    Failed(String),
    /// No terminal record was seen.
    Incomplete,
}

/// Everything the parser accumulated over one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    /// Concatenated partial content.
    pub content: String,
    /// Tool invocations in emission order.
    pub tool_calls: Vec<ToolInvocation>,
    /// Aggregated usage.
    pub usage: Usage,
    /// Terminal state.
    pub outcome: ResponseOutcome,
    /// Number of lines that failed to decode.
    pub decode_failures: u32,
}

impl AgentResponse {
    /// Whether the stream ended with a completion.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome == ResponseOutcome::Completed
    }

    /// Pass a completed response through; anything else becomes an error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::AgentFailed`] carrying the failure message, or a
    /// note that no terminal record arrived.
    pub fn into_completed(self) -> Result<Self> {
        match &self.outcome {
            ResponseOutcome::Completed => Ok(self),
            ResponseOutcome::Failed(message) => Err(AppError::AgentFailed(message.clone())),
            ResponseOutcome::Incomplete => Err(AppError::AgentFailed(
                "stream ended without terminal event".into(),
            )),
        }
    }
}
