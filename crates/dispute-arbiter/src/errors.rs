//! Arbitration error taxonomy.
//!
//! Every failure in a run is represented here. Nothing is retried: each
//! variant aborts the whole run and is returned to the caller. Callers can
//! query `kind()` to tell failure classes apart without string matching.
//!
//! ## Kinds
//!
//! | Kind        | Raised by                                       |
//! |-------------|-------------------------------------------------|
//! | Transport   | LLM endpoint (network, auth, HTTP status)       |
//! | Extraction  | Final arbiter reply without a usable function call |
//! | Decode      | Result validator (terminal message not JSON)    |
//! | Schema      | Arbiter and validator (payload fails the schema) |
//! | Setup       | Config, prompts, graph definition, inputs       |
//! | Internal    | A node task panicked                            |

use std::fmt;

use thiserror::Error;

use crate::graph::GraphError;
use crate::llm::LlmError;
use crate::prompts::PromptError;

/// Coarse classification of an [`ArbiterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Extraction,
    Decode,
    Schema,
    Setup,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Extraction => write!(f, "extraction"),
            Self::Decode => write!(f, "decode"),
            Self::Schema => write!(f, "schema"),
            Self::Setup => write!(f, "setup"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Unified error type for a dispute arbitration run.
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// The LLM endpoint could not be reached or rejected the request.
    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),

    /// The final arbiter reply carried no usable function-call payload.
    #[error("failed to parse final arbiter response: {0}")]
    MalformedFunctionCall(String),

    /// The terminal message is not JSON.
    #[error("output is not valid JSON: {0}")]
    InvalidJson(String),

    /// The payload does not satisfy the `ArgumentResult` schema.
    #[error("invalid output format: {0}")]
    Schema(String),

    /// The run produced no terminal message to validate.
    #[error("run finished without a terminal message")]
    EmptyHistory,

    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Participants rejected before any LLM call was made.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A node task panicked instead of returning.
    #[error("node '{node}' panicked: {detail}")]
    NodePanicked { node: String, detail: String },

    /// The blocking entry point could not start an async runtime.
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The blocking entry point was called from inside an async runtime.
    #[error("blocking entry point called from inside an async runtime; use `judge` instead")]
    NestedRuntime,
}

impl ArbiterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Llm(_) => ErrorKind::Transport,
            Self::MalformedFunctionCall(_) => ErrorKind::Extraction,
            Self::InvalidJson(_) | Self::EmptyHistory => ErrorKind::Decode,
            Self::Schema(_) => ErrorKind::Schema,
            Self::Prompt(_)
            | Self::Graph(_)
            | Self::InvalidInput(_)
            | Self::Configuration(_)
            | Self::Runtime(_)
            | Self::NestedRuntime => ErrorKind::Setup,
            Self::NodePanicked { .. } => ErrorKind::Internal,
        }
    }

    /// `true` for failures caused by what the model returned rather than by
    /// transport or local setup.
    pub fn is_model_output_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Extraction | ErrorKind::Decode | ErrorKind::Schema
        )
    }
}
