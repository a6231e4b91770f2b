//! Judge-panel dispute arbitration.
//!
//! A two-person conversation is routed through a distributor, fanned out to
//! four independent judges (logic, tone, message count, personal attacks),
//! and fanned back in to a final arbiter that must answer through a forced
//! function call. The result validator re-parses the arbiter's output into an
//! [`ArgumentResult`] before it reaches the caller.
//!
//! ```no_run
//! use dispute_arbiter::{result, ArbiterConfig, Participant};
//!
//! let config = ArbiterConfig::from_env();
//! let verdict = result(
//!     &config,
//!     &Participant::new("Maya", "Feels unappreciated"),
//!     &Participant::new("Arjun", "Works nights"),
//!     "Maya: You forgot again.\nArjun: I was at work.",
//! )?;
//! println!("{} won", verdict.winner);
//! # Ok::<(), dispute_arbiter::ArbiterError>(())
//! ```

pub mod config;
pub mod errors;
pub mod graph;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod state;
pub mod verdict;

pub use config::{ArbiterConfig, LlmConfig, TraceConfig};
pub use errors::{ArbiterError, ErrorKind};
pub use llm::{ChatModel, ChatReply, ChatRequest, LlmError, Message, OpenAiChat, Role};
pub use pipeline::{result, ArbitrationOutcome, DisputeArbiter, JudgeKind};
pub use prompts::{PromptSource, PROMPT_VERSION};
pub use state::{RunPhase, RunTrace};
pub use verdict::{ArgumentResult, DisputeRequest, Participant, VERDICT_FUNCTION_NAME};
