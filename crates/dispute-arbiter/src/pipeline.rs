//! Dispute arbitration pipeline: judge fan-out, arbiter fan-in.
//!
//! ```text
//! START → distributor ─┬─ logical_judge ─────────┐
//!                      ├─ tonal_judge ───────────┤
//!                      ├─ count_judge ───────────┼─ final_arbiter → END
//!                      └─ personal_attack_judge ─┘
//!                                                      ↓
//!                                              result validator → caller
//! ```
//!
//! Every node prefixes the accumulated history with its own system prompt
//! and appends one reply. The final arbiter is forced through the
//! `get_argument_result` function and stores the validated verdict as JSON;
//! the validator then re-parses that terminal message before returning.
//!
//! ## Failure policy
//!
//! Nothing is retried. The first failing node aborts its layer and the run,
//! and the error reaches the caller unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ArbiterConfig, TraceConfig};
use crate::errors::ArbiterError;
use crate::graph::{CompiledGraph, GraphBuilder, GraphNode, LayerReport, END, START};
use crate::llm::{ChatModel, ChatRequest, Message, OpenAiChat};
use crate::prompts::{PromptRole, PromptSource, RenderedPrompts, PROMPT_VERSION};
use crate::state::{NodeRecord, RunPhase, RunTrace};
use crate::verdict::{check_participants, ArgumentResult, Participant, VERDICT_FUNCTION_NAME};

pub const DISTRIBUTOR: &str = "distributor";
pub const FINAL_ARBITER: &str = "final_arbiter";

/// The four evaluation dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JudgeKind {
    Logical,
    Tonal,
    Count,
    PersonalAttack,
}

impl JudgeKind {
    /// Declaration order; judge replies reach the arbiter in this order.
    pub const ALL: [JudgeKind; 4] = [
        Self::Logical,
        Self::Tonal,
        Self::Count,
        Self::PersonalAttack,
    ];

    pub fn node_name(self) -> &'static str {
        match self {
            Self::Logical => "logical_judge",
            Self::Tonal => "tonal_judge",
            Self::Count => "count_judge",
            Self::PersonalAttack => "personal_attack_judge",
        }
    }

    pub fn prompt_role(self) -> PromptRole {
        match self {
            Self::Logical => PromptRole::LogicalJudge,
            Self::Tonal => PromptRole::TonalJudge,
            Self::Count => PromptRole::CountJudge,
            Self::PersonalAttack => PromptRole::PersonalAttackJudge,
        }
    }
}

impl std::fmt::Display for JudgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.node_name())
    }
}

/// Split a transcript into one human message per line.
pub fn transcript_messages(conversation: &str) -> Vec<Message> {
    conversation.lines().map(Message::human).collect()
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// Distributor and judges: system prompt + history in, free text out.
struct PromptedNode {
    system: Message,
    model: Arc<dyn ChatModel>,
}

#[async_trait]
impl GraphNode for PromptedNode {
    async fn run(&self, history: &[Message]) -> Result<Message, ArbiterError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(self.system.clone());
        messages.extend_from_slice(history);

        let reply = self.model.complete(ChatRequest::new(messages)).await?;
        Ok(Message::ai(reply.content))
    }
}

/// Fan-in node producing the structured verdict.
struct ArbiterNode {
    system: Message,
    model: Arc<dyn ChatModel>,
    person1: Participant,
    person2: Participant,
}

#[async_trait]
impl GraphNode for ArbiterNode {
    async fn run(&self, history: &[Message]) -> Result<Message, ArbiterError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(self.system.clone());
        messages.extend_from_slice(history);

        let request = ChatRequest::new(messages).with_function(ArgumentResult::function_spec());
        let reply = self.model.complete(request).await?;

        let call = reply.function_call.ok_or_else(|| {
            warn!(raw = %reply.content, "arbiter reply carried no function call");
            ArbiterError::MalformedFunctionCall("response has no function call".to_string())
        })?;
        if call.name != VERDICT_FUNCTION_NAME {
            warn!(function = %call.name, "arbiter called an unexpected function");
            return Err(ArbiterError::MalformedFunctionCall(format!(
                "expected function '{VERDICT_FUNCTION_NAME}', got '{}'",
                call.name
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&call.arguments).map_err(|e| {
            warn!(raw = %call.arguments, "arbiter arguments are not JSON");
            ArbiterError::MalformedFunctionCall(format!("arguments are not JSON: {e}"))
        })?;

        let result = ArgumentResult::from_value(value, &self.person1, &self.person2)
            .inspect_err(|e| warn!(raw = %call.arguments, error = %e, "arbiter verdict rejected"))?;

        let json = serde_json::to_string(&result).map_err(|e| ArbiterError::Schema(e.to_string()))?;
        Ok(Message::ai(json))
    }
}

/// Wire the six nodes into the fan-out/fan-in graph.
pub fn build_graph(
    model: Arc<dyn ChatModel>,
    prompts: &RenderedPrompts,
    person1: &Participant,
    person2: &Participant,
) -> Result<CompiledGraph, ArbiterError> {
    let prompted = |role: PromptRole| -> Arc<dyn GraphNode> {
        Arc::new(PromptedNode {
            system: Message::system(prompts.get(role)),
            model: Arc::clone(&model),
        })
    };

    let mut builder = GraphBuilder::new();
    builder
        .add_node(DISTRIBUTOR, prompted(PromptRole::Distributor))
        .add_edge(START, DISTRIBUTOR);

    for judge in JudgeKind::ALL {
        builder
            .add_node(judge.node_name(), prompted(judge.prompt_role()))
            .add_edge(DISTRIBUTOR, judge.node_name())
            .add_edge(judge.node_name(), FINAL_ARBITER);
    }

    builder
        .add_node(
            FINAL_ARBITER,
            Arc::new(ArbiterNode {
                system: Message::system(prompts.get(PromptRole::FinalArbiter)),
                model: Arc::clone(&model),
                person1: person1.clone(),
                person2: person2.clone(),
            }),
        )
        .add_edge(FINAL_ARBITER, END);

    Ok(builder.compile()?)
}

/// Re-validate the terminal message of a finished run.
pub fn validate_terminal(
    history: &[Message],
    person1: &Participant,
    person2: &Participant,
) -> Result<ArgumentResult, ArbiterError> {
    let last = history.last().ok_or(ArbiterError::EmptyHistory)?;
    ArgumentResult::from_json_str(&last.content, person1, person2).inspect_err(|e| {
        if matches!(e, ArbiterError::InvalidJson(_)) {
            warn!(raw = %last.content, "terminal message is not JSON");
        }
    })
}

// ── Runner ────────────────────────────────────────────────────────────────────

/// A validated verdict plus diagnostics.
#[derive(Debug, Clone)]
pub struct ArbitrationOutcome {
    pub result: ArgumentResult,
    pub trace: RunTrace,
    /// Full message history, transcript first and verdict JSON last.
    pub history: Vec<Message>,
}

/// Runs the judge panel against an LLM backend.
pub struct DisputeArbiter {
    model: Arc<dyn ChatModel>,
    prompts: PromptSource,
    trace: TraceConfig,
}

impl DisputeArbiter {
    /// Built-in prompts and default tracing.
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            prompts: PromptSource::Builtin,
            trace: TraceConfig::default(),
        }
    }

    /// Validate `config` and connect to its OpenAI-compatible endpoint.
    pub fn from_config(config: &ArbiterConfig) -> Result<Self, ArbiterError> {
        config.validate().map_err(ArbiterError::Configuration)?;
        let model = OpenAiChat::new(&config.llm)?;
        Ok(Self {
            model: Arc::new(model),
            prompts: PromptSource::from_dir(config.prompts_dir.as_deref()),
            trace: config.tracing.clone(),
        })
    }

    pub fn with_prompts(mut self, prompts: PromptSource) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_trace(mut self, trace: TraceConfig) -> Self {
        self.trace = trace;
        self
    }

    /// Score the dispute and return only the verdict.
    pub async fn judge(
        &self,
        person1: &Participant,
        person2: &Participant,
        conversation: &str,
    ) -> Result<ArgumentResult, ArbiterError> {
        self.arbitrate(person1, person2, conversation)
            .await
            .map(|outcome| outcome.result)
    }

    /// Blocking variant of [`judge`](Self::judge). Returns
    /// [`ArbiterError::NestedRuntime`] when called from inside an async runtime.
    pub fn judge_blocking(
        &self,
        person1: &Participant,
        person2: &Participant,
        conversation: &str,
    ) -> Result<ArgumentResult, ArbiterError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ArbiterError::NestedRuntime);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(ArbiterError::Runtime)?;
        runtime.block_on(self.judge(person1, person2, conversation))
    }

    /// Score the dispute, returning the verdict with its trace and history.
    pub async fn arbitrate(
        &self,
        person1: &Participant,
        person2: &Participant,
        conversation: &str,
    ) -> Result<ArbitrationOutcome, ArbiterError> {
        let mut trace = RunTrace::new();
        let span = if self.trace.enabled {
            info_span!("arbitration", run_id = %trace.run_id, project = %self.trace.project)
        } else {
            tracing::Span::none()
        };

        async {
            match self.run(&mut trace, person1, person2, conversation).await {
                Ok((result, history)) => {
                    info!(
                        winner = %result.winner,
                        loser = %result.loser,
                        "{}",
                        trace.status_line()
                    );
                    Ok(ArbitrationOutcome {
                        result,
                        trace,
                        history,
                    })
                }
                Err(e) => {
                    trace.fail(&e.to_string());
                    warn!(error = %e, kind = %e.kind(), "{}", trace.status_line());
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        trace: &mut RunTrace,
        person1: &Participant,
        person2: &Participant,
        conversation: &str,
    ) -> Result<(ArgumentResult, Vec<Message>), ArbiterError> {
        check_participants(person1, person2)?;

        let history = transcript_messages(conversation);
        if history.is_empty() {
            warn!("conversation is empty; judges will only see their instructions");
        }

        let prompts = self.prompts.load()?.render(person1, person2)?;
        let graph = build_graph(Arc::clone(&self.model), &prompts, person1, person2)?;

        info!(
            messages = history.len(),
            nodes = graph.node_count(),
            prompt_version = PROMPT_VERSION,
            "arbitration starting"
        );

        let log_payloads = self.trace.enabled;
        let history = graph
            .invoke_observed(history, |report| {
                record_layer(trace, report, log_payloads);
            })
            .await?;

        let result = validate_terminal(&history, person1, person2)?;
        advance(trace, RunPhase::Validated, "terminal message re-validated");
        Ok((result, history))
    }
}

fn record_layer(trace: &mut RunTrace, report: &LayerReport, log_payloads: bool) {
    for completion in &report.completed {
        let elapsed_ms = completion.elapsed.as_millis() as u64;
        if log_payloads {
            info!(node = %completion.node, elapsed_ms, "node completed");
            debug!(node = %completion.node, reply = %completion.reply.content, "node reply");
        }
        trace.record_node(NodeRecord {
            node: completion.node.clone(),
            elapsed_ms,
            reply_len: completion.reply.content.len(),
        });
    }

    if report.contains(DISTRIBUTOR) {
        advance(trace, RunPhase::Distributed, "distributor replied");
    } else if report.contains(FINAL_ARBITER) {
        advance(trace, RunPhase::Arbitrated, "final arbiter verdict accepted");
    } else if JudgeKind::ALL.iter().all(|j| report.contains(j.node_name())) {
        advance(trace, RunPhase::Judged, "all judges replied");
    }
}

fn advance(trace: &mut RunTrace, to: RunPhase, reason: &str) {
    if let Err(e) = trace.transition(to, reason) {
        warn!(error = %e, "run trace out of sync with graph");
    }
}

/// One-shot blocking entry point: build a client from `config`, score the
/// dispute, and return the verdict.
pub fn result(
    config: &ArbiterConfig,
    person1: &Participant,
    person2: &Participant,
    conversation: &str,
) -> Result<ArgumentResult, ArbiterError> {
    DisputeArbiter::from_config(config)?.judge_blocking(person1, person2, conversation)
}

#[cfg(test)]
mod tests {
    use mockall::mock;
    use serde_json::json;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::llm::{ChatReply, LlmError};

    mock! {
        pub Chat {}

        #[async_trait]
        impl ChatModel for Chat {
            async fn complete(&self, request: ChatRequest) -> Result<ChatReply, LlmError>;
        }
    }

    fn maya() -> Participant {
        Participant::new("Maya", "Feels unappreciated")
    }

    fn arjun() -> Participant {
        Participant::new("Arjun", "Works nights")
    }

    fn verdict_args() -> String {
        json!({
            "winner": "Maya",
            "winner_logical_score": 60,
            "winner_tonality": "Frustrated",
            "winner_count": 2,
            "winner_personal_attacks": {"Maya": []},
            "winner_explanation": "Clear needs.",
            "loser": "Arjun",
            "loser_logical_score": 55,
            "loser_tonality": "Defensive",
            "loser_count": 1,
            "loser_personal_attacks": {"Arjun": []},
            "loser_explanation": "Deflected."
        })
        .to_string()
    }

    #[test]
    fn transcript_is_one_message_per_line() {
        let msgs = transcript_messages("Maya: hi\r\nArjun: hey\n\nMaya: ok\n");
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Maya: hi", "Arjun: hey", "", "Maya: ok"]);
        assert!(transcript_messages("").is_empty());
    }

    #[test]
    fn graph_shape() {
        let prompts = PromptSource::Builtin.load().unwrap().render(&maya(), &arjun()).unwrap();
        let graph = build_graph(Arc::new(MockChat::new()), &prompts, &maya(), &arjun()).unwrap();
        assert_eq!(
            graph.layers(),
            vec![
                vec![DISTRIBUTOR],
                vec!["logical_judge", "tonal_judge", "count_judge", "personal_attack_judge"],
                vec![FINAL_ARBITER],
            ]
        );
    }

    #[tokio::test]
    async fn six_calls_and_one_forced_function() {
        let mut mock = MockChat::new();
        mock.expect_complete()
            .withf(|req| req.function.is_none())
            .times(5)
            .returning(|_| Ok(ChatReply::text("noted")));
        mock.expect_complete()
            .withf(|req| {
                req.function
                    .as_ref()
                    .is_some_and(|f| f.name == VERDICT_FUNCTION_NAME)
            })
            .times(1)
            .returning(|_| Ok(ChatReply::function_call(VERDICT_FUNCTION_NAME, verdict_args())));

        let arbiter = DisputeArbiter::new(Arc::new(mock));
        let outcome = arbiter
            .arbitrate(&maya(), &arjun(), "Maya: you never help\nArjun: I do")
            .await
            .unwrap();
        assert_eq!(outcome.result.winner, "Maya");
        assert_eq!(outcome.trace.phase, RunPhase::Validated);
        assert_eq!(outcome.trace.nodes.len(), 6);
        // transcript (2) + distributor + 4 judges + verdict
        assert_eq!(outcome.history.len(), 8);
    }

    #[tokio::test]
    async fn judge_transport_failure_skips_arbiter() {
        let mut mock = MockChat::new();
        mock.expect_complete()
            .withf(|req| {
                req.system_prompt()
                    .is_some_and(|p| p.starts_with("You are the tonal judge"))
            })
            .returning(|_| Err(LlmError::Api { status: 500, body: "overloaded".into() }));
        mock.expect_complete()
            .withf(|req| req.function.is_none())
            .returning(|_| Ok(ChatReply::text("noted")));
        mock.expect_complete()
            .withf(|req| req.function.is_some())
            .times(0)
            .returning(|_| Ok(ChatReply::default()));

        let err = DisputeArbiter::new(Arc::new(mock))
            .judge(&maya(), &arjun(), "Maya: hi")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn text_reply_from_arbiter_is_malformed() {
        let mut mock = MockChat::new();
        mock.expect_complete()
            .withf(|req| req.function.is_none())
            .returning(|_| Ok(ChatReply::text("noted")));
        mock.expect_complete()
            .withf(|req| req.function.is_some())
            .returning(|_| Ok(ChatReply::text("Maya wins")));

        let err = DisputeArbiter::new(Arc::new(mock))
            .judge(&maya(), &arjun(), "Maya: hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::MalformedFunctionCall(_)));
        assert!(err.to_string().contains("failed to parse final arbiter response"));
    }

    #[tokio::test]
    async fn wrong_function_name_is_malformed() {
        let mut mock = MockChat::new();
        mock.expect_complete()
            .withf(|req| req.function.is_none())
            .returning(|_| Ok(ChatReply::text("noted")));
        mock.expect_complete()
            .withf(|req| req.function.is_some())
            .returning(|_| Ok(ChatReply::function_call("get_weather", verdict_args())));

        let err = DisputeArbiter::new(Arc::new(mock))
            .judge(&maya(), &arjun(), "Maya: hi")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extraction);
    }

    #[tokio::test]
    async fn invalid_participants_make_no_calls() {
        let mut mock = MockChat::new();
        mock.expect_complete().times(0).returning(|_| Ok(ChatReply::default()));

        let err = DisputeArbiter::new(Arc::new(mock))
            .judge(&maya(), &Participant::new("maya", ""), "Maya: hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::InvalidInput(_)));
    }

    #[test]
    fn validator_rejects_non_json_terminal() {
        let history = vec![Message::human("Maya: hi"), Message::ai("Maya won, obviously.")];
        let err = validate_terminal(&history, &maya(), &arjun()).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn validator_rejects_schema_mismatch() {
        let history = vec![Message::ai(r#"{"winner": "Maya", "loser": "Arjun"}"#)];
        let err = validate_terminal(&history, &maya(), &arjun()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn validator_requires_a_message() {
        assert!(matches!(
            validate_terminal(&[], &maya(), &arjun()),
            Err(ArbiterError::EmptyHistory)
        ));
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let mut config = ArbiterConfig::default();
        config.llm.api_key = None;
        assert!(matches!(
            DisputeArbiter::from_config(&config),
            Err(ArbiterError::Configuration(_))
        ));
    }

    #[test]
    fn judge_kind_names() {
        let names: Vec<String> = JudgeKind::ALL.iter().map(|j| j.to_string()).collect();
        assert_eq!(
            names,
            vec!["logical_judge", "tonal_judge", "count_judge", "personal_attack_judge"]
        );
    }
}
