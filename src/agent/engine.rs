//! The turn-execution loop.
//!
//! One call to [`run_loop`] drives a conversation until the model answers
//! without requesting tools, a call is denied, the turn limit is reached,
//! the provider fails for good, a message cannot be persisted, or the
//! cancellation token fires.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::tools::ToolRegistry;
use crate::history::{History, OnMessage, PersistError};
use crate::hooks::TurnEvent;
use crate::message::{Content, ContentPart, Message, Role, ToolResult, ToolUse, parse_tool_input};
use crate::models::{LanguageModel, ModelError, ModelRequest, PromptMessage, StreamEvent};
use crate::references;
use crate::retry::{AttemptError, AttemptReport, RetryError, RetryPolicy, run_with_retry};
use crate::settings::{DEFAULT_MAX_RETRY_TURNS, DEFAULT_MAX_TURNS};
use crate::usage::Usage;

pub const DENIED_MESSAGE: &str = "Error: Tool execution was denied by user.";
pub const CANCELED_MESSAGE: &str = "[Request interrupted by user]";

pub enum LoopInput {
    /// Wrapped into a single root user message.
    Text(String),
    /// A prepared conversation; new messages are attached to its last message.
    Messages(Vec<Message>),
}

pub struct LoopOptions {
    /// Root for first-turn `@path` expansion.
    pub cwd: PathBuf,
    pub system_prompt: String,
    /// Sent as system messages after the system prompt on every turn.
    pub context_messages: Vec<String>,
    pub max_turns: u32,
    pub max_retry_turns: u32,
    pub retry_base_delay: Duration,
    pub auto_compact: bool,
    pub temperature: Option<f32>,
    pub cancel: CancellationToken,
    /// Persistence side effect for every message the loop appends.
    pub on_message: Option<OnMessage>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            system_prompt: String::new(),
            context_messages: Vec::new(),
            max_turns: DEFAULT_MAX_TURNS,
            max_retry_turns: DEFAULT_MAX_RETRY_TURNS,
            retry_base_delay: RetryPolicy::default().base_delay,
            auto_compact: true,
            temperature: None,
            cancel: CancellationToken::new(),
            on_message: None,
        }
    }
}

/// One streaming attempt, reported whether it succeeded or not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamReport {
    pub request_id: String,
    pub model_id: String,
    pub retry: u32,
    pub max_retries: u32,
    pub prompt_messages: usize,
    pub tool_count: usize,
    #[serde(skip)]
    pub error: Option<ModelError>,
}

/// Caller hooks into a run. Every method has a no-op default; approval
/// defaults to approving everything.
#[async_trait]
pub trait LoopCallbacks: Send + Sync {
    async fn on_text_delta(&self, _delta: &str) {}
    async fn on_text(&self, _text: &str) {}
    async fn on_reasoning(&self, _text: &str) {}
    async fn on_chunk(&self, _event: &StreamEvent, _request_id: &str) {}
    fn on_stream_result(&self, _report: &StreamReport) {}
    async fn on_tool_use(&self, tool_use: ToolUse) -> ToolUse {
        tool_use
    }
    async fn on_tool_result(&self, _tool_use: &ToolUse, result: ToolResult, _approved: bool) -> ToolResult {
        result
    }
    async fn on_turn(&self, _turn: &TurnEvent) {}
    async fn on_tool_approve(&self, _tool_use: &ToolUse) -> bool {
        true
    }
}

pub struct NoopCallbacks;

impl LoopCallbacks for NoopCallbacks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolDenied,
    MaxTurnsExceeded,
    ApiError,
    Canceled,
    /// The persistence callback rejected a message; the run stops rather than
    /// continue on a history the log does not hold.
    PersistFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ToolDenied => "tool_denied",
            FailureKind::MaxTurnsExceeded => "max_turns_exceeded",
            FailureKind::ApiError => "api_error",
            FailureKind::Canceled => "canceled",
            FailureKind::PersistFailed => "persist_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiErrorDetail {
    pub error: ModelError,
    pub retries_attempted: u32,
}

#[derive(Debug, Clone)]
pub struct FailureDetails {
    /// Model turns completed before the failure.
    pub turns_count: u32,
    pub history: History,
    pub usage: Usage,
    pub tool_use: Option<ToolUse>,
    pub api_error: Option<ApiErrorDetail>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LoopFailure {
    pub kind: FailureKind,
    pub message: String,
    pub details: FailureDetails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopMetadata {
    /// Model turns, minus one for every turn whose tool calls all went through.
    pub turns_count: u32,
    pub tool_calls_count: u32,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct LoopSuccess {
    pub text: String,
    pub history: History,
    pub usage: Usage,
    pub metadata: LoopMetadata,
}

pub type LoopResult = Result<LoopSuccess, LoopFailure>;

#[derive(Debug, Clone)]
struct RequestedCall {
    id: String,
    name: String,
    input: String,
}

#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    reasoning: String,
    calls: Vec<RequestedCall>,
    usage: Usage,
}

/// Streams one attempt to completion. Nothing is recorded in history here,
/// so an abandoned attempt leaves no trace.
async fn stream_turn(
    model: &dyn LanguageModel,
    request: &ModelRequest,
    callbacks: &dyn LoopCallbacks,
    cancel: &CancellationToken,
    request_id: &str,
) -> Result<TurnOutput, AttemptError> {
    if cancel.is_cancelled() {
        return Err(AttemptError::Canceled);
    }
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AttemptError::Canceled),
        s = model.stream(request.clone(), cancel.clone()) => s?,
    };
    let mut out = TurnOutput::default();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Canceled),
            event = stream.next() => event,
        };
        let Some(event) = event else { break };
        callbacks.on_chunk(&event, request_id).await;
        match event {
            StreamEvent::TextDelta(delta) => {
                callbacks.on_text_delta(&delta).await;
                out.text.push_str(&delta);
            }
            StreamEvent::ReasoningDelta(delta) => out.reasoning.push_str(&delta),
            StreamEvent::ToolCall { id, name, input } => out.calls.push(RequestedCall { id, name, input }),
            StreamEvent::Finish { usage } => out.usage = usage,
            StreamEvent::Error(e) => return Err(AttemptError::Model(e)),
        }
    }
    if out.text.trim().is_empty() && out.calls.is_empty() {
        return Err(ModelError::retryable("empty response").into());
    }
    Ok(out)
}

struct RunState {
    history: History,
    usage: Usage,
    model_turns: u32,
    started: Instant,
}

impl RunState {
    fn fail(&self, kind: FailureKind, message: impl Into<String>, tool_use: Option<ToolUse>, api_error: Option<ApiErrorDetail>) -> LoopFailure {
        let message = message.into();
        info!(%kind, turns = self.model_turns, elapsed_ms = self.started.elapsed().as_millis() as u64, "loop failed: {message}");
        LoopFailure {
            kind,
            message,
            details: FailureDetails { turns_count: self.model_turns, history: self.history.clone(), usage: self.usage, tool_use, api_error },
        }
    }

    fn persist_failed(&self, e: PersistError) -> LoopFailure {
        self.fail(FailureKind::PersistFailed, e.to_string(), None, None)
    }

    fn append_tool_result(&mut self, tool_use: &ToolUse, result: ToolResult) -> Result<(), LoopFailure> {
        let part = ContentPart::ToolResult {
            tool_call_id: tool_use.call_id.clone(),
            tool_name: tool_use.name.clone(),
            input: tool_use.params.clone(),
            result,
        };
        match self.history.add_message(Role::Tool, Content::Parts(vec![part]), None, None) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.persist_failed(e)),
        }
    }

    /// Closes every call from `interrupted` on with a canceled result.
    fn interrupt(&mut self, interrupted: &ToolUse, remaining: &[RequestedCall]) -> LoopFailure {
        if let Err(failure) = self.append_tool_result(interrupted, ToolResult::error(CANCELED_MESSAGE)) {
            return failure;
        }
        for call in remaining {
            let tool_use = ToolUse { name: call.name.clone(), params: parse_tool_input(&call.input), call_id: call.id.clone() };
            if let Err(failure) = self.append_tool_result(&tool_use, ToolResult::error(CANCELED_MESSAGE)) {
                return failure;
            }
        }
        self.fail(FailureKind::Canceled, "canceled during tool execution", Some(interrupted.clone()), None)
    }
}

pub async fn run_loop(
    input: LoopInput,
    model: &dyn LanguageModel,
    tools: &ToolRegistry,
    opts: LoopOptions,
    callbacks: &dyn LoopCallbacks,
) -> LoopResult {
    let (history, text) = match input {
        LoopInput::Text(text) => (History::new(Vec::new(), opts.on_message.clone()), Some(text)),
        LoopInput::Messages(messages) => (History::new(messages, opts.on_message.clone()), None),
    };
    let mut state = RunState { history, usage: Usage::empty(), model_turns: 0, started: Instant::now() };
    if let Some(text) = text {
        if let Err(e) = state.history.add_message(Role::User, Content::Text(text), None, None) {
            return Err(state.persist_failed(e));
        }
    }
    let cancel = &opts.cancel;
    let policy = RetryPolicy { max_retries: opts.max_retry_turns, base_delay: opts.retry_base_delay };
    let schemas = tools.schemas();
    let model_id = model.id();
    let mut turns_count: u32 = 0;
    let mut tool_calls_count: u32 = 0;
    let mut first_turn = true;

    loop {
        if cancel.is_cancelled() {
            return Err(state.fail(FailureKind::Canceled, "canceled before turn", None, None));
        }
        if state.model_turns >= opts.max_turns {
            return Err(state.fail(FailureKind::MaxTurnsExceeded, format!("exceeded max turns ({})", opts.max_turns), None, None));
        }
        state.model_turns += 1;
        turns_count += 1;
        debug!(turn = state.model_turns, history = state.history.len(), "turn started");

        if opts.auto_compact {
            match state.history.compress(model, cancel).await {
                Ok(outcome) if outcome.compressed => info!(turn = state.model_turns, "history compacted"),
                Ok(_) => {}
                Err(e) => match e.downcast::<PersistError>() {
                    Ok(persist) => return Err(state.persist_failed(persist)),
                    Err(e) => warn!(error = %e, "compaction failed, continuing with full history"),
                },
            }
        }

        let mut prompt = Vec::with_capacity(opts.context_messages.len() + state.history.len() + 1);
        prompt.push(PromptMessage::system(opts.system_prompt.clone()));
        prompt.extend(opts.context_messages.iter().map(|c| PromptMessage::system(c.clone())));
        prompt.extend(state.history.to_prompt_messages());
        if first_turn {
            references::expand_references(&mut prompt, &opts.cwd);
            first_turn = false;
        }
        let request = ModelRequest { prompt, tools: schemas.clone(), temperature: opts.temperature };
        let request_id = Uuid::new_v4().to_string();
        let turn_started = Utc::now();

        let streamed = {
            let request = &request;
            let request_id = request_id.as_str();
            let model_id = model_id.as_str();
            run_with_retry(
                &policy,
                cancel,
                |a: AttemptReport| {
                    callbacks.on_stream_result(&StreamReport {
                        request_id: request_id.to_string(),
                        model_id: model_id.to_string(),
                        retry: a.retry,
                        max_retries: a.max_retries,
                        prompt_messages: request.prompt.len(),
                        tool_count: request.tools.len(),
                        error: a.error.cloned(),
                    })
                },
                move |_| stream_turn(model, request, callbacks, cancel, request_id),
            )
            .await
        };
        let turn = match streamed {
            Ok(turn) => turn,
            Err(RetryError::Canceled) => return Err(state.fail(FailureKind::Canceled, "canceled while streaming", None, None)),
            Err(RetryError::Failed { .. }) if cancel.is_cancelled() => {
                return Err(state.fail(FailureKind::Canceled, "canceled while streaming", None, None));
            }
            Err(RetryError::Failed { error, retries_attempted }) => {
                let message = error.message.clone();
                return Err(state.fail(FailureKind::ApiError, message, None, Some(ApiErrorDetail { error, retries_attempted })));
            }
        };

        state.usage.add(&turn.usage);
        metrics::counter!("agent_turns_total").increment(1);
        callbacks.on_turn(&TurnEvent { usage: turn.usage, started_at: turn_started, ended_at: Utc::now() }).await;
        if !turn.reasoning.is_empty() {
            callbacks.on_reasoning(&turn.reasoning).await;
        }
        if !turn.text.is_empty() {
            callbacks.on_text(&turn.text).await;
        }

        let mut parts = Vec::with_capacity(turn.calls.len() + 2);
        if !turn.reasoning.is_empty() {
            parts.push(ContentPart::Reasoning { text: turn.reasoning.clone() });
        }
        if !turn.text.is_empty() {
            parts.push(ContentPart::Text { text: turn.text.clone() });
        }
        for call in &turn.calls {
            let input = parse_tool_input(&call.input);
            let tool = tools.get(&call.name);
            parts.push(ContentPart::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                description: tool.and_then(|t| t.describe(&input, &opts.cwd)),
                display_name: tool.and_then(|t| t.display_name()).map(str::to_string),
                input,
            });
        }
        if let Err(e) = state.history.add_message(Role::Assistant, Content::Parts(parts), Some(model_id.clone()), Some(turn.usage.to_message_usage())) {
            return Err(state.persist_failed(e));
        }

        if turn.calls.is_empty() {
            let duration = state.started.elapsed();
            info!(turns = turns_count, tool_calls = tool_calls_count, elapsed_ms = duration.as_millis() as u64, "loop finished");
            return Ok(LoopSuccess {
                text: turn.text,
                history: state.history,
                usage: state.usage,
                metadata: LoopMetadata { turns_count, tool_calls_count, duration },
            });
        }

        for (i, call) in turn.calls.iter().enumerate() {
            let parsed = parse_tool_input(&call.input);
            let tool_use = callbacks.on_tool_use(ToolUse { name: call.name.clone(), params: parsed.clone(), call_id: call.id.clone() }).await;
            let remaining = &turn.calls[i + 1..];
            if cancel.is_cancelled() {
                return Err(state.interrupt(&tool_use, remaining));
            }
            let approved = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(state.interrupt(&tool_use, remaining)),
                approved = callbacks.on_tool_approve(&tool_use) => approved,
            };
            if !approved {
                metrics::counter!("agent_tool_denials_total").increment(1);
                let result = callbacks.on_tool_result(&tool_use, ToolResult::error(DENIED_MESSAGE), false).await;
                state.append_tool_result(&tool_use, result)?;
                return Err(state.fail(FailureKind::ToolDenied, DENIED_MESSAGE, Some(tool_use), None));
            }

            tool_calls_count += 1;
            metrics::counter!("agent_tool_calls_total").increment(1);
            // Raw input keeps parse failures visible unless a hook rewrote the params.
            let args = if tool_use.params == parsed && !call.input.trim().is_empty() { call.input.clone() } else { tool_use.params.to_string() };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(state.interrupt(&tool_use, remaining)),
                result = tools.invoke(&tool_use.name, &args) => result,
            };
            debug!(tool = %tool_use.name, call_id = %tool_use.call_id, is_error = result.is_error, "tool finished");
            let result = callbacks.on_tool_result(&tool_use, result, true).await;
            state.append_tool_result(&tool_use, result)?;
        }
        turns_count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::ApprovalCategory;
    use crate::models::{ModelLimits, PromptRole};
    use crate::testing::{ScriptedModel, ScriptedTool, empty_turn, text_turn, tool_turn};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn registry(names: &[&'static str]) -> (ToolRegistry, Vec<Arc<ScriptedTool>>) {
        let mut r = ToolRegistry::new();
        let mut handles = Vec::new();
        for &name in names {
            let t = Arc::new(ScriptedTool::new(name, Some(ApprovalCategory::Command)));
            r.register(t.clone());
            handles.push(t);
        }
        (r, handles)
    }

    fn fast_opts() -> LoopOptions {
        LoopOptions { auto_compact: false, ..Default::default() }
    }

    #[derive(Default)]
    struct Recorder {
        deltas: Mutex<Vec<String>>,
        texts: Mutex<Vec<String>>,
        reports: Mutex<Vec<StreamReport>>,
        results: Mutex<Vec<(String, bool)>>,
        deny: Option<&'static str>,
        tag_denials: bool,
        cancel_on_delta: Option<CancellationToken>,
        cancel_on_approve: Option<CancellationToken>,
    }

    #[async_trait]
    impl LoopCallbacks for Recorder {
        async fn on_text_delta(&self, delta: &str) {
            self.deltas.lock().unwrap().push(delta.to_string());
            if let Some(c) = &self.cancel_on_delta {
                c.cancel();
            }
        }

        async fn on_text(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }

        fn on_stream_result(&self, report: &StreamReport) {
            self.reports.lock().unwrap().push(report.clone());
        }

        async fn on_tool_result(&self, tool_use: &ToolUse, result: ToolResult, approved: bool) -> ToolResult {
            self.results.lock().unwrap().push((tool_use.name.clone(), approved));
            if !approved && self.tag_denials {
                return ToolResult::error(format!("{} (policy: writes need review)", result.text()));
            }
            result
        }

        async fn on_tool_approve(&self, tool_use: &ToolUse) -> bool {
            if let Some(c) = &self.cancel_on_approve {
                c.cancel();
            }
            Some(tool_use.name.as_str()) != self.deny
        }
    }

    fn tool_results(history: &History) -> Vec<(String, String, bool)> {
        history
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .flat_map(|m| m.content.parts())
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_name, result, .. } => Some((tool_name, result.text(), result.is_error)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn list_files_then_done() {
        let (tools, handles) = registry(&["list_dir"]);
        let model = ScriptedModel::new(vec![
            tool_turn(&[("c1", "list_dir", json!({"path": "."}))], Usage::new(10, 2)),
            text_turn("Done.", Usage::new(20, 3)),
        ]);
        let ok = run_loop(LoopInput::Text("list files".into()), &model, &tools, fast_opts(), &NoopCallbacks).await.unwrap();
        assert_eq!(ok.text, "Done.");
        assert_eq!(ok.metadata.tool_calls_count, 1);
        assert_eq!(ok.metadata.turns_count, 1);
        assert_eq!(handles[0].calls.lock().unwrap()[0], json!({"path": "."}));

        let roles: Vec<Role> = ok.history.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        let msgs = ok.history.messages();
        for pair in msgs.windows(2) {
            assert_eq!(pair[1].parent_uuid, Some(pair[0].uuid));
        }
        assert_eq!(msgs[1].model.as_deref(), Some("test/scripted"));
        match &msgs[1].content.parts()[0] {
            ContentPart::ToolUse { display_name, .. } => assert_eq!(display_name.as_deref(), Some("Scripted")),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[tokio::test]
    async fn turn_limit_counts_model_turns_only() {
        let (tools, _) = registry(&["echo"]);
        let scripts = (0..10)
            .map(|i| {
                let id = format!("c{i}");
                tool_turn(&[(id.as_str(), "echo", json!({}))], Usage::new(1, 1))
            })
            .collect();
        let model = ScriptedModel::new(scripts);
        let opts = LoopOptions { max_turns: 3, ..fast_opts() };
        let err = run_loop(LoopInput::Text("loop".into()), &model, &tools, opts, &NoopCallbacks).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::MaxTurnsExceeded);
        assert_eq!(model.attempts(), 3);
        assert_eq!(err.details.turns_count, 3);
        assert_eq!(err.details.usage, Usage::new(3, 3));
    }

    #[tokio::test]
    async fn denial_short_circuits_remaining_calls() {
        let (tools, handles) = registry(&["a", "b", "c"]);
        let model = ScriptedModel::new(vec![tool_turn(
            &[("1", "a", json!({})), ("2", "b", json!({})), ("3", "c", json!({}))],
            Usage::new(1, 1),
        )]);
        let cb = Recorder { deny: Some("b"), ..Default::default() };
        let err = run_loop(LoopInput::Text("go".into()), &model, &tools, fast_opts(), &cb).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ToolDenied);
        assert_eq!(err.details.tool_use.as_ref().map(|t| t.name.as_str()), Some("b"));
        assert_eq!(
            tool_results(&err.details.history),
            vec![("a".to_string(), "a ok".to_string(), false), ("b".to_string(), DENIED_MESSAGE.to_string(), true)]
        );
        assert_eq!(handles[2].call_count(), 0);
        assert_eq!(model.attempts(), 1);
    }

    #[tokio::test]
    async fn result_hook_rewrites_denial_and_sees_it_unapproved() {
        let (tools, _) = registry(&["a", "b"]);
        let model = ScriptedModel::new(vec![tool_turn(&[("1", "a", json!({})), ("2", "b", json!({}))], Usage::new(1, 1))]);
        let cb = Recorder { deny: Some("b"), tag_denials: true, ..Default::default() };
        let err = run_loop(LoopInput::Text("go".into()), &model, &tools, fast_opts(), &cb).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ToolDenied);
        assert_eq!(*cb.results.lock().unwrap(), vec![("a".to_string(), true), ("b".to_string(), false)]);
        let recorded = tool_results(&err.details.history);
        assert_eq!(recorded[1], ("b".to_string(), format!("{DENIED_MESSAGE} (policy: writes need review)"), true));
    }

    #[tokio::test]
    async fn usage_sums_over_turns_and_tool_errors_feed_back() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![
            tool_turn(&[("1", "nope", json!({}))], Usage::new(3, 4)),
            text_turn("recovered", Usage::new(5, 6)),
        ]);
        let ok = run_loop(LoopInput::Text("x".into()), &model, &tools, fast_opts(), &NoopCallbacks).await.unwrap();
        assert_eq!(ok.usage, Usage::new(8, 10));
        assert_eq!(ok.usage.total_tokens(), 18);
        assert_eq!(tool_results(&ok.history), vec![("nope".to_string(), "Tool nope not found".to_string(), true)]);
        let second_prompt = &model.requests()[1].prompt;
        assert_eq!(second_prompt.last().map(|m| m.role), Some(PromptRole::Tool));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_within_budget_then_succeed() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![empty_turn(), empty_turn(), text_turn("ok", Usage::new(1, 1))]);
        let cb = Recorder::default();
        let opts = LoopOptions { max_retry_turns: 2, ..fast_opts() };
        let ok = run_loop(LoopInput::Text("x".into()), &model, &tools, opts, &cb).await.unwrap();
        assert_eq!(ok.text, "ok");
        assert_eq!(model.attempts(), 3);
        let reports = cb.reports.lock().unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports[0].error.is_some());
        assert!(reports[2].error.is_none());
        assert_eq!(reports[2].retry, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn whitespace_only_answer_is_retried() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![text_turn("\n  ", Usage::new(1, 1)), text_turn("real", Usage::new(2, 2))]);
        let ok = run_loop(LoopInput::Text("x".into()), &model, &tools, fast_opts(), &NoopCallbacks).await.unwrap();
        assert_eq!(ok.text, "real");
        assert_eq!(model.attempts(), 2);
        assert_eq!(ok.usage, Usage::new(2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_is_api_error() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![empty_turn(), empty_turn(), empty_turn(), text_turn("late", Usage::empty())]);
        let opts = LoopOptions { max_retry_turns: 2, ..fast_opts() };
        let err = run_loop(LoopInput::Text("x".into()), &model, &tools, opts, &NoopCallbacks).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ApiError);
        assert_eq!(model.attempts(), 3);
        let api = err.details.api_error.unwrap();
        assert_eq!(api.retries_attempted, 2);
        assert_eq!(api.error.message, "empty response");
    }

    #[tokio::test]
    async fn fatal_stream_error_is_not_retried() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![vec![StreamEvent::Error(ModelError::from_status(401, "bad key"))]]);
        let err = run_loop(LoopInput::Text("x".into()), &model, &tools, fast_opts(), &NoopCallbacks).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ApiError);
        assert_eq!(model.attempts(), 1);
        assert_eq!(err.details.api_error.unwrap().error.status, Some(401));
    }

    #[tokio::test]
    async fn cancel_before_start_changes_nothing() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![text_turn("never", Usage::empty())]);
        let input = vec![Message::user("hi", None)];
        let opts = fast_opts();
        opts.cancel.cancel();
        let err = run_loop(LoopInput::Messages(input.clone()), &model, &tools, opts, &NoopCallbacks).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Canceled);
        assert_eq!(err.details.turns_count, 0);
        assert_eq!(err.details.history.messages(), &input[..]);
        assert_eq!(model.attempts(), 0);
    }

    #[tokio::test]
    async fn cancel_mid_stream_records_no_assistant_message() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![text_turn("partial", Usage::new(1, 1))]);
        let opts = fast_opts();
        let cb = Recorder { cancel_on_delta: Some(opts.cancel.clone()), ..Default::default() };
        let err = run_loop(LoopInput::Text("x".into()), &model, &tools, opts, &cb).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Canceled);
        assert!(err.details.history.messages().iter().all(|m| m.role == Role::User));
        assert!(err.details.usage.is_empty());
        assert!(cb.texts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_during_approval_closes_open_calls() {
        let (tools, handles) = registry(&["a", "b"]);
        let model = ScriptedModel::new(vec![tool_turn(&[("1", "a", json!({})), ("2", "b", json!({}))], Usage::new(1, 1))]);
        let opts = fast_opts();
        let cb = Recorder { cancel_on_approve: Some(opts.cancel.clone()), ..Default::default() };
        let err = run_loop(LoopInput::Text("x".into()), &model, &tools, opts, &cb).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Canceled);
        assert_eq!(
            tool_results(&err.details.history),
            vec![("a".to_string(), CANCELED_MESSAGE.to_string(), true), ("b".to_string(), CANCELED_MESSAGE.to_string(), true)]
        );
        assert_eq!(handles[0].call_count(), 0);
    }

    #[tokio::test]
    async fn deltas_precede_full_text_and_prompt_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "remember this").unwrap();
        let (tools, _) = registry(&["echo"]);
        let model = ScriptedModel::new(vec![
            vec![StreamEvent::TextDelta("Look".into()), StreamEvent::ToolCall { id: "1".into(), name: "echo".into(), input: String::new() }, StreamEvent::Finish { usage: Usage::empty() }],
            vec![StreamEvent::TextDelta("He".into()), StreamEvent::TextDelta("llo".into()), StreamEvent::Finish { usage: Usage::empty() }],
        ]);
        let cb = Recorder::default();
        let opts = LoopOptions {
            cwd: dir.path().to_path_buf(),
            system_prompt: "sys".into(),
            context_messages: vec!["# Context".into(), "# Environment".into()],
            ..fast_opts()
        };
        let ok = run_loop(LoopInput::Text("read @notes.txt".into()), &model, &tools, opts, &cb).await.unwrap();
        assert_eq!(ok.text, "Hello");
        assert_eq!(*cb.deltas.lock().unwrap(), vec!["Look", "He", "llo"]);
        assert_eq!(*cb.texts.lock().unwrap(), vec!["Look", "Hello"]);

        let requests = model.requests();
        let first = &requests[0].prompt;
        assert_eq!(first[0].text(), "sys");
        assert_eq!(first[1].text(), "# Context");
        assert_eq!(first[2].role, PromptRole::System);
        assert!(first[3].text().contains("remember this"));
        assert!(!requests[1].prompt[3].text().contains("remember this"));
        assert_eq!(requests[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn compaction_restarts_active_path_at_summary() {
        let (tools, _) = registry(&["echo"]);
        let model = ScriptedModel::new(vec![
            tool_turn(&[("1", "echo", json!({}))], Usage::new(120_000, 10)),
            text_turn("<context_summary>s</context_summary>", Usage::new(1, 1)),
            text_turn("Done.", Usage::new(1, 1)),
        ]);
        assert_eq!(model.limits(), ModelLimits::default());
        let opts = LoopOptions { auto_compact: true, ..Default::default() };
        let ok = run_loop(LoopInput::Text("x".into()), &model, &tools, opts, &NoopCallbacks).await.unwrap();
        assert_eq!(ok.text, "Done.");
        let summary = ok.history.messages().iter().find(|m| m.role == Role::User && m.parent_uuid.is_none() && m.text().contains("context_summary"));
        assert!(summary.is_some());
        let last_prompt = &model.requests()[2].prompt;
        assert_eq!(last_prompt.len(), 2);
        assert_eq!(ok.history.active_path().len(), 2);
    }

    #[tokio::test]
    async fn persistence_failure_stops_the_run() {
        let (tools, handles) = registry(&["echo"]);
        let model = ScriptedModel::new(vec![
            tool_turn(&[("1", "echo", json!({}))], Usage::new(1, 1)),
            text_turn("never", Usage::new(1, 1)),
        ]);
        let opts = LoopOptions {
            on_message: Some(Arc::new(|m: &Message| {
                if m.role == Role::Assistant {
                    anyhow::bail!("disk full");
                }
                Ok(())
            })),
            ..fast_opts()
        };
        let err = run_loop(LoopInput::Text("x".into()), &model, &tools, opts, &NoopCallbacks).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::PersistFailed);
        assert!(err.message.contains("disk full"));
        assert_eq!(model.attempts(), 1);
        assert_eq!(handles[0].call_count(), 0);
        assert_eq!(err.details.history.len(), 1);
        assert_eq!(err.details.usage, Usage::new(1, 1));
    }

    #[tokio::test]
    async fn persistence_callback_sees_every_new_message() {
        let (tools, _) = registry(&[]);
        let model = ScriptedModel::new(vec![text_turn("hi", Usage::empty())]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let opts = LoopOptions {
            on_message: Some(Arc::new(move |m: &Message| {
                sink.lock().unwrap().push(m.role);
                Ok(())
            })),
            ..fast_opts()
        };
        run_loop(LoopInput::Text("x".into()), &model, &tools, opts, &NoopCallbacks).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Role::User, Role::Assistant]);
    }
}
