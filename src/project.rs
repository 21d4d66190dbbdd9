use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::agent::engine::{
    FailureDetails, FailureKind, LoopCallbacks, LoopFailure, LoopInput, LoopOptions, LoopResult, StreamReport, run_loop,
};
use crate::agent::tools::ToolRegistry;
use crate::approval::{ApprovalPipeline, Approver};
use crate::context::build_context_messages;
use crate::history::{History, OnMessage};
use crate::hooks::{ConversationEvent, HookContext, HookRegistry, TurnEvent};
use crate::message::{Message, ToolResult, ToolUse};
use crate::models::{LanguageModel, StreamEvent};
use crate::session::{Session, SessionConfigManager};
use crate::settings::{ApprovalMode, EffectiveSettings};
use crate::storage::SessionRepository;
use crate::usage::Usage;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an interactive coding assistant working in the user's project directory. \
Use the available tools to inspect and change files. Keep answers short and concrete.";

pub const PLAN_SYSTEM_PROMPT: &str = "You are in plan mode. Explore the project with the read-only tools and answer with a \
step-by-step plan. Do not modify anything.";

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Attach the new user message here instead of at the tip of the history.
    pub parent_uuid: Option<Uuid>,
    pub cancel: CancellationToken,
}

/// One working directory bound to one session.
pub struct Project {
    pub cwd: PathBuf,
    pub session: Session,
    pub settings: EffectiveSettings,
    repo: Arc<dyn SessionRepository>,
    session_config: Arc<Mutex<SessionConfigManager>>,
    model: Arc<dyn LanguageModel>,
    plan_model: Option<Arc<dyn LanguageModel>>,
    hooks: HookRegistry,
    approver: Option<Arc<dyn Approver>>,
    global_config_dir: Option<PathBuf>,
}

impl Project {
    pub fn new(
        cwd: impl Into<PathBuf>,
        mut session: Session,
        settings: EffectiveSettings,
        repo: Arc<dyn SessionRepository>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let session_config = Arc::new(Mutex::new(SessionConfigManager::new(repo.log_path(&session.id))));
        let persist = persister(repo.clone(), session.id.clone());
        session.history.set_on_message(Some(persist));
        Self {
            cwd: cwd.into(),
            session,
            settings,
            repo,
            session_config,
            model,
            plan_model: None,
            hooks: HookRegistry::new(),
            approver: None,
            global_config_dir: None,
        }
    }

    pub fn with_plan_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.plan_model = Some(model);
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_global_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.global_config_dir = Some(dir.into());
        self
    }

    pub fn session_config(&self) -> Arc<Mutex<SessionConfigManager>> {
        self.session_config.clone()
    }

    /// Runs one user message through the loop with the full tool set and the approval pipeline.
    pub async fn send(&mut self, message: &str, opts: SendOptions, sink: &dyn LoopCallbacks) -> LoopResult {
        let tools = ToolRegistry::with_default_tools(&self.cwd);
        let approval = ApprovalPipeline::new(self.settings.approval_mode, &self.cwd).with_session_config(self.session_config.clone());
        let approval = match &self.approver {
            Some(a) => approval.with_approver(a.clone()),
            None => approval,
        };
        let model = self.model.clone();
        self.run(message, opts, sink, tools, approval, model, false).await
    }

    /// Runs with read-only tools, every call auto-approved.
    pub async fn plan(&mut self, message: &str, opts: SendOptions, sink: &dyn LoopCallbacks) -> LoopResult {
        let tools = ToolRegistry::read_only_tools(&self.cwd);
        let approval = ApprovalPipeline::new(ApprovalMode::Yolo, &self.cwd);
        let model = self.plan_model.clone().unwrap_or_else(|| self.model.clone());
        self.run(message, opts, sink, tools, approval, model, true).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &mut self,
        message: &str,
        opts: SendOptions,
        sink: &dyn LoopCallbacks,
        tools: ToolRegistry,
        approval: ApprovalPipeline,
        model: Arc<dyn LanguageModel>,
        is_plan: bool,
    ) -> LoopResult {
        let hctx = HookContext { session_id: self.session.id.clone(), is_plan, user_prompt: Some(message.to_string()) };
        let parent = opts.parent_uuid.or_else(|| self.session.history.last().map(|m| m.uuid));
        let mut user = Message::user(message, parent);
        user.session_id = Some(self.session.id.clone());
        let user_uuid = match self.session.history.append(user) {
            Ok(uuid) => uuid,
            Err(e) => {
                let failure = LoopFailure {
                    kind: FailureKind::PersistFailed,
                    message: e.to_string(),
                    details: FailureDetails {
                        turns_count: 0,
                        history: self.session.history.clone(),
                        usage: Usage::empty(),
                        tool_use: None,
                        api_error: None,
                    },
                };
                let event = ConversationEvent { success: false, text: None, failure: Some(failure.kind), usage: Usage::empty(), turns_count: 0 };
                self.hooks.conversation(&hctx, &event).await;
                return Err(failure);
            }
        };
        let input = self.session.history.messages_to(user_uuid);
        let input_len = input.len();

        let base_prompt = if is_plan { PLAN_SYSTEM_PROMPT } else { DEFAULT_SYSTEM_PROMPT };
        let system_prompt = self.hooks.system_prompt(&hctx, base_prompt.to_string()).await;
        let context_messages = build_context_messages(&self.cwd, self.global_config_dir.as_deref(), &self.hooks, &hctx).await;
        let persist = persister(self.repo.clone(), self.session.id.clone());
        let loop_opts = LoopOptions {
            cwd: self.cwd.clone(),
            system_prompt,
            context_messages,
            max_turns: self.settings.max_turns,
            max_retry_turns: self.settings.max_retry_turns,
            auto_compact: self.settings.auto_compact,
            temperature: self.settings.temperature,
            cancel: opts.cancel,
            on_message: Some(persist.clone()),
            ..LoopOptions::default()
        };
        let callbacks = ProjectCallbacks { sink, hooks: &self.hooks, hctx: &hctx, approval: &approval, tools: &tools };
        info!(session = %self.session.id, plan = is_plan, model = %model.id(), "sending message");
        let result = run_loop(LoopInput::Messages(input), model.as_ref(), &tools, loop_opts, &callbacks).await;

        let (history, usage, event) = match &result {
            Ok(ok) => (
                &ok.history,
                ok.usage,
                ConversationEvent { success: true, text: Some(ok.text.clone()), failure: None, usage: ok.usage, turns_count: ok.metadata.turns_count },
            ),
            Err(e) => (
                &e.details.history,
                e.details.usage,
                ConversationEvent { success: false, text: None, failure: Some(e.kind), usage: e.details.usage, turns_count: e.details.turns_count },
            ),
        };
        let mut merged = self.session.history.messages().to_vec();
        merged.extend(history.messages().iter().skip(input_len).cloned());
        self.session.update_history(History::new(merged, Some(persist)));
        self.session.usage.add(&usage);
        self.hooks.conversation(&hctx, &event).await;
        result
    }
}

/// Appends every message to the session log, stamped with the session id.
fn persister(repo: Arc<dyn SessionRepository>, session_id: String) -> OnMessage {
    Arc::new(move |message: &Message| {
        let mut stamped = message.clone();
        stamped.session_id = Some(session_id.clone());
        repo.append_message(&session_id, &stamped)?;
        Ok(())
    })
}

struct ProjectCallbacks<'a> {
    sink: &'a dyn LoopCallbacks,
    hooks: &'a HookRegistry,
    hctx: &'a HookContext,
    approval: &'a ApprovalPipeline,
    tools: &'a ToolRegistry,
}

#[async_trait]
impl LoopCallbacks for ProjectCallbacks<'_> {
    async fn on_text_delta(&self, delta: &str) {
        self.sink.on_text_delta(delta).await;
    }

    async fn on_text(&self, text: &str) {
        self.sink.on_text(text).await;
    }

    async fn on_reasoning(&self, text: &str) {
        self.sink.on_reasoning(text).await;
    }

    async fn on_chunk(&self, event: &StreamEvent, request_id: &str) {
        self.sink.on_chunk(event, request_id).await;
    }

    fn on_stream_result(&self, report: &StreamReport) {
        self.sink.on_stream_result(report);
    }

    async fn on_tool_use(&self, tool_use: ToolUse) -> ToolUse {
        let tool_use = self.hooks.tool_use(self.hctx, tool_use).await;
        self.sink.on_tool_use(tool_use).await
    }

    async fn on_tool_result(&self, tool_use: &ToolUse, result: ToolResult, approved: bool) -> ToolResult {
        let result = self.hooks.tool_result(self.hctx, tool_use, result, approved).await;
        self.sink.on_tool_result(tool_use, result, approved).await
    }

    async fn on_turn(&self, turn: &TurnEvent) {
        self.hooks.turn(self.hctx, turn).await;
        self.sink.on_turn(turn).await;
    }

    async fn on_tool_approve(&self, tool_use: &ToolUse) -> bool {
        self.approval.approve(self.tools, tool_use).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::engine::NoopCallbacks;
    use crate::approval::{ApprovalDecision, ApprovalRequest};
    use crate::message::Role;
    use crate::settings::{GlobalConfig, RequestOverrides, resolve_effective_settings};
    use crate::storage::JsonlSessionRepository;
    use crate::testing::{ScriptedModel, text_turn, tool_turn};
    use serde_json::json;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Always(ApprovalDecision);

    #[async_trait]
    impl Approver for Always {
        async fn approve(&self, _request: &ApprovalRequest) -> ApprovalDecision {
            self.0
        }
    }

    fn setup(scripts: Vec<Vec<StreamEvent>>) -> (Project, Arc<ScriptedModel>, Arc<JsonlSessionRepository>, TempDir, TempDir) {
        let work = tempdir().unwrap();
        let data = tempdir().unwrap();
        let repo = Arc::new(JsonlSessionRepository::initialize(Some(data.path().to_path_buf())).unwrap());
        let model = Arc::new(ScriptedModel::new(scripts));
        let mut settings = resolve_effective_settings(&GlobalConfig::default(), &RequestOverrides::default());
        settings.auto_compact = false;
        let project = Project::new(work.path(), Session::create(), settings, repo.clone(), model.clone());
        (project, model, repo, work, data)
    }

    #[tokio::test]
    async fn send_persists_and_resumes_identically() {
        let (mut project, _model, repo, work, _data) =
            setup(vec![tool_turn(&[("1", "write", json!({"file_path": "out.txt", "content": "hey"}))], Usage::new(5, 1)), text_turn("Wrote it.", Usage::new(6, 2))]);
        project = project.with_approver(Arc::new(Always(ApprovalDecision::Approve)));
        let ok = project.send("write a file", SendOptions::default(), &NoopCallbacks).await.unwrap();
        assert_eq!(ok.text, "Wrote it.");
        assert_eq!(fs::read_to_string(work.path().join("out.txt")).unwrap(), "hey");
        assert_eq!(project.session.usage, Usage::new(11, 3));

        let loaded = repo.load_messages(&project.session.id).unwrap();
        assert_eq!(loaded.len(), 4);
        let uuids: Vec<Uuid> = loaded.iter().map(|m| m.uuid).collect();
        let expected: Vec<Uuid> = project.session.history.active_path().iter().map(|m| m.uuid).collect();
        assert_eq!(uuids, expected);
        assert!(loaded.iter().all(|m| m.session_id.as_deref() == Some(project.session.id.as_str())));

        let resumed = Session::resume(project.session.id.clone(), &repo.log_path(&project.session.id)).unwrap();
        assert_eq!(resumed.history.active_path().len(), 4);
        assert_eq!(resumed.history.messages()[3].text(), "Wrote it.");
    }

    #[tokio::test]
    async fn write_without_approver_is_denied() {
        let (mut project, _model, _repo, work, _data) =
            setup(vec![tool_turn(&[("1", "write", json!({"file_path": "out.txt", "content": "hey"}))], Usage::new(1, 1))]);
        let err = project.send("write", SendOptions::default(), &NoopCallbacks).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ToolDenied);
        assert!(!work.path().join("out.txt").exists());
        assert_eq!(project.session.history.len(), 3);
    }

    #[tokio::test]
    async fn approve_always_whitelists_for_the_session() {
        let (project, _model, repo, _work, _data) = setup(vec![
            tool_turn(&[("1", "write", json!({"file_path": "a.txt", "content": "1"}))], Usage::empty()),
            text_turn("ok", Usage::empty()),
        ]);
        let mut project = project.with_approver(Arc::new(Always(ApprovalDecision::ApproveAlways)));
        project.send("go", SendOptions::default(), &NoopCallbacks).await.unwrap();
        let reloaded = SessionConfigManager::new(repo.log_path(&project.session.id));
        assert_eq!(reloaded.config().approval_tools, vec!["write".to_string()]);
        assert_eq!(repo.load_messages(&project.session.id).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn branching_send_builds_prompt_from_parent_lineage() {
        let (mut project, model, _repo, _work, _data) =
            setup(vec![text_turn("first", Usage::empty()), text_turn("second", Usage::empty()), text_turn("branch", Usage::empty())]);
        project.send("one", SendOptions::default(), &NoopCallbacks).await.unwrap();
        let first_user = project.session.history.messages()[0].uuid;
        project.send("two", SendOptions::default(), &NoopCallbacks).await.unwrap();
        let opts = SendOptions { parent_uuid: Some(project.session.history.messages()[1].uuid), ..Default::default() };
        project.send("three", opts, &NoopCallbacks).await.unwrap();

        let prompt = &model.requests()[2].prompt;
        let texts: Vec<String> = prompt.iter().skip(3).map(|m| m.text()).collect();
        assert_eq!(texts, vec!["one", "first", "three"]);
        let path = project.session.history.active_path();
        assert_eq!(path.len(), 4);
        assert_eq!(path[0].uuid, first_user);
        assert_eq!(project.session.history.len(), 6);
        assert!(path.iter().all(|m| m.text() != "two"));
    }

    #[tokio::test]
    async fn next_send_compacts_after_a_large_answer() {
        let (mut project, model, repo, _work, _data) = setup(vec![
            text_turn("long answer", Usage::new(190_000, 1_000)),
            text_turn("<context_summary>s</context_summary>", Usage::new(1, 1)),
            text_turn("after", Usage::new(2, 2)),
        ]);
        project.settings.auto_compact = true;
        project.send("one", SendOptions::default(), &NoopCallbacks).await.unwrap();
        let ok = project.send("two", SendOptions::default(), &NoopCallbacks).await.unwrap();

        assert_eq!(ok.text, "after");
        assert_eq!(model.attempts(), 3);
        let requests = model.requests();
        assert_eq!(requests[1].prompt[0].text(), crate::compact::COMPACT_SYSTEM_PROMPT);
        assert!(requests[1].prompt.iter().any(|m| m.text() == "two"));
        let last = requests[2].prompt.last().unwrap();
        assert_eq!(last.role, crate::models::PromptRole::User);
        assert!(last.text().contains("<context_summary>s</context_summary>"));

        let path = project.session.history.active_path();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].parent_uuid, None);
        assert_eq!(repo.load_messages(&project.session.id).unwrap().len(), 2);
        assert_eq!(project.session.history.len(), 5);
    }

    #[tokio::test]
    async fn plan_mode_uses_read_only_tools_and_auto_approves() {
        let (mut project, model, _repo, work, _data) =
            setup(vec![tool_turn(&[("1", "ls", json!({}))], Usage::empty()), text_turn("1. do it", Usage::empty())]);
        fs::write(work.path().join("a.txt"), "x").unwrap();
        let ok = project.plan("plan it", SendOptions::default(), &NoopCallbacks).await.unwrap();
        assert_eq!(ok.text, "1. do it");
        let req = &model.requests()[0];
        let names: Vec<&str> = req.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["read", "ls", "glob", "grep"]);
        assert_eq!(req.prompt[0].text(), PLAN_SYSTEM_PROMPT);
        let tool_msg = ok.history.messages().iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(serde_json::to_string(&tool_msg.content).unwrap().contains("a.txt"));
    }
}
