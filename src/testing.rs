//! Scripted collaborators shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::agent::tools::{ApprovalCategory, ApprovalContext, Tool};
use crate::message::ToolResult;
use crate::models::{LanguageModel, ModelError, ModelRequest, ModelStream, StreamEvent};
use crate::usage::Usage;

/// Replays one event script per `stream` call, in order.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    attempts: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self { scripts: Mutex::new(scripts.into()), attempts: AtomicUsize::new(0), requests: Mutex::new(Vec::new()) }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn id(&self) -> String {
        "test/scripted".into()
    }

    async fn stream(&self, req: ModelRequest, _cancel: CancellationToken) -> Result<ModelStream, ModelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req);
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(events) => Ok(futures::stream::iter(events).boxed()),
            None => Err(ModelError::fatal("no scripted response left")),
        }
    }
}

pub fn text_turn(text: &str, usage: Usage) -> Vec<StreamEvent> {
    vec![StreamEvent::TextDelta(text.to_string()), StreamEvent::Finish { usage }]
}

pub fn tool_turn(calls: &[(&str, &str, Value)], usage: Usage) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = calls
        .iter()
        .map(|(id, name, input)| StreamEvent::ToolCall { id: id.to_string(), name: name.to_string(), input: input.to_string() })
        .collect();
    events.push(StreamEvent::Finish { usage });
    events
}

pub fn empty_turn() -> Vec<StreamEvent> {
    vec![StreamEvent::Finish { usage: Usage::empty() }]
}

/// A tool returning a fixed result and recording its calls.
pub struct ScriptedTool {
    pub name: &'static str,
    pub category: Option<ApprovalCategory>,
    pub needs_approval: bool,
    pub result: ToolResult,
    pub calls: Mutex<Vec<Value>>,
}

impl ScriptedTool {
    pub fn new(name: &'static str, category: Option<ApprovalCategory>) -> Self {
        Self { name, category, needs_approval: true, result: ToolResult::ok(format!("{name} ok")), calls: Mutex::new(Vec::new()) }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    fn category(&self) -> Option<ApprovalCategory> {
        self.category
    }

    fn display_name(&self) -> Option<&str> {
        Some("Scripted")
    }

    async fn needs_approval(&self, _ctx: &ApprovalContext<'_>) -> bool {
        self.needs_approval
    }

    async fn run(&self, params: Value) -> anyhow::Result<ToolResult> {
        self.calls.lock().unwrap().push(params);
        Ok(self.result.clone())
    }
}
