use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{LanguageModel, ModelRequest, PromptMessage, StreamEvent};

pub const COMPACT_SYSTEM_PROMPT: &str = r#"You are a helpful AI assistant tasked with summarizing conversations.

When the conversation history grows too large, you will be invoked to distill the entire history into a concise, structured XML snapshot. This snapshot is CRITICAL, as it will become the agent's *only* memory of the past. The agent will resume its work based solely on this snapshot. All crucial details, plans, errors, and user directives MUST be preserved.

First, think through the entire history. Review the user's overall goal, the agent's actions, tool outputs, file modifications, and any unresolved questions. Identify every piece of information that is essential for future actions.

After your reasoning is complete, generate the final <context_summary> XML object. Be incredibly dense with information. Omit any irrelevant conversational filler.

The structure MUST be as follows:

<context_summary>
  <conversation_overview>
    <!-- One paragraph describing the whole conversation. -->
  </conversation_overview>
  <key_knowledge>
    <!-- Crucial facts, conventions, and constraints the agent must remember. Use bullet points. -->
  </key_knowledge>
  <file_system_state>
    <!-- Files created, read, modified, or deleted, with their status and critical learnings. -->
  </file_system_state>
  <recent_actions>
    <!-- The last few significant agent actions and their outcomes. Focus on facts. -->
  </recent_actions>
  <current_plan>
    <!-- The agent's step-by-step plan. Mark completed steps. -->
  </current_plan>
</context_summary>
"#;

const COMPACT_USER_PROMPT: &str = "Summarize the conversation above into the <context_summary> snapshot.";

/// Streams a summary of `messages` and returns its text.
pub async fn summarize(model: &dyn LanguageModel, messages: Vec<PromptMessage>, cancel: &CancellationToken) -> anyhow::Result<String> {
    let mut prompt = Vec::with_capacity(messages.len() + 2);
    prompt.push(PromptMessage::system(COMPACT_SYSTEM_PROMPT));
    prompt.extend(messages);
    prompt.push(PromptMessage::user(COMPACT_USER_PROMPT));
    let req = ModelRequest { prompt, tools: Vec::new(), temperature: None };

    let mut stream = model.stream(req, cancel.clone()).await?;
    let mut text = String::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!("compaction canceled"),
            event = stream.next() => event,
        };
        match event {
            Some(StreamEvent::TextDelta(delta)) => text.push_str(&delta),
            Some(StreamEvent::Error(e)) => return Err(e.into()),
            Some(StreamEvent::Finish { usage }) => debug!(tokens = usage.total_tokens(), "compaction summary finished"),
            Some(_) => {}
            None => break,
        }
    }
    if text.trim().is_empty() {
        anyhow::bail!("compaction produced an empty summary");
    }
    Ok(text)
}
