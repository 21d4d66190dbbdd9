use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Message body: either plain text or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenated text parts, ignoring reasoning, tool and image parts.
    pub fn text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            Content::Text(t) => vec![ContentPart::Text { text: t.clone() }],
            Content::Parts(parts) => parts.clone(),
        }
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        result: ToolResult,
    },
    Image {
        data: String,
        mime_type: String,
    },
}

/// A proposed tool invocation as the loop hands it to hooks, approval and the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub name: String,
    pub params: Value,
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub llm_content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_display: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self { llm_content: Content::Text(text.into()), return_display: None, is_error: false }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { llm_content: Content::Text(text.into()), return_display: None, is_error: true }
    }

    pub fn with_display(mut self, display: Value) -> Self {
        self.return_display = Some(display);
        self
    }

    pub fn text(&self) -> String {
        self.llm_content.text()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub uuid: Uuid,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
    pub role: Role,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<MessageUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<Content>, parent_uuid: Option<Uuid>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            parent_uuid,
            role,
            content: content.into(),
            timestamp: Utc::now(),
            model: None,
            usage: None,
            session_id: None,
        }
    }

    pub fn user(content: impl Into<Content>, parent_uuid: Option<Uuid>) -> Self {
        Self::new(Role::User, content, parent_uuid)
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Parses tool-call input leniently: models sometimes send an empty string instead of `{}`.
pub fn parse_tool_input(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_use_part_serializes_with_camel_case_fields() {
        let part = ContentPart::ToolUse {
            id: "call_1".into(),
            name: "ls".into(),
            input: json!({"dir_path": "."}),
            description: Some(".".into()),
            display_name: Some("List".into()),
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["displayName"], "List");
        let back: ContentPart = serde_json::from_value(v).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn root_message_keeps_null_parent_on_the_wire() {
        let m = Message::user("hello", None);
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("parentUuid").unwrap().is_null());
        assert_eq!(v["content"], "hello");
        assert_eq!(v["role"], "user");
    }

    #[test]
    fn content_text_skips_non_text_parts() {
        let c = Content::Parts(vec![
            ContentPart::Reasoning { text: "thinking".into() },
            ContentPart::Text { text: "answer".into() },
        ]);
        assert_eq!(c.text(), "answer");
    }

    #[test]
    fn lenient_input_parsing() {
        assert_eq!(parse_tool_input(""), json!({}));
        assert_eq!(parse_tool_input("{not json"), json!({}));
        assert_eq!(parse_tool_input(r#"{"path":"."}"#), json!({"path": "."}));
    }
}
