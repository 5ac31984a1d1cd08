use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ToolCall;

/// Source tag attached to every message this integration produces.
pub const MESSAGE_SOURCE_NAME: &str = "OpenAI_completion";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(_) => None,
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    pub role: MessageRole,
    pub content: MessageContent,
    pub name: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// File content is never cached: only the path and scope are persisted and the
/// text is re-read whenever history is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRefMessage {
    pub role: MessageRole,
    pub file_path: String,
    pub scope_name: String,
    pub content: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub content: String,
    pub name: Option<String>,
}

/// One turn of conversation history.
///
/// Serde (de)serialization uses the flat JSON-Lines record shape; the request body
/// shape sent to a provider comes from [`Message::to_request_value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "MessageRecord", try_from = "MessageRecord")]
pub enum Message {
    Text(TextMessage),
    FileRef(FileRefMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    pub fn text(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        Message::Text(TextMessage {
            role,
            content: content.into(),
            name: Some(MESSAGE_SOURCE_NAME.to_string()),
            tool_calls: Vec::new(),
        })
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message::Text(TextMessage {
            role: MessageRole::System,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_calls: Vec::new(),
        })
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::text(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, content.into())
    }

    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Text(TextMessage {
            role: MessageRole::Assistant,
            content: MessageContent::Text(content.into()),
            name: Some(MESSAGE_SOURCE_NAME.to_string()),
            tool_calls,
        })
    }

    pub fn file_ref(
        file_path: impl Into<String>,
        scope_name: impl Into<String>,
        content: Option<String>,
    ) -> Self {
        Message::FileRef(FileRefMessage {
            role: MessageRole::User,
            file_path: file_path.into(),
            scope_name: scope_name.into(),
            content,
            name: Some(MESSAGE_SOURCE_NAME.to_string()),
        })
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            name: Some(MESSAGE_SOURCE_NAME.to_string()),
        })
    }

    pub fn role(&self) -> MessageRole {
        match self {
            Message::Text(m) => m.role,
            Message::FileRef(m) => m.role,
            Message::ToolResult(_) => MessageRole::Tool,
        }
    }

    /// Plain string content; `None` for multimodal parts and unexpanded file refs.
    pub fn content_text(&self) -> Option<&str> {
        match self {
            Message::Text(m) => m.content.as_text(),
            Message::FileRef(m) => m.content.as_deref(),
            Message::ToolResult(m) => Some(&m.content),
        }
    }

    /// Shape sent inside the `messages` array of a chat-completion request.
    /// Storage-only keys (`file_path`, `scope_name`) never leave the process.
    pub fn to_request_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "role".to_string(),
            Value::String(self.role().as_str().to_string()),
        );
        match self {
            Message::Text(m) => {
                obj.insert(
                    "content".to_string(),
                    serde_json::to_value(&m.content).unwrap_or(Value::Null),
                );
                if let Some(name) = &m.name {
                    obj.insert("name".to_string(), Value::String(name.clone()));
                }
                if !m.tool_calls.is_empty() {
                    obj.insert(
                        "tool_calls".to_string(),
                        serde_json::to_value(&m.tool_calls).unwrap_or(Value::Null),
                    );
                }
            }
            Message::FileRef(m) => {
                obj.insert(
                    "content".to_string(),
                    Value::String(m.content.clone().unwrap_or_default()),
                );
                if let Some(name) = &m.name {
                    obj.insert("name".to_string(), Value::String(name.clone()));
                }
            }
            Message::ToolResult(m) => {
                obj.insert("content".to_string(), Value::String(m.content.clone()));
                obj.insert(
                    "tool_call_id".to_string(),
                    Value::String(m.tool_call_id.clone()),
                );
            }
        }
        Value::Object(obj)
    }
}

/// Scopes whose text is already prose and is sent as is.
const UNFENCED_SCOPES: [&str; 3] = ["markdown", "multimarkdown", "plain"];

/// Wraps text in a fenced code block labelled with the editor scope.
pub fn fenced(scope_name: &str, text: &str) -> String {
    let scope = scope_name.trim().to_lowercase();
    if UNFENCED_SCOPES.contains(&scope.as_str()) {
        return text.to_string();
    }
    format!("```{scope_name}\n{text}\n```")
}

/// Content of a file reference: the path header followed by the fenced text.
pub fn file_block(file_path: &str, scope_name: &str, text: &str) -> String {
    format!("Path: `{file_path}`\n\n{}", fenced(scope_name, text))
}

/// Flat, optional-keyed line format of the chat history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl From<Message> for MessageRecord {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(m) => MessageRecord {
                role: m.role,
                content: Some(m.content),
                name: m.name,
                file_path: None,
                scope_name: None,
                tool_call_id: None,
                tool_calls: m.tool_calls,
            },
            // content is reconstituted from the live file on read
            Message::FileRef(m) => MessageRecord {
                role: m.role,
                content: None,
                name: m.name,
                file_path: Some(m.file_path),
                scope_name: Some(m.scope_name),
                tool_call_id: None,
                tool_calls: Vec::new(),
            },
            Message::ToolResult(m) => MessageRecord {
                role: MessageRole::Tool,
                content: Some(MessageContent::Text(m.content)),
                name: m.name,
                file_path: None,
                scope_name: None,
                tool_call_id: Some(m.tool_call_id),
                tool_calls: Vec::new(),
            },
        }
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = String;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        if let Some(tool_call_id) = record.tool_call_id {
            let content = match record.content {
                None => String::new(),
                Some(MessageContent::Text(text)) => text,
                Some(MessageContent::Parts(_)) => {
                    return Err(format!(
                        "tool result `{tool_call_id}` must carry text content"
                    ))
                }
            };
            return Ok(Message::ToolResult(ToolResultMessage {
                tool_call_id,
                content,
                name: record.name,
            }));
        }
        if let Some(file_path) = record.file_path {
            let content = match record.content {
                Some(MessageContent::Text(text)) => Some(text),
                _ => None,
            };
            return Ok(Message::FileRef(FileRefMessage {
                role: record.role,
                file_path,
                scope_name: record.scope_name.unwrap_or_default(),
                content,
                name: record.name,
            }));
        }
        Ok(Message::Text(TextMessage {
            role: record.role,
            content: record.content.unwrap_or_default(),
            name: record.name,
            tool_calls: record.tool_calls,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunctionCall;
    use serde_json::json;

    #[test]
    fn file_ref_record_omits_content() {
        let message = Message::file_ref("src/main.rs", "source.rust", Some("fn main() {}".into()));
        let line = serde_json::to_value(&message).expect("serialize");
        assert_eq!(line["file_path"], "src/main.rs");
        assert_eq!(line["scope_name"], "source.rust");
        assert!(line.get("content").is_none());
    }

    #[test]
    fn request_value_drops_storage_keys() {
        let message = Message::file_ref("src/main.rs", "source.rust", Some("body".into()));
        let value = message.to_request_value();
        assert_eq!(value["content"], "body");
        assert_eq!(value["role"], "user");
        assert!(value.get("file_path").is_none());
        assert!(value.get("scope_name").is_none());
    }

    #[test]
    fn records_decode_into_matching_variant() {
        let tool: Message = serde_json::from_value(json!({
            "role": "tool",
            "content": "done",
            "tool_call_id": "call_9"
        }))
        .expect("tool");
        assert!(matches!(tool, Message::ToolResult(ref m) if m.tool_call_id == "call_9"));

        let file: Message = serde_json::from_value(json!({
            "role": "user",
            "file_path": "a.py",
            "scope_name": "source.python"
        }))
        .expect("file");
        assert!(matches!(file, Message::FileRef(ref m) if m.content.is_none()));

        let text: Message = serde_json::from_value(json!({
            "role": "assistant",
            "content": "hi",
            "name": MESSAGE_SOURCE_NAME
        }))
        .expect("text");
        assert_eq!(text, Message::assistant("hi"));
    }

    #[test]
    fn multimodal_content_round_trips_as_parts() {
        let message = Message::user(MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".to_string(),
                },
            },
        ]));
        let value = message.to_request_value();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "image_url");
        assert!(message.content_text().is_none());

        let line = serde_json::to_string(&message).expect("serialize");
        let back: Message = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back, message);
    }

    #[test]
    fn assistant_tool_calls_are_sent_to_provider() {
        let message = Message::assistant_tool_calls(
            "",
            vec![ToolCall {
                index: 0,
                id: "call_1".to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: "read_region_content".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        );
        let value = message.to_request_value();
        assert_eq!(value["tool_calls"][0]["id"], "call_1");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "read_region_content");
    }

    #[test]
    fn fenced_wraps_with_scope() {
        assert_eq!(fenced("source.rust", "let x = 1;"), "```source.rust\nlet x = 1;\n```");
    }

    #[test]
    fn prose_scopes_are_not_fenced() {
        assert_eq!(fenced("markdown", "# Title"), "# Title");
        assert_eq!(fenced(" MultiMarkdown ", "*a*"), "*a*");
        assert_eq!(fenced("plain", "notes"), "notes");
        assert_eq!(
            file_block("README.md", "Markdown", "hi"),
            "Path: `README.md`\n\nhi"
        );
        assert_eq!(fenced("text.html.markdown", "x"), "```text.html.markdown\nx\n```");
    }

    #[test]
    fn file_block_names_the_path() {
        assert_eq!(
            file_block("src/lib.rs", "source.rust", "mod a;"),
            "Path: `src/lib.rs`\n\n```source.rust\nmod a;\n```"
        );
    }
}
