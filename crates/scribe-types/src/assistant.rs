use serde::{Deserialize, Serialize};

/// Where completed text goes in the host editor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    #[default]
    Panel,
    Append,
    Insert,
    Replace,
    Phantom,
}

impl PromptMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptMode::Panel => "panel",
            PromptMode::Append => "append",
            PromptMode::Insert => "insert",
            PromptMode::Replace => "replace",
            PromptMode::Phantom => "phantom",
        }
    }

    /// Only panel sessions replay stored history; every other mode is a one-shot exchange.
    pub fn keeps_history(self) -> bool {
        matches!(self, PromptMode::Panel)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantConfiguration {
    pub name: String,
    #[serde(default)]
    pub prompt_mode: PromptMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub chat_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub tools: bool,
    #[serde(default)]
    pub parallel_tool_calls: bool,
}

fn default_true() -> bool {
    true
}

impl AssistantConfiguration {
    pub fn new(name: impl Into<String>, chat_model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt_mode: PromptMode::Panel,
            url: None,
            token: None,
            chat_model: chat_model.into(),
            assistant_role: None,
            temperature: None,
            max_tokens: None,
            max_completion_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            placeholder: None,
            stream: true,
            tools: false,
            parallel_tool_calls: false,
        }
    }

    /// The system prompt, if one is configured and not blank.
    pub fn system_role(&self) -> Option<&str> {
        self.assistant_role
            .as_deref()
            .map(str::trim)
            .filter(|role| !role.is_empty())
    }

    /// `[ Name | Mode | MODEL ]`, shown by hosts that surface the current assistant.
    pub fn status_hint(&self) -> String {
        format!(
            "[ {} | {} | {} ]",
            title_case(&self.name),
            title_case(self.prompt_mode.as_str()),
            self.chat_model.to_uppercase()
        )
    }
}

fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
