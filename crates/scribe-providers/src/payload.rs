use scribe_types::{estimate_tokens, AssistantConfiguration, Message, ToolSchema};
use serde_json::{json, Map, Value};

use crate::error::ProviderError;
use crate::transport::Endpoint;

/// A ready-to-send request body plus its local prompt-token estimate.
#[derive(Debug, Clone)]
pub struct Payload {
    pub endpoint: Endpoint,
    pub body: Value,
    pub messages: Vec<Message>,
    pub prompt_tokens: u64,
}

/// Stored history is only replayed for panel sessions; every mode gets the
/// system prompt when one is configured.
pub fn build_payload(
    config: &AssistantConfiguration,
    history: &[Message],
    new_messages: &[Message],
    tools: &[ToolSchema],
) -> Result<Payload, ProviderError> {
    let endpoint = Endpoint::parse(config.url.as_deref())?;

    let mut messages = Vec::with_capacity(history.len() + new_messages.len() + 1);
    if let Some(role) = config.system_role() {
        messages.push(Message::system(role));
    }
    if config.prompt_mode.keeps_history() {
        messages.extend(history.iter().cloned());
    }
    messages.extend(new_messages.iter().cloned());

    let prompt_tokens = messages
        .iter()
        .filter_map(Message::content_text)
        .map(estimate_tokens)
        .sum();

    let mut body = Map::new();
    body.insert(
        "messages".to_string(),
        Value::Array(messages.iter().map(Message::to_request_value).collect()),
    );
    body.insert("model".to_string(), json!(config.chat_model));
    insert_opt(&mut body, "temperature", config.temperature);
    insert_opt(&mut body, "max_tokens", config.max_tokens);
    insert_opt(&mut body, "max_completion_tokens", config.max_completion_tokens);
    insert_opt(&mut body, "top_p", config.top_p);
    insert_opt(&mut body, "frequency_penalty", config.frequency_penalty);
    insert_opt(&mut body, "presence_penalty", config.presence_penalty);
    body.insert("stream".to_string(), json!(config.stream));
    if config.tools && !tools.is_empty() {
        body.insert(
            "tools".to_string(),
            Value::Array(tools.iter().map(ToolSchema::to_function_declaration).collect()),
        );
        body.insert(
            "parallel_tool_calls".to_string(),
            json!(config.parallel_tool_calls),
        );
    }

    Ok(Payload {
        endpoint,
        body: Value::Object(body),
        messages,
        prompt_tokens,
    })
}

fn insert_opt<T: Into<Value>>(body: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        body.insert(key.to_string(), value.into());
    }
}
