use serde::{Deserialize, Serialize};

/// Running, locally estimated token totals persisted next to the chat history.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounters {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenCounters {
    pub fn prompt(prompt_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens: 0,
        }
    }

    pub fn completion(completion_tokens: u64) -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens,
        }
    }

    pub fn saturating_add(self, other: TokenCounters) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self
                .completion_tokens
                .saturating_add(other.completion_tokens),
        }
    }
}

/// `chars / 4`, the same heuristic used for both prompt and completion estimates.
/// Counts Unicode scalar values, not bytes.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}
