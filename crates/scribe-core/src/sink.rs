use async_trait::async_trait;
use scribe_types::PromptMode;

/// Receives everything a session shows the user: the echoed question, the
/// streamed answer and the abort marker.
pub trait OutputSink: Send + Sync {
    fn on_session_start(&self, mode: PromptMode);
    fn on_text_delta(&self, text: &str);
    fn on_session_end(&self);
}

/// Asked before history is truncated to fit the model's context window.
#[async_trait]
pub trait ConfirmationPolicy: Send + Sync {
    async fn confirm_context_truncation(&self, message: &str) -> bool;
}

/// Answers every truncation prompt the same way, for unattended hosts.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

#[async_trait]
impl ConfirmationPolicy for FixedAnswer {
    async fn confirm_context_truncation(&self, _message: &str) -> bool {
        self.0
    }
}
