use std::sync::Arc;

use futures::StreamExt;
use scribe_observability::{emit_event, ObservabilityEvent, ProcessKind};
use scribe_providers::{
    build_payload, delta_stream, read_body, read_completion, ChatRequest, ProviderError,
    ResponseAccumulator, Transport,
};
use scribe_tools::FunctionExecutor;
use scribe_types::{
    estimate_tokens, AssistantConfiguration, Message, MessageRole, TokenCounters, ToolCall,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use crate::config::DEFAULT_MINIMUM_SELECTION_LENGTH;
use crate::error::SessionError;
use crate::input::SessionInput;
use crate::sink::{ConfirmationPolicy, OutputSink};
use crate::storage::MessageStore;

const COMPONENT: &str = "session";
const QUESTION_HEADER: &str = "\n\n## Question\n\n";
const ANSWER_HEADER: &str = "\n\n## Answer\n\n";
/// Oldest stored messages removed per context-length retry.
const TRUNCATE_STEP: usize = 2;

/// How a session ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub content: String,
    pub aborted: bool,
    pub requests: usize,
}

pub struct SessionHandle {
    session_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<SessionOutcome, SessionError>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cooperative: observed before the next frame is processed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<SessionOutcome, SessionError> {
        self.task
            .await
            .map_err(|err| SessionError::TaskFailed(err.to_string()))?
    }
}

struct ActiveSession {
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// Runs one request/response exchange at a time against the shared store.
#[derive(Clone)]
pub struct SessionController {
    store: Arc<MessageStore>,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn FunctionExecutor>,
    confirm: Arc<dyn ConfirmationPolicy>,
    process: ProcessKind,
    minimum_selection_length: usize,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

struct Turn<'a> {
    session_id: &'a str,
    config: &'a AssistantConfiguration,
    sink: &'a dyn OutputSink,
    cancel: &'a CancellationToken,
}

enum Attempt {
    Finished(ResponseAccumulator),
    Aborted(ResponseAccumulator),
}

impl SessionController {
    pub fn new(
        store: Arc<MessageStore>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn FunctionExecutor>,
        confirm: Arc<dyn ConfirmationPolicy>,
    ) -> Self {
        Self {
            store,
            transport,
            executor,
            confirm,
            process: ProcessKind::Engine,
            minimum_selection_length: DEFAULT_MINIMUM_SELECTION_LENGTH,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn with_minimum_selection_length(mut self, length: usize) -> Self {
        self.minimum_selection_length = length;
        self
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Validates the input, cancels and awaits any session still running, then
    /// spawns the new one. Invalid input is rejected before anything starts.
    pub async fn start(
        &self,
        config: AssistantConfiguration,
        input: SessionInput,
        sink: Arc<dyn OutputSink>,
    ) -> Result<SessionHandle, SessionError> {
        input.validate(&config, self.minimum_selection_length)?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
            previous.finished.cancelled().await;
        }

        let session_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        *active = Some(ActiveSession {
            cancel: cancel.clone(),
            finished: finished.clone(),
        });
        drop(active);

        let controller = self.clone();
        let task_cancel = cancel.clone();
        let task_id = session_id.clone();
        let task = tokio::spawn(async move {
            let _finished = finished.drop_guard();
            controller
                .run(&task_id, &config, &input, sink.as_ref(), &task_cancel)
                .await
        });

        Ok(SessionHandle {
            session_id,
            cancel,
            task,
        })
    }

    async fn run(
        &self,
        session_id: &str,
        config: &AssistantConfiguration,
        input: &SessionInput,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, SessionError> {
        let turn = Turn {
            session_id,
            config,
            sink,
            cancel,
        };
        tracing::info!(
            session_id,
            assistant = %config.name,
            mode = config.prompt_mode.as_str(),
            "session started"
        );
        sink.on_session_start(config.prompt_mode);
        let result = self.drive(&turn, input).await;
        if let Err(err) = &result {
            let detail = err.to_string();
            tracing::error!(session_id, "{}: {detail}", err.title());
            self.event(
                Level::ERROR,
                &turn,
                "session.failed",
                "failed",
                Some(err.code()),
                Some(&detail),
            );
        }
        sink.on_session_end();
        result
    }

    async fn drive(
        &self,
        turn: &Turn<'_>,
        input: &SessionInput,
    ) -> Result<SessionOutcome, SessionError> {
        let config = &input.request_config(turn.config);
        let panel = config.prompt_mode.keeps_history();
        let new_messages = input.to_messages().await?;

        // panel history records the question even if the request later fails
        let recorded = if panel {
            turn.sink
                .on_text_delta(&format!("{QUESTION_HEADER}{}", question_text(input)));
            let recorded = input.to_history_messages();
            self.store.append(&recorded).await?;
            recorded.len()
        } else {
            0
        };
        let mut recorded_after = 0;
        let inline = panel && input.has_images();
        let mut pending = if panel { Vec::new() } else { new_messages.clone() };

        let tools = if config.tools {
            self.executor.declarations()
        } else {
            Vec::new()
        };
        let token = config.token.clone().unwrap_or_default();
        let mut requests = 0;

        loop {
            let history = if inline {
                with_inline_images(
                    self.store.read_all().await?,
                    recorded,
                    recorded_after,
                    &new_messages,
                )
            } else if panel {
                self.store.read_all().await?
            } else {
                Vec::new()
            };
            let payload = build_payload(config, &history, &pending, &tools)?;
            tracing::debug!(
                session_id = turn.session_id,
                messages = payload.messages.len(),
                prompt_tokens = payload.prompt_tokens,
                "payload built"
            );
            self.store
                .append_token_counts(TokenCounters::prompt(payload.prompt_tokens))
                .await?;

            let request = ChatRequest {
                endpoint: payload.endpoint,
                token: token.clone(),
                body: payload.body,
            };
            requests += 1;
            self.event(
                Level::INFO,
                turn,
                "provider.call.start",
                "start",
                None,
                Some(request.endpoint.path()),
            );

            let accumulator = match self.attempt(turn, &request).await {
                Ok(Attempt::Finished(accumulator)) => accumulator,
                Ok(Attempt::Aborted(accumulator)) => {
                    return self.finish(turn, accumulator, requests, true).await;
                }
                Err(ProviderError::ContextLengthExceeded(message)) => {
                    self.event(
                        Level::WARN,
                        turn,
                        "provider.call.error",
                        "context_length_exceeded",
                        Some("CONTEXT_LENGTH_EXCEEDED"),
                        Some(&message),
                    );
                    self.truncate_or_fail(turn, panel, message).await?;
                    continue;
                }
                Err(err) => {
                    let detail = err.to_string();
                    self.event(
                        Level::ERROR,
                        turn,
                        "provider.call.error",
                        "failed",
                        Some(err.code()),
                        Some(&detail),
                    );
                    return Err(err.into());
                }
            };

            if !accumulator.has_tool_calls() {
                return self.finish(turn, accumulator, requests, false).await;
            }

            let calls = accumulator.tool_calls().map_err(|err| {
                SessionError::MalformedStream(format!("unreadable tool call fragments: {err}"))
            })?;
            let mut exchange = vec![Message::assistant_tool_calls(
                accumulator.content(),
                calls.clone(),
            )];
            for call in &calls {
                exchange.push(self.call_function(turn, call).await);
            }
            if panel {
                self.store.append(&exchange).await?;
                recorded_after += exchange.len();
            } else {
                pending.extend(exchange);
            }
        }
    }

    /// One request and its streamed (or plain) response.
    async fn attempt(
        &self,
        turn: &Turn<'_>,
        request: &ChatRequest,
    ) -> Result<Attempt, ProviderError> {
        let mut accumulator = ResponseAccumulator::new();
        let connection = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => {
                return Ok(Attempt::Aborted(abort(&mut accumulator, turn.sink)));
            }
            connection = self.transport.send(request) => connection?,
        };

        if turn.config.prompt_mode.keeps_history() {
            turn.sink.on_text_delta(ANSWER_HEADER);
        }

        if !turn.config.stream {
            let mut connection = connection;
            let body = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => None,
                body = read_body(&mut connection) => Some(body),
            };
            connection.close();
            let Some(body) = body else {
                return Ok(Attempt::Aborted(abort(&mut accumulator, turn.sink)));
            };
            for delta in read_completion(&body?)? {
                if let Some(text) = accumulator.apply(&delta) {
                    turn.sink.on_text_delta(&text);
                }
            }
            self.first_byte(turn);
            return Ok(Attempt::Finished(accumulator));
        }

        // dropping the stream closes the connection
        let mut stream = delta_stream(connection);
        let mut first = true;
        loop {
            if turn.cancel.is_cancelled() {
                drop(stream);
                return Ok(Attempt::Aborted(abort(&mut accumulator, turn.sink)));
            }
            let next = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => continue,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    if first {
                        first = false;
                        self.first_byte(turn);
                    }
                    if let Some(text) = accumulator.apply(&delta) {
                        turn.sink.on_text_delta(&text);
                    }
                }
                None => break,
                Some(Err(err)) => return Err(err),
            }
        }
        Ok(Attempt::Finished(accumulator))
    }

    /// Drops the oldest stored turns after the user agrees; anything else ends
    /// the session with the provider's message.
    async fn truncate_or_fail(
        &self,
        turn: &Turn<'_>,
        panel: bool,
        message: String,
    ) -> Result<(), SessionError> {
        if !panel || self.store.is_empty().await? {
            return Err(SessionError::ContextLengthExceeded(message));
        }
        // a cancelled session counts as a refusal
        let accepted = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => false,
            accepted = self.confirm.confirm_context_truncation(&message) => accepted,
        };
        if !accepted {
            return Err(SessionError::ContextLengthExceeded(message));
        }
        self.store.drop_first(TRUNCATE_STEP).await?;
        self.event(
            Level::WARN,
            turn,
            "session.truncated",
            "retrying",
            None,
            Some("dropped oldest history entries"),
        );
        Ok(())
    }

    /// Failures become the tool message text so the model can react to them.
    async fn call_function(&self, turn: &Turn<'_>, call: &ToolCall) -> Message {
        let name = call.function.name.as_str();
        if turn.config.prompt_mode.keeps_history() {
            turn.sink
                .on_text_delta(&format!("\n\nFunction calling: `{name}`\n"));
        }
        let result = match call.parsed_arguments() {
            Ok(args) => self
                .executor
                .execute(name, &args)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(format!("Wrong attributes passed: {err}")),
        };
        let (status, content) = match result {
            Ok(output) => ("ok", output),
            Err(message) => ("failed", message),
        };
        self.event(
            if status == "ok" { Level::INFO } else { Level::WARN },
            turn,
            "tool.call",
            status,
            None,
            Some(name),
        );
        Message::tool_result(call.id.clone(), content)
    }

    async fn finish(
        &self,
        turn: &Turn<'_>,
        accumulator: ResponseAccumulator,
        requests: usize,
        aborted: bool,
    ) -> Result<SessionOutcome, SessionError> {
        // some providers never send a role
        let role = MessageRole::parse(accumulator.role()).unwrap_or(MessageRole::Assistant);
        let content = accumulator.content().to_string();
        if turn.config.prompt_mode.keeps_history() {
            self.store
                .append(&[Message::text(role, content.clone())])
                .await?;
        }
        if role == MessageRole::Assistant {
            self.store
                .append_token_counts(TokenCounters::completion(estimate_tokens(&content)))
                .await?;
        }
        if aborted {
            self.event(
                Level::INFO,
                turn,
                "session.aborted",
                "cancelled",
                None,
                None,
            );
        } else {
            self.event(
                Level::INFO,
                turn,
                "provider.call.finish",
                "completed",
                None,
                None,
            );
        }
        Ok(SessionOutcome {
            session_id: turn.session_id.to_string(),
            content,
            aborted,
            requests,
        })
    }

    fn first_byte(&self, turn: &Turn<'_>) {
        self.event(
            Level::INFO,
            turn,
            "provider.call.first_byte",
            "streaming",
            None,
            None,
        );
    }

    fn event(
        &self,
        level: Level,
        turn: &Turn<'_>,
        event: &str,
        status: &str,
        error_code: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event,
                component: COMPONENT,
                session_id: Some(turn.session_id),
                assistant: Some(&turn.config.name),
                model: Some(&turn.config.chat_model),
                status: Some(status),
                error_code,
                detail,
            },
        );
    }
}

fn abort(accumulator: &mut ResponseAccumulator, sink: &dyn OutputSink) -> ResponseAccumulator {
    let marker = accumulator.abort();
    sink.on_text_delta(&marker);
    std::mem::take(accumulator)
}

/// Everything the user sent, in request order, as echoed under the question header.
fn question_text(input: &SessionInput) -> String {
    input
        .parts
        .iter()
        .map(|part| part.text.as_str())
        .chain(Some(input.command.as_str()).filter(|c| !c.trim().is_empty()))
        .chain(input.images.iter().map(|image| image.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Swaps the recorded image stand-ins back for the inline image message so the
/// provider sees the pictures while the store keeps only their paths. Nothing
/// is swapped once truncation has dropped the stand-ins.
fn with_inline_images(
    mut history: Vec<Message>,
    recorded: usize,
    recorded_after: usize,
    inline: &[Message],
) -> Vec<Message> {
    let Some(start) = history.len().checked_sub(recorded + recorded_after) else {
        return history;
    };
    history.splice(start..start + recorded, inline.iter().cloned());
    history
}
