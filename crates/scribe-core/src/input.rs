use std::path::Path;

use base64::Engine;
use scribe_types::{
    fenced, file_block, AssistantConfiguration, ContentPart, ImageUrl, Message, MessageContent,
    PromptMode,
};

use crate::error::SessionError;

const MINIMUM_TOKEN_LENGTH: usize = 10;

/// System role used instead of the assistant's own when images are attached.
pub const IMAGE_ASSISTANT_ROLE: &str = "Follow user's request on an image provided.\n\
If none provided do either:\n\
1. Describe this image that it be possible to drop it from the chat history without any context lost.\n\
2. It it's just a text screenshot prompt its literally with markdown formatting (don't wrapp the text into markdown scope).\n\
3. If it's a figma/sketch mock, provide the exact code of the exact following layout with the tools of user's choise.\n\
Pay attention between text screnshot and a mock of the design in figma or sketch";

/// A piece of editor context: either a selection or a whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPart {
    pub scope_name: String,
    /// Set for whole-file context, which is stored by reference.
    pub file_path: Option<String>,
    pub text: String,
}

impl InputPart {
    pub fn selection(scope_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            scope_name: scope_name.into(),
            file_path: None,
            text: text.into(),
        }
    }

    pub fn file(
        file_path: impl Into<String>,
        scope_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            scope_name: scope_name.into(),
            file_path: Some(file_path.into()),
            text: text.into(),
        }
    }

    fn to_message(&self) -> Message {
        match &self.file_path {
            Some(path) => Message::file_ref(
                path.clone(),
                self.scope_name.clone(),
                Some(file_block(path, &self.scope_name, &self.text)),
            ),
            None => Message::user(fenced(&self.scope_name, &self.text)),
        }
    }
}

/// What the host collected for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInput {
    pub parts: Vec<InputPart>,
    /// Local image paths or `http(s)` image urls.
    pub images: Vec<String>,
    pub command: String,
}

impl SessionInput {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    /// Rejects requests that cannot succeed before any state is touched.
    pub fn validate(
        &self,
        config: &AssistantConfiguration,
        minimum_selection_length: usize,
    ) -> Result<(), SessionError> {
        let token_len = config.token.as_deref().map_or(0, |t| t.trim().chars().count());
        if token_len < MINIMUM_TOKEN_LENGTH {
            return Err(SessionError::WrongUserInput(
                "No API token provided, you have to set the OpenAI token into the settings to make things work."
                    .to_string(),
            ));
        }

        if minimum_selection_length > 0 {
            let too_short = self
                .parts
                .iter()
                .filter(|part| part.file_path.is_none())
                .any(|part| part.text.chars().count() < minimum_selection_length);
            if too_short {
                return Err(SessionError::WrongUserInput(
                    "Not enough text selected to complete the request, please expand the selection."
                        .to_string(),
                ));
            }
        }

        if config.prompt_mode == PromptMode::Insert {
            let Some(placeholder) = config.placeholder.as_deref().filter(|p| !p.is_empty()) else {
                return Err(SessionError::WrongUserInput(
                    "Insert mode needs a `placeholder` in the assistant settings.".to_string(),
                ));
            };
            let occurrences: usize = self
                .parts
                .iter()
                .map(|part| part.text.matches(placeholder).count())
                .sum();
            if occurrences != 1 {
                return Err(SessionError::WrongUserInput(format!(
                    "There is no placeholder '{placeholder}' within the selected text. There should be exactly one."
                )));
            }
        }

        if self.parts.is_empty() && self.images.is_empty() && self.command.trim().is_empty() {
            return Err(SessionError::WrongUserInput(
                "Nothing to send: provide a command, a selection or a file.".to_string(),
            ));
        }
        Ok(())
    }

    /// Context parts first, then the command. Images travel with the command
    /// in a single multimodal message.
    pub async fn to_messages(&self) -> Result<Vec<Message>, SessionError> {
        let mut messages: Vec<Message> = self.parts.iter().map(InputPart::to_message).collect();
        if !self.images.is_empty() {
            let mut parts = vec![ContentPart::Text {
                text: self.command.clone(),
            }];
            for image in &self.images {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url(image).await?,
                    },
                });
            }
            messages.push(Message::user(MessageContent::Parts(parts)));
        } else if !self.command.trim().is_empty() {
            messages.push(Message::user(self.command.clone()));
        }
        Ok(messages)
    }

    /// What panel history keeps for this input. Images are recorded by path,
    /// never inlined, so stored history stays small and text-only.
    pub fn to_history_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.parts.iter().map(InputPart::to_message).collect();
        if !self.command.trim().is_empty() {
            messages.push(Message::user(self.command.clone()));
        }
        messages.extend(
            self.images
                .iter()
                .map(|image| Message::user(image.trim().to_string())),
        );
        messages
    }

    /// The assistant settings a request for this input is built with.
    pub fn request_config(&self, config: &AssistantConfiguration) -> AssistantConfiguration {
        let mut config = config.clone();
        if self.has_images() {
            config.assistant_role = Some(IMAGE_ASSISTANT_ROLE.to_string());
        }
        config
    }
}

async fn image_url(image: &str) -> Result<String, SessionError> {
    let image = image.trim();
    if image.starts_with("http://") || image.starts_with("https://") || image.starts_with("data:") {
        return Ok(image.to_string());
    }
    let bytes = tokio::fs::read(image)
        .await
        .map_err(|err| SessionError::WrongUserInput(format!("cannot read image {image}: {err}")))?;
    let mime = match Path::new(image)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}
