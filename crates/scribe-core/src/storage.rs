use std::path::{Path, PathBuf};

use scribe_types::{file_block, AssistantConfiguration, Message, TokenCounters};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const HISTORY_FILE: &str = "chat_history.jl";
const CURRENT_ASSISTANT_FILE: &str = "current_assistant.json";
const TOKENS_COUNT_FILE: &str = "tokens_count.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("referenced file {path} could not be read: {source}")]
    MissingReference {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `dirs::cache_dir()/scribe`, or `.scribe` when the platform has no cache dir.
pub fn default_base_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("scribe"))
        .unwrap_or_else(|| PathBuf::from(".scribe"))
}

/// Append-only JSON-Lines chat history plus the current-assistant and token
/// counter sidecars, optionally namespaced by a prefix.
pub struct MessageStore {
    history_path: PathBuf,
    current_model_path: PathBuf,
    tokens_path: PathBuf,
    write_lock: Mutex<()>,
}

impl MessageStore {
    pub fn new(base: impl AsRef<Path>, prefix: Option<&str>) -> Self {
        let base = base.as_ref();
        let prefix = prefix
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}_"))
            .unwrap_or_default();
        Self {
            history_path: base.join(format!("{prefix}{HISTORY_FILE}")),
            current_model_path: base.join(format!("{prefix}{CURRENT_ASSISTANT_FILE}")),
            tokens_path: base.join(format!("{prefix}{TOKENS_COUNT_FILE}")),
            write_lock: Mutex::new(()),
        }
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Every stored message in order, with file references re-read from disk.
    pub async fn read_all(&self) -> Result<Vec<Message>, StoreError> {
        let raw = self.read_history().await?;
        let mut messages = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<Message>(line) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(
                        path = %self.history_path.display(),
                        line = line_no + 1,
                        "skipping unreadable history line: {err}"
                    );
                    continue;
                }
            };
            messages.push(expand_file_ref(message).await?);
        }
        Ok(messages)
    }

    /// One line per message, in a single write. File references are stored
    /// without their content.
    pub async fn append(&self, messages: &[Message]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for message in messages {
            buf.push_str(&serde_json::to_string(message)?);
            buf.push('\n');
        }
        let _guard = self.write_lock.lock().await;
        ensure_parent(&self.history_path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .await
            .map_err(io_err(&self.history_path))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(io_err(&self.history_path))?;
        file.flush().await.map_err(io_err(&self.history_path))?;
        Ok(())
    }

    /// Removes the oldest `n` stored messages; dropping more than are stored
    /// leaves an empty log.
    pub async fn drop_first(&self, n: usize) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let raw = self.read_history().await?;
        let remaining = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .skip(n)
            .fold(String::new(), |mut acc, line| {
                acc.push_str(line);
                acc.push('\n');
                acc
            });
        replace_file(&self.history_path, remaining.as_bytes()).await
    }

    pub async fn drop_all(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        replace_file(&self.history_path, b"").await
    }

    /// Number of stored messages.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let raw = self.read_history().await?;
        Ok(raw.lines().filter(|line| !line.trim().is_empty()).count())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    pub async fn save_current_model(
        &self,
        config: &AssistantConfiguration,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(config)?;
        replace_file(&self.current_model_path, &raw).await
    }

    /// `None` when nothing was saved yet or the sidecar is unreadable.
    pub async fn read_current_model(&self) -> Option<AssistantConfiguration> {
        let raw = fs::read_to_string(&self.current_model_path).await.ok()?;
        if raw.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(&raw) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!(
                    path = %self.current_model_path.display(),
                    "ignoring corrupt current assistant file: {err}"
                );
                None
            }
        }
    }

    pub async fn append_token_counts(&self, delta: TokenCounters) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let total = self.read_token_counts().await.saturating_add(delta);
        let raw = serde_json::to_vec(&total)?;
        replace_file(&self.tokens_path, &raw).await
    }

    /// Zero counters when the sidecar is missing or corrupt.
    pub async fn read_token_counts(&self) -> TokenCounters {
        let Ok(raw) = fs::read_to_string(&self.tokens_path).await else {
            return TokenCounters::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub async fn reset_token_counts(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        replace_file(&self.tokens_path, b"").await
    }

    /// Clears history and token counters; the current assistant is kept.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.drop_all().await?;
        self.reset_token_counts().await
    }

    async fn read_history(&self) -> Result<String, StoreError> {
        match fs::read_to_string(&self.history_path).await {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ensure_parent(&self.history_path).await?;
                fs::write(&self.history_path, b"")
                    .await
                    .map_err(io_err(&self.history_path))?;
                Ok(String::new())
            }
            Err(source) => Err(StoreError::Io {
                path: self.history_path.clone(),
                source,
            }),
        }
    }
}

async fn expand_file_ref(message: Message) -> Result<Message, StoreError> {
    let Message::FileRef(mut file_ref) = message else {
        return Ok(message);
    };
    let text = fs::read_to_string(&file_ref.file_path)
        .await
        .map_err(|source| StoreError::MissingReference {
            path: file_ref.file_path.clone(),
            source,
        })?;
    file_ref.content = Some(file_block(
        &file_ref.file_path,
        &file_ref.scope_name,
        &text,
    ));
    Ok(Message::FileRef(file_ref))
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }
    Ok(())
}

/// Write to a sibling temp file, then rename over the target.
async fn replace_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path).await?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, contents).await.map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).await.map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_types::{MessageRole, PromptMode};

    fn store(dir: &Path) -> MessageStore {
        MessageStore::new(dir, None)
    }

    #[tokio::test]
    async fn empty_store_is_created_on_first_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path().join("nested/cache"), Some("proj"));
        assert!(store.read_all().await.unwrap().is_empty());
        assert!(dir.path().join("nested/cache/proj_chat_history.jl").exists());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn history_round_trips_and_refreshes_file_refs() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("main.rs");
        std::fs::write(&source, "fn main() {}").unwrap();
        let source_path = source.to_string_lossy().to_string();
        let store = store(dir.path());

        let messages = vec![
            Message::file_ref(&source_path, "source.rust", Some("stale".to_string())),
            Message::user("explain this"),
            Message::assistant("It does nothing."),
        ];
        store.append(&messages).await.unwrap();

        let raw = std::fs::read_to_string(store.history_path()).unwrap();
        let first_line: serde_json::Value =
            serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert!(first_line.get("content").is_none());
        assert_eq!(first_line["file_path"], source_path.as_str());

        std::fs::write(&source, "fn main() { run(); }").unwrap();
        let loaded = store.read_all().await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1], messages[1]);
        assert_eq!(loaded[2], messages[2]);
        assert_eq!(
            loaded[0].content_text(),
            Some(file_block(&source_path, "source.rust", "fn main() { run(); }").as_str())
        );
        assert_eq!(loaded[0].role(), MessageRole::User);
    }

    #[tokio::test]
    async fn missing_referenced_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let gone = dir.path().join("gone.py").to_string_lossy().to_string();
        store
            .append(&[Message::file_ref(gone, "source.python", None)])
            .await
            .unwrap();
        let err = store.read_all().await.unwrap_err();
        assert!(matches!(err, StoreError::MissingReference { .. }));
    }

    #[tokio::test]
    async fn drop_first_keeps_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let messages: Vec<Message> = (0..5).map(|i| Message::user(format!("m{i}"))).collect();
        store.append(&messages).await.unwrap();

        store.drop_first(2).await.unwrap();
        assert_eq!(store.read_all().await.unwrap(), messages[2..].to_vec());

        store.drop_first(10).await.unwrap();
        assert!(store.read_all().await.unwrap().is_empty());
        store.drop_first(1).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.append(&[Message::user("ok")]).await.unwrap();
        let mut raw = std::fs::read_to_string(store.history_path()).unwrap();
        raw.push_str("{not json\n");
        std::fs::write(store.history_path(), raw).unwrap();
        assert_eq!(store.read_all().await.unwrap(), vec![Message::user("ok")]);
    }

    #[tokio::test]
    async fn current_model_sidecar_tolerates_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.read_current_model().await.is_none());

        let mut config = AssistantConfiguration::new("Writer", "gpt-4o");
        config.prompt_mode = PromptMode::Append;
        store.save_current_model(&config).await.unwrap();
        assert_eq!(store.read_current_model().await, Some(config));

        std::fs::write(dir.path().join(CURRENT_ASSISTANT_FILE), "").unwrap();
        assert!(store.read_current_model().await.is_none());
        std::fs::write(dir.path().join(CURRENT_ASSISTANT_FILE), "{\"name\":").unwrap();
        assert!(store.read_current_model().await.is_none());
    }

    #[tokio::test]
    async fn completion_tokens_are_independent_of_batching() {
        let dir = tempfile::tempdir().unwrap();
        let batched = MessageStore::new(dir.path(), Some("a"));
        let single = MessageStore::new(dir.path(), Some("b"));
        let lengths = [3usize, 4, 9, 17, 40];

        let per_message: Vec<u64> = lengths
            .iter()
            .map(|len| scribe_types::estimate_tokens(&"x".repeat(*len)))
            .collect();
        for tokens in &per_message {
            single
                .append_token_counts(TokenCounters::completion(*tokens))
                .await
                .unwrap();
        }
        batched
            .append_token_counts(TokenCounters::completion(per_message.iter().sum()))
            .await
            .unwrap();

        let expected: u64 = lengths.iter().map(|len| (*len / 4) as u64).sum();
        assert_eq!(single.read_token_counts().await.completion_tokens, expected);
        assert_eq!(batched.read_token_counts().await.completion_tokens, expected);
    }

    #[tokio::test]
    async fn token_counts_reset_and_survive_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .append_token_counts(TokenCounters::prompt(12))
            .await
            .unwrap();
        store
            .append_token_counts(TokenCounters::completion(3))
            .await
            .unwrap();
        assert_eq!(
            store.read_token_counts().await,
            TokenCounters {
                prompt_tokens: 12,
                completion_tokens: 3
            }
        );

        std::fs::write(dir.path().join(TOKENS_COUNT_FILE), "garbage").unwrap();
        assert_eq!(store.read_token_counts().await, TokenCounters::default());

        store
            .append_token_counts(TokenCounters::prompt(5))
            .await
            .unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.read_token_counts().await, TokenCounters::default());
    }

    #[tokio::test]
    async fn reset_clears_history_but_keeps_assistant() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let config = AssistantConfiguration::new("Writer", "gpt-4o");
        store.save_current_model(&config).await.unwrap();
        store.append(&[Message::user("hi")]).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.is_empty().await.unwrap());
        assert_eq!(store.read_current_model().await, Some(config));
    }
}
