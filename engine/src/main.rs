use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use scribe_core::{
    default_base_dir, ConfirmationPolicy, FixedAnswer, InputPart, MessageStore, OutputSink,
    SessionController, SessionInput, Settings, SettingsStore,
};
use scribe_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, redact_text,
    ObservabilityEvent, ProcessKind,
};
use scribe_providers::HttpTransport;
use scribe_tools::WorkspaceTools;
use scribe_types::PromptMode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "scribe-engine")]
#[command(about = "Streaming LLM chat sessions for editor buffers")]
struct Cli {
    /// Where history, token counters and logs are kept.
    #[arg(long, global = true, env = "SCRIBE_STATE_DIR")]
    state_dir: Option<String>,
    /// Project settings file layered over the global one.
    #[arg(long, global = true)]
    settings: Option<String>,
    /// Namespaces the history files, usually one per project.
    #[arg(long, global = true)]
    prefix: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a command, with optional selections, files and images.
    Ask {
        command: Vec<String>,
        /// Selected text; `-` reads stdin, `@path` reads a file.
        #[arg(long)]
        selection: Vec<String>,
        /// Whole file sent by reference; re-read each time history is loaded.
        #[arg(long)]
        file: Vec<String>,
        #[arg(long)]
        image: Vec<String>,
        /// Fence language for selections.
        #[arg(long, default_value = "text")]
        scope: String,
        #[arg(long)]
        assistant: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        url: Option<String>,
        /// Root the model's file functions are confined to.
        #[arg(long)]
        workspace: Option<String>,
        /// Truncate history without asking when the context overflows.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Print the stored conversation.
    History,
    /// Print the prompt/completion token estimates.
    Tokens,
    /// Clear the conversation and token counters.
    Reset {
        #[arg(long, default_value_t = false)]
        tokens_only: bool,
    },
    /// Make a configured assistant the current one.
    Use { name: String },
    /// List configured assistants.
    Assistants,
}

struct StdoutSink;

impl OutputSink for StdoutSink {
    fn on_session_start(&self, mode: PromptMode) {
        tracing::debug!(mode = mode.as_str(), "streaming answer");
    }

    fn on_text_delta(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        if let Err(err) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            tracing::debug!(error = %err, "stdout write failed");
        }
    }

    fn on_session_end(&self) {
        println!();
    }
}

/// Asks on stderr and reads the answer from stdin.
struct PromptConfirmation;

#[async_trait]
impl ConfirmationPolicy for PromptConfirmation {
    async fn confirm_context_truncation(&self, message: &str) -> bool {
        eprintln!("\n{message}");
        eprint!("Drop the oldest messages from the history and retry? [y/N] ");
        if let Err(err) = std::io::stderr().flush() {
            tracing::debug!(error = %err, "stderr flush failed");
        }
        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(_) => is_yes(&line),
            Err(err) => {
                tracing::debug!(error = %err, "reading the truncation answer failed");
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("engine jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("engine logging initialized: {:?}", log_info);

    let (api_key, url) = match &cli.command {
        Command::Ask { api_key, url, .. } => (api_key.clone(), url.clone()),
        _ => (None, None),
    };
    let settings_store = SettingsStore::load(
        cli.settings.as_deref().map(Path::new),
        build_cli_overrides(api_key, url),
    )
    .await?;
    let settings = settings_store.settings()?;
    let prefix = cli.prefix.or_else(|| settings.cache_prefix.clone());
    let store = Arc::new(MessageStore::new(&state_dir, prefix.as_deref()));

    match cli.command {
        Command::Ask {
            command,
            selection,
            file,
            image,
            scope,
            assistant,
            workspace,
            yes,
            ..
        } => {
            let input = build_input(command.join(" "), &selection, &file, image, &scope)?;
            ask(&settings, store, input, assistant.as_deref(), workspace, yes).await?;
        }
        Command::History => {
            for message in store.read_all().await? {
                println!("## {}\n", message.role().as_str());
                println!("{}\n", message.content_text().unwrap_or("[attachment]"));
            }
        }
        Command::Tokens => {
            let counters = store.read_token_counts().await;
            println!(
                "prompt: {}, completion: {}",
                counters.prompt_tokens, counters.completion_tokens
            );
        }
        Command::Reset { tokens_only } => {
            if tokens_only {
                store.reset_token_counts().await?;
            } else {
                store.reset().await?;
            }
            info!(history = %store.history_path().display(), tokens_only, "store reset");
        }
        Command::Use { name } => {
            let config = settings.resolve_assistant(&store, Some(&name)).await?;
            println!("{}", config.status_hint());
        }
        Command::Assistants => {
            let current = store.read_current_model().await.map(|c| c.name);
            for assistant in &settings.assistants {
                let marker = if current.as_deref() == Some(assistant.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {}", assistant.status_hint());
            }
        }
    }
    Ok(())
}

async fn ask(
    settings: &Settings,
    store: Arc<MessageStore>,
    input: SessionInput,
    assistant: Option<&str>,
    workspace: Option<String>,
    yes: bool,
) -> anyhow::Result<()> {
    let config = settings.resolve_assistant(&store, assistant).await?;
    eprintln!("{}", config.status_hint());

    let workspace = match workspace {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("resolving workspace directory")?,
    };
    let transport = HttpTransport::new(&settings.transport())?;
    let confirm: Arc<dyn ConfirmationPolicy> = if yes {
        Arc::new(FixedAnswer(true))
    } else {
        Arc::new(PromptConfirmation)
    };
    let controller = SessionController::new(
        store,
        Arc::new(transport),
        Arc::new(WorkspaceTools::new(workspace)),
        confirm,
    )
    .with_process(ProcessKind::Engine)
    .with_minimum_selection_length(settings.minimum_selection_length);

    let handle = controller
        .start(config, input.clone(), Arc::new(StdoutSink))
        .await
        .map_err(|err| anyhow::anyhow!("{}: {err}", err.title()))?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "session.request",
            component: "engine.main",
            session_id: Some(handle.session_id()),
            status: Some("started"),
            detail: Some(&redact_text(&input.command)),
            ..Default::default()
        },
    );

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = handle
        .wait()
        .await
        .map_err(|err| anyhow::anyhow!("{}: {err}", err.title()))?;
    info!(
        session_id = %outcome.session_id,
        requests = outcome.requests,
        aborted = outcome.aborted,
        "session finished"
    );
    Ok(())
}

fn build_input(
    command: String,
    selections: &[String],
    files: &[String],
    images: Vec<String>,
    scope: &str,
) -> anyhow::Result<SessionInput> {
    let mut parts = Vec::new();
    for selection in selections {
        parts.push(InputPart::selection(scope, read_text_arg(selection)?));
    }
    for path in files {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        parts.push(InputPart::file(path.clone(), scope_for(path, scope), text));
    }
    Ok(SessionInput {
        parts,
        images,
        command,
    })
}

/// The file extension doubles as the fence language.
fn scope_for(path: &str, fallback: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn read_text_arg(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return std::fs::read_to_string(path).with_context(|| format!("reading {path}"));
    }
    Ok(input.to_string())
}

fn build_cli_overrides(api_key: Option<String>, url: Option<String>) -> Option<serde_json::Value> {
    if api_key.is_none() && url.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();
    if let Some(key) = api_key {
        root.insert("token".to_string(), serde_json::Value::String(key));
    }
    if let Some(url) = url {
        root.insert("url".to_string(), serde_json::Value::String(url));
    }
    Some(serde_json::Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    flag.filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_base_dir)
}
