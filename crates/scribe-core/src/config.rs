use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use scribe_providers::{ProxySettings, TransportSettings};
use scribe_types::AssistantConfiguration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::error::SessionError;
use crate::storage::MessageStore;

pub const DEFAULT_MINIMUM_SELECTION_LENGTH: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySettings>,
    #[serde(default)]
    pub assistants: Vec<AssistantConfiguration>,
    #[serde(default = "default_minimum_selection_length")]
    pub minimum_selection_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_prefix: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_minimum_selection_length() -> usize {
    DEFAULT_MINIMUM_SELECTION_LENGTH
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    120
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token: None,
            url: None,
            proxy: None,
            assistants: Vec::new(),
            minimum_selection_length: DEFAULT_MINIMUM_SELECTION_LENGTH,
            cache_prefix: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn transport(&self) -> TransportSettings {
        TransportSettings {
            proxy: self.proxy.clone().filter(ProxySettings::is_configured),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }

    pub fn assistant_named(&self, name: &str) -> Option<&AssistantConfiguration> {
        let name = name.trim();
        self.assistants
            .iter()
            .find(|assistant| assistant.name.eq_ignore_ascii_case(name))
    }

    /// Picks the assistant for a session: an explicit name (persisted as the
    /// new current assistant), else the persisted one, else the first
    /// configured. Global `url`/`token` fill in whatever the assistant leaves unset.
    pub async fn resolve_assistant(
        &self,
        store: &MessageStore,
        name: Option<&str>,
    ) -> Result<AssistantConfiguration, SessionError> {
        let picked = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => {
                let config = self.assistant_named(name).cloned().ok_or_else(|| {
                    SessionError::WrongUserInput(format!(
                        "no assistant named `{name}` is configured"
                    ))
                })?;
                store.save_current_model(&config).await?;
                config
            }
            None => match store.read_current_model().await {
                // prefer the configured copy so edited settings take effect
                Some(saved) => self.assistant_named(&saved.name).cloned().unwrap_or(saved),
                None => self.assistants.first().cloned().ok_or_else(|| {
                    SessionError::WrongUserInput("no assistants are configured".to_string())
                })?,
            },
        };
        Ok(self.with_global_defaults(picked))
    }

    fn with_global_defaults(&self, mut config: AssistantConfiguration) -> AssistantConfiguration {
        if config.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            config.url = self.url.clone();
        }
        if config.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            config.token = self.token.clone();
        }
        config
    }
}

#[derive(Debug, Clone, Default)]
struct SettingsLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Global file, project file, environment and CLI overrides, merged in that order.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    global_path: PathBuf,
    project_path: Option<PathBuf>,
    layers: SettingsLayers,
}

impl SettingsStore {
    pub async fn load(
        project_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let env = env_layer(|key| std::env::var(key).ok());
        Self::load_from(
            resolve_global_settings_path(),
            project_path,
            env,
            cli_overrides,
        )
        .await
    }

    async fn load_from(
        global_path: PathBuf,
        project_path: Option<&Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global = read_json_file(&global_path)
            .await
            .with_context(|| format!("reading global settings {}", global_path.display()))?;
        let project = match project_path {
            Some(path) => read_json_file(path)
                .await
                .with_context(|| format!("reading project settings {}", path.display()))?,
            None => empty_object(),
        };
        Ok(Self {
            global_path,
            project_path: project_path.map(Path::to_path_buf),
            layers: SettingsLayers {
                global,
                project,
                env,
                cli: cli_overrides.unwrap_or_else(empty_object),
            },
        })
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub fn project_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    pub fn effective_value(&self) -> Value {
        let mut merged = empty_object();
        deep_merge(&mut merged, &self.layers.global);
        deep_merge(&mut merged, &self.layers.project);
        deep_merge(&mut merged, &self.layers.env);
        deep_merge(&mut merged, &self.layers.cli);
        merged
    }

    pub fn settings(&self) -> anyhow::Result<Settings> {
        serde_json::from_value(self.effective_value()).context("invalid settings")
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Missing and unparseable files are empty layers.
async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "ignoring unreadable settings file");
            Ok(empty_object())
        }
    }
}

fn resolve_global_settings_path() -> PathBuf {
    if let Ok(path) = std::env::var("SCRIBE_GLOBAL_SETTINGS") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("scribe").join("settings.json");
    }
    PathBuf::from(".scribe/settings.json")
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    for (var, key) in [
        ("OPENAI_API_KEY", "token"),
        ("SCRIBE_API_URL", "url"),
        ("SCRIBE_CACHE_PREFIX", "cache_prefix"),
    ] {
        if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
            deep_merge(&mut root, &json!({ key: value.trim() }));
        }
    }
    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
