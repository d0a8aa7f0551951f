//! Configuration file support

use std::fs;
use std::path::{Path, PathBuf};

use relay_agent::CompactionConfig;
use relay_ai::ModelInfo;
use serde::{Deserialize, Serialize};

/// Configuration for relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub compaction: CompactionConfig,
    /// User-level permission rules
    pub permissions: PermissionsConfig,
    pub hooks: HooksConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier sent with every request
    pub id: String,
    /// Context window in tokens, if known
    pub context_window: Option<u32>,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// File whose contents replace the built-in system prompt
    pub system_prompt_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: "claude-sonnet-4-5".to_string(),
            context_window: Some(200_000),
            max_tokens: 8192,
            system_prompt_file: None,
        }
    }
}

impl ModelConfig {
    pub fn model_info(&self) -> ModelInfo {
        let mut model = ModelInfo::new(&self.id);
        model.context_window = self.context_window;
        model.max_tokens = self.max_tokens;
        model
    }

    /// Contents of `system_prompt_file`, with `~` expanded
    pub fn load_system_prompt(&self) -> Option<String> {
        let raw = self.system_prompt_file.as_deref()?;
        let path = expand_home(raw);
        match fs::read_to_string(&path) {
            Ok(prompt) => Some(prompt),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to read system prompt file {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

/// `allow`, `deny` and `ask` rule lists, each rule written as `tool` or
/// `tool(pattern)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub ask: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Shell commands run before a tool call is allowed or asked about
    pub pre_tool_use: Vec<String>,
    /// A hook still running after this long is killed and does not block
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            pre_tool_use: Vec::new(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Hosts `web_fetch` may reach without asking
    pub trusted_domains: Vec<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relay")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("RELAY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`. A missing file yields defaults; an unreadable
    /// or malformed one yields defaults with a warning.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Write the example config if no file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }
}

fn expand_home(raw: &str) -> PathBuf {
    match (raw.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# relay configuration file
# Place at ~/.config/relay/config.toml (Linux), ~/Library/Application Support/relay/config.toml (macOS)
# or set RELAY_CONFIG_PATH

[model]
id = "claude-sonnet-4-5"
context_window = 200000
max_tokens = 8192
# system_prompt_file = "~/.config/relay/system_prompt.md"

[compaction]
# Summarize history on its own once usage reaches auto_percent
auto = true
# Suggest /compact from this fraction of the context window
warn_percent = 0.8
auto_percent = 0.95
# Override the model's context window for threshold checks
# context_window = 100000

# Rules are `tool` or `tool(pattern)`. Shell patterns are command prefixes
# (`bash(git diff:*)`) or exact commands; path patterns are globs.
# Deny wins over ask, ask over allow. ./.relay/settings.toml holds project
# rules in the same format and is consulted first.
[permissions]
allow = ["bash(git status:*)", "bash(git diff:*)"]
deny = ["bash(rm -rf:*)"]
ask = []

# Each command receives the tool call as JSON on stdin. Exit status 2 blocks
# the call and stderr becomes the reason; other failures are ignored, and so
# is a hook still running after timeout_secs.
[hooks]
pre_tool_use = []
timeout_secs = 10

[tools]
# Hosts web_fetch may reach without asking
trusted_domains = ["docs.rs"]
"#
}
