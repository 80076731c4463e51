// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user
/// explicitly disables them need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The large ("agent") model used for the main turn loop.
    #[serde(default)]
    pub model: ModelConfig,
    /// The small model used for summarization and sub-agent tasks.
    /// Falls back to `model` when not configured.
    #[serde(default)]
    pub small_model: Option<ModelConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
}

impl Config {
    /// Resolve the small-model config, falling back to the large model.
    pub fn small_model(&self) -> &ModelConfig {
        self.small_model.as_ref().unwrap_or(&self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "openai" | "openai-compat" |
    /// "openrouter" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Base URL override for gateways and local endpoints
    pub base_url: Option<String>,
    /// Context window in tokens; drives the auto-summarize trigger
    pub context_window: Option<u32>,
    /// Maximum tokens to request in a single completion
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Whether the model accepts image input
    #[serde(default)]
    pub supports_images: bool,
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub provider_options: serde_json::Value,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            base_url: None,
            context_window: Some(200_000),
            max_output_tokens: Some(8192),
            temperature: None,
            supports_images: true,
            provider_options: serde_json::Value::Null,
        }
    }
}

fn default_max_turns() -> u32 {
    50
}
fn default_summarize_threshold() -> f32 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of model → tool rounds in a single run before the
    /// agent stops with a wrap-up turn
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Context-window fraction at which auto-summarization triggers
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: f32,
    /// Disable auto-summarization entirely
    #[serde(default)]
    pub disable_auto_summarize: bool,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Extra text appended to the built-in system prompt
    #[serde(default)]
    pub append_system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            summarize_threshold: default_summarize_threshold(),
            disable_auto_summarize: false,
            system_prompt: None,
            append_system_prompt: None,
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_ls_files() -> usize {
    1000
}
fn default_bash_sync_wait_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default timeout for the fetch tool (capped at 120 s at execution)
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Seconds a synchronous bash invocation waits before being promoted
    /// to a tracked background shell
    #[serde(default = "default_bash_sync_wait_secs")]
    pub bash_sync_wait_secs: u64,
    /// Maximum entries rendered by the ls tree
    #[serde(default = "default_max_ls_files")]
    pub max_ls_files: usize,
    /// First-token command names that bash refuses to run
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// Directories whose files may be read without an out-of-working-dir
    /// permission request and without the file-size cap
    #[serde(default)]
    pub skills_paths: Vec<String>,
    /// Sourcegraph GraphQL endpoint override
    #[serde(default)]
    pub sourcegraph_url: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            bash_sync_wait_secs: default_bash_sync_wait_secs(),
            max_ls_files: default_max_ls_files(),
            blocked_commands: Vec::new(),
            skills_paths: Vec::new(),
            sourcegraph_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Skip all permission requests ("yolo" mode).  Every session is
    /// treated as auto-approved.
    #[serde(default)]
    pub yolo: bool,
    /// Tools (or "tool:action" pairs) granted without asking,
    /// e.g. ["view", "bash:run"]
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Whether the curated read-only bash prefixes bypass the gate
    #[serde(default = "default_true")]
    pub safe_read_fast_path: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            yolo: false,
            allowed_tools: Vec::new(),
            safe_read_fast_path: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.model.provider, cfg.model.provider);
        assert_eq!(back.agent.max_turns, cfg.agent.max_turns);
    }

    #[test]
    fn small_model_falls_back_to_large() {
        let cfg = Config::default();
        assert_eq!(cfg.small_model().name, cfg.model.name);
    }

    #[test]
    fn small_model_used_when_set() {
        let cfg = Config {
            small_model: Some(ModelConfig {
                name: "claude-haiku-4-5".into(),
                ..ModelConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(cfg.small_model().name, "claude-haiku-4-5");
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.agent.summarize_threshold, 0.9);
        assert!(!cfg.permissions.yolo);
        assert!(cfg.permissions.safe_read_fast_path);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let cfg: Config = serde_yaml::from_str("permissions:\n  yolo: true").unwrap();
        assert!(cfg.permissions.yolo);
        assert_eq!(cfg.tools.max_ls_files, 1000);
        assert_eq!(cfg.tools.bash_sync_wait_secs, 60);
    }
}
