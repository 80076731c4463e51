// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{GenerateRequest, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// The uniform streaming interface every provider adapter exposes.
///
/// The agent core is written against this trait only; concrete adapters
/// (OpenAI-compatible gateways, mocks) are interchangeable.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name for status display ("openai", "openrouter", "mock", …).
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window in tokens; drives the auto-summarize trigger.
    fn context_window(&self) -> usize;

    /// Maximum output tokens per completion.
    fn max_output_tokens(&self) -> usize {
        8192
    }

    /// Whether the model accepts image input.  When `false`, image parts
    /// are stripped before the request and image tool results are rejected.
    fn supports_images(&self) -> bool {
        false
    }

    /// Send a generation request and return a streaming response.
    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<EventStream>;
}

/// Construct a boxed [`LanguageModel`] from configuration.
///
/// "openai" / "openai-compat" / "openrouter" share the OpenAI-compatible
/// wire adapter with different endpoint defaults; "mock" is the offline
/// echo model used in tests and CI smoke runs.
pub fn from_config(cfg: &quill_config::ModelConfig) -> anyhow::Result<Box<dyn LanguageModel>> {
    let api_key = cfg
        .api_key_env
        .as_deref()
        .and_then(|env| std::env::var(env).ok());

    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(crate::openai_compat::OpenAiCompatModel::new(
            "openai",
            cfg,
            api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            "https://api.openai.com/v1",
        ))),
        "openai-compat" => {
            let base = cfg
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("openai-compat provider requires base_url"))?;
            Ok(Box::new(crate::openai_compat::OpenAiCompatModel::new(
                "openai-compat",
                cfg,
                api_key,
                base,
            )))
        }
        "openrouter" => Ok(Box::new(crate::openai_compat::OpenAiCompatModel::new(
            "openrouter",
            cfg,
            api_key.or_else(|| std::env::var("OPENROUTER_API_KEY").ok()),
            "https://openrouter.ai/api/v1",
        ))),
        // Anthropic models are reachable through any OpenAI-compatible
        // gateway (openrouter); a native adapter is a front-end concern.
        "anthropic" => Ok(Box::new(crate::openai_compat::OpenAiCompatModel::new(
            "openrouter",
            cfg,
            api_key.or_else(|| std::env::var("OPENROUTER_API_KEY").ok()),
            "https://openrouter.ai/api/v1",
        ))),
        "mock" => Ok(Box::new(crate::MockModel)),
        other => anyhow::bail!(
            "unknown model provider: {other:?}\n\
             Known providers: openai, openai-compat, openrouter, anthropic, mock"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_config::ModelConfig;

    fn cfg(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            name: "test-model".into(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_mock_succeeds() {
        assert!(from_config(&cfg("mock")).is_ok());
    }

    #[test]
    fn from_config_openai_succeeds() {
        assert!(from_config(&cfg("openai")).is_ok());
    }

    #[test]
    fn from_config_openai_compat_requires_base_url() {
        assert!(from_config(&cfg("openai-compat")).is_err());
    }

    #[test]
    fn from_config_unknown_provider_returns_error() {
        let err = from_config(&cfg("totally_unknown_provider_xyz")).err().unwrap();
        assert!(err.to_string().contains("unknown model provider"));
    }
}
