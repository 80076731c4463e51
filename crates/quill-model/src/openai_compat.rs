// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::facade::EventStream;
use crate::{
    GenerateRequest, Role, StopReason, StreamEvent, ToolResultContent, Usage, WireContent,
};

/// Adapter for OpenAI-compatible chat-completions endpoints (OpenAI itself,
/// OpenRouter, and any gateway speaking the same wire format).
pub struct OpenAiCompatModel {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    context_window: usize,
    max_output_tokens: usize,
    supports_images: bool,
    temperature: Option<f32>,
    extra_body: Value,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(
        driver_name: &'static str,
        cfg: &quill_config::ModelConfig,
        api_key: Option<String>,
        default_base_url: &str,
    ) -> Self {
        let base = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url.to_string());
        Self {
            driver_name,
            model: cfg.name.clone(),
            api_key,
            chat_url: format!("{}/chat/completions", base.trim_end_matches('/')),
            context_window: cfg.context_window.unwrap_or(128_000) as usize,
            max_output_tokens: cfg.max_output_tokens.unwrap_or(8192) as usize,
            supports_images: cfg.supports_images,
            temperature: cfg.temperature,
            extra_body: cfg.provider_options.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::LanguageModel for OpenAiCompatModel {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn max_output_tokens(&self) -> usize {
        self.max_output_tokens
    }

    fn supports_images(&self) -> bool {
        self.supports_images
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<EventStream> {
        let messages = build_openai_messages(&req.messages);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let max_tokens = req
            .sampling
            .max_output_tokens
            .map(|t| t as usize)
            .unwrap_or(self.max_output_tokens);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "max_tokens": max_tokens,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = req.sampling.temperature.or(self.temperature) {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.sampling.top_p {
            body["top_p"] = json!(p);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        // Per-request provider options override the config-level extras;
        // both override anything computed above so users can fine-tune
        // provider behaviour without code changes.
        for extras in [&self.extra_body, &req.provider_options] {
            if let Some(map) = extras.as_object() {
                for (k, v) in map {
                    body[k] = v.clone();
                }
            }
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            "sending generation request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            http_req = http_req.bearer_auth(key);
        } else if self.driver_name != "openai-compat" {
            bail!("API key not set; provide api_key_env in config");
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain the
        // decode state (line buffer + open tool calls) across chunks; emit
        // events only for complete lines.
        let event_stream = byte_stream
            .scan(SseState::default(), |state, chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        state.buf.push_str(&String::from_utf8_lossy(&b));
                        state.drain_complete_lines()
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── SSE decoding ─────────────────────────────────────────────────────────────

/// Per-stream decoder state.
///
/// OpenAI interleaves chunks for parallel tool calls by an `index` field and
/// never emits explicit call-end markers, so the decoder tracks which indices
/// are open and closes them all when the stream finishes.
#[derive(Default)]
struct SseState {
    buf: String,
    /// Open tool calls: (provider index, call id), in open order.
    open_calls: Vec<(u64, String)>,
    /// Recorded finish_reason, emitted as `Finish` on the `[DONE]` sentinel.
    stop: Option<StopReason>,
}

impl SseState {
    /// Drain all complete `\n`-terminated SSE lines from the buffer.
    ///
    /// Any trailing incomplete line is left in place so it can be extended by
    /// the next TCP chunk — a single SSE event may span several packets.
    fn drain_complete_lines(&mut self) -> Vec<anyhow::Result<StreamEvent>> {
        let mut events = Vec::new();
        while let Some(nl_pos) = self.buf.find('\n') {
            let line = self.buf[..nl_pos].trim_end_matches('\r').to_string();
            self.buf = self.buf[nl_pos + 1..].to_string();
            self.parse_data_line(&line, &mut events);
        }
        events
    }

    fn parse_data_line(&mut self, line: &str, out: &mut Vec<anyhow::Result<StreamEvent>>) {
        let data = match line.strip_prefix("data: ") {
            Some(d) => d.trim(),
            None => return,
        };
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            // Close any still-open tool calls before the terminal Finish.
            for (_, id) in self.open_calls.drain(..) {
                out.push(Ok(StreamEvent::ToolCallEnd { id }));
            }
            out.push(Ok(StreamEvent::Finish(
                self.stop.take().unwrap_or(StopReason::Unknown),
            )));
            return;
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return,
        };
        self.parse_chunk(&v, out);
    }

    fn parse_chunk(&mut self, v: &Value, out: &mut Vec<anyhow::Result<StreamEvent>>) {
        // Usage-only chunk (emitted when stream_options.include_usage = true).
        // OpenRouter additionally reports the dollar cost of the turn.
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            out.push(Ok(StreamEvent::Usage(Usage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                cost: usage.get("cost").and_then(|c| c.as_f64()).unwrap_or(0.0),
            })));
            return;
        }

        let choice = &v["choices"][0];

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.stop = Some(match reason {
                "stop" => StopReason::EndTurn,
                "tool_calls" => StopReason::ToolUse,
                "length" => StopReason::MaxTokens,
                _ => StopReason::Unknown,
            });
        }

        let delta = &choice["delta"];

        // Tool call delta.  A chunk with id+name opens a call; argument
        // fragments are forwarded as input deltas keyed to the open call.
        if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
            let index = tc["index"].as_u64().unwrap_or(0);
            let id = tc["id"].as_str().unwrap_or("");
            let name = tc["function"]["name"].as_str().unwrap_or("");
            let args = tc["function"]["arguments"].as_str().unwrap_or("");

            if !self.open_calls.iter().any(|(i, _)| *i == index) {
                // A call opened without an id violates provider id constraints
                // downstream; synthesize a stable fallback.
                let call_id = if id.is_empty() {
                    format!("call_{index}")
                } else {
                    id.to_string()
                };
                self.open_calls.push((index, call_id.clone()));
                out.push(Ok(StreamEvent::ToolCallStart {
                    id: call_id,
                    name: name.to_string(),
                }));
            }
            if !args.is_empty() {
                let call_id = self
                    .open_calls
                    .iter()
                    .find(|(i, _)| *i == index)
                    .map(|(_, id)| id.clone())
                    .unwrap_or_default();
                out.push(Ok(StreamEvent::ToolCallInputDelta {
                    id: call_id,
                    json_chunk: args.to_string(),
                }));
            }
            return;
        }

        // Reasoning delta — two common field names for chain-of-thought:
        //   • `reasoning_content` — llama.cpp, Qwen3, DeepSeek-R1
        //   • `reasoning`         — OpenRouter (and some other aggregators)
        let reasoning = delta
            .get("reasoning_content")
            .and_then(|c| c.as_str())
            .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
        if let Some(text) = reasoning {
            if !text.is_empty() {
                out.push(Ok(StreamEvent::ReasoningDelta {
                    text: text.to_string(),
                    signature: None,
                }));
            }
            return;
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                out.push(Ok(StreamEvent::TextDelta(text.to_string())));
            }
        }
    }
}

/// Convert wire messages into the OpenAI JSON array.
///
/// **Parallel tool call coalescing**: OpenAI requires that all tool calls
/// from one assistant turn appear inside a *single* assistant message as a
/// `tool_calls` array.  Quill stores each tool call as a separate
/// `WireContent::ToolCall` entry, so consecutive `ToolCall` messages are
/// merged into one JSON object before sending.
pub(crate) fn build_openai_messages(messages: &[crate::WireMessage]) -> Vec<Value> {
    fn content_parts_to_json(parts: &[crate::ContentPart]) -> Value {
        let arr: Vec<Value> = parts
            .iter()
            .map(|p| match p {
                crate::ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                crate::ContentPart::Image { image_url } => {
                    json!({ "type": "image_url", "image_url": { "url": image_url } })
                }
            })
            .collect();
        json!(arr)
    }

    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    let mut pending_tool_calls: Vec<Value> = Vec::new();

    let flush_tool_calls = |pending: &mut Vec<Value>, out: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": std::mem::take(pending),
            }));
        }
    };

    for m in messages {
        match &m.content {
            WireContent::ToolCall { tool_call_id, function } => {
                pending_tool_calls.push(json!({
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }));
            }
            WireContent::ToolResult { tool_call_id, content } => {
                flush_tool_calls(&mut pending_tool_calls, &mut out);
                let content_json = match content {
                    ToolResultContent::Text(t) => json!(t),
                    ToolResultContent::Parts(parts) => content_parts_to_json(parts),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content_json,
                }));
            }
            WireContent::Text(t) => {
                flush_tool_calls(&mut pending_tool_calls, &mut out);
                out.push(json!({ "role": role_str(&m.role), "content": t }));
            }
            WireContent::Parts(parts) => {
                flush_tool_calls(&mut pending_tool_calls, &mut out);
                out.push(json!({
                    "role": role_str(&m.role),
                    "content": content_parts_to_json(parts),
                }));
            }
        }
    }
    flush_tool_calls(&mut pending_tool_calls, &mut out);
    out
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
