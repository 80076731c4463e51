// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::facade::EventStream;
use crate::{GenerateRequest, StopReason, StreamEvent, Usage};

/// Deterministic mock model for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockModel;

#[async_trait]
impl crate::LanguageModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }
    fn context_window(&self) -> usize {
        128_000
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Usage(Usage {
                input_tokens: 10,
                output_tokens: 10,
                cost: 0.001,
            })),
            Ok(StreamEvent::Finish(StopReason::EndTurn)),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted model.  Each call to `generate` pops the next response
/// script from the front of the queue.  This lets tests specify exact event
/// sequences – including tool calls – without network access.
pub struct ScriptedModel {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    context_window: usize,
    supports_images: bool,
    /// The last `GenerateRequest` seen by this model.
    /// Written on each `generate()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<GenerateRequest>>>,
    /// Total number of `generate()` calls made.
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedModel {
    /// Build a model from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`StreamEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            context_window: 128_000,
            supports_images: false,
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Declare that this mock supports image input as well as text.
    pub fn with_vision(mut self) -> Self {
        self.supports_images = true;
        self
    }

    /// Shrink the claimed context window, e.g. to force auto-summarization.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Convenience: model that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            StreamEvent::TextDelta(r),
            StreamEvent::Usage(Usage { input_tokens: 5, output_tokens: 5, cost: 0.001 }),
            StreamEvent::Finish(StopReason::EndTurn),
        ]])
    }

    /// Convenience: model that returns one tool call followed by a text reply
    /// on the next round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = tool_id.into();
        Self::new(vec![
            // Round 1 – model emits a tool call
            vec![
                StreamEvent::ToolCallStart { id: id.clone(), name: tool_name.into() },
                StreamEvent::ToolCallInputDelta { id: id.clone(), json_chunk: args_json.into() },
                StreamEvent::ToolCallEnd { id },
                StreamEvent::Usage(Usage { input_tokens: 5, output_tokens: 5, cost: 0.001 }),
                StreamEvent::Finish(StopReason::ToolUse),
            ],
            // Round 2 – model responds after the tool result
            vec![
                StreamEvent::TextDelta(final_text.into()),
                StreamEvent::Usage(Usage { input_tokens: 5, output_tokens: 5, cost: 0.001 }),
                StreamEvent::Finish(StopReason::EndTurn),
            ],
        ])
    }
}

#[async_trait]
impl crate::LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }
    fn context_window(&self) -> usize {
        self.context_window
    }
    fn supports_images(&self) -> bool {
        self.supports_images
    }

    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    StreamEvent::TextDelta("[no more scripts]".into()),
                    StreamEvent::Finish(StopReason::EndTurn),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{GenerateRequest, LanguageModel, StreamEvent, WireMessage};

    fn empty_req() -> GenerateRequest {
        GenerateRequest {
            messages: vec![WireMessage::user("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let m = MockModel;
        let mut stream = m.generate(empty_req()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            StreamEvent::TextDelta(t) => assert!(t.contains("MOCK: hi")),
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_ends_with_finish() {
        let m = MockModel;
        let mut stream = m.generate(empty_req()).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Finish(StopReason::EndTurn))
        ));
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let m = ScriptedModel::always_text("hello world");
        let mut stream = m.generate(empty_req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, StreamEvent::TextDelta(t) if t == "hello world"));
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let m = ScriptedModel::tool_then_text("call-1", "bash", r#"{"command":"ls"}"#, "done");

        let req = empty_req();
        let mut events = Vec::new();
        let mut stream = m.generate(req.clone()).await.unwrap();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallStart { name, .. } if name == "bash")));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Finish(StopReason::ToolUse))
        ));

        let mut events2 = Vec::new();
        let mut stream2 = m.generate(req).await.unwrap();
        while let Some(ev) = stream2.next().await {
            events2.push(ev.unwrap());
        }
        assert!(events2
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let m = ScriptedModel::new(vec![]);
        let mut stream = m.generate(empty_req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, StreamEvent::TextDelta(t) if t.contains("no more scripts")));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let m = ScriptedModel::always_text("ok");
        let _ = m.generate(empty_req()).await.unwrap();
        let req = m.last_request.lock().unwrap();
        assert!(req.is_some());
        assert_eq!(req.as_ref().unwrap().messages.len(), 1);
    }
}
