// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quill_config::AgentConfig;
use quill_model::{
    ContentPart, GenerateRequest, LanguageModel, SamplingParams, StopReason, StreamEvent,
    WireMessage,
};
use quill_store::{FinishReason, Message, MessageRole, MessageStore, Part, SessionStore};
use quill_tools::{ToolCall, ToolCtx, ToolError, ToolOutput, ToolRegistry};

use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::prompts::system_prompt;
use crate::summarize::{estimate_tokens, needs_summarize, SUMMARY_PROMPT};

/// One user prompt handed to [`SessionAgent::run`].
#[derive(Debug, Clone, Default)]
pub struct SessionAgentCall {
    pub session_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub sampling: SamplingParams,
    pub provider_options: Value,
}

/// A binary attachment on the user turn (image or other payload).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub mime: String,
    /// Base64-encoded payload
    pub data: String,
    pub path: String,
}

/// The result of a completed run: the final assistant message.
#[derive(Debug, Clone)]
pub struct RunResponse {
    pub message: Message,
}

/// The per-session turn loop.
///
/// Drives one or more model turns per user prompt: streams the reply,
/// persists message parts as they arrive, dispatches authorized tool
/// calls, rolls sub-agent costs up to the session, and auto-summarizes
/// when the context window fills up.
///
/// All fields are shared handles, so cloning is cheap; the busy set
/// enforces at most one active run per session across clones.
#[derive(Clone)]
pub struct SessionAgent {
    sessions: Arc<SessionStore>,
    messages: Arc<MessageStore>,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn LanguageModel>,
    small_model: Arc<dyn LanguageModel>,
    config: Arc<AgentConfig>,
    working_dir: PathBuf,
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionStore>,
        messages: Arc<MessageStore>,
        tools: Arc<ToolRegistry>,
        model: Arc<dyn LanguageModel>,
        small_model: Arc<dyn LanguageModel>,
        config: Arc<AgentConfig>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            sessions,
            messages,
            tools,
            model,
            small_model,
            config,
            working_dir,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    /// Process one user prompt to completion.
    ///
    /// Guarantees: at most one active run per session; every persisted part
    /// is causally ordered; cancellation finalizes the in-flight assistant
    /// message as canceled and returns [`AgentError::RequestCancelled`].
    pub async fn run(
        &self,
        cancel: CancellationToken,
        call: SessionAgentCall,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<RunResponse, AgentError> {
        if call.prompt.trim().is_empty() {
            return Err(AgentError::EmptyPrompt);
        }
        if call.session_id.is_empty() {
            return Err(AgentError::SessionMissing("empty session id".into()));
        }
        self.sessions
            .get(&call.session_id)
            .map_err(|_| AgentError::SessionMissing(call.session_id.clone()))?;

        let _busy = BusyGuard::acquire(&self.active, &call.session_id)
            .ok_or_else(|| AgentError::SessionBusy(call.session_id.clone()))?;

        // Recovery: a prior run that died mid-stream leaves an assistant
        // message without a terminal part.  Finalize it as canceled before
        // anything else touches the log.
        for msg in self.messages.list_by_session(&call.session_id) {
            if msg.role == MessageRole::Assistant && !msg.is_finished() {
                let mut m = msg;
                m.finish(FinishReason::Canceled, "recovered from interrupted run", "");
                self.messages.update(m)?;
            }
        }

        let user_msg = self.messages.create(
            &call.session_id,
            MessageRole::User,
            user_parts(&call),
            self.model.model_name(),
            self.model.name(),
        )?;
        debug!(session = %call.session_id, message = %user_msg.id, "run started");

        // The effective history fed to the model.  Starts as the full
        // persisted log; auto-summarization replaces it with a compressed
        // view while the raw messages stay persisted.
        let mut history = self.messages.list_by_session(&call.session_id);

        let system = system_prompt(
            &self.working_dir,
            self.config.system_prompt.as_deref(),
            self.config.append_system_prompt.as_deref(),
        );
        let schemas: Vec<quill_model::ToolSchema> = self
            .tools
            .schemas()
            .into_iter()
            .map(|s| quill_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let mut turn = 0u32;
        loop {
            turn += 1;
            let final_turn = turn >= self.config.max_turns;

            // Proactive summarization before the request is sent.
            if !self.config.disable_auto_summarize {
                let estimated = estimate_tokens(&to_wire(&system, &history, self.model.supports_images()));
                if needs_summarize(estimated, self.model.context_window(), self.config.summarize_threshold) {
                    history = self
                        .summarize_history(&call.session_id, &system, history, &events)
                        .await;
                }
            }

            let wire = to_wire(&system, &history, self.model.supports_images());
            let req = GenerateRequest {
                messages: wire,
                // The wrap-up turn runs tool-free so the model summarizes
                // instead of starting more work it cannot finish.
                tools: if final_turn { vec![] } else { schemas.clone() },
                sampling: call.sampling.clone(),
                provider_options: call.provider_options.clone(),
            };

            let mut assistant = self.messages.create(
                &call.session_id,
                MessageRole::Assistant,
                vec![],
                self.model.model_name(),
                self.model.name(),
            )?;

            let outcome = self
                .stream_turn(&cancel, &call, &mut assistant, req, &events)
                .await?;

            let tool_calls = assistant.tool_calls();
            let stop = outcome.unwrap_or(if tool_calls.is_empty() {
                StopReason::EndTurn
            } else {
                StopReason::ToolUse
            });

            match stop {
                StopReason::MaxTokens => {
                    assistant.finish(FinishReason::MaxTokens, "output token limit reached", "");
                    let assistant = self.messages.update(assistant)?;
                    let _ = events.send(AgentEvent::TurnComplete).await;
                    return Ok(RunResponse { message: assistant });
                }
                StopReason::ToolUse if !tool_calls.is_empty() && !final_turn => {
                    // Persist the accumulated tool-call parts before any
                    // result may reference them.
                    let assistant = self.messages.update(assistant)?;
                    match self
                        .dispatch_tools(&cancel, &call, &assistant, &events)
                        .await?
                    {
                        DispatchOutcome::Continue(tool_msg) => {
                            history.push(assistant);
                            history.push(tool_msg);
                        }
                        DispatchOutcome::Denied(note) => {
                            let mut assistant = assistant;
                            assistant.finish(FinishReason::PermissionDenied, &note, "");
                            let assistant = self.messages.update(assistant)?;
                            let _ = events.send(AgentEvent::TurnComplete).await;
                            return Ok(RunResponse { message: assistant });
                        }
                    }
                }
                _ => {
                    assistant.finish(FinishReason::EndTurn, "", "");
                    let assistant = self.messages.update(assistant)?;
                    let _ = events.send(AgentEvent::TurnComplete).await;
                    return Ok(RunResponse { message: assistant });
                }
            }
        }
    }

    /// Stream one model turn into `assistant`, persisting at part
    /// boundaries.  Returns the provider's stop reason, or `None` when the
    /// stream ended without one.
    async fn stream_turn(
        &self,
        cancel: &CancellationToken,
        call: &SessionAgentCall,
        assistant: &mut Message,
        req: GenerateRequest,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<Option<StopReason>, AgentError> {
        let mut stream = match self.model.generate(req).await {
            Ok(s) => s,
            Err(e) => {
                assistant.finish(FinishReason::Error, "model request failed", e.to_string());
                let _ = self.messages.update(assistant.clone());
                return Err(AgentError::Provider(e));
            }
        };

        let mut stop = None;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    assistant.finish(FinishReason::Canceled, "canceled by user", "");
                    let _ = self.messages.update(assistant.clone());
                    return Err(AgentError::RequestCancelled);
                }
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            let event = match event {
                Ok(ev) => ev,
                Err(e) => {
                    assistant.finish(FinishReason::Error, "provider stream failed", e.to_string());
                    let _ = self.messages.update(assistant.clone());
                    return Err(AgentError::Provider(e));
                }
            };

            match event {
                StreamEvent::TextDelta(delta) => {
                    assistant.append_text_delta(&delta);
                    let _ = events.send(AgentEvent::TextDelta(delta)).await;
                }
                StreamEvent::ReasoningDelta { text, signature } => {
                    assistant.append_reasoning_delta(&text, signature.as_deref());
                    let _ = events.send(AgentEvent::ReasoningDelta(text)).await;
                }
                StreamEvent::ToolCallStart { id, name } => {
                    if name.is_empty() {
                        warn!(call_id = %id, "dropping tool call with empty name");
                        continue;
                    }
                    assistant.finish_reasoning();
                    assistant.parts.push(Part::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: String::new(),
                        provider_executed: false,
                        finished: false,
                    });
                    *assistant = self.messages.update(assistant.clone())?;
                    let _ = events
                        .send(AgentEvent::ToolCallStarted { call_id: id, name })
                        .await;
                }
                StreamEvent::ToolCallInputDelta { id, json_chunk } => {
                    for part in assistant.parts.iter_mut() {
                        if let Part::ToolCall { id: pid, input, finished: false, .. } = part {
                            if *pid == id {
                                input.push_str(&json_chunk);
                                break;
                            }
                        }
                    }
                }
                StreamEvent::ToolCallEnd { id } => {
                    for part in assistant.parts.iter_mut() {
                        if let Part::ToolCall { id: pid, finished, .. } = part {
                            if *pid == id {
                                *finished = true;
                                break;
                            }
                        }
                    }
                    *assistant = self.messages.update(assistant.clone())?;
                }
                StreamEvent::Usage(usage) => {
                    let session = self.sessions.add_cost(&call.session_id, usage.cost)?;
                    let _ = events
                        .send(AgentEvent::Usage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            cost: usage.cost,
                            total_cost: session.cost,
                        })
                        .await;
                }
                StreamEvent::Finish(reason) => {
                    stop = Some(reason);
                }
                StreamEvent::Error(msg) => {
                    warn!(session = %call.session_id, "provider stream warning: {msg}");
                }
            }
        }

        assistant.finish_reasoning();
        Ok(stop)
    }

    /// Execute every tool call on the finished assistant turn and persist
    /// the results in call order.
    async fn dispatch_tools(
        &self,
        cancel: &CancellationToken,
        call: &SessionAgentCall,
        assistant: &Message,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<DispatchOutcome, AgentError> {
        // Input validation happens before anything side-effectful: a call
        // whose accumulated JSON does not parse becomes an error result the
        // model can read and correct.
        enum Prepared {
            Ready(ToolCall),
            Invalid { id: String, reason: String },
        }
        let prepared: Vec<Prepared> = assistant
            .tool_calls()
            .into_iter()
            .map(|(id, name, input)| {
                let raw = if input.trim().is_empty() { "{}" } else { input.as_str() };
                match serde_json::from_str::<Value>(raw) {
                    Ok(args) if args.is_object() => Prepared::Ready(ToolCall { id, name, args }),
                    Ok(_) => Prepared::Invalid {
                        id,
                        reason: "tool input must be a JSON object".into(),
                    },
                    Err(e) => Prepared::Invalid { id, reason: format!("invalid JSON input: {e}") },
                }
            })
            .collect();

        let ready: Vec<ToolCall> = prepared
            .iter()
            .filter_map(|p| match p {
                Prepared::Ready(c) => Some(c.clone()),
                Prepared::Invalid { .. } => None,
            })
            .collect();

        let ctx = ToolCtx {
            session_id: call.session_id.clone(),
            parent_message_id: assistant.id.clone(),
            tool_call_id: String::new(),
            model_name: self.model.model_name().to_string(),
            supports_images: self.model.supports_images(),
            working_dir: self.working_dir.clone(),
            cancel: cancel.child_token(),
        };

        let mut ready_results = self.tools.dispatch(&ctx, &ready).await.into_iter();

        let mut outputs: Vec<ToolOutput> = Vec::with_capacity(prepared.len());
        let mut denied: Option<String> = None;
        let mut fatal: Option<String> = None;
        for p in prepared {
            match p {
                Prepared::Invalid { id, reason } => {
                    outputs.push(ToolOutput::err(id, reason));
                }
                Prepared::Ready(call) => match ready_results.next().expect("one result per call") {
                    Ok(out) => outputs.push(out),
                    Err(ToolError::PermissionDenied(msg)) => {
                        denied.get_or_insert(msg.clone());
                        outputs.push(ToolOutput::err(&call.id, format!("permission denied: {msg}")));
                    }
                    Err(ToolError::Context(msg)) => {
                        fatal.get_or_insert(msg.clone());
                        outputs.push(ToolOutput::err(&call.id, msg));
                    }
                    Err(ToolError::Fatal(e)) => {
                        fatal.get_or_insert(e.to_string());
                        outputs.push(ToolOutput::err(&call.id, e.to_string()));
                    }
                },
            }
        }

        let names: std::collections::HashMap<String, String> = assistant
            .tool_calls()
            .into_iter()
            .map(|(id, name, _)| (id, name))
            .collect();
        for out in &outputs {
            let _ = events
                .send(AgentEvent::ToolCallFinished {
                    call_id: out.call_id.clone(),
                    name: names.get(&out.call_id).cloned().unwrap_or_default(),
                    output: out.content.clone(),
                    is_error: out.is_error,
                })
                .await;
        }

        if cancel.is_cancelled() {
            // Tools unwound because the user canceled mid-dispatch; the turn
            // ends canceled, whatever the individual tools reported.
            let mut assistant = assistant.clone();
            assistant.finish(FinishReason::Canceled, "canceled by user", "");
            self.messages.update(assistant)?;
            return Err(AgentError::RequestCancelled);
        }
        if let Some(msg) = fatal {
            let mut assistant = assistant.clone();
            assistant.finish(FinishReason::Error, "tool failure", &msg);
            self.messages.update(assistant)?;
            return Err(AgentError::ToolFatal(msg));
        }
        if let Some(note) = denied {
            // No tool-role message is persisted: the denied turn is terminal
            // and its unanswered calls are filtered out of future requests.
            return Ok(DispatchOutcome::Denied(note));
        }

        // Cost roll-up: tools that spawned a child session report it via
        // metadata; the child's terminal cost lands on this session.
        for out in &outputs {
            if let Some(child_id) = out.metadata.get("child_session_id").and_then(|v| v.as_str()) {
                if let Ok(child) = self.sessions.get(child_id) {
                    self.sessions.add_cost(&call.session_id, child.cost)?;
                }
            }
        }

        let parts: Vec<Part> = outputs
            .into_iter()
            .map(|out| Part::ToolResult {
                tool_call_id: out.call_id,
                content: out.content,
                data: None,
                mime: None,
                metadata: out.metadata,
                is_error: out.is_error,
            })
            .collect();
        let tool_msg = self.messages.create(
            &call.session_id,
            MessageRole::Tool,
            parts,
            self.model.model_name(),
            self.model.name(),
        )?;

        Ok(DispatchOutcome::Continue(tool_msg))
    }

    /// Produce a compressed recap on the small model and swap the effective
    /// history to `[summary, last user message]`.  Runs detached from the
    /// request token so a user cancel still lets a short recap land.  Any
    /// failure keeps the original history — the next model call may still
    /// fit, and if not the provider error is surfaced there.
    async fn summarize_history(
        &self,
        session_id: &str,
        system: &str,
        history: Vec<Message>,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Vec<Message> {
        let _ = events.send(AgentEvent::SummarizeStarted).await;
        let wire_before = to_wire(system, &history, false);
        let tokens_before = estimate_tokens(&wire_before);

        let mut wire = wire_before;
        wire.push(WireMessage::user(SUMMARY_PROMPT));
        let req = GenerateRequest { messages: wire, ..Default::default() };

        let mut summary = String::new();
        match self.small_model.generate(req).await {
            Ok(mut stream) => {
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(StreamEvent::TextDelta(d)) => summary.push_str(&d),
                        Ok(StreamEvent::Finish(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("summarization stream failed: {e}");
                            summary.clear();
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("summarization request failed: {e}"),
        }

        if summary.is_empty() {
            warn!(session = session_id, "summarization produced no text; keeping full history");
            return history;
        }

        let mut msg = match self.messages.create(
            session_id,
            MessageRole::Assistant,
            vec![Part::Text { text: summary }],
            self.small_model.model_name(),
            self.small_model.name(),
        ) {
            Ok(m) => m,
            Err(e) => {
                warn!("failed to persist summary: {e}");
                return history;
            }
        };
        msg.is_summary = true;
        msg.finish(FinishReason::EndTurn, "", "");
        let msg = match self.messages.update(msg) {
            Ok(m) => m,
            Err(e) => {
                warn!("failed to finalize summary: {e}");
                return history;
            }
        };

        let mut effective = vec![msg];
        if let Some(last_user) = history.iter().rev().find(|m| m.role == MessageRole::User) {
            effective.push(last_user.clone());
        }
        let tokens_after = estimate_tokens(&to_wire(system, &effective, false));
        let _ = events
            .send(AgentEvent::SummarizeFinished { tokens_before, tokens_after })
            .await;
        effective
    }
}

enum DispatchOutcome {
    /// Tool results persisted; the loop continues with the next model turn.
    Continue(Message),
    /// A permission denial terminated the turn.
    Denied(String),
}

/// RAII marker for the one-run-per-session invariant.
struct BusyGuard {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl BusyGuard {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, session_id: &str) -> Option<Self> {
        if !active.lock().insert(session_id.to_string()) {
            return None;
        }
        Some(Self { active: Arc::clone(active), session_id: session_id.to_string() })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.session_id);
    }
}

fn user_parts(call: &SessionAgentCall) -> Vec<Part> {
    let mut parts = vec![Part::Text { text: call.prompt.clone() }];
    for att in &call.attachments {
        parts.push(Part::Binary {
            mime: att.mime.clone(),
            data: att.data.clone(),
            path: att.path.clone(),
        });
    }
    parts
}

/// Flatten persisted messages into the provider wire format.
///
/// Tool-call parts whose call never received a result (denied or canceled
/// turns) are dropped — providers reject histories with unanswered calls.
/// Reasoning and finish parts are never resent.
fn to_wire(system: &str, history: &[Message], supports_images: bool) -> Vec<WireMessage> {
    let answered: HashSet<&str> = history
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            Part::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    let mut wire = vec![WireMessage::system(system)];
    for msg in history {
        match msg.role {
            MessageRole::System => {}
            MessageRole::User => {
                let mut parts: Vec<ContentPart> = Vec::new();
                for p in &msg.parts {
                    match p {
                        Part::Text { text } => parts.push(ContentPart::text(text.clone())),
                        Part::ImageUrl { url } => {
                            if supports_images {
                                parts.push(ContentPart::image(url.clone()));
                            } else {
                                parts.push(ContentPart::text(format!("[image: {url}]")));
                            }
                        }
                        Part::Binary { mime, data, path } => {
                            if supports_images && mime.starts_with("image/") {
                                parts.push(ContentPart::image(format!("data:{mime};base64,{data}")));
                            } else {
                                parts.push(ContentPart::text(format!("[attachment: {path}]")));
                            }
                        }
                        _ => {}
                    }
                }
                wire.push(WireMessage::user_with_parts(parts));
            }
            MessageRole::Assistant => {
                let text = msg.text();
                if !text.is_empty() {
                    wire.push(WireMessage::assistant(text));
                }
                for (id, name, input) in msg.tool_calls() {
                    if !answered.contains(id.as_str()) {
                        continue;
                    }
                    let input = if input.trim().is_empty() { "{}".to_string() } else { input };
                    wire.push(WireMessage::tool_call(id, name, input));
                }
            }
            MessageRole::Tool => {
                for p in &msg.parts {
                    if let Part::ToolResult { tool_call_id, content, .. } = p {
                        wire.push(WireMessage::tool_result(tool_call_id.clone(), content.clone()));
                    }
                }
            }
        }
    }
    wire
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
