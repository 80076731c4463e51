// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Events emitted by the agent during a run.
/// Consumers (CLI runner, UI) subscribe to these to drive their output.
/// Emission is best-effort: a consumer that stops reading never blocks the
/// turn loop.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A reasoning/extended-thinking chunk
    ReasoningDelta(String),
    /// The model has requested a tool call
    ToolCallStarted { call_id: String, name: String },
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// Token usage for the completed model turn
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
        /// Session cost after this update, children included
        total_cost: f64,
    },
    /// Auto-summarization started (context window near its limit)
    SummarizeStarted,
    /// Auto-summarization finished; the next turn uses the compressed history
    SummarizeFinished {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// The run finished processing the user prompt
    TurnComplete,
}
