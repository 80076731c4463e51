// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use quill_model::WireMessage;

/// Instruction sent to the small model to compress the conversation.
pub(crate) const SUMMARY_PROMPT: &str = "\
Write a compressed recap of this conversation for your own future reference. \
Include: the user's goal, key decisions made so far, files read or modified \
(with paths), commands run and their outcomes, and what remains to be done. \
Write it as dense prose; do not call any tools.";

/// Approximate token count of a prepared request (the system prompt is
/// already the first wire message), using the 4-chars-per-token heuristic
/// each message applies to its own content.
pub(crate) fn estimate_tokens(messages: &[WireMessage]) -> usize {
    messages.iter().map(|m| m.approx_tokens()).sum()
}

/// Whether the next turn is projected to exceed the summarization trigger.
pub(crate) fn needs_summarize(
    estimated_tokens: usize,
    context_window: usize,
    threshold: f32,
) -> bool {
    if context_window == 0 {
        return false;
    }
    (estimated_tokens as f32) >= (context_window as f32) * threshold
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
