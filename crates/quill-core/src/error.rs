// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Failures surfaced by [`crate::SessionAgent::run`].
///
/// Tool validation problems never appear here — they are fed back to the
/// model inside tool results.  A permission denial also does not error the
/// run: it finalizes the turn with a permission-denied marker and returns
/// the message normally.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("session missing: {0}")]
    SessionMissing(String),
    #[error("session {0} already has an active run")]
    SessionBusy(String),
    #[error("request canceled")]
    RequestCancelled,
    #[error("tool failed: {0}")]
    ToolFatal(String),
    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),
    #[error("persistence error: {0}")]
    Persistence(#[from] quill_store::StoreError),
}
