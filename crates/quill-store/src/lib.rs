// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod history;
mod message;
mod pubsub;
mod session;

pub use error::{StoreError, StoreResult};
pub use history::{FileHistoryStore, FileVersion};
pub use message::{FinishReason, Message, MessageRole, MessageStore, Part};
pub use pubsub::{Broker, Event, EventKind};
pub use session::{agent_tool_session_id, Session, SessionStore, Todo, TodoStatus};
