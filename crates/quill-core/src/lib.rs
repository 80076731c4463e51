// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod error;
mod events;
mod prompts;
mod subagent;
mod summarize;

pub use agent::{Attachment, RunResponse, SessionAgent, SessionAgentCall};
pub use error::AgentError;
pub use events::AgentEvent;
pub use prompts::{subagent_prompt, system_prompt};
pub use subagent::{AgentTool, AgenticFetchTool, SubAgentDeps};
