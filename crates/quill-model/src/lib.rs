// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod facade;
mod mock;
pub(crate) mod openai_compat;
mod types;

pub use facade::{from_config, EventStream, LanguageModel};
pub use mock::{MockModel, ScriptedModel};
pub use openai_compat::OpenAiCompatModel;
pub use types::*;
