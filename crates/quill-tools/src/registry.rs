// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// A tool schema handed to the model layer – mirrors the model crate's
/// schema type but keeps this crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools, and the dispatcher that
/// executes a turn's worth of calls with the required ordering guarantees.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a single call.
    pub async fn execute(
        &self,
        ctx: &ToolCtx,
        call: &ToolCall,
    ) -> Result<ToolOutput, ToolError> {
        ctx.validate()?;
        match self.tools.get(&call.name) {
            Some(tool) => tool.invoke(ctx, call).await,
            None => Ok(ToolOutput::err(
                &call.id,
                format!("unknown tool: {}", call.name),
            )),
        }
    }

    /// Execute every call emitted in one model turn.
    ///
    /// Parallel-safe tools run concurrently on spawned tasks; the rest run
    /// sequentially in call order.  The returned vector preserves the
    /// original call order regardless of completion order, so tool results
    /// serialize back to the conversation in the order the model issued
    /// them.
    pub async fn dispatch(
        &self,
        ctx: &ToolCtx,
        calls: &[ToolCall],
    ) -> Vec<Result<ToolOutput, ToolError>> {
        let mut slots: Vec<Option<Result<ToolOutput, ToolError>>> =
            (0..calls.len()).map(|_| None).collect();

        // Phase 1: spawn all parallel-safe calls.
        let mut running: Vec<(usize, tokio::task::JoinHandle<Result<ToolOutput, ToolError>>)> =
            Vec::new();
        for (i, call) in calls.iter().enumerate() {
            let tool = match self.tools.get(&call.name) {
                Some(t) if t.parallel_safe() => Arc::clone(t),
                _ => continue,
            };
            let call = call.clone();
            let call_ctx = ctx.for_call(&call.id);
            running.push((
                i,
                tokio::spawn(async move {
                    call_ctx.validate()?;
                    tool.invoke(&call_ctx, &call).await
                }),
            ));
        }

        // Phase 2: run the serialized calls in order on this task.
        for (i, call) in calls.iter().enumerate() {
            let serialized = match self.tools.get(&call.name) {
                Some(t) => !t.parallel_safe(),
                None => true,
            };
            if !serialized {
                continue;
            }
            let call_ctx = ctx.for_call(&call.id);
            slots[i] = Some(self.execute(&call_ctx, call).await);
        }

        // Phase 3: join the spawned tasks, slotting results by call index.
        for (i, task) in running {
            slots[i] = Some(match task.await {
                Ok(result) => result,
                // Task panicked — surface as a non-fatal tool error so one
                // bad tool cannot take down the whole turn.
                Err(e) => Ok(ToolOutput::err(
                    &calls[i].id,
                    format!("tool execution panicked: {e}"),
                )),
            });
        }

        slots
            .into_iter()
            .map(|s| s.expect("every call slot is filled by one of the phases"))
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
