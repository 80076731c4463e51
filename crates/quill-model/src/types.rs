use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Used for user messages that mix text with images.  Images are always
/// represented as data URLs (`data:<mime>;base64,<b64>`) or HTTPS URLs for
/// providers that accept remote references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image {
        /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
        image_url: String,
    },
}

impl ContentPart {
    /// Convenience constructor for a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Convenience constructor for an image part.
    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into() }
    }
}

/// Content returned by a tool – either a plain string or structured parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ToolResultContent {
    /// Lossy conversion to plain text (images are omitted).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(_) => None,
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the wire-format conversation sent to a provider.
///
/// This is the *provider* view of the conversation.  The persisted message
/// model (with its richer part structure) lives in `quill-store`; the agent
/// flattens it into this form when building a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: WireContent,
}

impl WireMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: WireContent::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: WireContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: WireContent::Text(text.into()) }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: WireContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall { name: name.into(), arguments: arguments.into() },
            },
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: WireContent::ToolResult {
                tool_call_id: id.into(),
                content: ToolResultContent::Text(content.into()),
            },
        }
    }

    /// Construct a user message from a list of content parts (text + images).
    ///
    /// A single text item collapses to `WireContent::Text` for cleaner
    /// provider serialization.
    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.is_empty() {
            WireContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                WireContent::Text(text.clone())
            } else {
                WireContent::Parts(parts)
            }
        } else {
            WireContent::Parts(parts)
        };
        Self { role: Role::User, content }
    }

    /// Return the plain text of this message, if it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            WireContent::Text(t) => Some(t),
            WireContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Approximate token count used for context management.
    ///
    /// Uses a 4-chars-per-token heuristic for text; images use a flat 765
    /// token estimate (the typical provider estimate for a 512×512 region).
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            WireContent::Text(t) => t.len(),
            WireContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { .. } => 765 * 4,
                })
                .sum(),
            WireContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            WireContent::ToolResult { content, .. } => match content {
                ToolResultContent::Text(t) => t.len(),
                ToolResultContent::Parts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => text.len(),
                        ContentPart::Image { .. } => 765 * 4,
                    })
                    .sum(),
            },
        };
        (chars / 4).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a wire message.
///
/// - `Text` – simple string (most messages)
/// - `Parts` – mixed text + image parts for multimodal user turns
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the result of a tool call, optionally with image parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: ToolResultContent,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Sampling parameters forwarded with every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// Request sent to a language model.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub messages: Vec<WireMessage>,
    pub tools: Vec<ToolSchema>,
    pub sampling: SamplingParams,
    /// Free-form provider-specific options forwarded as-is to the driver.
    pub provider_options: serde_json::Value,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown,
}

/// Token usage and cost from one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Dollar cost of the turn as reported by the provider (0.0 when the
    /// provider does not report cost).
    pub cost: f64,
}

/// A single streamed event from the model.
///
/// Tool-call input arrives incrementally: `ToolCallStart` opens a call,
/// `ToolCallInputDelta` appends raw JSON fragments, and `ToolCallEnd`
/// closes it.  Providers that deliver whole tool calls in one chunk emit
/// the three events back-to-back.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A reasoning/extended-thinking chunk
    ReasoningDelta {
        text: String,
        /// Provider signature for the reasoning block, when one is issued
        signature: Option<String>,
    },
    /// The model opened a tool call
    ToolCallStart { id: String, name: String },
    /// A fragment of the tool call's JSON input
    ToolCallInputDelta { id: String, json_chunk: String },
    /// The tool call's input is complete
    ToolCallEnd { id: String },
    /// Usage statistics (typically the final content-bearing event)
    Usage(Usage),
    /// The stream finished
    Finish(StopReason),
    /// A recoverable provider error (non-fatal warning)
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = WireMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_tool_result_sets_role_and_content() {
        let m = WireMessage::tool_result("id-1", "output");
        assert_eq!(m.role, Role::Tool);
        match &m.content {
            WireContent::ToolResult { tool_call_id, content } => {
                assert_eq!(tool_call_id, "id-1");
                assert_eq!(content.as_text(), Some("output"));
            }
            _ => panic!("wrong content variant"),
        }
    }

    #[test]
    fn user_with_single_text_part_collapses() {
        let m = WireMessage::user_with_parts(vec![ContentPart::text("hi")]);
        assert_eq!(m.as_text(), Some("hi"));
    }

    #[test]
    fn user_with_image_part_keeps_parts() {
        let m = WireMessage::user_with_parts(vec![
            ContentPart::text("what is this?"),
            ContentPart::image("data:image/png;base64,XYZ"),
        ]);
        assert!(m.as_text().is_none());
        assert!(matches!(m.content, WireContent::Parts(ref p) if p.len() == 2));
    }

    #[test]
    fn approx_tokens_text_divides_by_four() {
        let m = WireMessage::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = WireMessage::user("hi");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_tool_call_uses_name_plus_args() {
        let m = WireMessage::tool_call("id", "aaaa", "bbbbbbbb");
        assert_eq!(m.approx_tokens(), 3);
    }

    #[test]
    fn approx_tokens_image_part_uses_flat_estimate() {
        let m = WireMessage::user_with_parts(vec![ContentPart::image("data:image/png;base64,A")]);
        assert_eq!(m.approx_tokens(), 765);
    }

    #[test]
    fn message_serialises_and_deserialises() {
        let original = WireMessage::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.as_text(), Some("test payload"));
    }
}
