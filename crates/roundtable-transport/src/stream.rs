//! The wire-shape-independent unit every stream parser yields.
//!
//! Both Anthropic-style event-typed SSE and OpenAI-style `delta.content`/
//! `delta.tool_calls` SSE funnel through a [`crate::sse::StreamParser`] into
//! this single enum, so [`crate::transport::ChatTransport`] only ever has to
//! reason about one shape regardless of which backend is talking.

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkDelta {
    /// Incremental visible text content.
    Content { text: String },
    /// Incremental extended-reasoning/thinking content.
    Reasoning { text: String },
    /// A fragment of one tool call, aggregated by `index` across chunks the
    /// way OpenAI-compatible backends stream `delta.tool_calls[i]`.
    ToolCallFragment {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: String,
    },
    /// Stream finished normally.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
    },
    /// Stream-level error surfaced by the wire (not a transport/network error).
    Error { message: String },
}
