//! Text-policy layer over assistant output: abort detectors, the meta-token
//! sanitizer, tag parsing, and inline tool-call extraction.

pub mod detectors;
pub mod sanitizer;
pub mod tags;
pub mod tool_calls;

pub use detectors::{AbortDetector, DetectorContext, DetectorHit, DetectorRegistry};
pub use sanitizer::Sanitizer;
pub use tags::{Tag, TagKind, TagParseResult};
pub use tool_calls::{ExtractedToolCall, ToolCallExtraction};
