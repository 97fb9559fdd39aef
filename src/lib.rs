//! Conversation sessions over chat-completion providers.
//!
//! v0 surface:
//! - `Session` with plain (`respond`) and structured (`respond_as`) completion
//! - Adaptive completion loop that drops JSON mode or tool calling once when
//!   the provider rejects them
//! - Typed tools whose argument schema is inferred from their serde impls
//! - OpenAI-compatible `HttpTransport`

pub mod error;
pub mod llm;
pub mod schema;
pub mod session;
pub mod tools;
pub mod transcript;

pub use error::{GenerationError, SchemaError, ToolError, TransportError};
pub use llm::{
    GenerationOptions, HttpTransport, HttpTransportConfig, Message, ProviderRequest,
    ProviderResponse, ResponseFormat, ToolCall, Transport,
};
pub use schema::{Kind, Schema, infer};
pub use session::{LoopState, MAX_ITERATIONS, Session, SessionBuilder, SessionConfig};
pub use tools::{Tool, ToolRegistry, ToolSpec};
pub use transcript::{Entry, Transcript};
