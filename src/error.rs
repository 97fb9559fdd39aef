use std::fmt::Display;

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
    #[error("type nests deeper than {depth} levels; recursive types are not supported")]
    UnsupportedRecursiveSchema { depth: usize },
    #[error("schema inference failed: {0}")]
    Inference(String),
}

impl serde::de::Error for SchemaError {
    fn custom<T: Display>(msg: T) -> Self {
        SchemaError::Inference(msg.to_string())
    }
}

impl serde::ser::Error for SchemaError {
    fn custom<T: Display>(msg: T) -> Self {
        SchemaError::Inference(msg.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransportError {
    /// The provider refused the request shape (HTTP 400/422).
    #[error("provider rejected request: {0}")]
    RejectedRequest(String),
    /// Any other 4xx: auth, quota, rate limits, unknown routes.
    #[error("provider refused request ({status}): {message}")]
    Refused { status: u16, message: String },
    #[error("transport configuration error: {0}")]
    Config(String),
    #[error("provider unreachable: {0}")]
    Network(String),
    #[error("provider server error: {0}")]
    ServerError(String),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum GenerationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("unexpected provider response: {0}")]
    UnexpectedResponse(String),
    #[error("structured response did not match target type: {message}")]
    SchemaDecodeFailed { message: String, raw: String },
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsExceeded { max_iterations: u32 },
    #[error("session configuration error: {0}")]
    Config(String),
}
