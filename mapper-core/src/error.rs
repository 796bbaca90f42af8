use thiserror::Error;

/// Semantic error kinds surfaced by the core data model and pipeline.
///
/// None of these unwind past a public entry point: callers get a `Result`,
/// or (for messages arriving off the wire) the offending atom/update is
/// dropped and processing continues with the next one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapperError {
    #[error("malformed message: {0}")]
    ProtocolParse(String),

    #[error("type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch { expected: String, actual: String },

    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("map would create a feedback loop through {0}")]
    LoopDetected(String),

    #[error("link to device {0} timed out")]
    LinkTimeout(String),

    #[error("expression compile failed: {0}")]
    ExpressionCompile(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

pub type Result<T> = std::result::Result<T, MapperError>;
