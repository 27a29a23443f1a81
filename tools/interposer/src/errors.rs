use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// A failure raised by a real collaborator call.
///
/// This is the value recorded as an outcome's exception and raised again,
/// unchanged, when the outcome is played back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub detail: Value,
}

impl CallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Error)]
pub enum InterposerError {
    #[error("cannot wrap {0}")]
    Wrapping(String),
    #[error("cannot canonicalize value of kind `{kind}`")]
    Canonicalization { kind: String },
    #[error("playback error: {0}")]
    Playback(String),
    #[error("recording not found: {}", .0.display())]
    StoreNotFound(PathBuf),
    #[error("recording format {found} cannot be used here (expected {expected})")]
    IncompatibleFormat { found: u32, expected: u32 },
    #[error("interposer is closed")]
    Closed,
    #[error("interposer is already open")]
    AlreadyOpen,
    #[error("{owner} has no member `{name}`")]
    MissingMember { owner: String, name: String },
    #[error("{0} is not callable")]
    NotCallable(String),
    #[error("call denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("database error: {0}")]
    Database(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
}

impl InterposerError {
    /// The recorded or live collaborator failure, if this is one.
    pub fn as_call(&self) -> Option<&CallError> {
        match self {
            Self::Call(error) => Some(error),
            _ => None,
        }
    }
}
