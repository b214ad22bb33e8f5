// RPC status model shared by the transport seam and the SDK core.
use serde::{Deserialize, Serialize};

/// gRPC-shaped status codes, reduced to the subset the broker protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unavailable,
    Internal,
    Unauthenticated,
}

/// Outcome of one RPC against the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Session-scoped failures that a resubscribe can heal.
    ///
    /// `Ok` counts: a stream that ends cleanly mid-subscription means the
    /// backend went away, not that the subscription is done.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, Code::Ok | Code::Unavailable)
    }

    /// Failures meaning the signal itself is unusable, stable per backend
    /// contract: cache the verdict, never retry.
    pub fn is_signal_unknown(&self) -> bool {
        matches!(self.code, Code::NotFound | Code::PermissionDenied)
    }
}
