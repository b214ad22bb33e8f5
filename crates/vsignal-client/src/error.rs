// Error taxonomy of the SDK surface.
//
// Four families with distinct handling:
// - Usage: the caller mixed the blocking and callback consumption modes
//   of one result object; surfaced synchronously at the violating call.
// - Transport: session-scoped loss; the subscription runtime invalidates
//   cached ids and resubscribes with backoff.
// - Backend: per-signal verdicts (unknown, access denied); cached and
//   surfaced once as placeholder values, never retried.
// - Unexpected: everything else; terminates the affected operation.
// - Shutdown: the context's worker pool has stopped; nothing that needs
//   it can be started.
use vsignal_transport::Status;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SdkError {
    #[error("invalid usage: {0}")]
    Usage(&'static str),
    #[error("transport failure: {0}")]
    Transport(Status),
    #[error("backend rejected signal: {0}")]
    Backend(Status),
    #[error("unexpected failure: {0}")]
    Unexpected(Status),
    #[error("sdk context shut down")]
    Shutdown,
}

impl SdkError {
    /// Classify an RPC status into the taxonomy above.
    pub fn from_status(status: Status) -> Self {
        if status.is_transient() {
            SdkError::Transport(status)
        } else if status.is_signal_unknown() {
            SdkError::Backend(status)
        } else {
            SdkError::Unexpected(status)
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            SdkError::Transport(s) | SdkError::Backend(s) | SdkError::Unexpected(s) => Some(s),
            SdkError::Usage(_) | SdkError::Shutdown => None,
        }
    }
}
