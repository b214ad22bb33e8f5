// Signal value model: what a datapoint carries when it can be read, and
// why it cannot be read otherwise.
use serde::{Deserialize, Serialize};

/// Typed signal value as carried by the broker protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(String),
    BoolArray(Vec<bool>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    Uint32Array(Vec<u32>),
    Uint64Array(Vec<u64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

/// Reason a signal currently has no usable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Failure {
    /// The provided value rejected by the backend as out of bounds or
    /// mistyped.
    InvalidValue,
    /// The signal exists but no provider currently publishes it.
    NotAvailable,
    /// The backend does not know the signal at all.
    UnknownSignal,
    /// The caller is not allowed to read the signal.
    AccessDenied,
    /// The backend failed internally while producing the value.
    InternalError,
}

/// Broker timestamp, seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos() as i32,
        }
    }
}

/// One observation of a signal: either a value or the failure standing in
/// for it, stamped with when the broker produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub value: Result<Value, Failure>,
    pub timestamp: Timestamp,
}

impl Datapoint {
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self {
            value: Ok(value),
            timestamp,
        }
    }

    /// Placeholder datapoint synthesized by the SDK when a signal cannot
    /// currently be obtained.
    pub fn failure(failure: Failure) -> Self {
        Self {
            value: Err(failure),
            timestamp: Timestamp::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.value.is_err()
    }
}
