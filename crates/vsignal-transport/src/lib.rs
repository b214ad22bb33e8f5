//! Transport seam for the vsignal data broker SDK.
//!
//! # Purpose
//! Defines the narrow interface between the SDK core and whatever RPC
//! machinery actually talks to the data broker: the status/value model,
//! the per-call request and response shapes, and the [`BrokerTransport`]
//! trait a concrete transport implements.
//!
//! # Design notes
//! Wire marshalling lives entirely on the far side of [`BrokerTransport`].
//! The SDK core never sees protobufs or frames, only these plain types, so
//! transports can be swapped (gRPC, in-process fakes for tests) without
//! touching the runtime.

mod status;
mod value;

pub use status::{Code, Status};
pub use value::{Datapoint, Failure, Timestamp, Value};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Ordered key/value pairs attached to every outgoing call.
///
/// A deployment-specific hook (service mesh auth, tracing baggage) fills
/// this in per call; the transport forwards it verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    entries: Vec<(String, String)>,
}

impl CallMetadata {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a set of signals by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub paths: Vec<String>,
}

/// Datapoints positionally aligned with the request paths.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub datapoints: Vec<Datapoint>,
}

/// Batch-actuate a set of signals.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuateRequest {
    pub entries: Vec<(String, Value)>,
}

/// Per-path rejection messages; empty means every actuation succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActuateResponse {
    pub errors: Vec<(String, String)>,
}

/// Resolve broker-assigned metadata for one signal subtree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMetadataRequest {
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub path: String,
    pub id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMetadataResponse {
    pub entries: Vec<MetadataEntry>,
}

/// Open a streaming subscription addressed by numeric signal ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeByIdRequest {
    pub ids: Vec<i32>,
}

/// One streamed update: the subset of subscribed signals that changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeUpdate {
    pub entries: Vec<(i32, Datapoint)>,
}

/// Stream of subscription updates.
///
/// A well-behaved transport yields `Err(status)` exactly once as the
/// terminal item. A stream that simply ends is treated by consumers as a
/// transient session loss (`Code::Ok`).
pub type UpdateStream = BoxStream<'static, Result<SubscribeUpdate, Status>>;

/// The RPC surface the SDK core drives.
///
/// Implementations own connection management and marshalling; every method
/// is one logical call against the broker. Completions may arrive on any
/// task, so implementations must be `Send + Sync`.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn get(&self, meta: CallMetadata, req: GetRequest) -> Result<GetResponse, Status>;

    async fn actuate(
        &self,
        meta: CallMetadata,
        req: ActuateRequest,
    ) -> Result<ActuateResponse, Status>;

    async fn list_metadata(
        &self,
        meta: CallMetadata,
        req: ListMetadataRequest,
    ) -> Result<ListMetadataResponse, Status>;

    async fn subscribe_by_id(
        &self,
        meta: CallMetadata,
        req: SubscribeByIdRequest,
    ) -> Result<UpdateStream, Status>;
}
