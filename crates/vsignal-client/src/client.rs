//! Data broker client facade.
//!
//! # Purpose
//! [`DataBrokerClient`] is the entry point an application holds: typed
//! reads, batch actuation and resilient subscriptions over one transport,
//! sharing one worker pool and one metadata cache.

use std::collections::HashMap;
use std::sync::Arc;

use vsignal_transport::{BrokerTransport, CallMetadata, Code, Status, Value};

use crate::config::SdkConfig;
use crate::context::SdkContext;
use crate::error::SdkError;
use crate::facade::BrokerFacade;
use crate::metadata::{Metadata, MetadataAgent};
use crate::result::{AsyncResult, AsyncSubscription};
use crate::subscription::{SignalEntry, Snapshot, SubscriptionSupervisor};

pub struct DataBrokerClient {
    context: Arc<SdkContext>,
    facade: BrokerFacade,
    metadata: MetadataAgent,
}

impl DataBrokerClient {
    /// Build a client with its own context. Must run inside a tokio
    /// runtime; the worker tasks are spawned here.
    pub fn new(transport: Arc<dyn BrokerTransport>, config: SdkConfig) -> Self {
        let context = SdkContext::new(config);
        Self::with_context(transport, context)
    }

    /// Build a client over an existing context, sharing its worker pool.
    pub fn with_context(transport: Arc<dyn BrokerTransport>, context: Arc<SdkContext>) -> Self {
        let facade = BrokerFacade::new(transport);
        let metadata = MetadataAgent::new(
            facade.clone(),
            context.pool().clone(),
            context.config().max_parallel_metadata_lookups,
        );
        Self {
            context,
            facade,
            metadata,
        }
    }

    /// Install the hook run against the metadata of every outgoing call.
    pub fn set_call_decorator(&self, hook: impl Fn(&mut CallMetadata) + Send + Sync + 'static) {
        self.facade.set_call_decorator(hook);
    }

    pub fn context(&self) -> &Arc<SdkContext> {
        &self.context
    }

    /// Resolve broker metadata for `paths` (cached, coalesced).
    pub async fn resolve_metadata(&self, paths: &[String]) -> Result<Vec<Arc<Metadata>>, SdkError> {
        // Lookups run as pool jobs; a stopped pool would leave the query
        // waiting forever.
        if !self.context.pool().is_running() {
            return Err(SdkError::Shutdown);
        }
        self.metadata
            .query(paths)
            .await
            .map_err(SdkError::from_status)
    }

    /// Read the current datapoints of `paths` in one round trip.
    ///
    /// The delivered snapshot marks every entry as updated; a response
    /// that is not positionally aligned with the request fails the result.
    pub fn get_values(&self, paths: Vec<String>) -> AsyncResult<Snapshot> {
        let result = AsyncResult::new(self.context.pool().clone());
        let settle = result.clone();
        let facade = self.facade.clone();
        tokio::spawn(async move {
            match facade.get(paths.clone()).await {
                Ok(response) if response.datapoints.len() == paths.len() => {
                    let snapshot: Snapshot = paths
                        .into_iter()
                        .zip(response.datapoints)
                        .map(|(path, datapoint)| {
                            (
                                path,
                                SignalEntry {
                                    datapoint,
                                    updated: true,
                                },
                            )
                        })
                        .collect();
                    settle.fulfill(snapshot);
                }
                Ok(response) => {
                    settle.fail(Status::new(
                        Code::Internal,
                        format!(
                            "broker answered {} datapoints for {} paths",
                            response.datapoints.len(),
                            paths.len()
                        ),
                    ));
                }
                Err(status) => settle.fail(status),
            }
        });
        result
    }

    /// Actuate a batch of signals. The resolved map carries one message
    /// per rejected path; an empty map means every actuation succeeded.
    pub fn set_values(&self, entries: Vec<(String, Value)>) -> AsyncResult<HashMap<String, String>> {
        let result = AsyncResult::new(self.context.pool().clone());
        let settle = result.clone();
        let facade = self.facade.clone();
        tokio::spawn(async move {
            match facade.actuate(entries).await {
                Ok(response) => settle.fulfill(response.errors.into_iter().collect()),
                Err(status) => settle.fail(status),
            }
        });
        result
    }

    /// Open a resilient subscription on `paths`; survives broker restarts
    /// by resubscribing with capped exponential backoff.
    pub fn subscribe(&self, paths: Vec<String>) -> AsyncSubscription<Snapshot> {
        if paths.is_empty() {
            let subscription = AsyncSubscription::new(self.context.pool().clone());
            subscription.insert_error(Status::new(
                Code::InvalidArgument,
                "subscription requires at least one signal path",
            ));
            return subscription;
        }
        SubscriptionSupervisor::spawn(
            paths,
            self.facade.clone(),
            self.metadata.clone(),
            self.context.pool().clone(),
            self.context.config().clone(),
        )
    }
}
