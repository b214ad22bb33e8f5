// Typed RPC facade over the transport seam.
//
// Centralizes the per-call metadata decoration so no caller builds a
// request without running the deployment hook.
use std::sync::{Arc, RwLock};

use vsignal_transport::{
    ActuateRequest, ActuateResponse, BrokerTransport, CallMetadata, GetRequest, GetResponse,
    ListMetadataRequest, ListMetadataResponse, Status, SubscribeByIdRequest, UpdateStream, Value,
};

/// Hook run against the metadata of every outgoing call.
pub type CallDecorator = Arc<dyn Fn(&mut CallMetadata) + Send + Sync>;

/// Thin typed wrapper over a [`BrokerTransport`].
#[derive(Clone)]
pub struct BrokerFacade {
    transport: Arc<dyn BrokerTransport>,
    decorator: Arc<RwLock<Option<CallDecorator>>>,
}

impl BrokerFacade {
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            transport,
            decorator: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the hook applied to every subsequent call; replaces any
    /// previous hook.
    pub fn set_call_decorator(&self, decorator: impl Fn(&mut CallMetadata) + Send + Sync + 'static) {
        *self.decorator.write().expect("decorator lock") = Some(Arc::new(decorator));
    }

    fn call_metadata(&self) -> CallMetadata {
        let mut meta = CallMetadata::default();
        if let Some(decorator) = self.decorator.read().expect("decorator lock").as_ref() {
            decorator(&mut meta);
        }
        meta
    }

    pub async fn get(&self, paths: Vec<String>) -> Result<GetResponse, Status> {
        self.transport
            .get(self.call_metadata(), GetRequest { paths })
            .await
    }

    pub async fn actuate(&self, entries: Vec<(String, Value)>) -> Result<ActuateResponse, Status> {
        self.transport
            .actuate(self.call_metadata(), ActuateRequest { entries })
            .await
    }

    pub async fn list_metadata(&self, root: String) -> Result<ListMetadataResponse, Status> {
        self.transport
            .list_metadata(self.call_metadata(), ListMetadataRequest { root })
            .await
    }

    pub async fn subscribe_by_id(&self, ids: Vec<i32>) -> Result<UpdateStream, Status> {
        self.transport
            .subscribe_by_id(self.call_metadata(), SubscribeByIdRequest { ids })
            .await
    }
}
