// Scripted in-process transport used by the crate's tests.
//
// Every RPC pops a pre-scripted outcome; an unscripted call answers with
// an Internal status so the offending test fails loudly instead of
// hanging. Metadata lookups can be gated open/closed to observe
// coalescing and concurrency limits.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use vsignal_transport::{
    ActuateRequest, ActuateResponse, BrokerTransport, CallMetadata, GetRequest, GetResponse,
    ListMetadataRequest, ListMetadataResponse, MetadataEntry, Status, SubscribeByIdRequest,
    SubscribeUpdate, UpdateStream,
};
use vsignal_transport::{Code, Datapoint, Timestamp, Value};

enum SubscribeScript {
    Fail(Status),
    Channel(mpsc::UnboundedReceiver<Result<SubscribeUpdate, Status>>),
}

#[derive(Default)]
struct MockState {
    get_responses: VecDeque<Result<GetResponse, Status>>,
    actuate_responses: VecDeque<Result<ActuateResponse, Status>>,
    lookups: HashMap<String, VecDeque<Result<ListMetadataResponse, Status>>>,
    lookup_calls: Vec<String>,
    lookup_active: usize,
    lookup_peak: usize,
    subscribes: VecDeque<SubscribeScript>,
    subscribe_calls: Vec<Vec<i32>>,
    metadata_seen: Vec<CallMetadata>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    lookup_gate: watch::Sender<bool>,
}

fn unscripted(what: &str) -> Status {
    Status::new(Code::Internal, format!("unscripted {what} call"))
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            lookup_gate: watch::Sender::new(true),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock")
    }

    pub fn script_get(&self, response: Result<GetResponse, Status>) {
        self.lock().get_responses.push_back(response);
    }

    pub fn script_actuate(&self, response: Result<ActuateResponse, Status>) {
        self.lock().actuate_responses.push_back(response);
    }

    pub fn script_lookup(&self, path: &str, response: Result<ListMetadataResponse, Status>) {
        self.lock()
            .lookups
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    /// Script a lookup that resolves `path` to `id`.
    pub fn known(&self, path: &str, id: i32) {
        self.script_lookup(
            path,
            Ok(ListMetadataResponse {
                entries: vec![MetadataEntry {
                    path: path.to_string(),
                    id,
                }],
            }),
        );
    }

    /// Script a lookup that answers with zero entries.
    pub fn unknown(&self, path: &str) {
        self.script_lookup(path, Ok(ListMetadataResponse::default()));
    }

    /// Close the lookup gate: lookups enter (and count) but do not answer
    /// until released.
    pub fn hold_lookups(&self) {
        self.lookup_gate.send_replace(false);
    }

    pub fn release_lookups(&self) {
        self.lookup_gate.send_replace(true);
    }

    pub fn lookup_count(&self) -> usize {
        self.lock().lookup_calls.len()
    }

    /// Highest number of lookups that were in flight at the same time.
    pub fn lookup_peak(&self) -> usize {
        self.lock().lookup_peak
    }

    pub fn script_subscribe_err(&self, status: Status) {
        self.lock().subscribes.push_back(SubscribeScript::Fail(status));
    }

    /// Script a subscription fed by the returned sender; dropping the
    /// sender ends the stream without a terminal status.
    pub fn script_subscribe_channel(
        &self,
    ) -> mpsc::UnboundedSender<Result<SubscribeUpdate, Status>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribes.push_back(SubscribeScript::Channel(rx));
        tx
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<i32>> {
        self.lock().subscribe_calls.clone()
    }

    pub fn metadata_seen(&self) -> Vec<CallMetadata> {
        self.lock().metadata_seen.clone()
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn get(&self, meta: CallMetadata, _req: GetRequest) -> Result<GetResponse, Status> {
        let mut state = self.lock();
        state.metadata_seen.push(meta);
        state.get_responses.pop_front().unwrap_or(Err(unscripted("get")))
    }

    async fn actuate(
        &self,
        meta: CallMetadata,
        _req: ActuateRequest,
    ) -> Result<ActuateResponse, Status> {
        let mut state = self.lock();
        state.metadata_seen.push(meta);
        state
            .actuate_responses
            .pop_front()
            .unwrap_or(Err(unscripted("actuate")))
    }

    async fn list_metadata(
        &self,
        _meta: CallMetadata,
        req: ListMetadataRequest,
    ) -> Result<ListMetadataResponse, Status> {
        {
            let mut state = self.lock();
            state.lookup_calls.push(req.root.clone());
            state.lookup_active += 1;
            state.lookup_peak = state.lookup_peak.max(state.lookup_active);
        }
        let mut gate = self.lookup_gate.subscribe();
        gate.wait_for(|open| *open).await.expect("lookup gate");
        let mut state = self.lock();
        state.lookup_active -= 1;
        state
            .lookups
            .get_mut(&req.root)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Err(unscripted("list_metadata")))
    }

    async fn subscribe_by_id(
        &self,
        _meta: CallMetadata,
        req: SubscribeByIdRequest,
    ) -> Result<UpdateStream, Status> {
        let script = {
            let mut state = self.lock();
            state.subscribe_calls.push(req.ids.clone());
            state.subscribes.pop_front()
        };
        match script {
            Some(SubscribeScript::Fail(status)) => Err(status),
            Some(SubscribeScript::Channel(mut rx)) => {
                Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
            }
            None => Err(unscripted("subscribe_by_id")),
        }
    }
}

/// Datapoint carrying a float value, for test updates.
pub fn float_dp(value: f32) -> Datapoint {
    Datapoint::new(Value::Float(value), Timestamp::now())
}
