//! Signal metadata cache and coalescing requester.
//!
//! # Purpose
//! The broker addresses streaming subscriptions by numeric signal ids that
//! are only valid for one broker session. [`MetadataAgent`] resolves paths
//! to ids, caches the answers (including negative ones), coalesces
//! overlapping queries onto a single lookup per path, and bounds how many
//! lookups run against the broker at once.
//!
//! # Design notes
//! All bookkeeping lives under one `RwLock`; completion channels are always
//! signalled outside it. Invalidation bumps an epoch instead of cancelling
//! in-flight lookups: a completion whose epoch is stale is simply ignored.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use vsignal_transport::{Code, ListMetadataResponse, Status};

use crate::facade::BrokerFacade;
use crate::pool::{Job, WorkerPool};

/// Broker-assigned identity of one signal path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub path: String,
    pub id: i32,
    /// False when the broker reported the path unknown or access-denied.
    /// Negative answers are cached so the question is not asked again.
    pub known: bool,
}

type QueryReply = oneshot::Sender<Result<Vec<Arc<Metadata>>, Status>>;

struct PendingQuery {
    paths: Vec<String>,
    missing: HashSet<String>,
    reply: QueryReply,
}

#[derive(Default)]
struct AgentState {
    by_path: HashMap<String, Arc<Metadata>>,
    by_id: HashMap<i32, Arc<Metadata>>,
    pending: HashMap<u64, PendingQuery>,
    next_query: u64,
    // Paths waiting for a lookup slot; `queued` mirrors `queue` for O(1)
    // dedup against both the queue and the in-flight set.
    queue: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    epoch: u64,
}

struct AgentInner {
    state: RwLock<AgentState>,
    facade: BrokerFacade,
    pool: WorkerPool,
    max_parallel: usize,
}

/// Shared handle to the metadata cache; clones address the same state.
#[derive(Clone)]
pub struct MetadataAgent {
    inner: Arc<AgentInner>,
}

impl MetadataAgent {
    pub fn new(facade: BrokerFacade, pool: WorkerPool, max_parallel: usize) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                state: RwLock::new(AgentState::default()),
                facade,
                pool,
                max_parallel: max_parallel.max(1),
            }),
        }
    }

    pub fn get_by_path(&self, path: &str) -> Option<Arc<Metadata>> {
        self.inner
            .state
            .read()
            .expect("metadata state lock")
            .by_path
            .get(path)
            .cloned()
    }

    pub fn get_by_id(&self, id: i32) -> Option<Arc<Metadata>> {
        self.inner
            .state
            .read()
            .expect("metadata state lock")
            .by_id
            .get(&id)
            .cloned()
    }

    /// Resolve metadata for `paths`, in request order.
    ///
    /// Fully cached queries resolve without waiting. Otherwise the missing
    /// subset is merged into the lookup queue, deduplicated against paths
    /// already queued or in flight, and the caller waits until every
    /// missing path has an answer.
    pub async fn query(&self, paths: &[String]) -> Result<Vec<Arc<Metadata>>, Status> {
        let (rx, starts, epoch) = {
            let mut state = self.inner.state.write().expect("metadata state lock");
            let missing: HashSet<String> = paths
                .iter()
                .filter(|path| !state.by_path.contains_key(*path))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(Self::assemble(&state, paths));
            }
            for path in &missing {
                if !state.queued.contains(path) && !state.in_flight.contains(path) {
                    state.queued.insert(path.clone());
                    state.queue.push_back(path.clone());
                }
            }
            let (reply, rx) = oneshot::channel();
            let id = state.next_query;
            state.next_query += 1;
            state.pending.insert(
                id,
                PendingQuery {
                    paths: paths.to_vec(),
                    missing,
                    reply,
                },
            );
            let starts = self.pump(&mut state);
            (rx, starts, state.epoch)
        };
        for path in starts {
            self.spawn_lookup(path, epoch);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Status::new(Code::Cancelled, "metadata query abandoned")),
        }
    }

    /// Drop every cached entry and fail every waiting query with `status`.
    ///
    /// In-flight lookups keep running but their completions are ignored:
    /// they belong to a previous epoch.
    pub fn invalidate(&self, status: Status) {
        let withdrawn: Vec<QueryReply> = {
            let mut state = self.inner.state.write().expect("metadata state lock");
            state.by_path.clear();
            state.by_id.clear();
            state.queue.clear();
            state.queued.clear();
            state.in_flight.clear();
            state.epoch += 1;
            state.pending.drain().map(|(_, query)| query.reply).collect()
        };
        if !withdrawn.is_empty() {
            tracing::debug!(queries = withdrawn.len(), "invalidating metadata cache");
        }
        for reply in withdrawn {
            let _ = reply.send(Err(status.clone()));
        }
    }

    fn assemble(state: &AgentState, paths: &[String]) -> Vec<Arc<Metadata>> {
        paths
            .iter()
            .filter_map(|path| state.by_path.get(path).cloned())
            .collect()
    }

    /// Move queued paths into the in-flight set while capacity allows;
    /// returns the paths whose lookups must now be started.
    fn pump(&self, state: &mut AgentState) -> Vec<String> {
        let mut starts = Vec::new();
        while state.in_flight.len() < self.inner.max_parallel {
            let Some(path) = state.queue.pop_front() else {
                break;
            };
            state.queued.remove(&path);
            state.in_flight.insert(path.clone());
            starts.push(path);
        }
        starts
    }

    fn spawn_lookup(&self, path: String, epoch: u64) {
        let agent = self.clone();
        self.inner.pool.enqueue(Job::new(move || async move {
            let result = agent.inner.facade.list_metadata(path.clone()).await;
            agent.complete_lookup(path, epoch, result);
        }));
    }

    fn complete_lookup(
        &self,
        path: String,
        epoch: u64,
        result: Result<ListMetadataResponse, Status>,
    ) {
        let mut completions: Vec<(QueryReply, Vec<Arc<Metadata>>)> = Vec::new();
        let mut failures: Vec<(QueryReply, Status)> = Vec::new();
        let (starts, next_epoch) = {
            let mut state = self.inner.state.write().expect("metadata state lock");
            if epoch != state.epoch {
                tracing::debug!(%path, "dropping metadata answer from a stale epoch");
                return;
            }
            state.in_flight.remove(&path);
            match result {
                Ok(response) => {
                    let metadata = match response.entries.as_slice() {
                        [entry] => Metadata {
                            path: path.clone(),
                            id: entry.id,
                            known: true,
                        },
                        entries => {
                            tracing::warn!(
                                %path,
                                answers = entries.len(),
                                "metadata lookup did not yield exactly one entry, caching as unknown"
                            );
                            Metadata {
                                path: path.clone(),
                                id: 0,
                                known: false,
                            }
                        }
                    };
                    Self::store(&mut state, metadata, &mut completions);
                }
                Err(status) if status.code == Code::DeadlineExceeded => {
                    tracing::debug!(%path, "metadata lookup timed out, requeueing");
                    if !state.queued.contains(&path) {
                        state.queued.insert(path.clone());
                        state.queue.push_back(path.clone());
                    }
                }
                Err(status) if status.is_signal_unknown() => {
                    tracing::warn!(%path, %status, "signal rejected by broker, caching as unknown");
                    let metadata = Metadata {
                        path: path.clone(),
                        id: 0,
                        known: false,
                    };
                    Self::store(&mut state, metadata, &mut completions);
                }
                Err(status) => {
                    // The path stays unresolved and may be looked up again
                    // later; every query waiting on it fails now.
                    tracing::warn!(%path, %status, "metadata lookup failed");
                    let affected: Vec<u64> = state
                        .pending
                        .iter()
                        .filter(|(_, query)| query.missing.contains(&path))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in affected {
                        if let Some(query) = state.pending.remove(&id) {
                            failures.push((query.reply, status.clone()));
                        }
                    }
                }
            }
            (self.pump(&mut state), state.epoch)
        };
        for (reply, resolved) in completions {
            let _ = reply.send(Ok(resolved));
        }
        for (reply, status) in failures {
            let _ = reply.send(Err(status));
        }
        for path in starts {
            self.spawn_lookup(path, next_epoch);
        }
    }

    fn store(
        state: &mut AgentState,
        metadata: Metadata,
        completions: &mut Vec<(QueryReply, Vec<Arc<Metadata>>)>,
    ) {
        let metadata = Arc::new(metadata);
        if metadata.known {
            state.by_id.insert(metadata.id, Arc::clone(&metadata));
        }
        state
            .by_path
            .insert(metadata.path.clone(), Arc::clone(&metadata));
        let mut done = Vec::new();
        for (id, query) in state.pending.iter_mut() {
            query.missing.remove(&metadata.path);
            if query.missing.is_empty() {
                done.push(*id);
            }
        }
        for id in done {
            if let Some(query) = state.pending.remove(&id) {
                let resolved = query
                    .paths
                    .iter()
                    .filter_map(|path| state.by_path.get(path).cloned())
                    .collect();
                completions.push((query.reply, resolved));
            }
        }
    }
}
