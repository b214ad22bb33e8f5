//! Restart-resilient subscription runtime.
//!
//! # Purpose
//! Drives one streaming subscription end to end: resolves paths to ids,
//! opens the id-addressed stream, folds updates into a per-path snapshot,
//! and survives broker restarts by resubscribing with capped exponential
//! backoff. Consumers only ever see the [`AsyncSubscription`] of merged
//! snapshots.
//!
//! # Design notes
//! Numeric signal ids die with the broker session, so every transient loss
//! invalidates the metadata cache before resubscribing. The retry wait is a
//! delayed pool job, never a sleeping worker. A session sequence number
//! makes events from an abandoned session inert: merges and reschedules
//! check it under the state lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use vsignal_transport::{Code, Datapoint, Failure, Status, UpdateStream};

use crate::config::SdkConfig;
use crate::facade::BrokerFacade;
use crate::metadata::MetadataAgent;
use crate::pool::{Job, WorkerPool};
use crate::result::AsyncSubscription;

/// One signal inside a delivered snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEntry {
    pub datapoint: Datapoint,
    /// True when this delivery touched the entry, false when it is carried
    /// over unchanged from an earlier delivery.
    pub updated: bool,
}

/// Merged per-path view delivered on every subscription event.
pub type Snapshot = HashMap<String, SignalEntry>;

struct SupervisorState {
    table: HashMap<String, Datapoint>,
    /// Bumped on every (re)subscribe decision; events carrying an older
    /// session number are ignored.
    session: u64,
    attempt: u32,
}

struct SupervisorInner {
    paths: Vec<String>,
    facade: BrokerFacade,
    metadata: MetadataAgent,
    pool: WorkerPool,
    config: SdkConfig,
    subscription: AsyncSubscription<Snapshot>,
    state: Mutex<SupervisorState>,
}

/// Owner of one resilient subscription; cheap to clone.
#[derive(Clone)]
pub struct SubscriptionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl SubscriptionSupervisor {
    /// Start supervising `paths` and hand back the consumer-facing
    /// subscription. The supervisor lives as long as its sessions do;
    /// cancelling the subscription stops it cooperatively.
    pub fn spawn(
        paths: Vec<String>,
        facade: BrokerFacade,
        metadata: MetadataAgent,
        pool: WorkerPool,
        config: SdkConfig,
    ) -> AsyncSubscription<Snapshot> {
        let subscription = AsyncSubscription::new(pool.clone());
        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                paths,
                facade,
                metadata,
                pool,
                config,
                subscription: subscription.clone(),
                state: Mutex::new(SupervisorState {
                    table: HashMap::new(),
                    session: 1,
                    attempt: 0,
                }),
            }),
        };
        let first = supervisor.clone();
        tokio::spawn(async move { first.run_session(1).await });
        subscription
    }

    async fn run_session(&self, session: u64) {
        if self.inner.subscription.is_cancelled() {
            return;
        }
        let resolved = match self.inner.metadata.query(&self.inner.paths).await {
            Ok(resolved) => resolved,
            Err(status) => return self.handle_status(session, status),
        };
        let mut ids = Vec::new();
        let mut placeholders = Vec::new();
        for metadata in &resolved {
            if metadata.known {
                ids.push(metadata.id);
            } else {
                // Unknown paths get a permanent placeholder and are not
                // part of the stream.
                placeholders.push((
                    metadata.path.clone(),
                    Datapoint::failure(Failure::UnknownSignal),
                ));
            }
        }
        if !placeholders.is_empty() {
            self.merge_if_changed(session, placeholders);
        }
        if ids.is_empty() {
            tracing::warn!("subscription request contains no subscribable signals");
            return;
        }
        match self.inner.facade.subscribe_by_id(ids).await {
            Ok(stream) => self.pump(session, stream).await,
            Err(status) => self.handle_status(session, status),
        }
    }

    async fn pump(&self, session: u64, mut stream: UpdateStream) {
        loop {
            if self.inner.subscription.is_cancelled() {
                return;
            }
            match stream.next().await {
                Some(Ok(update)) => {
                    {
                        let mut state = self.inner.state.lock().expect("supervisor state lock");
                        if state.session != session {
                            return;
                        }
                        // A live stream proves the session is healthy.
                        state.attempt = 0;
                    }
                    let mut changes = Vec::new();
                    for (id, datapoint) in update.entries {
                        match self.inner.metadata.get_by_id(id) {
                            Some(metadata) => changes.push((metadata.path.clone(), datapoint)),
                            None => tracing::debug!(id, "update for an unmapped signal id"),
                        }
                    }
                    if !changes.is_empty() {
                        self.deliver_update(session, changes);
                    }
                }
                Some(Err(status)) => return self.handle_status(session, status),
                // An unannounced end is a session loss the broker did not
                // get to report.
                None => {
                    return self
                        .handle_status(session, Status::new(Code::Ok, "subscription stream ended"));
                }
            }
        }
    }

    fn handle_status(&self, session: u64, status: Status) {
        if self.inner.subscription.is_cancelled() {
            return;
        }
        if !status.is_transient() {
            tracing::error!(%status, "subscription failed permanently");
            self.inner.subscription.insert_error(status);
            return;
        }
        tracing::warn!(%status, "broker session lost, scheduling resubscribe");
        self.inner
            .metadata
            .invalidate(Status::new(Code::Unavailable, "broker session lost"));
        self.demote_valid(session);
        let (delay, next_session) = {
            let mut state = self.inner.state.lock().expect("supervisor state lock");
            if state.session != session {
                return;
            }
            let delay = self.inner.config.backoff_delay(state.attempt);
            state.attempt = state.attempt.saturating_add(1);
            state.session += 1;
            (delay, state.session)
        };
        let supervisor = self.clone();
        self.inner.pool.enqueue(Job::delayed(delay, move || async move {
            tokio::spawn(async move { supervisor.run_session(next_session).await });
        }));
    }

    /// Fold a stream update into the table and deliver the snapshot.
    /// Updates are always delivered, even when values repeat.
    fn deliver_update(&self, session: u64, changes: Vec<(String, Datapoint)>) {
        let snapshot = {
            let mut state = self.inner.state.lock().expect("supervisor state lock");
            if state.session != session {
                return;
            }
            let mut touched = HashSet::new();
            for (path, datapoint) in changes {
                state.table.insert(path.clone(), datapoint);
                touched.insert(path);
            }
            Self::snapshot(&state, &touched)
        };
        self.inner.subscription.insert_item(snapshot);
    }

    /// Merge entries that actually change the table; deliver only if any
    /// did.
    fn merge_if_changed(&self, session: u64, changes: Vec<(String, Datapoint)>) {
        let snapshot = {
            let mut state = self.inner.state.lock().expect("supervisor state lock");
            if state.session != session {
                return;
            }
            let mut touched = HashSet::new();
            for (path, datapoint) in changes {
                if state.table.get(&path) != Some(&datapoint) {
                    state.table.insert(path.clone(), datapoint);
                    touched.insert(path);
                }
            }
            if touched.is_empty() {
                return;
            }
            Self::snapshot(&state, &touched)
        };
        self.inner.subscription.insert_item(snapshot);
    }

    /// Demote every path that still carries a value to `NotAvailable`;
    /// deliver only when something was demoted.
    fn demote_valid(&self, session: u64) {
        let snapshot = {
            let mut state = self.inner.state.lock().expect("supervisor state lock");
            if state.session != session {
                return;
            }
            let mut touched = HashSet::new();
            for (path, datapoint) in state.table.iter_mut() {
                if datapoint.value.is_ok() {
                    *datapoint = Datapoint::failure(Failure::NotAvailable);
                    touched.insert(path.clone());
                }
            }
            if touched.is_empty() {
                return;
            }
            Self::snapshot(&state, &touched)
        };
        self.inner.subscription.insert_item(snapshot);
    }

    fn snapshot(state: &SupervisorState, touched: &HashSet<String>) -> Snapshot {
        state
            .table
            .iter()
            .map(|(path, datapoint)| {
                (
                    path.clone(),
                    SignalEntry {
                        datapoint: datapoint.clone(),
                        updated: touched.contains(path),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, float_dp};
    use tokio::time::{Duration, Instant};
    use vsignal_transport::SubscribeUpdate;

    fn supervise(transport: Arc<MockTransport>, paths: &[&str]) -> AsyncSubscription<Snapshot> {
        let pool = WorkerPool::new(2);
        let facade = BrokerFacade::new(transport);
        let config = SdkConfig::default();
        let metadata = MetadataAgent::new(
            facade.clone(),
            pool.clone(),
            config.max_parallel_metadata_lookups,
        );
        SubscriptionSupervisor::spawn(
            paths.iter().map(|p| p.to_string()).collect(),
            facade,
            metadata,
            pool,
            config,
        )
    }

    fn update(entries: &[(i32, Datapoint)]) -> Result<SubscribeUpdate, Status> {
        Ok(SubscribeUpdate {
            entries: entries.to_vec(),
        })
    }

    #[tokio::test]
    async fn updates_arrive_as_merged_snapshots() {
        let transport = Arc::new(MockTransport::new());
        transport.known("Vehicle.Speed", 1);
        transport.known("Vehicle.Cabin.Temp", 2);
        let feed = transport.script_subscribe_channel();
        let sub = supervise(Arc::clone(&transport), &["Vehicle.Speed", "Vehicle.Cabin.Temp"]);

        feed.send(update(&[(1, float_dp(40.0)), (2, float_dp(21.5))]))
            .expect("feed");
        let first = sub.next().await.expect("snapshot");
        assert_eq!(first.len(), 2);
        assert!(first["Vehicle.Speed"].updated);
        assert!(first["Vehicle.Cabin.Temp"].updated);

        // Only the touched path is marked updated on the next delivery.
        feed.send(update(&[(1, float_dp(42.0))])).expect("feed");
        let second = sub.next().await.expect("snapshot");
        assert_eq!(second.len(), 2);
        assert!(second["Vehicle.Speed"].updated);
        assert!(!second["Vehicle.Cabin.Temp"].updated);
        assert_eq!(
            second["Vehicle.Speed"].datapoint.value,
            Ok(vsignal_transport::Value::Float(42.0))
        );
        assert_eq!(transport.subscribe_calls(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn unknown_paths_get_a_permanent_placeholder() {
        let transport = Arc::new(MockTransport::new());
        transport.known("Vehicle.Speed", 1);
        transport.unknown("Vehicle.Bogus");
        let feed = transport.script_subscribe_channel();
        let sub = supervise(Arc::clone(&transport), &["Vehicle.Speed", "Vehicle.Bogus"]);

        // Placeholder delivery precedes any stream traffic.
        let first = sub.next().await.expect("snapshot");
        assert_eq!(
            first["Vehicle.Bogus"].datapoint.value,
            Err(Failure::UnknownSignal)
        );
        assert!(first["Vehicle.Bogus"].updated);

        feed.send(update(&[(1, float_dp(10.0))])).expect("feed");
        let second = sub.next().await.expect("snapshot");
        assert!(second["Vehicle.Speed"].updated);
        assert!(!second["Vehicle.Bogus"].updated);
        // Only the known id was subscribed.
        assert_eq!(transport.subscribe_calls(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn permanent_errors_terminate_the_subscription() {
        let transport = Arc::new(MockTransport::new());
        transport.known("Vehicle.Speed", 1);
        transport.script_subscribe_err(Status::new(Code::Internal, "broken"));
        let sub = supervise(Arc::clone(&transport), &["Vehicle.Speed"]);

        let err = sub.next().await.expect_err("terminal");
        assert!(matches!(err, crate::error::SdkError::Unexpected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_loss_demotes_then_recovers_after_backoff() {
        let transport = Arc::new(MockTransport::new());
        transport.known("Vehicle.Speed", 1);
        let feed = transport.script_subscribe_channel();
        // After the loss the cache is cold again: a second lookup and a
        // second session.
        transport.known("Vehicle.Speed", 11);
        let feed2 = transport.script_subscribe_channel();
        let sub = supervise(Arc::clone(&transport), &["Vehicle.Speed"]);

        feed.send(update(&[(1, float_dp(40.0))])).expect("feed");
        let healthy = sub.next().await.expect("snapshot");
        assert!(healthy["Vehicle.Speed"].datapoint.value.is_ok());

        let lost_at = Instant::now();
        drop(feed);
        let demoted = sub.next().await.expect("snapshot");
        assert_eq!(
            demoted["Vehicle.Speed"].datapoint.value,
            Err(Failure::NotAvailable)
        );
        assert!(demoted["Vehicle.Speed"].updated);

        feed2.send(update(&[(11, float_dp(41.0))])).expect("feed");
        let recovered = sub.next().await.expect("snapshot");
        assert!(recovered["Vehicle.Speed"].datapoint.value.is_ok());
        // The first retry waits the backoff floor.
        assert!(lost_at.elapsed() >= Duration::from_millis(100));
        assert_eq!(transport.subscribe_calls(), vec![vec![1], vec![11]]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_per_attempt_and_saturates() {
        let transport = Arc::new(MockTransport::new());
        // Seven failed sessions, then a healthy one. Each session starts
        // with a cold cache.
        for _ in 0..8 {
            transport.known("Vehicle.Speed", 1);
        }
        for _ in 0..7 {
            transport.script_subscribe_err(Status::new(Code::Unavailable, "starting up"));
        }
        let feed = transport.script_subscribe_channel();
        let started = Instant::now();
        let sub = supervise(Arc::clone(&transport), &["Vehicle.Speed"]);

        feed.send(update(&[(1, float_dp(1.0))])).expect("feed");
        sub.next().await.expect("snapshot");

        // 100 + 200 + 400 + 800 + 1600 + 2000 + 2000 of waiting.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(7100), "waited {waited:?}");
        assert!(waited < Duration::from_millis(7200), "waited {waited:?}");
        assert_eq!(transport.subscribe_calls().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resets_after_a_healthy_update() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..3 {
            transport.known("Vehicle.Speed", 1);
        }
        // Fail once, recover, fail again: the second outage starts back at
        // the floor delay.
        transport.script_subscribe_err(Status::new(Code::Unavailable, "starting up"));
        let feed = transport.script_subscribe_channel();
        let feed3 = transport.script_subscribe_channel();
        let sub = supervise(Arc::clone(&transport), &["Vehicle.Speed"]);

        feed.send(update(&[(1, float_dp(1.0))])).expect("feed");
        sub.next().await.expect("snapshot");

        let lost_at = Instant::now();
        drop(feed);
        sub.next().await.expect("demoted snapshot");
        feed3.send(update(&[(1, float_dp(2.0))])).expect("feed");
        sub.next().await.expect("recovered snapshot");
        let waited = lost_at.elapsed();
        assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
        assert!(waited < Duration::from_millis(200), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_subscriptions_stop_resubscribing() {
        let transport = Arc::new(MockTransport::new());
        transport.known("Vehicle.Speed", 1);
        let feed = transport.script_subscribe_channel();
        let sub = supervise(Arc::clone(&transport), &["Vehicle.Speed"]);

        feed.send(update(&[(1, float_dp(1.0))])).expect("feed");
        sub.next().await.expect("snapshot");

        sub.cancel();
        drop(feed);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.subscribe_calls().len(), 1);
    }
}
