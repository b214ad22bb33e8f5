use super::*;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::{Duration, timeout};

use crate::testing::{MockTransport, float_dp};
use vsignal_transport::{Code, Failure, GetResponse, Status, SubscribeUpdate, Value};

fn scripted_client() -> (Arc<MockTransport>, DataBrokerClient) {
    let transport = Arc::new(MockTransport::new());
    let client = DataBrokerClient::new(transport.clone(), SdkConfig::default());
    (transport, client)
}

#[tokio::test]
async fn read_then_watch_a_signal() -> Result<()> {
    // The common application flow: one-shot read, then a live
    // subscription on the same path.
    let (transport, client) = scripted_client();
    transport.script_get(Ok(GetResponse {
        datapoints: vec![float_dp(38.0)],
    }));
    transport.known("Vehicle.Speed", 1);
    let feed = transport.script_subscribe_channel();

    let snapshot = timeout(
        Duration::from_secs(5),
        client.get_values(vec!["Vehicle.Speed".into()]).await_value(),
    )
    .await
    .context("get_values timed out")??;
    assert_eq!(
        snapshot["Vehicle.Speed"].datapoint.value,
        Ok(Value::Float(38.0))
    );

    let sub = client.subscribe(vec!["Vehicle.Speed".into()]);
    feed.send(Ok(SubscribeUpdate {
        entries: vec![(1, float_dp(39.0))],
    }))
    .context("feed closed")?;
    let live = timeout(Duration::from_secs(5), sub.next())
        .await
        .context("subscription timed out")??;
    assert_eq!(
        live["Vehicle.Speed"].datapoint.value,
        Ok(Value::Float(39.0))
    );
    Ok(())
}

#[tokio::test]
async fn callback_consumers_see_the_same_flow() -> Result<()> {
    let (transport, client) = scripted_client();
    transport.script_get(Ok(GetResponse {
        datapoints: vec![float_dp(12.0)],
    }));

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut tx = Some(tx);
    client
        .get_values(vec!["Vehicle.Speed".into()])
        .on_value(move |snapshot| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(snapshot);
            }
        })?;
    let snapshot = timeout(Duration::from_secs(5), rx)
        .await
        .context("callback timed out")??;
    assert_eq!(
        snapshot["Vehicle.Speed"].datapoint.value,
        Ok(Value::Float(12.0))
    );
    Ok(())
}

#[tokio::test]
async fn metadata_resolution_spans_the_whole_path_set() -> Result<()> {
    let (transport, client) = scripted_client();
    transport.known("Vehicle.Speed", 1);
    transport.unknown("Vehicle.Bogus");

    let resolved = client
        .resolve_metadata(&["Vehicle.Speed".into(), "Vehicle.Bogus".into()])
        .await?;
    assert_eq!(resolved.len(), 2);
    assert!(resolved[0].known);
    assert!(!resolved[1].known);
    Ok(())
}

#[tokio::test]
async fn shutdown_refuses_new_metadata_resolution() {
    let (_transport, client) = scripted_client();
    client.context().shutdown().await;

    let err = client
        .resolve_metadata(&["Vehicle.Speed".into()])
        .await
        .expect_err("stopped");
    assert!(matches!(err, SdkError::Shutdown));
}

#[tokio::test]
async fn unknown_subscription_paths_never_hit_the_stream() {
    let (transport, client) = scripted_client();
    transport.unknown("Vehicle.Bogus");

    let sub = client.subscribe(vec!["Vehicle.Bogus".into()]);
    let snapshot = sub.next().await.expect("placeholder snapshot");
    assert_eq!(
        snapshot["Vehicle.Bogus"].datapoint.value,
        Err(Failure::UnknownSignal)
    );
    // With nothing subscribable there is no subscribe call at all.
    assert!(transport.subscribe_calls().is_empty());
}

#[tokio::test]
async fn actuation_failures_reach_callback_consumers() {
    let (transport, client) = scripted_client();
    transport.script_actuate(Err(Status::new(Code::Unavailable, "restarting")));

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut tx = Some(tx);
    client
        .set_values(vec![("Vehicle.Speed".into(), Value::Float(0.0))])
        .on_error(move |status| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(status);
            }
        })
        .expect("register");
    let status = rx.await.expect("error delivered");
    assert_eq!(status.code, Code::Unavailable);
}
