//! Coordinator and satellite talking over loopback TCP.
//!
//! Covers wildcard broadcast delivery, namespace isolation, concurrent
//! request/response correlation, error replies, request timeouts and the
//! satellite noticing a coordinator that went away.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_bus::*;
use taskmesh_core::TaskmeshError;

async fn coordinator(prefix: &str) -> MessageBus {
    MessageBus::coordinator(BusConfig {
        pub_port: 0,
        rep_port: 0,
        topic_prefix: prefix.into(),
        ..BusConfig::default()
    })
    .await
    .unwrap()
}

async fn satellite_of(coord: &MessageBus, prefix: &str) -> MessageBus {
    MessageBus::satellite(BusConfig {
        pub_port: coord.pub_addr().unwrap().port(),
        rep_port: coord.rep_addr().unwrap().port(),
        topic_prefix: prefix.into(),
        request_timeout: Duration::from_secs(2),
        ..BusConfig::default()
    })
    .await
    .unwrap()
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_wildcard_and_exact_subscriptions() {
    let coord = coordinator("taskmesh").await;
    let sat = satellite_of(&coord, "taskmesh").await;
    wait_for(|| coord.subscriber_count() == 1).await;

    let wildcard = Arc::new(Mutex::new(Vec::new()));
    let exact = Arc::new(Mutex::new(Vec::new()));
    let w = wildcard.clone();
    sat.subscribe("task_*", move |e| w.lock().push(e.topic.clone()))
        .unwrap();
    let x = exact.clone();
    sat.subscribe("worker_joined", move |e| x.lock().push(e.payload.clone()))
        .unwrap();
    // A panicking subscriber does not starve the others.
    sat.subscribe("", |_| panic!("bad subscriber")).unwrap();

    coord.publish("task_submitted", json!({"task_id": "t1"})).unwrap();
    coord.publish("task_completed", json!({"task_id": "t1"})).unwrap();
    coord.publish("worker_joined", json!({"worker_id": "w1"})).unwrap();

    wait_for(|| exact.lock().len() == 1).await;
    assert_eq!(
        *wildcard.lock(),
        vec!["task_submitted".to_string(), "task_completed".to_string()]
    );
    assert_eq!(exact.lock()[0]["worker_id"], "w1");
}

#[tokio::test]
async fn test_other_namespace_is_ignored() {
    let coord = coordinator("alpha").await;
    let sat = satellite_of(&coord, "beta").await;
    wait_for(|| coord.subscriber_count() == 1).await;

    let seen = Arc::new(Mutex::new(0));
    let s = seen.clone();
    sat.subscribe("", move |_| *s.lock() += 1).unwrap();
    coord.publish("task_completed", json!({})).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock(), 0);
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let coord = coordinator("taskmesh").await;
    coord
        .register_handler_fn("slow_echo", |payload: Value| async move {
            let delay = payload["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(payload)
        })
        .unwrap();
    let sat = Arc::new(satellite_of(&coord, "taskmesh").await);

    // The slower request is sent first; replies arrive out of order.
    let slow = {
        let sat = sat.clone();
        tokio::spawn(async move {
            sat.request("slow_echo", json!({"n": 1, "delay_ms": 80}))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = sat
        .request("slow_echo", json!({"n": 2, "delay_ms": 0}))
        .await
        .unwrap();
    assert_eq!(fast["n"], 2);
    assert_eq!(slow.await.unwrap().unwrap()["n"], 1);
}

#[tokio::test]
async fn test_error_replies() {
    let coord = coordinator("taskmesh").await;
    coord
        .register_handler_fn("fail", |_| async move {
            Err::<Value, _>(TaskmeshError::NotFound("worker ghost".into()))
        })
        .unwrap();
    let sat = satellite_of(&coord, "taskmesh").await;

    let err = sat.request("fail", Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("worker ghost"));

    let err = sat.request("missing", Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("No handler for topic: missing"));

    sat.ping().await.unwrap();
}

#[tokio::test]
async fn test_request_timeout() {
    let coord = coordinator("taskmesh").await;
    coord
        .register_handler_fn("stall", |_| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        })
        .unwrap();
    let sat = satellite_of(&coord, "taskmesh").await;

    let err = sat
        .request_with_timeout("stall", Value::Null, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskmeshError::Timeout(_)));
}

#[tokio::test]
async fn test_satellite_sees_coordinator_shutdown() {
    let coord = coordinator("taskmesh").await;
    let sat = satellite_of(&coord, "taskmesh").await;
    sat.ping().await.unwrap();

    coord.shutdown().await;
    drop(coord);
    wait_for(|| !sat.is_connected()).await;

    let err = sat.request("anything", Value::Null).await.unwrap_err();
    assert!(err.is_connectivity());
}
