//! Progress and cancellation bridging, end to end over the mock link.

use std::sync::Arc;

use engine_proto::{WorkDoneProgress, methods};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::client::progress::{IndicatorEvent, ProgressBridge, Settled};

use super::fake_engine::{Reply, count, harness, wait_until};

fn drain(rx: &mut mpsc::UnboundedReceiver<IndicatorEvent>) -> Vec<IndicatorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn adversarial_percentages_forward_monotonically() {
    let harness = harness(|engine| {
        engine.handle("analyze", |_| Reply::Progress {
            events: vec![
                WorkDoneProgress::Begin {
                    title: "Analyzing".to_string(),
                    cancellable: Some(true),
                    message: None,
                    percentage: Some(10.0),
                },
                WorkDoneProgress::Report {
                    message: Some("scanning".to_string()),
                    percentage: Some(50.0),
                },
                // Regressing and out-of-range reports must not move the
                // cumulative value backwards or past 100.
                WorkDoneProgress::Report {
                    message: None,
                    percentage: Some(30.0),
                },
                WorkDoneProgress::Report {
                    message: None,
                    percentage: Some(250.0),
                },
                WorkDoneProgress::End { message: None },
            ],
            result: Some(json!({"ok": true})),
        });
    });
    harness.client.start().await.expect("start succeeds");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let bridge = ProgressBridge::new(tx);

    let settled: Settled<Value> = harness
        .client
        .call_tracked(&bridge, "analyze", json!({}))
        .await
        .expect("tracked call succeeds");
    assert_eq!(settled, Settled::Done(json!({"ok": true})));

    let events = drain(&mut rx);
    assert_eq!(
        events[0],
        IndicatorEvent::Begin {
            title: "Analyzing".to_string(),
            cancellable: true,
            message: None,
        }
    );
    let deltas: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            IndicatorEvent::Report { delta, .. } => Some(*delta),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec![10, 40, 0, 50]);
    assert_eq!(deltas.iter().sum::<u32>(), 100);
    assert!(matches!(events.last(), Some(IndicatorEvent::End { .. })));
}

#[tokio::test]
async fn cancellation_releases_the_wait_and_notifies_the_engine() {
    let harness = harness(|engine| {
        // The engine never answers; only progress arrives.
        engine.handle("longquery", |_| Reply::Progress {
            events: vec![WorkDoneProgress::Begin {
                title: "Searching".to_string(),
                cancellable: Some(true),
                message: None,
                percentage: None,
            }],
            result: None,
        });
    });
    harness.client.start().await.expect("start succeeds");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let bridge = Arc::new(ProgressBridge::new(tx));

    let call = {
        let client = harness.client.clone();
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            client
                .call_tracked::<Value, Value>(&bridge, "longquery", json!({}))
                .await
        })
    };

    // Once the indicator opens, trigger its cancel affordance.
    match rx.recv().await {
        Some(IndicatorEvent::Begin { cancellable, .. }) => assert!(cancellable),
        other => panic!("expected begin, got {other:?}"),
    }
    bridge.cancel_active();

    match call.await.expect("join") {
        Ok(Settled::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }

    // The engine was told which request to abandon.
    let log = harness.log.clone();
    wait_until(move || count(&log, methods::CANCEL_REQUEST) == 1).await;
    let log = harness.log.lock().unwrap();
    let request_id = log
        .iter()
        .find(|request| request.method == "longquery")
        .and_then(|request| request.id.as_ref())
        .and_then(Value::as_u64)
        .expect("tracked request id");
    let cancelled_id = log
        .iter()
        .find(|request| request.method == methods::CANCEL_REQUEST)
        .and_then(|request| request.params.as_ref())
        .and_then(|params| params.get("id"))
        .and_then(Value::as_u64)
        .expect("cancel id");
    assert_eq!(cancelled_id, request_id);
}

#[tokio::test]
async fn a_new_indicator_cancels_the_previous_call() {
    let harness = harness(|engine| {
        engine.handle("first", |_| Reply::Progress {
            events: vec![WorkDoneProgress::Begin {
                title: "First".to_string(),
                cancellable: Some(true),
                message: None,
                percentage: None,
            }],
            result: None,
        });
        engine.handle("second", |_| Reply::Progress {
            events: vec![WorkDoneProgress::Begin {
                title: "Second".to_string(),
                cancellable: Some(true),
                message: None,
                percentage: None,
            }],
            result: None,
        });
    });
    harness.client.start().await.expect("start succeeds");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let bridge = Arc::new(ProgressBridge::new(tx));

    let first = {
        let client = harness.client.clone();
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            client
                .call_tracked::<Value, Value>(&bridge, "first", json!({}))
                .await
        })
    };
    match rx.recv().await {
        Some(IndicatorEvent::Begin { title, .. }) => assert_eq!(title, "First"),
        other => panic!("expected first begin, got {other:?}"),
    }

    let second = {
        let client = harness.client.clone();
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            client
                .call_tracked::<Value, Value>(&bridge, "second", json!({}))
                .await
        })
    };
    match rx.recv().await {
        Some(IndicatorEvent::Begin { title, .. }) => assert_eq!(title, "Second"),
        other => panic!("expected second begin, got {other:?}"),
    }

    // Single-flight per bridge: the older call was cancelled the moment
    // the newer indicator opened.
    match first.await.expect("join") {
        Ok(Settled::Cancelled) => {}
        other => panic!("expected first call cancelled, got {other:?}"),
    }

    // The newer call now owns the indicator; its cancel affordance
    // targets it, not the finished one.
    bridge.cancel_active();
    match second.await.expect("join") {
        Ok(Settled::Cancelled) => {}
        other => panic!("expected second call cancelled, got {other:?}"),
    }
}
