use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use waltz::core::{Listener, Multicast, Observer};

/// Stream fed by hand through the returned sender.
fn channel_stream() -> (mpsc::UnboundedSender<Value>, Multicast) {
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let upstream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|value| (Ok::<Value, anyhow::Error>(value), rx))
    });
    (tx, Multicast::new(upstream))
}

fn forwarding(tx: mpsc::UnboundedSender<Value>) -> Arc<dyn Observer> {
    Arc::new(Listener::new(move |value| {
        let _ = tx.send(value.clone());
    }))
}

#[tokio::test]
async fn test_unsubscribing_one_observer_keeps_the_others() {
    let (source, shared) = channel_stream();
    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();

    let a = shared.subscribe(forwarding(a_tx));
    let b = shared.subscribe(forwarding(b_tx));
    shared.connect();

    source.send(json!(1)).unwrap();
    assert_eq!(a_rx.recv().await, Some(json!(1)));
    assert_eq!(b_rx.recv().await, Some(json!(1)));

    a.unsubscribe();
    assert_eq!(shared.observer_count(), 1);

    source.send(json!(2)).unwrap();
    assert_eq!(b_rx.recv().await, Some(json!(2)));
    assert!(a_rx.try_recv().is_err());
    assert!(b.is_active());
}

#[tokio::test]
async fn test_late_observer_of_completed_stream_only_sees_completion() {
    let shared = Multicast::new(stream::iter(vec![Ok::<Value, anyhow::Error>(json!(1)), Ok(json!(2))]));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let first = shared.subscribe(Arc::new(Listener::new(|_| {}).with_complete(move || {
        let _ = done_tx.send(());
    })));
    shared.connect();
    done_rx.recv().await.unwrap();
    assert!(shared.is_terminated());
    assert!(!first.is_active());

    let values = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(AtomicUsize::new(0));
    let sink = values.clone();
    let counter = completed.clone();
    let late = shared.subscribe(Arc::new(
        Listener::new(move |value| sink.lock().unwrap().push(value.clone())).with_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    ));

    assert!(values.lock().unwrap().is_empty());
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(!late.is_active());
}

#[tokio::test]
async fn test_failure_reaches_error_handlers_only() {
    let shared = Multicast::new(stream::iter(vec![Ok(json!("ok")), Err(anyhow::anyhow!("sensor broke"))]));
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let plain_completed = Arc::new(AtomicUsize::new(0));
    let counter = plain_completed.clone();

    let _plain = shared.subscribe(Arc::new(Listener::new(|_| {}).with_complete(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    let _handled = shared.subscribe(Arc::new(Listener::new(|_| {}).with_error(move |error| {
        let _ = err_tx.send(error.to_string());
    })));
    shared.connect();

    assert_eq!(err_rx.recv().await, Some("sensor broke".to_string()));
    assert!(shared.is_terminated());
    assert_eq!(plain_completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();
    let shared = Multicast::new(stream::once(async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<Value, anyhow::Error>(json!(1))
    }));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = shared.subscribe(forwarding(tx));
    shared.connect();
    shared.connect();

    assert_eq!(rx.recv().await, Some(json!(1)));
    shared.connect();
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_connect_without_runtime_fails_observers() {
    let shared = Multicast::new(stream::iter(vec![Ok::<Value, anyhow::Error>(json!(1))]));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let _subscription = shared.subscribe(Arc::new(
        Listener::new(|_| {}).with_error(move |error| sink.lock().unwrap().push(error.to_string())),
    ));

    shared.connect();

    assert!(shared.is_terminated());
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(errors.lock().unwrap()[0].contains("no async runtime"));
}

#[tokio::test]
async fn test_panicking_observer_does_not_block_completion() {
    let shared = Multicast::new(stream::iter(vec![Ok::<Value, anyhow::Error>(json!(1)), Ok(json!(2))]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let _faulty = shared.subscribe(Arc::new(Listener::new(|_| panic!("observer blew up"))));
    let _healthy = shared.subscribe(Arc::new(
        Listener::new(move |value| {
            let _ = tx.send(value.clone());
        })
        .with_complete(move || {
            let _ = done_tx.send(());
        }),
    ));
    shared.connect();

    assert_eq!(rx.recv().await, Some(json!(1)));
    assert_eq!(rx.recv().await, Some(json!(2)));
    assert_eq!(done_rx.recv().await, Some(()));
    assert!(shared.is_terminated());
}
