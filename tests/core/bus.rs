use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use waltz::core::{Channel, Controller, Endpoint, Listener, Middleware, Registration};

fn recorder() -> (Listener, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = Listener::new(move |value| sink.lock().unwrap().push(value.clone()));
    (listener, seen)
}

struct Named {
    endpoint: Endpoint,
}

impl Controller for Named {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[test]
fn test_dispatch_reaches_exact_route_only() {
    let bus = Middleware::new();
    let (inproc, inproc_seen) = recorder();
    let (external, external_seen) = recorder();
    let (other_topic, other_topic_seen) = recorder();

    bus.subscribe("x", Channel::Inproc, inproc);
    bus.subscribe("x", Channel::External, external);
    bus.subscribe("y", Channel::Inproc, other_topic);

    bus.dispatch("x", Channel::Inproc, 42);

    assert_eq!(*inproc_seen.lock().unwrap(), vec![json!(42)]);
    assert!(external_seen.lock().unwrap().is_empty());
    assert!(other_topic_seen.lock().unwrap().is_empty());
}

#[test]
fn test_named_channels_route_by_name() {
    let bus = Middleware::new();
    let (listener, seen) = recorder();
    bus.subscribe("x", Channel::from("channel:devices"), listener);

    bus.dispatch("x", Channel::Named("channel:other".to_string()), 1);
    bus.dispatch("x", Channel::from("channel:devices"), 2);

    assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
    assert_eq!(Channel::from("channel:external"), Channel::External);
    assert_eq!(Channel::Inproc.to_string(), "channel:inproc");
}

#[test]
fn test_listeners_invoked_in_registration_order() {
    let bus = Middleware::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for label in ["first", "second", "third"] {
        let order = order.clone();
        bus.subscribe("topic", Channel::Inproc, Listener::new(move |_| order.lock().unwrap().push(label)));
    }

    bus.dispatch("topic", Channel::Inproc, "ping");
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_late_listener_does_not_see_earlier_messages() {
    let bus = Middleware::new();
    bus.dispatch("topic", Channel::Inproc, 1);

    let (listener, seen) = recorder();
    bus.subscribe("topic", Channel::Inproc, listener);
    assert!(seen.lock().unwrap().is_empty());

    bus.dispatch("topic", Channel::Inproc, 2);
    assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
}

#[test]
fn test_errors_reach_only_listeners_with_error_handler() {
    let bus = Middleware::new();
    let (plain, plain_seen) = recorder();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();

    bus.subscribe("device", Channel::External, plain);
    bus.subscribe(
        "device",
        Channel::External,
        Listener::new(|_| {}).with_error(move |error| sink.lock().unwrap().push(error.to_string())),
    );

    bus.dispatch_error("device", Channel::External, anyhow::anyhow!("device offline"));

    assert!(plain_seen.lock().unwrap().is_empty());
    assert_eq!(*errors.lock().unwrap(), vec!["device offline".to_string()]);
}

#[test]
fn test_value_payload_completes_per_envelope() {
    let bus = Middleware::new();
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    bus.subscribe(
        "topic",
        Channel::Inproc,
        Listener::new(|_| {}).with_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    bus.dispatch("topic", Channel::Inproc, 1);
    bus.dispatch("topic", Channel::Inproc, 2);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
}

#[test]
fn test_reentrant_dispatch_from_listener() {
    let bus = Middleware::new();
    let (listener, seen) = recorder();
    bus.subscribe("b", Channel::Inproc, listener);

    let forward = bus.clone();
    bus.subscribe(
        "a",
        Channel::Inproc,
        Listener::new(move |value| {
            forward.dispatch("b", Channel::Inproc, value.clone());
            forward.dispatch("b", Channel::External, "must not arrive");
        }),
    );

    bus.dispatch("a", Channel::Inproc, "hop");
    assert_eq!(*seen.lock().unwrap(), vec![json!("hop")]);
}

#[test]
fn test_subscribe_from_inside_listener() {
    let bus = Middleware::new();
    let (late, late_seen) = recorder();
    let late = Arc::new(Mutex::new(Some(late)));

    let inner = bus.clone();
    bus.subscribe(
        "topic",
        Channel::Inproc,
        Listener::new(move |_| {
            if let Some(listener) = late.lock().unwrap().take() {
                inner.subscribe("topic", Channel::Inproc, listener);
            }
        }),
    );

    // The listener added during delivery only sees the next envelope.
    bus.dispatch("topic", Channel::Inproc, 1);
    bus.dispatch("topic", Channel::Inproc, 2);
    assert_eq!(*late_seen.lock().unwrap(), vec![json!(2)]);
    assert_eq!(bus.listener_count("topic", &Channel::Inproc), 2);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let bus = Middleware::new();
    let (listener, seen) = recorder();
    let handle = bus.subscribe("topic", Channel::Inproc, listener);
    assert_eq!(handle.key().topic, "topic");

    bus.dispatch("topic", Channel::Inproc, 1);
    assert!(handle.unsubscribe());
    bus.dispatch("topic", Channel::Inproc, 2);

    assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
    assert_eq!(bus.listener_count("topic", &Channel::Inproc), 0);
}

#[test]
fn test_register_controller_is_idempotent_by_name() {
    let bus = Middleware::new();
    let first: Arc<dyn Controller> = Arc::new(Named {
        endpoint: bus.endpoint("login"),
    });
    let second = Named {
        endpoint: bus.endpoint("login"),
    };

    assert!(bus.register_controller(first.clone()).is_added());
    let again = bus.register_controller(Arc::new(second));
    assert!(matches!(again, Registration::AlreadyPresent(_)));
    assert_eq!(again.controller().name(), "login");
    assert_eq!(bus.controller_count(), 1);
    assert!(bus.controller("login").is_some());
    assert!(bus.controller("logout").is_none());

    let names: Vec<String> = bus.controllers().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names, vec!["login".to_string()]);

    // The stored controller is still the first one.
    assert!(Arc::ptr_eq(&bus.controllers()[0], &first));
}

#[test]
fn test_endpoint_defaults_to_own_name_and_inproc() {
    let bus = Middleware::new();
    let login = bus.endpoint("login");
    let (listener, seen) = recorder();
    let (external, external_seen) = recorder();
    bus.subscribe("login", Channel::Inproc, listener);
    bus.subscribe("login", Channel::External, external);

    login.dispatch(json!({"user": "tango", "passwd": "secret"}));

    assert_eq!(*seen.lock().unwrap(), vec![json!({"user": "tango", "passwd": "secret"})]);
    assert!(external_seen.lock().unwrap().is_empty());

    let (own, own_seen) = recorder();
    login.listen(own);
    bus.dispatch("login", Channel::Inproc, "self");
    assert_eq!(*own_seen.lock().unwrap(), vec![json!("self")]);
}

#[tokio::test]
async fn test_shared_stream_runs_upstream_once() {
    let bus = Middleware::new();
    let executions = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for listener_id in 0..3 {
        let tx = tx.clone();
        bus.subscribe(
            "feed",
            Channel::Multicast,
            Listener::new(move |value| {
                let _ = tx.send((listener_id, value.clone()));
            }),
        );
    }

    let counter = executions.clone();
    let upstream = stream::once(async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<Value, anyhow::Error>(json!("reading"))
    });
    bus.dispatch_stream("feed", Channel::Multicast, upstream);

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(rx.recv().await.unwrap());
    }
    received.sort_by_key(|(listener_id, _)| *listener_id);

    assert_eq!(
        received,
        vec![(0, json!("reading")), (1, json!("reading")), (2, json!("reading"))]
    );
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_new_envelope_cancels_previous_stream() {
    let bus = Middleware::new();
    let (listener, seen) = recorder();
    bus.subscribe("k", Channel::Inproc, listener);

    let endless = bus.dispatch_stream("k", Channel::Inproc, stream::pending::<anyhow::Result<Value>>());
    assert_eq!(endless.observer_count(), 1);
    assert!(!endless.is_terminated());

    bus.dispatch("k", Channel::Inproc, 1);

    assert_eq!(endless.observer_count(), 0);
    assert!(endless.is_terminated());
    assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
}

#[test]
fn test_panicking_listener_does_not_starve_later_ones() {
    let bus = Middleware::new();
    let (listener, seen) = recorder();
    bus.subscribe("feed", Channel::External, Listener::new(|_| panic!("listener blew up")));
    bus.subscribe("feed", Channel::External, listener);

    bus.dispatch("feed", Channel::External, 1);
    bus.dispatch("feed", Channel::External, 2);

    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
}

/// Reads the registry from inside `name()`.
struct Introspective {
    endpoint: Endpoint,
    peeks: AtomicUsize,
}

impl Controller for Introspective {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn name(&self) -> &str {
        let _ = self.endpoint.middleware().controller_count();
        self.peeks.fetch_add(1, Ordering::SeqCst);
        self.endpoint.name()
    }
}

#[test]
fn test_controller_name_may_call_back_into_the_bus() {
    let bus = Middleware::new();
    let controller = Arc::new(Introspective {
        endpoint: bus.endpoint("curious"),
        peeks: AtomicUsize::new(0),
    });

    assert!(bus.register_controller(controller.clone()).is_added());
    assert!(!bus.register_controller(controller.clone()).is_added());
    assert!(bus.controller("curious").is_some());
    assert!(bus.phase("curious").is_some());
    assert!(controller.peeks.load(Ordering::SeqCst) >= 2);
}
