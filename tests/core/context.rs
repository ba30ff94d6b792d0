use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use waltz::core::{ContextError, ContextProvider, ContextStore, ContextValue};

#[tokio::test]
async fn test_register_before_get_is_resolved() {
    let store = ContextStore::new();
    store.register_context("tango-rest", "some context".to_string());

    let cell = store.get_context("tango-rest");
    assert!(cell.is_resolved());
    assert_eq!(*cell.get_as::<String>().await.unwrap(), "some context");
}

#[tokio::test]
async fn test_get_before_register_resolves_on_write() {
    let store = ContextStore::new();
    let cell = store.get_context("session");
    assert!(!cell.is_resolved());
    assert!(cell.try_get().is_none());

    let reader = tokio::spawn({
        let cell = cell.clone();
        async move { cell.get_as::<u32>().await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!reader.is_finished());

    store.register_context("session", 7_u32);
    assert_eq!(*reader.await.unwrap().unwrap(), 7);
    assert!(cell.is_resolved());
}

#[tokio::test]
async fn test_unregister_rejects_pending_read() {
    let store = ContextStore::new();
    let cell = store.get_context("handle");

    assert!(store.unregister_context("handle"));
    assert!(!store.contains("handle"));

    match cell.get().await {
        Err(ContextError::Invalidated { id, .. }) => assert_eq!(id, "handle"),
        other => panic!("expected invalidation, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_unregister_then_get_returns_fresh_pending_cell() {
    let store = ContextStore::new();
    store.register_context("k", "v1");
    assert_eq!(*store.get_context("k").get_as::<&str>().await.unwrap(), "v1");

    assert!(store.unregister_context("k"));
    let fresh = store.get_context("k");
    assert!(fresh.try_get().is_none());
    assert!(!fresh.is_resolved());
}

#[test]
fn test_unregister_unknown_id_is_harmless() {
    let store = ContextStore::new();
    assert!(!store.unregister_context("missing"));
}

#[tokio::test]
async fn test_overwrite_is_seen_by_later_reads() {
    let store = ContextStore::new();
    store.register_context("config", 1_i64);
    let early = store.get_context("config");
    assert_eq!(*early.get_as::<i64>().await.unwrap(), 1);

    store.register_context("config", 2_i64);
    assert_eq!(*store.get_context("config").get_as::<i64>().await.unwrap(), 2);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_clear_abandons_pending_reads() {
    let store = ContextStore::new();
    let cell = store.get_context("late");
    store.clear_context();

    assert_eq!(cell.get().await.err(), Some(ContextError::Abandoned("late".to_string())));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_type_mismatch() {
    let store = ContextStore::new();
    store.register_context("port", 8080_u16);

    let result = store.get_context("port").get_as::<String>().await;
    assert!(matches!(result, Err(ContextError::TypeMismatch { .. })));
}

struct Handshake {
    token: Option<&'static str>,
}

#[async_trait]
impl ContextProvider for Handshake {
    async fn provide(&self) -> anyhow::Result<ContextValue> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        match self.token {
            Some(token) => Ok(Arc::new(token.to_string())),
            None => anyhow::bail!("handshake refused"),
        }
    }
}

#[tokio::test]
async fn test_provider_resolves_pending_cell() {
    let store = ContextStore::new();
    let cell = store.get_context("token");

    let task = store.provide("token", Handshake { token: Some("abc") }).unwrap();
    assert_eq!(*cell.get_as::<String>().await.unwrap(), "abc");
    task.await.unwrap();
}

#[tokio::test]
async fn test_failing_provider_invalidates() {
    let store = ContextStore::new();
    let task = store.provide("token", Handshake { token: None }).unwrap();
    let cell = store.get_context("token");

    match cell.get().await {
        Err(ContextError::Invalidated { reason, .. }) => assert!(reason.contains("handshake refused")),
        other => panic!("expected invalidation, got {:?}", other.map(|_| ())),
    }
    task.await.unwrap();
    assert!(!store.contains("token"));
}
