//! Unit tests for the session registry and its idle sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agent_conduit::session::{spawn_idle_sweeper, SessionRegistry};
use agent_conduit::AppError;

#[tokio::test]
async fn register_and_get_round_trip() {
    let registry = SessionRegistry::new(4);
    let id = registry.register("conn-a".to_owned()).await.expect("register");

    assert_eq!(registry.get(&id).await.as_deref(), Some("conn-a"));
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn full_registry_rejects_without_evicting() {
    let registry = SessionRegistry::new(2);
    let first = registry.register(1_u32).await.expect("first");
    let second = registry.register(2_u32).await.expect("second");

    let third = registry.register(3_u32).await;
    assert!(matches!(third, Err(AppError::CapacityExceeded(_))));

    assert_eq!(registry.get(&first).await, Some(1));
    assert_eq!(registry.get(&second).await, Some(2));
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn re_registering_an_id_replaces_without_using_capacity() {
    let registry = SessionRegistry::new(1);
    registry.register_with_id("client-1", 1_u32).await.expect("first");
    registry.register_with_id("client-1", 2_u32).await.expect("replace");

    assert_eq!(registry.get("client-1").await, Some(2));
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn unregister_is_idempotent() {
    let registry = SessionRegistry::new(2);
    let id = registry.register(()).await.expect("register");

    registry.unregister(&id).await;
    registry.unregister(&id).await;
    assert!(registry.is_empty().await);
    assert!(registry.get(&id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn cleanup_removes_only_stale_sessions() {
    let registry = SessionRegistry::new(4);
    let stale = registry.register("stale").await.expect("stale");
    let active = registry.register("active").await.expect("active");

    tokio::time::advance(Duration::from_secs(50)).await;
    assert!(registry.touch(&active).await);
    tokio::time::advance(Duration::from_secs(20)).await;

    assert_eq!(registry.cleanup(Duration::from_secs(60)).await, 1);
    assert!(registry.get(&stale).await.is_none());
    assert!(registry.get(&active).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn get_counts_as_activity() {
    let registry = SessionRegistry::new(1);
    let id = registry.register(7_u8).await.expect("register");

    tokio::time::advance(Duration::from_secs(40)).await;
    assert_eq!(registry.get(&id).await, Some(7));
    tokio::time::advance(Duration::from_secs(40)).await;

    assert_eq!(registry.cleanup(Duration::from_secs(60)).await, 0);
}

#[tokio::test]
async fn touch_unknown_session_returns_false() {
    let registry = SessionRegistry::<u8>::new(1);
    assert!(!registry.touch("nobody").await);
}

#[tokio::test(start_paused = true)]
async fn list_reports_idle_time_oldest_first() {
    let registry = SessionRegistry::new(4);
    let first = registry.register(1_u8).await.expect("first");
    // Distinct wall-clock registration times.
    std::thread::sleep(Duration::from_millis(2));
    let second = registry.register(2_u8).await.expect("second");

    tokio::time::advance(Duration::from_secs(30)).await;
    registry.touch(&second).await;

    let sessions = registry.list().await;
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].session_id, first);
    assert_eq!(sessions[0].idle_seconds, 30);
    assert_eq!(sessions[1].session_id, second);
    assert_eq!(sessions[1].idle_seconds, 0);
}

#[tokio::test]
async fn shutdown_clears_all_sessions() {
    let registry = SessionRegistry::new(4);
    registry.register(1_u8).await.expect("a");
    registry.register(2_u8).await.expect("b");

    assert_eq!(registry.shutdown().await, 2);
    assert!(registry.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn idle_sweeper_evicts_in_background_and_stops_on_cancel() {
    let registry = Arc::new(SessionRegistry::new(4));
    let id = registry.register("idle").await.expect("register");
    let cancel = CancellationToken::new();

    let sweeper = spawn_idle_sweeper(
        Arc::clone(&registry),
        Duration::from_secs(30),
        Duration::from_secs(10),
        cancel.clone(),
    );

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(registry.get(&id).await.is_none());

    cancel.cancel();
    sweeper.await.expect("sweeper exits cleanly");
}
