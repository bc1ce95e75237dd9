//! Unit tests for the correlation engine: registration, resolution,
//! expiry and shutdown.

use std::sync::Arc;
use std::time::Duration;

use agent_conduit::config::CorrelationConfig;
use agent_conduit::correlation::CorrelationEngine;
use agent_conduit::AppError;

#[tokio::test]
async fn complete_resolves_the_pending_reply() {
    let engine = CorrelationEngine::<String>::new(Duration::from_secs(60));
    let pending = engine.register("abc", None).await.expect("register");
    assert_eq!(pending.id(), "abc");

    assert!(engine.complete("abc", "R1".to_owned()).await);
    assert!(!engine.complete("abc", "R2".to_owned()).await, "second reply is ignored");

    assert_eq!(pending.await.expect("reply"), "R1");
    assert_eq!(engine.pending_count().await, 0);
}

#[tokio::test]
async fn fail_delivers_error_once() {
    let engine = CorrelationEngine::<String>::new(Duration::from_secs(60));
    let pending = engine.register("job-1", None).await.expect("register");

    assert!(engine.fail("job-1", AppError::Io("worker died".into())).await);
    assert!(!engine.fail("job-1", AppError::Io("again".into())).await);
    assert!(!engine.complete("job-1", "late".to_owned()).await);

    assert_eq!(pending.await.unwrap_err(), AppError::Io("worker died".into()));
}

#[tokio::test]
async fn unknown_ids_are_not_an_error() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(60));
    assert!(!engine.complete("ghost", 1).await);
    assert!(!engine.fail("ghost", AppError::Io("x".into())).await);
}

#[tokio::test]
async fn duplicate_live_id_conflicts() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(60));
    let _pending = engine.register("dup", None).await.expect("first");

    let second = engine.register("dup", None).await;
    assert!(matches!(second, Err(AppError::Conflict(_))));
    assert!(engine.contains("dup").await);
}

#[tokio::test]
async fn generated_ids_are_unique() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(60));
    let a = engine.register_new(None).await.expect("a");
    let b = engine.register_new(None).await.expect("b");
    assert_ne!(a.id(), b.id());
    assert_eq!(engine.pending_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn sweep_expires_overdue_entries_only() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(60));
    let short = engine
        .register("short", Some(Duration::from_secs(5)))
        .await
        .expect("short");
    let _long = engine
        .register("long", Some(Duration::from_secs(120)))
        .await
        .expect("long");

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(engine.sweep_expired().await, 1);

    assert!(matches!(
        short.await,
        Err(AppError::CorrelationTimeout(_))
    ));
    assert!(engine.contains("long").await);
    assert!(!engine.complete("short", 7).await);
}

#[tokio::test(start_paused = true)]
async fn reply_after_expiry_before_sweep_is_rejected() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(1));
    let pending = engine.register("slow", None).await.expect("register");

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(!engine.complete("slow", 1).await);
    assert!(matches!(
        pending.await,
        Err(AppError::CorrelationTimeout(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn expired_id_can_be_registered_again() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(1));
    let stale = engine.register("reuse", None).await.expect("first");

    tokio::time::advance(Duration::from_secs(2)).await;
    let fresh = engine.register("reuse", None).await.expect("re-register");

    assert!(matches!(stale.await, Err(AppError::CorrelationTimeout(_))));
    assert!(engine.complete("reuse", 9).await);
    assert_eq!(fresh.await.expect("reply"), 9);
}

#[tokio::test(start_paused = true)]
async fn background_sweep_expires_without_caller() {
    let config = CorrelationConfig {
        default_timeout_seconds: 5,
        sweep_interval_seconds: 1,
    };
    let engine: Arc<CorrelationEngine<u32>> = CorrelationEngine::start(&config);
    let pending = engine.register_new(None).await.expect("register");

    let result = pending.await;
    assert!(matches!(result, Err(AppError::CorrelationTimeout(_))));
    assert_eq!(engine.pending_count().await, 0);
}

#[tokio::test]
async fn shutdown_fails_everything_and_refuses_new_work() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(60));
    let a = engine.register("a", None).await.expect("a");
    let b = engine.register("b", None).await.expect("b");

    assert_eq!(engine.shutdown().await, 2);
    assert!(matches!(a.await, Err(AppError::Shutdown(_))));
    assert!(matches!(b.await, Err(AppError::Shutdown(_))));

    let late = engine.register("c", None).await;
    assert!(matches!(late, Err(AppError::Shutdown(_))));
}

#[tokio::test]
async fn dropping_the_awaitable_does_not_break_completion() {
    let engine = CorrelationEngine::<u32>::new(Duration::from_secs(60));
    let pending = engine.register("gone", None).await.expect("register");
    drop(pending);

    assert!(engine.complete("gone", 1).await);
    assert_eq!(engine.pending_count().await, 0);
}
