//! Unit tests for the keyed admission limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_conduit::config::ConcurrencyConfig;
use agent_conduit::limiter::AdmissionLimiter;
use agent_conduit::AppError;

#[tokio::test(start_paused = true)]
async fn capacity_plus_one_blocks_until_release() {
    let limiter = Arc::new(AdmissionLimiter::new(2));

    let first = limiter.acquire("chat", None).await.expect("first");
    let _second = limiter.acquire("chat", None).await.expect("second");
    assert_eq!(limiter.available("chat").await, Some(0));

    let waiter = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire("chat", None).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiter.is_finished(), "third acquire must wait");

    limiter.release(first);
    let third = waiter.await.expect("join").expect("third");
    assert_eq!(third.key(), "chat");
}

#[tokio::test]
async fn keys_are_independent() {
    let limiter = AdmissionLimiter::new(1);

    let _chat = limiter.acquire("chat", None).await.expect("chat");
    let batch = limiter.try_acquire("batch", None).await;
    assert!(batch.is_ok(), "a full pool must not block other keys");
}

#[tokio::test]
async fn try_acquire_reports_capacity_exceeded() {
    let limiter = AdmissionLimiter::new(1);
    let _held = limiter.try_acquire("k", None).await.expect("first");

    let result = limiter.try_acquire("k", None).await;
    assert!(matches!(result, Err(AppError::CapacityExceeded(_))));
}

#[tokio::test(start_paused = true)]
async fn acquire_within_times_out() {
    let limiter = AdmissionLimiter::new(1);
    let _held = limiter.acquire("k", None).await.expect("first");

    let result = limiter
        .acquire_within("k", None, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(AppError::CapacityExceeded(_))));
}

#[tokio::test]
async fn dropping_permit_releases_slot() {
    let limiter = AdmissionLimiter::new(1);
    {
        let _permit = limiter.acquire("k", None).await.expect("acquire");
        assert_eq!(limiter.available("k").await, Some(0));
    }
    assert_eq!(limiter.available("k").await, Some(1));
}

#[tokio::test]
async fn named_limits_override_default() {
    let config = ConcurrencyConfig {
        default_limit: 4,
        limits: HashMap::from([("chat".to_owned(), 1)]),
    };
    let limiter = AdmissionLimiter::from_config(&config);

    assert_eq!(limiter.configured_capacity("chat"), 1);
    assert_eq!(limiter.configured_capacity("other"), 4);

    let _held = limiter.acquire("chat", None).await.expect("acquire");
    assert_eq!(limiter.available("chat").await, Some(0));
}

#[tokio::test]
async fn capacity_is_fixed_at_creation() {
    let limiter = AdmissionLimiter::new(1);
    let _first = limiter.acquire("k", Some(3)).await.expect("create with 3");
    assert_eq!(limiter.available("k").await, Some(2));

    // A later override does not resize the pool.
    let _second = limiter.acquire("k", Some(10)).await.expect("second");
    assert_eq!(limiter.available("k").await, Some(1));
}

#[tokio::test]
async fn unknown_key_has_no_pool() {
    let limiter = AdmissionLimiter::new(2);
    assert_eq!(limiter.available("never-used").await, None);
}

#[tokio::test]
async fn close_rejects_waiters_and_new_acquires() {
    let limiter = Arc::new(AdmissionLimiter::new(1));
    let held = limiter.acquire("k", None).await.expect("acquire");

    let waiter = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire("k", None).await })
    };
    tokio::task::yield_now().await;

    limiter.close().await;
    let result = waiter.await.expect("join");
    assert!(matches!(result, Err(AppError::Shutdown(_))));
    assert!(matches!(
        limiter.try_acquire("k", None).await,
        Err(AppError::Shutdown(_))
    ));
    drop(held);
}

#[tokio::test(start_paused = true)]
async fn waiters_are_admitted_in_arrival_order() {
    let limiter = Arc::new(AdmissionLimiter::new(1));
    let held = limiter.acquire("k", None).await.expect("acquire");
    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut waiters = Vec::new();
    for name in ["first", "second", "third"] {
        let limiter = Arc::clone(&limiter);
        let order_tx = order_tx.clone();
        waiters.push(tokio::spawn(async move {
            let permit = limiter.acquire("k", None).await.expect("admitted");
            order_tx.send(name).expect("record order");
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(permit);
        }));
        // Let this waiter queue before the next one arrives.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(order_tx);

    limiter.release(held);
    for waiter in waiters {
        waiter.await.expect("join");
    }

    let mut order = Vec::new();
    while let Some(name) = order_rx.recv().await {
        order.push(name);
    }
    assert_eq!(order, ["first", "second", "third"]);
}

#[tokio::test]
async fn keys_first_used_after_close_are_rejected() {
    let limiter = AdmissionLimiter::new(2);
    limiter.close().await;
    assert!(limiter.is_closed());

    assert!(matches!(
        limiter.acquire("fresh", None).await,
        Err(AppError::Shutdown(_))
    ));
    assert!(matches!(
        limiter.try_acquire("other", None).await,
        Err(AppError::Shutdown(_))
    ));
    assert_eq!(limiter.available("fresh").await, None);
}

#[tokio::test]
async fn acquire_reports_pool_after_taking_a_slot() {
    let limiter = AdmissionLimiter::new(3);
    let first = limiter.acquire("k", None).await.expect("first");
    let _second = limiter.acquire("k", None).await.expect("second");

    assert_eq!(first.key(), "k");
    assert_eq!(limiter.available("k").await, Some(1));
}
