//! Unit tests for the retry-with-backoff executor decorator.

use std::sync::Arc;
use std::time::Duration;

use agent_conduit::process::{ExecutionRequest, Executor};
use agent_conduit::retry::{ResilientExecutor, RetryPolicy};
use agent_conduit::AppError;

use super::support::{success, ScriptedExecutor};

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_delay: Duration::from_secs(1),
    }
}

fn request() -> ExecutionRequest {
    ExecutionRequest::new(vec!["-p".into()], ".", Duration::from_secs(5))
}

fn transient(message: &str) -> AppError {
    AppError::Launch {
        message: message.into(),
        transient: true,
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let inner = ScriptedExecutor::with_outcomes(vec![
        Err(transient("busy")),
        Err(AppError::Io("pipe".into())),
        Ok(success("done")),
    ]);
    let executor = ResilientExecutor::new(inner, policy(3));

    let started = tokio::time::Instant::now();
    let result = executor.execute(request()).await.expect("third attempt succeeds");

    assert_eq!(result.stdout, "done");
    assert_eq!(executor.inner().attempts(), 3);
    // 100ms after the first failure, 200ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_surfaces_last_error() {
    let inner = ScriptedExecutor::with_outcomes(vec![
        Err(transient("first")),
        Err(transient("second")),
        Err(transient("third")),
        Ok(success("never reached")),
    ]);
    let executor = ResilientExecutor::new(inner, policy(3));

    let err = executor.execute(request()).await.unwrap_err();
    assert_eq!(err, transient("third"));
    assert_eq!(executor.inner().attempts(), 3);
}

#[tokio::test]
async fn fatal_failures_are_not_retried() {
    let inner = ScriptedExecutor::with_outcomes(vec![
        Err(AppError::Launch {
            message: "no such binary".into(),
            transient: false,
        }),
        Ok(success("unreachable")),
    ]);
    let executor = ResilientExecutor::new(inner, policy(5));

    let err = executor.execute(request()).await.unwrap_err();
    assert!(matches!(err, AppError::Launch { transient: false, .. }));
    assert_eq!(executor.inner().attempts(), 1);
}

#[tokio::test]
async fn timeouts_are_not_retried() {
    let inner = ScriptedExecutor::with_outcomes(vec![Err(AppError::Timeout("5s".into()))]);
    let executor = ResilientExecutor::new(inner, policy(5));

    let err = executor.execute(request()).await.unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)));
    assert_eq!(executor.inner().attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn custom_classifier_widens_retries() {
    let inner = ScriptedExecutor::with_outcomes(vec![
        Err(AppError::Timeout("slow".into())),
        Ok(success("ok")),
    ]);
    let executor = ResilientExecutor::with_classifier(
        inner,
        policy(2),
        Arc::new(|err: &AppError| matches!(err, AppError::Timeout(_))),
    );

    executor.execute(request()).await.expect("retried timeout");
    assert_eq!(executor.inner().attempts(), 2);
}

#[tokio::test]
async fn non_zero_exit_is_not_a_failure() {
    let inner = ScriptedExecutor::with_outcomes(vec![Ok(super::support::exited(2, "", "bad"))]);
    let executor = ResilientExecutor::new(inner, policy(3));

    let result = executor.execute(request()).await.expect("exit codes pass through");
    assert_eq!(result.exit_code, 2);
    assert!(!result.is_success());
    assert_eq!(executor.inner().attempts(), 1);
}

#[tokio::test]
async fn streaming_is_passed_through_once() {
    let inner = ScriptedExecutor::with_stream(&["a", "b"], Err(transient("crashed")));
    let executor = ResilientExecutor::new(inner, policy(5));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = executor.execute_streaming(
        request(),
        Box::new(move |line| {
            let _ = tx.send(line);
        }),
    );

    let err = handle.await.unwrap_err();
    assert_eq!(err, transient("crashed"));
    assert_eq!(executor.inner().streaming_calls(), 1);

    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    assert_eq!(lines, ["a", "b"]);
}
