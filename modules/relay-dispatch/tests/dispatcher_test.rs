//! Dispatcher behavior tests against an in-memory outcome store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use relay_common::{Command, CommandKind, CommandOrigin, FailureKind, Outcome, RelayError};
use relay_dispatch::{Dispatcher, OutcomeStore, RetryPolicy};

/// Scripted failure for a key. Fresh errors are built per occurrence since
/// `RelayError` carries owned messages.
#[derive(Clone, Copy)]
enum Fault {
    Transient,
    Validation,
    Conflict,
}

impl Fault {
    fn to_error(self) -> RelayError {
        match self {
            Fault::Transient => RelayError::TransientIo("scripted".into()),
            Fault::Validation => RelayError::Validation("scripted".into()),
            Fault::Conflict => RelayError::Conflict("scripted".into()),
        }
    }
}

#[derive(Default)]
struct MemStore {
    outcomes: Mutex<HashMap<String, Outcome>>,
    /// Idempotency keys whose effect was actually applied.
    effects: Mutex<Vec<String>>,
    /// start:/end: markers per idempotency key, for ordering assertions.
    events: Mutex<Vec<String>>,
    /// Handler delay per resource key.
    delays: HashMap<String, Duration>,
    /// Failures to inject, popped front-first, per idempotency key.
    faults: Mutex<HashMap<String, Vec<Fault>>>,
}

impl MemStore {
    fn with_delay(mut self, resource_key: &str, delay: Duration) -> Self {
        self.delays.insert(resource_key.to_string(), delay);
        self
    }

    async fn plan_faults(&self, key: &str, faults: Vec<Fault>) {
        self.faults.lock().await.insert(key.to_string(), faults);
    }

    async fn seed_outcome(&self, outcome: Outcome) {
        self.outcomes
            .lock()
            .await
            .insert(outcome.idempotency_key.clone(), outcome);
    }
}

#[async_trait]
impl OutcomeStore for MemStore {
    async fn lookup(&self, key: &str) -> Result<Option<Outcome>, RelayError> {
        Ok(self.outcomes.lock().await.get(key).cloned())
    }

    async fn execute(&self, cmd: &Command, attempts: i32) -> Result<Outcome, RelayError> {
        let key = &cmd.idempotency_key;
        if let Some(existing) = self.outcomes.lock().await.get(key) {
            return Ok(existing.clone());
        }
        let fault = {
            let mut faults = self.faults.lock().await;
            faults.get_mut(key).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };
        if let Some(fault) = fault {
            return Err(fault.to_error());
        }

        self.events.lock().await.push(format!("start:{key}"));
        if let Some(delay) = self.delays.get(&cmd.resource_key) {
            tokio::time::sleep(*delay).await;
        }
        self.effects.lock().await.push(key.clone());
        let outcome = Outcome::success(key.clone(), json!({"applied": true}), attempts);
        self.outcomes
            .lock()
            .await
            .insert(key.clone(), outcome.clone());
        self.events.lock().await.push(format!("end:{key}"));
        Ok(outcome)
    }

    async fn record_failure(
        &self,
        cmd: &Command,
        kind: FailureKind,
        attempts: i32,
    ) -> Result<Outcome, RelayError> {
        let mut outcomes = self.outcomes.lock().await;
        if let Some(existing) = outcomes.get(&cmd.idempotency_key) {
            return Ok(existing.clone());
        }
        let outcome = Outcome::failure(cmd.idempotency_key.clone(), kind, attempts);
        outcomes.insert(cmd.idempotency_key.clone(), outcome.clone());
        Ok(outcome)
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(2), Duration::from_millis(20))
}

fn cmd(key: &str, resource: &str) -> Command {
    Command::new(
        CommandKind::Apply,
        resource,
        json!({"x": 1}),
        CommandOrigin::Api,
    )
    .with_idempotency_key(key)
}

#[tokio::test]
async fn duplicate_submission_applies_effect_once() {
    let store = Arc::new(MemStore::default());
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let first = dispatcher.submit(cmd("abc", "r1")).await.unwrap();
    let second = dispatcher.submit(cmd("abc", "r1")).await.unwrap();

    assert_eq!(store.effects.lock().await.len(), 1);
    assert_eq!(first.status, second.status);
    assert_eq!(first.idempotency_key, second.idempotency_key);
    assert_eq!(first.effect, second.effect);
}

#[tokio::test]
async fn concurrent_duplicates_produce_one_effect_and_identical_outcomes() {
    let store = Arc::new(MemStore::default().with_delay("r1", Duration::from_millis(20)));
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let d1 = dispatcher.clone();
    let d2 = dispatcher.clone();
    let a = tokio::spawn(async move { d1.submit(cmd("abc", "r1")).await });
    let b = tokio::spawn(async move { d2.submit(cmd("abc", "r1")).await });

    let oa = a.await.unwrap().unwrap();
    let ob = b.await.unwrap().unwrap();

    assert_eq!(store.effects.lock().await.len(), 1);
    assert_eq!(oa.status, ob.status);
    assert_eq!(oa.effect, ob.effect);
}

#[tokio::test]
async fn same_resource_key_runs_in_submission_order() {
    let store = Arc::new(MemStore::default().with_delay("r1", Duration::from_millis(50)));
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let wa = dispatcher.enqueue(cmd("a", "r1")).await.unwrap();
    let wb = dispatcher.enqueue(cmd("b", "r1")).await.unwrap();
    wa.wait().await.unwrap();
    wb.wait().await.unwrap();

    let events = store.events.lock().await.clone();
    assert_eq!(events, vec!["start:a", "end:a", "start:b", "end:b"]);
}

#[tokio::test]
async fn different_resource_keys_run_concurrently() {
    let store = Arc::new(
        MemStore::default()
            .with_delay("slow", Duration::from_millis(200))
            .with_delay("fast", Duration::from_millis(5)),
    );
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let wa = dispatcher.enqueue(cmd("a", "slow")).await.unwrap();
    let wb = dispatcher.enqueue(cmd("b", "fast")).await.unwrap();
    wa.wait().await.unwrap();
    wb.wait().await.unwrap();

    let events = store.events.lock().await.clone();
    let end_b = events.iter().position(|e| e == "end:b").unwrap();
    let end_a = events.iter().position(|e| e == "end:a").unwrap();
    assert!(end_b < end_a, "fast partition should finish first: {events:?}");
}

#[tokio::test]
async fn worker_limit_bounds_cross_partition_parallelism() {
    let store = Arc::new(
        MemStore::default()
            .with_delay("r1", Duration::from_millis(30))
            .with_delay("r2", Duration::from_millis(30)),
    );
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 1);

    let wa = dispatcher.enqueue(cmd("a", "r1")).await.unwrap();
    let wb = dispatcher.enqueue(cmd("b", "r2")).await.unwrap();
    wa.wait().await.unwrap();
    wb.wait().await.unwrap();

    // With one worker the two partitions never interleave.
    let events = store.events.lock().await.clone();
    assert!(events[1].starts_with("end:"), "interleaved: {events:?}");
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let store = Arc::new(MemStore::default());
    store
        .plan_faults("abc", vec![Fault::Transient, Fault::Transient])
        .await;
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let outcome = dispatcher.submit(cmd("abc", "r1")).await.unwrap();

    assert_eq!(outcome.status, relay_common::OutcomeStatus::Succeeded);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(store.effects.lock().await.len(), 1);
}

#[tokio::test]
async fn retry_exhaustion_records_terminal_failure() {
    let store = Arc::new(MemStore::default());
    store
        .plan_faults("abc", vec![Fault::Transient; 10])
        .await;
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let outcome = dispatcher.submit(cmd("abc", "r1")).await.unwrap();

    assert_eq!(outcome.status, relay_common::OutcomeStatus::Failed);
    assert_eq!(outcome.failure_kind, Some(FailureKind::TransientIo));
    assert_eq!(outcome.attempts, 3);
    assert!(store.effects.lock().await.is_empty());
}

#[tokio::test]
async fn validation_failure_is_terminal_on_first_attempt() {
    let store = Arc::new(MemStore::default());
    store.plan_faults("abc", vec![Fault::Validation]).await;
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let outcome = dispatcher.submit(cmd("abc", "r1")).await.unwrap();

    assert_eq!(outcome.status, relay_common::OutcomeStatus::Failed);
    assert_eq!(outcome.failure_kind, Some(FailureKind::Validation));
    assert_eq!(outcome.attempts, 1);
    assert!(store.effects.lock().await.is_empty());
}

#[tokio::test]
async fn conflict_loser_waits_for_winner_outcome() {
    let store = Arc::new(MemStore::default());
    store.plan_faults("abc", vec![Fault::Conflict]).await;
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    // Simulate the winner committing its outcome while the loser waits.
    let winner = Outcome::success("abc", json!({"winner": true}), 1);
    let seed_store = store.clone();
    let seeded = winner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        seed_store.seed_outcome(seeded).await;
    });

    let outcome = dispatcher.submit(cmd("abc", "r1")).await.unwrap();

    assert_eq!(outcome.effect, winner.effect);
    assert!(store.effects.lock().await.is_empty());
}

#[tokio::test]
async fn recorded_outcome_short_circuits_dispatch() {
    let store = Arc::new(MemStore::default());
    store
        .seed_outcome(Outcome::success("abc", json!({"prior": true}), 2))
        .await;
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let outcome = dispatcher.submit(cmd("abc", "r1")).await.unwrap();

    assert_eq!(outcome.effect, Some(json!({"prior": true})));
    assert!(store.effects.lock().await.is_empty());
}

#[tokio::test]
async fn reclaimed_partition_preserves_per_key_ordering() {
    let store = Arc::new(MemStore::default().with_delay("r1", Duration::from_millis(3)));
    // Idle window shorter than the submission gap, so the partition for
    // "r1" is reclaimed (and respawned) between most submissions and any
    // straggling send has to survive the handoff in order.
    let dispatcher = Dispatcher::with_idle_window(
        store.clone(),
        fast_policy(),
        4,
        Duration::from_millis(10),
    );

    let mut waiters = Vec::new();
    for i in 0..20 {
        let key = format!("k{i}");
        waiters.push(dispatcher.enqueue(cmd(&key, "r1")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    for waiter in waiters {
        waiter.wait().await.unwrap();
    }

    let events = store.events.lock().await.clone();
    let expected: Vec<String> = (0..20)
        .flat_map(|i| [format!("start:k{i}"), format!("end:k{i}")])
        .collect();
    assert_eq!(events, expected);
}

#[tokio::test]
async fn dropped_waiter_does_not_cancel_processing() {
    let store = Arc::new(MemStore::default().with_delay("r1", Duration::from_millis(50)));
    let dispatcher = Dispatcher::new(store.clone(), fast_policy(), 4);

    let waiter = dispatcher.enqueue(cmd("abc", "r1")).await.unwrap();
    drop(waiter);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let recorded = store.outcomes.lock().await.get("abc").cloned();
    assert!(recorded.is_some(), "command should complete in background");
}
