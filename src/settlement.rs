//! Single-assignment result cells.
//!
//! A [`Settlement`] starts pending and settles exactly once with either a
//! value or a [`SettlementError`]. Any number of clones may wait on it; all
//! of them observe the same outcome. Settlements chain with
//! [`then`](Settlement::then) and join with [`when_all`].
//!
//! Operations that run work in the background (`then`, `when_all`,
//! `timed`, `spawn`) must be called from within a Tokio runtime.

use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::error::SettlementError;

/// The terminal outcome of a settlement: a value or an error, never both.
pub type Outcome<T> = Result<T, SettlementError>;

struct Slot<T> {
    outcome: OnceLock<Outcome<T>>,
    settled: Notify,
}

/// A single-assignment asynchronous result cell.
///
/// `Clone` is cheap: clones share the same slot. The first call to
/// [`settle`](Settlement::settle) wins; later calls are ignored.
///
/// # Examples
///
/// ```
/// use eventuate_client::Settlement;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let settlement = Settlement::pending();
/// let reader = settlement.clone();
/// let waiter = tokio::spawn(async move { reader.value().await });
///
/// assert!(settlement.settle(Ok(42)));
/// assert!(!settlement.settle(Ok(7)));
/// assert_eq!(waiter.await.unwrap().unwrap(), 42);
/// # }
/// ```
pub struct Settlement<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Settlement<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Settlement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settlement")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Result of a [`then`](Settlement::then) callback.
///
/// A callback either finishes on the spot ([`Next::Ready`]) or hands back a
/// settlement that finishes later ([`Next::Deferred`]), whose outcome the
/// chained settlement adopts.
#[derive(Debug)]
pub enum Next<U> {
    /// The continuation finished with this outcome.
    Ready(Outcome<U>),
    /// The continuation finishes when this settlement settles.
    Deferred(Settlement<U>),
}

impl<U> From<Outcome<U>> for Next<U> {
    fn from(outcome: Outcome<U>) -> Self {
        Next::Ready(outcome)
    }
}

impl<U> From<Settlement<U>> for Next<U> {
    fn from(settlement: Settlement<U>) -> Self {
        Next::Deferred(settlement)
    }
}

impl<T> Settlement<T> {
    /// Create an unsettled cell.
    pub fn pending() -> Self {
        Self {
            slot: Arc::new(Slot {
                outcome: OnceLock::new(),
                settled: Notify::new(),
            }),
        }
    }

    /// Create a cell already settled with `value`.
    pub fn success(value: T) -> Self {
        let settlement = Self::pending();
        settlement.settle(Ok(value));
        settlement
    }

    /// Create a cell already settled with `err`.
    pub fn failure(err: SettlementError) -> Self {
        let settlement = Self::pending();
        settlement.settle(Err(err));
        settlement
    }

    /// Settle the cell with `outcome` and wake every waiting reader.
    ///
    /// Returns `true` if this call settled the cell, `false` if it was
    /// already settled (the call then has no effect).
    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        if self.slot.outcome.set(outcome).is_err() {
            return false;
        }
        self.slot.settled.notify_waiters();
        true
    }

    /// Returns `true` once the cell has settled. Never blocks.
    pub fn is_settled(&self) -> bool {
        self.slot.outcome.get().is_some()
    }
}

impl<T: Clone> Settlement<T> {
    /// Returns the outcome if the cell has settled, without waiting.
    pub fn try_value(&self) -> Option<Outcome<T>> {
        self.slot.outcome.get().cloned()
    }

    /// Wait until the cell settles and return its outcome.
    ///
    /// Returns immediately if the cell has already settled. Every reader
    /// receives the same outcome.
    pub async fn value(&self) -> Outcome<T> {
        loop {
            // Register interest before checking the slot so a settle that
            // lands between the check and the await still wakes us.
            let notified = self.slot.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.slot.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Settlement<T> {
    /// Create a cell that settles with `outcome` after `delay`.
    pub fn timed(delay: Duration, outcome: Outcome<T>) -> Self {
        let settlement = Self::pending();
        let target = settlement.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            target.settle(outcome);
        });
        settlement
    }

    /// Run `future` on the runtime and settle with its output.
    ///
    /// A panic inside the future settles the cell with
    /// [`SettlementError::Panicked`].
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let settlement = Self::pending();
        let target = settlement.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(SettlementError::Panicked(panic_message(panic.as_ref()))),
            };
            target.settle(outcome);
        });
        settlement
    }

    /// Chain a continuation onto this cell.
    ///
    /// Once this cell settles, `callback` runs on a spawned task with the
    /// outcome. The returned cell settles with the callback's result; if
    /// the callback returns a [`Settlement`] instead, the returned cell
    /// waits for it and adopts its outcome. A panicking callback settles
    /// the returned cell with [`SettlementError::Panicked`].
    pub fn then<U, F, N>(&self, callback: F) -> Settlement<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> N + Send + 'static,
        N: Into<Next<U>>,
    {
        let chained = Settlement::pending();
        let source = self.clone();
        let target = chained.clone();
        tokio::spawn(async move {
            let outcome = source.value().await;
            let next: Next<U> = match std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome).into())) {
                Ok(next) => next,
                Err(panic) => Next::Ready(Err(SettlementError::Panicked(panic_message(
                    panic.as_ref(),
                )))),
            };
            let outcome = match next {
                Next::Ready(outcome) => outcome,
                Next::Deferred(nested) => nested.value().await,
            };
            target.settle(outcome);
        });
        chained
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Settlement<T> {
    type Output = Outcome<T>;
    type IntoFuture = BoxFuture<'static, Outcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.value().await })
    }
}

/// Join settlements into one that settles after all of them have settled.
///
/// On success the value holds each input's value in input order. If any
/// input fails, the joined cell fails with [`SettlementError::Joined`]
/// listing every failing input; it still waits for all inputs first.
///
/// # Examples
///
/// ```
/// use eventuate_client::{Settlement, settlement::when_all};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let joined = when_all([Settlement::success(1), Settlement::success(2)]);
/// assert_eq!(joined.value().await.unwrap(), vec![1, 2]);
/// # }
/// ```
pub fn when_all<T, I>(settlements: I) -> Settlement<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Settlement<T>>,
{
    let inputs: Vec<Settlement<T>> = settlements.into_iter().collect();
    let joined = Settlement::pending();
    let target = joined.clone();
    tokio::spawn(async move {
        let outcomes = futures::future::join_all(inputs.iter().map(Settlement::value)).await;
        let total = outcomes.len();
        let mut values = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(value) => values.push(value),
                Err(err) => failures.push((index, err)),
            }
        }
        if failures.is_empty() {
            target.settle(Ok(values));
        } else {
            target.settle(Err(SettlementError::Joined { total, failures }));
        }
    });
    joined
}

/// Render a panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::Instant;

    #[tokio::test]
    async fn success_is_settled_and_returns_immediately() {
        let settlement = Settlement::success("resulting message");
        assert!(settlement.is_settled());
        assert_eq!(
            settlement.value().await.expect("should succeed"),
            "resulting message"
        );
    }

    #[tokio::test]
    async fn failure_carries_only_the_error() {
        let settlement: Settlement<String> = Settlement::failure(SettlementError::handler("nope"));
        assert!(settlement.is_settled());
        let err = settlement.value().await.expect_err("should fail");
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test(start_paused = true)]
    async fn pending_reader_is_woken_on_settle() {
        let settlement = Settlement::pending();
        assert!(!settlement.is_settled());
        assert!(settlement.try_value().is_none());

        let reader = settlement.clone();
        let waiter = tokio::spawn(async move { reader.value().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        settlement.settle(Ok("resulting message".to_string()));
        let value = waiter
            .await
            .expect("reader task should not panic")
            .expect("should succeed");
        assert_eq!(value, "resulting message");
    }

    #[tokio::test]
    async fn first_settle_wins() {
        let settlement = Settlement::pending();
        assert!(settlement.settle(Ok(1)));
        assert!(!settlement.settle(Ok(2)));
        assert!(!settlement.settle(Err(SettlementError::handler("late"))));
        assert_eq!(settlement.value().await.expect("should succeed"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settles_have_exactly_one_winner() {
        let settlement = Settlement::pending();
        let mut racers = Vec::new();
        for i in 0..32u32 {
            let target = settlement.clone();
            racers.push(tokio::spawn(async move { (i, target.settle(Ok(i))) }));
        }

        let mut winners = Vec::new();
        for racer in racers {
            let (i, won) = racer.await.expect("racer should not panic");
            if won {
                winners.push(i);
            }
        }

        assert_eq!(winners.len(), 1, "exactly one settle should win");
        assert_eq!(settlement.value().await.expect("should succeed"), winners[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_readers_observe_the_same_outcome() {
        let settlement = Settlement::pending();
        let readers: Vec<_> = (0..16)
            .map(|_| {
                let reader = settlement.clone();
                tokio::spawn(async move { reader.value().await })
            })
            .collect();

        tokio::task::yield_now().await;
        settlement.settle(Ok("shared".to_string()));

        for reader in readers {
            let value = reader
                .await
                .expect("reader should not panic")
                .expect("should succeed");
            assert_eq!(value, "shared");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_settles_after_delay() {
        let started = Instant::now();
        let settlement: Settlement<()> =
            Settlement::timed(Duration::from_millis(1000), Err(SettlementError::handler("late")));
        assert!(!settlement.is_settled());

        let err = settlement.value().await.expect_err("should fail");
        assert_eq!(err.to_string(), "late");
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn spawn_settles_with_future_output() {
        let settlement = Settlement::spawn(async { Ok::<_, SettlementError>(21 * 2) });
        assert_eq!(settlement.value().await.expect("should succeed"), 42);
    }

    #[tokio::test]
    async fn spawn_converts_panic_into_error() {
        fn explode() -> Outcome<u8> {
            panic!("exploded")
        }

        let settlement = Settlement::spawn(async { explode() });
        let err = settlement.value().await.expect_err("should fail");
        assert!(
            matches!(&err, SettlementError::Panicked(msg) if msg == "exploded"),
            "expected Panicked(\"exploded\"), got: {err:?}"
        );
    }

    #[tokio::test]
    async fn then_maps_the_value() {
        let chained = Settlement::success("resulting message").then(|outcome| -> Outcome<usize> {
            let message = outcome?;
            Ok(message.len())
        });
        assert_eq!(chained.value().await.expect("should succeed"), 17);
    }

    #[tokio::test]
    async fn then_sees_source_error() {
        let source: Settlement<u8> = Settlement::failure(SettlementError::handler("source failed"));
        let chained = source.then(|outcome| -> Outcome<String> {
            match outcome {
                Ok(_) => Ok("unexpected".to_string()),
                Err(err) => Ok(format!("recovered from {err}")),
            }
        });
        assert_eq!(
            chained.value().await.expect("should succeed"),
            "recovered from source failed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn then_adopts_a_deferred_settlement() {
        let started = Instant::now();
        let chained = Settlement::success(1).then(|_| -> Settlement<&'static str> {
            Settlement::timed(Duration::from_millis(100), Ok("resulting message 2"))
        });

        tokio::task::yield_now().await;
        assert!(!chained.is_settled());

        assert_eq!(
            chained.value().await.expect("should succeed"),
            "resulting message 2"
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn then_converts_callback_panic_into_error() {
        let chained = Settlement::success(()).then(|_| -> Outcome<()> { panic!("bad continuation") });
        let err = chained.value().await.expect_err("should fail");
        assert!(matches!(err, SettlementError::Panicked(msg) if msg == "bad continuation"));
    }

    #[tokio::test(start_paused = true)]
    async fn when_all_keeps_input_order() {
        let started = Instant::now();
        let slow = Settlement::timed(Duration::from_millis(200), Ok("resulting message 2"));
        let fast = Settlement::timed(Duration::from_millis(100), Ok("resulting message"));

        let values = when_all([fast, slow]).value().await.expect("should succeed");

        assert_eq!(values, vec!["resulting message", "resulting message 2"]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(220));
    }

    #[tokio::test(start_paused = true)]
    async fn when_all_waits_for_every_input_after_an_early_error() {
        let started = Instant::now();
        let early_failure: Settlement<u32> =
            Settlement::timed(Duration::from_millis(10), Err(SettlementError::handler("early")));
        let slow = Settlement::timed(Duration::from_millis(300), Ok(2));
        let fine = Settlement::success(3);

        let err = when_all([early_failure, slow.clone(), fine])
            .value()
            .await
            .expect_err("should fail");

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(slow.is_settled(), "sibling must not be cancelled");
        match err {
            SettlementError::Joined { total, failures } => {
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, 0);
            }
            other => panic!("expected Joined, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn when_all_of_nothing_is_empty() {
        let values = when_all(Vec::<Settlement<u8>>::new())
            .value()
            .await
            .expect("should succeed");
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn settlement_can_be_awaited_directly() {
        let settlement = Settlement::pending();
        settlement.settle(Ok(5u8));
        assert_eq!(settlement.await.expect("should succeed"), 5);
    }
}
