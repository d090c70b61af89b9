//! Request id issue and response buffering.
//!
//! The receive task is the only writer of the buffer; callers claim their
//! entry by id. Responses may arrive before, during or after the caller starts
//! waiting, and in any order relative to other requests and push events.
//! Ids whose caller timed out are remembered so their late responses are
//! dropped instead of accumulating.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::SessionError;
use crate::session::proto::{RequestId, ResponseFrame};

/// Unclaimed responses above this count are logged as a leak.
const BUFFER_WARN_THRESHOLD: usize = 256;
/// Oldest abandoned ids are forgotten past this count.
const ABANDONED_LIMIT: usize = 1024;

#[derive(Debug, Default)]
struct Slots {
    buffered: HashMap<RequestId, Value>,
    abandoned: BTreeSet<RequestId>,
}

#[derive(Debug)]
pub struct Correlator {
    last_id: AtomicU64,
    slots: Mutex<Slots>,
    arrivals: Notify,
    grace: Duration,
}

impl Correlator {
    pub fn new(grace: Duration) -> Self {
        Self {
            last_id: AtomicU64::new(0),
            slots: Mutex::new(Slots::default()),
            arrivals: Notify::new(),
            grace,
        }
    }

    /// Returns the next request id: 1, 2, 3, ... never reused by this instance.
    pub fn next_id(&self) -> RequestId {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Buffers a response. The first frame for an id wins; later ones are
    /// dropped, as are responses for ids whose caller already timed out.
    pub fn buffer_response(&self, response: ResponseFrame) -> bool {
        let inserted = {
            let mut slots = self.slots();
            if slots.abandoned.contains(&response.id) {
                debug!(event = "late_response_dropped", id = response.id);
                return false;
            }
            let inserted = match slots.buffered.entry(response.id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(response.payload);
                    true
                }
            };
            if inserted && slots.buffered.len() > BUFFER_WARN_THRESHOLD {
                warn!(event = "response_buffer_growing", buffered = slots.buffered.len());
            }
            inserted
        };

        if inserted {
            self.arrivals.notify_waiters();
        } else {
            debug!(event = "duplicate_response_dropped", id = response.id);
        }
        inserted
    }

    /// Waits for the response to `id`.
    ///
    /// Claims immediately when buffered, otherwise waits at most the grace
    /// period once (woken early by new arrivals) and fails with
    /// [`SessionError::ResponseTimeout`].
    pub async fn await_response(&self, id: RequestId) -> Result<Value, SessionError> {
        if let Some(payload) = self.claim(id) {
            return Ok(payload);
        }

        let deadline = Instant::now() + self.grace;
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.claim(id) {
                return Ok(payload);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        self.claim_or_abandon(id).ok_or_else(|| {
            error!(event = "response_timeout", id);
            SessionError::ResponseTimeout(id)
        })
    }

    /// Number of responses buffered and not yet claimed.
    pub fn buffered_len(&self) -> usize {
        self.slots().buffered.len()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, id: RequestId) -> Option<Value> {
        let mut slots = self.slots();
        let claimed = slots.buffered.remove(&id);
        if claimed.is_some() {
            debug!(event = "response_claimed", id, buffered = slots.buffered.len());
        }
        claimed
    }

    /// Last claim attempt; on a miss the id is marked abandoned under the same lock.
    fn claim_or_abandon(&self, id: RequestId) -> Option<Value> {
        let mut slots = self.slots();
        if let Some(payload) = slots.buffered.remove(&id) {
            return Some(payload);
        }
        slots.abandoned.insert(id);
        if slots.abandoned.len() > ABANDONED_LIMIT {
            slots.abandoned.pop_first();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use super::Correlator;
    use crate::error::SessionError;
    use crate::session::proto::ResponseFrame;

    fn response(id: u64, marker: &str) -> ResponseFrame {
        ResponseFrame {
            id,
            payload: json!({"id": id, "status": 200, "data": marker}),
        }
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let correlator = Correlator::new(Duration::from_millis(10));
        let ids: Vec<u64> = (0..5).map(|_| correlator.next_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ids_are_unique() {
        let correlator = Arc::new(Correlator::new(Duration::from_millis(10)));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let correlator = Arc::clone(&correlator);
            tasks.push(tokio::spawn(async move {
                (0..250).map(|_| correlator.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            let ids = task.await.expect("join");
            assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
            for id in ids {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(seen.iter().min(), Some(&1));
        assert_eq!(seen.iter().max(), Some(&2000));
    }

    #[tokio::test]
    async fn response_buffered_before_wait_is_returned() {
        let correlator = Correlator::new(Duration::from_millis(50));
        correlator.buffer_response(response(7, "early"));

        let payload = correlator.await_response(7).await.expect("buffered response");
        assert_eq!(payload["data"], "early");
        assert_eq!(correlator.buffered_len(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let correlator = Correlator::new(Duration::from_millis(50));
        correlator.buffer_response(response(3, "three"));
        correlator.buffer_response(response(1, "one"));
        correlator.buffer_response(response(2, "two"));

        for (id, marker) in [(2, "two"), (1, "one"), (3, "three")] {
            let payload = correlator.await_response(id).await.expect("response");
            assert_eq!(payload["data"], marker);
        }
    }

    #[tokio::test]
    async fn first_write_wins_on_duplicate_ids() {
        let correlator = Correlator::new(Duration::from_millis(10));
        assert!(correlator.buffer_response(response(4, "first")));
        assert!(!correlator.buffer_response(response(4, "second")));

        let payload = correlator.await_response(4).await.expect("response");
        assert_eq!(payload["data"], "first");
    }

    #[tokio::test]
    async fn late_response_within_grace_is_returned() {
        let correlator = Arc::new(Correlator::new(Duration::from_millis(500)));
        let writer = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.buffer_response(response(5, "late"));
        });

        let started = Instant::now();
        let payload = correlator.await_response(5).await.expect("late response");
        assert_eq!(payload["data"], "late");
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn missing_response_times_out_after_grace() {
        let correlator = Correlator::new(Duration::from_millis(500));
        let started = Instant::now();

        let err = correlator.await_response(42).await.expect_err("timeout");
        let elapsed = started.elapsed();

        assert!(matches!(err, SessionError::ResponseTimeout(42)));
        assert!(elapsed >= Duration::from_millis(450));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unrelated_arrivals_do_not_end_the_wait_early() {
        let correlator = Arc::new(Correlator::new(Duration::from_millis(200)));
        let writer = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.buffer_response(response(100, "other"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.buffer_response(response(9, "mine"));
        });

        let payload = correlator.await_response(9).await.expect("response");
        assert_eq!(payload["data"], "mine");
        assert_eq!(correlator.buffered_len(), 1);
    }

    #[tokio::test]
    async fn response_after_timeout_is_not_buffered() {
        let correlator = Correlator::new(Duration::from_millis(50));
        let err = correlator.await_response(3).await.expect_err("timeout");
        assert!(matches!(err, SessionError::ResponseTimeout(3)));

        assert!(!correlator.buffer_response(response(3, "too late")));
        assert_eq!(correlator.buffered_len(), 0);

        assert!(!correlator.buffer_response(response(3, "duplicate")));
        assert_eq!(correlator.buffered_len(), 0);

        assert!(correlator.buffer_response(response(4, "on time")));
        assert_eq!(correlator.buffered_len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_succeed_at_most_once() {
        let correlator = Arc::new(Correlator::new(Duration::from_millis(100)));
        correlator.buffer_response(response(11, "once"));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let correlator = Arc::clone(&correlator);
            tasks.push(tokio::spawn(
                async move { correlator.await_response(11).await },
            ));
        }

        let mut successes = 0;
        for task in tasks {
            match task.await.expect("join") {
                Ok(_) => successes += 1,
                Err(SessionError::ResponseTimeout(11)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(successes, 1);
    }
}
