//! Collapses concurrent identical provider calls into one.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use llmux_types::error::LlmError;
use llmux_types::llm::ChatResponse;

pub(crate) type SharedCall = Shared<BoxFuture<'static, Result<ChatResponse, LlmError>>>;

struct InFlight {
    call: SharedCall,
    cancel: CancellationToken,
    waiters: usize,
}

/// In-flight calls keyed by cache key.
#[derive(Clone, Default)]
pub(crate) struct InFlightCalls {
    calls: Arc<DashMap<String, InFlight>>,
}

/// One caller's handle on an in-flight call.
///
/// The shared call runs under its own token, so no single caller's
/// cancellation reaches it. Dropping the last handle of an unsettled call
/// cancels that token; the table entry goes away once the call has settled
/// or nobody waits on it any more.
pub(crate) struct Joined {
    pub call: SharedCall,
    pub leader: bool,
    key: String,
    cancel: CancellationToken,
    table: Arc<DashMap<String, InFlight>>,
}

impl InFlightCalls {
    /// Join the call in flight under `key`, or start one with `start`.
    ///
    /// `start` receives the token the shared call must honour.
    pub(crate) fn join_or_start<F>(&self, key: &str, start: F) -> Joined
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<ChatResponse, LlmError>>,
    {
        let (call, cancel, leader) = match self.calls.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                let entry = existing.get_mut();
                entry.waiters += 1;
                (entry.call.clone(), entry.cancel.clone(), false)
            }
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let call = start(cancel.clone()).shared();
                slot.insert(InFlight {
                    call: call.clone(),
                    cancel: cancel.clone(),
                    waiters: 1,
                });
                (call, cancel, true)
            }
        };
        Joined {
            call,
            leader,
            key: key.to_string(),
            cancel,
            table: self.calls.clone(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

impl Drop for Joined {
    fn drop(&mut self) {
        let settled = self.call.peek().is_some();
        let mut orphaned = false;
        self.table.remove_if_mut(&self.key, |_, entry| {
            if !entry.call.ptr_eq(&self.call) {
                return false;
            }
            entry.waiters = entry.waiters.saturating_sub(1);
            orphaned = entry.waiters == 0 && !settled;
            settled || entry.waiters == 0
        });
        if orphaned {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::testing::text_response;

    fn delayed(
        starts: Arc<AtomicU32>,
        text: &'static str,
    ) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<ChatResponse, LlmError>> {
        move |cancel| {
            starts.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {
                        Ok(text_response("mock", "m", text))
                    }
                }
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_caller_joins_the_first() {
        let table = InFlightCalls::default();
        let starts = Arc::new(AtomicU32::new(0));

        let first = table.join_or_start("k", delayed(starts.clone(), "shared"));
        let second = table.join_or_start("k", delayed(starts.clone(), "other"));
        assert!(first.leader);
        assert!(!second.leader);
        assert_eq!(table.len(), 1);

        let (a, b) = tokio::join!(first.call.clone(), second.call.clone());
        assert_eq!(a.unwrap().text(), "shared");
        assert_eq!(b.unwrap().text(), "shared");
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        drop(first);
        assert_eq!(table.len(), 0);
        drop(second);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_leaving_does_not_cancel_the_shared_call() {
        let table = InFlightCalls::default();
        let starts = Arc::new(AtomicU32::new(0));

        let leader = table.join_or_start("k", delayed(starts.clone(), "shared"));
        let follower = table.join_or_start("k", delayed(starts.clone(), "other"));
        let shared_token = leader.cancel.clone();
        drop(leader);

        assert!(!shared_token.is_cancelled());
        assert_eq!(table.len(), 1);
        assert_eq!(follower.call.clone().await.unwrap().text(), "shared");
        drop(follower);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn last_waiter_leaving_cancels_the_shared_call() {
        let table = InFlightCalls::default();
        let starts = Arc::new(AtomicU32::new(0));

        let leader = table.join_or_start("k", delayed(starts.clone(), "shared"));
        let follower = table.join_or_start("k", delayed(starts.clone(), "other"));
        let shared_token = leader.cancel.clone();

        drop(leader);
        drop(follower);
        assert!(shared_token.is_cancelled());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn failures_are_shared_and_cleared() {
        let table = InFlightCalls::default();
        let joined = table.join_or_start("k", |_| {
            async { Err(LlmError::provider("boom")) }.boxed()
        });
        assert_eq!(joined.call.clone().await, Err(LlmError::provider("boom")));
        drop(joined);

        let fresh = table.join_or_start("k", |_| {
            async { Ok(text_response("mock", "m", "again")) }.boxed()
        });
        assert!(fresh.leader);
    }
}
