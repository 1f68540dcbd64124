//! Request coalescing: concurrent identical requests share one execution.
//!
//! ## Responsibility
//! The first request for a key becomes the *leader* and opens a coalescing
//! window; identical requests arriving while the window is open become
//! *followers* and wait for the leader's result instead of invoking the
//! downstream handler themselves. The window closes automatically once the
//! configured delay has elapsed; later arrivals start a fresh group.
//!
//! ## Guarantees
//! - Exactly one downstream execution per group on the happy path
//! - A leader that fails (or is cancelled mid-flight) releases its
//!   followers: they fall back to their own downstream call rather than
//!   hanging or receiving a fabricated response
//! - Responses are shared verbatim; downstream *errors* are never cloned
//!   across requests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;

use crate::EngineResponse;

/// Progress of a coalescing group, broadcast to followers.
#[derive(Debug, Clone)]
pub enum BatchState {
    /// Leader still executing.
    Pending,
    /// Leader failed or was cancelled; followers must fend for themselves.
    Failed,
    /// Leader finished; the shared response.
    Done(EngineResponse),
}

#[derive(Debug)]
struct BatchGroup {
    id: u64,
    opened_at: Instant,
    rx: watch::Receiver<BatchState>,
}

type GroupMap = Arc<DashMap<String, BatchGroup>>;

/// Role assigned to a request by [`RequestBatcher::join`].
#[derive(Debug)]
pub enum BatchRole {
    /// This request executes downstream and must call
    /// [`RequestBatcher::complete`] (or drop the token to signal failure).
    Leader(BatchToken),
    /// This request waits on the leader via [`RequestBatcher::wait`].
    Follower(watch::Receiver<BatchState>),
}

/// Leadership token for one coalescing group.
///
/// Owns the group's `watch::Sender`, so the leader can always reach its
/// followers — even if the map entry was replaced by a newer group after
/// the window closed. Dropping the token without completing it marks the
/// group failed, so followers are released even if the leader's future is
/// cancelled.
#[derive(Debug)]
pub struct BatchToken {
    groups: GroupMap,
    key: String,
    id: u64,
    tx: watch::Sender<BatchState>,
    completed: bool,
}

impl BatchToken {
    fn finish(&mut self, state: BatchState) {
        if self.completed {
            return;
        }
        self.completed = true;
        // Only our own map entry is cleaned up; a newer group under the same
        // key belongs to its own leader.
        self.groups.remove_if(&self.key, |_, g| g.id == self.id);
        self.tx.send_replace(state);
    }
}

impl Drop for BatchToken {
    fn drop(&mut self) {
        self.finish(BatchState::Failed);
    }
}

/// Per-key single-flight coalescer with a fixed window.
#[derive(Debug)]
pub struct RequestBatcher {
    window: Duration,
    next_id: AtomicU64,
    groups: GroupMap,
}

impl RequestBatcher {
    /// Create a batcher with the given coalescing window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_id: AtomicU64::new(1),
            groups: Arc::new(DashMap::new()),
        }
    }

    /// Join the coalescing group for `key`, becoming leader if no group is
    /// open (or the open group's window has already closed).
    pub fn join(&self, key: &str) -> BatchRole {
        use dashmap::mapref::entry::Entry;

        match self.groups.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().opened_at.elapsed() < self.window {
                    BatchRole::Follower(occupied.get().rx.clone())
                } else {
                    // Window closed; new arrivals start a fresh group. The
                    // old group's sender lives in its leader's token, so
                    // followers already attached still get that broadcast.
                    let (group, token) = self.new_group(key);
                    occupied.insert(group);
                    BatchRole::Leader(token)
                }
            }
            Entry::Vacant(vacant) => {
                let (group, token) = self.new_group(key);
                vacant.insert(group);
                BatchRole::Leader(token)
            }
        }
    }

    fn new_group(&self, key: &str) -> (BatchGroup, BatchToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(BatchState::Pending);
        let group = BatchGroup {
            id,
            opened_at: Instant::now(),
            rx,
        };
        let token = BatchToken {
            groups: Arc::clone(&self.groups),
            key: key.to_string(),
            id,
            tx,
            completed: false,
        };
        (group, token)
    }

    /// Broadcast the leader's outcome to its followers and close the group.
    ///
    /// `None` signals failure: followers fall back to their own downstream
    /// call.
    pub fn complete(&self, mut token: BatchToken, response: Option<EngineResponse>) {
        let state = match response {
            Some(r) => BatchState::Done(r),
            None => BatchState::Failed,
        };
        token.finish(state);
    }

    /// Wait for the leader's result. Returns `None` when the leader failed
    /// or was cancelled, in which case the caller should execute downstream
    /// itself.
    pub async fn wait(mut rx: watch::Receiver<BatchState>) -> Option<EngineResponse> {
        loop {
            match rx.borrow_and_update().clone() {
                BatchState::Pending => {}
                BatchState::Failed => return None,
                BatchState::Done(response) => return Some(response),
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a terminal state.
                return None;
            }
        }
    }

    /// Number of currently open groups.
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    fn window_ms(ms: u64) -> RequestBatcher {
        RequestBatcher::new(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_first_arrival_leads() {
        let batcher = window_ms(50);
        assert!(matches!(batcher.join("GET:/a"), BatchRole::Leader(_)));
    }

    #[tokio::test]
    async fn test_second_arrival_within_window_follows_and_shares_result() {
        let batcher = window_ms(1_000);
        let leader = match batcher.join("GET:/a") {
            BatchRole::Leader(token) => token,
            BatchRole::Follower(_) => panic!("expected leader"),
        };
        let follower = match batcher.join("GET:/a") {
            BatchRole::Follower(rx) => rx,
            BatchRole::Leader(_) => panic!("expected follower"),
        };

        batcher.complete(leader, Some(EngineResponse::ok(b"shared".to_vec())));
        let result = RequestBatcher::wait(follower).await.unwrap();
        assert_eq!(result.body, b"shared");
    }

    #[tokio::test]
    async fn test_different_keys_do_not_coalesce() {
        let batcher = window_ms(1_000);
        let _a = batcher.join("GET:/a");
        assert!(matches!(batcher.join("GET:/b"), BatchRole::Leader(_)));
    }

    #[tokio::test]
    async fn test_arrival_after_window_starts_new_group() {
        let batcher = window_ms(5);
        let _first = batcher.join("GET:/a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(batcher.join("GET:/a"), BatchRole::Leader(_)));
    }

    #[tokio::test]
    async fn test_follower_survives_group_replacement_after_window() {
        let batcher = window_ms(50);
        let leader = match batcher.join("GET:/a") {
            BatchRole::Leader(token) => token,
            BatchRole::Follower(_) => panic!("expected leader"),
        };
        let follower = match batcher.join("GET:/a") {
            BatchRole::Follower(rx) => rx,
            BatchRole::Leader(_) => panic!("expected follower"),
        };

        // Let the window close, then let a new arrival replace the map entry.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _second = match batcher.join("GET:/a") {
            BatchRole::Leader(token) => token,
            BatchRole::Follower(_) => panic!("expected fresh leader"),
        };

        // The original leader finishes afterwards; its follower must still
        // receive the shared response, not fall back to re-executing.
        batcher.complete(leader, Some(EngineResponse::ok(b"late".to_vec())));
        let result = RequestBatcher::wait(follower).await.unwrap();
        assert_eq!(result.body, b"late");
    }

    #[tokio::test]
    async fn test_leader_failure_releases_followers() {
        let batcher = window_ms(1_000);
        let leader = match batcher.join("GET:/a") {
            BatchRole::Leader(token) => token,
            BatchRole::Follower(_) => panic!("expected leader"),
        };
        let follower = match batcher.join("GET:/a") {
            BatchRole::Follower(rx) => rx,
            BatchRole::Leader(_) => panic!("expected follower"),
        };

        batcher.complete(leader, None);
        assert!(RequestBatcher::wait(follower).await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_leader_token_releases_followers() {
        let batcher = window_ms(1_000);
        let leader = batcher.join("GET:/a");
        let follower = match batcher.join("GET:/a") {
            BatchRole::Follower(rx) => rx,
            BatchRole::Leader(_) => panic!("expected follower"),
        };

        drop(leader); // leader future cancelled before completing
        assert!(RequestBatcher::wait(follower).await.is_none());
    }

    #[tokio::test]
    async fn test_completion_closes_the_group() {
        let batcher = window_ms(1_000);
        let leader = match batcher.join("GET:/a") {
            BatchRole::Leader(token) => token,
            BatchRole::Follower(_) => panic!("expected leader"),
        };
        batcher.complete(leader, Some(EngineResponse::ok(Vec::new())));
        assert_eq!(batcher.open_groups(), 0);
        // Next arrival leads a fresh group.
        assert!(matches!(batcher.join("GET:/a"), BatchRole::Leader(_)));
    }

    #[tokio::test]
    async fn test_many_followers_all_receive_the_same_body() {
        let batcher = Arc::new(window_ms(1_000));
        let leader = match batcher.join("GET:/a") {
            BatchRole::Leader(token) => token,
            BatchRole::Follower(_) => panic!("expected leader"),
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let rx = match batcher.join("GET:/a") {
                BatchRole::Follower(rx) => rx,
                BatchRole::Leader(_) => panic!("expected follower"),
            };
            handles.push(tokio::spawn(RequestBatcher::wait(rx)));
        }

        batcher.complete(leader, Some(EngineResponse::ok(b"one".to_vec())));
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.body, b"one");
        }
    }
}
