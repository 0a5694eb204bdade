//! In-memory queue backend for tests and single-process use.
//!
//! Keys never become orphaned here: there is no lease to lapse. An observed
//! `requeue` cancels the current owner's context instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::queue::{
    validate_key, DeadLetteredKey, Enumeration, InProgressKey, Key, KeyState, KeyStatus,
    ObservedInProgressKey, Options, OwnedInProgressKey, QueueError, QueuedKey, WorkQueue,
};

#[derive(Debug, Clone)]
struct QueueItem {
    // Arrival order; the tiebreaker behind priority.
    seq: u64,
    priority: i64,
    not_before: Option<DateTime<Utc>>,
    attempts: u32,
}

#[derive(Debug, Clone)]
struct WipItem {
    lease: u64,
    priority: i64,
    attempts: u32,
    owner: CancellationToken,
}

#[derive(Debug, Clone)]
struct DeadItem {
    priority: i64,
    attempts: u32,
    failed_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    queue: HashMap<String, QueueItem>,
    wip: HashMap<String, WipItem>,
    dead: HashMap<String, DeadItem>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Inserts or merges a queued entry.
    fn enqueue(
        &mut self,
        key: &str,
        priority: i64,
        not_before: Option<DateTime<Utc>>,
        attempts: u32,
    ) {
        self.dead.remove(key);
        if let Some(item) = self.queue.get_mut(key) {
            item.priority = item.priority.max(priority);
            if let (Some(current), Some(new)) = (item.not_before, not_before) {
                item.not_before = Some(current.min(new));
            }
            item.attempts = item.attempts.max(attempts);
            return;
        }
        let seq = self.next_seq();
        self.queue.insert(
            key.to_string(),
            QueueItem {
                seq,
                priority,
                not_before,
                attempts,
            },
        );
    }

    /// Removes the wip entry only if it still belongs to `lease`.
    fn release(&mut self, key: &str, lease: Option<u64>) -> Option<WipItem> {
        let owned = self
            .wip
            .get(key)
            .is_some_and(|item| lease.map_or(true, |lease| item.lease == lease));
        if owned {
            self.wip.remove(key)
        } else {
            None
        }
    }
}

/// In-memory [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    limit: usize,
    state: Arc<RwLock<State>>,
}

impl InMemoryQueue {
    /// Creates a queue whose `enumerate` returns at most `limit` queued keys.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Arc::new(RwLock::new(State::default())),
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn queue(&self, key: &str, opts: Options) -> Result<(), QueueError> {
        validate_key(key)?;
        let not_before = opts.effective_not_before(Utc::now());
        let mut state = self.state.write().await;
        state.enqueue(key, opts.priority, not_before, 0);
        Ok(())
    }

    async fn enumerate(&self) -> Result<Enumeration, QueueError> {
        let state = self.state.read().await;
        let now = Utc::now();

        let in_progress = state
            .wip
            .iter()
            .map(|(key, item)| {
                Box::new(ObservedKey {
                    state: Arc::clone(&self.state),
                    key: key.clone(),
                    priority: item.priority,
                }) as Box<dyn ObservedInProgressKey>
            })
            .collect();

        let mut visible: Vec<(&String, &QueueItem)> = state
            .queue
            .iter()
            .filter(|(key, item)| {
                !state.wip.contains_key(*key) && item.not_before.map_or(true, |nbf| nbf <= now)
            })
            .collect();
        visible.sort_by(|(ka, a), (kb, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.seq.cmp(&b.seq))
                .then(ka.cmp(kb))
        });
        visible.truncate(self.limit);

        let queued = visible
            .into_iter()
            .map(|(key, item)| {
                Box::new(QueuedEntry {
                    state: Arc::clone(&self.state),
                    key: key.clone(),
                    priority: item.priority,
                    seq: item.seq,
                }) as Box<dyn QueuedKey>
            })
            .collect();

        let dead_lettered = state
            .dead
            .iter()
            .filter(|(key, _)| !state.queue.contains_key(*key) && !state.wip.contains_key(*key))
            .map(|(key, item)| {
                Box::new(DeadEntry {
                    state: Arc::clone(&self.state),
                    key: key.clone(),
                    item: item.clone(),
                }) as Box<dyn DeadLetteredKey>
            })
            .collect();

        Ok(Enumeration {
            in_progress,
            queued,
            dead_lettered,
        })
    }

    async fn get_key_state(&self, key: &str) -> Result<Option<KeyState>, QueueError> {
        let state = self.state.read().await;
        if let Some(item) = state.wip.get(key) {
            return Ok(Some(KeyState {
                key: key.to_string(),
                status: KeyStatus::InProgress,
                priority: item.priority,
                attempts: item.attempts,
                not_before: None,
                failed_time: None,
            }));
        }
        if let Some(item) = state.queue.get(key) {
            return Ok(Some(KeyState {
                key: key.to_string(),
                status: KeyStatus::Queued,
                priority: item.priority,
                attempts: item.attempts,
                not_before: item.not_before,
                failed_time: None,
            }));
        }
        Ok(state.dead.get(key).map(|item| KeyState {
            key: key.to_string(),
            status: KeyStatus::DeadLettered,
            priority: item.priority,
            attempts: item.attempts,
            not_before: None,
            failed_time: Some(item.failed_time),
        }))
    }
}

struct QueuedEntry {
    state: Arc<RwLock<State>>,
    key: String,
    priority: i64,
    seq: u64,
}

impl Key for QueuedEntry {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[async_trait]
impl QueuedKey for QueuedEntry {
    async fn start(
        &self,
        parent: &CancellationToken,
    ) -> Result<Box<dyn OwnedInProgressKey>, QueueError> {
        let mut state = self.state.write().await;
        if state.wip.contains_key(&self.key) {
            return Err(QueueError::AlreadyInProgress {
                key: self.key.clone(),
            });
        }
        // A different seq means the entry was claimed and re-queued since the
        // snapshot was taken.
        let item = match state.queue.get(&self.key) {
            Some(item) if item.seq == self.seq => item.clone(),
            _ => {
                return Err(QueueError::NotQueued {
                    key: self.key.clone(),
                })
            }
        };
        state.queue.remove(&self.key);

        let lease = state.next_seq();
        let owner = parent.child_token();
        let attempts = item.attempts.saturating_add(1);
        state.wip.insert(
            self.key.clone(),
            WipItem {
                lease,
                priority: item.priority,
                attempts,
                owner: owner.clone(),
            },
        );

        Ok(Box::new(OwnedKey {
            state: Arc::clone(&self.state),
            key: self.key.clone(),
            priority: item.priority,
            attempts,
            lease,
            owner,
        }))
    }
}

struct ObservedKey {
    state: Arc<RwLock<State>>,
    key: String,
    priority: i64,
}

impl Key for ObservedKey {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[async_trait]
impl InProgressKey for ObservedKey {
    async fn requeue(&self) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        if let Some(item) = state.release(&self.key, None) {
            item.owner.cancel();
            state.enqueue(&self.key, item.priority, None, item.attempts);
        }
        Ok(())
    }
}

impl ObservedInProgressKey for ObservedKey {
    fn is_orphaned(&self) -> bool {
        false
    }
}

struct OwnedKey {
    state: Arc<RwLock<State>>,
    key: String,
    priority: i64,
    attempts: u32,
    lease: u64,
    owner: CancellationToken,
}

impl Key for OwnedKey {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

#[async_trait]
impl InProgressKey for OwnedKey {
    async fn requeue(&self) -> Result<(), QueueError> {
        self.requeue_with_options(Options::default()).await
    }
}

#[async_trait]
impl OwnedInProgressKey for OwnedKey {
    fn context(&self) -> CancellationToken {
        self.owner.clone()
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn requeue_with_options(&self, opts: Options) -> Result<(), QueueError> {
        self.owner.cancel();
        let not_before = opts.effective_not_before(Utc::now());
        let mut state = self.state.write().await;
        if let Some(item) = state.release(&self.key, Some(self.lease)) {
            state.enqueue(
                &self.key,
                item.priority.max(opts.priority),
                not_before,
                item.attempts,
            );
        }
        Ok(())
    }

    async fn complete(&self) -> Result<(), QueueError> {
        self.owner.cancel();
        let mut state = self.state.write().await;
        if state.release(&self.key, Some(self.lease)).is_some() {
            state.dead.remove(&self.key);
        }
        Ok(())
    }

    async fn deadletter(&self) -> Result<(), QueueError> {
        self.owner.cancel();
        let mut state = self.state.write().await;
        if let Some(item) = state.release(&self.key, Some(self.lease)) {
            state.dead.insert(
                self.key.clone(),
                DeadItem {
                    priority: item.priority,
                    attempts: item.attempts,
                    failed_time: Utc::now(),
                },
            );
        }
        Ok(())
    }
}

struct DeadEntry {
    state: Arc<RwLock<State>>,
    key: String,
    item: DeadItem,
}

impl Key for DeadEntry {
    fn name(&self) -> &str {
        &self.key
    }

    fn priority(&self) -> i64 {
        self.item.priority
    }
}

#[async_trait]
impl DeadLetteredKey for DeadEntry {
    fn failed_time(&self) -> Option<DateTime<Utc>> {
        Some(self.item.failed_time)
    }

    fn attempts(&self) -> u32 {
        self.item.attempts
    }

    async fn requeue(&self) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        if state.dead.contains_key(&self.key) {
            state.enqueue(&self.key, self.item.priority, None, 0);
        }
        Ok(())
    }
}
