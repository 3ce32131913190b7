//! Best-effort leader lock over a shared `{key, owner, expires_at}` record.
//!
//! Acquisition is optimistic: insert a fresh record, or take over one whose
//! expiry has passed. Two processes can briefly both believe they lead (one
//! stole an expired record the other was about to renew); cache writes are
//! idempotent upserts, so that window yields duplicate identical writes and
//! nothing worse.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::jittered;
use crate::db::LockStore;
use crate::error::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unheld,
    Held,
    /// A renewal is in flight; still counts as held.
    Renewing,
    Lost,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub key: String,
    pub owner: String,
    pub ttl: Duration,
    /// Fixed wait between acquisition attempts
    pub retry_delay: Duration,
    /// Random extra wait added to `retry_delay`
    pub retry_jitter: Duration,
}

/// How an acquisition loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    ShutdownRequested,
    Exhausted,
}

#[derive(Clone)]
pub struct LeaderLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    state: Arc<watch::Sender<LockState>>,
}

impl LeaderLock {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        let (state, _) = watch::channel(LockState::Unheld);
        LeaderLock {
            store,
            config,
            state: Arc::new(state),
        }
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    pub fn is_held(&self) -> bool {
        matches!(self.state(), LockState::Held | LockState::Renewing)
    }

    /// Watch state transitions, e.g. to react to `Lost`.
    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state.subscribe()
    }

    pub fn mark_lost(&self) {
        self.set_state(LockState::Lost);
    }

    fn set_state(&self, next: LockState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(key = %self.config.key, ?prev, ?next, "Leader lock state change");
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now + ttl
    }

    /// One acquisition attempt: insert, else steal an expired record.
    ///
    /// A record already carrying our owner id (a restart with a fixed
    /// `INSTANCE_ID`, or renewals that failed without losing the row) is
    /// simply extended.
    pub async fn try_acquire(&self) -> SyncResult<bool> {
        let now = Utc::now();
        let expires_at = self.expiry_from(now);
        let key = &self.config.key;
        let owner = &self.config.owner;

        let acquired = self.store.try_insert(key, owner, expires_at).await?
            || self.store.renew(key, owner, expires_at).await?
            || self
                .store
                .try_steal_expired(key, owner, expires_at, now)
                .await?;

        if acquired {
            info!(key = %key, owner = %owner, expires_at = %expires_at, "Leader lock acquired");
            self.set_state(LockState::Held);
        }
        Ok(acquired)
    }

    /// Retry [`try_acquire`](Self::try_acquire) until it succeeds, `attempts`
    /// runs out (`None` = forever) or shutdown is signalled.
    ///
    /// Contention and store errors are both treated as transient.
    pub async fn acquire(
        &self,
        attempts: Option<u32>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AcquireOutcome {
        let mut tried = 0u32;
        loop {
            if *shutdown.borrow() {
                return AcquireOutcome::ShutdownRequested;
            }
            match self.try_acquire().await {
                Ok(true) => return AcquireOutcome::Acquired,
                Ok(false) => match self.store.current(&self.config.key).await {
                    Ok(Some(rec)) => debug!(
                        key = %rec.key,
                        holder = %rec.owner,
                        expires_at = %rec.expires_at,
                        expired = rec.is_expired(Utc::now()),
                        "Leader lock held elsewhere"
                    ),
                    _ => debug!(key = %self.config.key, "Leader lock contended"),
                },
                Err(e) => warn!(key = %self.config.key, error = %e, "Leader lock attempt failed"),
            }

            tried += 1;
            if attempts.is_some_and(|max| tried >= max) {
                return AcquireOutcome::Exhausted;
            }

            let wait = jittered(self.config.retry_delay, self.config.retry_jitter);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    // Sender gone: nobody can ask us to keep going
                    if changed.is_err() {
                        return AcquireOutcome::ShutdownRequested;
                    }
                }
            }
        }
    }

    /// Extend the expiry. `Ok(false)` means the record is no longer ours.
    pub async fn renew(&self) -> SyncResult<bool> {
        self.set_state(LockState::Renewing);
        let expires_at = self.expiry_from(Utc::now());
        match self
            .store
            .renew(&self.config.key, &self.config.owner, expires_at)
            .await
        {
            Ok(true) => {
                debug!(key = %self.config.key, expires_at = %expires_at, "Leader lock renewed");
                self.set_state(LockState::Held);
                Ok(true)
            }
            Ok(false) => {
                warn!(key = %self.config.key, owner = %self.config.owner, "Leader lock lost");
                self.set_state(LockState::Lost);
                Ok(false)
            }
            Err(e) => {
                self.set_state(LockState::Held);
                Err(e)
            }
        }
    }

    /// Delete the record if still ours so another instance can take over
    /// without waiting out the TTL.
    pub async fn release(&self) -> SyncResult<bool> {
        let released = self
            .store
            .release(&self.config.key, &self.config.owner)
            .await?;
        self.set_state(LockState::Unheld);
        if released {
            info!(key = %self.config.key, owner = %self.config.owner, "Leader lock released");
        } else {
            debug!(key = %self.config.key, "Leader lock was no longer ours at release");
        }
        Ok(released)
    }

    /// Renew every `ttl / 2` in the background until stopped or lost.
    ///
    /// A failed renewal is retried at a quarter of that period for as long
    /// as the retry would still land before our record can be stolen.
    pub fn spawn_renewal(&self) -> RenewalHandle {
        let lock = self.clone();
        let ttl = self.config.ttl;
        let period = (ttl / 2).max(Duration::from_millis(10));
        let retry = (period / 4).max(Duration::from_millis(10));
        // Lower bound on our record's expiry, so taken before each write
        let mut valid_until = Instant::now() + ttl;
        let handle = tokio::spawn(async move {
            let mut wait = period;
            loop {
                tokio::time::sleep(wait).await;
                let attempted_at = Instant::now();
                match lock.renew().await {
                    Ok(true) => {
                        valid_until = attempted_at + ttl;
                        wait = period;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        warn!(key = %lock.config.key, error = %e, "Leader lock renewal failed");
                        if Instant::now() + retry >= valid_until {
                            warn!(key = %lock.config.key, "Leader lock about to expire while renewal keeps failing");
                            lock.mark_lost();
                            return;
                        }
                        wait = retry;
                    }
                }
            }
        });
        RenewalHandle { handle }
    }
}

/// Running renewal task; dropping it does not stop the task.
pub struct RenewalHandle {
    handle: JoinHandle<()>,
}

impl RenewalHandle {
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testing::MemoryStore;

    fn config(owner: &str, ttl: Duration) -> LockConfig {
        LockConfig {
            key: "score-sync".into(),
            owner: owner.into(),
            ttl,
            retry_delay: Duration::from_millis(100),
            retry_jitter: Duration::from_millis(20),
        }
    }

    fn lock_on(store: Arc<dyn LockStore>, owner: &str, ttl: Duration) -> LeaderLock {
        LeaderLock::new(store, config(owner, ttl))
    }

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let db: Arc<dyn LockStore> = Arc::new(Database::open(":memory:").unwrap());
        let a = lock_on(db.clone(), "a", Duration::from_secs(30));
        let b = lock_on(db.clone(), "b", Duration::from_secs(30));

        let (ra, rb) = tokio::join!(a.try_acquire(), b.try_acquire());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra ^ rb, "exactly one instance must win");
        assert_eq!(a.is_held(), ra);
        assert_eq!(b.is_held(), rb);
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let past = Utc::now() - chrono::Duration::seconds(5);
        assert!(db.try_insert("score-sync", "a", past).await.unwrap());

        let b = lock_on(db.clone(), "b", Duration::from_secs(30));
        assert!(b.try_acquire().await.unwrap());
        assert_eq!(db.current("score-sync").await.unwrap().unwrap().owner, "b");

        // The previous holder finds out on its next renewal
        let a = lock_on(db.clone(), "a", Duration::from_secs(30));
        assert!(!a.renew().await.unwrap());
        assert_eq!(a.state(), LockState::Lost);
    }

    #[tokio::test]
    async fn live_lock_is_not_stolen() {
        let db: Arc<dyn LockStore> = Arc::new(Database::open(":memory:").unwrap());
        let a = lock_on(db.clone(), "a", Duration::from_secs(30));
        let b = lock_on(db.clone(), "b", Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert_eq!(b.state(), LockState::Unheld);
    }

    #[tokio::test]
    async fn release_allows_immediate_takeover() {
        let db: Arc<dyn LockStore> = Arc::new(Database::open(":memory:").unwrap());
        let a = lock_on(db.clone(), "a", Duration::from_secs(30));
        let b = lock_on(db.clone(), "b", Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());
        assert!(a.release().await.unwrap());
        assert_eq!(a.state(), LockState::Unheld);
        assert!(b.try_acquire().await.unwrap());
        // Releasing someone else's lock is a no-op
        assert!(!a.release().await.unwrap());
        assert!(b.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_acquire_gives_up() {
        let db: Arc<dyn LockStore> = Arc::new(Database::open(":memory:").unwrap());
        let a = lock_on(db.clone(), "a", Duration::from_secs(30));
        let b = lock_on(db.clone(), "b", Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());

        let (_tx, mut rx) = watch::channel(false);
        assert_eq!(b.acquire(Some(3), &mut rx).await, AcquireOutcome::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_stops_on_shutdown() {
        let db: Arc<dyn LockStore> = Arc::new(Database::open(":memory:").unwrap());
        let a = lock_on(db.clone(), "a", Duration::from_secs(30));
        let b = lock_on(db.clone(), "b", Duration::from_secs(30));
        assert!(a.try_acquire().await.unwrap());

        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { b.acquire(None, &mut rx).await });
        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(true).unwrap();
        assert_eq!(waiter.await.unwrap(), AcquireOutcome::ShutdownRequested);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_retries_through_store_errors() {
        let store = Arc::new(MemoryStore::default());
        store.fail_lock(true);
        let a = lock_on(store.clone(), "a", Duration::from_secs(30));

        let (_tx, mut rx) = watch::channel(false);
        let flipper = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                store.fail_lock(false);
            })
        };
        assert_eq!(a.acquire(None, &mut rx).await, AcquireOutcome::Acquired);
        flipper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_detects_takeover() {
        let store = Arc::new(MemoryStore::default());
        let a = lock_on(store.clone(), "a", Duration::from_secs(2));
        assert!(a.try_acquire().await.unwrap());
        let mut states = a.subscribe();
        let renewal = a.spawn_renewal();

        store.force_lock("score-sync", "intruder", Utc::now() + chrono::Duration::seconds(60));

        tokio::time::timeout(
            Duration::from_secs(10),
            states.wait_for(|s| *s == LockState::Lost),
        )
        .await
        .expect("loss not detected")
        .unwrap();
        renewal.stop().await;
        assert!(!a.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_renewal_gives_up_before_the_record_expires() {
        let store = Arc::new(MemoryStore::default());
        let a = lock_on(store.clone(), "a", Duration::from_secs(4));
        assert!(a.try_acquire().await.unwrap());
        let mut states = a.subscribe();
        store.fail_lock(true);
        let renewal = a.spawn_renewal();

        // Renewal starts at 2s and retries every 500ms; the lock must be
        // given up before the record expires at 4s.
        tokio::time::timeout(
            Duration::from_millis(3_900),
            states.wait_for(|s| *s == LockState::Lost),
        )
        .await
        .expect("lock still believed held past the safe window")
        .unwrap();
        renewal.stop().await;
        assert!(!a.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_recovers_from_a_brief_store_outage() {
        let store = Arc::new(MemoryStore::default());
        let a = lock_on(store.clone(), "a", Duration::from_secs(4));
        assert!(a.try_acquire().await.unwrap());
        let renewal = a.spawn_renewal();

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        store.fail_lock(true);
        tokio::time::sleep(Duration::from_millis(400)).await;
        store.fail_lock(false);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(a.is_held());
        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_lock_while_store_is_healthy() {
        let store = Arc::new(MemoryStore::default());
        let a = lock_on(store.clone(), "a", Duration::from_secs(2));
        assert!(a.try_acquire().await.unwrap());
        let renewal = a.spawn_renewal();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(a.is_held());
        assert!(store.lock_renewals() >= 5);
        renewal.stop().await;
    }
}
