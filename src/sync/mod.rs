pub mod backoff;
pub mod change;
pub mod lock;

pub use backoff::Backoff;
pub use change::detect_changes;
pub use lock::{AcquireOutcome, LeaderLock, LockConfig, LockState};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::CacheStore;
use crate::error::{SyncError, SyncResult};
use crate::live_scores::{normalize, ScoreProvider};

/// Lifecycle of one poller process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Locking,
    Running,
    /// Waiting out a backoff delay after upstream failures
    Backoff,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Acquisition attempts after the lock is lost mid-run
    pub reacquire_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            poll_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            reacquire_attempts: 3,
        }
    }
}

/// Counters kept across ticks.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub ticks: u64,
    pub upstream_failures: u64,
    pub store_failures: u64,
    /// Cache rows written (created + updated)
    pub records_written: u64,
    /// Games skipped because their content was unchanged
    pub records_skipped: u64,
    pub last_success: Option<DateTime<Utc>>,
}

/// What one successful tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub games: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl TickReport {
    pub fn written(&self) -> usize {
        self.created + self.updated
    }
}

/// Fetch → normalize → detect → upsert, on a timer, while holding the
/// leader lock.
pub struct SyncLoop {
    provider: Arc<dyn ScoreProvider>,
    cache: Arc<dyn CacheStore>,
    lock: LeaderLock,
    settings: SyncSettings,
    backoff: Backoff,
    stats: SyncStats,
    state: LoopState,
}

impl SyncLoop {
    pub fn new(
        provider: Arc<dyn ScoreProvider>,
        cache: Arc<dyn CacheStore>,
        lock: LeaderLock,
        settings: SyncSettings,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_base, settings.backoff_max);
        SyncLoop {
            provider,
            cache,
            lock,
            settings,
            backoff,
            stats: SyncStats::default(),
            state: LoopState::Starting,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[allow(dead_code)]
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// One polling cycle. Hashes for the whole batch are read before any
    /// write is issued, and only changed games are written.
    pub async fn tick(&mut self) -> SyncResult<TickReport> {
        let fetch = tokio::time::timeout(self.settings.fetch_timeout, self.provider.fetch());
        let raw = match fetch.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::Upstream(format!(
                    "{} timed out after {:?}",
                    self.provider.name(),
                    self.settings.fetch_timeout
                )))
            }
        };

        let snapshots = normalize(&raw);
        let mut report = TickReport {
            fetched: raw.len(),
            games: snapshots.len(),
            ..TickReport::default()
        };
        if snapshots.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = snapshots.iter().map(|s| s.id.clone()).collect();
        let prior = self.cache.read_hashes(&ids).await?;
        let changes = detect_changes(snapshots, &prior, Utc::now());
        report.created = changes.created;
        report.updated = changes.updated;
        report.unchanged = changes.unchanged;

        if changes.is_empty() {
            return Ok(report);
        }
        if !self.lock.is_held() {
            return Err(SyncError::LockLost {
                key: self.lock.key().to_string(),
                owner: self.lock.owner().to_string(),
            });
        }
        for rec in &changes.records {
            debug!(game_id = %rec.game_id, hash = %rec.hash, "Game changed");
        }
        self.cache.upsert_many(&changes.records).await?;
        Ok(report)
    }

    /// Run until shutdown is signalled (`Ok`) or the lock is lost for good
    /// (`Err(LockLost)`). The lock is released on the way out either way.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SyncResult<SyncStats> {
        self.state = LoopState::Locking;
        info!(
            provider = self.provider.name(),
            key = self.lock.key(),
            owner = self.lock.owner(),
            interval = ?self.settings.poll_interval,
            "Score sync starting, waiting for leader lock"
        );

        match self.lock.acquire(None, &mut shutdown).await {
            AcquireOutcome::Acquired => {}
            _ => {
                info!("Shutdown requested before the leader lock was acquired");
                self.state = LoopState::Stopped;
                return Ok(self.stats);
            }
        }

        let mut renewal = Some(self.lock.spawn_renewal());
        let mut lock_state = self.lock.subscribe();
        self.state = LoopState::Running;
        let mut next_delay = Duration::ZERO;

        let outcome: SyncResult<()> = loop {
            let mut lost = false;
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                _ = lock_state.wait_for(|s| *s == LockState::Lost) => lost = true,
                _ = tokio::time::sleep(next_delay) => {}
            }

            if lost {
                if let Some(handle) = renewal.take() {
                    handle.stop().await;
                }
                warn!(key = self.lock.key(), "Leader lock lost, trying to reacquire");
                match self
                    .lock
                    .acquire(Some(self.settings.reacquire_attempts), &mut shutdown)
                    .await
                {
                    AcquireOutcome::Acquired => {
                        renewal = Some(self.lock.spawn_renewal());
                        next_delay = Duration::ZERO;
                        continue;
                    }
                    AcquireOutcome::ShutdownRequested => break Ok(()),
                    AcquireOutcome::Exhausted => {
                        error!(key = self.lock.key(), "Could not reacquire leader lock, stopping");
                        break Err(SyncError::LockLost {
                            key: self.lock.key().to_string(),
                            owner: self.lock.owner().to_string(),
                        });
                    }
                }
            }

            // An in-flight tick is abandoned on shutdown
            let result = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                result = self.tick() => result,
            };
            next_delay = self.record(result);
        };

        self.state = LoopState::Stopping;
        if let Some(handle) = renewal.take() {
            handle.stop().await;
        }
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "Failed to release leader lock, it will expire on its own");
        }
        self.state = LoopState::Stopped;
        info!(
            ticks = self.stats.ticks,
            written = self.stats.records_written,
            upstream_failures = self.stats.upstream_failures,
            store_failures = self.stats.store_failures,
            last_success = ?self.stats.last_success,
            "Score sync stopped"
        );
        outcome.map(|_| self.stats)
    }

    /// Fold a tick result into stats and state; returns the wait before the
    /// next tick.
    fn record(&mut self, result: SyncResult<TickReport>) -> Duration {
        self.stats.ticks += 1;
        match result {
            Ok(report) => {
                if self.backoff.failures() > 0 {
                    info!(failures = self.backoff.failures(), "Upstream recovered");
                }
                self.backoff.reset();
                self.state = LoopState::Running;
                self.stats.records_written += report.written() as u64;
                self.stats.records_skipped += report.unchanged as u64;
                self.stats.last_success = Some(Utc::now());
                if report.written() > 0 {
                    info!(
                        fetched = report.fetched,
                        games = report.games,
                        created = report.created,
                        updated = report.updated,
                        unchanged = report.unchanged,
                        "Tick wrote changed games"
                    );
                } else {
                    debug!(games = report.games, unchanged = report.unchanged, "Tick: no changes");
                }
                self.settings.poll_interval
            }
            Err(SyncError::Upstream(msg)) => {
                self.stats.upstream_failures += 1;
                let delay = self.backoff.next_delay();
                self.state = LoopState::Backoff;
                warn!(
                    stage = "fetch",
                    provider = self.provider.name(),
                    failures = self.backoff.failures(),
                    retry_in = ?delay,
                    "Tick failed: {}",
                    msg
                );
                delay
            }
            Err(SyncError::Store(msg)) => {
                self.stats.store_failures += 1;
                self.state = LoopState::Running;
                warn!(stage = "cache", "Tick failed: {}", msg);
                self.settings.poll_interval
            }
            Err(SyncError::LockLost { .. }) => {
                warn!(stage = "write", "Tick skipped its write: leader lock not held");
                self.lock.mark_lost();
                Duration::ZERO
            }
            Err(e) => {
                error!("Tick failed: {}", e);
                self.settings.poll_interval
            }
        }
    }
}

/// Resolves once shutdown is signalled or the signalling side is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
