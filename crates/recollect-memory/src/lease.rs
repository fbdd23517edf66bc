//! Owner-tagged leases over the shared cache, with watchdog renewal

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use recollect_core::{Result, SharedCache};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    #[serde(default = "default_min_renew_interval_ms")]
    pub min_renew_interval_ms: u64,

    #[serde(default)]
    pub renew_initial_delay_ms: u64,
}

fn default_ttl_seconds() -> u64 {
    60
}

fn default_min_renew_interval_ms() -> u64 {
    1000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            min_renew_interval_ms: default_min_renew_interval_ms(),
            renew_initial_delay_ms: 0,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Acquires exclusive, expiring leases keyed by string.
///
/// Acquisition never blocks: a held key yields `None` and the caller skips
/// its cycle. At most one live lease exists per key, relying only on the
/// cache's set-if-absent, compare-and-delete and compare-and-expire.
#[derive(Clone)]
pub struct LeaseLock {
    cache: Arc<dyn SharedCache>,
    min_renew_interval: Duration,
    renew_initial_delay: Duration,
}

impl LeaseLock {
    pub fn new(cache: Arc<dyn SharedCache>, config: &LeaseConfig) -> Self {
        Self {
            cache,
            min_renew_interval: Duration::from_millis(config.min_renew_interval_ms),
            renew_initial_delay: Duration::from_millis(config.renew_initial_delay_ms),
        }
    }

    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>> {
        let token = Uuid::new_v4().to_string();
        if !self.cache.set_if_absent(key, &token, ttl).await? {
            debug!(key, "Lease held elsewhere");
            return Ok(None);
        }

        Ok(Some(Lease {
            state: Arc::new(LeaseState {
                cache: self.cache.clone(),
                key: key.to_string(),
                token,
                ttl,
                lost: AtomicBool::new(false),
            }),
            min_renew_interval: self.min_renew_interval,
            renew_initial_delay: self.renew_initial_delay,
            watchdog: Mutex::new(None),
            released: AtomicBool::new(false),
        }))
    }
}

struct LeaseState {
    cache: Arc<dyn SharedCache>,
    key: String,
    token: String,
    ttl: Duration,
    lost: AtomicBool,
}

impl LeaseState {
    async fn renew(&self) -> Result<bool> {
        self.cache
            .compare_and_expire(&self.key, &self.token, self.ttl)
            .await
    }
}

/// A held lease. Released explicitly with [`Lease::release`] or, failing
/// that, when dropped inside a tokio runtime.
pub struct Lease {
    state: Arc<LeaseState>,
    min_renew_interval: Duration,
    renew_initial_delay: Duration,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.state.key)
            .field("ttl", &self.state.ttl)
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.state.key
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    pub fn ttl(&self) -> Duration {
        self.state.ttl
    }

    /// Renewal period: a third of the TTL, never below the configured minimum.
    pub fn renew_period(&self) -> Duration {
        (self.state.ttl / 3).max(self.min_renew_interval)
    }

    /// Whether a renewal found the lease gone or owned by someone else.
    /// The holder keeps running; the flag only reports lost exclusivity.
    pub fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::Acquire)
    }

    /// Start periodic renewal. Calling it again while running is a no-op.
    ///
    /// The first tick is delayed by up to a tenth of the period so that many
    /// holders started together do not renew in lockstep. A mismatch or a
    /// cache failure stops the watchdog and marks the lease lost.
    pub fn start_watchdog(&self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return;
        }

        let period = self.renew_period();
        let max_jitter = (period.as_millis() / 10) as u64;
        let jitter = if max_jitter > 0 {
            rand::thread_rng().gen_range(0..=max_jitter)
        } else {
            0
        };
        let first_delay = self.renew_initial_delay + Duration::from_millis(jitter);
        let state = self.state.clone();

        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(first_delay).await;
            loop {
                match state.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        state.lost.store(true, Ordering::Release);
                        debug!(key = %state.key, "Lease renewal found a different owner, watchdog stopped");
                        break;
                    }
                    Err(e) => {
                        state.lost.store(true, Ordering::Release);
                        warn!(key = %state.key, error = %e, "Lease renewal failed, watchdog stopped");
                        break;
                    }
                }
                tokio::time::sleep(period).await;
            }
        }));
    }

    /// One-shot renewal, e.g. right after an unusually long step.
    pub async fn renew_now(&self) -> bool {
        match self.state.renew().await {
            Ok(true) => true,
            Ok(false) => {
                self.state.lost.store(true, Ordering::Release);
                false
            }
            Err(e) => {
                debug!(key = %self.state.key, error = %e, "Manual lease renewal failed");
                false
            }
        }
    }

    fn stop_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }

    /// Stop renewal and delete the key if it still carries this lease's token.
    ///
    /// Only the first call does anything. Returns whether the key was deleted;
    /// `false` means the lease had already expired or been taken over.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop_watchdog();
        match self
            .state
            .cache
            .compare_and_delete(&self.state.key, &self.state.token)
            .await
        {
            Ok(deleted) => {
                if !deleted {
                    debug!(key = %self.state.key, "Lease already expired or taken over at release");
                }
                deleted
            }
            Err(e) => {
                warn!(key = %self.state.key, error = %e, "Lease release failed, key will expire");
                false
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_watchdog();

        let state = self.state.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = state.cache.compare_and_delete(&state.key, &state.token).await {
                        warn!(key = %state.key, error = %e, "Lease release on drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %state.key, "Lease dropped outside a runtime, left to expire");
            }
        }
    }
}
