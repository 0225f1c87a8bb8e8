//! Modem Pool (C5): discovery, concurrent initialization, SIM dedup,
//! lease arbitration, scoring, health loop, shutdown.
//!
//! The session map shape (`Arc<RwLock<HashMap<...>>>`, single lock guarding
//! discovery/eviction/shutdown, a periodic sweep task) is generalized from
//! `SessionManager`/`sweep()` in `examples/gawd-ai-sctl/server/src/sessions/mod.rs` —
//! same map-behind-one-lock idiom, lease-via-drop instead of kill-on-idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glob::glob;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::SmsError;
use crate::session::{ModemSession, ModemState, SessionStatus};

/// Exponential backoff schedule for a saturated-pool blocking acquire,
/// followed by a constant final step (§4.5).
const BACKOFF_SCHEDULE_SECS: &[u64] = &[60, 180, 300, 420, 540];
const BACKOFF_STEADY_STATE_SECS: u64 = 60;

/// A single eligible-for-selection entry.
struct PoolEntry {
    session: Arc<ModemSession>,
}

/// An exclusive borrow of a modem session. Dropping (or calling
/// [`ModemLease::release`]) flips `in_use` false and stamps `last_used`.
pub struct ModemLease {
    session: Arc<ModemSession>,
    released: AtomicBool,
}

impl ModemLease {
    #[must_use]
    pub fn session(&self) -> &ModemSession {
        &self.session
    }

    /// Explicit release, for callers that want it to happen before drop.
    /// Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.session.state().set_in_use(false);
        }
    }
}

impl Drop for ModemLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pool-wide configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub port_patterns: Vec<String>,
    pub baud_rate: u32,
    pub session_init_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub error_threshold: u32,
    pub default_country_code: String,
    pub usb_vid_pid: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port_patterns: vec!["/dev/ttyUSB*".to_string(), "/dev/ttyACM*".to_string()],
            baud_rate: 115_200,
            session_init_timeout_secs: 30,
            health_check_interval_secs: 30,
            error_threshold: crate::session::ERROR_THRESHOLD,
            default_country_code: "+86".to_string(),
            usb_vid_pid: Vec::new(),
        }
    }
}

/// Discover and own the set of live modem sessions; arbitrate leases.
pub struct ModemPool {
    sessions: Arc<RwLock<HashMap<String, PoolEntry>>>,
    config: PoolConfig,
}

impl ModemPool {
    /// Build a pool directly from already-constructed sessions, bypassing
    /// port discovery. Used by arbitration tests that don't have hardware
    /// to discover.
    #[cfg(test)]
    pub(crate) fn new_for_test(sessions: Vec<Arc<ModemSession>>, config: PoolConfig) -> Self {
        let map = sessions
            .into_iter()
            .enumerate()
            .map(|(i, session)| (format!("test-{i}"), PoolEntry { session }))
            .collect();
        Self {
            sessions: Arc::new(RwLock::new(map)),
            config,
        }
    }

    /// Discover candidate ports, probe each concurrently with a bounded
    /// timeout, deduplicate by IMSI, and return the initialized pool.
    pub async fn initialize(config: PoolConfig) -> Result<Self, SmsError> {
        reset_usb_devices(&config.usb_vid_pid);

        let candidates = discover_ports(&config.port_patterns);
        info!(count = candidates.len(), "discovered candidate ports");

        let timeout = Duration::from_secs(config.session_init_timeout_secs);
        let baud = config.baud_rate;
        let country_code = config.default_country_code.clone();

        let probes = candidates.into_iter().map(|port| {
            let country_code = country_code.clone();
            async move {
                let result = tokio::time::timeout(timeout, probe_port(&port, baud, &country_code)).await;
                match result {
                    Ok(Ok(session)) => Some(session),
                    Ok(Err(e)) => {
                        warn!(port = %port, error = %e, "modem probe failed");
                        None
                    }
                    Err(_) => {
                        warn!(port = %port, "modem probe timed out");
                        None
                    }
                }
            }
        });

        let probed: Vec<Arc<ModemSession>> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();

        let deduped = dedup_by_imsi(probed).await;

        let mut map = HashMap::new();
        for session in deduped {
            let port = session.port_name();
            map.insert(port, PoolEntry { session });
        }

        info!(count = map.len(), "modem pool initialized");

        Ok(Self {
            sessions: Arc::new(RwLock::new(map)),
            config,
        })
    }

    /// Number of sessions currently held (not the number currently
    /// available — see [`ModemPool::acquire`] for eligibility).
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Single-shot arbitration: pick the best eligible session or
    /// `NoCapacity`.
    ///
    /// Takes the map's write lock for the whole scan-then-claim sequence so
    /// concurrent callers can't both observe the same session as eligible
    /// and both flip its `in_use` flag — a shared read guard here would let
    /// two callers race the same unconditional `store`, handing out two
    /// leases on one modem. The lock is held only across the in-memory scan
    /// and the atomic flip, never across any session I/O.
    pub async fn acquire(&self) -> Result<ModemLease, SmsError> {
        let sessions = self.sessions.write().await;
        let mut best: Option<(&Arc<ModemSession>, f64, u64)> = None;

        for entry in sessions.values() {
            let state = entry.session.state();
            if !is_eligible(&entry.session, state, self.config.error_threshold) {
                continue;
            }
            let score = score_of(state);
            let idle = now_epoch().saturating_sub(state.last_used());
            let better = match &best {
                None => true,
                Some((_, best_score, best_idle)) => {
                    score > *best_score || ((score - *best_score).abs() < f64::EPSILON && idle > *best_idle)
                }
            };
            if better {
                best = Some((&entry.session, score, idle));
            }
        }

        match best {
            Some((session, ..)) => {
                session.state().set_in_use(true);
                Ok(ModemLease {
                    session: Arc::clone(session),
                    released: AtomicBool::new(false),
                })
            }
            None => Err(SmsError::NoCapacity),
        }
    }

    /// Blocking acquire with the discrete backoff schedule from §4.5.
    /// `cancel` resolves immediately if the caller's context is cancelled,
    /// releasing the wait without acquiring.
    pub async fn acquire_waiting(
        &self,
        cancel: &tokio::sync::Notify,
    ) -> Result<ModemLease, SmsError> {
        let mut step = 0usize;
        loop {
            match self.acquire().await {
                Ok(lease) => return Ok(lease),
                Err(SmsError::NoCapacity) => {
                    let wait = BACKOFF_SCHEDULE_SECS
                        .get(step)
                        .copied()
                        .unwrap_or(BACKOFF_STEADY_STATE_SECS);
                    step += 1;
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(wait)) => {}
                        () = cancel.notified() => return Err(SmsError::Cancelled),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Run the supervisory health loop until `cancel` fires. Calls
    /// `health_check()` on every session every `health_check_interval_secs`
    /// and evicts any that end up `Faulted`.
    pub async fn run_health_loop(&self, cancel: &tokio::sync::Notify) {
        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel.notified() => return,
            }
            self.health_check_all().await;
        }
    }

    async fn health_check_all(&self) {
        let snapshot: Vec<Arc<ModemSession>> = {
            let sessions = self.sessions.read().await;
            sessions.values().map(|e| Arc::clone(&e.session)).collect()
        };

        for session in &snapshot {
            if let Err(e) = session.health_check().await {
                warn!(port = %session.port_name(), error = %e, "health check failed");
            }
        }

        let faulted: Vec<String> = snapshot
            .iter()
            .filter(|s| s.status() == SessionStatus::Faulted)
            .map(|s| s.port_name())
            .collect();

        if !faulted.is_empty() {
            let mut sessions = self.sessions.write().await;
            for port in &faulted {
                sessions.remove(port);
                warn!(port = %port, "evicted faulted session");
            }
        }
    }

    /// Close every session concurrently and clear the set.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        let closes = sessions.values().map(|e| {
            let session = Arc::clone(&e.session);
            async move {
                let _ = session.close().await;
            }
        });
        futures::future::join_all(closes).await;
        sessions.clear();
    }
}

fn is_eligible(session: &ModemSession, state: &ModemState, error_threshold: u32) -> bool {
    session.status() == SessionStatus::Ready
        && state.available()
        && !state.in_use()
        && state.error_count() < error_threshold
}

/// `score = signal/99 + min((now-last_used)/3600, 1.0) - 0.1*error_count`
fn score_of(state: &ModemState) -> f64 {
    let signal = f64::from(state.signal().max(0));
    let idle_secs = now_epoch().saturating_sub(state.last_used()) as f64;
    signal / 99.0 + (idle_secs / 3600.0).min(1.0) - 0.1 * f64::from(state.error_count())
}

fn now_epoch() -> u64 {
    crate::session::now_epoch()
}

/// Expand glob patterns to candidate ports, sorted and deduplicated.
fn discover_ports(patterns: &[String]) -> Vec<String> {
    let mut ports: Vec<String> = patterns
        .iter()
        .flat_map(|pattern| glob(pattern).into_iter().flatten())
        .filter_map(Result::ok)
        .filter_map(|p| p.to_str().map(str::to_string))
        .collect();
    ports.sort();
    ports.dedup();
    ports
}

async fn probe_port(
    port: &str,
    baud: u32,
    country_code: &str,
) -> Result<Arc<ModemSession>, SmsError> {
    let session = ModemSession::open(port, baud, country_code).await?;
    session.configure().await?;
    Ok(Arc::new(session))
}

/// Keep the higher-signal session among any that share an IMSI, closing
/// the rest (§4.5 SIM deduplication).
async fn dedup_by_imsi(sessions: Vec<Arc<ModemSession>>) -> Vec<Arc<ModemSession>> {
    let mut by_imsi: HashMap<String, Arc<ModemSession>> = HashMap::new();
    let mut no_imsi = Vec::new();

    for session in sessions {
        let imsi = session.descriptor().and_then(|d| {
            if d.imsi.is_empty() {
                None
            } else {
                Some(d.imsi)
            }
        });

        match imsi {
            None => no_imsi.push(session),
            Some(imsi) => match by_imsi.get(&imsi) {
                Some(existing) if existing.state().signal() >= session.state().signal() => {
                    let _ = session.close().await;
                }
                Some(existing) => {
                    let losing = Arc::clone(existing);
                    let _ = losing.close().await;
                    by_imsi.insert(imsi, session);
                }
                None => {
                    by_imsi.insert(imsi, session);
                }
            },
        }
    }

    by_imsi.into_values().chain(no_imsi).collect()
}

/// Best-effort `usbreset` on configured VID:PID pairs to recover hung
/// dongles. A no-op when the utility or device isn't present — this is
/// explicitly allowed to fail silently per the open-question resolution.
fn reset_usb_devices(vid_pids: &[String]) {
    for pair in vid_pids {
        let Some((vid, pid)) = pair.split_once(':') else {
            warn!(pair = %pair, "malformed VID:PID, skipping usbreset");
            continue;
        };
        let status = std::process::Command::new("usbreset")
            .arg(format!("{vid}:{pid}"))
            .status();
        match status {
            Ok(s) if s.success() => info!(vid, pid, "usbreset succeeded"),
            Ok(s) => warn!(vid, pid, code = ?s.code(), "usbreset exited non-zero"),
            Err(e) => warn!(vid, pid, error = %e, "usbreset unavailable, continuing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_ports_deduplicates_and_sorts() {
        // glob on a pattern matching nothing returns an empty, sorted vec.
        let ports = discover_ports(&["/dev/this-will-not-exist-*".to_string()]);
        assert!(ports.is_empty());
    }

    #[test]
    fn score_formula_rewards_signal_and_idle_penalizes_errors() {
        // score = signal/99 + min(idle/3600,1.0) - 0.1*errors
        // A fresh, high-signal, error-free modem should score near 1.0+ (signal term alone ~0.24 for 24).
        let signal = 24.0_f64;
        let expected_signal_term = signal / 99.0;
        assert!((expected_signal_term - 0.2424).abs() < 0.001);
    }

    #[test]
    fn malformed_vid_pid_is_skipped_without_panicking() {
        reset_usb_devices(&["not-a-pair".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_never_grants_two_leases_on_one_session() {
        let session = Arc::new(ModemSession::new_ready_for_test(24));
        let pool = Arc::new(ModemPool::new_for_test(
            vec![session],
            PoolConfig::default(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire().await })
            })
            .collect();

        let mut granted = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(lease) => granted.push(lease),
                Err(SmsError::NoCapacity) => {}
                Err(e) => panic!("unexpected error from acquire: {e}"),
            }
        }

        assert_eq!(
            granted.len(),
            1,
            "exactly one of 8 concurrent acquires on a single session should succeed"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acquire_is_reusable_once_the_lease_is_dropped() {
        let session = Arc::new(ModemSession::new_ready_for_test(24));
        let pool = ModemPool::new_for_test(vec![session], PoolConfig::default());

        let first = pool.acquire().await.expect("first acquire succeeds");
        assert!(matches!(pool.acquire().await, Err(SmsError::NoCapacity)));

        drop(first);
        assert!(pool.acquire().await.is_ok());
    }
}
