//! Coalescing of concurrent identical requests.
//!
//! The first caller for a fingerprint becomes the **leader**: it registers a
//! pending entry and its work runs in a spawned task. Callers arriving while
//! that entry exists become **joiners** and await the leader's published
//! outcome instead of running the work again.
//!
//! Leader election is an insert-if-absent on the pending table performed
//! under one lock, so two callers can never both lead the same key.
//!
//! A joiner that observes a leader failure retries as a new leader at most
//! `max_join_retries` times, sleeping `retry_backoff` plus jitter first.
//! Cancellation is never retried and reaches joiners as
//! [`DedupError::Cancelled`], distinct from [`DedupError::Failed`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DedupError;
use crate::fingerprint::{self, Fingerprint, GenerationParams};
use crate::logging::log_dedup_event;

/// Share of `max_pending` above which the janitor warns about saturation.
const SATURATION_WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub max_pending: usize,
    /// How long a leader may hold a key before the janitor cancels it.
    #[serde(with = "humantime_serde")]
    pub pending_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,
    pub max_join_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_pending: 100,
            pending_timeout: Duration::from_secs(300),
            janitor_interval: Duration::from_secs(60),
            max_join_retries: 2,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Successful result of [`RequestDeduplicator::execute_or_join`].
#[derive(Debug, Clone, PartialEq)]
pub struct Coalesced<T> {
    pub value: T,
    /// True when the value came from another caller's execution.
    pub joined: bool,
}

impl<T> Coalesced<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSummary {
    /// Truncated fingerprint.
    pub key: String,
    pub prompt_preview: String,
    pub model: String,
    pub age_secs: f64,
    pub joiners: usize,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    pub pending: usize,
    pub max_pending: usize,
    pub at_capacity: bool,
    pub total_requests: u64,
    pub distinct_requests: u64,
    pub joiners_served: u64,
    pub duplicate_prevention_rate: f64,
    pub leader_retries: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub overflows: u64,
    pub reclaimed: u64,
    pub expired: u64,
}

/// Result of one janitor pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Completed entries that had not been removed yet.
    pub reclaimed: usize,
    /// Entries past `pending_timeout`, cancelled.
    pub expired: usize,
    pub remaining: usize,
    pub near_capacity: bool,
}

#[derive(Debug, Clone)]
enum Outcome<T, E> {
    Succeeded(T),
    Failed(E),
    Cancelled,
}

type OutcomeSlot<T, E> = Option<Outcome<T, E>>;

struct PendingEntry<T, E> {
    id: u64,
    started_at: Instant,
    joiners: usize,
    prompt_preview: String,
    model: String,
    outcome: watch::Receiver<OutcomeSlot<T, E>>,
    cancel: CancellationToken,
}

impl<T, E> PendingEntry<T, E> {
    fn is_completed(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

type PendingTable<T, E> = Arc<Mutex<HashMap<String, PendingEntry<T, E>>>>;

enum Claim<T, E> {
    Leader {
        id: u64,
        sender: watch::Sender<OutcomeSlot<T, E>>,
        cancel: CancellationToken,
    },
    Joiner {
        id: u64,
        outcome: watch::Receiver<OutcomeSlot<T, E>>,
    },
}

/// Removes the leader's entry when its task ends, including by panic.
struct EntryGuard<T, E> {
    table: PendingTable<T, E>,
    key: String,
    id: u64,
}

impl<T, E> Drop for EntryGuard<T, E> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(&self.key).map(|entry| entry.id) == Some(self.id) {
            table.remove(&self.key);
        }
    }
}

#[derive(Debug, Default)]
struct DedupCounters {
    total_requests: AtomicU64,
    distinct_requests: AtomicU64,
    joiners_served: AtomicU64,
    leader_retries: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    overflows: AtomicU64,
    reclaimed: AtomicU64,
    expired: AtomicU64,
}

pub struct RequestDeduplicator<T, E> {
    config: DedupConfig,
    pending: PendingTable<T, E>,
    counters: Arc<DedupCounters>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates the deduplicator and starts its janitor on the current Tokio
    /// runtime. Without a runtime the janitor is not started and stale
    /// entries are only reclaimed through [`sweep`](Self::sweep).
    pub fn new(config: DedupConfig) -> Self {
        let dedup = Self {
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(DedupCounters::default()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            janitor: Mutex::new(None),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(run_janitor(
                    Arc::clone(&dedup.pending),
                    Arc::clone(&dedup.counters),
                    dedup.config.clone(),
                    dedup.shutdown.clone(),
                ));
                *dedup.janitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(_) => warn!("No Tokio runtime available, pending-request janitor not started"),
        }

        dedup
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Runs `work` for this request, or joins an identical request already in flight.
    pub async fn execute_or_join<F, Fut>(
        &self,
        prompt: &str,
        model: &str,
        params: &GenerationParams,
        work: F,
    ) -> Result<Coalesced<T>, DedupError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(DedupError::ShutDown);
        }
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let key = Fingerprint::new(prompt, model, params).dedup_key;
        let mut retries = 0;

        loop {
            match self.claim(&key, prompt, model)? {
                Claim::Leader { id, sender, cancel } => {
                    let value = self.lead(&key, id, sender, cancel, work()).await?;
                    return Ok(Coalesced { value, joined: false });
                }
                Claim::Joiner { id, mut outcome } => {
                    let observed = outcome
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|slot| slot.clone());

                    let failure = match observed {
                        Some(Outcome::Succeeded(value)) => return Ok(Coalesced { value, joined: true }),
                        Some(Outcome::Cancelled) => return Err(DedupError::Cancelled),
                        Some(Outcome::Failed(e)) => DedupError::Failed(e),
                        None => DedupError::LeaderLost,
                    };

                    if retries >= self.config.max_join_retries || self.shutdown.is_cancelled() {
                        return Err(failure);
                    }
                    retries += 1;
                    self.counters.leader_retries.fetch_add(1, Ordering::Relaxed);
                    self.discard(&key, id);

                    let delay = self.retry_delay();
                    debug!(
                        key = %fingerprint::short_key(&key),
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Leader failed, retrying as leader"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Atomically joins the existing entry for `key` or registers a new one.
    fn claim(&self, key: &str, prompt: &str, model: &str) -> Result<Claim<T, E>, DedupError<E>> {
        let mut table = self.pending.lock().map_err(|_| DedupError::Poisoned)?;

        if let Some(entry) = table.get_mut(key) {
            entry.joiners += 1;
            self.counters.joiners_served.fetch_add(1, Ordering::Relaxed);
            log_dedup_event("join", key, entry.joiners);
            return Ok(Claim::Joiner {
                id: entry.id,
                outcome: entry.outcome.clone(),
            });
        }

        if table.len() >= self.config.max_pending {
            self.counters.overflows.fetch_add(1, Ordering::Relaxed);
            warn!(
                pending = table.len(),
                max_pending = self.config.max_pending,
                "Rejecting request, pending table full"
            );
            return Err(DedupError::Overflow {
                pending: table.len(),
                max_pending: self.config.max_pending,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, outcome) = watch::channel(None);
        let cancel = CancellationToken::new();
        table.insert(
            key.to_string(),
            PendingEntry {
                id,
                started_at: Instant::now(),
                joiners: 0,
                prompt_preview: fingerprint::preview(prompt),
                model: model.to_string(),
                outcome,
                cancel: cancel.clone(),
            },
        );

        self.counters.distinct_requests.fetch_add(1, Ordering::Relaxed);
        log_dedup_event("lead", key, 0);
        Ok(Claim::Leader { id, sender, cancel })
    }

    async fn lead<Fut>(
        &self,
        key: &str,
        id: u64,
        sender: watch::Sender<OutcomeSlot<T, E>>,
        cancel: CancellationToken,
        work: Fut,
    ) -> Result<T, DedupError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let guard = EntryGuard {
            table: Arc::clone(&self.pending),
            key: key.to_string(),
            id,
        };

        // Joiners keep waiting even if this caller goes away.
        let task = tokio::spawn(async move {
            let _guard = guard;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                result = work => match result {
                    Ok(value) => Outcome::Succeeded(value),
                    Err(e) => Outcome::Failed(e),
                },
            };
            sender.send_replace(Some(outcome.clone()));
            outcome
        });

        match task.await {
            Ok(Outcome::Succeeded(value)) => Ok(value),
            Ok(Outcome::Failed(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(DedupError::Failed(e))
            }
            Ok(Outcome::Cancelled) => Err(DedupError::Cancelled),
            Err(e) => {
                error!(key = %fingerprint::short_key(key), error = %e, "Leader task ended without an outcome");
                Err(DedupError::LeaderLost)
            }
        }
    }

    /// Drops a finished entry so a retrying joiner can take over the key.
    fn discard(&self, key: &str, id: u64) {
        let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if table.get(key).map(|entry| entry.id) == Some(id) {
            table.remove(key);
        }
    }

    fn retry_delay(&self) -> Duration {
        let base = self.config.retry_backoff;
        if base.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }

    /// Cancels the in-flight execution for this request, if any.
    pub fn cancel_request(&self, prompt: &str, model: &str, params: &GenerationParams) -> Result<bool, DedupError<E>> {
        let key = Fingerprint::new(prompt, model, params).dedup_key;
        let entry = self.pending.lock().map_err(|_| DedupError::Poisoned)?.remove(&key);

        let Some(entry) = entry else {
            return Ok(false);
        };
        if entry.is_completed() {
            return Ok(false);
        }

        entry.cancel.cancel();
        self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
        info!(
            key = %fingerprint::short_key(&key),
            joiners = entry.joiners,
            "Cancelled pending request"
        );
        Ok(true)
    }

    /// Cancels and clears every pending entry, returning how many were still running.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry<T, E>> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let mut cancelled = 0;
        for entry in drained.into_iter().filter(|entry| !entry.is_completed()) {
            entry.cancel.cancel();
            cancelled += 1;
        }

        self.counters.cancellations.fetch_add(cancelled as u64, Ordering::Relaxed);
        if cancelled > 0 {
            info!(cancelled = cancelled, "Cancelled all pending requests");
        }
        cancelled
    }

    pub fn get_pending(&self) -> Result<Vec<PendingSummary>, DedupError<E>> {
        let table = self.pending.lock().map_err(|_| DedupError::Poisoned)?;
        let mut summaries: Vec<PendingSummary> = table
            .iter()
            .map(|(key, entry)| PendingSummary {
                key: fingerprint::short_key(key),
                prompt_preview: entry.prompt_preview.clone(),
                model: entry.model.clone(),
                age_secs: entry.started_at.elapsed().as_secs_f64(),
                joiners: entry.joiners,
                completed: entry.is_completed(),
            })
            .collect();

        summaries.sort_by(|a, b| b.age_secs.total_cmp(&a.age_secs));
        Ok(summaries)
    }

    pub fn stats(&self) -> DedupStats {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner).len();
        let total_requests = self.counters.total_requests.load(Ordering::Relaxed);
        let joiners_served = self.counters.joiners_served.load(Ordering::Relaxed);

        DedupStats {
            pending,
            max_pending: self.config.max_pending,
            at_capacity: pending >= self.config.max_pending,
            total_requests,
            distinct_requests: self.counters.distinct_requests.load(Ordering::Relaxed),
            joiners_served,
            duplicate_prevention_rate: if total_requests == 0 {
                0.0
            } else {
                joiners_served as f64 / total_requests as f64
            },
            leader_retries: self.counters.leader_retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            overflows: self.counters.overflows.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Runs one janitor pass immediately.
    pub fn sweep(&self) -> Result<SweepReport, DedupError<E>> {
        sweep_table(&self.pending, &self.counters, &self.config)
    }

    /// Stops the janitor and cancels all pending work. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let janitor = self.janitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = janitor {
            if let Err(e) = handle.await {
                warn!(error = %e, "Janitor task ended abnormally");
            }
        }

        let cancelled = self.cancel_all();
        info!(cancelled = cancelled, "Request deduplicator shut down");
    }
}

impl<T, E> Drop for RequestDeduplicator<T, E> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn sweep_table<T, E>(
    table: &Mutex<HashMap<String, PendingEntry<T, E>>>,
    counters: &DedupCounters,
    config: &DedupConfig,
) -> Result<SweepReport, DedupError<E>> {
    let mut table = table.lock().map_err(|_| DedupError::Poisoned)?;
    let mut report = SweepReport::default();

    table.retain(|key, entry| {
        if entry.is_completed() {
            report.reclaimed += 1;
            debug!(key = %fingerprint::short_key(key), "Reclaimed completed pending entry");
            return false;
        }

        let age = entry.started_at.elapsed();
        if age > config.pending_timeout {
            entry.cancel.cancel();
            report.expired += 1;
            warn!(
                key = %fingerprint::short_key(key),
                model = %entry.model,
                age_secs = age.as_secs_f64(),
                joiners = entry.joiners,
                "Cancelled stuck pending request"
            );
            return false;
        }

        true
    });

    report.remaining = table.len();
    report.near_capacity = report.remaining as f64 > config.max_pending as f64 * SATURATION_WARNING_RATIO;
    if report.near_capacity {
        warn!(
            pending = report.remaining,
            max_pending = config.max_pending,
            "Pending request table is nearly full"
        );
    }

    counters.reclaimed.fetch_add(report.reclaimed as u64, Ordering::Relaxed);
    counters.expired.fetch_add(report.expired as u64, Ordering::Relaxed);
    counters.cancellations.fetch_add(report.expired as u64, Ordering::Relaxed);
    Ok(report)
}

async fn run_janitor<T, E>(
    table: PendingTable<T, E>,
    counters: Arc<DedupCounters>,
    config: DedupConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.janitor_interval, config.janitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match sweep_table(&table, &counters, &config) {
                Ok(report) if report.reclaimed + report.expired > 0 => info!(
                    reclaimed = report.reclaimed,
                    expired = report.expired,
                    remaining = report.remaining,
                    "Janitor sweep finished"
                ),
                Ok(_) => {}
                Err(_) => error!("Janitor sweep failed, pending table is poisoned"),
            },
        }
    }

    debug!("Janitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Dedup = RequestDeduplicator<String, String>;
    type TestWork = std::pin::Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

    fn dedup(config: DedupConfig) -> Arc<Dedup> {
        Arc::new(RequestDeduplicator::new(config))
    }

    fn params() -> GenerationParams {
        GenerationParams::default()
    }

    /// Work that counts invocations, sleeps, then returns `value`.
    fn counted_work(
        calls: Arc<AtomicUsize>,
        delay: Duration,
        value: &'static str,
    ) -> impl Fn() -> TestWork + Clone {
        move || {
            let calls = Arc::clone(&calls);
            let work: TestWork = Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(value.to_string())
            });
            work
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_requests_execute_once() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let dedup = Arc::clone(&dedup);
                let work = counted_work(Arc::clone(&calls), Duration::from_millis(200), "X");
                tokio::spawn(async move { dedup.execute_or_join("same prompt", "gpt-4", &params(), work).await })
            })
            .collect();

        let mut joined = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.value, "X");
            if result.joined {
                joined += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 4);

        let stats = dedup.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.distinct_requests, 1);
        assert_eq!(stats.joiners_served, 4);
        assert_eq!(stats.duplicate_prevention_rate, 0.8);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_params_do_not_coalesce() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let a = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&calls), Duration::from_millis(100), "a");
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &GenerationParams::new(10, 0.0), work).await })
        };
        let b = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&calls), Duration::from_millis(100), "b");
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &GenerationParams::new(20, 0.0), work).await })
        };

        assert_eq!(a.await.unwrap().unwrap().value, "a");
        assert_eq!(b.await.unwrap().unwrap().value, "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_bound() {
        let dedup = dedup(DedupConfig {
            max_pending: 2,
            ..DedupConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        for prompt in ["first", "second"] {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&calls), Duration::from_secs(3600), "slow");
            tokio::spawn(async move { dedup.execute_or_join(prompt, "m", &params(), work).await });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dedup.stats().pending, 2);
        assert!(dedup.stats().at_capacity);

        let rejected = dedup
            .execute_or_join("third", "m", &params(), counted_work(Arc::clone(&calls), Duration::ZERO, "x"))
            .await;
        assert!(matches!(
            rejected,
            Err(DedupError::Overflow { pending: 2, max_pending: 2 })
        ));

        // Joining an existing key is still allowed at capacity.
        let joiner = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&calls), Duration::ZERO, "x");
            tokio::spawn(async move { dedup.execute_or_join("first", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dedup.get_pending().unwrap().iter().map(|p| p.joiners).sum::<usize>(), 1);

        assert_eq!(dedup.cancel_all(), 2);
        assert!(joiner.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.stats().overflows, 1);
        assert_eq!(dedup.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_retries_after_leader_failure() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let work = {
            let calls = Arc::clone(&calls);
            move || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if attempt == 0 {
                        Err("boom".to_string())
                    } else {
                        Ok("recovered".to_string())
                    }
                }
            }
        };

        let leader = {
            let dedup = Arc::clone(&dedup);
            let work = work.clone();
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let joiner = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };

        assert!(matches!(leader.await.unwrap(), Err(DedupError::Failed(ref e)) if e == "boom"));
        let recovered = joiner.await.unwrap().unwrap();
        assert_eq!(recovered.value, "recovered");
        assert!(!recovered.joined);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = dedup.stats();
        assert_eq!(stats.leader_retries, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_retries_are_bounded() {
        let dedup = dedup(DedupConfig {
            max_join_retries: 1,
            ..DedupConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let work = {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err::<String, String>("down".to_string())
                }
            }
        };

        let leader = {
            let dedup = Arc::clone(&dedup);
            let work = work.clone();
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let joiner = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };

        assert!(matches!(leader.await.unwrap(), Err(DedupError::Failed(_))));
        assert!(matches!(joiner.await.unwrap(), Err(DedupError::Failed(ref e)) if e == "down"));
        // Original attempt plus exactly one retry.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reaches_joiners() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&calls), Duration::from_secs(3600), "never");
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let joiner = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&calls), Duration::from_secs(3600), "never");
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(dedup.cancel_request("p", "m", &params()).unwrap());
        assert!(!dedup.cancel_request("p", "m", &params()).unwrap());

        assert!(leader.await.unwrap().unwrap_err().is_cancelled());
        assert!(joiner.await.unwrap().unwrap_err().is_cancelled());
        // Cancellation is not retried.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.stats().leader_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_pending_summaries() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let prompt = "Summarise the following very long document about connection pooling in detail";

        for _ in 0..3 {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::clone(&calls), Duration::from_secs(3600), "x");
            tokio::spawn(async move { dedup.execute_or_join(prompt, "gpt-4", &params(), work).await });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        let pending = dedup.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        let summary = &pending[0];
        assert_eq!(summary.model, "gpt-4");
        assert_eq!(summary.joiners, 2);
        assert!(!summary.completed);
        assert!(summary.age_secs >= 2.0);
        assert!(summary.prompt_preview.ends_with("..."));
        assert!(summary.key.ends_with("...") && summary.key.len() == 19);

        dedup.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_splits_completed_and_stuck_entries() {
        let dedup = dedup(DedupConfig {
            pending_timeout: Duration::from_secs(1),
            ..DedupConfig::default()
        });

        // A completed entry whose leader has not removed it yet.
        let (sender, outcome) = watch::channel(Some(Outcome::Succeeded("done".to_string())));
        dedup.pending.lock().unwrap().insert(
            "completed".to_string(),
            PendingEntry {
                id: 999,
                started_at: Instant::now(),
                joiners: 0,
                prompt_preview: "done".to_string(),
                model: "m".to_string(),
                outcome,
                cancel: CancellationToken::new(),
            },
        );

        let stuck = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::new(AtomicUsize::new(0)), Duration::from_secs(3600), "never");
            tokio::spawn(async move { dedup.execute_or_join("stuck", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = dedup.sweep().unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.expired, 0);
        assert_eq!(report.remaining, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = dedup.sweep().unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.expired, 1);
        assert_eq!(report.remaining, 0);

        assert!(stuck.await.unwrap().unwrap_err().is_cancelled());
        let stats = dedup.stats();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.expired, 1);
        drop(sender);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_flags_near_capacity() {
        let dedup = dedup(DedupConfig {
            max_pending: 4,
            ..DedupConfig::default()
        });
        for prompt in ["a", "b", "c", "d"] {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::new(AtomicUsize::new(0)), Duration::from_secs(3600), "x");
            tokio::spawn(async move { dedup.execute_or_join(prompt, "m", &params(), work).await });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(dedup.sweep().unwrap().near_capacity);
        dedup.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_cancels_stuck_entries() {
        let dedup = dedup(DedupConfig {
            pending_timeout: Duration::from_secs(2),
            janitor_interval: Duration::from_secs(1),
            ..DedupConfig::default()
        });

        let stuck = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::new(AtomicUsize::new(0)), Duration::from_secs(3600), "never");
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };

        let result = stuck.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(dedup.stats().expired, 1);
        assert_eq!(dedup.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let dedup = dedup(DedupConfig::default());
        let pending = {
            let dedup = Arc::clone(&dedup);
            let work = counted_work(Arc::new(AtomicUsize::new(0)), Duration::from_secs(3600), "never");
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        dedup.shutdown().await;
        dedup.shutdown().await;

        assert!(pending.await.unwrap().unwrap_err().is_cancelled());
        let after = dedup
            .execute_or_join("q", "m", &params(), counted_work(Arc::new(AtomicUsize::new(0)), Duration::ZERO, "x"))
            .await;
        assert!(matches!(after, Err(DedupError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_leader_reports_leader_lost() {
        let dedup = dedup(DedupConfig {
            max_join_retries: 0,
            ..DedupConfig::default()
        });

        let work = || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if true {
                panic!("upstream client bug");
            }
            Ok::<String, String>("unreachable".to_string())
        };

        let leader = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let joiner = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move { dedup.execute_or_join("p", "m", &params(), work).await })
        };

        assert!(matches!(leader.await.unwrap(), Err(DedupError::LeaderLost)));
        assert!(matches!(joiner.await.unwrap(), Err(DedupError::LeaderLost)));
        assert_eq!(dedup.stats().pending, 0);
    }
}
