//! In-memory storage for evaluations of the current target.
//!
//! [`EvaluationStore`] holds two views:
//! - the *primary* map, written by polling and by stream events, read synchronously by the
//!   variation functions;
//! - the *on-demand* map, written by [`EvaluationStore::get_or_fetch`], where every entry records
//!   the outcome of a single-flag fetch (success or failure) and when it happened.
//!
//! Both maps are keyed by `(environment_identifier, flag)`. Every mutation is a single
//! insert/replace/remove under a lock that is never held across an `.await`.
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use chrono::{DateTime, Utc};

use crate::{Evaluation, Result};

/// Maximum age of an on-demand entry before it must be fetched again.
pub const CACHE_TTL_SECONDS: i64 = 59;

type EnvironmentMap<T> = HashMap<String, HashMap<String, T>>;

/// Why a single-flag fetch failed. Stored in negative cache entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    /// HTTP status, or 0 if the request did not produce one.
    pub status_code: u16,
    /// Response body or error description.
    pub message: String,
}

/// Outcome of an on-demand fetch.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The fetched evaluation or the memoized failure.
    pub outcome: std::result::Result<Arc<Evaluation>, FetchFailure>,
    /// When the outcome was recorded.
    pub last_updated: DateTime<Utc>,
}

impl CacheEntry {
    /// Returns `true` if the fetch succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The fetched evaluation, present iff the fetch succeeded.
    pub fn evaluation(&self) -> Option<&Evaluation> {
        self.outcome.as_ref().ok().map(Arc::as_ref)
    }

    /// 200 for successful entries, the recorded status otherwise.
    pub fn status_code(&self) -> u16 {
        match &self.outcome {
            Ok(_) => 200,
            Err(failure) => failure.status_code,
        }
    }

    /// `"ok"` for successful entries, the failure message otherwise.
    pub fn status_message(&self) -> &str {
        match &self.outcome {
            Ok(_) => "ok",
            Err(failure) => &failure.message,
        }
    }

    /// Whole seconds elapsed since the entry was recorded.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_updated).num_seconds()
    }

    /// Fresh entries are served without a network call, whether they hold a value or a failure.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age_seconds(now) < CACHE_TTL_SECONDS
    }
}

/// Returned by [`EvaluationStore::get_or_fetch`] when no value can be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "evaluation returned status {}:{} {age_seconds} seconds ago",
    .failure.status_code,
    .failure.message
)]
pub struct NotFound {
    /// The (possibly memoized) failure.
    pub failure: FetchFailure,
    /// Age of the failure; 0 when it was just fetched.
    pub age_seconds: i64,
}

/// Thread-safe (`Sync`) evaluation cache.
#[derive(Debug, Default)]
pub struct EvaluationStore {
    evaluations: RwLock<EnvironmentMap<Arc<Evaluation>>>,
    on_demand: RwLock<EnvironmentMap<CacheEntry>>,
    /// Set by [`EvaluationStore::close`]. Writes that complete afterwards are discarded.
    closed: AtomicBool,
}

impl EvaluationStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        EvaluationStore::default()
    }

    /// Insert or replace the evaluation for `flag`. Last writer wins.
    pub fn set_evaluation(&self, environment: &str, flag: &str, evaluation: Evaluation) {
        // Constructing new value before requesting the lock to minimize lock span.
        let evaluation = Arc::new(evaluation);

        let mut evaluations = self.evaluations.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return;
        }
        evaluations
            .entry(environment.to_owned())
            .or_default()
            .insert(flag.to_owned(), evaluation);

        log::trace!(target: "ff",
                    environment,
                    flag,
                    size = evaluations.get(environment).map_or(0, HashMap::len);
                    "stored evaluation");
    }

    /// Remove the evaluation for `flag`. Returns `true` if something was removed.
    pub fn remove_evaluation(&self, environment: &str, flag: &str) -> bool {
        let mut evaluations = self.evaluations.write().unwrap_or_else(PoisonError::into_inner);
        let removed = evaluations
            .get_mut(environment)
            .and_then(|flags| flags.remove(flag))
            .is_some();
        drop(evaluations);

        // A removed flag must not be resurrected by a stale on-demand entry.
        let mut on_demand = self.on_demand.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = on_demand.get_mut(environment) {
            entries.remove(flag);
        }

        removed
    }

    /// Replace the whole flag set of `environment`. Returns the number of flags that were
    /// dropped because they are absent from `evaluations`.
    pub fn replace_all(&self, environment: &str, evaluations: Vec<Evaluation>) -> usize {
        let new_flags: HashMap<String, Arc<Evaluation>> = evaluations
            .into_iter()
            .map(|it| (it.flag_identifier.clone(), Arc::new(it)))
            .collect();

        let mut all = self.evaluations.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return 0;
        }
        let removed = all
            .get(environment)
            .map_or(0, |old| old.keys().filter(|k| !new_flags.contains_key(*k)).count());
        all.insert(environment.to_owned(), new_flags);
        removed
    }

    /// Get the current evaluation of `flag` from the primary map.
    pub fn get_evaluation(&self, environment: &str, flag: &str) -> Option<Arc<Evaluation>> {
        let evaluations = self.evaluations.read().unwrap_or_else(PoisonError::into_inner);
        evaluations.get(environment)?.get(flag).cloned()
    }

    /// Number of flags held in the primary map for `environment`.
    pub fn len(&self, environment: &str) -> usize {
        let evaluations = self.evaluations.read().unwrap_or_else(PoisonError::into_inner);
        evaluations.get(environment).map_or(0, HashMap::len)
    }

    /// Returns `true` if `environment` holds no flags.
    pub fn is_empty(&self, environment: &str) -> bool {
        self.len(environment) == 0
    }

    /// Get the on-demand entry for `flag`, fresh or not.
    pub fn cache_entry(&self, environment: &str, flag: &str) -> Option<CacheEntry> {
        let on_demand = self.on_demand.read().unwrap_or_else(PoisonError::into_inner);
        on_demand.get(environment)?.get(flag).cloned()
    }

    /// Serve `flag` from the on-demand map, calling `fetch` only if the entry is absent or older
    /// than [`CACHE_TTL_SECONDS`].
    ///
    /// The outcome of `fetch` is recorded either way, so a failing backend is asked at most once
    /// per TTL window for the same flag.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        environment: &str,
        flag: &str,
        fetch: F,
    ) -> std::result::Result<Arc<Evaluation>, NotFound>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Evaluation>>,
    {
        self.lookup(environment, flag, Utc::now(), fetch, Utc::now)
            .await
    }

    /// Same as [`EvaluationStore::get_or_fetch`] with a fixed clock.
    pub(crate) async fn get_or_fetch_at<F, Fut>(
        &self,
        environment: &str,
        flag: &str,
        now: DateTime<Utc>,
        fetch: F,
    ) -> std::result::Result<Arc<Evaluation>, NotFound>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Evaluation>>,
    {
        self.lookup(environment, flag, now, fetch, || now).await
    }

    /// `now` decides freshness of the existing entry; `stamp` is read once `fetch` completes.
    async fn lookup<F, Fut>(
        &self,
        environment: &str,
        flag: &str,
        mut now: DateTime<Utc>,
        fetch: F,
        stamp: impl FnOnce() -> DateTime<Utc>,
    ) -> std::result::Result<Arc<Evaluation>, NotFound>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Evaluation>>,
    {
        let entry = match self.cache_entry(environment, flag) {
            Some(entry) if entry.is_fresh(now) => entry,
            _ => {
                log::debug!(target: "ff",
                            environment,
                            flag;
                            "key not in cache or expired, querying server");

                let outcome = fetch()
                    .await
                    .map(Arc::new)
                    .map_err(|err| FetchFailure {
                        status_code: err.status_code(),
                        message: err.to_string(),
                    });
                now = stamp();
                let entry = CacheEntry {
                    outcome,
                    last_updated: now,
                };
                self.insert_entry(environment, flag, entry.clone());
                entry
            }
        };

        let age_seconds = entry.age_seconds(now);
        entry.outcome.map_err(|failure| NotFound {
            failure,
            age_seconds,
        })
    }

    fn insert_entry(&self, environment: &str, flag: &str, entry: CacheEntry) {
        let mut on_demand = self.on_demand.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return;
        }
        on_demand
            .entry(environment.to_owned())
            .or_default()
            .insert(flag.to_owned(), entry);
    }

    /// Discard everything and ignore all further writes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.evaluations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.on_demand
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns `true` once [`EvaluationStore::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
