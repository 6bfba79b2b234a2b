//! Usage analytics.
//!
//! Every served variation is counted in a [`FrequencyMap`] keyed by `(target, flag)`. The counters
//! are drained on a timer and posted as a single [`Metrics`] report.
use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant},
};

use crate::{
    api::{KeyValue, Metrics, MetricsData},
    config::NetworkChecker,
    sdk_codes, AuthSession, FlagsApi, Result, SdkMetadata, Target,
};

const METRICS_TYPE: &str = "FFMETRICS";
const SDK_TYPE: &str = "client";

/// Counter bucket identity.
///
/// Equality and hashing only consider the target and the flag, so a flag whose variation changes
/// between reads still has a single counter. The reported variation is the one seen first since
/// the last drain.
#[derive(Debug, Clone)]
pub struct AnalyticsKey {
    /// Identifier of the evaluated target.
    pub target_identifier: String,
    /// Identifier of the evaluated flag.
    pub flag_identifier: String,
    /// Served variation. Not part of the key identity.
    pub variation_identifier: String,
}

impl PartialEq for AnalyticsKey {
    fn eq(&self, other: &Self) -> bool {
        self.target_identifier == other.target_identifier
            && self.flag_identifier == other.flag_identifier
    }
}

impl Eq for AnalyticsKey {}

impl Hash for AnalyticsKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target_identifier.hash(state);
        self.flag_identifier.hash(state);
    }
}

/// Counters taken out of a [`FrequencyMap`] in one step.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Occurrences per key since the previous drain.
    pub counts: HashMap<AnalyticsKey, u64>,
    /// Occurrences rejected because the map was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Frequencies {
    counts: HashMap<AnalyticsKey, u64>,
    dropped: u64,
}

/// Bounded occurrence counter.
#[derive(Debug)]
pub struct FrequencyMap {
    capacity: usize,
    inner: Mutex<Frequencies>,
}

impl FrequencyMap {
    /// Create a map holding at most `capacity` distinct keys.
    pub fn new(capacity: usize) -> FrequencyMap {
        FrequencyMap {
            capacity,
            inner: Mutex::new(Frequencies::default()),
        }
    }

    /// Count one occurrence of `key`. Returns `false` if the key is new and the map is full, in
    /// which case the occurrence is counted as dropped.
    pub fn increment(&self, key: AnalyticsKey) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = inner.counts.get_mut(&key) {
            *count += 1;
            return true;
        }
        if inner.counts.len() >= self.capacity {
            inner.dropped += 1;
            return false;
        }
        inner.counts.insert(key, 1);
        true
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counts
            .len()
    }

    /// Returns `true` if no key is counted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all counters and the dropped count, leaving the map empty.
    pub fn drain(&self) -> Snapshot {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Frequencies { counts, dropped } = std::mem::take(&mut *inner);
        Snapshot { counts, dropped }
    }
}

/// Collects evaluation counts and turns them into metrics reports.
#[derive(Debug)]
pub struct MetricsAggregator {
    frequencies: FrequencyMap,
    sdk: SdkMetadata,
}

impl MetricsAggregator {
    /// Create an aggregator counting at most `capacity` distinct keys.
    pub fn new(capacity: usize, sdk: SdkMetadata) -> MetricsAggregator {
        MetricsAggregator {
            frequencies: FrequencyMap::new(capacity),
            sdk,
        }
    }

    /// Count one served variation.
    pub fn register_evaluation(&self, target: &Target, flag: &str, variation: &str) {
        let accepted = self.frequencies.increment(AnalyticsKey {
            target_identifier: target.identifier.clone(),
            flag_identifier: flag.to_owned(),
            variation_identifier: variation.to_owned(),
        });
        if !accepted {
            log::trace!(target: "ff", flag; "metrics buffer full, dropping occurrence");
        }
    }

    /// The underlying counters.
    pub fn frequencies(&self) -> &FrequencyMap {
        &self.frequencies
    }

    /// Assemble the report for `counts`.
    pub fn build_metrics(&self, counts: &HashMap<AnalyticsKey, u64>) -> Metrics {
        let timestamp = Utc::now().timestamp_millis();
        let metrics_data = counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(key, count)| MetricsData {
                timestamp,
                count: *count,
                metrics_type: METRICS_TYPE.to_owned(),
                attributes: vec![
                    KeyValue::new("featureIdentifier", &key.flag_identifier),
                    KeyValue::new("featureName", &key.flag_identifier),
                    KeyValue::new("variationIdentifier", &key.variation_identifier),
                    KeyValue::new("target", &key.target_identifier),
                    KeyValue::new("SDK_TYPE", SDK_TYPE),
                    KeyValue::new("SDK_LANGUAGE", self.sdk.language),
                    KeyValue::new("SDK_VERSION", self.sdk.version),
                ],
            })
            .collect();

        Metrics {
            target_data: Vec::new(),
            metrics_data,
        }
    }

    /// Drain the counters and post them. Returns the number of reported counters.
    ///
    /// Nothing is sent when no evaluation was registered since the previous drain.
    pub async fn drain_and_flush(&self, api: &dyn FlagsApi, session: &AuthSession) -> Result<usize> {
        let snapshot = self.frequencies.drain();
        if snapshot.dropped > 0 {
            sdk_codes::warn_metrics_buffer_full(snapshot.dropped);
        }

        let metrics = self.build_metrics(&snapshot.counts);
        if metrics.metrics_data.is_empty() {
            return Ok(0);
        }

        let count = metrics.metrics_data.len();
        match api.post_metrics(session, &metrics).await {
            Ok(()) => {
                log::debug!(target: "ff", count; "posted metrics");
                Ok(count)
            }
            Err(err) => {
                sdk_codes::warn_posting_metrics_failed(&err.to_string());
                Err(err)
            }
        }
    }
}

/// Flush `aggregator` every `interval` until the returned task is aborted.
///
/// Ticks while the network checker reports no connectivity leave the counters in place.
pub(crate) fn spawn_timer(
    aggregator: Arc<MetricsAggregator>,
    api: Arc<dyn FlagsApi>,
    session: Arc<AuthSession>,
    network_checker: Arc<dyn NetworkChecker + Send + Sync>,
    interval: Duration,
    level: log::Level,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sdk_codes::info_metrics_timer_started(interval.as_secs());
        let _exited = sdk_codes::LogOnDrop(sdk_codes::info_metrics_timer_exited);
        let mut ticker = interval_at(Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            if !network_checker.is_network_available() {
                log::debug!(target: "ff", "network unavailable, skipping metrics");
                continue;
            }
            log::log!(target: "ff", level, "posting metrics");
            // Failures are logged by the aggregator; counters of a failed post are not retried.
            let _ = aggregator.drain_and_flush(api.as_ref(), &session).await;
        }
    })
}
