use std::{sync::Arc, time::Duration};

/// Reports whether the network is reachable. Metrics are not posted while it returns `false`.
///
/// Implemented for any `Fn() -> bool`, so a closure can be passed directly:
///
/// ```
/// # use ff_client::ClientConfig;
/// let config = ClientConfig::from_api_key("api-key").network_checker(|| true);
/// ```
pub trait NetworkChecker {
    /// Returns `true` if network calls are expected to succeed.
    fn is_network_available(&self) -> bool;
}

pub(crate) struct AlwaysOnline;
impl NetworkChecker for AlwaysOnline {
    fn is_network_available(&self) -> bool {
        true
    }
}

impl<T: Fn() -> bool> NetworkChecker for T {
    fn is_network_available(&self) -> bool {
        self()
    }
}

/// Configuration for [`Client`](crate::Client).
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use ff_client::ClientConfig;
/// let config = ClientConfig::from_api_key("api-key")
///     .poll_interval(Duration::from_secs(120))
///     .stream_enabled(false)
///     .debug(true);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) config_url: String,
    pub(crate) event_url: String,
    pub(crate) poll_interval: Duration,
    pub(crate) metrics_interval: Duration,
    pub(crate) stream_enabled: bool,
    pub(crate) analytics_enabled: bool,
    pub(crate) metrics_capacity: usize,
    pub(crate) debug: bool,
    pub(crate) poll_removes_missing_flags: bool,
    pub(crate) request_timeout: Duration,
    pub(crate) stream_read_timeout: Duration,
    pub(crate) network_checker: Arc<dyn NetworkChecker + Send + Sync>,
}

impl ClientConfig {
    /// Default base URL for flag configuration and evaluation calls.
    pub const DEFAULT_CONFIG_URL: &'static str = "https://config.ff.harness.io/api/1.0";
    /// Default base URL for metrics submission.
    pub const DEFAULT_EVENT_URL: &'static str = "https://events.ff.harness.io/api/1.0";
    /// Lower bound for both poll and metrics intervals.
    pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
    /// Lower bound for [`ClientConfig::metrics_capacity`].
    pub const MIN_METRICS_CAPACITY: usize = 2048;
    /// Upper bound for [`ClientConfig::metrics_capacity`].
    pub const MAX_METRICS_CAPACITY: usize = 10_000;
    /// Default timeout for a single HTTP request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default inactivity bound on the push stream.
    pub const DEFAULT_STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a default configuration using the specified API key.
    ///
    /// ```
    /// # use ff_client::ClientConfig;
    /// ClientConfig::from_api_key("api-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            config_url: ClientConfig::DEFAULT_CONFIG_URL.to_owned(),
            event_url: ClientConfig::DEFAULT_EVENT_URL.to_owned(),
            poll_interval: ClientConfig::MIN_INTERVAL,
            metrics_interval: ClientConfig::MIN_INTERVAL,
            stream_enabled: true,
            analytics_enabled: true,
            metrics_capacity: ClientConfig::MIN_METRICS_CAPACITY,
            debug: false,
            poll_removes_missing_flags: false,
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            stream_read_timeout: ClientConfig::DEFAULT_STREAM_READ_TIMEOUT,
            network_checker: Arc::new(AlwaysOnline),
        }
    }

    /// Override base URL for configuration and evaluation calls.
    pub fn config_url(mut self, config_url: impl Into<String>) -> Self {
        self.config_url = config_url.into();
        self
    }

    /// Override base URL for metrics calls.
    pub fn event_url(mut self, event_url: impl Into<String>) -> Self {
        self.event_url = event_url.into();
        self
    }

    /// Interval between full refreshes. Values below [`ClientConfig::MIN_INTERVAL`] are raised
    /// to it.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(ClientConfig::MIN_INTERVAL);
        self
    }

    /// Interval between metrics flushes. Values below [`ClientConfig::MIN_INTERVAL`] are raised
    /// to it.
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval.max(ClientConfig::MIN_INTERVAL);
        self
    }

    /// Enable or disable the push-update stream. Polling continues either way.
    pub fn stream_enabled(mut self, enabled: bool) -> Self {
        self.stream_enabled = enabled;
        self
    }

    /// Enable or disable usage metrics collection.
    pub fn analytics_enabled(mut self, enabled: bool) -> Self {
        self.analytics_enabled = enabled;
        self
    }

    /// Maximum number of distinct (target, flag) counters kept between flushes. Clamped to
    /// `[MIN_METRICS_CAPACITY, MAX_METRICS_CAPACITY]`.
    pub fn metrics_capacity(mut self, capacity: usize) -> Self {
        self.metrics_capacity = capacity.clamp(
            ClientConfig::MIN_METRICS_CAPACITY,
            ClientConfig::MAX_METRICS_CAPACITY,
        );
        self
    }

    /// Log routine pipeline activity at `info` instead of `debug`.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// When enabled, a successful poll also removes flags that are missing from the server
    /// response. Disabled by default: polls only add and overwrite.
    pub fn poll_removes_missing_flags(mut self, enabled: bool) -> Self {
        self.poll_removes_missing_flags = enabled;
        self
    }

    /// Timeout applied to every HTTP request except the stream body.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Maximum silence on the push stream before it is considered failed.
    pub fn stream_read_timeout(mut self, timeout: Duration) -> Self {
        self.stream_read_timeout = timeout;
        self
    }

    /// Set a callback used to check network availability before posting metrics.
    pub fn network_checker(
        mut self,
        network_checker: impl NetworkChecker + Send + Sync + 'static,
    ) -> Self {
        self.network_checker = Arc::new(network_checker);
        self
    }

    /// Level for routine pipeline messages. Raised to `Info` in debug mode.
    pub(crate) fn verbose_level(&self) -> log::Level {
        if self.debug {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("config_url", &self.config_url)
            .field("event_url", &self.event_url)
            .field("poll_interval", &self.poll_interval)
            .field("metrics_interval", &self.metrics_interval)
            .field("stream_enabled", &self.stream_enabled)
            .field("analytics_enabled", &self.analytics_enabled)
            .field("metrics_capacity", &self.metrics_capacity)
            .field("debug", &self.debug)
            .field("poll_removes_missing_flags", &self.poll_removes_missing_flags)
            .finish_non_exhaustive()
    }
}
