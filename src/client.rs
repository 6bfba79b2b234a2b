use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, OnceLock, PoisonError,
};

use tokio::task::JoinHandle;

use crate::{
    evaluation_store::EvaluationStore, metrics, metrics::MetricsAggregator, pipeline::Pipeline,
    poller::Poller, sdk_codes, AuthSession, ClientConfig, Error, Evaluation, FlagsApi, HttpApi,
    Result, SdkMetadata, Target, VariationValue,
};

/// A feature flag client for a single target.
///
/// Create it with [`Client::new`], then call [`Client::initialize`] from within a tokio runtime.
/// Until initialization succeeds, every variation function serves its default value.
///
/// # Examples
/// ```no_run
/// # async fn run() -> ff_client::Result<()> {
/// use ff_client::{Client, ClientConfig, Target};
///
/// let client = Client::new(ClientConfig::from_api_key("api-key"), Target::new("user-1"))?;
/// client.initialize().await?;
///
/// if client.bool_variation("dark-mode", false) {
///     // ...
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    target: Arc<Target>,
    sdk: SdkMetadata,
    api: Arc<dyn FlagsApi>,
    store: Arc<EvaluationStore>,
    metrics: Arc<MetricsAggregator>,
    session: OnceLock<Arc<AuthSession>>,
    /// Background tasks. Locked by `dispose()` and by `initialize()` while spawning.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Client {
    /// Create a new `Client` talking to the configured Harness endpoints.
    pub fn new(config: ClientConfig, target: Target) -> Result<Client> {
        let api = Arc::new(HttpApi::new(&config)?);
        Ok(Client::with_api(config, target, api))
    }

    /// Create a new `Client` using a custom [`FlagsApi`] implementation.
    pub fn with_api(config: ClientConfig, target: Target, api: Arc<dyn FlagsApi>) -> Client {
        let sdk = SdkMetadata::current();
        Client {
            metrics: Arc::new(MetricsAggregator::new(config.metrics_capacity, sdk)),
            config,
            target: Arc::new(target),
            sdk,
            api,
            store: Arc::new(EvaluationStore::new()),
            session: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Authenticate, fetch the initial evaluations and start background updates.
    ///
    /// Authentication failures are returned and leave the client unauthenticated. A failure of
    /// the initial poll is only logged: the background poll retries it.
    ///
    /// Calling this on an initialized client is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        if self.session.get().is_some() {
            return Ok(());
        }
        if self.config.api_key.is_empty() {
            sdk_codes::error_missing_sdk_key();
            return Err(Error::Unauthorized);
        }

        let token = match self.api.authenticate(&self.config.api_key, &self.target).await {
            Ok(token) => token,
            Err(err) => {
                log::warn!(target: "ff", "authentication failed: {err}");
                return Err(err);
            }
        };
        let session = Arc::new(AuthSession::from_token(
            &self.config.api_key,
            &token,
            &self.sdk,
        )?);
        sdk_codes::info_sdk_auth_ok(self.sdk.version);

        if self.session.set(Arc::clone(&session)).is_err() {
            // Lost a race with a concurrent `initialize()`.
            return Ok(());
        }

        let poller = Poller::new(
            Arc::clone(&self.api),
            Arc::clone(&self.store),
            self.config.poll_removes_missing_flags,
            self.config.verbose_level(),
        );
        let _ = poller.poll_once(&session, &self.target).await;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        tasks.push(
            Pipeline::new(
                &self.config,
                Arc::clone(&self.api),
                Arc::clone(&self.store),
                Arc::clone(&session),
                Arc::clone(&self.target),
            )
            .spawn(),
        );
        if self.config.analytics_enabled {
            tasks.push(metrics::spawn_timer(
                Arc::clone(&self.metrics),
                Arc::clone(&self.api),
                session,
                Arc::clone(&self.config.network_checker),
                self.config.metrics_interval,
                self.config.verbose_level(),
            ));
        }

        Ok(())
    }

    /// Returns `true` once [`Client::initialize`] succeeded, until the client is disposed.
    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    /// Authenticated session, if any.
    pub fn auth_session(&self) -> Option<&AuthSession> {
        self.session().map(Arc::as_ref)
    }

    /// The target this client evaluates flags for.
    pub fn target(&self) -> &Target {
        &self.target
    }

    fn session(&self) -> Option<&Arc<AuthSession>> {
        if self.is_disposed() {
            return None;
        }
        self.session.get()
    }

    /// Boolean value of `flag`, or `default` if it is unknown or not a boolean.
    pub fn bool_variation(&self, flag: &str, default: bool) -> bool {
        self.variation(flag, default)
    }

    /// String value of `flag`, or `default` if it is unknown.
    pub fn string_variation(&self, flag: &str, default: &str) -> String {
        self.variation(flag, default.to_owned())
    }

    /// Numeric value of `flag`, or `default` if it is unknown or not a number.
    pub fn number_variation(&self, flag: &str, default: f64) -> f64 {
        self.variation(flag, default)
    }

    /// JSON value of `flag`, or `default` if it is unknown or not valid JSON.
    pub fn json_variation(&self, flag: &str, default: serde_json::Value) -> serde_json::Value {
        self.variation(flag, default)
    }

    /// Like [`Client::bool_variation`], but fetches `flag` from the server when the on-demand
    /// cache has no fresh entry for it.
    pub async fn bool_variation_lazy(&self, flag: &str, default: bool) -> bool {
        self.variation_lazy(flag, default).await
    }

    /// Like [`Client::string_variation`] with an on-demand fetch.
    pub async fn string_variation_lazy(&self, flag: &str, default: &str) -> String {
        self.variation_lazy(flag, default.to_owned()).await
    }

    /// Like [`Client::number_variation`] with an on-demand fetch.
    pub async fn number_variation_lazy(&self, flag: &str, default: f64) -> f64 {
        self.variation_lazy(flag, default).await
    }

    /// Like [`Client::json_variation`] with an on-demand fetch.
    pub async fn json_variation_lazy(
        &self,
        flag: &str,
        default: serde_json::Value,
    ) -> serde_json::Value {
        self.variation_lazy(flag, default).await
    }

    fn variation<T: VariationValue>(&self, flag: &str, default: T) -> T {
        let result = self.evaluate(flag);
        self.or_default(flag, result, default)
    }

    async fn variation_lazy<T: VariationValue>(&self, flag: &str, default: T) -> T {
        let result = self.evaluate_lazy(flag).await;
        self.or_default(flag, result, default)
    }

    /// The served value, or the reason the default has to be served instead.
    fn evaluate<T: VariationValue>(&self, flag: &str) -> std::result::Result<T, String> {
        let session = self
            .session()
            .ok_or_else(|| Error::NotAuthenticated.to_string())?;
        let evaluation = self
            .store
            .get_evaluation(&session.environment_identifier, flag)
            .filter(|evaluation| !evaluation.value.is_empty())
            .ok_or_else(|| format!("{flag} not in cache"))?;
        self.serve(&evaluation)
    }

    async fn evaluate_lazy<T: VariationValue>(
        &self,
        flag: &str,
    ) -> std::result::Result<T, String> {
        let session = self
            .session()
            .ok_or_else(|| Error::NotAuthenticated.to_string())?;
        let evaluation = self
            .store
            .get_or_fetch(&session.environment_identifier, flag, || {
                self.api.fetch_evaluation(session, flag, &self.target)
            })
            .await
            .map_err(|err| err.to_string())?;
        self.serve(&evaluation)
    }

    /// Coerce the evaluation and count it as served.
    fn serve<T: VariationValue>(&self, evaluation: &Evaluation) -> std::result::Result<T, String> {
        let value = T::from_raw(&evaluation.value)
            .ok_or_else(|| format!("failed to parse value as {}", T::KIND))?;

        if self.config.analytics_enabled {
            self.metrics.register_evaluation(
                &self.target,
                &evaluation.flag_identifier,
                &evaluation.variation_identifier,
            );
        }

        log::trace!(target: "ff",
                    flag = evaluation.flag_identifier.as_str(),
                    variation = evaluation.variation_identifier.as_str();
                    "evaluated a flag");
        Ok(value)
    }

    fn or_default<T: VariationValue>(
        &self,
        flag: &str,
        result: std::result::Result<T, String>,
        default: T,
    ) -> T {
        result.unwrap_or_else(|reason| {
            sdk_codes::warn_default_variation_served(flag, &default.describe(), &reason);
            default
        })
    }

    /// Post pending metrics now instead of waiting for the metrics timer. Returns the number of
    /// reported counters.
    pub async fn flush_metrics(&self) -> Result<usize> {
        let session = self.session().ok_or(Error::NotAuthenticated)?;
        if !self.config.analytics_enabled {
            return Ok(0);
        }
        self.metrics
            .drain_and_flush(self.api.as_ref(), session)
            .await
    }

    /// Stop background updates and discard all cached evaluations.
    ///
    /// Safe to call more than once. Also called on drop.
    pub fn dispose(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);

        self.store.close();
        log::info!(target: "ff", "client disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dispose();
    }
}
