//! The remote collaborator the pipeline talks to.
//!
//! [`FlagsApi`] is the seam between the evaluation pipeline and the transport. [`HttpApi`] is the
//! production implementation; tests substitute a scripted one.
//!
//! [`HttpApi`]: crate::HttpApi
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{AuthSession, Evaluation, Result, Target};

/// Raw body of the push stream, chunked as it arrives from the network.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Operations the pipeline requires from the remote service.
#[async_trait]
pub trait FlagsApi: Send + Sync {
    /// Exchange the API key for a signed token scoped to `target`. Returns the raw token.
    async fn authenticate(&self, api_key: &str, target: &Target) -> Result<String>;

    /// Fetch evaluations of every flag for `target`.
    async fn fetch_evaluations(
        &self,
        session: &AuthSession,
        target: &Target,
    ) -> Result<Vec<Evaluation>>;

    /// Fetch the evaluation of a single flag for `target`.
    async fn fetch_evaluation(
        &self,
        session: &AuthSession,
        flag: &str,
        target: &Target,
    ) -> Result<Evaluation>;

    /// Open the long-lived push stream.
    async fn open_stream(&self, session: &AuthSession) -> Result<ByteStream>;

    /// Submit a batch of usage metrics.
    async fn post_metrics(&self, session: &AuthSession, metrics: &Metrics) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthenticationRequest<'a> {
    pub api_key: &'a str,
    pub target: &'a Target,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthenticationResponse {
    pub auth_token: String,
}

/// Metrics report body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Target registrations. This SDK reports a single known target and leaves it empty.
    pub target_data: Vec<TargetData>,
    /// One entry per (target, flag) counter.
    pub metrics_data: Vec<MetricsData>,
}

/// A target registration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetData {
    pub identifier: String,
    pub name: String,
    pub attributes: Vec<KeyValue>,
}

/// A single counter in a metrics report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Number of evaluations since the previous report.
    pub count: u64,
    /// Always `FFMETRICS`.
    pub metrics_type: String,
    /// Flag, variation, target and SDK identity attributes.
    pub attributes: Vec<KeyValue>,
}

impl MetricsData {
    /// Look up an attribute value by key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|it| it.key == key)
            .map(|it| it.value.as_str())
    }
}

/// A single key-value attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    /// Create an attribute.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted [`FlagsApi`] used by unit tests across the crate.
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use serde_json::json;

    use super::{ByteStream, FlagsApi, Metrics};
    use crate::{auth::tests::make_token, AuthSession, Error, Evaluation, Result, Target};

    pub(crate) fn test_token() -> String {
        make_token(json!({
            "environment": "env-uuid",
            "environmentIdentifier": "test",
            "clusterIdentifier": "1",
            "accountID": "acc",
        }))
    }

    pub(crate) fn test_session() -> AuthSession {
        AuthSession::from_token("api-key", &test_token(), &crate::SdkMetadata::current())
            .expect("test token should decode")
    }

    #[derive(Default)]
    pub(crate) struct MockApi {
        pub auth_error: Mutex<Option<Error>>,
        pub all_evaluations: Mutex<Vec<Evaluation>>,
        pub fetch_all_error: Mutex<Option<Error>>,
        /// Flag -> scripted single-evaluation response. Missing flags answer 404.
        pub single: Mutex<HashMap<String, Result<Evaluation>>>,
        /// Bodies handed out by successive `open_stream` calls.
        pub streams: Mutex<VecDeque<Vec<Result<Vec<u8>>>>>,
        pub posted: Mutex<Vec<Metrics>>,
        pub post_error: Mutex<Option<Error>>,

        pub auth_calls: AtomicUsize,
        pub fetch_all_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
        pub stream_calls: AtomicUsize,
    }

    impl MockApi {
        pub(crate) fn with_evaluations(evaluations: Vec<Evaluation>) -> MockApi {
            let api = MockApi::default();
            *api.all_evaluations.lock().unwrap() = evaluations;
            api
        }

        pub(crate) fn set_single(&self, flag: &str, response: Result<Evaluation>) {
            self.single.lock().unwrap().insert(flag.to_owned(), response);
        }

        pub(crate) fn push_stream(&self, chunks: Vec<Result<Vec<u8>>>) {
            self.streams.lock().unwrap().push_back(chunks);
        }

        pub(crate) fn fetch_calls(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn fetch_all_calls(&self) -> usize {
            self.fetch_all_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FlagsApi for MockApi {
        async fn authenticate(&self, _api_key: &str, _target: &Target) -> Result<String> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            match self.auth_error.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(test_token()),
            }
        }

        async fn fetch_evaluations(
            &self,
            _session: &AuthSession,
            _target: &Target,
        ) -> Result<Vec<Evaluation>> {
            self.fetch_all_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fetch_all_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(self.all_evaluations.lock().unwrap().clone())
        }

        async fn fetch_evaluation(
            &self,
            _session: &AuthSession,
            flag: &str,
            _target: &Target,
        ) -> Result<Evaluation> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.single
                .lock()
                .unwrap()
                .get(flag)
                .cloned()
                .unwrap_or_else(|| {
                    Err(Error::Http {
                        status: 404,
                        message: "Not Found".to_owned(),
                    })
                })
        }

        async fn open_stream(&self, _session: &AuthSession) -> Result<ByteStream> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().unwrap().pop_front() {
                Some(chunks) => Ok(stream::iter(chunks).boxed()),
                // No scripted body: a connection that stays open and silent.
                None => Ok(stream::pending().boxed()),
            }
        }

        async fn post_metrics(&self, _session: &AuthSession, metrics: &Metrics) -> Result<()> {
            if let Some(err) = self.post_error.lock().unwrap().clone() {
                return Err(err);
            }
            self.posted.lock().unwrap().push(metrics.clone());
            Ok(())
        }
    }
}
