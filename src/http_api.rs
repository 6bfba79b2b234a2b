//! An HTTP client that talks to the feature flag service.
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header::ACCEPT, Response, StatusCode, Url};

use crate::{
    api::{AuthenticationRequest, AuthenticationResponse, ByteStream, FlagsApi, Metrics},
    AuthSession, ClientConfig, Error, Evaluation, Result, Target,
};

/// A [`FlagsApi`] implementation on top of `reqwest`.
///
/// It's best to save and reuse the same instance, so it can reuse connections.
pub struct HttpApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    // The stream body is read for as long as the connection lives, so it cannot share the
    // whole-request timeout of `client`.
    stream_client: reqwest::Client,
    config_url: String,
    event_url: String,
}

impl HttpApi {
    /// Create a client for the URLs and timeouts in `config`.
    pub fn new(config: &ClientConfig) -> Result<HttpApi> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;

        Ok(HttpApi {
            client,
            stream_client,
            config_url: config.config_url.clone(),
            event_url: config.event_url.clone(),
        })
    }

    fn config_endpoint(&self, segments: &[&str], cluster: Option<&str>) -> Result<Url> {
        endpoint(&self.config_url, segments, cluster)
    }
}

#[async_trait]
impl FlagsApi for HttpApi {
    async fn authenticate(&self, api_key: &str, target: &Target) -> Result<String> {
        let url = self.config_endpoint(&["client", "auth"], None)?;

        log::debug!(target: "ff", "authenticating");
        let response = self
            .client
            .post(url)
            .json(&AuthenticationRequest { api_key, target })
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            log::warn!(target: "ff", "client is not authorized. Check your API key");
            return Err(Error::Unauthorized);
        }

        let response: AuthenticationResponse = check_status(response).await?.json().await?;
        Ok(response.auth_token)
    }

    async fn fetch_evaluations(
        &self,
        session: &AuthSession,
        target: &Target,
    ) -> Result<Vec<Evaluation>> {
        let url = self.config_endpoint(
            &[
                "client",
                "env",
                &session.environment,
                "target",
                &target.identifier,
                "evaluations",
            ],
            Some(&session.cluster_identifier),
        )?;

        let response = self
            .client
            .get(url)
            .headers(session.headers().clone())
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    async fn fetch_evaluation(
        &self,
        session: &AuthSession,
        flag: &str,
        target: &Target,
    ) -> Result<Evaluation> {
        let url = self.config_endpoint(
            &[
                "client",
                "env",
                &session.environment,
                "target",
                &target.identifier,
                "evaluations",
                flag,
            ],
            Some(&session.cluster_identifier),
        )?;

        let response = self
            .client
            .get(url)
            .headers(session.headers().clone())
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    async fn open_stream(&self, session: &AuthSession) -> Result<ByteStream> {
        let url = self.config_endpoint(&["stream"], Some(&session.cluster_identifier))?;

        let response = self
            .stream_client
            .get(url)
            .headers(session.headers().clone())
            .header("API-Key", &session.api_key)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let body = check_status(response)
            .await?
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from));

        Ok(body.boxed())
    }

    async fn post_metrics(&self, session: &AuthSession, metrics: &Metrics) -> Result<()> {
        let url = endpoint(
            &self.event_url,
            &["metrics", &session.environment],
            Some(&session.cluster_identifier),
        )?;

        let response = self
            .client
            .post(url)
            .headers(session.headers().clone())
            .json(metrics)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}

/// Join `segments` onto `base`, escaping each one, and attach the `cluster` query parameter.
fn endpoint(base: &str, segments: &[&str], cluster: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base).map_err(Error::InvalidBaseUrl)?;

    url.path_segments_mut()
        .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(segments);

    if let Some(cluster) = cluster {
        url.query_pairs_mut().append_pair("cluster", cluster);
    }

    Ok(url)
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.text().await {
        Ok(body) if !body.is_empty() => body,
        _ => status.canonical_reason().unwrap_or("").to_owned(),
    };
    log::warn!(target: "ff", status = status.as_u16(); "received non-success response: {message}");

    Err(Error::Http {
        status: status.as_u16(),
        message,
    })
}
