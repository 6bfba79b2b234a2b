//! Authenticated identity of the client. [`AuthSession`] is derived once from the token returned
//! by the authentication call and stays immutable for the lifetime of the client.
use std::collections::HashMap;

use jsonwebtoken::{DecodingKey, Validation};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, SdkMetadata};

/// The end user or device that flags are evaluated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Unique identifier of the target.
    pub identifier: String,
    /// Human-readable name.
    pub name: String,
    /// Anonymous targets are not persisted by the server.
    #[serde(default)]
    pub anonymous: bool,
    /// Custom attributes used by server-side targeting rules.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Target {
    /// Create a target whose name equals its identifier.
    pub fn new(identifier: impl Into<String>) -> Target {
        let identifier = identifier.into();
        Target {
            name: identifier.clone(),
            identifier,
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Target {
        self.name = name.into();
        self
    }

    /// Add a single attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Target {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Claims carried by the auth token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    environment: String,
    #[serde(rename = "clusterIdentifier")]
    cluster_identifier: String,
    #[serde(rename = "environmentIdentifier")]
    environment_identifier: Option<String>,
    #[serde(rename = "accountID", default)]
    account_id: String,
    #[serde(default)]
    organization: String,
    #[serde(default)]
    project: String,
    #[serde(rename = "projectIdentifier", default)]
    project_identifier: String,
}

/// Authenticated identity plus the header set attached to every outbound call.
#[derive(Clone)]
pub struct AuthSession {
    /// Account the environment belongs to. Empty if the claim is absent.
    pub account_id: String,
    /// Environment id used in API paths.
    pub environment: String,
    /// Environment identifier used as the cache routing key. Defaults to `environment`.
    pub environment_identifier: String,
    /// Cluster the environment is served from.
    pub cluster_identifier: String,
    /// Organization identifier. Empty if the claim is absent.
    pub organization: String,
    /// Project id. Empty if the claim is absent.
    pub project: String,
    /// Project identifier. Empty if the claim is absent.
    pub project_identifier: String,
    bearer_token: String,
    pub(crate) api_key: String,
    headers: HeaderMap,
}

impl AuthSession {
    /// Decode `token` and build the session.
    ///
    /// The signature is not verified: the token is only used to learn routing claims and is
    /// always sent back to the server, which validates it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidToken`] if the token is malformed or a required claim is missing.
    pub fn from_token(api_key: &str, token: &str, sdk: &SdkMetadata) -> Result<AuthSession> {
        let claims = decode_claims(token)?;

        let environment_identifier = claims
            .environment_identifier
            .unwrap_or_else(|| claims.environment.clone());

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, AUTHORIZATION, &format!("Bearer {token}"))?;
        insert_header(
            &mut headers,
            HeaderName::from_static("harness-environmentid"),
            &environment_identifier,
        )?;
        insert_header(
            &mut headers,
            HeaderName::from_static("harness-accountid"),
            &claims.account_id,
        )?;
        insert_header(&mut headers, USER_AGENT, &sdk.user_agent())?;
        insert_header(
            &mut headers,
            HeaderName::from_static("harness-sdk-info"),
            &sdk.sdk_info_header(),
        )?;

        Ok(AuthSession {
            account_id: claims.account_id,
            environment: claims.environment,
            environment_identifier,
            cluster_identifier: claims.cluster_identifier,
            organization: claims.organization,
            project: claims.project,
            project_identifier: claims.project_identifier,
            bearer_token: token.to_owned(),
            api_key: api_key.to_owned(),
            headers,
        })
    }

    /// Standard headers for every call issued on behalf of this session.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The raw token returned by the authentication call.
    pub fn bearer_token(&self) -> &str {
        &self.bearer_token
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("account_id", &self.account_id)
            .field("environment", &self.environment)
            .field("environment_identifier", &self.environment_identifier)
            .field("cluster_identifier", &self.cluster_identifier)
            .field("organization", &self.organization)
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

fn decode_claims(token: &str) -> Result<TokenClaims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|err| Error::InvalidToken(err.to_string()))
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::InvalidToken(format!("claim for {name} is not a valid header")))?;
    headers.insert(name, value);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    use super::AuthSession;
    use crate::{Error, SdkMetadata};

    /// Build a token carrying `claims`, signed with a key the client never sees.
    pub(crate) fn make_token(claims: serde_json::Value) -> String {
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"server-secret"),
        )
        .unwrap()
    }

    #[test]
    fn decodes_all_claims() {
        let token = make_token(json!({
            "environment": "env-uuid",
            "environmentIdentifier": "prod",
            "clusterIdentifier": "2",
            "accountID": "acc",
            "organization": "org",
            "project": "proj-uuid",
            "projectIdentifier": "proj",
        }));

        let session = AuthSession::from_token("api-key", &token, &SdkMetadata::current()).unwrap();

        assert_eq!(session.environment, "env-uuid");
        assert_eq!(session.environment_identifier, "prod");
        assert_eq!(session.cluster_identifier, "2");
        assert_eq!(session.account_id, "acc");
        assert_eq!(session.organization, "org");
        assert_eq!(session.project_identifier, "proj");
        assert_eq!(session.api_key, "api-key");
        assert_eq!(session.bearer_token(), token);
    }

    #[test]
    fn optional_claims_default() {
        let token = make_token(json!({
            "environment": "env-uuid",
            "clusterIdentifier": "1",
        }));

        let session = AuthSession::from_token("api-key", &token, &SdkMetadata::current()).unwrap();

        assert_eq!(session.environment_identifier, "env-uuid");
        assert_eq!(session.account_id, "");
        assert_eq!(session.organization, "");
        assert_eq!(session.project, "");
    }

    #[test]
    fn builds_standard_headers() {
        let token = make_token(json!({
            "environment": "env-uuid",
            "environmentIdentifier": "prod",
            "clusterIdentifier": "1",
            "accountID": "acc",
        }));
        let sdk = SdkMetadata {
            name: "Rust",
            version: "0.1.0",
            language: "Rust",
        };

        let session = AuthSession::from_token("api-key", &token, &sdk).unwrap();
        let headers = session.headers();

        assert_eq!(headers["authorization"], format!("Bearer {token}").as_str());
        assert_eq!(headers["harness-environmentid"], "prod");
        assert_eq!(headers["harness-accountid"], "acc");
        assert_eq!(headers["user-agent"], "Rust/0.1.0");
        assert_eq!(headers["harness-sdk-info"], "Rust 0.1.0 Client");
    }

    #[test]
    fn rejects_malformed_tokens() {
        let sdk = SdkMetadata::current();

        assert!(matches!(
            AuthSession::from_token("k", "not-a-token", &sdk),
            Err(Error::InvalidToken(_))
        ));
        assert!(matches!(
            AuthSession::from_token("k", "a.!!!.c", &sdk),
            Err(Error::InvalidToken(_))
        ));

        assert!(matches!(
            AuthSession::from_token("k", "a.b", &sdk),
            Err(Error::InvalidToken(_))
        ));

        let missing_cluster = make_token(json!({ "environment": "env" }));
        assert!(matches!(
            AuthSession::from_token("k", &missing_cluster, &sdk),
            Err(Error::InvalidToken(_))
        ));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let token = make_token(json!({ "environment": "env", "clusterIdentifier": "1" }));
        let session = AuthSession::from_token("secret-key", &token, &SdkMetadata::current()).unwrap();

        let printed = format!("{session:?}");
        assert!(!printed.contains("secret-key"));
        assert!(!printed.contains(&token));
    }
}
