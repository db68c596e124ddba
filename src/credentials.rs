use base64::Engine;
use chrono::{DateTime, Utc};
use log::info;
use reqwest::Client;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::domain::HTTP_TIMEOUT;

#[derive(Debug, Clone, Error)]
pub(crate) enum CredentialError {
    #[error("invalid bearer token: {0}")]
    InvalidToken(String),
    #[error("the token has expired")]
    ExpiredToken,
    #[error("the application token has expired, rotate it with the metering provider")]
    ExpiredApplicationToken,
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),
}

/// A bearer token together with the expiry decoded from its claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BearerToken {
    pub(crate) token: String,
    pub(crate) expires_at: DateTime<Utc>,
}

impl BearerToken {
    /// Decode a raw JWT, extracting its `exp` claim. Tokens whose expiry is
    /// not strictly in the future are rejected.
    pub(crate) fn decode(raw: &str) -> Result<Self, CredentialError> {
        let expires_at = decode_expiry_claim(raw)?;

        if expires_at <= Utc::now() {
            return Err(CredentialError::ExpiredToken);
        }

        Ok(Self {
            token: raw.to_owned(),
            expires_at,
        })
    }

    pub(crate) fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Deserialize)]
struct TokenClaims {
    exp: Value,
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    result: String,
}

fn decode_expiry_claim(token: &str) -> Result<DateTime<Utc>, CredentialError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(CredentialError::InvalidToken(
            "not a three-segment JWT".to_string(),
        ));
    }

    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| CredentialError::InvalidToken(format!("payload is not valid base64: {}", e)))?;

    let claims = serde_json::from_slice::<TokenClaims>(&payload)
        .map_err(|e| CredentialError::InvalidToken(format!("claims could not be parsed: {}", e)))?;

    // the provider issues `exp` both as a number and as a numeric string
    let exp = match &claims.exp {
        Value::Number(number) => number.as_i64(),
        Value::String(string) => string.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| CredentialError::InvalidToken("exp claim is not a unix timestamp".to_string()))?;

    DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| CredentialError::InvalidToken("exp claim is out of range".to_string()))
}

/// Owns both bearer tokens of the metering provider: the long-lived
/// application token, set once at construction, and the short-lived request
/// token obtained by exchanging it. The request token is only reachable
/// through the methods here; refresh and read go through the same lock.
pub(crate) struct CredentialManager {
    client: Client,
    base_url: Url,
    application_token: BearerToken,
    request_token: Mutex<Option<BearerToken>>,
    save_to_disk: bool,
    cache_path: PathBuf,
}

impl CredentialManager {
    /// Validates the application token; a manager can only exist with a
    /// well-formed, unexpired application token.
    pub(crate) fn new(
        application_token: &str,
        base_url: Url,
        save_to_disk: bool,
        cache_path: PathBuf,
    ) -> Result<Self, CredentialError> {
        let application_token = BearerToken::decode(application_token)?;

        Ok(Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("failed to build http client"),
            base_url,
            application_token,
            request_token: Mutex::new(None),
            save_to_disk,
            cache_path,
        })
    }

    /// Make sure a valid request token is held, exchanging the application
    /// token for a new one when needed.
    ///
    /// The provider rate-limits token issuance, so an unexpired token is
    /// reused unless `force_refresh` is set, and a previously issued token is
    /// picked up from the disk mirror before asking for a fresh one.
    pub(crate) async fn ensure_request_token(
        &self,
        force_refresh: bool,
    ) -> Result<(), CredentialError> {
        if !self.application_token.is_valid(Utc::now()) {
            return Err(CredentialError::ExpiredApplicationToken);
        }

        let mut current = self.request_token.lock().await;

        if current.is_none() && self.save_to_disk {
            *current = self.read_cached_token().await;
        }

        if let Some(token) = current.as_ref() {
            if token.is_valid(Utc::now()) && !force_refresh {
                debug!("current request token is still valid");
                return Ok(());
            }
        }

        let raw = self.exchange_request_token().await?;
        let token = BearerToken::decode(&raw)?;

        if self.save_to_disk {
            self.write_cached_token(&token).await;
        }

        *current = Some(token);

        Ok(())
    }

    /// The current request token string, for use as bearer auth.
    pub(crate) async fn request_token(&self) -> Result<String, CredentialError> {
        self.request_token
            .lock()
            .await
            .as_ref()
            .filter(|token| token.is_valid(Utc::now()))
            .map(|token| token.token.clone())
            .ok_or(CredentialError::ExpiredToken)
    }

    async fn exchange_request_token(&self) -> Result<String, CredentialError> {
        info!("exchanging application token for a new request token");

        let url = self
            .base_url
            .join("api/token")
            .map_err(|e| CredentialError::TokenExchangeFailed(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .header("accept", "application/json")
            .bearer_auth(&self.application_token.token)
            .send()
            .await
            .map_err(|e| CredentialError::TokenExchangeFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CredentialError::TokenExchangeFailed(format!(
                "server responded with status {}",
                response.status()
            )));
        }

        response
            .json::<TokenExchangeResponse>()
            .await
            .map(|body| body.result)
            .map_err(|e| CredentialError::TokenExchangeFailed(e.to_string()))
    }

    async fn read_cached_token(&self) -> Option<BearerToken> {
        let bytes = match tokio::fs::read(&self.cache_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("unable to read the cached request token: {}", e);
                return None;
            }
        };

        match serde_json::from_slice::<BearerToken>(&bytes) {
            Ok(token) => {
                info!(
                    "read request token from {}",
                    self.cache_path.display()
                );
                Some(token)
            }
            Err(e) => {
                warn!("unable to use the cached request token: {}", e);
                None
            }
        }
    }

    /// Best-effort: a failed write leaves the in-memory token usable.
    async fn write_cached_token(&self, token: &BearerToken) {
        match serde_json::to_vec(token) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.cache_path, json).await {
                    warn!(
                        "unable to save request token to {}: {}",
                        self.cache_path.display(),
                        e
                    );
                }
            }
            Err(e) => warn!("unable to serialize request token for storage: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use httpmock::prelude::*;
    use serde_json::json;

    /// A minimal unsigned JWT carrying only an `exp` claim.
    fn sample_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        format!("{}.{}.", header, payload)
    }

    fn sample_jwt_string_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":"{}"}}"#, exp));
        format!("{}.{}.", header, payload)
    }

    fn manager(application_token: &str, base_url: &str, save_to_disk: bool) -> CredentialManager {
        let dir = tempfile::tempdir().unwrap();
        CredentialManager::new(
            application_token,
            Url::parse(base_url).unwrap(),
            save_to_disk,
            dir.into_path().join(".requestToken"),
        )
        .unwrap()
    }

    #[test]
    fn decode_accepts_a_token_expiring_in_the_future() {
        let exp = Utc::now().timestamp() + 3600;
        let token = BearerToken::decode(&sample_jwt(exp)).unwrap();

        assert_eq!(token.expires_at.timestamp(), exp);
        assert!(token.is_valid(Utc::now()));
    }

    #[test]
    fn decode_accepts_a_string_exp_claim() {
        let exp = Utc::now().timestamp() + 3600;
        let token = BearerToken::decode(&sample_jwt_string_exp(exp)).unwrap();

        assert_eq!(token.expires_at.timestamp(), exp);
    }

    #[test]
    fn decode_rejects_an_expired_token() {
        let result = BearerToken::decode(&sample_jwt(Utc::now().timestamp() - 30));

        assert!(matches!(result, Err(CredentialError::ExpiredToken)));
    }

    #[test]
    fn decode_rejects_malformed_tokens() {
        assert!(matches!(
            BearerToken::decode("not-a-jwt"),
            Err(CredentialError::InvalidToken(_))
        ));
        assert!(matches!(
            BearerToken::decode("a.%%%.c"),
            Err(CredentialError::InvalidToken(_))
        ));

        // well-formed JWT without an exp claim
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"someone"}"#);
        assert!(matches!(
            BearerToken::decode(&format!("{}.{}.", header, payload)),
            Err(CredentialError::InvalidToken(_))
        ));
    }

    #[test]
    fn an_expired_application_token_is_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let result = CredentialManager::new(
            &sample_jwt(Utc::now().timestamp() - 30),
            Url::parse("http://localhost").unwrap(),
            false,
            dir.into_path().join(".requestToken"),
        );

        assert!(matches!(result, Err(CredentialError::ExpiredToken)));
    }

    #[tokio::test]
    async fn an_unexpired_request_token_short_circuits_the_exchange() {
        let exp = Utc::now().timestamp() + 3600;
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/token");
                then.status(200).json_body(json!({ "result": sample_jwt(exp) }));
            })
            .await;

        let manager = manager(&sample_jwt(exp), &server.base_url(), false);

        manager.ensure_request_token(false).await.unwrap();
        manager.ensure_request_token(false).await.unwrap();
        manager.ensure_request_token(false).await.unwrap();

        // only the first call may hit the token endpoint
        mock.assert_hits_async(1).await;
        assert!(manager.request_token().await.is_ok());
    }

    #[tokio::test]
    async fn force_refresh_always_exchanges() {
        let exp = Utc::now().timestamp() + 3600;
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/token");
                then.status(200).json_body(json!({ "result": sample_jwt(exp) }));
            })
            .await;

        let manager = manager(&sample_jwt(exp), &server.base_url(), false);

        manager.ensure_request_token(true).await.unwrap();
        manager.ensure_request_token(true).await.unwrap();

        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn a_failed_exchange_surfaces_the_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/token");
                then.status(503);
            })
            .await;

        let manager = manager(
            &sample_jwt(Utc::now().timestamp() + 3600),
            &server.base_url(),
            false,
        );

        let result = manager.ensure_request_token(false).await;

        assert!(matches!(result, Err(CredentialError::TokenExchangeFailed(_))));
        assert!(matches!(
            manager.request_token().await,
            Err(CredentialError::ExpiredToken)
        ));
    }

    #[tokio::test]
    async fn an_expired_application_token_blocks_the_exchange() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/token");
                then.status(200);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let manager = CredentialManager {
            client: Client::new(),
            base_url: Url::parse(&server.base_url()).unwrap(),
            application_token: BearerToken {
                token: "worn-out".to_string(),
                expires_at: Utc::now() - chrono::Duration::hours(1),
            },
            request_token: Mutex::new(None),
            save_to_disk: false,
            cache_path: dir.into_path().join(".requestToken"),
        };

        let result = manager.ensure_request_token(false).await;

        assert!(matches!(
            result,
            Err(CredentialError::ExpiredApplicationToken)
        ));
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn a_cached_token_on_disk_avoids_the_exchange() {
        let exp = Utc::now().timestamp() + 3600;
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/token");
                then.status(200).json_body(json!({ "result": sample_jwt(exp) }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".requestToken");
        let cached = BearerToken::decode(&sample_jwt(exp)).unwrap();
        std::fs::write(&cache_path, serde_json::to_vec(&cached).unwrap()).unwrap();

        let manager = CredentialManager::new(
            &sample_jwt(exp),
            Url::parse(&server.base_url()).unwrap(),
            true,
            cache_path,
        )
        .unwrap();

        manager.ensure_request_token(false).await.unwrap();

        mock.assert_hits_async(0).await;
        assert_eq!(manager.request_token().await.unwrap(), cached.token);
    }

    #[tokio::test]
    async fn a_corrupt_cache_file_falls_through_to_the_exchange() {
        let exp = Utc::now().timestamp() + 3600;
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/token");
                then.status(200).json_body(json!({ "result": sample_jwt(exp) }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".requestToken");
        std::fs::write(&cache_path, b"{not json").unwrap();

        let manager = CredentialManager::new(
            &sample_jwt(exp),
            Url::parse(&server.base_url()).unwrap(),
            true,
            cache_path.clone(),
        )
        .unwrap();

        manager.ensure_request_token(false).await.unwrap();

        mock.assert_hits_async(1).await;

        // the fresh token replaced the corrupt mirror
        let mirrored: BearerToken =
            serde_json::from_slice(&std::fs::read(&cache_path).unwrap()).unwrap();
        assert_eq!(mirrored.token, manager.request_token().await.unwrap());
    }
}
