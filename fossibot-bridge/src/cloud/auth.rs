//! Three-stage authentication against the vendor cloud.
//!
//! Stage 1 obtains an anonymous access token, stage 2 logs the account in
//! and yields the long-lived login JWT, stage 3 trades both for the MQTT
//! credential. Every stage is cache-first: a restart with three valid
//! cached tokens performs zero HTTP calls.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use thiserror::Error;

use crate::persistence::{TokenCache, TokenStage};

use super::api::{ApiClient, RequestError};
use super::signing;

const METHOD_ANONYMOUS: &str = "serverless.auth.user.anonymousAuthorize";
const METHOD_INVOKE: &str = "serverless.function.runtime.invoke";

const URL_LOGIN: &str = "user/pub/login";
const URL_MQTT_TOKEN: &str = "common/emqx.getAccessToken";

/// Expiry assumed for the anonymous token when the response carries none.
fn anonymous_default_ttl() -> Duration {
    Duration::minutes(10)
}

/// Conservative fallback when a token has no expiry information at all.
fn fallback_ttl() -> Duration {
    Duration::hours(1)
}

/// Ceiling for a whole handshake pass; each stage also has its own 10 s
/// HTTP timeout.
const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: &'static str,
        source: RequestError,
    },
    #[error("{stage} stage returned an empty token")]
    EmptyToken { stage: &'static str },
    #[error("{stage} stage response is missing the token field")]
    MissingToken { stage: &'static str },
    #[error("the handshake did not finish within {}s", HANDSHAKE_TIMEOUT.as_secs())]
    Timeout,
}

impl AuthError {
    /// Whether the failure poisons cached tokens (HTTP 401/403, a
    /// malformed success body, an empty token). Transport problems do
    /// not; a retry with the same cache entries is fine.
    pub fn poisons_cache(&self) -> bool {
        match self {
            AuthError::Stage { source, .. } => {
                matches!(source, RequestError::Shape(_) | RequestError::Status(_))
            }
            AuthError::EmptyToken { .. } | AuthError::MissingToken { .. } => true,
            AuthError::Timeout => false,
        }
    }
}

/// The three live tokens a connected session needs.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub anonymous: String,
    pub login: String,
    pub mqtt: String,
}

#[derive(Clone)]
pub struct AuthEngine {
    api: ApiClient,
    tokens: TokenCache,
    email: String,
    password: String,
}

impl AuthEngine {
    pub fn new(api: ApiClient, tokens: TokenCache, email: String, password: String) -> Self {
        AuthEngine {
            api,
            tokens,
            email,
            password,
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Produces a full token set, fetching only the stages whose cached
    /// entries are missing or expired. A cache-poisoning failure purges
    /// everything and retries the whole handshake once from stage 1.
    pub async fn acquire(&self) -> Result<TokenSet, AuthError> {
        match self.acquire_bounded().await {
            Ok(set) => Ok(set),
            Err(e) if e.poisons_cache() => {
                log::warn!("Handshake failed ({e}), purging cached tokens and restarting it");
                self.tokens.purge_all(&self.email);
                self.acquire_bounded().await
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire_bounded(&self) -> Result<TokenSet, AuthError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acquire_once())
            .await
            .map_err(|_| AuthError::Timeout)?
    }

    async fn acquire_once(&self) -> Result<TokenSet, AuthError> {
        let anonymous = match self.tokens.get(&self.email, TokenStage::Anonymous) {
            Some(entry) => entry.token,
            None => self.fetch_anonymous().await?,
        };
        let login = match self.tokens.get(&self.email, TokenStage::Login) {
            Some(entry) => entry.token,
            None => self.fetch_login(&anonymous).await?,
        };
        let mqtt = match self.tokens.get(&self.email, TokenStage::Mqtt) {
            Some(entry) => entry.token,
            None => self.fetch_mqtt(&anonymous, &login).await?,
        };
        Ok(TokenSet {
            anonymous,
            login,
            mqtt,
        })
    }

    /// Removes one cached stage so the next [`acquire`](Self::acquire)
    /// refetches it. The tiered reconnect controller walks the chain by
    /// purging progressively earlier stages.
    pub fn purge(&self, stage: TokenStage) {
        self.tokens.purge(&self.email, stage);
    }

    pub fn purge_all(&self) {
        self.tokens.purge_all(&self.email);
    }

    async fn fetch_anonymous(&self) -> Result<String, AuthError> {
        const STAGE: &str = "anonymous";
        log::debug!("Requesting anonymous token");
        let data = self
            .api
            .invoke(METHOD_ANONYMOUS, "{}", None)
            .await
            .map_err(|source| AuthError::Stage {
                stage: STAGE,
                source,
            })?;
        let token = extract_token(&data, "accessToken", STAGE)?;
        self.cache(TokenStage::Anonymous, &token, Some(anonymous_default_ttl()));
        Ok(token)
    }

    async fn fetch_login(&self, anonymous: &str) -> Result<String, AuthError> {
        const STAGE: &str = "login";
        log::debug!("Logging the account in");
        let params = invoke_params(
            URL_LOGIN,
            json!({
                "locale": "en",
                "email": self.email,
                "password": self.password,
            }),
            None,
        );
        let data = self
            .api
            .invoke(METHOD_INVOKE, &params, Some(anonymous))
            .await
            .map_err(|source| AuthError::Stage {
                stage: STAGE,
                source,
            })?;
        let token = extract_token(&data, "token", STAGE)?;
        self.cache(TokenStage::Login, &token, None);
        Ok(token)
    }

    async fn fetch_mqtt(&self, anonymous: &str, login: &str) -> Result<String, AuthError> {
        const STAGE: &str = "mqtt";
        log::debug!("Requesting MQTT credential");
        let params = invoke_params(URL_MQTT_TOKEN, json!({ "locale": "en" }), Some(login));
        let data = self
            .api
            .invoke(METHOD_INVOKE, &params, Some(anonymous))
            .await
            .map_err(|source| AuthError::Stage {
                stage: STAGE,
                source,
            })?;
        let token = extract_token(&data, "access_token", STAGE)?;
        self.cache(TokenStage::Mqtt, &token, None);
        Ok(token)
    }

    fn cache(&self, stage: TokenStage, token: &str, default_ttl: Option<Duration>) {
        let claimed = jwt_expiry(token)
            .or_else(|| default_ttl.map(|ttl| Utc::now() + ttl))
            .unwrap_or_else(|| Utc::now() + fallback_ttl());
        self.tokens.put(&self.email, stage, token.to_string(), claimed);
    }
}

fn invoke_params(url: &str, data: Value, uni_id_token: Option<&str>) -> String {
    let mut args = json!({
        "$url": url,
        "data": data,
        "clientInfo": signing::client_info(),
    });
    if let Some(token) = uni_id_token {
        args["uniIdToken"] = Value::String(token.to_string());
    }
    json!({
        "functionTarget": "router",
        "functionArgs": args,
    })
    .to_string()
}

fn extract_token(data: &Value, field: &str, stage: &'static str) -> Result<String, AuthError> {
    match data.get(field).and_then(Value::as_str) {
        Some("") => Err(AuthError::EmptyToken { stage }),
        Some(token) => Ok(token.to_string()),
        None => Err(AuthError::MissingToken { stage }),
    }
}

/// Reads the `exp` claim out of a JWT without verifying it. The tokens
/// arrive over TLS from the party that minted them; only the expiry
/// matters here.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jwt(claims: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"HS256\",\"typ\":\"JWT\"}");
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.c2ln")
    }

    #[test]
    fn reads_the_exp_claim() {
        let token = fake_jwt(json!({ "uid": "u1", "exp": 1_893_456_000 }));
        let expiry = jwt_expiry(&token).unwrap();
        assert_eq!(expiry, Utc.timestamp_opt(1_893_456_000, 0).unwrap());
    }

    #[test]
    fn token_without_exp_has_no_expiry() {
        let token = fake_jwt(json!({ "uid": "u1" }));
        assert_eq!(jwt_expiry(&token), None);
    }

    #[test]
    fn opaque_tokens_are_not_jwts() {
        assert_eq!(jwt_expiry("not-a-jwt"), None);
        assert_eq!(jwt_expiry("a.b"), None);
        assert_eq!(jwt_expiry("a.!!!.c"), None);
        assert_eq!(jwt_expiry("a.b.c.d"), None);
    }

    #[test]
    fn invoke_params_is_a_string_with_router_target() {
        let params = invoke_params(URL_LOGIN, json!({ "locale": "en" }), Some("uni"));
        let parsed: Value = serde_json::from_str(&params).unwrap();
        assert_eq!(parsed["functionTarget"], "router");
        assert_eq!(parsed["functionArgs"]["$url"], URL_LOGIN);
        assert_eq!(parsed["functionArgs"]["uniIdToken"], "uni");
        assert!(parsed["functionArgs"]["clientInfo"]["DEVICEID"].is_string());
    }

    #[test]
    fn empty_and_missing_tokens_are_distinct_errors() {
        let data = json!({ "accessToken": "" });
        assert!(matches!(
            extract_token(&data, "accessToken", "anonymous"),
            Err(AuthError::EmptyToken { .. })
        ));
        assert!(matches!(
            extract_token(&data, "token", "login"),
            Err(AuthError::MissingToken { .. })
        ));
    }
}
