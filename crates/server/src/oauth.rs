//! The OAuth/OIDC authorization-code-with-PKCE pipeline that mints the
//! JWTs used by both the REST surface and the WebSocket transport.
//!
//! This server is itself an OAuth authorization server to its own API
//! clients (always PKCE, never a client secret) while delegating actual
//! identity verification to an upstream IdP — or, when
//! `oauth.test_idp_enabled` is set, to an in-process test identity that
//! never leaves the server. The two PKCE challenges involved — the
//! client's, against this server, and (optionally) ours, against the
//! upstream IdP — are independent instances of the same
//! [`tmi_common::pkce`] primitive.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tmi_common::{AppError, OAuthConfig, OAuthProviderConfig, SigningKeySet, challenge_for, generate_state};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

/// The identity facts an IdP hands back once a user has authenticated.
#[derive(Debug, Clone)]
pub struct ProviderUserInfo {
    pub subject: String,
    pub email: String,
}

/// A source of truth for "who is this" — either a real upstream IdP or
/// the built-in test identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Build the URL this server redirects the user-agent to in order to
    /// authenticate with the upstream IdP.
    fn authorization_url(&self, state: &str, code_challenge: Option<&str>, redirect_uri: &str) -> String;

    /// Exchange an authorization code (and, if this provider supports
    /// PKCE on the upstream hop, our verifier) for the caller's identity.
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: &str,
    ) -> Result<ProviderUserInfo, AppError>;

    /// Whether this provider expects a PKCE challenge on the upstream
    /// hop (as opposed to relying solely on its client secret).
    fn uses_pkce(&self) -> bool {
        false
    }
}

/// Delegates to a real OAuth2/OIDC provider over HTTPS.
pub struct UpstreamIdentityProvider {
    config: OAuthProviderConfig,
    http: reqwest::Client,
}

impl UpstreamIdentityProvider {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for UpstreamIdentityProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn authorization_url(&self, state: &str, code_challenge: Option<&str>, redirect_uri: &str) -> String {
        let scopes = self.config.scopes.join(" ");
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.config.authorization_endpoint,
            urlencode(&self.config.client_id),
            urlencode(redirect_uri),
            urlencode(&scopes),
            urlencode(state),
        );
        if let Some(challenge) = code_challenge {
            url.push_str(&format!(
                "&code_challenge={}&code_challenge_method=S256",
                urlencode(challenge)
            ));
        }
        url
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
        redirect_uri: &str,
    ) -> Result<ProviderUserInfo, AppError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        let token_response: TokenEndpointResponse = self
            .http
            .post(&self.config.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::InvalidGrant(format!("token exchange failed: {e}")))?
            .error_for_status()
            .map_err(|e| AppError::InvalidGrant(format!("token endpoint rejected code: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::InvalidGrant(format!("malformed token response: {e}")))?;

        let userinfo: serde_json::Value = self
            .http
            .get(&self.config.userinfo_endpoint)
            .bearer_auth(&token_response.access_token)
            .send()
            .await
            .map_err(|e| AppError::InvalidGrant(format!("userinfo fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| AppError::InvalidGrant(format!("userinfo endpoint rejected token: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::InvalidGrant(format!("malformed userinfo response: {e}")))?;

        let subject = userinfo
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidGrant("userinfo missing sub".to_string()))?
            .to_string();
        let email = userinfo
            .get("email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidGrant("userinfo missing email".to_string()))?
            .to_string();

        Ok(ProviderUserInfo { subject, email })
    }

    fn uses_pkce(&self) -> bool {
        true
    }
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
}

/// An in-process identity that never contacts a real IdP. Gated behind
/// `oauth.test_idp_enabled`, which `TmiConfig::validate` refuses to allow
/// in a `production` environment.
pub struct TestIdentityProvider;

#[async_trait]
impl IdentityProvider for TestIdentityProvider {
    fn id(&self) -> &str {
        "test"
    }

    fn authorization_url(&self, state: &str, _code_challenge: Option<&str>, redirect_uri: &str) -> String {
        format!("{redirect_uri}?code=test-authorization-code&state={state}")
    }

    async fn exchange_code(
        &self,
        code: &str,
        _code_verifier: Option<&str>,
        _redirect_uri: &str,
    ) -> Result<ProviderUserInfo, AppError> {
        if code != "test-authorization-code" {
            return Err(AppError::InvalidGrant("unrecognized test code".to_string()));
        }
        Ok(ProviderUserInfo {
            subject: "test-subject".to_string(),
            email: "test@example.com".to_string(),
        })
    }
}

fn urlencode(value: &str) -> String {
    const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~";
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// A client's in-flight authorization request, keyed by the `state` we
/// send to the upstream IdP. Single-use: removed on the first callback
/// that presents it.
struct PendingAuthorization {
    idp_id: String,
    upstream_pkce_verifier: Option<String>,
    client_state: String,
    client_redirect_uri: String,
    client_code_challenge: String,
    created_at: Instant,
}

/// A one-time code this server hands the client after a successful
/// upstream exchange, redeemed at `/oauth2/token`.
struct IssuedAuthCode {
    user: ProviderUserInfo,
    provider_id: String,
    code_challenge: String,
    created_at: Instant,
}

/// A refresh token record. `family_id` links every token descended from
/// one login; presenting a token already marked `used` revokes the whole
/// family — reuse of a stolen refresh token is treated as compromise.
#[derive(Clone)]
struct RefreshTokenRecord {
    family_id: Uuid,
    user_id: Uuid,
    email: String,
    provider: String,
    admin: bool,
    used: bool,
    issued_at: Instant,
}

struct UserStore {
    by_identity: HashMap<(String, String), Uuid>,
    principals: HashMap<Uuid, tmi_common::Principal>,
}

impl UserStore {
    fn new() -> Self {
        Self {
            by_identity: HashMap::new(),
            principals: HashMap::new(),
        }
    }

    fn find_or_create(&mut self, provider: &str, info: &ProviderUserInfo) -> tmi_common::Principal {
        let key = (provider.to_string(), info.subject.clone());
        if let Some(user_id) = self.by_identity.get(&key) {
            return self.principals[user_id].clone();
        }
        let user_id = Uuid::new_v4();
        let admin = info.email.eq_ignore_ascii_case("admin@test.local");
        let principal = tmi_common::Principal {
            user_id,
            email: info.email.clone(),
            provider: provider.to_string(),
            admin,
        };
        self.by_identity.insert(key, user_id);
        self.principals.insert(user_id, principal.clone());
        principal
    }
}

/// All server-held OAuth state: registered identity providers, pending
/// authorization/callback bookkeeping, issued refresh tokens, and the
/// signing key set used to mint access tokens.
pub struct OAuthState {
    config: OAuthConfig,
    providers: HashMap<String, Box<dyn IdentityProvider>>,
    signing_keys: RwLock<SigningKeySet>,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
    issued_codes: Mutex<HashMap<String, IssuedAuthCode>>,
    refresh_tokens: Mutex<HashMap<String, RefreshTokenRecord>>,
    users: Mutex<UserStore>,
}

impl OAuthState {
    pub fn new(config: OAuthConfig, signing_keys: SigningKeySet) -> Self {
        let mut providers: HashMap<String, Box<dyn IdentityProvider>> = HashMap::new();
        for provider_config in &config.providers {
            providers.insert(
                provider_config.id.clone(),
                Box::new(UpstreamIdentityProvider::new(provider_config.clone())),
            );
        }
        if config.test_idp_enabled {
            providers.insert("test".to_string(), Box::new(TestIdentityProvider));
        }
        Self {
            config,
            providers,
            signing_keys: RwLock::new(signing_keys),
            pending: Mutex::new(HashMap::new()),
            issued_codes: Mutex::new(HashMap::new()),
            refresh_tokens: Mutex::new(HashMap::new()),
            users: Mutex::new(UserStore::new()),
        }
    }

    fn sweep_expired(&self) {
        let ttl = Duration::from_secs(self.config.auth_state_ttl_secs);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, p| p.created_at.elapsed() < ttl);
        self.issued_codes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, c| c.created_at.elapsed() < ttl);
    }
}

#[derive(Deserialize)]
pub struct AuthorizeQuery {
    idp: String,
    redirect_uri: String,
    state: String,
    code_challenge: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: String,
    state: String,
}

#[derive(Deserialize)]
pub struct TokenForm {
    grant_type: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    code_verifier: String,
    #[serde(default)]
    redirect_uri: String,
    #[serde(default)]
    refresh_token: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
    refresh_token: String,
}

#[derive(Deserialize)]
pub struct RevokeForm {
    token: String,
}

/// `GET /oauth2/authorize` — the client's own redirect_uri is where this
/// server's `/oauth2/callback` eventually sends the user back; the
/// `redirect_uri` the upstream IdP itself redirects to is this server's
/// own callback endpoint, fixed per provider in its configuration.
async fn authorize(
    State(state): State<std::sync::Arc<OAuthState>>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Redirect, AppError> {
    state.sweep_expired();

    let provider = state.providers.get(&query.idp).ok_or(AppError::NotFound)?;

    let upstream_state = generate_state();
    let upstream_pkce = if provider.uses_pkce() {
        Some(tmi_common::PkceCodes::generate())
    } else {
        None
    };
    let upstream_code_challenge = upstream_pkce.as_ref().map(|p| p.challenge.clone());

    let url = provider.authorization_url(
        &upstream_state,
        upstream_code_challenge.as_deref(),
        &query.redirect_uri,
    );

    state.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
        upstream_state,
        PendingAuthorization {
            idp_id: query.idp.clone(),
            upstream_pkce_verifier: upstream_pkce.map(|p| p.verifier),
            client_state: query.state,
            client_redirect_uri: query.redirect_uri,
            client_code_challenge: query.code_challenge,
            created_at: Instant::now(),
        },
    );

    Ok(Redirect::temporary(&url))
}

/// `GET /oauth2/callback` — the upstream IdP's redirect target. Exchanges
/// its code for the caller's identity, then hands the client a one-time
/// authorization code bound to the client's own PKCE challenge.
async fn callback(
    State(state): State<std::sync::Arc<OAuthState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Redirect, AppError> {
    state.sweep_expired();

    let pending = state
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&query.state)
        .ok_or_else(|| AppError::InvalidGrant("unknown or expired state".to_string()))?;

    let provider = state
        .providers
        .get(&pending.idp_id)
        .ok_or(AppError::NotFound)?;

    let user_info = provider
        .exchange_code(
            &query.code,
            pending.upstream_pkce_verifier.as_deref(),
            &pending.client_redirect_uri,
        )
        .await?;

    let auth_code = generate_state();
    state.issued_codes.lock().unwrap_or_else(|e| e.into_inner()).insert(
        auth_code.clone(),
        IssuedAuthCode {
            user: user_info,
            provider_id: pending.idp_id,
            code_challenge: pending.client_code_challenge,
            created_at: Instant::now(),
        },
    );

    let redirect_url = format!(
        "{}?code={}&state={}",
        pending.client_redirect_uri,
        urlencode(&auth_code),
        urlencode(&pending.client_state),
    );
    Ok(Redirect::temporary(&redirect_url))
}

/// `POST /oauth2/token` — redeems either an authorization code (PKCE
/// verified against the challenge presented at `/oauth2/authorize`) or a
/// refresh token, minting a fresh access/refresh token pair either way.
async fn token(
    State(state): State<std::sync::Arc<OAuthState>>,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, AppError> {
    state.sweep_expired();

    match form.grant_type.as_str() {
        "authorization_code" => exchange_authorization_code(&state, &form).await,
        "refresh_token" => exchange_refresh_token(&state, &form).await,
        other => Err(AppError::InvalidGrant(format!("unsupported grant_type '{other}'"))),
    }
    .map(Json)
}

async fn exchange_authorization_code(
    state: &OAuthState,
    form: &TokenForm,
) -> Result<TokenResponse, AppError> {
    let issued = state
        .issued_codes
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&form.code)
        .ok_or_else(|| AppError::InvalidGrant("unknown or already-redeemed code".to_string()))?;

    if challenge_for(&form.code_verifier) != issued.code_challenge {
        return Err(AppError::InvalidGrant("PKCE verification failed".to_string()));
    }

    let principal = state
        .users
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .find_or_create(&issued.provider_id, &issued.user);

    mint_token_pair(state, &principal)
}

async fn exchange_refresh_token(state: &OAuthState, form: &TokenForm) -> Result<TokenResponse, AppError> {
    let mut refresh_tokens = state.refresh_tokens.lock().unwrap_or_else(|e| e.into_inner());
    let record = refresh_tokens
        .get(&form.refresh_token)
        .cloned()
        .ok_or_else(|| AppError::InvalidGrant("unknown refresh token".to_string()))?;

    if record.used {
        let family_id = record.family_id;
        refresh_tokens.retain(|_, r| r.family_id != family_id);
        tracing::warn!(user_id = %record.user_id, "refresh token reuse detected, family revoked");
        return Err(AppError::InvalidGrant("refresh token reuse detected".to_string()));
    }

    if record.issued_at.elapsed() > Duration::from_secs(state.config.refresh_token_ttl_secs) {
        refresh_tokens.remove(&form.refresh_token);
        return Err(AppError::InvalidGrant("refresh token expired".to_string()));
    }

    refresh_tokens.get_mut(&form.refresh_token).unwrap().used = true;

    let principal = tmi_common::Principal {
        user_id: record.user_id,
        email: record.email.clone(),
        provider: record.provider.clone(),
        admin: record.admin,
    };
    let family_id = record.family_id;
    drop(refresh_tokens);

    mint_token_pair_in_family(state, &principal, family_id)
}

fn mint_token_pair(state: &OAuthState, principal: &tmi_common::Principal) -> Result<TokenResponse, AppError> {
    mint_token_pair_in_family(state, principal, Uuid::new_v4())
}

fn mint_token_pair_in_family(
    state: &OAuthState,
    principal: &tmi_common::Principal,
    family_id: Uuid,
) -> Result<TokenResponse, AppError> {
    let access_token = state
        .signing_keys
        .try_read()
        .map_err(|_| anyhow::anyhow!("signing key set lock poisoned"))?
        .mint(
            principal.user_id,
            &principal.email,
            &principal.provider,
            principal.admin,
            state.config.access_token_ttl_secs,
        )
        .map_err(AppError::Internal)?;

    let refresh_token = generate_state();
    state.refresh_tokens.lock().unwrap_or_else(|e| e.into_inner()).insert(
        refresh_token.clone(),
        RefreshTokenRecord {
            family_id,
            user_id: principal.user_id,
            email: principal.email.clone(),
            provider: principal.provider.clone(),
            admin: principal.admin,
            used: false,
            issued_at: Instant::now(),
        },
    );

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.config.access_token_ttl_secs,
        refresh_token,
    })
}

/// `POST /oauth2/revoke` — revokes a refresh token's entire family.
async fn revoke(
    State(state): State<std::sync::Arc<OAuthState>>,
    Form(form): Form<RevokeForm>,
) -> impl IntoResponse {
    let mut refresh_tokens = state.refresh_tokens.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(record) = refresh_tokens.get(&form.token) {
        let family_id = record.family_id;
        refresh_tokens.retain(|_, r| r.family_id != family_id);
    }
    axum::http::StatusCode::OK
}

/// `GET /.well-known/openid-configuration`
async fn discovery(State(state): State<std::sync::Arc<OAuthState>>) -> Json<serde_json::Value> {
    let _ = &state;
    Json(json!({
        "authorization_endpoint": "/oauth2/authorize",
        "token_endpoint": "/oauth2/token",
        "revocation_endpoint": "/oauth2/revoke",
        "jwks_uri": "/.well-known/jwks.json",
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"],
    }))
}

/// `GET /.well-known/jwks.json` — access tokens are HS256-signed, so
/// there is no public verification material to publish; this endpoint
/// exists for OIDC-discovery completeness and always returns an empty
/// key set.
async fn jwks() -> Json<serde_json::Value> {
    Json(json!({ "keys": [] }))
}

pub fn routes(state: std::sync::Arc<OAuthState>) -> Router {
    Router::new()
        .route("/oauth2/authorize", get(authorize))
        .route("/oauth2/callback", get(callback))
        .route("/oauth2/token", post(token))
        .route("/oauth2/refresh", post(token))
        .route("/oauth2/revoke", post(revoke))
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/.well-known/jwks.json", get(jwks))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmi_common::OAuthConfig;

    fn test_state() -> std::sync::Arc<OAuthState> {
        let config = OAuthConfig {
            test_idp_enabled: true,
            ..OAuthConfig::default()
        };
        let keys = SigningKeySet::new("tmi", "tmi-clients", "test-secret");
        std::sync::Arc::new(OAuthState::new(config, keys))
    }

    #[tokio::test]
    async fn full_authorization_code_flow_mints_tokens() {
        let state = test_state();
        let client_pkce = tmi_common::PkceCodes::generate();

        let authorize_result = authorize(
            State(state.clone()),
            Query(AuthorizeQuery {
                idp: "test".to_string(),
                redirect_uri: "https://client.example/callback".to_string(),
                state: "client-state".to_string(),
                code_challenge: client_pkce.challenge.clone(),
            }),
        )
        .await;
        assert!(authorize_result.is_ok());

        let upstream_state = state
            .pending
            .lock()
            .unwrap()
            .keys()
            .next()
            .cloned()
            .expect("authorize should have recorded a pending request");

        callback(
            State(state.clone()),
            Query(CallbackQuery {
                code: "test-authorization-code".to_string(),
                state: upstream_state,
            }),
        )
        .await
        .expect("callback should succeed");

        let auth_code = state
            .issued_codes
            .lock()
            .unwrap()
            .keys()
            .next()
            .cloned()
            .expect("callback should have issued a code");

        let token_response = exchange_authorization_code(
            &state,
            &TokenForm {
                grant_type: "authorization_code".to_string(),
                code: auth_code,
                code_verifier: client_pkce.verifier.clone(),
                redirect_uri: "https://client.example/callback".to_string(),
                refresh_token: String::new(),
            },
        )
        .await
        .expect("token exchange should succeed");

        assert_eq!(token_response.token_type, "Bearer");
        assert!(!token_response.access_token.is_empty());
        assert!(!token_response.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn wrong_pkce_verifier_is_rejected() {
        let state = test_state();
        state.issued_codes.lock().unwrap().insert(
            "a-code".to_string(),
            IssuedAuthCode {
                user: ProviderUserInfo {
                    subject: "s".to_string(),
                    email: "a@example.com".to_string(),
                },
                provider_id: "test".to_string(),
                code_challenge: challenge_for("correct-verifier"),
                created_at: Instant::now(),
            },
        );

        let result = exchange_authorization_code(
            &state,
            &TokenForm {
                grant_type: "authorization_code".to_string(),
                code: "a-code".to_string(),
                code_verifier: "wrong-verifier".to_string(),
                redirect_uri: String::new(),
                refresh_token: String::new(),
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn refresh_token_rotation_then_reuse_is_detected() {
        let state = test_state();
        let principal = tmi_common::Principal {
            user_id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            provider: "test".to_string(),
            admin: false,
        };
        let first = mint_token_pair(&state, &principal).unwrap();

        let second = exchange_refresh_token(
            &state,
            &TokenForm {
                grant_type: "refresh_token".to_string(),
                code: String::new(),
                code_verifier: String::new(),
                redirect_uri: String::new(),
                refresh_token: first.refresh_token.clone(),
            },
        )
        .await
        .expect("first refresh should succeed");
        assert_ne!(second.refresh_token, first.refresh_token);

        // Reusing the already-rotated-away first refresh token must be
        // rejected and must also revoke the token the rotation produced.
        let reuse_result = exchange_refresh_token(
            &state,
            &TokenForm {
                grant_type: "refresh_token".to_string(),
                code: String::new(),
                code_verifier: String::new(),
                redirect_uri: String::new(),
                refresh_token: first.refresh_token,
            },
        )
        .await;
        assert!(matches!(reuse_result, Err(AppError::InvalidGrant(_))));

        let second_reuse_result = exchange_refresh_token(
            &state,
            &TokenForm {
                grant_type: "refresh_token".to_string(),
                code: String::new(),
                code_verifier: String::new(),
                redirect_uri: String::new(),
                refresh_token: second.refresh_token,
            },
        )
        .await;
        assert!(matches!(second_reuse_result, Err(AppError::InvalidGrant(_))));
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("a=b&c"), "a%3Db%26c");
        assert_eq!(urlencode("abc123-_.~"), "abc123-_.~");
    }
}
