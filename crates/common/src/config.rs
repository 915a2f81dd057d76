use serde::{Deserialize, Serialize};

/// Top-level configuration for the TMI collaboration server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmiConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Deployment environment. Controls defaults such as whether the
    /// built-in test identity provider is available.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Origins allowed to make cross-origin requests (empty = same-origin only).
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

/// Knobs for the per-diagram collaboration session engine.
///
/// `grace_period_secs`, `idle_timeout_secs`, `request_timeout_secs` and
/// `ring_buffer_size` correspond to T_grace, T_idle, T_req and N.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// T_grace: how long a disconnected writer/presenter keeps write authority
    /// reserved before it is released to the next participant.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// T_idle: how long a session with zero connected participants is kept
    /// alive before the session is torn down.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// T_req: how long a presenter-request waits for the current presenter
    /// to respond before it is auto-resolved.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// N: number of recent operations kept for late-joiner catch-up before
    /// falling back to a full snapshot.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,
    /// Maximum size, in bytes, of a single inbound WebSocket message.
    #[serde(default = "default_ws_max_message_bytes")]
    pub ws_max_message_bytes: usize,
    /// Per-connection token-bucket rate limit: sustained messages/sec.
    #[serde(default = "default_ws_rate_limit_per_sec")]
    pub ws_rate_limit_per_sec: u32,
    /// Per-connection token-bucket rate limit: burst capacity.
    #[serde(default = "default_ws_rate_limit_burst")]
    pub ws_rate_limit_burst: u32,
    /// Bound on each connection's outbound message queue. Exceeding this is
    /// a policy violation and the connection is closed.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Upstream identity providers available for the authorization-code flow.
    #[serde(default)]
    pub providers: Vec<OAuthProviderConfig>,
    /// Enables the built-in in-process test identity provider. Should never
    /// be enabled in production.
    #[serde(default)]
    pub test_idp_enabled: bool,
    /// Lifetime of minted access tokens.
    #[serde(default = "default_access_token_ttl_secs")]
    pub access_token_ttl_secs: u64,
    /// Lifetime of minted refresh tokens.
    #[serde(default = "default_refresh_token_ttl_secs")]
    pub refresh_token_ttl_secs: u64,
    /// How long an issued `state`/PKCE challenge is held before it expires
    /// unused.
    #[serde(default = "default_auth_state_ttl_secs")]
    pub auth_state_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// Short identifier used in the `idp` path segment, e.g. "google".
    pub id: String,
    pub display_name: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            environment: default_environment(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            ring_buffer_size: default_ring_buffer_size(),
            ws_max_message_bytes: default_ws_max_message_bytes(),
            ws_rate_limit_per_sec: default_ws_rate_limit_per_sec(),
            ws_rate_limit_burst: default_ws_rate_limit_burst(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            test_idp_enabled: false,
            access_token_ttl_secs: default_access_token_ttl_secs(),
            refresh_token_ttl_secs: default_refresh_token_ttl_secs(),
            auth_state_ttl_secs: default_auth_state_ttl_secs(),
        }
    }
}

impl TmiConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{}' does not exist.", cert));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{}' does not exist.", key));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. Both must be set for \
                     custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. Both must be set for \
                     custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.server.environment != "development" && self.server.environment != "production" {
            issues.push(format!(
                "WARNING: server.environment '{}' is not one of 'development'/'production'.",
                self.server.environment
            ));
        }

        if self.oauth.test_idp_enabled && self.server.environment == "production" {
            issues.push(
                "ERROR: oauth.test_idp_enabled must not be true when \
                 server.environment = \"production\"."
                    .to_string(),
            );
        }

        if self.session.grace_period_secs == 0 {
            issues.push("ERROR: session.grace_period_secs must be >= 1.".to_string());
        }
        if self.session.request_timeout_secs == 0 {
            issues.push("ERROR: session.request_timeout_secs must be >= 1.".to_string());
        }
        if self.session.idle_timeout_secs == 0 {
            issues.push("ERROR: session.idle_timeout_secs must be >= 1.".to_string());
        } else if self.session.idle_timeout_secs < self.session.grace_period_secs {
            issues.push(format!(
                "WARNING: session.idle_timeout_secs ({}) is shorter than \
                 session.grace_period_secs ({}); disconnected writers may never \
                 get their grace window before the session is reaped.",
                self.session.idle_timeout_secs, self.session.grace_period_secs
            ));
        }

        if self.session.ring_buffer_size == 0 {
            issues.push("ERROR: session.ring_buffer_size must be >= 1.".to_string());
        } else if self.session.ring_buffer_size < 16 {
            issues.push(format!(
                "WARNING: session.ring_buffer_size is {}, which may be too small for \
                 late-joiners to catch up without a full snapshot.",
                self.session.ring_buffer_size
            ));
        }

        if self.session.ws_max_message_bytes == 0 {
            issues.push("ERROR: session.ws_max_message_bytes must be >= 1.".to_string());
        } else if self.session.ws_max_message_bytes > 10 * 1024 * 1024 {
            issues.push(format!(
                "WARNING: session.ws_max_message_bytes is {} (> 10MiB); this is unusually \
                 large for a diagram-mutation message.",
                self.session.ws_max_message_bytes
            ));
        }

        if self.session.ws_rate_limit_per_sec == 0 {
            issues.push("ERROR: session.ws_rate_limit_per_sec must be >= 1.".to_string());
        }
        if self.session.ws_rate_limit_burst < self.session.ws_rate_limit_per_sec {
            issues.push(format!(
                "WARNING: session.ws_rate_limit_burst ({}) is smaller than \
                 session.ws_rate_limit_per_sec ({}); bursts will be throttled to the \
                 sustained rate.",
                self.session.ws_rate_limit_burst, self.session.ws_rate_limit_per_sec
            ));
        }

        if self.session.outbound_queue_capacity == 0 {
            issues.push("ERROR: session.outbound_queue_capacity must be >= 1.".to_string());
        }

        for provider in &self.oauth.providers {
            if provider.id.trim().is_empty() {
                issues.push("ERROR: oauth provider entry has an empty id.".to_string());
            }
            if provider.client_id.trim().is_empty() {
                issues.push(format!(
                    "ERROR: oauth provider '{}' has an empty client_id.",
                    provider.id
                ));
            }
            for (field, value) in [
                ("authorization_endpoint", &provider.authorization_endpoint),
                ("token_endpoint", &provider.token_endpoint),
                ("userinfo_endpoint", &provider.userinfo_endpoint),
            ] {
                if !value.starts_with("https://") && !value.starts_with("http://") {
                    issues.push(format!(
                        "ERROR: oauth provider '{}' field '{}' must be an http(s) URL, got '{}'.",
                        provider.id, field, value
                    ));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_grace_period_secs() -> u64 {
    30
}
fn default_idle_timeout_secs() -> u64 {
    900
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_ring_buffer_size() -> usize {
    256
}
fn default_ws_max_message_bytes() -> usize {
    64 * 1024
}
fn default_ws_rate_limit_per_sec() -> u32 {
    20
}
fn default_ws_rate_limit_burst() -> u32 {
    60
}
fn default_outbound_queue_capacity() -> usize {
    256
}
fn default_access_token_ttl_secs() -> u64 {
    15 * 60
}
fn default_refresh_token_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}
fn default_auth_state_ttl_secs() -> u64 {
    10 * 60
}
fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "email".to_string(),
        "profile".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: TmiConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8443);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.tls_key.is_none());
        assert_eq!(config.server.environment, "development");

        assert_eq!(config.session.grace_period_secs, 30);
        assert_eq!(config.session.idle_timeout_secs, 900);
        assert_eq!(config.session.request_timeout_secs, 30);
        assert_eq!(config.session.ring_buffer_size, 256);
        assert_eq!(config.session.ws_max_message_bytes, 65536);
        assert_eq!(config.session.ws_rate_limit_per_sec, 20);
        assert_eq!(config.session.ws_rate_limit_burst, 60);
        assert_eq!(config.session.outbound_queue_capacity, 256);

        assert!(config.oauth.providers.is_empty());
        assert!(!config.oauth.test_idp_enabled);
        assert_eq!(config.oauth.access_token_ttl_secs, 900);
    }

    #[test]
    fn partial_config_only_session_section() {
        let toml_str = r#"
[session]
grace_period_secs = 10
ring_buffer_size = 512
"#;
        let config: TmiConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.session.grace_period_secs, 10);
        assert_eq!(config.session.ring_buffer_size, 512);
        assert_eq!(config.session.idle_timeout_secs, 900);
        assert_eq!(config.server.bind, "0.0.0.0");
    }

    #[test]
    fn default_trait_matches_toml_defaults() {
        let from_toml: TmiConfig = toml::from_str("").unwrap();
        let server = ServerConfig::default();
        assert_eq!(server.bind, from_toml.server.bind);
        assert_eq!(server.port, from_toml.server.port);
        assert_eq!(server.environment, from_toml.server.environment);

        let session = SessionConfig::default();
        assert_eq!(
            session.grace_period_secs,
            from_toml.session.grace_period_secs
        );
        assert_eq!(
            session.idle_timeout_secs,
            from_toml.session.idle_timeout_secs
        );
        assert_eq!(
            session.ring_buffer_size,
            from_toml.session.ring_buffer_size
        );

        let oauth = OAuthConfig::default();
        assert_eq!(oauth.test_idp_enabled, from_toml.oauth.test_idp_enabled);
        assert_eq!(
            oauth.access_token_ttl_secs,
            from_toml.oauth.access_token_ttl_secs
        );
    }

    fn valid_config() -> TmiConfig {
        toml::from_str("").unwrap()
    }

    fn validate_issues(config: &TmiConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_test_idp_in_production_is_error() {
        let mut config = valid_config();
        config.server.environment = "production".to_string();
        config.oauth.test_idp_enabled = true;
        assert!(has_error(&validate_issues(&config), "test_idp_enabled"));
    }

    #[test]
    fn validate_test_idp_in_development_is_ok() {
        let mut config = valid_config();
        config.server.environment = "development".to_string();
        config.oauth.test_idp_enabled = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_idle_shorter_than_grace_is_warning() {
        let mut config = valid_config();
        config.session.grace_period_secs = 120;
        config.session.idle_timeout_secs = 60;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "idle_timeout_secs"));
        assert!(!has_error(&issues, "idle_timeout_secs"));
    }

    #[test]
    fn validate_ring_buffer_zero_is_error() {
        let mut config = valid_config();
        config.session.ring_buffer_size = 0;
        assert!(has_error(&validate_issues(&config), "ring_buffer_size"));
    }

    #[test]
    fn validate_ring_buffer_small_is_warning() {
        let mut config = valid_config();
        config.session.ring_buffer_size = 4;
        assert!(has_warning(&validate_issues(&config), "ring_buffer_size"));
    }

    #[test]
    fn validate_rate_limit_burst_below_sustained_is_warning() {
        let mut config = valid_config();
        config.session.ws_rate_limit_per_sec = 100;
        config.session.ws_rate_limit_burst = 10;
        assert!(has_warning(
            &validate_issues(&config),
            "ws_rate_limit_burst"
        ));
    }

    #[test]
    fn validate_oauth_provider_missing_client_id_is_error() {
        let mut config = valid_config();
        config.oauth.providers.push(OAuthProviderConfig {
            id: "google".to_string(),
            display_name: "Google".to_string(),
            authorization_endpoint: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_endpoint: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            client_id: String::new(),
            client_secret: "secret".to_string(),
            scopes: default_scopes(),
        });
        assert!(has_error(&validate_issues(&config), "client_id"));
    }

    #[test]
    fn validate_oauth_provider_bad_endpoint_is_error() {
        let mut config = valid_config();
        config.oauth.providers.push(OAuthProviderConfig {
            id: "google".to_string(),
            display_name: "Google".to_string(),
            authorization_endpoint: "not-a-url".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_endpoint: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            client_id: "abc".to_string(),
            client_secret: "secret".to_string(),
            scopes: default_scopes(),
        });
        assert!(has_error(
            &validate_issues(&config),
            "authorization_endpoint"
        ));
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.server.port = 0;
        config.session.grace_period_secs = 0;
        config.session.ring_buffer_size = 0;
        assert!(validate_issues(&config).len() >= 3);
    }
}
