use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};

/// Top-level config for the app, parsed from `promptdesk.toml`.
///
/// Secrets never live here. The completion credential, the session-token
/// verification key, and the Redis URL all come from the environment
/// (`OPENAI_API_KEY`, `PROMPTDESK_SESSION_SECRET`, `PROMPTDESK_REDIS_URL`).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub billing: BillingConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address to bind to. Defaults to 0.0.0.0:3000 when unset.
    pub bind_address: Option<SocketAddr>,
    /// When true, raw upstream response details are included in error logs.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationConfig {
    /// `None` means enabled. Disabling trusts the `x-promptdesk-user-id`
    /// header and is intended for local development only.
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Number of lifetime requests granted to users without an active
    /// subscription.
    #[serde(default = "default_free_limit")]
    pub free_limit: u64,
}

fn default_free_limit() -> u64 {
    5
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_limit: default_free_limit(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionConfig {
    /// Base URL of the OpenAI-compatible completion API.
    #[serde(default = "default_api_base")]
    pub api_base: Url,
    /// Model identifier sent with every completion request.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_api_base() -> Url {
    // Infallible: the literal is a valid URL
    #[expect(clippy::expect_used)]
    Url::parse("https://api.openai.com/v1/").expect("default api_base is a valid URL")
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BillingConfig {
    /// TTL for cached subscription lookups (in milliseconds)
    #[serde(default = "default_subscription_cache_ttl_ms")]
    pub subscription_cache_ttl_ms: u64,
}

fn default_subscription_cache_ttl_ms() -> u64 {
    30_000
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            subscription_cache_ttl_ms: default_subscription_cache_ttl_ms(),
        }
    }
}

impl Config {
    pub async fn load_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::FileRead {
                message: e.to_string(),
                file_path: path.display().to_string(),
            })
        })?;
        Self::load_from_toml(&contents)
    }

    fn load_from_toml(contents: &str) -> Result<Config, Error> {
        toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })
    }
}
