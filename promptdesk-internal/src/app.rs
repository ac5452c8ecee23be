use std::sync::Arc;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use minijinja::Environment;
use reqwest::Client;
use secrecy::SecretString;
use serde::de::DeserializeOwned;

use crate::auth::{Auth, AuthenticationInfo, USER_ID_HEADER};
use crate::completion::CompletionConnectionInfo;
use crate::config::Config;
use crate::endpoints::pages;
use crate::error::{Error, ErrorDetails};
use crate::quota::{self, QuotaGate, SubscriptionChecker, SubscriptionSource, UsageStore};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub http_client: Client,
    pub authentication_info: AuthenticationInfo,
    pub quota_gate: Arc<QuotaGate>,
    pub completions: Arc<CompletionConnectionInfo>,
    pub templates: Arc<Environment<'static>>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let http_client = setup_http_client()?;
        let authentication_info = setup_authentication(&config)?;
        let quota_gate = setup_quota(&config).await?;
        let completions = Arc::new(CompletionConnectionInfo::new(&config.completion));
        let templates = Arc::new(pages::build_template_environment()?);

        Ok(Self {
            config,
            http_client,
            authentication_info,
            quota_gate,
            completions,
            templates,
        })
    }
}

pub fn setup_authentication(config: &Config) -> Result<AuthenticationInfo, Error> {
    match config.server.authentication.enabled {
        Some(false) => {
            tracing::warn!(
                "Authentication is disabled; trusting the {USER_ID_HEADER} header. Do not run this configuration in production."
            );
            Ok(AuthenticationInfo::Disabled)
        }
        Some(true) | None => {
            let session_secret = std::env::var("PROMPTDESK_SESSION_SECRET").map_err(|_| {
                Error::new(ErrorDetails::AppState {
                    message: "Missing environment variable PROMPTDESK_SESSION_SECRET".to_string(),
                })
            })?;
            Ok(AuthenticationInfo::Enabled(Auth::new(&SecretString::from(
                session_secret,
            ))))
        }
    }
}

/// Set up the usage counter and subscription checker behind the quota gate.
///
/// With `PROMPTDESK_REDIS_URL` set, both read the shared Redis instance the
/// billing service writes to. Without it they fall back to process-local
/// state, which is only suitable for development.
pub async fn setup_quota(config: &Config) -> Result<Arc<QuotaGate>, Error> {
    let (store, source) = match std::env::var("PROMPTDESK_REDIS_URL") {
        Ok(redis_url) => {
            let connection = quota::store::connect(&redis_url).await?;
            tracing::info!("Connected to Redis for usage and subscription records");
            (
                UsageStore::Production {
                    connection: connection.clone(),
                },
                SubscriptionSource::Production { connection },
            )
        }
        Err(_) => {
            tracing::warn!(
                "PROMPTDESK_REDIS_URL is not set; usage and subscription records are kept in process memory and reset on restart"
            );
            (
                UsageStore::new_ephemeral(),
                SubscriptionSource::new_ephemeral(),
            )
        }
    };

    let subscriptions =
        SubscriptionChecker::new(source, config.billing.subscription_cache_ttl_ms);
    Ok(Arc::new(QuotaGate::new(
        store,
        subscriptions,
        config.quota.free_limit,
    )))
}

/// An axum extractor that rejects malformed bodies with our own error type,
/// reporting the path of the offending field.
#[derive(Debug)]
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        // Convert the entire body into `serde_json::Value`
        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        // Now use `serde_path_to_error::deserialize` to attempt deserialization into `T`
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

// This is set high enough that it should never be hit for a normal completion.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(5 * 60);

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::StatusCode;
    use serde::Deserialize;

    use crate::completion::Message;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct ChatParams {
        messages: Vec<Message>,
    }

    fn json_request(body: &str) -> Request {
        Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_structured_json_accepts_valid_body() {
        let request = json_request(r#"{"messages": [{"role": "user", "content": "X"}]}"#);
        let StructuredJson(params) = StructuredJson::<ChatParams>::from_request(request, &())
            .await
            .unwrap();
        assert_eq!(params.messages, vec![Message::user("X")]);
    }

    #[tokio::test]
    async fn test_structured_json_rejects_missing_messages() {
        let request = json_request(r#"{}"#);
        let error = StructuredJson::<ChatParams>::from_request(request, &())
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_structured_json_rejects_non_array_messages() {
        let request = json_request(r#"{"messages": "hello"}"#);
        let error = StructuredJson::<ChatParams>::from_request(request, &())
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_structured_json_rejects_invalid_json() {
        let request = json_request("not json");
        let error = StructuredJson::<ChatParams>::from_request(request, &())
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }
}
