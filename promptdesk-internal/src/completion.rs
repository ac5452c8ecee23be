use std::sync::{Arc, Mutex};

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::CompletionConfig;
use crate::error::{Error, ErrorDetails};

const PROVIDER_TYPE: &str = "openai";

/// Environment variable holding the completion API credential.
pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A role-tagged unit of conversational text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request body for the OpenAI-compatible chat completions endpoint
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Message,
}

/// Connection to the hosted completion API.
///
/// One variant per backing: the real OpenAI-compatible API, or an in-process
/// mock for tests that records every request it receives.
pub enum CompletionConnectionInfo {
    Production {
        api_base: Url,
        model: String,
        credential: Option<SecretString>,
    },
    Mock {
        /// `None` makes every call fail, standing in for an unreachable API.
        reply: Option<String>,
        requests: Arc<Mutex<Vec<Vec<Message>>>>,
    },
}

fn chat_url(api_base: &Url) -> Result<Url, Error> {
    // Url::join treats the base as a directory only with a trailing slash
    let mut api_base = api_base.clone();
    if !api_base.path().ends_with('/') {
        api_base.set_path(&format!("{}/", api_base.path()));
    }
    api_base.join("chat/completions").map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to build completion URL: {e}"),
        })
    })
}

impl CompletionConnectionInfo {
    /// Build a production connection from config, picking the credential up
    /// from the environment. A missing credential is not an error here; it
    /// is surfaced per request so the rest of the app can start without it.
    pub fn new(config: &CompletionConfig) -> Self {
        let credential = std::env::var(API_KEY_ENV_VAR)
            .ok()
            .filter(|key| !key.is_empty())
            .map(SecretString::from);
        if credential.is_none() {
            tracing::warn!(
                "{API_KEY_ENV_VAR} is not set; completion requests will fail until it is provided"
            );
        }
        CompletionConnectionInfo::Production {
            api_base: config.api_base.clone(),
            model: config.model.clone(),
            credential,
        }
    }

    pub fn new_mock(reply: &str) -> Self {
        CompletionConnectionInfo::Mock {
            reply: Some(reply.to_string()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn new_unhealthy_mock() -> Self {
        CompletionConnectionInfo::Mock {
            reply: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether a credential is configured for the external API.
    pub fn has_credential(&self) -> bool {
        match self {
            CompletionConnectionInfo::Production { credential, .. } => credential.is_some(),
            CompletionConnectionInfo::Mock { .. } => true,
        }
    }

    /// Requests the mock has served, oldest first. Test inspection only.
    pub fn recorded_requests(&self) -> Vec<Vec<Message>> {
        match self {
            CompletionConnectionInfo::Mock { requests, .. } => {
                // A poisoned Mutex means a panic in another test thread; propagating it is fine.
                #[expect(clippy::expect_used)]
                let requests = requests.lock().expect("Mutex poisoned");
                requests.clone()
            }
            CompletionConnectionInfo::Production { .. } => Vec::new(),
        }
    }

    /// Run one completion and return the first generated message.
    ///
    /// A single synchronous call from the caller's perspective: no retries,
    /// no streaming, no cancellation.
    pub async fn create(
        &self,
        http_client: &Client,
        messages: &[Message],
    ) -> Result<Message, Error> {
        match self {
            CompletionConnectionInfo::Production {
                api_base,
                model,
                credential,
            } => {
                let request_url = chat_url(api_base)?;
                let request_body = ChatCompletionRequest {
                    model: model.as_str(),
                    messages,
                };

                let mut request_builder = http_client
                    .post(request_url)
                    .header("Content-Type", "application/json");
                if let Some(credential) = credential {
                    request_builder = request_builder.bearer_auth(credential.expose_secret());
                }

                let response = request_builder
                    .json(&request_body)
                    .send()
                    .await
                    .map_err(|e| {
                        Error::new(ErrorDetails::CompletionClient {
                            message: format!("Error sending request: {e}"),
                            status_code: e.status(),
                            provider_type: PROVIDER_TYPE.to_string(),
                        })
                    })?;

                let status = response.status();
                if !status.is_success() {
                    let raw_response = response.text().await.unwrap_or_default();
                    return Err(Error::new(ErrorDetails::CompletionClient {
                        message: format!("Completion API returned an error: {raw_response}"),
                        status_code: Some(status),
                        provider_type: PROVIDER_TYPE.to_string(),
                    }));
                }

                let raw_response = response.text().await.map_err(|e| {
                    Error::new(ErrorDetails::CompletionServer {
                        message: format!("Error reading response: {e}"),
                        provider_type: PROVIDER_TYPE.to_string(),
                        raw_response: None,
                    })
                })?;
                let response: ChatCompletionResponse =
                    serde_json::from_str(&raw_response).map_err(|e| {
                        Error::new(ErrorDetails::CompletionServer {
                            message: format!("Error parsing response: {e}"),
                            provider_type: PROVIDER_TYPE.to_string(),
                            raw_response: Some(raw_response.clone()),
                        })
                    })?;

                let choice = response.choices.into_iter().next().ok_or_else(|| {
                    Error::new(ErrorDetails::CompletionServer {
                        message: "Response contained no choices".to_string(),
                        provider_type: PROVIDER_TYPE.to_string(),
                        raw_response: Some(raw_response),
                    })
                })?;
                Ok(choice.message)
            }
            CompletionConnectionInfo::Mock { reply, requests } => {
                {
                    #[expect(clippy::expect_used)]
                    let mut requests = requests.lock().expect("Mutex poisoned");
                    requests.push(messages.to_vec());
                }
                match reply {
                    Some(reply) => Ok(Message::assistant(reply.clone())),
                    None => Err(Error::new(ErrorDetails::CompletionClient {
                        message: "Mock completion connection is unhealthy".to_string(),
                        status_code: None,
                        provider_type: "mock".to_string(),
                    })),
                }
            }
        }
    }
}
