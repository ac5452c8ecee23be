use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};

/// Header trusted for the caller's identity when authentication is disabled
/// (local development only).
pub const USER_ID_HEADER: &str = "x-promptdesk-user-id";

/// The authenticated caller, as resolved by `require_identity`.
///
/// The user id is an opaque identifier owned by the external identity
/// provider; nothing else about the user is stored here.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Error;

    /// Pull the identity `require_identity` resolved out of the request
    /// extensions. Requests that bypassed the middleware are rejected.
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Identity>().cloned().ok_or_else(|| {
            Error::new(ErrorDetails::Unauthorized {
                message: "Missing user identity".to_string(),
            })
        })
    }
}

/// Claims carried by the session tokens the identity provider signs.
/// Expiry is validated by `jsonwebtoken` itself; only `sub` is read here.
#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
}

/// Verifies session tokens issued by the external identity provider.
#[derive(Clone)]
pub struct Auth {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl Auth {
    pub fn new(session_secret: &SecretString) -> Self {
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(
                session_secret.expose_secret().as_bytes(),
            )),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify a session token and extract the caller's identity from the
    /// `sub` claim.
    pub fn verify_session(&self, token: &str) -> Result<Identity, Error> {
        let token_data =
            jsonwebtoken::decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
                .map_err(|e| {
                    Error::new(ErrorDetails::Unauthorized {
                        message: format!("Invalid session token: {e}"),
                    })
                })?;
        Ok(Identity {
            user_id: token_data.claims.sub,
        })
    }
}

/// Represents the authentication state of the app
#[derive(Clone)]
pub enum AuthenticationInfo {
    Enabled(Auth),
    Disabled,
}

/// Extract the Bearer token from the Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Result<String, Error> {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match auth_header {
        Some(header_value) => {
            let trimmed = header_value.trim();
            Ok(trimmed
                .strip_prefix("Bearer ")
                .unwrap_or(trimmed)
                .to_string())
        }
        None => Err(Error::new(ErrorDetails::Unauthorized {
            message: "Missing authorization header".to_string(),
        })),
    }
}

/// Middleware resolving the caller's identity before API handlers run.
///
/// On success an `Identity` is inserted into the request extensions; on
/// failure the request is rejected with a 401 response.
pub async fn require_identity(
    State(authentication_info): State<AuthenticationInfo>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let identity = match &authentication_info {
        AuthenticationInfo::Enabled(auth) => {
            let token = extract_bearer_token(request.headers()).map_err(|e| e.into_response())?;
            auth.verify_session(&token).map_err(|e| e.into_response())?
        }
        AuthenticationInfo::Disabled => {
            let user_id = request
                .headers()
                .get(USER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty());
            match user_id {
                Some(user_id) => Identity {
                    user_id: user_id.to_string(),
                },
                None => {
                    return Err(Error::new(ErrorDetails::Unauthorized {
                        message: format!("Missing {USER_ID_HEADER} header"),
                    })
                    .into_response())
                }
            }
        }
    };

    tracing::debug!(user_id = %identity.user_id, "resolved caller identity");
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
