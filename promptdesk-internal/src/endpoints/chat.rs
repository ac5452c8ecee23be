use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::app::{AppState, AppStateData, StructuredJson};
use crate::auth::Identity;
use crate::completion::{Message, Role};
use crate::error::{Error, ErrorDetails};
use crate::quota::QuotaDecision;

/// System instruction prepended to every code-generation request.
const CODE_INSTRUCTION: &str = "You are a code generator and programming assistant. You must answer in only markdown code snippets. Use code comments for explanations.";

#[derive(Debug, Deserialize)]
pub struct ChatParams {
    pub messages: Vec<Message>,
}

/// `POST /api/conversation`: forward the transcript unmodified.
pub async fn conversation_handler(
    State(app_state): AppState,
    identity: Identity,
    StructuredJson(params): StructuredJson<ChatParams>,
) -> Result<Json<Message>, Error> {
    chat_completion(&app_state, identity, params.messages).await
}

/// `POST /api/code`: same contract as the conversation endpoint, with the
/// code-generation instruction prepended server-side.
pub async fn code_handler(
    State(app_state): AppState,
    identity: Identity,
    StructuredJson(params): StructuredJson<ChatParams>,
) -> Result<Json<Message>, Error> {
    chat_completion(&app_state, identity, with_code_instruction(params.messages)).await
}

/// Prepend the code-generation instruction to a transcript.
///
/// Applied once per request, never per turn: the client resubmits the whole
/// transcript each time, so the instruction must not accumulate.
fn with_code_instruction(messages: Vec<Message>) -> Vec<Message> {
    let mut with_instruction = Vec::with_capacity(messages.len() + 1);
    with_instruction.push(Message::system(CODE_INSTRUCTION));
    with_instruction.extend(messages.into_iter().filter(|m| m.role != Role::System));
    with_instruction
}

async fn chat_completion(
    app_state: &AppStateData,
    identity: Identity,
    messages: Vec<Message>,
) -> Result<Json<Message>, Error> {
    let user_id = identity.user_id.as_str();
    tracing::debug!(
        user_id = %user_id,
        num_messages = messages.len(),
        "chat completion request received"
    );

    let metered = match app_state.quota_gate.evaluate(user_id).await {
        QuotaDecision::Allow { metered } => metered,
        QuotaDecision::Deny { reason } => {
            return Err(Error::new(ErrorDetails::QuotaExceeded { reason }))
        }
    };

    if !app_state.completions.has_credential() {
        return Err(Error::new(ErrorDetails::ApiKeyMissing {
            provider_name: "OpenAI".to_string(),
        }));
    }

    let reply = app_state
        .completions
        .create(&app_state.http_client, &messages)
        .await?;

    // Usage is recorded only after the external call succeeds, so failed
    // calls never consume quota.
    if metered {
        app_state.quota_gate.record_usage(user_id).await?;
    }

    Ok(Json(reply))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;

    use crate::app::setup_http_client;
    use crate::completion::CompletionConnectionInfo;
    use crate::config::Config;
    use crate::quota::subscription::{SubscriptionRecord, SubscriptionSource};
    use crate::quota::{QuotaGate, SubscriptionChecker, UsageStore};

    use super::*;

    struct TestApp {
        state: AppStateData,
        store: UsageStore,
    }

    fn test_app(
        store: UsageStore,
        subscribed_users: &[&str],
        completions: CompletionConnectionInfo,
        free_limit: u64,
    ) -> TestApp {
        let source = SubscriptionSource::new_ephemeral();
        for user_id in subscribed_users {
            source.set_record(
                user_id,
                SubscriptionRecord {
                    status: "active".to_string(),
                    current_period_end: None,
                },
            );
        }
        let quota_gate = Arc::new(QuotaGate::new(
            store.clone(),
            SubscriptionChecker::new(source, 30_000),
            free_limit,
        ));
        let state = AppStateData {
            config: Arc::new(Config::default()),
            http_client: setup_http_client().unwrap(),
            authentication_info: crate::auth::AuthenticationInfo::Disabled,
            quota_gate,
            completions: Arc::new(completions),
            templates: Arc::new(crate::endpoints::pages::build_template_environment().unwrap()),
        };
        TestApp { state, store }
    }

    fn identity(user_id: &str) -> Identity {
        Identity {
            user_id: user_id.to_string(),
        }
    }

    fn params(messages: Vec<Message>) -> StructuredJson<ChatParams> {
        StructuredJson(ChatParams { messages })
    }

    #[tokio::test]
    async fn test_successful_round_trip_increments_usage_once() {
        let app = test_app(
            UsageStore::new_mock(true),
            &[],
            CompletionConnectionInfo::new_mock("Y"),
            5,
        );

        let Json(reply) = conversation_handler(
            State(app.state.clone()),
            identity("user_1"),
            params(vec![Message::user("X")]),
        )
        .await
        .unwrap();

        assert_eq!(reply, Message::assistant("Y"));
        assert_eq!(app.store.count("user_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_quota_exhausted_returns_403_without_increment() {
        let store = UsageStore::new_mock(true);
        store.set_count("user_1", 5);
        let app = test_app(store, &[], CompletionConnectionInfo::new_mock("Y"), 5);

        let error = conversation_handler(
            State(app.state),
            identity("user_1"),
            params(vec![Message::user("X")]),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(app.store.count("user_1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_subscriber_bypasses_counter_entirely() {
        // Unhealthy store: any counter access would fail the request.
        let app = test_app(
            UsageStore::new_mock(false),
            &["user_pro"],
            CompletionConnectionInfo::new_mock("Y"),
            5,
        );

        for _ in 0..3 {
            let Json(reply) = conversation_handler(
                State(app.state.clone()),
                identity("user_pro"),
                params(vec![Message::user("X")]),
            )
            .await
            .unwrap();
            assert_eq!(reply.content, "Y");
        }
    }

    #[tokio::test]
    async fn test_failed_completion_never_consumes_quota() {
        let app = test_app(
            UsageStore::new_mock(true),
            &[],
            CompletionConnectionInfo::new_unhealthy_mock(),
            5,
        );

        let error = conversation_handler(
            State(app.state.clone()),
            identity("user_1"),
            params(vec![Message::user("X")]),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(app.store.count("user_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_returns_500_before_external_call() {
        let completions = CompletionConnectionInfo::Production {
            api_base: url::Url::parse("https://api.openai.com/v1/").unwrap(),
            model: "gpt-3.5-turbo".to_string(),
            credential: None,
        };
        let app = test_app(UsageStore::new_mock(true), &[], completions, 5);

        let error = conversation_handler(
            State(app.state.clone()),
            identity("user_1"),
            params(vec![Message::user("X")]),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        // Rejected before any usage was recorded
        assert_eq!(app.store.count("user_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_code_handler_prepends_instruction_exactly_once() {
        let app = test_app(
            UsageStore::new_mock(true),
            &[],
            CompletionConnectionInfo::new_mock("```rust\nfn main() {}\n```"),
            5,
        );

        // A multi-turn payload, as resubmitted by the view on a second turn
        let transcript = vec![
            Message::user("write a hello world"),
            Message::assistant("```rust\nfn main() {}\n```"),
            Message::user("now in Python"),
        ];
        code_handler(
            State(app.state.clone()),
            identity("user_1"),
            params(transcript.clone()),
        )
        .await
        .unwrap();

        let recorded = app.state.completions.recorded_requests();
        assert_eq!(recorded.len(), 1);
        let sent = &recorded[0];
        assert_eq!(sent.len(), transcript.len() + 1);
        assert_eq!(sent[0], Message::system(CODE_INSTRUCTION));
        assert_eq!(sent[1..], transcript[..]);
        assert_eq!(
            sent.iter().filter(|m| m.role == Role::System).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_conversation_handler_forwards_messages_unmodified() {
        let app = test_app(
            UsageStore::new_mock(true),
            &[],
            CompletionConnectionInfo::new_mock("Y"),
            5,
        );

        let transcript = vec![
            Message::user("X"),
            Message::assistant("Y"),
            Message::user("Z"),
        ];
        conversation_handler(
            State(app.state.clone()),
            identity("user_1"),
            params(transcript.clone()),
        )
        .await
        .unwrap();

        let recorded = app.state.completions.recorded_requests();
        assert_eq!(recorded[0], transcript);
    }

    #[test]
    fn test_with_code_instruction_drops_client_supplied_system_messages() {
        // A client replaying a transcript that somehow contains a system
        // message must not end up with two of them.
        let messages = vec![
            Message::system(CODE_INSTRUCTION),
            Message::user("write a hello world"),
        ];
        let sent = with_code_instruction(messages);
        assert_eq!(sent.iter().filter(|m| m.role == Role::System).count(), 1);
        assert_eq!(sent[0], Message::system(CODE_INSTRUCTION));
        assert_eq!(sent[1], Message::user("write a hello world"));
    }
}
