//! Streaming chat client for the KASA assistant edge function, plus the
//! conversation container the caller owns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::Config;
use crate::error::{CoreResult, KasaError};
use crate::http_client::HttpClient;
use crate::model::{ChatMessage, Role};
use crate::normalizer::normalize_conversation;
use crate::sse::SseAccumulator;

/// Cooperative cancellation flag tied to one exchange. Checked before every
/// update callback so an abandoned request stops mutating observed state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Debug, Clone)]
pub struct AssistantClient {
    http: HttpClient,
    chat_url: String,
    publishable_key: SecretString,
}

impl AssistantClient {
    pub fn new(http: HttpClient, chat_url: String, publishable_key: SecretString) -> Self {
        Self {
            http,
            chat_url,
            publishable_key,
        }
    }

    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Ok(Self::new(
            HttpClient::from_cfg(&cfg.http)?,
            cfg.chat_url(),
            cfg.supabase.publishable_key()?,
        ))
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Self::new(
            HttpClient::new_default().unwrap(),
            format!("{server_base}/functions/v1/kasa-assistant"),
            SecretString::new("test-key".into()),
        )
    }

    /// Send the conversation so far and decode the streamed reply. Invokes
    /// `on_update` with the full accumulated content after each delta;
    /// invocations are strictly sequential. A cancelled token suppresses all
    /// further callbacks and stops reading.
    ///
    /// Fails with `ConnectionFailed` when the transport cannot be
    /// established, `TransportInterrupted` when the byte source errors
    /// mid-stream. Malformed individual payloads are never errors.
    pub async fn stream_chat(
        &self,
        history: &[ChatMessage],
        cancel: &CancelToken,
        mut on_update: impl FnMut(&str),
    ) -> CoreResult<String> {
        if history.is_empty() {
            return Err(KasaError::Validation("conversation history is empty".into()));
        }
        let messages = normalize_conversation(history.to_vec());
        if messages.is_empty() {
            return Err(KasaError::Validation(
                "conversation history has no non-empty messages".into(),
            ));
        }

        let payload = ChatPayload {
            messages: &messages,
        };
        let auth = format!("Bearer {}", self.publishable_key.expose_secret());
        let hdrs: &[(&str, &str)] = &[
            ("Authorization", auth.as_str()),
            ("Content-Type", "application/json"),
        ];

        let mut stream = self.http.post_stream(&self.chat_url, &payload, hdrs).await?;
        let mut acc = SseAccumulator::new();

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                tracing::debug!("chat exchange cancelled; dropping stream");
                break;
            }
            match item {
                Ok(chunk) => {
                    for snapshot in acc.feed(&chunk) {
                        if cancel.is_cancelled() {
                            break;
                        }
                        on_update(&snapshot);
                    }
                }
                Err(e) => {
                    acc.fail();
                    return Err(KasaError::TransportInterrupted(e.to_string()));
                }
            }
        }

        Ok(acc.finish().to_string())
    }
}

/// How one exchange was finalized. Callers that render update callbacks
/// incrementally must repaint from the final message on `FellBack`, since
/// anything already shown from a partial stream is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The streamed reply was kept as the final assistant message.
    Completed,
    /// A stream-fatal error replaced the reply with the fallback notice.
    FellBack,
}

/// The conversation a chat widget renders: an ordered message list opening
/// with the canned greeting. The streaming client only emits updates; this
/// container owns the presentation state.
#[derive(Debug, Clone)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
    fallback_message: String,
}

impl ChatSession {
    pub fn new(greeting: impl Into<String>, fallback_message: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::assistant(greeting)],
            fallback_message: fallback_message.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(&cfg.assistant.greeting, &cfg.assistant.fallback_message)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Run one exchange: append the empty assistant placeholder, stream into
    /// it, and finalize. Stream-fatal errors are caught here and replaced
    /// with the fixed fallback notice; partial content is discarded. The
    /// conversation always ends with exactly one finalized assistant message,
    /// and the returned outcome says which way it was finalized.
    pub async fn run(
        &mut self,
        client: &AssistantClient,
        cancel: &CancelToken,
        mut on_update: impl FnMut(&str),
    ) -> CoreResult<ExchangeOutcome> {
        let history = self.messages.clone();
        self.messages.push(ChatMessage::assistant(""));
        let idx = self.messages.len() - 1;

        let messages = &mut self.messages;
        let res = client
            .stream_chat(&history, cancel, |snapshot| {
                messages[idx].content = snapshot.to_string();
                on_update(snapshot);
            })
            .await;
        self.apply_outcome(idx, res)
    }

    fn apply_outcome(&mut self, idx: usize, res: CoreResult<String>) -> CoreResult<ExchangeOutcome> {
        match res {
            Ok(content) => {
                self.messages[idx].content = content;
                Ok(ExchangeOutcome::Completed)
            }
            Err(e) if e.is_stream_fatal() => {
                // No raw error detail reaches the user.
                tracing::error!(error = %e, "chat exchange failed");
                self.messages[idx].content = self.fallback_message.clone();
                Ok(ExchangeOutcome::FellBack)
            }
            Err(e) => {
                self.messages.remove(idx);
                Err(e)
            }
        }
    }

    /// True while the trailing message is an unfinalized placeholder.
    pub fn last_is_streaming_placeholder(&self) -> bool {
        self.messages
            .last()
            .map(|m| m.role == Role::Assistant && m.content.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    const GREETING: &str = "Hello! I'm the KASA AI Assistant.";
    const FALLBACK: &str = "Sorry, I encountered an error. Please try again.";

    fn sse_body(deltas: &[&str]) -> String {
        let mut body = String::new();
        for d in deltas {
            body.push_str(&format!(
                "data: {}\n\n",
                serde_json::json!({"choices":[{"delta":{"content": d}}]})
            ));
        }
        body.push_str("data: [DONE]\n");
        body
    }

    #[tokio::test]
    async fn stream_chat_accumulates_and_reports_updates() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/functions/v1/kasa-assistant")
                .header("Authorization", "Bearer test-key")
                .json_body_partial(r#"{"messages":[{"role":"user","content":"Hi"}]}"#);
            then.status(200)
                .header("Content-Type", "text/event-stream")
                .body(sse_body(&["Hel", "lo ", "there"]));
        });

        let client = AssistantClient::new_for_tests(&server.base_url());
        let mut updates = Vec::new();
        let content = client
            .stream_chat(
                &[ChatMessage::user("Hi")],
                &CancelToken::new(),
                |s| updates.push(s.to_string()),
            )
            .await
            .expect("stream ok");

        assert_eq!(content, "Hello there");
        assert_eq!(updates, vec!["Hel", "Hello ", "Hello there"]);
        m.assert();
    }

    #[tokio::test]
    async fn stream_chat_empty_history_is_validation_error() {
        let client = AssistantClient::new_for_tests("http://127.0.0.1:9");
        let err = client
            .stream_chat(&[], &CancelToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, KasaError::Validation(_)));
    }

    #[tokio::test]
    async fn stream_chat_non_success_is_connection_failed() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/functions/v1/kasa-assistant");
            then.status(401).body("unauthorized");
        });
        let client = AssistantClient::new_for_tests(&server.base_url());
        let err = client
            .stream_chat(&[ChatMessage::user("Hi")], &CancelToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KasaError::ConnectionFailed { status: Some(401) }
        ));
    }

    #[tokio::test]
    async fn cancelled_token_suppresses_callbacks() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/functions/v1/kasa-assistant");
            then.status(200)
                .header("Content-Type", "text/event-stream")
                .body(sse_body(&["never", " seen"]));
        });
        let client = AssistantClient::new_for_tests(&server.base_url());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut calls = 0usize;
        let _ = client
            .stream_chat(&[ChatMessage::user("Hi")], &cancel, |_| calls += 1)
            .await
            .expect("cancellation is not an error");
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn session_run_finalizes_single_assistant_message() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/functions/v1/kasa-assistant");
            then.status(200)
                .header("Content-Type", "text/event-stream")
                .body(sse_body(&["Permits ", "take 5 days."]));
        });

        let client = AssistantClient::new_for_tests(&server.base_url());
        let mut session = ChatSession::new(GREETING, FALLBACK);
        session.push_user("How long do permits take?");
        let before = session.messages().len();

        let outcome = session
            .run(&client, &CancelToken::new(), |_| {})
            .await
            .expect("run ok");

        assert_eq!(outcome, ExchangeOutcome::Completed);
        assert_eq!(session.messages().len(), before + 1);
        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Permits take 5 days.");
        assert!(!session.last_is_streaming_placeholder());
    }

    #[tokio::test]
    async fn session_placeholder_appears_during_streaming() {
        // The placeholder must be in place before the first byte arrives;
        // observe it from the first update callback.
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/functions/v1/kasa-assistant");
            then.status(200)
                .header("Content-Type", "text/event-stream")
                .body(sse_body(&["partial"]));
        });

        let client = AssistantClient::new_for_tests(&server.base_url());
        let mut session = ChatSession::new(GREETING, FALLBACK);
        session.push_user("Hi");
        assert!(!session.last_is_streaming_placeholder());

        let mut saw_update = false;
        session
            .run(&client, &CancelToken::new(), |s| {
                saw_update = true;
                assert_eq!(s, "partial");
            })
            .await
            .expect("run ok");
        assert!(saw_update);
    }

    #[tokio::test]
    async fn session_connection_failure_shows_fallback() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/functions/v1/kasa-assistant");
            then.status(500).body("boom");
        });

        let client = AssistantClient::new_for_tests(&server.base_url());
        let mut session = ChatSession::new(GREETING, FALLBACK);
        session.push_user("Hi");

        let outcome = session
            .run(&client, &CancelToken::new(), |_| {})
            .await
            .expect("fatal stream errors are absorbed");

        assert_eq!(outcome, ExchangeOutcome::FellBack);
        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, FALLBACK);
    }

    #[test]
    fn interrupted_stream_discards_partial_content() {
        // "Hel" already streamed when the transport drops; the outcome must
        // tell an incremental renderer to repaint with the fallback.
        let mut session = ChatSession::new(GREETING, FALLBACK);
        session.push_user("Hi");
        session.messages.push(ChatMessage::assistant("Hel"));
        let idx = session.messages.len() - 1;

        let outcome = session
            .apply_outcome(idx, Err(KasaError::TransportInterrupted("reset".into())))
            .expect("absorbed");
        assert_eq!(outcome, ExchangeOutcome::FellBack);
        assert_eq!(session.messages[idx].content, FALLBACK);
    }

    #[test]
    fn non_fatal_error_removes_placeholder_and_propagates() {
        let mut session = ChatSession::new(GREETING, FALLBACK);
        session.push_user("Hi");
        session.messages.push(ChatMessage::assistant(""));
        let idx = session.messages.len() - 1;
        let before = session.messages.len();

        let err = session
            .apply_outcome(idx, Err(KasaError::Validation("nope".into())))
            .unwrap_err();
        assert!(matches!(err, KasaError::Validation(_)));
        assert_eq!(session.messages.len(), before - 1);
    }

    #[test]
    fn session_opens_with_greeting() {
        let session = ChatSession::new(GREETING, FALLBACK);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Role::Assistant);
        assert_eq!(session.messages()[0].content, GREETING);
    }
}
