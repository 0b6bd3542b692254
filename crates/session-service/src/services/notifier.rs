//! Member notification and session presentation.
//!
//! Delivery to end users is external. [`WebhookNotifier`] posts events to a
//! configured webhook; [`LogNotifier`] only logs them. Callers treat every
//! failure here as optional: it is logged and swallowed.

use crate::errors::SessionError;
use crate::models::{RosterMember, SessionWithRoster};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Default timeout for webhook requests in seconds.
const WEBHOOK_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `text` to a single member.
    async fn notify_member(&self, user_id: &str, text: &str) -> Result<(), SessionError>;

    /// Regenerate the externally visible representation of a session.
    async fn publish_session(&self, view: &SessionWithRoster) -> Result<(), SessionError>;
}

/// Notify every member in `members` with a per-member message.
///
/// Each delivery is independent; failures are logged and do not stop the
/// fan-out. Returns the number of successful deliveries.
pub async fn notify_each_member<F>(
    notifier: &dyn Notifier,
    members: &[RosterMember],
    build_message: F,
) -> usize
where
    F: Fn(&RosterMember) -> String + Send + Sync,
{
    let mut delivered = 0;
    for member in members {
        let text = build_message(member);
        match notifier.notify_member(&member.user_id, &text).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!(
                    target: "ss.services.notifier",
                    user_id = %member.user_id,
                    error = %e,
                    "Member notification failed"
                );
            }
        }
    }
    delivered
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WebhookEvent<'a> {
    MemberMessage { user_id: &'a str, text: &'a str },
    SessionUpdated { session: &'a SessionWithRoster },
}

/// Notifier posting JSON events to a webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    token: Option<SecretString>,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// Returns `SessionError::Internal` if the HTTP client cannot be built.
    pub fn new(url: String, token: Option<SecretString>) -> Result<Self, SessionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "ss.services.notifier", error = %e, "Failed to build HTTP client");
                SessionError::Internal(format!("failed to build webhook client: {e}"))
            })?;

        Ok(Self { client, url, token })
    }

    async fn post(&self, event: &WebhookEvent<'_>) -> Result<(), SessionError> {
        let mut request = self.client.post(&self.url).json(event);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            warn!(target: "ss.services.notifier", error = %e, "Webhook request failed");
            SessionError::ServiceUnavailable("Notification webhook is unavailable".to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            warn!(target: "ss.services.notifier", status = %status, "Webhook rejected event");
            Err(SessionError::ServiceUnavailable(format!(
                "Notification webhook returned {status}"
            )))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn notify_member(&self, user_id: &str, text: &str) -> Result<(), SessionError> {
        self.post(&WebhookEvent::MemberMessage { user_id, text })
            .await
    }

    #[instrument(skip_all, fields(session_id = %view.session.session_id))]
    async fn publish_session(&self, view: &SessionWithRoster) -> Result<(), SessionError> {
        self.post(&WebhookEvent::SessionUpdated { session: view })
            .await
    }
}

/// Notifier that only logs. Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_member(&self, user_id: &str, text: &str) -> Result<(), SessionError> {
        info!(target: "ss.services.notifier", user_id = %user_id, text = %text, "Member notification");
        Ok(())
    }

    async fn publish_session(&self, view: &SessionWithRoster) -> Result<(), SessionError> {
        info!(
            target: "ss.services.notifier",
            session_id = %view.session.session_id,
            status = %view.session.status,
            roster_size = view.roster.len(),
            "Session updated"
        );
        Ok(())
    }
}

/// Recording notifier for tests.
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        messages: Mutex<Vec<(String, String)>>,
        published: Mutex<Vec<SessionWithRoster>>,
        failing_users: Mutex<HashSet<String>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make deliveries to `user_id` fail.
        pub async fn fail_for(&self, user_id: &str) {
            self.failing_users.lock().await.insert(user_id.to_string());
        }

        /// Delivered `(user_id, text)` pairs in order.
        pub async fn messages(&self) -> Vec<(String, String)> {
            self.messages.lock().await.clone()
        }

        pub async fn published(&self) -> Vec<SessionWithRoster> {
            self.published.lock().await.clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_member(&self, user_id: &str, text: &str) -> Result<(), SessionError> {
            if self.failing_users.lock().await.contains(user_id) {
                return Err(SessionError::ServiceUnavailable(format!(
                    "delivery to {user_id} failed"
                )));
            }
            self.messages
                .lock()
                .await
                .push((user_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn publish_session(&self, view: &SessionWithRoster) -> Result<(), SessionError> {
            self.published.lock().await.push(view.clone());
            Ok(())
        }
    }
}
