//! Notice delivery

use crate::http;
use medic_core::{Notice, NoticeKind, Notifier, PortError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who gets notices and how
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Free-form addressee passed along with every notice
    pub recipient: Option<String>,
    /// POST target; the log notifier is used when absent
    pub webhook_url: Option<String>,
}

/// Writes notices to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    recipient: Option<String>,
}

impl LogNotifier {
    #[must_use]
    pub fn new(recipient: Option<String>) -> Self {
        Self { recipient }
    }
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), PortError> {
        let to = self.recipient.as_deref().unwrap_or("operators");
        match notice.kind {
            NoticeKind::Escalation => tracing::warn!(
                to,
                pipeline = %notice.pipeline_name,
                run_id = %notice.run_id,
                subject = %notice.subject,
                "\n{}",
                notice.body
            ),
            NoticeKind::Rerun => tracing::info!(
                to,
                pipeline = %notice.pipeline_name,
                run_id = %notice.run_id,
                subject = %notice.subject,
                "\n{}",
                notice.body
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient: Option<&'a str>,
}

/// POSTs notices as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    recipient: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        recipient: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PortError> {
        let url = url.into();
        reqwest::Url::parse(&url)
            .map_err(|e| PortError::Malformed(format!("invalid webhook url '{url}': {e}")))?;
        Ok(Self {
            http: http::client(timeout)?,
            url,
            recipient,
        })
    }

    fn payload<'a>(&'a self, notice: &'a Notice) -> WebhookPayload<'a> {
        WebhookPayload {
            subject: &notice.subject,
            text: &notice.body,
            recipient: self.recipient.as_deref(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), PortError> {
        http::send(self.http.post(&self.url).json(&self.payload(notice))).await?;
        tracing::debug!(pipeline = %notice.pipeline_name, "notice posted to webhook");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn notice() -> Notice {
        Notice {
            kind: NoticeKind::Escalation,
            pipeline_name: "Ingest".into(),
            run_id: "R1".into(),
            subject: "Pipeline failure escalation - Ingest".into(),
            body: "--- ESCALATION REQUIRED ---".into(),
        }
    }

    #[tokio::test]
    async fn log_notifier_always_accepts() {
        let notifier = LogNotifier::new(Some("data-oncall@example.com".into()));
        assert_eq!(notifier.notify(&notice()).await, Ok(()));
    }

    #[test]
    fn webhook_payload_shape() {
        let notifier = WebhookNotifier::new(
            "https://hooks.example.com/medic",
            Some("data-oncall".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let notice = notice();

        let json = serde_json::to_value(notifier.payload(&notice)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "subject": "Pipeline failure escalation - Ingest",
                "text": "--- ESCALATION REQUIRED ---",
                "recipient": "data-oncall"
            })
        );
    }

    #[test]
    fn webhook_rejects_invalid_url() {
        let err = WebhookNotifier::new("not a url", None, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, PortError::Malformed(_)));
    }
}
