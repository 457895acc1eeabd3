//! Outbound operational notifications.

use crate::error::NotifyError;
use crate::model::{BatchId, StatementAudit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Publishes a message to a named channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, channel: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Message body sent when a batch closes or an invocation fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationBody {
    pub error: Option<String>,
    /// `ok` or `error`
    pub status: String,
    pub batchid: String,
    pub s3prefix: String,
    #[serde(
        rename = "loadStatements",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub load_statements: Option<BTreeMap<String, StatementAudit>>,
}

impl NotificationBody {
    pub fn ok(batch_id: &BatchId, prefix: &str, statements: BTreeMap<String, StatementAudit>) -> Self {
        Self {
            error: None,
            status: "ok".into(),
            batchid: batch_id.to_string(),
            s3prefix: prefix.to_string(),
            load_statements: Some(statements),
        }
    }

    pub fn error(
        batch_id: &BatchId,
        prefix: &str,
        error: impl Into<String>,
        statements: Option<BTreeMap<String, StatementAudit>>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            status: "error".into(),
            batchid: batch_id.to_string(),
            s3prefix: prefix.to_string(),
            load_statements: statements,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Subject line for the notification.
    pub fn subject(&self) -> String {
        if self.is_error() {
            format!("Batch Load {} Failure", self.batchid)
        } else {
            format!("Batch Load {} OK", self.batchid)
        }
    }
}

/// AWS SNS topics, the channel being the topic ARN.
pub struct SnsNotifier {
    client: aws_sdk_sns::Client,
}

impl SnsNotifier {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_sns::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn publish(&self, channel: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .publish()
            .topic_arn(channel)
            .subject(subject)
            .message(body)
            .send()
            .await
            .map_err(|e| NotifyError::PublishFailed {
                channel: channel.to_string(),
                message: aws_sdk_sns::error::DisplayErrorContext(&e).to_string(),
            })?;
        debug!(channel = %channel, message_id = ?response.message_id(), "Published notification");
        Ok(())
    }
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, channel: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(channel = %channel, subject = %subject, body = %body, "Notification");
        Ok(())
    }
}
