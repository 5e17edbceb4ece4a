//! HTTP transport for deployments where the broker sits behind a webhook.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, CONTENT_TYPE_JSON};
use crate::error::PublishError;
use crate::publisher::Publisher;

/// POSTs each envelope body to a fixed endpoint, with the routing metadata
/// as request headers.
///
/// A single `reqwest::Client` is built once and reused for every publish.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPublisher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(envelope.body.clone());
        for (name, value) in envelope.properties() {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PublishError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                message_id = %envelope.message_id,
                event_type = %envelope.event_type,
                status = status.as_u16(),
                "event endpoint rejected publish"
            );
            return Err(PublishError::Rejected {
                status: status.as_u16(),
            });
        }

        tracing::debug!(
            message_id = %envelope.message_id,
            event_type = %envelope.event_type,
            endpoint = %self.endpoint,
            "published event over http"
        );
        Ok(())
    }
}
