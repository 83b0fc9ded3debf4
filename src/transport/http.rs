//! HTTP delivery
//!
//! Outbound contract: `POST {subscription url}` with
//! `Content-Type: application/json` and the serialized payload as the body,
//! no envelope. Success is status 200 and nothing else; any other status or
//! transport failure is a [`DeliveryError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};

use crate::config::DeliverySettings;
use crate::utils::DeliveryError;

/// Hands one serialized payload to one subscriber.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, url: &str, body: &[u8]) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct HttpDeliverer {
    client: Client,
}

impl HttpDeliverer {
    /// Build a client whose every request is bounded by the given timeouts.
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_settings(settings: &DeliverySettings) -> Result<Self, reqwest::Error> {
        Self::new(
            Duration::from_millis(settings.request_timeout_ms),
            Duration::from_millis(settings.connect_timeout_ms),
        )
    }
}

#[async_trait]
impl Deliver for HttpDeliverer {
    async fn deliver(&self, url: &str, body: &[u8]) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(DeliveryError::Status(status.as_u16())),
        }
    }
}
