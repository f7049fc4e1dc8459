use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_config::Config;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("messaging not configured: {0}")]
    Config(String),
    #[error("send failed after {attempts} attempts: {reason}")]
    Exhausted { attempts: usize, reason: String },
}

#[async_trait]
pub trait MessagingTransport: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<Value, TransportError>;
}

pub fn build_transport(cfg: &Config) -> Result<Arc<dyn MessagingTransport>, String> {
    match cfg.messaging.mode.as_str() {
        "waha" => Ok(Arc::new(WahaTransport::new(cfg)?)),
        _ => Ok(Arc::new(LogTransport)),
    }
}

/// Only logs; the caller still records the outbound message.
pub struct LogTransport;

#[async_trait]
impl MessagingTransport for LogTransport {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<Value, TransportError> {
        tracing::info!(chat_id, chars = text.chars().count(), "outbound message (log transport)");
        Ok(json!({"status": "logged"}))
    }
}

pub struct WahaTransport {
    client: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    session: String,
    retries: usize,
    retry_backoff: Duration,
}

impl WahaTransport {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.messaging.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: cfg
                .messaging
                .base_url
                .as_deref()
                .map(|v| v.trim_end_matches('/').to_string()),
            api_key: cfg.messaging.api_key.clone(),
            session: cfg.messaging.session.clone(),
            retries: cfg.messaging.retries,
            retry_backoff: Duration::from_millis(cfg.messaging.retry_backoff_ms),
        })
    }
}

#[async_trait]
impl MessagingTransport for WahaTransport {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<Value, TransportError> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| TransportError::Config("messaging.base_url is not set".to_string()))?;
        let url = format!("{base_url}/api/sendText");
        let payload = json!({"chatId": chat_id, "text": text, "session": self.session});
        let attempts = self.retries + 1;
        let mut last_failure = String::from("no attempt made");

        for attempt in 0..attempts {
            let mut request = self.client.post(&url).json(&payload);
            if let Some(key) = &self.api_key {
                request = request.header("X-API-Key", key);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Ok(serde_json::from_str(&body)
                        .unwrap_or_else(|_| json!({"status_code": status, "text": body})));
                }
                Ok(response) => {
                    last_failure = format!("http {}", response.status().as_u16());
                }
                Err(e) => {
                    last_failure = e.to_string();
                }
            }
            tracing::warn!(
                attempt = attempt + 1,
                attempts,
                reason = %last_failure,
                "waha send_text failed"
            );
            if attempt + 1 < attempts && self.retry_backoff > Duration::ZERO {
                sleep(self.retry_backoff * (attempt as u32 + 1)).await;
            }
        }

        Err(TransportError::Exhausted {
            attempts,
            reason: last_failure,
        })
    }
}
