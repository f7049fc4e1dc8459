use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_config::Config;
use concierge_contracts::{LlmSettings, PlannerOutput};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;

const MIN_TEMPERATURE: f64 = 0.2;
const MAX_TEMPERATURE: f64 = 0.5;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm disabled")]
    Disabled,
    #[error("llm transport failed: {0}")]
    Transport(String),
    #[error("llm output rejected: {0}")]
    InvalidOutput(String),
}

/// Produces a structured plan. Failures never escape: they degrade to the fallback plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn generate_structured(
        &self,
        settings: &LlmSettings,
        system_prompt: &str,
        user_text: &str,
        context: &str,
    ) -> PlannerOutput;
}

#[async_trait]
pub trait TextLlm: Send + Sync {
    async fn generate_text(
        &self,
        settings: &LlmSettings,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Option<String>;
}

pub struct LlmClients {
    pub planner: Arc<dyn Planner>,
    pub text: Arc<dyn TextLlm>,
}

pub fn build_llm(cfg: &Config) -> Result<LlmClients, String> {
    if cfg.llm.mode == "ollama" {
        let client = Arc::new(OllamaClient::new(cfg)?);
        return Ok(LlmClients {
            planner: client.clone(),
            text: client,
        });
    }
    Ok(LlmClients {
        planner: Arc::new(DisabledLlm),
        text: Arc::new(DisabledLlm),
    })
}

pub struct DisabledLlm;

#[async_trait]
impl Planner for DisabledLlm {
    async fn generate_structured(
        &self,
        _settings: &LlmSettings,
        _system_prompt: &str,
        _user_text: &str,
        _context: &str,
    ) -> PlannerOutput {
        PlannerOutput::fallback()
    }
}

#[async_trait]
impl TextLlm for DisabledLlm {
    async fn generate_text(
        &self,
        _settings: &LlmSettings,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Option<String> {
        None
    }
}

pub struct OllamaClient {
    client: Client,
    base_url: Option<String>,
    retries: usize,
}

pub fn clamp_temperature(value: f64) -> f64 {
    value.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
}

pub fn planner_user_prompt(user_text: &str, context: &str) -> String {
    format!("Usuario: {user_text}\n\nContexto:\n{context}")
}

/// Parses the model's message content and rejects plans outside the allowed shape.
pub fn parse_planner_output(content: &str) -> Result<PlannerOutput, LlmError> {
    let output: PlannerOutput =
        serde_json::from_str(content).map_err(|e| LlmError::InvalidOutput(e.to_string()))?;
    if !output.is_well_formed() {
        return Err(LlmError::InvalidOutput(format!(
            "questions={} actions={}",
            output.questions.len(),
            output.actions.len()
        )));
    }
    Ok(output)
}

impl OllamaClient {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.llm.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: cfg
                .llm
                .base_url
                .as_deref()
                .map(|v| v.trim_end_matches('/').to_string()),
            retries: cfg.llm.retries,
        })
    }

    async fn chat(
        &self,
        settings: &LlmSettings,
        system_prompt: &str,
        user_prompt: &str,
        json_format: bool,
    ) -> Result<String, LlmError> {
        if settings.provider != "ollama" {
            return Err(LlmError::Disabled);
        }
        let base_url = self.base_url.as_deref().ok_or(LlmError::Disabled)?;
        let mut payload = json!({
            "model": settings.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "stream": false,
            "options": {
                "temperature": clamp_temperature(settings.temperature),
                "num_predict": settings.max_tokens,
            },
        });
        if json_format {
            payload["format"] = json!("json");
        }

        let url = format!("{base_url}/api/chat");
        let attempts = self.retries + 1;
        let mut last_failure = String::new();
        for attempt in 0..attempts {
            match self.client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    let body: Value = response
                        .json()
                        .await
                        .map_err(|e| LlmError::Transport(e.to_string()))?;
                    return Ok(body
                        .pointer("/message/content")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string());
                }
                Ok(response) => last_failure = format!("http {}", response.status().as_u16()),
                Err(e) => last_failure = e.to_string(),
            }
            tracing::warn!(attempt = attempt + 1, attempts, reason = %last_failure, "ollama chat failed");
            if attempt + 1 < attempts {
                sleep(RETRY_BACKOFF).await;
            }
        }
        Err(LlmError::Transport(last_failure))
    }
}

#[async_trait]
impl Planner for OllamaClient {
    async fn generate_structured(
        &self,
        settings: &LlmSettings,
        system_prompt: &str,
        user_text: &str,
        context: &str,
    ) -> PlannerOutput {
        let result = self
            .chat(
                settings,
                system_prompt,
                &planner_user_prompt(user_text, context),
                settings.json_mode,
            )
            .await
            .and_then(|content| parse_planner_output(&content));
        match result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, "planner degraded to fallback");
                PlannerOutput::fallback()
            }
        }
    }
}

#[async_trait]
impl TextLlm for OllamaClient {
    async fn generate_text(
        &self,
        settings: &LlmSettings,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Option<String> {
        match self.chat(settings, system_prompt, user_prompt, false).await {
            Ok(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, "text generation failed");
                None
            }
        }
    }
}
