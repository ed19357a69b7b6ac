// OpenAiCapabilities - language detection, translation and speech over the OpenAI HTTP API

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::capabilities::{LanguageDetector, SpeechSynthesizer, Translator};
use crate::error::RelayError;
use crate::settings::Settings;

const ERROR_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct OpenAiCapabilities {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    chat_model: String,
    speech_model: String,
    voice: String,
    format: String,
}

impl OpenAiCapabilities {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(settings.capabilities.call_timeout() + Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_key: settings.api_key.clone(),
            base_url: settings
                .capabilities
                .api_base_url
                .trim_end_matches('/')
                .to_string(),
            chat_model: settings.translation.model.clone(),
            speech_model: settings.synthesis.model.clone(),
            voice: settings.synthesis.voice.clone(),
            format: settings.synthesis.format.clone(),
        }
    }

    fn api_key(&self, capability: &'static str) -> Result<&str, RelayError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RelayError::capability(capability, "API key is missing"))
    }

    async fn post(
        &self,
        capability: &'static str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, RelayError> {
        let api_key = self.api_key(capability)?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(ERROR_PREVIEW_CHARS).collect();
            return Err(RelayError::capability(
                capability,
                format!("HTTP {}: {}", status, preview),
            ));
        }
        Ok(response)
    }

    async fn chat(
        &self,
        capability: &'static str,
        system: String,
        user: &str,
    ) -> Result<String, RelayError> {
        let body = json!({
            "model": self.chat_model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let response: ChatResponse = self
            .post(capability, "/chat/completions", body)
            .await?
            .json()
            .await?;

        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LanguageDetector for OpenAiCapabilities {
    async fn detect_language(&self, text: &str) -> Result<String, RelayError> {
        let system = "Identify the language of the user's message. Reply with only its \
                      ISO 639-1 code in lowercase, or 'unknown' if you cannot tell."
            .to_string();
        self.chat("detect_language", system, text).await
    }
}

#[async_trait]
impl Translator for OpenAiCapabilities {
    async fn translate(
        &self,
        text: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<String>, RelayError> {
        let system = format!(
            "You are a medical interpreter. Translate the user's message from '{}' to '{}'. \
             Reply with only the translation.",
            from, to
        );
        let translated = self.chat("translate", system, text).await?;
        Ok(Some(translated).filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiCapabilities {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, RelayError> {
        let body = json!({
            "model": self.speech_model,
            "voice": self.voice,
            "input": text,
            "response_format": self.format,
        });
        let bytes = self
            .post("synthesize", "/audio/speech", body)
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    fn format(&self) -> &str {
        &self.format
    }
}
