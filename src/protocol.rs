// Wire protocol - client envelopes and upstream provider events

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::RelayError;
use crate::settings::UpstreamSettings;

/// Frames a client sends to the relay
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientInbound {
    /// One chunk of compressed audio, base64 encoded
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    /// End of the current utterance's audio
    #[serde(rename = "input_audio_buffer.finalize")]
    AudioFinalize,
}

impl ClientInbound {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw).map_err(|e| RelayError::Protocol(format!("client frame: {}", e)))
    }
}

/// Upstream connection status as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    OpenaiConnected,
    OpenaiConnecting,
    OpenaiDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    Clinician,
    Patient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Original,
    Translation,
}

/// A persisted utterance as returned by the message store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: String,
    pub role: SpeakerRole,
    pub language: String,
    pub text: String,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<Uuid>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPayload {
    pub status: UpstreamStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsAudioPayload {
    pub audio_base64: String,
    pub format: String,
    pub original_message_id: Uuid,
}

/// Frames the relay sends to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientOutbound {
    BackendConnected { payload: StatusPayload },
    OpenaiConnected { text: String },
    OpenaiDisconnected { text: String },
    TranscriptDelta { payload: DeltaPayload },
    NewMessage { payload: MessageRecord },
    TtsAudio { payload: TtsAudioPayload },
    Error { message: String },
}

impl ClientOutbound {
    pub fn error(message: impl Into<String>) -> Self {
        ClientOutbound::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    SessionCreated,
    Delta,
    Completed,
    Error,
    Other,
}

/// One event from the upstream provider, classified by its `type`
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub event_type: String,
    pub raw: Value,
    /// Delta text, completed transcript or error message depending on kind
    pub text: Option<String>,
    pub item_id: Option<String>,
}

impl TranscriptEvent {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| RelayError::Protocol(format!("upstream event is not JSON: {}", e)))?;

        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Protocol("upstream event has no type".to_string()))?
            .to_string();

        let kind = if event_type.ends_with("session.created") {
            TranscriptKind::SessionCreated
        } else if event_type.ends_with(".delta") {
            TranscriptKind::Delta
        } else if event_type.ends_with(".completed") {
            TranscriptKind::Completed
        } else if event_type == "error" {
            TranscriptKind::Error
        } else {
            TranscriptKind::Other
        };

        let text_field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        let text = match kind {
            TranscriptKind::Delta => text_field("delta"),
            TranscriptKind::Completed => text_field("transcript"),
            TranscriptKind::Error => value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some("Upstream processing error".to_string())),
            _ => None,
        };
        let item_id = text_field("item_id");

        Ok(Self {
            kind,
            event_type,
            raw: value,
            text,
            item_id,
        })
    }
}

/// Builds the one-shot transcription session configuration message
pub fn session_update(settings: &UpstreamSettings) -> String {
    let mut transcription = json!({
        "model": settings.transcription_model,
        "prompt": settings.prompt,
    });
    if let Some(language) = settings.language_hints.first() {
        transcription["language"] = json!(language);
    }

    json!({
        "type": "transcription_session.update",
        "session": {
            "input_audio_format": "pcm16",
            "input_audio_transcription": transcription,
            "turn_detection": {
                "type": "server_vad",
                "threshold": settings.vad_threshold,
                "prefix_padding_ms": settings.prefix_padding_ms,
                "silence_duration_ms": settings.silence_duration_ms,
            },
            "include": settings.include,
        }
    })
    .to_string()
}

pub fn audio_append(pcm: &[u8]) -> String {
    json!({
        "type": "input_audio_buffer.append",
        "audio": BASE64.encode(pcm),
    })
    .to_string()
}

pub fn audio_commit() -> String {
    json!({ "type": "input_audio_buffer.commit" }).to_string()
}
