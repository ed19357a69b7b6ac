//! External capabilities the relay calls per utterance.
//!
//! Each capability is a trait object so deployments (and tests) can swap the
//! HTTP-backed implementations for their own.

pub mod memory_store;
pub mod openai;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::{MessageKind, MessageRecord, SpeakerRole};

pub use memory_store::InMemoryMessageStore;
pub use openai::OpenAiCapabilities;

#[async_trait]
pub trait LanguageDetector: Send + Sync {
    /// Best-effort language code for `text`; may be any casing or a full tag
    async fn detect_language(&self, text: &str) -> Result<String, RelayError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// `Ok(None)` means the capability produced no translation
    async fn translate(&self, text: &str, from: &str, to: &str)
        -> Result<Option<String>, RelayError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, RelayError>;

    /// Container format of the returned audio, e.g. "mp3"
    fn format(&self) -> &str;
}

/// A message to persist
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub text: String,
    pub role: SpeakerRole,
    pub language: String,
    pub kind: MessageKind,
    /// Set for translations: the original they were produced from
    pub original_message_id: Option<Uuid>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist_message(&self, message: NewMessage) -> Result<MessageRecord, RelayError>;
}

/// Everything the orchestrator needs to process one utterance
#[derive(Clone)]
pub struct Capabilities {
    pub detector: Arc<dyn LanguageDetector>,
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub store: Arc<dyn MessageStore>,
    /// Upper bound for any single capability call
    pub call_timeout: Duration,
}

/// Run a capability call with a deadline
pub async fn with_timeout<T, F>(
    capability: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(capability, limit)),
    }
}
