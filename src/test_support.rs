//! Capability fakes shared by the orchestrator, router and relay tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::capabilities::{
    Capabilities, InMemoryMessageStore, LanguageDetector, MessageStore, NewMessage,
    SpeechSynthesizer, Translator,
};
use crate::error::RelayError;
use crate::protocol::MessageRecord;

/// Detects a fixed language, or a per-text override
pub struct FakeDetector {
    pub default: Result<String, ()>,
    pub overrides: Vec<(String, String)>,
}

impl FakeDetector {
    pub fn returning(language: &str) -> Self {
        Self {
            default: Ok(language.to_string()),
            overrides: Vec::new(),
        }
    }

    pub fn failing() -> Self {
        Self {
            default: Err(()),
            overrides: Vec::new(),
        }
    }
}

#[async_trait]
impl LanguageDetector for FakeDetector {
    async fn detect_language(&self, text: &str) -> Result<String, RelayError> {
        if let Some((_, language)) = self.overrides.iter().find(|(t, _)| t == text) {
            return Ok(language.clone());
        }
        self.default
            .clone()
            .map_err(|_| RelayError::capability("detect_language", "unavailable"))
    }
}

pub enum TranslatorMode {
    /// Prefix the text with the target code, e.g. "[en] hola"
    Tagged,
    Nothing,
    Fail,
}

pub struct FakeTranslator {
    pub mode: TranslatorMode,
    pub delay: Duration,
    pub calls: Mutex<Vec<(String, String, String)>>,
}

impl FakeTranslator {
    pub fn new(mode: TranslatorMode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(
        &self,
        text: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<String>, RelayError> {
        self.calls
            .lock()
            .push((text.to_string(), from.to_string(), to.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.mode {
            TranslatorMode::Tagged => Ok(Some(format!("[{}] {}", to, text))),
            TranslatorMode::Nothing => Ok(None),
            TranslatorMode::Fail => Err(RelayError::capability("translate", "503")),
        }
    }
}

/// Returns the text's bytes as "audio" and remembers what it spoke
#[derive(Default)]
pub struct RecordingSynthesizer {
    pub spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, RelayError> {
        self.spoken.lock().push(text.to_string());
        Ok(text.as_bytes().to_vec())
    }

    fn format(&self) -> &str {
        "mp3"
    }
}

pub struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn persist_message(&self, _message: NewMessage) -> Result<MessageRecord, RelayError> {
        Err(RelayError::capability("persist_message", "database unavailable"))
    }
}

pub struct Fakes {
    pub translator: Arc<FakeTranslator>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub store: Arc<InMemoryMessageStore>,
}

/// Capabilities with an in-memory store; returns handles for assertions
pub fn capabilities(detector: FakeDetector, translator: FakeTranslator) -> (Capabilities, Fakes) {
    let translator = Arc::new(translator);
    let synthesizer = Arc::new(RecordingSynthesizer::default());
    let store = Arc::new(InMemoryMessageStore::new());
    let capabilities = Capabilities {
        detector: Arc::new(detector),
        translator: translator.clone(),
        synthesizer: synthesizer.clone(),
        store: store.clone(),
        call_timeout: Duration::from_secs(2),
    };
    (
        capabilities,
        Fakes {
            translator,
            synthesizer,
            store,
        },
    )
}

/// Frame `type` values received so far
pub fn drain_types(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        types.push(value["type"].as_str().unwrap_or_default().to_string());
    }
    types
}
