// TranslationOrchestrator - runs one finalized transcript through detect, persist,
// translate and speak

use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::capabilities::{with_timeout, Capabilities, NewMessage};
use crate::clients::ClientRegistry;
use crate::protocol::{ClientOutbound, MessageKind, MessageRecord, SpeakerRole};
use crate::synthesis::SynthesisBroadcaster;

pub const UNKNOWN_LANGUAGE: &str = "unknown";
const ENGLISH: &str = "en";

/// Decides who spoke an utterance
pub trait SpeakerRolePolicy: Send + Sync {
    fn classify(&self, language: &str) -> SpeakerRole;
}

/// English or undetectable speech is the clinician, anything else the patient.
///
/// Stands in for real diarization.
#[derive(Debug, Default, Clone, Copy)]
pub struct LanguageRolePolicy;

impl SpeakerRolePolicy for LanguageRolePolicy {
    fn classify(&self, language: &str) -> SpeakerRole {
        match language {
            ENGLISH | UNKNOWN_LANGUAGE => SpeakerRole::Clinician,
            _ => SpeakerRole::Patient,
        }
    }
}

/// Lowercase two-letter primary subtag, or `unknown`
pub fn normalize_language(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let primary = lowered.split(|c: char| c == '-' || c == '_').next().unwrap_or_default();
    if primary.len() == 2 && primary.chars().all(|c| c.is_ascii_alphabetic()) {
        primary.to_string()
    } else {
        UNKNOWN_LANGUAGE.to_string()
    }
}

/// Source and target language for an utterance, if it needs translating
fn translation_direction(
    role: SpeakerRole,
    language: &str,
    patient_language: &str,
) -> Option<(String, String)> {
    let source = if language == UNKNOWN_LANGUAGE {
        ENGLISH
    } else {
        language
    };
    let target = match role {
        SpeakerRole::Patient => ENGLISH,
        SpeakerRole::Clinician => patient_language,
    };
    (source != target).then(|| (source.to_string(), target.to_string()))
}

/// Scratch state for one utterance between its transcript and its audio
#[derive(Debug, Clone)]
struct PendingUtterance {
    conversation_id: String,
    language: Option<String>,
    role: Option<SpeakerRole>,
    original_id: Option<Uuid>,
    translated_text: Option<String>,
    received_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceOutcome {
    /// Audio was broadcast
    Spoken,
    /// Messages were broadcast but synthesis was skipped
    Silent,
    /// The original could not be persisted; nothing further happened
    Aborted,
}

#[derive(Debug, Clone)]
pub struct UtteranceReport {
    pub utterance_id: Uuid,
    pub language: String,
    pub role: SpeakerRole,
    pub original_id: Option<Uuid>,
    pub translation_id: Option<Uuid>,
    pub spoken_text: Option<String>,
    pub outcome: UtteranceOutcome,
}

pub struct TranslationOrchestrator {
    capabilities: Capabilities,
    registry: Arc<ClientRegistry>,
    synthesis: SynthesisBroadcaster,
    policy: Arc<dyn SpeakerRolePolicy>,
    patient_language: String,
    pending: DashMap<Uuid, PendingUtterance>,
}

impl TranslationOrchestrator {
    pub fn new(
        capabilities: Capabilities,
        registry: Arc<ClientRegistry>,
        policy: Arc<dyn SpeakerRolePolicy>,
        patient_language: String,
    ) -> Self {
        let synthesis = SynthesisBroadcaster::new(
            capabilities.synthesizer.clone(),
            registry.clone(),
            capabilities.call_timeout,
        );
        Self {
            capabilities,
            registry,
            synthesis,
            policy,
            patient_language: normalize_language(&patient_language),
            pending: DashMap::new(),
        }
    }

    /// Utterances currently between transcript and audio
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run the full pipeline for one completed transcript
    ///
    /// Broadcasts for this utterance go out in order: the original message,
    /// then the translation (if any), then the audio. Utterances processed
    /// concurrently do not share state.
    ///
    /// # Arguments
    /// * `conversation_id` - Routing target the transcript was attributed to
    /// * `text` - Non-empty transcript
    pub async fn process_utterance(&self, conversation_id: &str, text: &str) -> UtteranceReport {
        let utterance_id = Uuid::new_v4();
        self.pending.insert(
            utterance_id,
            PendingUtterance {
                conversation_id: conversation_id.to_string(),
                language: None,
                role: None,
                original_id: None,
                translated_text: None,
                received_at: Instant::now(),
            },
        );

        let report = self.run(utterance_id, conversation_id, text).await;

        if let Some((_, pending)) = self.pending.remove(&utterance_id) {
            log::info!(
                "TranslationOrchestrator: Utterance {} in {} finished as {:?} after {:?} (translated: {})",
                utterance_id,
                pending.conversation_id,
                report.outcome,
                pending.received_at.elapsed(),
                pending.translated_text.is_some()
            );
        }
        report
    }

    async fn run(&self, utterance_id: Uuid, conversation_id: &str, text: &str) -> UtteranceReport {
        let timeout = self.capabilities.call_timeout;

        // 1. Detect
        let language = match with_timeout(
            "detect_language",
            timeout,
            self.capabilities.detector.detect_language(text),
        )
        .await
        {
            Ok(raw) => normalize_language(&raw),
            Err(e) => {
                log::warn!("TranslationOrchestrator: Language detection failed: {}", e);
                UNKNOWN_LANGUAGE.to_string()
            }
        };

        // 2. Classify
        let role = self.policy.classify(&language);
        if let Some(mut pending) = self.pending.get_mut(&utterance_id) {
            pending.language = Some(language.clone());
            pending.role = Some(role);
        }

        let mut report = UtteranceReport {
            utterance_id,
            language: language.clone(),
            role,
            original_id: None,
            translation_id: None,
            spoken_text: None,
            outcome: UtteranceOutcome::Aborted,
        };

        // 3. Persist and broadcast the original
        let original = NewMessage {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            role,
            language: language.clone(),
            kind: MessageKind::Original,
            original_message_id: None,
        };
        let original = match self.persist(original).await {
            Some(record) => record,
            None => return report,
        };
        report.original_id = Some(original.id);
        if let Some(mut pending) = self.pending.get_mut(&utterance_id) {
            pending.original_id = Some(original.id);
        }

        // 4/5. Translate, persist and broadcast the translation
        let mut spoken = text.to_string();
        if let Some((from, to)) = translation_direction(role, &language, &self.patient_language) {
            if let Some(translation) = self.translate(text, &from, &to).await {
                let message = NewMessage {
                    conversation_id: conversation_id.to_string(),
                    text: translation.clone(),
                    role,
                    language: to,
                    kind: MessageKind::Translation,
                    original_message_id: Some(original.id),
                };
                // An unsaved translation is never spoken
                if let Some(record) = self.persist(message).await {
                    report.translation_id = Some(record.id);
                    if let Some(mut pending) = self.pending.get_mut(&utterance_id) {
                        pending.translated_text = Some(translation.clone());
                    }
                    spoken = translation;
                }
            }
        }

        // 6. Speak
        let sent = self
            .synthesis
            .synthesize_and_send(&spoken, conversation_id, original.id)
            .await;
        report.spoken_text = Some(spoken);
        report.outcome = if sent {
            UtteranceOutcome::Spoken
        } else {
            UtteranceOutcome::Silent
        };
        report
    }

    async fn translate(&self, text: &str, from: &str, to: &str) -> Option<String> {
        let result = with_timeout(
            "translate",
            self.capabilities.call_timeout,
            self.capabilities.translator.translate(text, from, to),
        )
        .await;

        match result {
            Ok(Some(translated)) if !translated.trim().is_empty() => Some(translated),
            Ok(_) => {
                log::warn!(
                    "TranslationOrchestrator: No translation {} -> {}, speaking original",
                    from,
                    to
                );
                None
            }
            Err(e) => {
                log::warn!(
                    "TranslationOrchestrator: Translation {} -> {} failed, speaking original: {}",
                    from,
                    to,
                    e
                );
                None
            }
        }
    }

    /// Persist and broadcast; on failure notify the conversation and return None
    async fn persist(&self, message: NewMessage) -> Option<MessageRecord> {
        let conversation_id = message.conversation_id.clone();
        let kind = message.kind;
        let result = with_timeout(
            "persist_message",
            self.capabilities.call_timeout,
            self.capabilities.store.persist_message(message),
        )
        .await;

        match result {
            Ok(record) => {
                self.registry.broadcast(
                    &conversation_id,
                    &ClientOutbound::NewMessage {
                        payload: record.clone(),
                    },
                );
                Some(record)
            }
            Err(e) => {
                log::error!("TranslationOrchestrator: Failed to persist {:?} message: {}", kind, e);
                self.registry.broadcast(
                    &conversation_id,
                    &ClientOutbound::error("Failed to save message"),
                );
                None
            }
        }
    }
}
