// SynthesisBroadcaster - speaks the decided text and fans the audio out

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

use crate::capabilities::{with_timeout, SpeechSynthesizer};
use crate::clients::ClientRegistry;
use crate::protocol::{ClientOutbound, TtsAudioPayload};

pub struct SynthesisBroadcaster {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    registry: Arc<ClientRegistry>,
    call_timeout: Duration,
}

impl SynthesisBroadcaster {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        registry: Arc<ClientRegistry>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            registry,
            call_timeout,
        }
    }

    /// Synthesize `text` and broadcast it as `tts_audio` to the conversation
    ///
    /// Empty text, failed synthesis and empty audio are logged and skipped;
    /// no zero-length payload is ever broadcast.
    ///
    /// # Returns
    /// `true` if audio was broadcast
    pub async fn synthesize_and_send(
        &self,
        text: &str,
        conversation_id: &str,
        original_message_id: Uuid,
    ) -> bool {
        if text.trim().is_empty() {
            log::debug!("SynthesisBroadcaster: Nothing to speak for {}", original_message_id);
            return false;
        }

        let audio = match with_timeout(
            "synthesize",
            self.call_timeout,
            self.synthesizer.synthesize(text),
        )
        .await
        {
            Ok(audio) => audio,
            Err(e) => {
                log::warn!(
                    "SynthesisBroadcaster: Skipping audio for {}: {}",
                    original_message_id,
                    e
                );
                return false;
            }
        };

        if audio.is_empty() {
            log::warn!(
                "SynthesisBroadcaster: Synthesizer returned no audio for {}",
                original_message_id
            );
            return false;
        }

        let message = ClientOutbound::TtsAudio {
            payload: TtsAudioPayload {
                audio_base64: BASE64.encode(&audio),
                format: self.synthesizer.format().to_string(),
                original_message_id,
            },
        };
        let delivered = self.registry.broadcast(conversation_id, &message);
        log::debug!(
            "SynthesisBroadcaster: {} bytes of audio sent to {} client(s) of {}",
            audio.len(),
            delivered,
            conversation_id
        );
        true
    }
}
