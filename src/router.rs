// EventRouter - dispatches parsed provider events to clients and the orchestrator

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clients::ClientRegistry;
use crate::orchestrator::{TranslationOrchestrator, UtteranceReport};
use crate::protocol::{ClientOutbound, DeltaPayload, TranscriptEvent, TranscriptKind};

/// Shown to clients for provider-side errors; details stay in the log
const PROCESSING_ERROR_NOTICE: &str = "Transcription service reported a processing error";

pub struct EventRouter {
    registry: Arc<ClientRegistry>,
    orchestrator: Arc<TranslationOrchestrator>,
    forward_deltas: bool,
}

impl EventRouter {
    pub fn new(
        registry: Arc<ClientRegistry>,
        orchestrator: Arc<TranslationOrchestrator>,
        forward_deltas: bool,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            forward_deltas,
        }
    }

    /// Route events until the session side of the channel goes away
    pub fn spawn(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TranscriptEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.route(event);
            }
            log::debug!("EventRouter: Event stream closed");
        })
    }

    /// Dispatch one event
    ///
    /// Completed transcripts run on their own task so a slow utterance never
    /// holds up the next one.
    ///
    /// # Returns
    /// The utterance task for a routed `completed` event, otherwise `None`
    pub fn route(&self, event: TranscriptEvent) -> Option<JoinHandle<UtteranceReport>> {
        match event.kind {
            TranscriptKind::SessionCreated => {
                log::info!("EventRouter: Provider session created ({})", event.event_type);
                None
            }
            TranscriptKind::Delta => {
                self.forward_delta(event);
                None
            }
            TranscriptKind::Completed => self.dispatch_completed(event),
            TranscriptKind::Error => {
                log::error!(
                    "EventRouter: Provider error: {}",
                    event.text.as_deref().unwrap_or("(no message)")
                );
                match self.registry.pick_routing_target() {
                    Some(target) => {
                        self.registry.broadcast(
                            &target,
                            &ClientOutbound::error(PROCESSING_ERROR_NOTICE),
                        );
                    }
                    None => log::warn!("EventRouter: No conversation to report provider error to"),
                }
                None
            }
            TranscriptKind::Other => {
                log::debug!("EventRouter: Ignoring {}", event.event_type);
                None
            }
        }
    }

    fn forward_delta(&self, event: TranscriptEvent) {
        if !self.forward_deltas {
            return;
        }
        let Some(text) = event.text.filter(|t| !t.is_empty()) else {
            return;
        };
        if let Some(target) = self.registry.pick_routing_target() {
            self.registry.broadcast(
                &target,
                &ClientOutbound::TranscriptDelta {
                    payload: DeltaPayload {
                        text,
                        item_id: event.item_id,
                    },
                },
            );
        }
    }

    fn dispatch_completed(&self, event: TranscriptEvent) -> Option<JoinHandle<UtteranceReport>> {
        let text = event.text.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            log::debug!("EventRouter: Dropping empty transcript");
            return None;
        }

        let Some(target) = self.registry.pick_routing_target() else {
            log::warn!(
                "EventRouter: Dropping transcript ({} chars), no conversation registered",
                text.len()
            );
            return None;
        };

        log::info!("EventRouter: Transcript for {}: {} chars", target, text.len());
        let orchestrator = self.orchestrator.clone();
        Some(tokio::spawn(async move {
            orchestrator.process_utterance(&target, &text).await
        }))
    }
}
