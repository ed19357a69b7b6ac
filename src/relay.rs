// Relay - wires clients, the upstream session, the router and the orchestrator together

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capabilities::{Capabilities, InMemoryMessageStore, OpenAiCapabilities};
use crate::clients::{ClientHandle, ClientRegistry};
use crate::error::RelayError;
use crate::orchestrator::{LanguageRolePolicy, TranslationOrchestrator};
use crate::protocol::{ClientInbound, ClientOutbound, StatusPayload, UpstreamStatus};
use crate::router::EventRouter;
use crate::settings::Settings;
use crate::upstream::{UpstreamConnector, UpstreamSession, WebSocketConnector};

/// Snapshot served by the health endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatus {
    pub upstream: UpstreamStatus,
    pub clients: usize,
    pub conversations: usize,
    pub pending_utterances: usize,
}

pub struct Relay {
    registry: Arc<ClientRegistry>,
    session: Arc<UpstreamSession>,
    orchestrator: Arc<TranslationOrchestrator>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    /// Held across a registry change and the session start/stop it implies
    lifecycle: Mutex<()>,
}

impl Relay {
    /// Build a relay around the given connector and capabilities
    ///
    /// Must be called from within a tokio runtime; the event router task
    /// starts immediately.
    pub fn new(
        settings: &Settings,
        connector: Arc<dyn UpstreamConnector>,
        capabilities: Capabilities,
    ) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = UpstreamSession::new(
            settings.upstream.clone(),
            settings.transcoder.clone(),
            connector,
            registry.clone(),
            events_tx,
        );
        let orchestrator = Arc::new(TranslationOrchestrator::new(
            capabilities,
            registry.clone(),
            Arc::new(LanguageRolePolicy),
            settings.translation.patient_language.clone(),
        ));
        let router = Arc::new(EventRouter::new(
            registry.clone(),
            orchestrator.clone(),
            settings.server.forward_deltas,
        ));
        let router_task = router.spawn(events_rx);

        Arc::new(Self {
            registry,
            session,
            orchestrator,
            router_task: Mutex::new(Some(router_task)),
            lifecycle: Mutex::new(()),
        })
    }

    /// Production wiring: realtime websocket upstream, OpenAI HTTP
    /// capabilities and the in-memory message store
    pub fn from_settings(settings: &Settings) -> Arc<Self> {
        let connector = Arc::new(WebSocketConnector::new(
            &settings.upstream,
            settings.api_key.clone(),
        ));
        let openai = Arc::new(OpenAiCapabilities::new(settings));
        let capabilities = Capabilities {
            detector: openai.clone(),
            translator: openai.clone(),
            synthesizer: openai,
            store: Arc::new(InMemoryMessageStore::new()),
            call_timeout: settings.capabilities.call_timeout(),
        };
        Self::new(settings, connector, capabilities)
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<UpstreamSession> {
        &self.session
    }

    /// Register a client socket and acknowledge it
    ///
    /// The first client anywhere starts the upstream session.
    pub fn connect_client(&self, client: ClientHandle, conversation_id: &str) {
        let client_id = client.id;
        {
            let _lifecycle = self.lifecycle.lock();
            let first = self.registry.register(client, conversation_id);
            if first {
                self.session.ensure_started();
            }
        }
        log::info!(
            "Relay: Client {} joined {} ({} connected)",
            client_id,
            conversation_id,
            self.registry.client_count()
        );
        self.registry.send_to(
            client_id,
            &ClientOutbound::BackendConnected {
                payload: StatusPayload {
                    status: self.session.status(),
                },
            },
        );
    }

    /// Handle one text frame from a client
    ///
    /// Protocol errors are reported to that client only. Audio waits while
    /// the transcoder input is backed up.
    pub async fn handle_client_text(&self, client_id: Uuid, raw: &str) {
        if let Err(e) = self.dispatch(raw).await {
            log::warn!("Relay: Frame from {} rejected: {}", client_id, e);
            self.registry
                .send_to(client_id, &ClientOutbound::error(e.to_string()));
        }
    }

    async fn dispatch(&self, raw: &str) -> Result<(), RelayError> {
        match ClientInbound::parse(raw)? {
            ClientInbound::AudioAppend { audio } => {
                let chunk = BASE64
                    .decode(audio.as_bytes())
                    .map_err(|e| RelayError::Protocol(format!("audio is not base64: {}", e)))?;
                if chunk.is_empty() {
                    return Ok(());
                }
                match self.session.write_audio(chunk).await {
                    Err(RelayError::UpstreamNotReady) => {
                        log::debug!("Relay: Upstream not ready, dropping audio chunk");
                        Ok(())
                    }
                    // Transport failures were already broadcast by the session
                    Err(e) if e.is_transport() => Ok(()),
                    other => other,
                }
            }
            ClientInbound::AudioFinalize => {
                if !self.session.finalize_audio() {
                    log::debug!("Relay: Finalize with no open audio input");
                }
                Ok(())
            }
        }
    }

    /// Remove a client; the last one out stops the upstream session
    pub fn disconnect_client(&self, client_id: Uuid) {
        let _lifecycle = self.lifecycle.lock();
        let Some(outcome) = self.registry.unregister(client_id) else {
            return;
        };
        log::info!(
            "Relay: Client {} left {}{}",
            client_id,
            outcome.conversation_id,
            if outcome.conversation_empty { " (conversation empty)" } else { "" }
        );
        if outcome.registry_empty {
            self.session.stop();
        }
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            upstream: self.session.status(),
            clients: self.registry.client_count(),
            conversations: self.registry.conversation_count(),
            pending_utterances: self.orchestrator.pending_count(),
        }
    }

    /// Stop the upstream session and the router. Safe to call more than once.
    pub fn shutdown(&self) {
        log::info!("Relay: Shutting down");
        {
            let _lifecycle = self.lifecycle.lock();
            self.session.stop();
        }
        if let Some(task) = self.router_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, FakeDetector, FakeTranslator, Fakes, TranslatorMode};
    use crate::upstream::connector::fake::{FakeConnector, FakeLink};
    use crate::upstream::SessionState;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(3);

    struct Setup {
        relay: Arc<Relay>,
        connector: Arc<FakeConnector>,
        links: mpsc::UnboundedReceiver<FakeLink>,
        fakes: Fakes,
    }

    fn setup() -> Setup {
        let mut settings = Settings::default();
        settings.upstream.reconnect_base_ms = 20;
        settings.transcoder.program = "cat".to_string();
        settings.transcoder.args = Vec::new();

        let (connector, links) = FakeConnector::new();
        let (capabilities, fakes) = test_support::capabilities(
            FakeDetector::returning("es"),
            FakeTranslator::new(TranslatorMode::Tagged),
        );
        let relay = Relay::new(&settings, connector.clone(), capabilities);
        Setup {
            relay,
            connector,
            links,
            fakes,
        }
    }

    fn client() -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(tx), rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let raw = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    /// Wait for a client frame of the given type, skipping others
    async fn frame_of_type(rx: &mut mpsc::UnboundedReceiver<String>, ty: &str) -> serde_json::Value {
        loop {
            let frame = next_frame(rx).await;
            if frame["type"] == ty {
                return frame;
            }
        }
    }

    async fn wait_state(relay: &Relay, want: SessionState) {
        let mut rx = relay.session().subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_client_starts_upstream_once() {
        let mut s = setup();
        let (a, mut rx_a) = client();
        let (b, _rx_b) = client();

        s.relay.connect_client(a, "c1");
        let ack = next_frame(&mut rx_a).await;
        assert_eq!(ack["type"], "backend_connected");
        assert_eq!(ack["payload"]["status"], "openai_connecting");

        s.relay.connect_client(b, "c1");
        let _link = tokio::time::timeout(WAIT, s.links.recv()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.connector.connects(), 1);
        assert_eq!(s.relay.status().clients, 2);
    }

    #[tokio::test]
    async fn test_last_client_out_stops_upstream() {
        let mut s = setup();
        let (a, _rx_a) = client();
        let (b, _rx_b) = client();
        let (a_id, b_id) = (a.id, b.id);
        s.relay.connect_client(a, "c1");
        s.relay.connect_client(b, "c2");

        let link = tokio::time::timeout(WAIT, s.links.recv()).await.unwrap().unwrap();
        link.ready().await;
        wait_state(&s.relay, SessionState::Connected).await;

        s.relay.disconnect_client(a_id);
        assert_eq!(s.relay.session().state(), SessionState::Connected);

        s.relay.disconnect_client(b_id);
        assert_eq!(s.relay.session().state(), SessionState::Idle);
        assert_eq!(s.relay.status().upstream, UpstreamStatus::OpenaiDisconnected);
    }

    #[tokio::test]
    async fn test_malformed_frames_answered_to_sender_only() {
        let s = setup();
        let (a, mut rx_a) = client();
        let (b, mut rx_b) = client();
        let a_id = a.id;
        s.relay.connect_client(a, "c1");
        s.relay.connect_client(b, "c1");
        test_support::drain_types(&mut rx_a);
        test_support::drain_types(&mut rx_b);

        s.relay.handle_client_text(a_id, "{not json").await;
        s.relay
            .handle_client_text(a_id, r#"{"type":"input_audio_buffer.append","audio":"***"}"#)
            .await;

        assert_eq!(test_support::drain_types(&mut rx_a), vec!["error", "error"]);
        assert!(test_support::drain_types(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_audio_before_connected_is_dropped_quietly() {
        let s = setup();
        let (a, mut rx_a) = client();
        let a_id = a.id;
        s.relay.connect_client(a, "c1");
        test_support::drain_types(&mut rx_a);

        s.relay
            .handle_client_text(a_id, r#"{"type":"input_audio_buffer.append","audio":"AAEC"}"#)
            .await;
        s.relay.handle_client_text(a_id, r#"{"type":"input_audio_buffer.finalize"}"#).await;

        assert!(test_support::drain_types(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_utterance() {
        let mut s = setup();
        let (a, mut rx_a) = client();
        let a_id = a.id;
        s.relay.connect_client(a, "c1");

        let mut link = tokio::time::timeout(WAIT, s.links.recv()).await.unwrap().unwrap();
        link.ready().await;
        frame_of_type(&mut rx_a, "openai_connected").await;

        s.relay
            .handle_client_text(a_id, r#"{"type":"input_audio_buffer.append","audio":"AAEC"}"#)
            .await;
        s.relay.handle_client_text(a_id, r#"{"type":"input_audio_buffer.finalize"}"#).await;

        let mut upstream_types = Vec::new();
        while upstream_types.last().map(String::as_str) != Some("input_audio_buffer.commit") {
            let raw = tokio::time::timeout(WAIT, link.sent.recv()).await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            upstream_types.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(upstream_types[0], "transcription_session.update");
        assert!(upstream_types.contains(&"input_audio_buffer.append".to_string()));

        link.emit(r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"me duele"}"#)
            .await;

        let original = frame_of_type(&mut rx_a, "new_message").await;
        assert_eq!(original["payload"]["kind"], "original");
        assert_eq!(original["payload"]["role"], "patient");
        let translation = next_frame(&mut rx_a).await;
        assert_eq!(translation["payload"]["kind"], "translation");
        let audio = next_frame(&mut rx_a).await;
        assert_eq!(audio["type"], "tts_audio");
        assert_eq!(audio["payload"]["originalMessageId"], original["payload"]["id"]);

        assert_eq!(s.fakes.store.messages("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut s = setup();
        let (a, _rx_a) = client();
        s.relay.connect_client(a, "c1");
        let link = tokio::time::timeout(WAIT, s.links.recv()).await.unwrap().unwrap();
        link.ready().await;
        wait_state(&s.relay, SessionState::Connected).await;

        s.relay.shutdown();
        s.relay.shutdown();
        assert_eq!(s.relay.session().state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_keeps_upstream() {
        let s = setup();
        for _ in 0..200 {
            let (a, _rx_a) = client();
            let (b, _rx_b) = client();
            let (a_id, b_id) = (a.id, b.id);
            s.relay.connect_client(a, "c1");

            let leaving = {
                let relay = s.relay.clone();
                tokio::spawn(async move { relay.disconnect_client(a_id) })
            };
            let joining = {
                let relay = s.relay.clone();
                tokio::spawn(async move { relay.connect_client(b, "c2") })
            };
            leaving.await.unwrap();
            joining.await.unwrap();

            assert_eq!(s.relay.status().clients, 1);
            assert_ne!(s.relay.session().state(), SessionState::Idle);

            s.relay.disconnect_client(b_id);
            assert_eq!(s.relay.session().state(), SessionState::Idle);
        }
    }
}
