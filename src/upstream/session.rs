// UpstreamSession - the single provider connection, its transcoder and reconnect policy

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clients::ClientRegistry;
use crate::error::RelayError;
use crate::protocol::{self, ClientOutbound, TranscriptEvent, TranscriptKind, UpstreamStatus};
use crate::settings::{TranscoderSettings, UpstreamSettings};
use crate::transcoder::{AudioTranscoder, TranscoderEvent, TranscoderSignal};
use crate::upstream::backoff::ReconnectBackoff;
use crate::upstream::connector::{UpstreamConnector, UpstreamFrame, UpstreamLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
}

impl SessionState {
    pub fn status(self) -> UpstreamStatus {
        match self {
            SessionState::Connected => UpstreamStatus::OpenaiConnected,
            SessionState::Connecting => UpstreamStatus::OpenaiConnecting,
            SessionState::Idle | SessionState::Closing => UpstreamStatus::OpenaiDisconnected,
        }
    }
}

struct SessionInner {
    state: SessionState,
    /// Set from `ensure_started` until the attempt is ready or has failed
    connect_in_flight: bool,
    /// Bumped on every teardown; tasks holding an older value are stale
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    transcoder: Option<Arc<AudioTranscoder>>,
    next_transcoder_id: u64,
    backoff: ReconnectBackoff,
    cooldown_until: Option<Instant>,
    last_cooldown: Option<Duration>,
    connected_at: Option<Instant>,
    reconnect_timer: Option<JoinHandle<()>>,
}

/// Owns the one live provider connection per process.
///
/// State transitions happen under a single lock so that concurrent
/// `ensure_started` calls cannot open two connections, and every teardown
/// path (provider close, transcoder failure, `stop`) funnels through one
/// generation-checked routine.
pub struct UpstreamSession {
    upstream: UpstreamSettings,
    transcoder_settings: TranscoderSettings,
    connector: Arc<dyn UpstreamConnector>,
    registry: Arc<ClientRegistry>,
    events: mpsc::UnboundedSender<TranscriptEvent>,
    state_tx: watch::Sender<SessionState>,
    inner: Mutex<SessionInner>,
}

impl UpstreamSession {
    /// Create an idle session
    ///
    /// # Arguments
    /// * `upstream` - Provider configuration and reconnect policy
    /// * `transcoder_settings` - Subprocess started alongside each connection
    /// * `connector` - Opens provider connections
    /// * `registry` - Clients that receive lifecycle notices
    /// * `events` - Receives every parsed provider event
    pub fn new(
        upstream: UpstreamSettings,
        transcoder_settings: TranscoderSettings,
        connector: Arc<dyn UpstreamConnector>,
        registry: Arc<ClientRegistry>,
        events: mpsc::UnboundedSender<TranscriptEvent>,
    ) -> Arc<Self> {
        let backoff = ReconnectBackoff::new(upstream.reconnect_base(), upstream.reconnect_max());
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            upstream,
            transcoder_settings,
            connector,
            registry,
            events,
            state_tx,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                connect_in_flight: false,
                generation: 0,
                outbound: None,
                transcoder: None,
                next_transcoder_id: 1,
                backoff,
                cooldown_until: None,
                last_cooldown: None,
                connected_at: None,
                reconnect_timer: None,
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn status(&self) -> UpstreamStatus {
        self.state().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Delay chosen at the most recent unexpected close
    pub fn last_cooldown(&self) -> Option<Duration> {
        self.inner.lock().last_cooldown
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().backoff.attempts()
    }

    pub fn has_transcoder(&self) -> bool {
        self.inner.lock().transcoder.is_some()
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        if inner.state != state {
            log::debug!("UpstreamSession: {:?} -> {:?}", inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Start connecting unless a connection exists or is on its way
    ///
    /// Inside a cooldown window the attempt is deferred to a timer that
    /// fires when the window ends.
    pub fn ensure_started(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.connect_in_flight
            || inner.reconnect_timer.is_some()
            || matches!(inner.state, SessionState::Connecting | SessionState::Connected)
        {
            return;
        }

        if let Some(until) = inner.cooldown_until {
            if Instant::now() < until {
                log::info!(
                    "UpstreamSession: In cooldown, deferring connect by {:?}",
                    until - Instant::now()
                );
                self.arm_reconnect(&mut inner, until);
                return;
            }
        }

        inner.connect_in_flight = true;
        let generation = inner.generation;
        self.set_state(&mut inner, SessionState::Connecting);
        drop(inner);

        let session = self.clone();
        tokio::spawn(async move {
            session.run_connection(generation).await;
        });
    }

    fn arm_reconnect(self: &Arc<Self>, inner: &mut SessionInner, at: Instant) {
        let session = self.clone();
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            session.reconnect_due();
        }));
    }

    fn reconnect_due(self: &Arc<Self>) {
        self.inner.lock().reconnect_timer = None;
        if self.registry.is_empty() {
            log::info!("UpstreamSession: No clients left, skipping reconnect");
            return;
        }
        log::info!("UpstreamSession: Reconnecting");
        self.ensure_started();
    }

    async fn run_connection(self: Arc<Self>, generation: u64) {
        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                log::error!("UpstreamSession: Connect failed: {}", e);
                self.handle_disconnect(generation, None, e.to_string());
                return;
            }
        };

        let UpstreamLink { outbound, mut inbound } = link;
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                // Stopped while connecting; dropping the link closes it
                return;
            }
            inner.outbound = Some(outbound);
        }
        log::info!("UpstreamSession: Socket open, waiting for session acknowledgment");

        let ready_deadline = Instant::now() + self.upstream.ready_timeout();
        let mut acknowledged = false;
        loop {
            let frame = if acknowledged {
                inbound.recv().await
            } else {
                match tokio::time::timeout_at(ready_deadline, inbound.recv()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        let reason = format!(
                            "no session acknowledgment within {:?}",
                            self.upstream.ready_timeout()
                        );
                        log::error!("UpstreamSession: {}", reason);
                        self.handle_disconnect(generation, None, reason);
                        return;
                    }
                }
            };
            let Some(frame) = frame else {
                break;
            };

            match frame {
                UpstreamFrame::Text(text) => match TranscriptEvent::parse(&text) {
                    Ok(event) => {
                        if event.kind == TranscriptKind::SessionCreated {
                            acknowledged = true;
                            self.handle_ready(generation);
                        }
                        // Stale once stop() or a failure bumped the generation
                        if !self.is_current(generation) {
                            log::debug!(
                                "UpstreamSession: Dropping {} from a closed connection",
                                event.event_type
                            );
                            return;
                        }
                        let _ = self.events.send(event);
                    }
                    Err(e) => log::warn!("UpstreamSession: Dropping frame: {}", e),
                },
                UpstreamFrame::Closed { code, reason } => {
                    self.handle_disconnect(generation, code, reason);
                    return;
                }
            }
        }
        self.handle_disconnect(generation, None, "link dropped".to_string());
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    /// Provider acknowledged the session: configure, mark connected, start audio
    fn handle_ready(self: &Arc<Self>, generation: u64) {
        let failure = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != SessionState::Connecting {
                return;
            }

            let configured = inner
                .outbound
                .as_ref()
                .map(|tx| tx.try_send(protocol::session_update(&self.upstream)).is_ok())
                .unwrap_or(false);

            if configured {
                inner.connect_in_flight = false;
                inner.connected_at = Some(Instant::now());
                self.set_state(&mut inner, SessionState::Connected);
                self.start_transcoder(&mut inner, generation).err()
            } else {
                Some(RelayError::UpstreamConnect(
                    "could not send session configuration".to_string(),
                ))
            }
        };

        match failure {
            None => {
                log::info!("UpstreamSession: Connected");
                self.registry.broadcast_all(&ClientOutbound::OpenaiConnected {
                    text: "Connected to transcription service".to_string(),
                });
            }
            Some(e) => {
                log::error!("UpstreamSession: {}", e);
                self.registry
                    .broadcast_all(&ClientOutbound::error("Audio pipeline unavailable"));
                self.handle_disconnect(generation, None, e.to_string());
            }
        }
    }

    fn start_transcoder(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        generation: u64,
    ) -> Result<Arc<AudioTranscoder>, RelayError> {
        let id = inner.next_transcoder_id;
        inner.next_transcoder_id += 1;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transcoder = Arc::new(AudioTranscoder::start(&self.transcoder_settings, id, tx)?);
        inner.transcoder = Some(transcoder.clone());

        let session = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                session.on_transcoder_signal(generation, signal);
            }
        });
        Ok(transcoder)
    }

    fn on_transcoder_signal(self: &Arc<Self>, generation: u64, signal: TranscoderSignal) {
        {
            let mut inner = self.inner.lock();
            let current = inner.transcoder.as_ref().map(|t| t.id());
            if inner.generation != generation || current != Some(signal.transcoder_id) {
                return;
            }
            if signal.event == TranscoderEvent::Finished {
                inner.transcoder = None;
            }
        }

        match signal.event {
            TranscoderEvent::Output(pcm) => {
                if let Err(e) = self.send(protocol::audio_append(&pcm)) {
                    log::warn!("UpstreamSession: Dropping {} PCM bytes: {}", pcm.len(), e);
                }
            }
            TranscoderEvent::Finished => {
                if let Err(e) = self.send(protocol::audio_commit()) {
                    log::error!("UpstreamSession: Commit not sent: {}", e);
                }
            }
            TranscoderEvent::Failed(reason) => {
                let e = RelayError::TranscoderFailed(reason);
                log::error!("UpstreamSession: {}", e);
                self.registry
                    .broadcast_all(&ClientOutbound::error("Audio processing failed"));
                self.handle_disconnect(generation, None, e.to_string());
            }
        }
    }

    /// Queue one message for the provider
    ///
    /// # Returns
    /// * `Err(RelayError::UpstreamNotReady)` - Not connected, or the socket
    ///   cannot take more data right now
    pub fn send(&self, message: String) -> Result<(), RelayError> {
        let inner = self.inner.lock();
        if inner.state != SessionState::Connected {
            return Err(RelayError::UpstreamNotReady);
        }
        let tx = inner.outbound.as_ref().ok_or(RelayError::UpstreamNotReady)?;
        tx.try_send(message).map_err(|_| RelayError::UpstreamNotReady)
    }

    /// Feed one compressed client chunk to the transcoder
    ///
    /// Spawns a fresh transcoder if the previous one finished, and waits
    /// while its input buffer is full. Chunks that arrive while a finalized
    /// transcoder drains are dropped.
    pub async fn write_audio(self: &Arc<Self>, chunk: Vec<u8>) -> Result<(), RelayError> {
        let started = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Connected {
                return Err(RelayError::UpstreamNotReady);
            }
            let generation = inner.generation;
            match inner.transcoder.clone() {
                Some(transcoder) => Ok(transcoder),
                None => self
                    .start_transcoder(&mut inner, generation)
                    .map_err(|e| (generation, e)),
            }
        };

        match started {
            Ok(transcoder) => {
                transcoder.write_chunk(chunk).await;
                Ok(())
            }
            Err((generation, e)) => {
                log::error!("UpstreamSession: {}", e);
                self.registry
                    .broadcast_all(&ClientOutbound::error("Audio pipeline unavailable"));
                self.handle_disconnect(generation, None, e.to_string());
                Err(e)
            }
        }
    }

    /// Close the transcoder input; the commit follows once it drains
    ///
    /// # Returns
    /// `true` if there was open input to finalize
    pub fn finalize_audio(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .transcoder
            .as_ref()
            .map(|t| t.finalize_input())
            .unwrap_or(false)
    }

    /// Tear down after an unexpected close or transport failure
    fn handle_disconnect(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: String) {
        let (delay, was_connected) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.generation += 1;
            inner.connect_in_flight = false;
            inner.outbound = None;
            if let Some(transcoder) = inner.transcoder.take() {
                transcoder.stop();
            }

            let was_connected = inner.state == SessionState::Connected;
            if let Some(connected_at) = inner.connected_at.take() {
                if connected_at.elapsed() >= self.upstream.stable_connection() {
                    inner.backoff.reset();
                }
            }

            let delay = inner.backoff.next_delay();
            let until = Instant::now() + delay;
            inner.cooldown_until = Some(until);
            inner.last_cooldown = Some(delay);
            self.set_state(&mut inner, SessionState::Idle);

            if !self.registry.is_empty() {
                if let Some(timer) = inner.reconnect_timer.take() {
                    timer.abort();
                }
                self.arm_reconnect(&mut inner, until);
            }
            (delay, was_connected)
        };

        log::warn!(
            "UpstreamSession: Disconnected (code {}, {}), retry in {:?}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "1006".to_string()),
            reason,
            delay
        );
        let text = if was_connected {
            format!("Transcription service disconnected, reconnecting in {} ms", delay.as_millis())
        } else {
            format!("Transcription service unavailable, retrying in {} ms", delay.as_millis())
        };
        self.registry
            .broadcast_all(&ClientOutbound::OpenaiDisconnected { text });
    }

    /// Intentional shutdown: close the socket, kill the transcoder, no reconnect.
    ///
    /// Idempotent. Resets the backoff since this counts as a clean close.
    pub fn stop(&self) {
        let was_active = {
            let mut inner = self.inner.lock();
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            let was_active = inner.state != SessionState::Idle;
            if was_active {
                self.set_state(&mut inner, SessionState::Closing);
            }

            inner.generation += 1;
            inner.connect_in_flight = false;
            inner.outbound = None;
            if let Some(transcoder) = inner.transcoder.take() {
                transcoder.stop();
            }
            inner.connected_at = None;
            inner.cooldown_until = None;
            inner.backoff.reset();
            self.set_state(&mut inner, SessionState::Idle);
            was_active
        };

        if was_active {
            log::info!("UpstreamSession: Stopped");
            self.registry
                .broadcast_all(&ClientOutbound::OpenaiDisconnected {
                    text: "Transcription service stopped".to_string(),
                });
        }
    }
}
