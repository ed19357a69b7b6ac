// AudioTranscoder - wraps one ffmpeg-style subprocess turning compressed audio into PCM
// Input is fed through stdin, s16le mono 24kHz PCM is read from stdout

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::settings::TranscoderSettings;

const READ_CHUNK_BYTES: usize = 8192;

/// What a transcoder reports back to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderEvent {
    /// Decoded PCM bytes
    Output(Vec<u8>),
    /// Input was finalized and the process exited cleanly
    Finished,
    /// Any other exit, or a broken pipe
    Failed(String),
}

/// A transcoder event tagged with the instance that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderSignal {
    pub transcoder_id: u64,
    pub event: TranscoderEvent,
}

/// One running transcoder subprocess.
///
/// Stdin is owned by a writer task reached through a bounded channel.
/// A full channel makes `write_chunk` wait for the subprocess instead of
/// losing audio. Dropping the handle stops the process.
pub struct AudioTranscoder {
    id: u64,
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    finalized: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AudioTranscoder {
    /// Spawn the subprocess and start forwarding its output
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `settings` - Program, arguments and input buffer size
    /// * `id` - Tag attached to every event this instance emits
    /// * `events` - Sink for output chunks and the final exit signal
    ///
    /// # Returns
    /// * `Ok(AudioTranscoder)` - Process running
    /// * `Err(RelayError::TranscoderSpawn)` - Process could not be started
    pub fn start(
        settings: &TranscoderSettings,
        id: u64,
        events: mpsc::UnboundedSender<TranscoderSignal>,
    ) -> Result<Self, RelayError> {
        let mut child = Command::new(&settings.program)
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::TranscoderSpawn(format!("{}: {}", settings.program, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::TranscoderSpawn("Failed to get stdin handle".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::TranscoderSpawn("Failed to get stdout handle".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RelayError::TranscoderSpawn("Failed to get stderr handle".into()))?;

        log::info!(
            "Transcoder[{}]: Started {} (pid {:?})",
            id,
            settings.program,
            child.id()
        );

        let alive = Arc::new(AtomicBool::new(true));
        let detached = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(settings.input_buffer_chunks.max(1));

        // Writer: closing the channel closes stdin
        tokio::spawn(async move {
            while let Some(chunk) = input_rx.recv().await {
                if let Err(e) = stdin.write_all(&chunk).await {
                    log::warn!("Transcoder[{}]: stdin write failed: {}", id, e);
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        // Stderr drain
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("Transcoder[{}]: {}", id, line);
            }
        });

        // Stdout reader
        let reader_events = events.clone();
        let reader_detached = detached.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if reader_detached.load(Ordering::SeqCst) {
                            continue;
                        }
                        let signal = TranscoderSignal {
                            transcoder_id: id,
                            event: TranscoderEvent::Output(buf[..n].to_vec()),
                        };
                        if reader_events.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Transcoder[{}]: stdout read failed: {}", id, e);
                        break;
                    }
                }
            }
        });

        let finalized = Arc::new(AtomicBool::new(false));
        let transcoder = Self {
            id,
            input: Mutex::new(Some(input_tx)),
            finalized: finalized.clone(),
            alive: alive.clone(),
            detached: detached.clone(),
            cancel: cancel.clone(),
        };

        // Monitor: decides between Finished and Failed once the process exits
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => None,
            };

            let status = match exit {
                Some(status) => status,
                None => {
                    let _ = child.kill().await;
                    alive.store(false, Ordering::SeqCst);
                    log::info!("Transcoder[{}]: Stopped", id);
                    return;
                }
            };

            // Every Output must be delivered before the exit signal
            let _ = reader.await;
            alive.store(false, Ordering::SeqCst);

            if detached.load(Ordering::SeqCst) {
                return;
            }

            let event = match status {
                Ok(status) if status.success() && finalized.load(Ordering::SeqCst) => {
                    log::info!("Transcoder[{}]: Finished cleanly", id);
                    TranscoderEvent::Finished
                }
                Ok(status) if status.success() => {
                    TranscoderEvent::Failed("exited before input was finalized".to_string())
                }
                Ok(status) => TranscoderEvent::Failed(format!("exited with {}", status)),
                Err(e) => TranscoderEvent::Failed(format!("wait failed: {}", e)),
            };
            if let TranscoderEvent::Failed(reason) = &event {
                log::error!("Transcoder[{}]: {}", id, reason);
            }
            let _ = events.send(TranscoderSignal {
                transcoder_id: id,
                event,
            });
        });

        Ok(transcoder)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Forward one chunk of compressed input
    ///
    /// Waits while the input buffer is full. A no-op with a warning once
    /// input is finalized or the process is gone.
    ///
    /// # Returns
    /// `true` if the chunk was queued for the subprocess
    pub async fn write_chunk(&self, chunk: Vec<u8>) -> bool {
        if self.is_finalized() {
            log::warn!("Transcoder[{}]: Dropping chunk written after finalize", self.id);
            return false;
        }
        if !self.is_alive() {
            log::warn!("Transcoder[{}]: Dropping chunk, process not running", self.id);
            return false;
        }

        let input = self.input.lock().clone();
        let Some(tx) = input else {
            log::warn!("Transcoder[{}]: Dropping chunk, input closed", self.id);
            return false;
        };
        tokio::select! {
            sent = tx.send(chunk) => {
                if sent.is_err() {
                    log::warn!("Transcoder[{}]: Input pipe closed, dropping chunk", self.id);
                }
                sent.is_ok()
            }
            _ = self.cancel.cancelled() => {
                log::debug!("Transcoder[{}]: Stopped while writing, dropping chunk", self.id);
                false
            }
        }
    }

    /// Close the input side. Only the first call has an effect.
    ///
    /// # Returns
    /// `true` if this call closed the input
    pub fn finalize_input(&self) -> bool {
        let taken = self.input.lock().take();
        match taken {
            Some(tx) => {
                self.finalized.store(true, Ordering::SeqCst);
                drop(tx);
                log::debug!("Transcoder[{}]: Input finalized", self.id);
                true
            }
            None => false,
        }
    }

    /// Kill the subprocess without reporting Finished or Failed.
    ///
    /// Listeners are detached before the kill, so teardown never looks like a
    /// crash. Safe to call any number of times.
    pub fn stop(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.input.lock().take();
        self.cancel.cancel();
    }
}

impl Drop for AudioTranscoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(program: &str, args: &[&str]) -> TranscoderSettings {
        TranscoderSettings {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            input_buffer_chunks: 16,
        }
    }

    /// Collect events until Finished/Failed, or give up after a few seconds
    async fn collect(rx: &mut mpsc::UnboundedReceiver<TranscoderSignal>) -> Vec<TranscoderEvent> {
        let mut events = Vec::new();
        while let Ok(Some(signal)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            let terminal = !matches!(signal.event, TranscoderEvent::Output(_));
            events.push(signal.event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_passthrough_then_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transcoder = AudioTranscoder::start(&settings("cat", &[]), 7, tx).unwrap();

        assert!(transcoder.write_chunk(b"hello ".to_vec()).await);
        assert!(transcoder.write_chunk(b"world".to_vec()).await);
        assert!(transcoder.finalize_input());

        let events = collect(&mut rx).await;
        let output: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                TranscoderEvent::Output(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(output, b"hello world");
        assert_eq!(events.last(), Some(&TranscoderEvent::Finished));
    }

    #[tokio::test]
    async fn test_write_after_finalize_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transcoder = AudioTranscoder::start(&settings("cat", &[]), 1, tx).unwrap();

        assert!(transcoder.finalize_input());
        assert!(!transcoder.finalize_input());
        assert!(!transcoder.write_chunk(vec![1, 2, 3]).await);
        assert!(transcoder.is_finalized());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _transcoder =
            AudioTranscoder::start(&settings("sh", &["-c", "exit 3"]), 2, tx).unwrap();

        let events = collect(&mut rx).await;
        assert!(matches!(events.last(), Some(TranscoderEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_clean_exit_without_finalize_is_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transcoder = AudioTranscoder::start(&settings("true", &[]), 3, tx).unwrap();

        let events = collect(&mut rx).await;
        assert!(matches!(events.last(), Some(TranscoderEvent::Failed(_))));
        assert!(!transcoder.is_alive());
        assert!(!transcoder.write_chunk(vec![0]).await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = AudioTranscoder::start(&settings("/nonexistent/transcoder", &[]), 4, tx);
        assert!(matches!(result, Err(RelayError::TranscoderSpawn(_))));
    }

    #[tokio::test]
    async fn test_stop_is_silent_and_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transcoder = AudioTranscoder::start(&settings("cat", &[]), 5, tx).unwrap();

        transcoder.stop();
        transcoder.stop();
        assert!(!transcoder.write_chunk(vec![1]).await);

        // Detached before the kill: no Finished/Failed may surface
        let next = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(!matches!(next, Ok(Some(_))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!transcoder.is_alive());
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transcoder = AudioTranscoder::start(&settings("cat", &[]), 42, tx).unwrap();
        transcoder.write_chunk(b"x".to_vec()).await;
        transcoder.finalize_input();

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.transcoder_id, 42);
    }

    #[tokio::test]
    async fn test_full_buffer_waits_for_slow_consumer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slow = settings("sh", &["-c", "sleep 0.5; cat"]);
        slow.input_buffer_chunks = 4;
        let transcoder = AudioTranscoder::start(&slow, 6, tx).unwrap();

        let chunk = vec![0xABu8; 16 * 1024];
        let mut accepted = 0;
        for _ in 0..40 {
            if transcoder.write_chunk(chunk.clone()).await {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 40);
        assert!(transcoder.finalize_input());

        let events = collect(&mut rx).await;
        let total: usize = events
            .iter()
            .map(|e| match e {
                TranscoderEvent::Output(bytes) => bytes.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, 40 * chunk.len());
        assert_eq!(events.last(), Some(&TranscoderEvent::Finished));
    }

    #[tokio::test]
    async fn test_stop_releases_blocked_writer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut stuck = settings("sleep", &["10"]);
        stuck.input_buffer_chunks = 1;
        let transcoder = Arc::new(AudioTranscoder::start(&stuck, 8, tx).unwrap());

        let writer = transcoder.clone();
        let pending = tokio::spawn(async move {
            let mut accepted = 0;
            for _ in 0..64 {
                if !writer.write_chunk(vec![0u8; 64 * 1024]).await {
                    break;
                }
                accepted += 1;
            }
            accepted
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        transcoder.stop();
        let accepted = tokio::time::timeout(Duration::from_secs(3), pending)
            .await
            .expect("writer still blocked after stop")
            .unwrap();
        assert!(accepted < 64);
    }
}
