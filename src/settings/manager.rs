use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the provider API key (never persisted)
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Main settings structure containing all relay settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub transcoder: TranscoderSettings,
    #[serde(default)]
    pub translation: TranslationSettings,
    #[serde(default)]
    pub synthesis: SynthesisSettings,
    #[serde(default)]
    pub capabilities: CapabilitySettings,
    /// Provider credential, read from the environment only
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// Client-facing WebSocket server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_address: String,
    /// Forward interim `delta` transcripts to clients as previews
    #[serde(default = "default_true")]
    pub forward_deltas: bool,
}

/// Realtime transcription provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    pub url: String,
    #[serde(default = "default_beta_header")]
    pub beta_header: String,
    pub transcription_model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub language_hints: Vec<String>,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// A connection that stays up this long resets the reconnect backoff
    #[serde(default = "default_stable_connection_secs")]
    pub stable_connection_secs: u64,
    /// How long an open socket may wait for the provider's session acknowledgment
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Audio transcoder subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderSettings {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default = "default_input_buffer_chunks")]
    pub input_buffer_chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationSettings {
    /// Language clinician speech is translated into
    pub patient_language: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub model: String,
    pub voice: String,
    pub format: String,
}

/// HTTP capability (detection, translation, synthesis) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySettings {
    pub api_base_url: String,
    pub call_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_beta_header() -> String {
    "realtime=v1".to_string()
}

fn default_include() -> Vec<String> {
    vec!["item.input_audio_transcription.logprobs".to_string()]
}

fn default_stable_connection_secs() -> u64 {
    30
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_input_buffer_chunks() -> usize {
    64
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8787".to_string(),
            forward_deltas: true,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime?intent=transcription".to_string(),
            beta_header: default_beta_header(),
            transcription_model: "gpt-4o-transcribe".to_string(),
            prompt: String::new(),
            language_hints: Vec::new(),
            vad_threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            include: default_include(),
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
            stable_connection_secs: default_stable_connection_secs(),
            ready_timeout_ms: default_ready_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        let args = [
            "-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-f", "s16le", "-acodec",
            "pcm_s16le", "-ac", "1", "-ar", "24000", "pipe:1",
        ];
        Self {
            program: "ffmpeg".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            input_buffer_chunks: default_input_buffer_chunks(),
        }
    }
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            patient_language: "es".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            format: "mp3".to_string(),
        }
    }
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com/v1".to_string(),
            call_timeout_secs: 15,
        }
    }
}

impl UpstreamSettings {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn stable_connection(&self) -> Duration {
        Duration::from_secs(self.stable_connection_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl CapabilitySettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Settings {
    /// Applies environment overrides on top of file-backed settings
    ///
    /// Reads the API key plus `RELAY_BIND_ADDRESS` and `RELAY_PATIENT_LANGUAGE`.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(bind) = lookup("RELAY_BIND_ADDRESS").filter(|b| !b.trim().is_empty()) {
            self.server.bind_address = bind;
        }
        if let Some(lang) = lookup("RELAY_PATIENT_LANGUAGE").filter(|l| !l.trim().is_empty()) {
            self.translation.patient_language = lang.trim().to_lowercase();
        }
    }
}

/// Manages settings persistence and provides thread-safe access
pub struct SettingsManager {
    settings_path: PathBuf,
    current_settings: Arc<RwLock<Settings>>,
}

impl SettingsManager {
    /// Creates a new SettingsManager at `~/.clinic-relay/settings.json`
    ///
    /// If the settings file doesn't exist, creates it with default values.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The home directory cannot be resolved
    /// - The settings directory cannot be created
    /// - The settings file cannot be read or written
    pub fn new() -> Result<Self, String> {
        let home_dir = dirs::home_dir().ok_or_else(|| "Failed to get home directory".to_string())?;

        let relay_dir = home_dir.join(".clinic-relay");
        let settings_path = relay_dir.join("settings.json");

        Self::new_with_path(settings_path)
    }

    /// Creates a new SettingsManager with a custom settings path
    ///
    /// Used by `--config` and by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The settings directory cannot be created
    /// - The settings file cannot be read or written
    pub fn new_with_path(settings_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = settings_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create settings directory: {}", e))?;
            }
        }

        let manager = Self {
            settings_path: settings_path.clone(),
            current_settings: Arc::new(RwLock::new(Settings::default())),
        };

        let settings = if settings_path.exists() {
            manager.load_from_file()?
        } else {
            let defaults = Settings::default();
            manager.save_to_file(&defaults)?;
            defaults
        };

        *manager.current_settings.write() = settings;

        Ok(manager)
    }

    /// Returns a clone of the current settings
    pub fn get(&self) -> Settings {
        self.current_settings.read().clone()
    }

    pub fn path(&self) -> &PathBuf {
        &self.settings_path
    }

    /// Updates settings (validates, persists to disk, then updates in-memory)
    ///
    /// In-memory state only changes once the disk write succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or the disk write fails. In-memory state
    /// remains unchanged in that case.
    pub fn update(&self, settings: Settings) -> Result<(), String> {
        Self::validate(&settings)?;
        self.save_to_file(&settings)?;
        *self.current_settings.write() = settings;
        Ok(())
    }

    /// Validates settings schema and constraints
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - vad_threshold is not in range [0.0, 1.0]
    /// - reconnect_base_ms is zero or larger than reconnect_max_ms
    /// - ready_timeout_ms is zero
    /// - the upstream url is not a ws:// or wss:// url
    /// - the transcoder program or transcription model is empty
    /// - patient_language is not a two-letter code
    /// - call_timeout_secs is outside 1..=120
    pub fn validate(settings: &Settings) -> Result<(), String> {
        let upstream = &settings.upstream;
        if !(0.0..=1.0).contains(&upstream.vad_threshold) {
            return Err(format!(
                "VAD threshold must be between 0.0 and 1.0, got {}",
                upstream.vad_threshold
            ));
        }

        if upstream.reconnect_base_ms == 0 {
            return Err("Reconnect base delay must be greater than zero".to_string());
        }

        if upstream.reconnect_base_ms > upstream.reconnect_max_ms {
            return Err(format!(
                "Reconnect max delay ({} ms) must be at least the base delay ({} ms)",
                upstream.reconnect_max_ms, upstream.reconnect_base_ms
            ));
        }

        if upstream.ready_timeout_ms == 0 {
            return Err("Session acknowledgment timeout must be greater than zero".to_string());
        }

        if !(upstream.url.starts_with("ws://") || upstream.url.starts_with("wss://")) {
            return Err(format!("Upstream url must use ws:// or wss://, got '{}'", upstream.url));
        }

        if upstream.transcription_model.trim().is_empty() {
            return Err("Transcription model cannot be empty".to_string());
        }

        if upstream.outbound_buffer == 0 {
            return Err("Upstream outbound buffer must hold at least one message".to_string());
        }

        if settings.transcoder.program.trim().is_empty() {
            return Err("Transcoder program cannot be empty".to_string());
        }

        if settings.transcoder.input_buffer_chunks == 0 {
            return Err("Transcoder input buffer must hold at least one chunk".to_string());
        }

        let lang = settings.translation.patient_language.as_str();
        if lang.len() != 2 || !lang.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(format!(
                "Patient language must be a lowercase two-letter code, got '{}'",
                lang
            ));
        }

        let timeout = settings.capabilities.call_timeout_secs;
        if !(1..=120).contains(&timeout) {
            return Err(format!(
                "Capability call timeout must be between 1 and 120 seconds, got {}",
                timeout
            ));
        }

        Ok(())
    }

    /// Loads settings from disk
    ///
    /// If the file contains invalid JSON, logs an error and returns defaults.
    fn load_from_file(&self) -> Result<Settings, String> {
        let contents = std::fs::read_to_string(&self.settings_path)
            .map_err(|e| format!("Failed to read settings file: {}", e))?;

        match serde_json::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::error!("Settings: Failed to parse settings JSON: {}. Using defaults.", e);
                Ok(Settings::default())
            }
        }
    }

    /// Saves settings to disk atomically via a temp file and rename
    fn save_to_file(&self, settings: &Settings) -> Result<(), String> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        let temp_path = self.settings_path.with_extension("json.tmp");
        std::fs::write(&temp_path, json)
            .map_err(|e| format!("Failed to write temporary settings file: {}", e))?;

        std::fs::rename(&temp_path, &self.settings_path)
            .map_err(|e| format!("Failed to rename settings file: {}", e))?;

        Ok(())
    }
}
