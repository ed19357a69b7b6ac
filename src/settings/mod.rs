pub mod manager;


pub use manager::{
    CapabilitySettings, ServerSettings, Settings, SettingsManager, SynthesisSettings,
    TranscoderSettings, TranslationSettings, UpstreamSettings,
};
