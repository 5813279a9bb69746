use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::CaptureConfig;
use crate::playback::{SchedulerConfig, WAV_HEADER_BYTES};

const SETTINGS_DIR_NAME: &str = "voice-agent";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const ENV_SERVER_URL: &str = "VOICE_AGENT_SERVER_URL";
pub const ENV_HTTP_URL: &str = "VOICE_AGENT_HTTP_URL";
pub const ENV_PERSONA: &str = "VOICE_AGENT_PERSONA";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// WebSocket endpoint for the audio stream. The session id is appended
    /// as a query parameter.
    pub server_url: String,

    /// Base URL for the REST endpoints (history).
    pub http_base_url: String,

    /// Rate of the PCM frames sent to the backend.
    pub capture_sample_rate: u32,

    /// Duration of each captured frame sent over the connection.
    pub frame_duration_ms: u32,

    /// Rate of the synthesized speech the backend streams back.
    pub playback_sample_rate: u32,

    /// Minimum lead between "now" and the start of a scheduled buffer.
    pub playback_guard_ms: u32,

    /// Container header stripped from the first audio chunk of each response.
    pub wav_header_bytes: usize,

    /// Persona tag used for the session handshake.
    pub default_persona: String,

    /// Seed the conversation from the backend's saved history at startup.
    pub load_history: bool,

    /// When set, captured frames are also written to this WAV file.
    pub record_path: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000/ws/audio-stream".to_string(),
            http_base_url: "http://127.0.0.1:8000".to_string(),
            capture_sample_rate: 16000,
            frame_duration_ms: 250,
            playback_sample_rate: 44100,
            playback_guard_ms: 100,
            wav_header_bytes: WAV_HEADER_BYTES,
            default_persona: "developer".to_string(),
            load_history: true,
            record_path: None,
        }
    }
}

impl ClientSettings {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.capture_sample_rate,
            frame_duration_ms: self.frame_duration_ms,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sample_rate: self.playback_sample_rate,
            guard_secs: self.playback_guard_ms as f64 / 1000.0,
            header_bytes: self.wav_header_bytes,
        }
    }

    /// Apply `VOICE_AGENT_*` overrides through `lookup` (normally
    /// `std::env::var`). Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_SERVER_URL) {
            log::info!("Settings: server URL from {}", ENV_SERVER_URL);
            self.server_url = url;
        }
        if let Some(url) = get(ENV_HTTP_URL) {
            log::info!("Settings: HTTP base URL from {}", ENV_HTTP_URL);
            self.http_base_url = url;
        }
        if let Some(persona) = get(ENV_PERSONA) {
            log::info!("Settings: persona from {}", ENV_PERSONA);
            self.default_persona = persona;
        }
    }
}

/// `<config_dir>/voice-agent/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> ClientSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ClientSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings(settings: &ClientSettings) -> Result<PathBuf, String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)?;
    Ok(path)
}

pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: ClientSettings =
            serde_json::from_str(r#"{"server_url":"ws://example:9000/ws/audio-stream"}"#).unwrap();
        assert_eq!(settings.server_url, "ws://example:9000/ws/audio-stream");
        assert_eq!(settings.capture_sample_rate, 16000);
        assert_eq!(settings.wav_header_bytes, 44);
        assert!(settings.load_history);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice-agent").join("settings.json");

        let settings = ClientSettings {
            default_persona: "aizen".to_string(),
            record_path: Some(PathBuf::from("/tmp/capture.wav")),
            ..ClientSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path), ClientSettings::default());
        assert_eq!(
            load_settings_from(&dir.path().join("missing.json")),
            ClientSettings::default()
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SERVER_URL, "wss://voice.example/ws/audio-stream"),
            (ENV_HTTP_URL, "  "),
            (ENV_PERSONA, "luffy"),
        ]
        .into_iter()
        .collect();

        let mut settings = ClientSettings::default();
        settings.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.server_url, "wss://voice.example/ws/audio-stream");
        assert_eq!(settings.http_base_url, "http://127.0.0.1:8000");
        assert_eq!(settings.default_persona, "luffy");
    }

    #[test]
    fn test_scheduler_config_conversion() {
        let config = ClientSettings::default().scheduler_config();
        assert_eq!(config.sample_rate, 44100);
        assert!((config.guard_secs - 0.1).abs() < 1e-9);
    }
}
