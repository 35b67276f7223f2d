//! Persistent server settings (JSON file in the config directory).
//!
//! Resolution order: file, then environment, then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::{
    audio::AudioFormat,
    engine::{CaptureKind, EngineConfig},
    vad::SilenceGateConfig,
    Mode,
};

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_TOXICITY_API_URL: &str = "http://127.0.0.1:8000/check";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub mode: Mode,
    pub capture: CaptureKind,
    pub window_ms: u64,
    pub input_format: AudioFormat,
    pub toxicity_api_url: String,
    pub classifier_threshold: f32,
    pub classifier_timeout_ms: u64,
    pub silence_gate: bool,
    pub silence_rms_threshold: f32,
    pub min_speech_frames: usize,
    /// "stub" | "whisper"
    pub stt_backend: String,
    pub whisper_model: Option<PathBuf>,
    pub language_hint: String,
    pub stats_csv: Option<PathBuf>,
    pub sqlite_path: Option<PathBuf>,
    pub log_json: bool,
    pub outbound_queue_depth: usize,
    pub window_queue_depth: usize,
    pub inbound_queue_depth: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.into(),
            mode: Mode::Reactive,
            capture: CaptureKind::PerMessage,
            window_ms: 4_000,
            input_format: AudioFormat::Wav,
            toxicity_api_url: DEFAULT_TOXICITY_API_URL.into(),
            classifier_threshold: 0.5,
            classifier_timeout_ms: 2_000,
            silence_gate: true,
            silence_rms_threshold: 0.01,
            min_speech_frames: 10,
            stt_backend: "stub".into(),
            whisper_model: None,
            language_hint: "en".into(),
            stats_csv: Some(PathBuf::from("stats.csv")),
            sqlite_path: None,
            log_json: false,
            outbound_queue_depth: 256,
            window_queue_depth: 8,
            inbound_queue_depth: 64,
        }
    }
}

impl ServerSettings {
    pub fn normalize(&mut self) {
        self.bind = non_empty(&self.bind).unwrap_or_else(|| DEFAULT_BIND.into());
        self.toxicity_api_url =
            non_empty(&self.toxicity_api_url).unwrap_or_else(|| DEFAULT_TOXICITY_API_URL.into());
        self.window_ms = self.window_ms.clamp(500, 10_000);
        self.classifier_timeout_ms = self.classifier_timeout_ms.clamp(100, 5_000);
        self.classifier_threshold = self.classifier_threshold.clamp(0.0, 1.0);
        self.silence_rms_threshold = self.silence_rms_threshold.clamp(0.0, 1.0);
        self.stt_backend = normalize_stt_backend(&self.stt_backend);
        self.language_hint = normalize_language_hint(&self.language_hint);
        self.whisper_model = self.whisper_model.take().filter(|p| !p.as_os_str().is_empty());
        self.stats_csv = self.stats_csv.take().filter(|p| !p.as_os_str().is_empty());
        self.sqlite_path = self.sqlite_path.take().filter(|p| !p.as_os_str().is_empty());
        self.outbound_queue_depth = self.outbound_queue_depth.clamp(1, 65_536);
        self.window_queue_depth = self.window_queue_depth.clamp(1, 1_024);
        self.inbound_queue_depth = self.inbound_queue_depth.clamp(1, 4_096);
    }

    /// Apply `VIGIL_*` overrides (plus the legacy `BOT_MODE` and
    /// `TOXICITY_API_URL`). `VIGIL_MODE` wins over `BOT_MODE`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = var("VIGIL_MODE").or_else(|| var("BOT_MODE")) {
            self.mode = raw.parse().map_err(|e| format!("{e}"))?;
        }
        if let Some(url) = var("TOXICITY_API_URL") {
            self.toxicity_api_url = url;
        }
        if let Some(bind) = var("VIGIL_BIND") {
            self.bind = bind;
        }
        if let Some(backend) = var("VIGIL_STT_BACKEND") {
            self.stt_backend = backend;
        }
        if let Some(model) = var("VIGIL_WHISPER_MODEL") {
            self.whisper_model = Some(PathBuf::from(model));
        }
        self.normalize();
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            mode: self.mode,
            capture: self.capture,
            window: Duration::from_millis(self.window_ms),
            input_format: self.input_format,
            classifier_threshold: self.classifier_threshold,
            classifier_timeout: self.classifier_timeout(),
            silence_gate: self.silence_gate.then(|| SilenceGateConfig {
                rms_threshold: self.silence_rms_threshold,
                min_speech_frames: self.min_speech_frames,
                ..SilenceGateConfig::default()
            }),
            window_queue_depth: self.window_queue_depth,
            inbound_queue_depth: self.inbound_queue_depth,
            outbound_queue_depth: self.outbound_queue_depth,
            ..EngineConfig::default()
        }
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn normalize_stt_backend(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "whisper" | "whisper-rs" | "whisper.cpp" | "whispercpp" => "whisper".into(),
        _ => "stub".into(),
    }
}

pub fn normalize_language_hint(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "en" | "eng" | "english" => "en".into(),
        "auto" => "auto".into(),
        other => other.to_string(),
    }
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("vigil")
        .join("settings.json")
}

/// A missing or unreadable file yields defaults.
pub fn load_settings(path: &Path) -> ServerSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ServerSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &ServerSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
