use std::collections::BTreeMap;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const PLACEHOLDER_TITLE: &str = "New Chat";
pub const DEFAULT_WEBHOOK_URL: &str = "http://localhost:5678/webhook/peek";
pub const MIN_TTS_SPEED: f32 = 0.5;
pub const MAX_TTS_SPEED: f32 = 2.0;

/// Keys every healed document carries, in file order.
pub const SCALAR_KEYS: &[&str] = &[
    "hotkey",
    "webhook_url",
    "include_screenshot",
    "selected_monitor",
    "voice_mode",
    "voice_hotkey",
    "tts_enabled",
    "tts_voice",
    "tts_speed",
    "window_size",
    "first_run_complete",
];

/// The whole persisted document: configuration scalars plus chat sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_hotkey")]
    pub hotkey: String,
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,
    #[serde(default = "default_true")]
    pub include_screenshot: bool,
    #[serde(default = "default_monitor")]
    pub selected_monitor: usize,
    #[serde(default)]
    pub voice_mode: VoiceMode,
    #[serde(default = "default_voice_hotkey")]
    pub voice_hotkey: String,
    #[serde(default)]
    pub tts_enabled: bool,
    #[serde(default)]
    pub tts_voice: TtsVoice,
    #[serde(default = "default_tts_speed")]
    pub tts_speed: f32,
    #[serde(default)]
    pub window_size: WindowSize,
    #[serde(default)]
    pub first_run_complete: bool,
    #[serde(default)]
    pub sessions: BTreeMap<String, Session>,
    /// Keys this version does not know about; written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_hotkey() -> String {
    "ctrl+shift+space".to_string()
}

fn default_webhook_url() -> String {
    DEFAULT_WEBHOOK_URL.to_string()
}

fn default_voice_hotkey() -> String {
    "ctrl+shift+v".to_string()
}

fn default_true() -> bool {
    true
}

fn default_monitor() -> usize {
    1
}

fn default_tts_speed() -> f32 {
    1.0
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hotkey: default_hotkey(),
            webhook_url: default_webhook_url(),
            include_screenshot: true,
            selected_monitor: default_monitor(),
            voice_mode: VoiceMode::default(),
            voice_hotkey: default_voice_hotkey(),
            tts_enabled: false,
            tts_voice: TtsVoice::default(),
            tts_speed: default_tts_speed(),
            window_size: WindowSize::default(),
            first_run_complete: false,
            sessions: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    #[default]
    Toggle,
    PushToTalk,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TtsVoice {
    #[default]
    Default,
    Jenny,
    Guy,
    Aria,
    Davis,
    Jane,
    Jason,
    Sara,
    Tony,
    Nancy,
}

impl TtsVoice {
    pub const ALL: [TtsVoice; 10] = [
        TtsVoice::Default,
        TtsVoice::Jenny,
        TtsVoice::Guy,
        TtsVoice::Aria,
        TtsVoice::Davis,
        TtsVoice::Jane,
        TtsVoice::Jason,
        TtsVoice::Sara,
        TtsVoice::Tony,
        TtsVoice::Nancy,
    ];

    pub fn key(self) -> &'static str {
        match self {
            TtsVoice::Default => "default",
            TtsVoice::Jenny => "jenny",
            TtsVoice::Guy => "guy",
            TtsVoice::Aria => "aria",
            TtsVoice::Davis => "davis",
            TtsVoice::Jane => "jane",
            TtsVoice::Jason => "jason",
            TtsVoice::Sara => "sara",
            TtsVoice::Tony => "tony",
            TtsVoice::Nancy => "nancy",
        }
    }

    /// Full neural voice identifier understood by speech services.
    pub fn neural_name(self) -> &'static str {
        match self {
            TtsVoice::Default | TtsVoice::Jenny => "en-US-JennyNeural",
            TtsVoice::Guy => "en-US-GuyNeural",
            TtsVoice::Aria => "en-US-AriaNeural",
            TtsVoice::Davis => "en-US-DavisNeural",
            TtsVoice::Jane => "en-US-JaneNeural",
            TtsVoice::Jason => "en-US-JasonNeural",
            TtsVoice::Sara => "en-US-SaraNeural",
            TtsVoice::Tony => "en-US-TonyNeural",
            TtsVoice::Nancy => "en-US-NancyNeural",
        }
    }

    pub fn is_male(self) -> bool {
        matches!(
            self,
            TtsVoice::Guy | TtsVoice::Davis | TtsVoice::Jason | TtsVoice::Tony
        )
    }
}

/// Processing-depth hint forwarded to the workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Complexity {
    Low,
    #[default]
    Mid,
    High,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Low => "Low",
            Complexity::Mid => "Mid",
            Complexity::High => "High",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            width: 600,
            height: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    #[serde(default = "placeholder_title")]
    pub title: String,
    /// Seconds since the Unix epoch of the last interaction.
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

fn placeholder_title() -> String {
    PLACEHOLDER_TITLE.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("{0} cannot be empty")]
    EmptyHotkey(&'static str),
    #[error("Overlay and voice hotkeys cannot be the same")]
    HotkeyConflict,
    #[error("Webhook URL is not a valid http(s) URL: {0}")]
    InvalidWebhookUrl(String),
    #[error("TTS speed must be between 0.5 and 2.0, got {0}")]
    TtsSpeedOutOfRange(f32),
    #[error("Monitor index must be 1 or greater")]
    InvalidMonitor,
}

impl Settings {
    /// Defaults with the workflow endpoint taken from configuration.
    pub fn with_webhook_url(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.hotkey.trim().is_empty() {
            return Err(SettingsError::EmptyHotkey("Overlay hotkey"));
        }
        if self.voice_hotkey.trim().is_empty() {
            return Err(SettingsError::EmptyHotkey("Voice hotkey"));
        }
        if self.hotkey.trim().eq_ignore_ascii_case(self.voice_hotkey.trim()) {
            return Err(SettingsError::HotkeyConflict);
        }
        match Url::parse(self.webhook_url.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return Err(SettingsError::InvalidWebhookUrl(self.webhook_url.clone())),
        }
        if !(MIN_TTS_SPEED..=MAX_TTS_SPEED).contains(&self.tts_speed) {
            return Err(SettingsError::TtsSpeedOutOfRange(self.tts_speed));
        }
        if self.selected_monitor < 1 {
            return Err(SettingsError::InvalidMonitor);
        }
        Ok(())
    }

    /// Applies a partial update, validating the result as a whole. On error
    /// `self` is left untouched.
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<SettingsChanges, SettingsError> {
        let mut next = self.clone();
        if let Some(hotkey) = update.hotkey {
            next.hotkey = hotkey.trim().to_string();
        }
        if let Some(url) = update.webhook_url {
            next.webhook_url = url.trim().to_string();
        }
        if let Some(include) = update.include_screenshot {
            next.include_screenshot = include;
        }
        if let Some(monitor) = update.selected_monitor {
            next.selected_monitor = monitor;
        }
        if let Some(mode) = update.voice_mode {
            next.voice_mode = mode;
        }
        if let Some(hotkey) = update.voice_hotkey {
            next.voice_hotkey = hotkey.trim().to_string();
        }
        if let Some(enabled) = update.tts_enabled {
            next.tts_enabled = enabled;
        }
        if let Some(voice) = update.tts_voice {
            next.tts_voice = voice;
        }
        if let Some(speed) = update.tts_speed {
            next.tts_speed = speed;
        }
        if let Some(size) = update.window_size {
            next.window_size = size;
        }
        next.validate()?;

        let changes = SettingsChanges {
            overlay_hotkey: next.hotkey != self.hotkey,
            voice_binding: next.voice_hotkey != self.voice_hotkey
                || next.voice_mode != self.voice_mode,
        };
        *self = next;
        Ok(changes)
    }
}

/// A settings edit coming from the settings form; absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub hotkey: Option<String>,
    pub webhook_url: Option<String>,
    pub include_screenshot: Option<bool>,
    pub selected_monitor: Option<usize>,
    pub voice_mode: Option<VoiceMode>,
    pub voice_hotkey: Option<String>,
    pub tts_enabled: Option<bool>,
    pub tts_voice: Option<TtsVoice>,
    pub tts_speed: Option<f32>,
    pub window_size: Option<WindowSize>,
}

/// Which hotkey bindings an applied update invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettingsChanges {
    pub overlay_hotkey: bool,
    pub voice_binding: bool,
}

/// Result of reconciling a raw JSON document against the known schema.
#[derive(Debug)]
pub(crate) struct Healed {
    pub settings: Settings,
    pub repaired: bool,
}

/// Backfills missing or malformed keys from `defaults`, drops sessions that
/// cannot be read, and keeps unknown keys.
pub(crate) fn heal(raw: Value, defaults: &Settings) -> Healed {
    let Value::Object(mut raw) = raw else {
        warn!("settings document is not a JSON object; using defaults");
        return Healed {
            settings: defaults.clone(),
            repaired: true,
        };
    };

    let mut merged = match serde_json::to_value(defaults) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    merged.remove("sessions");
    let mut repaired = false;

    for key in SCALAR_KEYS {
        match raw.remove(*key) {
            Some(value) => match fit_scalar(key, value) {
                Fit::Valid(value) => {
                    merged.insert((*key).to_string(), value);
                }
                Fit::Adjusted(value) => {
                    warn!(key = *key, "settings value out of range; clamped");
                    merged.insert((*key).to_string(), value);
                    repaired = true;
                }
                Fit::Invalid => {
                    warn!(key = *key, "malformed settings value; using default");
                    repaired = true;
                }
            },
            None => {
                debug!(key = *key, "backfilling missing settings key");
                repaired = true;
            }
        }
    }

    let sessions = match raw.remove("sessions") {
        Some(Value::Object(entries)) => heal_sessions(entries, &mut repaired),
        Some(_) => {
            warn!("settings `sessions` is not an object; starting with no sessions");
            repaired = true;
            BTreeMap::new()
        }
        None => {
            repaired = true;
            BTreeMap::new()
        }
    };

    let mut settings = match serde_json::from_value::<Settings>(Value::Object(merged)) {
        Ok(settings) => settings,
        Err(err) => {
            warn!("failed to rebuild settings after healing: {err}");
            repaired = true;
            defaults.clone()
        }
    };
    settings.sessions = sessions;
    settings.extra = raw;

    Healed { settings, repaired }
}

enum Fit {
    Valid(Value),
    Adjusted(Value),
    Invalid,
}

fn fit_scalar(key: &str, value: Value) -> Fit {
    let valid = match key {
        "hotkey" | "webhook_url" | "voice_hotkey" => value.is_string(),
        "include_screenshot" | "tts_enabled" | "first_run_complete" => value.is_boolean(),
        "selected_monitor" => value.as_u64().is_some_and(|index| index >= 1),
        "voice_mode" => serde_json::from_value::<VoiceMode>(value.clone()).is_ok(),
        "tts_voice" => serde_json::from_value::<TtsVoice>(value.clone()).is_ok(),
        "window_size" => serde_json::from_value::<WindowSize>(value.clone()).is_ok(),
        "tts_speed" => {
            return match value.as_f64() {
                Some(speed) if (MIN_TTS_SPEED as f64..=MAX_TTS_SPEED as f64).contains(&speed) => {
                    Fit::Valid(value)
                }
                Some(speed) if speed.is_finite() => Fit::Adjusted(Value::from(
                    speed.clamp(MIN_TTS_SPEED as f64, MAX_TTS_SPEED as f64),
                )),
                _ => Fit::Invalid,
            };
        }
        _ => false,
    };
    if valid {
        Fit::Valid(value)
    } else {
        Fit::Invalid
    }
}

fn heal_sessions(entries: Map<String, Value>, repaired: &mut bool) -> BTreeMap<String, Session> {
    let mut sessions = BTreeMap::new();
    for (id, value) in entries {
        let mut value = value;
        if let Value::Object(fields) = &mut value {
            // Entries written without an id still belong to their key.
            fields
                .entry("id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        match serde_json::from_value::<Session>(value) {
            Ok(mut session) => {
                if session.id != id {
                    session.id = id.clone();
                    *repaired = true;
                }
                sessions.insert(id, session);
            }
            Err(err) => {
                warn!(session = %id, "dropping unreadable session: {err}");
                *repaired = true;
            }
        }
    }
    sessions
}
