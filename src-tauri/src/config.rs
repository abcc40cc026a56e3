use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::settings::{Settings, DEFAULT_WEBHOOK_URL, SETTINGS_FILE_NAME};

/// Process-level configuration from the environment (and `.env`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub settings_path: PathBuf,
    pub webhook_url: String,
    pub transcribe_url: String,
    pub transcribe_api_key: Option<String>,
    pub tts_command: String,
    pub http_timeout: Duration,
    pub max_recording_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from(SETTINGS_FILE_NAME),
            webhook_url: DEFAULT_WEBHOOK_URL.into(),
            transcribe_url: "http://127.0.0.1:9001".into(),
            transcribe_api_key: None,
            tts_command: "espeak-ng".into(),
            http_timeout: Duration::from_secs(120),
            max_recording_secs: 120,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            settings_path: var("PEEK_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.settings_path),
            webhook_url: var("PEEK_WEBHOOK_URL").unwrap_or(defaults.webhook_url),
            transcribe_url: var("PEEK_TRANSCRIBE_URL").unwrap_or(defaults.transcribe_url),
            transcribe_api_key: var("PEEK_TRANSCRIBE_API_KEY"),
            tts_command: var("PEEK_TTS_COMMAND").unwrap_or(defaults.tts_command),
            http_timeout: env_secs(&var, "PEEK_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            max_recording_secs: env_secs(&var, "PEEK_MAX_RECORDING_SECS")
                .unwrap_or(defaults.max_recording_secs),
        }
    }

    /// Defaults for a settings file that does not exist yet.
    pub fn default_settings(&self) -> Settings {
        Settings::with_webhook_url(self.webhook_url.clone())
    }
}

fn env_secs(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = var(key)?;
    match raw.parse::<u64>() {
        Ok(0) | Err(_) => {
            warn!(key, value = %raw, "ignoring invalid duration");
            None
        }
        Ok(secs) => Some(secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), AppConfig::default());
    }

    #[test]
    fn overrides_are_read() {
        let cfg = config(&[
            ("PEEK_SETTINGS_PATH", "/tmp/peek/settings.json"),
            ("PEEK_WEBHOOK_URL", "https://n8n.example/webhook/abc"),
            ("PEEK_TRANSCRIBE_API_KEY", "secret"),
            ("PEEK_HTTP_TIMEOUT_SECS", "15"),
            ("PEEK_MAX_RECORDING_SECS", "oops"),
        ]);
        assert_eq!(cfg.settings_path, PathBuf::from("/tmp/peek/settings.json"));
        assert_eq!(cfg.transcribe_api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.http_timeout, Duration::from_secs(15));
        assert_eq!(cfg.max_recording_secs, 120);
        assert_eq!(
            cfg.default_settings().webhook_url,
            "https://n8n.example/webhook/abc"
        );
    }
}
