pub mod config;
pub mod dispatch;
pub mod hotkeys;
pub mod logging;
pub mod overlay;
pub mod screen;
pub mod sessions;
pub mod settings;
pub mod store;
pub mod transcription;
pub mod tts;
pub mod ui_queue;
pub mod voice;

#[cfg(feature = "microphone")]
pub mod microphone;

#[cfg(feature = "desktop")]
mod desktop;

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    desktop::run()
}
