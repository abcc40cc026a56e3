use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tauri::{AppHandle, Emitter, LogicalSize, Manager, RunEvent, WindowEvent, Wry};
use tauri_plugin_global_shortcut::{GlobalShortcutExt, ShortcutState};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::dispatch::{QueryDispatcher, WorkflowClient};
use crate::hotkeys::{EdgeHandler, HotkeyError, HotkeyManager, KeyEdge, ShortcutRegistrar};
use crate::microphone::CpalInput;
use crate::overlay::{self, Overlay, OverlayDeps, OverlayView, UiEvent, ViewSink};
use crate::screen::{capture_region_with_tool, MonitorInfo, ScreenCapture};
use crate::sessions::{SessionManager, SessionSummary};
use crate::settings::{Complexity, Message, Settings, SettingsUpdate, TtsVoice};
use crate::store::SettingsStore;
use crate::transcription::HttpTranscriber;
use crate::tts::{CommandSpeech, TtsPlayer};
use crate::ui_queue::{self, UiSender};
use crate::voice::{AudioInput, CaptureBuffer, VoiceController};

type AppRuntime = Wry;

const MAIN_WINDOW_LABEL: &str = "main";
const EVENT_VIEW: &str = "overlay:view";
/// Compositors keep drawing the last frame briefly after the window reports hidden.
const HIDE_SETTLE: Duration = Duration::from_millis(60);

pub fn run() {
    crate::logging::init();
    let config = AppConfig::from_env();

    tauri::Builder::default()
        .plugin(tauri_plugin_global_shortcut::Builder::new().build())
        .setup(move |app| {
            let state = boot(app.handle(), &config)?;
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            get_settings,
            update_settings,
            set_input,
            submit_query,
            set_complexity,
            set_include_screenshot,
            select_monitor,
            retry_query,
            new_chat,
            open_session,
            delete_session,
            get_sessions,
            get_session_messages,
            toggle_voice,
            stop_speech,
            hide_overlay,
            list_monitors,
            list_voices
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| {
            if let RunEvent::Exit = event {
                if let Some(state) = app.try_state::<AppState>() {
                    state.ui.post(UiEvent::Shutdown);
                }
            }
        });
}

struct AppState {
    ui: UiSender<UiEvent>,
    store: Arc<SettingsStore>,
    sessions: SessionManager,
    screens: Arc<TauriScreens>,
    _runtime: tokio::runtime::Runtime,
}

fn boot(app: &AppHandle<AppRuntime>, config: &AppConfig) -> Result<AppState> {
    let store = Arc::new(SettingsStore::open(
        &config.settings_path,
        config.default_settings(),
    ));
    let settings = store.load();
    let sessions = SessionManager::new(Arc::clone(&store));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("peek-io")
        .build()
        .context("Failed to start async runtime")?;
    let client = Arc::new(WorkflowClient::new(config.http_timeout)?);
    let dispatcher = QueryDispatcher::new(client, runtime.handle().clone());

    let (ui, queue) = ui_queue::channel();

    let input: Box<dyn AudioInput> = match CpalInput::new() {
        Ok(input) => Box::new(input),
        Err(err) => {
            warn!("microphone unavailable: {err:#}");
            Box::new(NoMicrophone(format!("{err:#}")))
        }
    };
    let transcriber = Arc::new(HttpTranscriber::new(
        config.transcribe_url.clone(),
        config.transcribe_api_key.clone(),
        config.http_timeout,
    ));
    let voice = VoiceController::new(
        settings.voice_mode,
        input,
        transcriber,
        config.max_recording_secs,
        overlay::voice_reporter(&ui),
    );

    if let Some(window) = app.get_webview_window(MAIN_WINDOW_LABEL) {
        let size = settings.window_size;
        if let Err(err) = window.set_size(LogicalSize::new(size.width, size.height)) {
            warn!("failed to size overlay window: {err}");
        }
        let _ = window.hide();
        let hide_tx = ui.clone();
        window.on_window_event(move |event| {
            if let WindowEvent::CloseRequested { api, .. } = event {
                api.prevent_close();
                hide_tx.post(UiEvent::Hide);
            }
        });
    }

    let screens = Arc::new(TauriScreens { app: app.clone() });
    let deps = OverlayDeps {
        store: Arc::clone(&store),
        sessions: sessions.clone(),
        voice,
        hotkeys: HotkeyManager::new(Box::new(TauriRegistrar { app: app.clone() })),
        dispatcher,
        screens: screens.clone(),
        tts: TtsPlayer::new(Arc::new(CommandSpeech::new(config.tts_command.clone()))),
        view: Box::new(WebviewSink { app: app.clone() }),
    };
    let overlay = Overlay::new(deps, ui.clone());
    std::thread::Builder::new()
        .name("peek-ui".into())
        .spawn(move || overlay.run(queue))
        .context("Failed to spawn UI thread")?;

    info!(settings = %store.path().display(), "peek ready");
    Ok(AppState {
        ui,
        store,
        sessions,
        screens,
        _runtime: runtime,
    })
}

struct NoMicrophone(String);

impl AudioInput for NoMicrophone {
    fn start(&mut self, _buffer: CaptureBuffer) -> Result<()> {
        Err(anyhow!("{}", self.0))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

struct TauriRegistrar {
    app: AppHandle<AppRuntime>,
}

impl ShortcutRegistrar for TauriRegistrar {
    fn register(&mut self, accelerator: &str, handler: EdgeHandler) -> Result<(), HotkeyError> {
        self.app
            .global_shortcut()
            .on_shortcut(accelerator, move |_app, _shortcut, event| {
                let edge = match event.state {
                    ShortcutState::Pressed => KeyEdge::Pressed,
                    ShortcutState::Released => KeyEdge::Released,
                };
                handler(edge);
            })
            .map_err(|err| HotkeyError::Register {
                accelerator: accelerator.to_string(),
                reason: err.to_string(),
            })
    }

    fn unregister(&mut self, accelerator: &str) -> Result<(), HotkeyError> {
        self.app
            .global_shortcut()
            .unregister(accelerator)
            .map_err(|err| HotkeyError::Unregister {
                accelerator: accelerator.to_string(),
                reason: err.to_string(),
            })
    }
}

struct WebviewSink {
    app: AppHandle<AppRuntime>,
}

impl ViewSink for WebviewSink {
    fn render(&mut self, view: &OverlayView) {
        if let Err(err) = self.app.emit(EVENT_VIEW, view.clone()) {
            warn!("failed to emit {EVENT_VIEW}: {err}");
        }
    }

    fn set_window_visible(&mut self, visible: bool) {
        let Some(window) = self.app.get_webview_window(MAIN_WINDOW_LABEL) else {
            return;
        };
        let result = if visible {
            window.show().and_then(|_| window.set_focus())
        } else {
            window.hide()
        };
        if let Err(err) = result {
            warn!(visible, "failed to change overlay visibility: {err}");
        }
    }

    fn wait_until_hidden(&mut self, timeout: Duration) -> bool {
        let Some(window) = self.app.get_webview_window(MAIN_WINDOW_LABEL) else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while window.is_visible().unwrap_or(false) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(HIDE_SETTLE);
        true
    }
}

struct TauriScreens {
    app: AppHandle<AppRuntime>,
}

impl ScreenCapture for TauriScreens {
    fn monitors(&self) -> Result<Vec<MonitorInfo>> {
        let monitors = self
            .app
            .available_monitors()
            .context("Failed to enumerate monitors")?;
        Ok(monitors
            .iter()
            .enumerate()
            .map(|(i, monitor)| {
                let position = monitor.position();
                let size = monitor.size();
                MonitorInfo::new(i + 1, position.x, position.y, size.width, size.height)
            })
            .collect())
    }

    fn capture_png(&self, monitor: &MonitorInfo) -> Result<Vec<u8>> {
        capture_region_with_tool(monitor)
    }
}

fn post(state: &AppState, event: UiEvent) -> Result<(), String> {
    if state.ui.post(event) {
        Ok(())
    } else {
        error!("overlay thread is gone");
        Err("Overlay is not running".into())
    }
}

#[tauri::command]
fn get_settings(state: tauri::State<AppState>) -> Settings {
    state.store.load()
}

#[tauri::command]
fn update_settings(update: SettingsUpdate, state: tauri::State<AppState>) -> Result<Settings, String> {
    let changes = state
        .store
        .update(|settings| Ok(settings.apply(update)?))
        .map_err(|err| err.to_string())?;
    post(&state, UiEvent::SettingsChanged(changes))?;
    Ok(state.store.load())
}

#[tauri::command]
fn set_input(text: String, state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::InputChanged(text))
}

#[tauri::command]
fn submit_query(query: String, state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::InputChanged(query))?;
    post(&state, UiEvent::Submit)
}

#[tauri::command]
fn set_complexity(complexity: Complexity, state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::SetComplexity(complexity))
}

#[tauri::command]
fn set_include_screenshot(include: bool, state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::SetIncludeScreenshot(include))
}

#[tauri::command]
fn select_monitor(index: usize, state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::SelectMonitor(index))
}

#[tauri::command]
fn retry_query(state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::Retry)
}

#[tauri::command]
fn new_chat(state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::NewChat)
}

#[tauri::command]
fn open_session(id: String, state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::OpenSession(id))
}

#[tauri::command]
fn delete_session(id: String, state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::DeleteSession(id))
}

#[tauri::command]
fn get_sessions(state: tauri::State<AppState>) -> Vec<SessionSummary> {
    state.sessions.get_sessions()
}

#[tauri::command]
fn get_session_messages(id: String, state: tauri::State<AppState>) -> Vec<Message> {
    state.sessions.get_session_messages(&id)
}

#[tauri::command]
fn toggle_voice(state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::VoiceToggle)
}

#[tauri::command]
fn stop_speech(state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::StopSpeech)
}

#[tauri::command]
fn hide_overlay(state: tauri::State<AppState>) -> Result<(), String> {
    post(&state, UiEvent::Hide)
}

#[tauri::command]
fn list_monitors(state: tauri::State<AppState>) -> Result<Vec<MonitorInfo>, String> {
    state.screens.monitors().map_err(|err| format!("{err:#}"))
}

#[derive(Serialize, Clone)]
struct VoiceOption {
    key: &'static str,
    name: &'static str,
}

#[tauri::command]
fn list_voices() -> Vec<VoiceOption> {
    TtsVoice::ALL
        .iter()
        .map(|voice| VoiceOption {
            key: voice.key(),
            name: voice.neural_name(),
        })
        .collect()
}
