//! The overlay model. All UI state lives here and is only touched from the
//! thread that drains the [`UiQueue`]; workers report back by posting events.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchOutcome, QueryDispatcher, QueryRequest};
use crate::hotkeys::{Action, HotkeyManager, VoiceActions};
use crate::screen::{capture_monitor, ScreenCapture};
use crate::sessions::SessionManager;
use crate::settings::{Complexity, Message, Role, SettingsChanges, VoiceMode};
use crate::store::SettingsStore;
use crate::tts::{SpeechResult, TtsPlayer};
use crate::ui_queue::{QueueClosed, UiQueue, UiSender};
use crate::voice::{
    ReportCallback, StopOutcome, TranscriptionOutcome, TranscriptionReport, VoiceController,
    VoiceState,
};

pub const AUTO_SUBMIT_DELAY: Duration = Duration::from_millis(300);
const HIDE_TIMEOUT: Duration = Duration::from_millis(500);
const IDLE_WAIT: Duration = Duration::from_millis(250);

pub const PLACEHOLDER_IDLE: &str = "Ask a question...";
pub const PLACEHOLDER_TOGGLE_LISTENING: &str = "Listening... (press again to stop)";
pub const PLACEHOLDER_PTT_LISTENING: &str = "Listening... (release to send)";
pub const PLACEHOLDER_TRANSCRIBING: &str = "Transcribing...";

#[derive(Debug, Clone)]
pub enum UiEvent {
    ToggleOverlay,
    Show,
    Hide,
    InputChanged(String),
    SetComplexity(Complexity),
    SetIncludeScreenshot(bool),
    SelectMonitor(usize),
    Submit,
    Retry,
    NewChat,
    OpenSession(String),
    DeleteSession(String),
    VoiceToggle,
    VoiceKeyDown,
    VoiceKeyUp,
    Transcribed(TranscriptionReport),
    AutoSubmit,
    DispatchFinished {
        session_id: String,
        query: String,
        outcome: DispatchOutcome,
    },
    SpeechFinished(SpeechResult),
    StopSpeech,
    SettingsChanged(SettingsChanges),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
    pub text: String,
    pub is_error: bool,
}

/// Everything the window needs to draw itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayView {
    pub visible: bool,
    pub input: String,
    pub placeholder: String,
    pub input_enabled: bool,
    pub busy: bool,
    pub voice: VoiceState,
    pub voice_mode: VoiceMode,
    pub result: Option<ResultView>,
    pub show_retry: bool,
    pub session_id: Option<String>,
    pub messages: Vec<Message>,
    pub complexity: Complexity,
    pub include_screenshot: bool,
    pub selected_monitor: usize,
    pub speaking: bool,
}

impl Default for OverlayView {
    fn default() -> Self {
        Self {
            visible: false,
            input: String::new(),
            placeholder: PLACEHOLDER_IDLE.into(),
            input_enabled: true,
            busy: false,
            voice: VoiceState::Idle,
            voice_mode: VoiceMode::Toggle,
            result: None,
            show_retry: false,
            session_id: None,
            messages: Vec::new(),
            complexity: Complexity::default(),
            include_screenshot: true,
            selected_monitor: 1,
            speaking: false,
        }
    }
}

/// The window surface.
pub trait ViewSink: Send {
    fn render(&mut self, view: &OverlayView);
    fn set_window_visible(&mut self, visible: bool);

    /// Blocks until a requested hide has reached the screen, or `timeout`
    /// passes. Returns false on timeout.
    fn wait_until_hidden(&mut self, _timeout: Duration) -> bool {
        true
    }
}

/// A submitted question and the options it was sent with, kept for Retry.
#[derive(Debug, Clone)]
struct Attempt {
    query: String,
    complexity: Complexity,
    include_screenshot: bool,
}

pub struct OverlayDeps {
    pub store: Arc<SettingsStore>,
    pub sessions: SessionManager,
    pub voice: VoiceController,
    pub hotkeys: HotkeyManager,
    pub dispatcher: QueryDispatcher,
    pub screens: Arc<dyn ScreenCapture>,
    pub tts: TtsPlayer,
    pub view: Box<dyn ViewSink>,
}

/// Transcription reports go straight back onto the UI queue.
pub fn voice_reporter(ui: &UiSender<UiEvent>) -> ReportCallback {
    let ui = ui.clone();
    Arc::new(move |report| {
        ui.post(UiEvent::Transcribed(report));
    })
}

pub struct Overlay {
    store: Arc<SettingsStore>,
    sessions: SessionManager,
    voice: VoiceController,
    hotkeys: HotkeyManager,
    dispatcher: QueryDispatcher,
    screens: Arc<dyn ScreenCapture>,
    tts: TtsPlayer,
    sink: Box<dyn ViewSink>,
    ui: UiSender<UiEvent>,
    view: OverlayView,
    last_attempt: Option<Attempt>,
}

impl Overlay {
    pub fn new(deps: OverlayDeps, ui: UiSender<UiEvent>) -> Self {
        let mut view = OverlayView::default();
        deps.store.read(|settings| {
            view.include_screenshot = settings.include_screenshot;
            view.selected_monitor = settings.selected_monitor;
            view.voice_mode = settings.voice_mode;
        });
        let mut voice = deps.voice;
        voice.set_mode(view.voice_mode);

        Self {
            store: deps.store,
            sessions: deps.sessions,
            voice,
            hotkeys: deps.hotkeys,
            dispatcher: deps.dispatcher,
            screens: deps.screens,
            tts: deps.tts,
            sink: deps.view,
            ui,
            view,
            last_attempt: None,
        }
    }

    pub fn view(&self) -> &OverlayView {
        &self.view
    }

    /// Registers both hotkeys and draws the initial (hidden) view.
    pub fn start(&mut self) {
        self.bind_overlay_hotkey();
        self.bind_voice_hotkey();
        self.render();
    }

    /// Drains the queue until `Shutdown` or until every sender is gone.
    pub fn run(mut self, mut queue: UiQueue<UiEvent>) {
        self.start();
        loop {
            let events = match queue.wait(IDLE_WAIT) {
                Ok(events) => events,
                Err(QueueClosed) => break,
            };
            for event in events {
                if !self.handle(event) {
                    info!("overlay shutting down");
                    return;
                }
            }
        }
        self.shutdown();
    }

    /// Applies one event. Returns false once the overlay has shut down.
    pub fn handle(&mut self, event: UiEvent) -> bool {
        match event {
            UiEvent::ToggleOverlay => {
                if self.view.visible {
                    self.hide();
                } else {
                    self.show();
                }
            }
            UiEvent::Show => self.show(),
            UiEvent::Hide => self.hide(),
            UiEvent::InputChanged(text) => {
                if self.view.input_enabled {
                    self.view.input = text;
                }
            }
            UiEvent::SetComplexity(complexity) => self.view.complexity = complexity,
            UiEvent::SetIncludeScreenshot(include) => {
                self.persist("include_screenshot", |s| s.include_screenshot = include);
                self.view.include_screenshot = include;
            }
            UiEvent::SelectMonitor(index) => {
                let index = index.max(1);
                self.persist("selected_monitor", |s| s.selected_monitor = index);
                self.view.selected_monitor = index;
            }
            UiEvent::Submit | UiEvent::AutoSubmit => self.submit(),
            UiEvent::Retry => self.retry(),
            UiEvent::NewChat => self.new_chat(),
            UiEvent::OpenSession(id) => self.open_session(&id),
            UiEvent::DeleteSession(id) => self.delete_session(&id),
            UiEvent::VoiceToggle => {
                if let Err(err) = self.voice.toggle() {
                    self.show_mic_error(&format!("{err:#}"));
                }
            }
            UiEvent::VoiceKeyDown => {
                if let Err(err) = self.voice.key_down(self.view.visible) {
                    self.show_mic_error(&format!("{err:#}"));
                }
            }
            UiEvent::VoiceKeyUp => {
                if self.voice.key_up() == StopOutcome::Discarded {
                    debug!("push-to-talk release too short");
                }
            }
            UiEvent::Transcribed(report) => self.on_transcribed(report),
            UiEvent::DispatchFinished {
                session_id,
                query,
                outcome,
            } => self.on_dispatch_finished(session_id, query, outcome),
            UiEvent::SpeechFinished(result) => {
                if let Some(error) = result.error {
                    warn!("speech playback failed: {error}");
                }
                self.view.speaking = self.tts.is_speaking();
            }
            UiEvent::StopSpeech => {
                self.tts.stop();
                self.view.speaking = false;
            }
            UiEvent::SettingsChanged(changes) => self.on_settings_changed(changes),
            UiEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        self.render();
        true
    }

    fn show(&mut self) {
        self.view.visible = true;
        self.sink.set_window_visible(true);
        if !self.store.read(|s| s.first_run_complete) {
            self.persist("first_run_complete", |s| s.first_run_complete = true);
        }
        if !self.view.busy {
            self.view.input_enabled = true;
        }
    }

    fn hide(&mut self) {
        self.view.visible = false;
        self.sink.set_window_visible(false);
    }

    fn submit(&mut self) {
        if self.view.busy {
            debug!("dispatch already in flight; submit ignored");
            return;
        }
        let query = self.view.input.trim().to_string();
        if query.is_empty() {
            return;
        }
        let attempt = Attempt {
            query,
            complexity: self.view.complexity,
            include_screenshot: self.store.read(|s| s.include_screenshot),
        };
        self.start_dispatch(attempt);
    }

    fn retry(&mut self) {
        if self.view.busy {
            return;
        }
        if let Some(attempt) = self.last_attempt.clone() {
            info!("retrying last query");
            self.start_dispatch(attempt);
        }
    }

    fn start_dispatch(&mut self, attempt: Attempt) {
        let session_id = match self.view.session_id.clone() {
            Some(id) => id,
            None => match self.sessions.create_session() {
                Ok(id) => {
                    self.view.session_id = Some(id.clone());
                    id
                }
                Err(err) => {
                    warn!("failed to create session: {err:#}");
                    self.show_result(format!("Error: {err:#}"), true);
                    return;
                }
            },
        };

        let settings = self.store.load();
        let screenshot = if attempt.include_screenshot {
            self.capture_hidden(settings.selected_monitor)
        } else {
            None
        };

        let query = attempt.query.clone();
        let complexity = attempt.complexity;
        self.last_attempt = Some(attempt);
        self.view.busy = true;
        self.view.input_enabled = false;
        self.view.show_retry = false;
        self.view.result = None;

        let request = QueryRequest {
            query: query.clone(),
            screenshot,
            complexity,
            session_id: Some(session_id.clone()),
            tts_enabled: settings.tts_enabled,
        };
        let ui = self.ui.clone();
        self.dispatcher
            .spawn(settings.webhook_url, request, move |outcome| {
                ui.post(UiEvent::DispatchFinished {
                    session_id,
                    query,
                    outcome,
                });
            });
    }

    /// Takes the screenshot with the overlay out of the way.
    fn capture_hidden(&mut self, monitor: usize) -> Option<Vec<u8>> {
        let was_visible = self.view.visible;
        if was_visible {
            self.sink.set_window_visible(false);
            if !self.sink.wait_until_hidden(HIDE_TIMEOUT) {
                warn!("overlay still on screen after {HIDE_TIMEOUT:?}; capturing anyway");
            }
        }
        let shot = match capture_monitor(self.screens.as_ref(), monitor) {
            Ok(png) => Some(png),
            Err(err) => {
                warn!("screen capture failed; sending without screenshot: {err:#}");
                None
            }
        };
        if was_visible {
            self.sink.set_window_visible(true);
        }
        shot
    }

    fn on_dispatch_finished(&mut self, session_id: String, query: String, outcome: DispatchOutcome) {
        self.view.busy = false;
        self.view.input_enabled = true;
        let current = self.view.session_id.as_deref() == Some(session_id.as_str());

        // Errors are stored as the reply as well.
        if let Err(err) = self.sessions.save_interaction(&session_id, &query, &outcome.text) {
            warn!(session = %session_id, "failed to save interaction: {err:#}");
        }
        if !current {
            debug!(session = %session_id, "reply for a session no longer shown");
            return;
        }

        self.view.messages = self.sessions.get_session_messages(&session_id);
        if outcome.failed {
            self.show_result(outcome.text, true);
            return;
        }
        self.view.input.clear();
        self.last_attempt = None;
        self.speak(&outcome.text);
        self.show_result(outcome.text, false);
    }

    fn speak(&mut self, text: &str) {
        let (enabled, voice, speed) = self
            .store
            .read(|s| (s.tts_enabled, s.tts_voice, s.tts_speed));
        if !enabled {
            return;
        }
        let ui = self.ui.clone();
        self.tts.play(text, voice, speed, move |result| {
            ui.post(UiEvent::SpeechFinished(result));
        });
        self.view.speaking = self.tts.is_speaking();
    }

    fn show_result(&mut self, text: String, is_error: bool) {
        self.view.result = Some(ResultView { text, is_error });
        self.view.show_retry = is_error;
    }

    fn new_chat(&mut self) {
        self.view.session_id = None;
        self.view.messages.clear();
        self.view.input.clear();
        self.view.result = None;
        self.view.show_retry = false;
        self.last_attempt = None;
    }

    fn open_session(&mut self, id: &str) {
        if !self.sessions.exists(id) {
            warn!(session = %id, "cannot open unknown session");
            return;
        }
        self.new_chat();
        self.view.messages = self.sessions.get_session_messages(id);
        self.view.result = self
            .view
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| ResultView {
                text: m.content.clone(),
                is_error: false,
            });
        self.view.session_id = Some(id.to_string());
    }

    fn delete_session(&mut self, id: &str) {
        match self.sessions.delete_session(id) {
            Ok(true) if self.view.session_id.as_deref() == Some(id) => self.new_chat(),
            Ok(_) => {}
            Err(err) => warn!(session = %id, "failed to delete session: {err:#}"),
        }
    }

    fn on_transcribed(&mut self, report: TranscriptionReport) {
        if !self.voice.accept(&report) {
            return;
        }
        match report.outcome {
            TranscriptionOutcome::Text(text) => {
                if self.view.input.trim().is_empty() {
                    self.view.input = text;
                } else {
                    self.view.input = format!("{} {}", self.view.input.trim_end(), text);
                }
                if report.mode == VoiceMode::PushToTalk {
                    self.ui.post_after(AUTO_SUBMIT_DELAY, UiEvent::AutoSubmit);
                }
            }
            TranscriptionOutcome::Empty => debug!("empty transcription ignored"),
            TranscriptionOutcome::Failed(error) => self.show_mic_error(&error),
        }
    }

    fn show_mic_error(&mut self, error: &str) {
        warn!("microphone error: {error}");
        if self.view.input_enabled {
            self.view.input = format!("[Mic Error: {error}]");
        }
    }

    fn on_settings_changed(&mut self, changes: SettingsChanges) {
        let settings = self.store.load();
        self.view.include_screenshot = settings.include_screenshot;
        self.view.selected_monitor = settings.selected_monitor;
        self.view.voice_mode = settings.voice_mode;
        if changes.overlay_hotkey && changes.voice_binding {
            // The two keys may have been swapped; neither can be installed
            // while the other still holds it.
            self.hotkeys.unbind_all();
        }
        if changes.overlay_hotkey {
            self.bind_overlay_hotkey();
        }
        if changes.voice_binding {
            self.voice.set_mode(settings.voice_mode);
            self.bind_voice_hotkey();
        }
    }

    fn bind_overlay_hotkey(&mut self) {
        let accelerator = self.store.read(|s| s.hotkey.clone());
        let ui = self.ui.clone();
        let on_press: Action = Arc::new(move || {
            ui.post(UiEvent::ToggleOverlay);
        });
        if let Err(err) = self.hotkeys.bind_overlay(&accelerator, on_press) {
            warn!("overlay hotkey unavailable: {err}");
        }
    }

    fn bind_voice_hotkey(&mut self) {
        let (mode, accelerator) = self.store.read(|s| (s.voice_mode, s.voice_hotkey.clone()));
        let post = |event: fn() -> UiEvent| -> Action {
            let ui = self.ui.clone();
            Arc::new(move || {
                ui.post(event());
            })
        };
        let actions = VoiceActions {
            toggle: post(|| UiEvent::VoiceToggle),
            press: post(|| UiEvent::VoiceKeyDown),
            release: post(|| UiEvent::VoiceKeyUp),
        };
        if let Err(err) = self.hotkeys.bind_voice(mode, &accelerator, actions) {
            warn!("voice hotkey unavailable: {err}");
        }
    }

    fn persist(&self, what: &str, f: impl FnOnce(&mut crate::settings::Settings)) {
        if let Err(err) = self.store.update(|settings| {
            f(settings);
            Ok(())
        }) {
            warn!("failed to save {what}: {err:#}");
        }
    }

    fn shutdown(&mut self) {
        self.voice.cancel();
        self.tts.stop();
        self.hotkeys.unbind_all();
    }

    fn render(&mut self) {
        self.view.voice = self.voice.state();
        self.view.voice_mode = self.voice.mode();
        self.view.placeholder = match (self.view.voice, self.view.voice_mode) {
            (VoiceState::Recording, VoiceMode::Toggle) => PLACEHOLDER_TOGGLE_LISTENING,
            (VoiceState::Recording, VoiceMode::PushToTalk) => PLACEHOLDER_PTT_LISTENING,
            (VoiceState::Transcribing, _) => PLACEHOLDER_TRANSCRIBING,
            (VoiceState::Idle, _) => PLACEHOLDER_IDLE,
        }
        .to_string();
        self.sink.render(&self.view);
    }
}
