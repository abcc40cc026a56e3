use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::settings::VoiceMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEdge {
    Pressed,
    Released,
}

pub type EdgeHandler = Arc<dyn Fn(KeyEdge) + Send + Sync>;
pub type Action = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HotkeyError {
    #[error("hotkey is empty")]
    Empty,
    #[error("failed to register `{accelerator}`: {reason}")]
    Register { accelerator: String, reason: String },
    #[error("failed to unregister `{accelerator}`: {reason}")]
    Unregister { accelerator: String, reason: String },
}

/// OS-level global shortcut registration. The handler receives both edges
/// of every physical press.
pub trait ShortcutRegistrar: Send {
    fn register(&mut self, accelerator: &str, handler: EdgeHandler) -> Result<(), HotkeyError>;
    fn unregister(&mut self, accelerator: &str) -> Result<(), HotkeyError>;
}

/// What the voice hotkey currently does.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VoiceBinding {
    #[default]
    Unbound,
    Toggle { accelerator: String },
    PushToTalk { accelerator: String },
}

impl VoiceBinding {
    fn accelerator(&self) -> Option<&str> {
        match self {
            VoiceBinding::Unbound => None,
            VoiceBinding::Toggle { accelerator } | VoiceBinding::PushToTalk { accelerator } => {
                Some(accelerator)
            }
        }
    }
}

#[derive(Clone)]
pub struct VoiceActions {
    pub toggle: Action,
    pub press: Action,
    pub release: Action,
}

/// Owns both global hotkeys. Every rebind removes the current binding before
/// the new one is installed, so a key never has two live handlers.
pub struct HotkeyManager {
    registrar: Box<dyn ShortcutRegistrar>,
    overlay: Option<String>,
    voice: VoiceBinding,
}

impl HotkeyManager {
    pub fn new(registrar: Box<dyn ShortcutRegistrar>) -> Self {
        Self {
            registrar,
            overlay: None,
            voice: VoiceBinding::Unbound,
        }
    }

    pub fn overlay_accelerator(&self) -> Option<&str> {
        self.overlay.as_deref()
    }

    pub fn voice_binding(&self) -> &VoiceBinding {
        &self.voice
    }

    pub fn bind_overlay(&mut self, accelerator: &str, on_press: Action) -> Result<(), HotkeyError> {
        if let Some(previous) = self.overlay.take() {
            self.release(&previous);
        }
        let accelerator = checked(accelerator)?;
        let handler: EdgeHandler = Arc::new(move |edge| {
            if edge == KeyEdge::Pressed {
                on_press();
            }
        });
        self.install(&accelerator, handler)?;
        info!(%accelerator, "overlay hotkey registered");
        self.overlay = Some(accelerator);
        Ok(())
    }

    pub fn bind_voice(
        &mut self,
        mode: VoiceMode,
        accelerator: &str,
        actions: VoiceActions,
    ) -> Result<(), HotkeyError> {
        if let Some(previous) = self.voice.accelerator().map(str::to_string) {
            self.release(&previous);
        }
        self.voice = VoiceBinding::Unbound;

        let accelerator = checked(accelerator)?;
        let handler: EdgeHandler = match mode {
            VoiceMode::Toggle => Arc::new(move |edge| {
                if edge == KeyEdge::Pressed {
                    (actions.toggle)();
                }
            }),
            VoiceMode::PushToTalk => Arc::new(move |edge| match edge {
                KeyEdge::Pressed => (actions.press)(),
                KeyEdge::Released => (actions.release)(),
            }),
        };
        self.install(&accelerator, handler)?;
        info!(%accelerator, ?mode, "voice hotkey registered");
        self.voice = match mode {
            VoiceMode::Toggle => VoiceBinding::Toggle { accelerator },
            VoiceMode::PushToTalk => VoiceBinding::PushToTalk { accelerator },
        };
        Ok(())
    }

    pub fn unbind_all(&mut self) {
        if let Some(accelerator) = self.overlay.take() {
            self.release(&accelerator);
        }
        if let Some(accelerator) = self.voice.accelerator().map(str::to_string) {
            self.release(&accelerator);
        }
        self.voice = VoiceBinding::Unbound;
    }

    fn install(&mut self, accelerator: &str, handler: EdgeHandler) -> Result<(), HotkeyError> {
        self.registrar.register(accelerator, handler).map_err(|err| {
            warn!("{err}");
            err
        })
    }

    fn release(&mut self, accelerator: &str) {
        if let Err(err) = self.registrar.unregister(accelerator) {
            warn!("{err}");
        }
    }
}

fn checked(accelerator: &str) -> Result<String, HotkeyError> {
    let accelerator = accelerator.trim();
    if accelerator.is_empty() {
        return Err(HotkeyError::Empty);
    }
    Ok(accelerator.to_string())
}
