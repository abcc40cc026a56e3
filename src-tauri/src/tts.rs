use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::settings::{TtsVoice, MAX_TTS_SPEED, MIN_TTS_SPEED};

pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BASE_WORDS_PER_MINUTE: f32 = 175.0;

/// Signed percentage relative to normal speed: `1.25` is `+25%`.
pub fn rate_string(speed: f32) -> String {
    let percent = ((clamp_speed(speed) - 1.0) * 100.0).round() as i32;
    if percent >= 0 {
        format!("+{percent}%")
    } else {
        format!("{percent}%")
    }
}

pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_finite() {
        speed.clamp(MIN_TTS_SPEED, MAX_TTS_SPEED)
    } else {
        1.0
    }
}

fn markdown_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?s)```.*?```", " "),
            (r"`([^`]*)`", "$1"),
            (r"!\[([^\]]*)\]\([^)]*\)", "$1"),
            (r"\[([^\]]*)\]\([^)]*\)", "$1"),
            (r"(?m)^\s{0,3}#{1,6}\s*", ""),
            (r"(?m)^\s*(?:[-*+]|\d+\.)\s+", ""),
            (r"(?m)^\s*>\s?", ""),
            (r"(\*\*|__|\*|~~)", ""),
            (r"\s+", " "),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(re) => Some((re, replacement)),
            Err(err) => {
                warn!("bad markdown pattern {pattern}: {err}");
                None
            }
        })
        .collect()
    })
}

/// Plain text suitable for reading aloud.
pub fn speech_text(markdown: &str) -> String {
    let mut text = markdown.to_string();
    for (re, replacement) in markdown_rules() {
        text = re.replace_all(&text, *replacement).into_owned();
    }
    text.trim().to_string()
}

/// Cooperative cancellation shared between the player and a playback.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Speaks `text` to completion, checking `stop` at least every
/// [`STOP_POLL_INTERVAL`].
pub trait SpeechBackend: Send + Sync {
    fn speak(&self, text: &str, voice: TtsVoice, speed: f32, stop: &StopFlag) -> Result<()>;
}

/// Local speech through an espeak-compatible command.
pub struct CommandSpeech {
    program: String,
}

impl CommandSpeech {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(text: &str, voice: TtsVoice, speed: f32) -> Vec<String> {
        let variant = if voice.is_male() { "en-us+m3" } else { "en-us+f3" };
        let wpm = (BASE_WORDS_PER_MINUTE * clamp_speed(speed)).round() as u32;
        vec![
            "-v".into(),
            variant.into(),
            "-s".into(),
            wpm.to_string(),
            "--".into(),
            text.into(),
        ]
    }
}

impl SpeechBackend for CommandSpeech {
    fn speak(&self, text: &str, voice: TtsVoice, speed: f32, stop: &StopFlag) -> Result<()> {
        debug!(voice = voice.neural_name(), rate = %rate_string(speed), "speaking");
        let mut child = Command::new(&self.program)
            .args(Self::args(text, voice, speed))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start `{}`", self.program))?;

        loop {
            if stop.is_stopped() {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(());
            }
            match child.try_wait().context("Failed to poll speech process")? {
                Some(status) if status.success() => return Ok(()),
                Some(status) => return Err(anyhow!("`{}` exited with {status}", self.program)),
                None => std::thread::sleep(STOP_POLL_INTERVAL),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechResult {
    pub error: Option<String>,
    pub interrupted: bool,
}

struct Playback {
    stop: StopFlag,
    done: Arc<AtomicBool>,
}

/// At most one playback at a time; starting another stops the current one.
pub struct TtsPlayer {
    backend: Arc<dyn SpeechBackend>,
    current: Mutex<Option<Playback>>,
}

impl TtsPlayer {
    pub fn new(backend: Arc<dyn SpeechBackend>) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
        }
    }

    pub fn play<F>(&self, text: &str, voice: TtsVoice, speed: f32, on_done: F)
    where
        F: FnOnce(SpeechResult) + Send + 'static,
    {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            previous.stop.stop();
        }

        let text = speech_text(text);
        if text.is_empty() {
            on_done(SpeechResult {
                error: None,
                interrupted: false,
            });
            return;
        }

        let stop = StopFlag::default();
        let done = Arc::new(AtomicBool::new(false));
        let backend = Arc::clone(&self.backend);
        let speed = clamp_speed(speed);
        let worker_stop = stop.clone();
        let worker_done = done.clone();

        let spawned = std::thread::Builder::new()
            .name("peek-tts".into())
            .spawn(move || {
                let result = backend.speak(&text, voice, speed, &worker_stop);
                worker_done.store(true, Ordering::SeqCst);
                let error = result.err().map(|err| {
                    warn!("speech failed: {err:#}");
                    format!("{err:#}")
                });
                on_done(SpeechResult {
                    error,
                    interrupted: worker_stop.is_stopped(),
                });
            });

        match spawned {
            Ok(_) => *current = Some(Playback { stop, done }),
            Err(err) => warn!("failed to spawn speech worker: {err}"),
        }
    }

    pub fn stop(&self) {
        if let Some(playback) = self.current.lock().take() {
            playback.stop.stop();
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|p| !p.done.load(Ordering::SeqCst) && !p.stop.is_stopped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn rate_is_signed_percentage() {
        assert_eq!(rate_string(1.0), "+0%");
        assert_eq!(rate_string(1.25), "+25%");
        assert_eq!(rate_string(0.75), "-25%");
        assert_eq!(rate_string(5.0), "+100%");
        assert_eq!(rate_string(0.1), "-50%");
    }

    #[test]
    fn markdown_is_stripped_for_speech() {
        let md = "# Title\n\nSome **bold** and `code`.\n\n- item one\n- [link](http://x.test)\n\n```rust\nfn main() {}\n```\nDone.";
        assert_eq!(speech_text(md), "Title Some bold and code. item one link Done.");
    }

    #[test]
    fn espeak_args_follow_voice_and_speed() {
        let args = CommandSpeech::args("hi", TtsVoice::Guy, 2.0);
        assert_eq!(args, vec!["-v", "en-us+m3", "-s", "350", "--", "hi"]);
    }

    /// Speaks until stopped, or for `ticks` polls.
    struct Holding {
        ticks: usize,
    }

    impl SpeechBackend for Holding {
        fn speak(&self, _: &str, _: TtsVoice, _: f32, stop: &StopFlag) -> Result<()> {
            for _ in 0..self.ticks {
                if stop.is_stopped() {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    #[test]
    fn new_playback_interrupts_the_previous_one() {
        let player = TtsPlayer::new(Arc::new(Holding { ticks: 1_000 }));
        let (tx, rx) = unbounded();

        let first = tx.clone();
        player.play("first", TtsVoice::Jenny, 1.0, move |r| {
            let _ = first.send(("first", r));
        });
        assert!(player.is_speaking());
        player.play("second", TtsVoice::Jenny, 1.0, move |r| {
            let _ = tx.send(("second", r));
        });

        let (name, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name, "first");
        assert!(result.interrupted);

        player.stop();
        assert!(!player.is_speaking());
        let (name, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name, "second");
        assert!(result.interrupted);
        assert!(result.error.is_none());
    }

    #[test]
    fn missing_program_reports_an_error() {
        let player = TtsPlayer::new(Arc::new(CommandSpeech::new("peek-no-such-speaker")));
        let (tx, rx) = unbounded();
        player.play("hello", TtsVoice::Default, 1.0, move |r| {
            let _ = tx.send(r);
        });
        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(result.error.unwrap().contains("peek-no-such-speaker"));
    }
}
