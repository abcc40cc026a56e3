use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::settings::VoiceMode;
use crate::transcription::{normalize_transcript, prepare_waveform};

pub const MIN_RECORDING_DURATION_MS: u64 = 300;
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Idle,
    Recording,
    Transcribing,
}

/// Mono samples captured so far, shared with the audio callback.
#[derive(Clone)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<CaptureInner>>,
}

struct CaptureInner {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    max_secs: u64,
    truncated: bool,
}

/// A finished capture, already downmixed.
#[derive(Debug, Clone, Default)]
pub struct CapturedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl CapturedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

impl CaptureBuffer {
    pub fn new(max_secs: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureInner {
                samples: Vec::new(),
                sample_rate: TARGET_SAMPLE_RATE,
                channels: 1,
                max_secs,
                truncated: false,
            })),
        }
    }

    /// Called by the input once the device format is known. Clears any
    /// samples from a previous take.
    pub fn configure(&self, sample_rate: u32, channels: u16) {
        let mut inner = self.inner.lock();
        inner.sample_rate = sample_rate;
        inner.channels = channels.max(1);
        inner.samples.clear();
        inner.truncated = false;
    }

    /// Appends interleaved frames, averaging channels down to mono. Frames
    /// past the recording cap are dropped.
    pub fn push_interleaved(&self, data: &[f32]) {
        let mut inner = self.inner.lock();
        let channels = inner.channels as usize;
        let cap = (inner.sample_rate as u64 * inner.max_secs) as usize;

        for frame in data.chunks_exact(channels) {
            if inner.samples.len() >= cap {
                if !inner.truncated {
                    inner.truncated = true;
                    warn!(
                        max_secs = inner.max_secs,
                        "recording reached its maximum length; dropping further audio"
                    );
                }
                return;
            }
            let sum: f32 = frame.iter().sum();
            inner.samples.push(sum / channels as f32);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.inner.lock().truncated
    }

    pub fn take(&self) -> CapturedAudio {
        let mut inner = self.inner.lock();
        CapturedAudio {
            samples: std::mem::take(&mut inner.samples),
            sample_rate: inner.sample_rate,
        }
    }
}

/// A microphone: streams into the buffer between `start` and `stop`.
pub trait AudioInput: Send {
    fn start(&mut self, buffer: CaptureBuffer) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

pub trait Transcriber: Send + Sync {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionOutcome {
    Text(String),
    Empty,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionReport {
    /// Matches the recording that produced it; stale reports are ignored.
    pub take: u64,
    pub mode: VoiceMode,
    pub outcome: TranscriptionOutcome,
}

pub type ReportCallback = Arc<dyn Fn(TranscriptionReport) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRecording,
    /// Shorter than the minimum; nothing sent for transcription.
    Discarded,
    Transcribing,
}

/// Recording lifecycle. Lives on the UI thread; only the transcription runs
/// elsewhere, and its result comes back through `on_report`.
pub struct VoiceController {
    state: VoiceState,
    mode: VoiceMode,
    recording_mode: VoiceMode,
    take: u64,
    input: Box<dyn AudioInput>,
    transcriber: Arc<dyn Transcriber>,
    buffer: CaptureBuffer,
    on_report: ReportCallback,
}

impl VoiceController {
    pub fn new(
        mode: VoiceMode,
        input: Box<dyn AudioInput>,
        transcriber: Arc<dyn Transcriber>,
        max_recording_secs: u64,
        on_report: ReportCallback,
    ) -> Self {
        Self {
            state: VoiceState::Idle,
            mode,
            recording_mode: mode,
            take: 0,
            input,
            transcriber,
            buffer: CaptureBuffer::new(max_recording_secs),
            on_report,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn mode(&self) -> VoiceMode {
        self.mode
    }

    /// Switching modes abandons a recording in progress.
    pub fn set_mode(&mut self, mode: VoiceMode) {
        if mode == self.mode {
            return;
        }
        if self.state == VoiceState::Recording {
            info!("voice mode changed while recording; discarding take");
            self.cancel();
        }
        self.mode = mode;
    }

    /// Returns false when a recording or transcription is already running.
    pub fn start_recording(&mut self) -> Result<bool> {
        if self.state != VoiceState::Idle {
            debug!(state = ?self.state, "ignoring start request");
            return Ok(false);
        }
        self.buffer.configure(TARGET_SAMPLE_RATE, 1);
        self.input.start(self.buffer.clone())?;
        self.take += 1;
        self.recording_mode = self.mode;
        self.state = VoiceState::Recording;
        info!(take = self.take, mode = ?self.mode, "recording started");
        Ok(true)
    }

    pub fn stop_recording(&mut self) -> StopOutcome {
        if self.state != VoiceState::Recording {
            debug!(state = ?self.state, "ignoring stop request");
            return StopOutcome::NotRecording;
        }
        if let Err(err) = self.input.stop() {
            warn!("failed to stop audio input: {err:#}");
        }

        let audio = self.buffer.take();
        let duration = audio.duration();
        if duration < Duration::from_millis(MIN_RECORDING_DURATION_MS) {
            info!(
                duration_ms = duration.as_millis() as u64,
                "recording too short; discarded"
            );
            self.state = VoiceState::Idle;
            return StopOutcome::Discarded;
        }

        self.state = VoiceState::Transcribing;
        let take = self.take;
        let mode = self.recording_mode;
        let transcriber = Arc::clone(&self.transcriber);
        let on_report = Arc::clone(&self.on_report);

        let spawned = std::thread::Builder::new()
            .name("peek-transcribe".into())
            .spawn(move || {
                let outcome = transcribe_take(transcriber.as_ref(), &audio);
                on_report(TranscriptionReport {
                    take,
                    mode,
                    outcome,
                });
            });

        if let Err(err) = spawned {
            error!("failed to spawn transcription worker: {err}");
            (self.on_report)(TranscriptionReport {
                take,
                mode,
                outcome: TranscriptionOutcome::Failed(err.to_string()),
            });
        }
        StopOutcome::Transcribing
    }

    /// One press in toggle mode.
    pub fn toggle(&mut self) -> Result<()> {
        match self.state {
            VoiceState::Idle => {
                self.start_recording()?;
            }
            VoiceState::Recording => {
                self.stop_recording();
            }
            VoiceState::Transcribing => debug!("transcription in progress; toggle ignored"),
        }
        Ok(())
    }

    /// Push-to-talk press. Only starts while the overlay is visible.
    pub fn key_down(&mut self, visible: bool) -> Result<bool> {
        if !visible {
            return Ok(false);
        }
        self.start_recording()
    }

    pub fn key_up(&mut self) -> StopOutcome {
        self.stop_recording()
    }

    /// Accepts a report for the current take and returns to `Idle`. Returns
    /// false for reports from a cancelled take.
    pub fn accept(&mut self, report: &TranscriptionReport) -> bool {
        if self.state != VoiceState::Transcribing || report.take != self.take {
            debug!(take = report.take, "dropping stale transcription");
            return false;
        }
        self.state = VoiceState::Idle;
        true
    }

    pub fn cancel(&mut self) {
        match self.state {
            VoiceState::Recording => {
                if let Err(err) = self.input.stop() {
                    warn!("failed to stop audio input: {err:#}");
                }
                self.buffer.take();
            }
            VoiceState::Transcribing => {
                // The worker keeps running; its report will not match.
                self.take += 1;
            }
            VoiceState::Idle => return,
        }
        self.state = VoiceState::Idle;
    }
}

fn transcribe_take(transcriber: &dyn Transcriber, audio: &CapturedAudio) -> TranscriptionOutcome {
    let waveform = prepare_waveform(&audio.samples, audio.sample_rate);
    match transcriber.transcribe(&waveform, TARGET_SAMPLE_RATE) {
        Ok(text) => {
            let text = normalize_transcript(&text);
            if text.is_empty() {
                TranscriptionOutcome::Empty
            } else {
                TranscriptionOutcome::Text(text)
            }
        }
        Err(err) => {
            warn!("transcription failed: {err:#}");
            TranscriptionOutcome::Failed(format!("{err:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeInput {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        samples: usize,
    }

    impl AudioInput for FakeInput {
        fn start(&mut self, buffer: CaptureBuffer) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            buffer.push_interleaved(&vec![0.1; self.samples]);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FixedTranscriber(std::result::Result<String, String>);

    impl Transcriber for FixedTranscriber {
        fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
            assert_eq!(sample_rate, TARGET_SAMPLE_RATE);
            assert!(!samples.is_empty());
            self.0.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    struct Harness {
        voice: VoiceController,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        reports: Receiver<TranscriptionReport>,
    }

    fn harness(mode: VoiceMode, samples: usize, reply: std::result::Result<&str, &str>) -> Harness {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let (tx, reports) = unbounded();
        let voice = VoiceController::new(
            mode,
            Box::new(FakeInput {
                starts: starts.clone(),
                stops: stops.clone(),
                samples,
            }),
            Arc::new(FixedTranscriber(
                reply.map(str::to_string).map_err(str::to_string),
            )),
            120,
            Arc::new(move |report| {
                let _ = tx.send(report);
            }),
        );
        Harness {
            voice,
            starts,
            stops,
            reports,
        }
    }

    fn next_report(h: &Harness) -> TranscriptionReport {
        h.reports
            .recv_timeout(Duration::from_secs(5))
            .expect("transcription report")
    }

    #[test]
    fn stop_while_idle_is_a_noop() {
        let mut h = harness(VoiceMode::Toggle, 16_000, Ok("hi"));
        assert_eq!(h.voice.stop_recording(), StopOutcome::NotRecording);
        assert_eq!(h.stops.load(Ordering::SeqCst), 0);
        assert!(h.reports.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn double_start_opens_one_stream() {
        let mut h = harness(VoiceMode::Toggle, 16_000, Ok("hi"));
        assert!(h.voice.start_recording().unwrap());
        assert!(!h.voice.start_recording().unwrap());
        assert_eq!(h.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.voice.state(), VoiceState::Recording);
    }

    #[test]
    fn toggle_cycles_through_transcription() {
        let mut h = harness(VoiceMode::Toggle, 16_000, Ok("  what is   this "));
        h.voice.toggle().unwrap();
        assert_eq!(h.voice.state(), VoiceState::Recording);
        h.voice.toggle().unwrap();
        assert_eq!(h.voice.state(), VoiceState::Transcribing);

        // Pressing again mid-transcription does nothing.
        h.voice.toggle().unwrap();
        assert_eq!(h.starts.load(Ordering::SeqCst), 1);

        let report = next_report(&h);
        assert_eq!(report.mode, VoiceMode::Toggle);
        assert_eq!(
            report.outcome,
            TranscriptionOutcome::Text("what is this".into())
        );
        assert!(h.voice.accept(&report));
        assert_eq!(h.voice.state(), VoiceState::Idle);
    }

    #[test]
    fn push_to_talk_needs_visibility_and_duplicate_edges_are_ignored() {
        let mut h = harness(VoiceMode::PushToTalk, 8_000, Ok("hello"));
        assert!(!h.voice.key_down(false).unwrap());
        assert_eq!(h.voice.state(), VoiceState::Idle);

        assert!(h.voice.key_down(true).unwrap());
        assert!(!h.voice.key_down(true).unwrap());
        assert_eq!(h.voice.key_up(), StopOutcome::Transcribing);
        assert_eq!(h.voice.key_up(), StopOutcome::NotRecording);
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);

        let report = next_report(&h);
        assert_eq!(report.mode, VoiceMode::PushToTalk);
        assert_eq!(report.outcome, TranscriptionOutcome::Text("hello".into()));
    }

    #[test]
    fn short_recordings_are_discarded() {
        let mut h = harness(VoiceMode::PushToTalk, 1_600, Ok("hello"));
        h.voice.key_down(true).unwrap();
        assert_eq!(h.voice.key_up(), StopOutcome::Discarded);
        assert_eq!(h.voice.state(), VoiceState::Idle);
        assert!(h.reports.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn empty_and_failed_transcriptions_are_reported() {
        let mut h = harness(VoiceMode::Toggle, 16_000, Ok("   "));
        h.voice.toggle().unwrap();
        h.voice.toggle().unwrap();
        assert_eq!(next_report(&h).outcome, TranscriptionOutcome::Empty);

        let mut h = harness(VoiceMode::Toggle, 16_000, Err("model unavailable"));
        h.voice.toggle().unwrap();
        h.voice.toggle().unwrap();
        assert_eq!(
            next_report(&h).outcome,
            TranscriptionOutcome::Failed("model unavailable".into())
        );
    }

    #[test]
    fn cancelled_take_report_is_stale() {
        let mut h = harness(VoiceMode::Toggle, 16_000, Ok("late"));
        h.voice.toggle().unwrap();
        h.voice.toggle().unwrap();
        h.voice.cancel();
        assert_eq!(h.voice.state(), VoiceState::Idle);
        let report = next_report(&h);
        assert!(!h.voice.accept(&report));
    }

    #[test]
    fn mode_switch_discards_recording() {
        let mut h = harness(VoiceMode::Toggle, 16_000, Ok("x"));
        h.voice.toggle().unwrap();
        h.voice.set_mode(VoiceMode::PushToTalk);
        assert_eq!(h.voice.state(), VoiceState::Idle);
        assert_eq!(h.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.voice.mode(), VoiceMode::PushToTalk);
    }

    #[test]
    fn buffer_downmixes_and_caps() {
        let buffer = CaptureBuffer::new(1);
        buffer.configure(4, 2);
        buffer.push_interleaved(&[1.0, 0.0, 0.5, 0.5]);
        assert_eq!(buffer.len(), 2);
        buffer.push_interleaved(&[0.2; 20]);
        assert_eq!(buffer.len(), 4);
        assert!(buffer.is_truncated());

        let audio = buffer.take();
        assert_eq!(audio.samples[..2], [0.5, 0.5]);
        assert_eq!(audio.duration(), Duration::from_secs(1));
        assert!(buffer.is_empty());
    }
}
