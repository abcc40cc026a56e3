use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{error, info};

use crate::voice::{AudioInput, CaptureBuffer};

/// Default input device via cpal. The stream is not `Send`, so it lives on
/// its own thread and is driven by commands.
pub struct CpalInput {
    tx: Sender<RecorderCommand>,
}

enum RecorderCommand {
    Start {
        buffer: CaptureBuffer,
        respond: Sender<Result<()>>,
    },
    Stop {
        respond: Sender<Result<()>>,
    },
}

impl CpalInput {
    pub fn new() -> Result<Self> {
        let (tx, rx) = unbounded();

        std::thread::Builder::new()
            .name("peek-recorder".into())
            .spawn(move || {
                let mut active: Option<Stream> = None;
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        RecorderCommand::Start { buffer, respond } => {
                            let result = if active.is_some() {
                                Err(anyhow!("Recording is already in progress"))
                            } else {
                                open_stream(buffer).map(|stream| {
                                    active = Some(stream);
                                })
                            };
                            let _ = respond.send(result);
                        }
                        RecorderCommand::Stop { respond } => {
                            drop(active.take());
                            let _ = respond.send(Ok(()));
                        }
                    }
                }
            })
            .context("Failed to spawn recorder thread")?;

        Ok(Self { tx })
    }

    fn request(&self, build: impl FnOnce(Sender<Result<()>>) -> RecorderCommand) -> Result<()> {
        let (respond_tx, respond_rx) = bounded(1);
        self.tx
            .send(build(respond_tx))
            .map_err(|err| anyhow!("Recorder channel closed: {err}"))?;
        respond_rx
            .recv()
            .map_err(|err| anyhow!("Recorder not responding: {err}"))?
    }
}

impl AudioInput for CpalInput {
    fn start(&mut self, buffer: CaptureBuffer) -> Result<()> {
        self.request(|respond| RecorderCommand::Start { buffer, respond })
    }

    fn stop(&mut self) -> Result<()> {
        self.request(|respond| RecorderCommand::Stop { respond })
    }
}

fn open_stream(buffer: CaptureBuffer) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("No microphone found")?;
    let config = device
        .default_input_config()
        .context("No supported input configuration found")?;
    let format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();
    buffer.configure(stream_config.sample_rate.0, stream_config.channels);

    let err_fn = |err| error!("microphone stream error: {err}");
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _| buffer.push_interleaved(data),
            err_fn,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _| {
                let samples: Vec<f32> = data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                buffer.push_interleaved(&samples);
            },
            err_fn,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _| {
                let samples: Vec<f32> = data
                    .iter()
                    .map(|s| (*s as f32 - 32_768.0) / 32_768.0)
                    .collect();
                buffer.push_interleaved(&samples);
            },
            err_fn,
            None,
        )?,
        other => return Err(anyhow!("Unsupported sample format {other:?}")),
    };

    stream.play().context("Failed to start microphone stream")?;
    info!(
        device = %device.name().unwrap_or_default(),
        rate = stream_config.sample_rate.0,
        channels = stream_config.channels,
        "microphone open"
    );
    Ok(stream)
}
