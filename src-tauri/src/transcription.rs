use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use tracing::debug;

use crate::voice::{Transcriber, TARGET_SAMPLE_RATE};

/// Resamples mono audio to the rate the speech backend expects.
pub fn prepare_waveform(samples: &[f32], sample_rate: u32) -> Vec<f32> {
    resample_linear(samples, sample_rate, TARGET_SAMPLE_RATE)
        .into_iter()
        .map(|sample| sample.clamp(-1.0, 1.0))
        .collect()
}

pub fn resample_linear(input: &[f32], in_rate: u32, out_rate: u32) -> Vec<f32> {
    if input.is_empty() || in_rate == 0 {
        return Vec::new();
    }
    if in_rate == out_rate {
        return input.to_vec();
    }

    let ratio = out_rate as f64 / in_rate as f64;
    let out_len = ((input.len() as f64) * ratio).max(1.0).round() as usize;
    if out_len <= 1 {
        return vec![input[0]];
    }

    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 / ratio;
            let idx = (src_pos.floor() as usize).min(last);
            let frac = src_pos - idx as f64;
            let next = (idx + 1).min(last);
            (input[idx] as f64 * (1.0 - frac) + input[next] as f64 * frac) as f32
        })
        .collect()
}

/// Collapses whitespace runs to single spaces and trims the ends.
pub fn normalize_transcript(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 16-bit PCM WAV, mono.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|err| anyhow!("WAV write error: {err}"))?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer
                .write_sample(value)
                .map_err(|err| anyhow!("WAV write error: {err}"))?;
        }
        writer
            .finalize()
            .map_err(|err| anyhow!("WAV finalize error: {err}"))?;
    }
    Ok(cursor.into_inner())
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(alias = "text")]
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

/// Speech-to-text over HTTP: uploads a WAV file to `<endpoint>/transcribe`.
#[derive(Clone, Debug)]
pub struct HttpTranscriber {
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTranscriber {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
            timeout,
        }
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}/transcribe", self.endpoint.trim_end_matches('/'))
    }
}

impl Transcriber for HttpTranscriber {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        let wav = encode_wav(samples, sample_rate)?;
        debug!(bytes = wav.len(), "uploading recording for transcription");

        // Built per call: this runs on a plain worker thread, outside any async runtime.
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let part = multipart::Part::bytes(wav)
            .file_name("recording.wav")
            .mime_str("audio/wav")?;
        let form = multipart::Form::new().part("file", part);

        let mut request = client.post(self.endpoint_url()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .context("Failed to reach transcription API")?;
        let status = response.status();
        let text = response.text().unwrap_or_default();

        if status.is_success() {
            let parsed: ApiResponse = serde_json::from_str(&text)
                .with_context(|| format!("Unexpected transcription response: {text}"))?;
            return Ok(normalize_transcript(&parsed.transcript));
        }

        if let Ok(parsed) = serde_json::from_str::<ApiErrorResponse>(&text) {
            Err(anyhow!(parsed.error))
        } else if text.is_empty() {
            Err(anyhow!("Transcription API returned status {status}"))
        } else {
            Err(anyhow!(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_transcript("  hello \n\t world  "), "hello world");
        assert_eq!(normalize_transcript("   "), "");
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let input: Vec<f32> = (0..48_000).map(|i| (i % 100) as f32 / 100.0).collect();
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 16_000);
        assert_eq!(resample_linear(&input[..10], 16_000, 16_000).len(), 10);
        assert!(resample_linear(&[], 44_100, 16_000).is_empty());
    }

    #[test]
    fn wav_header_matches_samples() {
        let samples = vec![0.0, 0.5, -0.5, 1.5];
        let bytes = encode_wav(&samples, TARGET_SAMPLE_RATE).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, TARGET_SAMPLE_RATE);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[3], i16::MAX);
    }

    #[test]
    fn endpoint_url_trims_trailing_slash() {
        let transcriber =
            HttpTranscriber::new("http://127.0.0.1:9001/", Some(String::new()), Duration::from_secs(5));
        assert_eq!(transcriber.endpoint_url(), "http://127.0.0.1:9001/transcribe");
        assert!(transcriber.api_key.is_none());
    }
}
