use std::fs;
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// A display, numbered from 1 in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorInfo {
    pub index: usize,
    pub name: String,
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl MonitorInfo {
    pub fn new(index: usize, left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            index,
            name: format!("Screen {index}"),
            left,
            top,
            width,
            height,
        }
    }
}

pub trait ScreenCapture: Send + Sync {
    fn monitors(&self) -> Result<Vec<MonitorInfo>>;
    /// PNG-encoded image of the whole monitor.
    fn capture_png(&self, monitor: &MonitorInfo) -> Result<Vec<u8>>;
}

/// The monitor with `index`, or monitor 1 when the index is out of range.
pub fn resolve_monitor(monitors: &[MonitorInfo], index: usize) -> Option<&MonitorInfo> {
    monitors
        .iter()
        .find(|m| m.index == index)
        .or_else(|| {
            if index != 1 {
                debug!(index, "monitor not found; falling back to monitor 1");
            }
            monitors.iter().find(|m| m.index == 1)
        })
        .or_else(|| monitors.first())
}

pub fn capture_monitor(capture: &dyn ScreenCapture, index: usize) -> Result<Vec<u8>> {
    let monitors = capture.monitors().context("Failed to list monitors")?;
    let monitor = resolve_monitor(&monitors, index).ok_or_else(|| anyhow!("No monitors found"))?;
    let png = capture.capture_png(monitor)?;
    if !png.starts_with(PNG_MAGIC) {
        bail!("Screen capture did not produce a PNG image");
    }
    Ok(png)
}

/// Grabs a screen rectangle with the platform's capture tool.
pub fn capture_region_with_tool(monitor: &MonitorInfo) -> Result<Vec<u8>> {
    let file = tempfile::Builder::new()
        .prefix("peek-capture-")
        .suffix(".png")
        .tempfile()
        .context("Failed to create capture file")?;
    let path = file.path().to_path_buf();
    let target = path.to_string_lossy().to_string();

    let attempts: Vec<(&str, Vec<String>)> = if cfg!(target_os = "macos") {
        vec![(
            "screencapture",
            vec![
                "-x".into(),
                "-t".into(),
                "png".into(),
                format!(
                    "-R{},{},{},{}",
                    monitor.left, monitor.top, monitor.width, monitor.height
                ),
                target.clone(),
            ],
        )]
    } else if cfg!(target_os = "linux") {
        vec![
            (
                "grim",
                vec![
                    "-g".into(),
                    format!(
                        "{},{} {}x{}",
                        monitor.left, monitor.top, monitor.width, monitor.height
                    ),
                    target.clone(),
                ],
            ),
            (
                "import",
                vec![
                    "-window".into(),
                    "root".into(),
                    "-crop".into(),
                    format!(
                        "{}x{}+{}+{}",
                        monitor.width, monitor.height, monitor.left, monitor.top
                    ),
                    target.clone(),
                ],
            ),
        ]
    } else {
        bail!("Screen capture is not supported on this platform")
    };

    let mut last_error = anyhow!("No capture tool available");
    for (program, args) in attempts {
        match Command::new(program).args(&args).output() {
            Ok(output) if output.status.success() => {
                let png = fs::read(&path)
                    .with_context(|| format!("Failed to read capture at {}", path.display()))?;
                if !png.is_empty() {
                    return Ok(png);
                }
                last_error = anyhow!("`{program}` produced an empty image");
            }
            Ok(output) => {
                last_error = anyhow!(
                    "`{program}` failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(err) => last_error = anyhow!("`{program}` unavailable: {err}"),
        }
        warn!("{last_error}");
    }
    Err(last_error)
}
