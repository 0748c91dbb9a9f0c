//! Options for, and failure classification of, the external `yt-dlp` run.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

pub const OUTPUT_STEM: &str = "audio";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    Download(String),

    #[error("{0}")]
    Postprocess(String),

    #[error("could not run yt-dlp: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("yt-dlp did not finish within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub format: String,
    pub audio_codec: String,
    pub audio_quality_kbps: u32,
    /// Must contain the `%(ext)s` placeholder; the tool substitutes the final extension.
    pub output_template: PathBuf,
    pub quiet: bool,
    pub single_item: bool,
    pub ffmpeg_location: Option<PathBuf>,
}

impl ExtractOptions {
    pub fn mp3_into(dir: &Path, ffmpeg_location: Option<PathBuf>) -> Self {
        Self {
            format: "bestaudio/best".to_string(),
            audio_codec: "mp3".to_string(),
            audio_quality_kbps: 192,
            output_template: dir.join(format!("{OUTPUT_STEM}.%(ext)s")),
            quiet: true,
            single_item: true,
            ffmpeg_location,
        }
    }
}

/// Implementations return only after the single output file has been written through
/// `options.output_template`, or fail.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str, options: &ExtractOptions) -> Result<(), ExtractError>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl YtDlp {
    pub fn new(binary: PathBuf, timeout: Option<Duration>) -> Self {
        Self { binary, timeout }
    }

    pub async fn version(&self) -> Option<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn extract(&self, url: &str, options: &ExtractOptions) -> Result<(), ExtractError> {
        let mut command = Command::new(&self.binary);
        command
            .args(build_args(url, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let group = GroupKill { pgid: child.id() };

        let output = match self.timeout {
            Some(limit) => timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExtractError::TimedOut(limit))??,
            None => child.wait_with_output().await?,
        };
        group.disarm();

        if !output.status.success() {
            debug!(
                "yt-dlp stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(classify_failure(&output.stderr, output.status));
        }

        Ok(())
    }
}

// Kills the tool's whole process group, ffmpeg included, when a run is abandoned.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => debug!("Killed yt-dlp process group {pgid}"),
        Err(Errno::ESRCH) => {}
        Err(error) => debug!("Could not kill yt-dlp process group {pgid}: {error}"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

pub fn build_args(url: &str, options: &ExtractOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-f".into(),
        options.format.clone().into(),
        "--extract-audio".into(),
        "--audio-format".into(),
        options.audio_codec.clone().into(),
        "--audio-quality".into(),
        format!("{}K", options.audio_quality_kbps).into(),
        "-o".into(),
        options.output_template.clone().into_os_string(),
    ];

    if options.quiet {
        args.push("--quiet".into());
        args.push("--no-warnings".into());
    }
    if options.single_item {
        args.push("--no-playlist".into());
    }
    if let Some(ffmpeg) = &options.ffmpeg_location {
        args.push("--ffmpeg-location".into());
        args.push(ffmpeg.clone().into_os_string());
    }

    // Keeps URLs that start with '-' from being read as options.
    args.push("--".into());
    args.push(url.into());
    args
}

pub fn classify_failure(stderr: &[u8], status: ExitStatus) -> ExtractError {
    let text = String::from_utf8_lossy(stderr);
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    let message = lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("yt-dlp exited with {status}"));

    let lower = message.to_ascii_lowercase();
    let transcode_failed = lower.contains("postprocessing")
        || ((lower.contains("ffmpeg") || lower.contains("ffprobe")) && lower.contains("not found"));

    if transcode_failed {
        ExtractError::Postprocess(message)
    } else {
        ExtractError::Download(message)
    }
}
