use std::{collections::HashSet, path::PathBuf, time::Duration};

use thiserror::Error;
use tracing::warn;
use url::Url;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;
const DEFAULT_YT_DLP_BINARY: &str = "yt-dlp";
const WORK_DIR_NAME: &str = "ytdlp-audio-service";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid origin in ALLOWED_ORIGINS: {0} (expected values like https://example.com)")]
    InvalidOrigin(String),
}

/// Process-wide settings, read once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub bind_addr: String,
    pub yt_dlp_path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub download_timeout: Option<Duration>,
    pub max_concurrent_downloads: usize,
    pub allowed_origins: Option<HashSet<String>>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };

        let bind_addr = read("APP_ADDR").unwrap_or_else(|| {
            let port = read_parsed::<u16>(&read, "PORT").unwrap_or(DEFAULT_PORT);
            format!("0.0.0.0:{port}")
        });

        let max_concurrent_downloads = read_positive::<usize>(&read, "MAX_CONCURRENT_DOWNLOADS")
            .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);

        let download_timeout =
            read_positive::<u64>(&read, "DOWNLOAD_TIMEOUT_SECONDS").map(Duration::from_secs);

        let allowed_origins = match read("ALLOWED_ORIGINS") {
            Some(value) => Some(parse_origins(&value)?),
            None => None,
        };

        Ok(Self {
            api_key: read("API_KEY"),
            bind_addr,
            yt_dlp_path: read("YT_DLP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP_BINARY)),
            ffmpeg_path: read("FFMPEG_PATH").map(PathBuf::from),
            work_dir: read("DOWNLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join(WORK_DIR_NAME)),
            download_timeout,
            max_concurrent_downloads,
            allowed_origins,
        })
    }
}

fn read_parsed<T: std::str::FromStr>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let value = read(name)?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring unparsable {name}={value:?}, using the default");
            None
        }
    }
}

fn read_positive<T>(read: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default + std::fmt::Display,
{
    let value = read_parsed::<T>(read, name)?;
    if value > T::default() {
        Some(value)
    } else {
        warn!("Ignoring non-positive {name}={value}, using the default");
        None
    }
}

fn parse_origins(value: &str) -> Result<HashSet<String>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| ConfigError::InvalidOrigin(origin.to_string()))
        })
        .collect()
}

/// Reduces an origin to `scheme://host[:port]`, dropping default ports.
pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
