use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::{catalog::RetryPolicy, dispatcher::StageTimeouts, Error, Result};

// the bot api refuses uploads above this size
const DEFAULT_PRIMARY_LIMIT: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
  pub temp_dir: PathBuf,
  pub ffmpeg_path: PathBuf,
  pub ytdlp_path: PathBuf,
  pub ytdlp_proxy: Option<String>,
  pub primary_limit: u64,
  pub relay_identity: Option<String>,
  pub relay_api_url: String,
  pub relay_bot_token: Option<String>,
  pub catalog_retry: RetryPolicy,
  pub timeouts: StageTimeouts,
  pub relay_timeout: Duration,
  pub keep_failed_inputs: bool,
  pub listen_addr: SocketAddr,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let temp_dir = get("RENDER_TEMP_DIR").map(PathBuf::from).ok_or_else(|| {
      Error::Configuration("RENDER_TEMP_DIR must be set".to_string())
    })?;

    let secs = |key: &str, default: u64| -> Result<Duration> {
      Ok(Duration::from_secs(parse_or(&get, key, default)?))
    };
    let millis = |key: &str, default: u64| -> Result<Duration> {
      Ok(Duration::from_millis(parse_or(&get, key, default)?))
    };

    Ok(Self {
      temp_dir,
      ffmpeg_path: get("FFMPEG_PATH").unwrap_or("ffmpeg".into()).into(),
      ytdlp_path: get("YTDLP_PATH").unwrap_or("yt-dlp".into()).into(),
      ytdlp_proxy: get("YTDLP_PROXY"),
      primary_limit: parse_or(
        &get,
        "PRIMARY_LIMIT_BYTES",
        DEFAULT_PRIMARY_LIMIT,
      )?,
      relay_identity: get("RELAY_IDENTITY"),
      relay_api_url: get("RELAY_API_URL")
        .unwrap_or_else(|| "http://localhost:8081".to_string()),
      relay_bot_token: get("RELAY_BOT_TOKEN"),
      catalog_retry: RetryPolicy {
        max_attempts: parse_or(&get, "CATALOG_MAX_ATTEMPTS", 10)?,
        base_backoff: millis("CATALOG_BACKOFF_MS", 500)?,
        max_backoff: millis("CATALOG_BACKOFF_MAX_MS", 8000)?,
        attempt_timeout: secs("CATALOG_TIMEOUT_SECS", 60)?,
      },
      timeouts: StageTimeouts {
        fetch: secs("FETCH_TIMEOUT_SECS", 30 * 60)?,
        render: secs("RENDER_TIMEOUT_SECS", 30 * 60)?,
      },
      relay_timeout: secs("RELAY_TIMEOUT_SECS", 60 * 60)?,
      keep_failed_inputs: parse_or(&get, "KEEP_FAILED_INPUTS", false)?,
      listen_addr: parse_or(
        &get,
        "LISTEN_ADDR",
        SocketAddr::from(([0, 0, 0, 0], 8080)),
      )?,
    })
  }
}

fn parse_or<T: FromStr>(
  get: impl Fn(&str) -> Option<String>,
  key: &str,
  default: T,
) -> Result<T> {
  match get(key) {
    None => Ok(default),
    Some(value) => value.trim().parse().map_err(|_| {
      Error::Configuration(format!("{key} has an invalid value: {value}"))
    }),
  }
}
