use std::{collections::HashMap, path::PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
  util::{redact_proxy, sanitize_file_name, YTDLP_MUTEX},
  variant::{Container, SourceLocator, StreamVariant},
};

use super::{OpenedStream, VariantSource};

// run yt-dlp command line to list the formats of a video.
// streams are then fetched over plain http with the headers yt-dlp reports.
pub struct YtdlpSource {
  program: PathBuf,
  proxy: Option<String>,
  client: reqwest::Client,
}

impl YtdlpSource {
  pub fn new(
    program: impl Into<PathBuf>,
    proxy: Option<String>,
  ) -> anyhow::Result<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(proxy) = &proxy {
      builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    Ok(Self {
      program: program.into(),
      proxy,
      client: builder.build()?,
    })
  }
}

#[derive(Deserialize, Debug)]
struct YtdlpOutput {
  title: String,
  #[serde(default)]
  formats: Vec<Format>,
}

#[derive(Deserialize, Debug)]
struct Format {
  #[allow(unused)]
  format_id: String,
  ext: String,
  vcodec: Option<String>,
  acodec: Option<String>,
  abr: Option<f64>,
  height: Option<u32>,
  fps: Option<f64>,
  filesize: Option<f64>,
  filesize_approx: Option<f64>,
  url: Option<String>,
  protocol: Option<String>,
  #[serde(default)]
  http_headers: HashMap<String, String>,
}

fn has_codec(codec: &Option<String>) -> bool {
  codec.as_deref().is_some_and(|c| c != "none")
}

impl Format {
  fn into_variant(self, title: &str) -> Option<StreamVariant> {
    let direct = matches!(self.protocol.as_deref(), Some("https" | "http"));
    let url = self.url.filter(|_| direct)?;

    let mut headers: Vec<_> = self.http_headers.into_iter().collect();
    headers.sort();
    let source = SourceLocator::new(url).with_headers(headers);
    let byte_size = self.filesize.or(self.filesize_approx).map(|s| s as u64);
    let file_name = format!("{}.{}", sanitize_file_name(title), self.ext);

    if has_codec(&self.vcodec) {
      let container = Container::from_ext(&self.ext, None);
      let frame_rate = self.fps.map(|fps| fps.round() as u32);
      Some(StreamVariant::video(
        container,
        self.height,
        frame_rate,
        byte_size,
        source,
        file_name,
      ))
    } else if has_codec(&self.acodec) {
      let container = Container::from_ext(&self.ext, self.acodec.as_deref());
      let bitrate = self.abr.map(|abr| abr.round() as u32);
      Some(StreamVariant::audio(
        container, bitrate, byte_size, source, file_name,
      ))
    } else {
      // storyboards and other non-media formats
      None
    }
  }
}

fn parse_variants(stdout: &[u8]) -> anyhow::Result<Vec<StreamVariant>> {
  let output: YtdlpOutput =
    serde_json::from_slice(stdout).context("parsing yt-dlp output")?;
  let title = output.title;

  Ok(
    output
      .formats
      .into_iter()
      .filter_map(|format| format.into_variant(&title))
      .collect(),
  )
}

#[async_trait]
impl VariantSource for YtdlpSource {
  async fn list_variants(
    &self,
    url: &str,
  ) -> anyhow::Result<Vec<StreamVariant>> {
    let mut cmd = Command::new(&self.program);
    cmd.arg("-j").arg("--no-playlist").arg("--no-warnings");

    if let Some(proxy) = &self.proxy {
      debug!("using proxy: {}", redact_proxy(proxy));
      cmd.arg("--proxy").arg(proxy);
    }

    cmd.arg(url).stdin(std::process::Stdio::null());

    let guard = YTDLP_MUTEX.acquire().await?;
    let output = cmd.output().await.context("spawning yt-dlp")?;
    drop(guard);

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() || stderr.contains("ERROR:") {
      bail!("yt-dlp exited with {}: {}", output.status, stderr.trim());
    }

    let variants = parse_variants(&output.stdout)?;
    info!("yt-dlp listed {} variants for {}", variants.len(), url);
    Ok(variants)
  }

  async fn open_stream(
    &self,
    locator: &SourceLocator,
  ) -> anyhow::Result<OpenedStream> {
    let mut req = self.client.get(&locator.url);
    for (name, value) in &locator.headers {
      req = req.header(name, value);
    }

    let resp = req.send().await?.error_for_status()?;
    let total_bytes = resp.content_length();
    let stream = resp
      .bytes_stream()
      .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
      .boxed();

    Ok(OpenedStream {
      total_bytes,
      stream,
    })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::variant::Kind;

  const SAMPLE: &str = r#"{
    "title": "Lecture 1: Intro/Overview",
    "formats": [
      {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none",
       "protocol": "mhtml", "url": "https://i.ytimg.com/sb/x"},
      {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2",
       "abr": 129.478, "filesize": 3411211, "protocol": "https",
       "url": "https://rr1.example/140", "http_headers": {"User-Agent": "UA"}},
      {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus",
       "abr": 135.2, "filesize_approx": 3500000, "protocol": "https",
       "url": "https://rr1.example/251"},
      {"format_id": "137", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "none",
       "height": 1080, "fps": 30, "filesize": 51234567, "protocol": "https",
       "url": "https://rr1.example/137"},
      {"format_id": "96", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "mp4a.40.2",
       "height": 1080, "fps": 29.97, "protocol": "m3u8_native",
       "url": "https://manifest.example/96.m3u8"}
    ]
  }"#;

  #[test]
  fn test_parse_variants() {
    let variants = parse_variants(SAMPLE.as_bytes()).unwrap();
    assert_eq!(variants.len(), 3);

    let aac = &variants[0];
    assert_eq!(aac.kind(), Kind::Audio);
    assert_eq!(aac.container(), &Container::Aac);
    assert_eq!(aac.audio_bitrate_kbps(), Some(129));
    assert_eq!(aac.byte_size(), Some(3411211));
    assert_eq!(aac.suggested_file_name(), "Lecture 1_ Intro_Overview.m4a");
    assert_eq!(
      aac.source().headers,
      vec![("User-Agent".to_string(), "UA".to_string())]
    );

    let opus = &variants[1];
    assert_eq!(opus.container(), &Container::WebM);
    assert_eq!(opus.byte_size(), Some(3500000));

    let video = &variants[2];
    assert_eq!(video.kind(), Kind::Video);
    assert_eq!(video.container(), &Container::Mp4);
    assert_eq!(video.video_resolution(), Some(1080));
    assert_eq!(video.frame_rate(), Some(30));
    assert_eq!(video.audio_bitrate_kbps(), None);
  }

  #[test]
  fn test_parse_garbage() {
    assert!(parse_variants(b"not json").is_err());
  }
}
