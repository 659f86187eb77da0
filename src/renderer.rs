use std::{
  ffi::OsString,
  path::{Path, PathBuf},
  process::Stdio,
};

use anyhow::{anyhow, Context};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Drives the external encoder. Holds no mutable state, so renders may run
/// concurrently as long as their paths differ.
#[derive(Debug, Clone)]
pub struct Renderer {
  program: PathBuf,
}

impl Renderer {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
    }
  }

  /// Re-encodes `raw_audio` to mp3 next to it, as `<file name>.mp3`.
  /// The raw input is deleted once the encoder succeeds.
  pub async fn transcode_audio(&self, raw_audio: &Path) -> Result<PathBuf> {
    let output = mp3_path(raw_audio);

    let args: Vec<OsString> = vec![
      "-y".into(),
      "-i".into(),
      raw_audio.into(),
      "-codec:a".into(),
      "mp3".into(),
      output.clone().into(),
    ];
    self.run(args).await?;

    remove_input(raw_audio).await;
    info!("audio file available at {}", output.display());
    Ok(output)
  }

  /// Copies the video stream and re-encodes the audio to aac into a single
  /// mp4 at `output`. Both inputs are deleted once the encoder succeeds.
  pub async fn mux(
    &self,
    video: &Path,
    audio: &Path,
    output: &Path,
  ) -> Result<PathBuf> {
    let args: Vec<OsString> = vec![
      "-y".into(),
      "-i".into(),
      video.into(),
      "-i".into(),
      audio.into(),
      "-c:v".into(),
      "copy".into(),
      "-c:a".into(),
      "aac".into(),
      "-strict".into(),
      "experimental".into(),
      output.into(),
    ];
    self.run(args).await?;

    remove_input(video).await;
    remove_input(audio).await;
    info!("video file with audio available at {}", output.display());
    Ok(output.to_owned())
  }

  async fn run(&self, args: Vec<OsString>) -> Result<()> {
    debug!("running {} {:?}", self.program.display(), args);

    let child = Command::new(&self.program)
      .arg("-nostdin")
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      // an abandoned render must not leave the encoder running
      .kill_on_drop(true)
      .spawn()
      .with_context(|| format!("spawning {}", self.program.display()))
      .map_err(Error::render)?;

    let output = child
      .wait_with_output()
      .await
      .context("waiting for encoder")
      .map_err(Error::render)?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      let tail = stderr.lines().rev().take(5).collect::<Vec<_>>();
      let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
      return Err(Error::render(anyhow!(
        "encoder exited with {}: {}",
        output.status,
        tail
      )));
    }

    Ok(())
  }
}

pub fn mp3_path(raw_audio: &Path) -> PathBuf {
  let mut name = raw_audio.as_os_str().to_owned();
  name.push(".mp3");
  PathBuf::from(name)
}

async fn remove_input(path: &Path) {
  if let Err(e) = tokio::fs::remove_file(path).await {
    warn!("failed to delete render input {}: {}", path.display(), e);
  }
}
