use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  TranscodeAudio,
  MuxVideoAudio,
  // video shipped as downloaded, no companion audio
  Passthrough,
}

/// Owner of every temp file created while serving one request.
///
/// Paths are namespaced by the request tag inside the temp directory.
/// Whatever is still owned when the job is dropped gets deleted, so the
/// files are gone on success, failure and cancellation alike. Only the
/// released output outlives the job.
pub struct RenderJob {
  dir: PathBuf,
  tag: String,
  operation: Operation,
  owned: Vec<PathBuf>,
  keep_on_failure: bool,
  succeeded: bool,
}

impl RenderJob {
  pub fn new(dir: impl AsRef<Path>, tag: &str, operation: Operation) -> Self {
    Self {
      dir: dir.as_ref().to_owned(),
      tag: sanitize_tag(tag),
      operation,
      owned: vec![],
      keep_on_failure: false,
      succeeded: false,
    }
  }

  /// Keep the files of a failed job around for diagnosis.
  pub fn keep_on_failure(mut self, keep: bool) -> Self {
    self.keep_on_failure = keep;
    self
  }

  /// Reserves `<tag>.<name>` in the temp directory and takes ownership
  /// of it.
  pub fn allocate(&mut self, name: &str) -> PathBuf {
    let path = self.dir.join(format!("{}.{}", self.tag, name));
    self.owned.push(path.clone());
    path
  }

  /// Reserves `<tag>~<name>` for an intermediate file. Tags never contain
  /// `~` or `.`, so these paths cannot meet an `allocate`d one whatever the
  /// name.
  pub fn allocate_scratch(&mut self, name: &str) -> PathBuf {
    let path = self.dir.join(format!("{}~{}", self.tag, name));
    self.owned.push(path.clone());
    path
  }

  /// Takes ownership of a path some other component will create.
  pub fn allocate_existing(&mut self, path: PathBuf) {
    self.owned.push(path);
  }

  /// Hands `path` over to the caller; the job no longer deletes it.
  pub fn release(mut self, path: &Path) -> PathBuf {
    self.owned.retain(|p| p != path);
    self.succeeded = true;
    path.to_owned()
  }

  #[cfg(test)]
  pub fn owned(&self) -> &[PathBuf] {
    &self.owned
  }
}

impl Drop for RenderJob {
  fn drop(&mut self) {
    if !self.succeeded && self.keep_on_failure {
      let existing: Vec<_> =
        self.owned.iter().filter(|p| p.exists()).collect();
      if !existing.is_empty() {
        warn!(
          "keeping files of failed {:?} job {}: {:?}",
          self.operation, self.tag, existing
        );
      }
      return;
    }

    for path in &self.owned {
      if !path.exists() {
        continue;
      }

      if let Err(e) = std::fs::remove_file(path) {
        error!("failed to delete file {}: {}", path.display(), e);
      } else {
        debug!("deleted file: {}", path.display());
      }
    }
  }
}

fn sanitize_tag(tag: &str) -> String {
  let tag: String = tag
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
        c
      } else {
        '_'
      }
    })
    .collect();

  if tag.is_empty() {
    "job".to_string()
  } else {
    tag
  }
}
