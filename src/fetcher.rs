use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context;
use futures::StreamExt;
use tokio::{fs::File, io::AsyncWriteExt, sync::watch};
use tracing::{debug, info};

use crate::{
  catalog::VariantSource,
  util::{Progress, ProgressStream},
  variant::StreamVariant,
  Error, Result,
};

/// Streams one variant to local storage. Never retries.
pub struct Fetcher {
  source: Arc<dyn VariantSource>,
}

impl Fetcher {
  pub fn new(source: Arc<dyn VariantSource>) -> Self {
    Self { source }
  }

  /// Downloads `variant` to `destination` and returns the path.
  pub async fn fetch(
    &self,
    variant: &StreamVariant,
    destination: &Path,
    observer: Option<watch::Sender<Progress>>,
  ) -> Result<PathBuf> {
    let written = self
      .download(variant, destination, observer)
      .await
      .map_err(Error::download)?;

    info!("downloaded {} bytes to {}", written, destination.display());
    Ok(destination.to_owned())
  }

  async fn download(
    &self,
    variant: &StreamVariant,
    destination: &Path,
    observer: Option<watch::Sender<Progress>>,
  ) -> anyhow::Result<u64> {
    let opened = self.source.open_stream(variant.source()).await?;
    let total = opened.total_bytes.or(variant.byte_size());
    debug!(
      "fetching {:?} variant to {} ({:?} bytes)",
      variant.kind(),
      destination.display(),
      total
    );

    let mut stream = ProgressStream::new(opened.stream, variant.kind(), total)
      .observer(observer);
    let mut file = File::create(destination)
      .await
      .with_context(|| format!("creating {}", destination.display()))?;

    while let Some(chunk) = stream.next().await {
      file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    Ok(stream.bytes_so_far())
  }
}
