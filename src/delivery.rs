use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::File;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{relay::Relay, variant::RenderedArtifact, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  Direct,
  Relay,
}

pub fn route(byte_size: u64, primary_limit: u64) -> Route {
  if byte_size < primary_limit {
    Route::Direct
  } else {
    Route::Relay
  }
}

pub enum Delivered {
  /// To be sent over the primary channel by the caller.
  Direct(ServedArtifact),
  Relayed,
}

pub struct Delivery {
  primary_limit: u64,
  relay: Option<Arc<dyn Relay>>,
}

impl Delivery {
  pub fn new(primary_limit: u64, relay: Option<Arc<dyn Relay>>) -> Self {
    Self {
      primary_limit,
      relay,
    }
  }

  pub async fn deliver(
    &self,
    artifact: RenderedArtifact,
    destination_tag: &str,
    cancel: &CancellationToken,
  ) -> Result<Delivered> {
    match route(artifact.byte_size, self.primary_limit) {
      Route::Direct => {
        debug!("{} fits the primary channel", artifact.file_name);
        Ok(Delivered::Direct(ServedArtifact::new(artifact)))
      }
      Route::Relay => {
        let Some(relay) = &self.relay else {
          // nobody else is going to pick it up
          let served = ServedArtifact::new(artifact);
          return Err(Error::relay(anyhow::anyhow!(
            "{} exceeds the primary limit and no relay is configured",
            served.artifact.file_name
          )));
        };

        relay.relay(&artifact, destination_tag, cancel).await?;
        Ok(Delivered::Relayed)
      }
    }
  }
}

/// An artifact on its way out over the primary channel. The file is
/// deleted once this is dropped, i.e. after the body has been sent or the
/// transfer was abandoned.
pub struct ServedArtifact {
  artifact: RenderedArtifact,
}

impl ServedArtifact {
  fn new(artifact: RenderedArtifact) -> Self {
    Self { artifact }
  }

  pub fn artifact(&self) -> &RenderedArtifact {
    &self.artifact
  }

  pub fn mime_type(&self) -> &'static str {
    match self.artifact.path.extension().and_then(|e| e.to_str()) {
      Some("mp3") => "audio/mpeg",
      Some("m4a") => "audio/mp4",
      Some("mp4") => "video/mp4",
      Some("webm") => "video/webm",
      _ => "application/octet-stream",
    }
  }

  /// Body stream of the file. Keeps the artifact alive until the stream
  /// is dropped.
  pub async fn into_stream(
    self,
  ) -> Result<impl Stream<Item = std::io::Result<Bytes>> + Send> {
    let file = File::open(&self.artifact.path)
      .await
      .with_context(|| format!("opening {}", self.artifact.path.display()))
      .map_err(Error::Delivery)?;

    Ok(ReaderStream::new(file).map(move |chunk| {
      let _keep = &self;
      chunk
    }))
  }
}

impl Drop for ServedArtifact {
  fn drop(&mut self) {
    let path = &self.artifact.path;
    if !path.exists() {
      return;
    }

    if let Err(e) = std::fs::remove_file(path) {
      warn!("failed to delete file: {}", e);
    } else {
      info!("deleted file: {}", path.display());
    }
  }
}

#[cfg(test)]
mod test {
  use std::sync::atomic::Ordering;

  use futures::TryStreamExt;

  use super::*;
  use crate::relay::{test::FakeTransport, RelayUploader};

  fn artifact(dir: &std::path::Path, size: usize) -> RenderedArtifact {
    let path = dir.join("7.Talk.mp4");
    std::fs::write(&path, vec![b'x'; size]).unwrap();
    RenderedArtifact {
      path,
      byte_size: size as u64,
      file_name: "Talk.mp4".into(),
    }
  }

  #[test]
  fn test_route() {
    assert_eq!(route(10, 50), Route::Direct);
    assert_eq!(route(50, 50), Route::Relay);
    assert_eq!(route(51, 50), Route::Relay);
  }

  #[tokio::test]
  async fn test_direct_delivery_deletes_after_stream() {
    let dir = tempfile::tempdir().unwrap();
    let delivery = Delivery::new(100, None);
    let artifact = artifact(dir.path(), 10);
    let path = artifact.path.clone();

    let Delivered::Direct(served) = delivery
      .deliver(artifact, "7", &CancellationToken::new())
      .await
      .unwrap()
    else {
      panic!("expected direct delivery");
    };
    assert_eq!(served.mime_type(), "video/mp4");

    let stream = served.into_stream().await.unwrap();
    assert!(path.exists());

    let body: Vec<Bytes> = stream.try_collect().await.unwrap();
    assert_eq!(body.concat().len(), 10);
    // the stream was consumed and dropped by try_collect
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn test_oversized_goes_through_relay() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let uploader = RelayUploader::new(transport.clone(), "render_bot");
    let delivery = Delivery::new(5, Some(Arc::new(uploader)));
    let artifact = artifact(dir.path(), 10);
    let path = artifact.path.clone();

    let delivered = delivery
      .deliver(artifact, "7", &CancellationToken::new())
      .await
      .unwrap();

    assert!(matches!(delivered, Delivered::Relayed));
    assert_eq!(transport.sent.lock().unwrap().len(), 1);
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn test_failed_relay_leaves_file() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    transport.fail_upload.store(true, Ordering::SeqCst);
    let uploader = RelayUploader::new(transport.clone(), "render_bot");
    let delivery = Delivery::new(5, Some(Arc::new(uploader)));
    let artifact = artifact(dir.path(), 10);
    let path = artifact.path.clone();

    let res = delivery
      .deliver(artifact, "7", &CancellationToken::new())
      .await;

    assert!(matches!(res, Err(Error::Relay(_))));
    assert!(path.exists());
  }

  #[tokio::test]
  async fn test_oversized_without_relay() {
    let dir = tempfile::tempdir().unwrap();
    let delivery = Delivery::new(5, None);
    let artifact = artifact(dir.path(), 10);
    let path = artifact.path.clone();

    let res = delivery
      .deliver(artifact, "7", &CancellationToken::new())
      .await;

    assert!(matches!(res, Err(Error::Relay(_))));
    assert!(!path.exists());
  }
}
