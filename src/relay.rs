mod bot_api;

use std::{path::Path, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{util::guard_stage, variant::RenderedArtifact, Error, Result};

pub use bot_api::BotApiTransport;

/// Outcome of trying to obtain an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState<S> {
  Ready(S),
  /// An operator has to complete a step (e.g. enter a one-time code)
  /// outside of the service before a session exists.
  NeedsInteraction { prompt: String },
}

/// The secondary, high-capacity transport.
#[async_trait]
pub trait RelayTransport: Send + Sync {
  type Session: Clone + Send + Sync;
  type File: Send;
  type Peer: Send + Sync;

  async fn ensure_session(
    &self,
  ) -> anyhow::Result<SessionState<Self::Session>>;
  async fn upload_file(
    &self,
    session: &Self::Session,
    path: &Path,
  ) -> anyhow::Result<Self::File>;
  async fn resolve_peer(
    &self,
    session: &Self::Session,
    identity: &str,
  ) -> anyhow::Result<Self::Peer>;
  async fn send_file(
    &self,
    session: &Self::Session,
    peer: &Self::Peer,
    file: Self::File,
    tag: &str,
  ) -> anyhow::Result<()>;
}

/// Type-erased relay, so delivery does not care about the transport.
#[async_trait]
pub trait Relay: Send + Sync {
  async fn relay(
    &self,
    artifact: &RenderedArtifact,
    destination_tag: &str,
    cancel: &CancellationToken,
  ) -> Result<()>;
}

pub struct RelayUploader<T: RelayTransport> {
  transport: T,
  identity: String,
  timeout: Duration,
  // one session for the whole process, established on first use
  session: OnceCell<T::Session>,
}

impl<T: RelayTransport> RelayUploader<T> {
  pub fn new(transport: T, identity: impl Into<String>) -> Self {
    Self {
      transport,
      identity: identity.into(),
      timeout: Duration::from_secs(60 * 60),
      session: OnceCell::new(),
    }
  }

  pub fn timeout(self, timeout: Duration) -> Self {
    Self { timeout, ..self }
  }

  async fn session(&self) -> Result<&T::Session> {
    self
      .session
      .get_or_try_init(|| async {
        match self.transport.ensure_session().await.map_err(Error::relay)? {
          SessionState::Ready(session) => {
            info!("relay session established");
            Ok(session)
          }
          SessionState::NeedsInteraction { prompt } => {
            warn!("relay session needs operator action: {}", prompt);
            Err(Error::relay(anyhow!(
              "relay session requires operator action: {prompt}"
            )))
          }
        }
      })
      .await
  }

  async fn send(&self, artifact: &RenderedArtifact, tag: &str) -> Result<()> {
    let session = self.session().await?;
    let transport = &self.transport;

    info!(
      "relaying {} ({} bytes) to {}",
      artifact.path.display(),
      artifact.byte_size,
      self.identity
    );
    let file = transport
      .upload_file(session, &artifact.path)
      .await
      .map_err(Error::relay)?;
    let peer = transport
      .resolve_peer(session, &self.identity)
      .await
      .map_err(Error::relay)?;
    transport
      .send_file(session, &peer, file, tag)
      .await
      .map_err(Error::relay)
  }
}

#[async_trait]
impl<T: RelayTransport> Relay for RelayUploader<T> {
  async fn relay(
    &self,
    artifact: &RenderedArtifact,
    destination_tag: &str,
    cancel: &CancellationToken,
  ) -> Result<()> {
    let res = guard_stage(
      self.send(artifact, destination_tag),
      self.timeout,
      cancel,
      || Error::relay(anyhow!("relay timed out")),
    )
    .await;

    match res {
      Ok(()) => {
        if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
          warn!("failed to delete {}: {}", artifact.path.display(), e);
        }
        info!("relayed {} as {}", artifact.file_name, destination_tag);
        Ok(())
      }
      Err(e) => {
        warn!(
          "relay of {} failed, leaving it in place: {}",
          artifact.path.display(),
          e
        );
        Err(e)
      }
    }
  }
}
