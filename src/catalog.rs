mod ytdlp;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  util::guard_stage,
  variant::{SourceLocator, StreamVariant},
  Error, Result,
};

pub use ytdlp::YtdlpSource;

pub struct OpenedStream {
  pub total_bytes: Option<u64>,
  pub stream: BoxStream<'static, std::io::Result<Bytes>>,
}

/// Upstream metadata and stream access for a source url.
#[async_trait]
pub trait VariantSource: Send + Sync {
  async fn list_variants(
    &self,
    url: &str,
  ) -> anyhow::Result<Vec<StreamVariant>>;
  async fn open_stream(
    &self,
    locator: &SourceLocator,
  ) -> anyhow::Result<OpenedStream>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_backoff: Duration,
  pub max_backoff: Duration,
  pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 10,
      base_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(8),
      attempt_timeout: Duration::from_secs(60),
    }
  }
}

impl RetryPolicy {
  /// Delay before attempt `attempt + 1`, doubling from the base.
  fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self
      .base_backoff
      .saturating_mul(factor)
      .min(self.max_backoff)
  }
}

pub struct StreamCatalog {
  source: Arc<dyn VariantSource>,
  policy: RetryPolicy,
}

impl StreamCatalog {
  pub fn new(source: Arc<dyn VariantSource>, policy: RetryPolicy) -> Self {
    Self { source, policy }
  }

  pub fn source(&self) -> &Arc<dyn VariantSource> {
    &self.source
  }

  pub async fn fetch_catalog(
    &self,
    url: &str,
    cancel: &CancellationToken,
  ) -> Result<Vec<StreamVariant>> {
    let max_attempts = self.policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
      let listing = guard_stage(
        async {
          self.source.list_variants(url).await.map_err(Error::download)
        },
        self.policy.attempt_timeout,
        cancel,
        || Error::download(anyhow::anyhow!("listing variants timed out")),
      )
      .await;

      match listing {
        Ok(variants) if !variants.is_empty() => {
          info!(
            "found {} variants for {} on attempt {}",
            variants.len(),
            url,
            attempt
          );
          return Ok(variants);
        }
        Ok(_) => {
          debug!("no variants for {} on attempt {}", url, attempt);
        }
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
          warn!(
            "listing variants for {} failed on attempt {}: {}",
            url, attempt, e
          );
        }
      }

      if attempt < max_attempts {
        tokio::select! {
          _ = cancel.cancelled() => return Err(Error::Cancelled),
          _ = tokio::time::sleep(self.policy.backoff(attempt)) => {}
        }
      }
    }

    Err(Error::Unavailable(url.to_string()))
  }
}
