use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
  catalog::StreamCatalog,
  fetcher::Fetcher,
  render_job::{Operation, RenderJob},
  renderer::{mp3_path, Renderer},
  selector::{self, SIZE_CEILING},
  util::{guard_stage, Progress},
  variant::{
    Kind, RenderedArtifact, SelectionRequest, SelectionResult, StreamVariant,
  },
  Error, Result,
};

#[derive(Debug, Clone)]
pub struct StageTimeouts {
  pub fetch: Duration,
  pub render: Duration,
}

impl Default for StageTimeouts {
  fn default() -> Self {
    Self {
      fetch: Duration::from_secs(30 * 60),
      render: Duration::from_secs(30 * 60),
    }
  }
}

/// Per-request inputs that are not part of the selection itself.
pub struct RequestContext {
  /// Namespaces the temp files of this request.
  pub tag: String,
  pub cancel: CancellationToken,
  pub progress: Option<watch::Sender<Progress>>,
}

impl RequestContext {
  pub fn new(tag: impl Into<String>, cancel: CancellationToken) -> Self {
    Self {
      tag: tag.into(),
      cancel,
      progress: None,
    }
  }
}

pub struct Dispatcher {
  catalog: Arc<StreamCatalog>,
  fetcher: Fetcher,
  renderer: Renderer,
  temp_dir: PathBuf,
  timeouts: StageTimeouts,
  keep_failed_inputs: bool,
  ceiling: u64,
}

impl Dispatcher {
  pub fn new(
    catalog: Arc<StreamCatalog>,
    renderer: Renderer,
    temp_dir: impl Into<PathBuf>,
  ) -> Self {
    let fetcher = Fetcher::new(catalog.source().clone());
    Self {
      catalog,
      fetcher,
      renderer,
      temp_dir: temp_dir.into(),
      timeouts: StageTimeouts::default(),
      keep_failed_inputs: false,
      ceiling: SIZE_CEILING,
    }
  }

  /// Largest artifact a selection may resolve to.
  pub fn size_ceiling(self, ceiling: u64) -> Self {
    Self { ceiling, ..self }
  }

  pub fn timeouts(self, timeouts: StageTimeouts) -> Self {
    Self { timeouts, ..self }
  }

  pub fn keep_failed_inputs(self, keep: bool) -> Self {
    Self {
      keep_failed_inputs: keep,
      ..self
    }
  }

  /// catalog -> select -> fetch -> render. The returned artifact belongs
  /// to the caller; every other file of the request is gone by the time
  /// this returns, whatever the outcome.
  pub async fn produce(
    &self,
    url: &str,
    request: &SelectionRequest,
    ctx: &RequestContext,
  ) -> Result<RenderedArtifact> {
    info!("producing {} for {} (tag {})", request, url, ctx.tag);

    let catalog = self.catalog.fetch_catalog(url, &ctx.cancel).await?;
    let selection = selector::resolve(&catalog, request, self.ceiling)?;

    match selection {
      SelectionResult::Audio(audio) => self.produce_audio(&audio, ctx).await,
      SelectionResult::Video {
        video,
        audio: Some(audio),
      } => self.produce_muxed(&video, &audio, ctx).await,
      SelectionResult::Video { video, audio: None } => {
        self.produce_video_only(&video, ctx).await
      }
    }
  }

  async fn produce_audio(
    &self,
    audio: &StreamVariant,
    ctx: &RequestContext,
  ) -> Result<RenderedArtifact> {
    let mut job = self.job(ctx, Operation::TranscodeAudio);
    let raw = job.allocate(audio.suggested_file_name());
    // owned up front so a half-written output is cleaned too
    job.allocate_existing(mp3_path(&raw));

    self.fetch(audio, &raw, ctx.progress.clone(), ctx).await?;
    let output = self
      .render(self.renderer.transcode_audio(&raw), ctx)
      .await?;

    let file_name = format!("{}.mp3", audio.suggested_file_name());
    finish(job, &output, file_name).await
  }

  async fn produce_muxed(
    &self,
    video: &StreamVariant,
    audio: &StreamVariant,
    ctx: &RequestContext,
  ) -> Result<RenderedArtifact> {
    let mut job = self.job(ctx, Operation::MuxVideoAudio);
    let raw_video =
      job.allocate_scratch(&format!("raw-video.{}", video.extension()));
    let raw_audio =
      job.allocate_scratch(&format!("raw-audio.{}", audio.extension()));
    let output = job.allocate(video.suggested_file_name());

    let (video_tx, video_rx) = watch::channel(Progress::start(video));
    let (audio_tx, audio_rx) = watch::channel(Progress::start(audio));
    let fetches = async {
      tokio::try_join!(
        self.fetch(video, &raw_video, Some(video_tx), ctx),
        self.fetch(audio, &raw_audio, Some(audio_tx), ctx),
      )
    };
    let (fetched, ()) = tokio::join!(
      fetches,
      combine_progress(video_rx, audio_rx, ctx.progress.as_ref())
    );
    fetched?;
    self
      .render(self.renderer.mux(&raw_video, &raw_audio, &output), ctx)
      .await?;

    finish(job, &output, video.suggested_file_name().to_string()).await
  }

  async fn produce_video_only(
    &self,
    video: &StreamVariant,
    ctx: &RequestContext,
  ) -> Result<RenderedArtifact> {
    info!("no companion audio, shipping video as downloaded");
    let mut job = self.job(ctx, Operation::Passthrough);
    let output = job.allocate(video.suggested_file_name());

    self.fetch(video, &output, ctx.progress.clone(), ctx).await?;

    finish(job, &output, video.suggested_file_name().to_string()).await
  }

  fn job(&self, ctx: &RequestContext, operation: Operation) -> RenderJob {
    RenderJob::new(&self.temp_dir, &ctx.tag, operation)
      .keep_on_failure(self.keep_failed_inputs)
  }

  async fn fetch(
    &self,
    variant: &StreamVariant,
    destination: &Path,
    progress: Option<watch::Sender<Progress>>,
    ctx: &RequestContext,
  ) -> Result<PathBuf> {
    guard_stage(
      self.fetcher.fetch(variant, destination, progress),
      self.timeouts.fetch,
      &ctx.cancel,
      || Error::download(anyhow::anyhow!("download timed out")),
    )
    .await
  }

  async fn render(
    &self,
    fut: impl std::future::Future<Output = Result<PathBuf>>,
    ctx: &RequestContext,
  ) -> Result<PathBuf> {
    guard_stage(fut, self.timeouts.render, &ctx.cancel, || {
      Error::render(anyhow::anyhow!("render timed out"))
    })
    .await
  }
}

// Reports the parallel video and audio downloads as one transfer. Ends once
// both fetches have dropped their senders.
async fn combine_progress(
  mut video: watch::Receiver<Progress>,
  mut audio: watch::Receiver<Progress>,
  observer: Option<&watch::Sender<Progress>>,
) {
  let (mut video_open, mut audio_open) = (true, true);

  while video_open || audio_open {
    tokio::select! {
      res = video.changed(), if video_open => video_open = res.is_ok(),
      res = audio.changed(), if audio_open => audio_open = res.is_ok(),
    }

    let (v, a) = (*video.borrow(), *audio.borrow());
    if let Some(observer) = observer {
      observer.send_replace(Progress {
        kind: Kind::Video,
        bytes_so_far: v.bytes_so_far + a.bytes_so_far,
        total_bytes: v.total_bytes.zip(a.total_bytes).map(|(v, a)| v + a),
      });
    }
  }
}

async fn finish(
  job: RenderJob,
  output: &Path,
  file_name: String,
) -> Result<RenderedArtifact> {
  let byte_size = tokio::fs::metadata(output)
    .await
    .map_err(Error::render)?
    .len();
  let path = job.release(output);

  info!("rendered {} ({} bytes)", path.display(), byte_size);
  Ok(RenderedArtifact {
    path,
    byte_size,
    file_name,
  })
}
