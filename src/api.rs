use std::{sync::Arc, time::Duration};

use axum::{
  body::StreamBody,
  extract::{Query, State},
  http::{header, StatusCode},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
  catalog::{StreamCatalog, VariantSource},
  config::Config,
  delivery::{Delivered, Delivery},
  dispatcher::{Dispatcher, RequestContext},
  relay::{RelayTransport, RelayUploader},
  renderer::Renderer,
  selector::{self, format_size, MenuEntry, SIZE_CEILING},
  util::Progress,
  variant::SelectionRequest,
  Error, Result,
};

pub struct AppState {
  catalog: Arc<StreamCatalog>,
  dispatcher: Dispatcher,
  delivery: Delivery,
  // without a relay nothing at or above the primary limit can go out
  ceiling: u64,
  shutdown: CancellationToken,
}

impl AppState {
  pub fn new(
    config: &Config,
    source: Arc<dyn VariantSource>,
    shutdown: CancellationToken,
  ) -> Self {
    let catalog =
      Arc::new(StreamCatalog::new(source, config.catalog_retry.clone()));
    let dispatcher = Dispatcher::new(
      catalog.clone(),
      Renderer::new(&config.ffmpeg_path),
      &config.temp_dir,
    )
    .timeouts(config.timeouts.clone())
    .keep_failed_inputs(config.keep_failed_inputs);
    let ceiling = config.primary_limit.min(SIZE_CEILING);

    Self {
      catalog,
      dispatcher: dispatcher.size_ceiling(ceiling),
      delivery: Delivery::new(config.primary_limit, None),
      ceiling,
      shutdown,
    }
  }

  /// Routes oversized artifacts through `transport`.
  pub fn with_relay<T: RelayTransport + 'static>(
    self,
    config: &Config,
    transport: T,
  ) -> Result<Self> {
    let identity = config.relay_identity.clone().ok_or_else(|| {
      Error::Configuration(
        "RELAY_IDENTITY must be set to relay oversized files".to_string(),
      )
    })?;
    let uploader =
      RelayUploader::new(transport, identity).timeout(config.relay_timeout);
    let Self {
      catalog,
      dispatcher,
      shutdown,
      ..
    } = self;

    Ok(Self {
      catalog,
      dispatcher: dispatcher.size_ceiling(SIZE_CEILING),
      delivery: Delivery::new(config.primary_limit, Some(Arc::new(uploader))),
      ceiling: SIZE_CEILING,
      shutdown,
    })
  }
}

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/menu", get(menu))
    .route("/render", post(render))
    .with_state(state)
}

async fn health() -> impl IntoResponse {
  "ok".to_owned()
}

#[derive(Deserialize)]
pub struct MenuQuery {
  url: String,
}

#[derive(Serialize)]
pub struct MenuResponse {
  url: String,
  entries: Vec<MenuEntry>,
}

pub async fn menu(
  State(state): State<Arc<AppState>>,
  Query(query): Query<MenuQuery>,
) -> Result<Json<MenuResponse>> {
  let cancel = state.shutdown.child_token();
  let catalog = state.catalog.fetch_catalog(&query.url, &cancel).await?;
  let entries = selector::build_menu(&catalog, state.ceiling);

  Ok(Json(MenuResponse {
    url: query.url,
    entries,
  }))
}

#[derive(Deserialize)]
pub struct RenderRequest {
  url: String,
  choice: String,
  tag: Option<String>,
}

#[derive(Serialize)]
struct Relayed {
  relayed: bool,
  tag: String,
}

pub async fn render(
  State(state): State<Arc<AppState>>,
  Json(req): Json<RenderRequest>,
) -> Result<Response> {
  let request: SelectionRequest = req.choice.parse()?;
  let tag = req
    .tag
    .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
  let cancel = state.shutdown.child_token();

  let (progress, rx) = watch::channel(Progress {
    kind: request.kind(),
    bytes_so_far: 0,
    total_bytes: None,
  });
  tokio::spawn(log_progress(rx, tag.clone()));

  let mut ctx = RequestContext::new(&tag, cancel.clone());
  ctx.progress = Some(progress);
  let artifact = state.dispatcher.produce(&req.url, &request, &ctx).await?;
  drop(ctx);

  match state.delivery.deliver(artifact, &tag, &cancel).await? {
    Delivered::Direct(served) => {
      let headers = [
        (header::CONTENT_TYPE, served.mime_type().to_string()),
        (
          header::CONTENT_DISPOSITION,
          content_disposition(&served.artifact().file_name),
        ),
        (
          header::CONTENT_LENGTH,
          served.artifact().byte_size.to_string(),
        ),
      ];
      let body = StreamBody::new(served.into_stream().await?);
      Ok((headers, body).into_response())
    }
    Delivered::Relayed => {
      Ok((StatusCode::ACCEPTED, Json(Relayed { relayed: true, tag }))
        .into_response())
    }
  }
}

// ends when the request drops its sender
async fn log_progress(mut rx: watch::Receiver<Progress>, tag: String) {
  while rx.changed().await.is_ok() {
    let progress = *rx.borrow();
    debug!(
      "request {}: {:?} {} of {}",
      tag,
      progress.kind,
      format_size(progress.bytes_so_far),
      progress
        .total_bytes
        .map(format_size)
        .unwrap_or_else(|| "?".to_string())
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
  }
}

fn content_disposition(file_name: &str) -> String {
  let ascii: String = file_name
    .chars()
    .map(|c| match c {
      ' '..='~' if c != '"' && c != '\\' => c,
      _ => '_',
    })
    .collect();

  let mut encoded = String::new();
  for byte in file_name.bytes() {
    match byte {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
        encoded.push(byte as char)
      }
      _ => encoded.push_str(&format!("%{byte:02X}")),
    }
  }

  format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}
