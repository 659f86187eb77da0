use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod catalog;
mod config;
mod delivery;
mod dispatcher;
mod error;
mod fetcher;
mod relay;
mod render_job;
mod renderer;
mod selector;
mod util;
mod variant;

pub use error::{Error, Result};

use crate::{
  api::AppState, catalog::YtdlpSource, config::Config,
  relay::BotApiTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let config = Config::from_env()?;
  tokio::fs::create_dir_all(&config.temp_dir).await?;

  let source =
    YtdlpSource::new(config.ytdlp_path.clone(), config.ytdlp_proxy.clone())?;
  let shutdown = CancellationToken::new();
  let mut state = AppState::new(&config, Arc::new(source), shutdown.clone());

  match &config.relay_bot_token {
    Some(token) => {
      let transport = BotApiTransport::new(&config.relay_api_url, token)?;
      state = state.with_relay(&config, transport)?;
      info!("relaying oversized artifacts via {}", config.relay_api_url);
    }
    None => warn!(
      "RELAY_BOT_TOKEN is not set, only offering artifacts under {} bytes",
      config.primary_limit
    ),
  }

  let listen_addr = config.listen_addr;
  let state = Arc::new(state);
  Toplevel::new(move |s| async move {
    s.start(SubsystemBuilder::new("http", move |subsys| {
      serve(subsys, listen_addr, state, shutdown)
    }));
  })
  .catch_signals()
  .handle_shutdown_requests(Duration::from_secs(30))
  .await?;

  Ok(())
}

async fn serve(
  subsys: SubsystemHandle,
  addr: SocketAddr,
  state: Arc<AppState>,
  shutdown: CancellationToken,
) -> anyhow::Result<()> {
  info!("Listening on {}", addr);

  axum::Server::bind(&addr)
    .serve(api::router(state).into_make_service())
    .with_graceful_shutdown(async move {
      subsys.on_shutdown_requested().await;
      // abort in-flight renders, their temp files go with them
      shutdown.cancel();
    })
    .await?;

  Ok(())
}
