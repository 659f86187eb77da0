use axum::response::{IntoResponse, Response};
use reqwest::StatusCode;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("no stream variants available for {0}")]
  Unavailable(String),
  #[error("selection {0} does not match the current catalog")]
  NoMatch(String),
  #[error("download failed: {0:#}")]
  Download(anyhow::Error),
  #[error("render failed: {0:#}")]
  Render(anyhow::Error),
  #[error("relay failed: {0:#}")]
  Relay(anyhow::Error),
  #[error("delivery failed: {0:#}")]
  Delivery(anyhow::Error),
  #[error("configuration error: {0}")]
  Configuration(String),
  #[error("request cancelled")]
  Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  pub fn download(err: impl Into<anyhow::Error>) -> Self {
    Error::Download(err.into())
  }

  pub fn render(err: impl Into<anyhow::Error>) -> Self {
    Error::Render(err.into())
  }

  pub fn relay(err: impl Into<anyhow::Error>) -> Self {
    Error::Relay(err.into())
  }

  /// Text shown to the requester. Never includes the underlying cause.
  pub fn user_message(&self) -> &'static str {
    match self {
      Error::Unavailable(_) => "This video is not available right now.",
      Error::NoMatch(_) => {
        "That option is no longer available, please request the menu again."
      }
      Error::Download(_) => "Could not download the selected stream.",
      Error::Render(_) => "Could not convert the downloaded file.",
      Error::Relay(_) => "Could not upload the file, it is too large.",
      Error::Delivery(_) => "Could not send the file.",
      Error::Configuration(_) => "The service is misconfigured.",
      Error::Cancelled => "The request was cancelled.",
    }
  }

  fn status(&self) -> StatusCode {
    match self {
      Error::Unavailable(_) | Error::Cancelled => {
        StatusCode::SERVICE_UNAVAILABLE
      }
      Error::NoMatch(_) => StatusCode::NOT_FOUND,
      Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
      Error::Download(_)
      | Error::Render(_)
      | Error::Relay(_)
      | Error::Delivery(_) => StatusCode::BAD_GATEWAY,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() && !matches!(self, Error::Unavailable(_)) {
      error!("request failed: {}", self);
    } else {
      warn!("request failed: {}", self);
    }

    (status, self.user_message()).into_response()
  }
}
