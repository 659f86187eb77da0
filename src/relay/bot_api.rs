use std::path::Path;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::{
  multipart::{Form, Part},
  Body, Client,
};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{RelayTransport, SessionState};

// A self-hosted Bot API server accepts uploads of up to 2000 MB, well past
// what the cloud endpoint takes.
pub struct BotApiTransport {
  client: Client,
  api_url: String,
  token: String,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
  ok: bool,
  result: Option<T>,
  error_code: Option<u16>,
  description: Option<String>,
}

#[derive(Deserialize)]
struct User {
  username: Option<String>,
}

#[derive(Deserialize)]
struct Chat {
  id: i64,
}

impl<T> ApiResponse<T> {
  fn into_result(self, method: &str) -> anyhow::Result<T> {
    match self {
      ApiResponse {
        ok: true,
        result: Some(result),
        ..
      } => Ok(result),
      ApiResponse {
        error_code,
        description,
        ..
      } => bail!(
        "{} failed ({}): {}",
        method,
        error_code.unwrap_or_default(),
        description.unwrap_or_default()
      ),
    }
  }
}

impl BotApiTransport {
  pub fn new(
    api_url: impl Into<String>,
    token: impl Into<String>,
  ) -> anyhow::Result<Self> {
    // the api server runs next to the service
    let client = Client::builder().no_proxy().build()?;
    Ok(Self {
      client,
      api_url: api_url.into().trim_end_matches('/').to_string(),
      token: token.into(),
    })
  }

  fn method_url(&self, method: &str) -> String {
    format!("{}/bot{}/{}", self.api_url, self.token, method)
  }

  // reqwest errors carry the url, which carries the token
  async fn read<T: DeserializeOwned>(
    res: reqwest::Result<reqwest::Response>,
    method: &str,
  ) -> anyhow::Result<ApiResponse<T>> {
    let res = res.map_err(|e| e.without_url())?;
    res
      .json()
      .await
      .map_err(|e| e.without_url())
      .with_context(|| format!("decoding {method} response"))
  }
}

#[async_trait]
impl RelayTransport for BotApiTransport {
  /// Username of the relaying bot.
  type Session = String;
  type File = Part;
  type Peer = i64;

  async fn ensure_session(&self) -> anyhow::Result<SessionState<String>> {
    let res = self.client.get(self.method_url("getMe")).send().await;
    let me: ApiResponse<User> = Self::read(res, "getMe").await?;

    if me.error_code == Some(401) {
      return Ok(SessionState::NeedsInteraction {
        prompt: "the relay api server rejected the bot token, log the bot \
                 in to the server"
          .to_string(),
      });
    }

    let username = me.into_result("getMe")?.username.unwrap_or_default();
    debug!("relay bot is @{}", username);
    Ok(SessionState::Ready(username))
  }

  async fn upload_file(
    &self,
    _session: &String,
    path: &Path,
  ) -> anyhow::Result<Part> {
    let file = File::open(path)
      .await
      .with_context(|| format!("opening {}", path.display()))?;
    let len = file.metadata().await?.len();
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().to_string())
      .unwrap_or_else(|| "artifact".to_string());

    let body = Body::wrap_stream(ReaderStream::new(file));
    Ok(Part::stream_with_length(body, len).file_name(name))
  }

  async fn resolve_peer(
    &self,
    _session: &String,
    identity: &str,
  ) -> anyhow::Result<i64> {
    let res = self
      .client
      .get(self.method_url("getChat"))
      .query(&[("chat_id", identity)])
      .send()
      .await;
    let chat: ApiResponse<Chat> = Self::read(res, "getChat").await?;
    Ok(chat.into_result("getChat")?.id)
  }

  async fn send_file(
    &self,
    session: &String,
    peer: &i64,
    file: Part,
    tag: &str,
  ) -> anyhow::Result<()> {
    let form = Form::new()
      .text("chat_id", peer.to_string())
      .text("caption", tag.to_string())
      .part("document", file);

    debug!("@{} sending document to {}", session, peer);
    let res = self
      .client
      .post(self.method_url("sendDocument"))
      .multipart(form)
      .send()
      .await;
    let sent: ApiResponse<serde_json::Value> =
      Self::read(res, "sendDocument").await?;
    sent.into_result("sendDocument")?;
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use std::sync::{Arc, Mutex};

  use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
  };
  use serde_json::{json, Value};
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::{
    relay::{Relay, RelayUploader},
    variant::RenderedArtifact,
    Error,
  };

  type Uploads = Arc<Mutex<Vec<Bytes>>>;

  async fn get_me() -> Json<Value> {
    Json(json!({"ok": true, "result": {"id": 1, "username": "render_relay"}}))
  }

  async fn get_chat(
    Query(query): Query<std::collections::HashMap<String, String>>,
  ) -> Json<Value> {
    if query.get("chat_id").map(String::as_str) == Some("@render_drop") {
      Json(json!({"ok": true, "result": {"id": -1001, "type": "channel"}}))
    } else {
      Json(json!({
        "ok": false, "error_code": 400, "description": "chat not found"
      }))
    }
  }

  async fn send_document(
    State(uploads): State<Uploads>,
    body: Bytes,
  ) -> Json<Value> {
    uploads.lock().unwrap().push(body);
    Json(json!({"ok": true, "result": {"message_id": 7}}))
  }

  async fn unauthorized() -> (StatusCode, Json<Value>) {
    (
      StatusCode::UNAUTHORIZED,
      Json(json!({
        "ok": false, "error_code": 401, "description": "Unauthorized"
      })),
    )
  }

  async fn api_server(uploads: Uploads) -> String {
    let app = Router::new()
      .route("/botTOKEN/getMe", get(get_me))
      .route("/botTOKEN/getChat", get(get_chat))
      .route("/botTOKEN/sendDocument", post(send_document))
      .route("/botREVOKED/getMe", get(unauthorized))
      .with_state(uploads);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = axum::Server::from_tcp(listener)
      .unwrap()
      .serve(app.into_make_service());
    tokio::spawn(server);
    format!("http://{addr}/")
  }

  fn artifact(dir: &Path) -> RenderedArtifact {
    let path = dir.join("4242.Talk.mp4");
    std::fs::write(&path, b"big file").unwrap();
    RenderedArtifact {
      path,
      byte_size: 8,
      file_name: "Talk.mp4".into(),
    }
  }

  #[tokio::test]
  async fn test_relay_through_bot_api() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = Uploads::default();
    let api_url = api_server(uploads.clone()).await;
    let transport = BotApiTransport::new(api_url, "TOKEN").unwrap();
    let uploader = RelayUploader::new(transport, "@render_drop");
    let artifact = artifact(dir.path());

    uploader
      .relay(&artifact, "4242", &CancellationToken::new())
      .await
      .unwrap();

    let uploads = uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let body = String::from_utf8_lossy(&uploads[0]);
    assert!(body.contains("-1001"));
    assert!(body.contains("4242"));
    assert!(body.contains("big file"));
    assert!(!artifact.path.exists());
  }

  #[tokio::test]
  async fn test_unknown_peer_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let api_url = api_server(Uploads::default()).await;
    let transport = BotApiTransport::new(api_url, "TOKEN").unwrap();
    let uploader = RelayUploader::new(transport, "@nobody");
    let artifact = artifact(dir.path());

    let res = uploader
      .relay(&artifact, "4242", &CancellationToken::new())
      .await;

    let cause = match res {
      Err(Error::Relay(cause)) => cause,
      other => panic!("expected relay error, got {other:?}"),
    };
    assert!(cause.to_string().contains("chat not found"));
    assert!(artifact.path.exists());
  }

  #[tokio::test]
  async fn test_rejected_token_needs_interaction() {
    let api_url = api_server(Uploads::default()).await;
    let transport = BotApiTransport::new(api_url, "REVOKED").unwrap();

    let state = transport.ensure_session().await.unwrap();

    assert!(matches!(state, SessionState::NeedsInteraction { .. }));
  }
}
