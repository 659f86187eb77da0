use std::{fmt, path::PathBuf, str::FromStr};

use serde::Serialize;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
  Audio,
  Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
  Aac,
  Mp3,
  Mp4,
  WebM,
  Other(String),
}

impl Container {
  /// `audio_codec` is only given for audio-only formats; an mp4 with an
  /// mp4a codec and no video is plain AAC.
  pub fn from_ext(ext: &str, audio_codec: Option<&str>) -> Self {
    match ext {
      "m4a" | "aac" => Container::Aac,
      "mp4" if audio_codec.is_some_and(|c| c.starts_with("mp4a")) => {
        Container::Aac
      }
      "mp4" => Container::Mp4,
      "webm" => Container::WebM,
      "mp3" => Container::Mp3,
      other => Container::Other(other.to_string()),
    }
  }
}

/// Opaque handle used to open the remote stream of a variant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocator {
  pub url: String,
  pub headers: Vec<(String, String)>,
}

impl SourceLocator {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      headers: vec![],
    }
  }

  /// Request headers the upstream expects on the stream request.
  pub fn with_headers(self, headers: Vec<(String, String)>) -> Self {
    Self { headers, ..self }
  }
}

/// One discoverable encoded rendition of a source.
///
/// Audio variants never carry a resolution or frame rate; the constructors
/// are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamVariant {
  kind: Kind,
  container: Container,
  audio_bitrate_kbps: Option<u32>,
  video_resolution: Option<u32>,
  frame_rate: Option<u32>,
  byte_size: Option<u64>,
  source: SourceLocator,
  suggested_file_name: String,
}

impl StreamVariant {
  pub fn audio(
    container: Container,
    bitrate_kbps: Option<u32>,
    byte_size: Option<u64>,
    source: SourceLocator,
    suggested_file_name: impl Into<String>,
  ) -> Self {
    Self {
      kind: Kind::Audio,
      container,
      audio_bitrate_kbps: bitrate_kbps,
      video_resolution: None,
      frame_rate: None,
      byte_size,
      source,
      suggested_file_name: suggested_file_name.into(),
    }
  }

  pub fn video(
    container: Container,
    resolution: Option<u32>,
    frame_rate: Option<u32>,
    byte_size: Option<u64>,
    source: SourceLocator,
    suggested_file_name: impl Into<String>,
  ) -> Self {
    Self {
      kind: Kind::Video,
      container,
      audio_bitrate_kbps: None,
      video_resolution: resolution,
      frame_rate,
      byte_size,
      source,
      suggested_file_name: suggested_file_name.into(),
    }
  }

  pub fn kind(&self) -> Kind {
    self.kind
  }

  pub fn container(&self) -> &Container {
    &self.container
  }

  pub fn audio_bitrate_kbps(&self) -> Option<u32> {
    self.audio_bitrate_kbps
  }

  pub fn video_resolution(&self) -> Option<u32> {
    self.video_resolution
  }

  pub fn frame_rate(&self) -> Option<u32> {
    self.frame_rate
  }

  pub fn byte_size(&self) -> Option<u64> {
    self.byte_size
  }

  pub fn source(&self) -> &SourceLocator {
    &self.source
  }

  pub fn suggested_file_name(&self) -> &str {
    &self.suggested_file_name
  }

  /// Extension of the suggested file name, `bin` when it has none.
  pub fn extension(&self) -> &str {
    self
      .suggested_file_name
      .rsplit_once('.')
      .map(|(_, ext)| ext)
      .filter(|ext| !ext.is_empty())
      .unwrap_or("bin")
  }
}

/// What the user picked from the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionRequest {
  Audio,
  Video { resolution: u32 },
}

impl SelectionRequest {
  pub fn kind(&self) -> Kind {
    match self {
      SelectionRequest::Audio => Kind::Audio,
      SelectionRequest::Video { .. } => Kind::Video,
    }
  }
}

impl fmt::Display for SelectionRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SelectionRequest::Audio => write!(f, "audio"),
      SelectionRequest::Video { resolution } => write!(f, "video@{resolution}"),
    }
  }
}

// accepts "audio", "audio|<bitrate>", "video@<res>" and "video|<res>"
impl FromStr for SelectionRequest {
  type Err = Error;

  fn from_str(key: &str) -> Result<Self, Self::Err> {
    let key = key.trim();
    let (kind, arg) = match key.split_once(['@', '|']) {
      Some((kind, arg)) => (kind, Some(arg)),
      None => (key, None),
    };

    match (kind.to_ascii_lowercase().as_str(), arg) {
      ("audio", _) => Ok(SelectionRequest::Audio),
      ("video", Some(res)) => res
        .trim_end_matches('p')
        .parse()
        .map(|resolution| SelectionRequest::Video { resolution })
        .map_err(|_| Error::NoMatch(key.to_string())),
      _ => Err(Error::NoMatch(key.to_string())),
    }
  }
}

/// The variants picked for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionResult {
  Audio(StreamVariant),
  Video {
    video: StreamVariant,
    // absent when the catalog has no separate audio track
    audio: Option<StreamVariant>,
  },
}

impl SelectionResult {
  pub fn chosen_audio(&self) -> Option<&StreamVariant> {
    match self {
      SelectionResult::Audio(audio) => Some(audio),
      SelectionResult::Video { audio, .. } => audio.as_ref(),
    }
  }

  pub fn chosen_video(&self) -> Option<&StreamVariant> {
    match self {
      SelectionResult::Audio(_) => None,
      SelectionResult::Video { video, .. } => Some(video),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
  pub path: PathBuf,
  pub byte_size: u64,
  // name presented to the requester, without the temp namespace
  pub file_name: String,
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_parse_selection_request() {
    assert_eq!(
      "audio".parse::<SelectionRequest>().unwrap(),
      SelectionRequest::Audio
    );
    assert_eq!(
      "audio|128".parse::<SelectionRequest>().unwrap(),
      SelectionRequest::Audio
    );
    assert_eq!(
      "video@1080".parse::<SelectionRequest>().unwrap(),
      SelectionRequest::Video { resolution: 1080 }
    );
    assert_eq!(
      "video|720".parse::<SelectionRequest>().unwrap(),
      SelectionRequest::Video { resolution: 720 }
    );
    assert_eq!(
      "video@480p".parse::<SelectionRequest>().unwrap(),
      SelectionRequest::Video { resolution: 480 }
    );

    assert!(matches!(
      "video".parse::<SelectionRequest>(),
      Err(Error::NoMatch(_))
    ));
    assert!(matches!(
      "video@hd".parse::<SelectionRequest>(),
      Err(Error::NoMatch(_))
    ));
    assert!(matches!(
      "subtitles".parse::<SelectionRequest>(),
      Err(Error::NoMatch(_))
    ));
  }

  #[test]
  fn test_selection_request_display_parses_back() {
    for req in [
      SelectionRequest::Audio,
      SelectionRequest::Video { resolution: 360 },
    ] {
      assert_eq!(req.to_string().parse::<SelectionRequest>().unwrap(), req);
    }
  }

  #[test]
  fn test_audio_variant_has_no_video_attributes() {
    let audio = StreamVariant::audio(
      Container::Aac,
      Some(128),
      Some(1000),
      SourceLocator::new("https://example.com/a"),
      "song.m4a",
    );
    assert_eq!(audio.kind(), Kind::Audio);
    assert_eq!(audio.video_resolution(), None);
    assert_eq!(audio.frame_rate(), None);
    assert_eq!(audio.extension(), "m4a");
  }

  #[test]
  fn test_container_from_ext() {
    assert_eq!(Container::from_ext("m4a", Some("mp4a.40.2")), Container::Aac);
    assert_eq!(Container::from_ext("mp4", Some("mp4a.40.2")), Container::Aac);
    assert_eq!(Container::from_ext("mp4", None), Container::Mp4);
    assert_eq!(Container::from_ext("webm", Some("opus")), Container::WebM);
    assert_eq!(
      Container::from_ext("3gp", None),
      Container::Other("3gp".into())
    );
  }
}
