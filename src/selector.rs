use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
  variant::{
    Container, Kind, SelectionRequest, SelectionResult, StreamVariant,
  },
  Error, Result,
};

/// 1.5 GiB, the hard cap of anything the menu offers. Deployments that
/// cannot relay pass the primary channel limit instead.
pub const SIZE_CEILING: u64 = 1_610_612_736;

const MENU_FRAME_RATE: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuEntry {
  pub choice: String,
  pub label: String,
  pub byte_size: u64,
}

fn under_ceiling(size: Option<u64>, ceiling: u64) -> bool {
  size.is_some_and(|size| size < ceiling)
}

/// Highest-bitrate AAC audio variant, if one exists at all.
fn best_audio(catalog: &[StreamVariant]) -> Option<&StreamVariant> {
  catalog
    .iter()
    .filter(|v| v.kind() == Kind::Audio && v.container() == &Container::Aac)
    // ties keep the first listed variant
    .rev()
    .max_by_key(|v| v.audio_bitrate_kbps().unwrap_or(0))
}

/// Largest 30fps MP4 video per resolution.
fn best_videos(catalog: &[StreamVariant]) -> BTreeMap<u32, &StreamVariant> {
  let mut picks: BTreeMap<u32, &StreamVariant> = BTreeMap::new();

  let candidates = catalog.iter().filter(|v| {
    v.kind() == Kind::Video
      && v.container() == &Container::Mp4
      && v.frame_rate() == Some(MENU_FRAME_RATE)
  });

  for video in candidates {
    let Some(resolution) = video.video_resolution() else {
      continue;
    };

    let pick = picks.entry(resolution).or_insert(video);
    if video.byte_size().unwrap_or(0) > pick.byte_size().unwrap_or(0) {
      *pick = video;
    }
  }

  picks
}

// the companion audio contributes its size to every video pairing; a
// companion of unknown size counts as 0
fn pair_size(
  video: &StreamVariant,
  audio: Option<&StreamVariant>,
) -> Option<u64> {
  let audio_size = audio.and_then(|a| a.byte_size()).unwrap_or(0);
  Some(video.byte_size()? + audio_size)
}

struct Picks<'a> {
  audio: Option<&'a StreamVariant>,
  videos: Vec<(u32, &'a StreamVariant, u64)>,
}

// the single derivation shared by menu and resolution
fn derive(catalog: &[StreamVariant], ceiling: u64) -> Picks<'_> {
  let audio = best_audio(catalog);

  let videos = best_videos(catalog)
    .into_iter()
    .filter_map(|(resolution, video)| {
      let size = pair_size(video, audio).filter(|s| *s < ceiling)?;
      Some((resolution, video, size))
    })
    .collect();

  Picks { audio, videos }
}

/// Entries whose delivered size stays under `ceiling`.
pub fn build_menu(
  catalog: &[StreamVariant],
  ceiling: u64,
) -> Vec<MenuEntry> {
  let picks = derive(catalog, ceiling);
  let mut menu = vec![];

  let audio = picks
    .audio
    .filter(|a| under_ceiling(a.byte_size(), ceiling));
  if let Some(audio) = audio {
    let size = audio.byte_size().unwrap_or(0);
    menu.push(MenuEntry {
      choice: SelectionRequest::Audio.to_string(),
      label: format!("🎧 Mp3 / {}", format_size(size)),
      byte_size: size,
    });
  }

  for (resolution, _video, size) in picks.videos {
    menu.push(MenuEntry {
      choice: SelectionRequest::Video { resolution }.to_string(),
      label: format!("🎥 {resolution}p mp4 / {}", format_size(size)),
      byte_size: size,
    });
  }

  menu
}

pub fn resolve(
  catalog: &[StreamVariant],
  request: &SelectionRequest,
  ceiling: u64,
) -> Result<SelectionResult> {
  let picks = derive(catalog, ceiling);
  let no_match = || Error::NoMatch(request.to_string());

  match request {
    SelectionRequest::Audio => {
      let audio = picks
        .audio
        .filter(|a| under_ceiling(a.byte_size(), ceiling))
        .ok_or_else(no_match)?;
      Ok(SelectionResult::Audio(audio.clone()))
    }
    SelectionRequest::Video { resolution } => {
      let (_, video, _) = picks
        .videos
        .into_iter()
        .find(|(res, _, _)| res == resolution)
        .ok_or_else(no_match)?;
      Ok(SelectionResult::Video {
        video: video.clone(),
        audio: picks.audio.cloned(),
      })
    }
  }
}

/// Renders a byte count in the largest binary unit whose value is >= 1.
pub fn format_size(bytes: u64) -> String {
  const KIB: f64 = 1024.0;
  let kib = bytes as f64 / KIB;
  let mib = kib / KIB;
  let gib = mib / KIB;

  if gib >= 1.0 {
    format!("{gib:.2} GiB")
  } else if mib >= 1.0 {
    format!("{mib:.2} MiB")
  } else {
    format!("{kib:.2} KiB")
  }
}
