use std::{
  pin::Pin,
  task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;

use crate::variant::{Kind, StreamVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
  pub kind: Kind,
  pub bytes_so_far: u64,
  pub total_bytes: Option<u64>,
}

impl Progress {
  /// Nothing transferred yet.
  pub fn start(variant: &StreamVariant) -> Self {
    Self {
      kind: variant.kind(),
      bytes_so_far: 0,
      total_bytes: variant.byte_size(),
    }
  }
}

/// Counts the bytes flowing through `stream` and publishes the running
/// total. Publishing never waits on observers; a slow observer simply
/// sees the latest value.
pub struct ProgressStream<T> {
  stream: T,
  progress: Progress,
  observer: Option<watch::Sender<Progress>>,
}

impl<T> ProgressStream<T> {
  pub fn new(stream: T, kind: Kind, total_bytes: Option<u64>) -> Self {
    ProgressStream {
      stream,
      progress: Progress {
        kind,
        bytes_so_far: 0,
        total_bytes,
      },
      observer: None,
    }
  }

  pub fn observer(self, observer: Option<watch::Sender<Progress>>) -> Self {
    ProgressStream { observer, ..self }
  }

  pub fn bytes_so_far(&self) -> u64 {
    self.progress.bytes_so_far
  }
}

impl<T, E> Stream for ProgressStream<T>
where
  T: Stream<Item = Result<Bytes, E>> + Unpin,
{
  type Item = Result<Bytes, E>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    let this = &mut *self;
    let poll = Pin::new(&mut this.stream).poll_next(cx);
    if let Poll::Ready(Some(Ok(bytes))) = &poll {
      if bytes.is_empty() {
        return poll;
      }

      this.progress.bytes_so_far += bytes.len() as u64;
      if let Some(observer) = &this.observer {
        observer.send_replace(this.progress);
      }
    }

    poll
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use futures::executor::block_on_stream;

  #[test]
  fn test_progress_stream() {
    let chunks: Vec<Result<Bytes, ()>> = vec![
      Ok(Bytes::from_static(b"hello")),
      Ok(Bytes::new()),
      Ok(Bytes::from_static(b"world!")),
    ];
    let (tx, rx) = watch::channel(Progress {
      kind: Kind::Audio,
      bytes_so_far: 0,
      total_bytes: None,
    });

    let stream = ProgressStream::new(
      futures::stream::iter(chunks),
      Kind::Audio,
      Some(11),
    )
    .observer(Some(tx));

    let bytes = block_on_stream(stream)
      .map(Result::unwrap)
      .collect::<Vec<_>>();

    assert_eq!(bytes.concat(), b"helloworld!".to_vec());
    assert_eq!(
      *rx.borrow(),
      Progress {
        kind: Kind::Audio,
        bytes_so_far: 11,
        total_bytes: Some(11),
      }
    );
  }

  #[test]
  fn test_progress_stream_without_observer() {
    let chunks: Vec<Result<Bytes, ()>> =
      vec![Ok(Bytes::from_static(b"abc")), Err(())];
    let mut stream = block_on_stream(ProgressStream::new(
      futures::stream::iter(chunks),
      Kind::Video,
      None,
    ));

    assert_eq!(stream.next(), Some(Ok(Bytes::from_static(b"abc"))));
    assert_eq!(stream.next(), Some(Err(())));
    assert_eq!(stream.next(), None);
  }
}
