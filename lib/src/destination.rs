/*
 * Description: Output file setup and the facade over the zip record
 * encoder.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Output file setup and the facade over the zip record encoder.

use displaydoc::Display;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{fs, io, task};

use crate::{
  encode::{EncodeError, FileHeader, ZipEncoder},
  CompressionMethod,
};

use std::{io::Write, path::Path, sync::Arc};

#[derive(Debug, Display, Error)]
pub enum DestinationError {
  /// i/o error accessing destination file: {0}
  Io(#[from] io::Error),
  /// error encoding zip records into destination file: {0}
  Encode(#[from] EncodeError),
  /// destination archive was already finalized
  AlreadyFinished,
  /// error joining zip setup task: {0}
  Join(#[from] task::JoinError),
}

/// Create (or truncate) the output archive and hand back the writer facade.
/// The partial file is the caller's to remove on error.
pub async fn initialize(path: &Path) -> Result<ArchiveWriter, DestinationError> {
  let file = fs::OpenOptions::new()
    .write(true)
    .create(true)
    .truncate(true)
    .open(path)
    .await?;
  let file = file.into_std().await;

  let writer = task::spawn_blocking(move || ArchiveWriter::new(file)).await?;
  Ok(writer)
}

type Encoder = ZipEncoder<std::io::BufWriter<std::fs::File>>;

/// The single-writer surface over the record encoder. Deflate entries hand
/// over pre-compressed bytes with their crc already known; store entries
/// hand over raw bytes, and their compressed size always equals their
/// uncompressed size.
///
/// The handle is cheap to clone so the consuming task can ship it into
/// blocking calls; the lock inside only ever sees that one caller, and
/// `finish` retires the encoder so later calls fail loudly instead of
/// writing past the central directory.
#[derive(Clone)]
pub struct ArchiveWriter {
  encoder: Arc<Mutex<Option<Encoder>>>,
}

impl ArchiveWriter {
  fn new(file: std::fs::File) -> Self {
    Self {
      encoder: Arc::new(Mutex::new(Some(ZipEncoder::new(std::io::BufWriter::new(
        file,
      ))))),
    }
  }

  fn with_encoder<T>(
    &self,
    op: impl FnOnce(&mut Encoder) -> Result<T, EncodeError>,
  ) -> Result<T, DestinationError> {
    let mut slot = self.encoder.lock();
    let encoder = slot.as_mut().ok_or(DestinationError::AlreadyFinished)?;
    Ok(op(encoder)?)
  }

  pub fn begin_entry(&self, header: &FileHeader) -> Result<(), DestinationError> {
    self.with_encoder(|encoder| match header.method {
      CompressionMethod::Deflate => encoder.begin_streamed(header),
      CompressionMethod::Store => {
        let mut header = header.clone();
        header.compressed_size = header.uncompressed_size;
        encoder.begin_known(&header)
      },
    })
  }

  pub fn write_chunk(&self, buf: &[u8]) -> Result<(), DestinationError> {
    self.with_encoder(|encoder| encoder.write_data(buf))
  }

  pub fn finish_entry(&self) -> Result<(), DestinationError> {
    self.with_encoder(|encoder| encoder.finish_entry())
  }

  /// Flush the central directory and the underlying file, retiring the
  /// encoder.
  pub fn finish(&self) -> Result<(), DestinationError> {
    let encoder = self
      .encoder
      .lock()
      .take()
      .ok_or(DestinationError::AlreadyFinished)?;
    let mut out = encoder.finish()?;
    out.flush().map_err(io::Error::from)?;
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn initialize_truncates_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.zip");
    std::fs::write(&path, b"stale bytes that should disappear").unwrap();

    let writer = initialize(&path).await.unwrap();
    writer.finish().unwrap();

    /* An empty archive is just the end-of-central-directory record. */
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 22);
    assert_eq!(&bytes[..4], &[0x50, 0x4b, 0x05, 0x06]);
  }

  #[tokio::test]
  async fn writes_after_finish_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.zip");

    let writer = initialize(&path).await.unwrap();
    writer.finish().unwrap();
    assert!(matches!(
      writer.write_chunk(b"late"),
      Err(DestinationError::AlreadyFinished)
    ));
    assert!(matches!(
      writer.finish(),
      Err(DestinationError::AlreadyFinished)
    ));
  }
}
