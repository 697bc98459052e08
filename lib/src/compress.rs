/*
 * Description: Deflate block compression with window dictionaries and a
 * stream pool.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Deflate block compression with window dictionaries and a stream pool.
//!
//! A non-final block ends with a sync flush so its output lands on a byte
//! boundary; the final block is closed normally. Concatenating the blocks of
//! one entry therefore yields a single valid raw deflate stream, provided
//! every block after the first is seeded with the 32 KiB of uncompressed
//! input that precedes it.

use displaydoc::Display;
use flate2::{Compress, Compression, FlushCompress, Status};
use parking_lot::Mutex;
use thiserror::Error;

/// Block size used during parallel compression of a single file.
pub const PARALLEL_BLOCK_SIZE: u64 = 1024 * 1024;

/// Minimum file size to use parallel compression. It costs an extra stream
/// allocation per block, since a pooled stream cannot be reseeded with a
/// dictionary on reset.
pub const MIN_PARALLEL_FILE_SIZE: u64 = PARALLEL_BLOCK_SIZE * 6;

/// Size of the deflate compression window (32 KiB).
pub const WINDOW_SIZE: u64 = 32 * 1024;

/// Errors from the underlying deflate encoder.
#[derive(Debug, Display, Error)]
pub enum CompressBlockError {
  /// deflate encoder error: {0}
  Deflate(#[from] flate2::CompressError),
}

/// Compresses byte ranges into raw deflate blocks at a fixed level.
///
/// Streams without a dictionary are pooled and reused by reset; streams
/// seeded with a dictionary are single-use.
pub struct BlockCompressor {
  level: Compression,
  pool: Mutex<Vec<Compress>>,
}

impl BlockCompressor {
  /// `level` is the deflate compression level, 0 through 9.
  pub fn new(level: u32) -> Self {
    Self {
      level: Compression::new(level),
      pool: Mutex::new(Vec::new()),
    }
  }

  /// Compress `input` into one deflate block. A non-empty `dict` seeds the
  /// stream with the trailing window of the preceding uncompressed data;
  /// `last` selects between a sync flush and stream close.
  pub fn compress_block(
    &self,
    input: &[u8],
    dict: Option<&[u8]>,
    last: bool,
  ) -> Result<Vec<u8>, CompressBlockError> {
    match dict {
      Some(dict) if !dict.is_empty() => {
        /* There's no way to reset a stream with a new dictionary, so don't
         * use the pool. */
        let mut stream = Compress::new(self.level, false);
        let window = if dict.len() > WINDOW_SIZE as usize {
          &dict[dict.len() - WINDOW_SIZE as usize..]
        } else {
          dict
        };
        stream.set_dictionary(window)?;
        Self::run(&mut stream, input, last)
      },
      _ => {
        let mut stream = match self.pool.lock().pop() {
          Some(mut pooled) => {
            pooled.reset();
            pooled
          },
          None => Compress::new(self.level, false),
        };
        let result = Self::run(&mut stream, input, last);
        self.pool.lock().push(stream);
        result
      },
    }
  }

  fn run(stream: &mut Compress, input: &[u8], last: bool) -> Result<Vec<u8>, CompressBlockError> {
    let flush = if last {
      FlushCompress::Finish
    } else {
      FlushCompress::Sync
    };

    let mut out = vec![0u8; input.len() + input.len() / 10 + 64];
    let mut filled: usize = 0;
    let mut rest = input;

    loop {
      let before_in = stream.total_in();
      let before_out = stream.total_out();
      let status = stream.compress(rest, &mut out[filled..], flush)?;
      let consumed = (stream.total_in() - before_in) as usize;
      let produced = (stream.total_out() - before_out) as usize;
      rest = &rest[consumed..];
      filled += produced;

      match status {
        Status::StreamEnd => break,
        Status::Ok | Status::BufError => {
          if filled == out.len() {
            /* Incompressible input can overflow the initial estimate. */
            let grown = out.len() * 2;
            out.resize(grown, 0);
          } else if rest.is_empty() && produced == 0 && !last {
            /* The sync flush has fully drained. */
            break;
          }
        },
      }
    }

    out.truncate(filled);
    Ok(out)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  use flate2::read::DeflateDecoder;

  use std::io::Read;

  fn inflate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
      .read_to_end(&mut out)
      .expect("test stream should inflate");
    out
  }

  #[test]
  fn single_closed_block_roundtrips() {
    let input = b"the quick brown fox jumps over the lazy dog ".repeat(100);
    let compressor = BlockCompressor::new(5);
    let block = compressor.compress_block(&input, None, true).unwrap();
    assert_eq!(inflate(&block), input);
  }

  #[test]
  fn flushed_blocks_concatenate_into_one_stream() {
    let first: Vec<u8> = (0..PARALLEL_BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let second = b"and now for something completely different ".repeat(2000);

    let compressor = BlockCompressor::new(6);
    let head = compressor.compress_block(&first, None, false).unwrap();
    let window = &first[first.len() - WINDOW_SIZE as usize..];
    let tail = compressor
      .compress_block(&second, Some(window), true)
      .unwrap();

    let mut stitched = head;
    stitched.extend_from_slice(&tail);

    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(inflate(&stitched), expected);
  }

  #[test]
  fn pooled_streams_are_reused_after_reset() {
    let compressor = BlockCompressor::new(5);
    let input = b"pooled stream reuse check ".repeat(50);
    let first = compressor.compress_block(&input, None, true).unwrap();
    let second = compressor.compress_block(&input, None, true).unwrap();
    /* Identical input through a reset stream must produce identical output,
     * which is also what makes archive output deterministic. */
    assert_eq!(first, second);
    assert_eq!(inflate(&second), input);
  }

  #[test]
  fn empty_input_still_closes_the_stream() {
    let compressor = BlockCompressor::new(5);
    let block = compressor.compress_block(&[], None, true).unwrap();
    assert!(!block.is_empty());
    assert_eq!(inflate(&block), b"");
  }
}
