/*
 * Description: Low-level zip record encoder: local headers, data
 * descriptors, central directory.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Low-level zip record encoder: local headers, data descriptors, central
//! directory.
//!
//! The encoder accepts entry payloads as raw bytes, so callers that already
//! hold deflate output (with its crc precomputed) can write it through
//! verbatim. Entries whose compressed size is unknown up front are written
//! in streaming mode (general-purpose bit 3) and finalized with a data
//! descriptor; the central directory always carries the true values. Zip64
//! records are emitted whenever a size or offset outgrows its 32-bit field.

use displaydoc::Display;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::CompressionMethod;

use std::io::{self, Write};

/// Unix file-type bits carried in the high half of the external attributes.
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0605_4b50;
const ZIP64_END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0606_4b50;
const ZIP64_END_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;

const VERSION_PLAIN: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const MADE_BY_UNIX: u16 = 3 << 8;

const STREAMED_SIZES: u16 = 1 << 3;

const U32_OVERFLOW: u64 = u32::MAX as u64;

/// Errors from the record encoder itself. Callers must drive exactly one
/// entry at a time; anything else is a misuse of the single-writer pipeline.
#[derive(Debug, Display, Error)]
pub enum EncodeError {
  /// i/o error writing archive records: {0}
  Io(#[from] io::Error),
  /// entry {0:?} was opened while another entry was still open
  EntryStillOpen(String),
  /// no entry is open
  NoOpenEntry,
}

/// The caller-facing description of a single archive member.
#[derive(Clone, Debug)]
pub struct FileHeader {
  /// Slash-separated path; directory entries end in '/'.
  pub name: String,
  pub method: CompressionMethod,
  pub crc32: u32,
  pub uncompressed_size: u64,
  pub compressed_size: u64,
  pub modified: PrimitiveDateTime,
  /// Unix mode including file-type bits; `None` leaves the external
  /// attributes zeroed, as for ordinary non-executable files.
  pub mode: Option<u32>,
  pub extra: Vec<u8>,
}

impl FileHeader {
  pub fn new(name: String, method: CompressionMethod, modified: PrimitiveDateTime) -> Self {
    Self {
      name,
      method,
      crc32: 0,
      uncompressed_size: 0,
      compressed_size: 0,
      modified,
      mode: None,
      extra: Vec::new(),
    }
  }

  pub fn is_directory(&self) -> bool { self.name.ends_with('/') }

  /// Append an extra field, with the two header bytes and the length both in
  /// little-endian order.
  pub fn add_extra_field(&mut self, field_header: [u8; 2], data: &[u8]) {
    self.extra.push(field_header[1]);
    self.extra.push(field_header[0]);
    self
      .extra
      .extend_from_slice(&(data.len() as u16).to_le_bytes());
    self.extra.extend_from_slice(data);
  }
}

fn dos_date_time(t: PrimitiveDateTime) -> (u16, u16) {
  let year = (t.year().max(1980) - 1980) as u16;
  let date = (year << 9) | ((t.month() as u16) << 5) | t.day() as u16;
  let time =
    ((t.hour() as u16) << 11) | ((t.minute() as u16) << 5) | ((t.second() as u16) >> 1);
  (date, time)
}

struct CentralRecord {
  name: String,
  method: u16,
  flags: u16,
  version_needed: u16,
  crc32: u32,
  compressed_size: u64,
  uncompressed_size: u64,
  dos_date: u16,
  dos_time: u16,
  mode: Option<u32>,
  directory: bool,
  extra: Vec<u8>,
  local_header_offset: u64,
}

impl CentralRecord {
  fn external_attributes(&self) -> u32 {
    let mut attrs = self.mode.unwrap_or(0) << 16;
    if self.directory {
      /* MS-DOS directory bit, for tools that ignore the unix half. */
      attrs |= 0x10;
    }
    attrs
  }

  fn version_made_by(&self) -> u16 {
    if self.mode.is_some() {
      MADE_BY_UNIX | VERSION_PLAIN
    } else {
      VERSION_PLAIN
    }
  }

  fn zip64_extra(&self) -> Vec<u8> {
    let mut wide_fields: Vec<u8> = Vec::new();
    if self.uncompressed_size >= U32_OVERFLOW {
      wide_fields.extend_from_slice(&self.uncompressed_size.to_le_bytes());
    }
    if self.compressed_size >= U32_OVERFLOW {
      wide_fields.extend_from_slice(&self.compressed_size.to_le_bytes());
    }
    if self.local_header_offset >= U32_OVERFLOW {
      wide_fields.extend_from_slice(&self.local_header_offset.to_le_bytes());
    }
    if wide_fields.is_empty() {
      return wide_fields;
    }
    let mut extra = Vec::with_capacity(4 + wide_fields.len());
    extra.extend_from_slice(&0x0001_u16.to_le_bytes());
    extra.extend_from_slice(&(wide_fields.len() as u16).to_le_bytes());
    extra.extend_from_slice(&wide_fields);
    extra
  }
}

struct OpenEntry {
  streamed: bool,
  written: u64,
}

/// Streaming zip encoder over any byte sink. Tracks its own offset, so the
/// sink never needs to seek.
pub struct ZipEncoder<W> {
  out: W,
  offset: u64,
  records: Vec<CentralRecord>,
  open: Option<OpenEntry>,
}

impl<W: Write> ZipEncoder<W> {
  pub fn new(out: W) -> Self {
    Self {
      out,
      offset: 0,
      records: Vec::new(),
      open: None,
    }
  }

  fn emit(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
    self.out.write_all(bytes)?;
    self.offset += bytes.len() as u64;
    Ok(())
  }

  /// Open an entry whose crc and sizes are all known up front.
  pub fn begin_known(&mut self, header: &FileHeader) -> Result<(), EncodeError> {
    self.begin(header, false)
  }

  /// Open an entry whose compressed size is not yet known; the caller writes
  /// raw compressed bytes and the encoder counts them, emitting a data
  /// descriptor when the entry is finished.
  pub fn begin_streamed(&mut self, header: &FileHeader) -> Result<(), EncodeError> {
    self.begin(header, true)
  }

  fn begin(&mut self, header: &FileHeader, streamed: bool) -> Result<(), EncodeError> {
    if self.open.is_some() {
      return Err(EncodeError::EntryStillOpen(header.name.clone()));
    }

    let (dos_date, dos_time) = dos_date_time(header.modified);
    let local_zip64 = !streamed
      && (header.uncompressed_size >= U32_OVERFLOW || header.compressed_size >= U32_OVERFLOW);
    let version_needed = if local_zip64 || header.uncompressed_size >= U32_OVERFLOW {
      VERSION_ZIP64
    } else {
      VERSION_PLAIN
    };
    let flags = if streamed { STREAMED_SIZES } else { 0 };

    /* In streamed mode the local sizes and crc stay zero and the data
     * descriptor carries the truth; readers take the central directory's
     * word either way. */
    let (local_crc, local_compressed, local_uncompressed) = if streamed {
      (0, 0, 0)
    } else if local_zip64 {
      (header.crc32, U32_OVERFLOW as u32, U32_OVERFLOW as u32)
    } else {
      (
        header.crc32,
        header.compressed_size as u32,
        header.uncompressed_size as u32,
      )
    };

    let mut zip64_extra: Vec<u8> = Vec::new();
    if local_zip64 {
      zip64_extra.extend_from_slice(&0x0001_u16.to_le_bytes());
      zip64_extra.extend_from_slice(&16_u16.to_le_bytes());
      zip64_extra.extend_from_slice(&header.uncompressed_size.to_le_bytes());
      zip64_extra.extend_from_slice(&header.compressed_size.to_le_bytes());
    }
    let extra_len = header.extra.len() + zip64_extra.len();

    let local_header_offset = self.offset;
    let mut buf: Vec<u8> = Vec::with_capacity(30 + header.name.len() + extra_len);
    buf.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
    buf.extend_from_slice(&version_needed.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&header.method.code().to_le_bytes());
    buf.extend_from_slice(&dos_time.to_le_bytes());
    buf.extend_from_slice(&dos_date.to_le_bytes());
    buf.extend_from_slice(&local_crc.to_le_bytes());
    buf.extend_from_slice(&local_compressed.to_le_bytes());
    buf.extend_from_slice(&local_uncompressed.to_le_bytes());
    buf.extend_from_slice(&(header.name.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(extra_len as u16).to_le_bytes());
    buf.extend_from_slice(header.name.as_bytes());
    buf.extend_from_slice(&header.extra);
    buf.extend_from_slice(&zip64_extra);
    self.emit(&buf)?;

    self.records.push(CentralRecord {
      name: header.name.clone(),
      method: header.method.code(),
      flags,
      version_needed,
      crc32: header.crc32,
      compressed_size: header.compressed_size,
      uncompressed_size: header.uncompressed_size,
      dos_date,
      dos_time,
      mode: header.mode,
      directory: header.is_directory(),
      extra: header.extra.clone(),
      local_header_offset,
    });
    self.open = Some(OpenEntry {
      streamed,
      written: 0,
    });
    Ok(())
  }

  /// Write payload bytes for the open entry.
  pub fn write_data(&mut self, buf: &[u8]) -> Result<(), EncodeError> {
    let open = self.open.as_mut().ok_or(EncodeError::NoOpenEntry)?;
    open.written += buf.len() as u64;
    self.out.write_all(buf)?;
    self.offset += buf.len() as u64;
    Ok(())
  }

  /// Close the open entry, emitting a data descriptor for streamed entries.
  pub fn finish_entry(&mut self) -> Result<(), EncodeError> {
    let OpenEntry { streamed, written } = self.open.take().ok_or(EncodeError::NoOpenEntry)?;
    let record = self
      .records
      .last_mut()
      .expect("an open entry always has a central record");

    if streamed {
      record.compressed_size = written;
      let wide = record.compressed_size >= U32_OVERFLOW || record.uncompressed_size >= U32_OVERFLOW;
      let mut buf: Vec<u8> = Vec::with_capacity(24);
      buf.extend_from_slice(&DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
      buf.extend_from_slice(&record.crc32.to_le_bytes());
      if wide {
        buf.extend_from_slice(&record.compressed_size.to_le_bytes());
        buf.extend_from_slice(&record.uncompressed_size.to_le_bytes());
      } else {
        buf.extend_from_slice(&(record.compressed_size as u32).to_le_bytes());
        buf.extend_from_slice(&(record.uncompressed_size as u32).to_le_bytes());
      }
      self.emit(&buf)?;
    }
    Ok(())
  }

  /// Write the central directory and the end-of-central-directory records,
  /// returning the underlying sink for the caller to flush.
  pub fn finish(mut self) -> Result<W, EncodeError> {
    if self.open.is_some() {
      return Err(EncodeError::EntryStillOpen(
        self
          .records
          .last()
          .map(|r| r.name.clone())
          .unwrap_or_default(),
      ));
    }

    let central_dir_offset = self.offset;
    let records = std::mem::take(&mut self.records);
    for record in &records {
      let zip64_extra = record.zip64_extra();
      let extra_len = record.extra.len() + zip64_extra.len();
      let clamp = |v: u64| -> u32 {
        if v >= U32_OVERFLOW {
          U32_OVERFLOW as u32
        } else {
          v as u32
        }
      };

      let mut buf: Vec<u8> = Vec::with_capacity(46 + record.name.len() + extra_len);
      buf.extend_from_slice(&CENTRAL_HEADER_SIGNATURE.to_le_bytes());
      buf.extend_from_slice(&record.version_made_by().to_le_bytes());
      buf.extend_from_slice(&record.version_needed.to_le_bytes());
      buf.extend_from_slice(&record.flags.to_le_bytes());
      buf.extend_from_slice(&record.method.to_le_bytes());
      buf.extend_from_slice(&record.dos_time.to_le_bytes());
      buf.extend_from_slice(&record.dos_date.to_le_bytes());
      buf.extend_from_slice(&record.crc32.to_le_bytes());
      buf.extend_from_slice(&clamp(record.compressed_size).to_le_bytes());
      buf.extend_from_slice(&clamp(record.uncompressed_size).to_le_bytes());
      buf.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
      buf.extend_from_slice(&(extra_len as u16).to_le_bytes());
      buf.extend_from_slice(&0_u16.to_le_bytes()); /* comment length */
      buf.extend_from_slice(&0_u16.to_le_bytes()); /* disk number start */
      buf.extend_from_slice(&0_u16.to_le_bytes()); /* internal attributes */
      buf.extend_from_slice(&record.external_attributes().to_le_bytes());
      buf.extend_from_slice(&clamp(record.local_header_offset).to_le_bytes());
      buf.extend_from_slice(record.name.as_bytes());
      buf.extend_from_slice(&record.extra);
      buf.extend_from_slice(&zip64_extra);
      self.emit(&buf)?;
    }
    let central_dir_size = self.offset - central_dir_offset;

    let need_zip64 = records.len() > u16::MAX as usize
      || central_dir_size >= U32_OVERFLOW
      || central_dir_offset >= U32_OVERFLOW;
    if need_zip64 {
      let zip64_end_offset = self.offset;
      let mut buf: Vec<u8> = Vec::with_capacity(56 + 20);
      buf.extend_from_slice(&ZIP64_END_OF_CENTRAL_DIR_SIGNATURE.to_le_bytes());
      buf.extend_from_slice(&44_u64.to_le_bytes()); /* size of remaining record */
      buf.extend_from_slice(&VERSION_ZIP64.to_le_bytes());
      buf.extend_from_slice(&VERSION_ZIP64.to_le_bytes());
      buf.extend_from_slice(&0_u32.to_le_bytes()); /* this disk */
      buf.extend_from_slice(&0_u32.to_le_bytes()); /* central dir disk */
      buf.extend_from_slice(&(records.len() as u64).to_le_bytes());
      buf.extend_from_slice(&(records.len() as u64).to_le_bytes());
      buf.extend_from_slice(&central_dir_size.to_le_bytes());
      buf.extend_from_slice(&central_dir_offset.to_le_bytes());
      /* Locator. */
      buf.extend_from_slice(&ZIP64_END_LOCATOR_SIGNATURE.to_le_bytes());
      buf.extend_from_slice(&0_u32.to_le_bytes());
      buf.extend_from_slice(&zip64_end_offset.to_le_bytes());
      buf.extend_from_slice(&1_u32.to_le_bytes()); /* total disks */
      self.emit(&buf)?;
    }

    let clamp16 = |v: usize| -> u16 {
      if v > u16::MAX as usize {
        u16::MAX
      } else {
        v as u16
      }
    };
    let clamp32 = |v: u64| -> u32 {
      if v >= U32_OVERFLOW {
        U32_OVERFLOW as u32
      } else {
        v as u32
      }
    };
    let mut buf: Vec<u8> = Vec::with_capacity(22);
    buf.extend_from_slice(&END_OF_CENTRAL_DIR_SIGNATURE.to_le_bytes());
    buf.extend_from_slice(&0_u16.to_le_bytes()); /* this disk */
    buf.extend_from_slice(&0_u16.to_le_bytes()); /* central dir disk */
    buf.extend_from_slice(&clamp16(records.len()).to_le_bytes());
    buf.extend_from_slice(&clamp16(records.len()).to_le_bytes());
    buf.extend_from_slice(&clamp32(central_dir_size).to_le_bytes());
    buf.extend_from_slice(&clamp32(central_dir_offset).to_le_bytes());
    buf.extend_from_slice(&0_u16.to_le_bytes()); /* comment length */
    self.emit(&buf)?;

    Ok(self.out)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  use crate::compress::BlockCompressor;

  use time::macros::datetime;
  use zip::ZipArchive;

  use std::io::{Cursor, Read};

  const TEST_TIME: PrimitiveDateTime = datetime!(2009-01-01 00:00);

  fn read_back(bytes: Vec<u8>) -> ZipArchive<Cursor<Vec<u8>>> {
    ZipArchive::new(Cursor::new(bytes)).expect("encoder output should parse")
  }

  #[test]
  fn known_size_store_entry_roundtrips() {
    let payload = b"hello\n";
    let mut header = FileHeader::new("a.txt".to_string(), CompressionMethod::Store, TEST_TIME);
    header.crc32 = crc32fast::hash(payload);
    header.uncompressed_size = payload.len() as u64;
    header.compressed_size = payload.len() as u64;

    let mut encoder = ZipEncoder::new(Vec::new());
    encoder.begin_known(&header).unwrap();
    encoder.write_data(payload).unwrap();
    encoder.finish_entry().unwrap();
    let bytes = encoder.finish().unwrap();

    let mut archive = read_back(bytes);
    assert_eq!(archive.len(), 1);
    let mut entry = archive.by_index(0).unwrap();
    assert_eq!(entry.name(), "a.txt");
    assert_eq!(entry.size(), payload.len() as u64);
    assert_eq!(entry.compressed_size(), payload.len() as u64);
    assert_eq!(entry.crc32(), crc32fast::hash(payload));
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, payload);
  }

  #[test]
  fn streamed_deflate_entry_gets_descriptor_sizes() {
    let payload = b"streamed deflate entry contents ".repeat(64);
    let compressed = BlockCompressor::new(5)
      .compress_block(&payload, None, true)
      .unwrap();

    let mut header = FileHeader::new(
      "streamed.bin".to_string(),
      CompressionMethod::Deflate,
      TEST_TIME,
    );
    header.crc32 = crc32fast::hash(&payload);
    header.uncompressed_size = payload.len() as u64;

    let mut encoder = ZipEncoder::new(Vec::new());
    encoder.begin_streamed(&header).unwrap();
    encoder.write_data(&compressed).unwrap();
    encoder.finish_entry().unwrap();
    let bytes = encoder.finish().unwrap();

    let mut archive = read_back(bytes);
    let mut entry = archive.by_index(0).unwrap();
    assert_eq!(entry.compressed_size(), compressed.len() as u64);
    assert_eq!(entry.size(), payload.len() as u64);
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, payload);
  }

  #[test]
  fn directory_entry_carries_mode_and_dos_bit() {
    let mut header = FileHeader::new("sub/".to_string(), CompressionMethod::Store, TEST_TIME);
    header.mode = Some(0o700 | S_IFDIR);

    let mut encoder = ZipEncoder::new(Vec::new());
    encoder.begin_known(&header).unwrap();
    encoder.finish_entry().unwrap();
    let bytes = encoder.finish().unwrap();

    let mut archive = read_back(bytes);
    let entry = archive.by_index(0).unwrap();
    assert!(entry.is_dir());
    assert_eq!(entry.unix_mode(), Some(0o700 | S_IFDIR));
  }

  #[test]
  fn extra_field_layout_is_little_endian() {
    let mut header = FileHeader::new("x".to_string(), CompressionMethod::Store, TEST_TIME);
    header.add_extra_field([0xca, 0xfe], &[]);
    assert_eq!(header.extra, vec![0xfe, 0xca, 0x00, 0x00]);

    header.add_extra_field([0xab, 0xcd], &[1, 2, 3]);
    assert_eq!(
      &header.extra[4..],
      &[0xcd, 0xab, 0x03, 0x00, 1, 2, 3][..]
    );
  }

  #[test]
  fn dos_conversion_of_the_pinned_timestamp() {
    let (date, time) = dos_date_time(TEST_TIME);
    assert_eq!(date, ((2009 - 1980) << 9) | (1 << 5) | 1);
    assert_eq!(time, 0);
  }

  #[test]
  fn second_begin_without_finish_is_rejected() {
    let header = FileHeader::new("a".to_string(), CompressionMethod::Store, TEST_TIME);
    let mut encoder = ZipEncoder::new(Vec::new());
    encoder.begin_known(&header).unwrap();
    assert!(matches!(
      encoder.begin_known(&header),
      Err(EncodeError::EntryStillOpen(_))
    ));
  }
}
