/*
 * Description: The streaming write pipeline: ordered entry slots, parallel
 * deflate workers, and the serializing writer.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! The streaming write pipeline: ordered entry slots, parallel deflate
//! workers, and the serializing writer.
//!
//! The producer pushes one write-operation slot per logical entry into a
//! bounded fifo and dispatches compression asynchronously; workers publish
//! into their slots whenever they finish. The writer consumes slots strictly
//! in producer order, and block slots strictly in enqueue order within each
//! entry, so the archive layout never depends on worker timing.

use displaydoc::Display;
use thiserror::Error;
use time::{macros::datetime, PrimitiveDateTime};
use tokio::{
  fs, io,
  sync::{mpsc, oneshot},
  task,
};

use crate::{
  compress::{
    BlockCompressor, CompressBlockError, MIN_PARALLEL_FILE_SIZE, PARALLEL_BLOCK_SIZE, WINDOW_SIZE,
  },
  crawl::clean_path,
  destination::{self, ArchiveWriter, DestinationError},
  encode::{FileHeader, S_IFDIR, S_IFLNK, S_IFREG},
  jar,
  limit::{CpuLimiter, MemoryLimiter},
  CompressionMethod, EntryName, PathMapping, SoongNameFormatError,
};

/* Positioned reads, symlink payloads, and mode bits all come from the unix
 * apis; this crate does not target anything else. */
use std::os::unix::{ffi::OsStrExt, fs::FileExt};
use std::{
  cmp,
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
};

/// Every entry in the archive is pinned to this modification time.
const ENTRY_MOD_TIME: PrimitiveDateTime = datetime!(2009-01-01 00:00);

/* The fifo queue decouples the cpu and io loads: directories cost no
 * compression time but still cost some io, and files that are harder to
 * compress don't take a correspondingly longer time to write out. The rate
 * limiters put the real upper bounds on the number of parallel compressions
 * and outstanding buffers. */
const WRITE_OP_QUEUE_DEPTH: usize = 1000;

/// All types of errors from the parallel zip process.
#[derive(Debug, Display, Error)]
pub enum SoongZipError {
  /// i/o error: {0}
  Io(#[from] io::Error),
  /// error writing to the destination archive: {0}
  Destination(#[from] DestinationError),
  /// deflate error: {0}
  Compress(#[from] CompressBlockError),
  /// error joining task: {0}
  Join(#[from] task::JoinError),
  /// error in entry name formatting: {0}
  NameFormat(#[from] SoongNameFormatError),
  /// destination {0:?} is both a directory (from {1:?}) and a file (from {2:?})
  DirectoryFileConflict(String, PathBuf, PathBuf),
  /// destination {0:?} has two files {1:?} and {2:?}
  DuplicateDestination(String, PathBuf, PathBuf),
  /// {0:?} is not a file, directory, or symlink
  UnsupportedFileType(PathBuf),
  /// must enable jar emulation when providing a manifest
  ManifestRequiresJar,
  /// write pipeline channel closed unexpectedly
  ChannelClosed,
}

/// One block of compressed or stored bytes, delivered out of band.
type BlockReader = oneshot::Receiver<Vec<u8>>;

/// A write-operation slot: resolves to a fully described entry once its
/// header (crc and method included) is final.
type EntrySlot = oneshot::Receiver<ZipEntry>;

struct ZipEntry {
  header: FileHeader,
  /// Per-block payload slots, in archive order; `None` for entries with no
  /// payload at all (directories).
  future_readers: Option<mpsc::Receiver<BlockReader>>,
  /// Passed back to the memory limiter so we release exactly as much as was
  /// requested.
  allocated_size: u64,
}

/// Where an entry's bytes come from.
enum EntrySource {
  File(Arc<std::fs::File>),
  Bytes(Vec<u8>),
}

impl EntrySource {
  /// Positioned read of `len` bytes at `offset`; block workers use this so
  /// no reads share a cursor.
  fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, io::Error> {
    match self {
      Self::File(file) => {
        let mut buf = vec![0_u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
      },
      Self::Bytes(bytes) => Ok(bytes[offset as usize..offset as usize + len].to_vec()),
    }
  }

  fn checksum(&self, size: u64) -> Result<u32, io::Error> {
    match self {
      Self::File(file) => {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0_u8; 64 * 1024];
        let mut offset: u64 = 0;
        while offset < size {
          let want = cmp::min(buf.len() as u64, size - offset) as usize;
          file.read_exact_at(&mut buf[..want], offset)?;
          hasher.update(&buf[..want]);
          offset += want as u64;
        }
        Ok(hasher.finalize())
      },
      Self::Bytes(bytes) => Ok(crc32fast::hash(bytes)),
    }
  }
}

fn pinned_header(name: String, method: CompressionMethod) -> FileHeader {
  FileHeader::new(name, method, ENTRY_MOD_TIME)
}

fn parent_dir(path: &str) -> &str {
  match path.rfind('/') {
    Some(i) => &path[..i],
    None => "",
  }
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o100 != 0
}

fn flatten_join<T>(
  result: Result<Result<T, SoongZipError>, task::JoinError>,
) -> Result<T, SoongZipError> {
  match result {
    Ok(inner) => inner,
    Err(e) => Err(e.into()),
  }
}

/// Build an already-resolved single-block reader sequence around `payload`.
fn single_ready_reader(payload: Vec<u8>) -> mpsc::Receiver<BlockReader> {
  let (readers_tx, readers_rx) = mpsc::channel(1);
  let (block_tx, block_rx) = oneshot::channel();
  let _ = block_tx.send(payload);
  readers_tx
    .try_send(block_rx)
    .expect("a fresh channel always has capacity for one reader");
  readers_rx
}

/// Whole-entry compression: checksum the input, then deflate it in one
/// block, falling back to storing the raw bytes whenever deflate fails to
/// shrink them.
fn compress_whole_entry(
  mut header: FileHeader,
  source: EntrySource,
  compressor: &BlockCompressor,
  allocated_size: u64,
) -> Result<ZipEntry, SoongZipError> {
  let data = source.read_range(0, header.uncompressed_size as usize)?;
  header.crc32 = crc32fast::hash(&data);

  let payload = match header.method {
    CompressionMethod::Deflate => {
      let compressed = compressor.compress_block(&data, None, true)?;
      if (compressed.len() as u64) < header.uncompressed_size {
        compressed
      } else {
        tracing::debug!(name = %header.name, "deflate did not shrink entry, storing");
        header.method = CompressionMethod::Store;
        data
      }
    },
    CompressionMethod::Store => data,
  };

  Ok(ZipEntry {
    header,
    future_readers: Some(single_ready_reader(payload)),
    allocated_size,
  })
}

/// The producer side of the pipeline. Owns the directory bookkeeping maps;
/// nothing else ever touches them.
struct Producer {
  write_ops_tx: mpsc::Sender<EntrySlot>,
  errors_tx: mpsc::Sender<SoongZipError>,
  cpu: CpuLimiter,
  memory: MemoryLimiter,
  compressor: Arc<BlockCompressor>,
  created_dirs: HashMap<String, PathBuf>,
  created_files: HashMap<String, PathBuf>,
  directories: bool,
  emulate_jar: bool,
}

impl Producer {
  async fn run(mut self, mappings: Vec<PathMapping>) {
    for mapping in mappings.into_iter() {
      let result = if self.emulate_jar && mapping.name.as_str() == jar::MANIFEST_DEST {
        self.add_manifest(mapping).await
      } else {
        self.add_file(mapping).await
      };
      if let Err(e) = result {
        let _ = self.errors_tx.send(e).await;
        return;
      }
    }
    /* Dropping the sender closes the fifo once the queued slots resolve. */
  }

  /// Import (possibly with compression) one mapped source into the archive.
  async fn add_file(&mut self, mapping: PathMapping) -> Result<(), SoongZipError> {
    let PathMapping {
      name,
      source,
      method,
    } = mapping;

    let metadata = fs::symlink_metadata(&source).await?;
    if metadata.is_dir() {
      if self.directories {
        self.write_directory(name.as_str(), &source).await?;
      }
      return Ok(());
    }

    self.write_directory(name.parent(), &source).await?;
    self.check_unique(&name, &source)?;

    if metadata.file_type().is_symlink() {
      return self.write_symlink(name, &source).await;
    }
    if !metadata.is_file() {
      return Err(SoongZipError::UnsupportedFileType(source));
    }

    let file = fs::File::open(&source).await?.into_std().await;
    let mut header = pinned_header(name.into_string(), method);
    header.uncompressed_size = metadata.len();
    if is_executable(&metadata) {
      header.mode = Some(0o700 | S_IFREG);
    }
    self
      .write_file_contents(header, EntrySource::File(Arc::new(file)))
      .await
  }

  async fn add_manifest(&mut self, mapping: PathMapping) -> Result<(), SoongZipError> {
    let PathMapping { name, source, .. } = mapping;
    let given = fs::read(&source).await?;

    self.write_directory(name.parent(), &source).await?;
    self.check_unique(&name, &source)?;

    let contents = jar::manifest_contents(&given);
    let mut header = pinned_header(name.into_string(), CompressionMethod::Store);
    header.uncompressed_size = contents.len() as u64;
    self
      .write_file_contents(header, EntrySource::Bytes(contents))
      .await
  }

  fn check_unique(&mut self, name: &EntryName, source: &Path) -> Result<(), SoongZipError> {
    if let Some(prev) = self.created_dirs.get(name.as_str()) {
      return Err(SoongZipError::DirectoryFileConflict(
        name.as_str().to_string(),
        prev.clone(),
        source.to_path_buf(),
      ));
    }
    if let Some(prev) = self.created_files.get(name.as_str()) {
      return Err(SoongZipError::DuplicateDestination(
        name.as_str().to_string(),
        prev.clone(),
        source.to_path_buf(),
      ));
    }
    self
      .created_files
      .insert(name.as_str().to_string(), source.to_path_buf());
    Ok(())
  }

  /// Record that `dir` (and its parents) exist for `source`, and emit
  /// directory entries for any newly created ones when enabled.
  async fn write_directory(&mut self, dir: &str, source: &Path) -> Result<(), SoongZipError> {
    let mut dir = clean_path(dir);

    /* Discover any uncreated directories in the path. */
    let mut new_dirs: Vec<String> = Vec::new();
    while !dir.is_empty() && dir != "." && dir != "/" {
      if self.created_dirs.contains_key(&dir) {
        break;
      }
      if let Some(prev) = self.created_files.get(&dir) {
        return Err(SoongZipError::DirectoryFileConflict(
          dir,
          source.to_path_buf(),
          prev.clone(),
        ));
      }
      self.created_dirs.insert(dir.clone(), source.to_path_buf());
      /* Parent directories precede their children. */
      new_dirs.push(dir.clone());
      dir = parent_dir(&dir).to_string();
    }
    new_dirs.reverse();

    if self.directories {
      for new_dir in new_dirs.into_iter() {
        let mut header = pinned_header(format!("{}/", new_dir), CompressionMethod::Store);
        header.mode = Some(0o700 | S_IFDIR);
        if self.emulate_jar && header.name == jar::META_DIR {
          /* Jar files have a zero-length extra field with header "CAFE". */
          header.add_extra_field([0xca, 0xfe], &[]);
        }
        self.submit_ready_entry(header, None).await?;
      }
    }
    Ok(())
  }

  async fn write_symlink(&mut self, name: EntryName, source: &Path) -> Result<(), SoongZipError> {
    let target = fs::read_link(source).await?;
    let target = target.as_os_str().as_bytes().to_vec();

    let mut header = pinned_header(name.into_string(), CompressionMethod::Store);
    header.mode = Some(0o700 | S_IFLNK);
    header.uncompressed_size = target.len() as u64;
    header.crc32 = crc32fast::hash(&target);
    self.submit_ready_entry(header, Some(target)).await
  }

  /// Enqueue an entry whose payload (if any) is already in memory, with its
  /// slot resolved immediately.
  async fn submit_ready_entry(
    &mut self,
    header: FileHeader,
    payload: Option<Vec<u8>>,
  ) -> Result<(), SoongZipError> {
    let (entry_tx, entry_rx) = oneshot::channel();
    self
      .write_ops_tx
      .send(entry_rx)
      .await
      .map_err(|_| SoongZipError::ChannelClosed)?;
    let entry = ZipEntry {
      header,
      future_readers: payload.map(single_ready_reader),
      allocated_size: 0,
    };
    entry_tx
      .send(entry)
      .map_err(|_| SoongZipError::ChannelClosed)?;
    Ok(())
  }

  /// Reserve pipeline resources for one entry and dispatch its compression.
  /// The slot is pushed before anything can block, fixing the entry's
  /// archive position.
  async fn write_file_contents(
    &mut self,
    header: FileHeader,
    source: EntrySource,
  ) -> Result<(), SoongZipError> {
    let (entry_tx, entry_rx) = oneshot::channel();
    self
      .write_ops_tx
      .send(entry_rx)
      .await
      .map_err(|_| SoongZipError::ChannelClosed)?;

    let allocated_size = header.uncompressed_size;
    self.cpu.request().await;
    self.memory.request(allocated_size).await;

    match source {
      EntrySource::File(file)
        if header.method == CompressionMethod::Deflate
          && header.uncompressed_size >= MIN_PARALLEL_FILE_SIZE =>
      {
        self
          .compress_split(header, file, entry_tx, allocated_size)
          .await
      },
      source => {
        let compressor = Arc::clone(&self.compressor);
        let errors_tx = self.errors_tx.clone();
        let cpu = self.cpu.clone();
        task::spawn(async move {
          let result = task::spawn_blocking(move || {
            compress_whole_entry(header, source, &compressor, allocated_size)
          })
          .await;
          cpu.finish();
          match flatten_join(result) {
            Ok(entry) => {
              let _ = entry_tx.send(entry);
            },
            Err(e) => {
              let _ = errors_tx.send(e).await;
            },
          }
        });
        Ok(())
      },
    }
  }

  /// Split a large deflate entry into window-aware blocks compressed in
  /// parallel. Intermediate blocks are sync-flushed and the last is closed,
  /// so the concatenation is a single valid deflate stream.
  async fn compress_split(
    &mut self,
    header: FileHeader,
    file: Arc<std::fs::File>,
    entry_tx: oneshot::Sender<ZipEntry>,
    allocated_size: u64,
  ) -> Result<(), SoongZipError> {
    let file_size = header.uncompressed_size;
    let block_count = (file_size / PARALLEL_BLOCK_SIZE + 1) as usize;
    let (readers_tx, readers_rx) = mpsc::channel::<BlockReader>(block_count);

    let entry = ZipEntry {
      header,
      future_readers: Some(readers_rx),
      allocated_size,
    };

    /* Checksum in the background on the slot claimed above: reading the
     * entire file can take a while, and the header cannot be published
     * without the crc. */
    {
      let file = Arc::clone(&file);
      let errors_tx = self.errors_tx.clone();
      let cpu = self.cpu.clone();
      task::spawn(async move {
        let mut entry = entry;
        let result = task::spawn_blocking(move || {
          Ok::<u32, SoongZipError>(EntrySource::File(file).checksum(file_size)?)
        })
        .await;
        cpu.finish();
        match flatten_join(result) {
          Ok(crc) => {
            entry.header.crc32 = crc;
            let _ = entry_tx.send(entry);
          },
          Err(e) => {
            let _ = errors_tx.send(e).await;
          },
        }
      });
    }

    let mut start: u64 = 0;
    while start < file_size {
      let len = cmp::min(PARALLEL_BLOCK_SIZE, file_size - start) as usize;
      let (block_tx, block_rx) = oneshot::channel::<Vec<u8>>();
      /* Enqueue the reader slot before dispatching its worker, so the block
       * order is fixed no matter who finishes first. */
      readers_tx
        .send(block_rx)
        .await
        .map_err(|_| SoongZipError::ChannelClosed)?;

      self.cpu.request().await;

      let last = start + PARALLEL_BLOCK_SIZE >= file_size;
      let dict_offset = start.checked_sub(WINDOW_SIZE);
      let file = Arc::clone(&file);
      let compressor = Arc::clone(&self.compressor);
      let errors_tx = self.errors_tx.clone();
      let cpu = self.cpu.clone();
      task::spawn(async move {
        let result = task::spawn_blocking(move || {
          let source = EntrySource::File(file);
          let dict = match dict_offset {
            Some(offset) => Some(source.read_range(offset, WINDOW_SIZE as usize)?),
            None => None,
          };
          let input = source.read_range(start, len)?;
          Ok::<Vec<u8>, SoongZipError>(compressor.compress_block(&input, dict.as_deref(), last)?)
        })
        .await;
        cpu.finish();
        match flatten_join(result) {
          Ok(block) => {
            let _ = block_tx.send(block);
          },
          Err(e) => {
            let _ = errors_tx.send(e).await;
          },
        }
      });

      start += PARALLEL_BLOCK_SIZE;
    }
    /* Dropping the sender closes the entry's reader sequence; the source
     * handle itself closes when the last worker drops its Arc. */
    Ok(())
  }
}

async fn reported_error(errors_rx: &mut mpsc::Receiver<SoongZipError>) -> SoongZipError {
  errors_rx
    .recv()
    .await
    .unwrap_or(SoongZipError::ChannelClosed)
}

/// The serializing writer: the only task that touches the output file.
/// Consumes write-operation slots in producer order and block slots in
/// enqueue order, racing the shared error channel at every suspension
/// point.
async fn consume_write_ops(
  mut write_ops_rx: mpsc::Receiver<EntrySlot>,
  mut errors_rx: mpsc::Receiver<SoongZipError>,
  out: ArchiveWriter,
  memory: MemoryLimiter,
) -> Result<(), SoongZipError> {
  loop {
    let slot = tokio::select! {
      biased;
      Some(e) = errors_rx.recv() => return Err(e),
      slot = write_ops_rx.recv() => match slot {
        Some(slot) => slot,
        None => break,
      },
    };

    let entry = tokio::select! {
      biased;
      Some(e) = errors_rx.recv() => return Err(e),
      entry = slot => match entry {
        Ok(entry) => entry,
        /* A worker that fails reports before dropping its slot; surface the
         * reported error rather than the closed channel. */
        Err(_) => return Err(reported_error(&mut errors_rx).await),
      },
    };

    let ZipEntry {
      header,
      future_readers,
      allocated_size,
    } = entry;
    {
      let out = out.clone();
      task::spawn_blocking(move || out.begin_entry(&header)).await??;
    }
    memory.finish(allocated_size);

    if let Some(mut readers) = future_readers {
      loop {
        let block_slot = tokio::select! {
          biased;
          Some(e) = errors_rx.recv() => return Err(e),
          block_slot = readers.recv() => match block_slot {
            Some(block_slot) => block_slot,
            None => break,
          },
        };
        let block = tokio::select! {
          biased;
          Some(e) = errors_rx.recv() => return Err(e),
          block = block_slot => match block {
            Ok(block) => block,
            Err(_) => return Err(reported_error(&mut errors_rx).await),
          },
        };
        let out = out.clone();
        task::spawn_blocking(move || out.write_chunk(&block)).await??;
      }
    }
    {
      let out = out.clone();
      task::spawn_blocking(move || out.finish_entry()).await??;
    }
  }

  /* One last chance to catch an error before sealing the archive. */
  if let Ok(e) = errors_rx.try_recv() {
    return Err(e);
  }
  task::spawn_blocking(move || out.finish()).await??;
  Ok(())
}

/// A fully described archive build: the ordered mappings plus every knob
/// the pipeline honors.
#[derive(Clone, Debug)]
pub struct SoongZip {
  pub mappings: Vec<PathMapping>,
  /// Deflate level, 0 through 9.
  pub compression_level: u32,
  /// Upper bound on simultaneously executing compression tasks.
  pub parallelism: usize,
  /// Emit directory entries for each created parent directory.
  pub directories: bool,
  /// Sort entries into jar order, synthesize the manifest, and tag
  /// `META-INF/`.
  pub emulate_jar: bool,
  /// Manifest file to synthesize into `META-INF/MANIFEST.MF`; requires jar
  /// emulation.
  pub manifest: Option<PathBuf>,
  /// High-water mark for bytes held by in-flight entries; zero means
  /// unbounded.
  pub memory_limit: u64,
}

impl SoongZip {
  /// Build the archive at `out_path`. On any error the partial output is
  /// removed.
  pub async fn write_to(self, out_path: &Path) -> Result<(), SoongZipError> {
    let result = self.write_archive(out_path).await;
    if result.is_err() {
      let _ = fs::remove_file(out_path).await;
    }
    result
  }

  async fn write_archive(self, out_path: &Path) -> Result<(), SoongZipError> {
    let Self {
      mut mappings,
      compression_level,
      parallelism,
      directories,
      emulate_jar,
      manifest,
      memory_limit,
    } = self;

    if let Some(manifest) = manifest {
      if !emulate_jar {
        return Err(SoongZipError::ManifestRequiresJar);
      }
      mappings.push(PathMapping {
        name: EntryName::validate(jar::MANIFEST_DEST.to_string())
          .expect("the manifest destination is a valid entry name"),
        source: manifest,
        method: CompressionMethod::Deflate,
      });
    }
    if emulate_jar {
      jar::sort_mappings(&mut mappings);
    }

    let out = destination::initialize(out_path).await?;

    let (errors_tx, errors_rx) = mpsc::channel::<SoongZipError>(1);
    let (write_ops_tx, write_ops_rx) = mpsc::channel::<EntrySlot>(WRITE_OP_QUEUE_DEPTH);
    let memory = MemoryLimiter::new(memory_limit);

    let producer = Producer {
      write_ops_tx,
      errors_tx,
      cpu: CpuLimiter::new(cmp::max(parallelism, 1)),
      memory: memory.clone(),
      compressor: Arc::new(BlockCompressor::new(compression_level)),
      created_dirs: HashMap::new(),
      created_files: HashMap::new(),
      directories: directories || emulate_jar,
      emulate_jar,
    };
    task::spawn(producer.run(mappings));

    consume_write_ops(write_ops_rx, errors_rx, out, memory).await
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn parent_dir_walks_up_one_component() {
    assert_eq!(parent_dir("x/y/z.txt"), "x/y");
    assert_eq!(parent_dir("x/y"), "x");
    assert_eq!(parent_dir("x"), "");
  }

  #[test]
  fn whole_entry_fallback_stores_incompressible_input() {
    /* A short xorshift stream is effectively incompressible. */
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut data = Vec::with_capacity(1024);
    for _ in 0..1024 {
      state ^= state << 13;
      state ^= state >> 7;
      state ^= state << 17;
      data.push(state as u8);
    }

    let mut header = pinned_header("random.bin".to_string(), CompressionMethod::Deflate);
    header.uncompressed_size = data.len() as u64;
    let compressor = BlockCompressor::new(5);
    let entry =
      compress_whole_entry(header, EntrySource::Bytes(data.clone()), &compressor, 0).unwrap();

    assert_eq!(entry.header.method, CompressionMethod::Store);
    assert_eq!(entry.header.crc32, crc32fast::hash(&data));
  }

  #[test]
  fn whole_entry_keeps_deflate_when_it_shrinks() {
    let data = b"compressible text, repeated. ".repeat(64);
    let mut header = pinned_header("text.txt".to_string(), CompressionMethod::Deflate);
    header.uncompressed_size = data.len() as u64;
    let compressor = BlockCompressor::new(5);
    let entry =
      compress_whole_entry(header, EntrySource::Bytes(data.to_vec()), &compressor, 0).unwrap();

    assert_eq!(entry.header.method, CompressionMethod::Deflate);
  }
}
