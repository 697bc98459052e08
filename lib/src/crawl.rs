/*
 * Description: Resolve requested source paths into an ordered list of
 * archive path mappings.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Resolve requested source paths into an ordered list of archive path
//! mappings.
//!
//! Each request carries the archive prefix and relative root that were in
//! effect when it was given on the command line; resolution preserves the
//! request order, and directory enumeration is sorted per directory so the
//! mapping list is deterministic for a fixed input set.

use async_recursion::async_recursion;
use displaydoc::Display;
use futures::stream::StreamExt;
use thiserror::Error;
use tokio::{fs, io};
use tokio_stream::wrappers::ReadDirStream;

use crate::{CompressionMethod, EntryName, PathMapping, SoongNameFormatError};

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
};

#[derive(Debug, Display, Error)]
pub enum SoongCrawlError {
  /// i/o error: {0}
  Io(#[from] io::Error),
  /// path {0:?} is not valid unicode
  NonUnicodePath(PathBuf),
  /// cannot make {1:?} relative to {0:?}
  NotRelative(String, String),
  /// error in entry name formatting: {0}
  NameFormat(#[from] SoongNameFormatError),
}

/// Where one `-f`/`-l`/`-D` request gets its source paths from.
#[derive(Clone, Debug)]
pub enum FileArgKind {
  /// A single source file.
  File(String),
  /// A file listing one source path per line.
  List(PathBuf),
  /// A directory to enumerate recursively.
  GlobDir(String),
}

/// One input request together with the prefix and relative root that were
/// current when it appeared.
#[derive(Clone, Debug)]
pub struct FileArg {
  pub path_prefix_in_zip: String,
  pub source_prefix_to_strip: String,
  pub kind: FileArgKind,
}

/// The full set of input requests plus the archive paths to be stored
/// without compression.
#[derive(Clone, Debug, Default)]
pub struct SoongCrawl {
  pub args: Vec<FileArg>,
  pub non_deflated: HashSet<String>,
}

impl SoongCrawl {
  /// Resolve every request into `(name, source, method)` mappings, in
  /// request order.
  pub async fn resolve(self) -> Result<Vec<PathMapping>, SoongCrawlError> {
    let Self { args, non_deflated } = self;

    let mut mappings: Vec<PathMapping> = Vec::new();
    for FileArg {
      path_prefix_in_zip,
      source_prefix_to_strip,
      kind,
    } in args.into_iter()
    {
      let sources: Vec<String> = match kind {
        FileArgKind::File(src) => vec![src],
        FileArgKind::List(list) => {
          let contents = fs::read_to_string(&list).await?;
          contents.lines().map(|line| line.to_string()).collect()
        },
        FileArgKind::GlobDir(dir) => {
          let mut found: Vec<String> = Vec::new();
          walk_directory(Path::new(&clean_path(&dir)), &mut found).await?;
          found
        },
      };
      for src in sources.into_iter() {
        fill_path_mapping(
          &path_prefix_in_zip,
          &source_prefix_to_strip,
          &src,
          &non_deflated,
          &mut mappings,
        )?;
      }
    }
    Ok(mappings)
  }
}

fn fill_path_mapping(
  prefix: &str,
  rel_root: &str,
  src: &str,
  non_deflated: &HashSet<String>,
  mappings: &mut Vec<PathMapping>,
) -> Result<(), SoongCrawlError> {
  let src = src.trim();
  if src.is_empty() {
    return Ok(());
  }
  let src = clean_path(src);

  let dest = relative_path(rel_root, &src)?;
  let dest = if prefix.is_empty() {
    clean_path(&dest)
  } else {
    clean_path(&format!("{}/{}", prefix, dest))
  };

  let method = if non_deflated.contains(&dest) {
    CompressionMethod::Store
  } else {
    CompressionMethod::Deflate
  };

  mappings.push(PathMapping {
    name: EntryName::validate(dest)?,
    source: PathBuf::from(src),
    method,
  });
  Ok(())
}

/// Lexicographic clean of a slash-separated path: collapse separators, drop
/// `.` components, and resolve `..` against preceding components.
pub fn clean_path(path: &str) -> String {
  let rooted = path.starts_with('/');
  let mut components: Vec<&str> = Vec::new();
  for component in path.split('/') {
    match component {
      "" | "." => {},
      ".." => match components.last() {
        Some(&last) if last != ".." => {
          components.pop();
        },
        _ => {
          /* A rooted path cannot climb above the root. */
          if !rooted {
            components.push("..");
          }
        },
      },
      other => components.push(other),
    }
  }

  let joined = components.join("/");
  if rooted {
    format!("/{}", joined)
  } else if joined.is_empty() {
    ".".to_string()
  } else {
    joined
  }
}

/// The path to `target` relative to `base`, with both interpreted
/// lexically. Fails when one is absolute and the other is not.
pub fn relative_path(base: &str, target: &str) -> Result<String, SoongCrawlError> {
  let base = clean_path(base);
  let target = clean_path(target);
  if base == target {
    return Ok(".".to_string());
  }
  if base.starts_with('/') != target.starts_with('/') {
    return Err(SoongCrawlError::NotRelative(base, target));
  }

  let split = |p: &str| -> Vec<String> {
    if p == "." {
      return Vec::new();
    }
    p.split('/')
      .filter(|c| !c.is_empty())
      .map(|c| c.to_string())
      .collect()
  };
  let base_components = split(&base);
  let target_components = split(&target);

  let mut shared = 0;
  while shared < base_components.len()
    && shared < target_components.len()
    && base_components[shared] == target_components[shared]
  {
    shared += 1;
  }
  if base_components[shared..].iter().any(|c| c == "..") {
    return Err(SoongCrawlError::NotRelative(base, target));
  }

  let mut result: Vec<&str> = Vec::new();
  for _ in shared..base_components.len() {
    result.push("..");
  }
  result.extend(target_components[shared..].iter().map(|c| c.as_str()));
  if result.is_empty() {
    Ok(".".to_string())
  } else {
    Ok(result.join("/"))
  }
}

/* Children are sorted per directory so that enumeration is reproducible
 * across filesystems, and visited depth-first in name order. Symlinks are
 * recorded as files without being followed; the write pipeline decides what
 * to do with them. */
#[async_recursion]
async fn walk_directory(dir: &Path, found: &mut Vec<String>) -> Result<(), SoongCrawlError> {
  let mut children: Vec<fs::DirEntry> = ReadDirStream::new(fs::read_dir(dir).await?)
    .collect::<Vec<io::Result<fs::DirEntry>>>()
    .await
    .into_iter()
    .collect::<Result<Vec<fs::DirEntry>, io::Error>>()?;
  children.sort_by_key(|child| child.file_name());

  for child in children.into_iter() {
    let file_type = child.file_type().await?;
    let path = child.path();
    if file_type.is_dir() {
      walk_directory(&path, found).await?;
    } else {
      let path = path
        .into_os_string()
        .into_string()
        .map_err(|os| SoongCrawlError::NonUnicodePath(PathBuf::from(os)))?;
      found.push(path);
    }
  }
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn clean_collapses_dots_and_separators() {
    assert_eq!(clean_path("a//b"), "a/b");
    assert_eq!(clean_path("a/./b"), "a/b");
    assert_eq!(clean_path("a/b/../c"), "a/c");
    assert_eq!(clean_path("../x"), "../x");
    assert_eq!(clean_path("/../x"), "/x");
    assert_eq!(clean_path(""), ".");
    assert_eq!(clean_path("/"), "/");
    assert_eq!(clean_path("x/"), "x");
  }

  #[test]
  fn relative_strips_and_climbs() {
    assert_eq!(relative_path("/r", "/r/x/y").unwrap(), "x/y");
    assert_eq!(relative_path("/r/s", "/r/t/u").unwrap(), "../t/u");
    assert_eq!(relative_path("out", "out/a.txt").unwrap(), "a.txt");
    assert_eq!(relative_path("/r", "/r").unwrap(), ".");
    assert!(matches!(
      relative_path("/abs", "rel"),
      Err(SoongCrawlError::NotRelative(..))
    ));
  }

  #[tokio::test]
  async fn list_files_are_trimmed_and_blank_lines_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, "a").unwrap();
    std::fs::write(&b, "b").unwrap();
    let list = dir.path().join("files.list");
    std::fs::write(
      &list,
      format!("  {}  \n\n{}\n   \n", a.display(), b.display()),
    )
    .unwrap();

    let crawl = SoongCrawl {
      args: vec![FileArg {
        path_prefix_in_zip: String::new(),
        source_prefix_to_strip: dir.path().to_str().unwrap().to_string(),
        kind: FileArgKind::List(list),
      }],
      non_deflated: HashSet::new(),
    };
    let mappings = crawl.resolve().await.unwrap();
    let names: Vec<&str> = mappings.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
  }

  #[tokio::test]
  async fn glob_enumeration_is_sorted_and_recursive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("zeta.txt"), "z").unwrap();
    std::fs::write(dir.path().join("alpha.txt"), "a").unwrap();
    std::fs::write(dir.path().join("sub/inner.txt"), "i").unwrap();

    let crawl = SoongCrawl {
      args: vec![FileArg {
        path_prefix_in_zip: "pre".to_string(),
        source_prefix_to_strip: dir.path().to_str().unwrap().to_string(),
        kind: FileArgKind::GlobDir(dir.path().to_str().unwrap().to_string()),
      }],
      non_deflated: HashSet::new(),
    };
    let mappings = crawl.resolve().await.unwrap();
    let names: Vec<&str> = mappings.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec![
      "pre/alpha.txt",
      "pre/sub/inner.txt",
      "pre/zeta.txt"
    ]);
  }

  #[tokio::test]
  async fn non_deflated_destinations_are_stored() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    std::fs::write(&a, "hello\n").unwrap();

    let mut non_deflated = HashSet::new();
    non_deflated.insert("a.txt".to_string());
    let crawl = SoongCrawl {
      args: vec![FileArg {
        path_prefix_in_zip: String::new(),
        source_prefix_to_strip: dir.path().to_str().unwrap().to_string(),
        kind: FileArgKind::File(a.to_str().unwrap().to_string()),
      }],
      non_deflated,
    };
    let mappings = crawl.resolve().await.unwrap();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].method, CompressionMethod::Store);
  }
}
