/*
 * Description: Parallel zip archive creation with bounded cpu and memory
 * usage.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Parallel zip archive creation with bounded cpu and memory usage.

/* These clippy lint descriptions are purely non-functional and do not affect the functionality
 * or correctness of the code. */
// #![warn(missing_docs)]

/* Note: run clippy with: rustup run nightly cargo-clippy! */
#![deny(unsafe_code)]
/* Ensure any doctest warnings fails the doctest! */
#![doc(test(attr(deny(warnings))))]
/* Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be
 * copied and pasted across crates, but there doesn't appear to be a way to include inner
 * attributes from a common source. */
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::single_match_else,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
/* It is often more clear to show that nothing is being moved. */
#![allow(clippy::match_ref_pats)]
/* Subjective style. */
#![allow(
  clippy::derived_hash_with_manual_eq,
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments,
  clippy::single_component_path_imports,
  clippy::double_must_use
)]
/* Default isn't as big a deal as people seem to think it is. */
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
/* Arc<Mutex> can be more clear than needing to grok Orderings. */
#![allow(clippy::mutex_atomic)]

use displaydoc::Display;
use thiserror::Error;

use std::{cmp, fmt, path::PathBuf};

/// Entry name shapes that we refuse to write into an archive.
#[derive(Debug, Display, Error)]
pub enum SoongNameFormatError {
  /// entry name is empty
  Empty,
  /// entry name {0:?} is absolute
  Absolute(String),
  /// entry name {0:?} looks like a directory (trailing slash)
  TrailingSlash(String),
  /// entry name {0:?} has an empty or '.' path component
  UncleanComponent(String),
}

/// A validated, slash-normalized file path inside the output archive.
///
/// Directory entries are synthesized by the write pipeline with a trailing
/// slash and never pass through here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryName {
  name: String,
}

impl fmt::Display for EntryName {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "'{}'", self.name) }
}

impl cmp::PartialOrd for EntryName {
  fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> { Some(self.cmp(other)) }
}

impl cmp::Ord for EntryName {
  fn cmp(&self, other: &Self) -> cmp::Ordering { self.name.cmp(&other.name) }
}

impl EntryName {
  /// Accept a name only once it is already in the shape archives expect:
  /// relative, file-like, and normalized. The path preprocessor cleans
  /// every destination before it lands here, so anything unclean is a bug
  /// upstream, not something to paper over.
  pub fn validate(name: String) -> Result<Self, SoongNameFormatError> {
    if name.is_empty() {
      return Err(SoongNameFormatError::Empty);
    }
    if name.starts_with('/') {
      /* Member names are archive-relative by definition; extractors that
       * honored an absolute one would scatter files across the host. */
      return Err(SoongNameFormatError::Absolute(name));
    }
    if name.ends_with('/') {
      /* Directory entries are synthesized by the write pipeline; a mapping
       * target is always a file name. */
      return Err(SoongNameFormatError::TrailingSlash(name));
    }
    /* An empty component is a doubled slash; a "." component survived
     * normalization. The lone name "." is the degenerate root mapping and
     * stays permitted. */
    let unclean = name != "."
      && name
        .split('/')
        .any(|component| component.is_empty() || component == ".");
    if unclean {
      return Err(SoongNameFormatError::UncleanComponent(name));
    }
    Ok(Self { name })
  }

  pub fn as_str(&self) -> &str { &self.name }

  pub fn into_string(self) -> String { self.name }

  /// The directory portion of the name, or "" for a top-level entry.
  pub fn parent(&self) -> &str {
    match self.name.rfind('/') {
      Some(i) => &self.name[..i],
      None => "",
    }
  }
}

/// Zip compression methods we know how to emit.
#[derive(Copy, Clone, Default, Debug, Display, PartialEq, Eq)]
pub enum CompressionMethod {
  /// uncompressed
  Store,
  /// deflate-compressed
  #[default]
  Deflate,
}

impl CompressionMethod {
  /// The method's on-disk code in local and central file headers.
  pub fn code(self) -> u16 {
    match self {
      Self::Store => 0,
      Self::Deflate => 8,
    }
  }
}

/// One requested archive member: where it goes, where its bytes come from,
/// and how they are compressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathMapping {
  pub name: EntryName,
  pub source: PathBuf,
  pub method: CompressionMethod,
}

pub mod compress;

pub mod crawl;

pub mod destination;

pub mod encode;

pub mod jar;

pub mod limit;

pub mod zip;

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn validate_rejects_bad_shapes() {
    assert!(matches!(
      EntryName::validate("".to_string()),
      Err(SoongNameFormatError::Empty)
    ));
    assert!(matches!(
      EntryName::validate("/abs".to_string()),
      Err(SoongNameFormatError::Absolute(_))
    ));
    assert!(matches!(
      EntryName::validate("dir/".to_string()),
      Err(SoongNameFormatError::TrailingSlash(_))
    ));
    assert!(matches!(
      EntryName::validate("./rel".to_string()),
      Err(SoongNameFormatError::UncleanComponent(_))
    ));
    assert!(matches!(
      EntryName::validate("a//b".to_string()),
      Err(SoongNameFormatError::UncleanComponent(_))
    ));
    assert!(matches!(
      EntryName::validate("a/./b".to_string()),
      Err(SoongNameFormatError::UncleanComponent(_))
    ));
  }

  #[test]
  fn validate_keeps_normalized_names() {
    assert!(EntryName::validate("x/y/z.txt".to_string()).is_ok());
    assert!(EntryName::validate("../escaped.txt".to_string()).is_ok());
    /* The degenerate root mapping. */
    assert!(EntryName::validate(".".to_string()).is_ok());
  }

  #[test]
  fn parent_of_nested_and_top_level_names() {
    let nested = EntryName::validate("x/y/z.txt".to_string()).unwrap();
    assert_eq!(nested.parent(), "x/y");
    let top = EntryName::validate("a.txt".to_string()).unwrap();
    assert_eq!(top.parent(), "");
  }
}
