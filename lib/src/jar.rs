/*
 * Description: Jar-style entry ordering and manifest synthesis.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Jar-style entry ordering and manifest synthesis.

use rayon::prelude::*;

use crate::PathMapping;

use std::cmp;

/// The directory jar tooling expects at the front of the archive.
pub const META_DIR: &str = "META-INF/";

/// The file path in the zip at which a java manifest file gets written.
pub const MANIFEST_DEST: &str = "META-INF/MANIFEST.MF";

const MANIFEST_MARKER: &[u8] = b"Manifest-Version:";

/* `META-INF/` and its immediate contents are lifted to the front of the
 * archive in a canonical order; everything else sorts by name. */
fn entry_rank(name: &str) -> u8 {
  if name == META_DIR {
    0
  } else if name == MANIFEST_DEST {
    1
  } else if name.starts_with(META_DIR) {
    2
  } else {
    3
  }
}

/// The total order jar tooling expects over entry names.
pub fn entry_names_less(a: &str, b: &str) -> bool { compare_entry_names(a, b) == cmp::Ordering::Less }

pub fn compare_entry_names(a: &str, b: &str) -> cmp::Ordering {
  entry_rank(a).cmp(&entry_rank(b)).then_with(|| a.cmp(b))
}

/// Stable sort of the mapping list into jar order.
pub fn sort_mappings(mappings: &mut Vec<PathMapping>) {
  mappings.par_sort_by(|a, b| compare_entry_names(a.name.as_str(), b.name.as_str()));
}

/// Produce the manifest payload for the bytes the user provided: if they do
/// not already declare a manifest version, wrap them in a minimal header and
/// a trailing newline; otherwise pass them through verbatim.
pub fn manifest_contents(given: &[u8]) -> Vec<u8> {
  let already_versioned = given
    .windows(MANIFEST_MARKER.len())
    .any(|window| window == MANIFEST_MARKER);
  if already_versioned {
    return given.to_vec();
  }

  let mut contents = Vec::with_capacity(given.len() + 64);
  contents.extend_from_slice(MANIFEST_MARKER);
  contents.extend_from_slice(b" 1.0\nCreated-By: soong_zip\n");
  contents.extend_from_slice(given);
  contents.push(b'\n');
  contents
}

#[cfg(test)]
mod test {
  use super::*;

  use crate::{CompressionMethod, EntryName};

  use std::path::PathBuf;

  fn mapping(name: &str) -> PathMapping {
    PathMapping {
      name: EntryName::validate(name.to_string()).unwrap(),
      source: PathBuf::from(format!("/src/{}", name)),
      method: CompressionMethod::Deflate,
    }
  }

  #[test]
  fn meta_inf_sorts_to_the_front() {
    assert!(entry_names_less(META_DIR, MANIFEST_DEST));
    assert!(entry_names_less(MANIFEST_DEST, "META-INF/services/x"));
    assert!(entry_names_less("META-INF/services/x", "AndroidManifest.xml"));
    assert!(entry_names_less("a/b", "a/c"));
    assert!(!entry_names_less("a/c", "a/b"));
  }

  #[test]
  fn sort_is_total_and_stable_for_equal_names() {
    let mut mappings = vec![
      mapping("com/example/Main.class"),
      mapping("META-INF/services/provider"),
      mapping("META-INF/MANIFEST.MF"),
      mapping("aaa.txt"),
    ];
    sort_mappings(&mut mappings);
    let names: Vec<&str> = mappings.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec![
      "META-INF/MANIFEST.MF",
      "META-INF/services/provider",
      "aaa.txt",
      "com/example/Main.class",
    ]);
  }

  #[test]
  fn empty_manifest_gets_synthesized_header() {
    let contents = manifest_contents(b"");
    assert_eq!(
      contents,
      b"Manifest-Version: 1.0\nCreated-By: soong_zip\n\n".to_vec()
    );
  }

  #[test]
  fn manifest_attributes_are_appended_with_trailing_newline() {
    let contents = manifest_contents(b"Main-Class: com.example.Main");
    assert!(contents.starts_with(b"Manifest-Version: 1.0\nCreated-By: soong_zip\n"));
    assert!(contents.ends_with(b"Main-Class: com.example.Main\n"));
  }

  #[test]
  fn versioned_manifest_passes_through_verbatim() {
    let given = b"Manifest-Version: 2.0\nX: y\n";
    assert_eq!(manifest_contents(given), given.to_vec());
  }
}
