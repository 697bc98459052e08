/*
 * Description: Command-line parallel zip archiver emulating the classic
 * soong_zip surface.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Command-line parallel zip archiver emulating the classic soong_zip
//! surface.

/* These clippy lint descriptions are purely non-functional and do not affect the functionality
 * or correctness of the code. */
#![warn(missing_docs)]
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
  clippy::single_component_path_imports
)]
/* Default isn't as big a deal as people seem to think it is. */
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
/* Arc<Mutex> can be more clear than needing to grok Orderings. */
#![allow(clippy::mutex_atomic)]

mod cli {
  use std::ffi::OsString;

  /// The classic surface spells its long flags with a single dash; rewrite
  /// the known ones so clap can parse them.
  pub fn normalize_single_dash_flags(
    args: impl Iterator<Item=OsString>,
  ) -> Vec<OsString> {
    args
      .map(|arg| match arg.to_str() {
        Some("-jar") => OsString::from("--jar"),
        Some("-cpuprofile") => OsString::from("--cpuprofile"),
        Some("-trace") => OsString::from("--trace"),
        _ => arg,
      })
      .collect()
  }

  mod args {
    use clap::{ArgAction, Parser};

    use std::path::PathBuf;

    /// Create a zip archive from the given files, in parallel.
    ///
    /// The effect of each -f, -l, and -D argument depends on the -C and -P
    /// arguments that precede it on the command line.
    #[derive(Parser, Debug)]
    #[command(name = "soong_zip", version, about, verbatim_doc_comment)]
    pub struct Cli {
      /// File to write the zip file to.
      #[arg(short = 'o', value_name = "PATH")]
      pub output: PathBuf,
      /// Path to use as the relative root of files in following -f, -l, or
      /// -D arguments.
      #[arg(short = 'C', value_name = "DIR", action = ArgAction::Append)]
      pub relative_roots: Vec<String>,
      /// File to include in the zip.
      #[arg(short = 'f', value_name = "FILE", action = ArgAction::Append)]
      pub files: Vec<String>,
      /// File containing a list of files to include, one per line.
      #[arg(short = 'l', value_name = "LIST", action = ArgAction::Append)]
      pub lists: Vec<String>,
      /// Directory to include in the zip, recursively.
      #[arg(short = 'D', value_name = "DIR", action = ArgAction::Append)]
      pub glob_dirs: Vec<String>,
      /// Path prefix within the zip at which to place files.
      #[arg(short = 'P', value_name = "PREFIX", action = ArgAction::Append)]
      pub prefixes: Vec<String>,
      /// Archive path to be stored within the zip without compression.
      #[arg(short = 's', value_name = "PATH", action = ArgAction::Append)]
      pub non_deflated: Vec<String>,
      /// Include directory entries in the zip.
      #[arg(short = 'd')]
      pub directories: bool,
      /// Input jar manifest file name; requires -jar.
      #[arg(short = 'm', value_name = "FILE")]
      pub manifest: Option<PathBuf>,
      /// Modify the resultant .zip to emulate the output of 'jar'.
      #[arg(long = "jar")]
      pub emulate_jar: bool,
      /// Deflate compression level.
      #[arg(
        short = 'L',
        value_name = "N",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(0..=9)
      )]
      pub compression_level: u32,
      /// Number of parallel threads to use; defaults to the host cpu count.
      #[arg(short = 'j', value_name = "N")]
      pub parallel_jobs: Option<usize>,
      /// Write a cpu profile to this file. Not wired up in this build.
      #[arg(long = "cpuprofile", value_name = "FILE")]
      pub cpu_profile: Option<PathBuf>,
      /// Write an execution trace to this file. Not wired up in this build.
      #[arg(long = "trace", value_name = "FILE")]
      pub trace_file: Option<PathBuf>,
    }
  }
  pub use args::Cli;

  mod validate {
    use super::Cli;

    use libsoong_zip::crawl::{clean_path, FileArg, FileArgKind, SoongCrawl};

    use clap::error::ErrorKind;

    use std::collections::HashSet;
    use std::path::PathBuf;

    enum InputEvent {
      Root(String),
      Prefix(String),
      File(String),
      List(String),
      GlobDir(String),
    }

    fn gather(
      matches: &clap::ArgMatches,
      id: &str,
      make: fn(String) -> InputEvent,
      events: &mut Vec<(usize, InputEvent)>,
    ) {
      if let (Some(values), Some(indices)) = (
        matches.get_many::<String>(id),
        matches.indices_of(id),
      ) {
        for (value, index) in values.zip(indices) {
          events.push((index, make(value.clone())));
        }
      }
    }

    impl Cli {
      /// Apply the usage rules that clap alone cannot express, and recover
      /// the left-to-right interleaving of -C/-P/-f/-l/-D from the argv
      /// indices. Exits with a usage error on violation.
      pub fn build_crawl(&self, cmd: &mut clap::Command, matches: &clap::ArgMatches) -> SoongCrawl {
        if self.manifest.is_some() && !self.emulate_jar {
          cmd
            .error(
              ErrorKind::MissingRequiredArgument,
              "must specify -jar when specifying a manifest via -m",
            )
            .exit();
        }

        let mut non_deflated: HashSet<String> = HashSet::new();
        for path in self.non_deflated.iter() {
          if !non_deflated.insert(path.clone()) {
            cmd
              .error(
                ErrorKind::ArgumentConflict,
                format!("file {:?} was specified twice as a file to not deflate", path),
              )
              .exit();
          }
        }

        let mut events: Vec<(usize, InputEvent)> = Vec::new();
        gather(matches, "relative_roots", InputEvent::Root, &mut events);
        gather(matches, "prefixes", InputEvent::Prefix, &mut events);
        gather(matches, "files", InputEvent::File, &mut events);
        gather(matches, "lists", InputEvent::List, &mut events);
        gather(matches, "glob_dirs", InputEvent::GlobDir, &mut events);
        events.sort_by_key(|(index, _)| *index);

        let mut relative_root: Option<String> = None;
        let mut prefix = String::new();
        let mut args: Vec<FileArg> = Vec::new();
        for (_, event) in events.into_iter() {
          let (flag, kind) = match event {
            InputEvent::Root(dir) => {
              relative_root = Some(dir);
              continue;
            },
            InputEvent::Prefix(new_prefix) => {
              prefix = new_prefix;
              continue;
            },
            InputEvent::File(file) => ('f', FileArgKind::File(file)),
            InputEvent::List(list) => ('l', FileArgKind::List(PathBuf::from(list))),
            InputEvent::GlobDir(dir) => ('D', FileArgKind::GlobDir(dir)),
          };
          let root = match &relative_root {
            Some(root) => root.clone(),
            None => cmd
              .error(
                ErrorKind::MissingRequiredArgument,
                format!("must pass -C before -{}", flag),
              )
              .exit(),
          };
          args.push(FileArg {
            path_prefix_in_zip: clean_path(&prefix),
            source_prefix_to_strip: clean_path(&root),
            kind,
          });
        }

        SoongCrawl { args, non_deflated }
      }
    }
  }

  mod run {
    use super::Cli;

    use libsoong_zip::{crawl::SoongCrawl, zip::SoongZip};

    use std::{num::NonZeroUsize, thread};

    impl Cli {
      pub async fn run(self, crawl: SoongCrawl) -> eyre::Result<()> {
        let Self {
          output,
          directories,
          manifest,
          emulate_jar,
          compression_level,
          parallel_jobs,
          cpu_profile,
          trace_file,
          ..
        } = self;

        if cpu_profile.is_some() || trace_file.is_some() {
          tracing::warn!("cpu profiling and trace outputs are not wired up in this build");
        }

        let parallelism = parallel_jobs.unwrap_or_else(|| {
          thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
        });

        /* Turn the requests into the ordered mapping list, then run the
         * write pipeline over it. */
        let mappings = crawl.resolve().await?;
        let zip = SoongZip {
          mappings,
          compression_level,
          parallelism,
          directories,
          emulate_jar,
          manifest,
          memory_limit: 0,
        };
        zip.write_to(&output).await?;

        Ok(())
      }
    }
  }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
  use clap::{CommandFactory as _, FromArgMatches as _};
  use eyre::WrapErr as _;

  tracing_subscriber::fmt::init();

  let argv = cli::normalize_single_dash_flags(std::env::args_os());
  let mut cmd = cli::Cli::command();
  let matches = cmd.clone().get_matches_from(argv);
  let cli = cli::Cli::from_arg_matches(&matches).wrap_err("failed to interpret arguments")?;

  let crawl = cli.build_crawl(&mut cmd, &matches);
  cli.run(crawl).await.wrap_err("top-level error")?;
  Ok(())
}
