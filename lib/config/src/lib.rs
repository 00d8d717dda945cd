//! # Arbor Config
//!
//! Loads agent configuration from one or more toml / yaml / json
//! files, interpolating `${VAR}` environment variables and merging
//! files into a final configuration object. Later paths override
//! earlier ones.

use std::path::Path;

use indexmap::IndexSet;
use serde::de::DeserializeOwned;

mod error;
mod load;
mod merge;

pub use error::Error;
pub use merge::{merge_config, merge_objects};

pub type Result<T> = ::core::result::Result<T, Error>;

pub struct ConfigLoader<'outer, 'inner> {
  /// Files or directories to include. Higher index wins.
  pub paths: &'outer [&'inner Path],
  /// Wildcard patterns matching file names inside directories.
  /// Empty matches every parseable file.
  pub match_wildcards: &'outer [&'inner str],
  /// Merge nested objects across files instead of replacing them
  /// at the top-level key.
  pub merge_nested: bool,
  /// Extend arrays across files instead of replacing them.
  pub extend_array: bool,
  /// Print discovered files before parsing.
  pub debug_print: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let ConfigLoader {
      paths,
      match_wildcards,
      merge_nested,
      extend_array,
      debug_print,
    } = self;
    let mut wildcards = Vec::with_capacity(match_wildcards.len());
    for &wc in match_wildcards {
      match wildcard::Wildcard::new(wc.as_bytes()) {
        Ok(wc) => wildcards.push(wc),
        Err(e) => {
          eprintln!("WARN: invalid config keyword '{wc}' | {e:?}");
        }
      }
    }
    let mut all_files = IndexSet::new();
    for &path in paths {
      let Ok(metadata) = std::fs::metadata(path) else {
        continue;
      };
      if metadata.is_dir() {
        let mut files = Vec::new();
        load::collect_config_files(&mut files, path, &wildcards);
        files.sort_by(|(a_index, a_path), (b_index, b_path)| {
          a_index.cmp(b_index).then(a_path.cmp(b_path))
        });
        all_files.extend(files.into_iter().map(|(_, path)| path));
      } else if metadata.is_file() {
        let path = path.to_path_buf();
        // A repeated path moves to the back so it keeps
        // the higher priority.
        all_files.shift_remove(&path);
        all_files.insert(path);
      }
    }
    if debug_print {
      println!("DEBUG: config files: {all_files:?}");
    }
    load::parse_config_files(
      &all_files.into_iter().collect::<Vec<_>>(),
      merge_nested,
      extend_array,
    )
  }
}
