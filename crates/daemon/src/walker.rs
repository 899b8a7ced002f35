//! Directory walker
//!
//! Produces a lazy, pre-order sequence of [`Visit`] events over the library
//! tree. Children come in the order the filesystem lists them. Directories
//! holding a `.transcodeignore` marker are reported and not descended into.
//! Marker files and in-flight encoder outputs are never reported.

use crate::cancel::StopSignal;
use crate::markers;
use log::{trace, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One step of the traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit {
    Directory {
        path: PathBuf,
        depth: usize,
        ignored: bool,
    },
    File {
        path: PathBuf,
        depth: usize,
    },
}

impl Visit {
    pub fn path(&self) -> &Path {
        match self {
            Visit::Directory { path, .. } | Visit::File { path, .. } => path,
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Visit::Directory { depth, .. } | Visit::File { depth, .. } => *depth,
        }
    }
}

/// Iterator over the library tree.
pub struct TreeWalk {
    inner: walkdir::IntoIter,
    stop: Option<StopSignal>,
}

impl TreeWalk {
    /// Starts a walk at `root`. Fails if the root cannot be listed.
    pub fn new(root: &Path) -> io::Result<Self> {
        fs::read_dir(root)?;
        Ok(Self {
            inner: WalkDir::new(root).into_iter(),
            stop: None,
        })
    }

    /// Ends the walk as soon as `stop` is set.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stopping(&self) -> bool {
        self.stop.as_ref().is_some_and(StopSignal::is_stopping)
    }
}

impl Iterator for TreeWalk {
    type Item = Visit;

    fn next(&mut self) -> Option<Visit> {
        loop {
            if self.stopping() {
                return None;
            }

            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walk: {}", e);
                    continue;
                }
            };
            let path = entry.path().to_path_buf();
            let depth = entry.depth();

            if entry.file_type().is_dir() {
                let ignored = markers::has_ignore_marker(&path);
                if ignored {
                    self.inner.skip_current_dir();
                }
                return Some(Visit::Directory {
                    path,
                    depth,
                    ignored,
                });
            }

            if !entry.file_type().is_file() {
                trace!("not a regular file: {}", path.display());
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if markers::is_marker_name(&name) || is_encoder_artifact(&path) {
                trace!("hidden from walk: {}", path.display());
                continue;
            }

            return Some(Visit::File { path, depth });
        }
    }
}

/// `film.mkv.new.mkv` next to an existing `film.mkv`.
fn is_encoder_artifact(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let Some(source_name) = stem.strip_suffix(".new") else {
        return false;
    };
    path.parent()
        .map(|dir| dir.join(source_name).is_file())
        .unwrap_or(false)
}
