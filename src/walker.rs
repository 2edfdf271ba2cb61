use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::error::{Error, Result};

/// Patterns matched against archive-relative paths by default: standalone
/// `.eml` files and maildir message directories.
pub const DEFAULT_PATTERNS: &[&str] = &["**/*.eml", "**/cur/*", "**/new/*"];

/// A candidate message file found in the archive.
#[derive(Debug, Clone)]
pub struct ArchiveFile {
    /// Path relative to the archive root.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    /// Last modification time as seconds since the Unix epoch.
    pub mtime: u64,
    /// Sub-second part of the modification time.
    pub mtime_nanos: u32,
    pub size_bytes: u64,
}

impl ArchiveFile {
    /// Key used for per-file state, with `/` separators.
    pub fn key(&self) -> String {
        path_key(&self.relative_path)
    }
}

/// Decides which files in the archive are messages.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    globs: GlobSet,
}

impl CandidateFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(Error::Config("no candidate file patterns".into()));
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern.as_ref()).map_err(|e| {
                Error::Config(format!("bad file pattern {:?}: {e}", pattern.as_ref()))
            })?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|e| Error::Config(format!("bad file patterns: {e}")))?;
        Ok(Self { globs })
    }

    pub fn matches(&self, relative_path: &Path) -> bool {
        self.globs.is_match(relative_path)
    }
}

impl Default for CandidateFilter {
    fn default() -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_PATTERNS {
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        Self {
            globs: builder.build().unwrap_or_else(|_| GlobSet::empty()),
        }
    }
}

/// Result of walking an archive.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Candidate files, sorted by relative path.
    pub files: Vec<ArchiveFile>,
    /// Archive-relative keys of directories and candidate files that could
    /// not be read. Whatever lies beneath them is unknown for this walk.
    pub unreadable: Vec<String>,
}

impl Discovery {
    /// Whether `key` is, or lies under, an entry that could not be read.
    pub fn is_unreadable(&self, key: &str) -> bool {
        self.unreadable.iter().any(|bad| {
            bad.is_empty()
                || key == bad.as_str()
                || key
                    .strip_prefix(bad.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Recursively walk the archive and collect candidate message files,
/// sorted by relative path.
///
/// Hidden files are skipped. Hidden directories are walked, since
/// Maildir++ stores subfolders as `.Name`. Only an unreadable root is an
/// error; entries below it that fail are logged and listed in
/// [`Discovery::unreadable`].
pub fn discover_files(root: &Path, filter: &CandidateFilter) -> Result<Discovery> {
    let canonical_root = root.canonicalize()?;
    let entries = std::fs::read_dir(&canonical_root)?;
    let mut walk = Walk {
        root: &canonical_root,
        filter,
        found: Discovery::default(),
    };
    walk.entries(&canonical_root, entries);
    walk.found
        .files
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    walk.found.unreadable.sort();
    Ok(walk.found)
}

struct Walk<'a> {
    root: &'a Path,
    filter: &'a CandidateFilter,
    found: Discovery,
}

impl Walk<'_> {
    fn entries(&mut self, current: &Path, entries: std::fs::ReadDir) {
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.unreadable(current, &e);
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    self.unreadable(&path, &e);
                    continue;
                }
            };
            let hidden = entry.file_name().to_string_lossy().starts_with('.');

            if file_type.is_dir() {
                match std::fs::read_dir(&path) {
                    Ok(children) => self.entries(&path, children),
                    Err(e) => self.unreadable(&path, &e),
                }
            } else if hidden || !self.filter.matches(self.relative(&path)) {
                continue;
            } else if file_type.is_symlink() {
                // Directory links are not followed, so cycles cannot occur.
                match path.canonicalize() {
                    Ok(resolved) if resolved.is_dir() => {}
                    Ok(resolved) => self.file(&path, &resolved),
                    Err(e) => self.unreadable(&path, &e),
                }
            } else if file_type.is_file() {
                self.file(&path, &path);
            }
        }
    }

    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(self.root).unwrap_or(path)
    }

    fn file(&mut self, original_path: &Path, absolute_path: &Path) {
        let metadata = match std::fs::metadata(absolute_path) {
            Ok(metadata) => metadata,
            Err(e) => return self.unreadable(original_path, &e),
        };
        let since_epoch = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();

        let relative_path = self.relative(original_path).to_path_buf();
        self.found.files.push(ArchiveFile {
            relative_path,
            absolute_path: absolute_path.to_path_buf(),
            mtime: since_epoch.as_secs(),
            mtime_nanos: since_epoch.subsec_nanos(),
            size_bytes: metadata.len(),
        });
    }

    fn unreadable(&mut self, path: &Path, err: &std::io::Error) {
        warn!(path = %path.display(), error = %err, "cannot read archive entry");
        let key = path_key(self.relative(path));
        self.found.unreadable.push(key);
    }
}

fn path_key(relative_path: &Path) -> String {
    relative_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
