// Remote paths are `/`-separated and relative to the archive root, e.g.
// `2024-05-01/0900.mp4`.

use std::cmp::Ordering;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Prev,
    Next,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed listing archive directory '{dir}'")]
    List {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive entry '{0}' not found")]
    NotFound(String),
    #[error("archive path '{0}' escapes the archive root")]
    OutsideRoot(String),
    #[error("archive URL '{0}' is not a local directory")]
    Unsupported(String),
}

pub trait ArchiveSource {
    /// Entries of `dir` (relative, empty for the root).
    fn list(&self, dir: &str) -> Result<Vec<ArchiveEntry>, ArchiveError>;

    /// Makes `remote_path` available locally and returns where it landed.
    fn fetch(&self, remote_path: &str) -> Result<PathBuf, ArchiveError>;

    /// The file before or after `current` in its directory, ordered by name.
    fn neighbour(
        &self,
        current: &str,
        direction: Direction,
    ) -> Result<Option<String>, ArchiveError> {
        let dir = parent_path(current);
        let name = &current[dir.len()..];

        let mut files = self
            .list(dir)?
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.name)
            .collect::<Vec<_>>();
        files.sort();

        let found = match direction {
            Direction::Next => files
                .iter()
                .find(|candidate| candidate.as_str().cmp(name) == Ordering::Greater),
            Direction::Prev => files
                .iter()
                .rev()
                .find(|candidate| candidate.as_str().cmp(name) == Ordering::Less),
        };
        Ok(found.map(|file| format!("{dir}{file}")))
    }
}

/// Directory part of a remote path including its trailing `/`, or `""`.
#[must_use]
pub fn parent_path(remote_path: &str) -> &str {
    let trimmed = remote_path.strip_suffix('/').unwrap_or(remote_path);
    trimmed.rfind('/').map_or("", |idx| &remote_path[..=idx])
}

/// Archive backed by a directory that is already mounted on this machine.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    root: PathBuf,
}

impl LocalArchive {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Accepts `file://` URLs and plain paths.
    pub fn from_url(archive_url: &str) -> Result<Self, ArchiveError> {
        let trimmed = archive_url.trim();
        if trimmed.starts_with("file://") {
            let parsed =
                Url::parse(trimmed).map_err(|_| ArchiveError::Unsupported(trimmed.to_owned()))?;
            let path = parsed
                .to_file_path()
                .map_err(|()| ArchiveError::Unsupported(trimmed.to_owned()))?;
            return Ok(Self::new(path));
        }
        if trimmed.is_empty() || trimmed.contains("://") {
            return Err(ArchiveError::Unsupported(crate::credentials::decode_for_display(
                trimmed,
            )));
        }
        Ok(Self::new(trimmed))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, ArchiveError> {
        let relative_path = Path::new(relative);
        if relative_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ArchiveError::OutsideRoot(relative.to_owned()));
        }
        Ok(self.root.join(relative_path))
    }
}

impl ArchiveSource for LocalArchive {
    fn list(&self, dir: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let path = self.resolve(dir)?;
        let read_dir = fs::read_dir(&path).map_err(|source| ArchiveError::List {
            dir: dir.to_owned(),
            source,
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| ArchiveError::List {
                dir: dir.to_owned(),
                source,
            })?;
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            entries.push(ArchiveEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                is_dir: metadata.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir, count = entries.len(), "listed archive directory");
        Ok(entries)
    }

    fn fetch(&self, remote_path: &str) -> Result<PathBuf, ArchiveError> {
        let path = self.resolve(remote_path)?;
        if path.is_file() {
            Ok(path)
        } else {
            Err(ArchiveError::NotFound(remote_path.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedArchive(Vec<ArchiveEntry>);

    impl ArchiveSource for FixedArchive {
        fn list(&self, _dir: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
            Ok(self.0.clone())
        }

        fn fetch(&self, remote_path: &str) -> Result<PathBuf, ArchiveError> {
            Ok(PathBuf::from(remote_path))
        }
    }

    fn file(name: &str) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_owned(),
            size: 1,
            is_dir: false,
        }
    }

    #[test]
    fn neighbour_walks_files_by_name() {
        let archive = FixedArchive(vec![
            file("0930.mp4"),
            file("0900.mp4"),
            ArchiveEntry {
                name: "0915".to_owned(),
                size: 0,
                is_dir: true,
            },
            file("1000.mp4"),
        ]);
        let next = archive.neighbour("day/0900.mp4", Direction::Next).unwrap();
        assert_eq!(next.as_deref(), Some("day/0930.mp4"));
        let prev = archive.neighbour("day/0930.mp4", Direction::Prev).unwrap();
        assert_eq!(prev.as_deref(), Some("day/0900.mp4"));
        assert_eq!(archive.neighbour("day/1000.mp4", Direction::Next).unwrap(), None);
        assert_eq!(archive.neighbour("day/0900.mp4", Direction::Prev).unwrap(), None);
    }

    #[test]
    fn parent_path_keeps_trailing_separator() {
        assert_eq!(parent_path("a/b/c.mp4"), "a/b/");
        assert_eq!(parent_path("c.mp4"), "");
        assert_eq!(parent_path("a/b/"), "a/");
    }

    #[test]
    fn local_archive_lists_and_fetches() {
        let root = std::env::temp_dir().join(format!("camgrid-archive-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(root.join("day")).unwrap();
        fs::write(root.join("day/0900.mp4"), b"a").unwrap();
        fs::write(root.join("day/0930.mp4"), b"bb").unwrap();

        let archive = LocalArchive::from_url(root.to_str().unwrap()).unwrap();
        let entries = archive.list("day/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].size, 2);
        assert_eq!(
            archive.neighbour("day/0900.mp4", Direction::Next).unwrap().as_deref(),
            Some("day/0930.mp4")
        );
        assert_eq!(archive.fetch("day/0930.mp4").unwrap(), root.join("day/0930.mp4"));
        assert!(matches!(archive.fetch("day/nope.mp4"), Err(ArchiveError::NotFound(_))));
        assert!(matches!(archive.fetch("../etc/passwd"), Err(ArchiveError::OutsideRoot(_))));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn remote_archive_urls_are_not_local() {
        assert!(matches!(
            LocalArchive::from_url("sftp://u:pw@nvr/rec"),
            Err(ArchiveError::Unsupported(url)) if !url.contains("pw")
        ));
        assert!(LocalArchive::from_url("file:///var/recordings").is_ok());
    }
}
