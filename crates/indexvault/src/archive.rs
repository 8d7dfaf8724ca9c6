//! Directory tree <-> single-file tar container.

use crate::error::StageError;
use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::rc::Rc;
use tar::{Archive, Builder, EntryType};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Counts from one archive or unarchive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Entries written to or restored from the container
    pub entries: u64,
    /// Payload bytes of regular files
    pub file_bytes: u64,
}

/// Walk `source_dir` and write every entry, relative to `source_dir`, into a
/// tar container at `dest`. An existing `dest` is overwritten.
pub fn archive(source_dir: &Path, dest: &Path) -> Result<ArchiveStats, StageError> {
    if !source_dir.is_dir() {
        return Err(StageError::SourceNotFound {
            path: source_dir.to_path_buf(),
        });
    }
    let write_err = |source: io::Error| StageError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    };

    let file = File::create(dest).map_err(write_err)?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);

    let mut stats = ArchiveStats::default();
    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| StageError::ReadFailure {
            path: e.path().unwrap_or(source_dir).to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| StageError::ReadFailure {
                path: entry.path().to_path_buf(),
                source: io::Error::other(e),
            })?;

        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path()).map_err(write_err)?;
        } else {
            if entry.file_type().is_file() {
                let len = entry
                    .metadata()
                    .map_err(|e| StageError::ReadFailure {
                        path: entry.path().to_path_buf(),
                        source: e.into(),
                    })?
                    .len();
                stats.file_bytes += len;
            }
            builder
                .append_path_with_name(entry.path(), rel)
                .map_err(write_err)?;
        }
        stats.entries += 1;
    }

    let mut writer = builder.into_inner().map_err(write_err)?;
    writer.flush().map_err(write_err)?;
    let file = writer.into_inner().map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)?;

    debug!(
        source = %source_dir.display(),
        dest = %dest.display(),
        entries = stats.entries,
        bytes = stats.file_bytes,
        "archived directory"
    );
    Ok(stats)
}

/// Recreate the tree stored in `container` under `dest_dir`, creating
/// `dest_dir` if needed and overwriting files that already exist.
pub fn unarchive(container: &Path, dest_dir: &Path) -> Result<ArchiveStats, StageError> {
    let file = File::open(container).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            StageError::SourceNotFound {
                path: container.to_path_buf(),
            }
        } else {
            StageError::ReadFailure {
                path: container.to_path_buf(),
                source,
            }
        }
    })?;
    std::fs::create_dir_all(dest_dir).map_err(|source| StageError::WriteFailure {
        path: dest_dir.to_path_buf(),
        source,
    })?;

    let exhausted = Rc::new(Cell::new(false));
    let mut archive = Archive::new(EofProbe {
        inner: BufReader::new(file),
        hit: Rc::clone(&exhausted),
    });
    archive.set_overwrite(true);
    archive.set_preserve_mtime(true);

    let corrupt = |e: io::Error| StageError::CorruptContainer(e.to_string());
    let unpack_err = |source: io::Error| {
        // A short read from the container surfaces as a generic unpack error.
        let truncated = exhausted.get()
            || matches!(
                source.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
            );
        if truncated {
            StageError::CorruptContainer(source.to_string())
        } else {
            StageError::WriteFailure {
                path: dest_dir.to_path_buf(),
                source,
            }
        }
    };

    let mut stats = ArchiveStats::default();
    // Directory modes and mtimes are applied after their contents exist, so a
    // read-only directory does not block its own children.
    let mut directories = Vec::new();
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let header = entry.header();
        if header.entry_type() == EntryType::Directory {
            directories.push(entry);
            continue;
        }
        let size = header.entry_size().map_err(corrupt)?;
        let is_file = header.entry_type().is_file();
        if entry.unpack_in(dest_dir).map_err(unpack_err)? {
            stats.entries += 1;
            if is_file {
                stats.file_bytes += size;
            }
        } else {
            skipped(&entry.path_bytes());
        }
    }

    directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
    for mut dir in directories {
        if dir.unpack_in(dest_dir).map_err(unpack_err)? {
            stats.entries += 1;
        } else {
            skipped(&dir.path_bytes());
        }
    }

    debug!(
        container = %container.display(),
        dest = %dest_dir.display(),
        entries = stats.entries,
        "unarchived container"
    );
    Ok(stats)
}

fn skipped(path: &[u8]) {
    warn!(
        path = %String::from_utf8_lossy(path),
        "skipped container entry outside destination"
    );
}

/// Records whether the container reader ran dry.
struct EofProbe<R> {
    inner: R,
    hit: Rc<Cell<bool>>,
}

impl<R: Read> Read for EofProbe<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.hit.set(true);
        }
        Ok(n)
    }
}
