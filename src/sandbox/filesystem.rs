use std::{
    fs::FileType,
    io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tokio::{
    fs,
    io::{AsyncBufReadExt, BufReader},
};

use super::ProviderError;

/// A simplified view of a directory entry. `path` is relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub kind: DirEntryKind,
    pub size: Option<u64>,
}

/// Basic classification of directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirEntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl From<FileType> for DirEntryKind {
    fn from(ft: FileType) -> Self {
        if ft.is_file() {
            Self::File
        } else if ft.is_dir() {
            Self::Directory
        } else if ft.is_symlink() {
            Self::Symlink
        } else {
            Self::Other
        }
    }
}

impl DirEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DirEntryKind::File => "file",
            DirEntryKind::Directory => "directory",
            DirEntryKind::Symlink => "symlink",
            DirEntryKind::Other => "other",
        }
    }
}

fn io_error(path: &Path, err: io::Error) -> ProviderError {
    match err.kind() {
        io::ErrorKind::NotFound => ProviderError::NotFound(path.display().to_string()),
        _ => ProviderError::Io(format!("{}: {err}", path.display())),
    }
}

/// Join `relative` onto `root` and canonicalize, refusing anything that lands outside
/// `root` (symlinks included). `root` must already be canonical.
pub fn resolve_within(root: &Path, relative: &Path) -> Result<PathBuf, ProviderError> {
    let candidate = root.join(relative);
    let canonical = candidate
        .canonicalize()
        .map_err(|err| io_error(relative, err))?;
    if !canonical.starts_with(root) {
        return Err(ProviderError::Escape(relative.display().to_string()));
    }
    Ok(canonical)
}

pub fn relative_to(path: &Path, root: &Path) -> PathBuf {
    pathdiff::diff_paths(path, root).unwrap_or_else(|| path.to_path_buf())
}

/// List directory entries similarly to `ls`, sorted by name.
pub async fn list_dir(root: &Path, dir: &Path) -> Result<Vec<DirEntryInfo>, ProviderError> {
    let metadata = fs::metadata(dir).await.map_err(|err| io_error(dir, err))?;
    if !metadata.is_dir() {
        return Err(ProviderError::NotADirectory(
            relative_to(dir, root).display().to_string(),
        ));
    }

    let mut reader = fs::read_dir(dir).await.map_err(|err| io_error(dir, err))?;
    let mut entries = Vec::new();

    while let Some(entry) = reader.next_entry().await.map_err(|err| io_error(dir, err))? {
        let file_type = entry.file_type().await.map_err(|err| io_error(dir, err))?;
        let metadata = entry.metadata().await.ok();
        let path = entry.path();
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: relative_to(&path, root),
            kind: DirEntryKind::from(file_type),
            size: metadata.filter(|m| m.is_file()).map(|m| m.len()),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Read an entire file, refusing files above `max_bytes` instead of truncating them.
pub async fn read_file_bounded(
    root: &Path,
    path: &Path,
    max_bytes: u64,
) -> Result<String, ProviderError> {
    let display = relative_to(path, root).display().to_string();
    let metadata = fs::metadata(path).await.map_err(|err| io_error(path, err))?;
    if !metadata.is_file() {
        return Err(ProviderError::NotAFile(display));
    }
    if metadata.len() > max_bytes {
        return Err(ProviderError::TooLarge {
            path:  display,
            size:  metadata.len(),
            limit: max_bytes,
        });
    }

    let bytes = fs::read(path).await.map_err(|err| io_error(path, err))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// An inclusive, 1-based window of lines cut out of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSlice {
    /// First and last line returned; `None` when the window starts past the end of the file.
    pub range:      Option<(usize, usize)>,
    pub text:       String,
    /// Lines consumed before reading stopped. Equals the file's line count when `range`
    /// is `None`.
    pub lines_seen: usize,
}

/// Accumulates a [`LineSlice`] from lines fed one at a time, so only the selected text is
/// ever held in memory.
#[derive(Debug)]
pub struct LineCollector {
    path:       String,
    start_line: usize,
    end_line:   usize,
    max_bytes:  u64,
    first:      Option<usize>,
    seen:       usize,
    text:       String,
}

impl LineCollector {
    pub fn new(path: impl Into<String>, start_line: usize, end_line: usize, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            start_line,
            end_line,
            max_bytes,
            first: None,
            seen: 0,
            text: String::new(),
        }
    }

    /// Feed the next line without its terminator. `Ok(false)` once the window is full.
    pub fn push(&mut self, line: &str) -> Result<bool, ProviderError> {
        self.seen += 1;
        if self.seen < self.start_line {
            return Ok(true);
        }
        if self.first.is_some() {
            self.text.push('\n');
        } else {
            self.first = Some(self.seen);
        }
        self.text.push_str(line);

        if self.text.len() as u64 > self.max_bytes {
            return Err(ProviderError::RangeTooLarge {
                path:       self.path.clone(),
                start_line: self.first.unwrap_or(self.seen),
                end_line:   self.seen,
                limit:      self.max_bytes,
            });
        }
        Ok(self.seen < self.end_line)
    }

    pub fn finish(self) -> LineSlice {
        LineSlice {
            range:      self.first.map(|first| (first, self.seen)),
            text:       self.text,
            lines_seen: self.seen,
        }
    }
}

/// Stream `path` line by line and return lines `start_line..=end_line`. The file size is
/// not limited; only the returned text must fit in `max_bytes`.
pub async fn read_lines(
    root: &Path,
    path: &Path,
    start_line: usize,
    end_line: usize,
    max_bytes: u64,
) -> Result<LineSlice, ProviderError> {
    let display = relative_to(path, root).display().to_string();
    let metadata = fs::metadata(path).await.map_err(|err| io_error(path, err))?;
    if !metadata.is_file() {
        return Err(ProviderError::NotAFile(display));
    }

    let file = fs::File::open(path).await.map_err(|err| io_error(path, err))?;
    let mut segments = BufReader::new(file).split(b'\n');
    let mut collector = LineCollector::new(display, start_line, end_line, max_bytes);

    while let Some(segment) = segments
        .next_segment()
        .await
        .map_err(|err| io_error(path, err))?
    {
        let line = String::from_utf8_lossy(&segment);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        if !collector.push(line)? {
            break;
        }
    }
    Ok(collector.finish())
}
