use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use grep_regex::RegexMatcher;
use grep_searcher::{BinaryDetection, SearcherBuilder, sinks::Lossy};
use serde::Serialize;
use walkdir::WalkDir;

use super::{ProviderError, filesystem::relative_to};

/// Result of a regex search within a file. `path` is relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub path:        PathBuf,
    pub line_number: usize,
    pub line:        String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchResults {
    pub matches:   Vec<SearchMatch>,
    pub truncated: bool,
}

/// Recursively search for `pattern` beginning at `scope`, skipping `.git` and binary files.
pub async fn search_recursive(
    root: &Path,
    scope: &Path,
    pattern: &str,
    max_matches: usize,
) -> Result<SearchResults, ProviderError> {
    let root = root.to_path_buf();
    let scope = scope.to_path_buf();
    let pattern = pattern.to_owned();

    tokio::task::spawn_blocking(move || -> Result<SearchResults, ProviderError> {
        let matcher = RegexMatcher::new_line_matcher(&pattern)
            .map_err(|err| ProviderError::InvalidPattern(err.to_string()))?;
        let mut searcher = SearcherBuilder::new()
            .line_number(true)
            .binary_detection(BinaryDetection::quit(b'\x00'))
            .build();

        let mut results = SearchResults::default();
        let walker = WalkDir::new(&scope)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git");

        for entry in walker.filter_map(|e| e.ok()) {
            if results.truncated {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            let relative = relative_to(&path, &root);
            let mut sink = Lossy(|lnum, line| {
                if results.matches.len() >= max_matches {
                    results.truncated = true;
                    return Ok(false);
                }
                results.matches.push(SearchMatch {
                    path:        relative.clone(),
                    line_number: lnum as usize,
                    line:        line.trim_end().to_string(),
                });
                Ok(true)
            });
            if let Err(err) = searcher.search_path(&matcher, &path, &mut sink) {
                if err.kind() == ErrorKind::InvalidData {
                    continue;
                }
                return Err(ProviderError::Io(format!("{}: {err}", relative.display())));
            }
        }

        Ok(results)
    })
    .await
    .map_err(|err| ProviderError::Io(format!("search task failed: {err}")))?
}
