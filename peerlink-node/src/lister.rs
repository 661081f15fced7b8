//! Shared-directory lister answering search queries.

use std::path::PathBuf;

use peerlink_core::search::FileLister;

/// Regular files directly under one directory whose name contains the term, ignoring case.
#[derive(Debug, Clone)]
pub struct DirectoryLister {
    dir: PathBuf,
}

impl DirectoryLister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FileLister for DirectoryLister {
    fn matching(&self, term: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let term = term.to_lowercase();
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.to_lowercase().contains(&term))
            .collect();
        names.sort();
        names
    }
}
