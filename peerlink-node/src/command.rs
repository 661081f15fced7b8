//! User command surface: parsing typed lines and rendering search results.

use std::fmt::Write as _;
use std::str::FromStr;

use peerlink_core::search::SearchResult;

pub const USAGE: &str = "commands: search: <term> | list | download: <result>:<file> | exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Term is lowercased.
    Search(String),
    List,
    Download { result: usize, file: usize },
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("search needs a term")]
    EmptyTerm,
    #[error("download needs <result>:<file>, got {0:?}")]
    BadIndex(String),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let lower = line.to_lowercase();
        if lower == "list" {
            return Ok(Command::List);
        }
        if lower == "exit" {
            return Ok(Command::Exit);
        }
        if let Some(term) = lower.strip_prefix("search:") {
            let term = term.trim();
            if term.is_empty() {
                return Err(CommandError::EmptyTerm);
            }
            return Ok(Command::Search(term.to_string()));
        }
        if let Some(target) = lower.strip_prefix("download:") {
            let target = target.trim();
            let bad = || CommandError::BadIndex(target.to_string());
            let (result, file) = target.split_once(':').ok_or_else(bad)?;
            let result = result.trim().parse().map_err(|_| bad())?;
            let file = file.trim().parse().map_err(|_| bad())?;
            return Ok(Command::Download { result, file });
        }
        Err(CommandError::Unknown(line.to_string()))
    }
}

/// One block per result: index and responder, then each file with its own index.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "no search results\n".to_string();
    }
    let mut out = String::new();
    for (i, result) in results.iter().enumerate() {
        let _ = writeln!(out, "[{i}] {} ({})", result.address, result.responder);
        for (j, file) in result.files.iter().enumerate() {
            let _ = writeln!(out, "    {i}:{j} {file}");
        }
    }
    out
}
