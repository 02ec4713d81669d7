// src/sequence.rs - Numbered image stack resolution
//!
//! A stack is addressed by its first file, e.g. `scan_0007.png`. The last run of
//! digits in the file name gives both the start index (7) and the zero-pad width (4);
//! successors are produced by substituting the index back into that position.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("No number found in file name: {}", .0.display())]
    NoNumberFound(PathBuf),
}

/// Parsed form of a seed file name: `dir/prefix<digits>suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceKey {
    dir: PathBuf,
    prefix: String,
    width: usize,
    start: u64,
    suffix: String,
}

impl SequenceKey {
    /// Parse the last maximal digit run of the seed's file name. Digits in
    /// parent directories are ignored.
    pub fn parse(seed: &Path) -> Result<Self, SequenceError> {
        let no_number = || SequenceError::NoNumberFound(seed.to_path_buf());
        let name = seed
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(no_number)?;

        let bytes = name.as_bytes();
        let end = bytes
            .iter()
            .rposition(u8::is_ascii_digit)
            .map(|i| i + 1)
            .ok_or_else(no_number)?;
        let begin = bytes[..end]
            .iter()
            .rposition(|b| !b.is_ascii_digit())
            .map_or(0, |i| i + 1);

        let start = name[begin..end].parse::<u64>().map_err(|_| no_number())?;

        Ok(Self {
            dir: seed.parent().map(Path::to_path_buf).unwrap_or_default(),
            prefix: name[..begin].to_string(),
            width: end - begin,
            start,
            suffix: name[end..].to_string(),
        })
    }

    /// Zero-pad width of the digit run.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Index encoded in the seed file name.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Path of the file carrying index `index`. Indices wider than the pad
    /// width are written in full.
    pub fn path_for(&self, index: u64) -> PathBuf {
        let name = format!("{}{:0width$}{}", self.prefix, index, self.suffix, width = self.width);
        self.dir.join(name)
    }

    pub fn exists_at(&self, index: u64) -> bool {
        self.path_for(index).exists()
    }

    /// Number of consecutive existing files starting at the seed (the seed included).
    pub fn count_existing(&self) -> usize {
        let mut count = 0;
        let mut index = self.start;
        while self.exists_at(index) {
            count += 1;
            index += 1;
        }
        count
    }

    /// Paths of the stack in order, starting at the seed. Unbounded; callers
    /// take as many as they need.
    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        (self.start..).map(move |i| self.path_for(i))
    }
}

/// Parse the seed and count the existing stack in one step.
pub fn resolve(seed: &Path) -> Result<(SequenceKey, usize), SequenceError> {
    let key = SequenceKey::parse(seed)?;
    let count = key.count_existing();
    tracing::debug!("Resolved stack {} (width {}, start {}): {} files", seed.display(), key.width(), key.start(), count);
    Ok((key, count))
}
