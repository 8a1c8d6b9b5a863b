use std::path::{Path, PathBuf};
use std::fs;
use crate::core::error::Result;

/// Directory structure of a persisted metadata store
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub base_dir: PathBuf,
    pub journal_dir: PathBuf,
}

impl StoreLayout {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let journal_dir = base_dir.join("journal");
        fs::create_dir_all(&journal_dir)?;

        Ok(StoreLayout {
            base_dir,
            journal_dir,
        })
    }

    pub fn journal_path(&self, sequence: u64) -> PathBuf {
        self.journal_dir.join(format!("journal_{:08}.log", sequence))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }

    /// Starting sequence numbers of every journal file, ascending
    pub fn journal_files(&self) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        for entry in fs::read_dir(&self.journal_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("log") {
                continue;
            }
            let sequence = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix("journal_"))
                .and_then(|digits| digits.parse::<u64>().ok());
            if let Some(sequence) = sequence {
                sequences.push(sequence);
            }
        }
        sequences.sort();
        Ok(sequences)
    }
}
