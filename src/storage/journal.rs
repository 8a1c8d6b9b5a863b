use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Document, DocumentKind};
use crate::storage::layout::StoreLayout;

/// Frames larger than this are treated as corruption
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Journal files are rotated once they grow past this size
const ROTATE_AT_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every append
    Immediate,
    /// Let the OS decide
    None,
}

/// One persisted document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub kind: DocumentKind,
    /// JSON body of the document, LZ4 compressed when `compressed` is set
    pub payload: Vec<u8>,
    pub compressed: bool,
    /// CRC32 of `payload`
    pub checksum: u32,
    pub timestamp: DateTime<Utc>,
}

impl JournalEntry {
    fn encode(sequence: u64, doc: &Document, compress: bool) -> Result<Self> {
        let body = serde_json::to_vec(&doc.to_value()?)?;
        let payload = if compress {
            lz4_flex::compress_prepend_size(&body)
        } else {
            body
        };
        Ok(JournalEntry {
            sequence,
            kind: doc.kind(),
            checksum: crc32fast::hash(&payload),
            payload,
            compressed: compress,
            timestamp: Utc::now(),
        })
    }

    pub fn decode(&self) -> Result<Document> {
        if crc32fast::hash(&self.payload) != self.checksum {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("Checksum mismatch in journal entry {}", self.sequence),
            ));
        }
        let body = if self.compressed {
            lz4_flex::decompress_size_prepended(&self.payload)?
        } else {
            self.payload.clone()
        };
        Document::from_value(self.kind, serde_json::from_slice(&body)?)
    }
}

/// Append-only, length-prefixed log of inserted documents
pub struct Journal {
    layout: StoreLayout,
    file: File,
    position: u64,
    sequence: u64,
    compress: bool,
    sync_mode: SyncMode,
}

impl Journal {
    /// Replay every journal file in the layout, then open the newest for appending.
    pub fn open(layout: StoreLayout, compress: bool) -> Result<(Self, Vec<Document>)> {
        let files = layout.journal_files()?;
        let mut documents = Vec::new();
        let mut sequence = 0;
        let mut valid_len = 0;
        for file_sequence in &files {
            let (entries, len) = read_entries(&layout, *file_sequence)?;
            valid_len = len;
            for entry in entries {
                sequence = sequence.max(entry.sequence + 1);
                match entry.decode() {
                    Ok(doc) => documents.push(doc),
                    Err(e) => warn!(sequence = entry.sequence, error = %e, "skipping unreadable journal entry"),
                }
            }
        }
        if !files.is_empty() {
            info!(documents = documents.len(), files = files.len(), "replayed journal");
        }

        let current = files.last().copied().unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.journal_path(current))?;
        let mut position = file.metadata()?.len();
        if !files.is_empty() && valid_len < position {
            warn!(dropped = position - valid_len, "truncating partial journal frame");
            file.set_len(valid_len)?;
            position = valid_len;
        }

        let journal = Journal {
            layout,
            file,
            position,
            sequence,
            compress,
            sync_mode: SyncMode::None,
        };
        Ok((journal, documents))
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    pub fn append(&mut self, doc: &Document) -> Result<()> {
        let entry = JournalEntry::encode(self.sequence, doc, self.compress)?;
        let data = bincode::serialize(&entry)?;
        let len = data.len() as u32;

        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&data)?;

        self.sequence += 1;
        self.position += 4 + data.len() as u64;

        if self.sync_mode == SyncMode::Immediate {
            self.file.sync_all()?;
        }
        if self.position >= ROTATE_AT_BYTES {
            self.rotate()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.sync()?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.journal_path(self.sequence))?;
        self.position = 0;
        debug!(sequence = self.sequence, "rotated journal");
        Ok(())
    }
}

/// Entries of one journal file plus the length of its well-formed prefix
fn read_entries(layout: &StoreLayout, sequence: u64) -> Result<(Vec<JournalEntry>, u64)> {
    let mut reader = BufReader::new(File::open(layout.journal_path(sequence))?);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::new(
                ErrorKind::Parse,
                "Journal frame too large, possibly corrupted".to_string(),
            ));
        }

        let mut data = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut data) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                warn!(sequence, "journal ends with a truncated frame");
                break;
            }
            return Err(e.into());
        }

        valid_len += 4 + len as u64;
        match bincode::deserialize::<JournalEntry>(&data) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(error = %e, "failed to deserialize journal frame"),
        }
    }

    Ok((entries, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunStart, RunStop};

    #[test]
    fn test_append_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let start = RunStart::new(1, 10.0).with_field("plan_name", "scan");
        let stop = RunStop::new(&start, 20.0);

        for compress in [true, false] {
            let layout = StoreLayout::new(dir.path().join(format!("c{}", compress))).unwrap();
            {
                let (mut journal, replayed) = Journal::open(layout.clone(), compress).unwrap();
                assert!(replayed.is_empty());
                journal.append(&Document::Start(start.clone())).unwrap();
                journal.append(&Document::Stop(stop.clone())).unwrap();
            }

            let (_, replayed) = Journal::open(layout, compress).unwrap();
            assert_eq!(
                replayed,
                vec![Document::Start(start.clone()), Document::Stop(stop.clone())]
            );
        }
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path()).unwrap();
        {
            let (mut journal, _) = Journal::open(layout.clone(), true).unwrap();
            journal.append(&Document::Start(RunStart::new(1, 1.0))).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(layout.journal_path(0)).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        {
            let (mut journal, replayed) = Journal::open(layout.clone(), true).unwrap();
            assert_eq!(replayed.len(), 1);
            journal.append(&Document::Start(RunStart::new(2, 2.0))).unwrap();
        }

        let (_, replayed) = Journal::open(layout, true).unwrap();
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn test_checksum_mismatch_is_detected() {
        let start = RunStart::new(1, 1.0);
        let mut entry = JournalEntry::encode(0, &Document::Start(start), false).unwrap();
        entry.payload[0] ^= 0xff;
        assert_eq!(entry.decode().unwrap_err().kind, ErrorKind::Parse);
    }
}
