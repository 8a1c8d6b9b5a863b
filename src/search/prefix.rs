use std::collections::BTreeSet;
use fst::{IntoStreamer, Set, SetBuilder, Streamer};
use tracing::debug;
use crate::core::error::Result;

/// Uids accumulated before the FST is rebuilt
const DEFAULT_REBUILD_THRESHOLD: usize = 256;

/// FST-backed index of run uids for partial-uid lookups.
///
/// New uids land in a sorted pending set and are folded into the FST once
/// the pending set grows past the rebuild threshold.
pub struct UidPrefixIndex {
    fst: Set<Vec<u8>>,
    pending: BTreeSet<String>,
    rebuild_threshold: usize,
}

impl Default for UidPrefixIndex {
    fn default() -> Self {
        Self::new(DEFAULT_REBUILD_THRESHOLD)
    }
}

impl UidPrefixIndex {
    pub fn new(rebuild_threshold: usize) -> Self {
        UidPrefixIndex {
            fst: Set::default(),
            pending: BTreeSet::new(),
            rebuild_threshold: rebuild_threshold.max(1),
        }
    }

    pub fn insert(&mut self, uid: &str) -> Result<()> {
        if self.fst.contains(uid) {
            return Ok(());
        }
        self.pending.insert(uid.to_string());
        if self.pending.len() >= self.rebuild_threshold {
            self.rebuild()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fst.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge pending uids into a fresh FST
    pub fn rebuild(&mut self) -> Result<()> {
        let mut merged: BTreeSet<String> = std::mem::take(&mut self.pending);
        let mut stream = self.fst.stream();
        while let Some(bytes) = stream.next() {
            merged.insert(String::from_utf8_lossy(bytes).into_owned());
        }

        let mut builder = SetBuilder::memory();
        for uid in &merged {
            builder.insert(uid.as_bytes())?;
        }
        self.fst = Set::new(builder.into_inner()?)?;
        debug!(uids = self.fst.len(), "rebuilt uid prefix index");
        Ok(())
    }

    /// Every indexed uid starting with `prefix`, sorted
    pub fn search_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix_bytes = prefix.as_bytes();
        let mut results = Vec::new();

        let mut stream = self.fst.range().ge(prefix_bytes).into_stream();
        while let Some(bytes) = stream.next() {
            if !bytes.starts_with(prefix_bytes) {
                break;
            }
            if let Ok(uid) = String::from_utf8(bytes.to_vec()) {
                results.push(uid);
            }
        }

        results.extend(
            self.pending
                .range(prefix.to_string()..)
                .take_while(|uid| uid.starts_with(prefix))
                .cloned(),
        );
        results.sort();
        results
    }
}
