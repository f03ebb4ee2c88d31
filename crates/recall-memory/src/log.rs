use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use recall_core::{MemoryError, Result};

use crate::entry::ConversationEntry;

/// Append-only buffer of live conversation entries, oldest first.
#[derive(Debug, Default, Clone)]
pub struct ConversationLog {
    entries: VecDeque<ConversationEntry>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry.
    ///
    /// Timestamps never go backwards: an entry stamped earlier than its
    /// predecessor (clock step) takes the predecessor's timestamp.
    pub fn append(&mut self, mut entry: ConversationEntry) -> Result<()> {
        entry.validate()?;
        if let Some(last) = self.last_timestamp {
            if entry.timestamp < last {
                entry.timestamp = last;
            }
        }
        self.last_timestamp = Some(entry.timestamp);
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return the `n` oldest entries in original order.
    pub fn drain_oldest(&mut self, n: usize) -> Result<Vec<ConversationEntry>> {
        if n > self.entries.len() {
            return Err(MemoryError::Range {
                requested: n,
                available: self.entries.len(),
            });
        }
        Ok(self.entries.drain(..n).collect())
    }

    /// Put previously drained entries back in front, keeping their order.
    pub fn restore_front(&mut self, drained: Vec<ConversationEntry>) {
        for entry in drained.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Drain the `n` oldest entries behind a guard that puts them back
    /// unless [`DrainGuard::commit`] is called.
    pub fn drain_guarded(&mut self, n: usize) -> Result<DrainGuard<'_>> {
        let drained = self.drain_oldest(n)?;
        Ok(DrainGuard {
            log: self,
            drained: Some(drained),
        })
    }

    /// The `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &ConversationEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationEntry> {
        self.entries.iter()
    }
}

/// Entries taken out of a [`ConversationLog`] for summarization.
///
/// Dropping the guard without committing (error, timeout, or the awaiting
/// future being cancelled) restores the entries to the front of the log.
#[derive(Debug)]
pub struct DrainGuard<'a> {
    log: &'a mut ConversationLog,
    drained: Option<Vec<ConversationEntry>>,
}

impl DrainGuard<'_> {
    pub fn entries(&self) -> &[ConversationEntry] {
        self.drained.as_deref().unwrap_or_default()
    }

    /// Consume the drained entries for good.
    pub fn commit(mut self) -> Vec<ConversationEntry> {
        self.drained.take().unwrap_or_default()
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some(drained) = self.drained.take() {
            tracing::debug!(restored = drained.len(), "restoring drained entries");
            self.log.restore_front(drained);
        }
    }
}
