//! Append-only conversation log.
//!
//! The session actor owns the only [`ConversationLog`]; everyone else reads
//! through a [`LogView`]. Ids are assigned at append time, dense from 1, so the
//! event with id `n` lives at index `n - 1` and seeking a cursor is O(1).

use crate::agent::Agent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserUtterance,
    AgentReply,
    SystemNotice,
    TransferNotice,
    ErrorNotice,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserUtterance => "user",
            EventKind::AgentReply => "agent",
            EventKind::SystemNotice => "system",
            EventKind::TransferNotice => "transfer",
            EventKind::ErrorNotice => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub id: u64,
    pub kind: EventKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Agent active when the entry was appended.
    pub agent: Agent,
}

type Entries = Arc<RwLock<Vec<ConversationEvent>>>;

fn read(entries: &Entries) -> RwLockReadGuard<'_, Vec<ConversationEvent>> {
    entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(entries: &Entries) -> RwLockWriteGuard<'_, Vec<ConversationEvent>> {
    entries
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The writable log. Deliberately not `Clone`.
#[derive(Debug)]
pub struct ConversationLog {
    entries: Entries,
    feed: broadcast::Sender<ConversationEvent>,
}

impl ConversationLog {
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            feed,
        }
    }

    /// Append an entry and notify subscribers.
    ///
    /// Timestamps never go backwards, even if the wall clock does.
    pub fn append(&self, kind: EventKind, text: impl Into<String>, agent: Agent) -> ConversationEvent {
        let mut entries = write(&self.entries);
        let now = Utc::now();
        let timestamp = match entries.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let event = ConversationEvent {
            id: entries.len() as u64 + 1,
            kind,
            text: text.into(),
            timestamp,
            agent,
        };
        entries.push(event.clone());
        // Sent under the write lock so `LogView::follow` never sees an entry
        // both in its backlog and on the feed.
        let _receivers = self.feed.send(event.clone()).unwrap_or(0);
        tracing::debug!(id = event.id, kind = %event.kind, "log entry appended");
        event
    }

    pub fn view(&self) -> LogView {
        LogView {
            entries: Arc::clone(&self.entries),
            feed: self.feed.clone(),
        }
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only access to the log.
#[derive(Debug, Clone)]
pub struct LogView {
    entries: Entries,
    feed: broadcast::Sender<ConversationEvent>,
}

impl LogView {
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the newest entry, 0 when empty.
    pub fn last_id(&self) -> u64 {
        self.len() as u64
    }

    /// Copy of every entry with id greater than `cursor`.
    pub fn since(&self, cursor: u64) -> Vec<ConversationEvent> {
        self.project_since(cursor).collect()
    }

    /// Lazy view of entries with id greater than `cursor`, bounded by the log's
    /// length right now. Entries appended later are not included; build a new
    /// projection from the last id seen to pick them up.
    pub fn project_since(&self, cursor: u64) -> Projection {
        let end = self.len();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(end);
        Projection {
            entries: Arc::clone(&self.entries),
            start,
            end,
            pos: start,
        }
    }

    /// Entries appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.feed.subscribe()
    }

    /// Backlog after `cursor` plus a live feed that starts right after it,
    /// with no gap and no duplicate between the two.
    pub fn follow(&self, cursor: u64) -> (Vec<ConversationEvent>, broadcast::Receiver<ConversationEvent>) {
        let entries = read(&self.entries);
        let live = self.feed.subscribe();
        let start = usize::try_from(cursor)
            .unwrap_or(usize::MAX)
            .min(entries.len());
        (entries[start..].to_vec(), live)
    }
}

/// Restartable iterator over a fixed id range of the log.
#[derive(Debug, Clone)]
pub struct Projection {
    entries: Entries,
    start: usize,
    end: usize,
    pos: usize,
}

impl Projection {
    /// Rewind to the first entry of the range.
    pub fn restart(&mut self) {
        self.pos = self.start;
    }

    /// Id of the last entry this projection will yield, or the cursor it was
    /// built from when empty.
    pub fn end_id(&self) -> u64 {
        self.end as u64
    }
}

impl Iterator for Projection {
    type Item = ConversationEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let event = read(&self.entries).get(self.pos).cloned();
        self.pos += 1;
        event
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.pos);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Projection {}
