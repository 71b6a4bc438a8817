//! Thread list of the signed-in user, ordered by recency.

use courier_proto::thread::{ThreadListEntry, ThreadSummary, ThreadUpdate};

/// Ordered set of conversation threads, most recent first.
///
/// Keyed by peer username. Every update re-sorts the whole list; the sort
/// is stable so threads with equal activity keep their relative order.
#[derive(Debug, Default, Clone)]
pub struct Inbox {
    threads: Vec<ThreadSummary>,
}

impl Inbox {
    /// Creates an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the thread list with a fresh fetch.
    pub fn load(&mut self, entries: impl IntoIterator<Item = ThreadListEntry>) {
        self.threads.clear();
        for entry in entries {
            self.upsert(entry.into());
        }
        self.sort();
    }

    /// Applies a `thread.update`. Returns `false` if the update was ignored.
    pub fn apply_update(&mut self, update: ThreadUpdate) -> bool {
        let Some(peer) = update.user else {
            tracing::debug!("thread update without a peer, ignoring");
            return false;
        };
        self.upsert(ThreadSummary {
            peer,
            unread_count: update.unread_count,
            last_message: update.last_message,
        });
        self.sort();
        true
    }

    /// Threads in display order.
    #[must_use]
    pub fn threads(&self) -> &[ThreadSummary] {
        &self.threads
    }

    /// Looks up the thread with `username`.
    #[must_use]
    pub fn thread(&self, username: &str) -> Option<&ThreadSummary> {
        self.threads.iter().find(|t| t.peer.username == username)
    }

    /// Sum of unread counts across all threads.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.threads.iter().map(|t| t.unread_count).sum()
    }

    /// Threads whose username or name contains `query`, case-insensitively.
    /// An empty query matches everything.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<&ThreadSummary> {
        let needle = query.trim().to_lowercase();
        self.threads
            .iter()
            .filter(|t| {
                needle.is_empty()
                    || [
                        Some(t.peer.username.as_str()),
                        t.peer.first_name.as_deref(),
                        t.peer.last_name.as_deref(),
                    ]
                    .into_iter()
                    .flatten()
                    .any(|field| field.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Number of threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether there are no threads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn upsert(&mut self, summary: ThreadSummary) {
        match self
            .threads
            .iter_mut()
            .find(|t| t.peer.username == summary.peer.username)
        {
            Some(existing) => *existing = summary,
            None => self.threads.push(summary),
        }
    }

    fn sort(&mut self) {
        self.threads
            .sort_by_key(|t| std::cmp::Reverse(t.last_activity()));
    }
}
