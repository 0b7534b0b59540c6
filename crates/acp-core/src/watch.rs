use crate::contracts::{MetadataSnapshot, StartupLogEntry, WorkspaceSnapshot};
use crate::fanout::Subscription;

/// Replay-then-live reader over one agent's startup logs. Yields batches of
/// entries with strictly increasing ids and finishes after the EOF entry.
pub struct LogFollower {
    backlog: Option<Vec<StartupLogEntry>>,
    subscription: Subscription<Vec<StartupLogEntry>>,
    last_id: u64,
    finished: bool,
}

impl LogFollower {
    pub(crate) fn new(
        after: u64,
        backlog: Vec<StartupLogEntry>,
        stream_closed: bool,
        subscription: Subscription<Vec<StartupLogEntry>>,
    ) -> Self {
        Self {
            finished: stream_closed && backlog.is_empty(),
            backlog: Some(backlog),
            subscription,
            last_id: after,
        }
    }

    /// Next non-empty batch. `None` once the stream ended, either after the
    /// EOF entry or because the topic closed or dropped this watcher.
    pub async fn next_batch(&mut self) -> Option<Vec<StartupLogEntry>> {
        if let Some(backlog) = self.backlog.take() {
            if !backlog.is_empty() {
                return Some(self.accept(backlog));
            }
        }
        loop {
            if self.finished {
                return None;
            }
            let batch = self.subscription.recv().await?;
            let fresh: Vec<StartupLogEntry> = batch
                .into_iter()
                .filter(|entry| entry.id > self.last_id)
                .collect();
            if !fresh.is_empty() {
                return Some(self.accept(fresh));
            }
        }
    }

    /// True once the EOF entry has been handed out.
    pub fn reached_eof(&self) -> bool {
        self.finished
    }

    pub fn was_evicted(&self) -> bool {
        self.subscription.was_evicted()
    }

    pub fn end_reason(&self) -> &'static str {
        if self.finished {
            "eof"
        } else if self.was_evicted() {
            "evicted"
        } else {
            "closed"
        }
    }

    fn accept(&mut self, batch: Vec<StartupLogEntry>) -> Vec<StartupLogEntry> {
        if let Some(last) = batch.last() {
            self.last_id = last.id;
        }
        if batch.iter().any(|entry| entry.eof) {
            self.finished = true;
        }
        batch
    }
}

/// Metadata snapshots for one agent: the current snapshot first, then every
/// debounced emission newer than the last one delivered.
pub struct MetadataWatch {
    initial: Option<MetadataSnapshot>,
    subscription: Subscription<MetadataSnapshot>,
    last_revision: Option<u64>,
}

impl MetadataWatch {
    pub(crate) fn new(initial: MetadataSnapshot, subscription: Subscription<MetadataSnapshot>) -> Self {
        Self {
            initial: Some(initial),
            subscription,
            last_revision: None,
        }
    }

    pub async fn next_snapshot(&mut self) -> Option<MetadataSnapshot> {
        if let Some(initial) = self.initial.take() {
            self.last_revision = Some(initial.revision);
            return Some(initial);
        }
        loop {
            let snapshot = self.subscription.recv().await?;
            if matches!(self.last_revision, Some(last) if snapshot.revision <= last) {
                continue;
            }
            self.last_revision = Some(snapshot.revision);
            return Some(snapshot);
        }
    }

    pub fn end_reason(&self) -> &'static str {
        if self.subscription.was_evicted() {
            "evicted"
        } else {
            "closed"
        }
    }
}

pub struct WorkspaceWatch {
    initial: Option<WorkspaceSnapshot>,
    subscription: Subscription<WorkspaceSnapshot>,
}

impl WorkspaceWatch {
    pub(crate) fn new(initial: WorkspaceSnapshot, subscription: Subscription<WorkspaceSnapshot>) -> Self {
        Self {
            initial: Some(initial),
            subscription,
        }
    }

    pub async fn next_snapshot(&mut self) -> Option<WorkspaceSnapshot> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        self.subscription.recv().await
    }

    pub fn end_reason(&self) -> &'static str {
        if self.subscription.was_evicted() {
            "evicted"
        } else {
            "closed"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::LogLevel;
    use crate::fanout::Fanout;
    use chrono::Utc;

    fn entry(id: u64, eof: bool) -> StartupLogEntry {
        StartupLogEntry {
            id,
            created_at: Utc::now(),
            output: if eof { String::new() } else { format!("line {id}") },
            level: LogLevel::Info,
            eof,
        }
    }

    #[tokio::test]
    async fn follower_replays_then_streams_and_stops_at_eof() {
        let topic = Fanout::new("logs", 8);
        let mut follower = LogFollower::new(0, vec![entry(1, false)], false, topic.subscribe());

        let replay = follower.next_batch().await.expect("backlog");
        assert_eq!(replay.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1]);

        // A duplicate of the replayed entry is filtered out.
        topic.publish(&vec![entry(1, false), entry(2, false)]);
        topic.publish(&vec![entry(3, true)]);
        let live = follower.next_batch().await.expect("live");
        assert_eq!(live.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2]);
        let last = follower.next_batch().await.expect("eof batch");
        assert!(last[0].eof);

        assert!(follower.next_batch().await.is_none());
        assert_eq!(follower.end_reason(), "eof");
    }

    #[tokio::test]
    async fn follower_past_a_closed_stream_ends_immediately() {
        let topic = Fanout::<Vec<StartupLogEntry>>::new("logs", 8);
        let mut follower = LogFollower::new(4, Vec::new(), true, topic.subscribe());
        assert!(follower.next_batch().await.is_none());
        assert!(follower.reached_eof());
    }

    #[tokio::test]
    async fn metadata_watch_never_goes_backwards() {
        let topic = Fanout::new("metadata", 8);
        let snapshot = |revision| MetadataSnapshot {
            revision,
            items: Vec::new(),
        };
        let mut watch = MetadataWatch::new(snapshot(3), topic.subscribe());
        topic.publish(&snapshot(3));
        topic.publish(&snapshot(2));
        topic.publish(&snapshot(5));

        assert_eq!(watch.next_snapshot().await.expect("initial").revision, 3);
        assert_eq!(watch.next_snapshot().await.expect("newer").revision, 5);
        topic.close();
        assert!(watch.next_snapshot().await.is_none());
        assert_eq!(watch.end_reason(), "closed");
    }
}
