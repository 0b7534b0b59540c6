use crate::contracts::{LogLevel, StartupLog, StartupLogEntry};
use crate::error::AgentApiError;
use chrono::{DateTime, Utc};

/// A batch the buffer refused. `admitted` is non-empty only when an
/// oversized batch carried an EOF: the output is dropped but the stream is
/// still terminated, and the EOF entry must reach followers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub error: AgentApiError,
    pub admitted: Vec<StartupLogEntry>,
}

impl Rejection {
    fn plain(error: AgentApiError) -> Self {
        Self {
            error,
            admitted: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartupLogBuffer {
    entries: Vec<StartupLogEntry>,
    next_id: u64,
    total_bytes: u64,
    ceiling: u64,
    overflowed: bool,
    closed: bool,
}

impl StartupLogBuffer {
    pub fn new(ceiling: u64) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            total_bytes: 0,
            ceiling,
            overflowed: false,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }

    /// Entries with an id strictly greater than `after`, in id order.
    pub fn entries_after(&self, after: u64) -> Vec<StartupLogEntry> {
        let start = self.entries.partition_point(|entry| entry.id <= after);
        self.entries[start..].to_vec()
    }

    /// Applies a batch atomically and returns the stored entries.
    pub fn append(&mut self, batch: Vec<StartupLog>) -> Result<Vec<StartupLogEntry>, Rejection> {
        if batch.is_empty() {
            return Err(Rejection::plain(AgentApiError::BadRequest(
                "no logs provided".to_string(),
            )));
        }

        let eof_index = batch.iter().position(|log| log.eof);
        if let Some(index) = eof_index {
            if index + 1 != batch.len() {
                return Err(Rejection::plain(AgentApiError::BadRequest(
                    "log entries after EOF".to_string(),
                )));
            }
        }

        if self.closed {
            // A bare EOF resend after the stream already ended is confirmed
            // without storing a second EOF.
            if batch.len() == 1 && eof_index.is_some() {
                return Ok(Vec::new());
            }
            return Err(Rejection::plain(AgentApiError::StreamClosed));
        }

        let batch_bytes: u64 = batch.iter().map(|log| log.output.len() as u64).sum();
        if self.total_bytes + batch_bytes > self.ceiling {
            self.overflowed = true;
            let error = AgentApiError::PayloadTooLarge {
                stored: self.total_bytes,
                batch: batch_bytes,
                limit: self.ceiling,
            };
            let Some(index) = eof_index else {
                return Err(Rejection::plain(error));
            };
            let eof = &batch[index];
            let entry = self.push(eof.created_at, String::new(), eof.level, true);
            self.closed = true;
            return Err(Rejection {
                error,
                admitted: vec![entry],
            });
        }

        let mut stored = Vec::with_capacity(batch.len());
        for log in batch {
            self.total_bytes += log.output.len() as u64;
            if log.eof {
                self.closed = true;
            }
            stored.push(self.push(log.created_at, log.output, log.level, log.eof));
        }
        Ok(stored)
    }

    /// Terminates the stream on behalf of the agent. Returns `None` when the
    /// stream already ended.
    pub fn close_with_eof(&mut self, now: DateTime<Utc>) -> Option<StartupLogEntry> {
        if self.closed {
            return None;
        }
        self.closed = true;
        Some(self.push(now, String::new(), LogLevel::Info, true))
    }

    fn push(
        &mut self,
        created_at: DateTime<Utc>,
        output: String,
        level: LogLevel,
        eof: bool,
    ) -> StartupLogEntry {
        let entry = StartupLogEntry {
            id: self.next_id,
            created_at,
            output,
            level,
            eof,
        };
        self.next_id += 1;
        self.entries.push(entry.clone());
        entry
    }
}
